//! Daemon logging: `HH:MM:SS LEVEL module: message` on stderr.
//!
//! Our own crates log at the configured verbosity; everything a dependency
//! emits (mainline, ureq, ...) stays hidden until `-vv`, where it shows up
//! under its full target so it can't be mistaken for wgmesh output.

use colored::*;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::time::{SystemTime, UNIX_EPOCH};

static LOGGER: MeshLogger = MeshLogger;

struct MeshLogger;

fn own_crate(target: &str) -> bool {
    matches!(
        target.split("::").next(),
        Some("wgmesh") | Some("wgmesh_shared")
    )
}

/// The last path segment: `wgmesh::discovery::gossip` logs as `gossip`.
fn module_name(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Wall-clock time of day (UTC), enough to correlate with peers' logs
/// without dragging in a date-time dependency.
fn clock() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("{:02}:{:02}:{:02}", secs / 3600 % 24, secs / 60 % 60, secs % 60)
}

impl Log for MeshLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
            && (own_crate(metadata.target()) || log::max_level() >= LevelFilter::Trace)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR".red().bold(),
            Level::Warn => " WARN".yellow().bold(),
            Level::Info => " INFO".green(),
            Level::Debug => "DEBUG".cyan(),
            Level::Trace => "TRACE".magenta().dimmed(),
        };
        let origin = if own_crate(record.target()) {
            module_name(record.target())
        } else {
            record.target()
        };
        eprintln!(
            "{} {} {} {}",
            clock().dimmed(),
            level,
            format!("{origin}:").dimmed(),
            record.args()
        );
    }

    fn flush(&self) {}
}

pub fn init(verbosity: u8) {
    const LEVELS: [LevelFilter; 3] = [LevelFilter::Info, LevelFilter::Debug, LevelFilter::Trace];
    log::set_max_level(LEVELS[verbosity.min(2) as usize]);
    if log::set_logger(&LOGGER).is_err() {
        log::debug!("logger was already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_targets_are_recognized() {
        assert!(own_crate("wgmesh"));
        assert!(own_crate("wgmesh::discovery::gossip"));
        assert!(own_crate("wgmesh_shared::netlink"));
        assert!(!own_crate("mainline::rpc"));
        assert!(!own_crate("wgmesh_imposter::x"));
    }

    #[test]
    fn module_names_are_shortened() {
        assert_eq!(module_name("wgmesh::discovery::gossip"), "gossip");
        assert_eq!(module_name("wgmesh"), "wgmesh");
    }

    #[test]
    fn clock_is_hh_mm_ss() {
        let stamp = clock();
        assert_eq!(stamp.len(), 8);
        assert_eq!(stamp.as_bytes()[2], b':');
        assert_eq!(stamp.as_bytes()[5], b':');
    }
}
