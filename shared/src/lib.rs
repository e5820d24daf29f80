pub use anyhow::Error;
use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
    time::Duration,
};

pub mod envelope;
pub mod identity;
#[cfg(target_os = "linux")]
mod netlink;
pub mod types;
pub mod wg;

pub use types::*;

// The daemon drives kernel WireGuard through netlink and iptables.
#[cfg(not(target_os = "linux"))]
compile_error!("wgmesh only builds for Linux targets");

pub const PERSISTENT_KEEPALIVE_INTERVAL_SECS: u16 = 25;

/// WireGuard refuses to initiate new sessions after this much handshake
/// silence, which makes it a usable staleness threshold without ICMP.
pub const HANDSHAKE_STALE_SECS: Duration = Duration::from_secs(150);

/// A peer that hasn't been observed by any discovery layer within this
/// window is no longer offered to the reconciler.
pub const PEER_ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// A peer past this window is dropped from the store entirely.
pub const PEER_RETENTION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Creates the state directory if needed and tightens it to owner-only
/// access. Key material lives under here, so a loose mode on an existing
/// directory is corrected rather than merely reported.
pub fn prepare_state_dir(dir: &Path) -> Result<(), WrappedIoError> {
    fs::create_dir_all(dir).with_path(dir)?;
    let mode = fs::metadata(dir).with_path(dir)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        log::warn!(
            "state dir {} had mode {:03o}; tightening to 700",
            dir.display(),
            mode
        );
        fs::set_permissions(dir, Permissions::from_mode(0o700)).with_path(dir)?;
    }
    Ok(())
}

/// Flags a file that should be private (keys, identity) but is readable by
/// group or world. Unlike the state dir, a stray mode here may be operator
/// intent, so it's reported, not corrected.
pub fn audit_private_mode(path: &Path) -> Result<(), WrappedIoError> {
    let mode = fs::metadata(path).with_path(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        log::warn!(
            "{} has mode {:03o}; it carries key material and should be 600",
            path.display(),
            mode
        );
    }
    Ok(())
}

/// Writes a state file via a temporary sibling plus rename so readers never
/// observe a half-written snapshot.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<(), WrappedIoError> {
    use std::io::Write;

    let tmp = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .with_path(&tmp)?;
    file.set_permissions(Permissions::from_mode(mode)).with_path(&tmp)?;
    file.write_all(bytes).with_path(&tmp)?;
    file.sync_all().with_path(&tmp)?;
    fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}

/// Addresses currently assigned to running interfaces, loopback excluded.
/// Used to recognize our own datagrams coming back at us; the cap keeps a
/// pathological address count from mattering.
pub fn local_addrs() -> Result<Vec<std::net::IpAddr>, io::Error> {
    const MAX_ADDRS: usize = 16;

    let mut addrs: Vec<_> = netlink::get_local_addrs()?
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .collect();
    addrs.truncate(MAX_ADDRS);
    Ok(addrs)
}
