use anyhow::{anyhow, bail};
use clap::{Args, Parser, Subcommand};
use colored::*;
use ipnet::IpNet;
use shared::Error;
use std::path::PathBuf;
use wgmesh::{DaemonOpts, VERSION};
use wireguard_control::{Backend, InterfaceName};

mod logger;

#[derive(Clone, Debug, Parser)]
#[clap(name = "wgmesh", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    /// Verbose output, use -vv for even higher verbositude
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(short, long, default_value = "/var/lib/wgmesh")]
    data_dir: PathBuf,

    #[clap(flatten)]
    network: NetworkOpts,
}

#[derive(Clone, Debug, Args)]
struct NetworkOpts {
    /// Specify a WireGuard backend to use. If not set, wgmesh will
    /// auto-select based on availability.
    #[clap(long, default_value = "kernel")]
    backend: Backend,

    /// Specify the desired MTU for your interface.
    #[clap(long)]
    mtu: Option<u32>,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Join the mesh and keep the interface reconciled until stopped
    Up {
        /// The mesh interface name
        #[clap(default_value = "wg0")]
        interface: InterfaceName,

        /// The mesh secret, either raw or as a wgmesh://v1/... URI.
        /// Falls back to the WGMESH_SECRET environment variable.
        #[clap(long, env = "WGMESH_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Read the mesh secret from a file instead
        #[clap(long, conflicts_with = "secret")]
        secret_file: Option<PathBuf>,

        /// Preferred WireGuard listen port (a nearby free port is chosen
        /// if taken)
        #[clap(short, long)]
        listen_port: Option<u16>,

        /// Offer this node as a rendezvous/relay introducer for peers
        /// that can't reach each other directly
        #[clap(long)]
        introducer: bool,

        /// Advertise routes to these networks into the mesh
        #[clap(long, value_delimiter = ',')]
        advertise_routes: Vec<IpNet>,

        /// STUN servers for external endpoint discovery
        #[clap(long, value_delimiter = ',')]
        stun_server: Vec<String>,

        /// DHT bootstrap nodes (host:port); defaults to the persisted
        /// routing table, then to well-known seeds
        #[clap(long, value_delimiter = ',')]
        dht_bootstrap: Vec<String>,

        /// Bootstrap registry URL (issue-comment thread), used only when
        /// DHT bootstrap fails
        #[clap(long)]
        registry_url: Option<String>,

        /// Bearer token for the bootstrap registry
        #[clap(long)]
        registry_token: Option<String>,

        /// Probability of routing an outbound gossip round through the
        /// epoch's stem relays
        #[clap(long, default_value_t = 0.5)]
        stem_probability: f64,
    },

    /// Tear down a mesh interface (stop the daemon first)
    Down {
        interface: InterfaceName,
    },

    /// Show the daemon's last persisted identity and peer snapshot
    Status {
        interface: InterfaceName,
    },
}

fn read_secret(
    secret: Option<String>,
    secret_file: Option<PathBuf>,
) -> Result<String, Error> {
    if let Some(secret) = secret {
        return Ok(secret);
    }
    if let Some(path) = secret_file {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| anyhow!("reading secret file {}: {}", path.display(), e))?;
        return Ok(contents.trim().to_string());
    }
    bail!("no mesh secret given (use --secret, --secret-file, or WGMESH_SECRET)");
}

fn status(data_dir: &PathBuf, interface: &InterfaceName) -> Result<(), Error> {
    use shared::identity::StoredIdentity;
    use shared::MeshPeer;

    let identity_path = StoredIdentity::path(data_dir, interface);
    let Some(identity) = StoredIdentity::open(&identity_path)? else {
        bail!(
            "no identity found for {} under {} (has the daemon run?)",
            interface,
            data_dir.display()
        );
    };

    println!("{} {}", "interface:".bold(), interface);
    println!("{} {}", "public key:".bold(), identity.pubkey);
    println!("{} {}", "mesh ipv4:".bold(), identity.mesh_ipv4);
    println!("{} {}", "mesh ipv6:".bold(), identity.mesh_ipv6);
    if let Some(port) = identity.listen_port {
        println!("{} {}", "listen port:".bold(), port);
    }
    if identity.nonce > 0 {
        println!("{} {}", "collision nonce:".bold(), identity.nonce);
    }

    let cache_path = data_dir.join(format!("{interface}-peers"));
    let peers: Vec<MeshPeer> = std::fs::read_to_string(&cache_path)
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();

    println!("{} {}", "cached peers:".bold(), peers.len());
    for peer in &peers {
        let sources: Vec<String> = peer.sources.iter().map(|s| s.to_string()).collect();
        println!(
            "  {} {} {} [{}]",
            peer.ipv4.to_string().cyan(),
            peer.public_key.dimmed(),
            peer.endpoint
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".into()),
            sources.join(",")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    logger::init(opts.verbose);

    if let Err(e) = run(opts).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<(), Error> {
    match opts.command {
        Command::Up {
            interface,
            secret,
            secret_file,
            listen_port,
            introducer,
            advertise_routes,
            stun_server,
            dht_bootstrap,
            registry_url,
            registry_token,
            stem_probability,
        } => {
            log::info!("wgmesh {} starting", VERSION);
            let secret = read_secret(secret, secret_file)?;
            let stun_servers = if stun_server.is_empty() {
                wgmesh::discovery::stun::DEFAULT_SERVERS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            } else {
                stun_server
            };
            wgmesh::run(DaemonOpts {
                secret,
                interface,
                backend: opts.network.backend,
                data_dir: opts.data_dir,
                mtu: opts.network.mtu,
                listen_port,
                introducer,
                advertise_routes,
                stun_servers,
                dht_bootstrap,
                registry_url,
                registry_token,
                stem_probability,
            })
            .await
        },
        Command::Down { interface } => {
            wgmesh::down(&interface, opts.network.backend, &opts.data_dir)?;
            log::info!("interface {} is down", interface);
            Ok(())
        },
        Command::Status { interface } => status(&opts.data_dir, &interface),
    }
}
