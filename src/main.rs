//! Binary entrypoint for the zbmesh CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `status` - print the configuration summary and the stored node table
//! - `simulate --topology <file> [--seconds <n>] [--json]` - run the controller
//!   against a simulated mesh in virtual time and print what it learned
//!
//! See the library crate docs for module-level details: `zbmesh::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use zbmesh::config::Config;
use zbmesh::controller::Controller;
use zbmesh::events::{Event, EventKind};
use zbmesh::logutil::fmt_ext;
use zbmesh::sim::SimMesh;
use zbmesh::storage::{DeviceStore, JsonNodeStore, MemoryStore};

#[derive(Parser)]
#[command(name = "zbmesh")]
#[command(about = "ZigBee coordinator control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show configuration and the stored node table
    Status,
    /// Run the controller against a simulated mesh
    Simulate {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: String,
        /// Virtual seconds to run
        #[arg(short, long, default_value_t = 120)]
        seconds: u64,
        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
        /// Load and save the node table in the configured data directory
        #[arg(long)]
        persist: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let coordinator = config.controller.coordinator_ext()?;
            println!("coordinator  {}", fmt_ext(coordinator));
            println!("tick         {} ms", config.controller.tick_ms);
            println!("permit join  {}", config.discovery.permit_join);
            println!("routing      {}", if config.routing.enabled { "on" } else { "off" });
            let mut store = JsonNodeStore::open(&config.storage.data_dir)?;
            let nodes = store.load_nodes()?;
            println!("stored nodes {} ({})", nodes.len(), store.path().display());
            for n in nodes {
                println!(
                    "  {}  nwk {}  endpoints {:?}{}",
                    fmt_ext(n.ext),
                    n.nwk.map(|a| format!("0x{:04X}", a)).unwrap_or_else(|| "----".into()),
                    n.endpoints,
                    if n.zombie { "  zombie" } else { "" }
                );
            }
        }
        Commands::Simulate {
            topology,
            seconds,
            json,
            persist,
        } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => {
                    warn!("no usable config at {}, running with defaults", cli.config);
                    Config::default()
                }
            };
            config.discovery.permit_join = true;
            simulate(config, &topology, seconds, json, persist)?;
        }
    }

    Ok(())
}

/// Drive controller and mesh in virtual time, one tick period per step.
fn simulate(config: Config, topology: &str, seconds: u64, json: bool, persist: bool) -> Result<()> {
    let start = Instant::now();
    let coordinator = config.controller.coordinator_ext()?;
    let mut mesh = SimMesh::load(topology, coordinator, start)?;
    mesh.connect();
    let store: Box<dyn DeviceStore> = if persist {
        Box::new(JsonNodeStore::open(&config.storage.data_dir)?)
    } else {
        Box::new(MemoryStore::default())
    };
    let step = config.controller.tick();
    let mut controller = Controller::new(config, mesh, store, start)?;
    if persist {
        controller.load_nodes_from_store(start)?;
    }

    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    for kind in [EventKind::NodeAdded, EventKind::SourceRouteCreated, EventKind::NodeZombieChanged] {
        let log = log.clone();
        controller.subscribe(kind, move |e| {
            let line = match e {
                Event::NodeAdded(n) => format!("node added {}", n.address),
                Event::SourceRouteCreated(r) => format!("route {} ({} hops)", r.uuid, r.hops.len()),
                Event::NodeZombieChanged { node, zombie } => {
                    format!("node {} zombie={}", node.address, zombie)
                }
                other => format!("{:?}", other.kind()),
            };
            if let Ok(mut l) = log.lock() {
                l.push(line);
            }
        });
    }

    let end = start + Duration::from_secs(seconds);
    let mut now = start;
    while now < end {
        now += step;
        for event in controller.transport_mut().poll(now) {
            controller.handle_event(event, now);
        }
        controller.timeout_tick(now);
        controller.tick(now);
    }
    info!(
        "simulation done: {} virtual seconds, {} frames sent",
        seconds,
        controller.transport().frames_sent()
    );
    if persist {
        let n = controller.save_nodes_state(now)?;
        info!("{} nodes saved", n);
    }

    let snapshot = controller.snapshot(now);
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    if let Ok(l) = log.lock() {
        for line in l.iter() {
            println!("{}", line);
        }
    }
    println!();
    for n in &snapshot.nodes {
        println!(
            "{:<28} {:<11} {:<8} nbrs {:<2} eps {:?}{}{}",
            n.address.to_string(),
            format!("{:?}", n.device_type),
            format!("{:?}", n.state),
            n.neighbors,
            n.endpoints,
            if n.zombie { " zombie" } else { "" },
            n.source_route
                .as_deref()
                .map(|r| format!(" route {}", r))
                .unwrap_or_default()
        );
    }
    let m = controller.metrics().snapshot();
    println!(
        "\nrequests {} confirms ok {} failed {} zdp {}/{} routes {}",
        m.aps_sent, m.confirms_ok, m.confirms_failed, m.zdp_responses, m.zdp_requests, snapshot.routes.len()
    );
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let sink = Arc::new(Mutex::new(f));
            // foreground runs also echo to the console
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
