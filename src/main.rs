use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mobile_adapter::adapter::AdapterDevice;
use mobile_adapter::bgb::BgbBridge;
use mobile_adapter::board::{FileConfig, HostBackend, StdNetwork};
use mobile_adapter::commands::MAX_CONNECTIONS;
use mobile_adapter::settings::BridgeSettings;
use mobile_adapter::tunnel::{self, TunnelServer};

/// Slots the tunnel board may address
const TUNNEL_SLOTS: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "mobile-adapter", version, about = "Mobile Adapter GB emulator")]
struct Cli {
    /// Settings file (JSON); missing fields use defaults
    #[arg(short, long, global = true, default_value = "mobile-adapter.json")]
    settings: PathBuf,

    /// Log debug output, including every packet
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach the adapter to a BGB emulator link
    Bgb {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Adapter configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// blue, yellow, green or red
        #[arg(long)]
        device: Option<AdapterDevice>,
        #[arg(long)]
        p2p_port: Option<u16>,
        #[arg(long)]
        unmetered: bool,
    },
    /// Serve socket requests from a board over a serial port
    Tunnel {
        #[arg(long)]
        port: String,
        #[arg(long)]
        baud: Option<u32>,
    },
    /// List serial ports
    Ports,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut settings = BridgeSettings::load(&cli.settings)
        .with_context(|| format!("reading {}", cli.settings.display()))?;

    match cli.command {
        Commands::Bgb {
            host,
            port,
            config,
            device,
            p2p_port,
            unmetered,
        } => {
            if let Some(host) = host {
                settings.bgb_host = host;
            }
            if let Some(port) = port {
                settings.bgb_port = port;
            }
            if let Some(config) = config {
                settings.config_file = config;
            }
            if let Some(device) = device {
                settings.adapter.device = device;
            }
            if let Some(p2p_port) = p2p_port {
                settings.adapter.p2p_port = p2p_port;
            }
            settings.adapter.unmetered |= unmetered;
            run_bgb(settings)
        }
        Commands::Tunnel { port, baud } => {
            if let Some(baud) = baud {
                settings.baud_rate = baud;
            }
            run_tunnel(&port, settings)
        }
        Commands::Ports => {
            for port in tunnel::list_ports()? {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  {:04x}:{:04x}  {}",
                        port.port_name,
                        vid,
                        pid,
                        port.product.unwrap_or_default()
                    ),
                    _ => println!("{}", port.port_name),
                }
            }
            Ok(())
        }
    }
}

fn run_bgb(settings: BridgeSettings) -> Result<()> {
    let config = FileConfig::open(&settings.config_file)
        .with_context(|| format!("opening {}", settings.config_file.display()))?;
    let backend = HostBackend::new(config, StdNetwork::new(MAX_CONNECTIONS, settings.timeouts));
    let mut bridge = BgbBridge::start(settings.adapter, backend)?;

    // The action worker resolves names with a blocking resolver, so only the
    // link runs inside the runtime.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        tokio::select! {
            res = bridge.connect(&settings.bgb_host, settings.bgb_port) => res.map_err(anyhow::Error::from),
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                Ok(())
            }
        }
    });

    bridge.shutdown();
    result
}

fn run_tunnel(port_name: &str, settings: BridgeSettings) -> Result<()> {
    let mut port = tunnel::open_port(port_name, settings.baud_rate)?;
    let stop = Arc::new(AtomicBool::new(false));

    let worker = std::thread::Builder::new().name("tunnel".into()).spawn({
        let stop = stop.clone();
        let timeouts = settings.timeouts;
        move || {
            let mut server = TunnelServer::new(StdNetwork::new(TUNNEL_SLOTS, timeouts));
            let res = server.run(&mut port, &stop);
            stop.store(true, Ordering::Release);
            res
        }
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted");
                    break;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
    });
    stop.store(true, Ordering::Release);

    match worker.join() {
        Ok(res) => res.context("tunnel failed"),
        Err(_) => anyhow::bail!("tunnel thread panicked"),
    }
}
