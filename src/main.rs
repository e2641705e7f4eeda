use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use linkplay::config::AppConfig;
use linkplay::controller::button_map::describe_mask;
use linkplay::controller::{ControllerHandle, EmulatorCore, HubEvent, KeyBitmask};
use linkplay::link::{DiscoveryListener, LinkEvent, LinkSessionHandle, RemotePeers, SessionRole};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "linkplay", version, about = "Gamepad input and link sessions")]
struct Cli {
    /// Config file (default: <config dir>/linkplay/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the config
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Local controllers only
    Solo,
    /// Host a link session on the configured port
    Host,
    /// Join a session at ADDRESS (host, ip or host:port)
    Join { address: String },
    /// List link sessions advertised on the LAN
    Discover {
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },
}

/// Key register of one controller slot.
struct KeyState {
    slot: &'static str,
    keys: AtomicU32,
}

impl KeyState {
    fn new(slot: &'static str) -> Arc<Self> {
        Arc::new(Self {
            slot,
            keys: AtomicU32::new(0),
        })
    }
}

impl EmulatorCore for KeyState {
    fn add_keys(&self, mask: KeyBitmask) {
        let keys = self.keys.fetch_or(mask, Ordering::SeqCst) | mask;
        debug!("[{}] +{} -> {}", self.slot, describe_mask(mask), describe_mask(keys));
    }

    fn clear_keys(&self, mask: KeyBitmask) {
        let keys = self.keys.fetch_and(!mask, Ordering::SeqCst) & !mask;
        debug!("[{}] -{} -> {}", self.slot, describe_mask(mask), describe_mask(keys));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_create(&config_path).await?;
    let level = if cli.verbose {
        Some(Level::DEBUG)
    } else {
        config.level()
    };
    setup_logging(level.unwrap_or(Level::INFO));
    if level.is_none() {
        warn!("Unknown log level '{}', using info", config.log_level);
    }
    info!("Using config {}", config_path.display());

    match cli.mode {
        Mode::Discover { seconds } => discover(&config, seconds).await,
        Mode::Solo => run(config, None).await,
        Mode::Host => run(config, Some(LinkStart::Host)).await,
        Mode::Join { address } => run(config, Some(LinkStart::Join(address))).await,
    }
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

enum LinkStart {
    Host,
    Join(String),
}

async fn discover(config: &AppConfig, seconds: u64) -> Result<()> {
    let listener = DiscoveryListener::bind(config.link.discovery_port)
        .await
        .map_err(|e| eyre!("Failed to listen for announcements: {}", e))?;
    info!("Listening for link sessions for {}s", seconds);

    let hosts = listener.collect(Duration::from_secs(seconds)).await;
    if hosts.is_empty() {
        println!("No link sessions found");
    }
    for host in hosts {
        println!("{}\t{}", host.name, host.address);
    }
    Ok(())
}

async fn run(config: AppConfig, link_start: Option<LinkStart>) -> Result<()> {
    let local_keys = KeyState::new("local");
    let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();

    let controller = match ControllerHandle::spawn(Some(config.controller.clone()), local_keys, hub_tx) {
        Ok(controller) => Some(controller),
        Err(e) if link_start.is_some() => {
            warn!("Continuing without local controllers: {}", e);
            None
        }
        Err(e) => return Err(eyre!("Failed to spawn controller: {}", e)),
    };

    let (link, mut link_rx) = LinkSessionHandle::spawn(config.link.clone());
    match &link_start {
        Some(LinkStart::Host) => {
            let addr = link.start_hosting().await?;
            info!("Waiting for players on {}", addr);
        }
        Some(LinkStart::Join(address)) => link.join_host(address).await?,
        None => {}
    }

    let mut remote = RemotePeers::new(KeyState::new("remote"));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            Some(event) = hub_rx.recv() => match event {
                HubEvent::ControllerConnected { id, name } => info!("{} connected: {}", id, name),
                HubEvent::ControllerDisconnected { id } => info!("{} disconnected", id),
                HubEvent::KeysChanged { delta } => {
                    if link_start.is_some() {
                        match link.send_data(delta.to_bytes()).await {
                            Ok(peers) => debug!("Key delta sent to {} peer(s)", peers),
                            Err(e) => warn!("Failed to send key delta: {}", e),
                        }
                    }
                }
            },
            Some(event) = link_rx.recv() => match event {
                LinkEvent::FrameReceived { peer, frame } => {
                    remote.apply(peer, &frame);
                }
                LinkEvent::PeerReady { peer, address } => info!("{} ready at {}", peer, address),
                LinkEvent::PeerFailed { peer, reason } => {
                    warn!("{} lost: {}", peer, reason);
                    remote.release(peer);
                }
                LinkEvent::PeerClosed { peer } => {
                    info!("{} closed", peer);
                    remote.release(peer);
                }
                LinkEvent::Reconnecting { attempt, delay } => {
                    info!("Reconnecting (attempt {}) in {:?}", attempt, delay);
                }
                LinkEvent::RoleChanged(role) => {
                    info!("Link role is now {}", role);
                    if role == SessionRole::Idle && link_start.is_some() {
                        error!("Link session ended");
                        break;
                    }
                }
            },
        }
    }

    link.stop().await?;
    if let Some(mut controller) = controller {
        controller.shutdown().await?;
    }
    Ok(())
}
