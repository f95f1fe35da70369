//! CourtSync CLI
//!
//! Thin wrapper around courtsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show device information
//! courtsync info
//!
//! # Show or clear the persisted role assignment
//! courtsync role show
//! courtsync role clear
//!
//! # Manage trusted peers
//! courtsync peers list
//! courtsync peers trust <peer_id> --role recorder
//! courtsync peers remove <peer_id>
//!
//! # Run an in-process two-device coordination demo
//! courtsync demo
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use courtsync_core::{
    CoordinatorConfig, DeviceId, DeviceRole, GameSessionCoordinator, GameState, LocalStore,
    MemoryBackend, PeerTransport, RetryPolicy, RoleAssignment, SharedStoreClient, Session,
    TransportHub, TrustedPeer, TrustedPeerRegistry,
};

/// CourtSync - multi-device game recording coordination
#[derive(Parser)]
#[command(name = "courtsync")]
#[command(version = "0.1.0")]
#[command(about = "CourtSync - multi-device game recording coordination")]
#[command(
    long_about = "Coordinates controller, recorder, and viewer devices around a live game: peer discovery, device roles and presence, and score/clock control arbitration."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.courtsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device information
    Info,

    /// Persisted role assignment
    Role {
        #[command(subcommand)]
        action: RoleAction,
    },

    /// Trusted peer management
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Run a two-device coordination demo in one process
    Demo,
}

#[derive(Subcommand)]
enum RoleAction {
    /// Show the persisted role, if any
    Show,
    /// Clear the persisted role so it is not resumed on next launch
    Clear,
}

#[derive(Subcommand)]
enum PeersAction {
    /// List trusted peers
    List,
    /// Add or update a trusted peer
    Trust {
        /// Peer device id
        peer_id: String,
        /// Role the peer plays
        #[arg(long, default_value = "recorder")]
        role: String,
    },
    /// Remove a trusted peer
    Remove {
        /// Peer device id
        peer_id: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.courtsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courtsync")
        .join("data")
}

fn parse_role(s: &str) -> Result<DeviceRole> {
    DeviceRole::parse(s).ok_or_else(|| anyhow::anyhow!("Invalid role '{}'", s))
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let local = LocalStore::new(data_dir.join("local.redb"))?;

    match cli.command {
        Commands::Info => {
            let peers = TrustedPeerRegistry::new(local.db_handle())?;

            println!("CourtSync v0.1.0");
            println!();
            println!("Device:");
            println!("  ID: {}", local.device_id()?);
            println!();
            println!("Role:");
            match local.load_role()? {
                Some((role, session)) => {
                    println!("  Persisted: {} (session {})", role, session);
                    if local.role_cleared()? {
                        println!("  Cleared: yes (will not resume)");
                    }
                }
                None => println!("  Persisted: (none)"),
            }
            println!();
            println!("Trusted peers: {}", peers.count()?);
        }

        Commands::Role { action } => match action {
            RoleAction::Show => match local.load_role()? {
                Some((role, session)) => {
                    println!("Role: {}", role);
                    println!("Session: {}", session);
                    if local.role_cleared()? {
                        println!("Cleared: yes (will not resume on next launch)");
                    }
                }
                None => println!("No persisted role"),
            },
            RoleAction::Clear => {
                local.clear_role()?;
                println!("Role cleared");
            }
        },

        Commands::Peers { action } => {
            let peers = TrustedPeerRegistry::new(local.db_handle())?;
            match action {
                PeersAction::List => {
                    let all = peers.list_all()?;
                    if all.is_empty() {
                        println!("No trusted peers");
                    } else {
                        println!("Trusted peers ({}):", all.len());
                        for peer in all {
                            print!("  {} ({})", peer.peer_id, peer.role);
                            match peer.last_connected {
                                Some(ts) => {
                                    println!(" - last connected {}", format_timestamp(ts))
                                }
                                None => println!(" - never connected"),
                            }
                        }
                    }
                }
                PeersAction::Trust { peer_id, role } => {
                    let role = parse_role(&role)?;
                    let peer = TrustedPeer::new(DeviceId::from_string(&peer_id), role);
                    peers.add_or_update(&peer)?;
                    println!("Trusted {} as {}", peer_id, role);
                }
                PeersAction::Remove { peer_id } => {
                    peers.remove(&DeviceId::from_string(&peer_id))?;
                    println!("Removed {}", peer_id);
                }
            }
        }

        Commands::Demo => run_demo().await?,
    }

    Ok(())
}

/// Pair an in-process controller and recorder, start a game, and walk the
/// recorder through its state machine.
async fn run_demo() -> Result<()> {
    let hub = TransportHub::new();
    let backend = MemoryBackend::new();
    let dir = tempfile::tempdir()?;

    let build = |name: &str| -> Result<(GameSessionCoordinator, SharedStoreClient, DeviceId)> {
        let local = Arc::new(LocalStore::new(dir.path().join(name).join("local.redb"))?);
        let device = local.device_id()?;
        let transport: Arc<dyn PeerTransport> = Arc::new(hub.endpoint(device.clone()));
        let store = SharedStoreClient::new(Arc::new(backend.clone()), RetryPolicy::default());
        store.start();
        let roles = Arc::new(RoleAssignment::new(
            device.clone(),
            name,
            store.clone(),
            local.clone(),
        ));
        let peers = Arc::new(TrustedPeerRegistry::new(local.db_handle())?);
        let coordinator = GameSessionCoordinator::spawn(
            transport,
            store.clone(),
            roles,
            peers,
            CoordinatorConfig {
                settle_delay: Duration::from_millis(50),
                ..Default::default()
            },
        );
        Ok((coordinator, store, device))
    };

    let (controller, store, controller_id) = build("controller")?;
    let (recorder, _, recorder_id) = build("recorder")?;

    println!("Controller: {}", controller_id);
    println!("Recorder:   {}", recorder_id);

    let session = Session::new("Wildcats", "Eagles", "demo");
    store.put_session(&session)?;
    println!("Created game {} ({} vs {})", session.id, session.team_name, session.opponent);

    recorder.start_session(DeviceRole::Recorder).await?;
    controller.start_session(DeviceRole::Controller).await?;

    wait_for(&recorder, GameState::Connected(DeviceRole::Recorder)).await?;
    println!("Devices paired");

    controller.begin_game(session.id.clone()).await?;
    wait_for(&controller, GameState::InProgress(DeviceRole::Controller)).await?;
    wait_for(&recorder, GameState::InProgress(DeviceRole::Recorder)).await?;
    println!("Game started; both devices in progress");

    // Whichever side tears down first disconnects the other, which may
    // re-enter discovery before its own empty snapshot lands; only the
    // exit from in-progress is deterministic
    store.delete_session(&session.id)?;
    wait_until(&recorder, |state| {
        !matches!(state, GameState::InProgress(_))
    })
    .await?;
    println!("Game ended");

    controller.reset();
    recorder.reset();
    Ok(())
}

async fn wait_for(coordinator: &GameSessionCoordinator, want: GameState) -> Result<()> {
    wait_until(coordinator, |state| state == want)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for state {}", want))
}

async fn wait_until(
    coordinator: &GameSessionCoordinator,
    mut done: impl FnMut(GameState) -> bool,
) -> Result<()> {
    let mut rx = coordinator.watch_state();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if done(*rx.borrow()) {
                return Ok::<_, anyhow::Error>(());
            }
            rx.changed().await?;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for coordinator state"))?
}
