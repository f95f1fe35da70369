//! CourtSync Core Library
//!
//! Multi-device coordination for live game recording. One controller device
//! runs the scoreboard; recorder devices capture video; viewers watch. This
//! crate is the coordination layer between them: peer discovery and
//! connection tracking, device roles and presence, the game session state
//! machine, and score/clock control arbitration over a shared remote
//! document store.
//!
//! ## Design
//!
//! - **Single owner of mutable state**: transport callbacks, store
//!   snapshots, and timers all marshal onto one actor task; state is
//!   published as immutable `watch` snapshots
//! - **Last-write-wins control**: taking control is an unconditional
//!   document overwrite; racing takers are resolved by the store, not by
//!   a distributed lock
//! - **Self-healing**: roles persist across relaunches, listeners restart
//!   on reachability changes, and a stale role assignment is corrected
//!   when a game actually starts
//!
//! ## Quick Start
//!
//! ```ignore
//! use courtsync_core::{
//!     CoordinatorConfig, DeviceRole, GameSessionCoordinator, LocalStore,
//!     MemoryBackend, RetryPolicy, RoleAssignment, SharedStoreClient,
//!     TransportHub, TrustedPeerRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local = Arc::new(LocalStore::new("~/.courtsync/data")?);
//!     let device_id = local.device_id()?;
//!
//!     let store = SharedStoreClient::new(
//!         Arc::new(MemoryBackend::new()),
//!         RetryPolicy::default(),
//!     );
//!     store.start();
//!
//!     let hub = TransportHub::new();
//!     let transport = Arc::new(hub.endpoint(device_id.clone()));
//!     let roles = Arc::new(RoleAssignment::new(
//!         device_id, "Courtside iPhone", store.clone(), local.clone(),
//!     ));
//!     let peers = Arc::new(TrustedPeerRegistry::new(local.db_handle())?);
//!
//!     let coordinator = GameSessionCoordinator::spawn(
//!         transport, store, roles, peers, CoordinatorConfig::default(),
//!     );
//!     coordinator.start_session(DeviceRole::Controller).await?;
//!     Ok(())
//! }
//! ```

pub mod control;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod peers;
pub mod roles;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use control::{derive_control_status, ControlArbiter, ControlStatus, CONTROL_REQUEST_TTL_SECS};
pub use coordinator::{CoordinatorConfig, GameSessionCoordinator, SERVICE_LABEL};
pub use error::{CoordError, CoordResult};
pub use message::{Envelope, MessageKind, TransportMessage, WireMessage};
pub use peers::{TrustedPeer, TrustedPeerRegistry};
pub use roles::RoleAssignment;
pub use storage::LocalStore;
pub use store::{
    MemoryBackend, RawDoc, RetryPolicy, RosterWatch, SharedStoreClient, StoreBackend,
    StoreConnection,
};
pub use transport::{
    ChannelTransport, ConnectionStateTracker, PeerTransport, RawTransportEvent, TransportEvent,
    TransportHub,
};
pub use types::{ConnectionState, Device, DeviceId, DeviceRole, GameState, Session, SessionId};
