//! Game session coordination state machine
//!
//! `GameSessionCoordinator` is the single owner of mutable coordination
//! state. Transport callbacks, store snapshots, timers, and caller commands
//! are all marshalled onto one `mpsc` channel and drained strictly in
//! arrival order by a spawned actor task; published state leaves as
//! immutable `watch` snapshots. No remote write is awaited before the next
//! local transition is allowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::message::TransportMessage;
use crate::peers::TrustedPeerRegistry;
use crate::roles::RoleAssignment;
use crate::store::SharedStoreClient;
use crate::transport::{
    ConnectionStateTracker, PeerTransport, RawTransportEvent, TransportEvent,
};
use crate::types::{ConnectionState, DeviceId, DeviceRole, GameState, Session, SessionId};

/// Service label all devices browse/advertise under
pub const SERVICE_LABEL: &str = "courtsync-game";

/// Capacity of the coordinator's event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunable intervals for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pause between stopping a previous transport session and starting
    /// discovery, so a half-torn-down session cannot race the new one
    pub settle_delay: Duration,
    /// Advisory watchdog on extended disconnection; fires a log line only
    pub disconnect_watchdog: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(400),
            disconnect_watchdog: Duration::from_secs(60),
        }
    }
}

/// Everything the actor reacts to, in strict arrival order
enum CoordEvent {
    /// Caller wants to start a session with the given role
    Start { role: DeviceRole },
    /// Caller declares the game started; peers are notified
    BeginGame { game_id: SessionId },
    /// Caller reset; transport is already stopped by the handle
    Reset,
    /// Transport connectivity or message
    Transport(TransportEvent),
    /// Remote session list snapshot
    Sessions(Arc<Vec<Session>>),
    /// Disconnect watchdog fired; stale generations are ignored
    WatchdogTick { generation: u64 },
}

/// Handle to a running coordinator actor
pub struct GameSessionCoordinator {
    event_tx: mpsc::Sender<CoordEvent>,
    state_tx: Arc<watch::Sender<GameState>>,
    error_tx: Arc<watch::Sender<Option<String>>>,
    tracker: Arc<ConnectionStateTracker>,
    transport: Arc<dyn PeerTransport>,
    tasks: Vec<JoinHandle<()>>,
}

impl GameSessionCoordinator {
    /// Spawn the actor and its event forwarders
    pub fn spawn(
        transport: Arc<dyn PeerTransport>,
        store: SharedStoreClient,
        roles: Arc<RoleAssignment>,
        peers: Arc<TrustedPeerRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state_tx = Arc::new(watch::channel(GameState::Idle).0);
        let error_tx = Arc::new(watch::channel(None).0);
        let tracker = Arc::new(ConnectionStateTracker::new());

        let mut tasks = Vec::new();

        // Transport events and store snapshots marshal onto the one channel
        let mut transport_rx = transport.subscribe();
        let tx = event_tx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match transport_rx.recv().await {
                    Ok(event) => {
                        if tx.send(CoordEvent::Transport(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Transport event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let mut sessions_rx = store.sessions();
        let tx = event_tx.clone();
        tasks.push(tokio::spawn(async move {
            while sessions_rx.changed().await.is_ok() {
                let snapshot = sessions_rx.borrow().clone();
                if tx.send(CoordEvent::Sessions(snapshot)).await.is_err() {
                    break;
                }
            }
        }));

        let actor = Actor {
            transport: transport.clone(),
            roles,
            peers,
            config,
            tracker: tracker.clone(),
            state_tx: state_tx.clone(),
            error_tx: error_tx.clone(),
            event_tx: event_tx.clone(),
            active_game: None,
            watchdog_gen: Arc::new(AtomicU64::new(0)),
        };
        tasks.push(tokio::spawn(actor.run(event_rx)));

        Self {
            event_tx,
            state_tx,
            error_tx,
            tracker,
            transport,
            tasks,
        }
    }

    /// Current game state
    pub fn state(&self) -> GameState {
        *self.state_tx.borrow()
    }

    /// Subscribe to game-state changes
    pub fn watch_state(&self) -> watch::Receiver<GameState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to transport connection-state changes
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.tracker.watch()
    }

    /// Most recent coordinator error surfaced to observers
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.error_tx.subscribe()
    }

    /// Start a multi-device session in the given role.
    ///
    /// Returns as soon as the command is queued; the transition to
    /// `Connecting` happens after the settle interval.
    pub async fn start_session(&self, role: DeviceRole) -> CoordResult<()> {
        if role == DeviceRole::None {
            return Err(CoordError::InvalidRequest(
                "cannot start a session without a role".into(),
            ));
        }
        self.event_tx
            .send(CoordEvent::Start { role })
            .await
            .map_err(|_| CoordError::InvalidOperation("coordinator stopped".into()))
    }

    /// Declare the game started from this device.
    ///
    /// Typically the controller's side of tip-off: the connected peer is
    /// sent `gameStarting` and this device enters `InProgress` carrying
    /// whatever role it connected with. Ignored unless currently
    /// `Connected`.
    pub async fn begin_game(&self, game_id: SessionId) -> CoordResult<()> {
        if game_id.is_empty() {
            return Err(CoordError::InvalidRequest(
                "game id must not be empty".into(),
            ));
        }
        self.event_tx
            .send(CoordEvent::BeginGame { game_id })
            .await
            .map_err(|_| CoordError::InvalidOperation("coordinator stopped".into()))
    }

    /// Reset to `Idle` from any state, including mid-transition.
    ///
    /// The transport is stopped and the published state cleared before this
    /// returns; the actor's internal bookkeeping follows on its channel.
    pub fn reset(&self) {
        info!("Coordinator reset");
        self.transport.stop();
        self.state_tx.send_replace(GameState::Idle);
        // A momentarily full channel must not drop the command; hand the
        // overflow to a task so the actor's bookkeeping still catches up
        if let Err(TrySendError::Full(event)) = self.event_tx.try_send(CoordEvent::Reset) {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }

    /// Stop the actor and forwarder tasks
    pub fn shutdown(&self) {
        self.transport.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for GameSessionCoordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Actor {
    transport: Arc<dyn PeerTransport>,
    roles: Arc<RoleAssignment>,
    peers: Arc<TrustedPeerRegistry>,
    config: CoordinatorConfig,
    tracker: Arc<ConnectionStateTracker>,
    state_tx: Arc<watch::Sender<GameState>>,
    error_tx: Arc<watch::Sender<Option<String>>>,
    event_tx: mpsc::Sender<CoordEvent>,
    active_game: Option<SessionId>,
    watchdog_gen: Arc<AtomicU64>,
}

impl Actor {
    async fn run(mut self, mut event_rx: mpsc::Receiver<CoordEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                CoordEvent::Start { role } => self.begin_session(role).await,
                CoordEvent::BeginGame { game_id } => self.on_begin_game(game_id),
                CoordEvent::Reset => {
                    self.active_game = None;
                    self.watchdog_gen.fetch_add(1, Ordering::SeqCst);
                    self.set_state(GameState::Idle);
                }
                CoordEvent::Transport(TransportEvent::State(raw)) => self.on_raw(raw),
                CoordEvent::Transport(TransportEvent::Message { from, message }) => {
                    self.on_message(from, message).await
                }
                CoordEvent::Sessions(snapshot) => self.on_sessions(&snapshot),
                CoordEvent::WatchdogTick { generation } => self.on_watchdog(generation),
            }
        }
        debug!("Coordinator actor stopped");
    }

    fn set_state(&self, next: GameState) {
        if *self.state_tx.borrow() != next {
            info!(state = %next, "Game state changed");
            self.state_tx.send_replace(next);
        }
    }

    fn fail(&self, err: &CoordError) {
        warn!(error = %err, "Coordinator operation failed");
        self.error_tx.send_replace(Some(err.to_string()));
    }

    /// Clean-slate start: stop, settle, then discover by role
    async fn begin_session(&self, role: DeviceRole) {
        self.transport.stop();
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let result = if role == DeviceRole::Controller {
            self.transport.start_browsing(SERVICE_LABEL)
        } else {
            self.transport.start_advertising(SERVICE_LABEL)
        };
        match result {
            Ok(()) => {
                info!(%role, "Session discovery started");
                self.set_state(GameState::Connecting(role));
            }
            Err(e) => self.fail(&e),
        }
    }

    fn on_raw(&mut self, raw: RawTransportEvent) {
        self.tracker.observe(&raw);
        match raw {
            RawTransportEvent::Connected(peer) => self.on_connected(peer),
            RawTransportEvent::Disconnected(peer) => self.on_disconnected(peer),
            _ => {}
        }
    }

    fn on_connected(&mut self, peer: DeviceId) {
        // A live connection invalidates any pending watchdog
        self.watchdog_gen.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.peers.record_connected(&peer, DeviceRole::None) {
            warn!(%peer, error = %e, "Failed to record trusted peer");
        }
        if let Err(e) = self.roles.touch_presence() {
            warn!(error = %e, "Presence heartbeat failed");
        }

        // Copy the state out before transitioning: holding the watch read
        // guard across `set_state` would deadlock against `send_replace`
        let current = *self.state_tx.borrow();
        if let GameState::Connecting(role) = current {
            self.set_state(GameState::Connected(role));
        }
    }

    fn on_disconnected(&mut self, peer: DeviceId) {
        let role = match *self.state_tx.borrow() {
            GameState::Connected(role) | GameState::InProgress(role) => role,
            _ => return,
        };

        // Re-initiate discovery with the carried role; recording, if any,
        // continues on the device regardless of connectivity
        info!(%peer, %role, "Peer disconnected; re-initiating discovery");
        let result = if role == DeviceRole::Controller {
            self.transport.start_browsing(SERVICE_LABEL)
        } else {
            self.transport.start_advertising(SERVICE_LABEL)
        };
        if let Err(e) = result {
            self.fail(&e);
        }
        self.set_state(GameState::Connecting(role));
        self.arm_watchdog();
    }

    fn arm_watchdog(&self) {
        let generation = self.watchdog_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.config.disconnect_watchdog;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(CoordEvent::WatchdogTick { generation }).await;
        });
    }

    fn on_watchdog(&self, generation: u64) {
        if generation != self.watchdog_gen.load(Ordering::SeqCst) {
            return;
        }
        let current = *self.state_tx.borrow();
        if let GameState::Connecting(role) = current {
            // Advisory only: never interrupts an in-progress recording
            warn!(
                %role,
                interval = ?self.config.disconnect_watchdog,
                "Still disconnected after watchdog interval"
            );
        }
    }

    async fn on_message(&mut self, from: DeviceId, message: TransportMessage) {
        debug!(%from, kind = %message.kind(), "Transport message");
        match message {
            TransportMessage::GameStarting { game_id } => self.on_game_starting(game_id),
            TransportMessage::GameAlreadyStarted { game_id } => {
                let current = *self.state_tx.borrow();
                if current == GameState::Connected(DeviceRole::Recorder) {
                    info!(%game_id, "Late-joining a running game");
                    self.active_game = Some(game_id);
                    self.set_state(GameState::InProgress(DeviceRole::Recorder));
                }
            }
            TransportMessage::GameStateUpdate { game_id, is_running } => {
                let current = *self.state_tx.borrow();
                if is_running && current == GameState::Connected(DeviceRole::Recorder) {
                    info!(%game_id, "Clock running; joining in progress");
                    self.active_game = Some(game_id);
                    self.set_state(GameState::InProgress(DeviceRole::Recorder));
                }
            }
            TransportMessage::RequestRecordingState => {
                // Nudge: an idle device that was a recorder rejoins discovery
                if *self.state_tx.borrow() == GameState::Idle
                    && self.recorder_by_history()
                {
                    info!("Recording-state request while idle; rejoining as recorder");
                    self.begin_session(DeviceRole::Recorder).await;
                }
            }
            TransportMessage::Ping => {
                if let Err(e) = self.transport.send(&TransportMessage::Pong) {
                    debug!(error = %e, "Pong failed");
                }
            }
            TransportMessage::StartRecording
            | TransportMessage::StopRecording
            | TransportMessage::GameEnded
            | TransportMessage::Pong => {
                // Advisory for other layers; no game-state transition
            }
        }
    }

    fn on_begin_game(&mut self, game_id: SessionId) {
        let current = *self.state_tx.borrow();
        let GameState::Connected(role) = current else {
            warn!(%game_id, state = %current, "Cannot begin a game while not connected");
            return;
        };
        if let Err(e) = self.transport.send(&TransportMessage::GameStarting {
            game_id: game_id.clone(),
        }) {
            self.fail(&e);
            return;
        }
        info!(%game_id, %role, "Game begun on this device");
        self.active_game = Some(game_id);
        self.set_state(GameState::InProgress(role));
    }

    fn on_game_starting(&mut self, game_id: SessionId) {
        let eligible = matches!(
            *self.state_tx.borrow(),
            GameState::Idle
                | GameState::Connecting(DeviceRole::Recorder)
                | GameState::Connected(DeviceRole::Recorder)
        );
        if !eligible {
            return;
        }

        // Self-heal: the device recording this game must hold the recorder
        // role for it, whatever a stale persisted assignment says
        let assignment_ok = self.roles.current_role() == Some(DeviceRole::Recorder)
            && self.roles.current_session().as_ref() == Some(&game_id);
        if !assignment_ok {
            warn!(%game_id, "Correcting role assignment to recorder");
            if let Err(e) = self.roles.set_role(&game_id, DeviceRole::Recorder) {
                self.fail(&e);
            }
        }

        info!(%game_id, "Game starting");
        self.active_game = Some(game_id);
        self.set_state(GameState::InProgress(DeviceRole::Recorder));
    }

    fn recorder_by_history(&self) -> bool {
        if self.roles.current_role() == Some(DeviceRole::Recorder) {
            return true;
        }
        matches!(
            self.roles.reload_persisted_role(),
            Ok(Some((DeviceRole::Recorder, _)))
        )
    }

    fn on_sessions(&mut self, snapshot: &[Session]) {
        if !snapshot.is_empty() {
            return;
        }
        let current = *self.state_tx.borrow();
        if let GameState::InProgress(role) = current {
            info!(%role, "Remote session list emptied; tearing down");
            self.transport.stop();
            self.active_game = None;
            self.watchdog_gen.fetch_add(1, Ordering::SeqCst);
            self.set_state(GameState::Idle);
        }
    }
}
