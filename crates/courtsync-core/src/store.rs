//! Shared-state store client
//!
//! Real-time-subscribing client to the remote document collections (sessions
//! and per-session rosters). The remote service itself is behind the
//! [`StoreBackend`] trait; [`MemoryBackend`] is an in-process implementation
//! with the same last-write-wins semantics, used by tests and the demo path.
//!
//! Per tracked collection the client runs an independent listener task:
//!
//! - transient errors (service unavailable) are retried with a capped
//!   backoff of `attempt x base`, at most `max_retries` attempts; on
//!   exhaustion the listener stops and the connection state surfaces as
//!   `Error` until a force-reconnect or a reachability flip;
//! - permission/auth errors are never retried and surface immediately;
//! - each document in a snapshot is decoded independently; a malformed
//!   document is logged and skipped, never aborting the batch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::types::{Device, DeviceId, Session, SessionId};

/// Raw document as stored remotely: (document id, JSON bytes)
pub type RawDoc = (String, Vec<u8>);

/// Capacity for backend snapshot broadcast channels
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Backend operations against the remote document store
///
/// Writes are whole-document replacements; the store's last-write-wins
/// semantics decide races. Subscriptions yield full collection snapshots.
pub trait StoreBackend: Send + Sync + 'static {
    /// Create or replace a session document
    fn put_session(&self, session: &Session) -> CoordResult<()>;
    /// Delete a session document
    fn delete_session(&self, id: &SessionId) -> CoordResult<()>;
    /// Fetch all session documents
    fn list_sessions(&self) -> CoordResult<Vec<RawDoc>>;
    /// Subscribe to session collection snapshots
    fn subscribe_sessions(&self) -> broadcast::Receiver<Vec<RawDoc>>;

    /// Create or replace a roster presence entry
    fn put_roster_entry(&self, session: &SessionId, device: &Device) -> CoordResult<()>;
    /// Delete a roster presence entry
    fn delete_roster_entry(&self, session: &SessionId, device: &DeviceId) -> CoordResult<()>;
    /// Fetch a session's roster
    fn list_roster(&self, session: &SessionId) -> CoordResult<Vec<RawDoc>>;
    /// Subscribe to roster snapshots for a session
    fn subscribe_roster(&self, session: &SessionId) -> broadcast::Receiver<Vec<RawDoc>>;
}

/// Observable connection state of the store client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConnection {
    /// No listener running
    #[default]
    Disconnected,
    /// Initial fetch (or retry) in progress
    Connecting,
    /// Subscribed and receiving snapshots
    Connected,
    /// Listener gave up; requires force-reconnect or a reachability change
    Error(String),
}

impl std::fmt::Display for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreConnection::Disconnected => write!(f, "disconnected"),
            StoreConnection::Connecting => write!(f, "connecting"),
            StoreConnection::Connected => write!(f, "connected"),
            StoreConnection::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Retry policy for transient store errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay unit; attempt N waits `N x base`
    pub base: Duration,
    /// Maximum number of retries after the initial failure
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1))
    }
}

struct ClientShared {
    backend: Arc<dyn StoreBackend>,
    policy: RetryPolicy,
    connection_tx: watch::Sender<StoreConnection>,
    sessions_tx: watch::Sender<Arc<Vec<Session>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    reachable: AtomicBool,
}

/// Client for the shared session/roster store
#[derive(Clone)]
pub struct SharedStoreClient {
    shared: Arc<ClientShared>,
}

impl SharedStoreClient {
    /// Create a client over a backend with the given retry policy
    pub fn new(backend: Arc<dyn StoreBackend>, policy: RetryPolicy) -> Self {
        let (connection_tx, _) = watch::channel(StoreConnection::Disconnected);
        let (sessions_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            shared: Arc::new(ClientShared {
                backend,
                policy,
                connection_tx,
                sessions_tx,
                listener: Mutex::new(None),
                reachable: AtomicBool::new(true),
            }),
        }
    }

    /// Subscribe to connection-state changes
    pub fn connection(&self) -> watch::Receiver<StoreConnection> {
        self.shared.connection_tx.subscribe()
    }

    /// Current connection state
    pub fn connection_state(&self) -> StoreConnection {
        self.shared.connection_tx.borrow().clone()
    }

    /// Subscribe to decoded session-list snapshots
    pub fn sessions(&self) -> watch::Receiver<Arc<Vec<Session>>> {
        self.shared.sessions_tx.subscribe()
    }

    /// Latest decoded session list
    pub fn current_sessions(&self) -> Arc<Vec<Session>> {
        self.shared.sessions_tx.borrow().clone()
    }

    /// Whether a session listener is currently running
    pub fn listener_active(&self) -> bool {
        self.shared
            .listener
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start the session listener if none is active.
    ///
    /// Returns `false` if a listener was already running (no duplicate
    /// subscriptions are ever created).
    pub fn start(&self) -> bool {
        let mut listener = self.shared.listener.lock();
        if listener.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Session listener already active");
            return false;
        }
        info!("Starting session listener");
        let shared = self.shared.clone();
        *listener = Some(tokio::spawn(async move {
            sessions_listener(shared).await;
        }));
        true
    }

    /// Stop the session listener
    pub fn stop(&self) {
        if let Some(handle) = self.shared.listener.lock().take() {
            info!("Stopping session listener");
            handle.abort();
        }
        self.shared
            .connection_tx
            .send_replace(StoreConnection::Disconnected);
    }

    /// Restart the listener explicitly (after retry exhaustion)
    pub fn force_reconnect(&self) {
        info!("Force reconnect requested");
        if let Some(handle) = self.shared.listener.lock().take() {
            handle.abort();
        }
        self.start();
    }

    /// Feed the network-reachability signal.
    ///
    /// An unreachable-to-reachable flip restarts the listener, but only when
    /// none is active; an already-running subscription is left alone.
    pub fn set_reachable(&self, reachable: bool) {
        let was = self.shared.reachable.swap(reachable, Ordering::SeqCst);
        if !was && reachable {
            if self.listener_active() {
                debug!("Reachability restored; listener already active");
            } else {
                info!("Reachability restored; restarting listener");
                self.start();
            }
        }
    }

    /// Write a session document (whole-document replace, last-write-wins)
    pub fn put_session(&self, session: &Session) -> CoordResult<()> {
        self.shared.backend.put_session(session)
    }

    /// Delete a session document
    pub fn delete_session(&self, id: &SessionId) -> CoordResult<()> {
        self.shared.backend.delete_session(id)
    }

    /// Write a roster presence entry
    pub fn put_roster_entry(&self, session: &SessionId, device: &Device) -> CoordResult<()> {
        self.shared.backend.put_roster_entry(session, device)
    }

    /// Delete a roster presence entry
    pub fn delete_roster_entry(&self, session: &SessionId, device: &DeviceId) -> CoordResult<()> {
        self.shared.backend.delete_roster_entry(session, device)
    }

    /// Spawn a roster listener for a session.
    ///
    /// Entries are de-duplicated by device id (the later `last_seen` wins)
    /// and `exclude` (normally the local device) is filtered out. The
    /// listener stops when the returned handle is dropped.
    pub fn spawn_roster_listener(
        &self,
        session: &SessionId,
        exclude: Option<DeviceId>,
    ) -> RosterWatch {
        let (roster_tx, roster_rx) = watch::channel(Arc::new(Vec::new()));
        let shared = self.shared.clone();
        let session = session.clone();
        let handle = tokio::spawn(async move {
            roster_listener(shared, session, exclude, roster_tx).await;
        });
        RosterWatch {
            rx: roster_rx,
            handle,
        }
    }
}

/// Handle to a running roster listener
pub struct RosterWatch {
    rx: watch::Receiver<Arc<Vec<Device>>>,
    handle: JoinHandle<()>,
}

impl RosterWatch {
    /// Subscribe to roster snapshots
    pub fn watch(&self) -> watch::Receiver<Arc<Vec<Device>>> {
        self.rx.clone()
    }

    /// Latest roster snapshot
    pub fn roster(&self) -> Arc<Vec<Device>> {
        self.rx.borrow().clone()
    }
}

impl Drop for RosterWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Fetch with classified retry.
///
/// `announce` listeners drive the client-wide connection state; auxiliary
/// listeners only surface terminal errors.
async fn fetch_with_retry<F>(shared: &ClientShared, announce: bool, fetch: F) -> Option<Vec<RawDoc>>
where
    F: Fn() -> CoordResult<Vec<RawDoc>>,
{
    if announce {
        shared.connection_tx.send_replace(StoreConnection::Connecting);
    }
    let mut attempt = 0u32;
    loop {
        match fetch() {
            Ok(docs) => {
                if announce {
                    shared.connection_tx.send_replace(StoreConnection::Connected);
                }
                return Some(docs);
            }
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt > shared.policy.max_retries {
                    warn!(error = %e, attempts = attempt, "Store fetch retries exhausted");
                    shared
                        .connection_tx
                        .send_replace(StoreConnection::Error(e.to_string()));
                    return None;
                }
                let delay = shared.policy.delay_for(attempt);
                warn!(error = %e, attempt, ?delay, "Transient store error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                // Permission/auth failures require user action, never a retry
                warn!(error = %e, "Non-retriable store error");
                shared
                    .connection_tx
                    .send_replace(StoreConnection::Error(e.to_string()));
                return None;
            }
        }
    }
}

/// Decode each document independently; malformed ones are logged and skipped
fn decode_docs<T: serde::de::DeserializeOwned>(docs: Vec<RawDoc>, what: &str) -> Vec<T> {
    docs.into_iter()
        .filter_map(|(id, bytes)| match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(%id, what, error = %e, "Skipping malformed document");
                None
            }
        })
        .collect()
}

async fn sessions_listener(shared: Arc<ClientShared>) {
    let docs = match fetch_with_retry(&shared, true, || shared.backend.list_sessions()).await {
        Some(docs) => docs,
        None => return,
    };
    let sessions: Vec<Session> = decode_docs(docs, "session");
    debug!(count = sessions.len(), "Initial session snapshot");
    shared.sessions_tx.send_replace(Arc::new(sessions));

    let mut rx = shared.backend.subscribe_sessions();
    loop {
        match rx.recv().await {
            Ok(docs) => {
                let sessions: Vec<Session> = decode_docs(docs, "session");
                debug!(count = sessions.len(), "Session snapshot");
                shared.sessions_tx.send_replace(Arc::new(sessions));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Session listener lagged; refetching");
                if let Ok(docs) = shared.backend.list_sessions() {
                    let sessions: Vec<Session> = decode_docs(docs, "session");
                    shared.sessions_tx.send_replace(Arc::new(sessions));
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Session subscription closed");
                shared
                    .connection_tx
                    .send_replace(StoreConnection::Disconnected);
                return;
            }
        }
    }
}

async fn roster_listener(
    shared: Arc<ClientShared>,
    session: SessionId,
    exclude: Option<DeviceId>,
    roster_tx: watch::Sender<Arc<Vec<Device>>>,
) {
    let docs = match fetch_with_retry(&shared, false, || shared.backend.list_roster(&session)).await
    {
        Some(docs) => docs,
        None => return,
    };
    roster_tx.send_replace(Arc::new(fold_roster(docs, exclude.as_ref())));

    let mut rx = shared.backend.subscribe_roster(&session);
    loop {
        match rx.recv().await {
            Ok(docs) => {
                roster_tx.send_replace(Arc::new(fold_roster(docs, exclude.as_ref())));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(%session, missed = n, "Roster listener lagged; refetching");
                if let Ok(docs) = shared.backend.list_roster(&session) {
                    roster_tx.send_replace(Arc::new(fold_roster(docs, exclude.as_ref())));
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(%session, "Roster subscription closed");
                return;
            }
        }
    }
}

/// De-duplicate roster documents by device id.
///
/// A later entry for the same id replaces the earlier one, keeping the
/// greater `last_seen`. Entries for `exclude` are dropped.
pub(crate) fn fold_roster(docs: Vec<RawDoc>, exclude: Option<&DeviceId>) -> Vec<Device> {
    let devices: Vec<Device> = decode_docs(docs, "roster");
    let mut by_id: BTreeMap<String, Device> = BTreeMap::new();
    for device in devices {
        if Some(&device.id) == exclude {
            continue;
        }
        match by_id.get(device.id.as_str()) {
            Some(existing) if existing.last_seen > device.last_seen => {}
            _ => {
                by_id.insert(device.id.as_str().to_string(), device);
            }
        }
    }
    by_id.into_values().collect()
}

#[derive(Default)]
struct MemoryInner {
    sessions: BTreeMap<String, Vec<u8>>,
    rosters: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

/// In-process store backend with last-write-wins semantics
///
/// Whole-document replacement under a single lock: two racing writers both
/// succeed and the later one's document stands, matching the remote store's
/// behavior. Fault-injection hooks let tests exercise the client's retry
/// classification.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryInner>>,
    txs: Arc<Mutex<MemoryChannels>>,
    fail_list: Arc<Mutex<VecDeque<CoordError>>>,
    list_calls: Arc<AtomicU32>,
}

struct MemoryChannels {
    sessions: broadcast::Sender<Vec<RawDoc>>,
    rosters: HashMap<String, broadcast::Sender<Vec<RawDoc>>>,
}

impl Default for MemoryChannels {
    fn default() -> Self {
        let (sessions, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            sessions,
            rosters: HashMap::new(),
        }
    }
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next `list_sessions` call
    pub fn inject_list_failure(&self, err: CoordError) {
        self.fail_list.lock().push_back(err);
    }

    /// Number of `list_sessions` calls made so far
    pub fn list_call_count(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Insert raw session bytes, bypassing serialization (malformed-doc tests)
    pub fn put_raw_session(&self, id: &str, bytes: Vec<u8>) {
        self.inner
            .write()
            .sessions
            .insert(id.to_string(), bytes);
        self.broadcast_sessions();
    }

    fn session_snapshot(&self) -> Vec<RawDoc> {
        self.inner
            .read()
            .sessions
            .iter()
            .map(|(id, bytes)| (id.clone(), bytes.clone()))
            .collect()
    }

    fn roster_snapshot(&self, session: &SessionId) -> Vec<RawDoc> {
        self.inner
            .read()
            .rosters
            .get(session.as_str())
            .map(|roster| {
                roster
                    .iter()
                    .map(|(id, bytes)| (id.clone(), bytes.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast_sessions(&self) {
        let snapshot = self.session_snapshot();
        let _ = self.txs.lock().sessions.send(snapshot);
    }

    fn broadcast_roster(&self, session: &SessionId) {
        let snapshot = self.roster_snapshot(session);
        let mut txs = self.txs.lock();
        let tx = txs
            .rosters
            .entry(session.as_str().to_string())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0);
        let _ = tx.send(snapshot);
    }
}

impl StoreBackend for MemoryBackend {
    fn put_session(&self, session: &Session) -> CoordResult<()> {
        let bytes =
            serde_json::to_vec(session).map_err(|e| CoordError::Serialization(e.to_string()))?;
        self.inner
            .write()
            .sessions
            .insert(session.id.as_str().to_string(), bytes);
        self.broadcast_sessions();
        Ok(())
    }

    fn delete_session(&self, id: &SessionId) -> CoordResult<()> {
        self.inner.write().sessions.remove(id.as_str());
        self.broadcast_sessions();
        Ok(())
    }

    fn list_sessions(&self) -> CoordResult<Vec<RawDoc>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_list.lock().pop_front() {
            return Err(err);
        }
        Ok(self.session_snapshot())
    }

    fn subscribe_sessions(&self) -> broadcast::Receiver<Vec<RawDoc>> {
        self.txs.lock().sessions.subscribe()
    }

    fn put_roster_entry(&self, session: &SessionId, device: &Device) -> CoordResult<()> {
        let bytes =
            serde_json::to_vec(device).map_err(|e| CoordError::Serialization(e.to_string()))?;
        self.inner
            .write()
            .rosters
            .entry(session.as_str().to_string())
            .or_default()
            .insert(device.id.as_str().to_string(), bytes);
        self.broadcast_roster(session);
        Ok(())
    }

    fn delete_roster_entry(&self, session: &SessionId, device: &DeviceId) -> CoordResult<()> {
        if let Some(roster) = self.inner.write().rosters.get_mut(session.as_str()) {
            roster.remove(device.as_str());
        }
        self.broadcast_roster(session);
        Ok(())
    }

    fn list_roster(&self, session: &SessionId) -> CoordResult<Vec<RawDoc>> {
        Ok(self.roster_snapshot(session))
    }

    fn subscribe_roster(&self, session: &SessionId) -> broadcast::Receiver<Vec<RawDoc>> {
        let mut txs = self.txs.lock();
        txs.rosters
            .entry(session.as_str().to_string())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}
