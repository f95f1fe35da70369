//! Score/clock control arbitration
//!
//! Enforces at-most-one-controller best-effort, without a distributed
//! transaction. `take_control` is the primary path: an unconditional
//! whole-document overwrite, with races between devices resolved by the
//! store's last-write-wins semantics. The request/grant/deny operations are
//! an auxiliary cooperative handoff sharing the same pending-request fields.
//!
//! Pending requests expire lazily: a request older than
//! [`CONTROL_REQUEST_TTL_SECS`] is never active, evaluated as a pure
//! function of "now" with no timer.

use tracing::info;

use crate::error::{CoordError, CoordResult};
use crate::store::SharedStoreClient;
use crate::types::{DeviceId, Session};

/// Pending control requests expire after this many seconds
pub const CONTROL_REQUEST_TTL_SECS: i64 = 120;

/// The local device's view of a session's control fields
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlStatus {
    /// This device and caller currently control score/clock
    pub has_control: bool,
    /// An unexpired pending request exists on the document
    pub request_is_active: bool,
    /// The caller may submit a control request right now
    pub can_request_control: bool,
    /// The caller's own outstanding request, if still active
    pub pending_control_request: Option<String>,
}

/// Derive the control status for `device`/`caller` at time `now` (Unix
/// seconds). Pure, no I/O.
pub fn derive_control_status(
    session: &Session,
    device: &DeviceId,
    caller: &str,
    now: i64,
) -> ControlStatus {
    let has_control = session.controlling_device_id.as_ref() == Some(device)
        && session.controlling_user_id.as_deref() == Some(caller);

    let request_is_active = session
        .control_request_at
        .map(|ts| now - ts <= CONTROL_REQUEST_TTL_SECS)
        .unwrap_or(false);

    let mine_pending =
        session.control_requesting_device_id.as_ref() == Some(device) && request_is_active;

    let can_request_control = match &session.controlling_device_id {
        None => true,
        Some(holder) => holder != device && !mine_pending,
    };

    let pending_control_request = if mine_pending {
        session.control_requested_by.clone()
    } else {
        None
    };

    ControlStatus {
        has_control,
        request_is_active,
        can_request_control,
        pending_control_request,
    }
}

/// Arbitrates control of a session's score/clock for the local device
pub struct ControlArbiter {
    device_id: DeviceId,
    store: SharedStoreClient,
}

impl ControlArbiter {
    pub fn new(device_id: DeviceId, store: SharedStoreClient) -> Self {
        Self { device_id, store }
    }

    fn require_id(session: &Session) -> CoordResult<()> {
        if session.id.is_empty() {
            return Err(CoordError::InvalidRequest(
                "session has no identifier".into(),
            ));
        }
        Ok(())
    }

    /// Take control unconditionally.
    ///
    /// Overwrites the controller fields with the local device and `caller`,
    /// clears any pending request, and writes the document. Racing takers
    /// both succeed; the store's last write stands.
    pub fn take_control(&self, session: &Session, caller: &str) -> CoordResult<()> {
        Self::require_id(session)?;
        let mut doc = session.clone();
        doc.controlling_device_id = Some(self.device_id.clone());
        doc.controlling_user_id = Some(caller.to_string());
        doc.control_requested_by = None;
        doc.control_requesting_device_id = None;
        doc.control_request_at = None;
        info!(session = %doc.id, caller, "Taking control");
        self.store.put_session(&doc)
    }

    /// Release control, clearing controller and pending-request fields
    pub fn release_control(&self, session: &Session) -> CoordResult<()> {
        Self::require_id(session)?;
        let mut doc = session.clone();
        doc.controlling_device_id = None;
        doc.controlling_user_id = None;
        doc.control_requested_by = None;
        doc.control_requesting_device_id = None;
        doc.control_request_at = None;
        info!(session = %doc.id, "Releasing control");
        self.store.put_session(&doc)
    }

    /// Record a cooperative control request from the local device
    pub fn request_control(&self, session: &Session, caller: &str) -> CoordResult<()> {
        Self::require_id(session)?;
        let mut doc = session.clone();
        doc.control_requested_by = Some(caller.to_string());
        doc.control_requesting_device_id = Some(self.device_id.clone());
        doc.control_request_at = Some(chrono::Utc::now().timestamp());
        info!(session = %doc.id, caller, "Requesting control");
        self.store.put_session(&doc)
    }

    /// Hand control to the requesting device.
    ///
    /// Fails with `InvalidRequest` when no request is pending on the
    /// document.
    pub fn grant_control(&self, session: &Session) -> CoordResult<()> {
        Self::require_id(session)?;
        let (requester_device, requester_user) = match (
            &session.control_requesting_device_id,
            &session.control_requested_by,
        ) {
            (Some(d), Some(u)) => (d.clone(), u.clone()),
            _ => {
                return Err(CoordError::InvalidRequest(
                    "no pending control request to grant".into(),
                ))
            }
        };
        let mut doc = session.clone();
        doc.controlling_device_id = Some(requester_device);
        doc.controlling_user_id = Some(requester_user);
        doc.control_requested_by = None;
        doc.control_requesting_device_id = None;
        doc.control_request_at = None;
        info!(session = %doc.id, "Granting control to requester");
        self.store.put_session(&doc)
    }

    /// Refuse a pending request, clearing the request fields only
    pub fn deny_control_request(&self, session: &Session) -> CoordResult<()> {
        Self::require_id(session)?;
        let mut doc = session.clone();
        doc.control_requested_by = None;
        doc.control_requesting_device_id = None;
        doc.control_request_at = None;
        info!(session = %doc.id, "Denying control request");
        self.store.put_session(&doc)
    }

    /// Control status for `caller` evaluated against the wall clock
    pub fn status(&self, session: &Session, caller: &str) -> ControlStatus {
        derive_control_status(
            session,
            &self.device_id,
            caller,
            chrono::Utc::now().timestamp(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, RetryPolicy, StoreBackend};
    use std::sync::Arc;

    fn arbiter(backend: &MemoryBackend, device: &str) -> ControlArbiter {
        let store = SharedStoreClient::new(Arc::new(backend.clone()), RetryPolicy::default());
        ControlArbiter::new(DeviceId::from_string(device), store)
    }

    fn stored_session(backend: &MemoryBackend) -> Session {
        let docs = backend.list_sessions().unwrap();
        assert_eq!(docs.len(), 1);
        serde_json::from_slice(&docs[0].1).unwrap()
    }

    #[tokio::test]
    async fn test_take_control_overwrites_and_clears_request() {
        let backend = MemoryBackend::new();
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.controlling_device_id = Some(DeviceId::from_string("other"));
        session.controlling_user_id = Some("bob".into());
        session.control_requested_by = Some("carol".into());
        session.control_requesting_device_id = Some(DeviceId::from_string("C"));
        session.control_request_at = Some(1000);

        arbiter(&backend, "A").take_control(&session, "alice").unwrap();

        let doc = stored_session(&backend);
        assert_eq!(doc.controlling_device_id, Some(DeviceId::from_string("A")));
        assert_eq!(doc.controlling_user_id, Some("alice".into()));
        assert_eq!(doc.control_requested_by, None);
        assert_eq!(doc.control_requesting_device_id, None);
        assert_eq!(doc.control_request_at, None);
    }

    #[tokio::test]
    async fn test_take_control_idempotent() {
        let backend = MemoryBackend::new();
        let session = Session::new("Wildcats", "Eagles", "u1");
        let arb = arbiter(&backend, "A");
        let device = DeviceId::from_string("A");

        arb.take_control(&session, "alice").unwrap();
        let first = stored_session(&backend);
        assert!(derive_control_status(&first, &device, "alice", 0).has_control);

        // Repeating the call changes nothing observable
        arb.take_control(&first, "alice").unwrap();
        let second = stored_session(&backend);
        assert_eq!(second, first);
        assert!(derive_control_status(&second, &device, "alice", 0).has_control);
    }

    #[tokio::test]
    async fn test_release_control_clears_both_field_pairs() {
        let backend = MemoryBackend::new();
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.controlling_device_id = Some(DeviceId::from_string("A"));
        session.controlling_user_id = Some("alice".into());

        arbiter(&backend, "A").release_control(&session).unwrap();

        let doc = stored_session(&backend);
        assert_eq!(doc.controlling_device_id, None);
        assert_eq!(doc.controlling_user_id, None);
    }

    #[tokio::test]
    async fn test_request_then_grant_hands_control_to_requester() {
        let backend = MemoryBackend::new();
        let session = Session::new("Wildcats", "Eagles", "u1");

        arbiter(&backend, "B").request_control(&session, "bob").unwrap();
        let pending = stored_session(&backend);
        assert_eq!(pending.control_requested_by, Some("bob".into()));
        assert!(pending.control_request_at.is_some());

        arbiter(&backend, "A").grant_control(&pending).unwrap();
        let doc = stored_session(&backend);
        assert_eq!(doc.controlling_device_id, Some(DeviceId::from_string("B")));
        assert_eq!(doc.controlling_user_id, Some("bob".into()));
        assert_eq!(doc.control_requested_by, None);
    }

    #[tokio::test]
    async fn test_grant_without_pending_request_fails() {
        let backend = MemoryBackend::new();
        let session = Session::new("Wildcats", "Eagles", "u1");
        let err = arbiter(&backend, "A").grant_control(&session).unwrap_err();
        assert!(matches!(err, CoordError::InvalidRequest(_)));
        assert!(backend.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deny_clears_request_but_not_controller() {
        let backend = MemoryBackend::new();
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.controlling_device_id = Some(DeviceId::from_string("A"));
        session.controlling_user_id = Some("alice".into());
        session.control_requested_by = Some("bob".into());
        session.control_requesting_device_id = Some(DeviceId::from_string("B"));
        session.control_request_at = Some(1000);

        arbiter(&backend, "A").deny_control_request(&session).unwrap();

        let doc = stored_session(&backend);
        assert_eq!(doc.controlling_device_id, Some(DeviceId::from_string("A")));
        assert_eq!(doc.control_requested_by, None);
        assert_eq!(doc.control_requesting_device_id, None);
        assert_eq!(doc.control_request_at, None);
    }

    #[tokio::test]
    async fn test_operations_reject_session_without_id() {
        let backend = MemoryBackend::new();
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.id = crate::types::SessionId::from_string("");

        let arb = arbiter(&backend, "A");
        assert!(matches!(
            arb.take_control(&session, "alice"),
            Err(CoordError::InvalidRequest(_))
        ));
        assert!(matches!(
            arb.release_control(&session),
            Err(CoordError::InvalidRequest(_))
        ));
        assert!(matches!(
            arb.request_control(&session, "alice"),
            Err(CoordError::InvalidRequest(_))
        ));
        assert!(matches!(
            arb.deny_control_request(&session),
            Err(CoordError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_status_has_control_requires_both_fields() {
        let device = DeviceId::from_string("A");
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.controlling_device_id = Some(device.clone());
        session.controlling_user_id = Some("alice".into());

        assert!(derive_control_status(&session, &device, "alice", 0).has_control);
        assert!(!derive_control_status(&session, &device, "bob", 0).has_control);
        assert!(
            !derive_control_status(&session, &DeviceId::from_string("B"), "alice", 0).has_control
        );
    }

    #[test]
    fn test_request_expiry_is_lazy_around_120s() {
        let device = DeviceId::from_string("A");
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.control_requested_by = Some("alice".into());
        session.control_requesting_device_id = Some(device.clone());
        session.control_request_at = Some(1000);

        // 119 s old: still active
        let at_119 = derive_control_status(&session, &device, "alice", 1119);
        assert!(at_119.request_is_active);
        assert_eq!(at_119.pending_control_request, Some("alice".into()));

        // exactly 120 s: still within the window
        assert!(derive_control_status(&session, &device, "alice", 1120).request_is_active);

        // 121 s old: expired, pending request vanishes without any timer
        let at_121 = derive_control_status(&session, &device, "alice", 1121);
        assert!(!at_121.request_is_active);
        assert_eq!(at_121.pending_control_request, None);
    }

    #[test]
    fn test_can_request_control_rules() {
        let device = DeviceId::from_string("A");
        let mut session = Session::new("Wildcats", "Eagles", "u1");

        // Nobody controls: may request
        assert!(derive_control_status(&session, &device, "alice", 0).can_request_control);

        // We control: no point requesting
        session.controlling_device_id = Some(device.clone());
        session.controlling_user_id = Some("alice".into());
        assert!(!derive_control_status(&session, &device, "alice", 0).can_request_control);

        // Someone else controls: may request
        session.controlling_device_id = Some(DeviceId::from_string("B"));
        session.controlling_user_id = Some("bob".into());
        assert!(derive_control_status(&session, &device, "alice", 0).can_request_control);

        // Our own request still pending: no duplicate request
        session.control_requesting_device_id = Some(device.clone());
        session.control_requested_by = Some("alice".into());
        session.control_request_at = Some(0);
        assert!(!derive_control_status(&session, &device, "alice", 60).can_request_control);

        // Pending request expired: may request again
        assert!(derive_control_status(&session, &device, "alice", 300).can_request_control);
    }
}
