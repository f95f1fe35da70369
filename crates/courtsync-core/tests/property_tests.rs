//! Property-based tests for control arbitration and retry policy
//!
//! Uses proptest to verify the derived control status against its
//! definition and the backoff schedule against its cap.

use std::time::Duration;

use proptest::prelude::*;

use courtsync_core::{
    derive_control_status, DeviceId, RetryPolicy, Session, CONTROL_REQUEST_TTL_SECS,
};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Generate an optional device id drawn from a small pool, so collisions
/// between "self", the controller, and the requester actually happen
fn device_pool_strategy() -> impl Strategy<Value = Option<DeviceId>> {
    prop_oneof![
        1 => Just(None),
        3 => prop::sample::select(vec!["self", "other-1", "other-2"])
            .prop_map(|s| Some(DeviceId::from_string(s))),
    ]
}

fn user_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        1 => Just(None),
        3 => prop::sample::select(vec!["alice", "bob"]).prop_map(|s| Some(s.to_string())),
    ]
}

/// Generate a session with randomized control fields
fn session_strategy() -> impl Strategy<Value = Session> {
    (
        device_pool_strategy(),
        user_strategy(),
        user_strategy(),
        device_pool_strategy(),
        proptest::option::of(0i64..1_000_000),
    )
        .prop_map(
            |(controlling_device, controlling_user, requested_by, requesting_device, request_at)| {
                let mut session = Session::new("Wildcats", "Eagles", "u1");
                session.controlling_device_id = controlling_device;
                session.controlling_user_id = controlling_user;
                session.control_requested_by = requested_by;
                session.control_requesting_device_id = requesting_device;
                session.control_request_at = request_at;
                session
            },
        )
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// can_request_control matches its definition for any control-field
    /// combination and any observation time
    #[test]
    fn can_request_control_matches_definition(
        session in session_strategy(),
        offset in 0i64..1_000_000,
    ) {
        let me = DeviceId::from_string("self");
        let now = session.control_request_at.unwrap_or(0) + offset;
        let status = derive_control_status(&session, &me, "alice", now);

        let request_active = session
            .control_request_at
            .map(|ts| now - ts <= CONTROL_REQUEST_TTL_SECS)
            .unwrap_or(false);
        let mine_pending =
            session.control_requesting_device_id.as_ref() == Some(&me) && request_active;
        let expected = match &session.controlling_device_id {
            None => true,
            Some(holder) => *holder != me && !mine_pending,
        };

        prop_assert_eq!(status.can_request_control, expected);
    }

    /// An expired request is never active, regardless of the other fields
    #[test]
    fn expired_request_never_active(
        session in session_strategy(),
        age in (CONTROL_REQUEST_TTL_SECS + 1)..10_000_000i64,
    ) {
        let me = DeviceId::from_string("self");
        let Some(ts) = session.control_request_at else { return Ok(()) };
        let status = derive_control_status(&session, &me, "alice", ts + age);
        prop_assert!(!status.request_is_active);
        prop_assert_eq!(status.pending_control_request, None);
    }

    /// A request within the window is active exactly when unexpired
    #[test]
    fn request_active_iff_within_window(
        ts in 0i64..1_000_000,
        age in 0i64..500,
    ) {
        let me = DeviceId::from_string("self");
        let mut session = Session::new("Wildcats", "Eagles", "u1");
        session.control_requested_by = Some("alice".into());
        session.control_requesting_device_id = Some(me.clone());
        session.control_request_at = Some(ts);

        let status = derive_control_status(&session, &me, "alice", ts + age);
        prop_assert_eq!(status.request_is_active, age <= CONTROL_REQUEST_TTL_SECS);
    }

    /// has_control requires both the device and the user to match
    #[test]
    fn has_control_requires_both_matches(session in session_strategy()) {
        let me = DeviceId::from_string("self");
        let status = derive_control_status(&session, &me, "alice", 0);
        let expected = session.controlling_device_id.as_ref() == Some(&me)
            && session.controlling_user_id.as_deref() == Some("alice");
        prop_assert_eq!(status.has_control, expected);
    }

    /// Backoff delays never decrease as the attempt number grows
    #[test]
    fn backoff_monotonic(
        base_ms in 1u64..5_000,
        attempts in 1u32..50,
    ) {
        let policy = RetryPolicy {
            base: Duration::from_millis(base_ms),
            max_retries: 3,
        };
        let mut last = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = policy.delay_for(attempt);
            prop_assert!(delay >= last);
            last = delay;
        }
    }

    /// The delay schedule is linear in the attempt number
    #[test]
    fn backoff_linear_in_attempt(
        base_ms in 1u64..5_000,
        attempt in 1u32..100,
    ) {
        let policy = RetryPolicy {
            base: Duration::from_millis(base_ms),
            max_retries: 3,
        };
        prop_assert_eq!(
            policy.delay_for(attempt),
            Duration::from_millis(base_ms) * attempt
        );
    }
}
