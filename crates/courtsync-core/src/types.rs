//! Core types for courtsync
//!
//! Identifier newtypes, device roles, the session document shared through the
//! remote store, and the two local-only state machines (`ConnectionState` for
//! the transport, `GameState` for the coordinator).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a live game session
///
/// Opaque string; generated as a ULID when the controller creates a session,
/// but any non-empty string assigned by the shared store is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random SessionId
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an existing identifier string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (an invalid session document)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a device
///
/// Generated once per install (ULID) and persisted, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh device identifier
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an existing identifier string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a device plays in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// No role assigned yet
    #[default]
    None,
    /// Captures video of the session
    Recorder,
    /// Mutates score and clock
    Controller,
    /// Observes session state only
    Viewer,
}

impl DeviceRole {
    /// Wire/store string for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::None => "none",
            DeviceRole::Recorder => "recorder",
            DeviceRole::Controller => "controller",
            DeviceRole::Viewer => "viewer",
        }
    }

    /// Parse a role from its wire/store string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(DeviceRole::None),
            "recorder" => Some(DeviceRole::Recorder),
            "controller" => Some(DeviceRole::Controller),
            "viewer" => Some(DeviceRole::Viewer),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceRole::parse(s).ok_or_else(|| format!("unknown role '{}'", s))
    }
}

/// Presence entry in a session's roster
///
/// One row per (session, device); written when a device registers for a
/// session, removed when it explicitly disconnects or the session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// The device's stable identifier
    pub id: DeviceId,
    /// Role this device registered as
    pub role: DeviceRole,
    /// Human-readable device name
    pub name: String,
    /// Unix timestamp of the last presence write
    pub last_seen: i64,
    /// Whether the device considers itself active in the session
    pub is_active: bool,
}

impl Device {
    /// Create a presence entry with `last_seen` set to now
    pub fn new(id: DeviceId, role: DeviceRole, name: impl Into<String>) -> Self {
        Self {
            id,
            role,
            name: name.into(),
            last_seen: chrono::Utc::now().timestamp(),
            is_active: true,
        }
    }

    /// Refresh the `last_seen` timestamp to now
    pub fn touch(&mut self) {
        self.last_seen = chrono::Utc::now().timestamp();
    }
}

/// The authoritative remote session document
///
/// Single record per live session, created by the controller and deleted when
/// the game ends. Control fields follow one invariant: `controlling_device_id`
/// and `controlling_user_id` are set and cleared together, never one without
/// the other (enforced by `ControlArbiter`, which is the only writer of these
/// fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier (document id in the store)
    pub id: SessionId,
    /// Home team name
    pub team_name: String,
    /// Opponent team name
    pub opponent: String,
    /// Home team score
    #[serde(default)]
    pub home_score: u32,
    /// Opponent score
    #[serde(default)]
    pub away_score: u32,
    /// Current quarter/period
    #[serde(default)]
    pub quarter: u8,
    /// Remaining game clock, in seconds
    #[serde(default)]
    pub clock_seconds: u32,
    /// Whether the game clock is running
    #[serde(default)]
    pub is_running: bool,
    /// Whether the session is live
    #[serde(default)]
    pub is_active: bool,
    /// User id of the session creator
    pub created_by: String,
    /// Device currently holding score/clock control
    #[serde(default)]
    pub controlling_device_id: Option<DeviceId>,
    /// User on the controlling device
    #[serde(default)]
    pub controlling_user_id: Option<String>,
    /// User who asked for control (pending request)
    #[serde(default)]
    pub control_requested_by: Option<String>,
    /// Device that asked for control (pending request)
    #[serde(default)]
    pub control_requesting_device_id: Option<DeviceId>,
    /// Unix timestamp of the pending request; requests older than 120s are
    /// expired and never treated as active by any reader
    #[serde(default)]
    pub control_request_at: Option<i64>,
    /// Role registered per device id (role wire strings)
    #[serde(default)]
    pub device_roles: BTreeMap<String, String>,
}

impl Session {
    /// Create a fresh session document
    pub fn new(
        team_name: impl Into<String>,
        opponent: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            team_name: team_name.into(),
            opponent: opponent.into(),
            home_score: 0,
            away_score: 0,
            quarter: 1,
            clock_seconds: 0,
            is_running: false,
            is_active: true,
            created_by: created_by.into(),
            controlling_device_id: None,
            controlling_user_id: None,
            control_requested_by: None,
            control_requesting_device_id: None,
            control_request_at: None,
            device_roles: BTreeMap::new(),
        }
    }

    /// Record a device's role in the session document
    pub fn set_device_role(&mut self, device: &DeviceId, role: DeviceRole) {
        self.device_roles
            .insert(device.as_str().to_string(), role.as_str().to_string());
    }

    /// Look up a device's registered role, if any
    pub fn device_role(&self, device: &DeviceId) -> Option<DeviceRole> {
        self.device_roles
            .get(device.as_str())
            .and_then(|s| DeviceRole::parse(s))
    }
}

/// Local-only view of the peer transport's connectivity
///
/// Recomputed from raw transport callbacks by `ConnectionStateTracker`;
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Transport is not running
    #[default]
    Idle,
    /// Browsing or advertising, no peer yet
    Searching,
    /// Handshaking with a discovered peer
    Connecting(DeviceId),
    /// Connected to a peer
    Connected(DeviceId),
    /// Lost the connection to a peer
    Disconnected(DeviceId),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Searching => write!(f, "searching"),
            ConnectionState::Connecting(p) => write!(f, "connecting to {}", p),
            ConnectionState::Connected(p) => write!(f, "connected to {}", p),
            ConnectionState::Disconnected(p) => write!(f, "disconnected from {}", p),
        }
    }
}

/// What this device is doing right now
///
/// The authoritative local state, owned exclusively by
/// `GameSessionCoordinator`. The role is carried across transitions, never
/// re-chosen; "connected with no role" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameState {
    /// Not part of a multi-device session
    #[default]
    Idle,
    /// Discovery/handshake in progress
    Connecting(DeviceRole),
    /// Transport link established, game not started
    Connected(DeviceRole),
    /// Game is running
    InProgress(DeviceRole),
}

impl GameState {
    /// The role carried by this state, if any
    pub fn role(&self) -> Option<DeviceRole> {
        match self {
            GameState::Idle => None,
            GameState::Connecting(r) | GameState::Connected(r) | GameState::InProgress(r) => {
                Some(*r)
            }
        }
    }
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameState::Idle => write!(f, "idle"),
            GameState::Connecting(r) => write!(f, "connecting ({})", r),
            GameState::Connected(r) => write!(f, "connected ({})", r),
            GameState::InProgress(r) => write!(f, "in progress ({})", r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_new_is_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_device_id_roundtrip() {
        let id = DeviceId::generate();
        let copy = DeviceId::from_string(id.as_str());
        assert_eq!(id, copy);
    }

    #[test]
    fn test_role_string_roundtrip() {
        for role in [
            DeviceRole::None,
            DeviceRole::Recorder,
            DeviceRole::Controller,
            DeviceRole::Viewer,
        ] {
            assert_eq!(DeviceRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(DeviceRole::parse("camera"), None);
    }

    #[test]
    fn test_role_serde_uses_lowercase() {
        let json = serde_json::to_string(&DeviceRole::Recorder).unwrap();
        assert_eq!(json, "\"recorder\"");
        let parsed: DeviceRole = serde_json::from_str("\"controller\"").unwrap();
        assert_eq!(parsed, DeviceRole::Controller);
    }

    #[test]
    fn test_session_new_defaults() {
        let session = Session::new("Wildcats", "Eagles", "coach-1");
        assert!(!session.id.is_empty());
        assert_eq!(session.quarter, 1);
        assert!(session.is_active);
        assert!(!session.is_running);
        assert!(session.controlling_device_id.is_none());
        assert!(session.controlling_user_id.is_none());
    }

    #[test]
    fn test_session_device_roles() {
        let mut session = Session::new("Wildcats", "Eagles", "coach-1");
        let device = DeviceId::generate();

        assert_eq!(session.device_role(&device), None);

        session.set_device_role(&device, DeviceRole::Recorder);
        assert_eq!(session.device_role(&device), Some(DeviceRole::Recorder));

        // Re-registering replaces, never appends
        session.set_device_role(&device, DeviceRole::Viewer);
        assert_eq!(session.device_role(&device), Some(DeviceRole::Viewer));
        assert_eq!(session.device_roles.len(), 1);
    }

    #[test]
    fn test_session_json_tolerates_missing_optional_fields() {
        // Documents written by older builds omit control fields entirely
        let json = r#"{"id":"G1","team_name":"A","opponent":"B","created_by":"u1"}"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.id.as_str(), "G1");
        assert!(session.controlling_device_id.is_none());
        assert!(session.device_roles.is_empty());
    }

    #[test]
    fn test_game_state_role() {
        assert_eq!(GameState::Idle.role(), None);
        assert_eq!(
            GameState::InProgress(DeviceRole::Recorder).role(),
            Some(DeviceRole::Recorder)
        );
    }

    #[test]
    fn test_device_touch_updates_last_seen() {
        let mut device = Device::new(DeviceId::generate(), DeviceRole::Viewer, "iPad");
        device.last_seen = 0;
        device.touch();
        assert!(device.last_seen > 0);
    }

    #[test]
    fn test_connection_state_display() {
        let peer = DeviceId::from_string("ABC");
        assert_eq!(format!("{}", ConnectionState::Idle), "idle");
        assert_eq!(
            format!("{}", ConnectionState::Connected(peer)),
            "connected to ABC"
        );
    }
}
