//! Device role assignment and presence
//!
//! Tracks the local device's role within a session, publishes its presence
//! into the session roster, persists the choice so a relaunch can resume it,
//! and watches the roster of the other participating devices.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{CoordError, CoordResult};
use crate::storage::LocalStore;
use crate::store::{RosterWatch, SharedStoreClient};
use crate::types::{Device, DeviceId, DeviceRole, SessionId};

struct ActiveRole {
    session: SessionId,
    role: DeviceRole,
    roster: RosterWatch,
}

/// The local device's role within a session
///
/// At most one role is active at a time; assigning a new one replaces the
/// previous assignment and its roster listener.
pub struct RoleAssignment {
    device_id: DeviceId,
    device_name: String,
    store: SharedStoreClient,
    local: Arc<LocalStore>,
    active: Mutex<Option<ActiveRole>>,
}

impl RoleAssignment {
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        store: SharedStoreClient,
        local: Arc<LocalStore>,
    ) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            store,
            local,
            active: Mutex::new(None),
        }
    }

    /// Id of the local device
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Active role, if any
    pub fn current_role(&self) -> Option<DeviceRole> {
        self.active.lock().as_ref().map(|a| a.role)
    }

    /// Session the active role belongs to
    pub fn current_session(&self) -> Option<SessionId> {
        self.active.lock().as_ref().map(|a| a.session.clone())
    }

    /// Assign a role within a session.
    ///
    /// Writes the local device into the session roster, persists the choice
    /// for relaunch recovery, and starts watching the other devices' roster
    /// entries. Replaces any previous assignment.
    pub fn set_role(&self, session: &SessionId, role: DeviceRole) -> CoordResult<()> {
        if session.is_empty() {
            return Err(CoordError::InvalidRequest(
                "cannot assign a role without a session id".into(),
            ));
        }
        if role == DeviceRole::None {
            return Err(CoordError::InvalidRequest(
                "cannot assign the empty role; use clear_role".into(),
            ));
        }

        let device = Device::new(self.device_id.clone(), role, self.device_name.clone());
        self.store.put_roster_entry(session, &device)?;
        self.local.save_role(role, session)?;

        info!(%session, %role, "Role assigned");
        let roster = self
            .store
            .spawn_roster_listener(session, Some(self.device_id.clone()));
        *self.active.lock() = Some(ActiveRole {
            session: session.clone(),
            role,
            roster,
        });
        Ok(())
    }

    /// Clear the active role.
    ///
    /// Removes the roster entry, marks the persisted role as deliberately
    /// cleared (so the next launch does not resume it), and stops the
    /// roster listener.
    pub fn clear_role(&self) -> CoordResult<()> {
        let previous = self.active.lock().take();
        if let Some(active) = previous {
            self.store
                .delete_roster_entry(&active.session, &self.device_id)?;
            info!(session = %active.session, role = %active.role, "Role cleared");
        }
        self.local.clear_role()
    }

    /// Re-publish the local roster entry with a fresh `last_seen`.
    ///
    /// No-op when no role is active.
    pub fn touch_presence(&self) -> CoordResult<()> {
        let (session, role) = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(a) => (a.session.clone(), a.role),
                None => return Ok(()),
            }
        };
        let mut device = Device::new(self.device_id.clone(), role, self.device_name.clone());
        device.touch();
        debug!(%session, "Presence heartbeat");
        self.store.put_roster_entry(&session, &device)
    }

    /// Load the persisted role from the previous run.
    ///
    /// Returns `None` when no role was saved or the user deliberately
    /// cleared it.
    pub fn reload_persisted_role(&self) -> CoordResult<Option<(DeviceRole, SessionId)>> {
        if self.local.role_cleared()? {
            debug!("Persisted role was deliberately cleared; not resuming");
            return Ok(None);
        }
        self.local.load_role()
    }

    /// Resume a persisted role, if one survives from the previous run.
    ///
    /// When nothing is resumable, any stale cleared flag is dropped so the
    /// next assignment starts from a clean slate.
    pub fn resume_persisted_role(&self) -> CoordResult<Option<(DeviceRole, SessionId)>> {
        match self.reload_persisted_role()? {
            Some((role, session)) => {
                info!(%session, %role, "Resuming persisted role");
                self.set_role(&session, role)?;
                Ok(Some((role, session)))
            }
            None => {
                self.local.reset_role_cleared()?;
                Ok(None)
            }
        }
    }

    /// Subscribe to the roster of other devices in the active session
    pub fn roster_watch(&self) -> Option<watch::Receiver<Arc<Vec<Device>>>> {
        self.active.lock().as_ref().map(|a| a.roster.watch())
    }

    /// Latest roster snapshot (empty when no role is active)
    pub fn roster(&self) -> Arc<Vec<Device>> {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.roster.roster())
            .unwrap_or_default()
    }
}
