//! Local persistence using redb
//!
//! Small explicit key-value layer over a single database file. Documented
//! keys, written only at defined lifecycle points:
//!
//! | key               | written at                         |
//! |-------------------|------------------------------------|
//! | `device_id`       | first startup (generated once)     |
//! | `last_role`       | role set / role clear              |
//! | `last_session_id` | role set / role clear              |
//! | `role_cleared`    | role clear (set), role set (unset) |
//!
//! The trusted-peer table lives in the same file; `TrustedPeerRegistry`
//! shares the database handle via [`LocalStore::db_handle`].

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use tracing::info;

use crate::error::CoordResult;
use crate::peers::TRUSTED_PEERS_TABLE;
use crate::types::{DeviceId, DeviceRole, SessionId};

const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("meta");

const KEY_DEVICE_ID: &str = "device_id";
const KEY_LAST_ROLE: &str = "last_role";
const KEY_LAST_SESSION_ID: &str = "last_session_id";
const KEY_ROLE_CLEARED: &str = "role_cleared";

/// Local key-value store for device identity and role persistence
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<RwLock<Database>>,
}

impl LocalStore {
    /// Open (or create) the database at the given path.
    ///
    /// Creates parent directories and all required tables.
    pub fn new(path: impl AsRef<Path>) -> CoordResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(TRUSTED_PEERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Get a reference to the shared database handle
    ///
    /// Lets `TrustedPeerRegistry` reuse the same connection instead of
    /// opening a second instance of the same file.
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    fn get_meta(&self, key: &str) -> CoordResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    fn set_meta(&self, key: &str, value: &str) -> CoordResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_meta(&self, keys: &[&str]) -> CoordResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            for key in keys {
                table.remove(*key)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// This device's stable identifier, generated once and persisted.
    pub fn device_id(&self) -> CoordResult<DeviceId> {
        if let Some(id) = self.get_meta(KEY_DEVICE_ID)? {
            return Ok(DeviceId::from_string(id));
        }
        let id = DeviceId::generate();
        info!(%id, "Generated device id");
        self.set_meta(KEY_DEVICE_ID, id.as_str())?;
        Ok(id)
    }

    /// Persist the active role and session; unsets the cleared flag.
    pub fn save_role(&self, role: DeviceRole, session: &SessionId) -> CoordResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(KEY_LAST_ROLE, role.as_str())?;
            table.insert(KEY_LAST_SESSION_ID, session.as_str())?;
            table.remove(KEY_ROLE_CLEARED)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// The persisted role and session, if any.
    pub fn load_role(&self) -> CoordResult<Option<(DeviceRole, SessionId)>> {
        let role = match self.get_meta(KEY_LAST_ROLE)? {
            Some(s) => match DeviceRole::parse(&s) {
                Some(role) => role,
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        let session = match self.get_meta(KEY_LAST_SESSION_ID)? {
            Some(s) => SessionId::from_string(s),
            None => return Ok(None),
        };
        Ok(Some((role, session)))
    }

    /// Remove the persisted role/session and set the explicit-clear flag.
    pub fn clear_role(&self) -> CoordResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.remove(KEY_LAST_ROLE)?;
            table.remove(KEY_LAST_SESSION_ID)?;
            table.insert(KEY_ROLE_CLEARED, "true")?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Whether the role was explicitly cleared (vs. a crash/kill).
    pub fn role_cleared(&self) -> CoordResult<bool> {
        Ok(self.get_meta(KEY_ROLE_CLEARED)?.as_deref() == Some("true"))
    }

    /// Drop a stale cleared flag (startup path when nothing is resumable).
    pub fn reset_role_cleared(&self) -> CoordResult<()> {
        self.remove_meta(&[KEY_ROLE_CLEARED])
    }
}
