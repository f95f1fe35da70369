//! Trusted-peer registry
//!
//! Maintains a durable set of previously-accepted peer devices. The
//! coordinator records every peer it connects to; the CLI exposes the list
//! for inspection and manual trust management.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};
use crate::types::{DeviceId, DeviceRole};

pub(crate) const TRUSTED_PEERS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("trusted_peers");

/// A previously-accepted peer device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// The peer's device id
    pub peer_id: DeviceId,
    /// Role the peer held when accepted
    pub role: DeviceRole,
    /// Unix timestamp when the peer was first accepted
    pub date_added: i64,
    /// Unix timestamp of the most recent connection, if any
    #[serde(default)]
    pub last_connected: Option<i64>,
}

impl TrustedPeer {
    /// Create a new trusted-peer record
    pub fn new(peer_id: DeviceId, role: DeviceRole) -> Self {
        Self {
            peer_id,
            role,
            date_added: current_timestamp(),
            last_connected: None,
        }
    }

    /// Record a connection to this peer now
    pub fn touch_connected(&mut self) {
        self.last_connected = Some(current_timestamp());
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Durable registry of trusted peers
#[derive(Clone)]
pub struct TrustedPeerRegistry {
    db: Arc<RwLock<Database>>,
}

impl TrustedPeerRegistry {
    /// Create a registry over the shared database handle
    ///
    /// Reuses the `LocalStore` connection to avoid two database instances
    /// pointing at the same file.
    pub fn new(db: Arc<RwLock<Database>>) -> CoordResult<Self> {
        {
            let database = db.read();
            let write_txn = database.begin_write()?;
            {
                let _ = write_txn.open_table(TRUSTED_PEERS_TABLE)?;
            }
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Add or update a trusted peer
    pub fn add_or_update(&self, peer: &TrustedPeer) -> CoordResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRUSTED_PEERS_TABLE)?;
            let data = postcard::to_allocvec(peer)
                .map_err(|e| CoordError::Serialization(e.to_string()))?;
            table.insert(peer.peer_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a peer by id
    pub fn get(&self, peer_id: &DeviceId) -> CoordResult<Option<TrustedPeer>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TRUSTED_PEERS_TABLE)?;

        match table.get(peer_id.as_str())? {
            Some(v) => {
                let peer: TrustedPeer = postcard::from_bytes(v.value())
                    .map_err(|e| CoordError::Serialization(e.to_string()))?;
                Ok(Some(peer))
            }
            None => Ok(None),
        }
    }

    /// Whether this peer has been accepted before
    pub fn is_trusted(&self, peer_id: &DeviceId) -> CoordResult<bool> {
        Ok(self.get(peer_id)?.is_some())
    }

    /// List all trusted peers
    pub fn list_all(&self) -> CoordResult<Vec<TrustedPeer>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TRUSTED_PEERS_TABLE)?;

        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let peer: TrustedPeer = postcard::from_bytes(value.value())
                .map_err(|e| CoordError::Serialization(e.to_string()))?;
            peers.push(peer);
        }
        Ok(peers)
    }

    /// Remove a peer from the registry
    pub fn remove(&self, peer_id: &DeviceId) -> CoordResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRUSTED_PEERS_TABLE)?;
            table.remove(peer_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Update `last_connected` for an existing peer, or register the peer
    /// fresh if it was unknown.
    pub fn record_connected(&self, peer_id: &DeviceId, role: DeviceRole) -> CoordResult<()> {
        let mut peer = self
            .get(peer_id)?
            .unwrap_or_else(|| TrustedPeer::new(peer_id.clone(), role));
        peer.touch_connected();
        self.add_or_update(&peer)
    }

    /// Count peers in the registry
    pub fn count(&self) -> CoordResult<usize> {
        Ok(self.list_all()?.len())
    }
}
