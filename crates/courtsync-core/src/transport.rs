//! Peer transport abstraction and connection-state tracking
//!
//! The actual wireless transport (multipeer session, BLE mesh, etc.) is
//! supplied by the embedding application; the core only consumes its
//! connectivity callbacks and message stream through the [`PeerTransport`]
//! trait. [`ConnectionStateTracker`] normalizes the raw callbacks into the
//! five-value [`ConnectionState`]; it owns no retry policy of its own,
//! since reconnection decisions live in the coordinator.
//!
//! [`ChannelTransport`] is an in-process implementation over tokio channels,
//! used by tests and the demo path: endpoints register with a shared
//! [`TransportHub`], a browser pairs with an advertiser on the same service
//! label, and messages are delivered point-to-point.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::message::TransportMessage;
use crate::types::{ConnectionState, DeviceId};

/// Capacity for per-endpoint transport event channels
const TRANSPORT_CHANNEL_CAPACITY: usize = 256;

/// Raw connectivity callback values from the underlying transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTransportEvent {
    /// Started browsing for advertisers
    BrowsingStarted,
    /// Started advertising to browsers
    AdvertisingStarted,
    /// Handshake with a peer began
    Connecting(DeviceId),
    /// Connected to a peer
    Connected(DeviceId),
    /// Lost the connection to a peer
    Disconnected(DeviceId),
    /// Transport session stopped
    Stopped,
}

/// Event emitted by a transport endpoint
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connectivity changed
    State(RawTransportEvent),
    /// A typed message arrived from the connected peer
    Message {
        /// The sending device
        from: DeviceId,
        /// The decoded message
        message: TransportMessage,
    },
}

/// Local peer-to-peer transport session
///
/// Implementations run their own I/O internally; control methods return
/// immediately and outcomes arrive on the subscribed event stream.
pub trait PeerTransport: Send + Sync {
    /// Begin browsing for peers advertising `service`
    fn start_browsing(&self, service: &str) -> CoordResult<()>;

    /// Begin advertising under `service` so browsers can find this device
    fn start_advertising(&self, service: &str) -> CoordResult<()>;

    /// Stop the transport session; disconnects any peer
    fn stop(&self);

    /// Send a message to the connected peer
    fn send(&self, message: &TransportMessage) -> CoordResult<()>;

    /// Subscribe to connectivity and message events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// This endpoint's device id
    fn local_device(&self) -> DeviceId;
}

/// Folds raw transport callbacks into [`ConnectionState`]
///
/// Pure re-publisher: no side effects beyond the watch channel.
pub struct ConnectionStateTracker {
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateTracker {
    /// Create a tracker starting at `Idle`
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self { state_tx }
    }

    /// Subscribe to connection-state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Fold one raw callback into the published state
    pub fn observe(&self, raw: &RawTransportEvent) {
        let next = match raw {
            RawTransportEvent::BrowsingStarted | RawTransportEvent::AdvertisingStarted => {
                ConnectionState::Searching
            }
            RawTransportEvent::Connecting(peer) => ConnectionState::Connecting(peer.clone()),
            RawTransportEvent::Connected(peer) => ConnectionState::Connected(peer.clone()),
            RawTransportEvent::Disconnected(peer) => ConnectionState::Disconnected(peer.clone()),
            RawTransportEvent::Stopped => ConnectionState::Idle,
        };
        if *self.state_tx.borrow() != next {
            debug!(state = %next, "Connection state changed");
            self.state_tx.send_replace(next);
        }
    }
}

impl Default for ConnectionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// What an in-process endpoint is currently doing
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointMode {
    Idle,
    Browsing(String),
    Advertising(String),
    Connected(DeviceId),
}

struct Endpoint {
    mode: EndpointMode,
    event_tx: broadcast::Sender<TransportEvent>,
}

/// Shared in-process pairing fabric for [`ChannelTransport`] endpoints
#[derive(Clone, Default)]
pub struct TransportHub {
    endpoints: Arc<Mutex<HashMap<DeviceId, Endpoint>>>,
}

impl TransportHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint attached to this hub
    pub fn endpoint(&self, device: DeviceId) -> ChannelTransport {
        let (event_tx, _) = broadcast::channel(TRANSPORT_CHANNEL_CAPACITY);
        self.endpoints.lock().insert(
            device.clone(),
            Endpoint {
                mode: EndpointMode::Idle,
                event_tx: event_tx.clone(),
            },
        );
        ChannelTransport {
            device,
            hub: self.clone(),
            event_tx,
        }
    }

    /// Second handle to an already-registered endpoint
    ///
    /// Shares the original's event stream; useful when the first handle is
    /// owned elsewhere.
    pub fn handle(&self, device: &DeviceId) -> Option<ChannelTransport> {
        let endpoints = self.endpoints.lock();
        let ep = endpoints.get(device)?;
        Some(ChannelTransport {
            device: device.clone(),
            hub: self.clone(),
            event_tx: ep.event_tx.clone(),
        })
    }

    /// Simulate link loss between a device and its peer
    ///
    /// Both sides receive `Disconnected` and drop back to idle, as if the
    /// wireless link died without a clean stop.
    pub fn sever(&self, device: &DeviceId) {
        let mut endpoints = self.endpoints.lock();
        let peer = match endpoints.get(device) {
            Some(ep) => match &ep.mode {
                EndpointMode::Connected(peer) => peer.clone(),
                _ => return,
            },
            None => return,
        };

        info!(%device, %peer, "Severing transport link");
        if let Some(ep) = endpoints.get_mut(device) {
            ep.mode = EndpointMode::Idle;
            let _ = ep
                .event_tx
                .send(TransportEvent::State(RawTransportEvent::Disconnected(
                    peer.clone(),
                )));
        }
        if let Some(ep) = endpoints.get_mut(&peer) {
            ep.mode = EndpointMode::Idle;
            let _ = ep
                .event_tx
                .send(TransportEvent::State(RawTransportEvent::Disconnected(
                    device.clone(),
                )));
        }
    }

    /// Pair `device` (entering `mode`) with a counterpart if one is waiting
    fn try_pair(&self, device: &DeviceId, service: &str, browsing: bool) {
        let mut endpoints = self.endpoints.lock();

        let counterpart = endpoints.iter().find_map(|(id, ep)| {
            if id == device {
                return None;
            }
            let matches = match &ep.mode {
                EndpointMode::Advertising(s) => browsing && s == service,
                EndpointMode::Browsing(s) => !browsing && s == service,
                _ => false,
            };
            matches.then(|| id.clone())
        });

        let Some(peer) = counterpart else { return };
        debug!(%device, %peer, service, "Pairing endpoints");

        for (a, b) in [(device.clone(), peer.clone()), (peer, device.clone())] {
            if let Some(ep) = endpoints.get_mut(&a) {
                ep.mode = EndpointMode::Connected(b.clone());
                let _ = ep
                    .event_tx
                    .send(TransportEvent::State(RawTransportEvent::Connecting(
                        b.clone(),
                    )));
                let _ = ep
                    .event_tx
                    .send(TransportEvent::State(RawTransportEvent::Connected(b)));
            }
        }
    }
}

/// In-process transport endpoint backed by a [`TransportHub`]
pub struct ChannelTransport {
    device: DeviceId,
    hub: TransportHub,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl ChannelTransport {
    /// Whether this endpoint currently has a connected peer
    pub fn is_connected(&self) -> bool {
        matches!(
            self.hub.endpoints.lock().get(&self.device).map(|e| &e.mode),
            Some(EndpointMode::Connected(_))
        )
    }

    /// Whether this endpoint is stopped (idle at the hub)
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.hub.endpoints.lock().get(&self.device).map(|e| &e.mode),
            Some(EndpointMode::Idle) | None
        )
    }
}

impl PeerTransport for ChannelTransport {
    fn start_browsing(&self, service: &str) -> CoordResult<()> {
        {
            let mut endpoints = self.hub.endpoints.lock();
            let ep = endpoints
                .get_mut(&self.device)
                .ok_or_else(|| CoordError::Transport("endpoint not registered".into()))?;
            ep.mode = EndpointMode::Browsing(service.to_string());
        }
        let _ = self
            .event_tx
            .send(TransportEvent::State(RawTransportEvent::BrowsingStarted));
        self.hub.try_pair(&self.device, service, true);
        Ok(())
    }

    fn start_advertising(&self, service: &str) -> CoordResult<()> {
        {
            let mut endpoints = self.hub.endpoints.lock();
            let ep = endpoints
                .get_mut(&self.device)
                .ok_or_else(|| CoordError::Transport("endpoint not registered".into()))?;
            ep.mode = EndpointMode::Advertising(service.to_string());
        }
        let _ = self
            .event_tx
            .send(TransportEvent::State(RawTransportEvent::AdvertisingStarted));
        self.hub.try_pair(&self.device, service, false);
        Ok(())
    }

    fn stop(&self) {
        let peer = {
            let mut endpoints = self.hub.endpoints.lock();
            let Some(ep) = endpoints.get_mut(&self.device) else {
                return;
            };
            let peer = match &ep.mode {
                EndpointMode::Connected(peer) => Some(peer.clone()),
                _ => None,
            };
            ep.mode = EndpointMode::Idle;

            // The peer observes this as a disconnect, not a stop
            if let Some(peer_id) = &peer {
                if let Some(peer_ep) = endpoints.get_mut(peer_id) {
                    peer_ep.mode = EndpointMode::Idle;
                    let _ = peer_ep.event_tx.send(TransportEvent::State(
                        RawTransportEvent::Disconnected(self.device.clone()),
                    ));
                }
            }
            peer
        };

        debug!(device = %self.device, ?peer, "Transport stopped");
        let _ = self
            .event_tx
            .send(TransportEvent::State(RawTransportEvent::Stopped));
    }

    fn send(&self, message: &TransportMessage) -> CoordResult<()> {
        // Round-trip through the wire format so tests exercise the codec
        let bytes = message.encode()?;
        let decoded = TransportMessage::decode(&bytes)?;

        let endpoints = self.hub.endpoints.lock();
        let peer = match endpoints.get(&self.device).map(|e| &e.mode) {
            Some(EndpointMode::Connected(peer)) => peer.clone(),
            _ => {
                return Err(CoordError::Transport("no connected peer".into()));
            }
        };

        match endpoints.get(&peer) {
            Some(peer_ep) => {
                debug!(from = %self.device, to = %peer, kind = %message.kind(), "Delivering message");
                let _ = peer_ep.event_tx.send(TransportEvent::Message {
                    from: self.device.clone(),
                    message: decoded,
                });
                Ok(())
            }
            None => {
                warn!(from = %self.device, to = %peer, "Peer endpoint gone");
                Err(CoordError::Transport(format!("peer {} gone", peer)))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    fn local_device(&self) -> DeviceId {
        self.device.clone()
    }
}
