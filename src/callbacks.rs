use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::direction::Direction;
use crate::packet::{Packet, PacketType};

/// A user-supplied handler for one (packet type, direction). The handler gets its own copy of
///  the packet and the peer the packet is associated with (the remote simulator for Outgoing,
///  the packet's source for Incoming).
///
/// * `Ok(Some(replacement))` substitutes the returned packet; the pump re-applies the
///   original's sequence number and appended acks before sending.
/// * `Ok(None)` drops the packet (the pump acks reliable drops on the sender's behalf).
/// * `Err(_)` is logged and treated as if no handler had fired - the unmodified original is
///   forwarded, never a partially mutated one.
pub type PacketHandler =
    Arc<dyn Fn(Packet, SocketAddr) -> anyhow::Result<Option<Packet>> + Send + Sync>;

/// At most one handler per (packet type, direction); registering again replaces the previous
///  handler. Lookups happen for every relayed packet and only take a brief mutex to clone the
///  handler out.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: Mutex<FxHashMap<(PacketType, Direction), PacketHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        Self::default()
    }

    pub fn add(&self, packet_type: PacketType, direction: Direction, handler: PacketHandler) {
        self.handlers.lock()
            .expect("callback registry lock poisoned")
            .insert((packet_type, direction), handler);
    }

    pub fn remove(&self, packet_type: PacketType, direction: Direction) {
        self.handlers.lock()
            .expect("callback registry lock poisoned")
            .remove(&(packet_type, direction));
    }

    pub fn get(&self, packet_type: PacketType, direction: Direction) -> Option<PacketHandler> {
        self.handlers.lock()
            .expect("callback registry lock poisoned")
            .get(&(packet_type, direction))
            .cloned()
    }
}
