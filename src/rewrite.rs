use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::direction::Direction;
use crate::packet::{Packet, PacketBody, SimAddressBlock};
use crate::packet::PacketType;

/// One registered packet type whose embedded simulator endpoint gets rewritten. Handoff
///  messages that move the client to the new simulator also make its circuit the active one;
///  EnableSimulator style announcements prepare a circuit without activating it.
#[derive(Copy, Clone, Debug)]
pub struct RewriteEntry {
    pub activates_circuit: bool,
}

/// The registry of packet types that embed a remote simulator endpoint, per direction. The
///  rewrite itself is total: it replaces only the embedded address block and leaves sequence
///  number, flags and appended acks untouched, so callers never have to fix sequencing up
///  afterwards. Types without an entry pass through unchanged.
pub struct AddressRewriter {
    incoming: FxHashMap<PacketType, RewriteEntry>,
    outgoing: FxHashMap<PacketType, RewriteEntry>,
}

impl AddressRewriter {
    pub fn empty() -> AddressRewriter {
        AddressRewriter {
            incoming: FxHashMap::default(),
            outgoing: FxHashMap::default(),
        }
    }

    /// The standard table: every handoff message the simulator sends towards the client.
    pub fn standard() -> AddressRewriter {
        let mut rewriter = Self::empty();
        rewriter.register(PacketType::TeleportFinish, Direction::Incoming, RewriteEntry { activates_circuit: true });
        rewriter.register(PacketType::AgentToNewRegion, Direction::Incoming, RewriteEntry { activates_circuit: true });
        rewriter.register(PacketType::CrossedRegion, Direction::Incoming, RewriteEntry { activates_circuit: true });
        rewriter.register(PacketType::EnableSimulator, Direction::Incoming, RewriteEntry { activates_circuit: false });
        rewriter.register(PacketType::UserLoginLocationReply, Direction::Incoming, RewriteEntry { activates_circuit: false });
        rewriter
    }

    pub fn register(&mut self, packet_type: PacketType, direction: Direction, entry: RewriteEntry) {
        self.table_mut(direction).insert(packet_type, entry);
    }

    pub fn entry(&self, packet_type: PacketType, direction: Direction) -> Option<RewriteEntry> {
        self.table(direction).get(&packet_type).copied()
    }

    /// Replaces the embedded endpoint with `local`. Identity for packets without an embedded
    ///  endpoint and for non-IPv4 proxy endpoints (the wire has a 4 byte address field).
    pub fn apply(packet: Packet, local: SocketAddr) -> Packet {
        let SocketAddr::V4(local) = local else {
            warn!("proxy endpoint {:?} is not IPv4, forwarding handoff unrewritten", local);
            return packet;
        };

        match packet.body {
            PacketBody::Handoff(_, rest) => Packet {
                body: PacketBody::Handoff(
                    SimAddressBlock { ip: *local.ip(), port: local.port() },
                    rest,
                ),
                ..packet
            },
            _ => packet,
        }
    }

    fn table(&self, direction: Direction) -> &FxHashMap<PacketType, RewriteEntry> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    fn table_mut(&mut self, direction: Direction) -> &mut FxHashMap<PacketType, RewriteEntry> {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }
}
