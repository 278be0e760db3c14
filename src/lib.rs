//! A man-in-the-middle relay for the virtual-world UDP wire protocol: it sits between a client
//!  and the grid's simulators, renumbering, acknowledging, retransmitting and selectively
//!  rewriting the packets that flow through it, while letting application code inject synthetic
//!  packets and intercept, modify or drop specific packet types.
//!
//! ## Architecture
//!
//! * [`proxy::ProxyCore`] owns the single remote-facing UDP socket and the login listener. It
//!   demultiplexes datagrams arriving from simulators to the circuit they belong to (by source
//!   address) and intercepts the HTTP/XML-RPC login bootstrap to learn the first simulator
//!   address, which it replaces with a locally bound proxy endpoint.
//! * [`session::SessionProxy`] is the per-circuit packet pump - one instance per remote
//!   simulator, each with its own client-facing UDP socket whose local address *is* the proxy
//!   endpoint handed to the client. All sequencing state lives here, independently for the
//!   Incoming (simulator to client) and Outgoing (client to simulator) directions.
//! * [`rewrite::AddressRewriter`] knows which packet types embed a simulator address (handoff
//!   messages such as teleport completion or region crossing) and substitutes the proxy
//!   endpoint so the client keeps talking through us after a handoff.
//! * [`callbacks::CallbackRegistry`] maps (packet type, direction) to at most one user handler
//!   that may inspect, replace or drop a packet.
//!
//! ## Sequencing
//!
//! Sequence numbers are per direction per circuit. When the proxy injects a packet of its own
//!  it consumes the next sequence number, so every organic packet that follows must be shifted
//!  up to keep the numbering gap-free from the receiver's point of view - that is what
//!  `modify_sequence` does, driven by the set of pending injections plus an accumulated offset.
//! Reliable packets are retained until an acknowledgment for their sequence number is seen,
//!  either as a standalone ack packet or appended to an unrelated packet's tail, and are resent
//!  once per maintenance sweep (1 s) until then. Tracking tables are pruned in batches every
//!  60 sweeps, which bounds their growth at the cost of delayed collection.
//!
//! ## Transport header
//!
//! All numbers in network byte order:
//! ```ascii
//! 0: flags (u8): 0x80 zero-coded, 0x40 reliable, 0x20 resent, 0x10 has appended acks
//! 1: sequence number (u16)
//! 3: packet type selector (u16)
//! 5: type-specific payload (zero-coded iff the flag is set)
//! *: if appended acks: ack ids (u32 each), then the ack count (u8) as the last byte
//! ```
//!
//! Zero-coding is a run-length byte stuffing of the payload region only; the header prefix and
//!  the appended-ack tail are never coded.

pub mod callbacks;
pub mod config;
pub mod direction;
pub mod error;
pub mod login;
pub mod packet;
pub mod proxy;
pub mod rewrite;
pub mod session;
pub mod socket;
pub mod zero_coding;

mod atomic_map;
