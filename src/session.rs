//! The per-circuit packet pump: sequencing, acknowledgment tracking, retransmission and
//!  injection for one remote simulator. Incoming (simulator to client) and Outgoing (client to
//!  simulator) directions carry fully independent state.
//!
//! All mutation of a circuit's state goes through one coarse mutex, held across the whole
//!  receive-callback body and across each maintenance sweep - `check_acks` and
//!  `modify_sequence` must observe a consistent snapshot together, so this lock is deliberately
//!  not split.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::direction::Direction;
use crate::packet::{Packet, PacketBody};
use crate::proxy::Shared;
use crate::rewrite::AddressRewriter;
use crate::socket::SendSocket;

/// A reliable packet retained until its sequence number is acknowledged. Entries the proxy
///  injected on its own behalf have their acks stripped before relaying; acks for organically
///  forwarded packets stay visible to the true sender.
struct PendingAck {
    packet: Packet,
    injected: bool,
}

/// Sequencing state for one direction of one circuit.
#[derive(Default)]
struct SequenceState {
    /// the highest sequence number assigned or observed so far; doubles as the injection
    /// counter, exactly like the per-direction counter it mirrors on the true sender's side
    sequence: u16,
    /// sequence numbers consumed by injections and not yet folded into `offset`, ascending
    injections: Vec<u16>,
    /// how many pruned injections have been folded into the renumbering base
    offset: u16,
    unacked: FxHashMap<u32, PendingAck>,
    seen_acks: Vec<u32>,
}

impl SequenceState {
    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.injections.push(self.sequence);
        self.sequence
    }

    fn note_high_water(&mut self, sequence: u16) {
        if sequence > self.sequence {
            self.sequence = sequence;
        }
    }

    fn track_reliable(&mut self, packet: Packet, injected: bool) {
        self.unacked.insert(packet.header.sequence as u32, PendingAck { packet, injected });
    }

    /// Folds injections and acks seen before the previous collection into the offset counter
    ///  and drops their table entries. Batching the pruning like this means the tables can grow
    ///  to (injection rate x two collection intervals) entries, which is the accepted cost of
    ///  keeping the per-packet path free of bookkeeping.
    fn collect_garbage(&mut self, checkpoint: &mut GcCheckpoint) {
        for _ in self.injections.drain(..checkpoint.injections) {
            self.offset = self.offset.wrapping_add(1);
        }
        checkpoint.injections = self.injections.len();

        for id in self.seen_acks.drain(..checkpoint.seen_acks) {
            trace!("pruning acknowledged packet #{}", id);
            self.unacked.remove(&id);
        }
        checkpoint.seen_acks = self.seen_acks.len();
    }

    /// Marks every not-yet-seen pending packet as resent and returns the serialized datagrams.
    fn collect_resends(&mut self) -> Vec<Vec<u8>> {
        let mut resends = Vec::new();
        for (id, pending) in self.unacked.iter_mut() {
            if !self.seen_acks.contains(id) {
                pending.packet.mark_resent();
                trace!("resending unacknowledged packet #{}", id);
                resends.push(pending.packet.ser());
            }
        }
        resends
    }
}

#[derive(Default)]
struct GcCheckpoint {
    injections: usize,
    seen_acks: usize,
}

#[derive(Default)]
struct GcCheckpoints {
    incoming: GcCheckpoint,
    outgoing: GcCheckpoint,
}

struct SessionState {
    /// the client's return address, learned from its first datagram on this circuit
    client_addr: Option<SocketAddr>,
    first_receive: bool,
    incoming: SequenceState,
    outgoing: SequenceState,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            client_addr: None,
            first_receive: true,
            incoming: SequenceState::default(),
            outgoing: SequenceState::default(),
        }
    }

    fn dir(&self, direction: Direction) -> &SequenceState {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    fn dir_mut(&mut self, direction: Direction) -> &mut SequenceState {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }

    fn reset(&mut self) {
        self.incoming = SequenceState::default();
        self.outgoing = SequenceState::default();
    }

    /// Removes acknowledgment ids - standalone or appended - that match pending entries in the
    ///  *opposite* direction's table: an ack riding on this packet may satisfy a packet we
    ///  ourselves are retaining. Matched ids are marked seen; only ids belonging to packets the
    ///  proxy injected are stripped from the relayed packet, acks for organically forwarded
    ///  packets must remain visible to the true sender.
    fn check_acks(&mut self, mut packet: Packet, direction: Direction) -> Packet {
        let opposite = self.dir_mut(direction.opposite());
        if opposite.unacked.is_empty() {
            return packet;
        }

        if let PacketBody::Acks(ids) = &packet.body {
            let mut kept = Vec::with_capacity(ids.len());
            let mut stripped_any = false;
            for &id in ids {
                match opposite.unacked.get(&id) {
                    Some(pending) if pending.injected => {
                        trace!("consuming ack !{}", id);
                        opposite.seen_acks.push(id);
                        stripped_any = true;
                    }
                    Some(_) => {
                        trace!("observing pass-through ack !{}", id);
                        opposite.seen_acks.push(id);
                        kept.push(id);
                    }
                    None => kept.push(id),
                }
            }
            if stripped_any {
                packet.body = PacketBody::Acks(kept);
            }
        }

        if !packet.header.acks.is_empty() {
            packet.header.acks.retain(|&id| match opposite.unacked.get(&id) {
                Some(pending) if pending.injected => {
                    trace!("consuming appended ack @{}", id);
                    opposite.seen_acks.push(id);
                    false
                }
                Some(_) => {
                    trace!("observing pass-through appended ack @{}", id);
                    opposite.seen_acks.push(id);
                    true
                }
                None => true,
            });
            if packet.header.acks.is_empty() {
                packet.header.flags.remove(crate::packet::HeaderFlags::APPENDED_ACKS);
            }
        }

        packet
    }

    /// Renumbers a packet to account for sequence numbers consumed by local injections: add the
    ///  accumulated offset, then skip over every pending injected number at or below the
    ///  result. Ack ids are deliberately *not* renumbered across injection boundaries: acks for
    ///  injected packets are matched verbatim by `check_acks`, and pass-through ids are relayed
    ///  untranslated (a redundant retransmit by the true sender is the worst case).
    fn modify_sequence(&mut self, mut packet: Packet, direction: Direction) -> Packet {
        let ours = self.dir(direction);

        let mut sequence = packet.header.sequence.wrapping_add(ours.offset);
        for &injection in &ours.injections {
            if sequence >= injection {
                sequence = sequence.wrapping_add(1);
            }
        }

        trace!("renumbering #{} to #{}", packet.header.sequence, sequence);
        packet.header.sequence = sequence;
        packet
    }
}

/// The proxy for a single circuit. The client talks to `local_endpoint` (this session's own
///  client-facing socket); datagrams from the simulator arrive via the core's shared socket
///  and are routed here by source address.
pub struct SessionProxy {
    shared: Arc<Shared>,
    remote_addr: SocketAddr,
    local_endpoint: SocketAddr,
    client_sink: Arc<dyn SendSocket>,
    state: Mutex<SessionState>,
}

impl SessionProxy {
    pub(crate) fn new(
        shared: Arc<Shared>,
        remote_addr: SocketAddr,
        local_endpoint: SocketAddr,
        client_sink: Arc<dyn SendSocket>,
    ) -> SessionProxy {
        SessionProxy {
            shared,
            remote_addr,
            local_endpoint,
            client_sink,
            state: Mutex::new(SessionState::new()),
        }
    }

    /// The endpoint the client must send to for this circuit.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Spawns this circuit's client-facing receive loop and its maintenance task. Tasks run for
    ///  the rest of the process - circuits are never torn down within a session.
    pub(crate) fn spawn_loops(self: &Arc<Self>, client_socket: Arc<UdpSocket>) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                let (len, from) = match client_socket.recv_from(&mut buf).await {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("client socket error on circuit {:?}: {}", session.remote_addr, e);
                        continue;
                    }
                };
                let packet = match Packet::deser(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("unparseable client packet on circuit {:?}: {:#}", session.remote_addr, e);
                        continue;
                    }
                };
                session.handle_client_packet(packet, from).await;
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            let mut tick = 1u32;
            let mut checkpoints = GcCheckpoints::default();
            let mut timer = interval(Duration::from_secs(1));
            loop {
                timer.tick().await;
                session.maintenance_tick(&mut tick, &mut checkpoints).await;
            }
        });
    }

    /// A datagram from the client. The very first one establishes the client's return address,
    ///  so incoming injections queued while it was unknown are delivered first.
    pub(crate) async fn handle_client_packet(&self, packet: Packet, from: SocketAddr) {
        let mut state = self.state.lock().await;
        state.client_addr = Some(from);

        if state.first_receive {
            state.first_receive = false;
            let queued = std::mem::take(
                &mut *self.shared.queued_incoming.lock().expect("injection queue lock poisoned"),
            );
            for queued_packet in queued {
                self.inject_locked(&mut state, queued_packet, Direction::Incoming).await;
            }
        }

        trace!("-> {:?} #{}", packet.packet_type, packet.header.sequence);
        self.relay(&mut state, packet, Direction::Outgoing).await;
    }

    /// A datagram from the simulator, routed here by the core's demultiplexer.
    pub(crate) async fn handle_remote_packet(&self, packet: Packet) {
        let mut state = self.state.lock().await;
        trace!("<- {:?} #{}", packet.packet_type, packet.header.sequence);
        self.relay(&mut state, packet, Direction::Incoming).await;
    }

    /// The relay pipeline, identical for both directions: strip acks we were waiting for,
    ///  renumber for injections, rewrite embedded simulator addresses, offer the packet to a
    ///  registered callback, send, and retain reliable sends for retransmission.
    async fn relay(&self, state: &mut SessionState, packet: Packet, direction: Direction) {
        let packet = state.check_acks(packet, direction);

        // the true sender's own numbering, needed when acking a dropped packet on its behalf
        let old_sequence = packet.header.sequence;

        let mut packet = state.modify_sequence(packet, direction);
        state.dir_mut(direction).note_high_water(packet.header.sequence);

        if let Some(entry) = self.shared.rewriter.entry(packet.packet_type, direction) {
            if let Some(block) = packet.embedded_endpoint() {
                let real = block.socket_addr();
                match self.shared.proxy_endpoint(real).await {
                    Ok(local) => {
                        packet = AddressRewriter::apply(packet, local);
                        if entry.activates_circuit {
                            self.shared.set_active_circuit(real);
                        }
                    }
                    Err(e) => {
                        warn!("cannot allocate proxy endpoint for {:?}, forwarding handoff unrewritten: {:#}", real, e);
                    }
                }
            }
        }

        let mut injected_reliability = false;
        if let Some(handler) = self.shared.callbacks.get(packet.packet_type, direction) {
            let original = packet;
            match handler(original.clone(), self.remote_addr) {
                Ok(None) => {
                    if original.is_reliable() {
                        self.inject_locked(&mut *state, Packet::spoof_ack(old_sequence), direction.opposite()).await;
                    }
                    if !original.header.acks.is_empty() {
                        // the drop must not swallow acks riding on the packet's tail
                        packet = original.separate_acks();
                    }
                    else {
                        return;
                    }
                }
                Ok(Some(mut replacement)) => {
                    if original.is_reliable() && !replacement.is_reliable() {
                        self.inject_locked(&mut *state, Packet::spoof_ack(old_sequence), direction.opposite()).await;
                    }
                    else if !original.is_reliable() && replacement.is_reliable() {
                        injected_reliability = true;
                    }
                    replacement.copy_sequencing_from(&original);
                    packet = replacement;
                }
                Err(e) => {
                    warn!("error in {:?} {} callback, forwarding unmodified: {:#}", original.packet_type, direction, e);
                    packet = original;
                }
            }
        }

        self.send(state, &packet, direction).await;
        if packet.is_reliable() {
            state.dir_mut(direction).track_reliable(packet, injected_reliability);
        }
    }

    /// Injects a packet that did not originate from either true peer, consuming the next
    ///  sequence number of `direction`. Incoming injections before the client's first datagram
    ///  are queued at core level until return addressing exists.
    pub async fn inject(&self, packet: Packet, direction: Direction) {
        let mut state = self.state.lock().await;
        self.inject_locked(&mut state, packet, direction).await;
    }

    async fn inject_locked(&self, state: &mut SessionState, mut packet: Packet, direction: Direction) {
        if direction == Direction::Incoming && state.first_receive {
            self.shared.queued_incoming.lock()
                .expect("injection queue lock poisoned")
                .push(packet);
            return;
        }

        let sequence = state.dir_mut(direction).next_sequence();
        packet.header.sequence = sequence;
        debug!("INJECT {} {:?} #{}", direction, packet.packet_type, sequence);

        if packet.is_reliable() {
            state.dir_mut(direction).track_reliable(packet.clone(), true);
        }
        self.send(state, &packet, direction).await;
    }

    async fn send(&self, state: &SessionState, packet: &Packet, direction: Direction) {
        self.send_raw(state, &packet.ser(), direction).await;
    }

    async fn send_raw(&self, state: &SessionState, buf: &[u8], direction: Direction) {
        match direction {
            Direction::Outgoing => {
                self.shared.remote_sink.send_datagram(self.remote_addr, buf).await;
            }
            Direction::Incoming => match state.client_addr {
                Some(client_addr) => self.client_sink.send_datagram(client_addr, buf).await,
                None => warn!("no client return address yet on circuit {:?} - dropping", self.remote_addr),
            },
        }
    }

    /// One maintenance sweep: resend everything still unacknowledged (flagged resent, via the
    ///  path it originally took), and every 60th sweep collect garbage from the tracking
    ///  tables.
    async fn maintenance_tick(&self, tick: &mut u32, checkpoints: &mut GcCheckpoints) {
        let mut state = self.state.lock().await;

        *tick = (*tick + 1) % 60;
        if *tick == 0 {
            state.incoming.collect_garbage(&mut checkpoints.incoming);
            state.outgoing.collect_garbage(&mut checkpoints.outgoing);
        }

        for direction in [Direction::Incoming, Direction::Outgoing] {
            let resends = state.dir_mut(direction).collect_resends();
            for buf in resends {
                self.send_raw(&state, &buf, direction).await;
            }
        }
    }

    /// Starts a new session: sequence counters and tracking tables are cleared; the circuit
    ///  and its client addressing survive.
    pub async fn reset(&self) {
        self.state.lock().await.reset();
    }
}
