//! The transport-level packet codec: a fixed header prefix carrying flag bits, a 16 bit
//!  sequence number and a 16 bit type selector, followed by a type-specific payload and an
//!  optional appended-ack tail (see the crate documentation for the exact layout).
//!
//! Only the packet types the proxy itself has to look inside get a typed body: standalone
//!  acknowledgments and the handoff messages that embed a simulator address. Everything else
//!  travels as opaque bytes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::warn;

use crate::zero_coding::{zero_decode, zero_encode};

bitflags! {
    /// The flag bits of the transport header's first byte.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct HeaderFlags: u8 {
        const ZEROCODED     = 0x80;
        const RELIABLE      = 0x40;
        const RESENT        = 0x20;
        const APPENDED_ACKS = 0x10;
    }
}

/// The packet type selector. Types the proxy does not interpret fall into `Other`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    PacketAck = 1,
    TeleportFinish = 3,
    AgentToNewRegion = 4,
    CrossedRegion = 5,
    EnableSimulator = 6,
    UserLoginLocationReply = 7,
    #[num_enum(catch_all)]
    Other(u16),
}

/// Header fields shared by all packets. The appended-ack list rides piggybacked on the tail of
///  an otherwise unrelated packet; the `APPENDED_ACKS` flag is derived from it at
///  serialization time.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub flags: HeaderFlags,
    pub sequence: u16,
    pub acks: Vec<u32>,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 5;
}

/// The simulator endpoint embedded in handoff messages. The wire carries IPv4 only.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SimAddressBlock {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl SimAddressBlock {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PacketBody {
    /// A standalone acknowledgment packet: the sequence numbers being acknowledged.
    Acks(Vec<u32>),
    /// A handoff message: the embedded simulator endpoint plus the rest of the payload,
    ///  which the proxy does not interpret.
    Handoff(SimAddressBlock, Bytes),
    Opaque(Bytes),
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    pub packet_type: PacketType,
    pub body: PacketBody,
}

/// A single count byte frames both ack lists on the wire.
const MAX_ACKS: usize = 255;

fn capped_acks(ids: &[u32]) -> &[u32] {
    if ids.len() > MAX_ACKS {
        warn!("dropping {} ack ids beyond the wire limit of {}", ids.len() - MAX_ACKS, MAX_ACKS);
        &ids[..MAX_ACKS]
    }
    else {
        ids
    }
}

fn has_handoff_body(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::TeleportFinish
            | PacketType::AgentToNewRegion
            | PacketType::CrossedRegion
            | PacketType::EnableSimulator
            | PacketType::UserLoginLocationReply
    )
}

impl Packet {
    pub fn new(packet_type: PacketType, flags: HeaderFlags, body: PacketBody) -> Packet {
        Packet {
            header: PacketHeader {
                flags,
                sequence: 0,
                acks: Vec::new(),
            },
            packet_type,
            body,
        }
    }

    /// A standalone acknowledgment for a single sequence number, used to satisfy the true
    ///  sender of a reliable packet that a callback dropped. The sequence number is assigned
    ///  when the ack is injected.
    pub fn spoof_ack(acked_sequence: u16) -> Packet {
        Packet::new(
            PacketType::PacketAck,
            HeaderFlags::empty(),
            PacketBody::Acks(vec![acked_sequence as u32]),
        )
    }

    /// Extracts a packet's appended acks into a standalone ack packet carrying the same
    ///  sequence number, so the acks survive when the packet itself is dropped.
    pub fn separate_acks(&self) -> Packet {
        let mut ack = Packet::new(
            PacketType::PacketAck,
            HeaderFlags::empty(),
            PacketBody::Acks(self.header.acks.clone()),
        );
        ack.header.sequence = self.header.sequence;
        ack
    }

    /// Copies the sequence number and appended-ack list from `original` onto `self`: a
    ///  replacement packet supplied by a callback must not invent its own sequencing.
    pub fn copy_sequencing_from(&mut self, original: &Packet) {
        self.header.sequence = original.header.sequence;
        self.header.acks = original.header.acks.clone();
        self.header.flags.set(HeaderFlags::APPENDED_ACKS, !self.header.acks.is_empty());
    }

    pub fn is_reliable(&self) -> bool {
        self.header.flags.contains(HeaderFlags::RELIABLE)
    }

    pub fn mark_resent(&mut self) {
        self.header.flags.insert(HeaderFlags::RESENT);
    }

    /// The embedded simulator endpoint, for packet types that carry one.
    pub fn embedded_endpoint(&self) -> Option<SimAddressBlock> {
        match &self.body {
            PacketBody::Handoff(addr, _) => Some(*addr),
            _ => None,
        }
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        match &self.body {
            PacketBody::Acks(ids) => {
                let ids = capped_acks(ids);
                buf.put_u8(ids.len() as u8);
                for &id in ids {
                    buf.put_u32(id);
                }
            }
            PacketBody::Handoff(addr, rest) => {
                buf.put_slice(&addr.ip.octets());
                buf.put_u16(addr.port);
                buf.put_slice(rest);
            }
            PacketBody::Opaque(data) => buf.put_slice(data),
        }
    }

    pub fn ser(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        self.ser_body(&mut body);

        let body = if self.header.flags.contains(HeaderFlags::ZEROCODED) {
            zero_encode(&body)
        }
        else {
            body.to_vec()
        };

        let mut flags = self.header.flags;
        flags.set(HeaderFlags::APPENDED_ACKS, !self.header.acks.is_empty());

        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + body.len() + self.header.acks.len() * 4 + 1);
        buf.put_u8(flags.bits());
        buf.put_u16(self.header.sequence);
        buf.put_u16(self.packet_type.into());
        buf.put_slice(&body);
        if !self.header.acks.is_empty() {
            let acks = capped_acks(&self.header.acks);
            for &id in acks {
                buf.put_u32(id);
            }
            buf.put_u8(acks.len() as u8);
        }
        buf.to_vec()
    }

    pub fn deser(raw: &[u8]) -> anyhow::Result<Packet> {
        if raw.len() < PacketHeader::SERIALIZED_LEN {
            bail!("packet shorter than the transport header ({} bytes)", raw.len());
        }

        let flags = HeaderFlags::from_bits_truncate(raw[0]);
        let mut prefix = &raw[1..PacketHeader::SERIALIZED_LEN];
        let sequence = prefix.get_u16();
        let packet_type = PacketType::from(prefix.get_u16());

        let (body_end, acks) = if flags.contains(HeaderFlags::APPENDED_ACKS) {
            let count = raw[raw.len() - 1] as usize;
            let tail_len = count * 4 + 1;
            if raw.len() < PacketHeader::SERIALIZED_LEN + tail_len {
                bail!("appended-ack tail of {} ids does not fit the packet", count);
            }
            let mut tail = &raw[raw.len() - tail_len..raw.len() - 1];
            let mut acks = Vec::with_capacity(count);
            for _ in 0..count {
                acks.push(tail.get_u32());
            }
            (raw.len() - tail_len, acks)
        }
        else {
            (raw.len(), Vec::new())
        };

        let body_region = &raw[PacketHeader::SERIALIZED_LEN..body_end];
        let body_bytes = if flags.contains(HeaderFlags::ZEROCODED) {
            zero_decode(body_region)?
        }
        else {
            body_region.to_vec()
        };

        let body = match packet_type {
            PacketType::PacketAck => {
                let mut buf = body_bytes.as_slice();
                if !buf.has_remaining() {
                    bail!("ack packet without a count byte");
                }
                let count = buf.get_u8() as usize;
                if buf.remaining() < count * 4 {
                    bail!("ack packet announces {} ids but carries {} bytes", count, buf.remaining());
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(buf.get_u32());
                }
                PacketBody::Acks(ids)
            }
            t if has_handoff_body(t) => {
                let mut buf = body_bytes.as_slice();
                if buf.remaining() < 6 {
                    bail!("handoff packet too short for an embedded endpoint");
                }
                let ip = Ipv4Addr::from(buf.get_u32());
                let port = buf.get_u16();
                PacketBody::Handoff(SimAddressBlock { ip, port }, Bytes::copy_from_slice(buf))
            }
            _ => PacketBody::Opaque(Bytes::from(body_bytes)),
        };

        Ok(Packet {
            header: PacketHeader { flags, sequence, acks },
            packet_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn opaque(flags: HeaderFlags, sequence: u16, data: &[u8]) -> Packet {
        let mut p = Packet::new(PacketType::Other(900), flags, PacketBody::Opaque(Bytes::copy_from_slice(data)));
        p.header.sequence = sequence;
        p
    }

    #[rstest]
    #[case::plain(HeaderFlags::empty(), vec![1, 2, 3])]
    #[case::reliable(HeaderFlags::RELIABLE, vec![1, 2, 3])]
    #[case::resent(HeaderFlags::RELIABLE | HeaderFlags::RESENT, vec![])]
    #[case::zerocoded(HeaderFlags::ZEROCODED, vec![1, 0, 0, 0, 2])]
    fn test_opaque_round_trip(#[case] flags: HeaderFlags, #[case] data: Vec<u8>) {
        let original = opaque(flags, 77, &data);
        let deser = Packet::deser(&original.ser()).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_wire_layout() {
        let mut packet = opaque(HeaderFlags::RELIABLE, 0x0102, &[9, 8]);
        packet.header.acks = vec![0x01020304];

        assert_eq!(
            packet.ser(),
            vec![
                0x50,             // reliable | appended acks
                0x01, 0x02,       // sequence
                0x03, 0x84,       // type selector 900
                9, 8,             // payload
                1, 2, 3, 4,       // ack id
                1,                // ack count
            ]
        );
    }

    #[test]
    fn test_appended_acks_round_trip() {
        let mut packet = opaque(HeaderFlags::RELIABLE | HeaderFlags::APPENDED_ACKS, 5, &[1, 2]);
        packet.header.acks = vec![10, 11, 12];

        let deser = Packet::deser(&packet.ser()).unwrap();
        assert_eq!(deser.header.acks, vec![10, 11, 12]);
        assert_eq!(deser.header.sequence, 5);
        assert!(deser.header.flags.contains(HeaderFlags::APPENDED_ACKS));
    }

    #[test]
    fn test_ack_packet_round_trip() {
        let packet = Packet::new(
            PacketType::PacketAck,
            HeaderFlags::empty(),
            PacketBody::Acks(vec![3, 4, 5]),
        );
        let deser = Packet::deser(&packet.ser()).unwrap();
        assert_eq!(deser.body, PacketBody::Acks(vec![3, 4, 5]));
        assert_eq!(deser.packet_type, PacketType::PacketAck);
    }

    #[rstest]
    #[case::teleport(PacketType::TeleportFinish)]
    #[case::enable(PacketType::EnableSimulator)]
    #[case::crossed(PacketType::CrossedRegion)]
    fn test_handoff_round_trip(#[case] packet_type: PacketType) {
        let packet = Packet::new(
            packet_type,
            HeaderFlags::RELIABLE,
            PacketBody::Handoff(
                SimAddressBlock { ip: Ipv4Addr::new(10, 1, 2, 3), port: 13000 },
                Bytes::from_static(&[42, 43]),
            ),
        );
        let deser = Packet::deser(&packet.ser()).unwrap();
        assert_eq!(deser, packet);
        assert_eq!(
            deser.embedded_endpoint().unwrap().socket_addr(),
            "10.1.2.3:13000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_zerocoded_handoff() {
        // an embedded 10.0.0.3 endpoint has zero bytes that the coding must preserve
        let packet = Packet::new(
            PacketType::EnableSimulator,
            HeaderFlags::ZEROCODED,
            PacketBody::Handoff(
                SimAddressBlock { ip: Ipv4Addr::new(10, 0, 0, 3), port: 13001 },
                Bytes::new(),
            ),
        );
        assert_eq!(Packet::deser(&packet.ser()).unwrap(), packet);
    }

    #[test]
    fn test_spoof_ack() {
        let ack = Packet::spoof_ack(99);
        assert_eq!(ack.packet_type, PacketType::PacketAck);
        assert_eq!(ack.body, PacketBody::Acks(vec![99]));
        assert!(!ack.is_reliable());
    }

    #[test]
    fn test_separate_acks() {
        let mut packet = opaque(HeaderFlags::RELIABLE | HeaderFlags::APPENDED_ACKS, 17, &[1]);
        packet.header.acks = vec![7, 8];

        let ack = packet.separate_acks();
        assert_eq!(ack.body, PacketBody::Acks(vec![7, 8]));
        assert_eq!(ack.header.sequence, 17);
        assert!(ack.header.acks.is_empty());
    }

    #[test]
    fn test_copy_sequencing() {
        let mut original = opaque(HeaderFlags::RELIABLE, 400, &[1]);
        original.header.acks = vec![1, 2];

        let mut replacement = opaque(HeaderFlags::empty(), 0, &[2]);
        replacement.copy_sequencing_from(&original);

        assert_eq!(replacement.header.sequence, 400);
        assert_eq!(replacement.header.acks, vec![1, 2]);
        assert!(replacement.header.flags.contains(HeaderFlags::APPENDED_ACKS));
        assert!(!replacement.header.flags.contains(HeaderFlags::RELIABLE));
    }

    #[test]
    fn test_ack_lists_are_capped_at_the_count_byte() {
        let oversized: Vec<u32> = (0..300).collect();
        let capped: Vec<u32> = (0..255).collect();

        let mut carrier = opaque(HeaderFlags::empty(), 1, &[]);
        carrier.header.acks = oversized.clone();
        assert_eq!(Packet::deser(&carrier.ser()).unwrap().header.acks, capped);

        let standalone = Packet::new(
            PacketType::PacketAck,
            HeaderFlags::empty(),
            PacketBody::Acks(oversized),
        );
        assert_eq!(Packet::deser(&standalone.ser()).unwrap().body, PacketBody::Acks(capped));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![0x40, 0, 1])]
    #[case::ack_tail_too_big(vec![0x10, 0, 1, 0, 99, 200])]
    #[case::ack_body_too_short(vec![0x00, 0, 1, 0, 1, 3, 0, 0])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        assert!(Packet::deser(&raw).is_err());
    }
}
