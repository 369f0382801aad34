use std::net::SocketAddr;

use bytes::Bytes;
use grid_core::MemberId;

use crate::member_set::MemberIdSet;

// header layout: tag(1) from(2) service(4) type(2) recipients(2) part(4),
// then one u16 per recipient id
const DIRECTED_HEADER_BASE: usize = 15;
const SEQUEL_HEADER_BASE: usize = 15;
// tag(1) service(4) type(2) sender identity and return addresses
pub const BROADCAST_HEADER_LEN: usize = 96;

/// One transport datagram. A message addressed to known members becomes a
/// `Directed` packet optionally followed by `Sequel` packets; a message for
/// members not yet known by id goes out as a single `Broadcast`.
#[derive(Debug, Clone)]
pub enum Packet {
    Directed(DirectedPacket),
    Sequel(SequelPacket),
    Broadcast(BroadcastPacket),
}

/// First (or only) packet of a directed message; carries the packet count
/// so the receiver can preallocate reassembly state.
#[derive(Debug, Clone)]
pub struct DirectedPacket {
    pub to: MemberIdSet,
    pub from: MemberId,
    pub service_id: u32,
    pub message_type: u16,
    pub part_count: u32,
    pub body: Bytes,
}

/// Continuation packet of a multi-packet directed message.
#[derive(Debug, Clone)]
pub struct SequelPacket {
    pub to: MemberIdSet,
    pub from: MemberId,
    pub service_id: u32,
    pub message_type: u16,
    pub part_index: u32,
    pub body: Bytes,
}

/// Address-routed packet for members without an id, always self-contained.
#[derive(Debug, Clone)]
pub struct BroadcastPacket {
    pub from: MemberId,
    pub service_id: u32,
    pub message_type: u16,
    pub addresses: Vec<SocketAddr>,
    pub body: Bytes,
}

impl Packet {
    pub fn header_length(&self) -> usize {
        match self {
            Packet::Directed(p) => directed_header_length(p.to.len()),
            Packet::Sequel(p) => sequel_header_length(p.to.len()),
            Packet::Broadcast(_) => BROADCAST_HEADER_LEN,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Packet::Directed(p) => &p.body,
            Packet::Sequel(p) => &p.body,
            Packet::Broadcast(p) => &p.body,
        }
    }

    pub fn length(&self) -> usize {
        self.header_length() + self.body().len()
    }
}

pub fn directed_header_length(recipients: usize) -> usize {
    DIRECTED_HEADER_BASE + 2 * recipients
}

pub fn sequel_header_length(recipients: usize) -> usize {
    SEQUEL_HEADER_BASE + 2 * recipients
}

/// Body bytes that fit in one packet with the given header. The preferred
/// length bounds packets under the common MTU; a header too large for it
/// falls back to the transport maximum.
pub fn calc_body_length(header_length: usize, preferred: usize, max: usize) -> usize {
    let packet_length = if preferred <= header_length {
        max
    } else {
        preferred
    };
    packet_length - header_length
}

/// Split a serialized message body into a directed head packet and as many
/// sequel packets as the body needs. An empty recipient set yields no
/// packets.
pub fn packetize(
    to: &MemberIdSet,
    from: MemberId,
    service_id: u32,
    message_type: u16,
    mut body: Bytes,
    preferred: usize,
    max: usize,
) -> Vec<Packet> {
    if to.is_empty() {
        return Vec::new();
    }
    let head_body = calc_body_length(directed_header_length(to.len()), preferred, max);
    let sequel_body = calc_body_length(sequel_header_length(to.len()), preferred, max);
    let head_len = body.len().min(head_body);
    let tail_len = body.len() - head_len;
    let part_count = 1 + tail_len.div_ceil(sequel_body) as u32;

    let mut packets = Vec::with_capacity(part_count as usize);
    packets.push(Packet::Directed(DirectedPacket {
        to: to.clone(),
        from,
        service_id,
        message_type,
        part_count,
        body: body.split_to(head_len),
    }));
    let mut part_index = 1;
    while !body.is_empty() {
        let chunk = body.len().min(sequel_body);
        packets.push(Packet::Sequel(SequelPacket {
            to: to.clone(),
            from,
            service_id,
            message_type,
            part_index,
            body: body.split_to(chunk),
        }));
        part_index += 1;
    }
    packets
}
