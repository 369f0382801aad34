use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use grid_core::ext::{read_bytes, read_u32, read_u8};
use grid_core::{GridConfig, GridError, Member, Result};

use crate::buffer::BufferController;
use crate::member_set::MemberIdSet;
use crate::message::{
    ensure_eos, read_member, read_socket_addr, write_member, write_socket_addr, Message,
    MessageHeader,
};
use crate::packet::{self, BroadcastPacket, Packet, BROADCAST_HEADER_LEN};

/// A message exchanged before (or while) the sender knows the recipient by
/// member id: cluster discovery, join negotiation, heartbeats across the
/// cluster boundary. It carries the sender's full identity because the
/// recipient may have no directory entry to resolve an id against.
#[derive(Debug, Clone)]
pub struct DiscoveryMessage {
    pub message_type: u16,
    pub from_member: Member,
    /// Intended recipient, when known by identity but not yet by id.
    pub to_member: Option<Member>,
    /// Recipients known by id; when non-empty the message is sent directed
    /// instead of broadcast.
    pub to_member_set: MemberIdSet,
    /// Advertised return address when the sender sits behind NAT.
    pub external_address: Option<SocketAddr>,
    /// Where the datagram actually came from; filled in on receive, never
    /// serialized.
    pub source_address: Option<SocketAddr>,
    pub payload: Bytes,
}

impl DiscoveryMessage {
    pub fn new(message_type: u16, from_member: Member, payload: Bytes) -> Self {
        DiscoveryMessage {
            message_type,
            from_member,
            to_member: None,
            to_member_set: MemberIdSet::new(),
            external_address: None,
            source_address: None,
            payload,
        }
    }

    /// Decode a received datagram. The transport-level sender address
    /// becomes the source address, since discovery senders often cannot
    /// know the address they will appear to come from.
    pub fn read_datagram(header: &MessageHeader, src: &mut Bytes, sender: SocketAddr) -> Result<Self> {
        let mut message = Self::read_body(header, src)?;
        ensure_eos(src)?;
        message.source_address = Some(sender);
        Ok(message)
    }

    /// Turn the message into transport packets. With recipients known by id
    /// this is ordinary packetization; otherwise the whole message must fit
    /// one broadcast packet, addressed to the known identity and the
    /// advertised external address.
    pub fn packetize(&self, service_id: u32, config: &GridConfig) -> Result<Vec<Packet>> {
        let mut buf = BytesMut::new();
        self.write_body(&mut buf);
        let controller = BufferController::new(buf.freeze());

        if !self.to_member_set.is_empty() {
            let packets = packet::packetize(
                &self.to_member_set,
                self.from_member.id,
                service_id,
                self.message_type,
                controller.share(),
                config.preferred_packet_length,
                config.max_packet_length,
            );
            controller.dispose();
            return Ok(packets);
        }

        let limit = config.max_packet_length - BROADCAST_HEADER_LEN;
        if controller.len() > limit {
            let size = controller.len();
            controller.dispose();
            return Err(GridError::OversizeBroadcast { size, limit });
        }
        // private copy; broadcast packets may outlive the message buffer
        let body = controller.detach();
        controller.dispose();

        let mut addresses = Vec::with_capacity(2);
        if let Some(to) = &self.to_member {
            addresses.push(to.socket_addr);
        }
        if let Some(external) = self.external_address {
            if !addresses.contains(&external) {
                addresses.push(external);
            }
        }
        Ok(vec![Packet::Broadcast(BroadcastPacket {
            from: self.from_member.id,
            service_id,
            message_type: self.message_type,
            addresses,
            body,
        })])
    }
}

impl Message for DiscoveryMessage {
    fn message_type(&self) -> u16 {
        self.message_type
    }

    fn write_body(&self, dst: &mut BytesMut) {
        write_member(dst, &self.from_member);
        match &self.to_member {
            Some(member) => {
                dst.put_u8(1);
                write_member(dst, member);
            }
            None => dst.put_u8(0),
        }
        match &self.external_address {
            Some(addr) => {
                dst.put_u8(1);
                write_socket_addr(dst, addr);
            }
            None => dst.put_u8(0),
        }
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    fn read_body(header: &MessageHeader, src: &mut Bytes) -> Result<Self> {
        let from_member = read_member(src)?;
        let to_member = match read_u8(src)? {
            0 => None,
            1 => Some(read_member(src)?),
            tag => return Err(GridError::mismatch(format!("bad member tag {}", tag))),
        };
        let external_address = match read_u8(src)? {
            0 => None,
            1 => Some(read_socket_addr(src)?),
            tag => return Err(GridError::mismatch(format!("bad address tag {}", tag))),
        };
        let payload_len = read_u32(src)? as usize;
        let payload = read_bytes(src, payload_len)?;
        Ok(DiscoveryMessage {
            message_type: header.message_type,
            from_member,
            to_member,
            to_member_set: MemberIdSet::new(),
            external_address,
            source_address: None,
            payload,
        })
    }
}
