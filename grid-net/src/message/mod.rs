use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use grid_core::ext::{read_bytes, read_u16, read_u32, read_u8};
use grid_core::{Edition, GridError, Member, MemberId, Result};

use crate::poll::{decode_wire_id, encode_wire_id};
use crate::service::GridService;

pub mod discovery;
pub mod request;
pub mod response;

const ADDR_TAG_V4: u8 = 4;
const ADDR_TAG_V6: u8 = 6;

/// A message that can travel between service members. The body codec is
/// symmetric: `write_body` produces exactly the bytes `read_body` consumes,
/// with the routing fields living in the [`MessageHeader`] instead.
pub trait Message {
    fn message_type(&self) -> u16;

    fn write_body(&self, dst: &mut BytesMut);

    fn read_body(header: &MessageHeader, src: &mut Bytes) -> Result<Self>
    where
        Self: Sized;

    /// Hook run on the receiving service before the message is processed.
    fn on_received(&self, _service: &GridService) -> Result<()> {
        Ok(())
    }
}

/// Routing envelope common to every message: which service instance it
/// belongs to, who sent it, and the poll correlation ids. A poll id of 0
/// means "no poll".
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub service_id: u32,
    pub message_type: u16,
    pub from_member: MemberId,
    pub from_poll_id: u64,
    pub to_poll_id: u64,
}

impl MessageHeader {
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u32(self.service_id);
        dst.put_u16(self.message_type);
        dst.put_u16(self.from_member.0);
        write_poll_id(dst, self.from_poll_id);
        write_poll_id(dst, self.to_poll_id);
    }

    pub fn read(src: &mut Bytes) -> Result<MessageHeader> {
        let service_id = read_u32(src)?;
        let message_type = read_u16(src)?;
        let from_member = MemberId(read_u16(src)?);
        let from_poll_id = read_poll_id(src)?;
        let to_poll_id = read_poll_id(src)?;
        Ok(MessageHeader {
            service_id,
            message_type,
            from_member,
            from_poll_id,
            to_poll_id,
        })
    }
}

fn write_poll_id(dst: &mut BytesMut, id: u64) {
    if id == 0 {
        dst.put_u8(0);
    } else {
        dst.put_u8(1);
        dst.put_u32(encode_wire_id(id));
    }
}

fn read_poll_id(src: &mut Bytes) -> Result<u64> {
    match read_u8(src)? {
        0 => Ok(0),
        1 => Ok(decode_wire_id(read_u32(src)?)),
        tag => Err(GridError::mismatch(format!("bad poll id tag {}", tag))),
    }
}

/// Fail if the decoder left bytes unconsumed; trailing garbage means the
/// sender speaks a different protocol revision.
pub fn ensure_eos(src: &Bytes) -> Result<()> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(GridError::mismatch(format!(
            "{} trailing bytes after message body",
            src.len()
        )))
    }
}

pub fn write_socket_addr(dst: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            dst.put_u8(ADDR_TAG_V4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u8(ADDR_TAG_V6);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_u16(addr.port());
}

pub fn read_socket_addr(src: &mut Bytes) -> Result<SocketAddr> {
    let ip = match read_u8(src)? {
        ADDR_TAG_V4 => {
            let octets: [u8; 4] = read_bytes(src, 4)?.as_ref().try_into().unwrap();
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ADDR_TAG_V6 => {
            let octets: [u8; 16] = read_bytes(src, 16)?.as_ref().try_into().unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        tag => return Err(GridError::mismatch(format!("bad address tag {}", tag))),
    };
    let port = read_u16(src)?;
    Ok(SocketAddr::new(ip, port))
}

pub fn write_member(dst: &mut BytesMut, member: &Member) {
    dst.put_u16(member.id.0);
    dst.put_u16(member.cluster_name.len() as u16);
    dst.put_slice(member.cluster_name.as_bytes());
    write_socket_addr(dst, &member.socket_addr);
    dst.put_u8(member.edition.to_u8());
    dst.put_u32(member.machine_id);
}

pub fn read_member(src: &mut Bytes) -> Result<Member> {
    let id = MemberId(read_u16(src)?);
    let name_len = read_u16(src)? as usize;
    let cluster_name = String::from_utf8(read_bytes(src, name_len)?.to_vec())
        .map_err(|_| GridError::mismatch("cluster name is not utf-8"))?;
    let socket_addr = read_socket_addr(src)?;
    let edition = Edition::from_u8(read_u8(src)?)
        .ok_or_else(|| GridError::mismatch("unknown edition"))?;
    let machine_id = read_u32(src)?;
    Ok(Member::builder()
        .id(id)
        .cluster_name(cluster_name)
        .socket_addr(socket_addr)
        .edition(edition)
        .machine_id(machine_id)
        .build())
}
