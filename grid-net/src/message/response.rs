use bytes::{BufMut, Bytes, BytesMut};

use grid_core::{MemberId, Result};

use crate::member_set::MemberIdSet;
use crate::message::request::RequestMessage;
use crate::message::{Message, MessageHeader};

/// Answer to a [`RequestMessage`]. Addressing is derived from the request:
/// back to the requestor, into the requestor's poll.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub message_type: u16,
    pub to_members: MemberIdSet,
    pub from_member: MemberId,
    pub to_poll_id: u64,
    pub payload: Bytes,
}

impl ResponseMessage {
    pub fn respond_to(message_type: u16, request: &RequestMessage, payload: Bytes) -> Self {
        ResponseMessage {
            message_type,
            to_members: MemberIdSet::singleton(request.from_member),
            from_member: MemberId::INVALID,
            to_poll_id: request.from_poll_id,
            payload,
        }
    }
}

impl Message for ResponseMessage {
    fn message_type(&self) -> u16 {
        self.message_type
    }

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.payload);
    }

    fn read_body(header: &MessageHeader, src: &mut Bytes) -> Result<Self> {
        let payload = src.split_to(src.len());
        Ok(ResponseMessage {
            message_type: header.message_type,
            to_members: MemberIdSet::new(),
            from_member: header.from_member,
            to_poll_id: header.to_poll_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::poll::POLL_ID_GUARD;

    use super::*;

    #[test]
    fn test_respond_to_addresses_the_requestor() {
        let mut request = RequestMessage::new(
            1,
            MemberIdSet::singleton(MemberId(9)),
            Bytes::from_static(b"ping"),
        );
        request.from_member = MemberId(4);
        request.from_poll_id = POLL_ID_GUARD | 7;

        let response = ResponseMessage::respond_to(2, &request, Bytes::from_static(b"pong"));
        assert_eq!(response.to_members, MemberIdSet::singleton(MemberId(4)));
        assert_eq!(response.to_poll_id, POLL_ID_GUARD | 7);
        assert_eq!(response.payload, Bytes::from_static(b"pong"));
    }
}
