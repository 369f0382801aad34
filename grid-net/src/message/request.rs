use bytes::{BufMut, Bytes, BytesMut};

use grid_core::time::safe_time_millis;
use grid_core::{GridConfig, GridError, MemberId, Result};

use crate::member_set::MemberIdSet;
use crate::message::{Message, MessageHeader};
use crate::poll::check_timeout_remaining;
use crate::service::GridService;

/// A message that expects an answer from each recipient, correlated through
/// the sender's poll. The timeout deadline is computed once at first send
/// and then carried verbatim, so a resent request keeps the original
/// deadline instead of restarting the clock.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub message_type: u16,
    pub to_members: MemberIdSet,
    pub from_member: MemberId,
    pub from_poll_id: u64,
    pub request_context: Option<Bytes>,
    pub payload: Bytes,
    pub notify_delivery: bool,
    request_timeout_deadline: u64,
}

impl RequestMessage {
    pub fn new(message_type: u16, to_members: MemberIdSet, payload: Bytes) -> Self {
        RequestMessage {
            message_type,
            to_members,
            from_member: MemberId::INVALID,
            from_poll_id: 0,
            request_context: None,
            payload,
            notify_delivery: false,
            request_timeout_deadline: 0,
        }
    }

    pub fn with_context(mut self, context: Bytes) -> Self {
        self.request_context = Some(context);
        self
    }

    pub fn with_delivery_notification(mut self) -> Self {
        self.notify_delivery = true;
        self
    }

    /// Fix the timeout deadline from the service configuration. The first
    /// call computes it; later calls return the cached value. A service
    /// configured without a timeout leaves the deadline at 0.
    pub fn ensure_deadline(&mut self, config: &GridConfig) -> u64 {
        if self.request_timeout_deadline == 0 {
            if let Some(timeout) = config.request_timeout() {
                self.request_timeout_deadline = safe_time_millis() + timeout.as_millis() as u64;
            }
        }
        self.request_timeout_deadline
    }

    pub fn deadline(&self) -> u64 {
        self.request_timeout_deadline
    }

    /// Milliseconds left on the request, or a `Timeout` error once the
    /// deadline has elapsed.
    pub fn check_timeout(&self) -> Result<u64> {
        check_timeout_remaining(self.request_timeout_deadline)
    }

    /// A copy suitable for resending: same body, context, recipients and
    /// deadline, but detached from the original poll.
    pub fn clone_message(&self) -> RequestMessage {
        RequestMessage {
            message_type: self.message_type,
            to_members: self.to_members.clone(),
            from_member: self.from_member,
            from_poll_id: 0,
            request_context: self.request_context.clone(),
            payload: self.payload.clone(),
            notify_delivery: self.notify_delivery,
            request_timeout_deadline: self.request_timeout_deadline,
        }
    }
}

impl Message for RequestMessage {
    fn message_type(&self) -> u16 {
        self.message_type
    }

    fn write_body(&self, dst: &mut BytesMut) {
        match &self.request_context {
            Some(context) => {
                dst.put_u8(1);
                dst.put_u32(context.len() as u32);
                dst.put_slice(context);
            }
            None => dst.put_u8(0),
        }
        dst.put_u8(self.notify_delivery as u8);
        dst.put_slice(&self.payload);
    }

    fn read_body(header: &MessageHeader, src: &mut Bytes) -> Result<Self> {
        let request_context = match grid_core::ext::read_u8(src)? {
            0 => None,
            1 => {
                let len = grid_core::ext::read_u32(src)? as usize;
                Some(grid_core::ext::read_bytes(src, len)?)
            }
            tag => return Err(GridError::mismatch(format!("bad context tag {}", tag))),
        };
        let notify_delivery = grid_core::ext::read_u8(src)? != 0;
        let payload = src.split_to(src.len());
        Ok(RequestMessage {
            message_type: header.message_type,
            to_members: MemberIdSet::new(),
            from_member: header.from_member,
            from_poll_id: header.from_poll_id,
            request_context,
            payload,
            notify_delivery,
            request_timeout_deadline: 0,
        })
    }

    fn on_received(&self, service: &GridService) -> Result<()> {
        if service.is_stopping() {
            Err(GridError::ServiceStopping)
        } else {
            Ok(())
        }
    }
}
