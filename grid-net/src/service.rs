use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tracing::{debug, trace};

use grid_core::{GridConfig, GridError, Member, MemberId, Result};

use crate::buffer::BufferController;
use crate::member_set::MemberIdSet;
use crate::membership::ServiceMembership;
use crate::message::discovery::DiscoveryMessage;
use crate::message::request::RequestMessage;
use crate::message::response::ResponseMessage;
use crate::message::{Message, MessageHeader};
use crate::packet;
use crate::poll::{Poll, POLL_ID_GUARD, POLL_ID_MASK};
use crate::transport::Transport;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServiceState {
    Starting = 0,
    Started = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(state: u8) -> ServiceState {
        match state {
            0 => ServiceState::Starting,
            1 => ServiceState::Started,
            2 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

/// One clustered service instance: its member directory, its outstanding
/// polls and the transport it sends through. Requests are correlated to
/// responses by poll id; a departed member settles its share of every open
/// poll so no request waits on a ghost.
pub struct GridService {
    name: String,
    id: u32,
    config: GridConfig,
    membership: ServiceMembership,
    transport: Arc<dyn Transport>,
    polls: DashMap<u64, Arc<Poll>>,
    next_poll_id: AtomicU64,
    state: AtomicU8,
}

impl GridService {
    pub fn new(
        name: impl Into<String>,
        id: u32,
        config: GridConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let name = name.into();
        GridService {
            membership: ServiceMembership::new(name.clone()),
            name,
            id,
            config,
            transport,
            polls: DashMap::new(),
            next_poll_id: AtomicU64::new(1),
            state: AtomicU8::new(ServiceState::Starting as u8),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn membership(&self) -> &ServiceMembership {
        &self.membership
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self.state(), ServiceState::Stopping | ServiceState::Stopped)
    }

    pub fn start(&self) {
        debug!("service {} started", self.name);
        self.state
            .store(ServiceState::Started as u8, Ordering::Release);
    }

    /// Stop the service. Every open poll fails with `ServiceStopping` so no
    /// waiter hangs on a service that will never deliver.
    pub fn stop(&self) {
        debug!("service {} stopping", self.name);
        self.state
            .store(ServiceState::Stopping as u8, Ordering::Release);
        let ids: Vec<u64> = self.polls.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, poll)) = self.polls.remove(&id) {
                poll.on_exception(GridError::ServiceStopping);
            }
        }
        self.state
            .store(ServiceState::Stopped as u8, Ordering::Release);
    }

    pub fn open_poll_count(&self) -> usize {
        self.polls.len()
    }

    pub fn poll(&self, id: u64) -> Option<Arc<Poll>> {
        self.polls.get(&id).map(|entry| entry.value().clone())
    }

    /// Abandon a poll: drop it from the registry and close it if it is still
    /// open. Callers that wait on a poll themselves use this after a timeout
    /// so an abandoned poll does not linger in the registry.
    pub fn close_poll(&self, id: u64) -> Option<Arc<Poll>> {
        let removed = self.polls.remove(&id).map(|(_, poll)| poll);
        if let Some(poll) = &removed {
            poll.close();
        }
        removed
    }

    /// Send a request and return the poll tracking it. The poll settles as
    /// recipients respond or leave; recipients already gone at send time are
    /// accounted for immediately.
    pub fn send_request(&self, request: &mut RequestMessage) -> Result<Arc<Poll>> {
        if self.is_stopping() {
            return Err(GridError::ServiceStopping);
        }
        if let Some(this) = self.membership.this_member() {
            request.from_member = this.id;
        }
        request.ensure_deadline(&self.config);
        let poll = self.ensure_poll(request);

        if request.to_members.is_empty() {
            poll.close();
            self.polls.remove(&poll.id());
            return Ok(poll);
        }
        let live: MemberIdSet = request
            .to_members
            .iter()
            .filter(|id| self.membership.contains(*id))
            .collect();
        for gone in request.to_members.iter().filter(|id| !live.contains(*id)) {
            trace!("poll {} recipient {} already departed", poll.id(), gone);
            poll.on_left(gone);
        }
        if live.is_empty() {
            // nothing reaches the wire, so the delivery gate is trivially
            // satisfied and must not hold the poll open
            poll.on_delivery();
            self.polls.remove(&poll.id());
            return Ok(poll);
        }

        let header = MessageHeader {
            service_id: self.id,
            message_type: request.message_type,
            from_member: request.from_member,
            from_poll_id: request.from_poll_id,
            to_poll_id: 0,
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        request.write_body(&mut buf);
        let controller = BufferController::new(buf.freeze());
        let packets = packet::packetize(
            &live,
            request.from_member,
            self.id,
            request.message_type,
            controller.share(),
            self.config.preferred_packet_length,
            self.config.max_packet_length,
        );
        let sent = self.transport.send_packets(&packets);
        controller.dispose();
        if let Err(error) = sent {
            let reason = error.to_string();
            poll.on_exception(GridError::Transport {
                reason: reason.clone(),
            });
            self.polls.remove(&poll.id());
            return Err(GridError::Transport { reason });
        }
        if request.notify_delivery {
            poll.on_delivery();
        }
        Ok(poll)
    }

    /// Send a message that expects no response; no poll is created.
    pub fn post<M: Message>(&self, to: &MemberIdSet, message: &M) -> Result<()> {
        self.post_with_correlation(to, message, 0)
    }

    /// Send a response back into the requestor's poll.
    pub fn post_response(&self, response: &ResponseMessage) -> Result<()> {
        self.post_with_correlation(&response.to_members, response, response.to_poll_id)
    }

    fn post_with_correlation<M: Message>(
        &self,
        to: &MemberIdSet,
        message: &M,
        to_poll_id: u64,
    ) -> Result<()> {
        if self.is_stopping() {
            return Err(GridError::ServiceStopping);
        }
        let from_member = self
            .membership
            .this_member()
            .map(|m| m.id)
            .unwrap_or(MemberId::INVALID);
        let live: MemberIdSet = to
            .iter()
            .filter(|id| self.membership.contains(*id))
            .collect();
        if live.is_empty() {
            return Ok(());
        }
        let header = MessageHeader {
            service_id: self.id,
            message_type: message.message_type(),
            from_member,
            from_poll_id: 0,
            to_poll_id,
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        message.write_body(&mut buf);
        let controller = BufferController::new(buf.freeze());
        let packets = packet::packetize(
            &live,
            from_member,
            self.id,
            message.message_type(),
            controller.share(),
            self.config.preferred_packet_length,
            self.config.max_packet_length,
        );
        let sent = self.transport.send_packets(&packets);
        controller.dispose();
        sent.map_err(|error| GridError::Transport {
            reason: error.to_string(),
        })
    }

    /// Send a discovery message through the transport; no poll is involved.
    pub fn send_discovery(&self, message: &DiscoveryMessage) -> Result<()> {
        if self.is_stopping() {
            return Err(GridError::ServiceStopping);
        }
        let packets = message.packetize(self.id, &self.config)?;
        self.transport
            .send_packets(&packets)
            .map_err(|error| GridError::Transport {
                reason: error.to_string(),
            })
    }

    /// Send a request to a single member and wait for its answer. A
    /// recipient that leaves before answering is an error here, not a
    /// silently settled poll.
    pub async fn request_one(
        &self,
        member_id: MemberId,
        mut request: RequestMessage,
    ) -> Result<Bytes> {
        request.to_members = MemberIdSet::singleton(member_id);
        let poll = self.send_request(&mut request)?;
        let waited = poll.wait_completion(request.deadline()).await;
        // wait_completion only returns on a closed poll
        self.close_poll(poll.id());
        let outcome = waited?;
        match outcome.result {
            Some(payload) => Ok(payload),
            None => Err(GridError::RecipientGone { member_id }),
        }
    }

    /// Admit a received request for processing. A stopping service refuses
    /// it so the sender's poll settles with an error instead of silence.
    pub fn on_request(&self, request: &RequestMessage) -> Result<()> {
        request.on_received(self)
    }

    /// Route a received response into the poll it answers. Responses to
    /// unknown or already-closed polls are dropped.
    pub fn on_response(&self, response: &ResponseMessage) {
        if response.to_poll_id == 0 {
            return;
        }
        let Some(poll) = self.poll(response.to_poll_id) else {
            trace!(
                "service {} dropped response to unknown poll {}",
                self.name,
                response.to_poll_id
            );
            return;
        };
        poll.on_response(response.from_member, response.payload.clone());
        if poll.is_closed() {
            self.polls.remove(&poll.id());
        }
    }

    /// A member left the service: drop it from the directory and settle its
    /// share of every open poll.
    pub fn member_left(&self, id: MemberId) -> Option<Arc<Member>> {
        let departed = self.membership.remove(id);
        let mut closed = Vec::new();
        for entry in self.polls.iter() {
            entry.value().on_left(id);
            if entry.value().is_closed() {
                closed.push(*entry.key());
            }
        }
        for key in closed {
            self.polls.remove(&key);
        }
        departed
    }

    fn ensure_poll(&self, request: &mut RequestMessage) -> Arc<Poll> {
        if request.from_poll_id != 0 {
            if let Some(poll) = self.poll(request.from_poll_id) {
                return poll;
            }
        }
        let id = self.allocate_poll_id();
        let poll = Arc::new(Poll::new(
            id,
            request.to_members.clone(),
            request.notify_delivery,
        ));
        self.polls.insert(id, poll.clone());
        request.from_poll_id = id;
        poll
    }

    /// Poll ids live in a 24 bit space above the guard bit; an id still held
    /// by an open poll is skipped rather than reused.
    fn allocate_poll_id(&self) -> u64 {
        loop {
            let low = self.next_poll_id.fetch_add(1, Ordering::AcqRel) & POLL_ID_MASK;
            if low == 0 {
                continue;
            }
            let id = POLL_ID_GUARD | low;
            if !self.polls.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::member_set::MemberIdSet;
    use crate::packet::Packet;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Packet>>,
        fail: bool,
    }

    impl Transport for RecordingTransport {
        fn send_packets(&self, packets: &[Packet]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("socket closed");
            }
            self.sent.lock().extend_from_slice(packets);
            Ok(())
        }
    }

    fn member(id: u16) -> Arc<Member> {
        Arc::new(
            Member::builder()
                .id(MemberId(id))
                .cluster_name("grid")
                .socket_addr(format!("127.0.0.1:{}", 7000 + id).parse().unwrap())
                .machine_id(id as u32)
                .build(),
        )
    }

    fn service(transport: Arc<RecordingTransport>) -> GridService {
        let service = GridService::new("Dist", 7, GridConfig::default(), transport);
        for id in 1..=3 {
            service.membership().add(member(id));
            service
                .membership()
                .set_join_time(MemberId(id), 100 * id as u64);
        }
        service.membership().set_this_member(MemberId(1));
        service.start();
        service
    }

    #[test]
    fn test_request_stamps_poll_and_sends() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport.clone());
        let mut request = RequestMessage::new(
            1,
            [MemberId(2), MemberId(3)].into_iter().collect(),
            Bytes::from_static(b"ping"),
        );
        let poll = service.send_request(&mut request).unwrap();
        assert_eq!(request.from_poll_id, poll.id());
        assert_eq!(request.from_member, MemberId(1));
        assert_ne!(poll.id() & POLL_ID_GUARD, 0);
        assert_eq!(poll.outstanding(), 2);
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(service.open_poll_count(), 1);
    }

    #[test]
    fn test_departed_recipient_settled_at_send() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport.clone());
        let mut request = RequestMessage::new(
            1,
            [MemberId(2), MemberId(9)].into_iter().collect(),
            Bytes::new(),
        );
        let poll = service.send_request(&mut request).unwrap();
        assert_eq!(poll.outstanding(), 1);
        // only the live recipient appears on the wire
        match &transport.sent.lock()[0] {
            Packet::Directed(p) => assert_eq!(p.to, MemberIdSet::singleton(MemberId(2))),
            other => panic!("expected directed packet, got {:?}", other),
        };
    }

    #[test]
    fn test_empty_recipients_close_immediately() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport.clone());
        let mut request = RequestMessage::new(1, MemberIdSet::new(), Bytes::new());
        let poll = service.send_request(&mut request).unwrap();
        assert!(poll.is_closed());
        assert!(transport.sent.lock().is_empty());
        assert_eq!(service.open_poll_count(), 0);
    }

    #[test]
    fn test_delivery_gate_releases_when_all_recipients_departed() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport.clone());
        let mut request = RequestMessage::new(1, MemberIdSet::singleton(MemberId(9)), Bytes::new())
            .with_delivery_notification();
        let poll = service.send_request(&mut request).unwrap();
        // nothing was sent, so the delivery gate must not keep the poll open
        assert!(poll.is_closed());
        assert_eq!(poll.outstanding(), 0);
        assert!(transport.sent.lock().is_empty());
        assert_eq!(service.open_poll_count(), 0);
    }

    #[test]
    fn test_close_poll_abandons_registered_poll() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport);
        let mut request =
            RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        let poll = service.send_request(&mut request).unwrap();
        assert_eq!(service.open_poll_count(), 1);
        let abandoned = service.close_poll(poll.id()).unwrap();
        assert!(abandoned.is_closed());
        assert_eq!(service.open_poll_count(), 0);
        assert!(service.close_poll(poll.id()).is_none());
    }

    #[test]
    fn test_response_routes_into_poll() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport);
        let mut request =
            RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        let poll = service.send_request(&mut request).unwrap();

        let response = ResponseMessage {
            message_type: 2,
            to_members: MemberIdSet::singleton(MemberId(1)),
            from_member: MemberId(2),
            to_poll_id: poll.id(),
            payload: Bytes::from_static(b"pong"),
        };
        service.on_response(&response);

        assert!(poll.is_closed());
        assert_eq!(service.open_poll_count(), 0);
    }

    #[test]
    fn test_post_response_targets_requestor_poll() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport.clone());
        let mut request = RequestMessage::new(1, MemberIdSet::new(), Bytes::from_static(b"ping"));
        request.from_member = MemberId(2);
        request.from_poll_id = POLL_ID_GUARD | 3;
        let response = ResponseMessage::respond_to(2, &request, Bytes::from_static(b"pong"));
        service.post_response(&response).unwrap();
        match &transport.sent.lock()[0] {
            Packet::Directed(p) => {
                assert_eq!(p.to, MemberIdSet::singleton(MemberId(2)));
                assert_eq!(p.from, MemberId(1));
            }
            other => panic!("expected directed packet, got {:?}", other),
        };
    }

    #[test]
    fn test_member_left_settles_open_polls() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport);
        let mut request =
            RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        let poll = service.send_request(&mut request).unwrap();
        assert!(poll.is_open());
        service.member_left(MemberId(2));
        assert!(poll.is_closed());
        assert!(!service.membership().contains(MemberId(2)));
        assert_eq!(service.open_poll_count(), 0);
    }

    #[test]
    fn test_transport_failure_fails_the_poll() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let service = service(transport);
        let mut request =
            RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        match service.send_request(&mut request) {
            Err(GridError::Transport { reason }) => assert!(reason.contains("socket closed")),
            other => panic!("expected transport error, got {:?}", other),
        }
        assert_eq!(service.open_poll_count(), 0);
    }

    #[test]
    fn test_stopping_rejects_new_requests() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport);
        let mut request =
            RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        let poll = service.send_request(&mut request).unwrap();
        service.stop();
        assert!(poll.is_closed());

        let mut next = RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        assert!(matches!(
            service.send_request(&mut next),
            Err(GridError::ServiceStopping)
        ));
        // and incoming requests are refused too
        assert!(matches!(
            service.on_request(&next),
            Err(GridError::ServiceStopping)
        ));
    }

    #[test]
    fn test_poll_ids_skip_zero_and_live_ids() {
        let transport = Arc::new(RecordingTransport::default());
        let service = service(transport);
        service.next_poll_id.store(POLL_ID_MASK, Ordering::Release);
        let mut request =
            RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        let poll = service.send_request(&mut request).unwrap();
        // the counter wrapped through 0 without handing it out
        assert_eq!(poll.id() & POLL_ID_MASK, POLL_ID_MASK);
        let mut next = RequestMessage::new(1, MemberIdSet::singleton(MemberId(2)), Bytes::new());
        let second = service.send_request(&mut next).unwrap();
        assert_eq!(second.id() & POLL_ID_MASK, 1);
    }
}
