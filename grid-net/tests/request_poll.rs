use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use grid_core::ext::init_logger;
use grid_core::time::safe_time_millis;
use grid_net::message::request::RequestMessage;
use grid_net::message::response::ResponseMessage;
use grid_net::packet::Packet;
use grid_net::transport::Transport;
use grid_net::{GridConfig, GridError, GridService, Member, MemberId, MemberIdSet};

#[ctor::ctor]
fn init() {
    init_logger(tracing::Level::DEBUG);
}

struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn send_packets(&self, _packets: &[Packet]) -> anyhow::Result<()> {
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

fn three_member_service() -> GridService {
    three_member_service_with(GridConfig::default())
}

fn three_member_service_with(config: GridConfig) -> GridService {
    let service = GridService::new("Dist", 7, config, Arc::new(LoopbackTransport));
    for id in 1..=3 {
        service.membership().add(member(id));
        service
            .membership()
            .set_join_time(MemberId(id), 100 * id as u64);
        service.membership().set_joined(MemberId(id));
    }
    service.membership().set_this_member(MemberId(1));
    service.start();
    service
}

#[tokio::test]
async fn test_poll_completes_when_all_recipients_accounted() -> anyhow::Result<()> {
    let service = Arc::new(three_member_service());
    let mut request = RequestMessage::new(
        1,
        [MemberId(2), MemberId(3)].into_iter().collect(),
        Bytes::from_static(b"ping"),
    );
    let poll = service.send_request(&mut request)?;
    let deadline = safe_time_millis() + 5_000;

    let driver = service.clone();
    let poll_id = poll.id();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        driver.member_left(MemberId(3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        driver.on_response(&ResponseMessage {
            message_type: 2,
            to_members: MemberIdSet::singleton(MemberId(1)),
            from_member: MemberId(2),
            to_poll_id: poll_id,
            payload: Bytes::from_static(b"pong"),
        });
    });

    let start = safe_time_millis();
    let outcome = poll.wait_completion(deadline).await?;
    // completes as soon as both recipients are accounted for, well before
    // the deadline
    assert!(safe_time_millis() - start < 1_000);
    assert_eq!(outcome.result, Some(Bytes::from_static(b"pong")));
    assert!(outcome.responded.contains(MemberId(2)));
    assert!(outcome.left.contains(MemberId(3)));
    assert_eq!(service.open_poll_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_request_one_reports_departed_recipient() {
    let service = Arc::new(three_member_service());
    let leaver = service.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        leaver.member_left(MemberId(2));
    });
    let request = RequestMessage::new(1, MemberIdSet::new(), Bytes::from_static(b"ping"));
    match service.request_one(MemberId(2), request).await {
        Err(GridError::RecipientGone { member_id }) => assert_eq!(member_id, MemberId(2)),
        other => panic!("expected recipient-gone error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unanswered_poll_times_out_and_is_abandoned() {
    let service = three_member_service();
    let mut request = RequestMessage::new(
        1,
        MemberIdSet::singleton(MemberId(2)),
        Bytes::from_static(b"ping"),
    );
    let poll = service.send_request(&mut request).unwrap();
    assert_eq!(service.open_poll_count(), 1);
    let deadline = safe_time_millis() + 30;
    match poll.wait_completion(deadline).await {
        Err(GridError::Timeout { overdue_ms: _ }) => {}
        other => panic!("expected timeout, got {:?}", other),
    }
    // the timeout closed the poll; abandoning it empties the registry
    assert!(poll.is_closed());
    service.close_poll(poll.id());
    assert_eq!(service.open_poll_count(), 0);
}

#[tokio::test]
async fn test_request_one_timeout_leaves_no_poll_behind() {
    let service = three_member_service_with(GridConfig {
        request_timeout_ms: 30,
        ..GridConfig::default()
    });
    let request = RequestMessage::new(1, MemberIdSet::new(), Bytes::from_static(b"ping"));
    match service.request_one(MemberId(2), request).await {
        Err(GridError::Timeout { overdue_ms: _ }) => {}
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(service.open_poll_count(), 0);
}

#[tokio::test]
async fn test_stop_fails_waiting_polls() {
    let service = Arc::new(three_member_service());
    let mut request = RequestMessage::new(
        1,
        MemberIdSet::singleton(MemberId(2)),
        Bytes::from_static(b"ping"),
    );
    let poll = service.send_request(&mut request).unwrap();

    let stopper = service.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stopper.stop();
    });

    match poll.wait_completion(0).await {
        Err(GridError::ServiceStopping) => {}
        other => panic!("expected stopping error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_resent_request_keeps_original_deadline() {
    let service = three_member_service();
    let mut request = RequestMessage::new(
        1,
        MemberIdSet::singleton(MemberId(2)),
        Bytes::from_static(b"ping"),
    );
    service.send_request(&mut request).unwrap();
    let deadline = request.deadline();
    assert!(deadline > 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut resend = request.clone_message();
    let poll = service.send_request(&mut resend).unwrap();
    assert_eq!(resend.deadline(), deadline);
    // the resend runs under a fresh poll
    assert_ne!(resend.from_poll_id, request.from_poll_id);
    assert_eq!(poll.id(), resend.from_poll_id);
}
