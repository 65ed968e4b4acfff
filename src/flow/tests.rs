use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, timeout};

use super::*;
use crate::codec::PacketCodec;
use crate::config::ProtocolSettings;
use crate::packet::{
    Connect, ConnectAck, ConnectReturnCode, PacketType, PublishAck, PublishComplete,
    PublishReceived, PublishRelease, QoS, Subscribe, SubscribeReturnCode, TopicSubscription,
    Unsubscribe, UnsubscribeAck, Will,
};
use crate::persistence::{InMemoryRepository, RepositoryProvider};
use crate::session::{
    ClientSession, PendingAcknowledgement, PendingAcknowledgementKind, PendingMessage,
    PendingMessageStatus, RetainedMessage,
};
use crate::topic::MqttTopicEvaluator;
use crate::transport::{ByteChannel, PacketReader};

const LONG_WAIT: Duration = Duration::from_secs(600);

fn codec() -> Arc<PacketCodec> {
    Arc::new(PacketCodec::new(
        Arc::new(MqttTopicEvaluator::default()),
        u16::MAX as usize,
    ))
}

/// Channel under test, its reader and the raw peer end.
fn connection() -> (PacketChannel, PacketReader, ByteChannel) {
    let (local, peer) = ByteChannel::pair();
    let (channel, reader) = PacketChannel::open(local, codec());
    (channel, reader, peer)
}

async fn next_packet(peer: &mut ByteChannel) -> Packet {
    let bytes = peer.receive().await.expect("peer closed");
    codec().decode(&bytes).unwrap()
}

async fn try_next_packet(peer: &mut ByteChannel) -> Option<Packet> {
    match timeout(Duration::from_millis(200), peer.receive()).await {
        Ok(Some(bytes)) => Some(codec().decode(&bytes).unwrap()),
        _ => None,
    }
}

fn sessions_with(client_id: &str, clean: bool) -> SessionRepository {
    let sessions = SessionRepository::new(Arc::new(InMemoryRepository::new()));
    sessions.create(ClientSession::new(client_id, clean)).unwrap();
    sessions
}

#[derive(Default)]
struct Recorder {
    published: Mutex<Vec<(String, Publish)>>,
}

impl PublishDispatcher for Recorder {
    fn dispatch(&self, client_id: &str, publish: Publish) -> Result<()> {
        self.published.lock().push((client_id.to_string(), publish));
        Ok(())
    }
}

fn receiver(sessions: &SessionRepository, maximum_qos: QoS) -> (PublishReceiverFlow, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let sender = PublishSenderFlow::new(sessions.clone(), LONG_WAIT);
    let flow = PublishReceiverFlow::new(
        sessions.clone(),
        sender.acknowledger().clone(),
        maximum_qos,
        recorder.clone(),
    );
    (flow, recorder)
}

#[test]
fn test_keep_alive_limit_is_one_and_a_half_periods() {
    assert_eq!(keep_alive_limit(0), None);
    assert_eq!(keep_alive_limit(10), Some(Duration::from_secs(15)));
    assert_eq!(keep_alive_limit(1), Some(Duration::from_millis(1500)));
}

#[tokio::test]
async fn test_qos0_publish_is_sent_or_parked() {
    let sessions = sessions_with("c1", false);
    let sender = PublishSenderFlow::new(sessions.clone(), LONG_WAIT);
    let (channel, _reader, mut peer) = connection();

    let publish = Publish::new("a", QoS::AtMostOnce, None, b"x".to_vec());
    sender
        .send_publish("c1", publish.clone(), &channel, PendingMessageStatus::PendingToSend)
        .await
        .unwrap();
    assert_eq!(next_packet(&mut peer).await, publish.clone().into());
    assert!(sessions.get("c1").unwrap().pending_messages.is_empty());

    channel.close();
    sender
        .send_publish("c1", publish, &channel, PendingMessageStatus::PendingToSend)
        .await
        .unwrap();
    let pending = sessions.get("c1").unwrap().pending_messages;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, PendingMessageStatus::PendingToSend);
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_is_retried_until_acknowledged() {
    let wait_timeout = Duration::from_secs(5);
    let sessions = sessions_with("c1", false);
    let sender = PublishSenderFlow::new(sessions.clone(), wait_timeout);
    let (channel, _reader, mut peer) = connection();

    let publish = Publish::new("a/b", QoS::AtLeastOnce, Some(42), b"data".to_vec());
    let started = Instant::now();
    let task = {
        let sender = sender.clone();
        let channel = channel.clone();
        let publish = publish.clone();
        tokio::spawn(async move {
            sender
                .send_publish("c1", publish, &channel, PendingMessageStatus::PendingToSend)
                .await
        })
    };

    assert_eq!(next_packet(&mut peer).await, publish.clone().into());
    let pending = sessions.get("c1").unwrap().pending_messages;
    assert_eq!(pending[0].status, PendingMessageStatus::PendingToAcknowledge);

    let duplicate: Packet = publish.clone().with_duplicate(true).into();
    assert_eq!(next_packet(&mut peer).await, duplicate);
    assert_eq!(next_packet(&mut peer).await, duplicate);
    assert!(started.elapsed() <= wait_timeout * 2);

    let ack: Packet = PublishAck::new(42).into();
    channel.publish_inbound(ack.clone());
    sender.execute("c1", &ack, &channel).unwrap();
    task.await.unwrap().unwrap();
    assert!(sessions.get("c1").unwrap().pending_messages.is_empty());

    // nothing more once the ack arrived
    let quiet = timeout(wait_timeout * 4, peer.receive()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn test_qos1_publish_while_offline_is_kept_for_replay() {
    let sessions = sessions_with("c1", false);
    let sender = PublishSenderFlow::new(sessions.clone(), LONG_WAIT);
    let (channel, _reader, _peer) = connection();
    channel.close();

    let publish = Publish::new("a", QoS::AtLeastOnce, Some(3), Vec::new());
    sender
        .send_publish("c1", publish, &channel, PendingMessageStatus::PendingToSend)
        .await
        .unwrap();
    let pending = sessions.get("c1").unwrap().pending_messages;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, PendingMessageStatus::PendingToAcknowledge);
}

#[tokio::test]
async fn test_sender_reacts_to_acknowledgements() {
    let sessions = sessions_with("c1", false);
    let sender = PublishSenderFlow::new(sessions.clone(), LONG_WAIT);
    let (channel, _reader, mut peer) = connection();
    sessions
        .modify("c1", |session| {
            session.add_pending_message(PendingMessage::from_publish(
                &Publish::new("a", QoS::ExactlyOnce, Some(8), Vec::new()),
                PendingMessageStatus::PendingToAcknowledge,
            ))
        })
        .unwrap();

    sender
        .execute("c1", &PublishReceived::new(8).into(), &channel)
        .unwrap();
    assert_eq!(next_packet(&mut peer).await, PublishRelease::new(8).into());
    let session = sessions.get("c1").unwrap();
    assert!(session.pending_messages.is_empty());
    let release = PendingAcknowledgement::new(8, PendingAcknowledgementKind::PublishRelease);
    assert_eq!(session.pending_acknowledgements, vec![release]);

    sender
        .execute("c1", &PublishComplete::new(8).into(), &channel)
        .unwrap();
    assert!(sessions.get("c1").unwrap().pending_acknowledgements.is_empty());

    // unrelated packets are ignored
    sender.execute("c1", &Packet::PingResponse, &channel).unwrap();
}

#[tokio::test]
async fn test_receiver_acknowledges_by_qos() {
    let sessions = sessions_with("c1", true);
    let (flow, recorder) = receiver(&sessions, QoS::ExactlyOnce);
    let (channel, _reader, mut peer) = connection();

    flow.execute(
        "c1",
        Publish::new("a", QoS::AtMostOnce, None, b"0".to_vec()).into(),
        &channel,
    )
    .unwrap();
    flow.execute(
        "c1",
        Publish::new("a", QoS::AtLeastOnce, Some(1), b"1".to_vec()).into(),
        &channel,
    )
    .unwrap();
    assert_eq!(next_packet(&mut peer).await, PublishAck::new(1).into());
    assert_eq!(recorder.published.lock().len(), 2);
    assert!(try_next_packet(&mut peer).await.is_none());
}

#[tokio::test]
async fn test_receiver_downgrades_to_maximum_qos() {
    let sessions = sessions_with("c1", true);
    let (flow, recorder) = receiver(&sessions, QoS::AtMostOnce);
    let (channel, _reader, mut peer) = connection();

    flow.execute(
        "c1",
        Publish::new("a", QoS::AtLeastOnce, Some(1), b"1".to_vec()).into(),
        &channel,
    )
    .unwrap();
    assert!(try_next_packet(&mut peer).await.is_none());
    let published = recorder.published.lock();
    assert_eq!(published[0].1.qos, QoS::AtMostOnce);
    assert_eq!(published[0].1.packet_id, None);
}

#[tokio::test]
async fn test_qos2_publish_under_qos1_maximum_is_acknowledged_once() {
    let sessions = sessions_with("c1", true);
    let (flow, recorder) = receiver(&sessions, QoS::AtLeastOnce);
    let (channel, _reader, mut peer) = connection();

    flow.execute(
        "c1",
        Publish::new("a", QoS::ExactlyOnce, Some(4), b"2".to_vec()).into(),
        &channel,
    )
    .unwrap();
    assert_eq!(next_packet(&mut peer).await, PublishAck::new(4).into());
    assert!(try_next_packet(&mut peer).await.is_none());
    assert!(sessions.get("c1").unwrap().pending_acknowledgements.is_empty());
    let published = recorder.published.lock();
    assert_eq!(published[0].1.qos, QoS::AtLeastOnce);
    assert_eq!(published[0].1.packet_id, Some(4));
}

#[tokio::test]
async fn test_duplicate_qos2_publish_is_acknowledged_but_delivered_once() {
    let sessions = sessions_with("c1", true);
    let (flow, recorder) = receiver(&sessions, QoS::ExactlyOnce);
    let (channel, _reader, mut peer) = connection();
    let publish = Publish::new("a", QoS::ExactlyOnce, Some(5), b"2".to_vec());

    flow.execute("c1", publish.clone().into(), &channel).unwrap();
    flow.execute("c1", publish.with_duplicate(true).into(), &channel)
        .unwrap();
    assert_eq!(next_packet(&mut peer).await, PublishReceived::new(5).into());
    assert_eq!(next_packet(&mut peer).await, PublishReceived::new(5).into());
    assert_eq!(recorder.published.lock().len(), 1);

    flow.execute("c1", PublishRelease::new(5).into(), &channel)
        .unwrap();
    assert_eq!(
        next_packet(&mut peer).await,
        PublishComplete::new(5).into()
    );
    assert!(sessions.get("c1").unwrap().pending_acknowledgements.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_publish_received_is_resent_until_release() {
    let wait_timeout = Duration::from_secs(3);
    let sessions = sessions_with("c1", true);
    let acks = PublishAcknowledger::new(sessions.clone(), wait_timeout);
    let (channel, _reader, mut peer) = connection();

    acks.send_ack(
        "c1",
        PublishReceived::new(9).into(),
        &channel,
        PendingMessageStatus::PendingToSend,
    )
    .unwrap();
    let ack: Packet = PublishReceived::new(9).into();
    assert_eq!(next_packet(&mut peer).await, ack);
    assert_eq!(next_packet(&mut peer).await, ack);

    channel.publish_inbound(PublishRelease::new(9).into());
    assert!(timeout(wait_timeout * 3, peer.receive()).await.is_err());
}

/// Feeds everything `reader` decodes to `flows`, the way a listener does.
fn pump(mut reader: PacketReader, channel: PacketChannel, flows: ClientFlows, client_id: &str) {
    let client_id = client_id.to_string();
    tokio::spawn(async move {
        while let Some(Ok(packet)) = reader.next().await {
            channel.publish_inbound(packet.clone());
            if flows.execute(&client_id, packet, &channel).is_err() {
                break;
            }
        }
    });
}

#[tokio::test]
async fn test_qos2_handshake_clears_pending_state_on_both_sides() {
    let settings = ProtocolSettings {
        wait_timeout_secs: 600,
        ..ProtocolSettings::default()
    };
    let (left, right) = ByteChannel::pair();
    let (sender_channel, sender_reader) = PacketChannel::open(left, codec());
    let (receiver_channel, receiver_reader) = PacketChannel::open(right, codec());

    let sender_sessions = sessions_with("sender", false);
    let receiver_sessions = sessions_with("receiver", false);
    let recorder = Arc::new(Recorder::default());
    let sender_flows = ClientFlows::new(sender_sessions.clone(), &settings, Arc::new(Recorder::default()));
    let receiver_flows = ClientFlows::new(receiver_sessions.clone(), &settings, recorder.clone());

    let mut sender_inbound = sender_channel.subscribe();
    let mut receiver_inbound = receiver_channel.subscribe();
    pump(sender_reader, sender_channel.clone(), sender_flows.clone(), "sender");
    pump(receiver_reader, receiver_channel, receiver_flows, "receiver");

    let publish = Publish::new("a/b", QoS::ExactlyOnce, Some(1), b"exactly once".to_vec());
    sender_flows
        .sender
        .send_publish("sender", publish, &sender_channel, PendingMessageStatus::PendingToSend)
        .await
        .unwrap();

    let mut seen_by_receiver = Vec::new();
    let mut seen_by_sender = Vec::new();
    for _ in 0..2 {
        seen_by_receiver.push(receiver_inbound.recv().await.unwrap().packet_type());
        seen_by_sender.push(sender_inbound.recv().await.unwrap().packet_type());
    }
    assert_eq!(
        seen_by_receiver,
        vec![PacketType::Publish, PacketType::PublishRelease]
    );
    assert_eq!(
        seen_by_sender,
        vec![PacketType::PublishReceived, PacketType::PublishComplete]
    );

    timeout(Duration::from_secs(5), async {
        loop {
            let sender_session = sender_sessions.get("sender").unwrap();
            let receiver_session = receiver_sessions.get("receiver").unwrap();
            if sender_session.pending_messages.is_empty()
                && sender_session.pending_acknowledgements.is_empty()
                && receiver_session.pending_acknowledgements.is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(recorder.published.lock().len(), 1);
}

fn server_flows(repositories: &RepositoryProvider, authenticator: Option<Arc<dyn Authenticator>>) -> ServerFlows {
    let settings = ProtocolSettings {
        wait_timeout_secs: 600,
        maximum_qos: QoS::AtLeastOnce,
        ..ProtocolSettings::default()
    };
    let sender = PublishSenderFlow::new(repositories.sessions.clone(), settings.wait_timeout());
    ServerFlows::new(
        repositories,
        &settings,
        Arc::new(MqttTopicEvaluator::default()),
        sender,
        Arc::new(Recorder::default()),
        authenticator,
    )
}

#[tokio::test]
async fn test_server_connect_replays_session() {
    let repositories = RepositoryProvider::in_memory();
    let mut session = ClientSession::new("c1", false);
    for packet_id in [10, 11] {
        session.add_pending_message(PendingMessage::from_publish(
            &Publish::new("a", QoS::AtLeastOnce, Some(packet_id), Vec::new()),
            PendingMessageStatus::PendingToAcknowledge,
        ));
    }
    session.add_pending_message(PendingMessage::from_publish(
        &Publish::new("b", QoS::AtLeastOnce, None, Vec::new()),
        PendingMessageStatus::PendingToSend,
    ));
    session.add_pending_acknowledgement(PendingAcknowledgement::new(
        7,
        PendingAcknowledgementKind::PublishReceived,
    ));
    repositories.sessions.create(session).unwrap();

    let flows = server_flows(&repositories, None);
    let (channel, _reader, mut peer) = connection();
    flows
        .connect
        .execute("c1", &Connect::new("c1", false), &channel)
        .unwrap();
    // 10 and 11 are still pending and the queued message took 12
    assert_eq!(channel.next_packet_id(), 13);

    assert_eq!(
        next_packet(&mut peer).await,
        ConnectAck::new(ConnectReturnCode::Accepted, true).into()
    );
    let mut publishes = 0;
    let mut acks = 0;
    while let Some(packet) = try_next_packet(&mut peer).await {
        match packet.packet_type() {
            PacketType::Publish => publishes += 1,
            PacketType::PublishReceived => acks += 1,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!((publishes, acks), (3, 1));

    let session = repositories.sessions.get("c1").unwrap();
    assert_eq!(session.pending_messages.len(), 3);
    assert!(session
        .pending_messages
        .iter()
        .all(|message| message.status == PendingMessageStatus::PendingToAcknowledge));
}

#[tokio::test]
async fn test_server_connect_clean_session_starts_over() {
    let repositories = RepositoryProvider::in_memory();
    let mut old = ClientSession::new("c1", false);
    old.add_subscription("a", QoS::AtMostOnce);
    repositories.sessions.create(old).unwrap();

    let flows = server_flows(&repositories, None);
    let (channel, _reader, mut peer) = connection();
    let mut connect = Connect::new("c1", true);
    connect.will = Some(Will {
        topic: "status".to_string(),
        qos: QoS::AtMostOnce,
        retain: false,
        payload: b"gone".to_vec(),
    });
    flows.connect.execute("c1", &connect, &channel).unwrap();

    assert_eq!(
        next_packet(&mut peer).await,
        ConnectAck::new(ConnectReturnCode::Accepted, false).into()
    );
    let session = repositories.sessions.get("c1").unwrap();
    assert!(session.clean);
    assert!(session.subscriptions.is_empty());
    assert!(repositories.wills.read("c1").unwrap().is_some());

    flows.execute("c1", Packet::Disconnect, &channel).unwrap();
    assert!(repositories.wills.read("c1").unwrap().is_none());
}

struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&str>) -> bool {
        false
    }
}

#[tokio::test]
async fn test_server_connect_rejects_bad_credentials() {
    let repositories = RepositoryProvider::in_memory();
    let flows = server_flows(&repositories, Some(Arc::new(DenyAll)));
    let (channel, _reader, mut peer) = connection();

    let result = flows
        .connect
        .execute("c1", &Connect::new("c1", true), &channel);
    assert!(matches!(
        result,
        Err(MqttError::ConnectionRefused(
            ConnectReturnCode::BadUserNameOrPassword
        ))
    ));
    assert!(try_next_packet(&mut peer).await.is_none());
    assert!(repositories.sessions.read("c1").unwrap().is_none());
}

#[tokio::test]
async fn test_subscribe_grants_and_delivers_retained() {
    let repositories = RepositoryProvider::in_memory();
    repositories.sessions.create(ClientSession::new("c1", true)).unwrap();
    repositories
        .retained
        .create(RetainedMessage::new("sensors/1", QoS::ExactlyOnce, b"21".to_vec()))
        .unwrap();
    repositories
        .retained
        .create(RetainedMessage::new("other", QoS::AtMostOnce, b"x".to_vec()))
        .unwrap();

    let flows = server_flows(&repositories, None);
    let (channel, _reader, mut peer) = connection();
    let subscribe = Subscribe {
        packet_id: 4,
        subscriptions: vec![
            TopicSubscription::new("sensors/+", QoS::ExactlyOnce),
            TopicSubscription::new("bad/#/filter", QoS::AtMostOnce),
        ],
    };
    flows.execute("c1", subscribe.into(), &channel).unwrap();

    let Packet::SubscribeAck(ack) = next_packet(&mut peer).await else {
        panic!("expected SUBACK");
    };
    assert_eq!(ack.packet_id, 4);
    assert_eq!(
        ack.return_codes,
        vec![SubscribeReturnCode::MaximumQoS1, SubscribeReturnCode::Failure]
    );

    let Packet::Publish(retained) = next_packet(&mut peer).await else {
        panic!("expected the retained PUBLISH");
    };
    assert_eq!(retained.topic, "sensors/1");
    assert_eq!(retained.qos, QoS::AtLeastOnce);
    assert!(retained.retain);
    assert!(try_next_packet(&mut peer).await.is_none());

    let session = repositories.sessions.get("c1").unwrap();
    assert_eq!(session.subscriptions.len(), 1);
    assert_eq!(session.subscriptions[0].maximum_qos, QoS::AtLeastOnce);

    flows
        .execute(
            "c1",
            Unsubscribe {
                packet_id: 5,
                topics: vec!["sensors/+".to_string()],
            }
            .into(),
            &channel,
        )
        .unwrap();
    assert_eq!(
        next_packet(&mut peer).await,
        UnsubscribeAck::new(5).into()
    );
    assert!(repositories.sessions.get("c1").unwrap().subscriptions.is_empty());
}

#[tokio::test]
async fn test_server_flows_answer_pings_and_reject_client_packets() {
    let repositories = RepositoryProvider::in_memory();
    let flows = server_flows(&repositories, None);
    let (channel, _reader, mut peer) = connection();

    flows.execute("c1", Packet::PingRequest, &channel).unwrap();
    assert_eq!(next_packet(&mut peer).await, Packet::PingResponse);
    assert!(matches!(
        flows.execute("c1", Packet::PingResponse, &channel),
        Err(MqttError::ProtocolViolation(_))
    ));
}
