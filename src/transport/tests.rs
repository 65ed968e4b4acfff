use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::codec::PacketCodec;
use crate::packet::{Packet, Publish, PublishAck, QoS};
use crate::topic::MqttTopicEvaluator;
use crate::utils::error::MqttError;

fn codec() -> Arc<PacketCodec> {
    Arc::new(PacketCodec::new(
        Arc::new(MqttTopicEvaluator::default()),
        u16::MAX as usize,
    ))
}

fn encoded(packet: Packet) -> Vec<u8> {
    codec().encode(&packet).unwrap()
}

#[test]
fn test_split_packet_is_emitted_after_last_chunk() {
    let bytes = encoded(Publish::new("a/b", QoS::AtLeastOnce, Some(7), b"payload".to_vec()).into());
    let mut buffer = PacketBuffer::new();

    let (first, second) = bytes.split_at(3);
    assert!(buffer.try_get_packets(first).unwrap().is_empty());
    assert!(buffer.is_partial());

    let frames = buffer.try_get_packets(second).unwrap();
    assert_eq!(frames, vec![bytes]);
    assert!(!buffer.is_partial());
}

#[test]
fn test_split_inside_remaining_length() {
    let bytes = encoded(Publish::new("t", QoS::AtMostOnce, None, vec![1; 200]).into());
    // 200 bytes of payload need a two byte remaining length
    assert_eq!(bytes[1] & 0x80, 0x80);
    let mut buffer = PacketBuffer::new();

    assert!(buffer.try_get_packets(&bytes[..2]).unwrap().is_empty());
    assert_eq!(buffer.try_get_packets(&bytes[2..]).unwrap(), vec![bytes]);
}

#[test]
fn test_coalesced_packets_are_emitted_in_order() {
    let packets = [
        encoded(Packet::PingRequest),
        encoded(Publish::new("a", QoS::AtMostOnce, None, b"x".to_vec()).into()),
        encoded(PublishAck::new(3).into()),
    ];
    let mut buffer = PacketBuffer::new();

    let frames = buffer.try_get_packets(&packets.concat()).unwrap();
    assert_eq!(frames, packets.to_vec());
}

#[test]
fn test_truncated_packet_yields_nothing() {
    let bytes = encoded(Publish::new("a/b", QoS::AtLeastOnce, Some(1), b"data".to_vec()).into());
    let mut buffer = PacketBuffer::new();

    assert!(buffer.try_get_packets(&bytes[..bytes.len() - 2]).unwrap().is_empty());
}

#[test]
fn test_surplus_bytes_start_the_next_frame() {
    let first = encoded(PublishAck::new(1).into());
    let second = encoded(PublishAck::new(2).into());
    let mut chunk = first.clone();
    chunk.extend_from_slice(&second[..1]);
    let mut buffer = PacketBuffer::new();

    assert_eq!(buffer.try_get_packets(&chunk).unwrap(), vec![first]);
    assert_eq!(buffer.try_get_packets(&second[1..]).unwrap(), vec![second]);
}

#[test]
fn test_invalid_remaining_length_fails() {
    let mut buffer = PacketBuffer::new();
    let result = buffer.try_get_packets(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
}

#[tokio::test]
async fn test_pair_delivers_both_ways_and_closes_together() {
    let (mut left, mut right) = ByteChannel::pair();

    left.send(vec![1, 2, 3]).unwrap();
    right.send(vec![4]).unwrap();
    assert_eq!(right.receive().await, Some(vec![1, 2, 3]));
    assert_eq!(left.receive().await, Some(vec![4]));

    right.close();
    assert!(!left.is_connected());
    assert!(matches!(left.send(vec![5]), Err(MqttError::NotConnected)));
    assert_eq!(left.receive().await, None);
}

#[tokio::test]
async fn test_packet_reader_decodes_across_chunks() {
    let (client, server) = ByteChannel::pair();
    let (_channel, mut reader) = PacketChannel::open(server, codec());

    let bytes = encoded(Publish::new("a", QoS::ExactlyOnce, Some(9), b"hi".to_vec()).into());
    client.send(bytes[..4].to_vec()).unwrap();
    client.send(bytes[4..].to_vec()).unwrap();
    client.send(encoded(Packet::PingRequest)).unwrap();

    let first = reader.next().await.unwrap().unwrap();
    assert!(first.is_reply(crate::packet::PacketType::Publish, 9));
    assert_eq!(reader.next().await.unwrap().unwrap(), Packet::PingRequest);

    client.close();
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn test_packet_channel_broadcasts_inbound_packets() {
    let (_client, server) = ByteChannel::pair();
    let (channel, _reader) = PacketChannel::open(server, codec());

    let mut inbound = channel.subscribe();
    channel.publish_inbound(PublishAck::new(4).into());
    assert_eq!(inbound.recv().await.unwrap(), PublishAck::new(4).into());
    assert_eq!(channel.next_packet_id(), 1);
    assert_eq!(channel.next_packet_id(), 2);
}

#[tokio::test]
async fn test_tcp_channel_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    let mut server = ByteChannel::tcp(accepted);
    let mut client = ByteChannel::tcp(connect.await.unwrap());

    client.send(b"hello".to_vec()).unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), server.receive())
        .await
        .unwrap();
    assert_eq!(received, Some(b"hello".to_vec()));

    client.close();
    let end = tokio::time::timeout(Duration::from_secs(5), server.receive())
        .await
        .unwrap();
    assert_eq!(end, None);
    assert!(!server.is_connected());
}
