use super::*;

#[test]
fn test_qos_converts_from_level() {
    assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
    assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
    assert!(matches!(QoS::try_from(3), Err(MqttError::ProtocolViolation(_))));
    assert_eq!(u8::from(QoS::AtLeastOnce), 1);
}

#[test]
fn test_qos_orders_by_level() {
    assert!(QoS::AtMostOnce < QoS::AtLeastOnce);
    assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
}

#[test]
fn test_qos_serializes_as_number() {
    assert_eq!(serde_json::to_string(&QoS::ExactlyOnce).unwrap(), "2");
    let qos: QoS = serde_json::from_str("1").unwrap();
    assert_eq!(qos, QoS::AtLeastOnce);
    assert!(serde_json::from_str::<QoS>("3").is_err());
}

#[test]
fn test_packet_type_rejects_reserved_values() {
    assert!(PacketType::try_from(0).is_err());
    assert!(PacketType::try_from(15).is_err());
    assert_eq!(PacketType::try_from(12).unwrap(), PacketType::PingRequest);
}

#[test]
fn test_subscribe_return_code_values() {
    assert_eq!(SubscribeReturnCode::try_from(0x80).unwrap(), SubscribeReturnCode::Failure);
    assert!(SubscribeReturnCode::try_from(0x03).is_err());
    assert_eq!(
        SubscribeReturnCode::granted(QoS::AtLeastOnce),
        SubscribeReturnCode::MaximumQoS1
    );
}

#[test]
fn test_packet_reports_type_and_id() {
    let publish: Packet = Publish::new("a/b", QoS::AtLeastOnce, Some(7), b"x".to_vec()).into();
    assert_eq!(publish.packet_type(), PacketType::Publish);
    assert_eq!(publish.packet_id(), Some(7));

    let ack: Packet = PublishAck::new(7).into();
    assert!(ack.is_reply(PacketType::PublishAck, 7));
    assert!(!ack.is_reply(PacketType::PublishAck, 8));
    assert!(!ack.is_reply(PacketType::PublishComplete, 7));

    assert_eq!(Packet::PingRequest.packet_id(), None);
}
