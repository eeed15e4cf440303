use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use arpc_proto::{
    CcFeedbackPacket, DataHeader, DataPacket, Endpoint, Packet, PacketRegistry, PacketTypeId,
    RpcId, make_packet_id,
};
use arpc_transport::congestion::{CcConfig, CcHandler};
use arpc_transport::{Handler, Role, TransportConfig, UdpTransport};

struct Harness {
    transport: Arc<UdpTransport>,
    peer: UdpSocket,
    registry: PacketRegistry,
}

impl Harness {
    fn new() -> Self {
        let transport = UdpTransport::bind("127.0.0.1:0", TransportConfig::default()).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        Self {
            transport,
            peer,
            registry: PacketRegistry::new(),
        }
    }

    fn handler(&self, config: CcConfig) -> CcHandler {
        CcHandler::new(
            Role::Client,
            self.transport.sender().clone(),
            self.transport.timers().clone(),
            config,
        )
    }

    fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer.local_addr().unwrap()
    }

    fn data_packet<'a>(&self, rpc_id: u64, seq: u16, payload: &'a [u8]) -> DataPacket<'a> {
        DataPacket {
            header: DataHeader {
                packet_type: PacketTypeId::REQUEST,
                rpc_id: RpcId(rpc_id),
                total_packets: 10,
                seq_number: seq,
                dst: Endpoint::from_socket_addr(self.peer_addr()),
                src: Endpoint::new([127, 0, 0, 1], 0),
            },
            payload,
        }
    }
}

#[test]
fn test_feedback_after_interval() {
    let h = Harness::new();
    let handler = h.handler(CcConfig::default());
    let peer = h.peer_addr();

    // Nine receives: no feedback yet.
    for seq in 0..9u16 {
        let p = h.data_packet(1, seq, b"payload");
        handler.on_receive(&Packet::Data(p), peer).unwrap();
    }
    assert!(h.peer.recv_from(&mut [0u8; 64]).is_err());

    // The tenth triggers one batched feedback packet.
    let p = h.data_packet(1, 9, b"payload");
    handler.on_receive(&Packet::Data(p), peer).unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, _) = h.peer.recv_from(&mut buf).expect("feedback emitted");
    buf.truncate(len);
    let Packet::CcFeedback(feedback) = h.registry.deserialize(&buf).unwrap() else {
        panic!("expected cc feedback");
    };
    assert_eq!(feedback.acked_count, 10);
    assert_eq!(feedback.acked_bytes, 70);
    assert_eq!(feedback.packet_ids.len(), 10);
    for seq in 0..10u16 {
        assert!(feedback.packet_ids.contains(&make_packet_id(RpcId(1), seq)));
    }

    // State cleared: the next packet starts a fresh batch.
    let p = h.data_packet(2, 0, b"payload");
    handler.on_receive(&Packet::Data(p), peer).unwrap();
    assert!(h.peer.recv_from(&mut [0u8; 64]).is_err());
}

#[test]
fn test_bytes_in_flight_matches_tracked_sends() {
    let h = Harness::new();
    let handler = h.handler(CcConfig::default());
    let peer = h.peer_addr();

    for seq in 0..5u16 {
        let p = h.data_packet(3, seq, &[0u8; 100]);
        handler.on_send(&Packet::Data(p), peer).unwrap();
    }
    let (in_flight, tracked, _) = handler.connection_stats(peer).unwrap();
    assert_eq!(in_flight, 500);
    assert_eq!(tracked, 5);
}

#[test]
fn test_feedback_acks_and_grows_window() {
    let h = Harness::new();
    let handler = h.handler(CcConfig::default());
    let peer = h.peer_addr();

    for seq in 0..10u16 {
        let p = h.data_packet(4, seq, &[0u8; 100]);
        handler.on_send(&Packet::Data(p), peer).unwrap();
    }
    let (_, _, cwnd_before) = handler.connection_stats(peer).unwrap();

    let feedback = CcFeedbackPacket {
        acked_count: 10,
        acked_bytes: 1000,
        packet_ids: (0..10u16).map(|s| make_packet_id(RpcId(4), s)).collect(),
    };
    handler
        .on_receive(&Packet::CcFeedback(feedback), peer)
        .unwrap();

    let (in_flight, tracked, cwnd_after) = handler.connection_stats(peer).unwrap();
    assert_eq!(in_flight, 0);
    assert_eq!(tracked, 0);
    assert!(cwnd_after > cwnd_before, "slow start grows on acks");
}

#[test]
fn test_unacked_below_floor_counts_as_loss() {
    let h = Harness::new();
    let handler = h.handler(CcConfig::default());
    let peer = h.peer_addr();

    // Packet IDs order by (rpc, seq); rpc 5 seq 0 is below rpc 5 seq 5.
    for seq in 0..6u16 {
        let p = h.data_packet(5, seq, &[0u8; 100]);
        handler.on_send(&Packet::Data(p), peer).unwrap();
    }

    // Feedback acks seq 1..6 but not seq 0: seq 0 is below the smallest
    // acked ID and treated as lost.
    let feedback = CcFeedbackPacket {
        acked_count: 5,
        acked_bytes: 500,
        packet_ids: (1..6u16).map(|s| make_packet_id(RpcId(5), s)).collect(),
    };
    handler
        .on_receive(&Packet::CcFeedback(feedback), peer)
        .unwrap();

    let (in_flight, tracked, _) = handler.connection_stats(peer).unwrap();
    assert_eq!(tracked, 0, "lost packet removed from tracking");
    assert_eq!(in_flight, 0, "in-flight bytes drained saturatingly");
}

#[test]
fn test_packet_timeout_removes_from_flight() {
    let h = Harness::new();
    let handler = h.handler(CcConfig {
        packet_timeout: Duration::from_millis(20),
        feedback_interval: 2,
        ..CcConfig::default()
    });
    let peer = h.peer_addr();

    let p = h.data_packet(6, 0, &[0u8; 100]);
    handler.on_send(&Packet::Data(p), peer).unwrap();
    let (in_flight, _, _) = handler.connection_stats(peer).unwrap();
    assert_eq!(in_flight, 100);

    // Effective timeout is 20 ms × 2 = 40 ms.
    std::thread::sleep(Duration::from_millis(200));
    let (in_flight, tracked, _) = handler.connection_stats(peer).unwrap();
    assert_eq!(in_flight, 0);
    assert_eq!(tracked, 0);
}

#[test]
fn test_feedback_interval_clamped_to_mtu() {
    let h = Harness::new();
    let handler = h.handler(CcConfig {
        feedback_interval: 100_000,
        ..CcConfig::default()
    });
    // 1500-byte datagrams hold (1500 - 17) / 8 = 185 packet IDs.
    assert_eq!(handler.feedback_interval(), 185);
}
