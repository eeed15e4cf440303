use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use arpc_proto::{
    AckKind, AckPacket, DataHeader, DataPacket, Endpoint, Packet, PacketRegistry, PacketTypeId,
    RpcId,
};
use arpc_transport::reliable::{ReliableConfig, ReliableHandler};
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

    fn handler(&self, role: Role, retransmit: Duration) -> ReliableHandler {
        ReliableHandler::new(
            role,
            self.transport.sender().clone(),
            self.transport.timers().clone(),
            ReliableConfig {
                retransmit_timeout: retransmit,
                ..ReliableConfig::default()
            },
        )
    }

    fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer.local_addr().unwrap()
    }

    fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        match self.peer.recv_from(&mut buf) {
            Ok((len, _)) => {
                buf.truncate(len);
                Some(buf)
            }
            Err(_) => None,
        }
    }

    fn data_packet<'a>(
        &self,
        packet_type: PacketTypeId,
        rpc_id: u64,
        total: u16,
        seq: u16,
        payload: &'a [u8],
    ) -> DataPacket<'a> {
        DataPacket {
            header: DataHeader {
                packet_type,
                rpc_id: RpcId(rpc_id),
                total_packets: total,
                seq_number: seq,
                dst: Endpoint::from_socket_addr(self.peer_addr()),
                src: Endpoint::new([127, 0, 0, 1], 0),
            },
            payload,
        }
    }
}

#[test]
fn test_retransmit_until_acked() {
    let h = Harness::new();
    let handler = h.handler(Role::Client, Duration::from_millis(100));
    let peer = h.peer_addr();

    // Two request fragments pass through the send hook; the datagrams
    // themselves are "lost" (never actually sent to the peer here).
    for seq in 0..2u16 {
        let packet = h.data_packet(PacketTypeId::REQUEST, 42, 2, seq, b"seg");
        handler
            .on_send(&Packet::Data(packet), peer)
            .unwrap();
    }
    assert_eq!(handler.outstanding(), 1);

    // The retransmit timer re-serializes both buffered segments.
    let first = h.recv().expect("first retransmitted segment");
    let second = h.recv().expect("second retransmitted segment");
    for wire in [&first, &second] {
        let decoded = h.registry.deserialize(wire).unwrap();
        let Packet::Data(p) = decoded else {
            panic!("expected data packet");
        };
        assert_eq!(p.header.rpc_id, RpcId(42));
        assert_eq!(p.payload, b"seg");
    }

    // ACK(kind=Request) clears the buffered segments and stops the timer.
    let ack = AckPacket {
        rpc_id: RpcId(42),
        kind: AckKind::Request,
        status: 0,
        timestamp_micros: 0,
        message: b"",
    };
    handler.on_receive(&Packet::Ack(ack), peer).unwrap();
    assert_eq!(handler.outstanding(), 0);
    assert_eq!(handler.pending_entries(), 0, "acked message leaves the map");

    // Drain anything already in flight, then confirm silence.
    while h.recv().is_some() {}
    assert!(h.recv().is_none(), "no retransmission after ack");
}

#[test]
fn test_retransmit_cap_abandons_message() {
    let h = Harness::new();
    let handler = ReliableHandler::new(
        Role::Client,
        h.transport.sender().clone(),
        h.transport.timers().clone(),
        ReliableConfig {
            retransmit_timeout: Duration::from_millis(30),
            max_retransmits: 2,
            ..ReliableConfig::default()
        },
    );
    let peer = h.peer_addr();

    let packet = h.data_packet(PacketTypeId::REQUEST, 21, 1, 0, b"q");
    handler.on_send(&Packet::Data(packet), peer).unwrap();

    // Two retransmission rounds, then the message is abandoned.
    assert!(h.recv().is_some());
    assert!(h.recv().is_some());
    assert!(h.recv().is_none(), "no retransmission past the cap");
    assert_eq!(handler.outstanding(), 0);
    assert_eq!(handler.pending_entries(), 0);
}

#[test]
fn test_finished_entries_are_released() {
    let h = Harness::new();
    let handler = h.handler(Role::Server, Duration::from_secs(10));
    let peer = h.peer_addr();

    for seq in 0..2u16 {
        let p = h.data_packet(PacketTypeId::REQUEST, 120, 2, seq, b"x");
        handler.on_receive(&Packet::Data(p), peer).unwrap();
    }
    assert!(h.recv().is_some(), "completion ack");
    // The finished message left the entry map; duplicates are answered
    // from the completed cache.
    assert_eq!(handler.pending_entries(), 0);

    let dup = h.data_packet(PacketTypeId::REQUEST, 120, 2, 0, b"x");
    assert!(handler.on_receive(&Packet::Data(dup), peer).is_err());
    assert!(h.recv().is_some(), "re-ack from the completed cache");
    assert_eq!(handler.pending_entries(), 0);
}

#[test]
fn test_ack_sent_on_completion() {
    let h = Harness::new();
    let handler = h.handler(Role::Server, Duration::from_secs(10));
    let peer = h.peer_addr();

    let p0 = h.data_packet(PacketTypeId::REQUEST, 77, 2, 0, b"a");
    handler.on_receive(&Packet::Data(p0), peer).unwrap();
    assert!(h.recv().is_none(), "no ack before completion");

    let p1 = h.data_packet(PacketTypeId::REQUEST, 77, 2, 1, b"b");
    handler.on_receive(&Packet::Data(p1), peer).unwrap();

    let wire = h.recv().expect("completion ack");
    let Packet::Ack(ack) = h.registry.deserialize(&wire).unwrap() else {
        panic!("expected ack");
    };
    assert_eq!(ack.rpc_id, RpcId(77));
    assert_eq!(ack.kind, AckKind::Request);
    assert!(ack.timestamp_micros > 0);
}

#[test]
fn test_duplicate_after_completion_reacks_and_drops() {
    let h = Harness::new();
    let handler = h.handler(Role::Server, Duration::from_secs(10));
    let peer = h.peer_addr();

    for seq in 0..2u16 {
        let p = h.data_packet(PacketTypeId::REQUEST, 88, 2, seq, b"x");
        handler.on_receive(&Packet::Data(p), peer).unwrap();
    }
    assert!(h.recv().is_some(), "first ack");

    // A duplicate of seq 1 after completion: the handler re-acks and
    // reports the packet as droppable so it is never re-delivered.
    let dup = h.data_packet(PacketTypeId::REQUEST, 88, 2, 1, b"x");
    let result = handler.on_receive(&Packet::Data(dup), peer);
    assert!(result.is_err(), "duplicate must not pass upward");

    let wire = h.recv().expect("second ack for the duplicate");
    let Packet::Ack(ack) = h.registry.deserialize(&wire).unwrap() else {
        panic!("expected ack");
    };
    assert_eq!(ack.rpc_id, RpcId(88));
}

#[test]
fn test_duplicate_fragment_before_completion_counts_once() {
    let h = Harness::new();
    let handler = h.handler(Role::Server, Duration::from_secs(10));
    let peer = h.peer_addr();

    let p0 = h.data_packet(PacketTypeId::REQUEST, 99, 3, 0, b"x");
    handler.on_receive(&Packet::Data(p0), peer).unwrap();
    let p0_again = h.data_packet(PacketTypeId::REQUEST, 99, 3, 0, b"x");
    handler.on_receive(&Packet::Data(p0_again), peer).unwrap();

    // Two of three distinct fragments seen; still incomplete.
    assert!(h.recv().is_none());
}

#[test]
fn test_client_ignores_response_kind_ack() {
    let h = Harness::new();
    let handler = h.handler(Role::Client, Duration::from_millis(150));
    let peer = h.peer_addr();

    let packet = h.data_packet(PacketTypeId::REQUEST, 55, 1, 0, b"q");
    handler.on_send(&Packet::Data(packet), peer).unwrap();

    // A response-kind ACK does not cover our request.
    let ack = AckPacket {
        rpc_id: RpcId(55),
        kind: AckKind::Response,
        status: 0,
        timestamp_micros: 0,
        message: b"",
    };
    handler.on_receive(&Packet::Ack(ack), peer).unwrap();
    assert_eq!(handler.outstanding(), 1);
    assert!(h.recv().is_some(), "still retransmitting");
}

#[test]
fn test_rtt_min_from_ack_timestamp() {
    let h = Harness::new();
    let handler = h.handler(Role::Client, Duration::from_secs(10));
    let peer = h.peer_addr();

    let packet = h.data_packet(PacketTypeId::REQUEST, 66, 1, 0, b"q");
    handler.on_send(&Packet::Data(packet), peer).unwrap();
    assert!(handler.rtt_min().is_none());

    let sent_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
        - 25_000; // the peer stamped this 25 ms ago
    let ack = AckPacket {
        rpc_id: RpcId(66),
        kind: AckKind::Request,
        status: 0,
        timestamp_micros: sent_at,
        message: b"",
    };
    handler.on_receive(&Packet::Ack(ack), peer).unwrap();

    let rtt = handler.rtt_min().expect("sample recorded");
    assert!(rtt >= Duration::from_millis(25));
    assert!(rtt < Duration::from_secs(5));
}
