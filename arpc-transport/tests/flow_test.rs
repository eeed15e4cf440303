use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use arpc_proto::{
    DataHeader, DataPacket, Endpoint, FcFeedbackPacket, Packet, PacketRegistry, PacketTypeId,
    RpcId,
};
use arpc_transport::flow::{DEFAULT_INITIAL_RECEIVE_WINDOW, FcConfig, FcHandler};
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

    fn handler(&self) -> FcHandler {
        FcHandler::new(
            Role::Client,
            self.transport.sender().clone(),
            self.transport.timers().clone(),
            FcConfig::default(),
        )
    }

    fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer.local_addr().unwrap()
    }

    fn data_packet<'a>(&self, seq: u16, payload: &'a [u8]) -> DataPacket<'a> {
        DataPacket {
            header: DataHeader {
                packet_type: PacketTypeId::RESPONSE,
                rpc_id: RpcId(1),
                total_packets: u16::MAX,
                seq_number: seq,
                dst: Endpoint::from_socket_addr(self.peer_addr()),
                src: Endpoint::new([127, 0, 0, 1], 0),
            },
            payload,
        }
    }
}

#[test]
fn test_window_update_at_threshold() {
    let h = Harness::new();
    let handler = h.handler();
    let peer = h.peer_addr();

    // Consume just under 25% of the 15 MiB window: no advertisement.
    let chunk = vec![0u8; 60_000];
    let threshold = DEFAULT_INITIAL_RECEIVE_WINDOW / 4;
    let mut consumed = 0u64;
    let mut seq = 0u16;
    while consumed + chunk.len() as u64 <= threshold - 1 {
        let p = h.data_packet(seq, &chunk);
        handler.on_receive(&Packet::Data(p), peer).unwrap();
        consumed += chunk.len() as u64;
        seq += 1;
    }
    assert!(h.peer.recv_from(&mut [0u8; 64]).is_err(), "below threshold");

    // Crossing the threshold emits exactly one window advertisement.
    let filler = vec![0u8; (threshold - consumed) as usize];
    let p = h.data_packet(seq, &filler);
    handler.on_receive(&Packet::Data(p), peer).unwrap();

    let mut buf = vec![0u8; 64];
    let (len, _) = h.peer.recv_from(&mut buf).expect("window update");
    buf.truncate(len);
    let Packet::FcFeedback(feedback) = h.registry.deserialize(&buf).unwrap() else {
        panic!("expected fc feedback");
    };
    // New offset = bytes read + window size, strictly above the original.
    assert_eq!(
        feedback.send_window,
        threshold + DEFAULT_INITIAL_RECEIVE_WINDOW
    );
    assert!(h.peer.recv_from(&mut [0u8; 64]).is_err(), "only one update");
}

#[test]
fn test_send_side_window_tracking() {
    let h = Harness::new();
    let handler = h.handler();
    let peer = h.peer_addr();

    let p = h.data_packet(0, &[0u8; 1000]);
    handler.on_send(&Packet::Data(p), peer).unwrap();
    assert_eq!(
        handler.send_window_size(peer),
        Some(DEFAULT_INITIAL_RECEIVE_WINDOW - 1000)
    );

    // An advertisement grows the window; a stale smaller one is ignored.
    let update = FcFeedbackPacket {
        send_window: DEFAULT_INITIAL_RECEIVE_WINDOW + 5000,
    };
    handler.on_receive(&Packet::FcFeedback(update), peer).unwrap();
    assert_eq!(
        handler.send_window_size(peer),
        Some(DEFAULT_INITIAL_RECEIVE_WINDOW + 4000)
    );

    let stale = FcFeedbackPacket { send_window: 100 };
    handler.on_receive(&Packet::FcFeedback(stale), peer).unwrap();
    assert_eq!(
        handler.send_window_size(peer),
        Some(DEFAULT_INITIAL_RECEIVE_WINDOW + 4000)
    );
}
