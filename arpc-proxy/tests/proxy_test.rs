use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use arpc_proto::{
    DataHeader, DataPacket, Endpoint, Packet, PacketRegistry, PacketTypeId, RpcId, SymphonyCipher,
    SymphonyHeader,
};
use arpc_proxy::{
    BufferingProxy, ChainHolder, ProxyConfig, ProxyContext, ProxyElement, ProxyElementChain,
    Verdict,
};
use parking_lot::Mutex;

/// Drops any request whose public payload contains the marker bytes.
struct BombFilter;

impl ProxyElement for BombFilter {
    fn process_request(&self, _ctx: &ProxyContext, payload: &mut Vec<u8>) -> Verdict {
        if payload.windows(4).any(|w| w == b"bomb") {
            Verdict::Drop("explosive payload".to_string())
        } else {
            Verdict::Pass
        }
    }
}

/// Records the payload each request element invocation observed.
struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

impl ProxyElement for Recorder {
    fn process_request(&self, _ctx: &ProxyContext, payload: &mut Vec<u8>) -> Verdict {
        self.0.lock().push(payload.clone());
        Verdict::Pass
    }
}

struct Harness {
    proxy: BufferingProxy,
    proxy_addr: std::net::SocketAddr,
    source: UdpSocket,
    upstream: UdpSocket,
    registry: PacketRegistry,
}

impl Harness {
    fn new(chain: ProxyElementChain, cipher: Option<SymphonyCipher>) -> Self {
        let proxy = BufferingProxy::new(
            ProxyConfig {
                listen_ports: vec![0], // ephemeral
                ..ProxyConfig::default()
            },
            Arc::new(ChainHolder::new(chain)),
            cipher,
        )
        .unwrap();
        proxy.start();
        let proxy_addr = {
            let mut addr = proxy.local_addrs()[0];
            addr.set_ip("127.0.0.1".parse().unwrap());
            addr
        };

        let source = UdpSocket::bind("127.0.0.1:0").unwrap();
        source.set_read_timeout(Some(Duration::from_millis(700))).unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        upstream.set_read_timeout(Some(Duration::from_millis(700))).unwrap();

        Self {
            proxy,
            proxy_addr,
            source,
            upstream,
            registry: PacketRegistry::new(),
        }
    }

    fn framed(&self, public: &[u8]) -> Vec<u8> {
        SymphonyHeader {
            version: 1,
            offset_to_private: 0,
            service_id: 3,
            method_id: 4,
        }
        .frame(public, &[])
    }

    /// Sends `payload` toward the upstream through the proxy, split into
    /// `total` fragments.
    fn send_fragments(&self, rpc_id: u64, payload: &[u8], total: u16) {
        let chunk = payload.len().div_ceil(total as usize);
        for (seq, piece) in payload.chunks(chunk).enumerate() {
            let packet = Packet::Data(DataPacket {
                header: DataHeader {
                    packet_type: PacketTypeId::REQUEST,
                    rpc_id: RpcId(rpc_id),
                    total_packets: total,
                    seq_number: seq as u16,
                    dst: Endpoint::from_socket_addr(self.upstream.local_addr().unwrap()),
                    src: Endpoint::from_socket_addr(self.source.local_addr().unwrap()),
                },
                payload: piece,
            });
            let mut wire = Vec::new();
            self.registry.serialize_into(&packet, &mut wire).unwrap();
            self.source.send_to(&wire, self.proxy_addr).unwrap();
        }
    }

    fn recv_on<'a>(&self, socket: &UdpSocket, buf: &'a mut Vec<u8>) -> Option<Packet<'a>> {
        match socket.recv_from(buf) {
            Ok((len, _)) => {
                buf.truncate(len);
                Some(self.registry.deserialize(buf).unwrap())
            }
            Err(_) => None,
        }
    }
}

#[test]
fn test_single_packet_fast_path() {
    let h = Harness::new(ProxyElementChain::new(), None);
    let payload = h.framed(b"hello upstream");
    h.send_fragments(1, &payload, 1);

    let mut buf = vec![0u8; 2048];
    let packet = h.recv_on(&h.upstream, &mut buf).expect("forwarded");
    let Packet::Data(p) = packet else {
        panic!("expected data packet");
    };
    assert_eq!(p.header.rpc_id, RpcId(1));
    assert_eq!(p.payload, &payload[..]);
    assert_eq!(h.proxy.buffered(), 0, "fast path never buffers");

    h.proxy.shutdown();
}

#[test]
fn test_multi_fragment_buffer_and_forward() {
    let h = Harness::new(ProxyElementChain::new(), None);
    let body: Vec<u8> = (0..1000).map(|i| i as u8).collect();
    let payload = h.framed(&body);
    h.send_fragments(2, &payload, 3);

    // Re-fragmented output (fits one datagram after processing).
    let mut buf = vec![0u8; 4096];
    let packet = h.recv_on(&h.upstream, &mut buf).expect("forwarded");
    let Packet::Data(p) = packet else {
        panic!("expected data packet");
    };
    assert_eq!(p.header.total_packets, 1);
    assert_eq!(p.payload, &payload[..]);

    h.proxy.shutdown();
}

#[test]
fn test_bomb_payload_dropped_with_error() {
    let mut chain = ProxyElementChain::new();
    chain.push(Arc::new(BombFilter));
    let h = Harness::new(chain, None);

    let payload = h.framed(b"this carries a bomb inside");
    h.send_fragments(3, &payload, 3);

    // Nothing reaches the upstream.
    let mut buf = vec![0u8; 2048];
    assert!(h.recv_on(&h.upstream, &mut buf).is_none());

    // The source receives the element's reason as an error packet.
    let mut buf = vec![0u8; 2048];
    let packet = h.recv_on(&h.source, &mut buf).expect("drop notification");
    let Packet::Error(err) = packet else {
        panic!("expected error packet");
    };
    assert_eq!(err.rpc_id, RpcId(3));
    assert_eq!(err.message, b"explosive payload");

    h.proxy.shutdown();
}

#[test]
fn test_clean_payload_passes_filter() {
    let mut chain = ProxyElementChain::new();
    chain.push(Arc::new(BombFilter));
    let h = Harness::new(chain, None);

    let payload = h.framed(b"flowers and sunshine");
    h.send_fragments(4, &payload, 2);

    let mut buf = vec![0u8; 2048];
    assert!(h.recv_on(&h.upstream, &mut buf).is_some());

    h.proxy.shutdown();
}

#[test]
fn test_encrypted_public_segment_processing() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut chain = ProxyElementChain::new();
    chain.push(Arc::new(Recorder(seen.clone())));
    let h = Harness::new(chain, Some(SymphonyCipher::dev()));

    let cipher = SymphonyCipher::dev();
    let plain = h.framed(b"secret greeting");
    let sealed = cipher.encrypt(&plain).unwrap();
    h.send_fragments(5, &sealed, 2);

    let mut buf = vec![0u8; 4096];
    let packet = h.recv_on(&h.upstream, &mut buf).expect("forwarded");
    let Packet::Data(p) = packet else {
        panic!("expected data packet");
    };

    // The element saw the decrypted public segment.
    assert_eq!(seen.lock().as_slice(), &[b"secret greeting".to_vec()]);

    // The forwarded payload is re-encrypted, not plaintext, and opens to
    // the original framing.
    assert_ne!(p.payload, &plain[..]);
    let reopened = cipher.decrypt(p.payload).unwrap();
    assert_eq!(reopened, plain);

    h.proxy.shutdown();
}

#[test]
fn test_stale_partial_rpc_swept() {
    let h = Harness::new(ProxyElementChain::new(), None);
    let payload = h.framed(&[7u8; 500]);

    // Send only the first of three fragments.
    let chunk = payload.len().div_ceil(3);
    let packet = Packet::Data(DataPacket {
        header: DataHeader {
            packet_type: PacketTypeId::REQUEST,
            rpc_id: RpcId(6),
            total_packets: 3,
            seq_number: 0,
            dst: Endpoint::from_socket_addr(h.upstream.local_addr().unwrap()),
            src: Endpoint::from_socket_addr(h.source.local_addr().unwrap()),
        },
        payload: &payload[..chunk],
    });
    let mut wire = Vec::new();
    h.registry.serialize_into(&packet, &mut wire).unwrap();
    h.source.send_to(&wire, h.proxy_addr).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.proxy.buffered(), 1);

    h.proxy.shutdown();
}
