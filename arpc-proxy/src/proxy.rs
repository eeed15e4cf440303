use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arpc_proto::codec::DATA_HEADER_LEN;
use arpc_proto::{
    Endpoint, ErrorPacket, Packet, PacketRegistry, PacketTypeId, RpcId, SymphonyCipher,
    SymphonyHeader, symphony,
};
use arpc_transport::fragment::DEFAULT_MAX_UDP_PAYLOAD;
use arpc_transport::timer::TIMER_KEY_PROXY_SWEEP;
use arpc_transport::{BufferPool, Fragmenter, Reassembler, RpcError, TimerManager};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::element::{ChainHolder, Direction, ProxyContext, Verdict};

/// Buffering-proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Intercept ports the proxy listens on.
    pub listen_ports: Vec<u16>,
    /// Idle time after which a partially buffered RPC is discarded.
    pub buffer_timeout: Duration,
    pub max_udp_payload: usize,
    pub receive_buffer: usize,
    pub socket_buffer_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_ports: vec![15002, 15006],
            buffer_timeout: Duration::from_secs(30),
            max_udp_payload: DEFAULT_MAX_UDP_PAYLOAD,
            receive_buffer: 64 * 1024,
            socket_buffer_bytes: 8 * 1024 * 1024,
        }
    }
}

struct ProxyInner {
    config: ProxyConfig,
    sockets: Vec<Arc<UdpSocket>>,
    pool: Arc<BufferPool>,
    registry: PacketRegistry,
    reassembler: Arc<Reassembler>,
    timers: Arc<TimerManager>,
    chain: Arc<ChainHolder>,
    cipher: Option<SymphonyCipher>,
    fragmenter: Fragmenter,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A sidecar that intercepts aRPC datagrams, buffers all fragments of each
/// RPC, runs the element chain over the complete (decrypted) public
/// payload, then re-fragments and forwards toward the original
/// destination. A `Drop` verdict aborts forwarding and reports the
/// element's reason back to the source as an error packet.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct BufferingProxy {
    inner: Arc<ProxyInner>,
}

impl BufferingProxy {
    pub fn new(
        config: ProxyConfig,
        chain: Arc<ChainHolder>,
        cipher: Option<SymphonyCipher>,
    ) -> Result<Self, RpcError> {
        let mut sockets = Vec::with_capacity(config.listen_ports.len());
        for port in &config.listen_ports {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            if let Err(err) = socket.set_recv_buffer_size(config.socket_buffer_bytes) {
                warn!(%err, "could not enlarge receive buffer");
            }
            if let Err(err) = socket.set_send_buffer_size(config.socket_buffer_bytes) {
                warn!(%err, "could not enlarge send buffer");
            }
            let addr: SocketAddr = format!("0.0.0.0:{port}").parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad listen port")
            })?;
            socket.bind(&addr.into())?;
            let socket: UdpSocket = socket.into();
            socket.set_read_timeout(Some(Duration::from_millis(100)))?;
            sockets.push(Arc::new(socket));
        }

        let pool = Arc::new(BufferPool::new());
        let timers = Arc::new(TimerManager::new());
        let reassembler = Arc::new(Reassembler::new(pool.clone(), config.buffer_timeout));

        let weak = Arc::downgrade(&reassembler);
        timers.schedule_periodic(TIMER_KEY_PROXY_SWEEP, config.buffer_timeout / 2, move || {
            if let Some(reassembler) = weak.upgrade() {
                reassembler.sweep(Instant::now());
            }
        });

        Ok(Self {
            inner: Arc::new(ProxyInner {
                fragmenter: Fragmenter::new(config.max_udp_payload),
                config,
                sockets,
                pool,
                registry: PacketRegistry::new(),
                reassembler,
                timers,
                chain,
                cipher,
                shutdown: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    pub fn chain(&self) -> &Arc<ChainHolder> {
        &self.inner.chain
    }

    /// Spawns one receive thread per intercept socket.
    pub fn start(&self) {
        let mut threads = self.inner.threads.lock();
        for (idx, socket) in self.inner.sockets.iter().enumerate() {
            let proxy = self.clone();
            let socket = socket.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("arpc-proxy-{idx}"))
                    .spawn(move || proxy.serve(&socket))
                    .expect("spawning proxy receiver"),
            );
        }
        info!(ports = ?self.inner.config.listen_ports, "buffering proxy started");
    }

    fn serve(&self, socket: &Arc<UdpSocket>) {
        while !self.inner.shutdown.load(Ordering::Relaxed) {
            let mut buf = self.inner.pool.get(self.inner.config.receive_buffer);
            buf.resize(self.inner.config.receive_buffer, 0);
            let (len, peer) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    self.inner.pool.put(buf);
                    continue;
                }
                Err(err) => {
                    self.inner.pool.put(buf);
                    warn!(%err, "proxy receive failed");
                    continue;
                }
            };
            buf.truncate(len);
            self.process_datagram(socket, buf, peer);
        }
    }

    fn process_datagram(&self, socket: &Arc<UdpSocket>, buf: Vec<u8>, peer: SocketAddr) {
        enum Action {
            Fast {
                rpc_id: RpcId,
                packet_type: PacketTypeId,
                src: Endpoint,
                dst: Endpoint,
                payload: Vec<u8>,
            },
            Buffer {
                header: arpc_proto::DataHeader,
                payload_len: usize,
            },
            Ignore,
        }

        let action = match self.inner.registry.deserialize(&buf) {
            Ok(Packet::Data(p)) => {
                if p.header.total_packets == 1 {
                    // Single-packet RPCs skip buffering entirely.
                    Action::Fast {
                        rpc_id: p.header.rpc_id,
                        packet_type: p.header.packet_type,
                        src: p.header.src,
                        dst: p.header.dst,
                        payload: p.payload.to_vec(),
                    }
                } else {
                    Action::Buffer {
                        header: p.header,
                        payload_len: p.payload.len(),
                    }
                }
            }
            Ok(other) => {
                // Control packets carry no destination quintuple, so the
                // proxy has nowhere to route them.
                debug!(%peer, packet_type = %other.type_id(), "proxy ignoring control packet");
                Action::Ignore
            }
            Err(err) => {
                warn!(%peer, %err, "proxy dropping undecodable datagram");
                Action::Ignore
            }
        };

        match action {
            Action::Fast {
                rpc_id,
                packet_type,
                src,
                dst,
                payload,
            } => {
                self.inner.pool.put(buf);
                self.handle_message(socket, rpc_id, packet_type, src, dst, payload);
            }
            Action::Buffer {
                header,
                payload_len,
            } => {
                let range = DATA_HEADER_LEN..DATA_HEADER_LEN + payload_len;
                if let Some(message) =
                    self.inner
                        .reassembler
                        .insert(peer, &header, buf, range, Instant::now())
                {
                    self.handle_message(
                        socket,
                        message.rpc_id,
                        message.packet_type,
                        message.src,
                        message.dst,
                        message.payload,
                    );
                }
            }
            Action::Ignore => self.inner.pool.put(buf),
        }
    }

    fn handle_message(
        &self,
        socket: &Arc<UdpSocket>,
        rpc_id: RpcId,
        packet_type: PacketTypeId,
        src: Endpoint,
        dst: Endpoint,
        payload: Vec<u8>,
    ) {
        let direction = match packet_type {
            PacketTypeId::REQUEST => Direction::Request,
            PacketTypeId::RESPONSE => Direction::Response,
            other => {
                debug!(%rpc_id, packet_type = %other, "proxy ignoring non-data message");
                self.inner.pool.put(payload);
                return;
            }
        };

        let result = self.run_elements(socket, rpc_id, direction, src, dst, &payload);
        self.inner.pool.put(payload);

        match result {
            Ok(Some(processed)) => {
                self.forward(socket, rpc_id, packet_type, src, dst, &processed);
                self.inner.pool.put(processed);
            }
            Ok(None) => {} // dropped by an element; error already sent
            Err(err) => {
                warn!(%rpc_id, %err, "proxy failed to process message");
            }
        }
    }

    /// Splits, decrypts, runs the chain and reassembles the payload.
    /// Returns `None` when an element dropped the message.
    fn run_elements(
        &self,
        socket: &Arc<UdpSocket>,
        rpc_id: RpcId,
        direction: Direction,
        src: Endpoint,
        dst: Endpoint,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, RpcError> {
        let header = SymphonyHeader::parse(payload)
            .map_err(|err| RpcError::RemoteFail(format!("bad payload framing: {err}")))?;
        let (public_raw, private) = symphony::split_segments(payload)
            .map_err(|err| RpcError::RemoteFail(format!("bad payload framing: {err}")))?;

        // Only the public half is opened; the private segment passes
        // through untouched, encrypted or not.
        let mut public = match &self.inner.cipher {
            Some(cipher) => cipher
                .open_public(public_raw)
                .map_err(|err| RpcError::RemoteFail(format!("public segment: {err}")))?,
            None => public_raw.to_vec(),
        };

        let ctx = ProxyContext {
            rpc_id,
            src,
            dst,
            direction,
        };
        match self.inner.chain.load().run(&ctx, &mut public) {
            Verdict::Drop(reason) => {
                info!(%rpc_id, reason, "message dropped by element");
                // The datagram source learns why its RPC died.
                self.send_error(socket, rpc_id, &reason, src.to_socket_addr());
                return Ok(None);
            }
            Verdict::Pass => {}
        }

        let public = match &self.inner.cipher {
            Some(cipher) => cipher
                .seal_public(&public)
                .map_err(|err| RpcError::RemoteFail(format!("public segment: {err}")))?,
            None => public,
        };

        // Reattach the private segment behind the rewritten offset.
        let header_len = arpc_proto::symphony::SYMPHONY_HEADER_LEN;
        let mut out = self.inner.pool.get(header_len + public.len() + private.len());
        out.resize(header_len, 0);
        let mut out_header = header;
        out_header.offset_to_private = (header_len + public.len()) as u32;
        out_header.write_to(&mut out[..header_len]);
        out.extend_from_slice(&public);
        out.extend_from_slice(private);
        Ok(Some(out))
    }

    fn forward(
        &self,
        socket: &Arc<UdpSocket>,
        rpc_id: RpcId,
        packet_type: PacketTypeId,
        src: Endpoint,
        dst: Endpoint,
        payload: &[u8],
    ) {
        let fragments = match self
            .inner
            .fragmenter
            .fragment(packet_type, rpc_id, payload, src, dst)
        {
            Ok(fragments) => fragments,
            Err(err) => {
                warn!(%rpc_id, %err, "could not fragment for forwarding");
                return;
            }
        };
        debug!(%rpc_id, count = fragments.len(), dest = %dst, "forwarding message");
        for fragment in &fragments {
            let mut wire = self.inner.pool.get(self.inner.config.max_udp_payload);
            let result = self
                .inner
                .registry
                .serialize_into(&Packet::Data(*fragment), &mut wire)
                .map_err(RpcError::from)
                .and_then(|_| {
                    socket
                        .send_to(&wire, dst.to_socket_addr())
                        .map(|_| ())
                        .map_err(RpcError::from)
                });
            self.inner.pool.put(wire);
            if let Err(err) = result {
                warn!(%rpc_id, %err, "forwarding send failed");
            }
        }
    }

    fn send_error(&self, socket: &Arc<UdpSocket>, rpc_id: RpcId, reason: &str, dest: SocketAddr) {
        let packet = Packet::Error(ErrorPacket {
            rpc_id,
            message: reason.as_bytes(),
        });
        let mut wire = self.inner.pool.get(256);
        let result = self
            .inner
            .registry
            .serialize_into(&packet, &mut wire)
            .map_err(RpcError::from)
            .and_then(|_| socket.send_to(&wire, dest).map(|_| ()).map_err(RpcError::from));
        self.inner.pool.put(wire);
        if let Err(err) = result {
            warn!(%rpc_id, %err, "failed to send drop notification");
        }
    }

    /// Number of RPCs currently buffered, for tests and diagnostics.
    pub fn buffered(&self) -> usize {
        self.inner.reassembler.pending()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        for handle in self.inner.threads.lock().drain(..) {
            let _ = handle.join();
        }
        self.inner.timers.shutdown();
    }
}
