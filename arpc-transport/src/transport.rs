use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arpc_proto::codec::DATA_HEADER_LEN;
use arpc_proto::{DataHeader, Endpoint, Packet, PacketRegistry, PacketTypeId, RpcId};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::fragment::{DEFAULT_MAX_UDP_PAYLOAD, Fragmenter};
use crate::handler::{HandlerChains, Role};
use crate::pool::BufferPool;
use crate::reassembly::{CompleteMessage, DEFAULT_FRAGMENT_TIMEOUT, Reassembler};
use crate::resolver::{Resolver, RoundRobinResolver};
use crate::timer::TimerManager;

/// UDP transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_udp_payload: usize,
    /// SO_RCVBUF / SO_SNDBUF request; large to absorb bursts of fragments.
    pub socket_buffer_bytes: usize,
    pub fragment_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_udp_payload: DEFAULT_MAX_UDP_PAYLOAD,
            socket_buffer_bytes: 8 * 1024 * 1024,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
        }
    }
}

/// The narrow send surface handed to handlers: socket, registry and pool,
/// but not the transport itself. Control packets (ACKs, feedback) and
/// retransmissions go through here, bypassing chains and fragmentation.
pub struct TransportSender {
    socket: Arc<UdpSocket>,
    registry: Arc<RwLock<PacketRegistry>>,
    pool: Arc<BufferPool>,
}

impl TransportSender {
    /// Serializes one packet into a pooled buffer and writes it to `addr`.
    pub fn send_packet(&self, packet: &Packet<'_>, addr: SocketAddr) -> Result<(), RpcError> {
        let mut buf = self.pool.get(512);
        let result = self
            .registry
            .read()
            .serialize_into(packet, &mut buf)
            .map_err(RpcError::from)
            .and_then(|_| {
                self.socket
                    .send_to(&buf, addr)
                    .map(|_| ())
                    .map_err(RpcError::from)
            });
        self.pool.put(buf);
        result
    }

    pub fn registry(&self) -> &Arc<RwLock<PacketRegistry>> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

/// What one blocking receive produced for the caller.
#[derive(Debug)]
pub enum Received {
    /// A data message completed reassembly.
    Message(CompleteMessage),
    /// The peer reported an error for an RPC.
    RemoteError { rpc_id: RpcId, message: String },
    /// Consumed internally: a control packet, a fragment of a still
    /// incomplete message, or a dropped packet.
    Control,
}

/// The datagram transport: owns the socket and the machinery around it
/// (registry, handler chains, fragmentation, reassembly, pool, timers).
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: Endpoint,
    sender: Arc<TransportSender>,
    registry: Arc<RwLock<PacketRegistry>>,
    chains: Arc<HandlerChains>,
    pool: Arc<BufferPool>,
    timers: Arc<TimerManager>,
    reassembler: Arc<Reassembler>,
    resolver: Mutex<Box<dyn Resolver>>,
    fragmenter: Fragmenter,
}

impl UdpTransport {
    /// Binds a socket (`"ip:port"` or `":port"` for bind-any) with
    /// enlarged kernel buffers and assembles the transport around it.
    pub fn bind(addr: &str, config: TransportConfig) -> Result<Arc<Self>, RpcError> {
        let mut resolver: Box<dyn Resolver> = Box::new(RoundRobinResolver::default());
        let bind_addr = resolver.resolve(addr)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(err) = socket.set_recv_buffer_size(config.socket_buffer_bytes) {
            warn!(%err, "could not enlarge receive buffer");
        }
        if let Err(err) = socket.set_send_buffer_size(config.socket_buffer_bytes) {
            warn!(%err, "could not enlarge send buffer");
        }
        socket.bind(&bind_addr.into())?;
        let socket: Arc<UdpSocket> = Arc::new(socket.into());
        let local = Endpoint::from_socket_addr(socket.local_addr()?);

        let registry = Arc::new(RwLock::new(PacketRegistry::new()));
        let pool = Arc::new(BufferPool::new());
        let timers = Arc::new(TimerManager::new());
        let reassembler = Arc::new(Reassembler::new(pool.clone(), config.fragment_timeout));
        Reassembler::start_sweeper(&reassembler, &timers);

        let sender = Arc::new(TransportSender {
            socket: socket.clone(),
            registry: registry.clone(),
            pool: pool.clone(),
        });

        Ok(Arc::new(Self {
            socket,
            local,
            sender,
            registry,
            chains: Arc::new(HandlerChains::new()),
            pool,
            timers,
            reassembler,
            resolver: Mutex::new(resolver),
            fragmenter: Fragmenter::new(config.max_udp_payload),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn sender(&self) -> &Arc<TransportSender> {
        &self.sender
    }

    pub fn chains(&self) -> &Arc<HandlerChains> {
        &self.chains
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<RwLock<PacketRegistry>> {
        &self.registry
    }

    pub fn fragmenter(&self) -> &Fragmenter {
        &self.fragmenter
    }

    /// Replaces the address-resolution strategy.
    pub fn set_resolver(&self, resolver: Box<dyn Resolver>) {
        *self.resolver.lock() = resolver;
    }

    /// Applies a read timeout so blocking receive loops can observe
    /// shutdown flags.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Resolves `addr` and sends `payload` as one RPC message: fragmented
    /// for the data types, as a single error packet otherwise. Each
    /// outgoing packet runs the `(type, role)` send chain first.
    pub fn send(
        &self,
        addr: &str,
        rpc_id: RpcId,
        payload: &[u8],
        packet_type: PacketTypeId,
        role: Role,
    ) -> Result<SocketAddr, RpcError> {
        let dest = self.resolver.lock().resolve(addr)?;
        self.send_to(dest, rpc_id, payload, packet_type, role)?;
        Ok(dest)
    }

    /// [`UdpTransport::send`] for an already-resolved destination.
    pub fn send_to(
        &self,
        dest: SocketAddr,
        rpc_id: RpcId,
        payload: &[u8],
        packet_type: PacketTypeId,
        role: Role,
    ) -> Result<(), RpcError> {
        if packet_type.is_data() {
            let src = self.source_endpoint(dest)?;
            let dst = Endpoint::from_socket_addr(dest);
            let fragments = self
                .fragmenter
                .fragment(packet_type, rpc_id, payload, src, dst)?;
            debug!(%rpc_id, %packet_type, count = fragments.len(), "sending fragments");
            for fragment in &fragments {
                let packet = Packet::Data(*fragment);
                self.chains.run_on_send(&packet, dest, role)?;
                self.sender.send_packet(&packet, dest)?;
            }
            Ok(())
        } else {
            let packet = Packet::Error(self.fragmenter.error_packet(rpc_id, payload));
            self.chains.run_on_send(&packet, dest, role)?;
            self.sender.send_packet(&packet, dest)
        }
    }

    /// The source endpoint stamped into outgoing quintuples. A socket
    /// bound to 0.0.0.0 learns its routed source address by connecting a
    /// throwaway socket toward the destination.
    fn source_endpoint(&self, dest: SocketAddr) -> Result<Endpoint, RpcError> {
        if self.local.ip != [0, 0, 0, 0] {
            return Ok(self.local);
        }
        let probe = UdpSocket::bind(("0.0.0.0", 0))?;
        probe.connect(dest)?;
        let routed = Endpoint::from_socket_addr(probe.local_addr()?);
        Ok(Endpoint::new(routed.ip, self.local.port))
    }

    /// Blocks for one datagram and processes it: decode, receive chain,
    /// then reassembly for data packets. The receive buffer is pooled and,
    /// for data packets, stays alive inside the reassembler until the
    /// message completes.
    pub fn receive(&self, buffer_size: usize, role: Role) -> Result<Received, RpcError> {
        let mut buf = self.pool.get(buffer_size);
        buf.resize(buffer_size, 0);
        let (len, peer) = match self.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(err) => {
                self.pool.put(buf);
                return Err(err.into());
            }
        };
        buf.truncate(len);

        enum Action {
            Data {
                header: DataHeader,
                payload_len: usize,
            },
            RemoteError {
                rpc_id: RpcId,
                message: String,
            },
            Control,
        }

        let action = {
            let packet = match self.registry.read().deserialize(&buf) {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(%peer, %err, "dropping undecodable datagram");
                    self.pool.put(buf);
                    return Ok(Received::Control);
                }
            };
            if !self.chains.run_on_receive(&packet, peer, role) {
                Action::Control
            } else {
                match &packet {
                    Packet::Data(p) => Action::Data {
                        header: p.header,
                        payload_len: p.payload.len(),
                    },
                    Packet::Error(p) => Action::RemoteError {
                        rpc_id: p.rpc_id,
                        message: p.message_lossy(),
                    },
                    // ACKs, feedback and extensions are fully consumed by
                    // their handler chains.
                    _ => Action::Control,
                }
            }
        };

        match action {
            Action::Data {
                header,
                payload_len,
            } => {
                let range = DATA_HEADER_LEN..DATA_HEADER_LEN + payload_len;
                match self
                    .reassembler
                    .insert(peer, &header, buf, range, Instant::now())
                {
                    Some(message) => Ok(Received::Message(message)),
                    None => Ok(Received::Control),
                }
            }
            Action::RemoteError { rpc_id, message } => {
                self.pool.put(buf);
                Ok(Received::RemoteError { rpc_id, message })
            }
            Action::Control => {
                self.pool.put(buf);
                Ok(Received::Control)
            }
        }
    }

    /// Shuts the timer worker down. Blocking receivers should be released
    /// separately via a read timeout.
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}
