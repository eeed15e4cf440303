use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};

macro_rules! wire_newtype {
    ($name:ident, $inner:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(val: $inner) -> Self {
                $name(val)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

wire_newtype!(
    RpcId,
    u64,
    "Unique identifier for one RPC, generated by the client at call time."
);

impl RpcId {
    /// Generates a fresh RPCID from the Unix-epoch nanosecond clock.
    ///
    /// A process-wide atomic keeps IDs strictly increasing even when the
    /// clock ticks coarsely; monotonicity is what makes derived packet IDs
    /// non-decreasing over a connection's life.
    pub fn generate() -> RpcId {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static LAST: AtomicU64 = AtomicU64::new(0);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut last = LAST.load(Ordering::Relaxed);
        loop {
            let next = nanos.max(last + 1);
            match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return RpcId(next),
                Err(current) => last = current,
            }
        }
    }
}

wire_newtype!(
    PacketId,
    u64,
    "Identifier for a single data fragment, derived from `(RPCID << 16) | SeqNumber`."
);

wire_newtype!(
    ConnectionKey,
    u64,
    "Packed `(IPv4 << 16) | port` identity of a peer endpoint."
);

/// An 8-bit packet type discriminator.
///
/// Values 0..=3 are reserved for the built-in types; the reliable and
/// congestion/flow-control extensions sit at fixed IDs 4..=6, and further
/// extensions are assigned sequentially from [`PacketTypeId::FIRST_DYNAMIC`]
/// by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PacketTypeId(pub u8);

impl PacketTypeId {
    pub const UNKNOWN: PacketTypeId = PacketTypeId(0);
    pub const REQUEST: PacketTypeId = PacketTypeId(1);
    pub const RESPONSE: PacketTypeId = PacketTypeId(2);
    pub const ERROR: PacketTypeId = PacketTypeId(3);
    pub const ACK: PacketTypeId = PacketTypeId(4);
    pub const CC_FEEDBACK: PacketTypeId = PacketTypeId(5);
    pub const FC_FEEDBACK: PacketTypeId = PacketTypeId(6);
    /// First ID handed out to dynamically registered extension types.
    pub const FIRST_DYNAMIC: PacketTypeId = PacketTypeId(7);

    /// True for the two fragmented data-carrying types.
    pub fn is_data(self) -> bool {
        self == Self::REQUEST || self == Self::RESPONSE
    }
}

impl fmt::Display for PacketTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "unknown"),
            Self::REQUEST => write!(f, "request"),
            Self::RESPONSE => write!(f, "response"),
            Self::ERROR => write!(f, "error"),
            Self::ACK => write!(f, "ack"),
            Self::CC_FEEDBACK => write!(f, "cc-feedback"),
            Self::FC_FEEDBACK => write!(f, "fc-feedback"),
            Self(other) => write!(f, "ext({other})"),
        }
    }
}

/// Derives the congestion-control packet ID from wire fields.
///
/// Both peers compute the same value for the same fragment, so no explicit
/// ID exchange is needed. RPCIDs are Unix-nanosecond timestamps, monotonic
/// within a process, which makes packet IDs monotonically non-decreasing
/// over the life of a connection.
pub fn make_packet_id(rpc_id: RpcId, seq_number: u16) -> PacketId {
    PacketId(rpc_id.0.wrapping_shl(16) | seq_number as u64)
}

/// One side of a flow: an IPv4 address and a port, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub ip: [u8; 4],
    pub port: u16,
}

impl Endpoint {
    pub const UNSPECIFIED: Endpoint = Endpoint {
        ip: [0; 4],
        port: 0,
    };

    pub fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    /// Extracts the IPv4 endpoint of `addr`. IPv6 peers are not modeled on
    /// the wire; mapped addresses fall back to their embedded IPv4 form.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self {
                ip: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => {
                let ip = v6
                    .ip()
                    .to_ipv4_mapped()
                    .map(|v4| v4.octets())
                    .unwrap_or([0; 4]);
                Self { ip, port: v6.port() }
            }
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip.into(), self.port))
    }

    /// Packs this endpoint into the 64-bit connection key: the four IP
    /// octets occupy the high 48 bits, the port the low 16.
    pub fn connection_key(self) -> ConnectionKey {
        let ip = u32::from_be_bytes(self.ip) as u64;
        ConnectionKey((ip << 16) | self.port as u16 as u64)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port
        )
    }
}

impl ConnectionKey {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Endpoint::from_socket_addr(addr).connection_key()
    }
}

/// The fixed fields of a [`DataPacket`], 29 bytes on the wire including the
/// payload length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub packet_type: PacketTypeId,
    pub rpc_id: RpcId,
    pub total_packets: u16,
    pub seq_number: u16,
    pub dst: Endpoint,
    pub src: Endpoint,
}

/// One fragment of a Request or Response message.
///
/// The payload borrows from the datagram it was decoded from; the receive
/// buffer must stay alive for as long as the slice is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub header: DataHeader,
    pub payload: &'a [u8],
}

impl DataPacket<'_> {
    pub fn to_owned(&self) -> OwnedDataPacket {
        OwnedDataPacket {
            header: self.header,
            payload: self.payload.to_vec(),
        }
    }

    /// The congestion-control identifier of this fragment.
    pub fn packet_id(&self) -> PacketId {
        make_packet_id(self.header.rpc_id, self.header.seq_number)
    }
}

/// An owned data packet, used where fragments outlive their carrier
/// datagram: the reliable handler's retransmission buffers and the proxy's
/// forwarding path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedDataPacket {
    pub header: DataHeader,
    pub payload: Vec<u8>,
}

impl OwnedDataPacket {
    pub fn borrow(&self) -> DataPacket<'_> {
        DataPacket {
            header: self.header,
            payload: &self.payload,
        }
    }
}

/// A single-datagram error report for one RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPacket<'a> {
    pub rpc_id: RpcId,
    pub message: &'a [u8],
}

impl ErrorPacket<'_> {
    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(self.message).into_owned()
    }
}

/// Which half of the exchange an ACK covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckKind {
    Request = 0,
    Response = 1,
}

impl AckKind {
    pub fn from_wire(val: u8) -> Option<Self> {
        match val {
            0 => Some(AckKind::Request),
            1 => Some(AckKind::Response),
            _ => None,
        }
    }
}

/// Message-level acknowledgment sent by the reliable handler once every
/// fragment of an RPC message has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket<'a> {
    pub rpc_id: RpcId,
    pub kind: AckKind,
    pub status: u8,
    /// Sender clock at ACK emission, microseconds since the Unix epoch.
    /// Zero when the sender did not stamp the ACK.
    pub timestamp_micros: u64,
    pub message: &'a [u8],
}

/// Batched receiver feedback for the congestion controller: every packet ID
/// seen since the last feedback emission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CcFeedbackPacket {
    pub acked_count: u32,
    pub acked_bytes: u64,
    pub packet_ids: Vec<PacketId>,
}

/// Receive-window advertisement, fixed 9 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FcFeedbackPacket {
    pub send_window: u64,
}

/// A packet of a dynamically registered extension type. The body is the
/// full datagram minus the leading type byte; interpretation belongs to the
/// extension's handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionPacket<'a> {
    pub type_id: PacketTypeId,
    pub body: &'a [u8],
}

/// Any decoded packet. Payload-bearing variants borrow from the datagram
/// buffer they were decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Data(DataPacket<'a>),
    Error(ErrorPacket<'a>),
    Ack(AckPacket<'a>),
    CcFeedback(CcFeedbackPacket),
    FcFeedback(FcFeedbackPacket),
    Extension(ExtensionPacket<'a>),
}

impl Packet<'_> {
    pub fn type_id(&self) -> PacketTypeId {
        match self {
            Packet::Data(p) => p.header.packet_type,
            Packet::Error(_) => PacketTypeId::ERROR,
            Packet::Ack(_) => PacketTypeId::ACK,
            Packet::CcFeedback(_) => PacketTypeId::CC_FEEDBACK,
            Packet::FcFeedback(_) => PacketTypeId::FC_FEEDBACK,
            Packet::Extension(p) => p.type_id,
        }
    }
}
