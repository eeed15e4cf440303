//! # aRPC Transport
//!
//! A datagram-oriented RPC transport over UDP: message fragmentation and
//! sharded reassembly, optional message-level reliability (ACKs and
//! retransmission), CUBIC congestion control driven by batched receiver
//! feedback, and flow control with receive-window advertisement.
//!
//! ## Architecture
//!
//! - **Transport**: one blocking UDP socket per [`UdpTransport`], with a
//!   packet registry, per-type/per-role handler chains, a size-classed
//!   buffer pool and a keyed timer manager around it.
//! - **Reliability**: whole messages are acknowledged, not fragments; the
//!   sender buffers segment copies and retransmits them on a timer until
//!   the message-level ACK lands.
//! - **Congestion control**: both peers derive identical per-fragment
//!   packet IDs from wire fields, so receiver feedback (batched packet-ID
//!   lists) drives a CUBIC sender without any ID negotiation.
//! - **Flow control**: byte-offset windows per connection, advertised by
//!   the receiver once a quarter of the window is consumed.
//! - **RPC layer**: a client with per-RPCID response channels behind one
//!   dispatcher thread, a server with a worker pool, and an element chain
//!   for message-level middleware on both.

pub mod bitset;
pub mod client;
pub mod congestion;
pub mod element;
pub mod error;
pub mod flow;
pub mod fragment;
pub mod handler;
pub mod pool;
pub mod reassembly;
pub mod reliable;
pub mod resolver;
pub mod rtt;
pub mod server;
pub mod timer;
pub mod transport;

pub use client::{ClientConfig, RpcClient};
pub use congestion::{CcConfig, CcHandler, CongestionControl, CubicSender};
pub use element::{ElementChain, ElementContext, RpcElement};
pub use error::{RpcError, RpcErrorKind};
pub use flow::{ConnectionFlowController, FcConfig, FcHandler, FlowConfig};
pub use fragment::Fragmenter;
pub use handler::{Handler, HandlerChains, Role};
pub use pool::BufferPool;
pub use reassembly::{CompleteMessage, Reassembler};
pub use reliable::{ReliableConfig, ReliableHandler};
pub use resolver::{RandomResolver, Resolver, RoundRobinResolver};
pub use rtt::RttEstimator;
pub use server::{MethodHandler, RequestContext, RpcServer, ServerConfig};
pub use timer::TimerManager;
pub use transport::{Received, TransportConfig, TransportSender, UdpTransport};
