use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arpc_proto::{Packet, PacketTypeId};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::RpcError;

/// Chains are short; four inline slots cover the built-in handlers.
type Chain = SmallVec<[Arc<dyn Handler>; 4]>;

/// Which side of the RPC exchange a chain (or an endpoint) serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Stable index used to derive per-role timer keys.
    pub fn index(self) -> u64 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }
}

/// A per-packet-type middleware hook.
///
/// `on_send` observes each outgoing packet before transmission; for data
/// packets this means each *fragment*. `on_receive` observes each decoded
/// packet before reassembly. Extensions that need whole messages subscribe
/// at the RPC element chain instead.
pub trait Handler: Send + Sync {
    fn on_send(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError>;
    fn on_receive(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError>;
}

/// Ordered handler chains per `(packet type, role)`. The same handler value
/// may be registered in several chains. Built-in types start with empty
/// chains.
#[derive(Default)]
pub struct HandlerChains {
    chains: RwLock<HashMap<(PacketTypeId, Role), Chain>>,
}

impl HandlerChains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, type_id: PacketTypeId, role: Role, handler: Arc<dyn Handler>) {
        self.chains
            .write()
            .entry((type_id, role))
            .or_default()
            .push(handler);
    }

    /// Runs the send hooks in registration order. The first failing handler
    /// aborts the send.
    pub fn run_on_send(
        &self,
        packet: &Packet<'_>,
        peer: SocketAddr,
        role: Role,
    ) -> Result<(), RpcError> {
        let chain = {
            let chains = self.chains.read();
            match chains.get(&(packet.type_id(), role)) {
                Some(chain) => chain.clone(),
                None => return Ok(()),
            }
        };
        for handler in &chain {
            handler.on_send(packet, peer)?;
        }
        Ok(())
    }

    /// Runs the receive hooks in registration order. A failing handler is
    /// logged and drops the packet (returns false); no error propagates to
    /// the caller, since receive-side faults are recovered by
    /// retransmission rather than surfaced.
    pub fn run_on_receive(&self, packet: &Packet<'_>, peer: SocketAddr, role: Role) -> bool {
        let chain = {
            let chains = self.chains.read();
            match chains.get(&(packet.type_id(), role)) {
                Some(chain) => chain.clone(),
                None => return true,
            }
        };
        for handler in &chain {
            if let Err(err) = handler.on_receive(packet, peer) {
                match err {
                    RpcError::Duplicate => {
                        debug!(%peer, packet_type = %packet.type_id(), "dropping duplicate packet")
                    }
                    err => {
                        warn!(%peer, packet_type = %packet.type_id(), %err, "receive handler failed")
                    }
                }
                return false;
            }
        }
        true
    }
}
