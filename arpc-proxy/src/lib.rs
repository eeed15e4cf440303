//! # aRPC Buffering Proxy
//!
//! A sidecar that intercepts aRPC datagrams on a set of UDP ports,
//! reassembles each RPC's fragments, runs an element chain over the
//! complete (optionally decrypted) public payload, and re-fragments the
//! result onto the wire toward the original destination. Elements decide
//! per message: pass and forward, or drop and report the reason back to
//! the source.

pub mod element;
pub mod proxy;

pub use element::{
    ChainHolder, Direction, ElementRegistry, ProxyContext, ProxyElement, ProxyElementChain,
    Verdict,
};
pub use proxy::{BufferingProxy, ProxyConfig};
