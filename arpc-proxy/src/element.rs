use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use arpc_proto::{Endpoint, RpcId};

/// Whether a message travels toward the service or back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Context handed to proxy elements alongside the payload.
#[derive(Debug, Clone, Copy)]
pub struct ProxyContext {
    pub rpc_id: RpcId,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub direction: Direction,
}

/// Element decision for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Abort forwarding; the reason travels back to the source in an
    /// error packet.
    Drop(String),
}

/// Middleware over fully reassembled, decrypted public payloads.
///
/// Elements may rewrite the payload in place. Default implementations
/// pass everything, so one-sided elements implement only the hook they
/// care about.
pub trait ProxyElement: Send + Sync {
    fn process_request(&self, _ctx: &ProxyContext, _payload: &mut Vec<u8>) -> Verdict {
        Verdict::Pass
    }

    fn process_response(&self, _ctx: &ProxyContext, _payload: &mut Vec<u8>) -> Verdict {
        Verdict::Pass
    }
}

/// An ordered proxy element list; requests traverse forward, responses in
/// reverse.
#[derive(Default)]
pub struct ProxyElementChain {
    elements: Vec<Arc<dyn ProxyElement>>,
}

impl ProxyElementChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, element: Arc<dyn ProxyElement>) {
        self.elements.push(element);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn run(&self, ctx: &ProxyContext, payload: &mut Vec<u8>) -> Verdict {
        match ctx.direction {
            Direction::Request => {
                for element in &self.elements {
                    if let Verdict::Drop(reason) = element.process_request(ctx, payload) {
                        return Verdict::Drop(reason);
                    }
                }
            }
            Direction::Response => {
                for element in self.elements.iter().rev() {
                    if let Verdict::Drop(reason) = element.process_response(ctx, payload) {
                        return Verdict::Drop(reason);
                    }
                }
            }
        }
        Verdict::Pass
    }
}

/// The active element chain behind a lock-free pointer: the data path
/// loads it per message while operators swap in replacements atomically.
pub struct ChainHolder {
    chain: ArcSwap<ProxyElementChain>,
}

impl ChainHolder {
    pub fn new(chain: ProxyElementChain) -> Self {
        Self {
            chain: ArcSwap::from_pointee(chain),
        }
    }

    pub fn load(&self) -> Arc<ProxyElementChain> {
        self.chain.load_full()
    }

    pub fn swap(&self, chain: ProxyElementChain) {
        self.chain.store(Arc::new(chain));
    }
}

type ElementConstructor = Arc<dyn Fn() -> Arc<dyn ProxyElement> + Send + Sync>;

/// Named element constructors.
///
/// This is the in-process replacement for the dynamic plugin loader: how
/// element implementations arrive (static registration here, dylibs in
/// other deployments) is outside the data path, which only ever sees the
/// assembled chain.
#[derive(Default)]
pub struct ElementRegistry {
    constructors: HashMap<String, ElementConstructor>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn ProxyElement> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    /// Builds a chain from element names, in order. Unknown names are
    /// reported rather than skipped.
    pub fn build_chain(&self, names: &[String]) -> Result<ProxyElementChain, String> {
        let mut chain = ProxyElementChain::new();
        for name in names {
            let constructor = self
                .constructors
                .get(name)
                .ok_or_else(|| format!("unknown element {name:?}"))?;
            chain.push(constructor());
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(direction: Direction) -> ProxyContext {
        ProxyContext {
            rpc_id: RpcId(1),
            src: Endpoint::new([1, 1, 1, 1], 1),
            dst: Endpoint::new([2, 2, 2, 2], 2),
            direction,
        }
    }

    struct Append(u8);
    impl ProxyElement for Append {
        fn process_request(&self, _ctx: &ProxyContext, payload: &mut Vec<u8>) -> Verdict {
            payload.push(self.0);
            Verdict::Pass
        }
        fn process_response(&self, _ctx: &ProxyContext, payload: &mut Vec<u8>) -> Verdict {
            payload.push(self.0);
            Verdict::Pass
        }
    }

    #[test]
    fn test_direction_ordering() {
        let mut chain = ProxyElementChain::new();
        chain.push(Arc::new(Append(1)));
        chain.push(Arc::new(Append(2)));

        let mut payload = Vec::new();
        assert_eq!(chain.run(&ctx(Direction::Request), &mut payload), Verdict::Pass);
        assert_eq!(payload, vec![1, 2]);

        let mut payload = Vec::new();
        assert_eq!(chain.run(&ctx(Direction::Response), &mut payload), Verdict::Pass);
        assert_eq!(payload, vec![2, 1]);
    }

    #[test]
    fn test_drop_short_circuits() {
        struct Block;
        impl ProxyElement for Block {
            fn process_request(&self, _ctx: &ProxyContext, _payload: &mut Vec<u8>) -> Verdict {
                Verdict::Drop("blocked".to_string())
            }
        }

        let mut chain = ProxyElementChain::new();
        chain.push(Arc::new(Block));
        chain.push(Arc::new(Append(7)));

        let mut payload = Vec::new();
        assert_eq!(
            chain.run(&ctx(Direction::Request), &mut payload),
            Verdict::Drop("blocked".to_string())
        );
        assert!(payload.is_empty(), "later elements never ran");
    }

    #[test]
    fn test_registry_and_swap() {
        let mut registry = ElementRegistry::new();
        registry.register("append-nine", || Arc::new(Append(9)));

        let holder = ChainHolder::new(ProxyElementChain::new());
        assert!(holder.load().is_empty());

        let chain = registry
            .build_chain(&["append-nine".to_string()])
            .unwrap();
        holder.swap(chain);
        assert_eq!(holder.load().len(), 1);

        assert!(registry.build_chain(&["missing".to_string()]).is_err());
    }
}
