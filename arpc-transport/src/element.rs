use std::net::SocketAddr;
use std::sync::Arc;

use arpc_proto::RpcId;

use crate::error::RpcError;

/// Per-call context threaded through the element chain.
#[derive(Debug, Clone)]
pub struct ElementContext {
    /// Remote peer, when known (set on the server side).
    pub peer: Option<SocketAddr>,
    pub rpc_id: RpcId,
    pub service_id: u32,
    pub method_id: u32,
}

/// Middleware over whole RPC messages: admission control, circuit
/// breaking, bandwidth limiting and similar concerns compose here, not in
/// the per-fragment handler chains.
///
/// Either hook may transform the payload or short-circuit with an error,
/// which surfaces to the caller as an element rejection.
pub trait RpcElement: Send + Sync {
    fn process_request(
        &self,
        _ctx: &mut ElementContext,
        req: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        Ok(req)
    }

    fn process_response(
        &self,
        _ctx: &mut ElementContext,
        resp: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        Ok(resp)
    }
}

/// An ordered element list. Requests traverse in declared order,
/// responses in reverse.
#[derive(Clone, Default)]
pub struct ElementChain {
    elements: Vec<Arc<dyn RpcElement>>,
}

impl ElementChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, element: Arc<dyn RpcElement>) {
        self.elements.push(element);
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn process_request(
        &self,
        ctx: &mut ElementContext,
        mut req: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        for element in &self.elements {
            req = element.process_request(ctx, req)?;
        }
        Ok(req)
    }

    pub fn process_response(
        &self,
        ctx: &mut ElementContext,
        mut resp: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        for element in self.elements.iter().rev() {
            resp = element.process_response(ctx, resp)?;
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag(u8);

    impl RpcElement for Tag {
        fn process_request(
            &self,
            _ctx: &mut ElementContext,
            mut req: Vec<u8>,
        ) -> Result<Vec<u8>, RpcError> {
            req.push(self.0);
            Ok(req)
        }

        fn process_response(
            &self,
            _ctx: &mut ElementContext,
            mut resp: Vec<u8>,
        ) -> Result<Vec<u8>, RpcError> {
            resp.push(self.0);
            Ok(resp)
        }
    }

    fn ctx() -> ElementContext {
        ElementContext {
            peer: None,
            rpc_id: RpcId(1),
            service_id: 0,
            method_id: 0,
        }
    }

    #[test]
    fn test_request_forward_response_reverse() {
        let mut chain = ElementChain::new();
        chain.push(Arc::new(Tag(1)));
        chain.push(Arc::new(Tag(2)));

        let req = chain.process_request(&mut ctx(), vec![]).unwrap();
        assert_eq!(req, vec![1, 2]);

        let resp = chain.process_response(&mut ctx(), vec![]).unwrap();
        assert_eq!(resp, vec![2, 1]);
    }

    #[test]
    fn test_element_short_circuit() {
        struct Reject;
        impl RpcElement for Reject {
            fn process_request(
                &self,
                _ctx: &mut ElementContext,
                _req: Vec<u8>,
            ) -> Result<Vec<u8>, RpcError> {
                Err(RpcError::ElementReject("quota exceeded".to_string()))
            }
        }

        let mut chain = ElementChain::new();
        chain.push(Arc::new(Reject));
        chain.push(Arc::new(Tag(9)));
        assert!(matches!(
            chain.process_request(&mut ctx(), vec![]),
            Err(RpcError::ElementReject(_))
        ));
    }
}
