use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arpc_proto::{PacketTypeId, RpcId, symphony};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::element::{ElementChain, ElementContext};
use crate::error::RpcError;
use crate::handler::Role;
use crate::transport::{Received, UdpTransport};

/// RPC client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub call_timeout: Duration,
    /// Receive buffer handed to the transport per datagram.
    pub receive_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            receive_buffer: 64 * 1024,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<RpcId, Sender<Result<Vec<u8>, RpcError>>>>>;

/// RPC client over one transport toward one target address.
///
/// A dedicated dispatcher thread drives the transport's receive loop and
/// routes completed responses to waiting callers by RPCID; responses
/// nobody waits for are dropped with their buffers returned to the pool.
pub struct RpcClient {
    transport: Arc<UdpTransport>,
    target: String,
    elements: ElementChain,
    config: ClientConfig,
    pending: PendingMap,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    pub fn new(
        transport: Arc<UdpTransport>,
        target: impl Into<String>,
        elements: ElementChain,
        config: ClientConfig,
    ) -> Arc<Self> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        // A short read timeout lets the dispatcher observe shutdown.
        if let Err(err) = transport.set_read_timeout(Some(Duration::from_millis(100))) {
            warn!(%err, "could not set read timeout");
        }

        let dispatcher = {
            let transport = transport.clone();
            let pending = pending.clone();
            let shutdown = shutdown.clone();
            let receive_buffer = config.receive_buffer;
            thread::Builder::new()
                .name("arpc-client-dispatch".to_string())
                .spawn(move || {
                    Self::dispatch_loop(&transport, &pending, &shutdown, receive_buffer)
                })
                .expect("spawning client dispatcher")
        };

        Arc::new(Self {
            transport,
            target: target.into(),
            elements,
            config,
            pending,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    fn dispatch_loop(
        transport: &UdpTransport,
        pending: &PendingMap,
        shutdown: &AtomicBool,
        receive_buffer: usize,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            match transport.receive(receive_buffer, Role::Client) {
                Ok(Received::Message(message)) => {
                    let waiter = pending.lock().remove(&message.rpc_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Ok(message.payload));
                        }
                        None => {
                            // Late response after timeout or cancellation.
                            debug!(rpc_id = %message.rpc_id, "response without waiter dropped");
                            transport.pool().put(message.payload);
                        }
                    }
                }
                Ok(Received::RemoteError { rpc_id, message }) => {
                    if let Some(tx) = pending.lock().remove(&rpc_id) {
                        let _ = tx.send(Err(RpcError::RemoteFail(message)));
                    }
                }
                Ok(Received::Control) => {}
                Err(RpcError::Io(err))
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                }
                Err(err) => warn!(%err, "client receive failed"),
            }
        }
    }

    /// Calls `service/method` with a Symphony-framed request payload and
    /// blocks until the response arrives or the default timeout passes.
    /// The service and method IDs are stamped into the framing header.
    pub fn call(&self, service_id: u32, method_id: u32, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.call_with_timeout(service_id, method_id, request, self.config.call_timeout)
    }

    pub fn call_with_timeout(
        &self,
        service_id: u32,
        method_id: u32,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let rpc_id = RpcId::generate();
        let mut ctx = ElementContext {
            peer: None,
            rpc_id,
            service_id,
            method_id,
        };

        let mut payload = self.elements.process_request(&mut ctx, request.to_vec())?;
        symphony::set_service_method(&mut payload, service_id, method_id)
            .map_err(|_| RpcError::RemoteFail("request payload too short".to_string()))?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pending.lock().insert(rpc_id, tx);

        if let Err(err) = self.transport.send(
            &self.target,
            rpc_id,
            &payload,
            PacketTypeId::REQUEST,
            Role::Client,
        ) {
            self.pending.lock().remove(&rpc_id);
            return Err(err);
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(response)) => self.elements.process_response(&mut ctx, response),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                // Deregister so a late response is dropped, not delivered.
                self.pending.lock().remove(&rpc_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Cancels a pending call: the waiter is released with a cancellation
    /// error and any late response will be dropped.
    pub fn cancel(&self, rpc_id: RpcId) -> bool {
        match self.pending.lock().remove(&rpc_id) {
            Some(tx) => {
                let _ = tx.send(Err(RpcError::Canceled));
                true
            }
            None => false,
        }
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
