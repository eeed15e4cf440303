use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arpc_proto::{PacketTypeId, RpcId, SymphonyHeader};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::element::{ElementChain, ElementContext};
use crate::error::RpcError;
use crate::handler::Role;
use crate::reassembly::CompleteMessage;
use crate::transport::{Received, UdpTransport};

/// Context handed to service method handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: SocketAddr,
    pub rpc_id: RpcId,
    pub service_id: u32,
    pub method_id: u32,
}

/// A registered method implementation: receives the Symphony-framed
/// request payload, returns the framed response payload.
pub type MethodHandler =
    Arc<dyn Fn(&RequestContext, &[u8]) -> Result<Vec<u8>, RpcError> + Send + Sync>;

/// RPC server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker threads handling dispatched requests, so one slow handler
    /// never stalls other RPCs.
    pub workers: usize,
    pub receive_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            receive_buffer: 64 * 1024,
        }
    }
}

struct ServerInner {
    transport: Arc<UdpTransport>,
    services: RwLock<HashMap<u32, HashMap<u32, MethodHandler>>>,
    elements: ElementChain,
    config: ServerConfig,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// RPC server over one transport: a receive loop feeding a worker pool
/// that dispatches requests by the service/method IDs in the Symphony
/// header. Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(transport: Arc<UdpTransport>, elements: ElementChain, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                transport,
                services: RwLock::new(HashMap::new()),
                elements,
                config,
                shutdown: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a method handler; replaces an existing registration.
    pub fn register_method(&self, service_id: u32, method_id: u32, handler: MethodHandler) {
        self.inner
            .services
            .write()
            .entry(service_id)
            .or_default()
            .insert(method_id, handler);
    }

    /// Spawns the receive loop and worker pool.
    pub fn start(&self) -> Result<(), RpcError> {
        self.inner
            .transport
            .set_read_timeout(Some(Duration::from_millis(100)))?;
        info!(addr = %self.inner.transport.local_addr()?, "rpc server listening");

        let (job_tx, job_rx): (Sender<CompleteMessage>, Receiver<CompleteMessage>) = unbounded();
        let mut threads = self.inner.threads.lock();

        for worker_id in 0..self.inner.config.workers.max(1) {
            let server = self.clone();
            let job_rx = job_rx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("arpc-server-worker-{worker_id}"))
                    .spawn(move || {
                        for message in job_rx.iter() {
                            server.handle(message);
                        }
                    })
                    .expect("spawning server worker"),
            );
        }

        let server = self.clone();
        threads.push(
            thread::Builder::new()
                .name("arpc-server-recv".to_string())
                .spawn(move || server.receive_loop(job_tx))
                .expect("spawning server receive loop"),
        );
        Ok(())
    }

    fn receive_loop(&self, job_tx: Sender<CompleteMessage>) {
        while !self.inner.shutdown.load(Ordering::Relaxed) {
            match self
                .inner
                .transport
                .receive(self.inner.config.receive_buffer, Role::Server)
            {
                Ok(Received::Message(message)) => {
                    if message.packet_type == PacketTypeId::REQUEST {
                        let _ = job_tx.send(message);
                    } else {
                        debug!(
                            rpc_id = %message.rpc_id,
                            packet_type = %message.packet_type,
                            "server dropping non-request message"
                        );
                        self.inner.transport.pool().put(message.payload);
                    }
                }
                Ok(Received::RemoteError { rpc_id, message }) => {
                    warn!(%rpc_id, message, "peer reported error");
                }
                Ok(Received::Control) => {}
                Err(RpcError::Io(err))
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                }
                Err(err) => warn!(%err, "server receive failed"),
            }
        }
        // Dropping job_tx here drains the workers.
    }

    fn handle(&self, message: CompleteMessage) {
        let rpc_id = message.rpc_id;
        let peer = message.remote;
        let result = self.dispatch(&message);
        self.inner.transport.pool().put(message.payload);

        match result {
            Ok(response) => {
                if let Err(err) = self.inner.transport.send_to(
                    peer,
                    rpc_id,
                    &response,
                    PacketTypeId::RESPONSE,
                    Role::Server,
                ) {
                    warn!(%rpc_id, %err, "failed to send response");
                }
            }
            Err(err) => {
                debug!(%rpc_id, %err, "request failed, reporting to peer");
                if let Err(send_err) = self.inner.transport.send_to(
                    peer,
                    rpc_id,
                    err.to_string().as_bytes(),
                    PacketTypeId::ERROR,
                    Role::Server,
                ) {
                    warn!(%rpc_id, %send_err, "failed to send error packet");
                }
            }
        }
    }

    fn dispatch(&self, message: &CompleteMessage) -> Result<Vec<u8>, RpcError> {
        let header = SymphonyHeader::parse(&message.payload)
            .map_err(|err| RpcError::RemoteFail(format!("bad request framing: {err}")))?;

        let handler = {
            let services = self.inner.services.read();
            services
                .get(&header.service_id)
                .and_then(|methods| methods.get(&header.method_id))
                .cloned()
        }
        .ok_or(RpcError::UnknownMethod {
            service: header.service_id,
            method: header.method_id,
        })?;

        let mut ctx = ElementContext {
            peer: Some(message.remote),
            rpc_id: message.rpc_id,
            service_id: header.service_id,
            method_id: header.method_id,
        };
        let request = self
            .inner
            .elements
            .process_request(&mut ctx, message.payload.clone())?;

        let request_ctx = RequestContext {
            peer: message.remote,
            rpc_id: message.rpc_id,
            service_id: header.service_id,
            method_id: header.method_id,
        };
        let response = handler(&request_ctx, &request)?;
        self.inner.elements.process_response(&mut ctx, response)
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.inner.transport
    }

    /// Stops the receive loop and drains the worker pool. Must be called
    /// from outside the server's own threads.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        for handle in self.inner.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
