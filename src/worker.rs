//! Worker pool and per-request dispatch.
//!
//! Workers pull [`RpcMessage`]s off the shared [`RequestQueue`], screen
//! them (program table, then credentials), invoke the installed
//! [`RpcProcessor`], and push any reply back through the message's
//! reply sink. Packet buffers return to their pool when dropped, so a
//! request abandoned at shutdown can never strand a pooled buffer.
//!
//! A processing error is logged and the request is dropped without a
//! reply; the worker keeps running. Shutdown cancels the pool's token:
//! every worker observes it at the top of its loop or inside the
//! blocking dequeue and stops without taking further items.
//!
//! With a worker count of zero the engine runs in inline mode: the
//! session layers invoke the same dispatch path synchronously on the
//! I/O task, with no queue in between.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::RpcAuthenticator;
use crate::error::RpcError;
use crate::processor::{RpcProcessor, RpcProgram};
use crate::protocol::wire::{accept_status, auth_status};
use crate::protocol::RpcPacket;
use crate::queue::RequestQueue;
use crate::transport::RpcMessage;

/// Fewest workers a multi-threaded pool may run with.
pub const MIN_WORKERS: usize = 1;

/// Most workers a pool may run with.
pub const MAX_WORKERS: usize = 64;

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 8;

/// Outcome of screening a call before the processor sees it.
enum Screen {
    /// Hand the call to the processor.
    Pass,
    /// A reject reply has been built into the packet; send it back.
    Reject,
    /// The call is too malformed to answer; drop it.
    Drop(RpcError),
}

/// Shared dispatch path: screening plus processor invocation.
///
/// Used by every worker, and directly by the session layers in inline
/// (zero-worker) mode.
pub struct RequestHandler {
    processor: Arc<dyn RpcProcessor>,
    authenticator: Arc<dyn RpcAuthenticator>,
    programs: Vec<RpcProgram>,
}

impl RequestHandler {
    /// Create a handler. An empty program table disables the
    /// program/version screen (the processor answers for everything).
    pub fn new(
        processor: Arc<dyn RpcProcessor>,
        authenticator: Arc<dyn RpcAuthenticator>,
        programs: Vec<RpcProgram>,
    ) -> Self {
        Self {
            processor,
            authenticator,
            programs,
        }
    }

    /// Run one request to completion: screen, process, reply.
    pub async fn handle(&self, msg: RpcMessage) {
        let RpcMessage {
            mut packet,
            endpoint,
            sink,
        } = msg;

        match self.screen(&mut packet).await {
            Screen::Pass => match self.processor.process(packet, &endpoint).await {
                Ok(Some(reply)) => {
                    if let Err(e) = sink.send(reply, &endpoint).await {
                        tracing::debug!(peer = %endpoint, "reply discarded: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(peer = %endpoint, "request processing failed: {}", e);
                }
            },
            Screen::Reject => {
                if let Err(e) = sink.send(packet, &endpoint).await {
                    tracing::debug!(peer = %endpoint, "reject reply discarded: {}", e);
                }
            }
            Screen::Drop(e) => {
                tracing::warn!(peer = %endpoint, "malformed request dropped: {}", e);
            }
        }
    }

    /// Program-table and credential screening. On rejection the reply
    /// is built in place over the request packet.
    async fn screen(&self, packet: &mut RpcPacket) -> Screen {
        if !self.programs.is_empty() {
            let program = match packet.program_id() {
                Ok(p) => p,
                Err(e) => return Screen::Drop(e),
            };
            match self.programs.iter().find(|p| p.program == program) {
                None => {
                    return match packet.build_error_reply(accept_status::PROG_UNAVAIL) {
                        Ok(()) => Screen::Reject,
                        Err(e) => Screen::Drop(e),
                    };
                }
                Some(entry) => {
                    let version = match packet.program_version() {
                        Ok(v) => v,
                        Err(e) => return Screen::Drop(e),
                    };
                    if version < entry.low_version || version > entry.high_version {
                        return match packet
                            .build_program_mismatch(entry.low_version, entry.high_version)
                        {
                            Ok(()) => Screen::Reject,
                            Err(e) => Screen::Drop(e),
                        };
                    }
                }
            }
        }

        let cred_type = match packet.credential_type() {
            Ok(c) => c,
            Err(e) => return Screen::Drop(e),
        };
        if !self.authenticator.supported_types().contains(&cred_type) {
            return match packet.build_auth_failure(auth_status::TOO_WEAK) {
                Ok(()) => Screen::Reject,
                Err(e) => Screen::Drop(e),
            };
        }
        match self.authenticator.identify(cred_type, packet).await {
            Ok(_key) => Screen::Pass,
            Err(RpcError::AuthFailure(code)) => match packet.build_auth_failure(code) {
                Ok(()) => Screen::Reject,
                Err(e) => Screen::Drop(e),
            },
            Err(e) => Screen::Drop(e),
        }
    }
}

/// How the session layers hand off decoded requests.
#[derive(Clone)]
pub enum Dispatch {
    /// Enqueue for the worker pool.
    Queued(Arc<RequestQueue<RpcMessage>>),
    /// Process synchronously on the I/O task (zero-worker mode).
    Inline(Arc<RequestHandler>),
}

impl Dispatch {
    /// Submit one decoded request.
    pub async fn submit(&self, msg: RpcMessage) {
        match self {
            Dispatch::Queued(queue) => queue.enqueue(msg),
            Dispatch::Inline(handler) => handler.handle(msg).await,
        }
    }
}

/// A fixed set of workers draining the request queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    token: CancellationToken,
    workers: usize,
}

impl WorkerPool {
    /// Spawn `count` workers (clamped to `[MIN_WORKERS, MAX_WORKERS]`)
    /// sharing `queue` and `handler`. The pool stops when `parent` is
    /// cancelled or [`shutdown`](Self::shutdown) is called.
    pub fn spawn(
        count: usize,
        queue: Arc<RequestQueue<RpcMessage>>,
        handler: Arc<RequestHandler>,
        parent: &CancellationToken,
    ) -> Self {
        let workers = count.clamp(MIN_WORKERS, MAX_WORKERS);
        let token = parent.child_token();

        let handles = (0..workers)
            .map(|id| {
                let queue = queue.clone();
                let handler = handler.clone();
                let token = token.clone();
                tokio::spawn(worker_loop(id, queue, handler, token))
            })
            .collect();

        Self {
            handles,
            token,
            workers,
        }
    }

    /// Number of workers running.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Cancel the workers and wait for them to exit. Queued requests
    /// are abandoned; their packets return to the pool on drop.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<RequestQueue<RpcMessage>>,
    handler: Arc<RequestHandler>,
    token: CancellationToken,
) {
    tracing::debug!(worker = id, "worker started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = queue.dequeue() => handler.handle(msg).await,
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}
