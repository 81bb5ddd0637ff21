//! # umbra-rpc
//!
//! The RPC substrate: named procedures with typed key/value parameter
//! bags, synchronous and asynchronous completion, over the connection
//! manager's sub-message transport.
//!
//! Callers use [`RpcEngine::start`] with an absolute timeout; the engine
//! schedules an abort job on the cron substrate and guarantees the
//! completion callback fires exactly once: with the result parameters on
//! success, with empty parameters on timeout. Callees register procedures
//! by name; asynchronous procedures receive a [`Responder`] and complete
//! whenever they are ready.
//!
//! No retransmission: an RPC is one request and at most one reply, carried
//! best-effort. Retries are the caller's policy.

pub mod params;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use umbra_core::stats::StatHandle;
use umbra_core::ConnectionManager;
use umbra_cron::{Cron, JobId};
use umbra_crypto::PeerId;
use umbra_proto::framing::SubMessage;
use umbra_proto::messages::{MSG_RPC_REQ, MSG_RPC_RES};

pub use params::RpcParams;

/// Error code: success.
pub const RPC_OK: u32 = 0;
/// Error code: no such procedure at the callee.
pub const RPC_ERROR_UNKNOWN_PROCEDURE: u32 = 1;
/// Error code: the callee rejected the arguments.
pub const RPC_ERROR_MALFORMED_ARGS: u32 = 2;
/// Error code: the callee failed internally.
pub const RPC_ERROR_INTERNAL: u32 = 3;

/// Error types for RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A named parameter is missing or has the wrong length.
    #[error("malformed argument: {0}")]
    MalformedArgument(String),

    /// The request or reply could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(String),

    /// The connection core refused the send.
    #[error("send failed: {0}")]
    Send(#[from] umbra_core::CoreError),

    /// The call handle is unknown (already completed or stopped).
    #[error("unknown call")]
    UnknownCall,
}

/// Convenience result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// How a call completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcStatus {
    /// Reply received; parameters are the callee's results.
    Ok,
    /// The absolute deadline fired first; parameters are empty.
    Timeout,
    /// The callee reported an error code.
    Error(u32),
}

/// Completion callback: invoked exactly once per started call.
pub type CompletionFn = Box<dyn FnOnce(RpcStatus, RpcParams) + Send>;

/// A synchronous procedure: returns result parameters or an error code.
pub type SyncProcedure =
    Arc<dyn Fn(&PeerId, &RpcParams) -> std::result::Result<RpcParams, u32> + Send + Sync>;

/// An asynchronous procedure: completes through the [`Responder`].
pub type AsyncProcedure = Arc<dyn Fn(&PeerId, &RpcParams, Responder) + Send + Sync>;

enum Procedure {
    Sync(SyncProcedure),
    Async(AsyncProcedure),
}

/// Handle to an outstanding call, used to stop it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RpcHandle(u64);

struct OutstandingCall {
    completion: CompletionFn,
    abort_job: JobId,
}

/// Completion capability handed to asynchronous procedures.
///
/// Dropping a responder without calling [`respond`](Self::respond) leaves
/// the caller to its timeout.
pub struct Responder {
    engine: Weak<RpcEngine>,
    peer: PeerId,
    call_id: u64,
    importance: u32,
}

impl Responder {
    /// Send the reply. Consumes the responder; a procedure completes once.
    pub fn respond(self, result: std::result::Result<RpcParams, u32>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.send_reply(&self.peer, self.call_id, self.importance, result);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    call_id: u64,
    importance: u32,
    name: String,
    params: RpcParams,
}

#[derive(Serialize, Deserialize)]
struct WireReply {
    call_id: u64,
    error_code: u32,
    params: RpcParams,
}

/// The RPC engine. One per node.
pub struct RpcEngine {
    cm: Arc<ConnectionManager>,
    cron: Arc<Cron>,
    procedures: RwLock<HashMap<String, Procedure>>,
    calls: Mutex<HashMap<u64, OutstandingCall>>,
    next_call: AtomicU64,
    stat_started: StatHandle,
    stat_completed: StatHandle,
    stat_timeout: StatHandle,
    stat_served: StatHandle,
}

/// How long a reply may linger in the send queue before it must flush.
const REPLY_DELAY: Duration = Duration::from_millis(100);

impl RpcEngine {
    /// Create the engine and register its message handlers.
    pub fn new(cm: Arc<ConnectionManager>, cron: Arc<Cron>) -> Arc<Self> {
        let stats = cm.stats();
        let engine = Arc::new(Self {
            stat_started: stats.create("# rpc calls started"),
            stat_completed: stats.create("# rpc calls completed"),
            stat_timeout: stats.create("# rpc calls timed out"),
            stat_served: stats.create("# rpc requests served"),
            cm: Arc::clone(&cm),
            cron,
            procedures: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
        });

        let req_engine = Arc::downgrade(&engine);
        cm.register_handler(
            MSG_RPC_REQ,
            Arc::new(move |sender, payload| match req_engine.upgrade() {
                Some(e) => e.handle_request(sender, payload),
                None => false,
            }),
        );
        let res_engine = Arc::downgrade(&engine);
        cm.register_handler(
            MSG_RPC_RES,
            Arc::new(move |sender, payload| match res_engine.upgrade() {
                Some(e) => e.handle_reply(sender, payload),
                None => false,
            }),
        );
        engine
    }

    /// Register a synchronous procedure. Replaces any previous registration
    /// under the name.
    pub fn register(&self, name: &str, procedure: SyncProcedure) {
        self.write_procedures()
            .insert(name.to_string(), Procedure::Sync(procedure));
    }

    /// Register an asynchronous procedure.
    pub fn register_async(&self, name: &str, procedure: AsyncProcedure) {
        self.write_procedures()
            .insert(name.to_string(), Procedure::Async(procedure));
    }

    /// Remove a registration.
    pub fn unregister(&self, name: &str) {
        self.write_procedures().remove(name);
    }

    /// Start a call. The completion callback fires exactly once: with the
    /// reply, or with empty parameters when `timeout` elapses first.
    pub fn start(
        self: &Arc<Self>,
        peer: &PeerId,
        name: &str,
        params: RpcParams,
        importance: u32,
        timeout: Duration,
        completion: CompletionFn,
    ) -> Result<RpcHandle> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let request = WireRequest {
            call_id,
            importance,
            name: name.to_string(),
            params,
        };
        let payload = encode(&request)?;

        let weak = Arc::downgrade(self);
        let abort_job = self.cron.add(
            timeout,
            Duration::ZERO,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.timeout_call(call_id);
                }
            }),
        );
        self.lock_calls().insert(
            call_id,
            OutstandingCall {
                completion,
                abort_job,
            },
        );
        self.cm.stats().change(self.stat_started, 1);

        if let Err(e) = self.cm.send(
            peer,
            SubMessage::new(MSG_RPC_REQ, payload),
            importance,
            REPLY_DELAY,
        ) {
            // Undo: the peer is unreachable, fail the call immediately.
            if let Some(call) = self.lock_calls().remove(&call_id) {
                self.cron.remove(call.abort_job);
            }
            return Err(e.into());
        }
        Ok(RpcHandle(call_id))
    }

    /// Cancel an outstanding call. The completion callback will not run.
    /// A no-op if the call already completed.
    pub fn stop(&self, handle: RpcHandle) {
        if let Some(call) = self.lock_calls().remove(&handle.0) {
            self.cron.remove(call.abort_job);
        }
    }

    /// Outstanding call count.
    pub fn outstanding(&self) -> usize {
        self.lock_calls().len()
    }

    // -- internals ----------------------------------------------------------

    fn handle_request(self: &Arc<Self>, sender: &PeerId, payload: &[u8]) -> bool {
        let request: WireRequest = match decode(payload) {
            Ok(r) => r,
            Err(_) => return false,
        };
        self.cm.stats().change(self.stat_served, 1);
        let procedure = {
            let procedures = self.read_procedures();
            match procedures.get(&request.name) {
                Some(Procedure::Sync(f)) => Procedure::Sync(Arc::clone(f)),
                Some(Procedure::Async(f)) => Procedure::Async(Arc::clone(f)),
                None => {
                    self.send_reply(
                        sender,
                        request.call_id,
                        request.importance,
                        Err(RPC_ERROR_UNKNOWN_PROCEDURE),
                    );
                    return true;
                }
            }
        };
        match procedure {
            Procedure::Sync(f) => {
                let result = f(sender, &request.params);
                self.send_reply(sender, request.call_id, request.importance, result);
            }
            Procedure::Async(f) => {
                let responder = Responder {
                    engine: Arc::downgrade(self),
                    peer: *sender,
                    call_id: request.call_id,
                    importance: request.importance,
                };
                f(sender, &request.params, responder);
            }
        }
        true
    }

    fn handle_reply(&self, _sender: &PeerId, payload: &[u8]) -> bool {
        let reply: WireReply = match decode(payload) {
            Ok(r) => r,
            Err(_) => return false,
        };
        let Some(call) = self.lock_calls().remove(&reply.call_id) else {
            // Completed, stopped, or timed out first; the reply is stale.
            return true;
        };
        self.cron.remove(call.abort_job);
        self.cm.stats().change(self.stat_completed, 1);
        let status = if reply.error_code == RPC_OK {
            RpcStatus::Ok
        } else {
            RpcStatus::Error(reply.error_code)
        };
        (call.completion)(status, reply.params);
        true
    }

    fn timeout_call(&self, call_id: u64) {
        let Some(call) = self.lock_calls().remove(&call_id) else {
            return;
        };
        self.cm.stats().change(self.stat_timeout, 1);
        (call.completion)(RpcStatus::Timeout, RpcParams::new());
    }

    fn send_reply(
        &self,
        peer: &PeerId,
        call_id: u64,
        importance: u32,
        result: std::result::Result<RpcParams, u32>,
    ) {
        let (error_code, params) = match result {
            Ok(p) => (RPC_OK, p),
            Err(code) => (code, RpcParams::new()),
        };
        let reply = WireReply {
            call_id,
            error_code,
            params,
        };
        let payload = match encode(&reply) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode rpc reply");
                return;
            }
        };
        if let Err(e) = self.cm.send(
            peer,
            SubMessage::new(MSG_RPC_RES, payload),
            importance,
            REPLY_DELAY,
        ) {
            tracing::debug!(peer = %peer, error = %e, "rpc reply send failed");
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<u64, OutstandingCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_procedures(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Procedure>> {
        match self.procedures.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_procedures(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Procedure>> {
        match self.procedures.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(buf)
}

fn decode<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> Result<T> {
    ciborium::from_reader(buf).map_err(|e| RpcError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use umbra_core::{CoreConfig, Stats, EXTREME_PRIORITY};
    use umbra_crypto::identity::KeyPair;
    use umbra_transport::memory::MemoryHub;

    struct TestNode {
        cm: Arc<ConnectionManager>,
        _cron: Arc<Cron>,
        rpc: Arc<RpcEngine>,
    }

    fn node(hub: &MemoryHub, name: &str) -> TestNode {
        let keys = Arc::new(KeyPair::generate());
        let cm = Arc::new(ConnectionManager::new(
            keys,
            CoreConfig::default(),
            Arc::new(Stats::new()),
        ));
        cm.add_transport(Arc::new(hub.endpoint(name, 8192)));
        cm.start().expect("start");
        let cron = Arc::new(Cron::start());
        let rpc = RpcEngine::new(Arc::clone(&cm), Arc::clone(&cron));
        // Keep queues moving without a daemon: flush on a short period.
        let flusher = Arc::clone(&cm);
        cron.add(
            Duration::from_millis(20),
            Duration::from_millis(20),
            Box::new(move || flusher.flush_due()),
        );
        TestNode { cm, _cron: cron, rpc }
    }

    fn introduce(from: &TestNode, to: &TestNode) {
        for hello in to.cm.create_hellos() {
            from.cm.learn_hello(hello).expect("learn");
        }
    }

    #[test]
    fn test_sync_call_roundtrip() {
        let hub = MemoryHub::new();
        let a = node(&hub, "ra");
        let b = node(&hub, "rb");
        introduce(&a, &b);

        b.rpc.register(
            "echo",
            Arc::new(|_peer, params| {
                let v = params.value("in").map_err(|_| RPC_ERROR_MALFORMED_ARGS)?;
                Ok(RpcParams::new().add("out", v.to_vec()))
            }),
        );

        let (tx, rx) = mpsc::channel();
        a.rpc
            .start(
                &b.cm.self_id(),
                "echo",
                RpcParams::new().add("in", b"ping".to_vec()),
                EXTREME_PRIORITY,
                Duration::from_secs(5),
                Box::new(move |status, params| {
                    let _ = tx.send((status, params));
                }),
            )
            .expect("start");

        let (status, params) = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(status, RpcStatus::Ok);
        assert_eq!(params.value("out").expect("out"), b"ping");
        assert_eq!(a.rpc.outstanding(), 0);
    }

    #[test]
    fn test_async_procedure() {
        let hub = MemoryHub::new();
        let a = node(&hub, "ra2");
        let b = node(&hub, "rb2");
        introduce(&a, &b);

        b.rpc.register_async(
            "deferred",
            Arc::new(|_peer, _params, responder| {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(30));
                    responder.respond(Ok(RpcParams::new().add("late", vec![1])));
                });
            }),
        );

        let (tx, rx) = mpsc::channel();
        a.rpc
            .start(
                &b.cm.self_id(),
                "deferred",
                RpcParams::new(),
                EXTREME_PRIORITY,
                Duration::from_secs(5),
                Box::new(move |status, params| {
                    let _ = tx.send((status, params));
                }),
            )
            .expect("start");
        let (status, params) = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(status, RpcStatus::Ok);
        assert_eq!(params.value("late").expect("late"), &[1]);
    }

    #[test]
    fn test_unknown_procedure_error() {
        let hub = MemoryHub::new();
        let a = node(&hub, "ra3");
        let b = node(&hub, "rb3");
        introduce(&a, &b);

        let (tx, rx) = mpsc::channel();
        a.rpc
            .start(
                &b.cm.self_id(),
                "no-such-procedure",
                RpcParams::new(),
                EXTREME_PRIORITY,
                Duration::from_secs(5),
                Box::new(move |status, _params| {
                    let _ = tx.send(status);
                }),
            )
            .expect("start");
        let status = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(status, RpcStatus::Error(RPC_ERROR_UNKNOWN_PROCEDURE));
    }

    #[test]
    fn test_timeout_fires_once_with_empty_params() {
        let hub = MemoryHub::new();
        let a = node(&hub, "ra4");
        let b = node(&hub, "rb4");
        introduce(&a, &b);

        // Registered but never responds.
        b.rpc
            .register_async("black-hole", Arc::new(|_p, _params, _responder| {}));

        let (tx, rx) = mpsc::channel();
        a.rpc
            .start(
                &b.cm.self_id(),
                "black-hole",
                RpcParams::new(),
                EXTREME_PRIORITY,
                Duration::from_millis(200),
                Box::new(move |status, params| {
                    let _ = tx.send((status, params.len()));
                }),
            )
            .expect("start");
        let (status, param_count) =
            rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(status, RpcStatus::Timeout);
        assert_eq!(param_count, 0);
        // Exactly once: nothing further arrives.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(a.rpc.outstanding(), 0);
    }

    #[test]
    fn test_stop_suppresses_completion() {
        let hub = MemoryHub::new();
        let a = node(&hub, "ra5");
        let b = node(&hub, "rb5");
        introduce(&a, &b);
        b.rpc
            .register_async("black-hole", Arc::new(|_p, _params, _responder| {}));

        let (tx, rx) = mpsc::channel::<RpcStatus>();
        let handle = a
            .rpc
            .start(
                &b.cm.self_id(),
                "black-hole",
                RpcParams::new(),
                EXTREME_PRIORITY,
                Duration::from_millis(100),
                Box::new(move |status, _| {
                    let _ = tx.send(status);
                }),
            )
            .expect("start");
        a.rpc.stop(handle);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
