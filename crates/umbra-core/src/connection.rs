//! The connection manager.
//!
//! Owns the bounded set of sessions, the per-peer send buffers, trust and
//! bandwidth-preference accounting, and the demultiplexing of inbound
//! frames into typed sub-messages.
//!
//! ## Frames
//!
//! ```text
//! [flags u8] [seq u64 BE, cipher only] [body]
//! ```
//!
//! `flags` 0 is a plaintext frame and may only carry handshake traffic
//! (hello, key exchange, noise). `flags` 1 is a sealed frame: the body is
//! ChaCha20-Poly1305 over the concatenated sub-messages, with the sequence
//! number feeding the nonce. The two directions of a session use disjoint
//! nonce spaces.
//!
//! ## Session lifecycle
//!
//! Outbound: `connect_peer` picks the cheapest transport with a cached
//! hello, opens a link and sends a plaintext handshake frame (our hello +
//! our ephemeral key half). Inbound: a plaintext handshake from an unknown
//! link creates the session and answers with our half. Either way the
//! session turns encrypted once both halves are known. A session dies only
//! when its reference count is zero and it has been idle past the timeout,
//! or its transport failed.
//!
//! ## Locking
//!
//! The manager lock is the outermost lock of the node; nothing is sent on
//! a link and no handler runs while it is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use umbra_crypto::identity::{AgreementPublic, AgreementSecret, KeyPair};
use umbra_crypto::session::SessionKey;
use umbra_crypto::PeerId;
use umbra_proto::framing::{decode_frame, encode_frame, SubMessage};
use umbra_proto::hello::Hello;
use umbra_proto::messages::{
    KeyExchange, Ping, Pong, MSG_FRAGMENT, MSG_HELLO, MSG_KEY_EXCHANGE, MSG_NOISE, MSG_PING,
    MSG_PONG,
};
use umbra_proto::MAX_MESSAGE_SIZE;
use umbra_transport::{Inbound, Transport, TransportLink};

use crate::fragment::FragmentationEngine;
use crate::hello_cache::HelloCache;
use crate::policy::{admit, LoadMeter, PeerScore, EXTREME_PRIORITY};
use crate::stats::{StatHandle, Stats};
use crate::{CoreError, Result};

/// Per-frame overhead of a sealed frame: flags, sequence number, AEAD tag.
pub const CIPHER_FRAME_OVERHEAD: usize = 1 + 8 + umbra_crypto::session::TAG_LEN;

/// Configuration of the connection manager.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Ceiling on concurrent sessions.
    pub max_sessions: usize,
    /// Idle time after which an unreferenced session is destroyed.
    pub idle_timeout: Duration,
    /// Outbound bandwidth budget in bytes per second.
    pub bandwidth_bytes_per_sec: u64,
    /// How long our own hellos stay valid.
    pub hello_lifetime: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_timeout: Duration::from_secs(300),
            bandwidth_bytes_per_sec: 64 * 1024,
            hello_lifetime: Duration::from_secs(12 * 3600),
        }
    }
}

/// Handler for one encrypted peer-to-peer message type.
///
/// Returns `false` when the payload was malformed; the manager counts it
/// and penalizes the sender's trust.
pub type P2pHandler = Arc<dyn Fn(&PeerId, &[u8]) -> bool + Send + Sync>;

/// Deferred message construction, invoked when the frame is actually built.
/// Returning `None` cancels the send.
pub type BuildFn = Box<dyn FnOnce() -> Option<SubMessage> + Send>;

enum Builder {
    Ready(SubMessage),
    Deferred { size: usize, build: BuildFn },
}

impl Builder {
    fn size(&self) -> usize {
        match self {
            Builder::Ready(m) => m.wire_size(),
            Builder::Deferred { size, .. } => *size,
        }
    }
}

struct Queued {
    priority: u32,
    deadline: Instant,
    builder: Builder,
}

struct Session {
    peer: PeerId,
    link: Arc<dyn TransportLink>,
    /// Largest frame the link carries; 0 = unbounded.
    mtu: u32,
    /// Our ephemeral half of the key exchange, until the peer's arrives.
    ephemeral: Option<AgreementSecret>,
    key: Option<SessionKey>,
    /// Cleared by the first inbound frame from the peer.
    awaiting_welcome: bool,
    /// External references via associate(); the session table itself is not
    /// counted.
    refcount: u32,
    last_use: Instant,
    send_seq: u64,
    queue: Vec<Queued>,
}

impl Session {
    /// Frame capacity available for sub-messages.
    fn usable_mtu(&self) -> usize {
        let mtu = if self.mtu == 0 {
            MAX_MESSAGE_SIZE
        } else {
            self.mtu as usize
        };
        mtu.saturating_sub(CIPHER_FRAME_OVERHEAD).max(64)
    }
}

struct CmState {
    sessions: HashMap<PeerId, Session>,
    link_index: HashMap<u64, PeerId>,
    scores: HashMap<PeerId, PeerScore>,
}

struct StatHandles {
    bytes_sent: StatHandle,
    bytes_received: StatHandle,
    frames_malformed: StatHandle,
    unknown_type: StatHandle,
    outgoing_ok: StatHandle,
    outgoing_drop: StatHandle,
    sessions_established: StatHandle,
    sessions_destroyed: StatHandle,
    hellos_verified: StatHandle,
    hellos_rejected: StatHandle,
}

/// The connection manager. Shared as `Arc<ConnectionManager>` by every
/// subsystem that sends or receives overlay traffic.
pub struct ConnectionManager {
    keys: Arc<KeyPair>,
    self_id: PeerId,
    config: CoreConfig,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    hello_cache: HelloCache,
    state: Mutex<CmState>,
    handlers: RwLock<HashMap<u16, P2pHandler>>,
    stats: Arc<Stats>,
    sh: StatHandles,
    load: LoadMeter,
    frag: FragmentationEngine,
    dispatch: Mutex<Option<std::thread::JoinHandle<()>>>,
    running: AtomicBool,
}

impl ConnectionManager {
    pub fn new(keys: Arc<KeyPair>, config: CoreConfig, stats: Arc<Stats>) -> Self {
        let sh = StatHandles {
            bytes_sent: stats.create("# bytes sent"),
            bytes_received: stats.create("# bytes received"),
            frames_malformed: stats.create("# inbound frames malformed"),
            unknown_type: stats.create("# sub-messages of unknown type"),
            outgoing_ok: stats.create("# times outgoing msg sent (bandwidth ok)"),
            outgoing_drop: stats.create("# times outgoing msg dropped (bandwidth stressed)"),
            sessions_established: stats.create("# sessions established"),
            sessions_destroyed: stats.create("# sessions destroyed"),
            hellos_verified: stats.create("# hellos verified"),
            hellos_rejected: stats.create("# hellos rejected"),
        };
        let self_id = keys.peer_id();
        let load = LoadMeter::new(config.bandwidth_bytes_per_sec);
        let frag = FragmentationEngine::new(&stats);
        Self {
            keys,
            self_id,
            config,
            transports: RwLock::new(Vec::new()),
            hello_cache: HelloCache::new(),
            state: Mutex::new(CmState {
                sessions: HashMap::new(),
                link_index: HashMap::new(),
                scores: HashMap::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            stats,
            sh,
            load,
            frag,
            dispatch: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Our own identity.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Our key material.
    pub fn keys(&self) -> &Arc<KeyPair> {
        &self.keys
    }

    /// The counter registry.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// The hello cache.
    pub fn hello_cache(&self) -> &HelloCache {
        &self.hello_cache
    }

    /// The fragmentation engine.
    pub fn fragmentation(&self) -> &FragmentationEngine {
        &self.frag
    }

    /// Current outbound load in percent of the bandwidth budget.
    pub fn load_percent(&self) -> u32 {
        self.load.load_percent()
    }

    /// Register a transport plugin. Must happen before [`start`](Self::start).
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.write_transports().push(transport);
    }

    /// Start the transports' servers and the dispatch thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Inbound>();
        for t in self.read_transports().iter() {
            t.start_server(tx.clone())?;
        }
        self.running.store(true, Ordering::SeqCst);
        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("umbra-dispatch".to_string())
            .spawn(move || {
                while let Ok(inbound) = rx.recv() {
                    if !me.running.load(Ordering::SeqCst) {
                        break;
                    }
                    me.process_inbound(inbound);
                }
            })
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        *self.lock_dispatch() = Some(handle);
        Ok(())
    }

    /// Stop the transports and the dispatch thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for t in self.read_transports().iter() {
            t.stop_server();
        }
        let mut state = self.lock();
        for (_, session) in state.sessions.drain() {
            session.link.disconnect();
        }
        state.link_index.clear();
    }

    // -- hello management ---------------------------------------------------

    /// Create hellos advertising every registered transport.
    pub fn create_hellos(&self) -> Vec<Hello> {
        let expiration = now_secs() + self.config.hello_lifetime.as_secs();
        let mut out = Vec::new();
        for t in self.read_transports().iter() {
            match t.create_hello(&self.keys, expiration) {
                Ok(h) => out.push(h),
                Err(e) => tracing::warn!(error = %e, "could not create hello"),
            }
        }
        out
    }

    /// Verify and cache a hello learned from the network or configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Proto`] when signature, expiry or the
    /// transport-specific address check fails.
    pub fn learn_hello(&self, hello: Hello) -> Result<()> {
        if let Err(e) = hello.verify(now_secs()) {
            self.stats.change(self.sh.hellos_rejected, 1);
            return Err(e.into());
        }
        let transports = self.read_transports();
        let transport = transports
            .iter()
            .find(|t| t.protocol() == hello.protocol)
            .ok_or_else(|| {
                CoreError::PeerUnreachable(format!("no transport {}", hello.protocol))
            })?;
        if let Err(e) = transport.verify_hello(&hello) {
            self.stats.change(self.sh.hellos_rejected, 1);
            return Err(e.into());
        }
        self.stats.change(self.sh.hellos_verified, 1);
        self.hello_cache.insert(hello);
        Ok(())
    }

    // -- session management -------------------------------------------------

    /// Ensure a session to `peer` exists, connecting if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PeerUnreachable`] without a cached hello and
    /// [`CoreError::TooManySessions`] when the table is full of referenced
    /// or busy sessions.
    pub fn connect_peer(&self, peer: &PeerId) -> Result<()> {
        if *peer == self.self_id {
            return Err(CoreError::PeerUnreachable("self".to_string()));
        }
        if self.lock().sessions.contains_key(peer) {
            return Ok(());
        }

        // Cheapest transport with a cached hello wins.
        let hellos = self.hello_cache.get_any(peer);
        let transports = self.read_transports();
        let mut best: Option<(Arc<dyn Transport>, Arc<Hello>)> = None;
        for hello in hellos {
            if let Some(t) = transports
                .iter()
                .find(|t| t.protocol() == hello.protocol)
            {
                let better = match &best {
                    Some((bt, _)) => t.cost() < bt.cost(),
                    None => true,
                };
                if better {
                    best = Some((Arc::clone(t), hello));
                }
            }
        }
        drop(transports);
        let (transport, hello) =
            best.ok_or_else(|| CoreError::PeerUnreachable(format!("no hello for {peer}")))?;

        let link = transport.connect(&hello)?;
        let ephemeral = AgreementSecret::generate();
        let handshake = self.handshake_frame(transport.protocol(), &ephemeral)?;

        {
            let mut state = self.lock();
            self.evict_if_full(&mut state)?;
            let session = Session {
                peer: *peer,
                link: Arc::clone(&link),
                mtu: hello.mtu,
                ephemeral: Some(ephemeral),
                key: None,
                awaiting_welcome: true,
                refcount: 0,
                last_use: Instant::now(),
                send_seq: 0,
                queue: Vec::new(),
            };
            state.link_index.insert(link.link_id(), *peer);
            state.sessions.insert(*peer, session);
        }
        self.stats.change(self.sh.sessions_established, 1);
        link.send(&handshake, true)?;
        self.load.record(handshake.len());
        Ok(())
    }

    /// Keep a session alive while the caller holds a reference.
    pub fn associate(&self, peer: &PeerId) -> bool {
        let mut state = self.lock();
        match state.sessions.get_mut(peer) {
            Some(s) => {
                s.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Release a reference taken with [`associate`](Self::associate).
    pub fn disassociate(&self, peer: &PeerId) {
        let mut state = self.lock();
        if let Some(s) = state.sessions.get_mut(peer) {
            s.refcount = s.refcount.saturating_sub(1);
        }
    }

    /// Peers with a live session.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.lock().sessions.keys().copied().collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.lock().sessions.contains_key(peer)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Enumerate connected peers under the manager lock. The visitor must
    /// not block and must not call back into the manager.
    pub fn for_all_connected(&self, visitor: &mut dyn FnMut(&PeerId)) {
        let state = self.lock();
        for peer in state.sessions.keys() {
            visitor(peer);
        }
    }

    // -- trust and preference -----------------------------------------------

    pub fn change_trust(&self, peer: &PeerId, delta: i32) {
        let mut state = self.lock();
        state.scores.entry(*peer).or_default().change_trust(delta);
    }

    pub fn get_trust(&self, peer: &PeerId) -> u32 {
        let state = self.lock();
        state.scores.get(peer).map(PeerScore::trust).unwrap_or(0)
    }

    /// Additive increment to the decaying bandwidth preference.
    pub fn prefer_traffic_from(&self, peer: &PeerId, amount: f64) {
        let mut state = self.lock();
        state.scores.entry(*peer).or_default().prefer(amount);
    }

    /// Current preference after decay.
    pub fn preference(&self, peer: &PeerId) -> f64 {
        let mut state = self.lock();
        state
            .scores
            .get_mut(peer)
            .map(PeerScore::preference)
            .unwrap_or(0.0)
    }

    // -- sending ------------------------------------------------------------

    /// Queue a message for a peer. Not synchronous: the message is
    /// coalesced with others up to the session MTU and may be dropped by
    /// bandwidth admission. Messages above the MTU are fragmented.
    pub fn send(
        &self,
        peer: &PeerId,
        msg: SubMessage,
        priority: u32,
        max_delay: Duration,
    ) -> Result<()> {
        self.connect_peer(peer)?;
        let usable = {
            let state = self.lock();
            let session = state
                .sessions
                .get(peer)
                .ok_or(CoreError::NotConnected)?;
            session.usable_mtu()
        };
        if msg.wire_size() > usable {
            return self
                .frag
                .fragment_outbound(self, peer, msg, priority, max_delay, usable);
        }
        self.enqueue(
            peer,
            Queued {
                priority,
                deadline: Instant::now() + max_delay,
                builder: Builder::Ready(msg),
            },
        )
    }

    /// Queue a deferred message: `build` runs when the frame is actually
    /// assembled, so the message can include only-then-known state.
    /// `size` must be an upper bound on the built message's wire size.
    pub fn send_deferred(
        &self,
        peer: &PeerId,
        size: usize,
        priority: u32,
        max_delay: Duration,
        build: BuildFn,
    ) -> Result<()> {
        self.connect_peer(peer)?;
        self.enqueue(
            peer,
            Queued {
                priority,
                deadline: Instant::now() + max_delay,
                builder: Builder::Deferred { size, build },
            },
        )
    }

    /// Send a message to every session in the connected set. Not a flood:
    /// only direct sessions are addressed.
    pub fn broadcast_to_connected(
        &self,
        msg: &SubMessage,
        priority: u32,
        max_delay: Duration,
    ) {
        for peer in self.connected_peers() {
            if let Err(e) = self.send(&peer, msg.clone(), priority, max_delay) {
                tracing::debug!(peer = %peer, error = %e, "broadcast send failed");
            }
        }
    }

    fn enqueue(&self, peer: &PeerId, queued: Queued) -> Result<()> {
        let flush_now = {
            let mut state = self.lock();
            let session = state
                .sessions
                .get_mut(peer)
                .ok_or(CoreError::NotConnected)?;
            let extreme = queued.priority >= EXTREME_PRIORITY;
            session.queue.push(queued);
            let queued_bytes: usize = session.queue.iter().map(|q| q.builder.size()).sum();
            extreme || queued_bytes >= session.usable_mtu()
        };
        if flush_now {
            self.flush_peer(peer);
        }
        Ok(())
    }

    /// Flush queues whose deadline has passed; called periodically by cron.
    pub fn flush_due(&self) {
        let now = Instant::now();
        let due: Vec<PeerId> = {
            let state = self.lock();
            state
                .sessions
                .iter()
                .filter(|(_, s)| s.queue.iter().any(|q| q.deadline <= now))
                .map(|(p, _)| *p)
                .collect()
        };
        for peer in due {
            self.flush_peer(&peer);
        }
    }

    /// Build and transmit one frame's worth of queued messages for a peer.
    pub fn flush_peer(&self, peer: &PeerId) {
        loop {
            let (link, frame) = {
                let mut state = self.lock();
                let Some(session) = state.sessions.get_mut(peer) else {
                    return;
                };
                if session.key.is_none() {
                    // Handshake incomplete: only noise could go plaintext,
                    // so hold everything back.
                    return;
                }
                if session.queue.is_empty() {
                    return;
                }
                let load = self.load.load_percent();
                let usable = session.usable_mtu();

                // Highest priority first; admission and packing in one pass.
                session.queue.sort_by(|a, b| b.priority.cmp(&a.priority));
                let mut picked = Vec::new();
                let mut used = 0usize;
                let mut rest = Vec::new();
                for q in session.queue.drain(..) {
                    if !admit(load, q.priority) {
                        self.stats.change(self.sh.outgoing_drop, 1);
                        continue;
                    }
                    if used + q.builder.size() <= usable {
                        used += q.builder.size();
                        picked.push(q);
                    } else {
                        rest.push(q);
                    }
                }
                session.queue = rest;
                if picked.is_empty() {
                    return;
                }

                let mut messages = Vec::with_capacity(picked.len());
                for q in picked {
                    match q.builder {
                        Builder::Ready(m) => messages.push(m),
                        Builder::Deferred { build, .. } => {
                            if let Some(m) = build() {
                                messages.push(m);
                            }
                        }
                    }
                }
                if messages.is_empty() {
                    continue;
                }
                let body = match encode_frame(&messages) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(error = %e, "frame encoding failed");
                        continue;
                    }
                };
                let frame = match self.seal_frame(session, &body) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(error = %e, "frame sealing failed");
                        continue;
                    }
                };
                self.stats.change(self.sh.outgoing_ok, messages.len() as i64);
                session.last_use = Instant::now();
                (Arc::clone(&session.link), frame)
            };

            self.load.record(frame.len());
            self.stats.change(self.sh.bytes_sent, frame.len() as i64);
            if let Err(e) = link.send(&frame, false) {
                tracing::debug!(peer = %peer, error = %e, "link send failed, destroying session");
                self.destroy_session(peer, true);
                return;
            }
            // Loop: more queued messages may remain past one MTU.
            let more = {
                let state = self.lock();
                state
                    .sessions
                    .get(peer)
                    .map(|s| !s.queue.is_empty())
                    .unwrap_or(false)
            };
            if !more {
                return;
            }
        }
    }

    fn seal_frame(&self, session: &mut Session, body: &[u8]) -> Result<Vec<u8>> {
        let key = session.key.as_ref().ok_or(CoreError::NotConnected)?;
        let seq = session.send_seq;
        session.send_seq += 1;
        let nonce_seq = direction_seq(seq, &self.self_id, &session.peer);
        let sealed = key.seal(nonce_seq, body)?;
        let mut frame = Vec::with_capacity(1 + 8 + sealed.len());
        frame.push(1u8);
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    // -- handler registry ---------------------------------------------------

    /// Register the handler for an encrypted peer-to-peer message type.
    /// Replaces any previous handler for the type.
    pub fn register_handler(&self, msg_type: u16, handler: P2pHandler) {
        self.write_handlers().insert(msg_type, handler);
    }

    pub fn unregister_handler(&self, msg_type: u16) {
        self.write_handlers().remove(&msg_type);
    }

    /// Dispatch a frame as if it had arrived from `sender`. Used by the
    /// defragmentation path and by local content injection.
    pub fn loopback(&self, sender: &PeerId, frame_body: &[u8]) {
        match decode_frame(frame_body) {
            Ok(messages) => {
                for m in messages {
                    self.dispatch_one(sender, &m);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "loopback frame malformed");
                self.stats.change(self.sh.frames_malformed, 1);
            }
        }
    }

    // -- maintenance --------------------------------------------------------

    /// Periodic upkeep: destroy idle unreferenced sessions. Driven by cron.
    pub fn maintain(&self) {
        let now = Instant::now();
        let victims: Vec<PeerId> = {
            let state = self.lock();
            state
                .sessions
                .values()
                .filter(|s| {
                    s.refcount == 0 && now.duration_since(s.last_use) >= self.config.idle_timeout
                })
                .map(|s| s.peer)
                .collect()
        };
        for peer in victims {
            tracing::debug!(peer = %peer, "destroying idle session");
            self.destroy_session(&peer, false);
        }
    }

    fn destroy_session(&self, peer: &PeerId, transport_error: bool) {
        let link = {
            let mut state = self.lock();
            match state.sessions.remove(peer) {
                Some(s) => {
                    state.link_index.remove(&s.link.link_id());
                    if transport_error {
                        state.scores.entry(*peer).or_default().change_trust(-1);
                    }
                    Some(s.link)
                }
                None => None,
            }
        };
        if let Some(link) = link {
            link.disconnect();
            self.stats.change(self.sh.sessions_destroyed, 1);
        }
    }

    /// Make room in the session table; evicts the longest-idle
    /// unreferenced session.
    fn evict_if_full(&self, state: &mut CmState) -> Result<()> {
        if state.sessions.len() < self.config.max_sessions {
            return Ok(());
        }
        let victim = state
            .sessions
            .values()
            .filter(|s| s.refcount == 0)
            .min_by_key(|s| s.last_use)
            .map(|s| s.peer);
        match victim {
            Some(peer) => {
                if let Some(s) = state.sessions.remove(&peer) {
                    state.link_index.remove(&s.link.link_id());
                    s.link.disconnect();
                    self.stats.change(self.sh.sessions_destroyed, 1);
                }
                Ok(())
            }
            None => Err(CoreError::TooManySessions),
        }
    }

    // -- inbound path -------------------------------------------------------

    fn process_inbound(&self, inbound: Inbound) {
        let Inbound { link, frame } = inbound;
        self.stats.change(self.sh.bytes_received, frame.len() as i64);
        if frame.is_empty() {
            self.stats.change(self.sh.frames_malformed, 1);
            return;
        }
        match frame[0] {
            0 => self.process_plaintext(link, &frame[1..]),
            1 => self.process_cipher(link, &frame[1..]),
            _ => {
                self.stats.change(self.sh.frames_malformed, 1);
            }
        }
    }

    /// Plaintext frames carry the handshake: a hello naming the sender and
    /// a key exchange half. Anything else in plaintext is dropped.
    fn process_plaintext(&self, link: Arc<dyn TransportLink>, body: &[u8]) {
        let messages = match decode_frame(body) {
            Ok(m) => m,
            Err(_) => {
                self.stats.change(self.sh.frames_malformed, 1);
                return;
            }
        };
        let mut hello: Option<Hello> = None;
        let mut keyx: Option<KeyExchange> = None;
        for m in &messages {
            match m.msg_type {
                MSG_HELLO => hello = Hello::from_bytes(&m.payload).ok(),
                MSG_KEY_EXCHANGE => keyx = KeyExchange::from_bytes(&m.payload).ok(),
                MSG_NOISE => {}
                _ => {
                    self.stats.change(self.sh.unknown_type, 1);
                }
            }
        }
        let (Some(hello), Some(keyx)) = (hello, keyx) else {
            self.stats.change(self.sh.frames_malformed, 1);
            return;
        };
        let Ok(sender) = keyx.verify() else {
            self.stats.change(self.sh.frames_malformed, 1);
            return;
        };
        if sender != hello.subject || sender == self.self_id {
            self.stats.change(self.sh.frames_malformed, 1);
            return;
        }
        if self.learn_hello(hello.clone()).is_err() {
            return; // counted by learn_hello
        }
        let their_half = AgreementPublic::from_bytes(keyx.agreement_public);

        // Bind or create the session and finish the key exchange.
        let reply_handshake = {
            let mut state = self.lock();
            let old_link_id = state.sessions.get(&sender).map(|s| s.link.link_id());
            if let Some(old_link_id) = old_link_id {
                state.link_index.remove(&old_link_id);
            }
            let is_existing = state.sessions.contains_key(&sender);
            if is_existing {
                state.link_index.insert(link.link_id(), sender);
            }
            match state.sessions.get_mut(&sender) {
                Some(session) => {
                    // Initiator side completing, or a peer-initiated
                    // re-handshake. Adopt the link either way.
                    session.awaiting_welcome = false;
                    session.last_use = Instant::now();
                    session.link = Arc::clone(&link);
                    match session.ephemeral.take() {
                        Some(eph) => {
                            // Our half is already on the wire.
                            let shared = eph.shared_digest(&their_half);
                            session.key = Some(SessionKey::derive(&shared));
                            session.send_seq = 0;
                            None
                        }
                        None => {
                            // Re-handshake: the old key material is gone,
                            // answer with a fresh half.
                            let eph = AgreementSecret::generate();
                            let shared = eph.shared_digest(&their_half);
                            session.key = Some(SessionKey::derive(&shared));
                            session.send_seq = 0;
                            Some((hello.protocol, eph))
                        }
                    }
                }
                None => {
                    if self.evict_if_full(&mut state).is_err() {
                        tracing::debug!("session table full, rejecting inbound session");
                        return;
                    }
                    let eph = AgreementSecret::generate();
                    let shared = eph.shared_digest(&their_half);
                    let session = Session {
                        peer: sender,
                        link: Arc::clone(&link),
                        mtu: hello.mtu,
                        ephemeral: None,
                        key: Some(SessionKey::derive(&shared)),
                        awaiting_welcome: false,
                        refcount: 0,
                        last_use: Instant::now(),
                        send_seq: 0,
                        queue: Vec::new(),
                    };
                    state.link_index.insert(link.link_id(), sender);
                    state.sessions.insert(sender, session);
                    self.stats.change(self.sh.sessions_established, 1);
                    Some((hello.protocol, eph))
                }
            }
        };

        if let Some((protocol, eph)) = reply_handshake {
            match self.handshake_frame(protocol, &eph) {
                Ok(frame) => {
                    if let Err(e) = link.send(&frame, true) {
                        tracing::debug!(error = %e, "handshake reply failed");
                        self.destroy_session(&sender, true);
                        return;
                    }
                    self.load.record(frame.len());
                }
                Err(e) => tracing::warn!(error = %e, "could not build handshake reply"),
            }
        }
        // The session may have queued traffic waiting for the key.
        self.flush_peer(&sender);
    }

    fn process_cipher(&self, link: Arc<dyn TransportLink>, rest: &[u8]) {
        if rest.len() < 8 {
            self.stats.change(self.sh.frames_malformed, 1);
            return;
        }
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&rest[..8]);
        let seq = u64::from_be_bytes(seq_bytes);
        let sealed = &rest[8..];

        let (peer, body) = {
            let mut state = self.lock();
            let Some(peer) = state.link_index.get(&link.link_id()).copied() else {
                self.stats.change(self.sh.frames_malformed, 1);
                return;
            };
            let Some(session) = state.sessions.get_mut(&peer) else {
                self.stats.change(self.sh.frames_malformed, 1);
                return;
            };
            let Some(key) = session.key.as_ref() else {
                self.stats.change(self.sh.frames_malformed, 1);
                return;
            };
            let nonce_seq = direction_seq(seq, &peer, &self.self_id);
            match key.open(nonce_seq, sealed) {
                Ok(body) => {
                    session.last_use = Instant::now();
                    session.awaiting_welcome = false;
                    (peer, body)
                }
                Err(_) => {
                    self.stats.change(self.sh.frames_malformed, 1);
                    state.scores.entry(peer).or_default().change_trust(-1);
                    return;
                }
            }
        };

        match decode_frame(&body) {
            Ok(messages) => {
                for m in messages {
                    self.dispatch_one(&peer, &m);
                }
            }
            Err(_) => {
                self.stats.change(self.sh.frames_malformed, 1);
            }
        }
    }

    /// Route one decoded sub-message to its handler.
    fn dispatch_one(&self, sender: &PeerId, msg: &SubMessage) {
        match msg.msg_type {
            MSG_HELLO => {
                if let Ok(hello) = Hello::from_bytes(&msg.payload) {
                    let _ = self.learn_hello(hello);
                } else {
                    self.stats.change(self.sh.frames_malformed, 1);
                }
            }
            MSG_NOISE => {}
            MSG_PING => {
                if let Ok(ping) = Ping::from_bytes(&msg.payload) {
                    let pong = SubMessage::new(MSG_PONG, Pong { nonce: ping.nonce }.to_bytes());
                    let _ = self.send(sender, pong, 0, Duration::from_secs(1));
                } else {
                    self.stats.change(self.sh.frames_malformed, 1);
                }
            }
            MSG_PONG => {
                // Liveness already noted via last_use.
            }
            MSG_FRAGMENT => {
                self.frag.process_inbound(self, sender, &msg.payload);
            }
            other => {
                let handler = self.read_handlers().get(&other).cloned();
                match handler {
                    Some(h) => {
                        if !h(sender, &msg.payload) {
                            self.stats.change(self.sh.frames_malformed, 1);
                            self.change_trust(sender, -1);
                        }
                    }
                    None => {
                        self.stats.change(self.sh.unknown_type, 1);
                    }
                }
            }
        }
    }

    fn handshake_frame(&self, protocol: u16, eph: &AgreementSecret) -> Result<Vec<u8>> {
        let transports = self.read_transports();
        let transport = transports
            .iter()
            .find(|t| t.protocol() == protocol)
            .or_else(|| transports.first())
            .ok_or_else(|| CoreError::PeerUnreachable("no transports".to_string()))?;
        let expiration = now_secs() + self.config.hello_lifetime.as_secs();
        let hello = transport.create_hello(&self.keys, expiration)?;
        drop(transports);

        let agreement_public = eph.public().to_bytes();
        let keyx = KeyExchange {
            public_key: self.keys.verifying_key.to_bytes(),
            agreement_public,
            signature: self.keys.signing_key.sign(&agreement_public).to_bytes(),
        };
        let body = encode_frame(&[
            SubMessage::new(MSG_HELLO, hello.to_bytes()),
            SubMessage::new(MSG_KEY_EXCHANGE, keyx.to_bytes()),
        ])?;
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(0u8);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    // -- lock helpers -------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, CmState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_dispatch(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<std::thread::JoinHandle<()>>> {
        match self.dispatch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_transports(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Transport>>> {
        match self.transports.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_transports(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Transport>>> {
        match self.transports.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u16, P2pHandler>> {
        match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u16, P2pHandler>> {
        match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Disjoint nonce spaces per direction: the lexicographically larger sender
/// identity uses odd sequence numbers.
fn direction_seq(seq: u64, sender: &PeerId, receiver: &PeerId) -> u64 {
    seq * 2 + u64::from(sender > receiver)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_transport::memory::MemoryHub;

    fn node(hub: &MemoryHub, name: &str, mtu: u32) -> Arc<ConnectionManager> {
        let keys = Arc::new(KeyPair::generate());
        let stats = Arc::new(Stats::new());
        let cm = Arc::new(ConnectionManager::new(
            keys,
            CoreConfig::default(),
            stats,
        ));
        cm.add_transport(Arc::new(hub.endpoint(name, mtu)));
        cm.start().expect("start");
        cm
    }

    fn introduce(from: &ConnectionManager, to: &ConnectionManager) {
        for hello in to.create_hellos() {
            from.learn_hello(hello).expect("learn hello");
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(cond(), "condition not reached in time");
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a", 1400);
        let b = node(&hub, "b", 1400);
        introduce(&a, &b);

        a.connect_peer(&b.self_id()).expect("connect");
        let (a_id, b_id) = (a.self_id(), b.self_id());
        wait_until(|| b.is_connected(&a_id));
        assert!(a.is_connected(&b_id));
    }

    #[test]
    fn test_send_and_dispatch() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a1", 1400);
        let b = node(&hub, "b1", 1400);
        introduce(&a, &b);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        b.register_handler(
            0x0100,
            Arc::new(move |_peer, payload| {
                sink.lock().expect("lock").push(payload.to_vec());
                true
            }),
        );

        a.send(
            &b.self_id(),
            SubMessage::new(0x0100, b"payload".to_vec()),
            EXTREME_PRIORITY,
            Duration::from_millis(10),
        )
        .expect("send");
        wait_until(|| !received.lock().expect("lock").is_empty());
        assert_eq!(received.lock().expect("lock")[0], b"payload");
    }

    #[test]
    fn test_unknown_type_counted() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a2", 1400);
        let b = node(&hub, "b2", 1400);
        introduce(&a, &b);

        a.send(
            &b.self_id(),
            SubMessage::new(0x7777, b"x".to_vec()),
            EXTREME_PRIORITY,
            Duration::from_millis(10),
        )
        .expect("send");
        wait_until(|| b.stats().get_by_name("# sub-messages of unknown type") > 0);
    }

    #[test]
    fn test_ping_pong() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a3", 1400);
        let b = node(&hub, "b3", 1400);
        introduce(&a, &b);

        a.send(
            &b.self_id(),
            SubMessage::new(MSG_PING, Ping { nonce: 42 }.to_bytes()),
            EXTREME_PRIORITY,
            Duration::from_millis(10),
        )
        .expect("send");
        // The pong comes back on the same session; wait for traffic.
        wait_until(|| a.stats().get_by_name("# bytes received") > 0);
    }

    #[test]
    fn test_unreachable_without_hello() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a4", 1400);
        let b = node(&hub, "b4", 1400);
        let err = a.connect_peer(&b.self_id());
        assert!(matches!(err, Err(CoreError::PeerUnreachable(_))));
    }

    #[test]
    fn test_trust_accounting() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a5", 1400);
        let peer = KeyPair::generate().peer_id();
        a.change_trust(&peer, 10);
        assert_eq!(a.get_trust(&peer), 10);
        a.change_trust(&peer, -25);
        assert_eq!(a.get_trust(&peer), 0);
    }

    #[test]
    fn test_idle_session_evicted() {
        let hub = MemoryHub::new();
        let keys = Arc::new(KeyPair::generate());
        let stats = Arc::new(Stats::new());
        let config = CoreConfig {
            idle_timeout: Duration::from_millis(50),
            ..CoreConfig::default()
        };
        let a = Arc::new(ConnectionManager::new(keys, config, stats));
        a.add_transport(Arc::new(hub.endpoint("a6", 1400)));
        a.start().expect("start");
        let b = node(&hub, "b6", 1400);
        introduce(&a, &b);

        a.connect_peer(&b.self_id()).expect("connect");
        assert_eq!(a.session_count(), 1);
        std::thread::sleep(Duration::from_millis(80));
        a.maintain();
        assert_eq!(a.session_count(), 0);
        assert_eq!(a.stats().get_by_name("# sessions destroyed"), 1);
    }

    #[test]
    fn test_associated_session_survives_idle() {
        let hub = MemoryHub::new();
        let keys = Arc::new(KeyPair::generate());
        let stats = Arc::new(Stats::new());
        let config = CoreConfig {
            idle_timeout: Duration::from_millis(50),
            ..CoreConfig::default()
        };
        let a = Arc::new(ConnectionManager::new(keys, config, stats));
        a.add_transport(Arc::new(hub.endpoint("a7", 1400)));
        a.start().expect("start");
        let b = node(&hub, "b7", 1400);
        introduce(&a, &b);

        a.connect_peer(&b.self_id()).expect("connect");
        assert!(a.associate(&b.self_id()));
        std::thread::sleep(Duration::from_millis(80));
        a.maintain();
        assert_eq!(a.session_count(), 1, "referenced session must survive");
        a.disassociate(&b.self_id());
        a.maintain();
        assert_eq!(a.session_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_connected_only() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a8", 1400);
        let b = node(&hub, "b8", 1400);
        let c = node(&hub, "c8", 1400);
        introduce(&a, &b);
        introduce(&a, &c);
        a.connect_peer(&b.self_id()).expect("connect b");
        a.connect_peer(&c.self_id()).expect("connect c");

        let b_count = Arc::new(Mutex::new(0));
        let c_count = Arc::new(Mutex::new(0));
        for (cm, counter) in [(&b, &b_count), (&c, &c_count)] {
            let counter = Arc::clone(counter);
            cm.register_handler(
                0x0200,
                Arc::new(move |_p, _d| {
                    *counter.lock().expect("lock") += 1;
                    true
                }),
            );
        }
        a.broadcast_to_connected(
            &SubMessage::new(0x0200, Vec::new()),
            EXTREME_PRIORITY,
            Duration::from_millis(10),
        );
        wait_until(|| {
            *b_count.lock().expect("lock") == 1 && *c_count.lock().expect("lock") == 1
        });
    }

    #[test]
    fn test_fragmented_delivery_roundtrip() {
        let hub = MemoryHub::new();
        let a = node(&hub, "af", 1400);
        let b = node(&hub, "bf", 1400);
        introduce(&a, &b);
        introduce(&b, &a);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        b.register_handler(
            0x0400,
            Arc::new(move |_p, d| {
                sink.lock().expect("lock").push(d.to_vec());
                true
            }),
        );

        // 5000 bytes over a 1400-byte MTU: must fragment and reassemble to
        // exactly one delivery, byte-identical.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        a.send(
            &b.self_id(),
            SubMessage::new(0x0400, payload.clone()),
            EXTREME_PRIORITY,
            Duration::from_millis(10),
        )
        .expect("send");

        wait_until(|| !received.lock().expect("lock").is_empty());
        std::thread::sleep(Duration::from_millis(50));
        let got = received.lock().expect("lock");
        assert_eq!(got.len(), 1, "exactly one delivery");
        assert_eq!(got[0], payload);
        assert_eq!(a.stats().get_by_name("# messages fragmented"), 1);
        assert_eq!(b.stats().get_by_name("# messages defragmented"), 1);
    }

    #[test]
    fn test_deferred_build_runs_at_flush() {
        let hub = MemoryHub::new();
        let a = node(&hub, "a9", 1400);
        let b = node(&hub, "b9", 1400);
        introduce(&a, &b);
        a.connect_peer(&b.self_id()).expect("connect");
        let b_id = b.self_id();
        wait_until(|| b.is_connected(&a.self_id()));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        b.register_handler(
            0x0300,
            Arc::new(move |_p, d| {
                sink.lock().expect("lock").push(d.to_vec());
                true
            }),
        );

        a.send_deferred(
            &b_id,
            64,
            EXTREME_PRIORITY,
            Duration::from_millis(10),
            Box::new(|| Some(SubMessage::new(0x0300, b"built late".to_vec()))),
        )
        .expect("send deferred");
        wait_until(|| !received.lock().expect("lock").is_empty());
        assert_eq!(received.lock().expect("lock")[0], b"built late");
    }
}
