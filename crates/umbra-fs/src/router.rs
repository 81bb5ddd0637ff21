//! The anonymous query router.
//!
//! Routing is reply-path: a reply is forwarded only to peers (or local
//! clients) that previously asked for its query hash. Per routed query the
//! router keeps a slot with the query hash, the waiters and their priority
//! budgets; expired slots are not actively timed out but reaped lazily
//! when their position in the table is needed again.
//!
//! The inbound query pipeline:
//!
//! 1. layout validation (done by the wire decoder; malformed drops count)
//! 2. TTL decrement by a randomized step, with the anti-replay rule for
//!    negative TTLs: a negative TTL that turns positive after the
//!    decrement is dropped
//! 3. policy evaluation to (answer, forward, indirect, priority cap),
//!    plus a bandwidth-preference reward for the sender
//! 4. priority capping, TTL bounded by `(priority + 3) * TTL_DECREMENT`,
//!    per-sub-query priority split
//! 5. local answers from the bloom-probed store; trust-weighted forwarding
//!    with the reply path recorded

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use umbra_core::stats::StatHandle;
use umbra_core::ConnectionManager;
use umbra_crypto::{HashCode, PeerId};
use umbra_proto::framing::SubMessage;
use umbra_proto::messages::{
    ChkReply, NsQuery, Query, SBlockReply, ThreeHashReply, MSG_3HASH_REPLY, MSG_CHK_REPLY,
    MSG_NS_QUERY, MSG_NS_REPLY, MSG_QUERY, MSG_SBLOCK_REPLY,
};
use umbra_store::{ContentStore, Entry, IterControl, PutOutcome};

use crate::blocks::{
    self, KeywordBlock, SignedBlock, KIND_DATA, KIND_INODE, KIND_KEYWORD, KIND_SIGNED,
};
use crate::policy::{
    self, evaluate_content, evaluate_query, QueryPolicy, CONTENT_BANDWIDTH_VALUE,
    QUERY_BANDWIDTH_VALUE, TTL_DECREMENT,
};
use crate::{FsError, Result};

/// Number of slots in the query routing table.
pub const ROUTING_TABLE_SIZE: usize = 1024;

/// How long a routing slot is considered live without the TTL saying
/// otherwise.
const SLOT_MIN_LIFETIME: Duration = Duration::from_secs(60);

/// Queueing delay granted to forwarded queries and replies.
const ROUTE_DELAY: Duration = Duration::from_millis(100);

/// A reply delivered to a local waiter.
#[derive(Clone, Debug)]
pub struct ReplyEvent {
    pub query: HashCode,
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

/// Where local replies go.
pub type LocalSink = Arc<dyn Fn(ReplyEvent) + Send + Sync>;

struct PeerWaiter {
    peer: PeerId,
    /// Remaining priority budget; halves per delivered reply.
    budget: u32,
}

struct QuerySlot {
    query: HashCode,
    priority: u32,
    local_sinks: Vec<LocalSink>,
    peer_waiters: Vec<PeerWaiter>,
    sent_to: Vec<PeerId>,
    /// Digests of replies already routed, to shrink repeat rewards.
    seen_replies: Vec<HashCode>,
    expires: Instant,
}

struct RouterStats {
    queries: StatHandle,
    super_queries: StatHandle,
    ns_queries: StatHandle,
    chk_replies: StatHandle,
    three_hash_replies: StatHandle,
    sblock_replies: StatHandle,
    queries_forwarded: StatHandle,
    replies_forwarded: StatHandle,
    replies_migrated: StatHandle,
    malformed: StatHandle,
}

/// The anonymous FS router.
pub struct FsRouter {
    cm: Arc<ConnectionManager>,
    store: Arc<ContentStore>,
    table: Mutex<Vec<Option<QuerySlot>>>,
    sh: RouterStats,
}

impl FsRouter {
    /// Create the router and register its message handlers.
    pub fn new(cm: Arc<ConnectionManager>, store: Arc<ContentStore>) -> Arc<Self> {
        let stats = cm.stats();
        let sh = RouterStats {
            queries: stats.create("# p2p queries received"),
            super_queries: stats.create("# p2p super queries received"),
            ns_queries: stats.create("# p2p namespace queries received"),
            chk_replies: stats.create("# p2p CHK replies received"),
            three_hash_replies: stats.create("# p2p 3HASH replies received"),
            sblock_replies: stats.create("# p2p SBLOCK replies received"),
            queries_forwarded: stats.create("# queries forwarded"),
            replies_forwarded: stats.create("# replies forwarded"),
            replies_migrated: stats.create("# replies cached for migration"),
            malformed: stats.create("# fs messages malformed"),
        };
        let mut table = Vec::with_capacity(ROUTING_TABLE_SIZE);
        table.resize_with(ROUTING_TABLE_SIZE, || None);
        let router = Arc::new(Self {
            cm: Arc::clone(&cm),
            store,
            table: Mutex::new(table),
            sh,
        });

        let r = Arc::downgrade(&router);
        cm.register_handler(
            MSG_QUERY,
            Arc::new(move |sender, payload| match r.upgrade() {
                Some(router) => router.handle_query(sender, payload),
                None => false,
            }),
        );
        let r = Arc::downgrade(&router);
        cm.register_handler(
            MSG_NS_QUERY,
            Arc::new(move |sender, payload| match r.upgrade() {
                Some(router) => router.handle_ns_query(sender, payload),
                None => false,
            }),
        );
        let r = Arc::downgrade(&router);
        cm.register_handler(
            MSG_CHK_REPLY,
            Arc::new(move |sender, payload| match r.upgrade() {
                Some(router) => router.handle_chk_reply(sender, payload),
                None => false,
            }),
        );
        let r = Arc::downgrade(&router);
        cm.register_handler(
            MSG_3HASH_REPLY,
            Arc::new(move |sender, payload| match r.upgrade() {
                Some(router) => router.handle_three_hash_reply(sender, payload),
                None => false,
            }),
        );
        for msg_type in [MSG_SBLOCK_REPLY, MSG_NS_REPLY] {
            let r = Arc::downgrade(&router);
            cm.register_handler(
                msg_type,
                Arc::new(move |sender, payload| match r.upgrade() {
                    Some(router) => router.handle_sblock_reply(sender, payload),
                    None => false,
                }),
            );
        }
        router
    }

    /// The content store this router answers from.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    // -- client surface -----------------------------------------------------

    /// Start a locally-originated query. Replies reaching this node are
    /// delivered to `sink`.
    pub fn start_query(
        &self,
        queries: Vec<HashCode>,
        priority: u32,
        ttl: i32,
        sink: LocalSink,
    ) {
        // Clients get the full policy; TTL is still bounded by priority.
        let policy = QueryPolicy {
            answer: true,
            forward: true,
            indirect: true,
            priority_cap: priority,
        };
        let mut ttl = ttl;
        let bound = (priority as i32 + 8).saturating_mul(TTL_DECREMENT);
        if ttl > bound {
            ttl = bound;
        }
        self.exec_query(policy, queries, priority, ttl, Source::Local(sink));
    }

    /// Insert a data or inode ciphertext into the local store.
    pub fn insert_chk(&self, kind: u16, ciphertext: Vec<u8>, priority: u32) -> Result<HashCode> {
        if kind != KIND_DATA && kind != KIND_INODE {
            return Err(FsError::Malformed(format!("kind {kind} is not CHK")));
        }
        let query = umbra_crypto::content::query_for(&ciphertext, kind);
        self.store_reply(query, kind, ciphertext, priority)?;
        Ok(query)
    }

    /// Insert a keyword block; returns the triple-hash routing query.
    pub fn insert_keyword(&self, keyword: &str, payload: &[u8], priority: u32) -> Result<HashCode> {
        let block = KeywordBlock::create(keyword, payload)?;
        let reply = ThreeHashReply {
            double_hash: blocks::keyword_double_hash(keyword),
            data: block.to_bytes(),
        };
        let query = blocks::keyword_query(keyword);
        self.store_reply(query, KIND_KEYWORD, reply.to_bytes(), priority)?;
        Ok(query)
    }

    /// Insert a namespace signed block; returns its routing identifier.
    pub fn insert_signed(&self, block: &SignedBlock, priority: u32) -> Result<HashCode> {
        block.verify()?;
        let query = block.identifier;
        self.store_reply(query, KIND_SIGNED, block.to_bytes(), priority)?;
        Ok(query)
    }

    /// Remove content under a query hash. Without a value every entry
    /// under the key goes; with one only byte-equal entries.
    pub fn delete(&self, query: &HashCode, value: Option<&[u8]>) -> Result<usize> {
        Ok(self.store.del(query, value)?)
    }

    /// Mark a super-query digest as locally answerable.
    pub fn index_super(&self, query: &HashCode) {
        self.store.index_super(query);
    }

    /// Withdraw a super-query digest.
    pub fn unindex_super(&self, query: &HashCode) {
        self.store.unindex_super(query);
    }

    /// Sample one entry and push it to a random connected peer; called
    /// periodically to keep content circulating.
    pub fn migrate_once(&self) {
        let peers = self.cm.connected_peers();
        if peers.is_empty() {
            return;
        }
        let near = HashCode::compute(&rand::thread_rng().gen::<[u8; 16]>());
        let sample = match self.store.store().get_random(&near, 8 * 1024, None) {
            Ok(Some(e)) => e,
            _ => return,
        };
        let target = peers[rand::thread_rng().gen_range(0..peers.len())];
        if let Some(msg) = reply_message(&sample) {
            let _ = self.cm.send(&target, msg, sample.priority, ROUTE_DELAY);
        }
    }

    // -- inbound handlers ---------------------------------------------------

    fn handle_query(self: &Arc<Self>, sender: &PeerId, payload: &[u8]) -> bool {
        let query = match Query::from_bytes(payload) {
            Ok(q) => q,
            Err(_) => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        };
        self.count(self.sh.queries, 1);
        if query.queries.len() > 1 {
            self.count(self.sh.super_queries, 1);
        }

        let Some((policy, priority, ttl)) =
            self.admit_query(sender, query.priority, query.ttl, query.queries.len() as u32)
        else {
            return true;
        };
        self.exec_query(
            policy,
            query.queries,
            priority,
            ttl,
            Source::Peer {
                sender: *sender,
                return_to: query.return_to,
            },
        );
        true
    }

    fn handle_ns_query(self: &Arc<Self>, sender: &PeerId, payload: &[u8]) -> bool {
        let query = match NsQuery::from_bytes(payload) {
            Ok(q) => q,
            Err(_) => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        };
        self.count(self.sh.ns_queries, 1);
        let Some((policy, priority, ttl)) =
            self.admit_query(sender, query.priority, query.ttl, 1)
        else {
            return true;
        };
        // Namespace queries route by the combined identifier; the
        // namespace digest gates which stored blocks may answer.
        self.exec_ns_query(
            policy,
            query.namespace,
            query.identifier,
            priority,
            ttl,
            Source::Peer {
                sender: *sender,
                return_to: query.return_to,
            },
        );
        true
    }

    /// Steps 2-4 of the pipeline, shared by plain and namespace queries.
    /// Returns `None` when the query is dropped.
    fn admit_query(
        &self,
        sender: &PeerId,
        claimed_priority: u32,
        ttl: i32,
        sub_queries: u32,
    ) -> Option<(QueryPolicy, u32, i32)> {
        // Always decrement the TTL by a randomized step, with wrapping
        // integer arithmetic; a negative TTL that comes out positive
        // (underflow) is a replayed query.
        let step = 2 * TTL_DECREMENT + rand::thread_rng().gen_range(0..TTL_DECREMENT);
        let new_ttl = ttl.wrapping_sub(step);
        if ttl < 0 && new_ttl > 0 {
            return None;
        }

        let policy = evaluate_query(&self.cm, sender, claimed_priority)?;
        let preference = f64::from(policy.priority_cap).max(QUERY_BANDWIDTH_VALUE);
        self.cm.prefer_traffic_from(sender, preference);

        let mut priority = claimed_priority.min(policy.priority_cap);
        priority /= sub_queries.max(1);
        let mut bounded_ttl = new_ttl;
        let bound = (priority as i32 + 3).saturating_mul(TTL_DECREMENT);
        if bounded_ttl > 0 && bounded_ttl > bound {
            bounded_ttl = bound;
        }
        Some((policy, priority, bounded_ttl))
    }

    fn handle_chk_reply(self: &Arc<Self>, sender: &PeerId, payload: &[u8]) -> bool {
        let reply = match ChkReply::from_bytes(payload) {
            Ok(r) => r,
            Err(_) => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        };
        if reply.kind != KIND_DATA && reply.kind != KIND_INODE {
            self.count(self.sh.malformed, 1);
            return false;
        }
        self.count(self.sh.chk_replies, 1);
        let query = umbra_crypto::content::query_for(&reply.data, reply.kind);
        self.process_reply(sender, query, reply.kind, payload.to_vec(), reply.data);
        true
    }

    fn handle_three_hash_reply(self: &Arc<Self>, sender: &PeerId, payload: &[u8]) -> bool {
        let reply = match ThreeHashReply::from_bytes(payload) {
            Ok(r) => r,
            Err(_) => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        };
        // The embedded keyword block must carry a valid keyword-space
        // signature before it is routed anywhere.
        match KeywordBlock::from_bytes(&reply.data) {
            Ok(block) if block.verify().is_ok() => {}
            _ => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        }
        self.count(self.sh.three_hash_replies, 1);
        let query = blocks::query_from_double_hash(&reply.double_hash);
        // Keyword entries keep the whole reply body: answering later needs
        // the double hash alongside the block.
        self.process_reply(sender, query, KIND_KEYWORD, payload.to_vec(), payload.to_vec());
        true
    }

    fn handle_sblock_reply(self: &Arc<Self>, sender: &PeerId, payload: &[u8]) -> bool {
        let reply = match SBlockReply::from_bytes(payload) {
            Ok(r) => r,
            Err(_) => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        };
        let block = match SignedBlock::from_bytes(&reply.data) {
            Ok(b) => b,
            Err(_) => {
                self.count(self.sh.malformed, 1);
                return false;
            }
        };
        if block.verify().is_err() {
            self.count(self.sh.malformed, 1);
            return false;
        }
        self.count(self.sh.sblock_replies, 1);
        let query = block.identifier;
        self.process_reply(sender, query, KIND_SIGNED, payload.to_vec(), reply.data);
        true
    }

    /// Shared reply tail: route to waiters, then consider migration.
    fn process_reply(
        &self,
        sender: &PeerId,
        query: HashCode,
        kind: u16,
        wire_payload: Vec<u8>,
        stored_payload: Vec<u8>,
    ) {
        let msg_type = match kind {
            KIND_KEYWORD => MSG_3HASH_REPLY,
            KIND_SIGNED => MSG_SBLOCK_REPLY,
            _ => MSG_CHK_REPLY,
        };
        let reward = self.use_reply(&query, msg_type, &wire_payload);

        if *sender == self.cm.self_id() {
            // Locally injected; nothing to migrate.
            return;
        }
        let mut preference = f64::from(reward);
        match evaluate_content(&self.cm, reward) {
            Some(priority) => {
                preference += f64::from(priority);
                let entry = Entry {
                    key: query,
                    kind,
                    priority,
                    anonymity: 0,
                    expiration: content_expiration(priority),
                    payload: stored_payload,
                };
                match self.store.put(entry) {
                    Ok(PutOutcome::Inserted) => {
                        self.count(self.sh.replies_migrated, 1);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "migration insert failed");
                    }
                }
            }
            None => {}
        }
        self.cm
            .prefer_traffic_from(sender, preference.max(CONTENT_BANDWIDTH_VALUE));
    }

    // -- routing table ------------------------------------------------------

    /// Route a reply to everyone who asked for its query. Returns the
    /// priority reward the reply earned; replies nobody asked for earn 0
    /// and are never forwarded (they may still be cached by the caller).
    fn use_reply(&self, query: &HashCode, msg_type: u16, payload: &[u8]) -> u32 {
        let content_digest = HashCode::compute(payload);
        let mut deliveries: Vec<(PeerId, u32)> = Vec::new();
        let mut sinks: Vec<LocalSink> = Vec::new();
        let mut reward = 0u32;
        {
            let mut table = self.lock_table();
            let slot = match table[slot_index(query)].as_mut() {
                Some(s) if s.query == *query => s,
                _ => return 0,
            };
            let repeats = slot
                .seen_replies
                .iter()
                .filter(|d| **d == content_digest)
                .count() as u32;
            slot.seen_replies.push(content_digest);
            if repeats > 0 {
                // Repeat delivery of identical content: shrink the reward
                // and do not forward again.
                return slot.priority >> repeats;
            }
            for sink in &slot.local_sinks {
                sinks.push(Arc::clone(sink));
                reward = reward.saturating_add(slot.priority.max(1));
            }
            for waiter in &mut slot.peer_waiters {
                if waiter.budget == 0 {
                    continue;
                }
                deliveries.push((waiter.peer, waiter.budget));
                reward = reward.saturating_add(waiter.budget);
                waiter.budget /= 2;
            }
        }

        for sink in sinks {
            sink(ReplyEvent {
                query: *query,
                msg_type,
                payload: payload.to_vec(),
            });
        }
        for (peer, budget) in deliveries {
            let msg = SubMessage::new(msg_type, payload.to_vec());
            if self.cm.send(&peer, msg, budget, ROUTE_DELAY).is_ok() {
                self.count(self.sh.replies_forwarded, 1);
            }
        }
        reward
    }

    /// Record a query in the routing table so matching replies can be
    /// routed back. Returns `false` if the slot was busy with a
    /// higher-priority query.
    fn add_route(&self, query: &HashCode, priority: u32, ttl: i32, source: &Source) -> bool {
        let mut table = self.lock_table();
        let idx = slot_index(query);
        let now = Instant::now();
        let lifetime = SLOT_MIN_LIFETIME.max(Duration::from_secs(
            ttl.max(0) as u64 + TTL_DECREMENT as u64,
        ));

        let reuse = match &table[idx] {
            Some(slot) if slot.query == *query => true,
            Some(slot) if slot.expires > now && slot.priority > priority => return false,
            _ => false,
        };
        if !reuse {
            table[idx] = Some(QuerySlot {
                query: *query,
                priority,
                local_sinks: Vec::new(),
                peer_waiters: Vec::new(),
                sent_to: Vec::new(),
                seen_replies: Vec::new(),
                expires: now + lifetime,
            });
        }
        let slot = match table[idx].as_mut() {
            Some(s) => s,
            None => return false,
        };
        slot.priority = slot.priority.max(priority);
        slot.expires = slot.expires.max(now + lifetime);
        match source {
            Source::Local(sink) => slot.local_sinks.push(Arc::clone(sink)),
            Source::Peer { return_to, .. } => {
                match slot.peer_waiters.iter_mut().find(|w| w.peer == *return_to) {
                    Some(w) => w.budget = w.budget.saturating_add(priority),
                    None => slot.peer_waiters.push(PeerWaiter {
                        peer: *return_to,
                        budget: priority.max(1),
                    }),
                }
            }
        }
        true
    }

    fn note_sent_to(&self, query: &HashCode, peers: &[PeerId]) {
        let mut table = self.lock_table();
        if let Some(slot) = table[slot_index(query)].as_mut() {
            if slot.query == *query {
                slot.sent_to.extend_from_slice(peers);
            }
        }
    }

    /// Peers a routed query was forwarded to (for tests and diagnostics).
    pub fn routed_to(&self, query: &HashCode) -> Vec<PeerId> {
        let table = self.lock_table();
        match &table[slot_index(query)] {
            Some(slot) if slot.query == *query => slot.sent_to.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether a live routing slot exists for the query.
    pub fn has_route(&self, query: &HashCode) -> bool {
        let table = self.lock_table();
        match &table[slot_index(query)] {
            Some(slot) => slot.query == *query && slot.expires > Instant::now(),
            None => false,
        }
    }

    // -- execution ----------------------------------------------------------

    fn exec_query(
        &self,
        policy: QueryPolicy,
        queries: Vec<HashCode>,
        priority: u32,
        ttl: i32,
        source: Source,
    ) {
        for qh in &queries {
            // Reply path first, so answers and replies can route.
            let routed = if policy.indirect || source.is_local() {
                self.add_route(qh, priority, ttl, &source)
            } else {
                false
            };

            if policy.answer {
                self.answer_locally(qh, &source, priority);
            }

            if policy.forward && ttl > 0 {
                let exclude = source.exclude_list(self.cm.self_id());
                let fanout = policy::forward_fanout(priority);
                let targets = policy::select_forwarding_set(&self.cm, &exclude, fanout);
                if targets.is_empty() {
                    continue;
                }
                let return_to = if policy.indirect && routed {
                    self.cm.self_id()
                } else {
                    source.return_to(self.cm.self_id())
                };
                let msg = Query {
                    priority,
                    ttl,
                    return_to,
                    queries: vec![*qh],
                };
                let sub = SubMessage::new(MSG_QUERY, msg.to_bytes());
                let mut sent = Vec::new();
                for peer in targets {
                    if self
                        .cm
                        .send(&peer, sub.clone(), priority, ROUTE_DELAY)
                        .is_ok()
                    {
                        sent.push(peer);
                        self.count(self.sh.queries_forwarded, 1);
                    }
                }
                self.note_sent_to(qh, &sent);
            }
        }
    }

    fn exec_ns_query(
        &self,
        policy: QueryPolicy,
        namespace: HashCode,
        identifier: HashCode,
        priority: u32,
        ttl: i32,
        source: Source,
    ) {
        let routed = if policy.indirect || source.is_local() {
            self.add_route(&identifier, priority, ttl, &source)
        } else {
            false
        };

        if policy.answer {
            self.answer_ns_locally(&namespace, &identifier, &source, priority);
        }

        if policy.forward && ttl > 0 {
            let exclude = source.exclude_list(self.cm.self_id());
            let targets = policy::select_forwarding_set(
                &self.cm,
                &exclude,
                policy::forward_fanout(priority),
            );
            if targets.is_empty() {
                return;
            }
            let return_to = if policy.indirect && routed {
                self.cm.self_id()
            } else {
                source.return_to(self.cm.self_id())
            };
            let msg = NsQuery {
                priority,
                ttl,
                return_to,
                namespace,
                identifier,
            };
            let sub = SubMessage::new(MSG_NS_QUERY, msg.to_bytes());
            let mut sent = Vec::new();
            for peer in targets {
                if self
                    .cm
                    .send(&peer, sub.clone(), priority, ROUTE_DELAY)
                    .is_ok()
                {
                    sent.push(peer);
                    self.count(self.sh.queries_forwarded, 1);
                }
            }
            self.note_sent_to(&identifier, &sent);
        }
    }

    /// Probe the bloom filters, fetch matches and send them down the reply
    /// path.
    fn answer_locally(&self, query: &HashCode, source: &Source, priority: u32) {
        if !self.store.fast_get(query) && !self.store.fast_get_super(query) {
            return;
        }
        let mut matches = Vec::new();
        let _ = self.store.get(query, None, &mut |entry| {
            matches.push(entry.clone());
            IterControl::Continue
        });
        for entry in matches {
            if let Some(msg) = reply_message(&entry) {
                self.deliver_answer(source, query, msg, priority);
            }
        }
    }

    fn answer_ns_locally(
        &self,
        namespace: &HashCode,
        identifier: &HashCode,
        source: &Source,
        priority: u32,
    ) {
        if !self.store.fast_get(identifier) {
            return;
        }
        let mut matches = Vec::new();
        let _ = self.store.get(identifier, Some(KIND_SIGNED), &mut |entry| {
            matches.push(entry.clone());
            IterControl::Continue
        });
        for entry in matches {
            // Only blocks actually signed by the queried namespace answer.
            let Ok(block) = SignedBlock::from_bytes(&entry.payload) else {
                continue;
            };
            if HashCode::compute(block.namespace.as_bytes()) != *namespace {
                continue;
            }
            if let Some(msg) = reply_message(&entry) {
                self.deliver_answer(source, identifier, msg, priority);
            }
        }
    }

    fn deliver_answer(
        &self,
        source: &Source,
        query: &HashCode,
        msg: SubMessage,
        priority: u32,
    ) {
        match source {
            Source::Local(sink) => sink(ReplyEvent {
                query: *query,
                msg_type: msg.msg_type,
                payload: msg.payload,
            }),
            Source::Peer { return_to, .. } => {
                if self
                    .cm
                    .send(return_to, msg, priority.max(1), ROUTE_DELAY)
                    .is_ok()
                {
                    self.count(self.sh.replies_forwarded, 1);
                }
            }
        }
    }

    fn store_reply(
        &self,
        query: HashCode,
        kind: u16,
        payload: Vec<u8>,
        priority: u32,
    ) -> Result<()> {
        let entry = Entry {
            key: query,
            kind,
            priority,
            anonymity: 0,
            expiration: 0,
            payload,
        };
        self.store.put(entry)?;
        Ok(())
    }

    fn count(&self, handle: StatHandle, delta: i64) {
        self.cm.stats().change(handle, delta);
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, Vec<Option<QuerySlot>>> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Who asked.
enum Source {
    Local(LocalSink),
    Peer { sender: PeerId, return_to: PeerId },
}

impl Source {
    fn is_local(&self) -> bool {
        matches!(self, Source::Local(_))
    }

    fn return_to(&self, self_id: PeerId) -> PeerId {
        match self {
            Source::Local(_) => self_id,
            Source::Peer { return_to, .. } => *return_to,
        }
    }

    fn exclude_list(&self, self_id: PeerId) -> Vec<PeerId> {
        match self {
            Source::Local(_) => vec![self_id],
            Source::Peer { sender, return_to } => vec![self_id, *sender, *return_to],
        }
    }
}

fn slot_index(query: &HashCode) -> usize {
    let b = query.as_bytes();
    let word = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    word as usize % ROUTING_TABLE_SIZE
}

/// Rebuild the wire reply for a stored entry.
fn reply_message(entry: &Entry) -> Option<SubMessage> {
    match entry.kind {
        KIND_DATA | KIND_INODE => Some(SubMessage::new(
            MSG_CHK_REPLY,
            ChkReply {
                kind: entry.kind,
                data: entry.payload.clone(),
            }
            .to_bytes(),
        )),
        KIND_KEYWORD => Some(SubMessage::new(MSG_3HASH_REPLY, entry.payload.clone())),
        KIND_SIGNED => Some(SubMessage::new(
            MSG_SBLOCK_REPLY,
            SBlockReply {
                data: entry.payload.clone(),
            }
            .to_bytes(),
        )),
        _ => None,
    }
}

/// Cached content lives longer the more it was worth.
fn content_expiration(priority: u32) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now + 3600 + u64::from(priority) * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use umbra_core::{CoreConfig, Stats};
    use umbra_crypto::identity::KeyPair;
    use umbra_store::memory::MemoryStore;
    use umbra_transport::memory::MemoryHub;

    struct TestNode {
        cm: Arc<ConnectionManager>,
        router: Arc<FsRouter>,
        _cron: Arc<umbra_cron::Cron>,
    }

    fn node(hub: &MemoryHub, name: &str) -> TestNode {
        let keys = Arc::new(KeyPair::generate());
        let cm = Arc::new(ConnectionManager::new(
            keys,
            CoreConfig::default(),
            Arc::new(Stats::new()),
        ));
        cm.add_transport(Arc::new(hub.endpoint(name, 16 * 1024)));
        cm.start().expect("start");
        let store = Arc::new(ContentStore::new(Arc::new(MemoryStore::new(1024))));
        let router = FsRouter::new(Arc::clone(&cm), store);
        let cron = Arc::new(umbra_cron::Cron::start());
        let flusher = Arc::clone(&cm);
        cron.add(
            Duration::from_millis(20),
            Duration::from_millis(20),
            Box::new(move || flusher.flush_due()),
        );
        TestNode {
            cm,
            router,
            _cron: cron,
        }
    }

    fn introduce(from: &TestNode, to: &TestNode) {
        for hello in to.cm.create_hellos() {
            from.cm.learn_hello(hello).expect("learn");
        }
    }

    #[test]
    fn test_local_insert_then_local_query() {
        let hub = MemoryHub::new();
        let n = node(&hub, "solo");

        let (ck, ciphertext) = blocks::encode_data_block(b"8 bytes!").expect("encode");
        n.router
            .insert_chk(KIND_DATA, ciphertext.clone(), 5)
            .expect("insert");

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        n.router.start_query(
            vec![ck.query],
            5,
            10 * TTL_DECREMENT,
            Arc::new(move |event| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(event);
                }
            }),
        );
        let event = rx.recv_timeout(Duration::from_secs(2)).expect("reply");
        assert_eq!(event.query, ck.query);
        let reply = ChkReply::from_bytes(&event.payload).expect("parse");
        assert_eq!(reply.data, ciphertext);
        assert_eq!(
            blocks::decode_data_block(&reply.data, &ck.key).expect("decode"),
            b"8 bytes!"
        );
        // exactly one reply for one stored block
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_two_peer_query_forwarding() {
        let hub = MemoryHub::new();
        let x = node(&hub, "x");
        let y = node(&hub, "y");
        introduce(&x, &y);
        introduce(&y, &x);
        x.cm.connect_peer(&y.cm.self_id()).expect("connect");
        // Give the forwarding policy a reason to pick Y.
        x.cm.change_trust(&y.cm.self_id(), 10);
        y.cm.change_trust(&x.cm.self_id(), 10);

        let (ck, ciphertext) = blocks::encode_data_block(b"remote block").expect("encode");
        y.router
            .insert_chk(KIND_DATA, ciphertext.clone(), 5)
            .expect("insert");

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        x.router.start_query(
            vec![ck.query],
            4,
            10 * TTL_DECREMENT,
            Arc::new(move |event| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(event);
                }
            }),
        );
        let event = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
        let reply = ChkReply::from_bytes(&event.payload).expect("parse");
        assert_eq!(reply.data, ciphertext);
    }

    #[test]
    fn test_negative_ttl_contract() {
        let hub = MemoryHub::new();
        let n = node(&hub, "replay");
        let sender = KeyPair::generate().peer_id();
        // An ordinary negative TTL just gets more negative and passes.
        assert!(n.router.admit_query(&sender, 4, -1, 1).is_some());
        // A TTL that wraps positive under the decrement is a replay: drop.
        assert!(n
            .router
            .admit_query(&sender, 4, i32::MIN + TTL_DECREMENT, 1)
            .is_none());
    }

    #[test]
    fn test_ttl_strictly_decreases_per_hop() {
        let hub = MemoryHub::new();
        let n = node(&hub, "mono");
        let sender = KeyPair::generate().peer_id();
        n.cm.change_trust(&sender, 100);
        for _ in 0..32 {
            let ttl_in = 4 * TTL_DECREMENT;
            let (_, _, ttl_out) = n
                .router
                .admit_query(&sender, 1, ttl_in, 1)
                .expect("admitted");
            assert!(
                ttl_out <= ttl_in - 2 * TTL_DECREMENT,
                "hop decrement below the floor: {ttl_in} -> {ttl_out}"
            );
        }
    }

    #[test]
    fn test_ttl_bound_by_priority() {
        let hub = MemoryHub::new();
        let n = node(&hub, "bound");
        let sender = KeyPair::generate().peer_id();
        n.cm.change_trust(&sender, 100);
        let (_, priority, ttl) = n
            .router
            .admit_query(&sender, 2, 1000 * TTL_DECREMENT, 1)
            .expect("admitted");
        assert!(ttl <= (priority as i32 + 3) * TTL_DECREMENT);
    }

    #[test]
    fn test_reply_without_route_not_forwarded() {
        let hub = MemoryHub::new();
        let n = node(&hub, "noroute");
        let query = HashCode::compute(b"never asked");
        let reward = n.router.use_reply(&query, MSG_CHK_REPLY, b"payload");
        assert_eq!(reward, 0);
    }

    #[test]
    fn test_duplicate_reply_reward_decays() {
        let hub = MemoryHub::new();
        let n = node(&hub, "dupes");
        let query = HashCode::compute(b"the query");
        let (tx, _rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        n.router.start_query(
            vec![query],
            8,
            10 * TTL_DECREMENT,
            Arc::new(move |event| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(event);
                }
            }),
        );
        let first = n.router.use_reply(&query, MSG_CHK_REPLY, b"same bytes");
        let second = n.router.use_reply(&query, MSG_CHK_REPLY, b"same bytes");
        assert!(first > 0);
        assert!(second < first, "repeat reward must shrink");
    }

    #[test]
    fn test_keyword_roundtrip_through_store() {
        let hub = MemoryHub::new();
        let n = node(&hub, "kw");
        let query = n
            .router
            .insert_keyword("search words", b"file-id", 3)
            .expect("insert");
        assert_eq!(query, blocks::keyword_query("search words"));

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        n.router.start_query(
            vec![query],
            3,
            5 * TTL_DECREMENT,
            Arc::new(move |event| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(event);
                }
            }),
        );
        let event = rx.recv_timeout(Duration::from_secs(2)).expect("reply");
        assert_eq!(event.msg_type, MSG_3HASH_REPLY);
        let reply = ThreeHashReply::from_bytes(&event.payload).expect("parse");
        let block = KeywordBlock::from_bytes(&reply.data).expect("block");
        assert_eq!(block.decrypt("search words").expect("decrypt"), b"file-id");
    }
}
