//! The asynchronous DHT operation engine.
//!
//! The three state machines (get, put, remove) share one shape: gather
//! target peers (from the local buckets when this node participates in the
//! table, through a master-table lookup otherwise), fire RPCs, accumulate
//! results or replica confirmations under the operation lock, and register
//! an abort job at the absolute deadline. Reaching the desired count
//! advances the abort job to now; the abort path cancels the peer search
//! and every outstanding RPC, invokes the completion callback exactly
//! once, and frees the record. Abort is idempotent because completion and
//! timeout may race.
//!
//! The callee side registers five procedures on the RPC substrate:
//! `dht_ping`, `dht_find_node`, `dht_find_value`, `dht_store` and
//! `dht_remove`. Lookups are iterative: `dht_find_value` replies carry
//! both values and closer participating peers, and the originator keeps
//! querying the closest unqueried candidate until it has enough results or
//! the deadline fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use umbra_core::stats::StatHandle;
use umbra_core::ConnectionManager;
use umbra_cron::{Cron, JobId};
use umbra_crypto::hash::HASH_LEN;
use umbra_crypto::{HashCode, PeerId};
use umbra_rpc::{RpcEngine, RpcHandle, RpcParams, RpcStatus, RPC_ERROR_MALFORMED_ARGS};
use umbra_store::{Datastore, Entry, IterControl};

use crate::buckets::{
    AddOutcome, RoutingBuckets, SweepAction, DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_SIZE,
};
use crate::{DhtError, Result, TableId, ALPHA, FLAG_MIGRATE, MASTER_TABLE_ID};

/// Importance assigned to DHT RPC traffic.
const DHT_RPC_IMPORTANCE: u32 = 64;

/// Kind tag under which DHT values are stored in table datastores.
const DHT_VALUE_KIND: u16 = 0x10;

/// Configuration of the DHT engine.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Buckets over the 512-bit distance space.
    pub bucket_count: usize,
    /// Peers per bucket.
    pub bucket_size: usize,
    /// Period of the maintenance job.
    pub maintain_period: Duration,
    /// A peer that has not refreshed its tables for this long is dead.
    pub inactivity_death: Duration,
    /// Per-table datastore capacity in entries.
    pub table_store_entries: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        let maintain = Duration::from_secs(15);
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            maintain_period: maintain,
            inactivity_death: maintain * 56,
            table_store_entries: 4096,
        }
    }
}

/// A table this node participates in.
pub struct LocalTable {
    pub id: TableId,
    pub flags: u32,
    pub store: Arc<dyn Datastore>,
}

struct DhtState {
    buckets: RoutingBuckets,
    tables: Vec<LocalTable>,
}

/// Completion for get: all accumulated values (empty on timeout).
pub type GetCompletion = Box<dyn FnOnce(Vec<Vec<u8>>) + Send>;
/// Completion for put: the peers that confirmed a replica.
pub type PutCompletion = Box<dyn FnOnce(Vec<PeerId>) + Send>;
/// Completion for remove: the number of confirmations.
pub type RemoveCompletion = Box<dyn FnOnce(usize) + Send>;

/// Where a get operation's values go.
enum GetSink {
    /// A client call: accumulate and hand everything to the completion.
    Results(Option<GetCompletion>),
    /// Peer discovery for another operation: each value is a peer
    /// identity fed into the target operation.
    Feed(u64),
}

struct GetOp {
    table: TableId,
    key: HashCode,
    max_results: usize,
    deadline: Instant,
    results: Vec<Vec<u8>>,
    candidates: Vec<PeerId>,
    queried: Vec<PeerId>,
    rpcs: Vec<RpcHandle>,
    /// Replies (or timeouts) received; `rpcs.len() - replies` is in flight.
    replies: usize,
    abort_job: JobId,
    sink: GetSink,
    /// Sub-operation locating participants (a master-table get).
    finder: Option<u64>,
}

struct PutOp {
    table: TableId,
    key: HashCode,
    value: Vec<u8>,
    replication: usize,
    deadline: Instant,
    /// Peers that confirmed storage, deduplicated by identity.
    confirmed: Vec<PeerId>,
    sent_to: Vec<PeerId>,
    rpcs: Vec<RpcHandle>,
    abort_job: JobId,
    completion: Option<PutCompletion>,
    finder: Option<u64>,
}

struct RemoveOp {
    table: TableId,
    key: HashCode,
    value: Option<Vec<u8>>,
    replication: usize,
    deadline: Instant,
    /// Raw confirmation count; repeats from one peer all count.
    confirmed: usize,
    sent_to: Vec<PeerId>,
    rpcs: Vec<RpcHandle>,
    abort_job: JobId,
    completion: Option<RemoveCompletion>,
    finder: Option<u64>,
}

enum Op {
    Get(GetOp),
    Put(PutOp),
    Remove(RemoveOp),
}

struct EngineStats {
    gets: StatHandle,
    puts: StatHandle,
    removes: StatHandle,
    timeouts: StatHandle,
    find_value_served: StatHandle,
    store_served: StatHandle,
    peers_evicted: StatHandle,
}

/// The DHT engine. One per node.
pub struct DhtEngine {
    cm: Arc<ConnectionManager>,
    rpc: Arc<RpcEngine>,
    cron: Arc<Cron>,
    config: DhtConfig,
    /// The engine's global lock; ordered before the operation table.
    state: Mutex<DhtState>,
    ops: Mutex<HashMap<u64, Op>>,
    next_op: AtomicU64,
    sh: EngineStats,
}

impl DhtEngine {
    /// Create the engine, join the master table and register the DHT
    /// procedures on the RPC substrate.
    pub fn new(
        cm: Arc<ConnectionManager>,
        rpc: Arc<RpcEngine>,
        cron: Arc<Cron>,
        config: DhtConfig,
    ) -> Arc<Self> {
        let stats = cm.stats();
        let sh = EngineStats {
            gets: stats.create("# dht get operations started"),
            puts: stats.create("# dht put operations started"),
            removes: stats.create("# dht remove operations started"),
            timeouts: stats.create("# dht operations timed out"),
            find_value_served: stats.create("# dht find_value requests served"),
            store_served: stats.create("# dht store requests served"),
            peers_evicted: stats.create("# dht peers evicted"),
        };
        let self_id = cm.self_id();
        let master = LocalTable {
            id: MASTER_TABLE_ID,
            flags: 0,
            store: Arc::new(umbra_store::memory::MemoryStore::new(
                config.table_store_entries,
            )),
        };
        let engine = Arc::new(Self {
            cm,
            rpc,
            cron,
            state: Mutex::new(DhtState {
                buckets: RoutingBuckets::new(self_id, config.bucket_count, config.bucket_size),
                tables: vec![master],
            }),
            config,
            ops: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
            sh,
        });
        engine.register_procedures();
        engine
    }

    /// Schedule the periodic maintenance job. Returns its id.
    pub fn start_maintenance(self: &Arc<Self>) -> JobId {
        let weak = Arc::downgrade(self);
        self.cron.add(
            self.config.maintain_period,
            self.config.maintain_period,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.maintain();
                }
            }),
        )
    }

    // -- table membership ---------------------------------------------------

    /// Join a table with the given flags and datastore.
    pub fn join(&self, table: TableId, flags: u32, store: Arc<dyn Datastore>) -> Result<()> {
        let mut state = self.lock_state();
        if state.tables.iter().any(|t| t.id == table) {
            return Ok(());
        }
        state.tables.push(LocalTable {
            id: table,
            flags,
            store,
        });
        tracing::info!(table = %table.short(), "joined table");
        Ok(())
    }

    /// Leave a table. With the migration flag (on the table or in
    /// `flags`), local entries are re-put into the DHT until
    /// `migration_deadline`, highest priority first. The master table is
    /// never migrated.
    pub fn leave(
        self: &Arc<Self>,
        table: &TableId,
        flags: u32,
        migration_deadline: Duration,
    ) -> Result<()> {
        let removed = {
            let mut state = self.lock_state();
            match state.tables.iter().position(|t| t.id == *table) {
                Some(pos) => state.tables.remove(pos),
                None => return Err(DhtError::TableNotFound),
            }
        };
        tracing::info!(table = %table.short(), "left table");
        let migrate = (removed.flags | flags) & FLAG_MIGRATE != 0;
        if migrate && *table != MASTER_TABLE_ID {
            let stop_at = Instant::now() + migration_deadline;
            let mut entries = Vec::new();
            let _ = removed.store.iterate(&mut |entry| {
                if Instant::now() >= stop_at {
                    return IterControl::Abort;
                }
                entries.push((entry.key, entry.payload.clone()));
                IterControl::Continue
            });
            for (key, value) in entries {
                if Instant::now() >= stop_at {
                    break;
                }
                let _ = self.put_start(
                    *table,
                    key,
                    value,
                    ALPHA as usize,
                    migration_deadline,
                    Box::new(|_| {}),
                );
            }
        }
        Ok(())
    }

    /// Tables this node participates in.
    pub fn joined_tables(&self) -> Vec<TableId> {
        self.lock_state().tables.iter().map(|t| t.id).collect()
    }

    fn table_store(&self, table: &TableId) -> Option<Arc<dyn Datastore>> {
        self.lock_state()
            .tables
            .iter()
            .find(|t| t.id == *table)
            .map(|t| Arc::clone(&t.store))
    }

    // -- peer knowledge -----------------------------------------------------

    /// Record that a peer exists (e.g. from a fresh hello or connection).
    /// Every peer implicitly participates in the master table.
    pub fn seed_peer(self: &Arc<Self>, peer: PeerId) {
        self.touch_peer(&peer, &[MASTER_TABLE_ID]);
    }

    /// Note activity from a peer and merge its table memberships, pinging
    /// a stale occupant before evicting when the bucket is full.
    fn touch_peer(self: &Arc<Self>, peer: &PeerId, tables: &[TableId]) {
        if *peer == self.cm.self_id() {
            return;
        }
        let outcome = {
            let mut state = self.lock_state();
            state.buckets.offer(*peer, tables)
        };
        if let AddOutcome::BucketFull { stale } = outcome {
            self.ping_before_replace(stale, *peer, tables.to_vec());
        }
    }

    /// Ping the stale occupant; replace it with the newcomer only if the
    /// ping times out.
    fn ping_before_replace(self: &Arc<Self>, stale: PeerId, newcomer: PeerId, tables: Vec<TableId>) {
        {
            let mut state = self.lock_state();
            match state.buckets.find_mut(&stale) {
                Some(info) => {
                    let now = Instant::now();
                    // One probe at a time per stale peer.
                    if info
                        .last_ping_sent
                        .is_some_and(|t| now.duration_since(t) < self.config.inactivity_death / 6)
                    {
                        return;
                    }
                    info.last_ping_sent = Some(now);
                }
                None => return,
            }
        }
        let weak = Arc::downgrade(self);
        let tables_for_closure = tables.clone();
        let result = self.rpc.start(
            &stale,
            "dht_ping",
            RpcParams::new(),
            DHT_RPC_IMPORTANCE,
            Duration::from_secs(5),
            Box::new(move |status, params| {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                match status {
                    RpcStatus::Ok => {
                        let tables = parse_tables(&params);
                        let mut state = engine.lock_state();
                        state.buckets.offer(stale, &tables);
                    }
                    _ => {
                        let mut state = engine.lock_state();
                        if state.buckets.replace(&stale, newcomer, &tables_for_closure) {
                            drop(state);
                            engine.cm.stats().change(engine.sh.peers_evicted, 1);
                        }
                    }
                }
            }),
        );
        if result.is_err() {
            // Unreachable without a session: treat like a failed ping.
            let mut state = self.lock_state();
            if state.buckets.replace(&stale, newcomer, &tables) {
                drop(state);
                self.cm.stats().change(self.sh.peers_evicted, 1);
            }
        }
    }

    /// Number of peers across all buckets.
    pub fn known_peers(&self) -> usize {
        self.lock_state().buckets.len()
    }

    // -- get ----------------------------------------------------------------

    /// Start an asynchronous get. The completion callback fires exactly
    /// once: early when `max_results` values arrived, otherwise from the
    /// deadline abort with whatever accumulated (possibly nothing).
    pub fn get_start(
        self: &Arc<Self>,
        table: TableId,
        key: HashCode,
        max_results: usize,
        timeout: Duration,
        completion: GetCompletion,
    ) -> Result<u64> {
        self.cm.stats().change(self.sh.gets, 1);
        self.get_start_inner(table, key, max_results, timeout, GetSink::Results(Some(completion)))
    }

    fn get_start_inner(
        self: &Arc<Self>,
        table: TableId,
        key: HashCode,
        max_results: usize,
        timeout: Duration,
        sink: GetSink,
    ) -> Result<u64> {
        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let abort_job = self.cron.add(
            timeout,
            Duration::ZERO,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.abort_get(op_id);
                }
            }),
        );

        let deadline = Instant::now() + timeout;
        let (local_results, candidates, participant) = {
            let state = self.lock_state();
            let participant = state.tables.iter().any(|t| t.id == table);
            let candidates = state
                .buckets
                .k_best_for_table(&table, &key, ALPHA as usize);
            (Vec::new(), candidates, participant)
        };
        let mut results: Vec<Vec<u8>> = local_results;
        if participant {
            if let Some(store) = self.table_store(&table) {
                let _ = store.get(&key, Some(DHT_VALUE_KIND), &mut |entry| {
                    results.push(entry.payload.clone());
                    if results.len() >= max_results {
                        IterControl::Abort
                    } else {
                        IterControl::Continue
                    }
                });
            }
        }

        // Local hits destined for a feed target are peers already known;
        // hand them over as soon as the record exists.
        let local_feed: Vec<(u64, PeerId)> = match &sink {
            GetSink::Feed(target) => results
                .iter()
                .filter_map(|v| peer_from_bytes(v).map(|p| (*target, p)))
                .collect(),
            GetSink::Results(_) => Vec::new(),
        };

        let op = GetOp {
            table,
            key,
            max_results,
            deadline,
            results,
            candidates,
            queried: Vec::new(),
            rpcs: Vec::new(),
            replies: 0,
            abort_job,
            sink,
            finder: None,
        };
        let satisfied = op.results.len() >= op.max_results;
        self.lock_ops().insert(op_id, Op::Get(op));

        for (target, peer) in local_feed {
            self.feed_peer(target, peer);
        }
        if satisfied {
            let _ = self.cron.advance(abort_job);
            return Ok(op_id);
        }

        // Not a participant and nobody known for the table: locate
        // participants through the master table.
        if !participant && table != MASTER_TABLE_ID {
            let finder = self.get_start_inner(
                MASTER_TABLE_ID,
                table,
                ALPHA as usize,
                timeout,
                GetSink::Feed(op_id),
            )?;
            if let Some(Op::Get(op)) = self.lock_ops().get_mut(&op_id) {
                op.finder = Some(finder);
            }
        }
        self.fire_get_queries(op_id);
        Ok(op_id)
    }

    /// Send find-value RPCs to the closest unqueried candidates, keeping
    /// at most ALPHA in flight.
    fn fire_get_queries(self: &Arc<Self>, op_id: u64) {
        let to_query: Vec<PeerId> = {
            let mut ops = self.lock_ops();
            let Some(Op::Get(op)) = ops.get_mut(&op_id) else {
                return;
            };
            let in_flight = op.rpcs.len().saturating_sub(op.replies);
            let slots = (ALPHA as usize).saturating_sub(in_flight);
            if slots == 0 {
                return;
            }
            let key = op.key;
            op.candidates
                .sort_by(|a, b| HashCode::distance_cmp(&a.0, &b.0, &key));
            let queried = op.queried.clone();
            let mut picked = Vec::new();
            op.candidates.retain(|c| {
                if picked.len() < slots && !queried.contains(c) {
                    picked.push(*c);
                    false
                } else {
                    true
                }
            });
            op.queried.extend_from_slice(&picked);
            picked
        };

        for peer in to_query {
            let (table, key, max_results, remaining) = {
                let ops = self.lock_ops();
                let Some(Op::Get(op)) = ops.get(&op_id) else {
                    return;
                };
                (
                    op.table,
                    op.key,
                    op.max_results,
                    op.deadline.saturating_duration_since(Instant::now()),
                )
            };
            if remaining.is_zero() {
                return;
            }
            let params = RpcParams::new()
                .add("table", table.as_bytes().to_vec())
                .add("key", key.as_bytes().to_vec())
                .add("max", (max_results as u64).to_be_bytes().to_vec());
            let weak = Arc::downgrade(self);
            let handle = self.rpc.start(
                &peer,
                "dht_find_value",
                params,
                DHT_RPC_IMPORTANCE,
                remaining,
                Box::new(move |status, params| {
                    if let Some(engine) = weak.upgrade() {
                        engine.on_get_reply(op_id, status, &params);
                    }
                }),
            );
            match handle {
                Ok(h) => {
                    let mut ops = self.lock_ops();
                    match ops.get_mut(&op_id) {
                        Some(Op::Get(op)) => op.rpcs.push(h),
                        _ => {
                            drop(ops);
                            self.rpc.stop(h);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "find_value rpc failed to start");
                }
            }
        }
    }

    fn on_get_reply(self: &Arc<Self>, op_id: u64, status: RpcStatus, params: &RpcParams) {
        let mut fed: Vec<(u64, PeerId)> = Vec::new();
        let mut done = false;
        {
            let mut ops = self.lock_ops();
            let Some(Op::Get(op)) = ops.get_mut(&op_id) else {
                return;
            };
            op.replies += 1;
            if status == RpcStatus::Ok {
                for value in params.values("value") {
                    if op.results.len() >= op.max_results {
                        break;
                    }
                    match &op.sink {
                        GetSink::Results(_) => op.results.push(value.to_vec()),
                        GetSink::Feed(target) => {
                            if let Some(peer) = peer_from_bytes(value) {
                                op.results.push(value.to_vec());
                                fed.push((*target, peer));
                            }
                        }
                    }
                }
                for peer_bytes in params.values("peer") {
                    if let Some(peer) = peer_from_bytes(peer_bytes) {
                        if !op.queried.contains(&peer) && !op.candidates.contains(&peer) {
                            op.candidates.push(peer);
                        }
                    }
                }
            }
            if op.results.len() >= op.max_results {
                done = true;
            }
        }

        for (target, peer) in fed {
            self.feed_peer(target, peer);
        }
        if done {
            self.advance_op(op_id);
        } else {
            self.fire_get_queries(op_id);
        }
    }

    /// Abort a get: cancel the finder and outstanding RPCs, fire the
    /// completion exactly once, free the record. Idempotent.
    pub fn abort_get(self: &Arc<Self>, op_id: u64) {
        let mut op = {
            let mut ops = self.lock_ops();
            match ops.get(&op_id) {
                Some(Op::Get(_)) => {}
                _ => return,
            }
            match ops.remove(&op_id) {
                Some(Op::Get(op)) => op,
                _ => return,
            }
        };
        self.cron.remove(op.abort_job);
        if let Some(finder) = op.finder.take() {
            self.abort_get(finder);
        }
        for h in op.rpcs.drain(..) {
            self.rpc.stop(h);
        }
        if op.results.is_empty() {
            self.cm.stats().change(self.sh.timeouts, 1);
        }
        if let GetSink::Results(completion) = &mut op.sink {
            if let Some(completion) = completion.take() {
                completion(std::mem::take(&mut op.results));
            }
        }
    }

    // -- put ----------------------------------------------------------------

    /// Start an asynchronous put targeting `replication` confirmed
    /// replicas. Confirming peers are deduplicated by identity.
    pub fn put_start(
        self: &Arc<Self>,
        table: TableId,
        key: HashCode,
        value: Vec<u8>,
        replication: usize,
        timeout: Duration,
        completion: PutCompletion,
    ) -> Result<u64> {
        self.cm.stats().change(self.sh.puts, 1);
        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let abort_job = self.cron.add(
            timeout,
            Duration::ZERO,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.abort_put(op_id);
                }
            }),
        );

        let (candidates, participant) = {
            let state = self.lock_state();
            let participant = state.tables.iter().any(|t| t.id == table);
            (
                state
                    .buckets
                    .k_best_for_table(&table, &key, replication.max(ALPHA as usize)),
                participant,
            )
        };
        if participant {
            if let Some(store) = self.table_store(&table) {
                let _ = store.put_update(dht_entry(key, value.clone()));
            }
        }

        let op = PutOp {
            table,
            key,
            value,
            replication: replication.max(1),
            deadline: Instant::now() + timeout,
            confirmed: Vec::new(),
            sent_to: Vec::new(),
            rpcs: Vec::new(),
            abort_job,
            completion: Some(completion),
            finder: None,
        };
        self.lock_ops().insert(op_id, Op::Put(op));

        if !participant && table != MASTER_TABLE_ID {
            let finder = self.get_start_inner(
                MASTER_TABLE_ID,
                table,
                ALPHA as usize,
                timeout,
                GetSink::Feed(op_id),
            )?;
            if let Some(Op::Put(op)) = self.lock_ops().get_mut(&op_id) {
                op.finder = Some(finder);
            }
        }
        for peer in candidates {
            self.fire_store(op_id, peer);
        }
        Ok(op_id)
    }

    fn fire_store(self: &Arc<Self>, op_id: u64, peer: PeerId) {
        let (table, key, value, remaining) = {
            let mut ops = self.lock_ops();
            let Some(Op::Put(op)) = ops.get_mut(&op_id) else {
                return;
            };
            if op.sent_to.contains(&peer) {
                return;
            }
            op.sent_to.push(peer);
            (
                op.table,
                op.key,
                op.value.clone(),
                op.deadline.saturating_duration_since(Instant::now()),
            )
        };
        if remaining.is_zero() {
            return;
        }
        let params = RpcParams::new()
            .add("table", table.as_bytes().to_vec())
            .add("key", key.as_bytes().to_vec())
            .add("value", value);
        let weak = Arc::downgrade(self);
        let handle = self.rpc.start(
            &peer,
            "dht_store",
            params,
            DHT_RPC_IMPORTANCE,
            remaining,
            Box::new(move |status, _params| {
                if let Some(engine) = weak.upgrade() {
                    engine.on_store_reply(op_id, peer, status);
                }
            }),
        );
        if let Ok(h) = handle {
            let mut ops = self.lock_ops();
            match ops.get_mut(&op_id) {
                Some(Op::Put(op)) => op.rpcs.push(h),
                _ => {
                    drop(ops);
                    self.rpc.stop(h);
                }
            }
        }
    }

    fn on_store_reply(self: &Arc<Self>, op_id: u64, peer: PeerId, status: RpcStatus) {
        let done = {
            let mut ops = self.lock_ops();
            let Some(Op::Put(op)) = ops.get_mut(&op_id) else {
                return;
            };
            if status == RpcStatus::Ok && !op.confirmed.contains(&peer) {
                op.confirmed.push(peer);
            }
            op.confirmed.len() >= op.replication
        };
        if done {
            self.advance_op(op_id);
        }
    }

    /// Abort a put; same contract as [`abort_get`](Self::abort_get).
    pub fn abort_put(self: &Arc<Self>, op_id: u64) {
        let mut op = {
            let mut ops = self.lock_ops();
            match ops.get(&op_id) {
                Some(Op::Put(_)) => {}
                _ => return,
            }
            match ops.remove(&op_id) {
                Some(Op::Put(op)) => op,
                _ => return,
            }
        };
        self.cron.remove(op.abort_job);
        if let Some(finder) = op.finder.take() {
            self.abort_get(finder);
        }
        for h in op.rpcs.drain(..) {
            self.rpc.stop(h);
        }
        if op.confirmed.is_empty() {
            self.cm.stats().change(self.sh.timeouts, 1);
        }
        if let Some(completion) = op.completion.take() {
            completion(std::mem::take(&mut op.confirmed));
        }
    }

    // -- remove -------------------------------------------------------------

    /// Start an asynchronous remove. Confirmations are counted raw: the
    /// same peer confirming twice counts twice.
    pub fn remove_start(
        self: &Arc<Self>,
        table: TableId,
        key: HashCode,
        value: Option<Vec<u8>>,
        replication: usize,
        timeout: Duration,
        completion: RemoveCompletion,
    ) -> Result<u64> {
        self.cm.stats().change(self.sh.removes, 1);
        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let abort_job = self.cron.add(
            timeout,
            Duration::ZERO,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.abort_remove(op_id);
                }
            }),
        );

        let (candidates, participant) = {
            let state = self.lock_state();
            let participant = state.tables.iter().any(|t| t.id == table);
            (
                state
                    .buckets
                    .k_best_for_table(&table, &key, replication.max(ALPHA as usize)),
                participant,
            )
        };
        let mut local_confirmed = 0;
        if participant {
            if let Some(store) = self.table_store(&table) {
                local_confirmed = store.del(&key, value.as_deref()).unwrap_or(0);
            }
        }

        let op = RemoveOp {
            table,
            key,
            value,
            replication: replication.max(1),
            deadline: Instant::now() + timeout,
            confirmed: local_confirmed,
            sent_to: Vec::new(),
            rpcs: Vec::new(),
            abort_job,
            completion: Some(completion),
            finder: None,
        };
        self.lock_ops().insert(op_id, Op::Remove(op));

        if !participant && table != MASTER_TABLE_ID {
            let finder = self.get_start_inner(
                MASTER_TABLE_ID,
                table,
                ALPHA as usize,
                timeout,
                GetSink::Feed(op_id),
            )?;
            if let Some(Op::Remove(op)) = self.lock_ops().get_mut(&op_id) {
                op.finder = Some(finder);
            }
        }
        for peer in candidates {
            self.fire_remove(op_id, peer);
        }
        Ok(op_id)
    }

    fn fire_remove(self: &Arc<Self>, op_id: u64, peer: PeerId) {
        let (table, key, value, remaining) = {
            let mut ops = self.lock_ops();
            let Some(Op::Remove(op)) = ops.get_mut(&op_id) else {
                return;
            };
            if op.sent_to.contains(&peer) {
                return;
            }
            op.sent_to.push(peer);
            (
                op.table,
                op.key,
                op.value.clone(),
                op.deadline.saturating_duration_since(Instant::now()),
            )
        };
        if remaining.is_zero() {
            return;
        }
        let mut params = RpcParams::new()
            .add("table", table.as_bytes().to_vec())
            .add("key", key.as_bytes().to_vec());
        if let Some(v) = value {
            params = params.add("value", v);
        }
        let weak = Arc::downgrade(self);
        let handle = self.rpc.start(
            &peer,
            "dht_remove",
            params,
            DHT_RPC_IMPORTANCE,
            remaining,
            Box::new(move |status, params| {
                if let Some(engine) = weak.upgrade() {
                    engine.on_remove_reply(op_id, status, &params);
                }
            }),
        );
        if let Ok(h) = handle {
            let mut ops = self.lock_ops();
            match ops.get_mut(&op_id) {
                Some(Op::Remove(op)) => op.rpcs.push(h),
                _ => {
                    drop(ops);
                    self.rpc.stop(h);
                }
            }
        }
    }

    fn on_remove_reply(self: &Arc<Self>, op_id: u64, status: RpcStatus, params: &RpcParams) {
        let done = {
            let mut ops = self.lock_ops();
            let Some(Op::Remove(op)) = ops.get_mut(&op_id) else {
                return;
            };
            if status == RpcStatus::Ok {
                let removed = params
                    .value("removed")
                    .ok()
                    .and_then(|v| v.try_into().ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                op.confirmed += removed as usize;
            }
            op.confirmed >= op.replication
        };
        if done {
            self.advance_op(op_id);
        }
    }

    /// Abort a remove; same contract as [`abort_get`](Self::abort_get).
    pub fn abort_remove(self: &Arc<Self>, op_id: u64) {
        let mut op = {
            let mut ops = self.lock_ops();
            match ops.get(&op_id) {
                Some(Op::Remove(_)) => {}
                _ => return,
            }
            match ops.remove(&op_id) {
                Some(Op::Remove(op)) => op,
                _ => return,
            }
        };
        self.cron.remove(op.abort_job);
        if let Some(finder) = op.finder.take() {
            self.abort_get(finder);
        }
        for h in op.rpcs.drain(..) {
            self.rpc.stop(h);
        }
        if let Some(completion) = op.completion.take() {
            completion(op.confirmed);
        }
    }

    // -- shared -------------------------------------------------------------

    /// A discovered participant for a feed-target operation.
    fn feed_peer(self: &Arc<Self>, op_id: u64, peer: PeerId) {
        self.touch_peer(&peer, &[MASTER_TABLE_ID]);
        let kind = {
            let ops = self.lock_ops();
            match ops.get(&op_id) {
                Some(Op::Get(_)) => 0u8,
                Some(Op::Put(_)) => 1,
                Some(Op::Remove(_)) => 2,
                None => return,
            }
        };
        match kind {
            0 => {
                {
                    let mut ops = self.lock_ops();
                    if let Some(Op::Get(op)) = ops.get_mut(&op_id) {
                        if !op.queried.contains(&peer) && !op.candidates.contains(&peer) {
                            op.candidates.push(peer);
                        }
                    }
                }
                self.fire_get_queries(op_id);
            }
            1 => self.fire_store(op_id, peer),
            _ => self.fire_remove(op_id, peer),
        }
    }

    /// Pull an operation's abort job to now (early completion).
    fn advance_op(&self, op_id: u64) {
        let job = {
            let ops = self.lock_ops();
            match ops.get(&op_id) {
                Some(Op::Get(op)) => Some(op.abort_job),
                Some(Op::Put(op)) => Some(op.abort_job),
                Some(Op::Remove(op)) => Some(op.abort_job),
                None => None,
            }
        };
        if let Some(job) = job {
            let _ = self.cron.advance(job);
        }
    }

    /// Outstanding operation count.
    pub fn outstanding_ops(&self) -> usize {
        self.lock_ops().len()
    }

    // -- maintenance --------------------------------------------------------

    /// The periodic maintenance body:
    ///
    /// 1. advertise every joined table (except the master) in the master
    ///    table with replication ALPHA
    /// 2. refresh neighbors per table with find-node probes toward self
    /// 3. sweep the buckets: evict the long-dead, ping the quiet
    pub fn maintain(self: &Arc<Self>) {
        let self_id = self.cm.self_id();
        let tables = self.joined_tables();

        for table in tables.iter().filter(|t| **t != MASTER_TABLE_ID) {
            let _ = self.put_start(
                MASTER_TABLE_ID,
                *table,
                self_id.0.as_bytes().to_vec(),
                ALPHA as usize,
                self.config.maintain_period,
                Box::new(|_| {}),
            );
        }

        for table in &tables {
            self.refresh_neighbors(table);
        }

        self.sweep_buckets();
    }

    /// Ask our closest known participants of `table` for peers near our
    /// own identity.
    fn refresh_neighbors(self: &Arc<Self>, table: &TableId) {
        let self_key = self.cm.self_id().0;
        let targets = {
            let state = self.lock_state();
            state.buckets.k_best_for_table(table, &self_key, 3)
        };
        for peer in targets {
            let params = RpcParams::new()
                .add("table", table.as_bytes().to_vec())
                .add("key", self_key.as_bytes().to_vec());
            let weak = Arc::downgrade(self);
            let table = *table;
            let _ = self.rpc.start(
                &peer,
                "dht_find_node",
                params,
                DHT_RPC_IMPORTANCE,
                self.config.maintain_period,
                Box::new(move |status, params| {
                    let Some(engine) = weak.upgrade() else {
                        return;
                    };
                    if status == RpcStatus::Ok {
                        for peer_bytes in params.values("peer") {
                            if let Some(found) = peer_from_bytes(peer_bytes) {
                                engine.touch_peer(&found, &[table]);
                            }
                        }
                    }
                }),
            );
        }
    }

    /// Evict peers whose table refresh is ancient; ping the merely quiet.
    fn sweep_buckets(self: &Arc<Self>) {
        let death = self.config.inactivity_death;
        let now = Instant::now();
        let mut evicted = 0;
        let mut to_ping = Vec::new();
        {
            let mut state = self.lock_state();
            state.buckets.for_each_mut(&mut |peer| {
                let silent = now.duration_since(peer.last_table_refresh);
                if silent > death {
                    evicted += 1;
                    return SweepAction::Evict;
                }
                let ping_due = peer
                    .last_ping_sent
                    .map_or(true, |t| now.duration_since(t) > death / 6);
                if silent > death / 2 && ping_due {
                    peer.last_ping_sent = Some(now);
                    to_ping.push(peer.id);
                }
                SweepAction::Keep
            });
        }
        if evicted > 0 {
            self.cm.stats().change(self.sh.peers_evicted, evicted);
        }
        for peer in to_ping {
            let weak = Arc::downgrade(self);
            let _ = self.rpc.start(
                &peer,
                "dht_ping",
                RpcParams::new(),
                DHT_RPC_IMPORTANCE,
                Duration::from_secs(5),
                Box::new(move |status, params| {
                    let Some(engine) = weak.upgrade() else {
                        return;
                    };
                    if status == RpcStatus::Ok {
                        let tables = parse_tables(&params);
                        engine.touch_peer(&peer, &tables);
                    }
                }),
            );
        }
    }

    // -- callee-side procedures ---------------------------------------------

    fn register_procedures(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.rpc.register(
            "dht_ping",
            Arc::new(move |sender, _params| {
                let engine = weak.upgrade().ok_or(RPC_ERROR_MALFORMED_ARGS)?;
                engine.touch_peer(sender, &[MASTER_TABLE_ID]);
                let mut reply = RpcParams::new();
                for table in engine.joined_tables() {
                    reply = reply.add("table", table.as_bytes().to_vec());
                }
                Ok(reply)
            }),
        );

        let weak = Arc::downgrade(self);
        self.rpc.register(
            "dht_find_node",
            Arc::new(move |sender, params| {
                let engine = weak.upgrade().ok_or(RPC_ERROR_MALFORMED_ARGS)?;
                let table = parse_hash(params, "table")?;
                let key = parse_hash(params, "key")?;
                engine.touch_peer(sender, &[MASTER_TABLE_ID]);
                Ok(engine.closer_peers_reply(&table, &key, sender))
            }),
        );

        let weak = Arc::downgrade(self);
        self.rpc.register(
            "dht_find_value",
            Arc::new(move |sender, params| {
                let engine = weak.upgrade().ok_or(RPC_ERROR_MALFORMED_ARGS)?;
                let table = parse_hash(params, "table")?;
                let key = parse_hash(params, "key")?;
                let max = params
                    .value("max")
                    .ok()
                    .and_then(|v| v.try_into().ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(1)
                    .clamp(1, 64) as usize;
                engine.touch_peer(sender, &[MASTER_TABLE_ID]);
                engine.cm.stats().change(engine.sh.find_value_served, 1);

                let mut reply = engine.closer_peers_reply(&table, &key, sender);
                if let Some(store) = engine.table_store(&table) {
                    let mut count = 0;
                    let mut values = Vec::new();
                    let _ = store.get(&key, Some(DHT_VALUE_KIND), &mut |entry| {
                        values.push(entry.payload.clone());
                        count += 1;
                        if count >= max {
                            IterControl::Abort
                        } else {
                            IterControl::Continue
                        }
                    });
                    for v in values {
                        reply = reply.add("value", v);
                    }
                }
                Ok(reply)
            }),
        );

        let weak = Arc::downgrade(self);
        self.rpc.register(
            "dht_store",
            Arc::new(move |sender, params| {
                let engine = weak.upgrade().ok_or(RPC_ERROR_MALFORMED_ARGS)?;
                let table = parse_hash(params, "table")?;
                let key = parse_hash(params, "key")?;
                let value = params.value("value").map_err(|_| RPC_ERROR_MALFORMED_ARGS)?;
                engine.touch_peer(sender, &[MASTER_TABLE_ID]);
                let Some(store) = engine.table_store(&table) else {
                    return Err(RPC_ERROR_TABLE_NOT_FOUND);
                };
                engine.cm.stats().change(engine.sh.store_served, 1);
                match store.put_update(dht_entry(key, value.to_vec())) {
                    Ok(_) => Ok(RpcParams::new()),
                    Err(_) => Err(umbra_rpc::RPC_ERROR_INTERNAL),
                }
            }),
        );

        let weak = Arc::downgrade(self);
        self.rpc.register(
            "dht_remove",
            Arc::new(move |sender, params| {
                let engine = weak.upgrade().ok_or(RPC_ERROR_MALFORMED_ARGS)?;
                let table = parse_hash(params, "table")?;
                let key = parse_hash(params, "key")?;
                let value = params.value("value").ok().map(<[u8]>::to_vec);
                engine.touch_peer(sender, &[MASTER_TABLE_ID]);
                let Some(store) = engine.table_store(&table) else {
                    return Err(RPC_ERROR_TABLE_NOT_FOUND);
                };
                let removed = store.del(&key, value.as_deref()).unwrap_or(0) as u64;
                Ok(RpcParams::new().add("removed", removed.to_be_bytes().to_vec()))
            }),
        );
    }

    /// k-best participating peers for a find reply, including ourselves
    /// when we participate.
    fn closer_peers_reply(&self, table: &TableId, key: &HashCode, exclude: &PeerId) -> RpcParams {
        let state = self.lock_state();
        let mut reply = RpcParams::new();
        let participant = state.tables.iter().any(|t| t.id == *table);
        if participant {
            reply = reply.add(
                "peer",
                state.buckets.self_id().0.as_bytes().to_vec(),
            );
        }
        for peer in state
            .buckets
            .k_best_for_table(table, key, ALPHA as usize)
        {
            if peer != *exclude {
                reply = reply.add("peer", peer.0.as_bytes().to_vec());
            }
        }
        reply
    }

    // -- lock helpers -------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DhtState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_ops(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Op>> {
        match self.ops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Error code: the callee does not participate in the table.
pub const RPC_ERROR_TABLE_NOT_FOUND: u32 = 16;

fn dht_entry(key: HashCode, value: Vec<u8>) -> Entry {
    Entry {
        key,
        kind: DHT_VALUE_KIND,
        priority: 1,
        anonymity: 0,
        expiration: 0,
        payload: value,
    }
}

fn parse_hash(params: &RpcParams, name: &str) -> std::result::Result<HashCode, u32> {
    let bytes = params
        .value_exact(name, HASH_LEN)
        .map_err(|_| RPC_ERROR_MALFORMED_ARGS)?;
    HashCode::from_slice(bytes).map_err(|_| RPC_ERROR_MALFORMED_ARGS)
}

fn parse_tables(params: &RpcParams) -> Vec<TableId> {
    params
        .values("table")
        .into_iter()
        .filter_map(|b| HashCode::from_slice(b).ok())
        .collect()
}

fn peer_from_bytes(bytes: &[u8]) -> Option<PeerId> {
    HashCode::from_slice(bytes).ok().map(PeerId)
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
        dht: Arc<DhtEngine>,
        _cron: Arc<Cron>,
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
        let cron = Arc::new(Cron::start());
        let rpc = RpcEngine::new(Arc::clone(&cm), Arc::clone(&cron));
        let dht = DhtEngine::new(
            Arc::clone(&cm),
            rpc,
            Arc::clone(&cron),
            DhtConfig::default(),
        );
        let flusher = Arc::clone(&cm);
        cron.add(
            Duration::from_millis(20),
            Duration::from_millis(20),
            Box::new(move || flusher.flush_due()),
        );
        TestNode {
            cm,
            dht,
            _cron: cron,
        }
    }

    /// Full-mesh introduction: hellos exchanged and buckets seeded.
    fn mesh(nodes: &[&TestNode]) {
        for a in nodes {
            for b in nodes {
                if a.cm.self_id() != b.cm.self_id() {
                    for hello in b.cm.create_hellos() {
                        a.cm.learn_hello(hello).expect("learn");
                    }
                    a.dht.seed_peer(b.cm.self_id());
                }
            }
        }
    }

    fn table_store() -> Arc<dyn Datastore> {
        Arc::new(MemoryStore::new(1024))
    }

    #[test]
    fn test_join_leave() {
        let hub = MemoryHub::new();
        let n = node(&hub, "jl");
        let t = HashCode::compute(b"table");
        assert_eq!(n.dht.joined_tables().len(), 1, "master joined at start");
        n.dht.join(t, 0, table_store()).expect("join");
        assert_eq!(n.dht.joined_tables().len(), 2);
        n.dht
            .leave(&t, 0, Duration::from_millis(10))
            .expect("leave");
        assert_eq!(n.dht.joined_tables().len(), 1);
        assert!(matches!(
            n.dht.leave(&t, 0, Duration::from_millis(10)),
            Err(DhtError::TableNotFound)
        ));
    }

    #[test]
    fn test_local_get_put() {
        let hub = MemoryHub::new();
        let n = node(&hub, "local");
        let t = HashCode::compute(b"table");
        n.dht.join(t, 0, table_store()).expect("join");

        let key = HashCode::compute(b"key");
        let (tx, rx) = mpsc::channel();
        n.dht
            .put_start(
                t,
                key,
                b"value".to_vec(),
                1,
                Duration::from_millis(300),
                Box::new(move |confirmed| {
                    let _ = tx.send(confirmed.len());
                }),
            )
            .expect("put");
        // No remote peers: completes at the deadline with zero remote
        // replicas but the value is stored locally.
        let confirmed = rx.recv_timeout(Duration::from_secs(3)).expect("completion");
        assert_eq!(confirmed, 0);

        let (tx, rx) = mpsc::channel();
        n.dht
            .get_start(
                t,
                key,
                1,
                Duration::from_secs(2),
                Box::new(move |results| {
                    let _ = tx.send(results);
                }),
            )
            .expect("get");
        let results = rx.recv_timeout(Duration::from_secs(3)).expect("completion");
        assert_eq!(results, vec![b"value".to_vec()]);
    }

    #[test]
    fn test_get_timeout_empty_exactly_once() {
        let hub = MemoryHub::new();
        let n = node(&hub, "timeout");
        let t = HashCode::compute(b"table");
        n.dht.join(t, 0, table_store()).expect("join");

        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        n.dht
            .get_start(
                t,
                HashCode::compute(b"nobody has this"),
                1,
                Duration::from_secs(2),
                Box::new(move |results| {
                    let _ = tx.send((results.len(), Instant::now()));
                }),
            )
            .expect("get");
        let (count, fired_at) = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(count, 0);
        let elapsed = fired_at.duration_since(started);
        assert!(
            elapsed >= Duration::from_millis(1900) && elapsed < Duration::from_secs(4),
            "completion at {elapsed:?}, expected ~2s"
        );
        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "completion must fire exactly once"
        );
        assert_eq!(n.dht.outstanding_ops(), 0);
    }

    #[test]
    fn test_abort_idempotent() {
        let hub = MemoryHub::new();
        let n = node(&hub, "abort");
        let t = HashCode::compute(b"table");
        n.dht.join(t, 0, table_store()).expect("join");

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let op = n
            .dht
            .get_start(
                t,
                HashCode::compute(b"k"),
                1,
                Duration::from_secs(30),
                Box::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("get");
        n.dht.abort_get(op);
        n.dht.abort_get(op);
        n.dht.abort_get(op);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(n.dht.outstanding_ops(), 0);
    }

    #[test]
    fn test_remote_put_get_with_replication() {
        let hub = MemoryHub::new();
        let a = node(&hub, "da");
        let b = node(&hub, "db");
        let c = node(&hub, "dc");
        let d = node(&hub, "dd");
        let members = [&b, &c, &d];
        let all = [&a, &b, &c, &d];
        mesh(&all);

        let t = HashCode::compute(b"shared table");
        for m in members {
            m.dht.join(t, 0, table_store()).expect("join");
        }
        // Members advertise their membership in the master table.
        for m in members {
            m.dht.maintain();
        }
        std::thread::sleep(Duration::from_millis(600));

        // A is not a member; its put must discover members through the
        // master table and reach 3 confirmed replicas.
        let key = HashCode::compute(b"the key");
        let (tx, rx) = mpsc::channel();
        a.dht
            .put_start(
                t,
                key,
                b"replicated value".to_vec(),
                3,
                Duration::from_secs(10),
                Box::new(move |confirmed| {
                    let _ = tx.send(confirmed);
                }),
            )
            .expect("put");
        let confirmed = rx
            .recv_timeout(Duration::from_secs(15))
            .expect("put completion");
        assert_eq!(confirmed.len(), 3, "expected exactly 3 confirming replicas");

        let (tx, rx) = mpsc::channel();
        a.dht
            .get_start(
                t,
                key,
                1,
                Duration::from_secs(10),
                Box::new(move |results| {
                    let _ = tx.send(results);
                }),
            )
            .expect("get");
        let results = rx
            .recv_timeout(Duration::from_secs(15))
            .expect("get completion");
        assert!(
            results.contains(&b"replicated value".to_vec()),
            "get must return the stored value at least once"
        );
    }

    #[test]
    fn test_migration_on_leave() {
        let hub = MemoryHub::new();
        let a = node(&hub, "ma");
        let b = node(&hub, "mb");
        mesh(&[&a, &b]);

        let t = HashCode::compute(b"migrating table");
        a.dht.join(t, FLAG_MIGRATE, table_store()).expect("join a");
        b.dht.join(t, 0, table_store()).expect("join b");
        for n in [&a, &b] {
            n.dht.maintain();
        }
        std::thread::sleep(Duration::from_millis(400));

        // Store locally on A, then leave with migration.
        let key = HashCode::compute(b"entry");
        let (tx, rx) = mpsc::channel();
        a.dht
            .put_start(
                t,
                key,
                b"survives".to_vec(),
                1,
                Duration::from_secs(5),
                Box::new(move |c| {
                    let _ = tx.send(c);
                }),
            )
            .expect("put");
        let _ = rx.recv_timeout(Duration::from_secs(10));

        a.dht
            .leave(&t, 0, Duration::from_secs(5))
            .expect("leave");
        std::thread::sleep(Duration::from_millis(800));

        // B should now hold the entry.
        let (tx, rx) = mpsc::channel();
        b.dht
            .get_start(
                t,
                key,
                1,
                Duration::from_secs(2),
                Box::new(move |results| {
                    let _ = tx.send(results);
                }),
            )
            .expect("get");
        let results = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert!(results.contains(&b"survives".to_vec()));
    }
}
