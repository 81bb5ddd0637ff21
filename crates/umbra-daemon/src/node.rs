//! The node composition root.
//!
//! Every subsystem is a value owned by [`Node`]; nothing is process-global.
//! The node wires the cron substrate to the periodic work each subsystem
//! needs: queue flushes, idle-session eviction, reassembly garbage
//! collection, hello purges, DHT maintenance and content migration.

use std::sync::Arc;
use std::time::Duration;

use umbra_core::{ConnectionManager, CoreConfig, Stats};
use umbra_cron::Cron;
use umbra_crypto::identity::KeyPair;
use umbra_dht::{DhtConfig, DhtEngine};
use umbra_fs::FsRouter;
use umbra_rpc::RpcEngine;
use umbra_store::memory::MemoryStore;
use umbra_store::sqlite::SqliteStore;
use umbra_store::{ContentStore, Datastore};
use umbra_transport::quic::{QuicConfig, QuicTransport};

use crate::config::NodeConfig;

/// How often send queues are flushed for due messages.
const FLUSH_PERIOD: Duration = Duration::from_millis(50);

/// How often idle sessions are collected.
const SESSION_MAINTAIN_PERIOD: Duration = Duration::from_secs(5);

/// How often expired hellos are purged.
const HELLO_PURGE_PERIOD: Duration = Duration::from_secs(3600);

/// How often one content entry is offered to a random peer.
const MIGRATE_PERIOD: Duration = Duration::from_secs(300);

/// How often our own hellos are re-advertised to connected peers.
const HELLO_REFRESH_PERIOD: Duration = Duration::from_secs(1800);

/// A running Umbra node.
pub struct Node {
    pub keys: Arc<KeyPair>,
    pub cron: Arc<Cron>,
    pub cm: Arc<ConnectionManager>,
    pub rpc: Arc<RpcEngine>,
    pub dht: Arc<DhtEngine>,
    pub fs: Arc<FsRouter>,
    pub config: NodeConfig,
}

impl Node {
    /// Build and start a node: transports bound, servers listening, cron
    /// jobs scheduled, bootstrap hellos learned.
    pub fn start(
        config: NodeConfig,
        keys: KeyPair,
        runtime: tokio::runtime::Handle,
    ) -> anyhow::Result<Arc<Self>> {
        let keys = Arc::new(keys);
        let stats = Arc::new(Stats::new());
        let cron = Arc::new(Cron::start());

        let core_config = CoreConfig {
            max_sessions: config.network.max_sessions,
            idle_timeout: Duration::from_secs(config.network.session_idle_timeout_secs),
            bandwidth_bytes_per_sec: config.network.bandwidth_bytes_per_sec,
            ..CoreConfig::default()
        };
        let cm = Arc::new(ConnectionManager::new(
            Arc::clone(&keys),
            core_config,
            stats,
        ));

        let quic = QuicTransport::new(
            QuicConfig {
                bind_addr: ([0, 0, 0, 0], config.network.listen_port).into(),
                ..QuicConfig::default()
            },
            runtime,
        )?;
        tracing::info!(addr = %quic.local_addr(), "transport bound");
        cm.add_transport(Arc::new(quic));
        cm.start()?;

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let backend: Arc<dyn Datastore> = if config.store.in_memory {
            Arc::new(MemoryStore::new(config.store.max_entries))
        } else {
            Arc::new(SqliteStore::open(
                &data_dir.join("content.db"),
                config.store.max_entries,
            )?)
        };
        let store = Arc::new(ContentStore::new(backend));

        let rpc = RpcEngine::new(Arc::clone(&cm), Arc::clone(&cron));
        let fs = FsRouter::new(Arc::clone(&cm), Arc::clone(&store));
        let dht_config = DhtConfig {
            bucket_count: config.dht.bucket_count,
            bucket_size: config.dht.bucket_size,
            maintain_period: Duration::from_secs(config.dht.maintain_secs),
            inactivity_death: Duration::from_secs(config.dht.maintain_secs * 56),
            table_store_entries: config.dht.table_store_entries,
        };
        let dht = DhtEngine::new(
            Arc::clone(&cm),
            Arc::clone(&rpc),
            Arc::clone(&cron),
            dht_config,
        );

        let node = Arc::new(Self {
            keys,
            cron,
            cm,
            rpc,
            dht,
            fs,
            config,
        });
        node.schedule_jobs();
        node.write_own_hello(&data_dir);
        node.bootstrap();
        tracing::info!(id = %node.cm.self_id(), "node up");
        Ok(node)
    }

    fn schedule_jobs(self: &Arc<Self>) {
        let cm = Arc::clone(&self.cm);
        self.cron.add(
            FLUSH_PERIOD,
            FLUSH_PERIOD,
            Box::new(move || cm.flush_due()),
        );

        let cm = Arc::clone(&self.cm);
        self.cron.add(
            SESSION_MAINTAIN_PERIOD,
            SESSION_MAINTAIN_PERIOD,
            Box::new(move || cm.maintain()),
        );

        let cm = Arc::clone(&self.cm);
        self.cron.add(
            umbra_core::fragment::DEFRAG_PURGE_PERIOD,
            umbra_core::fragment::DEFRAG_PURGE_PERIOD,
            Box::new(move || {
                let purged = cm.fragmentation().purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "reassembly slots purged");
                }
            }),
        );

        let cm = Arc::clone(&self.cm);
        self.cron.add(
            HELLO_PURGE_PERIOD,
            HELLO_PURGE_PERIOD,
            Box::new(move || {
                cm.hello_cache().purge_expired(now_secs());
            }),
        );

        let fs = Arc::clone(&self.fs);
        self.cron.add(
            MIGRATE_PERIOD,
            MIGRATE_PERIOD,
            Box::new(move || fs.migrate_once()),
        );

        // Hello refresh: re-advertise our addresses to the connected set.
        let cm = Arc::clone(&self.cm);
        self.cron.add(
            HELLO_REFRESH_PERIOD,
            HELLO_REFRESH_PERIOD,
            Box::new(move || {
                for hello in cm.create_hellos() {
                    let msg = umbra_proto::framing::SubMessage::new(
                        umbra_proto::messages::MSG_HELLO,
                        hello.to_bytes(),
                    );
                    cm.broadcast_to_connected(&msg, 0, Duration::from_secs(30));
                }
            }),
        );

        self.dht.start_maintenance();
    }

    /// Write our own hello and a node-info summary where an operator can
    /// copy them from.
    fn write_own_hello(&self, data_dir: &std::path::Path) {
        let hellos = self.cm.create_hellos();
        for hello in &hellos {
            let encoded = hex::encode(hello.to_bytes());
            let path = data_dir.join("hello.hex");
            if let Err(e) = std::fs::write(&path, &encoded) {
                tracing::warn!(error = %e, "could not write hello file");
            } else {
                tracing::info!(path = %path.display(), "own hello written");
            }
        }
        let info = serde_json::json!({
            "id": self.cm.self_id().to_string(),
            "control_port": self.config.network.control_port,
            "transports": hellos
                .iter()
                .map(|h| serde_json::json!({
                    "protocol": h.protocol,
                    "address": String::from_utf8_lossy(&h.address),
                    "expires": h.expiration,
                }))
                .collect::<Vec<_>>(),
        });
        let path = data_dir.join("node.json");
        if let Err(e) = std::fs::write(&path, info.to_string()) {
            tracing::warn!(error = %e, "could not write node info");
        }
    }

    /// Learn configured bootstrap hellos and seed the DHT with them.
    fn bootstrap(self: &Arc<Self>) {
        for encoded in &self.config.network.bootstrap {
            let bytes = match hex::decode(encoded.trim()) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "bootstrap entry is not hex");
                    continue;
                }
            };
            let hello = match umbra_proto::hello::Hello::from_bytes(&bytes) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "bootstrap hello malformed");
                    continue;
                }
            };
            let subject = hello.subject;
            match self.cm.learn_hello(hello) {
                Ok(()) => {
                    self.dht.seed_peer(subject);
                    if let Err(e) = self.cm.connect_peer(&subject) {
                        tracing::debug!(peer = %subject, error = %e, "bootstrap connect failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "bootstrap hello rejected"),
            }
        }
    }

    /// Stop the node: servers down, sessions closed.
    pub fn stop(&self) {
        self.cm.stop();
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
