//! The local control protocol.
//!
//! Clients (the `umbractl` tool, applications) talk to a running node over
//! a loopback TCP connection. Each message is a CBOR document behind a
//! 4-byte big-endian length prefix. Requests map onto the DHT client
//! operations (join, leave, put, get, remove, iterate), the file-sharing
//! client operations (insert, query) and the statistics dump.
//!
//! A frame that does not decode is a protocol violation: the connection is
//! terminated without a reply.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use umbra_crypto::HashCode;
use umbra_dht::{replication_from_flags, MASTER_TABLE_ID};
use umbra_fs::blocks::KIND_DATA;
use umbra_store::memory::MemoryStore;

use crate::node::Node;

/// Ceiling on one control frame.
const MAX_CONTROL_FRAME: usize = 1 << 20;

/// Status code for a successful operation.
pub const STATUS_OK: i32 = 0;
/// Status code for a failed operation.
pub const STATUS_ERROR: i32 = 1;
/// Status code for an operation that timed out.
pub const STATUS_TIMEOUT: i32 = 2;

/// A control request.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    /// Join a DHT table.
    Join { table: HashCode, flags: u32 },
    /// Leave a DHT table; migration honors `timeout_ms`.
    Leave {
        table: HashCode,
        flags: u32,
        timeout_ms: u64,
    },
    /// Store a value in a table.
    Put {
        table: HashCode,
        key: HashCode,
        value: Vec<u8>,
        flags: u32,
        timeout_ms: u64,
    },
    /// Look a key up in a table.
    Get {
        table: HashCode,
        key: HashCode,
        flags: u32,
        timeout_ms: u64,
        max_results: u32,
        max_result_size: u32,
    },
    /// Remove a value (or all values) under a key.
    Remove {
        table: HashCode,
        key: HashCode,
        value: Option<Vec<u8>>,
        flags: u32,
        timeout_ms: u64,
    },
    /// List joined tables.
    Iterate,
    /// Insert an encrypted data block into the content store.
    InsertData { data: Vec<u8>, priority: u32 },
    /// Advertise a payload under a keyword.
    InsertKeyword {
        keyword: String,
        data: Vec<u8>,
        priority: u32,
    },
    /// Mark or withdraw a super-query digest.
    IndexSuper { query: HashCode, add: bool },
    /// Issue an anonymous content query and collect replies.
    QueryFs {
        query: HashCode,
        priority: u32,
        ttl: i32,
        timeout_ms: u64,
    },
    /// Dump the statistics counters.
    Stats,
}

/// A control reply.
#[derive(Debug, Serialize, Deserialize)]
pub enum Reply {
    /// Plain acknowledgement: 0 = success.
    Ack { status: i32 },
    /// Result values for a get/query/iterate.
    Results { total: u32, values: Vec<Vec<u8>> },
    /// The content key of inserted content.
    Inserted { key: HashCode, query: HashCode },
    /// Statistics counters.
    StatsDump { counters: Vec<(String, i64)> },
}

/// Serve the control protocol on the configured loopback port. Runs until
/// the process exits; one thread per client connection.
pub fn serve(node: Arc<Node>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    tracing::info!(port, "control protocol listening");
    std::thread::Builder::new()
        .name("umbra-control".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let node = Arc::clone(&node);
                        let _ = std::thread::Builder::new()
                            .name("umbra-control-conn".to_string())
                            .spawn(move || serve_connection(node, stream));
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "control accept failed");
                    }
                }
            }
        })?;
    Ok(())
}

fn serve_connection(node: Arc<Node>, mut stream: TcpStream) {
    loop {
        let request: Request = match read_frame(&mut stream) {
            Ok(Some(r)) => r,
            Ok(None) => return, // clean close
            Err(e) => {
                // Protocol violation: terminate without a reply.
                tracing::debug!(error = %e, "control connection violated protocol");
                return;
            }
        };
        let reply = handle(&node, request);
        if write_frame(&mut stream, &reply).is_err() {
            return;
        }
    }
}

fn handle(node: &Arc<Node>, request: Request) -> Reply {
    match request {
        Request::Join { table, flags } => {
            let store = Arc::new(MemoryStore::new(node.config.dht.table_store_entries));
            match node.dht.join(table, flags, store) {
                Ok(()) => Reply::Ack { status: STATUS_OK },
                Err(_) => Reply::Ack {
                    status: STATUS_ERROR,
                },
            }
        }
        Request::Leave {
            table,
            flags,
            timeout_ms,
        } => match node
            .dht
            .leave(&table, flags, Duration::from_millis(timeout_ms))
        {
            Ok(()) => Reply::Ack { status: STATUS_OK },
            Err(_) => Reply::Ack {
                status: STATUS_ERROR,
            },
        },
        Request::Put {
            table,
            key,
            value,
            flags,
            timeout_ms,
        } => {
            let replication = replication_from_flags(flags) as usize;
            let (tx, rx) = mpsc::channel();
            let started = node.dht.put_start(
                table,
                key,
                value,
                replication,
                Duration::from_millis(timeout_ms),
                Box::new(move |confirmed| {
                    let _ = tx.send(confirmed.len());
                }),
            );
            if started.is_err() {
                return Reply::Ack {
                    status: STATUS_ERROR,
                };
            }
            match rx.recv_timeout(Duration::from_millis(timeout_ms) + Duration::from_secs(5)) {
                Ok(confirmed) if confirmed >= replication => Reply::Ack { status: STATUS_OK },
                Ok(_) => Reply::Ack {
                    status: STATUS_TIMEOUT,
                },
                Err(_) => Reply::Ack {
                    status: STATUS_TIMEOUT,
                },
            }
        }
        Request::Get {
            table,
            key,
            flags,
            timeout_ms,
            max_results,
            max_result_size,
        } => {
            let max = replication_from_flags(flags).max(max_results).max(1) as usize;
            let (tx, rx) = mpsc::channel();
            let started = node.dht.get_start(
                table,
                key,
                max,
                Duration::from_millis(timeout_ms),
                Box::new(move |results| {
                    let _ = tx.send(results);
                }),
            );
            if started.is_err() {
                return Reply::Ack {
                    status: STATUS_ERROR,
                };
            }
            match rx.recv_timeout(Duration::from_millis(timeout_ms) + Duration::from_secs(5)) {
                Ok(mut values) => {
                    if max_result_size > 0 {
                        values.retain(|v| v.len() <= max_result_size as usize);
                    }
                    Reply::Results {
                        total: values.len() as u32,
                        values,
                    }
                }
                Err(_) => Reply::Results {
                    total: 0,
                    values: Vec::new(),
                },
            }
        }
        Request::Remove {
            table,
            key,
            value,
            flags,
            timeout_ms,
        } => {
            let replication = replication_from_flags(flags) as usize;
            let (tx, rx) = mpsc::channel();
            let started = node.dht.remove_start(
                table,
                key,
                value,
                replication,
                Duration::from_millis(timeout_ms),
                Box::new(move |confirmed| {
                    let _ = tx.send(confirmed);
                }),
            );
            if started.is_err() {
                return Reply::Ack {
                    status: STATUS_ERROR,
                };
            }
            match rx.recv_timeout(Duration::from_millis(timeout_ms) + Duration::from_secs(5)) {
                Ok(confirmed) if confirmed > 0 => Reply::Ack { status: STATUS_OK },
                _ => Reply::Ack {
                    status: STATUS_TIMEOUT,
                },
            }
        }
        Request::Iterate => {
            let tables: Vec<Vec<u8>> = node
                .dht
                .joined_tables()
                .into_iter()
                .filter(|t| *t != MASTER_TABLE_ID)
                .map(|t| t.as_bytes().to_vec())
                .collect();
            Reply::Results {
                total: tables.len() as u32,
                values: tables,
            }
        }
        Request::InsertData { data, priority } => {
            match umbra_fs::blocks::encode_data_block(&data) {
                Ok((ck, ciphertext)) => {
                    match node.fs.insert_chk(KIND_DATA, ciphertext, priority) {
                        Ok(query) => Reply::Inserted {
                            key: ck.key,
                            query,
                        },
                        Err(_) => Reply::Ack {
                            status: STATUS_ERROR,
                        },
                    }
                }
                Err(_) => Reply::Ack {
                    status: STATUS_ERROR,
                },
            }
        }
        Request::InsertKeyword {
            keyword,
            data,
            priority,
        } => match node.fs.insert_keyword(&keyword, &data, priority) {
            Ok(query) => Reply::Inserted {
                key: umbra_fs::blocks::keyword_hash(&keyword),
                query,
            },
            Err(_) => Reply::Ack {
                status: STATUS_ERROR,
            },
        },
        Request::IndexSuper { query, add } => {
            if add {
                node.fs.index_super(&query);
            } else {
                node.fs.unindex_super(&query);
            }
            Reply::Ack { status: STATUS_OK }
        }
        Request::QueryFs {
            query,
            priority,
            ttl,
            timeout_ms,
        } => {
            let (tx, rx) = mpsc::channel();
            let tx = std::sync::Mutex::new(tx);
            let sink: umbra_fs::LocalSink = Arc::new(move |event: umbra_fs::ReplyEvent| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(event.payload);
                }
            });
            node.fs.start_query(vec![query], priority, ttl, sink);
            let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
            let mut values = Vec::new();
            while let Some(remaining) =
                deadline.checked_duration_since(std::time::Instant::now())
            {
                match rx.recv_timeout(remaining) {
                    Ok(payload) => values.push(payload),
                    Err(_) => break,
                }
            }
            Reply::Results {
                total: values.len() as u32,
                values,
            }
        }
        Request::Stats => Reply::StatsDump {
            counters: node.cm.stats().snapshot(),
        },
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Read one length-prefixed CBOR document. `Ok(None)` on clean EOF.
pub fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut TcpStream,
) -> anyhow::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_CONTROL_FRAME {
        anyhow::bail!("control frame of {len} bytes exceeds limit");
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(ciborium::from_reader(buf.as_slice())?))
}

/// Write one length-prefixed CBOR document.
pub fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    stream.write_all(&(buf.len() as u32).to_be_bytes())?;
    stream.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_cbor_roundtrip() {
        let request = Request::Put {
            table: HashCode::compute(b"t"),
            key: HashCode::compute(b"k"),
            value: b"v".to_vec(),
            flags: 3,
            timeout_ms: 5000,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&request, &mut buf).expect("encode");
        let back: Request = ciborium::from_reader(buf.as_slice()).expect("decode");
        match back {
            Request::Put { value, flags, .. } => {
                assert_eq!(value, b"v");
                assert_eq!(flags, 3);
            }
            other => unreachable!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn test_reply_cbor_roundtrip() {
        let reply = Reply::Results {
            total: 2,
            values: vec![b"a".to_vec(), b"b".to_vec()],
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&reply, &mut buf).expect("encode");
        let back: Reply = ciborium::from_reader(buf.as_slice()).expect("decode");
        match back {
            Reply::Results { total, values } => {
                assert_eq!(total, 2);
                assert_eq!(values.len(), 2);
            }
            other => unreachable!("wrong variant {other:?}"),
        }
    }
}
