//! umbractl: command-line client for a running Umbra node.
//!
//! Table and key names given on the command line are hashed into digests,
//! so `umbractl put demo greeting "hello"` and
//! `umbractl get demo greeting` agree on the same key from any machine.
//!
//! Exit code 0 on success, non-zero on any client-reported failure.
//!
//! ```text
//! umbractl [-p PORT] join  TABLE [FLAGS]
//! umbractl [-p PORT] leave TABLE [FLAGS]
//! umbractl [-p PORT] put   TABLE KEY VALUE [REPLICATION]
//! umbractl [-p PORT] get   TABLE KEY [MAX]
//! umbractl [-p PORT] remove TABLE KEY [VALUE]
//! umbractl [-p PORT] tables
//! umbractl [-p PORT] insert DATA
//! umbractl [-p PORT] search QUERY-HEX
//! umbractl [-p PORT] stats
//! ```

use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

use umbra_crypto::HashCode;
use umbra_daemon::control::{read_frame, write_frame, Reply, Request, STATUS_OK};

const DEFAULT_PORT: u16 = 2087;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut port = DEFAULT_PORT;
    if args.first().map(String::as_str) == Some("-p") {
        args.remove(0);
        if args.is_empty() {
            return usage();
        }
        match args.remove(0).parse() {
            Ok(p) => port = p,
            Err(_) => return usage(),
        }
    }
    if args.is_empty() {
        return usage();
    }

    let command = args.remove(0);
    let request = match build_request(&command, &args) {
        Some(r) => r,
        None => return usage(),
    };

    let mut stream = match TcpStream::connect(("127.0.0.1", port)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("umbractl: cannot reach node on port {port}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _ = stream.set_read_timeout(Some(Duration::from_millis(DEFAULT_TIMEOUT_MS + 10_000)));

    if let Err(e) = write_frame(&mut stream, &request) {
        eprintln!("umbractl: send failed: {e}");
        return ExitCode::FAILURE;
    }
    let reply: Reply = match read_frame(&mut stream) {
        Ok(Some(r)) => r,
        Ok(None) => {
            eprintln!("umbractl: node closed the connection");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("umbractl: receive failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    render(reply)
}

fn build_request(command: &str, args: &[String]) -> Option<Request> {
    match (command, args) {
        ("join", [table, rest @ ..]) => Some(Request::Join {
            table: name_hash(table),
            flags: rest.first().and_then(|f| f.parse().ok()).unwrap_or(3),
        }),
        ("leave", [table, rest @ ..]) => Some(Request::Leave {
            table: name_hash(table),
            flags: rest.first().and_then(|f| f.parse().ok()).unwrap_or(0),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }),
        ("put", [table, key, value, rest @ ..]) => Some(Request::Put {
            table: name_hash(table),
            key: name_hash(key),
            value: value.clone().into_bytes(),
            flags: rest.first().and_then(|f| f.parse().ok()).unwrap_or(3),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }),
        ("get", [table, key, rest @ ..]) => Some(Request::Get {
            table: name_hash(table),
            key: name_hash(key),
            flags: 3,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_results: rest.first().and_then(|f| f.parse().ok()).unwrap_or(1),
            max_result_size: 0,
        }),
        ("remove", [table, key, rest @ ..]) => Some(Request::Remove {
            table: name_hash(table),
            key: name_hash(key),
            value: rest.first().map(|v| v.clone().into_bytes()),
            flags: 1,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }),
        ("tables", []) => Some(Request::Iterate),
        ("insert", [data]) => Some(Request::InsertData {
            data: data.clone().into_bytes(),
            priority: 5,
        }),
        ("search", [query_hex]) => {
            let bytes = hex::decode(query_hex).ok()?;
            Some(Request::QueryFs {
                query: HashCode::from_slice(&bytes).ok()?,
                priority: 5,
                ttl: 50,
                timeout_ms: DEFAULT_TIMEOUT_MS,
            })
        }
        ("stats", []) => Some(Request::Stats),
        _ => None,
    }
}

fn render(reply: Reply) -> ExitCode {
    match reply {
        Reply::Ack { status } if status == STATUS_OK => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Reply::Ack { status } => {
            eprintln!("failed: status {status}");
            ExitCode::FAILURE
        }
        Reply::Results { total, values } => {
            println!("{total} result(s)");
            for v in values {
                match std::str::from_utf8(&v) {
                    Ok(s) if s.chars().all(|c| !c.is_control()) => println!("{s}"),
                    _ => println!("{}", hex::encode(v)),
                }
            }
            if total > 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Reply::Inserted { key, query } => {
            println!("key:   {key}");
            println!("query: {query}");
            ExitCode::SUCCESS
        }
        Reply::StatsDump { counters } => {
            for (name, value) in counters {
                println!("{value:>12}  {name}");
            }
            ExitCode::SUCCESS
        }
    }
}

/// Hash a human-readable name into a digest.
fn name_hash(name: &str) -> HashCode {
    HashCode::compute(name.as_bytes())
}

fn usage() -> ExitCode {
    eprintln!(
        "usage: umbractl [-p PORT] COMMAND\n\
         commands:\n\
         \u{20}  join TABLE [FLAGS]        join a DHT table\n\
         \u{20}  leave TABLE [FLAGS]       leave a DHT table\n\
         \u{20}  put TABLE KEY VALUE [R]   store a value\n\
         \u{20}  get TABLE KEY [MAX]       look a key up\n\
         \u{20}  remove TABLE KEY [VALUE]  remove value(s)\n\
         \u{20}  tables                    list joined tables\n\
         \u{20}  insert DATA               insert content, print its key\n\
         \u{20}  search QUERY-HEX          anonymous content query\n\
         \u{20}  stats                     dump statistics counters"
    );
    ExitCode::FAILURE
}
