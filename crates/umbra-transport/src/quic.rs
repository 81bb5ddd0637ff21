//! QUIC/TLS 1.3 transport via `quinn`.
//!
//! Nodes use self-signed TLS certificates; authentication is not a TLS
//! concern here: peers prove their identity with signed hello records and
//! session-key agreement above the transport. TLS provides transport
//! encryption only.
//!
//! ## Framing
//!
//! Every overlay frame travels on its own unidirectional QUIC stream,
//! length-prefixed `[length:4 LE][data:length]`. QUIC streams are reliable
//! and unbounded, so this transport advertises MTU 0 and `send_reliable`
//! equals `send`.
//!
//! ## Threading
//!
//! The connection manager drives transports from plain threads; all
//! blocking entry points (`connect`, `send`) hop onto the owning tokio
//! runtime with `block_on` and must not be called from inside that runtime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use umbra_crypto::identity::KeyPair;
use umbra_proto::hello::Hello;
use umbra_proto::MAX_MESSAGE_SIZE;

use crate::{
    Inbound, InboundSink, Result, Transport, TransportError, TransportLink, PROTO_QUIC,
};

/// ALPN protocol identifier for Umbra protocol version 1.
pub const ALPN_UMBRA_V1: &[u8] = b"umbra/1";

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Relative cost of the QUIC transport.
pub const QUIC_COST: u32 = 10;

static LINK_IDS: AtomicU64 = AtomicU64::new(1);

/// Configuration for the QUIC transport.
#[derive(Clone)]
pub struct QuicConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

struct ServerState {
    sink: Option<InboundSink>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

/// The QUIC transport plugin.
///
/// One Quinn endpoint serves both roles: it accepts inbound connections and
/// initiates outbound ones.
pub struct QuicTransport {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    runtime: tokio::runtime::Handle,
    server: Arc<Mutex<ServerState>>,
}

impl QuicTransport {
    /// Bind the endpoint on the configured address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails and
    /// [`TransportError::Io`] if the socket cannot be bound.
    pub fn new(config: QuicConfig, runtime: tokio::runtime::Handle) -> Result<Self> {
        let server_config = build_server_config(config.idle_timeout_ms)?;
        let client_config = build_client_config()?;

        let _guard = runtime.enter();
        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::info!(%local_addr, "QUIC transport bound");

        Ok(Self {
            endpoint,
            local_addr,
            runtime,
            server: Arc::new(Mutex::new(ServerState {
                sink: None,
                accept_task: None,
            })),
        })
    }

    /// The local socket address this transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn lock_server(&self) -> std::sync::MutexGuard<'_, ServerState> {
        match self.server.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Transport for QuicTransport {
    fn protocol(&self) -> u16 {
        PROTO_QUIC
    }

    fn mtu(&self) -> u32 {
        0 // streams are unbounded; no transport-level fragmentation needed
    }

    fn cost(&self) -> u32 {
        QUIC_COST
    }

    fn create_hello(&self, keys: &KeyPair, expiration: u64) -> Result<Hello> {
        Hello::create(
            keys,
            PROTO_QUIC,
            0,
            expiration,
            self.local_addr.to_string().into_bytes(),
        )
        .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }

    fn verify_hello(&self, hello: &Hello) -> Result<()> {
        if hello.protocol != PROTO_QUIC {
            return Err(TransportError::InvalidAddress(format!(
                "protocol {} is not QUIC",
                hello.protocol
            )));
        }
        parse_addr(&hello.address)?;
        Ok(())
    }

    fn connect(&self, hello: &Hello) -> Result<Arc<dyn TransportLink>> {
        let addr = parse_addr(&hello.address)?;
        let sink = self
            .lock_server()
            .sink
            .clone()
            .ok_or(TransportError::ServerNotStarted)?;

        let endpoint = self.endpoint.clone();
        let connection = self.runtime.block_on(async move {
            let connecting = endpoint
                .connect(addr, "umbra-node")
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            connecting
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))
        })?;

        tracing::debug!(remote = %connection.remote_address(), "QUIC connection established");
        let link = spawn_link(&self.runtime, connection, sink);
        Ok(link)
    }

    fn start_server(&self, sink: InboundSink) -> Result<()> {
        let mut server = self.lock_server();
        server.sink = Some(sink.clone());

        let endpoint = self.endpoint.clone();
        let runtime = self.runtime.clone();
        let task_runtime = runtime.clone();
        let task = runtime.spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let sink = sink.clone();
                let runtime = task_runtime.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            tracing::debug!(
                                remote = %connection.remote_address(),
                                "inbound QUIC connection"
                            );
                            spawn_link(&runtime, connection, sink);
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "inbound QUIC handshake failed");
                        }
                    }
                });
            }
        });
        server.accept_task = Some(task);
        Ok(())
    }

    fn stop_server(&self) {
        let mut server = self.lock_server();
        server.sink = None;
        if let Some(task) = server.accept_task.take() {
            task.abort();
        }
    }

    fn address_to_string(&self, hello: &Hello) -> String {
        String::from_utf8_lossy(&hello.address).into_owned()
    }
}

/// Wrap a live connection in a link and start its stream-reader task.
fn spawn_link(
    runtime: &tokio::runtime::Handle,
    connection: Connection,
    sink: InboundSink,
) -> Arc<dyn TransportLink> {
    let link = Arc::new(QuicLink {
        id: LINK_IDS.fetch_add(1, Ordering::Relaxed),
        connection: connection.clone(),
        runtime: runtime.clone(),
    });
    let reader_link: Arc<dyn TransportLink> = Arc::clone(&link) as Arc<dyn TransportLink>;
    runtime.spawn(async move {
        loop {
            let mut stream = match connection.accept_uni().await {
                Ok(s) => s,
                Err(_) => break, // connection closed
            };
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                continue;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_SIZE {
                tracing::debug!(len, "oversize QUIC frame dropped");
                continue;
            }
            let mut frame = vec![0u8; len];
            if stream.read_exact(&mut frame).await.is_err() {
                continue;
            }
            if sink
                .send(Inbound {
                    link: Arc::clone(&reader_link),
                    frame,
                })
                .is_err()
            {
                break; // receiver gone, stop reading
            }
        }
    });
    link
}

struct QuicLink {
    id: u64,
    connection: Connection,
    runtime: tokio::runtime::Handle,
}

impl TransportLink for QuicLink {
    fn link_id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> u16 {
        PROTO_QUIC
    }

    fn send(&self, frame: &[u8], _reliable: bool) -> Result<()> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::FrameTooLarge { size: frame.len() });
        }
        let connection = self.connection.clone();
        let frame = frame.to_vec();
        self.runtime.block_on(async move {
            let mut stream = connection
                .open_uni()
                .await
                .map_err(|_| TransportError::LinkClosed)?;
            let len = frame.len() as u32;
            stream
                .write_all(&len.to_le_bytes())
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            stream
                .write_all(&frame)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            stream
                .finish()
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(())
        })
    }

    fn disconnect(&self) {
        self.connection.close(quinn::VarInt::from_u32(0), b"bye");
    }

    fn describe(&self) -> String {
        format!("quic:{}", self.connection.remote_address())
    }
}

fn parse_addr(address: &[u8]) -> Result<SocketAddr> {
    let s = std::str::from_utf8(address)
        .map_err(|_| TransportError::InvalidAddress("address not UTF-8".to_string()))?;
    s.parse()
        .map_err(|_| TransportError::InvalidAddress(format!("bad socket address {s}")))
}

// ---------------------------------------------------------------------------
// TLS / certificate helpers
// ---------------------------------------------------------------------------

/// Generate a self-signed TLS certificate and private key.
fn generate_self_signed_cert(
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;

    let params = rcgen::CertificateParams::new(vec!["umbra-node".to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signed cert generation failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

fn build_server_config(idle_timeout_ms: u32) -> Result<ServerConfig> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS version config failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_UMBRA_V1.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_millis(u64::from(
            idle_timeout_ms,
        )))
        .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

fn build_client_config() -> Result<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS version config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN_UMBRA_V1.to_vec()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto config failed: {e}")))?,
    ));
    Ok(client_config)
}

/// TLS certificate verifier that accepts any server certificate.
///
/// Intentionally insecure at the TLS level: node authentication happens via
/// signed hellos and session-key agreement above the transport. TLS is used
/// solely for transport encryption.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
