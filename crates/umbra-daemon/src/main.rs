//! umbrad: the Umbra overlay node daemon.
//!
//! One OS process: a tokio runtime carries the QUIC transport, a dedicated
//! thread runs the cooperative cron queue, one thread dispatches inbound
//! frames, and the control protocol serves local clients over loopback TCP.

use tracing::info;

use umbra_crypto::identity::KeyPair;
use umbra_daemon::config::NodeConfig;
use umbra_daemon::control;
use umbra_daemon::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("umbra={}", config.log.level).into()),
        )
        .init();

    info!("umbra daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let keys = load_or_create_keys(&data_dir)?;

    let control_port = config.network.control_port;
    // Node startup performs blocking transport connects; keep it off the
    // async workers.
    let runtime = tokio::runtime::Handle::current();
    let node = tokio::task::spawn_blocking(move || Node::start(config, keys, runtime)).await??;
    control::serve(std::sync::Arc::clone(&node), control_port)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop();
    info!("umbra daemon stopped");
    Ok(())
}

/// Load the node key from disk or create and persist a fresh one.
fn load_or_create_keys(data_dir: &std::path::Path) -> anyhow::Result<KeyPair> {
    let path = data_dir.join("identity.key");
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("corrupt identity key file"))?;
        return Ok(KeyPair::from_bytes(&seed));
    }
    let keys = KeyPair::generate();
    std::fs::write(&path, keys.signing_key.to_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(keys)
}
