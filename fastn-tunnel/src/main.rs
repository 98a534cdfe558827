//! fastn-tunnel: expose a local TCP/UDP service to a remote peer
//!
//! Without `--token` the process is a host and prints a TOKEN event on
//! stdout. Started with that token, it is a client offering the host's
//! service on a local port. Logs go to stderr.

use clap::Parser;

fn main() -> eyre::Result<()> {
    let args = fastn_tunnel::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(args));
    // stdin is read on a blocking thread that never returns on its own
    runtime.shutdown_timeout(std::time::Duration::from_millis(100));
    result
}

async fn run(args: fastn_tunnel::Args) -> eyre::Result<()> {
    let events = fastn_tunnel::EventSink::Stdout;

    let config = match fastn_tunnel::Config::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            events.error(&e);
            return Err(e.into());
        }
    };

    let secret_key = match &config.secret_key_file {
        Some(path) => fastn_tunnel::peer::iroh::load_or_create_secret_key(path).await?,
        None => fastn_id52::SecretKey::generate(),
    };
    let peer = match fastn_tunnel::peer::iroh::IrohPeer::bind(secret_key).await {
        Ok(peer) => std::sync::Arc::new(peer),
        Err(e) => {
            events.error(&e);
            return Err(e.into());
        }
    };

    let ctx = fastn_tunnel::Context::new(events, config.timeouts);
    fastn_tunnel::lifecycle::spawn_signal_listener(ctx.lifecycle.clone());
    let control = tokio::io::BufReader::new(tokio::io::stdin());

    match config.role {
        fastn_tunnel::Role::Host { port, network } => {
            fastn_tunnel::host::run(peer, network, port, ctx, control).await?
        }
        fastn_tunnel::Role::Client { token, port } => {
            fastn_tunnel::client::run(peer, token, port, ctx, control).await?
        }
    }

    Ok(())
}
