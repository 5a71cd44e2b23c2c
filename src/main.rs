use std::net::SocketAddr;

use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

use twitch_irc_fanin::config::{self, Args, Config};
use twitch_irc_fanin::control;
use twitch_irc_fanin::db::{self, ChatterStore};
use twitch_irc_fanin::monitoring;
use twitch_irc_fanin::orchestrator::Orchestrator;
use twitch_irc_fanin::shutdown;
use twitch_irc_fanin::sinks::TcpJsonRpcSink;

/// Raises the open-file-descriptor limit to its hard ceiling. A single
/// listener can hold `channels_per_listener` JOINs on one socket, but the
/// pool as a whole opens one TLS connection per ~1000 channels — at the
/// tens-of-thousands scale this spec targets that's easily a few hundred
/// file descriptors, well past most distros' default soft limit.
#[cfg(unix)]
fn raise_fd_limit() {
    use rlimit::Resource;

    match Resource::NOFILE.get() {
        Ok((soft, hard)) if soft < hard => match Resource::NOFILE.set(hard, hard) {
            Ok(()) => tracing::info!(soft_before = soft, limit = hard, "raised open file descriptor limit"),
            Err(e) => tracing::warn!(error = %e, "failed to raise open file descriptor limit"),
        },
        Ok((soft, _)) => tracing::debug!(limit = soft, "open file descriptor limit already at hard ceiling"),
        Err(e) => tracing::warn!(error = %e, "failed to read open file descriptor limit"),
    }
}

#[cfg(not(unix))]
fn raise_fd_limit() {}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    raise_fd_limit();

    let args = Args::from_args();
    let config: &'static Config = Box::leak(Box::new(match config::load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            // Config load failure is never fatal: log and fall back to the
            // built-in defaults.
            tracing::warn!(error = %e, envtype = %args.envtype, "failed to load config; falling back to defaults");
            Config::default()
        }
    }));
    tracing::info!(
        envtype = %args.envtype,
        channels_per_listener = config.channels_per_listener,
        "loaded config"
    );

    let pool = match db::build_pool(&config.database) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "failed to build database connection pool");
            std::process::exit(1);
        }
    };
    let chatter_store = ChatterStore::new(pool);
    if let Err(e) = chatter_store.run_migrations().await {
        tracing::error!(error = %e, "failed to run database migrations");
        std::process::exit(1);
    }
    tracing::info!("database migrations up to date");

    let closer = CancellationToken::new();

    let event_sink = TcpJsonRpcSink::spawn(format!("{}:{}", config.addresses.event, config.ports.event));
    let chat_sink = TcpJsonRpcSink::spawn(format!("{}:{}", config.addresses.chat, config.ports.chat));

    let orchestrator: &'static Orchestrator = Box::leak(Box::new(Orchestrator::new(
        config.channels_per_listener,
        Box::new(event_sink),
        Box::new(chat_sink),
        Box::new(chatter_store),
        closer.clone(),
    )));
    orchestrator.spawn_background_tasks();
    tokio::spawn(monitoring::run_process_monitoring(closer.clone()));

    let control_addr: SocketAddr = format!("0.0.0.0:{}", config.ports.irc)
        .parse()
        .expect("ports.irc combines with 0.0.0.0 into a valid socket address");
    let tcp_listener = match tokio::net::TcpListener::bind(control_addr).await {
        Ok(tcp_listener) => tcp_listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %control_addr, "failed to bind control surface");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %control_addr, "control surface listening");

    let app = control::router(orchestrator);
    let server_closer = closer.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(server_closer.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "control surface server exited with an error");
        }
    });

    shutdown::wait_for_shutdown(closer.clone()).await;

    tracing::info!("shutting down");
    orchestrator.close_listeners().await;
}
