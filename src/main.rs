//! chat-bridge: coordination core for a browser-automation bridge.
//!
//! Hosts the relay (WebSocket + pull REST on one loopback port), the
//! operation manager with its on-disk store, and optionally an in-process
//! simulated extension peer driving the mock browser, which is how the
//! integration tests exercise the full loop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod config;
mod diagnostics;
mod error;
mod extension;
mod globals;
mod ops;
mod relay;
mod shutdown;
mod util;

use config::BridgeConfig;
use diagnostics::logbuf::{BufferLayer, LogRingBuffer, DEFAULT_LOG_CAPACITY};
use extension::capabilities::MockBrowser;
use extension::client::{ExtensionClient, PullExtensionClient};
use extension::commands::{CommandRouter, ExtensionContext};
use relay::server::{self, RelayState};
use shutdown::ShutdownCoordinator;

#[derive(Parser, Debug)]
#[command(name = "chat-bridge", about = "Relay hub for browser-automation MCP peers")]
struct Cli {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Relay port (loopback only)
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. "info" or "chat_bridge=debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Operation store path
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Start with debug-mode log forwarding enabled
    #[arg(long)]
    debug: bool,

    /// Run the in-process simulated extension peer (mock browser)
    #[arg(long)]
    simulate_extension: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load(cli.config.as_deref());
    if let Some(port) = cli.port {
        config.relay_port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(path) = cli.store_path {
        config.operation_store_path = path;
    }
    if cli.debug {
        config.debug_mode = true;
    }
    if cli.simulate_extension {
        config.simulate_extension = true;
    }

    // init tracing from env BRIDGE_LOG / RUST_LOG, falling back to config
    let filter = std::env::var("BRIDGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| config.log_level.clone());
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let logbuf = LogRingBuffer::new(DEFAULT_LOG_CAPACITY);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .with(BufferLayer::new(Arc::clone(&logbuf)))
        .init();

    info!(
        port = config.relay_port,
        store = %config.operation_store_path.display(),
        "chat-bridge starting up"
    );

    globals::init(config, Arc::clone(&logbuf)).expect("initialize globals");
    let config = globals::config();
    let ops = globals::operations();

    let coordinator = ShutdownCoordinator::new();
    let state = RelayState::new(
        config.clone(),
        Arc::clone(&ops),
        Arc::clone(&logbuf),
        coordinator.sender(),
    );

    // background: deadline sweeper
    tokio::spawn(Arc::clone(&ops).run_timeout_sweeper(coordinator.subscribe()));

    // optional in-process extension peer against the mock browser
    let debug_settings = if config.simulate_extension {
        let browser = MockBrowser::new();
        let (observer_tx, observer_rx) = tokio::sync::mpsc::unbounded_channel();
        browser.set_observer_channel(observer_tx);
        tokio::spawn(extension::observer::run_pump(Arc::clone(&ops), observer_rx));

        let ctx = ExtensionContext::new(
            Arc::new(browser),
            globals::tabs(),
            Arc::clone(&ops),
            Arc::clone(&logbuf),
            config,
        );
        let settings = Arc::clone(&ctx.debug_settings);
        let commands = Arc::new(CommandRouter::new());
        if config.use_pull_transport {
            let client = PullExtensionClient::new(ctx, commands, config);
            tokio::spawn(client.run(coordinator.subscribe()));
            info!("[MAIN] Simulated extension peer enabled (pull transport)");
        } else {
            let client = ExtensionClient::new(ctx, commands, config);
            tokio::spawn(client.run(coordinator.subscribe()));
            info!("[MAIN] Simulated extension peer enabled");
        }
        settings
    } else {
        Arc::new(parking_lot::Mutex::new(
            diagnostics::logbuf::DebugForwardSettings {
                enabled: config.debug_mode,
                batch_ms: 1_000,
                ..Default::default()
            },
        ))
    };

    server::spawn_pumps(&state, debug_settings);
    tokio::spawn(coordinator.wait_for_signal());

    if let Err(e) = server::serve(state).await {
        tracing::error!("[MAIN] Relay server error: {}", e);
    }

    globals::shutdown();
    info!("chat-bridge stopped");
}
