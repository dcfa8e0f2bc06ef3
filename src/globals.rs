//! Process-wide singletons
//!
//! The operation manager, tab coordinator and log buffer are shared by
//! the relay and the extension-side stack. Nothing here initializes
//! ambiently: `init(..)` must be called once from `main` before any
//! accessor, and tests construct their own instances instead.

use std::sync::Arc;

use anyhow::anyhow;
use once_cell::sync::OnceCell;

use crate::config::BridgeConfig;
use crate::diagnostics::logbuf::LogRingBuffer;
use crate::extension::tabs::TabCoordinator;
use crate::ops::manager::OperationManager;
use crate::ops::store::OperationStore;

static CONFIG: OnceCell<BridgeConfig> = OnceCell::new();
static OPERATIONS: OnceCell<Arc<OperationManager>> = OnceCell::new();
static LOG_BUFFER: OnceCell<Arc<LogRingBuffer>> = OnceCell::new();
static TABS: OnceCell<Arc<TabCoordinator>> = OnceCell::new();

pub fn init(config: BridgeConfig, logbuf: Arc<LogRingBuffer>) -> anyhow::Result<()> {
    let ops = OperationManager::new(
        OperationStore::new(config.operation_store_path.clone()),
        &config,
    );
    let tabs = TabCoordinator::new(config.lock_timeout_ms);

    CONFIG.set(config).map_err(|_| anyhow!("globals already initialized"))?;
    OPERATIONS.set(ops).map_err(|_| anyhow!("globals already initialized"))?;
    LOG_BUFFER.set(logbuf).map_err(|_| anyhow!("globals already initialized"))?;
    TABS.set(tabs).map_err(|_| anyhow!("globals already initialized"))?;
    Ok(())
}

pub fn config() -> &'static BridgeConfig {
    CONFIG.get().expect("globals::init not called")
}

pub fn operations() -> Arc<OperationManager> {
    Arc::clone(OPERATIONS.get().expect("globals::init not called"))
}

pub fn log_buffer() -> Arc<LogRingBuffer> {
    Arc::clone(LOG_BUFFER.get().expect("globals::init not called"))
}

pub fn tabs() -> Arc<TabCoordinator> {
    Arc::clone(TABS.get().expect("globals::init not called"))
}

/// Final flush before process exit.
pub fn shutdown() {
    if let Some(ops) = OPERATIONS.get() {
        ops.persist();
    }
}
