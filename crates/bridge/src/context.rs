//! Bridge context – holds the engine factory and config.

use crate::config::{get_config, BridgeConfig};
use crate::quickjs::QuickJsFactory;
use crate::traits::EngineFactory;
use std::sync::Arc;

/// Everything a dispatcher needs from its host.
///
/// Holds the factory as a trait object so callers (CLI / tests) can swap
/// the engine implementation without touching dispatch logic.
#[derive(Clone)]
pub struct BridgeContext {
    factory: Arc<dyn EngineFactory>,
    config: BridgeConfig,
}

impl BridgeContext {
    pub fn new(factory: Arc<dyn EngineFactory>, config: BridgeConfig) -> Self {
        Self { factory, config }
    }

    /// QuickJS engines with the process-wide configuration.
    pub fn default_quickjs() -> Self {
        Self::new(Arc::new(QuickJsFactory), get_config().clone())
    }

    /// QuickJS engines with an explicit configuration.
    pub fn quickjs_with_config(config: BridgeConfig) -> Self {
        Self::new(Arc::new(QuickJsFactory), config)
    }

    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        self.factory.clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}
