use crate::bridge::InboundBridge;
use crate::functions::FunctionRegistry;
use hands_common::AgentConfig;
use hands_core::MemoryEngine;
use std::sync::Arc;

/// State shared by the command and data services.
pub struct AgentContext {
    pub config: AgentConfig,
    pub memory: MemoryEngine,
    pub functions: FunctionRegistry,
    pub bridge: Arc<InboundBridge>,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        let bridge = Arc::new(InboundBridge::new());
        Self {
            config,
            memory: MemoryEngine::native(),
            functions: FunctionRegistry::new(bridge.clone()),
            bridge,
        }
    }
}
