//! Shared application state passed to every route handler.

use std::path::Path;
use std::sync::Arc;

use mq_av::tools::FFMPEG;
use mq_av::{ProcessSupervisor, ToolRegistry};
use mq_core::config::Config;
use mq_core::events::EventBus;
use mq_transcode::{SessionRegistry, SourceResolver};

/// Cloned into each handler by axum's `State` extractor.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub event_bus: Arc<EventBus>,
    pub registry: Arc<SessionRegistry>,
}

impl AppContext {
    /// Build the context around the discovered ffmpeg.
    ///
    /// A missing ffmpeg is not fatal here; sessions fail to launch with a
    /// classified `MissingBinary` error instead.
    pub fn new(config: Config, tools: ToolRegistry, resolver: Arc<dyn SourceResolver>) -> Self {
        let program = tools
            .get(FFMPEG)
            .unwrap_or_else(|| Path::new(FFMPEG))
            .to_path_buf();
        let supervisor = ProcessSupervisor::new(program, config.transcode.shutdown_grace());
        Self::with_supervisor(config, tools, resolver, supervisor)
    }

    pub fn with_supervisor(
        config: Config,
        tools: ToolRegistry,
        resolver: Arc<dyn SourceResolver>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let registry = Arc::new(SessionRegistry::new(
            config.transcode.clone(),
            config.qualities.clone(),
            resolver,
            Arc::new(supervisor),
            event_bus.clone(),
        ));

        Self {
            config: Arc::new(config),
            tools: Arc::new(tools),
            event_bus,
            registry,
        }
    }
}
