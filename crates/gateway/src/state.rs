//! Process wiring: one `AppState` owns every long-lived component.

use std::path::PathBuf;
use std::sync::Arc;

use sb_domain::config::Config;
use sb_queue::LaneScheduler;
use sb_sessions::SessionStore;

use crate::inbound::InboundPipeline;
use crate::outbound::OutboundShaper;
use crate::runtime::agent::{AgentRunner, ProviderSet, ToolExecutor};
use crate::runtime::{EventBus, HookRegistry, RunStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventBus>,
    pub runner: Arc<AgentRunner>,
    pub scheduler: LaneScheduler,
    pub shaper: Arc<OutboundShaper>,
    pub pipeline: Arc<InboundPipeline>,
}

impl AppState {
    /// Wire the core: stores, event bus, runner, lanes, shaper, pipeline.
    /// Fires the `bootstrap` hook once everything is constructed.
    pub fn build(
        config: Config,
        providers: ProviderSet,
        tools: Arc<dyn ToolExecutor>,
        hooks: HookRegistry,
        profile_ids: Vec<String>,
    ) -> Self {
        let config = Arc::new(config);
        let state_path: PathBuf = config
            .state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("state"));

        let sessions = Arc::new(SessionStore::new(&state_path));
        let runs = Arc::new(RunStore::new(&state_path));
        let events = Arc::new(EventBus::new(runs));

        let runner = Arc::new(AgentRunner::new(
            config.clone(),
            sessions.clone(),
            events.clone(),
            hooks.clone(),
            providers,
            tools,
            profile_ids,
        ));

        let scheduler = LaneScheduler::new(&config.queue, runner.clone());
        let shaper = Arc::new(OutboundShaper::new(config.clone()));

        let pipeline = Arc::new(InboundPipeline::new(
            config.clone(),
            sessions.clone(),
            scheduler.clone(),
            events.clone(),
            shaper.clone(),
            hooks.clone(),
        ));

        hooks.fire_bootstrap();

        Self { config, sessions, events, runner, scheduler, shaper, pipeline }
    }

    /// Spawn the background drivers (debounce flushing).
    pub fn spawn_drivers(&self) {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(250));
            loop {
                tick.tick().await;
                pipeline.flush_due_bursts();
            }
        });
    }
}
