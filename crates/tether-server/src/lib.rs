use std::sync::Arc;

use tether_core::{ConfigStore, StatePaths, TranscriptStore};
use tether_orchestrator::{Executor, HierarchyCoordinator, RunRegistry};
use tether_subagents::{SubagentPaths, SubagentStore};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub registry: RunRegistry,
    pub coordinator: HierarchyCoordinator,
    pub store: SubagentStore,
    pub config: ConfigStore,
}

impl AppState {
    pub fn new(registry: RunRegistry, store: SubagentStore, config: ConfigStore) -> Self {
        Self {
            coordinator: registry.hierarchy(),
            registry,
            store,
            config,
        }
    }

    /// Wires a registry over the on-disk layout in `paths` using the
    /// effective orchestrator settings from `config`.
    pub async fn from_paths(
        paths: &StatePaths,
        config: ConfigStore,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let effective = config.get().await;
        let store = SubagentStore::new(SubagentPaths::new(&paths.subagents_dir));
        let transcripts = Arc::new(TranscriptStore::new(paths.transcripts_dir.clone()));
        let registry = RunRegistry::new(executor, transcripts, store.clone(), effective.orchestrator);
        Self::new(registry, store, config)
    }
}
