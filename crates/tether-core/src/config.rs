use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub const DEFAULT_RETENTION_SECS: u64 = 300;
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_SUBAGENT_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How long a finished run stays retrievable for late replay.
    pub retention_secs: u64,
    /// Wall-clock limit per run. Zero disables it.
    pub run_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub max_subagent_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION_SECS,
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            reap_interval_secs: DEFAULT_REAP_INTERVAL_SECS,
            max_subagent_depth: DEFAULT_MAX_SUBAGENT_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub orchestrator: OrchestratorConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env_layer(path, env_layer(), cli_overrides).await
    }

    async fn with_env_layer(
        path: impl AsRef<Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&path)
            .await
            .unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            file,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> TetherConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, path = %self.path.display(), "invalid config, using defaults");
                TetherConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "file": layers.file,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    /// Merges `patch` into the file layer and persists it.
    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        let snapshot = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
            layers.file.clone()
        };
        write_json_file(&self.path, &snapshot).await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn env_layer() -> Value {
    env_layer_from(|name| std::env::var(name).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    for (var, field) in [
        ("TETHER_RETENTION_SECS", "retention_secs"),
        ("TETHER_RUN_TIMEOUT_SECS", "run_timeout_secs"),
        ("TETHER_REAP_INTERVAL_SECS", "reap_interval_secs"),
        ("TETHER_MAX_SUBAGENT_DEPTH", "max_subagent_depth"),
    ] {
        let Some(raw) = lookup(var) else { continue };
        match raw.trim().parse::<u64>() {
            Ok(value) => deep_merge(&mut root, &json!({ "orchestrator": { field: value } })),
            Err(_) => tracing::warn!(var, value = %raw, "ignoring non-numeric config override"),
        }
    }
    if let Some(command) = lookup("TETHER_EXECUTOR_COMMAND") {
        let mut parts = command.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            deep_merge(
                &mut root,
                &json!({
                    "executor": {
                        "command": program,
                        "args": parts.collect::<Vec<_>>()
                    }
                }),
            );
        }
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tether-core-config-{name}-{}.json",
            uuid::Uuid::new_v4()
        ))
    }

    #[test]
    fn deep_merge_skips_nulls_and_merges_objects() {
        let mut base = json!({"orchestrator": {"retention_secs": 10, "run_timeout_secs": 20}});
        deep_merge(
            &mut base,
            &json!({"orchestrator": {"retention_secs": 30, "run_timeout_secs": null}}),
        );
        assert_eq!(base["orchestrator"]["retention_secs"], 30);
        assert_eq!(base["orchestrator"]["run_timeout_secs"], 20);
    }

    #[test]
    fn env_layer_parses_numbers_and_command() {
        let vars: HashMap<&str, &str> = [
            ("TETHER_RETENTION_SECS", "42"),
            ("TETHER_MAX_SUBAGENT_DEPTH", "not-a-number"),
            ("TETHER_EXECUTOR_COMMAND", "python3 agent.py --fast"),
        ]
        .into_iter()
        .collect();
        let layer = env_layer_from(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(layer["orchestrator"]["retention_secs"], 42);
        assert!(layer["orchestrator"].get("max_subagent_depth").is_none());
        assert_eq!(layer["executor"]["command"], "python3");
        assert_eq!(layer["executor"]["args"], json!(["agent.py", "--fast"]));
    }

    #[tokio::test]
    async fn layers_apply_in_order_file_env_runtime_cli() {
        let path = unique_temp_file("layers");
        fs::write(
            &path,
            r#"{"orchestrator":{"retention_secs":1,"run_timeout_secs":2,"reap_interval_secs":3}}"#,
        )
        .await
        .expect("write");

        let store = ConfigStore::with_env_layer(
            &path,
            json!({"orchestrator": {"run_timeout_secs": 20, "reap_interval_secs": 30}}),
            Some(json!({"orchestrator": {"reap_interval_secs": 300}})),
        )
        .await
        .expect("store");
        store
            .patch_runtime(json!({"orchestrator": {"max_subagent_depth": 7}}))
            .await
            .expect("patch");

        let config = store.get().await;
        assert_eq!(config.orchestrator.retention_secs, 1);
        assert_eq!(config.orchestrator.run_timeout_secs, 20);
        assert_eq!(config.orchestrator.reap_interval_secs, 300);
        assert_eq!(config.orchestrator.max_subagent_depth, 7);
        assert!(config.executor.command.is_none());
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unreadable_file_falls_back_to_defaults() {
        let path = unique_temp_file("garbage");
        fs::write(&path, "{not json").await.expect("write");
        let store = ConfigStore::with_env_layer(&path, empty_object(), None)
            .await
            .expect("store");
        assert_eq!(store.get().await, TetherConfig::default());
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn patch_file_persists_to_disk() {
        let path = unique_temp_file("persist");
        let store = ConfigStore::with_env_layer(&path, empty_object(), None)
            .await
            .expect("store");
        store
            .patch_file(json!({"executor": {"command": "agent"}}))
            .await
            .expect("patch");

        let reopened = ConfigStore::with_env_layer(&path, empty_object(), None)
            .await
            .expect("store");
        assert_eq!(
            reopened.get().await.executor.command.as_deref(),
            Some("agent")
        );
        let _ = fs::remove_file(&path).await;
    }
}
