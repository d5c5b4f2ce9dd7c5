use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;

use tether_types::{now_ms, RunOutcome, RunStatus, SessionKey};

use crate::SubagentPaths;

/// Durable entry for one subagent run. Survives process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentRunRecord {
    #[serde(rename = "runID")]
    pub run_id: String,
    #[serde(rename = "childSessionKey")]
    pub child_session_key: SessionKey,
    #[serde(rename = "requesterSessionKey")]
    pub requester_session_key: SessionKey,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: u64,
    #[serde(rename = "endedAtMs", default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

impl SubagentRunRecord {
    pub fn new(
        run_id: impl Into<String>,
        child_session_key: SessionKey,
        requester_session_key: SessionKey,
        task: impl Into<String>,
        label: Option<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            child_session_key,
            requester_session_key,
            task: task.into(),
            label,
            created_at_ms: now_ms(),
            ended_at_ms: None,
            outcome: None,
        }
    }

    /// Status a reconstructed run should take: running while the entry has no
    /// end time, otherwise the recorded outcome (completed when absent).
    pub fn inferred_status(&self) -> RunStatus {
        if self.ended_at_ms.is_none() {
            return RunStatus::Running;
        }
        self.outcome
            .as_ref()
            .map(RunOutcome::run_status)
            .unwrap_or(RunStatus::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct SubagentStore {
    paths: SubagentPaths,
}

impl SubagentStore {
    pub fn new(paths: SubagentPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &SubagentPaths {
        &self.paths
    }

    pub async fn put(&self, record: &SubagentRunRecord) -> anyhow::Result<()> {
        fs::create_dir_all(self.paths.runs_dir()).await?;
        let tmp = self.paths.entry_tmp_file(&record.run_id);
        let target = self.paths.entry_file(&record.run_id);
        let raw = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, raw)
            .await
            .with_context(|| format!("failed writing {}", tmp.display()))?;
        if let Err(err) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("failed replacing {}", target.display()));
        }
        Ok(())
    }

    /// Unreadable or partial files are treated as absent.
    pub async fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        read_record(&self.paths.entry_file(run_id)).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<SubagentRunRecord>> {
        let dir = self.paths.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_record(&path).await {
                out.push(record);
            }
        }
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(out)
    }

    /// Newest entry for `child`, preferring one requested by `parent_hint`.
    pub async fn find_by_child(
        &self,
        child: &SessionKey,
        parent_hint: Option<&SessionKey>,
    ) -> anyhow::Result<Option<SubagentRunRecord>> {
        let mut matching = self
            .list()
            .await?
            .into_iter()
            .filter(|record| &record.child_session_key == child)
            .collect::<Vec<_>>();
        matching.reverse();
        if let Some(parent) = parent_hint {
            if let Some(pos) = matching
                .iter()
                .position(|record| &record.requester_session_key == parent)
            {
                return Ok(Some(matching.swap_remove(pos)));
            }
        }
        Ok(matching.into_iter().next())
    }

    pub async fn list_by_requester(
        &self,
        requester: &SessionKey,
    ) -> anyhow::Result<Vec<SubagentRunRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| &record.requester_session_key == requester)
            .collect())
    }

    /// Records completion on an existing entry. Returns false if it is missing.
    pub async fn mark_ended(
        &self,
        run_id: &str,
        ended_at_ms: u64,
        outcome: RunOutcome,
    ) -> anyhow::Result<bool> {
        let Some(mut record) = self.get(run_id).await else {
            return Ok(false);
        };
        record.ended_at_ms = Some(ended_at_ms);
        record.outcome = Some(outcome);
        self.put(&record).await?;
        Ok(true)
    }
}

async fn read_record(path: &std::path::Path) -> Option<SubagentRunRecord> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping unreadable subagent entry");
            return None;
        }
    };
    match serde_json::from_str::<SubagentRunRecord>(&raw) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping malformed subagent entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_store() -> (SubagentStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("tether-subagents-{}", Uuid::new_v4()));
        (SubagentStore::new(SubagentPaths::new(&dir)), dir)
    }

    fn key(raw: &str) -> SessionKey {
        SessionKey::parse(raw).expect("key")
    }

    fn record(run_id: &str, child: &str, parent: &str, created: u64) -> SubagentRunRecord {
        let mut record = SubagentRunRecord::new(run_id, key(child), key(parent), "task", None);
        record.created_at_ms = created;
        record
    }

    #[tokio::test]
    async fn put_get_and_mark_ended() {
        let (store, dir) = temp_store();
        let entry = record("r1", "main:subagent:a", "main", 1);
        store.put(&entry).await.expect("put");
        assert_eq!(store.get("r1").await, Some(entry.clone()));
        assert_eq!(entry.inferred_status(), RunStatus::Running);

        assert!(store
            .mark_ended("r1", 99, RunOutcome::errored("boom"))
            .await
            .expect("mark"));
        let ended = store.get("r1").await.expect("entry");
        assert_eq!(ended.ended_at_ms, Some(99));
        assert_eq!(ended.inferred_status(), RunStatus::Errored);
        assert!(!store
            .mark_ended("missing", 1, RunOutcome::completed())
            .await
            .expect("mark"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn ended_entry_without_outcome_is_completed() {
        let mut entry = record("r1", "main:subagent:a", "main", 1);
        entry.ended_at_ms = Some(5);
        assert_eq!(entry.inferred_status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_files_are_skipped() {
        let (store, dir) = temp_store();
        store
            .put(&record("good", "main:subagent:a", "main", 1))
            .await
            .expect("put");
        let runs = store.paths().runs_dir();
        std::fs::write(runs.join("partial.json"), "{\"runID\": \"par").expect("write");
        std::fs::write(runs.join("notes.txt"), "ignored").expect("write");

        let all = store.list().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].run_id, "good");
        assert!(store.get("partial").await.is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn find_by_child_prefers_parent_hint_then_newest() {
        let (store, dir) = temp_store();
        let child = "main:subagent:a";
        store.put(&record("old", child, "main", 1)).await.expect("put");
        store.put(&record("new", child, "other", 2)).await.expect("put");

        let newest = store
            .find_by_child(&key(child), None)
            .await
            .expect("find")
            .expect("entry");
        assert_eq!(newest.run_id, "new");

        let hinted = store
            .find_by_child(&key(child), Some(&key("main")))
            .await
            .expect("find")
            .expect("entry");
        assert_eq!(hinted.run_id, "old");

        assert!(store
            .find_by_child(&key("main:subagent:zzz"), None)
            .await
            .expect("find")
            .is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn list_by_requester_filters_entries() {
        let (store, dir) = temp_store();
        store
            .put(&record("a", "main:subagent:a", "main", 1))
            .await
            .expect("put");
        store
            .put(&record("b", "main:subagent:a:subagent:b", "main:subagent:a", 2))
            .await
            .expect("put");
        let children = store.list_by_requester(&key("main")).await.expect("list");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].run_id, "a");
        assert!(store.list_by_requester(&key("nobody")).await.expect("list").is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }
}
