use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use tether_types::{SessionKey, TranscriptMessage};

/// Durable record of inbound user messages per session.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    /// Appends `message`, or replaces an earlier message with the same id.
    async fn record(&self, key: &SessionKey, message: &TranscriptMessage) -> anyhow::Result<()>;
}

/// Discards everything. Used where no transcript directory is configured.
pub struct NoopTranscriptSink;

#[async_trait]
impl TranscriptSink for NoopTranscriptSink {
    async fn record(&self, _key: &SessionKey, _message: &TranscriptMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One JSONL file per session key.
pub struct TranscriptStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TranscriptStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn file_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.jsonl", encode_file_stem(key.as_str())))
    }

    pub async fn read(&self, key: &SessionKey) -> anyhow::Result<Vec<TranscriptMessage>> {
        let path = self.file_for(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read transcript {}", path.display()))?;
        Ok(parse_lines(&raw))
    }
}

#[async_trait]
impl TranscriptSink for TranscriptStore {
    async fn record(&self, key: &SessionKey, message: &TranscriptMessage) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;

        let path = self.file_for(key);
        let mut messages = match fs::read_to_string(&path).await {
            Ok(raw) => parse_lines(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }

        let mut out = String::new();
        for msg in &messages {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, out).await?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace transcript {}", path.display()))?;
        Ok(())
    }
}

fn parse_lines(raw: &str) -> Vec<TranscriptMessage> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<TranscriptMessage>(line) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed transcript line");
                None
            }
        })
        .collect()
}

/// Percent-encodes everything outside `[A-Za-z0-9-]` so distinct keys never
/// share a file.
fn encode_file_stem(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::MessageRole;
    use uuid::Uuid;

    fn temp_store() -> (TranscriptStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("tether-transcripts-{}", Uuid::new_v4()));
        (TranscriptStore::new(&dir), dir)
    }

    #[tokio::test]
    async fn record_appends_then_replaces_by_id() {
        let (store, dir) = temp_store();
        let key = SessionKey::parse("agent:main:main").expect("key");

        let first = TranscriptMessage::user("hello");
        let second = TranscriptMessage::user("world");
        store.record(&key, &first).await.expect("record");
        store.record(&key, &second).await.expect("record");

        let mut edited = first.clone();
        edited.text = "hello again".to_string();
        store.record(&key, &edited).await.expect("record");

        let messages = store.read(&key).await.expect("read");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hello again");
        assert_eq!(messages[1].text, "world");
        assert_eq!(messages[1].role, MessageRole::User);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn subagent_keys_map_to_safe_file_names() {
        let (store, dir) = temp_store();
        let key = SessionKey::parse("agent:main:main:subagent:abc").expect("key");
        let path = store.file_for(&key);
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert_eq!(name, "agent%3Amain%3Amain%3Asubagent%3Aabc.jsonl");
        assert!(store.read(&key).await.expect("read").is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn similar_keys_keep_separate_transcripts() {
        let (store, dir) = temp_store();
        let colon = SessionKey::parse("agent:main").expect("key");
        let underscore = SessionKey::parse("agent_main").expect("key");
        let dotted = SessionKey::parse("agent.main").expect("key");
        assert_ne!(store.file_for(&colon), store.file_for(&underscore));
        assert_ne!(store.file_for(&underscore), store.file_for(&dotted));

        store
            .record(&colon, &TranscriptMessage::user("only for colon"))
            .await
            .expect("record");
        assert!(store.read(&underscore).await.expect("read").is_empty());
        assert!(store.read(&dotted).await.expect("read").is_empty());

        store
            .record(&underscore, &TranscriptMessage::user("only for underscore"))
            .await
            .expect("record");
        let colon_texts = store
            .read(&colon)
            .await
            .expect("read")
            .into_iter()
            .map(|m| m.text)
            .collect::<Vec<_>>();
        assert_eq!(colon_texts, vec!["only for colon"]);
        let _ = std::fs::remove_dir_all(dir);
    }
}
