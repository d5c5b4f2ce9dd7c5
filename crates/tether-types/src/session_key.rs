use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUBAGENT_SEGMENT: &str = "subagent";
pub const CRON_SEGMENT: &str = "cron";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Interactive,
    Scheduled,
    Subagent,
}

impl SessionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionRole::Interactive => "interactive",
            SessionRole::Scheduled => "scheduled",
            SessionRole::Subagent => "subagent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionKeyError {
    #[error("session key is empty")]
    Empty,
    #[error("session key `{0}` contains an empty segment")]
    EmptySegment(String),
    #[error("session key `{0}` has no root before its first subagent segment")]
    MissingRoot(String),
    #[error("session key `{0}` ends with a subagent segment that has no id")]
    DanglingSubagent(String),
    #[error("session key `{key}` has unexpected segment `{segment}` after a subagent id")]
    UnexpectedSegment { key: String, segment: String },
}

/// Hierarchical session identifier.
///
/// Keys are colon-delimited. The root part names an interactive or scheduled
/// (`cron`) session; every `:subagent:<id>` suffix nests one level deeper and
/// the key before it is the parent. Parsing happens once, at construction,
/// and the boundaries of every ancestor are kept so hierarchy queries never
/// re-scan the string.
#[derive(Clone)]
pub struct SessionKey {
    raw: String,
    scheduled_root: bool,
    /// Byte offsets where each ancestor key ends, root first.
    ancestor_ends: Vec<usize>,
}

/// Typed view of a key's place in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHierarchy {
    pub role: SessionRole,
    pub root: SessionKey,
    pub ancestors: Vec<SessionKey>,
    pub depth: usize,
}

impl SessionKey {
    pub fn parse(input: &str) -> Result<Self, SessionKeyError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SessionKeyError::Empty);
        }
        let segments = trimmed.split(':').collect::<Vec<_>>();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(SessionKeyError::EmptySegment(trimmed.to_string()));
        }
        if segments[0] == SUBAGENT_SEGMENT {
            return Err(SessionKeyError::MissingRoot(trimmed.to_string()));
        }

        let mut ancestor_ends = Vec::new();
        let mut scheduled_root = false;
        let mut in_root = true;
        let mut offset = 0usize;
        let mut idx = 0usize;
        while idx < segments.len() {
            let segment = segments[idx];
            if segment == SUBAGENT_SEGMENT {
                let id = match segments.get(idx + 1) {
                    Some(id) if *id != SUBAGENT_SEGMENT => *id,
                    _ => return Err(SessionKeyError::DanglingSubagent(trimmed.to_string())),
                };
                ancestor_ends.push(offset);
                offset += 1 + SUBAGENT_SEGMENT.len() + 1 + id.len();
                in_root = false;
                idx += 2;
                continue;
            }
            if !in_root {
                return Err(SessionKeyError::UnexpectedSegment {
                    key: trimmed.to_string(),
                    segment: segment.to_string(),
                });
            }
            if segment == CRON_SEGMENT {
                scheduled_root = true;
            }
            offset += if idx == 0 {
                segment.len()
            } else {
                1 + segment.len()
            };
            idx += 1;
        }

        Ok(Self {
            raw: trimmed.to_string(),
            scheduled_root,
            ancestor_ends,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn role(&self) -> SessionRole {
        if !self.ancestor_ends.is_empty() {
            SessionRole::Subagent
        } else if self.scheduled_root {
            SessionRole::Scheduled
        } else {
            SessionRole::Interactive
        }
    }

    pub fn depth(&self) -> usize {
        self.ancestor_ends.len()
    }

    pub fn is_subagent(&self) -> bool {
        !self.ancestor_ends.is_empty()
    }

    pub fn parent(&self) -> Option<SessionKey> {
        let (&end, rest) = self.ancestor_ends.split_last()?;
        Some(self.truncated(end, rest))
    }

    pub fn root(&self) -> SessionKey {
        match self.ancestor_ends.first() {
            Some(&end) => self.truncated(end, &[]),
            None => self.clone(),
        }
    }

    /// Every ancestor, root first, excluding the key itself.
    pub fn ancestors(&self) -> Vec<SessionKey> {
        (0..self.ancestor_ends.len())
            .map(|idx| self.truncated(self.ancestor_ends[idx], &self.ancestor_ends[..idx]))
            .collect()
    }

    pub fn is_ancestor_of(&self, other: &SessionKey) -> bool {
        other.ancestors().iter().any(|ancestor| ancestor == self)
    }

    pub fn child(&self, id: &str) -> Result<SessionKey, SessionKeyError> {
        SessionKey::parse(&format!("{}:{}:{}", self.raw, SUBAGENT_SEGMENT, id.trim()))
    }

    pub fn new_subagent(&self) -> SessionKey {
        let mut ancestor_ends = self.ancestor_ends.clone();
        ancestor_ends.push(self.raw.len());
        Self {
            raw: format!(
                "{}:{}:{}",
                self.raw,
                SUBAGENT_SEGMENT,
                uuid::Uuid::new_v4()
            ),
            scheduled_root: self.scheduled_root,
            ancestor_ends,
        }
    }

    pub fn hierarchy(&self) -> SessionHierarchy {
        SessionHierarchy {
            role: self.role(),
            root: self.root(),
            ancestors: self.ancestors(),
            depth: self.depth(),
        }
    }

    fn truncated(&self, end: usize, ancestor_ends: &[usize]) -> SessionKey {
        Self {
            raw: self.raw[..end].to_string(),
            scheduled_root: self.scheduled_root,
            ancestor_ends: ancestor_ends.to_vec(),
        }
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for SessionKey {}

impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for SessionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKey").field(&self.raw).finish()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionKey::parse(s)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionKey::parse(&value)
    }
}

impl From<SessionKey> for String {
    fn from(value: SessionKey) -> Self {
        value.raw
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl Serialize for SessionKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SessionKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> SessionKey {
        SessionKey::parse(raw).expect("valid key")
    }

    #[test]
    fn root_sessions_have_depth_zero() {
        let main = key("agent:main:main");
        assert_eq!(main.role(), SessionRole::Interactive);
        assert_eq!(main.depth(), 0);
        assert!(main.parent().is_none());
        assert_eq!(main.root(), main);

        let cron = key("agent:main:cron:nightly");
        assert_eq!(cron.role(), SessionRole::Scheduled);
        assert_eq!(cron.depth(), 0);
    }

    #[test]
    fn nested_subagents_expose_ancestry() {
        let grandchild = key("agent:main:main:subagent:a1:subagent:b2");
        assert_eq!(grandchild.role(), SessionRole::Subagent);
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(
            grandchild.parent(),
            Some(key("agent:main:main:subagent:a1"))
        );
        assert_eq!(grandchild.root(), key("agent:main:main"));
        assert_eq!(
            grandchild.ancestors(),
            vec![key("agent:main:main"), key("agent:main:main:subagent:a1")]
        );
        let parent = grandchild.parent().expect("parent");
        assert_eq!(parent.depth(), 1);
        assert_eq!(parent.parent(), Some(key("agent:main:main")));
        assert!(key("agent:main:main").is_ancestor_of(&grandchild));
        assert!(!grandchild.is_ancestor_of(&parent));
    }

    #[test]
    fn subagent_of_cron_session_keeps_scheduled_root() {
        let child = key("agent:ops:cron:daily:subagent:x");
        assert_eq!(child.role(), SessionRole::Subagent);
        assert_eq!(child.root().role(), SessionRole::Scheduled);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!(SessionKey::parse("  "), Err(SessionKeyError::Empty));
        assert!(matches!(
            SessionKey::parse("agent::main"),
            Err(SessionKeyError::EmptySegment(_))
        ));
        assert!(matches!(
            SessionKey::parse("subagent:x"),
            Err(SessionKeyError::MissingRoot(_))
        ));
        assert!(matches!(
            SessionKey::parse("agent:main:subagent"),
            Err(SessionKeyError::DanglingSubagent(_))
        ));
        assert!(matches!(
            SessionKey::parse("agent:main:subagent:subagent"),
            Err(SessionKeyError::DanglingSubagent(_))
        ));
        assert!(matches!(
            SessionKey::parse("agent:main:subagent:x:extra"),
            Err(SessionKeyError::UnexpectedSegment { .. })
        ));
    }

    #[test]
    fn new_subagent_round_trips_through_parse() {
        let parent = key("agent:main:main:subagent:a1");
        let child = parent.new_subagent();
        let reparsed = key(child.as_str());
        assert_eq!(reparsed, child);
        assert_eq!(reparsed.depth(), 2);
        assert_eq!(child.parent(), Some(parent.clone()));
        assert_eq!(parent.child("b2").expect("child").depth(), 2);
    }

    #[test]
    fn serde_uses_plain_string_form() {
        let child = key("agent:main:main:subagent:a1");
        let encoded = serde_json::to_string(&child).expect("encode");
        assert_eq!(encoded, "\"agent:main:main:subagent:a1\"");
        let decoded: SessionKey = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.depth(), 1);
        assert!(serde_json::from_str::<SessionKey>("\"a::b\"").is_err());
    }
}
