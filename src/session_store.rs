//! On-disk layout for per-conversation agent sessions:
//!
//! ```text
//! conversations/<cid>/<agent-name>.session       # JSON array of {role,content}
//! conversations/<cid>/<agent-name>_summary.txt   # optional compressed summary
//! ```
//!
//! The [`SessionStore`] owns reading and writing these files; it does not
//! interpret their contents beyond the `{role,content}` shape. System
//! messages are never persisted here — they are rebuilt from prompt
//! templates at each turn.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistedRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub role: PersistedRole,
    pub content: String,
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(conversations_root: impl Into<PathBuf>) -> Self {
        Self {
            root: conversations_root.into(),
        }
    }

    fn conversation_dir(&self, cid: &str) -> PathBuf {
        self.root.join(cid)
    }

    fn session_path(&self, cid: &str, agent_name: &str) -> PathBuf {
        self.conversation_dir(cid).join(format!("{}.session", agent_name))
    }

    fn summary_path(&self, cid: &str, agent_name: &str) -> PathBuf {
        self.conversation_dir(cid).join(format!("{}_summary.txt", agent_name))
    }

    /// Load a session's full message history. Missing or malformed files
    /// yield an empty history.
    pub async fn load_session(
        &self,
        cid: &str,
        agent_name: &str,
    ) -> Vec<PersistedMessage> {
        let path = self.session_path(cid, agent_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => {
                serde_json::from_str(&content).unwrap_or_else(|e| {
                    log::warn!("malformed session file {:?}: {}", path, e);
                    Vec::new()
                })
            }
            _ => Vec::new(),
        }
    }

    /// Overwrite a session's full message history.
    pub async fn save_session(
        &self,
        cid: &str,
        agent_name: &str,
        messages: &[PersistedMessage],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        tokio::fs::create_dir_all(self.conversation_dir(cid)).await?;
        let body = serde_json::to_string_pretty(messages)?;
        tokio::fs::write(self.session_path(cid, agent_name), body).await?;
        Ok(())
    }

    /// Append exactly one user+assistant pair to a session's persisted
    /// history. Called only after a successful `chat` completion.
    pub async fn append_turn(
        &self,
        cid: &str,
        agent_name: &str,
        user_content: String,
        assistant_content: String,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut messages = self.load_session(cid, agent_name).await;
        messages.push(PersistedMessage {
            role: PersistedRole::User,
            content: user_content,
        });
        messages.push(PersistedMessage {
            role: PersistedRole::Assistant,
            content: assistant_content,
        });
        self.save_session(cid, agent_name, &messages).await
    }

    pub async fn load_summary(&self, cid: &str, agent_name: &str) -> Option<String> {
        tokio::fs::read_to_string(self.summary_path(cid, agent_name))
            .await
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    pub async fn save_summary(
        &self,
        cid: &str,
        agent_name: &str,
        summary: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        tokio::fs::create_dir_all(self.conversation_dir(cid)).await?;
        tokio::fs::write(self.summary_path(cid, agent_name), summary).await?;
        Ok(())
    }

    /// Mint a new conversation directory and return its `cid`.
    pub async fn create_conversation(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let cid = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.conversation_dir(&cid)).await?;
        Ok(cid)
    }

    /// Enumerate conversation directories, sorted by the planner session's
    /// mtime descending, paired with each conversation's message count.
    pub async fn list_conversations(
        &self,
    ) -> Result<Vec<(String, usize)>, Box<dyn Error + Send + Sync>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Box::new(e)),
        };

        let mut conversations = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(cid) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let planner_session = self.session_path(&cid, "planner");
            let mtime = tokio::fs::metadata(&planner_session)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            let count = self.load_session(&cid, "planner").await.len();
            conversations.push((cid, count, mtime));
        }
        conversations.sort_by(|a, b| b.2.cmp(&a.2));
        Ok(conversations.into_iter().map(|(cid, count, _)| (cid, count)).collect())
    }

    /// Remove a conversation's session directory entirely.
    pub async fn delete_conversation(
        &self,
        cid: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match tokio::fs::remove_dir_all(self.conversation_dir(cid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_turn_grows_session_by_exactly_two_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store
            .append_turn("c1", "planner", "hi".into(), "hello".into())
            .await
            .unwrap();
        let messages = store.load_session("c1", "planner").await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, PersistedRole::User);
        assert_eq!(messages[1].role, PersistedRole::Assistant);
    }

    #[tokio::test]
    async fn missing_session_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load_session("nope", "planner").await.is_empty());
    }

    #[tokio::test]
    async fn delete_conversation_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let cid = store.create_conversation().await.unwrap();
        store.delete_conversation(&cid).await.unwrap();
        assert!(store.load_session(&cid, "planner").await.is_empty());
    }
}
