//! Append-only conversation store.
//!
//! One file per message under `<root>/Conversation/`, named so that
//! lexicographic order equals chronological order:
//! `yyyyMMddTHHmmssfffZ_{seq4}_{role}.json`. The `seq4` counter
//! disambiguates same-millisecond writes within a process. Files are
//! written atomically (temp file + fsync + rename) and never mutated.

pub mod envelope;

use crate::config::ContextConfig;
use crate::error::{AssistantError, Result};
use crate::traits::ContextProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    /// The human speaking to the assistant.
    User,
    /// The assistant's reply.
    Assistant,
    /// Host- or configuration-injected content.
    System,
}

impl ChatRole {
    /// Lowercase label used in filenames and prompt roles.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One immutable conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message author.
    pub role: ChatRole,
    /// Message text. Immutable once appended.
    pub content: String,
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
    /// Optional host metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ChatMessage {
    /// Convenience constructor without metadata.
    #[must_use]
    pub fn new(role: ChatRole, content: impl Into<String>, timestamp_utc: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp_utc,
            metadata: None,
        }
    }
}

/// Append-only, optionally encrypted conversation log.
pub struct ConversationStore {
    dir: PathBuf,
    key: Option<[u8; 32]>,
    counter: AtomicU64,
}

impl ConversationStore {
    /// Open (creating if needed) the store for the given configuration.
    ///
    /// The storage root defaults to the OS cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no storage root can be resolved or the
    /// directory cannot be created.
    pub fn new(config: &ContextConfig) -> Result<Self> {
        let root = match &config.storage_root {
            Some(root) => root.clone(),
            None => dirs::cache_dir()
                .ok_or_else(|| AssistantError::Store("no cache directory available".into()))?
                .join("wren"),
        };
        Self::open_at(&root, &config.encryption_key)
    }

    /// Open a store rooted at an explicit directory.
    ///
    /// An empty `encryption_key` stores plaintext envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation directory cannot be created.
    pub fn open_at(root: &Path, encryption_key: &str) -> Result<Self> {
        let dir = root.join("Conversation");
        std::fs::create_dir_all(&dir).map_err(|e| {
            AssistantError::Store(format!("cannot create {}: {e}", dir.display()))
        })?;

        let key = if encryption_key.is_empty() {
            None
        } else {
            Some(envelope::derive_key(encryption_key))
        };
        info!(
            "conversation store at {} ({})",
            dir.display(),
            if key.is_some() {
                "encrypted"
            } else {
                "plaintext"
            },
        );

        Ok(Self {
            dir,
            key,
            counter: AtomicU64::new(0),
        })
    }

    /// Directory holding the message files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one message, returning the written path.
    ///
    /// # Errors
    ///
    /// Write failures propagate; the caller decides what the failed turn
    /// means.
    pub fn append(&self, message: &ChatMessage) -> Result<PathBuf> {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{}_{:04}_{}.json",
            message.timestamp_utc.format("%Y%m%dT%H%M%S%3fZ"),
            sequence,
            message.role.as_str(),
        );
        let path = self.dir.join(&name);

        let message_json = serde_json::to_vec(message)
            .map_err(|e| AssistantError::Store(format!("cannot serialize message: {e}")))?;
        let wrapped = match &self.key {
            Some(key) => envelope::seal(key, &message_json)?,
            None => envelope::Envelope::Plaintext {
                content: serde_json::to_value(message)
                    .map_err(|e| AssistantError::Store(format!("cannot serialize message: {e}")))?,
            },
        };
        let body = serde_json::to_vec(&wrapped)
            .map_err(|e| AssistantError::Store(format!("cannot serialize envelope: {e}")))?;

        // Temp file in the same directory so the rename is atomic.
        let tmp_path = self.dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp_path, &body).map_err(|e| {
            AssistantError::Store(format!("cannot write {}: {e}", tmp_path.display()))
        })?;
        if let Ok(file) = std::fs::File::open(&tmp_path) {
            let _ = file.sync_all();
        }
        std::fs::rename(&tmp_path, &path)
            .map_err(|e| AssistantError::Store(format!("cannot rename to {}: {e}", path.display())))?;

        debug!("appended {}", name);
        Ok(path)
    }

    /// The last `n` readable messages in chronological order.
    ///
    /// Corrupt files, and encrypted files when no key is configured, are
    /// skipped silently.
    ///
    /// # Errors
    ///
    /// Only a failure to list the directory is an error; per-file trouble
    /// never is.
    pub fn tail(&self, n: usize) -> Result<Vec<ChatMessage>> {
        if n == 0 || !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| AssistantError::Store(format!("cannot list {}: {e}", self.dir.display())))?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json"))
            .collect();

        // Filename order is chronological order: newest-first, take n,
        // then restore chronological order.
        names.sort_unstable_by(|a, b| b.cmp(a));
        names.truncate(n);
        names.sort_unstable();

        let mut messages = Vec::with_capacity(names.len());
        for name in names {
            match self.read_message(&self.dir.join(&name)) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => debug!("skipping {name}: encrypted without a key"),
                Err(e) => debug!("skipping {name}: {e}"),
            }
        }
        Ok(messages)
    }

    fn read_message(&self, path: &Path) -> Result<Option<ChatMessage>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AssistantError::Store(format!("cannot read file: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AssistantError::Store(format!("invalid JSON: {e}")))?;

        // Legacy files predate the envelope and hold the message directly.
        if value.get("alg").is_none() {
            let message: ChatMessage = serde_json::from_value(value)
                .map_err(|e| AssistantError::Store(format!("invalid legacy message: {e}")))?;
            return Ok(Some(message));
        }

        let wrapped: envelope::Envelope = serde_json::from_value(value)
            .map_err(|e| AssistantError::Store(format!("invalid envelope: {e}")))?;
        let Some(bytes) = envelope::open(&wrapped, self.key.as_ref())? else {
            return Ok(None);
        };
        let message: ChatMessage = serde_json::from_slice(&bytes)
            .map_err(|e| AssistantError::Store(format!("invalid message JSON: {e}")))?;
        Ok(Some(message))
    }
}

#[async_trait]
impl ContextProvider for ConversationStore {
    async fn get_context(&self, _prompt: &str, n: usize) -> Result<Vec<ChatMessage>> {
        self.tail(n)
    }
}
