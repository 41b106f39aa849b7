//! Transcript hand-off.
//!
//! Completed turns are passed to a [`TranscriptSink`] after the `end`
//! event has been emitted. Storage failures never reach the client.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StreamError};
use crate::events::TurnMetadata;

/// One query/response pair handed to transcript storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub user_id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub query: String,
    pub response: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub metadata: TurnMetadata,
    /// The stream was interrupted and `response` holds partial text.
    pub interrupted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Destination for transcripts.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn store(&self, record: TranscriptRecord) -> Result<()>;

    /// Whether interrupted turns should be handed off as well.
    fn accepts_partial(&self) -> bool {
        false
    }
}

/// Writes each transcript as a JSON file below a storage root.
///
/// Layout: `<root>/<anonymous-user-id>/<conversation-id>/<uuid>.json`.
#[derive(Debug, Clone)]
pub struct FileTranscriptSink {
    root: PathBuf,
    pepper: Option<String>,
    store_partial: bool,
}

#[derive(Serialize)]
struct StoredTranscript<'a> {
    metadata: StoredMetadata<'a>,
    query: &'a str,
    llm_response: &'a str,
    interrupted: bool,
    truncated: bool,
    referenced_documents: &'a [crate::events::ReferencedDocument],
    rag_chunks: &'a [serde_json::Value],
    tool_calls: &'a [serde_json::Value],
}

#[derive(Serialize)]
struct StoredMetadata<'a> {
    provider: Option<&'a str>,
    model: Option<&'a str>,
    anonymous_user_id: &'a str,
    conversation_id: &'a str,
    request_id: &'a str,
    timestamp: String,
}

impl FileTranscriptSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pepper: None,
            store_partial: false,
        }
    }

    /// Secret mixed into the user id hash.
    pub fn with_pepper(mut self, pepper: impl Into<String>) -> Self {
        self.pepper = Some(pepper.into());
        self
    }

    pub fn with_partial_transcripts(mut self, enabled: bool) -> Self {
        self.store_partial = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable pseudonym for a user id.
    pub fn anonymous_user_id(&self, user_id: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(pepper) = &self.pepper {
            hasher.update(pepper.as_bytes());
        }
        hasher.update(user_id.trim().to_lowercase().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Directory holding transcripts of one conversation.
    pub fn conversation_dir(&self, user_id: &str, conversation_id: &str) -> PathBuf {
        self.root
            .join(self.anonymous_user_id(user_id))
            .join(sanitize_component(conversation_id))
    }
}

/// Reduce an identifier to a single safe path component.
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl TranscriptSink for FileTranscriptSink {
    async fn store(&self, record: TranscriptRecord) -> Result<()> {
        let anonymous_user_id = self.anonymous_user_id(&record.user_id);
        let dir = self.conversation_dir(&record.user_id, &record.conversation_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            StreamError::Transcript(format!("Failed to create {}: {}", dir.display(), err))
        })?;

        let stored = StoredTranscript {
            metadata: StoredMetadata {
                provider: record.provider.as_deref(),
                model: record.model.as_deref(),
                anonymous_user_id: &anonymous_user_id,
                conversation_id: &record.conversation_id,
                request_id: &record.request_id,
                timestamp: record.timestamp.to_rfc3339(),
            },
            query: &record.query,
            llm_response: &record.response,
            interrupted: record.interrupted,
            truncated: record.metadata.truncated.unwrap_or(false),
            referenced_documents: &record.metadata.referenced_documents,
            rag_chunks: &record.metadata.rag_chunks,
            tool_calls: &record.metadata.tool_calls,
        };
        let contents = serde_json::to_vec_pretty(&stored)?;

        let path = dir.join(format!("{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, contents).await?;

        debug!(user_id = %anonymous_user_id, "Anonymized user for transcript storage");
        info!(path = %path.display(), "Transcript stored");
        Ok(())
    }

    fn accepts_partial(&self) -> bool {
        self.store_partial
    }
}
