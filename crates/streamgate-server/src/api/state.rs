use crate::auth::Authenticator;
use crate::config::ServerConfig;
use std::sync::Arc;
use streamgate_ai::build_backend;
use streamgate_core::{
    FileTranscriptSink, SessionOrchestrator, StreamInterruptRegistry, TokenSourceFactory,
    TranscriptSink,
};

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamInterruptRegistry>,
    pub orchestrator: SessionOrchestrator,
    pub backend: Arc<dyn TokenSourceFactory>,
    pub authenticator: Arc<Authenticator>,
}

impl AppState {
    pub fn new(backend: Arc<dyn TokenSourceFactory>, authenticator: Authenticator) -> Self {
        let registry = Arc::new(StreamInterruptRegistry::new());
        Self {
            orchestrator: SessionOrchestrator::new(Arc::clone(&registry)),
            registry,
            backend,
            authenticator: Arc::new(authenticator),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let mut state = Self::new(
            build_backend(&config.inference),
            Authenticator::from_config(&config.auth),
        )
        .with_channel_capacity(config.channel_capacity);

        if config.transcripts.enabled {
            let mut sink = FileTranscriptSink::new(config.transcripts.storage_path.clone())
                .with_partial_transcripts(config.transcripts.store_partial);
            if let Some(pepper) = &config.transcripts.anonymization_pepper {
                sink = sink.with_pepper(pepper);
            }
            state = state.with_transcripts(Arc::new(sink));
        }
        state
    }

    pub fn with_transcripts(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.orchestrator = self.orchestrator.with_transcripts(sink);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.orchestrator = self.orchestrator.with_channel_capacity(capacity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::api::test_support::{body_string, post_json};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn transcript_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    #[test]
    fn test_from_config_uses_configured_backend() {
        let config = ServerConfig::from_toml_str(
            "[inference]\nprovider = \"mock\"\nmodel = \"echo-2\"\n[streaming]\nchannel_capacity = 2\n",
        )
        .unwrap();
        let state = AppState::from_config(&config);

        assert_eq!(state.backend.provider(), "mock");
        assert_eq!(state.backend.model(), "echo-2");
        assert_eq!(state.authenticator.module_name(), "noop");
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_completed_stream_writes_transcript() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::from_toml_str(&format!(
            "[transcripts]\nenabled = true\nstorage_path = {:?}\n",
            temp_dir.path().to_string_lossy()
        ))
        .unwrap();
        let app = router(AppState::from_config(&config));

        let response = app
            .oneshot(post_json("/v1/streaming_query", r#"{"query": "hi"}"#))
            .await
            .unwrap();
        let _ = body_string(response).await;

        let mut stored = None;
        for _ in 0..50 {
            let files = transcript_files(temp_dir.path()).await;
            if let [file] = files.as_slice()
                && let Ok(contents) = tokio::fs::read_to_string(file).await
                && let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents)
            {
                stored = Some(json);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let json = stored.expect("transcript written");
        assert_eq!(json["query"], "hi");
        assert_eq!(json["llm_response"], "mock-echo: hi");
    }
}
