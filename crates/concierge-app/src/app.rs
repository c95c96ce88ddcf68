//! Wiring of storage, retrieval, inference and routing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use concierge_chat::{
    inference_from_config, ChatHandler, CompletionConstraints, DocumentQaEngine, HandlerRegistry,
    InferenceClient, Router, TaskClassifier,
};
use concierge_core::config::ConciergeConfig;
use concierge_core::types::TaskLabel;
use concierge_storage::{ChunkRepository, ConversationStores, Database};
use concierge_vector::{embedding_from_config, list_documents, load_document, ChunkingPolicy, DocumentIndex};

use crate::agents::register_stub_agents;

pub type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Outcome of ingesting a set of paths.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// `(document id, chunk count)` for every document ingested.
    pub ingested: Vec<(String, usize)>,
    /// Paths or documents that could not be loaded or indexed.
    pub failures: usize,
}

/// Every long-lived component of the assistant.
pub struct App {
    pub config: ConciergeConfig,
    pub stores: ConversationStores,
    pub index: Arc<DocumentIndex>,
    pub router: Router,
}

impl App {
    /// Open the on-disk database and reload the persisted document index.
    pub fn open(config: ConciergeConfig) -> AppResult<Self> {
        let db_path = config.database_path();
        let db = Arc::new(Database::new(&db_path)?);
        info!(path = %db_path.display(), "SQLite database opened");
        Self::build(config, db, true)
    }

    /// Everything in memory; nothing outlives the process.
    pub fn in_memory(config: ConciergeConfig) -> AppResult<Self> {
        Self::build(config, Arc::new(Database::in_memory()?), false)
    }

    /// Ingest files or directories, continuing past individual failures.
    pub async fn ingest_paths(&self, paths: &[PathBuf]) -> IngestReport {
        let mut report = IngestReport::default();
        for path in paths {
            let files = match list_documents(path) {
                Ok(files) => files,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping path");
                    report.failures += 1;
                    continue;
                }
            };
            for file in files {
                let document = match load_document(&file) {
                    Ok(document) => document,
                    Err(e) => {
                        warn!(path = %file.display(), error = %e, "Skipping file");
                        report.failures += 1;
                        continue;
                    }
                };
                let id = document.id.clone();
                match self.index.ingest(document).await {
                    Ok(chunk_ids) => report.ingested.push((id, chunk_ids.len())),
                    Err(e) => {
                        warn!(document_id = %id, error = %e, "Ingest failed");
                        report.failures += 1;
                    }
                }
            }
        }
        report
    }

    /// Bring the index up to date with the configured documents directory.
    ///
    /// A missing directory is not an error. Unchanged documents are not
    /// re-embedded.
    pub async fn index_documents_dir(&self) -> IngestReport {
        let dir = self.config.documents_dir();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "No documents directory");
            return IngestReport::default();
        }
        let report = self.ingest_paths(&[dir.clone()]).await;
        info!(
            dir = %dir.display(),
            documents = report.ingested.len(),
            failures = report.failures,
            "Indexed documents directory"
        );
        report
    }

    fn build(config: ConciergeConfig, db: Arc<Database>, persistent: bool) -> AppResult<Self> {
        let embedder = embedding_from_config(&config.embedding)?;
        let policy = ChunkingPolicy::from_config(&config.document_qa);
        let index = if persistent {
            DocumentIndex::load(embedder, policy, ChunkRepository::new(Arc::clone(&db)))?
        } else {
            DocumentIndex::new(embedder, policy)
        };
        let index = Arc::new(
            index.with_embed_timeout(Duration::from_secs(config.embedding.timeout_secs)),
        );

        let service = inference_from_config(&config.inference)?;
        info!(provider = service.name(), "Inference backend ready");
        let client = InferenceClient::from_config(service, &config.inference);

        let mut registry = HandlerRegistry::new();
        registry.register(
            TaskLabel::Chat,
            Arc::new(
                ChatHandler::new(client.clone())
                    .with_constraints(CompletionConstraints::from_config(&config.inference)),
            ),
        );
        registry.register(
            TaskLabel::DocumentQa,
            Arc::new(DocumentQaEngine::from_config(
                Arc::clone(&index),
                client.clone(),
                &config.document_qa,
            )),
        );
        register_stub_agents(&mut registry);

        let stores = ConversationStores::new(db);
        let classifier = TaskClassifier::from_config(client, &config.classifier);
        let router = Router::from_config(stores.clone(), classifier, registry, &config);

        Ok(Self {
            config,
            stores,
            index,
            router,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_core::types::Document;

    #[tokio::test]
    async fn test_open_persists_index_and_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConciergeConfig::default();
        config.general.data_dir = dir.path().to_string_lossy().to_string();

        {
            let app = App::open(config.clone()).unwrap();
            app.index
                .ingest(Document::new("geo", "The capital of France is Paris."))
                .await
                .unwrap();
            app.router.handle("hi there", "conv-1").await.unwrap();
        }

        let app = App::open(config).unwrap();
        assert_eq!(app.index.document_ids(), vec!["geo".to_string()]);
        assert_eq!(app.stores.load("conv-1").unwrap().len().unwrap(), 1);

        let routed = app
            .router
            .handle("What is the capital of France?", "conv-1")
            .await
            .unwrap();
        assert_eq!(routed.answer.task_label, TaskLabel::DocumentQa);
        assert!(routed.answer.text.contains("Paris"));
    }

    #[tokio::test]
    async fn test_stub_agents_are_routed() {
        let app = App::in_memory(ConciergeConfig::default()).unwrap();
        let routed = app
            .router
            .handle("What's the weather like in Paris?", "conv-1")
            .await
            .unwrap();
        assert_eq!(routed.answer.task_label, TaskLabel::Weather);
        assert!(routed.answer.text.contains("Paris"));
    }

    #[tokio::test]
    async fn test_documents_dir_is_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("documents");
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(docs.join("france facts.txt"), "The capital of France is Paris.").unwrap();
        std::fs::write(docs.join("broken.pdf"), b"not a pdf").unwrap();

        let mut config = ConciergeConfig::default();
        config.document_qa.documents_dir = docs.to_string_lossy().to_string();
        let app = App::in_memory(config).unwrap();

        let report = app.index_documents_dir().await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.ingested.len(), 1);
        assert_eq!(report.ingested[0].0, "france-facts.txt");

        let routed = app
            .router
            .handle("What is the capital of France?", "conv-1")
            .await
            .unwrap();
        assert!(routed.answer.text.contains("Paris"));
    }

    #[tokio::test]
    async fn test_missing_documents_dir_is_skipped() {
        let mut config = ConciergeConfig::default();
        config.document_qa.documents_dir = "/nonexistent/concierge-docs".to_string();
        let app = App::in_memory(config).unwrap();

        let report = app.index_documents_dir().await;
        assert!(report.ingested.is_empty());
        assert_eq!(report.failures, 0);
        assert!(app.index.is_empty());
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut config = ConciergeConfig::default();
        config.inference.provider = "oracle".to_string();
        assert!(App::in_memory(config).is_err());
    }
}
