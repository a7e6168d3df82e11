use crate::config::{Config, StorageBackend};
use crate::utils::retry::{retry_async_with_config, RetryConfig};
use anyhow::Context;
use mongodb::{Client as MongoClient, Database};
use std::path::Path;
use std::sync::Arc;

use question_bank::{InMemoryQuestionBank, MongoQuestionBank, QuestionBank};
use session_service::SessionService;
use session_store::{InMemorySessionStore, SessionStore};

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionService>,
    /// Present only with the Mongo backend; used by the health check
    pub mongo: Option<Database>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        match config.storage_backend {
            StorageBackend::Mongo => {
                let mongo_client = MongoClient::with_uri_str(&config.mongo_uri)
                    .await
                    .context("Failed to connect to MongoDB")?;
                let mongo = mongo_client.database(&config.mongo_database);

                retry_async_with_config(RetryConfig::default(), || ping(&mongo))
                    .await
                    .context("MongoDB did not answer ping")?;

                tracing::info!("MongoDB connection established successfully");

                let store: Arc<dyn SessionStore> =
                    Arc::new(mongo_store::MongoSessionStore::new(mongo.clone()));
                let bank: Arc<dyn QuestionBank> = Arc::new(MongoQuestionBank::new(mongo.clone()));

                Ok(Self {
                    config,
                    sessions: Arc::new(SessionService::new(store, bank)),
                    mongo: Some(mongo),
                })
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory session storage; nothing survives a restart");
                let bank = match config.seed_path.as_deref() {
                    Some(path) if Path::new(path).exists() => InMemoryQuestionBank::load(path)?,
                    Some(path) => {
                        tracing::warn!(
                            "Subject seed {} not found; no access code will resolve",
                            path
                        );
                        InMemoryQuestionBank::new()
                    }
                    None => InMemoryQuestionBank::new(),
                };
                Ok(Self::in_memory(config, Arc::new(bank)))
            }
        }
    }

    pub fn in_memory(config: Config, bank: Arc<InMemoryQuestionBank>) -> Self {
        Self::with_store(config, Arc::new(InMemorySessionStore::new()), bank)
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn SessionStore>,
        bank: Arc<dyn QuestionBank>,
    ) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionService::new(store, bank)),
            mongo: None,
        }
    }
}

async fn ping(mongo: &Database) -> anyhow::Result<()> {
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        mongo.run_command(mongodb::bson::doc! { "ping": 1 }),
    )
    .await
    .map_err(|_| anyhow::anyhow!("MongoDB ping timeout after 5s"))??;
    Ok(())
}

pub mod mongo_store;
pub mod question_bank;
pub mod session_service;
pub mod session_store;
