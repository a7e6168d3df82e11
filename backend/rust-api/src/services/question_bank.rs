use anyhow::Context;
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Collection, Database};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use super::session_store::StoreError;
use crate::metrics::track_store_operation;
use crate::models::Subject;

/// Read-only view of the question bank collaborator: resolves access codes and
/// serves the subject with its ordered items.
#[async_trait]
pub trait QuestionBank: Send + Sync {
    async fn resolve_code(&self, code: &str) -> Result<Option<String>, StoreError>;

    async fn subject(&self, subject_id: &str) -> Result<Option<Subject>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryQuestionBank {
    subjects: RwLock<HashMap<String, Subject>>,
}

impl InMemoryQuestionBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bank seeded from a JSON array of subject documents.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read subject seed {}", path.display()))?;
        let subjects: Vec<Subject> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid subject seed {}", path.display()))?;

        tracing::info!("Loaded {} subjects from {}", subjects.len(), path.display());
        let bank = Self::new();
        for subject in subjects {
            bank.insert(subject);
        }
        Ok(bank)
    }

    pub fn insert(&self, subject: Subject) {
        self.subjects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subject.id.clone(), subject);
    }
}

#[async_trait]
impl QuestionBank for InMemoryQuestionBank {
    async fn resolve_code(&self, code: &str) -> Result<Option<String>, StoreError> {
        let code = code.trim();
        let subjects = self
            .subjects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(subjects
            .values()
            .find(|subject| subject.code == code)
            .map(|subject| subject.id.clone()))
    }

    async fn subject(&self, subject_id: &str) -> Result<Option<Subject>, StoreError> {
        Ok(self
            .subjects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(subject_id)
            .cloned())
    }
}

/// Subjects stored in the `subjects` collection.
pub struct MongoQuestionBank {
    mongo: Database,
}

impl MongoQuestionBank {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn subjects(&self) -> Collection<Subject> {
        self.mongo.collection("subjects")
    }
}

#[async_trait]
impl QuestionBank for MongoQuestionBank {
    async fn resolve_code(&self, code: &str) -> Result<Option<String>, StoreError> {
        let subject = track_store_operation("find_one", "subjects", async {
            self.subjects()
                .find_one(doc! { "code": code.trim() })
                .await
                .context("Failed to resolve access code")
        })
        .await?;
        Ok(subject.map(|subject| subject.id))
    }

    async fn subject(&self, subject_id: &str) -> Result<Option<Subject>, StoreError> {
        let subject = track_store_operation("find_one", "subjects", async {
            self.subjects()
                .find_one(doc! { "_id": subject_id })
                .await
                .context("Failed to load subject")
        })
        .await?;
        Ok(subject)
    }
}
