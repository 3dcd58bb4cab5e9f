//! Persistence collaborator for loan-application records.
//!
//! The conversational core only needs a durable identifier to reference
//! in the `document_verification_required` event; conversation state
//! itself is never persisted here.

use crate::error::{AgentError, Result};
use crate::extract::StructuredProfile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

/// A stored loan-application record.
#[derive(Debug, Clone)]
pub struct ApplicationRecord {
    /// Durable identifier.
    pub id: Uuid,
    /// Profile snapshot at creation time.
    pub profile: serde_json::Value,
    /// Creation timestamp.
    pub created_at: SystemTime,
}

/// Create/read access to loan-application records.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Create a record from the current profile, returning its id.
    async fn create(&self, profile: &StructuredProfile) -> Result<Uuid>;

    /// Fetch a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<ApplicationRecord>>;
}

/// In-memory store, sufficient for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<Uuid, ApplicationRecord>>,
}

#[async_trait]
impl ApplicationStore for InMemoryStore {
    async fn create(&self, profile: &StructuredProfile) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let record = ApplicationRecord {
            id,
            profile: profile.snapshot(),
            created_at: SystemTime::now(),
        };
        self.records
            .lock()
            .map_err(|_| AgentError::Store("store lock poisoned".to_owned()))?
            .insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApplicationRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| AgentError::Store("store lock poisoned".to_owned()))?
            .get(&id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::extract::FieldValue;

    #[tokio::test]
    async fn create_then_get_round_trip() {
        let store = InMemoryStore::default();
        let mut profile = StructuredProfile::default();
        profile.set("name", FieldValue::Text("Alice".to_owned()));

        let id = store.create(&profile).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.profile["name"], "Alice");
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let store = InMemoryStore::default();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
