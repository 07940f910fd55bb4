//! In-memory credential store.
//!
//! Mirrors the conditional-write semantics of [`super::postgres::PgStore`]:
//! inserts fail on an existing `(channel_name, version)` key, deletes fail
//! unless the stored token still matches. Data is lost on exit, so this is
//! meant for tests and local development.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::StoreError;
use crate::jobs::reconcile::ReconcileStore;
use crate::models::record::CredentialRecord;
use crate::service::token::TokenStore;

type Key = (String, i32);

#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<Key, CredentialRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn save(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
        let key = (rec.channel_name.clone(), rec.version);
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(StoreError::Conflict {
                channel_name: rec.channel_name.clone(),
                version: rec.version,
            });
        }
        records.insert(key, rec.clone());
        Ok(())
    }

    async fn query_by_channel_name(
        &self,
        channel_name: &str,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let records = self.records.read();
        let start = (channel_name.to_string(), i32::MIN);
        Ok(records
            .range(start..)
            .take_while(|((name, _), _)| name == channel_name)
            .map(|(_, rec)| rec.clone())
            .collect())
    }

    async fn delete(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
        let key = (rec.channel_name.clone(), rec.version);
        let mut records = self.records.write();
        match records.get(&key) {
            Some(stored) if stored.token == rec.token => {
                records.remove(&key);
                Ok(())
            }
            _ => Err(StoreError::NoMatch {
                channel_name: rec.channel_name.clone(),
                version: rec.version,
            }),
        }
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn scan_all(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }
}
