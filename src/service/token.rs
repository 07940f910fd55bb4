//! Token lifecycle: issue, rotate, verify and revoke per-channel tokens.
//!
//! Stateless over the injected [`TokenStore`]. Every operation opens with a
//! fresh read of the channel's records and performs at most one write, so
//! the store's conditional writes are what arbitrate concurrent callers.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::models::record::{CredentialRecord, Entry};
use crate::store::StoreError;

/// At most this many records may share a channel name.
pub const MAX_TOKEN_COUNT: usize = 2;

const TOKEN_BYTES: usize = 16;

/// One initial attempt plus three retries on collision.
const MAX_GENERATION_ATTEMPTS: usize = 4;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert. Fails with [`StoreError::Conflict`] if the
    /// `(channel_name, version)` key already exists.
    async fn save(&self, rec: &CredentialRecord) -> Result<(), StoreError>;

    /// All records for a name, empty when none. Order is not guaranteed.
    async fn query_by_channel_name(
        &self,
        channel_name: &str,
    ) -> Result<Vec<CredentialRecord>, StoreError>;

    /// Delete conditioned on `(channel_name, version)` still holding `token`.
    async fn delete(&self, rec: &CredentialRecord) -> Result<(), StoreError>;
}

pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> Result<String, AppError>;
}

/// 16 bytes from the OS CSPRNG, hex-encoded.
pub struct OsRngGenerator;

impl TokenGenerator for OsRngGenerator {
    fn generate(&self) -> Result<String, AppError> {
        let mut buf = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| AppError::TokenGeneration(format!("secure random source failed: {}", e)))?;
        Ok(hex::encode(buf))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    NotFound,
    Unmatch,
    Matched {
        channel_id: String,
        channel_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResult {
    pub token: String,
    /// False when an existing token was returned instead.
    pub is_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerateResult {
    NoTokenFound,
    TooManyToken,
    Generated { token: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeResult {
    NotFound,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeRenamedResult {
    NotFound,
    ChannelIdUnmatch { linked_channel_id: String },
    Revoked,
}

#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn TokenStore>,
    generator: Arc<dyn TokenGenerator>,
}

impl TokenService {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self::with_generator(store, Arc::new(OsRngGenerator))
    }

    pub fn with_generator(store: Arc<dyn TokenStore>, generator: Arc<dyn TokenGenerator>) -> Self {
        Self { store, generator }
    }

    /// Query ordered by version. Store order is not relied upon.
    async fn records(&self, channel_name: &str) -> Result<Vec<CredentialRecord>, AppError> {
        let mut recs = self.store.query_by_channel_name(channel_name).await?;
        recs.sort_by_key(|rec| rec.version);
        Ok(recs)
    }

    pub async fn get_tokens(&self, channel_name: &str) -> Result<Vec<Entry>, AppError> {
        self.records(channel_name)
            .await?
            .iter()
            .map(Entry::try_from)
            .collect()
    }

    /// Hot path of every relayed webhook. Compares against every stored
    /// token in constant time without stopping at the first match.
    #[tracing::instrument(skip(self, given_token))]
    pub async fn verify_token(
        &self,
        channel_name: &str,
        given_token: &str,
    ) -> Result<VerifyResult, AppError> {
        let recs = self.store.query_by_channel_name(channel_name).await?;
        if recs.is_empty() {
            return Ok(VerifyResult::NotFound);
        }

        let mut matched: Option<&CredentialRecord> = None;
        for rec in &recs {
            let eq: bool = rec.token.as_bytes().ct_eq(given_token.as_bytes()).into();
            if eq && matched.is_none() {
                matched = Some(rec);
            }
        }

        Ok(match matched {
            Some(rec) => VerifyResult::Matched {
                channel_id: rec.channel_id.clone(),
                channel_name: rec.channel_name.clone(),
            },
            None => VerifyResult::Unmatch,
        })
    }

    /// Idempotent create: an existing token for the name is returned as-is.
    #[tracing::instrument(skip(self))]
    pub async fn generate_and_save_token(
        &self,
        channel_id: &str,
        channel_name: &str,
    ) -> Result<GenerateResult, AppError> {
        let recs = self.records(channel_name).await?;
        if let Some(rec) = recs.first() {
            return Ok(GenerateResult {
                token: rec.token.clone(),
                is_generated: false,
            });
        }

        let token = self.generator.generate()?;
        let rec = CredentialRecord::new(channel_id, channel_name, token.clone(), 0);
        self.store.save(&rec).await?;
        tracing::info!(channel_id, channel_name, "token generated");

        Ok(GenerateResult {
            token,
            is_generated: true,
        })
    }

    /// Adds a second token for rotation. Users hold at most
    /// [`MAX_TOKEN_COUNT`] tokens per channel name.
    #[tracing::instrument(skip(self))]
    pub async fn regenerate_token(
        &self,
        channel_id: &str,
        channel_name: &str,
    ) -> Result<RegenerateResult, AppError> {
        let recs = self.records(channel_name).await?;
        let latest = match recs.last() {
            Some(rec) => rec,
            None => return Ok(RegenerateResult::NoTokenFound),
        };
        if recs.len() >= MAX_TOKEN_COUNT {
            return Ok(RegenerateResult::TooManyToken);
        }

        let token = generate_with_retry(&recs, self.generator.as_ref())?;
        let rec = CredentialRecord::new(channel_id, channel_name, token.clone(), latest.version + 1);
        self.store.save(&rec).await?;
        tracing::info!(channel_id, channel_name, version = rec.version, "token regenerated");

        Ok(RegenerateResult::Generated { token })
    }

    /// Administrative deletion by a member of the owning channel. Plain
    /// equality: the caller already holds the token.
    #[tracing::instrument(skip(self, given_token))]
    pub async fn revoke_token(
        &self,
        channel_name: &str,
        given_token: &str,
    ) -> Result<RevokeResult, AppError> {
        let recs = self.records(channel_name).await?;
        let Some(rec) = recs.iter().find(|rec| rec.token == given_token) else {
            return Ok(RevokeResult::NotFound);
        };

        self.store.delete(rec).await?;
        tracing::info!(channel_name, version = rec.version, "token revoked");
        Ok(RevokeResult::Revoked)
    }

    /// Revokes a token left under a channel name by a different channel
    /// identity. A record linked to the caller's own channel id is refused;
    /// it goes through [`Self::revoke_token`] instead.
    #[tracing::instrument(skip(self, given_token))]
    pub async fn revoke_renamed_token(
        &self,
        channel_id: &str,
        given_channel_name: &str,
        given_token: &str,
    ) -> Result<RevokeRenamedResult, AppError> {
        let recs = self.records(given_channel_name).await?;
        let Some(rec) = recs.iter().find(|rec| rec.token == given_token) else {
            return Ok(RevokeRenamedResult::NotFound);
        };

        if rec.channel_id == channel_id {
            return Ok(RevokeRenamedResult::ChannelIdUnmatch {
                linked_channel_id: rec.channel_id.clone(),
            });
        }

        self.store.delete(rec).await?;
        tracing::info!(
            channel_id,
            channel_name = given_channel_name,
            linked_channel_id = %rec.channel_id,
            version = rec.version,
            "renamed token revoked"
        );
        Ok(RevokeRenamedResult::Revoked)
    }
}

/// Draws a token distinct from every existing one. Repeated collisions on
/// 128-bit tokens mean the random source is broken, so exhaustion is fatal.
fn generate_with_retry(
    existing: &[CredentialRecord],
    generator: &dyn TokenGenerator,
) -> Result<String, AppError> {
    for attempt in 1..=MAX_GENERATION_ATTEMPTS {
        let token = generator.generate()?;
        if existing.iter().all(|rec| rec.token != token) {
            return Ok(token);
        }
        tracing::warn!(attempt, "generated token collides with an existing token");
    }
    Err(AppError::TokenGeneration(format!(
        "same token generated {} times in a row",
        MAX_GENERATION_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHANNEL_ID: &str = "C03T4AU1755";
    const CHANNEL_NAME: &str = "random";
    const ANOTHER_CHANNEL_NAME: &str = "general";
    const TOKEN: &str = "test token";

    fn service() -> (MemoryStore, TokenService) {
        let store = MemoryStore::new();
        let svc = TokenService::new(Arc::new(store.clone()));
        (store, svc)
    }

    fn record(channel_id: &str, version: i32, token: &str) -> CredentialRecord {
        CredentialRecord::new(channel_id, CHANNEL_NAME, token.to_string(), version)
    }

    /// Returns query results newest-first.
    struct ReversedStore(MemoryStore);

    #[async_trait]
    impl TokenStore for ReversedStore {
        async fn save(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
            self.0.save(rec).await
        }
        async fn query_by_channel_name(
            &self,
            channel_name: &str,
        ) -> Result<Vec<CredentialRecord>, StoreError> {
            let mut recs = self.0.query_by_channel_name(channel_name).await?;
            recs.reverse();
            Ok(recs)
        }
        async fn delete(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
            self.0.delete(rec).await
        }
    }

    /// Serves a read that misses records written by a concurrent caller.
    struct StaleReadStore(MemoryStore);

    #[async_trait]
    impl TokenStore for StaleReadStore {
        async fn save(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
            self.0.save(rec).await
        }
        async fn query_by_channel_name(
            &self,
            channel_name: &str,
        ) -> Result<Vec<CredentialRecord>, StoreError> {
            let mut recs = self.0.query_by_channel_name(channel_name).await?;
            recs.retain(|rec| rec.version == 0);
            Ok(recs)
        }
        async fn delete(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
            self.0.delete(rec).await
        }
    }

    struct FixedGenerator {
        token: &'static str,
        calls: AtomicUsize,
    }

    impl FixedGenerator {
        fn new(token: &'static str) -> Self {
            Self {
                token,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TokenGenerator for FixedGenerator {
        fn generate(&self) -> Result<String, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.to_string())
        }
    }

    struct BrokenGenerator;

    impl TokenGenerator for BrokenGenerator {
        fn generate(&self) -> Result<String, AppError> {
            Err(AppError::TokenGeneration("entropy source unavailable".into()))
        }
    }

    #[test]
    fn test_os_rng_token_shape() {
        let token = OsRngGenerator.generate().unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, OsRngGenerator.generate().unwrap());
    }

    #[tokio::test]
    async fn test_generate_and_save_token_new() {
        let (store, svc) = service();

        let res = svc.generate_and_save_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();
        assert!(res.is_generated);

        let recs = store.query_by_channel_name(CHANNEL_NAME).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].token, res.token);
        assert_eq!(recs[0].version, 0);
        assert_eq!(recs[0].channel_id, CHANNEL_ID);
    }

    #[tokio::test]
    async fn test_generate_and_save_token_again() {
        let (store, svc) = service();

        let first = svc.generate_and_save_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();
        let second = svc.generate_and_save_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();

        assert_eq!(second.token, first.token);
        assert!(!second.is_generated);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_fails_on_broken_entropy() {
        let store = MemoryStore::new();
        let svc = TokenService::with_generator(Arc::new(store.clone()), Arc::new(BrokenGenerator));

        let err = svc.generate_and_save_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap_err();
        assert!(matches!(err, AppError::TokenGeneration(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_verify_token() {
        let (store, svc) = service();
        store.save(&record(CHANNEL_ID, 0, TOKEN)).await.unwrap();

        let res = svc.verify_token(ANOTHER_CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, VerifyResult::NotFound);

        let res = svc.verify_token(CHANNEL_NAME, "invalid token").await.unwrap();
        assert_eq!(res, VerifyResult::Unmatch);

        let res = svc.verify_token(CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(
            res,
            VerifyResult::Matched {
                channel_id: CHANNEL_ID.into(),
                channel_name: CHANNEL_NAME.into(),
            }
        );
    }

    #[tokio::test]
    async fn test_verify_token_multiple_records() {
        let (store, svc) = service();
        store.save(&record(CHANNEL_ID, 0, TOKEN)).await.unwrap();
        store.save(&record(CHANNEL_ID, 1, "test token 2")).await.unwrap();

        for token in [TOKEN, "test token 2"] {
            let res = svc.verify_token(CHANNEL_NAME, token).await.unwrap();
            assert!(matches!(res, VerifyResult::Matched { ref channel_id, .. } if channel_id == CHANNEL_ID));
        }
        let res = svc.verify_token(CHANNEL_NAME, "test token").await.unwrap();
        assert!(matches!(res, VerifyResult::Matched { .. }));
        let res = svc.verify_token(CHANNEL_NAME, "test token 3").await.unwrap();
        assert_eq!(res, VerifyResult::Unmatch);
    }

    #[tokio::test]
    async fn test_verify_token_prefix_does_not_match() {
        let (store, svc) = service();
        store.save(&record(CHANNEL_ID, 0, "deadbeef")).await.unwrap();

        assert_eq!(svc.verify_token(CHANNEL_NAME, "dead").await.unwrap(), VerifyResult::Unmatch);
        assert_eq!(svc.verify_token(CHANNEL_NAME, "").await.unwrap(), VerifyResult::Unmatch);
    }

    #[tokio::test]
    async fn test_regenerate_token() {
        let (store, svc) = service();

        let res = svc.regenerate_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();
        assert_eq!(res, RegenerateResult::NoTokenFound);

        store.save(&record(CHANNEL_ID, 0, TOKEN)).await.unwrap();
        let res = svc.regenerate_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();
        let RegenerateResult::Generated { token } = res else {
            panic!("expected a generated token, got {:?}", res);
        };
        assert_ne!(token, TOKEN);

        let recs = store.query_by_channel_name(CHANNEL_NAME).await.unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].version, 0);
        assert_eq!(recs[1].version, 1);
        assert_eq!(recs[1].token, token);

        let res = svc.regenerate_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();
        assert_eq!(res, RegenerateResult::TooManyToken);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_regenerate_uses_highest_version_regardless_of_store_order() {
        let inner = MemoryStore::new();
        let svc = TokenService::new(Arc::new(ReversedStore(inner.clone())));

        // A v0 revoked earlier leaves only v1 behind.
        inner.save(&record(CHANNEL_ID, 1, TOKEN)).await.unwrap();
        svc.regenerate_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();

        let recs = inner.query_by_channel_name(CHANNEL_NAME).await.unwrap();
        let versions: Vec<_> = recs.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_get_tokens_sorted_by_version() {
        let inner = MemoryStore::new();
        let svc = TokenService::new(Arc::new(ReversedStore(inner.clone())));
        inner.save(&record(CHANNEL_ID, 0, "a")).await.unwrap();
        inner.save(&record(CHANNEL_ID, 1, "b")).await.unwrap();

        let entries = svc.get_tokens(CHANNEL_NAME).await.unwrap();
        let tokens: Vec<_> = entries.iter().map(|e| e.token.as_str()).collect();
        assert_eq!(tokens, vec!["a", "b"]);
        assert!(svc.get_tokens(ANOTHER_CHANNEL_NAME).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_tokens_surfaces_corrupted_timestamp() {
        let (store, svc) = service();
        let mut rec = record(CHANNEL_ID, 0, TOKEN);
        rec.created_at = "not a timestamp".into();
        store.save(&rec).await.unwrap();

        let err = svc.get_tokens(CHANNEL_NAME).await.unwrap_err();
        assert!(matches!(err, AppError::CorruptedRecord { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_regenerate_conflicts() {
        let inner = MemoryStore::new();
        inner.save(&record(CHANNEL_ID, 0, TOKEN)).await.unwrap();
        inner.save(&record(CHANNEL_ID, 1, "winner")).await.unwrap();
        let svc = TokenService::new(Arc::new(StaleReadStore(inner.clone())));

        let err = svc.regenerate_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap_err();
        assert!(err.is_conflict());

        let recs = inner.query_by_channel_name(CHANNEL_NAME).await.unwrap();
        assert_eq!(recs[1].token, "winner");
    }

    #[tokio::test]
    async fn test_regenerate_fails_when_generator_repeats() {
        let store = MemoryStore::new();
        let generator = Arc::new(FixedGenerator::new("same token"));
        let svc = TokenService::with_generator(Arc::new(store.clone()), generator.clone());

        let first = svc.generate_and_save_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap();
        assert_eq!(first.token, "same token");

        let err = svc.regenerate_token(CHANNEL_ID, CHANNEL_NAME).await.unwrap_err();
        assert!(matches!(err, AppError::TokenGeneration(_)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1 + MAX_GENERATION_ATTEMPTS);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_generate_with_retry() {
        let generator = FixedGenerator::new("same token");
        let mut recs = vec![record(CHANNEL_ID, 0, TOKEN), record(CHANNEL_ID, 1, "another token")];
        assert_eq!(generate_with_retry(&recs, &generator).unwrap(), "same token");

        recs.push(record(CHANNEL_ID, 2, "same token"));
        assert!(generate_with_retry(&recs, &generator).is_err());
    }

    #[tokio::test]
    async fn test_revoke_token() {
        let (store, svc) = service();

        let res = svc.revoke_token(CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, RevokeResult::NotFound);

        store.save(&record(CHANNEL_ID, 0, TOKEN)).await.unwrap();
        store.save(&record(CHANNEL_ID, 1, "kept")).await.unwrap();

        let res = svc.revoke_token(CHANNEL_NAME, "unknown").await.unwrap();
        assert_eq!(res, RevokeResult::NotFound);

        let res = svc.revoke_token(CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, RevokeResult::Revoked);

        let res = svc.verify_token(CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, VerifyResult::Unmatch);
        let res = svc.verify_token(CHANNEL_NAME, "kept").await.unwrap();
        assert!(matches!(res, VerifyResult::Matched { .. }));
    }

    #[tokio::test]
    async fn test_revoke_last_token_leaves_name_unregistered() {
        let (store, svc) = service();
        store.save(&record(CHANNEL_ID, 0, TOKEN)).await.unwrap();

        svc.revoke_token(CHANNEL_NAME, TOKEN).await.unwrap();
        let res = svc.verify_token(CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, VerifyResult::NotFound);
    }

    #[tokio::test]
    async fn test_revoke_renamed_token() {
        let (store, svc) = service();
        let old_channel_id = "C0OLD";

        let res = svc.revoke_renamed_token(CHANNEL_ID, CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, RevokeRenamedResult::NotFound);

        store.save(&record(old_channel_id, 0, TOKEN)).await.unwrap();

        let res = svc.revoke_renamed_token(CHANNEL_ID, CHANNEL_NAME, "other").await.unwrap();
        assert_eq!(res, RevokeRenamedResult::NotFound);

        let res = svc.revoke_renamed_token(old_channel_id, CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(
            res,
            RevokeRenamedResult::ChannelIdUnmatch {
                linked_channel_id: old_channel_id.into()
            }
        );
        assert_eq!(store.len(), 1);

        let res = svc.revoke_renamed_token(CHANNEL_ID, CHANNEL_NAME, TOKEN).await.unwrap();
        assert_eq!(res, RevokeRenamedResult::Revoked);
        assert!(store.is_empty());
    }
}
