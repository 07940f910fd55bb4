use async_trait::async_trait;
use sqlx::PgPool;

use super::StoreError;
use crate::jobs::reconcile::ReconcileStore;
use crate::models::record::CredentialRecord;
use crate::service::token::TokenStore;

const SCAN_PAGE_SIZE: i64 = 500;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn save(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO credentials (channel_name, version, channel_id, token, created_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&rec.channel_name)
        .bind(rec.version)
        .bind(&rec.channel_id)
        .bind(&rec.token)
        .bind(&rec.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Conflict {
                channel_name: rec.channel_name.clone(),
                version: rec.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn query_by_channel_name(
        &self,
        channel_name: &str,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let rows = sqlx::query_as::<_, CredentialRecord>(
            "SELECT channel_name, version, channel_id, token, created_at FROM credentials WHERE channel_name = $1 ORDER BY version ASC",
        )
        .bind(channel_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete(&self, rec: &CredentialRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM credentials WHERE channel_name = $1 AND version = $2 AND token = $3",
        )
        .bind(&rec.channel_name)
        .bind(rec.version)
        .bind(&rec.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NoMatch {
                channel_name: rec.channel_name.clone(),
                version: rec.version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn scan_all(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let mut recs = Vec::new();
        let mut cursor = (String::new(), i32::MIN);

        loop {
            let page = sqlx::query_as::<_, CredentialRecord>(
                r#"SELECT channel_name, version, channel_id, token, created_at FROM credentials
                   WHERE (channel_name, version) > ($1, $2)
                   ORDER BY channel_name ASC, version ASC
                   LIMIT $3"#,
            )
            .bind(&cursor.0)
            .bind(cursor.1)
            .bind(SCAN_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;

            let last_page = (page.len() as i64) < SCAN_PAGE_SIZE;
            if let Some(last) = page.last() {
                cursor = (last.channel_name.clone(), last.version);
            }
            recs.extend(page);
            if last_page {
                break;
            }
        }

        tracing::debug!(size = recs.len(), "scanned credential table");
        Ok(recs)
    }
}
