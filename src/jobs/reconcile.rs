//! Reconciliation pass: compares stored credentials against the live Slack
//! channel list and notifies about drift.
//!
//! Three conditions are detected per run:
//!
//! * **archived**: the record's channel is archived upstream. Ops is told and
//!   the record is deleted.
//! * **migration**: two live tokens share a channel id and name, i.e. a
//!   rotation is in progress.
//! * **renamed**: the channel id now carries a different name than the one
//!   the record was created under.
//!
//! Nothing is remembered between runs. Every run derives its plan from the
//! current store and directory state, so an aborted run is simply re-run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time;

use crate::errors::AppError;
use crate::metrics;
use crate::models::channel::{Channel, PostMessageResult};
use crate::models::record::CredentialRecord;
use crate::service::token::TokenStore;
use crate::store::StoreError;

#[async_trait]
pub trait ReconcileStore: TokenStore {
    /// Full table read. Pagination is the adapter's business.
    async fn scan_all(&self) -> Result<Vec<CredentialRecord>, StoreError>;
}

#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Every conversation visible to the bot, archived ones included.
    async fn list_channels(&self) -> Result<Vec<Channel>, AppError>;

    /// `channel` may be an id or a name. `channel_name` is only used to
    /// describe rejections.
    async fn post_message(
        &self,
        channel: &str,
        channel_name: &str,
        payload: Map<String, Value>,
    ) -> Result<PostMessageResult, AppError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEvent {
    pub record: CredentialRecord,
    pub slack_channel_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameEvent {
    pub channel_id: String,
    pub old_name: String,
    pub new_name: String,
    pub saved_token: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub archived: Vec<ArchiveEvent>,
    /// One representative record per channel name in migration.
    pub migrations: Vec<CredentialRecord>,
    pub renames: Vec<RenameEvent>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.archived.is_empty() && self.migrations.is_empty() && self.renames.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub archived: usize,
    pub migrations: usize,
    pub renames: usize,
}

/// Classifies every record against the directory listing.
///
/// Records of archived channels land only in `archived` and are not
/// considered for migration or rename.
pub fn plan(records: &[CredentialRecord], channels: &[Channel]) -> ReconcilePlan {
    let by_id: BTreeMap<&str, &Channel> = channels.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut archived = Vec::new();
    let mut live = Vec::with_capacity(records.len());
    for rec in records {
        match by_id.get(rec.channel_id.as_str()) {
            Some(channel) if channel.is_archived => archived.push(ArchiveEvent {
                record: rec.clone(),
                slack_channel_name: channel.name.clone(),
            }),
            _ => live.push(rec),
        }
    }

    let mut migrations: BTreeMap<&str, &CredentialRecord> = BTreeMap::new();
    let mut renames = Vec::new();
    for &rec in &live {
        let rotating = live.iter().any(|other| {
            other.channel_id == rec.channel_id
                && other.channel_name == rec.channel_name
                && other.token != rec.token
        });
        if rotating {
            migrations.insert(rec.channel_name.as_str(), rec);
        }

        if let Some(channel) = by_id.get(rec.channel_id.as_str()) {
            if channel.name != rec.channel_name {
                renames.push(RenameEvent {
                    channel_id: rec.channel_id.clone(),
                    old_name: rec.channel_name.clone(),
                    new_name: channel.name.clone(),
                    saved_token: rec.token.clone(),
                });
            }
        }
    }

    ReconcilePlan {
        archived,
        migrations: migrations.into_values().cloned().collect(),
        renames,
    }
}

pub struct Reconciler {
    store: Arc<dyn ReconcileStore>,
    directory: Arc<dyn ChannelDirectory>,
    ops_channel: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        directory: Arc<dyn ChannelDirectory>,
        ops_channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            ops_channel: ops_channel.into(),
        }
    }

    /// One full pass. Any store, listing or notification failure aborts the
    /// run with the error; side effects already applied stay applied.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<ReconcileReport, AppError> {
        let records = self.store.scan_all().await?;
        tracing::info!(size = records.len(), "target record size");

        let channels = self.directory.list_channels().await?;
        tracing::info!(size = channels.len(), "target channel size");

        let plan = plan(&records, &channels);

        tracing::info!(size = plan.archived.len(), "processing archived channels");
        for event in &plan.archived {
            let rec = &event.record;
            tracing::info!(
                channel_id = %rec.channel_id,
                record_channel_name = %rec.channel_name,
                slack_channel_name = %event.slack_channel_name,
                "channel is archived, deleting"
            );
            let msg = format!(
                "Channel is archived, deleting record: channel_id={}, record_channel_name={}, slack_channel_name={}\n",
                rec.channel_id, rec.channel_name, event.slack_channel_name
            );
            self.notify_ops(&msg).await?;
            self.store.delete(rec).await?;
            metrics::record_reconcile_event("archived");
        }

        tracing::info!(size = plan.migrations.len(), "processing migrations");
        for rec in &plan.migrations {
            tracing::info!(
                channel_id = %rec.channel_id,
                channel_name = %rec.channel_name,
                "token is in migration"
            );
            let msg_ops = format!(
                "Token is in migration: channel_name={}, channel_id={}\n",
                rec.channel_name, rec.channel_id
            );
            let msg = format!(
                "Token is in migration. Once all old webhook URLs are replaced, revoke old token: channel_name={}, channel_id={}\n",
                rec.channel_name, rec.channel_id
            );
            self.notify(&rec.channel_id, &rec.channel_name, &msg, &msg_ops).await?;
            metrics::record_reconcile_event("migration");
        }

        tracing::info!(size = plan.renames.len(), "processing renames");
        for evt in &plan.renames {
            tracing::info!(
                channel_id = %evt.channel_id,
                old_channel_name = %evt.old_name,
                renamed_channel_name = %evt.new_name,
                "channel name and channel id pair updated"
            );
            let msg_ops = format!(
                "Channel name and channel id pair updated: channel_id={}, old_channel_name={}, renamed_channel_name={}\n",
                evt.channel_id, evt.old_name, evt.new_name
            );
            let msg = rename_message(evt);
            self.notify(&evt.channel_id, &evt.new_name, &msg, &msg_ops).await?;
            metrics::record_reconcile_event("renamed");
        }

        tracing::info!("reconciliation completed");
        Ok(ReconcileReport {
            archived: plan.archived.len(),
            migrations: plan.migrations.len(),
            renames: plan.renames.len(),
        })
    }

    async fn notify(
        &self,
        channel: &str,
        channel_name: &str,
        msg: &str,
        msg_ops: &str,
    ) -> Result<(), AppError> {
        let result = self.directory.post_message(channel, channel_name, text_payload(msg)).await?;
        handle_post_message_failure(result)?;
        self.notify_ops(msg_ops).await
    }

    async fn notify_ops(&self, msg: &str) -> Result<(), AppError> {
        // chat.postMessage accepts a channel name in place of an id.
        let result = self
            .directory
            .post_message(&self.ops_channel, &self.ops_channel, text_payload(msg))
            .await?;
        handle_post_message_failure(result)
    }
}

fn rename_message(evt: &RenameEvent) -> String {
    format!(
        "\nDetected channel renaming for this channel: channel_id={}, old_channel_name={}, renamed_channel_name={}\n\n\
         1. Generate new token in this channel.\n\
         2. Replace old webhook URLs with new URLs.\n\
         3. When all old URLs are replaced, have the old token revoked: channel_name={}, token={}\n",
        evt.channel_id, evt.old_name, evt.new_name, evt.old_name, evt.saved_token
    )
}

fn text_payload(msg: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("text".to_string(), Value::String(msg.to_string()));
    payload
}

pub fn handle_post_message_failure(result: PostMessageResult) -> Result<(), AppError> {
    match result {
        PostMessageResult::Ok => Ok(()),
        PostMessageResult::Timeout => Err(AppError::Slack("slack server timeout".into())),
        PostMessageResult::ServerFailure { status, body } => Err(AppError::Slack(format!(
            "slack server error: status={}, body={}",
            status, body
        ))),
        PostMessageResult::Rejected {
            reason,
            channel_id,
            channel_name,
        } => Err(AppError::Slack(format!(
            "slack API error: channel_name={}, channel_id={}, reason={}",
            channel_name, channel_id, reason
        ))),
    }
}

/// Spawn the periodic reconciliation task. Call this once at startup.
pub fn spawn(reconciler: Arc<Reconciler>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match reconciler.run().await {
                Ok(report) => tracing::debug!(?report, "reconcile job finished"),
                Err(e) => tracing::error!("reconcile job failed: {}", e),
            }
        }
    });
}
