//! Credential store adapters.
//!
//! The contracts these adapters satisfy live next to their consumers:
//! [`crate::service::token::TokenStore`] and
//! [`crate::jobs::reconcile::ReconcileStore`].

pub mod memory;
pub mod postgres;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional insert lost: the `(channel_name, version)` key exists.
    #[error("record already exists: channel_name={channel_name}, version={version}")]
    Conflict { channel_name: String, version: i32 },

    /// Conditional delete removed nothing: key missing or token changed.
    #[error("no matching record: channel_name={channel_name}, version={version}")]
    NoMatch { channel_name: String, version: i32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
