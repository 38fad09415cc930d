// src/error.rs

//! Error taxonomy for the pipeline layers.
//!
//! Library modules return these typed errors; configuration loading and the
//! binaries use `anyhow` on top.

use thiserror::Error;

/// Failure to retrieve a URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection failure or a non-success status that is not a block.
    #[error("network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        /// Whether a direct retry can reasonably succeed (connect errors, 5xx).
        retryable: bool,
    },

    /// The remote refused us (HTTP 403/429).
    #[error("blocked by {url} (HTTP {status})")]
    Blocked { url: String, status: u16 },

    /// The request exceeded the configured timeout.
    #[error("timed out fetching {url}")]
    Timeout { url: String },
}

impl FetchError {
    pub fn network(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            message: message.to_string(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Blocked { .. } => false,
        }
    }
}

/// Failure of the relational store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store cannot be reached. Aborts the current run.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict on {entity}: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }
}

/// Failure of the text-inference collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference disabled")]
    Disabled,

    #[error("inference daily limit of {0} calls reached")]
    Limited(u32),

    #[error("inference transport error: {0}")]
    Transport(String),
}

/// Failure of the candidate extractor for one article.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The inference response could not be read as the candidate schema.
    /// The article is still marked processed.
    #[error("malformed inference response for {url}: {reason}")]
    Malformed { url: String, reason: String },

    /// The inference call itself failed; no receipt was written.
    #[error("inference unavailable for {url}: {source}")]
    Inference {
        url: String,
        #[source]
        source: InferenceError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of the canonicalizer.
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("candidate title has no usable characters: {0:?}")]
    EmptyTitle(String),

    #[error("merge chain starting at {0} does not terminate")]
    MergeCycle(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of the notification matcher or dispatcher.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("release {0} is not approved")]
    NotApproved(String),

    #[error("release {id} is merged into {into}")]
    Merged { id: String, into: String },

    #[error("send to customer {customer_id} failed: {message}")]
    Send {
        customer_id: String,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that stop a processing run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
