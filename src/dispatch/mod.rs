//! The dispatch core: per-endpoint runtime state, token-bucket admission,
//! health probing, candidate selection and the failover walk.

pub mod bucket;
pub mod health;
pub mod manager;
pub mod registry;
pub mod state;
pub mod status;

pub use manager::{ChatOutcome, ProviderManager};
pub use registry::EndpointRegistry;
pub use status::{EndpointStatus, HealthSampleView};

use crate::clients::ClientError;
use crate::storage::StoreError;

/// Errors surfaced by the dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("no LLM endpoints configured")]
    NotConfigured,

    #[error("no available LLM endpoint")]
    NoAvailableEndpoint,

    /// First concrete upstream error observed during an exhausted walk.
    #[error("all LLM endpoints failed: {0}")]
    AllEndpointsFailed(#[source] ClientError),

    /// The walk ran but every candidate was skipped by a gate.
    #[error("LLM call failed without a concrete error")]
    NoConcreteError,

    /// Caller cancellation, returned verbatim; never counted against an
    /// endpoint.
    #[error("request cancelled by caller")]
    Cancelled,

    #[error("lifecycle error: {0}")]
    Lifecycle(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
