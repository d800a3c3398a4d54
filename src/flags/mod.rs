//! The feature-flag subsystem: cached definitions, deterministic local
//! evaluation, remote fallback, and the background definitions poller.

mod cohorts;
mod eval;
mod facade;
mod hasher;
mod matcher;
mod models;
mod poller;
mod remote;
mod store;

pub use facade::FlagOptions;
pub use models::{FlagResult, FlagValue};

pub(crate) use facade::{flag_called_properties, FeatureFlags};
pub(crate) use poller::{DefinitionsFetcher, DefinitionsPoller};
pub(crate) use store::FlagDefinitionStore;

/// Local-evaluation failure modes. Both are recoverable: the facade falls
/// back to remote evaluation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlagError {
    /// The answer could not be determined locally (missing property,
    /// invalid pattern, unparseable date). The evaluator may try the next
    /// condition group.
    #[error("inconclusive match: {0}")]
    Inconclusive(String),

    /// The definition needs state only the server has (static cohorts,
    /// experience continuity).
    #[error("flag requires server-side evaluation")]
    RequiresServerEvaluation,
}
