use thiserror::Error;

use crate::store::StoreError;

pub type MatchbookResult<T> = Result<T, MatchbookError>;

/// Hard failures only. Business outcomes (no matching source, rate
/// limit exceeded, dedup collision, …) are classified drop reasons,
/// not errors; see `debug_report::DropReason`.
#[derive(Debug, Error)]
pub enum MatchbookError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed origin for {role}: {uri}")]
    MalformedOrigin { role: &'static str, uri: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
