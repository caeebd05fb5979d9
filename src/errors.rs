//! Typed error hierarchy for the CRM back-end.
//!
//! Two enums cover the two layers:
//! - `StoreError`: failures reported by the remote (or local) record store,
//!   already classified into the cases the admin panel renders differently
//! - `CrmError`: entity action, pipeline and sync failures, wrapping `StoreError`

use thiserror::Error;

/// PostgreSQL SQLSTATE for "insufficient privilege", which is what a
/// row-level-security rejection surfaces as.
pub const RLS_VIOLATION_CODE: &str = "42501";

/// PostgreSQL SQLSTATE for "undefined table".
pub const UNDEFINED_TABLE_CODE: &str = "42P01";

/// PostgREST code for a table missing from its schema cache.
pub const SCHEMA_CACHE_MISS_CODE: &str = "PGRST205";

/// PostgreSQL SQLSTATE for a unique constraint violation.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Message shown when the sync layer finds the CRM tables missing.
pub const MISSING_TABLES_MESSAGE: &str =
    "Database tables not found. Please run the migration script.";

/// Errors from a `RecordStore` call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relation \"{relation}\" does not exist")]
    MissingRelation { relation: String },

    #[error("Row-level security policy rejected the write on \"{table}\": {message}")]
    RowLevelSecurity { table: String, message: String },

    #[error("Duplicate value rejected by \"{table}\": {message}")]
    Conflict { table: String, message: String },

    #[error("Row {id} not found in \"{table}\"")]
    NotFound { table: String, id: String },

    #[error("Store rejected the request{}: {message}", code.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Rejected {
        code: Option<String>,
        message: String,
    },

    #[error("Malformed row from \"{table}\": {message}")]
    Decode { table: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl StoreError {
    /// Classify an error reported by the store's wire protocol.
    ///
    /// The code wins when present; message inspection is only the fallback for
    /// errors that arrive without a SQLSTATE.
    pub fn classify(table: &str, code: Option<&str>, message: &str) -> Self {
        match code {
            Some(UNDEFINED_TABLE_CODE) | Some(SCHEMA_CACHE_MISS_CODE) => Self::MissingRelation {
                relation: table.to_string(),
            },
            Some(RLS_VIOLATION_CODE) => Self::RowLevelSecurity {
                table: table.to_string(),
                message: message.to_string(),
            },
            Some(UNIQUE_VIOLATION_CODE) => Self::Conflict {
                table: table.to_string(),
                message: message.to_string(),
            },
            Some(other) => Self::Rejected {
                code: Some(other.to_string()),
                message: message.to_string(),
            },
            None if message.contains("relation") && message.contains("does not exist") => {
                Self::MissingRelation {
                    relation: table.to_string(),
                }
            }
            None if message.contains("row-level security") => Self::RowLevelSecurity {
                table: table.to_string(),
                message: message.to_string(),
            },
            None => Self::Rejected {
                code: None,
                message: message.to_string(),
            },
        }
    }

    pub fn is_missing_relation(&self) -> bool {
        matches!(self, Self::MissingRelation { .. })
    }
}

/// Errors from the CRM layer (actions, sync, pipeline board).
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("{0}")]
    Validation(String),

    #[error("Deal {id} not found")]
    DealNotFound { id: String },

    #[error("Invalid {field} '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("No deal is being dragged")]
    NoDragInProgress,

    #[error("Deal {deal_id} is already {stage}")]
    StageUnchanged { deal_id: String, stage: String },

    #[error("Lead contact {contact_id} was created but its deal was not: {source}")]
    LeadDealFailed {
        contact_id: String,
        #[source]
        source: Box<CrmError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrmError {
    /// The store error at the root of this error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            Self::LeadDealFailed { source, .. } => source.store_error(),
            _ => None,
        }
    }

    /// Message the sync layer records as its `error` value.
    pub fn sync_message(&self) -> String {
        match self.store_error() {
            Some(e) if e.is_missing_relation() => MISSING_TABLES_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }
}
