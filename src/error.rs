use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessLedgerError {
    #[error("Data store error during {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Operation not supported by this data store: {0}")]
    Unsupported(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Invalid month {0}: must be between 1 and 12")]
    InvalidMonth(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid meal count {0}: must be a finite, non-negative number")]
    InvalidMealCount(f64),

    #[error("Invalid amount {0}: must be a finite, non-negative number")]
    InvalidAmount(f64),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Fair shares for {period} sum to {actual} but bazar total is {expected} (difference {difference})")]
    FairShareMismatch {
        period: String,
        expected: f64,
        actual: f64,
        difference: f64,
    },

    #[error("Select at least one target (dinner or lunch) that has a source record")]
    NoChartTarget,

    #[error("Dinner and lunch resolve to the same record {record_id} but were given different values ({dinner} vs {lunch})")]
    ConflictingChartEdit {
        record_id: i64,
        dinner: f64,
        lunch: f64,
    },

    #[error("Record {record_id} does not belong to member {member_id}")]
    NotOwner { record_id: i64, member_id: String },

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Bazar entry {bazar_id} was saved but its matching deposit failed ({cause}); rollback also failed: {rollback}")]
    CompensationFailed {
        bazar_id: i64,
        cause: String,
        rollback: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "postgrest")]
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl MessLedgerError {
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for failures that came from the data-access layer rather than from
    /// validation or computation.
    pub fn is_data_access(&self) -> bool {
        match self {
            Self::Store { .. } | Self::Unsupported(_) | Self::IoError(_) => true,
            #[cfg(feature = "postgrest")]
            Self::HttpError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MessLedgerError>;
