//! Error taxonomy for lot lifecycle operations

/// Bad caller input. Always recoverable, shown to the caller verbatim.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("weight must be greater than zero")]
    NonPositiveWeight,
    #[error("weight {0} kg is not a finite, non-negative number")]
    InvalidWeight(f64),
    #[error("quality rating must be between 1 and 3, got {0}")]
    InvalidQuality(u8),
    #[error("operation requires box {expected}, lot is in box {actual}")]
    WrongBox { expected: u8, actual: u8 },
    #[error("measured weight {measured} g exceeds the previous stage weight {before} g")]
    MeasuredAboveBefore { measured: u64, before: u64 },
    #[error("removing {removed} g would take the lot below zero ({current} g)")]
    WeightUnderflow { removed: u64, current: u64 },
    #[error("plan has no step {0}")]
    StepOutOfRange(usize),
    #[error("latitude {0} / longitude {1} is out of range")]
    InvalidGeolocation(f64, f64),
    #[error("unit code must not be empty")]
    EmptyUnit,
}

#[derive(thiserror::Error, Debug)]
pub enum LotError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid transition for lot {lot}: {reason}")]
    InvalidTransition { lot: String, reason: String },
    #[error("belt of unit {unit} is full, all 7 boxes are occupied")]
    BeltFull { unit: String },
    #[error("weekly maintenance needs all 7 boxes occupied, unit {unit} has {occupied}")]
    InsufficientLots { unit: String, occupied: usize },
    #[error("box {box_position} of unit {unit} is already occupied, cannot place lot {lot}")]
    SlotOccupied {
        unit: String,
        box_position: u8,
        lot: String,
    },
    #[error("stale write on lot {lot}: expected version {expected}, found {found}")]
    StaleWrite {
        lot: String,
        expected: u64,
        found: u64,
    },
    #[error("chain head of scope {scope} moved while finalizing lot {lot}")]
    ChainConflict { scope: String, lot: String },
    #[error("lot {lot} cannot be certified: {}", findings.join("; "))]
    IntegrityViolation { lot: String, findings: Vec<String> },
    #[error("an authenticated actor is required")]
    Unauthenticated,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("step {step} (box {box_position}) failed: {source}")]
    StepFailed {
        step: usize,
        box_position: u8,
        #[source]
        source: Box<LotError>,
    },
    #[error("failed to encode or decode a record: {0}")]
    Encoding(String),
    #[error("repository error: {0}")]
    Repository(String),
}

impl LotError {
    /// Only storage failures are worth a retry, and callers should only retry
    /// reads: a failed write may or may not have landed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LotError::Repository(_) => true,
            LotError::StepFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Caller state is out of date and should be re-fetched before trying again.
    pub fn requires_refresh(&self) -> bool {
        match self {
            LotError::InvalidTransition { .. }
            | LotError::StaleWrite { .. }
            | LotError::ChainConflict { .. }
            | LotError::SlotOccupied { .. } => true,
            LotError::StepFailed { source, .. } => source.requires_refresh(),
            _ => false,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LotError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn transition(lot: &str, reason: impl Into<String>) -> Self {
        LotError::InvalidTransition {
            lot: lot.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sled::Error> for LotError {
    fn from(value: sled::Error) -> Self {
        LotError::Repository(value.to_string())
    }
}

impl From<minicbor::decode::Error> for LotError {
    fn from(value: minicbor::decode::Error) -> Self {
        LotError::Encoding(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for LotError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        LotError::Encoding(value.to_string())
    }
}
