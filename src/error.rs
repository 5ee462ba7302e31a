use crate::request::RequestStatus;

/// Field-level validation of drafts and parsed inputs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("product link must be an http(s) url, got {0:?}")]
    InvalidLink(String),
    #[error("product price must be greater than zero")]
    ZeroPrice,
    #[error("unknown currency {0:?}")]
    UnknownCurrency(String),
    #[error("unknown request status {0:?}")]
    UnknownStatus(String),
    #[error("unknown ledger event type {0:?}")]
    UnknownEventType(String),
    #[error("unknown proof kind {0:?}")]
    UnknownProofKind(String),
    #[error("card last4 must be four digits, got {0:?}")]
    InvalidLast4(String),
    #[error("amount must be greater than zero")]
    ZeroAmount,
}

/// Rejections raised while assembling a ledger entry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger side or currency given without an amount")]
    SideWithoutAmount,
    #[error("ledger meta must be a JSON object")]
    MetaNotObject,
    #[error("ledger description is {len} characters, limit is {limit}")]
    DescriptionTooLong { len: usize, limit: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("request {0} not found")]
    NotFound(String),
    #[error("{entity} {id} not found")]
    EntityNotFound { entity: &'static str, id: String },
    #[error("invalid transition: {0} is terminal")]
    Terminal(RequestStatus),
    #[error("invalid transition: cannot move from {from} to {to}")]
    InvalidTransition { from: RequestStatus, to: RequestStatus },
    #[error("{0}")]
    Precondition(String),
    #[error("{role} {email} is not allowed to act on request {request_id}")]
    Forbidden {
        role: crate::types::ActorRole,
        email: String,
        request_id: String,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to decode stored {0}")]
    Decode(&'static str),
    #[error("failed to encode {0}")]
    Encode(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RequestError {
    /// HTTP status a handler reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            RequestError::NotFound(_) | RequestError::EntityNotFound { .. } => 404,
            RequestError::Terminal(_)
            | RequestError::InvalidTransition { .. }
            | RequestError::Precondition(_)
            | RequestError::Validation(_)
            | RequestError::Ledger(_) => 400,
            RequestError::Forbidden { .. } => 403,
            RequestError::Storage(_)
            | RequestError::Decode(_)
            | RequestError::Encode(_)
            | RequestError::Internal(_) => 500,
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        RequestError::Precondition(msg.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("ledger page size must be between 1 and {max}, got {got}")]
    PageSize { got: usize, max: usize },
}
