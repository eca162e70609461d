use thiserror::Error;

use hoist_core::errors::ErrorKind;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("token revoked")]
    Revoked,

    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("step-up required: {0}")]
    StepUpRequired(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken(_)
            | Self::Expired
            | Self::NotYetValid
            | Self::Revoked
            | Self::UnknownKeyId(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) | Self::StepUpRequired(_) => ErrorKind::Forbidden,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
