use crate::api::error::ApiError;

/// Failures of the session issuer/validator and credential check.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is inactive")]
    Inactive,
    #[error("Invalid or expired session")]
    InvalidSession,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::InvalidSession => {
                Self::Unauthenticated(err.to_string())
            }
            AuthError::Inactive => Self::Forbidden(err.to_string()),
            AuthError::Storage(source) => Self::Internal(source),
        }
    }
}
