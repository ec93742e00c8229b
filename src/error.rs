//! Error taxonomy shared by the ledger and both engines.

use std::fmt;

use thiserror::Error;

/// Coarse classification the HTTP boundary maps to a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BusinessRule,
    Transient,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BusinessRule(String),

    /// Lock wait or statement timeout, pool exhaustion. The caller may retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE codes that indicate the transaction can be retried as a whole:
/// query_canceled (statement_timeout), lock_not_available (lock_timeout),
/// serialization_failure, deadlock_detected.
const TRANSIENT_SQLSTATES: [&str; 4] = ["57014", "55P03", "40001", "40P01"];

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::BusinessRule(_) => ErrorKind::BusinessRule,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn business(msg: impl Into<String>) -> Self {
        Error::BusinessRule(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                Error::Transient("timed out waiting for a database connection".to_string())
            }
            sqlx::Error::PoolClosed => Error::Transient("connection pool closed".to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code();
                if code
                    .as_deref()
                    .is_some_and(|c| TRANSIENT_SQLSTATES.contains(&c))
                {
                    Error::Transient(db.message().to_string())
                } else {
                    Error::Internal(err.to_string())
                }
            }
            sqlx::Error::Io(_) => Error::Transient(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(Error::not_found("user 1").kind(), ErrorKind::NotFound);
        assert_eq!(Error::business("nope").kind(), ErrorKind::BusinessRule);
        assert_eq!(Error::Transient("t".into()).kind(), ErrorKind::Transient);
        assert_eq!(Error::Internal("i".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn business_message_is_displayed_verbatim() {
        let err = Error::business("Order cannot be cancelled: status is FILLED");
        assert_eq!(err.to_string(), "Order cannot be cancelled: status is FILLED");
    }
}
