use std::fmt::Display;

/// Failure taxonomy shared by the ledger, the lifecycle manager and the
/// gRPC edge.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(what: impl Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn already_exists(what: impl Display) -> Self {
        Self::AlreadyExists(what.to_string())
    }

    pub fn invalid_argument(msg: impl Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    pub fn failed_precondition(msg: impl Display) -> Self {
        Self::FailedPrecondition(msg.to_string())
    }

    pub fn resource_exhausted(msg: impl Display) -> Self {
        Self::ResourceExhausted(msg.to_string())
    }

    pub fn cancelled(msg: impl Display) -> Self {
        Self::Cancelled(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition(_))
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Prefix the error with `context` while keeping its kind.
    pub fn context(self, context: impl Display) -> Self {
        match self {
            Self::NotFound(msg) => Self::NotFound(format!("{context}: {msg}")),
            Self::AlreadyExists(msg) => Self::AlreadyExists(format!("{context}: {msg}")),
            Self::InvalidArgument(msg) => Self::InvalidArgument(format!("{context}: {msg}")),
            Self::FailedPrecondition(msg) => Self::FailedPrecondition(format!("{context}: {msg}")),
            Self::ResourceExhausted(msg) => Self::ResourceExhausted(format!("{context}: {msg}")),
            Self::Cancelled(msg) => Self::Cancelled(format!("{context}: {msg}")),
            Self::Internal(err) => Self::Internal(err.context(context.to_string())),
        }
    }
}

/// Attach operation context to any result whose error converts into
/// [`Error`].
pub trait ResultExt<T> {
    fn op_context<C: Display>(self, context: C) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn op_context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::not_found("snapshot a").context("stat");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "stat: snapshot a: not found");

        let err = Error::from(anyhow!("zfs exited with 1")).context("prepare a");
        assert!(err.is_internal());
        assert_eq!(format!("{:#}", err), "prepare a: zfs exited with 1");
    }

    #[test]
    fn test_result_ext() {
        let res: std::result::Result<(), anyhow::Error> = Err(anyhow!("boom"));
        let err = res.op_context("remove b").unwrap_err();
        assert!(err.is_internal());
    }
}
