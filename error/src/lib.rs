//! Provides the common error type and associated convenience methods for the transaction
//! coordinator crates.

use std::convert::Infallible;
use std::fmt;
use std::io;

/// A result of type `T`, or a [`TCError`]
pub type TCResult<T> = Result<T, TCError>;

struct ErrorData {
    message: String,
    stack: Vec<String>,
}

impl<T> From<T> for ErrorData
where
    T: fmt::Display,
{
    fn from(message: T) -> Self {
        Self {
            message: message.to_string(),
            stack: vec![],
        }
    }
}

/// The category of a `TCError`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorType {
    AlreadyActive,
    BadRequest,
    Conflict,
    HeuristicOutcome,
    IllegalState,
    Internal,
    NoActiveTransaction,
    Resource,
    RolledBack,
    Timeout,
}

impl fmt::Debug for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::AlreadyActive => "transaction already active",
            Self::BadRequest => "bad request",
            Self::Conflict => "conflict",
            Self::HeuristicOutcome => "heuristic outcome",
            Self::IllegalState => "illegal state",
            Self::Internal => "internal error",
            Self::NoActiveTransaction => "no active transaction",
            Self::Resource => "resource error",
            Self::RolledBack => "rolled back",
            Self::Timeout => "transaction timeout",
        })
    }
}

/// A general error description.
pub struct TCError {
    code: ErrorType,
    data: ErrorData,
}

impl TCError {
    /// Returns a new error with the given code and message.
    pub fn new<I: fmt::Display>(code: ErrorType, message: I) -> Self {
        Self {
            code,
            data: message.into(),
        }
    }

    /// Error indicating that the calling context already has a bound transaction.
    pub fn already_active<I: fmt::Display>(txn_id: I) -> Self {
        Self::new(
            ErrorType::AlreadyActive,
            format!("this context is already bound to transaction {}", txn_id),
        )
    }

    /// Error indicating that the request is badly-constructed or nonsensical.
    pub fn bad_request<M: fmt::Display, I: fmt::Display>(message: M, cause: I) -> Self {
        Self::new(ErrorType::BadRequest, format!("{}: {}", message, cause))
    }

    /// Error indicating that the request depends on a resource which is exclusively locked
    /// by another transaction.
    pub fn conflict<M: fmt::Display>(message: M) -> Self {
        Self::new(ErrorType::Conflict, message)
    }

    /// Error indicating that some, but not all, enlisted resources committed.
    pub fn heuristic<I: fmt::Display>(info: I) -> Self {
        Self::new(ErrorType::HeuristicOutcome, info)
    }

    /// Error indicating that the requested operation is not valid in the current status.
    pub fn illegal_state<M: fmt::Display, S: fmt::Display>(message: M, status: S) -> Self {
        Self::new(
            ErrorType::IllegalState,
            format!("{} (status is {})", message, status),
        )
    }

    /// A truly unexpected error, for which the calling application cannot define any specific
    /// handling behavior.
    pub fn internal<I: fmt::Display>(info: I) -> Self {
        log::error!("{}", info);
        Self::new(ErrorType::Internal, info)
    }

    /// Error indicating that the operation requires a bound transaction and there is none.
    pub fn no_active_transaction<I: fmt::Display>(operation: I) -> Self {
        Self::new(
            ErrorType::NoActiveTransaction,
            format!("{} requires an active transaction", operation),
        )
    }

    /// Error raised by a resource manager, e.g. an I/O failure.
    pub fn resource<I: fmt::Display>(info: I) -> Self {
        Self::new(ErrorType::Resource, info)
    }

    /// Error indicating that a commit request ended in rollback.
    pub fn rolled_back<I: fmt::Display>(info: I) -> Self {
        Self::new(ErrorType::RolledBack, info)
    }

    /// Error indicating that the transaction failed to complete before its deadline.
    pub fn timeout<I: fmt::Display>(info: I) -> Self {
        Self::new(ErrorType::Timeout, info)
    }

    pub fn code(&self) -> ErrorType {
        self.code
    }

    pub fn message(&'_ self) -> &'_ str {
        &self.data.message
    }

    pub fn stack(&self) -> &[String] {
        &self.data.stack
    }

    /// Add context to this error, e.g. the name of the operation which returned it.
    pub fn consume<I: fmt::Display>(mut self, info: I) -> Self {
        self.data.stack.push(info.to_string());
        self
    }
}

impl std::error::Error for TCError {}

impl From<io::Error> for TCError {
    fn from(cause: io::Error) -> Self {
        Self::resource(cause)
    }
}

impl From<Infallible> for TCError {
    fn from(_: Infallible) -> Self {
        Self::internal("an unanticipated error occurred--please file a bug report")
    }
}

impl fmt::Debug for TCError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TCError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.data.message)?;

        for info in self.data.stack.iter().rev() {
            write!(f, "\n  at {}", info)?;
        }

        Ok(())
    }
}
