use std::fmt;

/// Stable error codes carried on the wire in exception packets.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError = 0,
    UnsupportedPacket = 1,
    NotConnected = 2,
    ConnectionTimedOut = 3,
    Interrupted = 4,
    ConnectionFailed = 5,
    QueueDoesNotExist = 100,
    QueueExists = 101,
    ObjectClosed = 102,
    InvalidFilterExpression = 103,
    IllegalState = 104,
    SecurityException = 105,
    AddressDoesNotExist = 106,
    IncompatibleVersions = 108,
    RoutingError = 110,
    JournalIoError = 111,
    TransactionRolledBack = 112,
    QueueFull = 113,
    DuplicateId = 114,
    CorruptData = 115,
    XaError = 120,
    UnknownTransaction = 121,
}

impl ErrorCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => Self::UnsupportedPacket,
            2 => Self::NotConnected,
            3 => Self::ConnectionTimedOut,
            4 => Self::Interrupted,
            5 => Self::ConnectionFailed,
            100 => Self::QueueDoesNotExist,
            101 => Self::QueueExists,
            102 => Self::ObjectClosed,
            103 => Self::InvalidFilterExpression,
            104 => Self::IllegalState,
            105 => Self::SecurityException,
            106 => Self::AddressDoesNotExist,
            108 => Self::IncompatibleVersions,
            110 => Self::RoutingError,
            111 => Self::JournalIoError,
            112 => Self::TransactionRolledBack,
            113 => Self::QueueFull,
            114 => Self::DuplicateId,
            115 => Self::CorruptData,
            120 => Self::XaError,
            121 => Self::UnknownTransaction,
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.as_i32())
    }
}

/// XA sub-codes, numbered like `javax.transaction.xa.XAException`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaCode {
    RollbackOther = 100,
    RollbackTimeout = 106,
    HeuristicCommit = 7,
    HeuristicRollback = 6,
    Retry = 4,
    DuplicateXid = -8,
    Protocol = -6,
    InvalidArgs = -5,
    NoTransaction = -4,
    ResourceError = -3,
}

impl XaCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            100 => Self::RollbackOther,
            106 => Self::RollbackTimeout,
            7 => Self::HeuristicCommit,
            6 => Self::HeuristicRollback,
            4 => Self::Retry,
            -8 => Self::DuplicateXid,
            -6 => Self::Protocol,
            -5 => Self::InvalidArgs,
            -4 => Self::NoTransaction,
            _ => Self::ResourceError,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("journal write failed: {0}")]
    JournalIo(String),
    #[error("queue does not exist: {0}")]
    QueueDoesNotExist(String),
    #[error("queue already exists: {0}")]
    QueueExists(String),
    #[error("no binding for address {0}")]
    Routing(String),
    #[error("queue full: {0}")]
    QueueFull(String),
    #[error("duplicate message id {0}")]
    DuplicateId(String),
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),
    #[error("transaction rolled back: {0}")]
    TransactionRolledBack(String),
    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),
    #[error("xa error {code:?}: {message}")]
    Xa { code: XaCode, message: String },
    #[error("security exception: {0}")]
    Security(String),
    #[error("object closed: {0}")]
    ObjectClosed(&'static str),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timed out waiting for response to {0}")]
    ConnectionTimedOut(String),
    #[error("unsupported packet type {0}")]
    UnsupportedPacket(u8),
    #[error("incompatible client version {0}")]
    IncompatibleVersions(u32),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },
}

impl Error {
    pub fn xa(code: XaCode, message: impl Into<String>) -> Self {
        Error::Xa {
            code,
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }

    /// Stable code used when the error crosses the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) | Error::JournalIo(_) => ErrorCode::JournalIoError,
            Error::Corrupt(_) | Error::UnsupportedVersion(_) => ErrorCode::CorruptData,
            Error::Unsupported(_) | Error::Config(_) => ErrorCode::InternalError,
            Error::IllegalState(_) => ErrorCode::IllegalState,
            Error::QueueDoesNotExist(_) => ErrorCode::QueueDoesNotExist,
            Error::QueueExists(_) => ErrorCode::QueueExists,
            Error::Routing(_) => ErrorCode::RoutingError,
            Error::QueueFull(_) => ErrorCode::QueueFull,
            Error::DuplicateId(_) => ErrorCode::DuplicateId,
            Error::InvalidFilter(_) => ErrorCode::InvalidFilterExpression,
            Error::TransactionRolledBack(_) => ErrorCode::TransactionRolledBack,
            Error::UnknownTransaction(_) => ErrorCode::UnknownTransaction,
            Error::Xa { .. } => ErrorCode::XaError,
            Error::Security(_) => ErrorCode::SecurityException,
            Error::ObjectClosed(_) => ErrorCode::ObjectClosed,
            Error::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            Error::ConnectionTimedOut(_) => ErrorCode::ConnectionTimedOut,
            Error::UnsupportedPacket(_) => ErrorCode::UnsupportedPacket,
            Error::IncompatibleVersions(_) => ErrorCode::IncompatibleVersions,
            Error::Remote { code, .. } => *code,
        }
    }

    /// Rebuilds a typed error from an exception packet.
    pub fn from_remote(code: i32, message: String) -> Self {
        match ErrorCode::from_i32(code) {
            ErrorCode::QueueDoesNotExist => Error::QueueDoesNotExist(message),
            ErrorCode::QueueExists => Error::QueueExists(message),
            ErrorCode::RoutingError => Error::Routing(message),
            ErrorCode::QueueFull => Error::QueueFull(message),
            ErrorCode::DuplicateId => Error::DuplicateId(message),
            ErrorCode::InvalidFilterExpression => Error::InvalidFilter(message),
            ErrorCode::TransactionRolledBack => Error::TransactionRolledBack(message),
            ErrorCode::UnknownTransaction => Error::UnknownTransaction(message),
            ErrorCode::SecurityException => Error::Security(message),
            ErrorCode::IllegalState => Error::IllegalState(message),
            ErrorCode::ConnectionFailed => Error::ConnectionFailed(message),
            code => Error::Remote { code, message },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_i32() {
        for code in [
            ErrorCode::QueueDoesNotExist,
            ErrorCode::RoutingError,
            ErrorCode::TransactionRolledBack,
            ErrorCode::SecurityException,
            ErrorCode::XaError,
        ] {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), code);
        }
        assert_eq!(ErrorCode::from_i32(9999), ErrorCode::InternalError);
    }

    #[test]
    fn remote_errors_keep_their_type() {
        let err = Error::from_remote(ErrorCode::QueueExists.as_i32(), "q1".into());
        assert!(matches!(err, Error::QueueExists(ref name) if name == "q1"));
        assert_eq!(err.code(), ErrorCode::QueueExists);

        let err = Error::from_remote(ErrorCode::XaError.as_i32(), "boom".into());
        assert_eq!(err.code(), ErrorCode::XaError);
    }
}
