//! Error taxonomy shared by every public operation.
//!
//! Synchronous calls return `Result<T, ZtsError>`. The C ABI flattens an error
//! into a result code (`code()`) and, for socket calls, an errno (`errno()`).

use thiserror::Error;

use crate::identity::IdentityError;

/// Result codes of the C ABI.
pub const ZTS_ERR_OK: i32 = 0;
pub const ZTS_ERR_INVALID_ARG: i32 = -1;
pub const ZTS_ERR_SERVICE: i32 = -2;
pub const ZTS_ERR_INVALID_OP: i32 = -3;

/// errno values reported through `zts_errno()`.
pub mod errno {
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const EINVAL: i32 = 22;
    pub const ENFILE: i32 = 23;
    pub const EPIPE: i32 = 32;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EADDRINUSE: i32 = 98;
    pub const EADDRNOTAVAIL: i32 = 99;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTCONN: i32 = 107;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const EHOSTUNREACH: i32 = 113;
    pub const EINPROGRESS: i32 = 115;
    pub const ENETDOWN: i32 = 100;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZtsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("operation would block")]
    WouldBlock,
    #[error("operation timed out")]
    Timeout,
    #[error("operation in progress")]
    InProgress,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("socket is not connected")]
    NotConnected,
    #[error("address in use")]
    AddrInUse,
    #[error("address not available")]
    AddrNotAvailable,
    #[error("socket closed")]
    Closed,
    #[error("identity: {0}")]
    Identity(String),
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ZtsError>;

impl From<IdentityError> for ZtsError {
    fn from(e: IdentityError) -> Self {
        ZtsError::Identity(e.to_string())
    }
}

impl ZtsError {
    /// Result code for the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            ZtsError::ServiceUnavailable => ZTS_ERR_SERVICE,
            ZtsError::InvalidOperation(_) => ZTS_ERR_INVALID_OP,
            _ => ZTS_ERR_INVALID_ARG,
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            ZtsError::InvalidArgument(_) => errno::EINVAL,
            ZtsError::ServiceUnavailable => errno::ENETDOWN,
            ZtsError::InvalidOperation(_) => errno::EOPNOTSUPP,
            ZtsError::WouldBlock => errno::EAGAIN,
            ZtsError::Timeout => errno::ETIMEDOUT,
            ZtsError::InProgress => errno::EINPROGRESS,
            ZtsError::ConnectionRefused => errno::ECONNREFUSED,
            ZtsError::HostUnreachable => errno::EHOSTUNREACH,
            ZtsError::ConnectionReset => errno::ECONNRESET,
            ZtsError::BrokenPipe => errno::EPIPE,
            ZtsError::NotConnected => errno::ENOTCONN,
            ZtsError::AddrInUse => errno::EADDRINUSE,
            ZtsError::AddrNotAvailable => errno::EADDRNOTAVAIL,
            ZtsError::Closed => errno::EBADF,
            ZtsError::Identity(_) | ZtsError::Config(_) => errno::EINVAL,
        }
    }

    /// WouldBlock, Timeout and InProgress are expected outcomes callers retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZtsError::WouldBlock | ZtsError::Timeout | ZtsError::InProgress
        )
    }
}
