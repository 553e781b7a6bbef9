#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("system: {0}")]
    System(#[from] std::io::Error),
    #[error("invalid namespace {0}")]
    InvalidNamespace(String),
    #[error("bad parameter: {0}")]
    BadParam(String),
    #[error("timeout")]
    Timeout,
    #[error("communication failed: {0}")]
    CommFailed(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("not supported")]
    NotSupported,
    #[error("internal: {0}")]
    Internal(String),
}

/// Status codes handed back to the PMIx library, numerically identical to
/// the `pmix_status_t` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Error = -1,
    Timeout = -24,
    Unreach = -25,
    BadParam = -27,
    InvalidNamespace = -44,
    NotSupported = -47,
    CommFailed = -49,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -24 => Self::Timeout,
            -25 => Self::Unreach,
            -27 => Self::BadParam,
            -44 => Self::InvalidNamespace,
            -47 => Self::NotSupported,
            -49 => Self::CommFailed,
            _ => Self::Error,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Success
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::System(_) => Self::Error,
            Error::InvalidNamespace(_) => Self::InvalidNamespace,
            Error::BadParam(_) => Self::BadParam,
            Error::Timeout => Self::Timeout,
            Error::CommFailed(_) => Self::CommFailed,
            Error::ProtocolViolation(_) => Self::Error,
            Error::NotSupported => Self::NotSupported,
            Error::Internal(_) => Self::Error,
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::System(_) | Error::ProtocolViolation(_) | Error::Internal(_) => Self::Error,
            Error::InvalidNamespace(_) => Self::InvalidNamespace,
            Error::BadParam(_) => Self::BadParam,
            Error::Timeout => Self::Timeout,
            Error::CommFailed(_) => Self::CommFailed,
            Error::NotSupported => Self::NotSupported,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use crate::error::*;

    #[test]
    fn status_codes() {
        assert_eq!(Status::from(Error::Timeout).code(), -24);
        assert_eq!(Status::from(Error::InvalidNamespace("x".into())), Status::InvalidNamespace);
        assert_eq!(Status::from_code(Status::CommFailed.code()), Status::CommFailed);
        assert_eq!(Status::from_code(-1000), Status::Error);
        let io = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(Status::from(Error::from(io)), Status::Error);
    }
}
