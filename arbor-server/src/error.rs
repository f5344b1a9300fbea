//! Error types shared across the link and command layers.

use thiserror::Error;

/// A protocol violation. Raising one of these kills the offending
/// link: the message becomes the `ERROR :<reason>` text sent before
/// the socket is torn down.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Protocol violation: {0}")]
pub struct ProtocolViolation(pub String);

impl ProtocolViolation {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// What a command handler reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdResult {
    /// Handled; hand the parameters to the router for forwarding.
    Success,
    /// Not applicable (raced with a QUIT, stale TS, …). Routing is
    /// suppressed but the link stays up.
    Failure,
}

/// The small set of error kinds a link socket can die from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    Disconnect,
    Timeout,
    SocketCreate,
    ConnectRefused,
    Bind,
    Write,
    OutOfDescriptors,
    Other,
}

impl LinkError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnect => "remote host closed the connection",
            Self::Timeout => "connection timed out",
            Self::SocketCreate => "could not create socket",
            Self::ConnectRefused => "connection refused",
            Self::Bind => "could not bind to address",
            Self::Write => "write error",
            Self::OutOfDescriptors => "out of file descriptors",
            Self::Other => "socket error",
        }
    }

    /// Maps an I/O error onto a link error kind.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        // EMFILE/ENFILE have no stable ErrorKind.
        if matches!(err.raw_os_error(), Some(23) | Some(24)) {
            return Self::OutOfDescriptors;
        }
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectRefused,
            ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => {
                Self::Disconnect
            }
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => Self::Bind,
            ErrorKind::WriteZero => Self::Write,
            _ => Self::Other,
        }
    }
}

/// Extracts a timestamp parameter, rejecting obviously bogus values.
/// Zero and non-numeric timestamps are protocol violations; detection
/// is not designed to be bulletproof, only to catch the known bad
/// cases services packages have historically sent.
pub fn extract_ts(tsstr: &str) -> Result<u64, ProtocolViolation> {
    match tsstr.parse::<u64>() {
        Ok(0) | Err(_) => Err(ProtocolViolation::new(format!("Invalid TS {tsstr:?}"))),
        Ok(ts) => Ok(ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_ts_rejects_zero_and_garbage() {
        assert!(extract_ts("0").is_err());
        assert!(extract_ts("craq").is_err());
        assert!(extract_ts("-5").is_err());
        assert_eq!(extract_ts("1700000000").unwrap(), 1700000000);
    }
}
