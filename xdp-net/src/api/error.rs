use std::fmt;

pub type Errno = nix::errno::Errno;

/// A boxed error type, used for failures reported by external collaborators
/// such as the kernel filter loader.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for xdp-net operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for xdp-net operations.
#[derive(Debug)]
pub enum Error {
    /// Configuration rejected by `XdpConfig::validate`.
    InvalidConfig(&'static str),
    /// The socket handle has been closed.
    InvalidState,
    /// The interface name could not be resolved.
    Interface(Errno),
    /// The frame arena could not be mapped or registered with the kernel.
    OutOfMemory,
    /// No free TX frame. Call `send_prepare` and retry.
    NoFrame,
    /// The kernel TX path is congested. Retry `send_finish` later.
    Busy,
    /// Unexpected syscall failure.
    Io(Errno),
    /// Frame shape the kernel filter should have excluded.
    Malformed,
    /// The external filter could not be attached.
    Filter(BoxError),
}

impl Error {
    /// Whether the condition is expected under load and the caller should
    /// simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NoFrame | Error::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::InvalidState => write!(f, "socket is not active"),
            Error::Interface(e) => write!(f, "interface lookup failed: {e}"),
            Error::OutOfMemory => write!(f, "failed to allocate or register frame memory"),
            Error::NoFrame => write!(f, "no free TX frame"),
            Error::Busy => write!(f, "kernel TX path busy, try again"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Malformed => write!(f, "malformed frame"),
            Error::Filter(e) => write!(f, "filter attach failed: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Interface(e) | Error::Io(e) => Some(e),
            Error::Filter(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Io(e)
    }
}

/// Map a libc-style return value to a Result, picking up `errno` on failure.
pub(crate) fn check_success(ret: libc::c_int) -> Result<()> {
    if ret < 0 {
        Err(Error::Io(Errno::last()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_success() {
        assert!(check_success(0).is_ok());
        assert!(check_success(7).is_ok());
        assert!(matches!(check_success(-1), Err(Error::Io(_))));
    }

    #[test]
    fn test_transient() {
        assert!(Error::NoFrame.is_transient());
        assert!(Error::Busy.is_transient());
        assert!(!Error::Io(Errno::ENODEV).is_transient());
        assert!(!Error::Malformed.is_transient());
    }

    #[test]
    fn test_display() {
        let e = Error::Io(Errno::ENETDOWN);
        assert!(e.to_string().starts_with("I/O error"));
        assert_eq!(Error::NoFrame.to_string(), "no free TX frame");
    }
}
