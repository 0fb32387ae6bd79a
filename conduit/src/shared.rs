use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// `Wait` is the soft failure of the relay: a parser needs more bytes or a
/// socket is not ready, and the caller simply returns to the event loop.
/// Everything `Fatal` tears the link down.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// Malformed SOCKS5 or shadowsocks header.
    Protocol,
    /// Recognized but rejected: UDP ASSOCIATE or authentication methods.
    Unsupported,
    /// recv returned 0; the peer has shut down.
    PeerClosed,
    /// The connection table is full.
    Capacity,
    /// The origin address could not be resolved.
    Resolve,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            io::ErrorKind::UnexpectedEof => NetworkError::Fatal(ErrorType::PeerClosed),
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}
