use std::io;

pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors raised while framing or transporting protocol messages.
#[derive(Debug, Eq, PartialEq)]
pub enum ProtoError {
    /// The peer went away before a full frame arrived.
    Disconnected,
    /// A frame does not fit the fixed scratch buffers.
    Oversized,
    /// The peer sent a frame with an unknown type tag.
    UnknownType(u8),
    Io(io::ErrorKind),
}

impl From<io::Error> for ProtoError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::UnexpectedEof => ProtoError::Disconnected,
            kind => ProtoError::Io(kind),
        }
    }
}
