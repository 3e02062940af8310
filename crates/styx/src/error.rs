//! Error types for 9P client operations.

use thiserror::Error;

/// Error variants for client operations.
///
/// Each failure a caller can observe has its own variant so callers branch
/// on kind rather than matching diagnostic text. Remote errors carry the
/// server's text verbatim and are never retried by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Wraps standard I/O errors from the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with an RError; the text is the server's own.
    #[error("{0}")]
    Remote(String),

    /// A malformed frame, a mismatched reply type, or a nonsense
    /// negotiation result. The offending request fails; the connection
    /// survives unless the frame itself was unreadable.
    #[error("protocol error: {0}")]
    Proto(String),

    /// The connection is dead: hangup, transport failure, or an oversize
    /// frame. Every pending and future request on it fails this way.
    #[error("i/o on hungup channel: {0}")]
    Hungup(String),

    /// The operation was cancelled and flushed.
    #[error("interrupted")]
    Interrupted,

    /// All 65534 usable tags are outstanding; back off and retry.
    #[error("out of 9P message tags")]
    NoTags,

    /// The fid space is exhausted.
    #[error("out of fids")]
    NoFids,

    /// A walk stopped at a missing final path element.
    #[error("'{0}' does not exist")]
    NotFound(String),

    /// A walk crossed a non-directory, or stopped early in the path.
    #[error("'{0}' not a directory")]
    NotDir(String),

    /// The handle is not open for this operation, or the arguments make no
    /// sense locally. Nothing was sent on the wire.
    #[error("inappropriate use of fd: {0}")]
    BadUse(&'static str),

    /// Byte I/O on a directory.
    #[error("file is a directory")]
    IsDir,

    /// A seek computed a negative file offset.
    #[error("negative i/o offset")]
    NegOffset,

    /// The file already exists (create with an empty path).
    #[error("file already exists")]
    Exists,
}

impl Error {
    /// True when the connection this error came from is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Hungup(_))
    }
}
