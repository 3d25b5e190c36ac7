use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a peerpod-related operation.
pub type PeerpodResult<T> = Result<T, PeerpodError>;

/// An error that occurred while managing a peer-pod sandbox.
#[derive(Debug, Error)]
pub enum PeerpodError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The caller supplied malformed or incomplete input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A remote party (provider, kernel, agent) could not be reached or refused the call.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A wait exceeded its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// A ttrpc call returned a non-OK status.
    #[error("rpc status {code}: {message}")]
    Status {
        /// The gRPC status code.
        code: i32,

        /// The status message.
        message: String,
    },

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML decoding error.
    #[error("toml decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    /// A TOML encoding error.
    #[error("toml encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    /// A netlink request failed.
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// A system call failed.
    #[error("system call error: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// A TLS error.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A certificate generation error.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// A protobuf payload could not be decoded.
    #[error("protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    /// A protobuf payload could not be encoded.
    #[error("protobuf encode error: {0}")]
    ProtoEncode(#[from] prost::EncodeError),

    /// An address could not be parsed.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// A network prefix could not be parsed.
    #[error("network prefix error: {0}")]
    IpNetwork(#[from] ipnetwork::IpNetworkError),

    /// A base64 payload could not be decoded.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A `/proc` file could not be read.
    #[error("proc error: {0}")]
    Proc(#[from] procfs::ProcError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The coarse classification of a [`PeerpodError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`PeerpodError::NotFound`].
    NotFound,

    /// See [`PeerpodError::AlreadyExists`].
    AlreadyExists,

    /// See [`PeerpodError::InvalidInput`].
    InvalidInput,

    /// See [`PeerpodError::Unavailable`].
    Unavailable,

    /// See [`PeerpodError::DeadlineExceeded`].
    DeadlineExceeded,

    /// Everything else.
    Internal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PeerpodError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> PeerpodError {
        PeerpodError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Classifies the error into one of the coarse error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerpodError::NotFound(_) => ErrorKind::NotFound,
            PeerpodError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            PeerpodError::InvalidInput(_)
            | PeerpodError::AddrParse(_)
            | PeerpodError::IpNetwork(_)
            | PeerpodError::Base64(_)
            | PeerpodError::TomlDecode(_) => ErrorKind::InvalidInput,
            PeerpodError::Unavailable(_) => ErrorKind::Unavailable,
            PeerpodError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            PeerpodError::Status { code, .. } => ErrorKind::from_code(*code),
            PeerpodError::Netlink(e) => netlink_kind(e),
            PeerpodError::Errno(e) => errno_kind(*e as i32),
            PeerpodError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe => ErrorKind::Unavailable,
                _ => ErrorKind::Internal,
            },
            PeerpodError::Proc(procfs::ProcError::NotFound(_)) => ErrorKind::NotFound,
            PeerpodError::Custom(e) => match e.downcast::<PeerpodError>() {
                Some(inner) => inner.kind(),
                None => ErrorKind::Internal,
            },
            _ => ErrorKind::Internal,
        }
    }

    /// Returns true if the error is a `NotFound`-kinded error.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if the error is an `AlreadyExists`-kinded error.
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// The gRPC status code used when this error crosses an RPC boundary.
    pub fn code(&self) -> i32 {
        match self {
            PeerpodError::Status { code, .. } => *code,
            _ => self.kind().code(),
        }
    }

    /// The message used when this error crosses an RPC boundary.
    pub fn message(&self) -> String {
        match self {
            PeerpodError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl ErrorKind {
    /// The gRPC status code of the kind.
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::InvalidInput => 3,
            ErrorKind::DeadlineExceeded => 4,
            ErrorKind::NotFound => 5,
            ErrorKind::AlreadyExists => 6,
            ErrorKind::Internal => 13,
            ErrorKind::Unavailable => 14,
        }
    }

    /// Maps a gRPC status code back to a kind.
    pub fn from_code(code: i32) -> Self {
        match code {
            3 => ErrorKind::InvalidInput,
            4 => ErrorKind::DeadlineExceeded,
            5 => ErrorKind::NotFound,
            6 => ErrorKind::AlreadyExists,
            14 => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `PeerpodResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> PeerpodResult<T> {
    Result::Ok(value)
}

/// Returns the positive errno carried by a netlink error, if any.
pub(crate) fn netlink_errno(error: &rtnetlink::Error) -> Option<i32> {
    match error {
        rtnetlink::Error::NetlinkError(e) => Some(-e.raw_code()),
        _ => None,
    }
}

fn netlink_kind(error: &rtnetlink::Error) -> ErrorKind {
    match netlink_errno(error) {
        Some(errno) => errno_kind(errno),
        None => ErrorKind::Internal,
    }
}

fn errno_kind(errno: i32) -> ErrorKind {
    match errno {
        libc::EEXIST => ErrorKind::AlreadyExists,
        libc::ENOENT | libc::ESRCH | libc::ENODEV => ErrorKind::NotFound,
        libc::EINVAL => ErrorKind::InvalidInput,
        libc::ETIMEDOUT => ErrorKind::DeadlineExceeded,
        _ => ErrorKind::Internal,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
