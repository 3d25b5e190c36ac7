use std::time::Duration;

use crate::PeerpodError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The status code of a successful call.
pub const CODE_OK: i32 = 0;

/// The status code returned for a method the server does not implement.
pub const CODE_UNIMPLEMENTED: i32 = 12;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A ttrpc request envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    /// The fully qualified service name, e.g. `grpc.AgentService`.
    #[prost(string, tag = "1")]
    pub service: String,

    /// The method name within the service.
    #[prost(string, tag = "2")]
    pub method: String,

    /// The encoded request message.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,

    /// The caller's deadline in nanoseconds. Zero means none.
    #[prost(int64, tag = "4")]
    pub timeout_nano: i64,

    /// Request metadata.
    #[prost(message, repeated, tag = "5")]
    pub metadata: Vec<KeyValue>,
}

/// A ttrpc response envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    /// The call status. Absent means OK.
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,

    /// The encoded response message.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// A gRPC-style call status.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    /// The status code.
    #[prost(int32, tag = "1")]
    pub code: i32,

    /// The status message.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// A metadata entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    /// The key.
    #[prost(string, tag = "1")]
    pub key: String,

    /// The value.
    #[prost(string, tag = "2")]
    pub value: String,
}

/// An empty message, used by methods without arguments or results.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Request {
    /// The caller's deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_nano > 0).then(|| Duration::from_nanos(self.timeout_nano as u64))
    }
}

impl Status {
    /// Creates a status with the given code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The status returned for an unknown method.
    pub fn unimplemented(service: &str, method: &str) -> Self {
        Self::new(
            CODE_UNIMPLEMENTED,
            format!("/{service}/{method} is not supported"),
        )
    }

    /// Whether the status is OK.
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<&PeerpodError> for Status {
    fn from(error: &PeerpodError) -> Self {
        Status::new(error.code(), error.message())
    }
}

impl From<PeerpodError> for Status {
    fn from(error: PeerpodError) -> Self {
        Status::from(&error)
    }
}

impl From<Status> for PeerpodError {
    fn from(status: Status) -> Self {
        PeerpodError::Status {
            code: status.code,
            message: status.message,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_request_wire_layout() -> anyhow::Result<()> {
        let request = Request {
            service: "s".into(),
            method: "m".into(),
            payload: vec![0xff],
            timeout_nano: 1,
            metadata: vec![],
        };
        assert_eq!(
            request.encode_to_vec(),
            vec![0x0a, 1, b's', 0x12, 1, b'm', 0x1a, 1, 0xff, 0x20, 1]
        );
        assert_eq!(request.timeout(), Some(Duration::from_nanos(1)));
        assert_eq!(Request::default().timeout(), None);
        Ok(())
    }

    #[test]
    fn test_status_error_mapping() {
        let status = Status::from(PeerpodError::NotFound("sandbox abc".into()));
        assert_eq!(status.code, 5);
        assert_eq!(status.message, "not found: sandbox abc");

        let error = PeerpodError::from(Status::new(4, "too slow"));
        assert_eq!(error.kind(), crate::ErrorKind::DeadlineExceeded);
        assert_eq!(error.message(), "too slow");

        let error = PeerpodError::from(Status::new(9, "precondition"));
        assert_eq!(error.code(), 9);
        assert_eq!(Status::from(&error), Status::new(9, "precondition"));
    }
}
