use std::io;

use serde_json::Value;

/// Transport-level failure categories that are considered transient.
///
/// These correspond to the OS error codes the platform documents as
/// retryable: `ETIMEDOUT`, `EHOSTUNREACH`, `ENOTFOUND`, `ECONNRESET` and
/// `ECONNABORTED`. A refused connection is deliberately absent: a refusal
/// means a host answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The request or connect attempt timed out (`ETIMEDOUT`).
    Timeout,
    /// No route to the host (`EHOSTUNREACH`).
    HostUnreachable,
    /// DNS lookup failed (`ENOTFOUND`).
    NameNotFound,
    /// The peer reset the connection (`ECONNRESET`).
    ConnectionReset,
    /// The connection was aborted locally (`ECONNABORTED`).
    ConnectionAborted,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::HostUnreachable => "host unreachable",
            Self::NameNotFound => "name not found",
            Self::ConnectionReset => "connection reset",
            Self::ConnectionAborted => "connection aborted",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the SDK.
///
/// Each variant carries exactly the fields callers need to inspect the
/// failure; retries happen before any of these are returned.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed input rejected before anything touches the wire:
    /// credentials, scopes, SOAP option keys, payload shape.
    #[error("{0}")]
    Validation(String),

    /// A transport-level failure where no HTTP response arrived.
    ///
    /// `kind` is `Some` when the failure maps to one of the recognized
    /// transient codes; only those are retried.
    #[error("Network error ({kind:?}) calling {endpoint}")]
    Network {
        kind: Option<ConnectionErrorKind>,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The token endpoint answered with a non-2xx status.
    #[error("Authentication failed ({code}): {description}")]
    Auth { code: String, description: String },

    /// A REST 401 or SOAP `Token Expired` fault after the single
    /// refresh-and-retry allowance was spent.
    #[error("Session expired and could not be refreshed for {endpoint}")]
    ExpiredSession { endpoint: String },

    /// A REST response arrived with a non-2xx status.
    #[error("{message}")]
    Rest {
        status: u16,
        message: String,
        code: Option<String>,
        body: Value,
        endpoint: String,
    },

    /// A SOAP fault or content-level error status.
    #[error("{message}")]
    Soap {
        code: String,
        message: String,
        fault: Option<Value>,
    },

    /// The SOAP response body was not well-formed XML.
    #[error("Failed to parse SOAP response: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Shared client state (session lock, fan-out gate) became
    /// unusable, which only happens after a panicking holder.
    #[error("Failed to acquire lock on client state")]
    Lock,
}

impl Error {
    /// Builds a REST error from a captured response body, mirroring the
    /// platform's two error shapes: `{message, errorcode}` from the REST
    /// services and `{error, error_description}` from the auth service.
    pub(crate) fn rest(status: u16, body: Value, endpoint: String) -> Self {
        let (message, code) = if let Some(message) = body.get("message").and_then(Value::as_str) {
            (
                message.to_string(),
                body.get("errorcode").map(json_to_code),
            )
        } else if let Some(description) = body.get("error_description").and_then(Value::as_str) {
            (description.to_string(), body.get("error").map(json_to_code))
        } else {
            ("Unhandled Exception. See details".to_string(), None)
        };
        Self::Rest {
            status,
            message,
            code,
            body,
            endpoint,
        }
    }
}

fn json_to_code(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classifies a transport failure as transient (retryable) or not.
///
/// A response that arrived, whatever its HTTP status, is never a
/// connection error; it is routed to application-level handling instead.
pub fn classify_connection_error(err: &reqwest::Error) -> Option<ConnectionErrorKind> {
    if err.status().is_some() || err.is_body() || err.is_decode() {
        return None;
    }
    if err.is_timeout() {
        return Some(ConnectionErrorKind::Timeout);
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return kind_from_io(io_err.kind(), err.is_connect());
        }
        source = cause.source();
    }
    if err.is_connect() {
        // Failed before a socket existed; reqwest reports DNS resolution
        // failures this way without a typed io::Error in the chain.
        return Some(ConnectionErrorKind::NameNotFound);
    }
    None
}

fn kind_from_io(kind: io::ErrorKind, is_connect: bool) -> Option<ConnectionErrorKind> {
    match kind {
        io::ErrorKind::TimedOut => Some(ConnectionErrorKind::Timeout),
        io::ErrorKind::HostUnreachable => Some(ConnectionErrorKind::HostUnreachable),
        io::ErrorKind::ConnectionReset => Some(ConnectionErrorKind::ConnectionReset),
        io::ErrorKind::ConnectionAborted => Some(ConnectionErrorKind::ConnectionAborted),
        io::ErrorKind::ConnectionRefused => None,
        io::ErrorKind::NotFound => Some(ConnectionErrorKind::NameNotFound),
        _ if is_connect => Some(ConnectionErrorKind::NameNotFound),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn io_kind_mapping_covers_the_fixed_code_set() {
        assert_eq!(
            kind_from_io(io::ErrorKind::TimedOut, false),
            Some(ConnectionErrorKind::Timeout)
        );
        assert_eq!(
            kind_from_io(io::ErrorKind::HostUnreachable, false),
            Some(ConnectionErrorKind::HostUnreachable)
        );
        assert_eq!(
            kind_from_io(io::ErrorKind::ConnectionReset, false),
            Some(ConnectionErrorKind::ConnectionReset)
        );
        assert_eq!(
            kind_from_io(io::ErrorKind::ConnectionAborted, false),
            Some(ConnectionErrorKind::ConnectionAborted)
        );
    }

    #[test]
    fn connection_refused_is_not_transient() {
        assert_eq!(kind_from_io(io::ErrorKind::ConnectionRefused, true), None);
    }

    #[test]
    fn unrecognized_io_kind_is_not_transient_unless_connect_phase() {
        assert_eq!(kind_from_io(io::ErrorKind::BrokenPipe, false), None);
        assert_eq!(
            kind_from_io(io::ErrorKind::BrokenPipe, true),
            Some(ConnectionErrorKind::NameNotFound)
        );
    }

    #[test]
    fn rest_error_prefers_platform_message() {
        let err = Error::rest(
            404,
            json!({"message": "Not Found", "errorcode": 40400}),
            "/hub/v1/thing".to_string(),
        );
        match err {
            Error::Rest {
                status,
                message,
                code,
                ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Not Found");
                assert_eq!(code.as_deref(), Some("40400"));
            }
            other => panic!("expected Rest error, got {other:?}"),
        }
    }

    #[test]
    fn rest_error_falls_back_to_auth_shape() {
        let err = Error::rest(
            401,
            json!({"error": "invalid_client", "error_description": "Invalid client secret"}),
            "/v2/token".to_string(),
        );
        match err {
            Error::Rest { message, code, .. } => {
                assert_eq!(message, "Invalid client secret");
                assert_eq!(code.as_deref(), Some("invalid_client"));
            }
            other => panic!("expected Rest error, got {other:?}"),
        }
    }

    #[test]
    fn rest_error_without_known_shape_is_unhandled() {
        let err = Error::rest(500, json!("oops"), "/x".to_string());
        assert_eq!(err.to_string(), "Unhandled Exception. See details");
    }
}
