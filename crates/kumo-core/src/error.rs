//! Error types for kumo-core.
//!
//! Every failure the library reports is a variant of [`Error`]. Variants fall into
//! a small number of classes (see [`ErrorClass`]) so that a polling loop can decide
//! whether to back off the whole account, a single device, or just try again later.
//!
//! Firmware fault markers are deliberately *not* errors: they arrive on an otherwise
//! successful response and are reported through
//! [`DeviceResponse::fault`](crate::device::DeviceResponse::fault).

use thiserror::Error;

/// Error type for kumo-core operations.
///
/// `Clone` so that one in-flight token refresh can hand the same result to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The cloud rejected the username/password pair.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The refresh token is expired, revoked, or was already rotated.
    #[error("refresh token expired or no longer valid")]
    RefreshTokenExpired,

    /// The locally held access token is past its expiry (minus the safety margin).
    #[error("access token expired")]
    AccessTokenExpired,

    /// No credential has been obtained yet, or it was discarded by logout.
    #[error("not logged in")]
    NotLoggedIn,

    /// A cloud resource call was rejected with HTTP 401 despite a locally valid token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The cloud could not be reached (DNS, connect, TLS, timeout).
    #[error("cloud unreachable: {0}")]
    CloudUnreachable(String),

    /// The cloud answered with an unexpected non-success status.
    #[error("cloud error: {0}")]
    Cloud(String),

    /// Connection to a device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A device exchange timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A device answered with a non-2xx HTTP status.
    #[error("device at {address} returned HTTP {status}")]
    HttpStatus {
        /// Local address of the adapter.
        address: String,
        /// HTTP status code.
        status: u16,
    },

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(String),

    /// A device could not be reached; wraps the underlying transport failure.
    #[error("device {serial} unreachable: {reason}")]
    DeviceUnreachable {
        /// Device serial.
        serial: String,
        /// Transport failure description.
        reason: String,
    },

    /// The device response did not decrypt to valid JSON.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The cloud reported a `cryptoKeySet` this client does not know how to derive.
    #[error("unsupported key version: {0}")]
    UnsupportedKeyVersion(String),

    /// Device identity parameters are malformed (e.g. non-hex cryptoSerial).
    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),

    /// A session's key material was rejected by the device earlier; the identity must
    /// be re-fetched before talking to it again.
    #[error("key material for device {serial} was rejected; identity must be re-fetched")]
    KeyMaterialRejected {
        /// Device serial.
        serial: String,
    },

    /// The device answered a command with an API error marker.
    #[error("device rejected request: {0}")]
    DeviceRejected(String),

    /// No session exists for this serial (or the cloud does not know it).
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Protocol error (unexpected response format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to parse a response.
    #[error("parse error: {0}")]
    ParseError(String),
}

/// Broad class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad username/password, expired or unknown tokens. Needs re-authentication.
    Credential,
    /// Network, timeout, or HTTP-level failure. Retry later with backoff.
    Transport,
    /// Key material mismatch. Fatal for the device until its identity is re-fetched.
    KeyMaterial,
    /// The device refused a request or is not known.
    Device,
    /// Malformed data from the cloud or a device.
    Protocol,
}

/// What a caller should back off from after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackoffScope {
    /// Stop cloud activity for the account until credentials are fixed.
    Account,
    /// Stop talking to this device until it is re-bootstrapped.
    Device,
    /// Transient; try again on the next cycle.
    Transient,
}

impl Error {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidCredentials(_)
            | Error::RefreshTokenExpired
            | Error::AccessTokenExpired
            | Error::NotLoggedIn
            | Error::Unauthorized(_) => ErrorClass::Credential,
            Error::CloudUnreachable(_)
            | Error::Cloud(_)
            | Error::ConnectionFailed(_)
            | Error::Timeout(_)
            | Error::HttpStatus { .. }
            | Error::Io(_)
            | Error::DeviceUnreachable { .. } => ErrorClass::Transport,
            Error::Decryption(_)
            | Error::UnsupportedKeyVersion(_)
            | Error::InvalidIdentity(_)
            | Error::KeyMaterialRejected { .. } => ErrorClass::KeyMaterial,
            Error::DeviceRejected(_) | Error::UnknownDevice(_) => ErrorClass::Device,
            Error::Protocol(_) | Error::ParseError(_) => ErrorClass::Protocol,
        }
    }

    /// Returns the scope a caller should back off from.
    pub fn backoff_scope(&self) -> BackoffScope {
        match self.class() {
            ErrorClass::Credential => BackoffScope::Account,
            ErrorClass::KeyMaterial | ErrorClass::Device => BackoffScope::Device,
            ErrorClass::Transport | ErrorClass::Protocol => BackoffScope::Transient,
        }
    }

    /// Returns `true` for network, timeout and HTTP-level failures.
    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::ParseError(err.to_string())
        } else {
            Error::CloudUnreachable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_errors_back_off_account() {
        for err in [
            Error::InvalidCredentials("bad".into()),
            Error::RefreshTokenExpired,
            Error::NotLoggedIn,
            Error::Unauthorized("401".into()),
        ] {
            assert_eq!(err.class(), ErrorClass::Credential);
            assert_eq!(err.backoff_scope(), BackoffScope::Account);
        }
    }

    #[test]
    fn test_key_errors_back_off_device() {
        let err = Error::KeyMaterialRejected {
            serial: "0123".into(),
        };
        assert_eq!(err.class(), ErrorClass::KeyMaterial);
        assert_eq!(err.backoff_scope(), BackoffScope::Device);
        assert_eq!(
            Error::UnsupportedKeyVersion("9".into()).backoff_scope(),
            BackoffScope::Device
        );
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let err = Error::HttpStatus {
            address: "192.168.1.20".into(),
            status: 500,
        };
        assert!(err.is_transport());
        assert_eq!(err.backoff_scope(), BackoffScope::Transient);
        assert!(!Error::Decryption("x".into()).is_transport());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transport());
    }
}
