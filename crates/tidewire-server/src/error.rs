//! Server-level errors.

use thiserror::Error;
use tidewire_core::RegistrationError;
use tidewire_core::settings::SettingsError;

/// Failure while registering, opening, or operating an endpoint server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the endpoint type or registering its address failed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The descriptor holds values no server can run with.
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(#[from] SettingsError),

    /// The listening socket could not be created or bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// `host:port` as configured.
        address: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    Runtime(#[source] std::io::Error),

    /// `open` was called on a running server.
    #[error("endpoint '{0}' is already open")]
    AlreadyOpen(String),

    /// `open` was called on a server that has been shut down.
    #[error("endpoint '{0}' has been shut down")]
    Closed(String),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// The registration error behind this failure, if any.
    pub fn as_registration(&self) -> Option<&RegistrationError> {
        match self {
            Self::Registration(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn registration_error_is_transparent() {
        let err: ServerError = RegistrationError::NotPublic {
            endpoint: "Chat".into(),
            method: "on_open".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "endpoint 'Chat': lifecycle method 'on_open' is not public"
        );
        assert_matches!(err, ServerError::Registration(RegistrationError::NotPublic { .. }));
    }

    #[test]
    fn bind_error_display() {
        let err = ServerError::Bind {
            address: "0.0.0.0:20000".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "failed to bind 0.0.0.0:20000: in use");
    }
}
