use anyhow::Error;
use thiserror::Error;

use crate::core::{
    id::Id,
    uri::Uri,
};

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    ///
    /// WAMP defines standard URIs for not finding specific resource types. This error should only
    /// be used when the standard URI cannot be used.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed based on process configuration.
    #[error("{0}")]
    NotAllowed(String),
    /// The operation is not allowed based on user permissions.
    #[error("{0}")]
    PermissionDenied(String),
    /// Some internal error occurred.
    ///
    /// Should only be used when there is no other error variant that describes the error, since
    /// the message is very vague and not very useful for debugging.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are clearly defined in the WAMP standard and are reserved for errors that
/// peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A URI in the request is invalid for the configured URI check.
    #[error("{0}")]
    InvalidUri(String),
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// The role being referenced does not exist.
    #[error("no such role")]
    NoSuchRole,
    /// The session is not authorized to perform the action.
    #[error("{0}")]
    NotAuthorized(String),
    /// Authorization of the action could not be completed.
    #[error("{0}")]
    AuthorizationFailed(String),
    /// Authentication of the session failed.
    #[error("{0}")]
    AuthenticationFailed(String),
    /// No authentication method offered by the peer is supported.
    #[error("no suitable authentication method")]
    NoAuthMethod,
    /// The operation was canceled.
    #[error("{0}")]
    Canceled(String),
    /// The operation is recognized but not implemented.
    #[error("{0}")]
    NotImplemented(String),
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::InvalidUri(_) => "invalid_uri",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::NoSuchRole => "no_such_role",
            Self::NotAuthorized(_) => "not_authorized",
            Self::AuthorizationFailed(_) => "authorization_failed",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::NoAuthMethod => "no_auth_method",
            Self::Canceled(_) => "canceled",
            Self::NotImplemented(_) => "not_implemented",
        }
    }
}

/// A message received from a peer that does not follow the WAMP message rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self(message.into())
    }
}

/// An application-defined error, identified by an arbitrary URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WampError {
    uri: Uri,
    message: String,
}

impl WampError {
    pub fn new<S>(uri: Uri, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            uri,
            message: message.into(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

impl Uri {
    /// The error URI for an error.
    ///
    /// Errors that are not part of the WAMP taxonomy map to `wamp.error.internal`.
    pub fn for_error(error: &Error) -> Uri {
        if let Some(error) = error.downcast_ref::<WampError>() {
            return error.uri.clone();
        }
        let component = if let Some(error) = error.downcast_ref::<InteractionError>() {
            error.uri_component()
        } else if let Some(error) = error.downcast_ref::<BasicError>() {
            error.uri_component()
        } else if error.downcast_ref::<ProtocolError>().is_some() {
            "protocol_violation"
        } else {
            "internal"
        };
        Uri::from_known(format!("wamp.error.{component}"))
    }
}

/// Creates an [`struct@Error`] from a URI error reason and message.
pub fn error_from_uri_reason_and_message(reason: Uri, message: String) -> Error {
    match reason.as_ref() {
        "wamp.error.not_found" => BasicError::NotFound(message).into(),
        "wamp.error.invalid_argument" => BasicError::InvalidArgument(message).into(),
        "wamp.error.not_allowed" => BasicError::NotAllowed(message).into(),
        "wamp.error.permission_denied" => BasicError::PermissionDenied(message).into(),
        "wamp.error.internal" => BasicError::Internal(message).into(),
        "wamp.error.protocol_violation" => InteractionError::ProtocolViolation(message).into(),
        "wamp.error.invalid_uri" => InteractionError::InvalidUri(message).into(),
        "wamp.error.no_such_procedure" => InteractionError::NoSuchProcedure.into(),
        "wamp.error.procedure_already_exists" => InteractionError::ProcedureAlreadyExists.into(),
        "wamp.error.no_such_registration" => InteractionError::NoSuchRegistration.into(),
        "wamp.error.no_such_subscription" => InteractionError::NoSuchSubscription.into(),
        "wamp.error.no_such_realm" => InteractionError::NoSuchRealm.into(),
        "wamp.error.no_such_role" => InteractionError::NoSuchRole.into(),
        "wamp.error.not_authorized" => InteractionError::NotAuthorized(message).into(),
        "wamp.error.authorization_failed" => InteractionError::AuthorizationFailed(message).into(),
        "wamp.error.authentication_failed" => {
            InteractionError::AuthenticationFailed(message).into()
        }
        "wamp.error.no_auth_method" => InteractionError::NoAuthMethod.into(),
        "wamp.error.canceled" => InteractionError::Canceled(message).into(),
        "wamp.error.not_implemented" => InteractionError::NotImplemented(message).into(),
        _ => WampError::new(reason, message).into(),
    }
}

/// An error that can be transmitted over channels.
#[derive(Debug, Clone)]
pub struct ChannelTransmittableError {
    pub reason: Uri,
    pub message: String,
    pub request_id: Option<Id>,
}

impl ChannelTransmittableError {
    /// Converts the error into a real Error object that can be returned out.
    pub fn into_error(self) -> Error {
        error_from_uri_reason_and_message(self.reason, self.message)
    }
}

impl From<&Error> for ChannelTransmittableError {
    fn from(value: &Error) -> Self {
        Self {
            reason: Uri::for_error(value),
            message: value.to_string(),
            request_id: None,
        }
    }
}

impl From<Error> for ChannelTransmittableError {
    fn from(value: Error) -> Self {
        Self::from(&value)
    }
}

/// Type alias for a channel-transmittable result.
///
/// Assumes `T` is channel-transmittable.
pub type ChannelTransmittableResult<T> = Result<T, ChannelTransmittableError>;
