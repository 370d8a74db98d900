use anyhow::Error;

use crate::{
    core::{
        close::CloseReason,
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        message::{
            AbortMessage,
            ErrorMessage,
            GoodbyeMessage,
            Message,
        },
        payload::Payload,
    },
};

/// ABORT message for an error, carrying the error message in the details.
pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))]),
        reason: Uri::for_error(error),
    })
}

pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// ERROR message answering a request.
///
/// The error message is the only positional argument.
pub fn error_for_request(message: &Message, error: &Error) -> Message {
    Message::Error(ErrorMessage {
        request_type: message.tag(),
        request: message.request_id().unwrap_or(Id::MIN),
        details: Dictionary::default(),
        error: Uri::for_error(error),
        payload: Payload::from_arguments(List::from_iter([Value::String(error.to_string())])),
    })
}

/// ERROR message answering a CALL on behalf of the dealer.
pub fn call_error(call_request: Id, error: &Error) -> Message {
    Message::Error(ErrorMessage {
        request_type: Message::CALL_TAG,
        request: call_request,
        details: Dictionary::default(),
        error: Uri::for_error(error),
        payload: Payload::from_arguments(List::from_iter([Value::String(error.to_string())])),
    })
}

#[cfg(test)]
mod common_test {
    use anyhow::Error;

    use crate::{
        core::{
            error::InteractionError,
            id::Id,
            types::{
                Dictionary,
                Value,
            },
        },
        message::{
            common::{
                abort_message_for_error,
                call_error,
                error_for_request,
            },
            message::{
                Message,
                PublishMessage,
            },
        },
    };

    #[test]
    fn error_carries_message_as_argument() {
        let request = Message::Publish(PublishMessage {
            request: Id::try_from(42).unwrap(),
            topic: "com.x".try_into().unwrap(),
            ..Default::default()
        });
        let error = Error::from(InteractionError::NotAuthorized(
            "session not authorized to publish to topic 'com.x'".to_owned(),
        ));
        assert_matches::assert_matches!(error_for_request(&request, &error), Message::Error(message) => {
            pretty_assertions::assert_eq!(message.request_type, Message::PUBLISH_TAG);
            pretty_assertions::assert_eq!(message.request, Id::try_from(42).unwrap());
            pretty_assertions::assert_eq!(message.details, Dictionary::default());
            pretty_assertions::assert_eq!(message.error.as_str(), "wamp.error.not_authorized");
            pretty_assertions::assert_eq!(
                message.payload.arguments(),
                &[Value::from("session not authorized to publish to topic 'com.x'")]
            );
        });
    }

    #[test]
    fn abort_carries_message_in_details() {
        let error = Error::from(InteractionError::NoSuchRealm);
        assert_matches::assert_matches!(abort_message_for_error(&error), Message::Abort(message) => {
            pretty_assertions::assert_eq!(message.reason.as_str(), "wamp.error.no_such_realm");
            assert!(message.details.contains_key("message"));
        });
    }

    #[test]
    fn call_error_targets_call_request() {
        let error = Error::from(InteractionError::Canceled("callee disconnected".to_owned()));
        assert_matches::assert_matches!(call_error(Id::try_from(9).unwrap(), &error), Message::Error(message) => {
            pretty_assertions::assert_eq!(message.request_type, Message::CALL_TAG);
            pretty_assertions::assert_eq!(message.request, Id::try_from(9).unwrap());
            pretty_assertions::assert_eq!(message.error.as_str(), "wamp.error.canceled");
            pretty_assertions::assert_eq!(
                message.payload.arguments(),
                &[Value::from("callee disconnected")]
            );
        });
    }
}
