use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};

/// A transport, over which serialized WAMP messages can be sent and received.
///
/// Implemented as a [`Stream`] and [`Sink`] of whole messages. Health checks, such as pings, are
/// handled by the underlying connection and never reach this layer. Protocol violations are
/// reported as errors to be handled at higher layers.
pub trait Transport:
    Send + Stream<Item = Result<Vec<u8>>> + Sink<Vec<u8>, Error = Error> + Unpin + Debug
{
}
