use std::fmt::Debug;

use anyhow::Result;

use crate::websocket::http::Extension;

/// A negotiated per-message compression extension for one connection.
///
/// The frame layer drives the methods in order for every compressed message: `start`, then data
/// for every frame, then `end`.
pub trait PerMessageCompress: Send + Debug {
    /// The extension name, such as `permessage-deflate`.
    fn extension_name(&self) -> &str;

    fn start_compress_message(&mut self) -> Result<()>;
    fn compress_message_data(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn end_compress_message(&mut self) -> Result<Vec<u8>>;

    fn start_decompress_message(&mut self) -> Result<()>;
    fn decompress_message_data(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn end_decompress_message(&mut self) -> Result<()>;
}

/// The outcome of a server accepting one of the client's compression offers.
#[derive(Debug)]
pub struct PerMessageCompressionAccept {
    /// The value for the `Sec-WebSocket-Extensions` response header.
    pub response: String,
    pub compress: Box<dyn PerMessageCompress>,
}

/// Negotiates a per-message compression extension.
///
/// Servers use [`Self::accept_offers`] on the offers parsed out of the client request. Clients
/// send [`Self::offer`] and validate the server's answer with [`Self::accept_response`].
pub trait PerMessageCompressionNegotiator: Send + Sync + Debug {
    /// The extension name this negotiator handles.
    fn extension_name(&self) -> &str;

    /// Picks one of the client's offers, if any is acceptable.
    fn accept_offers(&self, offers: &[Extension]) -> Option<PerMessageCompressionAccept>;

    /// The offer string sent by a client.
    fn offer(&self) -> String;

    /// Validates the server's response to our offer.
    fn accept_response(&self, response: &Extension) -> Result<Box<dyn PerMessageCompress>>;
}

#[cfg(test)]
pub(crate) mod compression_test_util {
    use anyhow::Result;

    use crate::websocket::{
        compression::{
            PerMessageCompress,
            PerMessageCompressionAccept,
            PerMessageCompressionNegotiator,
        },
        http::Extension,
    };

    /// A compressor that flips bits of every octet, so that it is observable on the wire.
    #[derive(Debug, Default)]
    pub struct FlippingCompress;

    impl PerMessageCompress for FlippingCompress {
        fn extension_name(&self) -> &str {
            "x-flip"
        }

        fn start_compress_message(&mut self) -> Result<()> {
            Ok(())
        }

        fn compress_message_data(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().map(|byte| byte ^ 0x5a).collect())
        }

        fn end_compress_message(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn start_decompress_message(&mut self) -> Result<()> {
            Ok(())
        }

        fn decompress_message_data(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().map(|byte| byte ^ 0x5a).collect())
        }

        fn end_decompress_message(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct FlippingNegotiator;

    impl PerMessageCompressionNegotiator for FlippingNegotiator {
        fn extension_name(&self) -> &str {
            "x-flip"
        }

        fn accept_offers(&self, offers: &[Extension]) -> Option<PerMessageCompressionAccept> {
            offers
                .iter()
                .find(|offer| offer.name == "x-flip")
                .map(|_| PerMessageCompressionAccept {
                    response: "x-flip".to_owned(),
                    compress: Box::new(FlippingCompress),
                })
        }

        fn offer(&self) -> String {
            "x-flip".to_owned()
        }

        fn accept_response(&self, _: &Extension) -> Result<Box<dyn PerMessageCompress>> {
            Ok(Box::new(FlippingCompress))
        }
    }
}
