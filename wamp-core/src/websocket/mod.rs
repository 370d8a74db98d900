pub mod client_handshake;
pub mod close;
pub mod compression;
pub mod connection;
pub mod error;
pub mod frame;
pub mod http;
pub mod mask;
pub mod options;
pub mod protocol;
pub mod server_handshake;
pub mod url;
pub mod utf8;
