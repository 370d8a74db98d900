pub mod anonymous;
pub mod auth_method;
pub mod authenticator;
pub mod identity;
pub mod message;
pub mod ticket;
pub mod wampcra;

pub use identity::Identity;
