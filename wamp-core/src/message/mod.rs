pub mod cache;
pub mod common;
pub mod message;
pub mod payload;
pub(crate) mod validate;
