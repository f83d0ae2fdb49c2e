//! Count source transports.

mod http;
pub mod wire;

pub use http::HttpCountSource;
