//! HTTP client for the try-on executor's REST surface.

mod client;
mod error;

pub use client::Client;
pub use error::BackendError;
