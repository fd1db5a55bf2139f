//! Backend transport and token refresh.

pub mod http;
pub mod refresh;
