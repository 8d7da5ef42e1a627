//! Read-side queries and service mutations built on `Application`.
pub mod ports;
pub mod state;
