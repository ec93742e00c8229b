//! HTTP boundary: request extraction, routing, and error-kind to status mapping.

pub mod error;
pub mod routes;
