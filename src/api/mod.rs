//! HTTP surfaces: the client-facing gateway and the read-only dashboard.

pub mod dashboard;
pub mod gateway;
pub mod request_id;
