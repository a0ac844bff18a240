//! # mpipe server
//!
//! HTTP front of an mpipe broker node:
//!
//! - `POST /register`, `POST /heartbeat`: consumer discovery RPCs
//! - `POST /pipes/{name}/messages`: produce
//! - `GET /pipes/{name}`, `GET|DELETE /pipes/{name}/dead-letters`: inspection
//! - `GET /metrics/report`, `GET /health`

pub mod error;
pub mod routes;
pub mod shutdown;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::{AppState, router};
pub use shutdown::shutdown_signal;
