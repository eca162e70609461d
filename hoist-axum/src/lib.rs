//! # hoist-axum: HTTP facade for the Hoist work-queue platform
//!
//! A thin layer over the admin plane: JSON parsing and validation, the
//! uniform error envelope `{error, code, details, request_id}`, bearer
//! token verification, tenant resolution, per-operation authorization
//! and audit recording. No business logic lives here.

pub mod app;
pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

pub use app::{router, serve};
pub use error::ApiError;
pub use extract::ReqCtx;
pub use state::ApiState;
