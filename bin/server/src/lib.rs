//! gatehouse web server.
//!
//! Binds the `gatehouse-gateway` OAuth2 core to axum: service routes
//! under the configured basepath, plus middleware for protecting
//! application routes.

pub mod auth;
pub mod config;
