//! Streaming generation service for interactive lesson code.
//!
//! A job moves through a small pipeline (generate, validate, auto-fix) while
//! its progress is published through an in-process event broker and pushed to
//! observers over SSE. The [`consumer`] module is the matching client side.

pub mod api;
pub mod broker;
pub mod consumer;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod server;
pub mod store;
pub mod transport;
