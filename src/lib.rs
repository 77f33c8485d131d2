//! Content-addressed cache for pre-rendered HTML pages.
//!
//! The [`cache`] module holds the core (key derivation, storage backends, the
//! gateway policy and the render-pipeline hooks). [`config`] and [`infra`]
//! carry the service around it.

pub mod cache;
pub mod config;
pub mod infra;
