//! MSME Risk Prediction API Library
//!
//! This library serves a pre-trained gradient-boosted-tree risk classifier for
//! micro, small and medium enterprises over HTTP. A request flows through
//! payload decoding, feature vectorization, model scoring and response shaping.
//!
//! # Modules
//!
//! - `api`: API definitions.
//! - `core`: Core scoring pipeline.
//! - `artifact`: Model artifact loading and validation.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.
//! - `features`: Feature schema and vectorization.
//! - `handlers`: HTTP request handlers and router.
//! - `health`: Readiness reporting and the shared model handle.
//! - `inference`: Tree-ensemble scoring and risk bands.
//! - `models`: Request and response models.

pub mod api;
pub mod core;

pub mod artifact;
pub mod config;
pub mod errors;
pub mod features;
pub mod handlers;
pub mod health;
pub mod inference;
pub mod models;
