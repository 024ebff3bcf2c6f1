//! Optical recognition subsystem.
//!
//! Only the OCR path touches these components, and only lazily:
//!
//! 1. [`device`]: cached, TTL-bounded accelerated-hardware probe
//! 2. [`models`]: on-disk model artifacts, downloaded under a per-model lock
//! 3. [`engine`]: the singleton engine, its construction parameters and the
//!    one-shot compatibility downgrade
//! 4. [`tesseract`]: the default [`engine::EngineFactory`]
//!
//! [`cloud`] replaces all four with a hosted whole-document service when the
//! pipeline runs in cloud mode.

pub mod cloud;
pub mod device;
pub mod engine;
pub mod models;
pub mod tesseract;
