//! # academic-engine
//!
//! Background computation engine for academic data.
//!
//! Runs grade calculations, predictions and anomaly scans as asynchronous
//! jobs with a concurrency cap, memoizes their results, and measures its own
//! health and error rate. Statistical models and record storage are
//! collaborators plugged in through traits.

pub mod anomaly;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use engine::{EngineBuilder, ProcessingEngine, SubjectRisk, SubmitResult};
pub use error::{Error, Result};
