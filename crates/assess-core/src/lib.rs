//! Adaptive multi-phase assessment engine.
//!
//! The `assessment` module owns the core state machine: it builds question
//! sequences from prior answers, folds answers into per-entity score buckets,
//! detects cross-entity patterns, and decides whether to branch into a
//! bounded refinement phase. Persistence and presentation stay behind the
//! `ProgressStore` trait and the render-request/answer-event types so the
//! engine never touches storage or markup directly.

pub mod assessment;
pub mod config;
pub mod error;
pub mod telemetry;
