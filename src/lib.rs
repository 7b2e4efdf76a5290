//! Cohort dashboard indicators for a university student-information system.
//!
//! Raw semester payloads are normalized into [`models::StudentRecord`]s,
//! aggregated into cohort indicators, scanned for at-risk students and
//! memoized through the [`cache::IndicatorCache`]. [`indicators::IndicatorService`]
//! wires those stages to an [`source::AcademicSource`].

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod indicators;
pub mod models;
pub mod normalize;
pub mod report;
pub mod risk;
pub mod source;
pub mod stats;

pub use error::{Error, Result};
pub use indicators::{IndicatorService, Scope};
