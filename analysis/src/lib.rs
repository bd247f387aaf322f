//! Aggregation and reporting for benchmark timings.
//!
//! The runner feeds every attempt into an [`Aggregator`]; once the matrix is
//! done (or aborted) a [`Report`] renders the per benchmark/backend grid.

pub mod report;
pub mod stats;

pub use report::{Report, ReportError, ReportMeta, NOT_RUN};
pub use stats::{trimmed_mean, Aggregator, Outcome, Series, SeriesKey, Summary};
