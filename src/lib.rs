#![doc = include_str!("../README.md")]
// Declare modules
pub mod config;
pub mod error;
pub mod index;
mod lock_order;
pub mod measurement;
pub mod mmap;
pub mod predicate;
pub mod series;
pub mod series_id_set;
pub mod tag_value_index;
pub mod telemetry;
pub mod types;

/// Configuration options for the index.
pub use crate::config::IndexConfig;
/// Error type for index operations.
pub use crate::error::IndexError;
/// Main entry point: measurements, series creation and lookup, predicate resolution.
pub use crate::index::{Index, IndexStats};
/// Per-measurement registry and its grouping output.
pub use crate::measurement::{Measurement, TagGroup};
/// Tag predicate tree evaluated against tag indexes.
pub use crate::predicate::{Predicate, TagCondition, TagMatcher};
/// One time series.
pub use crate::series::Series;
/// Sorted set of series ids with set algebra.
pub use crate::series_id_set::SeriesIdSet;
/// Inverted index for one tag key.
pub use crate::tag_value_index::TagValueIndex;
/// Structured event hook for observability.
pub use crate::telemetry::{IndexEvent, IndexEventListener, TracingEventListener};
/// Series identifier and tag types.
pub use crate::types::{SeriesId, Tag, TagSet, Tags};
