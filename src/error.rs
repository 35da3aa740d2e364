use thiserror::Error;

/// Error type for index operations that can fail for reasons outside the index itself.
///
/// Routine conditions (absent series, duplicate add, double drop, unknown id) are never errors;
/// they are reported through boolean results or skipped. Broken internal invariants are not
/// errors either: they abort through [`invariant_violation`].
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory map {op} failed: {source}")]
    Mmap {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid regex pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    /// Series cardinality limit exceeded for the given scope (a measurement or "global").
    #[error("Series cardinality limit exceeded: current={current}, limit={limit}, scope={scope}")]
    SeriesCardinalityLimitExceeded {
        /// Current number of live series in the scope.
        current: u64,
        /// Configured hard limit.
        limit: u64,
        /// Scope identifier (measurement name or "global").
        scope: String,
    },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    /// Reported by explicit consistency checks such as `Measurement::verify`.
    #[error("Index inconsistent: {0}")]
    Inconsistent(String),
}

impl From<::config::ConfigError> for IndexError {
    fn from(err: ::config::ConfigError) -> Self {
        IndexError::ConfigError(err.to_string())
    }
}

/// Aborts on a broken index invariant.
///
/// A tag index that references an id missing from its measurement (or the reverse) means the
/// mutation path is defective; answering queries from that state would return wrong results.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(details: impl std::fmt::Display) -> ! {
    panic!("series index invariant violated: {}", details)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinality_error_display() {
        let err = IndexError::SeriesCardinalityLimitExceeded {
            current: 2,
            limit: 2,
            scope: "cpu".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Series cardinality limit exceeded: current=2, limit=2, scope=cpu"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IndexError = io_err.into();
        assert!(matches!(err, IndexError::Io(_)));
    }

    #[test]
    #[should_panic(expected = "series index invariant violated: id 7 missing")]
    fn invariant_violation_panics() {
        invariant_violation("id 7 missing");
    }
}
