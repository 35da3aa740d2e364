use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

use crate::types::SeriesId;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers can provide an implementation that forwards these events to
/// `tracing`, metrics, or custom sinks. [`TracingEventListener`] does the former.
pub trait IndexEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: IndexEvent);
}

/// Structured events emitted by the index.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    MeasurementCreated {
        measurement: String,
    },
    SeriesCreated {
        measurement: String,
        id: SeriesId,
        key: String,
    },
    SeriesDropped {
        measurement: String,
        id: SeriesId,
        key: String,
    },
    TombstonesReaped {
        reaped: usize,
    },
    CardinalityLimitExceeded {
        scope: String,
        current: u64,
        limit: u64,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl IndexEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: IndexEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn IndexEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing`. Creation and drop of single series log at `trace`,
/// limit rejections at `warn`, everything else at `debug`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl IndexEventListener for TracingEventListener {
    fn on_event(&self, event: IndexEvent) {
        match event {
            IndexEvent::MeasurementCreated { measurement } => {
                tracing::debug!(measurement = %measurement, "measurement created");
            }
            IndexEvent::SeriesCreated {
                measurement,
                id,
                key,
            } => {
                tracing::trace!(measurement = %measurement, id, key = %key, "series created");
            }
            IndexEvent::SeriesDropped {
                measurement,
                id,
                key,
            } => {
                tracing::trace!(measurement = %measurement, id, key = %key, "series dropped");
            }
            IndexEvent::TombstonesReaped { reaped } => {
                tracing::debug!(reaped, "tombstoned series reaped");
            }
            IndexEvent::CardinalityLimitExceeded {
                scope,
                current,
                limit,
            } => {
                tracing::warn!(scope = %scope, current, limit, "series cardinality limit exceeded");
            }
        }
    }
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting metrics is effectively a no-op until a recorder is installed.
pub mod index_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const SERIES_CREATED: &str = "ugnos_index_series_created";
    pub const SERIES_DROPPED: &str = "ugnos_index_series_dropped";
    pub const SERIES_LIVE: &str = "ugnos_index_series_live";
    pub const MEASUREMENTS: &str = "ugnos_index_measurements";
    pub const TOMBSTONES_REAPED: &str = "ugnos_index_tombstones_reaped";
    pub const CARDINALITY_REJECTIONS: &str = "ugnos_index_cardinality_rejections";
    pub const IDS_FOR_EXPR_DURATION_SECONDS: &str = "ugnos_index_ids_for_expr_duration_seconds";
    pub const TAG_SETS_DURATION_SECONDS: &str = "ugnos_index_tag_sets_duration_seconds";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("ugnos-index-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_series_created(live: u64) {
        ::metrics::counter!(SERIES_CREATED).increment(1);
        ::metrics::gauge!(SERIES_LIVE).set(live as f64);
    }

    #[inline]
    pub fn record_series_dropped(live: u64) {
        ::metrics::counter!(SERIES_DROPPED).increment(1);
        ::metrics::gauge!(SERIES_LIVE).set(live as f64);
    }

    #[inline]
    pub fn record_measurements(count: usize) {
        ::metrics::gauge!(MEASUREMENTS).set(count as f64);
    }

    #[inline]
    pub fn record_tombstones_reaped(reaped: usize) {
        if reaped > 0 {
            ::metrics::counter!(TOMBSTONES_REAPED).increment(reaped as u64);
        }
    }

    #[inline]
    pub fn record_cardinality_rejection() {
        ::metrics::counter!(CARDINALITY_REJECTIONS).increment(1);
    }

    #[inline]
    pub fn record_ids_for_expr(duration: Duration) {
        ::metrics::histogram!(IDS_FOR_EXPR_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_tag_sets(duration: Duration) {
        ::metrics::histogram!(TAG_SETS_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Registers descriptions for every index metric with the installed recorder.
    pub fn describe_all() {
        // Counters
        describe_counter!(
            SERIES_CREATED,
            Unit::Count,
            "Total number of series created via Index::create_series_if_not_exists."
        );
        describe_counter!(
            SERIES_DROPPED,
            Unit::Count,
            "Total number of series dropped via Index::drop_series."
        );
        describe_counter!(
            TOMBSTONES_REAPED,
            Unit::Count,
            "Total number of tombstoned series physically removed after in-flight reads ended."
        );
        describe_counter!(
            CARDINALITY_REJECTIONS,
            Unit::Count,
            "Series creations rejected by a cardinality limit."
        );

        // Histograms
        describe_histogram!(
            IDS_FOR_EXPR_DURATION_SECONDS,
            Unit::Seconds,
            "Time to resolve a tag predicate to series ids."
        );
        describe_histogram!(
            TAG_SETS_DURATION_SECONDS,
            Unit::Seconds,
            "Time to resolve and group series for a tag-set query."
        );

        // Gauges
        describe_gauge!(SERIES_LIVE, Unit::Count, "Live series across all measurements.");
        describe_gauge!(MEASUREMENTS, Unit::Count, "Number of measurements in the index.");
    }
}
