use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

/// Install a global meter provider exporting over OTLP. Without a provider
/// every instrument is a no-op.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "containerd"))
        .with_attribute(KeyValue::new("service.name", "containerd-zvol-snapshotter"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between `start_with_labels` and drop.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

pub mod snapshotter_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
        pub operation_errors: Counter<u64>,
        pub volume_commands: Histogram<f64>,
        pub device_waits: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("zvol-snapshotter");

            let operations = meter
                .f64_histogram("zvol_snapshotter.operation_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("snapshot operation latencies in seconds")
                .build();

            let operation_errors = meter
                .u64_counter("zvol_snapshotter.operation_errors")
                .with_description("number of failed snapshot operations")
                .build();

            let volume_commands = meter
                .f64_histogram("zvol_snapshotter.volume_command_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("volume manager command latencies in seconds")
                .build();

            let device_waits = meter
                .f64_histogram("zvol_snapshotter.device_wait_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time spent waiting for block devices in seconds")
                .build();

            Metrics {
                operations,
                operation_errors,
                volume_commands,
                device_waits,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder(Mutex<Vec<(Duration, usize)>>);

    impl TimerUpdate for Recorder {
        fn add(&self, duration: Duration, labels: &[KeyValue]) {
            self.0.lock().unwrap().push((duration, labels.len()));
        }
    }

    #[test]
    fn test_timer_records_on_drop() {
        let recorder = Recorder(Mutex::new(vec![]));
        let labels = [KeyValue::new("op", "prepare")];
        {
            let _timer = Timer::start_with_labels(&recorder, &labels);
            std::thread::sleep(Duration::from_millis(2));
        }
        let recorded = recorder.0.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].0 >= Duration::from_millis(2));
        assert_eq!(recorded[0].1, 1);
    }

    #[test]
    fn test_disabled_provider_is_noop() {
        let provider = init_provider(false, None, Duration::from_secs(5), "test").unwrap();
        assert!(provider.is_none());
        let metrics = snapshotter_stats::Metrics::new();
        metrics.operation_errors.increment(&[KeyValue::new("op", "commit")]);
    }
}
