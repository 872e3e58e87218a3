//! Observability hooks: shared pipeline counters and the per-turn latency
//! report delivered to a pluggable sink. Exporters are out of scope; the
//! default sink writes structured log events.

pub mod pipeline_metrics;
pub mod turn_report;

pub use pipeline_metrics::PipelineMetrics;
pub use turn_report::{LogSink, MetricsSink, NullSink, TurnReport};
