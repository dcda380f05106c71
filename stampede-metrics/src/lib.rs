pub mod push;
pub mod registry;

pub use push::{PushError, Pusher};
pub use registry::{
    IterationMetrics, Outcome, Phase, Quantile, Registry, SeriesKey, SeriesSnapshot,
    WindowSnapshot, DEFAULT_STAGE, ITERATION_METRIC,
};
