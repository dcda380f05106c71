use std::fmt::Write as _;
use std::time::Duration;

use crate::registry::{Registry, SeriesSnapshot, ITERATION_METRIC};

pub type Result<T> = std::result::Result<T, PushError>;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("push gateway returned status {0}")]
    Status(u16),
}

/// Pushes the cumulative registry to a Prometheus push gateway in text
/// exposition format under a fixed job name.
#[derive(Debug, Clone)]
pub struct Pusher {
    client: reqwest::Client,
    url: String,
}

impl Pusher {
    pub fn new(gateway: &str, job: &str) -> Self {
        let base = gateway.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            url: format!("{base}/metrics/job/{job}"),
        }
    }

    pub async fn push(&self, registry: &Registry) -> Result<()> {
        let body = render_exposition(&registry.gather(), registry.dropped_total());

        let response = self.client.put(&self.url).body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Status(status.as_u16()));
        }
        Ok(())
    }
}

fn seconds(d: Duration) -> f64 {
    d.as_secs_f64()
}

fn render_exposition(snapshots: &[SeriesSnapshot], dropped: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# TYPE {ITERATION_METRIC} summary");

    for s in snapshots {
        let labels_base = format!(
            "phase=\"{}\",result=\"{}\",stage=\"{}\"",
            s.key.phase.as_str(),
            s.key.outcome.as_str(),
            s.key.stage
        );
        for q in &s.quantiles {
            let _ = writeln!(
                out,
                "{ITERATION_METRIC}{{{labels_base},quantile=\"{}\"}} {}",
                q.quantile,
                seconds(q.value)
            );
        }
        let _ = writeln!(out, "{ITERATION_METRIC}_sum{{{labels_base}}} {}", seconds(s.sum));
        let _ = writeln!(out, "{ITERATION_METRIC}_count{{{labels_base}}} {}", s.count);
    }

    let _ = writeln!(out, "# TYPE {ITERATION_METRIC}_dropped_total counter");
    let _ = writeln!(out, "{ITERATION_METRIC}_dropped_total {dropped}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outcome, Phase};

    #[test]
    fn exposition_includes_quantiles_count_and_dropped() {
        let reg = Registry::default();
        reg.record(Phase::Iteration, Outcome::Success, "single", Duration::from_millis(20));
        reg.record_dropped();

        let body = render_exposition(&reg.gather(), reg.dropped_total());

        assert!(body.contains("# TYPE stampede_iteration summary"));
        assert!(body.contains(
            "stampede_iteration_count{phase=\"iteration\",result=\"success\",stage=\"single\"} 1"
        ));
        assert!(body.contains("quantile=\"0.5\""));
        assert!(body.contains("stampede_iteration_dropped_total 1"));
    }

    #[test]
    fn pusher_url_strips_trailing_slash() {
        let pusher = Pusher::new("http://gateway:9091/", "stampede-demo");
        assert_eq!(pusher.url, "http://gateway:9091/metrics/job/stampede-demo");
    }
}
