use async_trait::async_trait;
use oxalert_common::types::{PlottingConfig, TriggerSnapshot};

/// External plot service.
///
/// Renders the metrics a notification refers to as an image. Failures are
/// tolerated by the dispatcher: the notification goes out without a plot.
#[async_trait]
pub trait PlotRenderer: Send + Sync {
    async fn render(
        &self,
        trigger: &TriggerSnapshot,
        metrics: &[String],
        plotting: &PlottingConfig,
        from: i64,
        until: i64,
    ) -> anyhow::Result<Vec<u8>>;
}
