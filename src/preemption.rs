//! Cloud preemption watcher.
//!
//! On preemptible cloud instances the metadata service announces an
//! upcoming interruption a little ahead of time. The watcher polls every
//! 15 seconds and triggers an orderly node shutdown on any interruption
//! verdict, giving sessions a chance to tear down before the host
//! disappears.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{NodeError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(15);

const AWS_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/spot/instance-action";
const AZURE_METADATA_URL: &str =
    "http://169.254.169.254/metadata/scheduledevents?api-version=2019-08-01";

/// Which cloud's metadata service to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionMonitorType {
    Aws,
    Azure,
}

impl PreemptionMonitorType {
    /// Parse the config value; empty means no monitor.
    ///
    /// # Errors
    ///
    /// `NodeError::Config` for an unknown value.
    pub fn from_option(value: &str) -> Result<Option<Self>> {
        match value {
            "" => Ok(None),
            "aws" => Ok(Some(Self::Aws)),
            "azure" => Ok(Some(Self::Azure)),
            other => Err(NodeError::Config(format!(
                "unknown preemption monitor '{other}'"
            ))),
        }
    }
}

/// Start the watcher. `stop_running` is cancelled when the instance is
/// about to be interrupted; `cancel` stops the watcher itself.
pub fn start(
    kind: PreemptionMonitorType,
    stop_running: CancellationToken,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(?kind, "running preemption monitor");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let preempted = match kind {
                PreemptionMonitorType::Aws => poll_aws(&client).await,
                PreemptionMonitorType::Azure => poll_azure(&client).await,
            };
            if preempted {
                stop_running.cancel();
                break;
            }
        }
        info!(?kind, "stopped preemption monitor");
    })
}

/// AWS spot interruption: the endpoint 404s until an interruption is
/// scheduled, then carries `{"action": "stop"|"terminate", "time": ...}`.
async fn poll_aws(client: &reqwest::Client) -> bool {
    let Ok(response) = client.get(AWS_METADATA_URL).send().await else {
        return false;
    };
    if !response.status().is_success() {
        // normal case: no interruption scheduled
        return false;
    }
    let Ok(body) = response.json::<Value>().await else {
        return false;
    };
    let (Some(action), Some(time)) = (
        body.get("action").and_then(Value::as_str),
        body.get("time").and_then(Value::as_str),
    ) else {
        warn!(?body, "spot monitor returned invalid data");
        return false;
    };
    if action == "stop" || action == "terminate" {
        info!(action, time, "spot instance is being interrupted; shutting node down");
        return true;
    }
    false
}

/// Azure scheduled events: interruption shows up as an event with type
/// Preempt, Reboot or Redeploy.
async fn poll_azure(client: &reqwest::Client) -> bool {
    let Ok(response) = client
        .get(AZURE_METADATA_URL)
        .header("Metadata", "true")
        .send()
        .await
    else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    let Ok(body) = response.json::<Value>().await else {
        return false;
    };
    for event in body
        .get("Events")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let event_type = event
            .get("EventType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if matches!(event_type, "Preempt" | "Reboot" | "Redeploy") {
            let time = event
                .get("NotBefore")
                .and_then(Value::as_str)
                .unwrap_or("[Unknown]");
            info!(event_type, time, "instance interruption scheduled; shutting node down");
            return true;
        }
    }
    false
}
