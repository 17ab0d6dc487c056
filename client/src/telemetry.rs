//! Telemetry forwarding.
//!
//! The server emits `telemetry` events with a name and a free-form payload.
//! They are flattened to string properties and handed to an injected
//! [`TelemetrySink`]. Nothing here may affect protocol handling: malformed
//! payloads and sink failures are logged and dropped.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Receiver of `(event name, properties)` pairs.
pub trait TelemetrySink: Send + Sync {
    fn log_event(&self, event_name: &str, properties: &BTreeMap<String, String>)
    -> anyhow::Result<()>;
}

/// Default sink: writes telemetry to the log at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn log_event(
        &self,
        event_name: &str,
        properties: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        tracing::debug!(event = event_name, ?properties, "Telemetry");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryBody {
    telemetry_event_name: String,
    #[serde(default)]
    payload: Map<String, Value>,
}

fn flatten(payload: Map<String, Value>) -> BTreeMap<String, String> {
    payload
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect()
}

fn parse(body: Value) -> Option<(String, BTreeMap<String, String>)> {
    match serde_json::from_value::<TelemetryBody>(body) {
        Ok(body) => Some((body.telemetry_event_name, flatten(body.payload))),
        Err(e) => {
            tracing::debug!("Dropping malformed telemetry payload: {e}");
            None
        }
    }
}

/// Parse a telemetry event body and hand it to `sink`.
pub(crate) fn forward(sink: &dyn TelemetrySink, body: Value) {
    let Some((name, properties)) = parse(body) else {
        return;
    };
    if let Err(e) = sink.log_event(&name, &properties) {
        tracing::warn!(event = %name, "Telemetry sink failed: {e:#}");
    }
}
