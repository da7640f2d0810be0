//! Metrics line encoders.
//!
//! The poller batches averaged device and process figures and emits one
//! encoded line per series through the `metrics` tracing target; the
//! encoder decides the wire shape (InfluxDB line protocol or JSON).

use std::collections::HashMap;

pub mod influx;
pub mod json;

/// A field value that can be encoded in a metrics line.
#[derive(Debug, Clone)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// Encodes one measurement with its tags and fields.
pub trait MetricsEncoder: Send + Sync {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String;

    /// Averaged per-device figures for one batch window.
    #[allow(clippy::too_many_arguments)]
    fn encode_device_metrics(
        &self,
        device_key: &str,
        utilization_percent: f64,
        memory_bytes: u64,
        temperature_c: f64,
        power_watts: f64,
        timestamp: i64,
    ) -> String {
        let mut tags = HashMap::new();
        tags.insert("device".to_string(), device_key.to_string());

        let mut fields = HashMap::new();
        fields.insert("utilization_percent".to_string(), utilization_percent.into());
        fields.insert("memory_bytes".to_string(), memory_bytes.into());
        fields.insert("temperature".to_string(), temperature_c.into());
        fields.insert("power_watts".to_string(), power_watts.into());

        self.encode_metrics("gpu_device_usage", &tags, &fields, timestamp)
    }

    /// Averaged per-process figures for one batch window.
    #[allow(clippy::too_many_arguments)]
    fn encode_process_metrics(
        &self,
        pid: u32,
        container: &str,
        gpu_memory_bytes: u64,
        gpu_utilization_percent: f64,
        cpu_percent: f64,
        timestamp: i64,
    ) -> String {
        let mut tags = HashMap::new();
        tags.insert("pid".to_string(), pid.to_string());
        tags.insert("container".to_string(), container.to_string());

        let mut fields = HashMap::new();
        fields.insert("gpu_memory_bytes".to_string(), gpu_memory_bytes.into());
        fields.insert(
            "gpu_utilization_percent".to_string(),
            gpu_utilization_percent.into(),
        );
        fields.insert("cpu_percent".to_string(), cpu_percent.into());

        self.encode_metrics("gpu_process_usage", &tags, &fields, timestamp)
    }
}

/// Encoder for the configured format string, defaulting to influx.
pub fn create_encoder(format: &str) -> Box<dyn MetricsEncoder + Send + Sync> {
    match format.to_lowercase().as_str() {
        "json" => Box::new(json::JsonEncoder),
        _ => Box::new(influx::InfluxEncoder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_encoder_selects_json() {
        let encoder = create_encoder("json");
        let result = encoder.encode_metrics(
            "test_measurement",
            &HashMap::new(),
            &HashMap::from([("value".to_string(), 1.0.into())]),
            42,
        );
        assert!(result.trim_start().starts_with('{'));
    }

    #[test]
    fn create_encoder_defaults_to_influx() {
        let encoder = create_encoder("something-else");
        let result = encoder.encode_metrics(
            "test_measurement",
            &HashMap::new(),
            &HashMap::from([("value".to_string(), 1.0.into())]),
            42,
        );
        assert!(result.starts_with("test_measurement"));
    }

    #[test]
    fn encode_device_metrics_carries_the_device_tag() {
        let encoder = create_encoder("influx");
        let result = encoder.encode_device_metrics("gpu-abc", 55.0, 2048, 70.0, 150.0, 1_000);
        assert!(result.contains("gpu_device_usage"));
        assert!(result.contains("device=gpu-abc"));
        assert!(result.contains("utilization_percent=55"));
        assert!(result.contains("memory_bytes=2048u"));
    }

    #[test]
    fn encode_process_metrics_tags_pid_and_container() {
        let encoder = create_encoder("influx");
        let result = encoder.encode_process_metrics(4321, "trainer", 1024, 12.5, 80.0, 1_000);
        assert!(result.contains("gpu_process_usage"));
        assert!(result.contains("pid=4321"));
        assert!(result.contains("container=trainer"));
        assert!(result.contains("cpu_percent=80"));
    }
}
