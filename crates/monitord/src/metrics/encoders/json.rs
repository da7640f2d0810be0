//! JSON metrics encoder.

use std::collections::HashMap;

use serde_json::json;
use serde_json::Number;
use serde_json::Value;

use super::FieldValue;
use super::MetricsEncoder;

pub struct JsonEncoder;

impl MetricsEncoder for JsonEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String {
        let fields: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::String(s) => Value::String(s.clone()),
                    FieldValue::Integer(i) => Value::Number(Number::from(*i)),
                    FieldValue::UnsignedInteger(u) => Value::Number(Number::from(*u)),
                    FieldValue::Float(f) => {
                        Value::Number(Number::from_f64(*f).unwrap_or_else(|| Number::from(0)))
                    }
                    FieldValue::Boolean(b) => Value::Bool(*b),
                };
                (key.clone(), value)
            })
            .collect();

        json!({
            "measure": measurement,
            "ts": timestamp,
            "tag": tags,
            "field": fields,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_valid_json() {
        let encoder = JsonEncoder;
        let tags = HashMap::from([("pid".to_string(), "42".to_string())]);
        let fields = HashMap::from([
            ("cpu_percent".to_string(), FieldValue::Float(12.5)),
            ("gpu_memory_bytes".to_string(), FieldValue::UnsignedInteger(2048)),
        ]);

        let line = encoder.encode_metrics("gpu_process_usage", &tags, &fields, 99);
        let parsed: Value = serde_json::from_str(&line).expect("valid JSON");

        assert_eq!(parsed["measure"], "gpu_process_usage");
        assert_eq!(parsed["ts"], 99);
        assert_eq!(parsed["tag"]["pid"], "42");
        assert_eq!(parsed["field"]["cpu_percent"], 12.5);
        assert_eq!(parsed["field"]["gpu_memory_bytes"], 2048);
    }

    #[test]
    fn non_finite_floats_degrade_to_zero() {
        let encoder = JsonEncoder;
        let fields = HashMap::from([("bad".to_string(), FieldValue::Float(f64::NAN))]);
        let line = encoder.encode_metrics("m", &HashMap::new(), &fields, 1);
        let parsed: Value = serde_json::from_str(&line).expect("valid JSON");
        assert_eq!(parsed["field"]["bad"], 0);
    }
}
