//! InfluxDB line protocol encoder.

use std::collections::HashMap;

use influxdb_line_protocol::LineProtocolBuilder;

use super::FieldValue;
use super::MetricsEncoder;

pub struct InfluxEncoder;

// The builder moves through a type state per field, so the dispatch on
// the field's type cannot live in a plain function.
macro_rules! push_field {
    ($builder:expr, $key:expr, $value:expr) => {
        match $value {
            FieldValue::String(s) => $builder.field($key, s.as_str()),
            FieldValue::Integer(i) => $builder.field($key, *i),
            FieldValue::UnsignedInteger(u) => $builder.field($key, *u),
            FieldValue::Float(f) => $builder.field($key, *f),
            FieldValue::Boolean(b) => $builder.field($key, *b),
        }
    };
}

impl MetricsEncoder for InfluxEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String {
        let mut builder = LineProtocolBuilder::new().measurement(measurement);

        // Sorted iteration keeps lines stable across polls.
        let mut tag_entries: Vec<_> = tags.iter().collect();
        tag_entries.sort_by_key(|(key, _)| *key);
        for (key, value) in tag_entries {
            builder = builder.tag(key, value);
        }

        let mut field_entries: Vec<_> = fields.iter().collect();
        field_entries.sort_by_key(|(key, _)| *key);
        let mut field_entries = field_entries.into_iter();

        // The builder's type states force the first field through a
        // separate transition; a line without fields is invalid, so an
        // explicit placeholder stands in.
        let Some((first_key, first_value)) = field_entries.next() else {
            let line = builder
                .field("_empty", true)
                .timestamp(timestamp)
                .close_line()
                .build();
            return String::from_utf8_lossy(&line).into_owned();
        };

        let mut builder = push_field!(builder, first_key, first_value);
        for (key, value) in field_entries {
            builder = push_field!(builder, key, value);
        }

        let line = builder.timestamp(timestamp).close_line().build();
        String::from_utf8_lossy(&line).into_owned()
    }
}
