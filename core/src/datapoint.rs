//! Data-point output model.
//!
//! A data-point is one `(entity, attribute, value, time-range, source-tag)`
//! tuple shipped to the downstream collector, serialized as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity type of every data-point the flow modules emit.
pub const DP_TYPE_IP: &str = "ip";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub attr: String,
    pub v: Value,
    #[serde(with = "iso8601")]
    pub t1: DateTime<Utc>,
    #[serde(with = "iso8601")]
    pub t2: DateTime<Utc>,
    /// Confidence; only the aggregator emits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<f64>,
    pub src: String,
}

/// ISO-8601 UTC timestamps with millisecond precision, e.g.
/// `2024-05-01T10:00:00.000`. Deserialization also accepts RFC 3339 forms
/// with an explicit offset.
pub mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Round to 4 decimal places, the precision of emitted counters.
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Stable canonical rendering of a JSON value: object keys sorted at every
/// nesting level, no whitespace. Used as the value part of aggregation keys.
pub fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_datapoint_json_shape() {
        let dp = DataPoint {
            kind: DP_TYPE_IP.to_string(),
            id: "10.0.0.2".to_string(),
            attr: "open_ports".to_string(),
            v: json!(22),
            t1: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            t2: Utc.timestamp_opt(1_700_000_001, 500_000_000).unwrap(),
            c: None,
            src: "collector-1".to_string(),
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&dp).unwrap()).unwrap();
        assert_eq!(value["type"], "ip");
        assert_eq!(value["id"], "10.0.0.2");
        assert_eq!(value["v"], 22);
        assert_eq!(value["t1"], "2023-11-14T22:13:20.000");
        assert_eq!(value["t2"], "2023-11-14T22:13:21.500");
        assert!(value.get("c").is_none(), "absent confidence must not serialize");
    }

    #[test]
    fn test_datapoint_roundtrip_with_confidence() {
        let text = r#"{
            "type": "ip", "id": "10.0.0.1", "attr": "activity",
            "v": {"flows": [1.0]},
            "t1": "2024-05-01T10:00:00", "t2": "2024-05-01T10:10:00.250",
            "c": 0.5, "src": "a"
        }"#;
        let dp: DataPoint = serde_json::from_str(text).expect("datapoint should parse");
        assert_eq!(dp.c, Some(0.5));
        assert_eq!(dp.t2.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_iso8601_accepts_rfc3339() {
        let text = r#"{
            "type": "ip", "id": "x", "attr": "a", "v": 1,
            "t1": "2024-05-01T10:00:00Z", "t2": "2024-05-01T10:00:00+02:00",
            "src": ""
        }"#;
        let dp: DataPoint = serde_json::from_str(text).expect("datapoint should parse");
        assert_eq!(dp.t2.timestamp(), dp.t1.timestamp() - 7200);
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(1.0 / 3.0), 0.3333);
        assert_eq!(round4(1000.0), 1000.0);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let b = json!({"a": {"c": "x", "d": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_scalars() {
        assert_eq!(canonical_json(&json!(22)), "22");
        assert_eq!(canonical_json(&json!("ssh")), "\"ssh\"");
        assert_eq!(canonical_json(&json!(null)), "null");
    }
}
