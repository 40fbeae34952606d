use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A symbol to fetch, with the display name known to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolRef {
    pub symbol: String,
    pub name: String,
}

impl SymbolRef {
    pub fn new(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
        }
    }
}

/// Provider payload before normalization. Field names and value encodings are
/// whatever the vendor sent; only `ingest::adapter` interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetricRecord {
    pub source: String,
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    pub as_of_date: NaiveDate,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RawMetricRecord {
    pub fn new(source: &str, symbol: &str, as_of_date: NaiveDate) -> Self {
        Self {
            source: source.to_string(),
            symbol: symbol.to_string(),
            name: None,
            as_of_date,
            fields: Map::new(),
        }
    }

    /// Copies every key of a JSON object into `fields`; later merges win.
    pub fn merge_object(&mut self, v: &Value) {
        if let Value::Object(obj) = v {
            for (k, val) in obj {
                self.fields.insert(k.clone(), val.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_expected_shape() {
        let as_of = NaiveDate::from_ymd_opt(2026, 1, 27).unwrap();
        let v = json!({
            "source": "external_http_json",
            "symbol": "005930",
            "name": "Samsung",
            "as_of_date": as_of,
            "fields": {"per": 12.3, "pbr": "1.10"}
        });

        let parsed: RawMetricRecord = serde_json::from_value(v).unwrap();
        assert_eq!(parsed.as_of_date, as_of);
        assert_eq!(parsed.fields.get("per"), Some(&json!(12.3)));
    }

    #[test]
    fn later_merges_override_earlier_fields() {
        let as_of = NaiveDate::from_ymd_opt(2026, 1, 27).unwrap();
        let mut rec = RawMetricRecord::new("kis", "005930", as_of);
        rec.merge_object(&json!({"per": "10.0", "pbr": "1.0"}));
        rec.merge_object(&json!({"per": "11.0"}));
        rec.merge_object(&json!("not an object"));
        assert_eq!(rec.fields.get("per"), Some(&json!("11.0")));
        assert_eq!(rec.fields.len(), 2);
    }
}
