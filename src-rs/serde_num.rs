//! Lenient integer decoding for PostgREST rows: `bigint` arrives as a JSON
//! number, `numeric` as a string, and computed columns sometimes as `12.0`.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Number, Value};

pub fn de_i64_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    lenient_i64(&value).map_err(de::Error::custom)
}

fn lenient_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(number) => number_to_i64(number),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = text.parse::<i64>() {
                return Ok(parsed);
            }
            text.parse::<f64>()
                .map_err(|_| format!("invalid numeric string: {text}"))
                .and_then(whole_f64)
        }
        other => Err(format!("expected number, got {other}")),
    }
}

fn number_to_i64(number: &Number) -> Result<i64, String> {
    if let Some(value) = number.as_i64() {
        Ok(value)
    } else if let Some(value) = number.as_u64() {
        i64::try_from(value).map_err(|_| format!("u64 out of range for i64: {value}"))
    } else if let Some(value) = number.as_f64() {
        whole_f64(value)
    } else {
        Err(format!("unsupported JSON number: {number}"))
    }
}

fn whole_f64(value: f64) -> Result<i64, String> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(format!("expected a whole number, got {value}"));
    }
    if value < i64::MIN as f64 || value > i64::MAX as f64 {
        return Err(format!("float out of i64 range: {value}"));
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Row {
        #[serde(deserialize_with = "de_i64_from_number")]
        credits: i64,
    }

    #[test]
    fn accepts_numbers_numeric_strings_and_whole_floats() {
        for (raw, expected) in [(json!("120"), 120), (json!(999.0), 999), (json!(7), 7)] {
            let row: Row = serde_json::from_value(json!({ "credits": raw })).unwrap();
            assert_eq!(row.credits, expected);
        }
    }

    #[test]
    fn rejects_fractional_values() {
        assert!(serde_json::from_value::<Row>(json!({ "credits": 1.5 })).is_err());
        assert!(serde_json::from_value::<Row>(json!({ "credits": "abc" })).is_err());
    }
}
