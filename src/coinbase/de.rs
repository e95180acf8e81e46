// Coinbase sends most numeric values as JSON strings ("21932.98"), sometimes
// as empty strings for fields it has no value for. `lenient_f64` is for values
// a message is meaningless without and rejects blanks; `lenient_opt_f64` is
// for optional statistics and maps blanks to `None`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn parse_f64<E: serde::de::Error>(value: Value) -> Result<Option<f64>, E> {
    match value {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| E::custom(format!("invalid number {s:?}: {e}"))),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| E::custom(format!("number {n} is not a valid f64"))),
        Value::Null => Ok(None),
        other => Err(E::custom(format!("expected number, got {other}"))),
    }
}

/// `"1.5"` or `1.5`. Blank strings and `null` are rejected.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    parse_f64::<D::Error>(Value::deserialize(deserializer)?)?
        .ok_or_else(|| D::Error::custom("expected number, got a blank value"))
}

/// `"1.5"` or `1.5` as `Some`; `""` and `null` as `None`. Pair with
/// `#[serde(default)]` so a missing field is `None` too.
pub fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    parse_f64::<D::Error>(Value::deserialize(deserializer)?)
}

/// Unix-seconds timestamps, string or number. Empty values are rejected.
pub fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| D::Error::custom(format!("invalid integer {s:?}: {e}"))),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("number {n} is not a valid i64"))),
        other => Err(D::Error::custom(format!("expected integer, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "lenient_f64")]
        value: f64,
        #[serde(deserialize_with = "lenient_opt_f64", default)]
        extra: Option<f64>,
        #[serde(deserialize_with = "lenient_i64")]
        start: i64,
    }

    #[test]
    fn accepts_strings_and_numbers() {
        let s: Sample = serde_json::from_str(r#"{"value":"12.5","extra":"0.25","start":"1700000000"}"#).unwrap();
        assert_eq!(s.value, 12.5);
        assert_eq!(s.extra, Some(0.25));
        assert_eq!(s.start, 1_700_000_000);

        let s: Sample = serde_json::from_str(r#"{"value":3,"extra":4,"start":42}"#).unwrap();
        assert_eq!(s.value, 3.0);
        assert_eq!(s.extra, Some(4.0));
        assert_eq!(s.start, 42);
    }

    #[test]
    fn optional_values_treat_blanks_as_absent() {
        let s: Sample = serde_json::from_str(r#"{"value":"1","extra":"","start":"1"}"#).unwrap();
        assert_eq!(s.extra, None);

        let s: Sample = serde_json::from_str(r#"{"value":"1","extra":null,"start":"1"}"#).unwrap();
        assert_eq!(s.extra, None);

        let s: Sample = serde_json::from_str(r#"{"value":"1","start":"1"}"#).unwrap();
        assert_eq!(s.extra, None);
    }

    #[test]
    fn required_values_reject_blanks() {
        assert!(serde_json::from_str::<Sample>(r#"{"value":"","start":"1"}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"value":"  ","start":"1"}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"value":null,"start":"1"}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"start":"1"}"#).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Sample>(r#"{"value":"abc","start":"1"}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"value":"1","extra":"abc","start":"1"}"#).is_err());
        assert!(serde_json::from_str::<Sample>(r#"{"value":"1","start":""}"#).is_err());
    }
}
