use serde::{Deserialize, Serialize};
use std::fmt;

/// Last-known value of one entity.
///
/// Values are type-erased the way the device reports them. Non-finite
/// numbers may be held in memory but are never handed to a peer as-is:
/// use [`StateValue::sanitized`] before serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Boolean value (binary sensors, switches).
    Bool(bool),

    /// Numeric value (sensors, numbers, positions).
    Number(f64),

    /// Text value (text sensors, selects, modes).
    Text(String),

    /// No value.
    Null,
}

impl StateValue {
    /// Numeric payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Whether this is a not-a-number numeric value.
    pub fn is_nan(&self) -> bool {
        matches!(self, StateValue::Number(n) if n.is_nan())
    }

    /// Whether this is a numeric value that is infinite or not-a-number.
    pub fn is_non_finite(&self) -> bool {
        matches!(self, StateValue::Number(n) if !n.is_finite())
    }

    /// Copy with any non-finite number replaced by [`StateValue::Null`].
    pub fn sanitized(&self) -> StateValue {
        if self.is_non_finite() {
            StateValue::Null
        } else {
            self.clone()
        }
    }

    /// Loose truthiness: `false`, `0`, empty text and null are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            StateValue::Bool(b) => *b,
            StateValue::Number(n) => *n != 0.0 && !n.is_nan(),
            StateValue::Text(s) => !s.is_empty(),
            StateValue::Null => false,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{}", b),
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::Text(s) => f.write_str(s),
            StateValue::Null => f.write_str("null"),
        }
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Number(v)
    }
}

impl From<f32> for StateValue {
    fn from(v: f32) -> Self {
        StateValue::Number(f64::from(v))
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl From<StateValue> for serde_json::Value {
    fn from(v: StateValue) -> Self {
        match v.sanitized() {
            StateValue::Bool(b) => serde_json::Value::Bool(b),
            StateValue::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            StateValue::Text(s) => serde_json::Value::String(s),
            StateValue::Null => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_serialization() {
        assert_eq!(serde_json::to_string(&StateValue::Bool(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&StateValue::Number(55.2)).unwrap(), "55.2");
        assert_eq!(
            serde_json::to_string(&StateValue::Text("Charging".into())).unwrap(),
            "\"Charging\""
        );
        assert_eq!(serde_json::to_string(&StateValue::Null).unwrap(), "null");
    }

    #[test]
    fn test_sanitized_replaces_non_finite() {
        assert_eq!(StateValue::Number(f64::NAN).sanitized(), StateValue::Null);
        assert_eq!(StateValue::Number(f64::INFINITY).sanitized(), StateValue::Null);
        assert_eq!(
            StateValue::Number(f64::NEG_INFINITY).sanitized(),
            StateValue::Null
        );
        assert_eq!(StateValue::Number(1.5).sanitized(), StateValue::Number(1.5));
        assert_eq!(StateValue::Bool(false).sanitized(), StateValue::Bool(false));
    }

    #[test]
    fn test_into_json_value() {
        let json: serde_json::Value = StateValue::Number(f64::INFINITY).into();
        assert!(json.is_null());

        let json: serde_json::Value = StateValue::Number(80.0).into();
        assert_eq!(json, serde_json::json!(80.0));
    }

    #[test]
    fn test_truthiness() {
        assert!(StateValue::Bool(true).is_truthy());
        assert!(!StateValue::Bool(false).is_truthy());
        assert!(StateValue::Number(1.0).is_truthy());
        assert!(!StateValue::Number(0.0).is_truthy());
        assert!(!StateValue::Null.is_truthy());
        assert!(StateValue::Text("on".into()).is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(StateValue::Number(55.2).to_string(), "55.2");
        assert_eq!(StateValue::Number(80.0).to_string(), "80");
        assert_eq!(StateValue::Bool(false).to_string(), "false");
        assert_eq!(StateValue::Bool(true).to_string(), "true");
        assert_eq!(StateValue::Text("Stopped".into()).to_string(), "Stopped");
    }
}
