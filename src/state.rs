//! Typed access to JSON resource state.

use serde_json::{Map, Value};

use crate::error::ProviderError;

/// A resource state or configuration object.
///
/// Empty strings and nulls read as unset, the way the host engine reports
/// optional attributes the user left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceState(Map<String, Value>);

impl ResourceState {
    /// Wrap a JSON object. `null` becomes an empty state.
    pub fn from_value(value: Value) -> Result<Self, ProviderError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(ProviderError::InvalidRequest(format!(
                "expected a state object, got {}",
                other
            ))),
        }
    }

    /// The remote identifier stored in `id`.
    pub fn id(&self) -> Result<&str, ProviderError> {
        self.string("id")
            .ok_or_else(|| ProviderError::InvalidRequest("state has no 'id'".to_string()))
    }

    /// A non-empty string attribute.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// A string attribute that must be set.
    pub fn required_string(&self, key: &str) -> Result<&str, ProviderError> {
        self.string(key)
            .ok_or_else(|| ProviderError::Validation(format!("'{}' is required", key)))
    }

    /// A boolean attribute.
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// An integer attribute. Whole floats are accepted.
    pub fn int(&self, key: &str) -> Option<i64> {
        let value = self.0.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    }

    /// Any non-null attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Set an attribute.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Whether `key` differs between `self` and `other`, treating null,
    /// missing and `""` alike.
    pub fn differs(&self, other: &ResourceState, key: &str) -> bool {
        normalized(self.0.get(key)) != normalized(other.0.get(key))
    }

    /// The underlying JSON object.
    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Unwrap into a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn normalized(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(v) => Some(v),
    }
}
