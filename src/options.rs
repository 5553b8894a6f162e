//! Options accepted by `run_session`.

use serde_json::Value;

use crate::error::ConfigurationError;
use crate::fingerprint::describe_json_type;
use crate::routine::Routine;

pub const OPTION_VALIDATE: &str = "validate";
pub const OPTION_CACHE_ACROSS_SPECS: &str = "cacheAcrossSpecs";

/// Value in a dynamic option bag.
#[derive(Clone, Debug)]
pub enum OptionValue {
    Routine(Routine),
    Bool(bool),
    Json(Value),
}

impl OptionValue {
    fn describe(&self) -> String {
        match self {
            OptionValue::Routine(_) => "a function".to_string(),
            OptionValue::Bool(_) => "a boolean".to_string(),
            OptionValue::Json(value) => describe_json_type(value).to_string(),
        }
    }
}

impl From<Routine> for OptionValue {
    fn from(routine: Routine) -> Self {
        OptionValue::Routine(routine)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<Value> for OptionValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => OptionValue::Bool(b),
            other => OptionValue::Json(other),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub validate: Option<Routine>,
    pub cache_across_specs: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validate(mut self, validate: Routine) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn cache_across_specs(mut self, cache: bool) -> Self {
        self.cache_across_specs = cache;
        self
    }

    /// Build options from a key/value bag. Only `validate` (a routine) and
    /// `cacheAcrossSpecs` (a boolean) are accepted.
    pub fn from_entries<K, I>(entries: I) -> Result<Self, ConfigurationError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, OptionValue)>,
    {
        let mut options = Self::default();
        for (key, value) in entries {
            let key: String = key.into();
            match (key.as_str(), value) {
                (OPTION_VALIDATE, OptionValue::Routine(routine)) => options.validate = Some(routine),
                (OPTION_CACHE_ACROSS_SPECS, OptionValue::Bool(cache)) => {
                    options.cache_across_specs = cache
                }
                (OPTION_VALIDATE, other) => {
                    return Err(ConfigurationError::InvalidOptionType {
                        key: key.clone(),
                        expected: "a function",
                        found: other.describe(),
                    })
                }
                (OPTION_CACHE_ACROSS_SPECS, other) => {
                    return Err(ConfigurationError::InvalidOptionType {
                        key: key.clone(),
                        expected: "a boolean",
                        found: other.describe(),
                    })
                }
                _ => return Err(ConfigurationError::UnknownOption { key: key.clone() }),
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::RoutineReturn;
    use serde_json::json;

    fn validate() -> Routine {
        Routine::new("() => true", |_| Ok(RoutineReturn::Value(json!(true))))
    }

    #[test]
    fn accepts_known_options() {
        let options = SessionOptions::from_entries([
            (OPTION_VALIDATE, OptionValue::from(validate())),
            (OPTION_CACHE_ACROSS_SPECS, OptionValue::from(json!(true))),
        ])
        .unwrap();
        assert!(options.validate.is_some());
        assert!(options.cache_across_specs);
    }

    #[test]
    fn rejects_unknown_key() {
        let err = SessionOptions::from_entries([("retries", OptionValue::from(json!(3)))])
            .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownOption {
                key: "retries".into()
            }
        );
    }

    #[test]
    fn rejects_wrong_types() {
        let err = SessionOptions::from_entries([(OPTION_VALIDATE, OptionValue::from(true))])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidOptionType { expected: "a function", ref found, .. } if found == "a boolean"
        ));

        let err = SessionOptions::from_entries([(
            OPTION_CACHE_ACROSS_SPECS,
            OptionValue::from(json!("yes")),
        )])
        .unwrap_err();
        assert!(err.to_string().contains("must be a boolean, got a string"));
    }
}
