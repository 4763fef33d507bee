//! Job parameters, incrementers and validators.
//!
//! A [`JobInstance`](super::execution::JobInstance) is identified by its job
//! name plus the *identifying* parameters. Non-identifying parameters travel
//! with the execution but do not change which instance a launch resolves to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::error::BatchError;

// =============================================================================
// Parameter Values
// =============================================================================

/// A typed parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

/// One job parameter: a value plus whether it takes part in instance identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

// =============================================================================
// Job Parameters
// =============================================================================

/// Ordered set of named parameters for one launch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    params: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(mut self, key: impl Into<String>, value: ParameterValue, identifying: bool) -> Self {
        self.params.insert(key.into(), JobParameter { value, identifying });
        self
    }

    /// Adds an identifying string parameter.
    pub fn with_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, ParameterValue::String(value.into()), true)
    }

    /// Adds an identifying integer parameter.
    pub fn with_long(self, key: impl Into<String>, value: i64) -> Self {
        self.insert(key, ParameterValue::Long(value), true)
    }

    /// Adds an identifying floating-point parameter.
    pub fn with_double(self, key: impl Into<String>, value: f64) -> Self {
        self.insert(key, ParameterValue::Double(value), true)
    }

    /// Adds an identifying date parameter.
    pub fn with_date(self, key: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.insert(key, ParameterValue::Date(value), true)
    }

    /// Adds a parameter that does not take part in instance identity.
    pub fn with_non_identifying(self, key: impl Into<String>, value: ParameterValue) -> Self {
        self.insert(key, value, false)
    }

    /// Adds a parameter as is, keeping its identifying flag.
    pub fn with_parameter(mut self, key: impl Into<String>, parameter: JobParameter) -> Self {
        self.params.insert(key.into(), parameter);
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.params.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.params.get(key).map(|p| &p.value) {
            Some(ParameterValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.params.get(key).map(|p| &p.value) {
            Some(ParameterValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.params.get(key).map(|p| &p.value) {
            Some(ParameterValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Canonical string built from identifying parameters only.
    ///
    /// Two parameter sets resolve to the same job instance iff their
    /// identity keys are equal.
    pub fn identity_key(&self) -> String {
        self.params
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(k, p)| format!("{}={}", k, p.value))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns a copy with `other`'s entries layered over this set's.
    pub fn merged_with(&self, other: &JobParameters) -> JobParameters {
        let mut merged = self.clone();
        for (k, p) in &other.params {
            merged.params.insert(k.clone(), p.clone());
        }
        merged
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.identity_key())
    }
}

// =============================================================================
// Incrementer
// =============================================================================

/// Derives the parameters of the next instance from the previous ones.
pub trait JobParametersIncrementer: Send + Sync {
    fn next(&self, previous: Option<&JobParameters>) -> JobParameters;
}

/// Increments a `run.id` long parameter, starting at 1.
#[derive(Clone, Debug)]
pub struct RunIdIncrementer {
    key: String,
}

impl RunIdIncrementer {
    pub const DEFAULT_KEY: &'static str = "run.id";

    pub fn new() -> Self {
        Self {
            key: Self::DEFAULT_KEY.to_string(),
        }
    }

    /// Uses a custom parameter name instead of `run.id`.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for RunIdIncrementer {
    fn default() -> Self {
        Self::new()
    }
}

impl JobParametersIncrementer for RunIdIncrementer {
    fn next(&self, previous: Option<&JobParameters>) -> JobParameters {
        let previous = previous.cloned().unwrap_or_default();
        let id = previous.get_long(&self.key).unwrap_or(0) + 1;
        previous.with_long(self.key.clone(), id)
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Checks parameters before an execution is created.
pub trait JobParametersValidator: Send + Sync {
    fn validate(&self, params: &JobParameters) -> Result<(), BatchError>;
}

/// Validates presence of required keys and, when optional keys are declared,
/// rejects keys that are neither required nor optional.
#[derive(Clone, Debug, Default)]
pub struct DefaultJobParametersValidator {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
}

impl DefaultJobParametersValidator {
    pub fn new<I, S>(required: I, optional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            optional: optional.into_iter().map(Into::into).collect(),
        }
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, params: &JobParameters) -> Result<(), BatchError> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|k| params.get(k).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BatchError::InvalidParameters(format!(
                "missing required keys: {}",
                missing.join(", ")
            )));
        }

        if !self.optional.is_empty() {
            let unknown: Vec<&str> = params
                .keys()
                .filter(|k| !self.required.contains(*k) && !self.optional.contains(*k))
                .collect();
            if !unknown.is_empty() {
                return Err(BatchError::InvalidParameters(format!(
                    "unrecognized keys: {}",
                    unknown.join(", ")
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_ignores_non_identifying() {
        let a = JobParameters::new()
            .with_string("name", "user1")
            .with_non_identifying("seq", ParameterValue::Long(1));
        let b = JobParameters::new()
            .with_string("name", "user1")
            .with_non_identifying("seq", ParameterValue::Long(2));
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_identity_key_is_order_independent() {
        let a = JobParameters::new().with_long("a", 1).with_long("b", 2);
        let b = JobParameters::new().with_long("b", 2).with_long("a", 1);
        assert_eq!(a.identity_key(), "a=1,b=2");
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_run_id_incrementer() {
        let inc = RunIdIncrementer::new();
        let first = inc.next(None);
        assert_eq!(first.get_long("run.id"), Some(1));

        let second = inc.next(Some(&first.clone().with_string("name", "x")));
        assert_eq!(second.get_long("run.id"), Some(2));
        assert_eq!(second.get_string("name"), Some("x"));
    }

    #[test]
    fn test_validator_requires_keys() {
        let validator = DefaultJobParametersValidator::new(vec!["name"], vec![]);
        let err = validator.validate(&JobParameters::new()).unwrap_err();
        assert!(err.to_string().contains("name"));
        assert!(validator
            .validate(&JobParameters::new().with_string("name", "a"))
            .is_ok());
    }

    #[test]
    fn test_validator_rejects_unknown_when_optional_declared() {
        let validator = DefaultJobParametersValidator::new(vec!["name"], vec!["year"]);
        let params = JobParameters::new()
            .with_string("name", "a")
            .with_long("other", 1);
        assert!(validator.validate(&params).is_err());

        let params = JobParameters::new()
            .with_string("name", "a")
            .with_long("year", 2024);
        assert!(validator.validate(&params).is_ok());
    }
}
