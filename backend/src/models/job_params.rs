use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::services::job_runner::JobError;

/// Flattened key/value input of a job, as stored in `job_params`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(HashMap<String, String>);

impl JobParams {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the value or fails the job with a readable message.
    pub fn require(&self, key: &str) -> Result<&str, JobError> {
        self.get(key)
            .ok_or_else(|| JobError::Failed(format!("missing required parameter '{}'", key)))
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, JobError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                JobError::Failed(format!("parameter '{}' has invalid value '{}'", key, raw))
            }),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, JobError> {
        self.get_parsed(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, JobError> {
        self.get_parsed(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for JobParams {
    fn from(values: HashMap<String, String>) -> Self {
        Self(values)
    }
}
