//! Pre-check result models

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Severity of a pre-check outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    Pass,
    Info,
    Warning,
    Critical,
}

/// Outcome of a single pre-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCheckResult {
    /// Check name
    pub check_name: String,

    /// Severity
    pub severity: CheckSeverity,

    /// Whether the check passed
    pub passed: bool,

    /// Human readable outcome
    pub message: String,

    /// Structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Suggested fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl PreCheckResult {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckSeverity::Pass, true, message)
    }

    pub fn info(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckSeverity::Info, true, message)
    }

    pub fn warning(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckSeverity::Warning, false, message)
    }

    pub fn critical(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckSeverity::Critical, false, message)
    }

    fn new(name: &str, severity: CheckSeverity, passed: bool, message: impl Into<String>) -> Self {
        Self {
            check_name: name.to_string(),
            severity,
            passed,
            message: message.into(),
            details: None,
            recommendation: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }

    pub fn is_critical_failure(&self) -> bool {
        self.severity == CheckSeverity::Critical && !self.passed
    }
}

/// Ordered pre-check results with derived counts
#[derive(Debug, Clone)]
pub struct PreCheckSummary {
    pub results: Vec<PreCheckResult>,
    pub timestamp: DateTime<Utc>,
}

impl Default for PreCheckSummary {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PreCheckSummary {
    pub fn new(results: Vec<PreCheckResult>) -> Self {
        Self {
            results,
            timestamp: Utc::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn warnings(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.severity == CheckSeverity::Warning)
            .count()
    }

    pub fn critical_failures(&self) -> usize {
        self.results.iter().filter(|r| r.is_critical_failure()).count()
    }

    /// Warnings never block; only critical failures do
    pub fn can_proceed(&self) -> bool {
        self.critical_failures() == 0
    }

    /// Names of the checks that failed critically
    pub fn critical_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.is_critical_failure())
            .map(|r| r.check_name.as_str())
            .collect()
    }
}

impl Serialize for PreCheckSummary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("PreCheckSummary", 7)?;
        state.serialize_field("total_checks", &self.total())?;
        state.serialize_field("passed", &self.passed())?;
        state.serialize_field("warnings", &self.warnings())?;
        state.serialize_field("critical_failures", &self.critical_failures())?;
        state.serialize_field("can_proceed", &self.can_proceed())?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("results", &self.results)?;
        state.end()
    }
}
