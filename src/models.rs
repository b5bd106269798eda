//! Core data model: plugin descriptors, status, results, and summaries.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a plugin within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
    Paused,
}

impl PluginStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PluginStatus::Success | PluginStatus::Failed | PluginStatus::Skipped | PluginStatus::Timeout
        )
    }
}

/// The three-stage lifecycle a multi-phase plugin may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Check,
    Download,
    Execute,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Check, Phase::Download, Phase::Execute];

    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Check => Some(Phase::Download),
            Phase::Download => Some(Phase::Execute),
            Phase::Execute => None,
        }
    }
}

/// Author-supplied metadata about a plugin, independent of its runtime
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub requires_sudo: bool,
    #[serde(default = "default_platforms")]
    pub supported_platforms: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_platforms() -> Vec<String> {
    vec!["linux".to_string()]
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            author: String::new(),
            requires_sudo: false,
            supported_platforms: default_platforms(),
            dependencies: Vec::new(),
        }
    }
}

/// Declares how a plugin participates in a run: its name, mutexes,
/// dependencies, and the command used to invoke its subprocess (if any).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub mutexes: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requires_sudo: bool,
    /// Path to the plugin executable, for subprocess-backed plugins.
    pub executable: Option<String>,
    /// Per-phase subcommand overrides for multi-phase runs. A plugin that
    /// doesn't set this (or leaves a given phase `None`) falls back to the
    /// protocol's default subcommand names (`check`/`download`/`update`).
    #[serde(default)]
    pub phase_commands: Option<PhaseCommands>,
}

/// Per-phase subcommand overrides for a [`PluginDescriptor`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseCommands {
    pub check: Option<String>,
    pub download: Option<String>,
    pub execute: Option<String>,
}

impl PhaseCommands {
    /// The override for `phase`, if the descriptor declared one.
    pub fn for_phase(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Check => self.check.as_deref(),
            Phase::Download => self.download.as_deref(),
            Phase::Execute => self.execute.as_deref(),
        }
    }
}

/// Per-run configuration for a single plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub requires_sudo: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

impl PluginConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            timeout_seconds: default_timeout_secs(),
            retry_count: 0,
            requires_sudo: false,
            dependencies: Vec::new(),
            options: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// The recorded outcome of running a single plugin to completion (or to a
/// terminal non-success state) within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plugin_name: String,
    pub status: PluginStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
    pub error_message: Option<String>,
    pub packages_updated: u64,
}

impl ExecutionResult {
    pub fn pending(plugin_name: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            status: PluginStatus::Pending,
            start_time,
            end_time: None,
            exit_code: None,
            stdout_tail: Vec::new(),
            stderr_tail: Vec::new(),
            error_message: None,
            packages_updated: 0,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Aggregate outcome of a full orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub results: Vec<ExecutionResult>,
}

impl ExecutionSummary {
    pub fn successful_plugins(&self) -> usize {
        self.results.iter().filter(|r| r.status == PluginStatus::Success).count()
    }

    /// Failures folded together with timeouts, treating a timed-out plugin
    /// as a failure for reporting purposes.
    pub fn failed_plugins(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, PluginStatus::Failed | PluginStatus::Timeout))
            .count()
    }

    pub fn skipped_plugins(&self) -> usize {
        self.results.iter().filter(|r| r.status == PluginStatus::Skipped).count()
    }

    pub fn total_duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    /// 0 if every plugin is SUCCESS or SKIPPED, 1 otherwise — the rule the
    /// excluded CLI's exit status follows.
    pub fn exit_code(&self) -> i32 {
        if self.failed_plugins() == 0 {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {}: {} succeeded, {} failed, {} skipped ({} total)",
            self.run_id,
            self.successful_plugins(),
            self.failed_plugins(),
            self.skipped_plugins(),
            self.results.len()
        )?;
        for r in self.results.iter().filter(|r| matches!(r.status, PluginStatus::Failed | PluginStatus::Timeout)) {
            if let Some(msg) = &r.error_message {
                write!(f, "\n  - {}: {}", r.plugin_name, msg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: PluginStatus) -> ExecutionResult {
        ExecutionResult { status, ..ExecutionResult::pending("p", Utc::now()) }
    }

    #[test]
    fn failed_plugins_folds_in_timeouts() {
        let summary = ExecutionSummary {
            run_id: "r1".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            results: vec![result(PluginStatus::Failed), result(PluginStatus::Timeout), result(PluginStatus::Success)],
        };
        assert_eq!(summary.failed_plugins(), 2);
        assert_eq!(summary.successful_plugins(), 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn exit_code_zero_when_no_failures() {
        let summary = ExecutionSummary {
            run_id: "r2".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            results: vec![result(PluginStatus::Success), result(PluginStatus::Skipped)],
        };
        assert_eq!(summary.exit_code(), 0);
    }
}
