//! Per-plugin CHECK/DOWNLOAD/EXECUTE phase state machine, with
//! pause-between-phases and phase-level retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::info;

use crate::models::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub phase: Phase,
    pub state: PhaseState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub output: Vec<String>,
}

impl PhaseResult {
    fn pending(phase: Phase) -> Self {
        Self { phase, state: PhaseState::Pending, start_time: None, end_time: None, exit_code: None, error_message: None, output: Vec::new() }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginPhaseState {
    pub plugin_name: String,
    pub current_phase: Option<Phase>,
    pub phase_results: HashMap<Phase, PhaseResult>,
    pub paused_at_phase: Option<Phase>,
}

impl PluginPhaseState {
    fn new(plugin_name: impl Into<String>) -> Self {
        Self { plugin_name: plugin_name.into(), current_phase: Some(Phase::Check), phase_results: HashMap::new(), paused_at_phase: None }
    }

    pub fn is_complete(&self) -> bool {
        Phase::ALL.iter().all(|p| {
            matches!(self.phase_results.get(p).map(|r| r.state), Some(PhaseState::Completed) | Some(PhaseState::Skipped))
        })
    }

    pub fn get_next_phase(&self) -> Option<Phase> {
        for phase in Phase::ALL {
            match self.phase_results.get(&phase).map(|r| r.state) {
                None => return Some(phase),
                Some(PhaseState::Completed) | Some(PhaseState::Skipped) => continue,
                Some(_) => return Some(phase),
            }
        }
        None
    }
}

/// Orchestrates phase transitions for every registered plugin in a
/// multi-phase run.
pub struct PhaseController {
    pub pause_between_phases: bool,
    plugin_states: DashMap<String, PluginPhaseState>,
    resume_notify: DashMap<String, Arc<Notify>>,
}

impl PhaseController {
    pub fn new(pause_between_phases: bool) -> Self {
        Self { pause_between_phases, plugin_states: DashMap::new(), resume_notify: DashMap::new() }
    }

    pub fn register_plugin(&self, plugin_name: &str) {
        self.plugin_states.entry(plugin_name.to_string()).or_insert_with(|| PluginPhaseState::new(plugin_name));
        self.resume_notify.entry(plugin_name.to_string()).or_insert_with(|| Arc::new(Notify::new()));
    }

    pub fn toggle_pause(&mut self, enabled: bool) {
        self.pause_between_phases = enabled;
    }

    /// Requests a transition into `next_phase`. If pausing is enabled, the
    /// plugin is marked PAUSED and this call blocks until
    /// [`PhaseController::resume_plugin`] or
    /// [`PhaseController::resume_all`] is invoked for it, after which
    /// `current_phase` is set and `paused_at_phase` cleared. Returns
    /// `false` if the plugin was never registered.
    pub async fn request_phase_transition(&self, plugin_name: &str, next_phase: Phase) -> bool {
        if !self.plugin_states.contains_key(plugin_name) {
            return false;
        }
        if self.pause_between_phases {
            let notify = {
                let mut state = self.plugin_states.get_mut(plugin_name).unwrap();
                state.paused_at_phase = Some(next_phase);
                self.resume_notify.entry(plugin_name.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
            };
            info!(plugin = plugin_name, phase = ?next_phase, "paused before phase");
            notify.notified().await;
        }
        let mut state = self.plugin_states.get_mut(plugin_name).unwrap();
        state.current_phase = Some(next_phase);
        state.paused_at_phase = None;
        true
    }

    pub fn start_phase(&self, plugin_name: &str, phase: Phase) {
        let mut state = self.plugin_states.entry(plugin_name.to_string()).or_insert_with(|| PluginPhaseState::new(plugin_name));
        let mut result = PhaseResult::pending(phase);
        result.state = PhaseState::Running;
        result.start_time = Some(Utc::now());
        state.phase_results.insert(phase, result);
        info!(plugin = plugin_name, ?phase, "phase started");
    }

    pub fn complete_phase(&self, plugin_name: &str, phase: Phase, success: bool, exit_code: Option<i32>, error: Option<String>) {
        let mut state = self.plugin_states.entry(plugin_name.to_string()).or_insert_with(|| PluginPhaseState::new(plugin_name));
        let result = state.phase_results.entry(phase).or_insert_with(|| PhaseResult::pending(phase));
        result.state = if success { PhaseState::Completed } else { PhaseState::Failed };
        result.end_time = Some(Utc::now());
        result.exit_code = exit_code;
        result.error_message = error;
        info!(plugin = plugin_name, ?phase, success, "phase complete");
    }

    pub fn skip_plugin(&self, plugin_name: &str, reason: &str) {
        let mut state = self.plugin_states.entry(plugin_name.to_string()).or_insert_with(|| PluginPhaseState::new(plugin_name));
        for phase in Phase::ALL {
            let mut result = PhaseResult::pending(phase);
            result.state = PhaseState::Skipped;
            result.error_message = Some(reason.to_string());
            state.phase_results.insert(phase, result);
        }
    }

    /// Clears a failed phase's result so the next scheduling pass restarts
    /// it.
    pub fn reset_phase(&self, plugin_name: &str, phase: Phase) {
        if let Some(mut state) = self.plugin_states.get_mut(plugin_name) {
            state.phase_results.remove(&phase);
        }
    }

    pub fn resume_plugin(&self, plugin_name: &str) {
        if let Some(notify) = self.resume_notify.get(plugin_name) {
            notify.notify_one();
        }
    }

    pub fn resume_all(&self) {
        for entry in self.resume_notify.iter() {
            entry.value().notify_one();
        }
    }

    pub fn is_paused(&self, plugin_name: &str) -> bool {
        self.plugin_states.get(plugin_name).map(|s| s.paused_at_phase.is_some()).unwrap_or(false)
    }

    pub fn get_paused_plugins(&self) -> Vec<String> {
        self.plugin_states.iter().filter(|e| e.paused_at_phase.is_some()).map(|e| e.key().clone()).collect()
    }

    pub fn get_current_phase(&self, plugin_name: &str) -> Option<Phase> {
        self.plugin_states.get(plugin_name).and_then(|s| s.get_next_phase())
    }

    pub fn get_all_phase_results(&self, plugin_name: &str) -> HashMap<Phase, PhaseResult> {
        self.plugin_states.get(plugin_name).map(|s| s.phase_results.clone()).unwrap_or_default()
    }

    /// Sum of recorded phase durations plus counts, for reporting.
    pub fn get_cumulative_metrics(&self, plugin_name: &str) -> (f64, usize, usize) {
        let results = self.get_all_phase_results(plugin_name);
        let total: f64 = results.values().filter_map(|r| r.duration_seconds()).sum();
        let completed = results.values().filter(|r| r.state == PhaseState::Completed).count();
        let failed = results.values().filter(|r| r.state == PhaseState::Failed).count();
        (total, completed, failed)
    }

    /// Whether retrying only `phase` is safe, delegated to a
    /// caller-supplied predicate over the earlier phase's recorded output
    /// (since only the plugin knows where its artifacts live — see the
    /// retry-across-phases design note). Returns `true` for CHECK, which
    /// has no upstream artifacts to validate.
    pub fn phase_artifacts_present(&self, plugin_name: &str, phase: Phase, artifacts_check: impl FnOnce(&PhaseResult) -> bool) -> bool {
        if phase == Phase::Check {
            return true;
        }
        let prior = match phase {
            Phase::Download => Phase::Check,
            Phase::Execute => Phase::Download,
            Phase::Check => unreachable!(),
        };
        match self.plugin_states.get(plugin_name).and_then(|s| s.phase_results.get(&prior).cloned()) {
            Some(result) if result.state == PhaseState::Completed => artifacts_check(&result),
            _ => false,
        }
    }

    pub fn is_plugin_complete(&self, plugin_name: &str) -> bool {
        self.plugin_states.get(plugin_name).map(|s| s.is_complete()).unwrap_or(false)
    }
}

impl Default for PhaseController {
    fn default() -> Self {
        Self::new(false)
    }
}
