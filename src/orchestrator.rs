//! Drives a single-phase run: builds the DAG/waves, supervises each
//! plugin under mutex and resource control, and assembles the summary.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};

use crate::error::EngineError;
use crate::events::EventQueueHandle;
use crate::models::{ExecutionResult, ExecutionSummary, Phase, PhaseCommands, PluginConfig, PluginDescriptor, PluginStatus};
use crate::mutex::MutexManager;
use crate::phase_controller::PhaseController;
use crate::plugin::PluginKind;
use crate::resource::ResourceController;
use crate::scheduler::ExecutionDag;

pub struct Orchestrator {
    mutexes: Arc<MutexManager>,
    resources: Arc<ResourceController>,
    continue_on_error: bool,
}

impl Orchestrator {
    pub fn new(mutexes: Arc<MutexManager>, resources: Arc<ResourceController>, continue_on_error: bool) -> Self {
        Self { mutexes, resources, continue_on_error }
    }

    fn run_id() -> String {
        let mut rng = rand::thread_rng();
        let n: u32 = rng.gen();
        format!("run-{n:08x}")
    }

    fn config_for<'a>(configs: &'a HashMap<String, PluginConfig>, name: &str) -> std::borrow::Cow<'a, PluginConfig> {
        match configs.get(name) {
            Some(c) => std::borrow::Cow::Borrowed(c),
            None => std::borrow::Cow::Owned(PluginConfig::new(name)),
        }
    }

    /// Runs every enabled plugin in `plugins` according to the dependency
    /// and mutex DAG, wave by wave, stopping after a wave with a failure
    /// unless `continue_on_error` was set.
    pub async fn run_all(
        &self,
        descriptors: Vec<PluginDescriptor>,
        plugins: HashMap<String, Arc<PluginKind>>,
        configs: HashMap<String, PluginConfig>,
        dry_run: bool,
        sink: EventQueueHandle,
    ) -> Result<ExecutionSummary, EngineError> {
        let run_id = Self::run_id();
        let start_time = Utc::now();
        let span = info_span!("run", run_id = %run_id);
        async {
            info!(plugins = descriptors.len(), "starting run");

            let (enabled, disabled): (Vec<PluginDescriptor>, Vec<PluginDescriptor>) =
                descriptors.into_iter().partition(|d| Self::config_for(&configs, &d.name).enabled);
            let skipped_names: Vec<String> = disabled.into_iter().map(|d| d.name).collect();
            let mutex_sets: HashMap<String, Vec<String>> = enabled.iter().map(|d| (d.name.clone(), d.mutexes.clone())).collect();

            let dag = ExecutionDag::build(&enabled)?;
            let waves = dag.waves()?;

            let mut results: HashMap<String, ExecutionResult> = HashMap::new();
            for name in &skipped_names {
                results.insert(name.clone(), ExecutionResult { status: PluginStatus::Skipped, ..ExecutionResult::pending(name, start_time) });
            }

            let mut aborted = false;
            for wave in waves {
                if aborted {
                    for name in wave {
                        results.insert(name.clone(), ExecutionResult { status: PluginStatus::Skipped, ..ExecutionResult::pending(&name, Utc::now()) });
                    }
                    continue;
                }

                let mut set: JoinSet<(String, ExecutionResult)> = JoinSet::new();
                for name in wave {
                    let Some(plugin) = plugins.get(&name).cloned() else {
                        results.insert(
                            name.clone(),
                            ExecutionResult {
                                status: PluginStatus::Failed,
                                error_message: Some("no plugin implementation registered".to_string()),
                                ..ExecutionResult::pending(&name, Utc::now())
                            },
                        );
                        continue;
                    };
                    let config = Self::config_for(&configs, &name).into_owned();
                    let mutexes = Arc::clone(&self.mutexes);
                    let resources = Arc::clone(&self.resources);
                    let sink = sink.clone();
                    let plugin_mutexes = mutex_sets.get(&name).cloned().unwrap_or_default();

                    set.spawn(
                        async move {
                            let result = Self::run_one(plugin, config, plugin_mutexes, mutexes, resources, dry_run, sink).await;
                            (name, result)
                        }
                        .in_current_span(),
                    );
                }

                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((name, result)) => {
                            let failed = matches!(result.status, PluginStatus::Failed | PluginStatus::Timeout);
                            results.insert(name, result);
                            if failed && !self.continue_on_error {
                                aborted = true;
                            }
                        }
                        Err(join_err) => {
                            error!(error = %join_err, "plugin supervision task panicked");
                            aborted = aborted || !self.continue_on_error;
                        }
                    }
                }
            }

            let end_time = Utc::now();
            let mut results: Vec<ExecutionResult> = results.into_values().collect();
            results.sort_by(|a, b| a.plugin_name.cmp(&b.plugin_name));
            let summary = ExecutionSummary { run_id, start_time, end_time, results };
            info!(%summary, "run complete");
            sink.close();
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn run_one(
        plugin: Arc<PluginKind>,
        config: PluginConfig,
        mutex_set: Vec<String>,
        mutexes: Arc<MutexManager>,
        resources: Arc<ResourceController>,
        dry_run: bool,
        sink: EventQueueHandle,
    ) -> ExecutionResult {
        let name = plugin.name().to_string();
        let start_time = Utc::now();
        let timeout = config.timeout();

        let _task_permit = resources.acquire_task_slot().await;

        if !mutex_set.is_empty() && !mutexes.acquire(&name, &mutex_set, timeout).await {
            return ExecutionResult {
                status: PluginStatus::Failed,
                end_time: Some(Utc::now()),
                error_message: Some("mutex timeout".to_string()),
                ..ExecutionResult::pending(&name, start_time)
            };
        }

        let outcome = async {
            match plugin.check_available().await {
                Ok(false) => {
                    return ExecutionResult { status: PluginStatus::Skipped, end_time: Some(Utc::now()), ..ExecutionResult::pending(&name, start_time) }
                }
                Err(e) => {
                    return ExecutionResult {
                        status: PluginStatus::Failed,
                        end_time: Some(Utc::now()),
                        error_message: Some(e),
                        ..ExecutionResult::pending(&name, start_time)
                    }
                }
                Ok(true) => {}
            }

            if plugin.pre_execute().await.is_err() {
                // pre_execute failures are non-fatal; the default hook is a no-op.
            }

            let result = plugin.execute(dry_run, timeout, sink).await;
            let _ = plugin.post_execute(result.is_ok()).await;

            match result {
                Ok(exit_code) => ExecutionResult {
                    status: PluginStatus::Success,
                    end_time: Some(Utc::now()),
                    exit_code: Some(exit_code),
                    ..ExecutionResult::pending(&name, start_time)
                },
                Err(EngineError::Timeout { .. }) => ExecutionResult {
                    status: PluginStatus::Timeout,
                    end_time: Some(Utc::now()),
                    error_message: Some("timed out".to_string()),
                    ..ExecutionResult::pending(&name, start_time)
                },
                Err(EngineError::ProcessFailure { exit_code, .. }) => ExecutionResult {
                    status: PluginStatus::Failed,
                    end_time: Some(Utc::now()),
                    exit_code: Some(exit_code),
                    error_message: Some(format!("exited with status {exit_code}")),
                    ..ExecutionResult::pending(&name, start_time)
                },
                Err(e) => ExecutionResult {
                    status: PluginStatus::Failed,
                    end_time: Some(Utc::now()),
                    error_message: Some(e.to_string()),
                    ..ExecutionResult::pending(&name, start_time)
                },
            }
        }
        .await;

        mutexes.release(&name, None).await;
        outcome
    }

    /// Runs every enabled plugin through the full CHECK/DOWNLOAD/EXECUTE
    /// lifecycle via `phases`, still respecting the dependency/mutex wave
    /// order used by [`Orchestrator::run_all`]. A plugin's mutex set (if
    /// any) is held across all three phases, not re-acquired per phase.
    /// `phase_commands` is keyed by plugin name and feeds each plugin's
    /// optional per-phase subcommand overrides to [`PluginKind::run_phase`].
    pub async fn run_multi_phase(
        &self,
        descriptors: Vec<PluginDescriptor>,
        plugins: HashMap<String, Arc<PluginKind>>,
        configs: HashMap<String, PluginConfig>,
        phases: Arc<PhaseController>,
        dry_run: bool,
        sink: EventQueueHandle,
    ) -> Result<ExecutionSummary, EngineError> {
        let run_id = Self::run_id();
        let start_time = Utc::now();
        let span = info_span!("multi_phase_run", run_id = %run_id);
        async {
            info!(plugins = descriptors.len(), "starting multi-phase run");

            let (enabled, disabled): (Vec<PluginDescriptor>, Vec<PluginDescriptor>) =
                descriptors.into_iter().partition(|d| Self::config_for(&configs, &d.name).enabled);
            let skipped_names: Vec<String> = disabled.into_iter().map(|d| d.name).collect();
            let mutex_sets: HashMap<String, Vec<String>> = enabled.iter().map(|d| (d.name.clone(), d.mutexes.clone())).collect();
            let phase_cmds: HashMap<String, Option<PhaseCommands>> = enabled.iter().map(|d| (d.name.clone(), d.phase_commands.clone())).collect();

            let dag = ExecutionDag::build(&enabled)?;
            let waves = dag.waves()?;

            let mut results: HashMap<String, ExecutionResult> = HashMap::new();
            for name in &skipped_names {
                results.insert(name.clone(), ExecutionResult { status: PluginStatus::Skipped, ..ExecutionResult::pending(name, start_time) });
            }

            let mut aborted = false;
            for wave in waves {
                if aborted {
                    for name in wave {
                        results.insert(name.clone(), ExecutionResult { status: PluginStatus::Skipped, ..ExecutionResult::pending(&name, Utc::now()) });
                    }
                    continue;
                }

                let mut set: JoinSet<(String, ExecutionResult)> = JoinSet::new();
                for name in wave {
                    let Some(plugin) = plugins.get(&name).cloned() else {
                        results.insert(
                            name.clone(),
                            ExecutionResult {
                                status: PluginStatus::Failed,
                                error_message: Some("no plugin implementation registered".to_string()),
                                ..ExecutionResult::pending(&name, Utc::now())
                            },
                        );
                        continue;
                    };
                    let config = Self::config_for(&configs, &name).into_owned();
                    let mutexes = Arc::clone(&self.mutexes);
                    let resources = Arc::clone(&self.resources);
                    let sink = sink.clone();
                    let plugin_mutexes = mutex_sets.get(&name).cloned().unwrap_or_default();
                    let phase_commands = phase_cmds.get(&name).cloned().flatten();
                    let phases = Arc::clone(&phases);
                    phases.register_plugin(&name);

                    set.spawn(
                        async move {
                            let result = Self::run_one_multi_phase(plugin, config, plugin_mutexes, mutexes, resources, phases, phase_commands, dry_run, sink).await;
                            (name, result)
                        }
                        .in_current_span(),
                    );
                }

                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((name, result)) => {
                            let failed = matches!(result.status, PluginStatus::Failed | PluginStatus::Timeout);
                            results.insert(name, result);
                            if failed && !self.continue_on_error {
                                aborted = true;
                            }
                        }
                        Err(join_err) => {
                            error!(error = %join_err, "plugin supervision task panicked");
                            aborted = aborted || !self.continue_on_error;
                        }
                    }
                }
            }

            let end_time = Utc::now();
            let mut results: Vec<ExecutionResult> = results.into_values().collect();
            results.sort_by(|a, b| a.plugin_name.cmp(&b.plugin_name));
            let summary = ExecutionSummary { run_id, start_time, end_time, results };
            info!(%summary, "multi-phase run complete");
            sink.close();
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_multi_phase(
        plugin: Arc<PluginKind>,
        config: PluginConfig,
        mutex_set: Vec<String>,
        mutexes: Arc<MutexManager>,
        resources: Arc<ResourceController>,
        phases: Arc<PhaseController>,
        phase_commands: Option<PhaseCommands>,
        dry_run: bool,
        sink: EventQueueHandle,
    ) -> ExecutionResult {
        let name = plugin.name().to_string();
        let start_time = Utc::now();
        let timeout = config.timeout();

        let _task_permit = resources.acquire_task_slot().await;

        if !mutex_set.is_empty() && !mutexes.acquire(&name, &mutex_set, timeout).await {
            return ExecutionResult {
                status: PluginStatus::Failed,
                end_time: Some(Utc::now()),
                error_message: Some("mutex timeout".to_string()),
                ..ExecutionResult::pending(&name, start_time)
            };
        }

        let outcome = async {
            match plugin.check_available().await {
                Ok(false) => {
                    phases.skip_plugin(&name, "not applicable");
                    return ExecutionResult { status: PluginStatus::Skipped, end_time: Some(Utc::now()), ..ExecutionResult::pending(&name, start_time) };
                }
                Err(e) => {
                    return ExecutionResult {
                        status: PluginStatus::Failed,
                        end_time: Some(Utc::now()),
                        error_message: Some(e),
                        ..ExecutionResult::pending(&name, start_time)
                    }
                }
                Ok(true) => {}
            }

            let mut last_error: Option<String> = None;
            let mut last_exit_code: Option<i32> = None;
            for phase in Phase::ALL {
                if !phases.request_phase_transition(&name, phase).await {
                    last_error = Some("phase controller lost track of plugin".to_string());
                    break;
                }
                phases.start_phase(&name, phase);
                match plugin.run_phase(phase, dry_run, timeout, sink.clone(), phase_commands.as_ref()).await {
                    Ok(code) => {
                        phases.complete_phase(&name, phase, true, Some(code), None);
                        last_exit_code = Some(code);
                    }
                    Err(EngineError::Timeout { .. }) => {
                        phases.complete_phase(&name, phase, false, None, Some("timed out".to_string()));
                        return ExecutionResult {
                            status: PluginStatus::Timeout,
                            end_time: Some(Utc::now()),
                            error_message: Some(format!("phase {phase:?} timed out")),
                            ..ExecutionResult::pending(&name, start_time)
                        };
                    }
                    Err(EngineError::ProcessFailure { exit_code, .. }) => {
                        phases.complete_phase(&name, phase, false, Some(exit_code), Some(format!("exited with status {exit_code}")));
                        last_error = Some(format!("phase {phase:?} exited with status {exit_code}"));
                        last_exit_code = Some(exit_code);
                        break;
                    }
                    Err(e) => {
                        phases.complete_phase(&name, phase, false, None, Some(e.to_string()));
                        last_error = Some(e.to_string());
                        break;
                    }
                }
            }

            if let Some(error) = last_error {
                ExecutionResult { status: PluginStatus::Failed, end_time: Some(Utc::now()), exit_code: last_exit_code, error_message: Some(error), ..ExecutionResult::pending(&name, start_time) }
            } else {
                ExecutionResult { status: PluginStatus::Success, end_time: Some(Utc::now()), exit_code: last_exit_code, ..ExecutionResult::pending(&name, start_time) }
            }
        }
        .await;

        mutexes.release(&name, None).await;
        outcome
    }
}

/// The simpler legacy execution path: no DAG, no mutex acquisition, no
/// resource limits — plugins run strictly in the order given. Retained
/// alongside the wave-based [`Orchestrator`] for embedders with a flat
/// plugin list and no shared-resource contention to schedule around.
pub struct SequentialOrchestrator {
    continue_on_error: bool,
}

impl SequentialOrchestrator {
    pub fn new(continue_on_error: bool) -> Self {
        Self { continue_on_error }
    }

    /// Runs every enabled plugin in `descriptors`' order, one at a time,
    /// sharing [`ExecutionResult`]/[`ExecutionSummary`] and the same
    /// failure rule as [`Orchestrator::run_all`]: a Failed or Timeout
    /// plugin skips everything after it unless `continue_on_error` is set.
    pub async fn run_all(
        &self,
        descriptors: Vec<PluginDescriptor>,
        plugins: HashMap<String, Arc<PluginKind>>,
        configs: HashMap<String, PluginConfig>,
        dry_run: bool,
        sink: EventQueueHandle,
    ) -> ExecutionSummary {
        let run_id = Orchestrator::run_id();
        let start_time = Utc::now();
        let mut results = Vec::new();
        let mut aborted = false;

        for descriptor in descriptors {
            let config = Orchestrator::config_for(&configs, &descriptor.name).into_owned();
            if !config.enabled || aborted {
                results.push(ExecutionResult { status: PluginStatus::Skipped, ..ExecutionResult::pending(&descriptor.name, Utc::now()) });
                continue;
            }

            let Some(plugin) = plugins.get(&descriptor.name).cloned() else {
                results.push(ExecutionResult {
                    status: PluginStatus::Failed,
                    error_message: Some("no plugin implementation registered".to_string()),
                    ..ExecutionResult::pending(&descriptor.name, Utc::now())
                });
                continue;
            };

            let name = descriptor.name.clone();
            let timeout = config.timeout();
            let plugin_start = Utc::now();
            let result = match plugin.check_available().await {
                Ok(false) => ExecutionResult { status: PluginStatus::Skipped, end_time: Some(Utc::now()), ..ExecutionResult::pending(&name, plugin_start) },
                Err(e) => ExecutionResult { status: PluginStatus::Failed, end_time: Some(Utc::now()), error_message: Some(e), ..ExecutionResult::pending(&name, plugin_start) },
                Ok(true) => {
                    let _ = plugin.pre_execute().await;
                    let exec_result = plugin.execute(dry_run, timeout, sink.clone()).await;
                    let _ = plugin.post_execute(exec_result.is_ok()).await;
                    match exec_result {
                        Ok(exit_code) => {
                            ExecutionResult { status: PluginStatus::Success, end_time: Some(Utc::now()), exit_code: Some(exit_code), ..ExecutionResult::pending(&name, plugin_start) }
                        }
                        Err(EngineError::Timeout { .. }) => ExecutionResult {
                            status: PluginStatus::Timeout,
                            end_time: Some(Utc::now()),
                            error_message: Some("timed out".to_string()),
                            ..ExecutionResult::pending(&name, plugin_start)
                        },
                        Err(EngineError::ProcessFailure { exit_code, .. }) => ExecutionResult {
                            status: PluginStatus::Failed,
                            end_time: Some(Utc::now()),
                            exit_code: Some(exit_code),
                            error_message: Some(format!("exited with status {exit_code}")),
                            ..ExecutionResult::pending(&name, plugin_start)
                        },
                        Err(e) => ExecutionResult {
                            status: PluginStatus::Failed,
                            end_time: Some(Utc::now()),
                            error_message: Some(e.to_string()),
                            ..ExecutionResult::pending(&name, plugin_start)
                        },
                    }
                }
            };

            if matches!(result.status, PluginStatus::Failed | PluginStatus::Timeout) && !self.continue_on_error {
                aborted = true;
            }
            results.push(result);
        }

        let end_time = Utc::now();
        sink.close();
        ExecutionSummary { run_id, start_time, end_time, results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;
    use crate::plugin::InProcessPlugin;
    use crate::resource::ResourceLimits;
    use std::sync::Arc as StdArc;

    fn descriptor(name: &str, deps: &[&str]) -> PluginDescriptor {
        PluginDescriptor {
            name: name.to_string(),
            mutexes: Vec::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            requires_sudo: false,
            executable: None,
            phase_commands: None,
        }
    }

    fn in_process(name: &str, ok: bool) -> Arc<PluginKind> {
        Arc::new(PluginKind::InProcess(InProcessPlugin {
            name: name.to_string(),
            metadata: crate::models::PluginMetadata::new(name),
            check_available: StdArc::new(|| true),
            execute: StdArc::new(move |_| Box::pin(async move { if ok { Ok(()) } else { Err("boom".to_string()) } })),
        }))
    }

    #[tokio::test]
    async fn run_all_succeeds_in_dependency_order() {
        let orchestrator = Orchestrator::new(Arc::new(MutexManager::new()), Arc::new(ResourceController::new(ResourceLimits::default())), false);
        let descriptors = vec![descriptor("a", &[]), descriptor("b", &["a"])];
        let mut plugins = HashMap::new();
        plugins.insert("a".to_string(), in_process("a", true));
        plugins.insert("b".to_string(), in_process("b", true));

        let mut queue = EventQueue::new(100);
        let handle = queue.handle();
        let summary = orchestrator.run_all(descriptors, plugins, HashMap::new(), false, handle).await.unwrap();
        assert_eq!(summary.successful_plugins(), 2);
    }

    #[tokio::test]
    async fn failure_aborts_later_waves_without_continue_on_error() {
        let orchestrator = Orchestrator::new(Arc::new(MutexManager::new()), Arc::new(ResourceController::new(ResourceLimits::default())), false);
        let descriptors = vec![descriptor("a", &[]), descriptor("b", &["a"])];
        let mut plugins = HashMap::new();
        plugins.insert("a".to_string(), in_process("a", false));
        plugins.insert("b".to_string(), in_process("b", true));

        let mut queue = EventQueue::new(100);
        let handle = queue.handle();
        let summary = orchestrator.run_all(descriptors, plugins, HashMap::new(), false, handle).await.unwrap();
        assert_eq!(summary.failed_plugins(), 1);
        let b = summary.results.iter().find(|r| r.plugin_name == "b").unwrap();
        assert_eq!(b.status, PluginStatus::Skipped);
    }

    #[tokio::test]
    async fn disabled_plugin_is_excluded_entirely() {
        let orchestrator = Orchestrator::new(Arc::new(MutexManager::new()), Arc::new(ResourceController::new(ResourceLimits::default())), true);
        let descriptors = vec![descriptor("a", &[])];
        let mut plugins = HashMap::new();
        plugins.insert("a".to_string(), in_process("a", true));
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), PluginConfig { enabled: false, ..PluginConfig::new("a") });

        let mut queue = EventQueue::new(10);
        let handle = queue.handle();
        let summary = orchestrator.run_all(descriptors, plugins, configs, false, handle).await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].status, PluginStatus::Skipped);
    }

    #[tokio::test]
    async fn run_multi_phase_drives_every_plugin_through_all_three_phases() {
        let orchestrator = Orchestrator::new(Arc::new(MutexManager::new()), Arc::new(ResourceController::new(ResourceLimits::default())), false);
        let descriptors = vec![descriptor("a", &[])];
        let mut plugins = HashMap::new();
        plugins.insert("a".to_string(), in_process("a", true));

        let phases = StdArc::new(crate::phase_controller::PhaseController::new(false));
        let mut queue = EventQueue::new(100);
        let handle = queue.handle();
        let summary = orchestrator.run_multi_phase(descriptors, plugins, HashMap::new(), phases.clone(), false, handle).await.unwrap();

        assert_eq!(summary.successful_plugins(), 1);
        assert!(phases.is_plugin_complete("a"));
        let results = phases.get_all_phase_results("a");
        for phase in crate::models::Phase::ALL {
            assert_eq!(results.get(&phase).map(|r| r.state), Some(crate::phase_controller::PhaseState::Completed));
        }
    }

    #[tokio::test]
    async fn run_multi_phase_skips_not_applicable_plugins() {
        let orchestrator = Orchestrator::new(Arc::new(MutexManager::new()), Arc::new(ResourceController::new(ResourceLimits::default())), false);
        let descriptors = vec![descriptor("a", &[])];
        let mut plugins = HashMap::new();
        plugins.insert(
            "a".to_string(),
            StdArc::new(PluginKind::InProcess(InProcessPlugin {
                name: "a".to_string(),
                metadata: crate::models::PluginMetadata::new("a"),
                check_available: StdArc::new(|| false),
                execute: StdArc::new(|_| Box::pin(async move { Ok(()) })),
            })),
        );

        let phases = StdArc::new(crate::phase_controller::PhaseController::new(false));
        let mut queue = EventQueue::new(100);
        let handle = queue.handle();
        let summary = orchestrator.run_multi_phase(descriptors, plugins, HashMap::new(), phases, false, handle).await.unwrap();
        assert_eq!(summary.skipped_plugins(), 1);
    }

    #[tokio::test]
    async fn sequential_orchestrator_runs_in_list_order_and_stops_on_failure() {
        let orchestrator = SequentialOrchestrator::new(false);
        let descriptors = vec![descriptor("a", &[]), descriptor("b", &[])];
        let mut plugins = HashMap::new();
        plugins.insert("a".to_string(), in_process("a", false));
        plugins.insert("b".to_string(), in_process("b", true));

        let mut queue = EventQueue::new(100);
        let handle = queue.handle();
        let summary = orchestrator.run_all(descriptors, plugins, HashMap::new(), false, handle).await;
        assert_eq!(summary.failed_plugins(), 1);
        let b = summary.results.iter().find(|r| r.plugin_name == "b").unwrap();
        assert_eq!(b.status, PluginStatus::Skipped);
    }
}
