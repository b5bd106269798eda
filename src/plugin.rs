//! Plugin representation and the subprocess protocol adapter.
//!
//! A plugin is a sum type rather than a trait object: the common
//! `Subprocess` variant speaks the wire protocol of the plugin process
//! contract; `InProcess` lets tests and a future in-process plugin supply
//! async closures directly without spawning a real executable.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::events::{EventQueueHandle, OutputStream, StreamEvent, TimestampedEvent};
use crate::models::{Phase, PhaseCommands, PluginMetadata};

const PROGRESS_PREFIX: &str = "PROGRESS:";

/// A plugin speaking the subprocess protocol: `is-applicable`,
/// `update [--dry-run]`, and the optional auxiliary sub-operations.
#[derive(Debug, Clone)]
pub struct SubprocessPlugin {
    pub name: String,
    pub executable: String,
    pub metadata: PluginMetadata,
}

/// A plugin supplied directly as async closures, used by tests that need
/// to drive the orchestrator/scheduler without real executables.
pub struct InProcessPlugin {
    pub name: String,
    pub metadata: PluginMetadata,
    pub check_available: Arc<dyn Fn() -> bool + Send + Sync>,
    #[allow(clippy::type_complexity)]
    pub execute: Arc<dyn Fn(bool) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>,
}

impl std::fmt::Debug for InProcessPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessPlugin").field("name", &self.name).finish()
    }
}

/// A plugin in either representation.
#[derive(Debug)]
pub enum PluginKind {
    Subprocess(SubprocessPlugin),
    InProcess(InProcessPlugin),
}

impl PluginKind {
    pub fn name(&self) -> &str {
        match self {
            PluginKind::Subprocess(p) => &p.name,
            PluginKind::InProcess(p) => &p.name,
        }
    }

    pub fn metadata(&self) -> &PluginMetadata {
        match self {
            PluginKind::Subprocess(p) => &p.metadata,
            PluginKind::InProcess(p) => &p.metadata,
        }
    }

    /// Runs `is-applicable`. Unknown exit codes (neither 0 nor 1) are
    /// treated as "not applicable" with a diagnostic, per the resolved
    /// Open Question on `is-applicable` timeouts/unknown exits.
    pub async fn check_available(&self) -> Result<bool, String> {
        match self {
            PluginKind::InProcess(p) => Ok((p.check_available)()),
            PluginKind::Subprocess(p) => {
                let output = Command::new(&p.executable).arg("is-applicable").output().await.map_err(|e| e.to_string())?;
                match output.status.code() {
                    Some(0) => Ok(true),
                    Some(1) => Ok(false),
                    Some(other) => {
                        warn!(plugin = %p.name, code = other, "is-applicable returned unrecognized exit code, treating as not applicable");
                        Ok(false)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    pub async fn pre_execute(&self) -> Result<(), String> {
        Ok(())
    }

    pub async fn post_execute(&self, _success: bool) -> Result<(), String> {
        Ok(())
    }

    /// Runs `update [--dry-run]`, streaming events to `sink` and enforcing
    /// `plugin_timeout` as a wall-clock bound across the whole invocation.
    /// Always emits a terminal `Completion` as the last event, even on
    /// timeout or spawn failure.
    pub async fn execute(&self, dry_run: bool, plugin_timeout: Duration, sink: EventQueueHandle) -> Result<i32, EngineError> {
        match self {
            PluginKind::InProcess(p) => {
                let fut = (p.execute)(dry_run);
                match timeout(plugin_timeout, fut).await {
                    Ok(Ok(())) => {
                        sink.put(TimestampedEvent::new(&p.name, StreamEvent::Completion { success: true, exit_code: 0, packages_updated: 0, error: None }));
                        Ok(0)
                    }
                    Ok(Err(message)) => {
                        sink.put(TimestampedEvent::new(&p.name, StreamEvent::Completion { success: false, exit_code: 1, packages_updated: 0, error: Some(message) }));
                        Ok(1)
                    }
                    Err(_) => {
                        sink.put(TimestampedEvent::new(&p.name, StreamEvent::Completion { success: false, exit_code: -1, packages_updated: 0, error: Some("timeout".to_string()) }));
                        Err(EngineError::Timeout { plugin: p.name.clone(), elapsed_secs: plugin_timeout.as_secs() })
                    }
                }
            }
            PluginKind::Subprocess(p) => run_subprocess(p, "update", dry_run, plugin_timeout, sink).await,
        }
    }

    /// Runs a single phase of the multi-phase protocol: the subcommand is
    /// `phase_commands`' override for `phase` if the descriptor declared
    /// one, else the protocol default from [`phase_subcommand`]. An
    /// `InProcess` plugin only models the legacy single-phase `execute`
    /// closure, so CHECK/DOWNLOAD are no-ops that succeed immediately and
    /// EXECUTE delegates to it — multi-phase test plugins don't need to
    /// implement all three phases to be driven by the phase controller.
    pub async fn run_phase(
        &self,
        phase: Phase,
        dry_run: bool,
        phase_timeout: Duration,
        sink: EventQueueHandle,
        phase_commands: Option<&PhaseCommands>,
    ) -> Result<i32, EngineError> {
        match self {
            PluginKind::InProcess(_) => {
                if phase == Phase::Execute {
                    self.execute(dry_run, phase_timeout, sink).await
                } else {
                    Ok(0)
                }
            }
            PluginKind::Subprocess(p) => {
                let default = phase_subcommand(phase);
                let command = phase_commands.and_then(|c| c.for_phase(phase)).unwrap_or(default);
                run_subprocess(p, command, dry_run, phase_timeout, sink).await
            }
        }
    }
}

async fn run_subprocess(
    plugin: &SubprocessPlugin,
    command: &str,
    dry_run: bool,
    plugin_timeout: Duration,
    sink: EventQueueHandle,
) -> Result<i32, EngineError> {
    let mut cmd = Command::new(&plugin.executable);
    cmd.arg(command);
    if dry_run {
        cmd.arg("--dry-run");
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| EngineError::Spawn { plugin: plugin.name.clone(), source: e })?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let name_out = plugin.name.clone();
    let name_err = plugin.name.clone();
    let sink_out = sink.clone();
    let sink_err = sink.clone();

    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink_out.put(TimestampedEvent::new(&name_out, StreamEvent::Output { stream: OutputStream::Stdout, line }));
        }
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(payload) = line.strip_prefix(PROGRESS_PREFIX) {
                match serde_json::from_str::<StreamEvent>(payload.trim()) {
                    Ok(event) => sink_err.put(TimestampedEvent::new(&name_err, event)),
                    Err(e) => {
                        debug!(plugin = %name_err, error = %e, "malformed PROGRESS line, forwarding as raw output");
                        sink_err.put(TimestampedEvent::new(&name_err, StreamEvent::Output { stream: OutputStream::Stderr, line }))
                    }
                }
            } else {
                sink_err.put(TimestampedEvent::new(&name_err, StreamEvent::Output { stream: OutputStream::Stderr, line }))
            };
        }
    });

    let wait_result = timeout(plugin_timeout, child.wait()).await;
    let _ = tokio::join!(stdout_task, stderr_task);

    match wait_result {
        Ok(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            let success = status.success();
            sink.put(TimestampedEvent::new(
                &plugin.name,
                StreamEvent::Completion { success, exit_code: code, packages_updated: 0, error: if success { None } else { Some(format!("exited with status {code}")) } },
            ));
            if success {
                Ok(code)
            } else {
                Err(EngineError::ProcessFailure { plugin: plugin.name.clone(), exit_code: code })
            }
        }
        Ok(Err(e)) => Err(EngineError::Spawn { plugin: plugin.name.clone(), source: e }),
        Err(_) => {
            kill_process_group(&mut child).await;
            sink.put(TimestampedEvent::new(
                &plugin.name,
                StreamEvent::Completion { success: false, exit_code: -1, packages_updated: 0, error: Some("timed out".to_string()) },
            ));
            Err(EngineError::Timeout { plugin: plugin.name.clone(), elapsed_secs: plugin_timeout.as_secs() })
        }
    }
}

#[cfg(unix)]
async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn kill_process_group(child: &mut Child) {
    let _ = child.kill().await;
}

/// The protocol's default subcommand name for each phase, used when a
/// plugin's descriptor doesn't override it via `phase_commands`.
pub fn phase_subcommand(phase: Phase) -> &'static str {
    match phase {
        Phase::Check => "check",
        Phase::Download => "download",
        Phase::Execute => "update",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;

    fn in_process(name: &str, applicable: bool, ok: bool) -> PluginKind {
        PluginKind::InProcess(InProcessPlugin {
            name: name.to_string(),
            metadata: PluginMetadata::new(name),
            check_available: Arc::new(move || applicable),
            execute: Arc::new(move |_dry_run| {
                Box::pin(async move { if ok { Ok(()) } else { Err("boom".to_string()) } })
            }),
        })
    }

    #[tokio::test]
    async fn in_process_success_emits_completion() {
        let plugin = in_process("p", true, true);
        let mut queue = EventQueue::new(10);
        let handle = queue.handle();
        let code = plugin.execute(false, Duration::from_secs(1), handle).await.unwrap();
        assert_eq!(code, 0);
        let ev = queue.recv().await.unwrap();
        assert!(ev.event.is_completion());
    }

    #[tokio::test]
    async fn in_process_timeout_errors() {
        let plugin = PluginKind::InProcess(InProcessPlugin {
            name: "slow".to_string(),
            metadata: PluginMetadata::new("slow"),
            check_available: Arc::new(|| true),
            execute: Arc::new(|_| Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })),
        });
        let mut queue = EventQueue::new(10);
        let handle = queue.handle();
        let result = plugin.execute(false, Duration::from_millis(20), handle).await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
        let ev = queue.recv().await.unwrap();
        assert!(ev.event.is_completion());
    }

    #[tokio::test]
    async fn check_available_reflects_closure() {
        let plugin = in_process("p", false, true);
        assert!(!plugin.check_available().await.unwrap());
    }

    #[tokio::test]
    async fn in_process_run_phase_no_ops_check_and_download() {
        let plugin = in_process("p", true, true);
        let mut queue = EventQueue::new(10);
        let handle = queue.handle();
        let code = plugin.run_phase(Phase::Check, false, Duration::from_secs(1), handle, None).await.unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn phase_subcommand_matches_protocol_defaults() {
        assert_eq!(phase_subcommand(Phase::Check), "check");
        assert_eq!(phase_subcommand(Phase::Download), "download");
        assert_eq!(phase_subcommand(Phase::Execute), "update");
    }
}
