//! OS-process lifecycle for locally spawned model backends.
//!
//! The supervisor owns every child serving process: it launches them in
//! their own process group, classifies readiness by scanning stdout for
//! sentinel markers, and guarantees that stopping a model reaps the whole
//! group, workers included.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Marker a child prints once it is ready to accept requests.
pub const SERVER_STARTED_MSG: &str = "[vgate] server started";
/// Marker a child prints when startup failed.
pub const SERVER_FAILED_MSG: &str = "[vgate] server failed";

/// Diagnostic lines retained from a child's startup output.
const CAPTURED_OUTPUT_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
}

/// Everything needed to build a child serving-process command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchParams {
    pub name: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(rename = "type", default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub device_map_auto: bool,
}

impl LaunchParams {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            model_id: None,
            method: None,
            model_type: None,
            host: None,
            port,
            api_key: None,
            backend: None,
            device_map_auto: false,
        }
    }

    /// Build the serve-command argument list for this launch.
    fn args(&self) -> Vec<String> {
        let mut args = vec![self.name.clone()];
        let options: [(&str, Option<&String>); 5] = [
            ("--model-id", self.model_id.as_ref()),
            ("--method", self.method.as_ref()),
            ("--type", self.model_type.as_ref()),
            ("--host", self.host.as_ref()),
            ("--backend", self.backend.as_ref()),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                if !value.is_empty() {
                    args.push(flag.to_string());
                    args.push(value.clone());
                }
            }
        }
        args.push("--port".to_string());
        args.push(self.port.to_string());
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                args.push("--api-key".to_string());
                args.push(key.clone());
            }
        }
        if self.device_map_auto {
            args.push("--device-map-auto".to_string());
        }
        args
    }
}

/// Read-only snapshot of one tracked process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub state: ProcessState,
    pub params: LaunchParams,
}

/// Startup classification result shared between the readiness task and
/// every caller waiting on the same launch. `Err` carries the final error
/// message, captured output included.
type StartupOutcome = std::result::Result<(), String>;

struct ProcessEntry {
    child: Child,
    params: LaunchParams,
    pid: u32,
    state: ProcessState,
    ready: watch::Receiver<Option<StartupOutcome>>,
}

impl ProcessEntry {
    fn record(&self, name: &str) -> ProcessRecord {
        ProcessRecord {
            name: name.to_string(),
            pid: self.pid,
            port: self.params.port,
            state: self.state,
            params: self.params.clone(),
        }
    }
}

/// Supervisor for locally spawned serving processes.
pub struct ProcessSupervisor {
    program: String,
    spawn_timeout: Duration,
    table: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    /// Per-name spawn gates: concurrent spawns for one name join a single
    /// launch instead of racing. Entries live only while a launch is in
    /// flight or holds waiters.
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessSupervisor {
    pub fn new(spawn_timeout: Duration) -> Self {
        Self::with_program("vgate-serve", spawn_timeout)
    }

    /// Override the serve binary, used when the gateway orchestrates a
    /// non-default entrypoint (and by tests).
    pub fn with_program(program: impl Into<String>, spawn_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            spawn_timeout,
            table: Arc::new(RwLock::new(HashMap::new())),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a serving process for `params.name` and wait until it reports
    /// readiness. Idempotent: an existing Running record is returned
    /// unchanged, and callers arriving while a launch is in flight await
    /// the same classification outcome instead of spawning again. The
    /// readiness scan runs on its own task, so a caller dropped mid-wait
    /// never leaves the entry stuck in Starting.
    pub async fn spawn(&self, params: LaunchParams) -> Result<ProcessRecord> {
        let name = params.name.clone();
        let gate = {
            let mut gates = self.gates.lock().await;
            gates
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let result = {
            let _guard = gate.lock().await;
            self.spawn_gated(&name, params).await
        };
        self.release_gate(&name, &gate).await;
        result
    }

    async fn spawn_gated(&self, name: &str, params: LaunchParams) -> Result<ProcessRecord> {
        let pending = {
            let mut table = self.table.write().await;
            match table.get(name) {
                Some(entry) if entry.state == ProcessState::Running => {
                    debug!("process for {name} already tracked, reusing pid {}", entry.pid);
                    return Ok(entry.record(name));
                }
                Some(entry) if entry.state == ProcessState::Starting => {
                    Some(entry.ready.clone())
                }
                Some(_) => {
                    // Stale Failed/Stopped record: replace it.
                    table.remove(name);
                    None
                }
                None => None,
            }
        };
        if let Some(ready) = pending {
            debug!("joining in-flight launch for {name}");
            return self.await_startup(name, ready).await;
        }

        info!("spawning serving process for {name} on port {}", params.port);
        let mut child = Command::new(&self.program)
            .args(params.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| Error::ModelLoad(format!("failed to launch {name}: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::ModelLoad(format!("{name} exited before startup")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ModelLoad(format!("{name}: stdout not captured")))?;

        let (tx, ready) = watch::channel(None);
        {
            let mut table = self.table.write().await;
            table.insert(
                name.to_string(),
                ProcessEntry {
                    child,
                    params: params.clone(),
                    pid,
                    state: ProcessState::Starting,
                    ready: ready.clone(),
                },
            );
        }

        tokio::spawn(classify_startup(
            self.table.clone(),
            name.to_string(),
            pid,
            stdout,
            self.spawn_timeout,
            tx,
        ));

        self.await_startup(name, ready).await
    }

    /// Block on the shared startup outcome for one launch and translate it
    /// into a record or error.
    async fn await_startup(
        &self,
        name: &str,
        mut ready: watch::Receiver<Option<StartupOutcome>>,
    ) -> Result<ProcessRecord> {
        let outcome = match ready.wait_for(|outcome| outcome.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(())) => {
                let table = self.table.read().await;
                table
                    .get(name)
                    .map(|entry| entry.record(name))
                    .ok_or_else(|| Error::GroupNotFound(format!("model {name} not found")))
            }
            Some(Err(msg)) => Err(Error::ModelLoad(msg)),
            None => Err(Error::ModelLoad(format!(
                "startup classification for {name} ended unexpectedly"
            ))),
        }
    }

    /// Drop a gate entry once its launch concluded and nobody else holds a
    /// clone (one reference in the map, one in the finishing caller).
    async fn release_gate(&self, name: &str, gate: &Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        if gates
            .get(name)
            .is_some_and(|existing| Arc::ptr_eq(existing, gate) && Arc::strong_count(existing) <= 2)
        {
            gates.remove(name);
        }
    }

    /// Stop a tracked process, SIGKILLing its entire process group so
    /// subprocess-spawned workers are reaped as well.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut entry = self
            .table
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::GroupNotFound(format!("model {name} not found")))?;
        entry.state = ProcessState::Stopping;
        debug!("killing process group {} for {name}", entry.pid);
        kill_process_group(entry.pid);
        let _ = entry.child.wait().await;
        self.gates.lock().await.remove(name);
        info!("serving process for {name} stopped");
        Ok(())
    }

    /// Snapshot of every tracked process.
    pub async fn list(&self) -> Vec<ProcessRecord> {
        let table = self.table.read().await;
        table
            .iter()
            .map(|(name, entry)| entry.record(name))
            .collect()
    }

    /// Liveness check without any state transition.
    pub async fn health(&self, name: &str) -> bool {
        let table = self.table.read().await;
        table
            .get(name)
            .map(|entry| process_alive(entry.pid))
            .unwrap_or(false)
    }

    /// Forcibly stop every tracked process. Called on gateway shutdown so
    /// no orphaned children survive the supervisor's own exit.
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let table = self.table.read().await;
            table.keys().cloned().collect()
        };
        for name in names {
            if let Err(err) = self.stop(&name).await {
                debug!("shutdown stop for {name}: {err}");
            }
        }
    }

}

/// Scan a child's stdout for the readiness sentinels, classify the launch
/// and publish the outcome. Runs detached from the caller that requested
/// the spawn, so a dropped request never abandons classification. On
/// success the task keeps draining stdout so the child never blocks on a
/// full pipe.
async fn classify_startup(
    table: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    name: String,
    pid: u32,
    stdout: ChildStdout,
    spawn_timeout: Duration,
    tx: watch::Sender<Option<StartupOutcome>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut captured: Vec<String> = Vec::new();
    let readiness = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("[{name}] {line}");
                    if captured.len() == CAPTURED_OUTPUT_LINES {
                        captured.remove(0);
                    }
                    captured.push(line.clone());
                    if line.contains(SERVER_STARTED_MSG) {
                        return Ok(());
                    }
                    if line.contains(SERVER_FAILED_MSG) {
                        return Err(captured.join("\n"));
                    }
                }
                // Stream end means the child terminated before readiness.
                Ok(None) => return Err(captured.join("\n")),
                Err(e) => return Err(format!("{}\n{e}", captured.join("\n"))),
            }
        }
    };

    let outcome: StartupOutcome = match tokio::time::timeout(spawn_timeout, readiness).await {
        Ok(Ok(())) => {
            {
                let mut table = table.write().await;
                if let Some(entry) = table.get_mut(&name) {
                    entry.state = ProcessState::Running;
                }
            }
            info!("serving process for {name} ready (pid {pid})");
            Ok(())
        }
        Ok(Err(output)) => {
            error!("serving process for {name} failed to start");
            mark_failed(&table, &name).await;
            Err(format!("failed to load model {name}: {output}"))
        }
        Err(_) => {
            error!(
                "serving process for {name} not ready within {}s",
                spawn_timeout.as_secs()
            );
            mark_failed(&table, &name).await;
            Err(format!(
                "model {name} did not become ready within {}s",
                spawn_timeout.as_secs()
            ))
        }
    };

    let started = outcome.is_ok();
    let _ = tx.send(Some(outcome));

    if started {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{name}] {line}");
        }
    }
}

async fn mark_failed(table: &RwLock<HashMap<String, ProcessEntry>>, name: &str) {
    let mut table = table.write().await;
    if let Some(entry) = table.get_mut(name) {
        entry.state = ProcessState::Failed;
        kill_process_group(entry.pid);
        let _ = entry.child.start_kill();
    }
}

/// Children are spawned with `process_group(0)`, so the group id equals the
/// child pid.
fn kill_process_group(pid: u32) {
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "vgate-test-{name}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor_for(body: &str, timeout: Duration) -> ProcessSupervisor {
        let path = script("serve", body);
        ProcessSupervisor::with_program(path.to_string_lossy().to_string(), timeout)
    }

    #[tokio::test]
    async fn spawn_reports_ready_and_is_idempotent() {
        let supervisor = supervisor_for(
            &format!("echo '{SERVER_STARTED_MSG}'\nsleep 30"),
            Duration::from_secs(10),
        );
        let params = LaunchParams::new("m1", 8001);

        let first = supervisor.spawn(params.clone()).await.unwrap();
        assert_eq!(first.state, ProcessState::Running);
        assert_eq!(first.port, 8001);

        let second = supervisor.spawn(params).await.unwrap();
        assert_eq!(second.pid, first.pid);
        assert_eq!(second.port, first.port);
        assert_eq!(supervisor.list().await.len(), 1);

        assert!(supervisor.health("m1").await);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_carries_captured_output() {
        let supervisor = supervisor_for(
            &format!("echo 'weights missing'\necho '{SERVER_FAILED_MSG}'"),
            Duration::from_secs(10),
        );

        let err = supervisor
            .spawn(LaunchParams::new("broken", 8002))
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_LOAD_ERROR");
        assert!(err.to_string().contains("weights missing"));
    }

    #[tokio::test]
    async fn premature_exit_is_a_load_failure() {
        let supervisor = supervisor_for("echo 'booting'\nexit 1", Duration::from_secs(10));

        let err = supervisor
            .spawn(LaunchParams::new("flaky", 8003))
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_LOAD_ERROR");
        assert!(err.to_string().contains("booting"));
    }

    #[tokio::test]
    async fn readiness_wait_is_bounded() {
        let supervisor = supervisor_for("sleep 30", Duration::from_millis(300));

        let err = supervisor
            .spawn(LaunchParams::new("slow", 8004))
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_LOAD_ERROR");
        assert!(err.to_string().contains("did not become ready"));
    }

    #[tokio::test]
    async fn stop_removes_record_and_second_stop_fails() {
        let supervisor = supervisor_for(
            &format!("echo '{SERVER_STARTED_MSG}'\nsleep 30"),
            Duration::from_secs(10),
        );
        supervisor
            .spawn(LaunchParams::new("m2", 8005))
            .await
            .unwrap();

        supervisor.stop("m2").await.unwrap();
        assert!(supervisor.list().await.is_empty());
        assert!(!supervisor.health("m2").await);

        let err = supervisor.stop("m2").await.unwrap_err();
        assert_eq!(err.domain_code(), "GROUP_NOT_FOUND");
    }

    #[tokio::test]
    async fn concurrent_spawns_join_one_launch() {
        let supervisor = Arc::new(supervisor_for(
            &format!("sleep 0.2\necho '{SERVER_STARTED_MSG}'\nsleep 30"),
            Duration::from_secs(10),
        ));
        let params = LaunchParams::new("m3", 8006);

        let a = supervisor.clone();
        let b = supervisor.clone();
        let (ra, rb) = tokio::join!(a.spawn(params.clone()), b.spawn(params));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.pid, rb.pid);
        assert_eq!(supervisor.list().await.len(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_abandon_startup() {
        let supervisor = supervisor_for(
            &format!("sleep 0.3\necho '{SERVER_STARTED_MSG}'\nsleep 30"),
            Duration::from_secs(10),
        );
        let params = LaunchParams::new("m4", 8007);

        // Simulate a client dropping the request mid-launch.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), supervisor.spawn(params.clone())).await;
        assert!(cancelled.is_err());

        // Classification keeps running without the caller.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let records = supervisor.list().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ProcessState::Running);

        let record = supervisor.spawn(params).await.unwrap();
        assert_eq!(record.state, ProcessState::Running);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_gates_do_not_accumulate() {
        let supervisor = supervisor_for(
            &format!("echo '{SERVER_FAILED_MSG}'"),
            Duration::from_secs(10),
        );

        for port in [8008, 8009] {
            let name = format!("dead-{port}");
            supervisor
                .spawn(LaunchParams::new(name, port))
                .await
                .unwrap_err();
        }
        assert!(supervisor.gates.lock().await.is_empty());
    }

    #[test]
    fn launch_params_build_full_command_line() {
        let mut params = LaunchParams::new("m1", 9000);
        params.model_id = Some("org/model".into());
        params.method = Some("config".into());
        params.backend = Some("torch".into());
        params.device_map_auto = true;

        let args = params.args();
        assert_eq!(args[0], "m1");
        assert!(args.windows(2).any(|w| w == ["--model-id", "org/model"]));
        assert!(args.windows(2).any(|w| w == ["--port", "9000"]));
        assert!(args.contains(&"--device-map-auto".to_string()));
        assert!(!args.contains(&"--host".to_string()));
    }
}
