//! Supervision of the `godo-worker` companion process.
//!
//! Nothing is cached: every call asks the OS (port owner) and the network
//! (health endpoint) afresh.

use crate::error::{GodoError, Result};
use crate::home::GlobalHome;
use crate::process::{BinaryLocator, CommandRunner};
use reqwest::blocking::Client;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const WORKER_BINARY: &str = "godo-worker";
pub const WORKER_HOST: &str = "127.0.0.1";

/// What the health endpoint reported, when it answered 200.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub version: Option<String>,
    pub db_type: Option<String>,
}

impl HealthReport {
    pub fn from_body(body: &str) -> Self {
        let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let field = |key: &str| {
            value.get(key).map(|v| match v {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
        };
        Self {
            version: field("version"),
            db_type: field("db_type"),
        }
    }
}

pub trait HealthProbe {
    /// `Some` only for an HTTP 200 answer.
    fn probe(&self, url: &str) -> Option<HealthReport>;
}

pub struct HttpHealthProbe {
    client: Option<Client>,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|err| warn!(error = %err, "health client unavailable"))
            .ok();
        Self { client }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self, url: &str) -> Option<HealthReport> {
        let client = self.client.as_ref()?;
        let response = match client.get(url).send() {
            Ok(response) => response,
            Err(err) => {
                debug!(%url, error = %err, "health probe failed");
                return None;
            }
        };
        if response.status().as_u16() != 200 {
            debug!(%url, status = response.status().as_u16(), "health probe not ok");
            return None;
        }
        let body = response.text().unwrap_or_default();
        Some(HealthReport::from_body(&body))
    }
}

/// OS process operations the supervisor needs.
pub trait ProcessTable {
    fn owner_of_port(&self, port: u16) -> Option<u32>;
    fn terminate(&self, pid: u32) -> Result<()>;
    fn kill(&self, pid: u32) -> Result<()>;
    fn spawn_detached(&self, binary: &Path) -> Result<u32>;
}

pub struct SystemProcessTable<'a, R: CommandRunner> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> SystemProcessTable<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    fn signal(&self, pid: u32, flag: Option<&str>) -> Result<()> {
        let mut argv = Vec::new();
        if let Some(flag) = flag {
            argv.push(flag.to_string());
        }
        argv.push(pid.to_string());
        let output = self
            .runner
            .run("kill", &argv, true)
            .map_err(|err| GodoError::Process(format!("failed to run kill: {err}")))?;
        if !output.success() {
            return Err(GodoError::Process(format!(
                "kill {} failed: {}",
                pid,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// First PID in `lsof -t` output.
pub fn parse_pid_list(text: &str) -> Option<u32> {
    text.split_whitespace()
        .find_map(|token| token.parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

impl<R: CommandRunner> ProcessTable for SystemProcessTable<'_, R> {
    fn owner_of_port(&self, port: u16) -> Option<u32> {
        // Listening socket only; connected clients share the port too.
        let argv = vec![
            "-ti".to_string(),
            format!("tcp:{port}"),
            "-sTCP:LISTEN".to_string(),
        ];
        match self.runner.run("lsof", &argv, true) {
            Ok(output) => parse_pid_list(&output.stdout_text()),
            Err(err) => {
                debug!(error = %err, "lsof unavailable");
                None
            }
        }
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.signal(pid, None)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.signal(pid, Some("-9"))
    }

    fn spawn_detached(&self, binary: &Path) -> Result<u32> {
        let mut cmd = Command::new(binary);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|err| {
            GodoError::Process(format!(
                "failed to start worker {}: {err}",
                binary.display()
            ))
        })?;
        Ok(child.id())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    pub term_grace: Duration,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_millis(500),
            kill_grace: Duration::from_millis(300),
            poll_interval: Duration::from_millis(200),
            poll_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub address: String,
    pub health: Option<HealthReport>,
}

#[derive(Debug, Clone)]
pub struct StartReport {
    pub pid: u32,
    pub address: String,
    pub binary: PathBuf,
    pub replaced: Option<u32>,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped(u32),
}

pub struct WorkerSupervisor<'a, H: HealthProbe, P: ProcessTable, L: BinaryLocator> {
    probe: &'a H,
    table: &'a P,
    locator: &'a L,
    home: &'a GlobalHome,
    port: u16,
    timings: WorkerTimings,
}

impl<'a, H: HealthProbe, P: ProcessTable, L: BinaryLocator> WorkerSupervisor<'a, H, P, L> {
    pub fn new(probe: &'a H, table: &'a P, locator: &'a L, home: &'a GlobalHome, port: u16) -> Self {
        Self {
            probe,
            table,
            locator,
            home,
            port,
            timings: WorkerTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: WorkerTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn address(&self) -> String {
        format!("http://{WORKER_HOST}:{}", self.port)
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.address())
    }

    pub fn status(&self) -> WorkerStatus {
        let health = self.probe.probe(&self.health_url());
        let running = health.is_some();
        WorkerStatus {
            running,
            pid: if running {
                self.table.owner_of_port(self.port)
            } else {
                None
            },
            address: self.address(),
            health,
        }
    }

    /// `PATH` first, then the global home's `bin/`.
    pub fn locate_binary(&self) -> Result<PathBuf> {
        if let Some(path) = self.locator.locate(WORKER_BINARY) {
            return Ok(path);
        }
        let fallback = self.home.bin_dir().join(WORKER_BINARY);
        if fallback.is_file() {
            return Ok(fallback);
        }
        Err(GodoError::precondition(
            format!("{WORKER_BINARY} not found"),
            "Install with: brew upgrade godo",
        ))
    }

    /// Frees the port: SIGTERM, then SIGKILL if the owner survives the grace period.
    fn release_port(&self) -> Result<Option<u32>> {
        let Some(pid) = self.table.owner_of_port(self.port) else {
            return Ok(None);
        };
        info!(pid, port = self.port, "stopping existing worker");
        self.table.terminate(pid)?;
        thread::sleep(self.timings.term_grace);
        if let Some(survivor) = self.table.owner_of_port(self.port) {
            warn!(pid = survivor, "worker ignored SIGTERM, killing");
            self.table.kill(survivor)?;
            thread::sleep(self.timings.kill_grace);
        }
        Ok(Some(pid))
    }

    pub fn start(&self) -> Result<StartReport> {
        let replaced = self.release_port()?;
        let binary = self.locate_binary()?;
        let pid = self.table.spawn_detached(&binary)?;
        debug!(pid, binary = %binary.display(), "worker spawned");

        let url = self.health_url();
        let mut healthy = false;
        for _ in 0..self.timings.poll_attempts {
            thread::sleep(self.timings.poll_interval);
            if self.probe.probe(&url).is_some() {
                healthy = true;
                break;
            }
        }
        if !healthy {
            warn!(pid, %url, "worker did not report healthy in time");
        }
        Ok(StartReport {
            pid,
            address: self.address(),
            binary,
            replaced,
            healthy,
        })
    }

    pub fn stop(&self) -> Result<StopOutcome> {
        match self.table.owner_of_port(self.port) {
            None => Ok(StopOutcome::NotRunning),
            Some(pid) => {
                self.table.terminate(pid)?;
                Ok(StopOutcome::Stopped(pid))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{MockLocator, MockRunner};
    use std::cell::RefCell;
    use tempfile::tempdir;

    fn instant() -> WorkerTimings {
        WorkerTimings {
            term_grace: Duration::ZERO,
            kill_grace: Duration::ZERO,
            poll_interval: Duration::ZERO,
            poll_attempts: 3,
        }
    }

    #[derive(Default)]
    struct WorldState {
        owner: Option<u32>,
        next_pid: u32,
        spawned: Vec<u32>,
        terminated: Vec<u32>,
        killed: Vec<u32>,
        ignores_term: bool,
        never_healthy: bool,
    }

    /// One fake OS: a single port owner, answered for by the fake health endpoint.
    #[derive(Default)]
    struct FakeWorld {
        state: RefCell<WorldState>,
    }

    impl FakeWorld {
        fn with_owner(pid: u32) -> Self {
            let world = Self::default();
            world.state.borrow_mut().owner = Some(pid);
            world
        }
    }

    impl HealthProbe for FakeWorld {
        fn probe(&self, url: &str) -> Option<HealthReport> {
            assert!(url.ends_with("/health"));
            let state = self.state.borrow();
            if state.owner.is_some() && !state.never_healthy {
                Some(HealthReport::from_body(
                    r#"{"status":"ok","version":"0.4.1","db_type":"sqlite"}"#,
                ))
            } else {
                None
            }
        }
    }

    impl ProcessTable for FakeWorld {
        fn owner_of_port(&self, _port: u16) -> Option<u32> {
            self.state.borrow().owner
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.terminated.push(pid);
            if !state.ignores_term && state.owner == Some(pid) {
                state.owner = None;
            }
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.killed.push(pid);
            if state.owner == Some(pid) {
                state.owner = None;
            }
            Ok(())
        }

        fn spawn_detached(&self, _binary: &Path) -> Result<u32> {
            let mut state = self.state.borrow_mut();
            state.next_pid += 1;
            let pid = 1000 + state.next_pid;
            state.spawned.push(pid);
            state.owner = Some(pid);
            Ok(pid)
        }
    }

    #[test]
    fn starting_twice_leaves_one_owner() {
        let dir = tempdir().unwrap();
        let home = GlobalHome::new(dir.path().to_path_buf());
        let world = FakeWorld::default();
        let locator = MockLocator::with(WORKER_BINARY, "/usr/local/bin/godo-worker");
        let supervisor =
            WorkerSupervisor::new(&world, &world, &locator, &home, 3778).with_timings(instant());

        let first = supervisor.start().unwrap();
        assert!(first.healthy);
        assert_eq!(first.replaced, None);
        assert_eq!(first.address, "http://127.0.0.1:3778");

        let second = supervisor.start().unwrap();
        assert_eq!(second.replaced, Some(first.pid));

        let state = world.state.borrow();
        assert_eq!(state.owner, Some(second.pid));
        assert_eq!(state.terminated, vec![first.pid]);
        drop(state);

        let status = supervisor.status();
        assert!(status.running);
        assert_eq!(status.pid, Some(second.pid));
        let health = status.health.unwrap();
        assert_eq!(health.version.as_deref(), Some("0.4.1"));
        assert_eq!(health.db_type.as_deref(), Some("sqlite"));
    }

    #[test]
    fn stubborn_owner_is_killed() {
        let dir = tempdir().unwrap();
        let home = GlobalHome::new(dir.path().to_path_buf());
        let world = FakeWorld::with_owner(77);
        world.state.borrow_mut().ignores_term = true;
        let locator = MockLocator::with(WORKER_BINARY, "/opt/godo-worker");
        let supervisor =
            WorkerSupervisor::new(&world, &world, &locator, &home, 3778).with_timings(instant());

        let report = supervisor.start().unwrap();
        assert_eq!(report.replaced, Some(77));
        let state = world.state.borrow();
        assert_eq!(state.terminated, vec![77]);
        assert_eq!(state.killed, vec![77]);
        assert_eq!(state.spawned.len(), 1);
    }

    #[test]
    fn missing_binary_is_a_precondition_error() {
        let dir = tempdir().unwrap();
        let home = GlobalHome::new(dir.path().to_path_buf());
        let world = FakeWorld::default();
        let locator = MockLocator::default();
        let supervisor =
            WorkerSupervisor::new(&world, &world, &locator, &home, 3778).with_timings(instant());

        let err = supervisor.start().unwrap_err();
        assert!(err.to_string().contains("Install with: brew upgrade godo"));
        assert!(world.state.borrow().spawned.is_empty());
    }

    #[test]
    fn falls_back_to_global_bin_dir() {
        let dir = tempdir().unwrap();
        let home = GlobalHome::new(dir.path().to_path_buf());
        std::fs::create_dir_all(home.bin_dir()).unwrap();
        let installed = home.bin_dir().join(WORKER_BINARY);
        std::fs::write(&installed, b"").unwrap();
        let world = FakeWorld::default();
        let locator = MockLocator::default();
        let supervisor = WorkerSupervisor::new(&world, &world, &locator, &home, 3778);

        assert_eq!(supervisor.locate_binary().unwrap(), installed);
    }

    #[test]
    fn unhealthy_start_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let home = GlobalHome::new(dir.path().to_path_buf());
        let world = FakeWorld::default();
        world.state.borrow_mut().never_healthy = true;
        let locator = MockLocator::with(WORKER_BINARY, "/opt/godo-worker");
        let supervisor =
            WorkerSupervisor::new(&world, &world, &locator, &home, 3778).with_timings(instant());

        let report = supervisor.start().unwrap();
        assert!(!report.healthy);
        assert_eq!(world.state.borrow().owner, Some(report.pid));
    }

    #[test]
    fn stop_reports_not_running_or_pid() {
        let dir = tempdir().unwrap();
        let home = GlobalHome::new(dir.path().to_path_buf());
        let locator = MockLocator::default();

        let idle = FakeWorld::default();
        let supervisor = WorkerSupervisor::new(&idle, &idle, &locator, &home, 3778);
        assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);
        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.pid, None);

        let busy = FakeWorld::with_owner(4242);
        let supervisor = WorkerSupervisor::new(&busy, &busy, &locator, &home, 3778);
        assert_eq!(supervisor.stop().unwrap(), StopOutcome::Stopped(4242));
    }

    #[test]
    fn system_table_uses_lsof_and_kill() {
        let runner = MockRunner::default();
        runner.push_output("lsof", 0, "5150\n5151\n");
        runner.push_output("kill", 0, "");
        runner.push_output("kill", 1, "");
        let table = SystemProcessTable::new(&runner);

        assert_eq!(table.owner_of_port(3778), Some(5150));
        table.terminate(5150).unwrap();
        assert!(table.kill(5150).is_err());

        let calls = runner.calls();
        assert_eq!(calls[0].program, "lsof");
        assert_eq!(calls[0].args, vec!["-ti", "tcp:3778", "-sTCP:LISTEN"]);
        assert_eq!(calls[1].args, vec!["5150"]);
        assert_eq!(calls[2].args, vec!["-9", "5150"]);
    }

    #[test]
    fn health_body_fields_are_optional() {
        assert_eq!(HealthReport::from_body("ok"), HealthReport::default());
        let report = HealthReport::from_body(r#"{"version":"1.2.0"}"#);
        assert_eq!(report.version.as_deref(), Some("1.2.0"));
        assert_eq!(report.db_type, None);
        let report = HealthReport::from_body(r#"{"version":3,"db_type":{"kind":"pg"}}"#);
        assert_eq!(report.version.as_deref(), Some("3"));
        assert_eq!(report.db_type.as_deref(), Some(r#"{"kind":"pg"}"#));
        assert_eq!(parse_pid_list(""), None);
    }
}
