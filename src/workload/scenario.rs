//! Fault-injection actions run by the single scenario worker.

use super::actions::{common_ignored_errors, Action, ActionKind};
use crate::client::Executor;
use crate::error::{ControlError, QueryError};
use crate::runner::deadline::Deadline;
use crate::runner::worker::WorkerStats;
use crate::settings::Scenario;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Drives the service under test from outside.
pub trait ProcessController: Send + Sync {
    fn kill(&self, service: &str) -> Result<(), ControlError>;

    fn start(&self, service: &str) -> Result<(), ControlError>;

    fn backup(&self) -> Result<(), ControlError>;

    fn restore(&self) -> Result<(), ControlError>;
}

/// `docker compose` for kill/start, shell commands for backup/restore.
#[derive(Debug, Clone, Default)]
pub struct ComposeController {
    compose_file: Option<PathBuf>,
    backup_command: Option<String>,
    restore_command: Option<String>,
}

impl ComposeController {
    pub fn new(compose_file: Option<PathBuf>) -> Self {
        Self {
            compose_file,
            ..Self::default()
        }
    }

    pub fn with_backup_command(mut self, command: impl Into<String>) -> Self {
        self.backup_command = Some(command.into());
        self
    }

    pub fn with_restore_command(mut self, command: impl Into<String>) -> Self {
        self.restore_command = Some(command.into());
        self
    }

    fn compose(&self, args: &[&str]) -> Result<(), ControlError> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose");
        if let Some(file) = &self.compose_file {
            cmd.arg("-f").arg(file);
        }
        cmd.args(args);
        run_command(cmd, format!("docker compose {}", args.join(" ")))
    }

    fn shell(&self, what: &str, command: Option<&str>) -> Result<(), ControlError> {
        let Some(command) = command else {
            return Err(ControlError {
                command: what.to_string(),
                message: "no command configured".to_string(),
            });
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_command(cmd, command.to_string())
    }
}

fn run_command(mut cmd: Command, description: String) -> Result<(), ControlError> {
    debug!(command = %description, "running");
    let output = cmd.output().map_err(|e| ControlError {
        command: description.clone(),
        message: e.to_string(),
    })?;
    if output.status.success() {
        return Ok(());
    }
    Err(ControlError {
        command: description,
        message: format!(
            "exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

impl ProcessController for ComposeController {
    fn kill(&self, service: &str) -> Result<(), ControlError> {
        self.compose(&["kill", service])
    }

    fn start(&self, service: &str) -> Result<(), ControlError> {
        self.compose(&["up", "-d", service])
    }

    fn backup(&self) -> Result<(), ControlError> {
        self.shell("backup", self.backup_command.as_deref())
    }

    fn restore(&self) -> Result<(), ControlError> {
        self.shell("restore", self.restore_command.as_deref())
    }
}

/// Cancels the in-flight statement of a random live peer.
pub struct CancelAction {
    rng: StdRng,
    peers: Vec<Arc<WorkerStats>>,
    deadline: Deadline,
}

impl CancelAction {
    pub fn new(rng: StdRng, peers: Vec<Arc<WorkerStats>>, deadline: Deadline) -> Self {
        Self {
            rng,
            peers,
            deadline,
        }
    }
}

impl Action for CancelAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Cancel
    }

    fn run(&mut self, exe: &mut dyn Executor) -> Result<bool, QueryError> {
        let candidates: Vec<i64> = self
            .peers
            .iter()
            .filter(|peer| peer.is_running())
            .filter_map(|peer| peer.connection_id())
            .collect();
        let Some(&pid) = candidates.choose(&mut self.rng) else {
            self.deadline.sleep(Duration::from_millis(100));
            return Ok(false);
        };

        exe.execute(&format!("SELECT pg_cancel_backend({pid})"))?;
        let pause = Duration::from_millis(self.rng.gen_range(0..=3_000));
        self.deadline.sleep(pause);
        Ok(true)
    }

    fn errors_to_ignore(&self, _scenario: Scenario) -> Vec<&'static str> {
        common_ignored_errors(Scenario::Cancel)
    }
}

/// Kills the service and brings it back up.
pub struct KillAction {
    rng: StdRng,
    controller: Arc<dyn ProcessController>,
    service: String,
    deadline: Deadline,
}

impl KillAction {
    pub fn new(
        rng: StdRng,
        controller: Arc<dyn ProcessController>,
        service: impl Into<String>,
        deadline: Deadline,
    ) -> Self {
        Self {
            rng,
            controller,
            service: service.into(),
            deadline,
        }
    }
}

impl Action for KillAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Kill
    }

    fn run(&mut self, _exe: &mut dyn Executor) -> Result<bool, QueryError> {
        let pause = Duration::from_secs(self.rng.gen_range(1..=20));
        self.deadline.sleep(pause);
        if self.deadline.expired() {
            return Ok(false);
        }
        info!(service = %self.service, "killing service");
        self.controller.kill(&self.service)?;
        self.controller.start(&self.service)?;
        Ok(true)
    }

    fn errors_to_ignore(&self, _scenario: Scenario) -> Vec<&'static str> {
        common_ignored_errors(Scenario::Kill)
    }
}

/// Takes a full backup and immediately restores it.
pub struct BackupRestoreAction {
    rng: StdRng,
    controller: Arc<dyn ProcessController>,
    deadline: Deadline,
}

impl BackupRestoreAction {
    pub fn new(rng: StdRng, controller: Arc<dyn ProcessController>, deadline: Deadline) -> Self {
        Self {
            rng,
            controller,
            deadline,
        }
    }
}

impl Action for BackupRestoreAction {
    fn kind(&self) -> ActionKind {
        ActionKind::BackupRestore
    }

    fn run(&mut self, _exe: &mut dyn Executor) -> Result<bool, QueryError> {
        info!("backup and restore");
        self.controller.backup()?;
        self.controller.restore()?;
        let pause = Duration::from_secs(self.rng.gen_range(5..=15));
        self.deadline.sleep(pause);
        Ok(true)
    }

    fn errors_to_ignore(&self, _scenario: Scenario) -> Vec<&'static str> {
        common_ignored_errors(Scenario::BackupRestore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::SeedableRng;

    #[derive(Default)]
    struct Recorder {
        statements: Vec<String>,
    }

    impl Executor for Recorder {
        fn execute(&mut self, sql: &str) -> Result<(), QueryError> {
            self.statements.push(sql.to_string());
            Ok(())
        }
        fn commit(&mut self) -> Result<bool, QueryError> {
            Ok(false)
        }
        fn rollback(&mut self) -> Result<bool, QueryError> {
            Ok(false)
        }
        fn set_autocommit(&mut self, _: bool) {}
        fn autocommit(&self) -> bool {
            true
        }
        fn connection_id(&self) -> Option<i64> {
            None
        }
    }

    #[derive(Default)]
    struct Controller {
        calls: Mutex<Vec<String>>,
    }

    impl ProcessController for Controller {
        fn kill(&self, service: &str) -> Result<(), ControlError> {
            self.calls.lock().push(format!("kill {service}"));
            Ok(())
        }
        fn start(&self, service: &str) -> Result<(), ControlError> {
            self.calls.lock().push(format!("start {service}"));
            Ok(())
        }
        fn backup(&self) -> Result<(), ControlError> {
            self.calls.lock().push("backup".to_string());
            Ok(())
        }
        fn restore(&self) -> Result<(), ControlError> {
            self.calls.lock().push("restore".to_string());
            Ok(())
        }
    }

    fn stopped_deadline() -> Deadline {
        let deadline = Deadline::after(Duration::from_secs(60));
        deadline.force_now();
        deadline
    }

    #[test]
    fn cancel_targets_only_live_peers() {
        let live = Arc::new(WorkerStats::new());
        live.set_running(true);
        live.publish_connection_id(Some(42));
        let stopped = Arc::new(WorkerStats::new());
        stopped.publish_connection_id(Some(7));
        let unknown = Arc::new(WorkerStats::new());
        unknown.set_running(true);

        let mut action = CancelAction::new(
            StdRng::seed_from_u64(1),
            vec![stopped, live, unknown],
            stopped_deadline(),
        );
        let mut exe = Recorder::default();
        for _ in 0..10 {
            assert!(action.run(&mut exe).unwrap());
        }
        assert!(exe
            .statements
            .iter()
            .all(|s| s == "SELECT pg_cancel_backend(42)"));
    }

    #[test]
    fn cancel_without_candidates_does_nothing() {
        let idle = Arc::new(WorkerStats::new());
        let mut action =
            CancelAction::new(StdRng::seed_from_u64(2), vec![idle], stopped_deadline());
        let mut exe = Recorder::default();
        assert!(!action.run(&mut exe).unwrap());
        assert!(exe.statements.is_empty());
    }

    #[test]
    fn kill_skips_once_deadline_passed() {
        let controller = Arc::new(Controller::default());
        let mut action = KillAction::new(
            StdRng::seed_from_u64(3),
            controller.clone(),
            "materialized",
            stopped_deadline(),
        );
        assert!(!action.run(&mut Recorder::default()).unwrap());
        assert!(controller.calls.lock().is_empty());
    }

    #[test]
    fn backup_then_restore() {
        let controller = Arc::new(Controller::default());
        let mut action =
            BackupRestoreAction::new(StdRng::seed_from_u64(4), controller.clone(), stopped_deadline());
        assert!(action.run(&mut Recorder::default()).unwrap());
        assert_eq!(*controller.calls.lock(), vec!["backup", "restore"]);
    }

    #[test]
    fn shell_commands_report_failures() {
        let controller = ComposeController::new(None)
            .with_backup_command("true")
            .with_restore_command("echo nope >&2; exit 3");
        assert!(controller.backup().is_ok());
        let err = controller.restore().unwrap_err();
        assert!(err.message.contains("nope"), "{err}");

        let err = ComposeController::new(None).backup().unwrap_err();
        assert_eq!(err.command, "backup");
    }

    #[test]
    fn scenario_actions_accept_connection_loss() {
        let controller: Arc<dyn ProcessController> = Arc::new(Controller::default());
        let kill = KillAction::new(StdRng::seed_from_u64(5), controller, "svc", stopped_deadline());
        assert!(kill
            .errors_to_ignore(Scenario::Kill)
            .contains(&"Connection refused"));
    }
}
