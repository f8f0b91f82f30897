use std::{ffi::OsString, io, path::Path, process::Stdio};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::process::{Child, Command};

use crate::engine::language::CommandSpec;

/// Which pipes a stage needs besides stderr, which is always captured.
#[derive(Debug, Clone, Copy)]
pub struct StageIo {
    pub stdin: bool,
    pub stdout: bool,
}

impl StageIo {
    pub const COMPILE: Self = Self {
        stdin: false,
        stdout: false,
    };
    pub const RUN: Self = Self {
        stdin: true,
        stdout: true,
    };
}

/// Spawns and signals pipeline processes. This is the seam where an isolating backend
/// (container, jail, VM) plugs in.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(
        &self,
        command: &CommandSpec,
        work_dir: &Path,
        pipes: StageIo,
    ) -> io::Result<Child>;

    /// Sends the graceful termination signal to the process tree rooted at `pid`.
    /// A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Unconditionally kills the process tree rooted at `pid`.
    fn force_kill(&self, pid: u32) -> io::Result<()>;
}

/// Runs commands directly on the host, each in its own process group.
#[derive(Debug, Default)]
pub struct HostLauncher;

impl HostLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for HostLauncher {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn launch(
        &self,
        command: &CommandSpec,
        work_dir: &Path,
        pipes: StageIo,
    ) -> io::Result<Child> {
        let (program, args) = command.argv();
        // Relative executables like `./code` live in the workspace, not our cwd.
        let program: OsString = if program.starts_with("./") {
            work_dir.join(&program[2..]).into_os_string()
        } else {
            program.into()
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(if pipes.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if pipes.stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd.spawn()
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }
}

/// Children are spawned as group leaders, so the pid doubles as the process group id.
fn signal_group(pid: u32, sig: Signal) -> io::Result<()> {
    let pgid = i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match signal::killpg(pgid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::{HostLauncher, ProcessLauncher, StageIo};
    use crate::engine::language::CommandSpec;

    #[tokio::test]
    async fn runs_relative_program_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("prog.sh");
        std::fs::write(&script, "#!/bin/sh\necho from-workspace\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let launcher = HostLauncher::new();
        let mut child = launcher
            .launch(&CommandSpec::exec("./prog.sh", &[]), dir.path(), StageIo::RUN)
            .await
            .unwrap();
        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "from-workspace\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn terminate_signals_process_group_and_tolerates_exited_processes() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = HostLauncher::new();
        let mut child = launcher
            .launch(&CommandSpec::shell("sleep 30"), dir.path(), StageIo::RUN)
            .await
            .unwrap();
        let pid = child.id().unwrap();

        launcher.terminate(pid).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), None);

        launcher.terminate(pid).unwrap();
    }

    #[tokio::test]
    async fn force_kill_reaches_children_that_ignore_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = HostLauncher::new();
        let mut child = launcher
            .launch(
                &CommandSpec::shell("trap '' TERM; sleep 30 & wait"),
                dir.path(),
                StageIo::RUN,
            )
            .await
            .unwrap();
        let pid = child.id().unwrap();
        let mut stdout = child.stdout.take().unwrap();

        launcher.terminate(pid).unwrap();
        let mut out = Vec::new();
        // The background sleep holds the pipe open for as long as it lives.
        let still_open =
            tokio::time::timeout(Duration::from_millis(300), stdout.read_to_end(&mut out)).await;
        assert!(still_open.is_err());

        launcher.force_kill(pid).unwrap();
        tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(std::os::unix::process::ExitStatusExt::signal(&status), Some(9));
    }

    #[tokio::test]
    async fn missing_executable_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostLauncher::new()
            .launch(
                &CommandSpec::exec("coderun-no-such-binary", &[]),
                dir.path(),
                StageIo::COMPILE,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
