use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};

use crate::logs::{new_shared_log_write_state, spawn_log_pipe_task};

/// How to launch the kernel.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub binary: PathBuf,
    /// Passed as `-d`; provider paths in the config resolve against it.
    pub work_dir: PathBuf,
    pub config_file: PathBuf,
    pub log_path: PathBuf,
}

/// A running kernel process owned by this instance.
pub struct SpawnedKernel {
    pub pid: u32,
    /// stdout and stderr lines, in arrival order.
    pub lines: mpsc::UnboundedReceiver<String>,
    /// Fires once the process has exited, with its exit code when it had one.
    pub exited: oneshot::Receiver<Option<i32>>,
}

pub trait Supervisor: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedKernel, String>;
    /// Asks the process to terminate. Returns once the signal is delivered,
    /// not when the process is gone.
    fn kill(&self, pid: u32) -> Result<(), String>;
    /// SIGKILL, for a process that ignored `kill`.
    fn force_kill(&self, pid: u32) -> Result<(), String>;
    /// Name of the live process with this pid, `None` when there is none.
    fn process_name(&self, pid: u32) -> Option<String>;
}

/// Spawns the kernel with tokio and pipes its output into the kernel log.
pub struct TokioSupervisor;

impl Supervisor for TokioSupervisor {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedKernel, String> {
        tracing::info!(
            "starting kernel: binary={} work_dir={} config={}",
            request.binary.display(),
            request.work_dir.display(),
            request.config_file.display()
        );

        let mut child = TokioCommand::new(&request.binary)
            .arg("-d")
            .arg(request.work_dir.as_os_str())
            .arg("-f")
            .arg(request.config_file.as_os_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| format!("failed to spawn {}: {err}", request.binary.display()))?;

        let pid = child
            .id()
            .ok_or_else(|| "kernel exited before its pid could be read".to_string())?;

        let (lines_tx, lines) = mpsc::unbounded_channel();
        let log_state = new_shared_log_write_state();
        let mut pipes = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pipes.push(spawn_log_pipe_task(
                stdout,
                request.log_path.clone(),
                log_state.clone(),
                "kernel",
                "stdout",
                Some(lines_tx.clone()),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pipes.push(spawn_log_pipe_task(
                stderr,
                request.log_path.clone(),
                log_state,
                "kernel",
                "stderr",
                Some(lines_tx),
            ));
        }

        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!("failed to wait for kernel process {pid}: {err}");
                    None
                }
            };
            // 先把管道里剩余的输出写完，再报告退出
            for pipe in pipes {
                let _ = pipe.await;
            }
            tracing::info!("kernel process {pid} exited with code {code:?}");
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedKernel { pid, lines, exited })
    }

    fn kill(&self, pid: u32) -> Result<(), String> {
        tracing::info!("stopping kernel with pid {pid}");
        send_signal(pid, "-TERM")
    }

    fn force_kill(&self, pid: u32) -> Result<(), String> {
        tracing::warn!("killing kernel with pid {pid}");
        send_signal(pid, "-KILL")
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string(format!("/proc/{pid}/comm"))
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            None
        }
    }
}

#[cfg(target_family = "unix")]
fn send_signal(pid: u32, signal: &str) -> Result<(), String> {
    use std::process::Command;

    match Command::new("kill").arg(signal).arg(pid.to_string()).status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("kill {signal} exited with status {status}")),
        Err(err) => Err(format!("failed to execute kill: {err}")),
    }
}

#[cfg(not(target_family = "unix"))]
fn send_signal(_pid: u32, _signal: &str) -> Result<(), String> {
    Err("stopping the kernel is only supported on unix targets".to_string())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_output_reaches_log_and_channel() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-kernel.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"RESTful API listening at: $2\"\necho oops >&2\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let request = SpawnRequest {
            binary: script,
            work_dir: dir.path().to_path_buf(),
            config_file: dir.path().join("config.yaml"),
            log_path: dir.path().join("kernel.log"),
        };

        let mut kernel = TokioSupervisor.spawn(&request).unwrap();
        assert!(kernel.pid > 0);
        assert_eq!(kernel.exited.await.unwrap(), Some(0));

        let mut lines = Vec::new();
        while let Ok(line) = kernel.lines.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.starts_with("RESTful API listening at")));
        assert!(lines.contains(&"oops".to_string()));

        let log = std::fs::read_to_string(dir.path().join("kernel.log")).unwrap();
        assert!(log.contains("oops"));
    }

    #[test]
    fn own_process_has_a_name() {
        let pid = std::process::id();
        assert!(TokioSupervisor.process_name(pid).is_some());
        assert!(TokioSupervisor.process_name(u32::MAX).is_none());
    }
}
