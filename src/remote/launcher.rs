//! # Process Launchers
//!
//! [`CommandExecutor`] is the production [`RemoteExecutor`]: it spawns a local
//! `tokio::process::Command` that places the benchmark process on the target
//! node through the cluster's launcher.
//!
//! | Launcher | Invocation                                                      |
//! |----------|-----------------------------------------------------------------|
//! | `srun`   | `srun --nodes=1 --ntasks=1 --nodelist=HOST --overlap CMD ARGS`  |
//! | `ssh`    | `ssh -o BatchMode=yes HOST sh -c WATCHDOG net-matrix CMD ARGS`  |
//! | `local`  | `CMD ARGS` on this machine (the host name is ignored)           |
//!
//! Signals are delivered to the local launcher process. `srun` forwards
//! SIGTERM/SIGKILL to the remote task. `ssh` without a pty forwards nothing,
//! so the remote command runs under [`SSH_WATCHDOG`]: it is killed once the
//! session's stdin reaches EOF. The local side keeps a pipe to ssh's stdin
//! open and closes it on termination; a dead ssh client closes it as well.

use super::{
    ExitStatus, OutputLine, OutputStream, ProcessControl, RemoteExecutor, RemoteProcess,
    TerminationSignal,
};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Mechanism used to run a command on a cluster node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Launcher {
    /// Slurm job step inside the current allocation
    #[clap(name = "srun")]
    Srun,
    /// Non-interactive SSH session
    #[clap(name = "ssh")]
    Ssh,
    /// Run on the local machine (testing and single-host setups)
    #[clap(name = "local")]
    Local,
}

impl std::fmt::Display for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Launcher::Srun => write!(f, "srun"),
            Launcher::Ssh => write!(f, "ssh"),
            Launcher::Local => write!(f, "local"),
        }
    }
}

/// Spawns benchmark processes through a [`Launcher`].
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    launcher: Launcher,
    extra_args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            extra_args: Vec::new(),
        }
    }

    /// Additional launcher options, inserted before the target command.
    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// The local program and argument vector that run `command` on `host`.
    pub fn command_line(&self, host: &str, command: &str, args: &[String]) -> (String, Vec<String>) {
        match self.launcher {
            Launcher::Srun => {
                let mut argv = vec![
                    "--nodes=1".to_string(),
                    "--ntasks=1".to_string(),
                    format!("--nodelist={}", host),
                    "--overlap".to_string(),
                    "--kill-on-bad-exit=1".to_string(),
                ];
                argv.extend(self.extra_args.iter().cloned());
                argv.push(command.to_string());
                argv.extend(args.iter().cloned());
                ("srun".to_string(), argv)
            }
            Launcher::Ssh => {
                let mut argv = vec!["-o".to_string(), "BatchMode=yes".to_string()];
                argv.extend(self.extra_args.iter().cloned());
                argv.push(host.to_string());
                // The remote side re-parses the command through a shell.
                let remote = ["sh", "-c", SSH_WATCHDOG, "net-matrix", command]
                    .into_iter()
                    .chain(args.iter().map(String::as_str))
                    .map(shell_quote)
                    .collect::<Vec<_>>()
                    .join(" ");
                argv.push(remote);
                ("ssh".to_string(), argv)
            }
            Launcher::Local => (command.to_string(), args.to_vec()),
        }
    }
}

/// Remote wrapper for ssh sessions, run as `sh -c SSH_WATCHDOG net-matrix CMD ARGS`.
///
/// Asynchronous lists read `/dev/null` in a non-interactive shell, hence the
/// copy of stdin on fd 3. The command's exit status is passed through.
pub const SSH_WATCHDOG: &str = "exec 3<&0; \"$@\" 3<&- & pid=$!; \
{ cat <&3 >/dev/null 2>&1; kill -TERM \"$pid\" 2>/dev/null; } & watcher=$!; \
wait \"$pid\"; status=$?; kill \"$watcher\" 2>/dev/null; exit \"$status\"";

/// Quote `arg` for a POSIX shell when it contains anything beyond a safe set.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                trace!("{:?}: {}", stream, text);
                if tx.send(OutputLine { stream, text }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for CommandExecutor {
    async fn launch(&self, host: &str, command: &str, args: &[String]) -> Result<RemoteProcess> {
        let (program, argv) = self.command_line(host, command, args);
        let stdin = match self.launcher {
            Launcher::Ssh => Stdio::piped(),
            Launcher::Srun | Launcher::Local => Stdio::null(),
        };
        let mut child = Command::new(&program)
            .args(&argv)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::Launch {
                host: host.to_string(),
                command: command.to_string(),
                reason: format!("{} could not be started: {}", program, e),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
        }

        debug!("Spawned {} (pid {:?}) for {}", program, child.id(), host);
        Ok(RemoteProcess {
            control: Box::new(ChildControl { child }),
            output: rx,
        })
    }

    fn name(&self) -> &'static str {
        match self.launcher {
            Launcher::Srun => "srun",
            Launcher::Ssh => "ssh",
            Launcher::Local => "local",
        }
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn signal(&mut self, signal: TerminationSignal) -> std::io::Result<()> {
        // EOF on the session's stdin stops an ssh watchdog.
        drop(self.child.stdin.take());
        // Already reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let sig = match signal {
                TerminationSignal::Terminate => Signal::SIGTERM,
                TerminationSignal::Kill => Signal::SIGKILL,
            };
            match kill(Pid::from_raw(pid as i32), sig) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (pid, signal);
            self.child.start_kill()
        }
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await.map(ExitStatus::from)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?.map(ExitStatus::from))
    }

    fn kill_now(&mut self) {
        let _ = self.child.start_kill();
    }
}
