//! Remote executor: replays an approved session on a named target.
//!
//! The executor is transport-abstract. It deploys a self-copy of the
//! server binary under a version-tagged directory (cache-first, so a
//! second deploy is a no-op), serialises the session across, invokes the
//! same supervisor binary remotely with the session id, and merges the
//! remote result back into the local store. Only targets from the
//! `targets.toml` table are acceptable; there is no free-form
//! `user@host` path through this module.

use std::path::Path;

use drydock_protocol::SessionResult;
use drydock_protocol::SessionState;
use tracing::info;

use crate::config::AppContext;
use crate::config::Target;
use crate::error::DrydockErr;
use crate::error::Result;
use crate::session::Session;

/// Directory on the remote host holding the deployed binary and the
/// serialised sessions, relative to the login home.
const REMOTE_ROOT: &str = ".drydock-remote";

/// What one remote command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOutput {
    pub exit: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The contract a transport must satisfy. Authentication and
/// multiplexing are the transport's business; the executor only needs
/// command execution and file copies in both directions.
pub trait Transport: Send {
    fn exec(
        &mut self,
        argv: &[String],
    ) -> impl std::future::Future<Output = Result<TransportOutput>> + Send;
    fn push(
        &mut self,
        local: &Path,
        remote: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    fn pull(
        &mut self,
        remote: &str,
        local: &Path,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// `ssh`/`scp` against a named target.
pub struct SshTransport {
    target: Target,
}

impl SshTransport {
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<TransportOutput> {
        let output = tokio::process::Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|e| DrydockErr::Transport(format!("{program} failed to start: {e}")))?;
        Ok(TransportOutput {
            exit: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl Transport for SshTransport {
    async fn exec(&mut self, argv: &[String]) -> Result<TransportOutput> {
        let command = shlex::try_join(argv.iter().map(String::as_str))
            .map_err(|e| DrydockErr::Transport(format!("unencodable remote command: {e}")))?;
        self.run(
            "ssh",
            vec![
                "-p".to_string(),
                self.target.port.to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                self.destination(),
                "--".to_string(),
                command,
            ],
        )
        .await
    }

    async fn push(&mut self, local: &Path, remote: &str) -> Result<()> {
        let output = self
            .run(
                "scp",
                vec![
                    "-P".to_string(),
                    self.target.port.to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    local.to_string_lossy().into_owned(),
                    format!("{}:{remote}", self.destination()),
                ],
            )
            .await?;
        if output.exit != 0 {
            return Err(DrydockErr::Transport(format!(
                "scp to {remote} exited {}: {}",
                output.exit,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn pull(&mut self, remote: &str, local: &Path) -> Result<()> {
        let output = self
            .run(
                "scp",
                vec![
                    "-P".to_string(),
                    self.target.port.to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    format!("{}:{remote}", self.destination()),
                    local.to_string_lossy().into_owned(),
                ],
            )
            .await?;
        if output.exit != 0 {
            return Err(DrydockErr::Transport(format!(
                "scp from {remote} exited {}: {}",
                output.exit,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

pub struct RemoteExecutor<T> {
    transport: T,
    version: String,
}

impl<T: Transport> RemoteExecutor<T> {
    pub fn new(transport: T, version: impl Into<String>) -> Self {
        Self {
            transport,
            version: version.into(),
        }
    }

    /// Make sure the version-tagged self-copy exists remotely. Returns
    /// whether anything was actually transferred; a second call is a
    /// cache hit and transfers nothing.
    pub async fn ensure_deployed(&mut self) -> Result<bool> {
        let marker = format!("{REMOTE_ROOT}/.deployed-{}", self.version);
        let probe = self
            .transport
            .exec(&["test".to_string(), "-f".to_string(), marker.clone()])
            .await?;
        if probe.exit == 0 {
            return Ok(false);
        }

        info!("deploying drydock {} to the remote", self.version);
        self.exec_ok(&[
            "mkdir".to_string(),
            "-p".to_string(),
            format!("{REMOTE_ROOT}/bin"),
            format!("{REMOTE_ROOT}/sessions"),
        ])
        .await?;
        let self_exe = std::env::current_exe()?;
        self.transport
            .push(&self_exe, &format!("{REMOTE_ROOT}/bin/drydock-rpc-server"))
            .await?;
        self.exec_ok(&[
            "chmod".to_string(),
            "+x".to_string(),
            format!("{REMOTE_ROOT}/bin/drydock-rpc-server"),
        ])
        .await?;
        self.exec_ok(&["touch".to_string(), marker]).await?;
        Ok(true)
    }

    /// Serialise the approved session across, replay it remotely, and
    /// merge the result back. The local session moves through
    /// `executing` to whatever terminal state the remote reached.
    pub async fn run_session(&mut self, session: &mut Session) -> Result<SessionState> {
        self.ensure_deployed().await?;

        let remote_dir = format!("{REMOTE_ROOT}/sessions/{}", session.id());
        self.exec_ok(&["mkdir".to_string(), "-p".to_string(), remote_dir.clone()])
            .await?;
        // capture_output.json rides along so the remote's result keeps the
        // script's own stdout/stderr.
        for file in [
            "script.py",
            "metadata.json",
            "captures.log",
            "capture_output.json",
        ] {
            let local = session.dir().join(file);
            if local.exists() {
                self.transport
                    .push(&local, &format!("{remote_dir}/{file}"))
                    .await?;
            }
        }
        if session.dir().join("approval.json").exists() {
            self.transport
                .push(
                    &session.dir().join("approval.json"),
                    &format!("{remote_dir}/approval.json"),
                )
                .await?;
        }
        // The remote replayer expects an approved, unowned session.
        self.exec_ok(&[
            "sh".to_string(),
            "-c".to_string(),
            format!("printf approved > {remote_dir}/state"),
        ])
        .await?;

        session.set_state(SessionState::Executing)?;
        let run = self
            .transport
            .exec(&[
                format!("{REMOTE_ROOT}/bin/drydock-rpc-server"),
                "--execute-session".to_string(),
                session.id().to_string(),
                "--session-root".to_string(),
                format!("{REMOTE_ROOT}/sessions"),
            ])
            .await?;
        // Exit 12 is the documented "replay failed" code; the state file
        // still comes back and tells the full story.
        if run.exit != 0 && run.exit != 12 {
            return Err(DrydockErr::Transport(format!(
                "remote supervisor exited {}: {}",
                run.exit,
                String::from_utf8_lossy(&run.stderr)
            )));
        }

        let result_path = session.dir().join("result.json");
        self.transport
            .pull(&format!("{remote_dir}/result.json"), &result_path)
            .await?;
        let result: SessionResult = serde_json::from_slice(&std::fs::read(&result_path)?)?;
        session.write_result(&result)?;

        let state_path = session.dir().join(".remote-state");
        self.transport
            .pull(&format!("{remote_dir}/state"), &state_path)
            .await?;
        let raw_state = std::fs::read_to_string(&state_path)?;
        let _ = std::fs::remove_file(&state_path);
        let final_state: SessionState = raw_state
            .trim()
            .parse()
            .map_err(|_| DrydockErr::Internal(format!("remote returned state {raw_state:?}")))?;
        if !matches!(final_state, SessionState::Executed | SessionState::Failed) {
            return Err(DrydockErr::Internal(format!(
                "remote finished in non-terminal state {final_state}"
            )));
        }
        session.set_state(final_state)?;
        Ok(final_state)
    }

    async fn exec_ok(&mut self, argv: &[String]) -> Result<()> {
        let output = self.transport.exec(argv).await?;
        if output.exit != 0 {
            return Err(DrydockErr::Transport(format!(
                "remote command {argv:?} exited {}: {}",
                output.exit,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Replay an approved session on the named target over SSH.
pub async fn execute_remote(
    ctx: &AppContext,
    session: &mut Session,
    target_name: &str,
) -> Result<SessionState> {
    let target = ctx.target(target_name)?.clone();
    let transport = SshTransport::new(target);
    let mut executor = RemoteExecutor::new(transport, ctx.version);
    executor.run_session(session).await
}
