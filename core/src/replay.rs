//! Replay of approved captures against the real host.
//!
//! Subprocess ops run first, in recorded order, each under its own
//! wall-clock budget with capped output. Pending writes materialise
//! afterwards into the writable shadow of their mapping. A failing
//! `required` op (or any write failure) aborts the remainder and leaves
//! the session `failed` with a partial result.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use std::time::Instant;

use drydock_protocol::Capture;
use drydock_protocol::OpDisposition;
use drydock_protocol::OpOutcome;
use drydock_protocol::SessionResult;
use drydock_protocol::SessionState;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::session::CaptureOutput;
use crate::session::Session;
use crate::vfs::MappingTable;

/// Cap on stored stdout/stderr per replayed op.
const MAX_OP_OUTPUT: usize = 1024 * 1024;

/// Synthetic exit code recorded when an op exceeds its budget.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Synthetic exit code recorded when an op cannot be spawned at all.
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How many leading path components of a write destination form the key
/// for the shared-ancestor mutex. Two replays whose writes share an
/// ancestor up to this depth are serialised.
const ANCESTOR_LOCK_DEPTH: usize = 2;

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub op_timeout: Duration,
}

/// Mapping table used on the replay side: reads are irrelevant, writes
/// route into the context's shadow root. `/proc` is not mounted — nothing
/// synthesised is ever replayed.
pub fn replay_table(ctx: &crate::config::AppContext) -> Result<MappingTable> {
    MappingTable::new(vec![(
        "/".to_string(),
        crate::vfs::Mapping::Shadowed {
            host_root: "/".into(),
            shadow_root: ctx.shadow_root.clone(),
        },
    )])
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Drive an `approved` session through `executing` to `executed` (or
/// `failed`). The caller must own the session's lock.
pub async fn execute(
    session: &mut Session,
    table: &MappingTable,
    opts: &ReplayOptions,
) -> Result<SessionState> {
    session.set_state(SessionState::Executing)?;
    let records = session.captures()?;
    let capture_output = session.capture_output()?.unwrap_or(CaptureOutput {
        stdout_bytes: Vec::new(),
        stderr_bytes: Vec::new(),
        exit_code: 0,
    });

    let mut outcomes: Vec<OpOutcome> = Vec::with_capacity(records.len());
    let mut failure: Option<String> = None;

    // Phase 1: subprocesses in recorded index order. Sockets are recorded
    // but never replayed.
    for record in &records {
        match &record.capture {
            Capture::Subprocess {
                argv,
                cwd,
                env_delta,
                stdin,
                required,
                ..
            } => {
                if failure.is_some() {
                    outcomes.push(OpOutcome {
                        index: record.index,
                        disposition: OpDisposition::skipped("replay aborted by earlier failure"),
                    });
                    continue;
                }
                let replayed = run_subprocess(
                    argv,
                    Path::new(cwd),
                    env_delta,
                    stdin.as_deref(),
                    opts.op_timeout,
                )
                .await;
                let exit = match &replayed {
                    OpDisposition::Replayed { exit, .. } => *exit,
                    OpDisposition::Skipped { .. } => SPAWN_FAILURE_EXIT_CODE,
                };
                if exit == TIMEOUT_EXIT_CODE {
                    failure = Some(format!(
                        "op {} timed out after {:?}",
                        record.index, opts.op_timeout
                    ));
                } else if exit != 0 && *required {
                    failure = Some(format!(
                        "required op {} exited with code {exit}",
                        record.index
                    ));
                }
                outcomes.push(OpOutcome {
                    index: record.index,
                    disposition: replayed,
                });
            }
            Capture::Socket { family, .. } => {
                outcomes.push(OpOutcome {
                    index: record.index,
                    disposition: OpDisposition::skipped(format!(
                        "OperationNotSupported: socket (family {family}) is never replayed"
                    )),
                });
            }
            Capture::Write { .. } => {}
        }
    }

    // Phase 2: pending writes, only after every subprocess succeeded.
    let writes: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.capture, Capture::Write { .. }))
        .collect();
    if !writes.is_empty() {
        if failure.is_some() {
            for record in &writes {
                outcomes.push(OpOutcome {
                    index: record.index,
                    disposition: OpDisposition::skipped("replay aborted before pending writes"),
                });
            }
        } else {
            let mut destinations = BTreeSet::new();
            for record in &writes {
                if let Capture::Write { vpath, .. } = &record.capture {
                    if let Ok(dest) = table.shadow_destination(vpath) {
                        destinations.insert(ancestor_key(&dest));
                    }
                }
            }
            let _guards = path_locks().lock_all(destinations).await;

            for record in &writes {
                let Capture::Write {
                    vpath,
                    bytes,
                    mode,
                    ..
                } = &record.capture
                else {
                    continue;
                };
                if failure.is_some() {
                    outcomes.push(OpOutcome {
                        index: record.index,
                        disposition: OpDisposition::skipped("replay aborted by earlier failure"),
                    });
                    continue;
                }
                let started = Instant::now();
                match materialize_write(table, vpath, bytes, *mode).await {
                    Ok(dest) => {
                        info!("materialised pending write {vpath} -> {dest:?}");
                        outcomes.push(OpOutcome {
                            index: record.index,
                            disposition: OpDisposition::Replayed {
                                exit: 0,
                                stdout: Vec::new(),
                                stderr: Vec::new(),
                                elapsed_ms: started.elapsed().as_millis() as u64,
                            },
                        });
                    }
                    Err(e) => {
                        warn!("failed to materialise write {vpath}: {e}");
                        failure = Some(format!("write op {} failed: {e}", record.index));
                        outcomes.push(OpOutcome {
                            index: record.index,
                            disposition: OpDisposition::skipped(format!("{e}")),
                        });
                    }
                }
            }
        }
    }

    outcomes.sort_by_key(|op| op.index);
    let final_state = if failure.is_some() {
        SessionState::Failed
    } else {
        SessionState::Executed
    };
    let result = SessionResult {
        stdout_bytes: capture_output.stdout_bytes,
        stderr_bytes: capture_output.stderr_bytes,
        exit_code: capture_output.exit_code,
        ops: outcomes,
        reason: failure,
    };
    session.write_result(&result)?;
    session.set_state(final_state)?;
    Ok(final_state)
}

/// Run one recorded subprocess with the recorded cwd, merged environment,
/// and stdin bytes, truncating output and enforcing the per-op budget.
pub async fn run_subprocess(
    argv: &[String],
    cwd: &Path,
    env_delta: &std::collections::BTreeMap<String, String>,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> OpDisposition {
    let Some((program, args)) = argv.split_first() else {
        return OpDisposition::skipped("empty argv");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env_delta)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match stdin {
        Some(_) => cmd.stdin(Stdio::piped()),
        None => cmd.stdin(Stdio::null()),
    };

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return OpDisposition::Replayed {
                exit: SPAWN_FAILURE_EXIT_CODE,
                stdout: Vec::new(),
                stderr: format!("spawn failed: {e}\n").into_bytes(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            let _ = pipe.write_all(&bytes).await;
            // Dropping the handle closes the pipe so the child sees EOF.
        });
    }

    let stdout_handle = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_capped(BufReader::new(out), MAX_OP_OUTPUT)));
    let stderr_handle = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_capped(BufReader::new(err), MAX_OP_OUTPUT)));

    let exit = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(e)) => {
            return OpDisposition::Replayed {
                exit: -1,
                stdout: Vec::new(),
                stderr: format!("wait failed: {e}\n").into_bytes(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            TIMEOUT_EXIT_CODE
        }
    };

    let stdout = match stdout_handle {
        Some(handle) => handle.await.ok().and_then(|r| r.ok()).unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match stderr_handle {
        Some(handle) => handle.await.ok().and_then(|r| r.ok()).unwrap_or_default(),
        None => Vec::new(),
    };

    OpDisposition::Replayed {
        exit,
        stdout,
        stderr,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Read a stream to EOF, keeping only the first `max_output` bytes so a
/// chatty command cannot bloat `result.json` or back-pressure the child.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_output: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        if buf.len() < max_output {
            let take = n.min(max_output - buf.len());
            buf.extend_from_slice(&tmp[..take]);
        }
        // Keep draining after the cap so the child never blocks on a full
        // pipe.
    }
    Ok(buf)
}

/// Write one captured payload to its shadow destination. An empty payload
/// truncates the target.
async fn materialize_write(
    table: &MappingTable,
    vpath: &str,
    bytes: &[u8],
    mode: u32,
) -> Result<PathBuf> {
    let dest = table.shadow_destination(vpath)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&dest, bytes).await?;
    apply_mode(&dest, mode).await?;
    Ok(dest)
}

#[cfg(unix)]
async fn apply_mode(dest: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn apply_mode(_dest: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Process-wide registry of shared-ancestor mutexes. Two concurrent
/// replays whose write destinations share an ancestor key take the same
/// mutex; keys are acquired in sorted order so replays cannot deadlock.
struct PathLocks {
    inner: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    async fn lock_all(
        &self,
        keys: BTreeSet<PathBuf>,
    ) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let handles: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            keys.iter()
                .map(|key| Arc::clone(inner.entry(key.clone()).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }
}

fn path_locks() -> &'static PathLocks {
    static LOCKS: OnceLock<PathLocks> = OnceLock::new();
    LOCKS.get_or_init(|| PathLocks {
        inner: std::sync::Mutex::new(HashMap::new()),
    })
}

fn ancestor_key(path: &Path) -> PathBuf {
    let mut key = PathBuf::new();
    for component in path.components().take(ANCESTOR_LOCK_DEPTH + 1) {
        key.push(component);
    }
    key
}
