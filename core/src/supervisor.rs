//! Sandbox supervisor: owns the restricted interpreter child and its
//! framed channel, dispatches intercepted calls to the handler set,
//! streams stdout/stderr under a cap, enforces the wall-clock budget, and
//! finalises the session on every exit path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use drydock_protocol::Capture;
use drydock_protocol::CaptureRecord;
use drydock_protocol::OpDisposition;
use drydock_protocol::OpOutcome;
use drydock_protocol::SessionResult;
use drydock_protocol::SessionState;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tracing::info;
use tracing::warn;

use crate::channel::FrameReader;
use crate::channel::FrameWriter;
use crate::channel::InboundFrame;
use crate::channel::ReplyFrame;
use crate::config::AppContext;
use crate::error::DrydockErr;
use crate::error::Result;
use crate::handlers::Handlers;
use crate::profile::Classification;
use crate::profile::Profile;
use crate::session::CaptureOutput;
use crate::session::NewSession;
use crate::session::Session;
use crate::session::Store;
use crate::vfs::Mapping;
use crate::vfs::MappingTable;
use crate::vfs::ProcTree;
use crate::vfs::Vfs;

/// Cap on captured child stdout/stderr, per stream.
const STREAM_CAP: usize = 10 * 1024 * 1024;

/// Marker appended when a stream blows through its cap.
const TRUNCATION_MARKER: &[u8] = b"\n[drydock: output truncated]\n";

/// Grace between SIGTERM and SIGKILL when tearing the child down.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// One script submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub script: Vec<u8>,
    pub name: Option<String>,
    pub profile: Option<String>,
    pub target: Option<String>,
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOutcome {
    pub session_id: String,
    pub state: SessionState,
}

/// How the capture phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CaptureEnd {
    /// Child closed its side of the channel at a frame boundary.
    CleanEof,
    Timeout,
    Cancelled,
    /// Framing violation or a torn frame.
    ChannelError(String),
}

/// What to do with a cleanly-exited session, given its captures and the
/// active profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FastPathDecision {
    /// Every capture is an auto-approved subprocess: replay immediately.
    Approve,
    /// At least one capture matched `always_deny`.
    Deny { reason: String },
    /// Anything else waits for review.
    Park,
}

/// Run one submission end to end: create the session, drive the child
/// through the capture phase, and finalise. Returns once the session has
/// settled into `approved`+replayed, `pending_review`, `denied`, or
/// `failed`.
pub async fn submit_script(
    ctx: &AppContext,
    store: &Store,
    request: SubmitRequest,
    interrupt: Arc<Notify>,
) -> Result<SupervisorOutcome> {
    if request.script.is_empty() {
        return Err(DrydockErr::InvalidInput("script is empty".to_string()));
    }
    if std::str::from_utf8(&request.script).is_err() {
        return Err(DrydockErr::InvalidInput("script is not UTF-8".to_string()));
    }
    let profile_name = request
        .profile
        .clone()
        .unwrap_or_else(|| ctx.default_profile.clone());
    let profile = Profile::load(ctx, &profile_name)?;
    if let Some(target) = &request.target {
        ctx.target(target)?;
    }

    let session = store.create(
        &request.script,
        NewSession {
            name: request.name.clone(),
            profile: profile_name,
            target: request.target.clone(),
            analysis: request.analysis.clone(),
        },
    )?;
    let session_id = session.id().to_string();
    info!("session {session_id} created, spawning sandboxed child");

    run_capture_phase(ctx, session, &profile, interrupt)
        .await
        .map(|state| SupervisorOutcome { session_id, state })
}

#[cfg(unix)]
async fn run_capture_phase(
    ctx: &AppContext,
    session: Session,
    profile: &Profile,
    interrupt: Arc<Notify>,
) -> Result<SessionState> {
    let session = Arc::new(AsyncMutex::new(session));

    let spawned = match spawn_child(ctx, &session).await {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!("failed to spawn the sandboxed interpreter: {e}");
            let session = session.lock().await;
            return finalize_failed(
                &session,
                CaptureOutput {
                    stdout_bytes: Vec::new(),
                    stderr_bytes: format!("{e}\n").into_bytes(),
                    exit_code: -1,
                },
                format!("spawn failed: {e}"),
            );
        }
    };
    let SpawnedChild {
        mut child,
        req_pipe,
        rep_pipe,
        child_env,
    } = spawned;

    // The VFS needs the child's identity for the /proc subtree.
    let pid = child.id().unwrap_or_default();
    let script_vpath = "/sandbox/script.py".to_string();
    let proc_tree = ProcTree::new(
        pid,
        vec![
            ctx.interpreter_path().to_string_lossy().into_owned(),
            script_vpath,
        ],
        child_env,
        ctx.interpreter_path().to_string_lossy().into_owned(),
    );
    let table = default_mapping_table(ctx, proc_tree)?;
    let vfs = Arc::new(StdMutex::new(Vfs::new(table)));
    let handlers = Arc::new(Handlers::new(vfs, Arc::clone(&session)));

    // Stdout/stderr drain concurrently with frame dispatch so a chatty
    // script cannot deadlock against a full pipe.
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(drain_stream(out, STREAM_CAP)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(drain_stream(err, STREAM_CAP)));

    let reader = FrameReader::new(req_pipe);
    let writer = FrameWriter::new(rep_pipe);
    let deadline = tokio::time::Instant::now() + ctx.capture_timeout;
    let end = pump_frames(reader, writer, handlers, deadline, interrupt).await;

    // On unclean ends the child is torn down: the write half is already
    // closed by the pump, then SIGTERM, a short grace, then SIGKILL.
    let exit_code = match end {
        CaptureEnd::CleanEof => wait_with_grace(&mut child, Duration::from_secs(5)).await,
        _ => {
            send_sigterm(&child);
            wait_with_grace(&mut child, TERM_GRACE).await
        }
    };

    let stdout_bytes = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr_bytes = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let capture_output = CaptureOutput {
        stdout_bytes,
        stderr_bytes,
        exit_code,
    };

    let mut session = session.lock().await;
    session.write_capture_output(&capture_output)?;

    match end {
        CaptureEnd::CleanEof if exit_code == 0 => {
            settle_clean_exit(ctx, &mut session, profile, capture_output).await
        }
        CaptureEnd::CleanEof => finalize_failed(
            &session,
            capture_output,
            format!("child exited with code {exit_code}"),
        ),
        CaptureEnd::Timeout => finalize_failed(&session, capture_output, "timeout".to_string()),
        CaptureEnd::Cancelled => {
            finalize_failed(&session, capture_output, "cancelled".to_string())
        }
        CaptureEnd::ChannelError(e) => {
            finalize_failed(&session, capture_output, format!("child crashed: {e}"))
        }
    }
}

#[cfg(not(unix))]
async fn run_capture_phase(
    _ctx: &AppContext,
    _session: Session,
    _profile: &Profile,
    _interrupt: Arc<Notify>,
) -> Result<SessionState> {
    Err(DrydockErr::Internal(
        "the sandbox supervisor requires a unix host".to_string(),
    ))
}

/// Apply the fast-path rule after a clean child exit, replaying
/// immediately when every capture is an auto-approved subprocess.
async fn settle_clean_exit(
    ctx: &AppContext,
    session: &mut Session,
    profile: &Profile,
    capture_output: CaptureOutput,
) -> Result<SessionState> {
    let records = session.captures()?;
    match decide_fast_path(profile, &records) {
        FastPathDecision::Deny { reason } => {
            session.set_state(SessionState::Denied)?;
            let ops = records
                .iter()
                .map(|record| {
                    let note = if profile_denies(profile, &record.capture) {
                        format!("denied by profile {:?}", profile.name())
                    } else {
                        "session denied".to_string()
                    };
                    OpOutcome {
                        index: record.index,
                        disposition: OpDisposition::skipped(note),
                    }
                })
                .collect();
            session.write_result(&SessionResult {
                stdout_bytes: capture_output.stdout_bytes,
                stderr_bytes: capture_output.stderr_bytes,
                exit_code: capture_output.exit_code,
                ops,
                reason: Some(reason),
            })?;
            Ok(SessionState::Denied)
        }
        FastPathDecision::Approve => {
            info!(
                "session {}: all captures auto-approved, replaying immediately",
                session.id()
            );
            session.set_state(SessionState::Approved)?;
            crate::approval::run_replay(ctx, session).await
        }
        FastPathDecision::Park => {
            session.set_state(SessionState::PendingReview)?;
            Ok(SessionState::PendingReview)
        }
    }
}

fn finalize_failed(
    session: &Session,
    capture_output: CaptureOutput,
    reason: String,
) -> Result<SessionState> {
    warn!("session {} failed: {reason}", session.id());
    session.set_state(SessionState::Failed)?;
    let ops = session
        .captures()?
        .iter()
        .map(|record| OpOutcome {
            index: record.index,
            disposition: OpDisposition::skipped("session failed before approval"),
        })
        .collect();
    session.write_result(&SessionResult {
        stdout_bytes: capture_output.stdout_bytes,
        stderr_bytes: capture_output.stderr_bytes,
        exit_code: capture_output.exit_code,
        ops,
        reason: Some(reason),
    })?;
    Ok(SessionState::Failed)
}

/// The supervisor's fast-path rule, applied on clean exit:
/// - any `always_deny` match finalises the session as denied;
/// - at least one subprocess, all auto-approved, with zero writes and
///   zero sockets, goes straight to replay;
/// - everything else parks for review.
pub(crate) fn decide_fast_path(
    profile: &Profile,
    records: &[CaptureRecord],
) -> FastPathDecision {
    let mut subprocess_seen = false;
    let mut all_allowed = true;
    let mut writes_or_sockets = false;

    for record in records {
        match &record.capture {
            Capture::Subprocess {
                argv, env_delta, ..
            } => {
                subprocess_seen = true;
                match profile.classify(argv, env_delta) {
                    Classification::AutoDeny => {
                        return FastPathDecision::Deny {
                            reason: format!(
                                "profile {:?} denies op {}: {}",
                                profile.name(),
                                record.index,
                                crate::approval::render_argv(argv),
                            ),
                        };
                    }
                    Classification::AutoAllow => {}
                    Classification::NeedsReview => all_allowed = false,
                }
            }
            Capture::Write { .. } | Capture::Socket { .. } => writes_or_sockets = true,
        }
    }

    if subprocess_seen && all_allowed && !writes_or_sockets {
        FastPathDecision::Approve
    } else {
        FastPathDecision::Park
    }
}

fn profile_denies(profile: &Profile, capture: &Capture) -> bool {
    match capture {
        Capture::Subprocess {
            argv, env_delta, ..
        } => profile.classify(argv, env_delta) == Classification::AutoDeny,
        _ => false,
    }
}

/// Default per-session view: the whole host is readable, every write
/// lands in the context's shadow root, and `/proc` is synthesised.
pub fn default_mapping_table(ctx: &AppContext, proc_tree: ProcTree) -> Result<MappingTable> {
    MappingTable::new(vec![
        (
            "/".to_string(),
            Mapping::Shadowed {
                host_root: "/".into(),
                shadow_root: ctx.shadow_root.clone(),
            },
        ),
        ("/proc".to_string(), Mapping::Proc(proc_tree)),
    ])
}

/// The frame pump: reads frames, dispatches each request on its own task
/// (handlers await capture durability, so two requests never serialise
/// behind each other), and funnels replies through a single writer task
/// that owns the channel's write half.
pub(crate) async fn pump_frames<R, W>(
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    handlers: Arc<Handlers>,
    deadline: tokio::time::Instant,
    interrupt: Arc<Notify>,
) -> CaptureEnd
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, reply_rx) = async_channel::bounded::<ReplyFrame>(64);
    let writer_task = tokio::spawn(async move {
        while let Ok(frame) = reply_rx.recv().await {
            if let Err(e) = writer.send(&frame).await {
                warn!("failed to write reply frame: {e}");
                break;
            }
        }
        let _ = writer.close().await;
    });

    let end = loop {
        tokio::select! {
            frame = reader.recv() => match frame {
                Ok(Some(InboundFrame::Request(request))) => {
                    let handlers = Arc::clone(&handlers);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let request_id = request.request_id;
                        let reply = handlers.dispatch(request.request).await;
                        let _ = reply_tx.send(ReplyFrame { request_id, reply }).await;
                    });
                }
                Ok(Some(InboundFrame::Log { level, line })) => {
                    info!(target: "drydock::child", level, "{line}");
                }
                Ok(None) => break CaptureEnd::CleanEof,
                Err(e) => break CaptureEnd::ChannelError(e.to_string()),
            },
            _ = tokio::time::sleep_until(deadline) => break CaptureEnd::Timeout,
            _ = interrupt.notified() => break CaptureEnd::Cancelled,
        }
    };

    // Dropping our sender lets the writer drain in-flight replies and
    // then close the write half, which is the child's EOF.
    drop(reply_tx);
    let _ = writer_task.await;
    end
}

/// Drain a stream to EOF, keeping the first `cap` bytes and marking
/// truncation.
async fn drain_stream<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    if truncated {
        buf.extend_from_slice(TRUNCATION_MARKER);
    }
    buf
}

// ---------------------------------------------------------------------------
// Child process plumbing (unix only)
// ---------------------------------------------------------------------------

#[cfg(unix)]
struct SpawnedChild {
    child: tokio::process::Child,
    req_pipe: tokio::net::unix::pipe::Receiver,
    rep_pipe: tokio::net::unix::pipe::Sender,
    child_env: BTreeMap<String, String>,
}

/// FDs the child finds its channel on, fixed by the interpreter contract
/// and passed again as positional arguments.
#[cfg(unix)]
const CHILD_REQ_FD: i32 = 3;
#[cfg(unix)]
const CHILD_REP_FD: i32 = 4;

#[cfg(unix)]
async fn spawn_child(
    ctx: &AppContext,
    session: &Arc<AsyncMutex<Session>>,
) -> Result<SpawnedChild> {
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;
    use tokio::net::unix::pipe;

    let (req_read, req_write) = make_pipe()?;
    let (rep_read, rep_write) = make_pipe()?;

    let (script_path, session_dir) = {
        let session = session.lock().await;
        (
            session.dir().join("script.py"),
            session.dir().to_path_buf(),
        )
    };

    let child_env: BTreeMap<String, String> = BTreeMap::from([
        (
            "PATH".to_string(),
            format!(
                "{}:/usr/bin:/bin",
                ctx.runtime_dir.join("bin").to_string_lossy()
            ),
        ),
        (
            "PYTHONPATH".to_string(),
            ctx.stdlib_dir().to_string_lossy().into_owned(),
        ),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("HOME".to_string(), "/".to_string()),
    ]);

    let mut command = std::process::Command::new(ctx.interpreter_path());
    command
        .arg(CHILD_REQ_FD.to_string())
        .arg(CHILD_REP_FD.to_string())
        .arg(&script_path)
        .env_clear()
        .envs(&child_env)
        .current_dir(&session_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let req_write_fd = req_write.as_raw_fd();
    let rep_read_fd = rep_read.as_raw_fd();
    // Move the child's pipe ends onto the contract FDs. dup2 clears
    // close-on-exec on the destination, so they survive the exec.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(req_write_fd, CHILD_REQ_FD) < 0
                || libc::dup2(rep_read_fd, CHILD_REP_FD) < 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut command = tokio::process::Command::from(command);
    command.kill_on_drop(true);
    let child = command.spawn()?;

    // Parent closes the child's ends; the host ends go async.
    drop(req_write);
    drop(rep_read);
    let req_pipe = pipe::Receiver::from_owned_fd(req_read)?;
    let rep_pipe = pipe::Sender::from_owned_fd(rep_write)?;

    Ok(SpawnedChild {
        child,
        req_pipe,
        rep_pipe,
        child_env,
    })
}

#[cfg(unix)]
fn make_pipe() -> Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use std::os::fd::FromRawFd;
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(DrydockErr::Io(std::io::Error::last_os_error()));
    }
    let read = unsafe { std::os::fd::OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { std::os::fd::OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

#[cfg(unix)]
fn send_sigterm(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(unix)]
async fn wait_with_grace(child: &mut tokio::process::Child, grace: Duration) -> i32 {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(_)) => -1,
        Err(_) => {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(index: u32, capture: Capture) -> CaptureRecord {
        CaptureRecord { index, capture }
    }

    fn subprocess(argv: &[&str]) -> Capture {
        Capture::Subprocess {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            cwd: "/".to_string(),
            env_delta: BTreeMap::new(),
            stdin: None,
            required: false,
            created_at_ms: 0,
        }
    }

    #[test]
    fn fast_path_approves_uniformly_allowed_subprocesses() {
        let profile = Profile::builtin_default();
        let records = vec![
            record(0, subprocess(&["ls", "/tmp"])),
            record(1, subprocess(&["cat", "notes.txt"])),
        ];
        assert_eq!(
            FastPathDecision::Approve,
            decide_fast_path(&profile, &records)
        );
    }

    #[test]
    fn fast_path_denies_on_any_always_deny_match() {
        let profile = Profile::builtin_default();
        let records = vec![
            record(0, subprocess(&["ls", "/tmp"])),
            record(1, subprocess(&["rm", "-rf", "/"])),
        ];
        assert!(matches!(
            decide_fast_path(&profile, &records),
            FastPathDecision::Deny { .. }
        ));
    }

    #[test]
    fn fast_path_parks_on_review_needed_or_writes_or_sockets() {
        let profile = Profile::builtin_default();

        let records = vec![
            record(0, subprocess(&["ls"])),
            record(1, subprocess(&["curl", "http://example.com"])),
        ];
        assert_eq!(FastPathDecision::Park, decide_fast_path(&profile, &records));

        let records = vec![
            record(0, subprocess(&["ls"])),
            record(
                1,
                Capture::Write {
                    vpath: "/tmp/out".to_string(),
                    bytes: b"hi".to_vec(),
                    mode: 0o644,
                    created_at_ms: 0,
                },
            ),
        ];
        assert_eq!(FastPathDecision::Park, decide_fast_path(&profile, &records));

        let records = vec![
            record(0, subprocess(&["ls"])),
            record(
                1,
                Capture::Socket {
                    family: 2,
                    socktype: 1,
                    protocol: 0,
                    created_at_ms: 0,
                },
            ),
        ];
        assert_eq!(FastPathDecision::Park, decide_fast_path(&profile, &records));
    }

    #[test]
    fn fast_path_parks_sessions_with_no_captures() {
        let profile = Profile::builtin_default();
        assert_eq!(FastPathDecision::Park, decide_fast_path(&profile, &[]));
    }

    mod pump {
        use std::time::Duration;

        use tokio::io::AsyncReadExt;
        use tokio::io::AsyncWriteExt;
        use tokio::io::DuplexStream;
        use tokio::io::duplex;

        use pretty_assertions::assert_eq;

        use super::*;
        use crate::channel::ChildRequest;
        use crate::channel::HostReply;
        use crate::channel::RequestFrame;
        use crate::channel::WireValue;
        use crate::session::NewSession;
        use crate::session::Store;
        use crate::vfs::Mapping;
        use crate::vfs::MappingTable;

        async fn send_request(stream: &mut DuplexStream, frame: &RequestFrame) {
            let payload = frame.encode_payload();
            stream
                .write_all(&(payload.len() as u32).to_be_bytes())
                .await
                .expect("write len");
            stream.write_all(&payload).await.expect("write payload");
        }

        async fn read_reply(stream: &mut DuplexStream) -> ReplyFrame {
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.expect("read len");
            let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut payload).await.expect("read payload");
            ReplyFrame::decode_payload(&payload).expect("decode reply")
        }

        struct Fixture {
            _dir: tempfile::TempDir,
            session: Arc<AsyncMutex<Session>>,
            handlers: Arc<Handlers>,
        }

        fn fixture() -> Fixture {
            let dir = tempfile::tempdir().expect("tempdir");
            let data = dir.path().join("data");
            std::fs::create_dir_all(&data).expect("mkdir");
            std::fs::write(data.join("hello.txt"), b"hello").expect("seed");

            let store = Store::new(dir.path().join("sessions"), Duration::from_secs(3600));
            let session = store
                .create(b"print('x')", NewSession::default())
                .expect("create");

            let table = MappingTable::new(vec![
                (
                    "/data".to_string(),
                    Mapping::ReadOnly { host_root: data },
                ),
                (
                    "/tmp".to_string(),
                    Mapping::Shadowed {
                        host_root: dir.path().join("tmp-view"),
                        shadow_root: dir.path().join("shadow"),
                    },
                ),
            ])
            .expect("table");
            let vfs = Arc::new(StdMutex::new(crate::vfs::Vfs::new(table)));
            let session = Arc::new(AsyncMutex::new(session));
            let handlers = Arc::new(Handlers::new(vfs, Arc::clone(&session)));
            Fixture {
                _dir: dir,
                session,
                handlers,
            }
        }

        fn far_deadline() -> tokio::time::Instant {
            tokio::time::Instant::now() + Duration::from_secs(30)
        }

        #[tokio::test]
        async fn scripted_child_produces_ordered_captures_and_clean_eof() {
            let fixture = fixture();
            let (mut child_req, host_req) = duplex(64 * 1024);
            let (mut child_rep, host_rep) = duplex(64 * 1024);

            let child = tokio::spawn(async move {
                // stat a mapped file
                send_request(
                    &mut child_req,
                    &RequestFrame {
                        request_id: 1,
                        request: ChildRequest::FsStat {
                            vpath: "/data/hello.txt".to_string(),
                        },
                    },
                )
                .await;
                let reply = read_reply(&mut child_rep).await;
                assert_eq!(1, reply.request_id);
                let HostReply::Values(values) = reply.reply else {
                    panic!("stat should succeed");
                };
                assert_eq!(Some(5), values[1].as_u64());

                // buffered write: open, write, seal
                send_request(
                    &mut child_req,
                    &RequestFrame {
                        request_id: 2,
                        request: ChildRequest::FsOpenWrite {
                            vpath: "/tmp/out.txt".to_string(),
                            mode: 0o644,
                        },
                    },
                )
                .await;
                let reply = read_reply(&mut child_rep).await;
                let HostReply::Values(values) = reply.reply else {
                    panic!("open_write should succeed");
                };
                let handle = values[0].as_u64().expect("handle");

                send_request(
                    &mut child_req,
                    &RequestFrame {
                        request_id: 3,
                        request: ChildRequest::FsWrite {
                            handle,
                            bytes: b"hi".to_vec(),
                        },
                    },
                )
                .await;
                read_reply(&mut child_rep).await;

                send_request(
                    &mut child_req,
                    &RequestFrame {
                        request_id: 4,
                        request: ChildRequest::FsCloseWrite { handle },
                    },
                )
                .await;
                read_reply(&mut child_rep).await;

                // spawn attempt: synthetic success
                send_request(
                    &mut child_req,
                    &RequestFrame {
                        request_id: 5,
                        request: ChildRequest::ProcSpawn {
                            argv: vec!["ls".to_string(), "/tmp".to_string()],
                            cwd: "/".to_string(),
                            env_delta: BTreeMap::new(),
                            stdin: None,
                            required: false,
                        },
                    },
                )
                .await;
                let reply = read_reply(&mut child_rep).await;
                let HostReply::Values(values) = reply.reply else {
                    panic!("spawn capture should succeed");
                };
                assert_eq!(Some(0), values[0].as_i64());
                assert_eq!(Some(&b""[..]), values[1].as_bytes());

                // socket attempt: recorded, then refused
                send_request(
                    &mut child_req,
                    &RequestFrame {
                        request_id: 6,
                        request: ChildRequest::SockCreate {
                            family: 2,
                            socktype: 1,
                            protocol: 0,
                        },
                    },
                )
                .await;
                let reply = read_reply(&mut child_rep).await;
                assert!(matches!(
                    reply.reply,
                    HostReply::Error { code, .. } if code == libc::EPERM
                ));

                // closing the request pipe is the clean shutdown
            });

            let end = pump_frames(
                FrameReader::new(host_req),
                FrameWriter::new(host_rep),
                Arc::clone(&fixture.handlers),
                far_deadline(),
                Arc::new(Notify::new()),
            )
            .await;
            assert_eq!(CaptureEnd::CleanEof, end);
            child.await.expect("child task");

            let session = fixture.session.lock().await;
            let records = session.captures().expect("captures");
            let kinds: Vec<_> = records
                .iter()
                .map(|r| (r.index, r.capture.kind()))
                .collect();
            assert_eq!(
                vec![
                    (0, drydock_protocol::CaptureKind::Write),
                    (1, drydock_protocol::CaptureKind::Subprocess),
                    (2, drydock_protocol::CaptureKind::Socket),
                ],
                kinds
            );
        }

        #[tokio::test]
        async fn unknown_tag_ends_the_pump_with_a_channel_error() {
            let fixture = fixture();
            let (mut child_req, host_req) = duplex(4096);
            let (_child_rep, host_rep) = duplex(4096);

            let payload = [0x7Bu8, 0, 0, 0, 1];
            child_req
                .write_all(&(payload.len() as u32).to_be_bytes())
                .await
                .expect("write");
            child_req.write_all(&payload).await.expect("write");

            let end = pump_frames(
                FrameReader::new(host_req),
                FrameWriter::new(host_rep),
                fixture.handlers,
                far_deadline(),
                Arc::new(Notify::new()),
            )
            .await;
            assert!(matches!(end, CaptureEnd::ChannelError(_)));
        }

        #[tokio::test]
        async fn silent_child_hits_the_deadline() {
            let fixture = fixture();
            let (_child_req, host_req) = duplex(4096);
            let (_child_rep, host_rep) = duplex(4096);

            let end = pump_frames(
                FrameReader::new(host_req),
                FrameWriter::new(host_rep),
                fixture.handlers,
                tokio::time::Instant::now() + Duration::from_millis(50),
                Arc::new(Notify::new()),
            )
            .await;
            assert_eq!(CaptureEnd::Timeout, end);
        }

        #[tokio::test]
        async fn interrupt_cancels_the_capture_phase() {
            let fixture = fixture();
            let (_child_req, host_req) = duplex(4096);
            let (_child_rep, host_rep) = duplex(4096);

            let interrupt = Arc::new(Notify::new());
            interrupt.notify_one();
            let end = pump_frames(
                FrameReader::new(host_req),
                FrameWriter::new(host_rep),
                fixture.handlers,
                far_deadline(),
                interrupt,
            )
            .await;
            assert_eq!(CaptureEnd::Cancelled, end);
        }
    }
}
