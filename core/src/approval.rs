//! Approval engine: inspects parked sessions, renders their captures for
//! an external reviewer, records decisions, and triggers replay.
//!
//! Classification happens at approval time only; replay does not
//! re-check the profile. A single denied op poisons the whole session.

use drydock_protocol::ApprovalRecord;
use drydock_protocol::Capture;
use drydock_protocol::Decision;
use drydock_protocol::OpDecision;
use drydock_protocol::OpDisposition;
use drydock_protocol::OpOutcome;
use drydock_protocol::SessionResult;
use drydock_protocol::SessionState;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::config::AppContext;
use crate::error::DrydockErr;
use crate::error::Result;
use crate::profile::Classification;
use crate::profile::Profile;
use crate::remote;
use crate::replay;
use crate::replay::ReplayOptions;
use crate::session::OpenMode;
use crate::session::Session;
use crate::session::Store;

/// One capture rendered for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewItem {
    pub index: u32,
    pub kind: &'static str,
    pub rendered: String,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewPayload {
    pub session_id: String,
    pub profile: String,
    pub items: Vec<ReviewItem>,
}

#[derive(Debug)]
pub enum ReviewOutcome {
    /// The session settled without human input (fast-forwarded and
    /// replayed).
    Settled(SessionState),
    /// The captures need a decision; hand this to the review surface.
    Pending(ReviewPayload),
}

/// Inspect a `pending_review` session. If every subprocess capture
/// auto-approves under the session's profile, fast-forward to `approved`
/// and replay; otherwise return the rendered captures for an external
/// decision.
pub async fn review(ctx: &AppContext, store: &Store, session_id: &str) -> Result<ReviewOutcome> {
    let mut session = store.open(session_id, OpenMode::Mutate)?;
    require_pending(&session)?;

    let profile = Profile::load(ctx, &session.meta().profile)?;
    let records = session.captures()?;

    let items: Vec<ReviewItem> = records
        .iter()
        .map(|record| ReviewItem {
            index: record.index,
            kind: capture_kind_name(&record.capture),
            rendered: render_capture(&record.capture),
            classification: classify_capture(&profile, &record.capture),
        })
        .collect();

    let needs_human = items.iter().any(|item| {
        matches!(
            item.classification,
            Classification::NeedsReview | Classification::AutoDeny
        )
    });
    if needs_human {
        return Ok(ReviewOutcome::Pending(ReviewPayload {
            session_id: session.id().to_string(),
            profile: profile.name().to_string(),
            items,
        }));
    }

    info!("session {session_id}: review fast-forwarded to approved");
    session.set_state(SessionState::Approved)?;
    let state = run_replay(ctx, &mut session).await?;
    Ok(ReviewOutcome::Settled(state))
}

/// Record the reviewer's per-op decisions and act on them: any deny
/// finalises the session as `denied`; a full set of allows approves it
/// and triggers replay.
pub async fn decide(
    ctx: &AppContext,
    store: &Store,
    session_id: &str,
    decisions: Vec<OpDecision>,
    decided_by: Option<String>,
) -> Result<SessionState> {
    let mut session = store.open(session_id, OpenMode::Mutate)?;
    require_pending(&session)?;

    let records = session.captures()?;
    validate_decisions(&decisions, records.len())?;

    let denied = decisions
        .iter()
        .any(|decision| decision.decision == Decision::Deny);
    let approval = ApprovalRecord {
        decisions,
        decided_at: OffsetDateTime::now_utc(),
        decided_by: decided_by.unwrap_or_else(whoami::username),
    };
    session.write_approval(&approval)?;

    if denied {
        info!("session {session_id}: denied by {}", approval.decided_by);
        session.set_state(SessionState::Denied)?;
        let capture_output = session.capture_output()?.unwrap_or_default();
        let denied_indices: Vec<u32> = approval
            .decisions
            .iter()
            .filter(|d| d.decision == Decision::Deny)
            .map(|d| d.index)
            .collect();
        let ops = records
            .iter()
            .map(|record| {
                let note = if denied_indices.contains(&record.index) {
                    "denied by reviewer".to_string()
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
            reason: Some(format!("denied by {}", approval.decided_by)),
        })?;
        return Ok(SessionState::Denied);
    }

    info!("session {session_id}: approved by {}", approval.decided_by);
    session.set_state(SessionState::Approved)?;
    run_replay(ctx, &mut session).await
}

/// Abandon a parked session without deciding its ops.
pub fn cancel(store: &Store, session_id: &str) -> Result<()> {
    let session = store.open(session_id, OpenMode::Mutate)?;
    require_pending(&session)?;
    session.set_state(SessionState::Rejected)?;
    Ok(())
}

/// Session ids currently waiting on a decision.
pub fn review_queue(store: &Store) -> Result<Vec<String>> {
    Ok(store
        .list(Some(SessionState::PendingReview))?
        .into_iter()
        .map(|summary| summary.id)
        .collect())
}

/// Replay an `approved` session, locally or through the remote executor
/// when the metadata names a target.
pub async fn run_replay(ctx: &AppContext, session: &mut Session) -> Result<SessionState> {
    match session.meta().target.clone() {
        Some(target) => remote::execute_remote(ctx, session, &target).await,
        None => {
            let table = replay::replay_table(ctx)?;
            replay::execute(
                session,
                &table,
                &ReplayOptions {
                    op_timeout: ctx.replay_op_timeout,
                },
            )
            .await
        }
    }
}

fn require_pending(session: &Session) -> Result<()> {
    match session.state()? {
        SessionState::PendingReview => Ok(()),
        SessionState::Expired => Err(DrydockErr::Expired(session.id().to_string())),
        other => Err(DrydockErr::InvalidInput(format!(
            "session {} is {other}, not pending_review",
            session.id()
        ))),
    }
}

fn validate_decisions(decisions: &[OpDecision], capture_count: usize) -> Result<()> {
    let mut seen = vec![false; capture_count];
    for decision in decisions {
        let slot = seen.get_mut(decision.index as usize).ok_or_else(|| {
            DrydockErr::InvalidInput(format!(
                "decision names op {} but the session has {capture_count} captures",
                decision.index
            ))
        })?;
        if *slot {
            return Err(DrydockErr::InvalidInput(format!(
                "duplicate decision for op {}",
                decision.index
            )));
        }
        *slot = true;
    }
    if let Some(missing) = seen.iter().position(|decided| !decided) {
        return Err(DrydockErr::InvalidInput(format!(
            "no decision for op {missing}"
        )));
    }
    Ok(())
}

fn classify_capture(profile: &Profile, capture: &Capture) -> Classification {
    match capture {
        Capture::Subprocess {
            argv, env_delta, ..
        } => profile.classify(argv, env_delta),
        // Writes and sockets carry no command to match; they always go to
        // the reviewer unless the whole session fast-forwards.
        Capture::Write { .. } | Capture::Socket { .. } => Classification::AutoAllow,
    }
}

fn capture_kind_name(capture: &Capture) -> &'static str {
    match capture {
        Capture::Write { .. } => "write",
        Capture::Subprocess { .. } => "subprocess",
        Capture::Socket { .. } => "socket",
    }
}

/// Human-readable command line for review surfaces.
pub fn render_argv(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str))
        .unwrap_or_else(|_| argv.join(" "))
}

pub fn render_capture(capture: &Capture) -> String {
    match capture {
        Capture::Write {
            vpath,
            bytes,
            mode,
            ..
        } => format!("write {vpath} ({} bytes, mode {mode:o})", bytes.len()),
        Capture::Subprocess {
            argv,
            cwd,
            stdin,
            ..
        } => {
            let mut rendered = format!("spawn {} (cwd {cwd})", render_argv(argv));
            if let Some(stdin) = stdin {
                rendered.push_str(&format!(" with {} stdin bytes", stdin.len()));
            }
            rendered
        }
        Capture::Socket {
            family,
            socktype,
            protocol,
            ..
        } => format!("socket family={family} type={socktype} protocol={protocol}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use std::collections::BTreeMap;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::NewSession;

    fn test_ctx(root: &std::path::Path) -> AppContext {
        AppContext {
            home: root.to_path_buf(),
            session_root: root.join("sessions"),
            runtime_dir: root.join("runtime"),
            shadow_root: root.join("shadow"),
            default_profile: "default".to_string(),
            targets: BTreeMap::new(),
            capture_timeout: Duration::from_secs(300),
            replay_op_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(3600),
            version: "test",
        }
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

    fn parked_session(store: &Store, captures: Vec<Capture>) -> String {
        let mut session = store
            .create(b"print('x')", NewSession::default())
            .expect("create");
        for capture in captures {
            session.append_capture(capture).expect("append");
        }
        session
            .set_state(SessionState::PendingReview)
            .expect("park");
        session.id().to_string()
    }

    #[tokio::test]
    async fn review_returns_a_payload_for_unmatched_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let id = parked_session(
            &store,
            vec![
                subprocess(&["ls", "/tmp"]),
                subprocess(&["curl", "http://example.com"]),
            ],
        );

        let outcome = review(&ctx, &store, &id).await.expect("review");
        let ReviewOutcome::Pending(payload) = outcome else {
            panic!("expected a pending payload");
        };
        assert_eq!(2, payload.items.len());
        assert_eq!(Classification::AutoAllow, payload.items[0].classification);
        assert_eq!(Classification::NeedsReview, payload.items[1].classification);
        assert!(payload.items[1].rendered.contains("curl"));

        // Untouched: still parked.
        let session = store.open(&id, OpenMode::Read).expect("open");
        assert_eq!(SessionState::PendingReview, session.state().expect("state"));
    }

    #[tokio::test]
    async fn review_fast_forwards_write_only_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let id = parked_session(
            &store,
            vec![Capture::Write {
                vpath: "/tmp/out.txt".to_string(),
                bytes: b"hi".to_vec(),
                mode: 0o644,
                created_at_ms: 0,
            }],
        );

        let outcome = review(&ctx, &store, &id).await.expect("review");
        let ReviewOutcome::Settled(state) = outcome else {
            panic!("expected the session to settle");
        };
        assert_eq!(SessionState::Executed, state);
        assert_eq!(
            b"hi".to_vec(),
            std::fs::read(ctx.shadow_root.join("tmp/out.txt")).expect("shadow file")
        );
    }

    #[tokio::test]
    async fn one_deny_poisons_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let id = parked_session(
            &store,
            vec![
                subprocess(&["ls", "/tmp"]),
                subprocess(&["curl", "http://example.com"]),
            ],
        );

        let state = decide(
            &ctx,
            &store,
            &id,
            vec![
                OpDecision {
                    index: 0,
                    decision: Decision::Allow,
                },
                OpDecision {
                    index: 1,
                    decision: Decision::Deny,
                },
            ],
            Some("tester".to_string()),
        )
        .await
        .expect("decide");
        assert_eq!(SessionState::Denied, state);

        let session = store.open(&id, OpenMode::Read).expect("open");
        let approval = session.approval().expect("approval").expect("present");
        assert_eq!("tester", approval.decided_by);
        let result = session.result().expect("result").expect("present");
        assert!(result.reason.expect("reason").contains("tester"));
        assert!(matches!(
            result.ops[1].disposition,
            OpDisposition::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn full_allow_approves_and_replays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let id = parked_session(&store, vec![subprocess(&["echo", "approved"])]);

        let state = decide(
            &ctx,
            &store,
            &id,
            vec![OpDecision {
                index: 0,
                decision: Decision::Allow,
            }],
            Some("tester".to_string()),
        )
        .await
        .expect("decide");
        assert_eq!(SessionState::Executed, state);

        let session = store.open(&id, OpenMode::Read).expect("open");
        let result = session.result().expect("result").expect("present");
        match &result.ops[0].disposition {
            OpDisposition::Replayed { exit, stdout, .. } => {
                assert_eq!(0, *exit);
                assert_eq!(b"approved\n".to_vec(), *stdout);
            }
            other => panic!("expected a replayed op, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn incomplete_decisions_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let id = parked_session(
            &store,
            vec![subprocess(&["ls"]), subprocess(&["curl", "x"])],
        );

        let err = decide(
            &ctx,
            &store,
            &id,
            vec![OpDecision {
                index: 0,
                decision: Decision::Allow,
            }],
            None,
        )
        .await
        .expect_err("must reject");
        assert!(matches!(err, DrydockErr::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cancel_rejects_a_parked_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let id = parked_session(&store, vec![subprocess(&["curl", "x"])]);

        cancel(&store, &id).expect("cancel");
        let session = store.open(&id, OpenMode::Read).expect("open");
        assert_eq!(SessionState::Rejected, session.state().expect("state"));

        // Cancelling twice is illegal: the session is no longer parked.
        assert!(cancel(&store, &id).is_err());
    }

    #[tokio::test]
    async fn review_queue_lists_only_parked_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_ctx(dir.path());
        let store = Store::from_ctx(&ctx);
        let parked = parked_session(&store, vec![subprocess(&["curl", "x"])]);
        let _running = store
            .create(b"y", NewSession::default())
            .expect("create");

        assert_eq!(vec![parked], review_queue(&store).expect("queue"));
    }
}
