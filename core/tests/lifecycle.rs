//! End-to-end lifecycle checks against the public API: the on-disk
//! session surface, the review path, and TTL expiry.
#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use drydock_core::approval;
use drydock_core::approval::ReviewOutcome;
use drydock_core::config::AppContext;
use drydock_core::error::DrydockErr;
use drydock_core::session::NewSession;
use drydock_core::session::OpenMode;
use drydock_core::session::Store;
use drydock_protocol::Capture;
use drydock_protocol::CaptureRecord;
use drydock_protocol::Decision;
use drydock_protocol::OpDecision;
use drydock_protocol::OpDisposition;
use drydock_protocol::SessionState;
use pretty_assertions::assert_eq;

fn test_ctx(root: &Path) -> AppContext {
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

fn subprocess(argv: &[&str], at: u64) -> Capture {
    Capture::Subprocess {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        cwd: "/".to_string(),
        env_delta: BTreeMap::new(),
        stdin: None,
        required: false,
        created_at_ms: at,
    }
}

#[test]
fn session_directory_matches_the_published_layout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path(), Duration::from_secs(3600));

    let mut session = store
        .create(
            b"import subprocess\nsubprocess.run(['ls'])\n",
            NewSession {
                name: Some("layout check".to_string()),
                profile: "default".to_string(),
                ..Default::default()
            },
        )
        .expect("create");
    session
        .append_capture(Capture::Write {
            vpath: "/tmp/out".to_string(),
            bytes: b"hi".to_vec(),
            mode: 0o644,
            created_at_ms: 123,
        })
        .expect("append");
    session
        .append_capture(subprocess(&["ls"], 124))
        .expect("append");
    session
        .set_state(SessionState::PendingReview)
        .expect("park");

    let session_dir = session.dir().to_path_buf();
    assert!(session_dir.join("metadata.json").is_file());
    assert!(session_dir.join("script.py").is_file());
    assert!(session_dir.join("captures.log").is_file());
    assert!(session_dir.join(".lock").is_file());
    assert_eq!(
        "pending_review",
        std::fs::read_to_string(session_dir.join("state")).expect("state")
    );

    // metadata.json keys are the published ones.
    let meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(session_dir.join("metadata.json")).expect("read"))
            .expect("parse");
    assert_eq!(session.id(), meta["id"].as_str().expect("id"));
    assert_eq!("layout-check", meta["slug"]);
    assert_eq!("default", meta["profile"]);
    assert!(meta.get("created_at").is_some());

    drop(session);
    assert!(!session_dir.join(".lock").exists());
}

#[test]
fn capture_log_records_use_the_binary_envelope() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path(), Duration::from_secs(3600));
    let mut session = store.create(b"x", NewSession::default()).expect("create");
    session
        .append_capture(Capture::Write {
            vpath: "/tmp/a".to_string(),
            bytes: b"payload".to_vec(),
            mode: 0o600,
            created_at_ms: 0x0102_0304,
        })
        .expect("append");
    session
        .append_capture(subprocess(&["ls"], 9))
        .expect("append");

    let raw = std::fs::read(session.dir().join("captures.log")).expect("read");

    // First record head: kind byte 1 (write), u32 BE index 0, u64 BE
    // created-at, u32 BE body length, then a self-describing JSON body.
    assert_eq!(1, raw[0]);
    assert_eq!([0u8, 0, 0, 0], raw[1..5]);
    assert_eq!(0x0102_0304u64.to_be_bytes(), raw[5..13]);
    let body_len = u32::from_be_bytes(raw[13..17].try_into().expect("len")) as usize;
    let body: serde_json::Value = serde_json::from_slice(&raw[17..17 + body_len]).expect("json");
    assert_eq!("write", body["kind"]);
    assert_eq!("/tmp/a", body["vpath"]);

    // The whole log decodes record by record with gap-free indices.
    let mut cursor = std::io::Cursor::new(&raw);
    let mut indices = Vec::new();
    while let Some(record) = CaptureRecord::decode_from(&mut cursor).expect("decode") {
        indices.push(record.index);
    }
    assert_eq!(vec![0, 1], indices);
    let mut rest = Vec::new();
    cursor.read_to_end(&mut rest).expect("read");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn mixed_review_path_denies_when_one_op_is_denied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = test_ctx(dir.path());
    let store = Store::from_ctx(&ctx);

    let mut session = store
        .create(b"script", NewSession::default())
        .expect("create");
    session
        .append_capture(subprocess(&["ls", "/tmp"], 1))
        .expect("append");
    session
        .append_capture(subprocess(&["curl", "http://example.com"], 2))
        .expect("append");
    session
        .set_state(SessionState::PendingReview)
        .expect("park");
    let id = session.id().to_string();
    drop(session);

    // The engine exposes the curl op for a decision.
    let outcome = approval::review(&ctx, &store, &id).await.expect("review");
    let ReviewOutcome::Pending(payload) = outcome else {
        panic!("expected a pending review payload");
    };
    assert_eq!(2, payload.items.len());
    assert!(payload.items[1].rendered.contains("curl"));

    // One deny poisons the session.
    let state = approval::decide(
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
        Some("reviewer".to_string()),
    )
    .await
    .expect("decide");
    assert_eq!(SessionState::Denied, state);

    let session = store.open(&id, OpenMode::Read).expect("open");
    let result = session.result().expect("result").expect("present");
    for op in &result.ops {
        assert!(matches!(op.disposition, OpDisposition::Skipped { .. }));
    }
    // The denied entry serialises with an explicit null replay marker.
    let value = serde_json::to_value(&result.ops[1]).expect("serialize");
    assert!(value["replay"].is_null());
}

#[tokio::test]
async fn expired_sessions_refuse_decisions_and_replay_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut ctx = test_ctx(dir.path());
    ctx.session_ttl = Duration::ZERO;
    let store = Store::from_ctx(&ctx);

    let mut session = store
        .create(b"script", NewSession::default())
        .expect("create");
    session
        .append_capture(subprocess(&["curl", "http://example.com"], 1))
        .expect("append");
    session
        .set_state(SessionState::PendingReview)
        .expect("park");
    let id = session.id().to_string();
    drop(session);

    // First touch past the TTL flips the state file on disk.
    let session = store.open(&id, OpenMode::Read).expect("open");
    assert_eq!(SessionState::Expired, session.state().expect("state"));
    assert_eq!(
        "expired",
        std::fs::read_to_string(session.dir().join("state")).expect("read")
    );
    drop(session);

    let err = approval::decide(
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
    .expect_err("expired sessions cannot be decided");
    assert!(matches!(err, DrydockErr::Expired(_)));

    // No replay happened: the result file was never written.
    let session = store.open(&id, OpenMode::Read).expect("open");
    assert_eq!(None, session.result().expect("result"));
}
