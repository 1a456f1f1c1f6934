use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

/// Contents of a session directory's `metadata.json`. Written once at
/// creation and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub slug: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Name of the approval profile the session was submitted under.
    pub profile: String,
    /// Named remote target for replay; `None` replays locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Free-form caller-supplied context shown to reviewers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
}

/// Per-op reviewer decision recorded in `approval.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDecision {
    pub index: u32,
    pub decision: Decision,
}

/// Contents of `approval.json`: how each capture was decided, by whom and
/// when. Present only for sessions that went through review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub decisions: Vec<OpDecision>,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
    pub decided_by: String,
}

/// What actually happened to one captured op during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpDisposition {
    /// The op ran on the host.
    Replayed {
        exit: i32,
        #[serde(with = "crate::b64")]
        stdout: Vec<u8>,
        #[serde(with = "crate::b64")]
        stderr: Vec<u8>,
        elapsed_ms: u64,
    },
    /// The op was never performed. The `replay` field is serialised as an
    /// explicit `null` so readers can distinguish "skipped" from "ran and
    /// produced nothing".
    Skipped { replay: (), reason: String },
}

impl OpDisposition {
    pub fn skipped(reason: impl Into<String>) -> Self {
        OpDisposition::Skipped {
            replay: (),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOutcome {
    pub index: u32,
    #[serde(flatten)]
    pub disposition: OpDisposition,
}

/// Contents of `result.json`. Populated only when a session reaches
/// `executed`, `failed`, or `denied`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    /// Captured stdout of the sandboxed script itself (not of replayed
    /// subprocesses), possibly truncated at the supervisor's cap.
    #[serde(with = "crate::b64")]
    pub stdout_bytes: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub stderr_bytes: Vec<u8>,
    /// Exit code of the sandboxed interpreter child.
    pub exit_code: i32,
    pub ops: Vec<OpOutcome>,
    /// Why the session ended the way it did, for `failed` and `denied`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn metadata_omits_absent_optionals() {
        let meta = SessionMetadata {
            id: "20260801120000-script-deadbeef".to_string(),
            slug: "script".to_string(),
            created_at: datetime!(2026-08-01 12:00:00 UTC),
            profile: "default".to_string(),
            target: None,
            analysis: None,
        };
        let value = serde_json::to_value(&meta).expect("serialize");
        assert!(value.get("target").is_none());
        assert!(value.get("analysis").is_none());
        let back: SessionMetadata = serde_json::from_value(value).expect("deserialize");
        assert_eq!(meta, back);
    }

    #[test]
    fn skipped_op_serialises_an_explicit_null_replay() {
        let outcome = OpOutcome {
            index: 1,
            disposition: OpDisposition::skipped("denied by profile"),
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(
            json!({"index": 1, "replay": null, "reason": "denied by profile"}),
            value
        );
        let back: OpOutcome = serde_json::from_value(value).expect("deserialize");
        assert_eq!(outcome, back);
    }

    #[test]
    fn replayed_op_keeps_the_flat_result_shape() {
        let outcome = OpOutcome {
            index: 0,
            disposition: OpDisposition::Replayed {
                exit: 0,
                stdout: b"ok\n".to_vec(),
                stderr: Vec::new(),
                elapsed_ms: 12,
            },
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(0, value["exit"]);
        assert_eq!("b2sK", value["stdout"]);
        assert_eq!(12, value["elapsed_ms"]);
        let back: OpOutcome = serde_json::from_value(value).expect("deserialize");
        assert_eq!(outcome, back);
    }

    #[test]
    fn approval_record_uses_lowercase_decisions() {
        let record = ApprovalRecord {
            decisions: vec![
                OpDecision {
                    index: 0,
                    decision: Decision::Allow,
                },
                OpDecision {
                    index: 1,
                    decision: Decision::Deny,
                },
            ],
            decided_at: datetime!(2026-08-01 12:30:00 UTC),
            decided_by: "reviewer".to_string(),
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!("allow", value["decisions"][0]["decision"]);
        assert_eq!("deny", value["decisions"][1]["decision"]);
    }
}
