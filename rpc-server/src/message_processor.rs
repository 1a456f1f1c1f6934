use std::sync::Arc;

use drydock_core::AppContext;
use drydock_core::DrydockErr;
use drydock_core::profile;
use drydock_core::session::OpenMode;
use drydock_core::session::Store;
use drydock_core::supervisor;
use drydock_core::supervisor::SubmitRequest;
use drydock_protocol::SessionResult;
use drydock_protocol::SessionState;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::warn;

use crate::rpc::JsonRpcRequest;
use crate::rpc::JsonRpcResponse;

/// Routes each incoming JSON-RPC request to its handler. Handlers run on
/// their own tasks so a long capture phase never blocks concurrent
/// polls; responses funnel through the single stdout writer.
pub(crate) struct MessageProcessor {
    ctx: Arc<AppContext>,
    store: Arc<Store>,
    outgoing: mpsc::Sender<String>,
    interrupt: Arc<Notify>,
}

#[derive(Deserialize)]
struct SubmitScriptParams {
    script: String,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    analysis: Option<String>,
}

#[derive(Deserialize)]
struct PollSessionParams {
    session_id: String,
}

#[derive(Serialize)]
struct SubmitScriptResult {
    session_id: String,
    state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<SessionResult>,
}

#[derive(Serialize)]
struct PollSessionResult {
    state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<SessionResult>,
}

impl MessageProcessor {
    pub(crate) fn new(
        ctx: Arc<AppContext>,
        store: Arc<Store>,
        outgoing: mpsc::Sender<String>,
        interrupt: Arc<Notify>,
    ) -> Self {
        Self {
            ctx,
            store,
            outgoing,
            interrupt,
        }
    }

    /// Handle one line from stdin. Malformed input still produces a
    /// response when an id can be salvaged; batch requests are refused
    /// outright.
    pub(crate) fn process_line(self: Arc<Self>, line: String) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed.starts_with('[') {
            self.send_response(JsonRpcResponse::failure(
                Value::Null,
                -32602,
                "batch requests are not supported".to_string(),
                None,
            ));
            return;
        }
        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                let id = serde_json::from_str::<Value>(trimmed)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                self.send_response(JsonRpcResponse::failure(
                    id,
                    -32602,
                    format!("malformed request: {e}"),
                    None,
                ));
                return;
            }
        };

        let Some(id) = request.id.clone() else {
            warn!("ignoring notification for method {:?}", request.method);
            return;
        };

        let processor = self;
        tokio::spawn(async move {
            let outcome = processor.dispatch(&request).await;
            let response = match outcome {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(
                    id,
                    e.rpc_error_code(),
                    e.to_string(),
                    Some(json!({ "kind": error_kind(&e) })),
                ),
            };
            processor.send_response(response);
        });
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> Result<Value, DrydockErr> {
        match request.method.as_str() {
            "submit_script" => self.submit_script(request.params.clone()).await,
            "poll_session" => self.poll_session(request.params.clone()),
            "list_profiles" => self.list_profiles(),
            "list_targets" => self.list_targets(),
            "status" => self.status(),
            other => Err(DrydockErr::InvalidInput(format!(
                "unknown method {other:?}"
            ))),
        }
    }

    async fn submit_script(&self, params: Option<Value>) -> Result<Value, DrydockErr> {
        let params: SubmitScriptParams = parse_params(params)?;
        if params.script.is_empty() {
            return Err(DrydockErr::InvalidInput("script is empty".to_string()));
        }
        if let Some(target) = &params.target {
            // Fail before the session exists; the supervisor would also
            // refuse, but the caller deserves a crisp InvalidTarget.
            self.ctx.target(target)?;
        }
        if let Some(profile) = &params.profile {
            profile::Profile::load(&self.ctx, profile)?;
        }

        let outcome = supervisor::submit_script(
            &self.ctx,
            &self.store,
            SubmitRequest {
                script: params.script.into_bytes(),
                name: params.name,
                profile: params.profile,
                target: params.target,
                analysis: params.analysis,
            },
            Arc::clone(&self.interrupt),
        )
        .await?;

        // Fast-path terminal sessions return their result inline so the
        // caller can skip a poll round-trip.
        let result = if outcome.state.is_terminal() {
            self.store
                .open(&outcome.session_id, OpenMode::Read)?
                .result()?
        } else {
            None
        };
        Ok(serde_json::to_value(SubmitScriptResult {
            session_id: outcome.session_id,
            state: outcome.state,
            result,
        })?)
    }

    /// Non-blocking state read; no lock is taken, and expiry is applied
    /// lazily by the store on open.
    fn poll_session(&self, params: Option<Value>) -> Result<Value, DrydockErr> {
        let params: PollSessionParams = parse_params(params)?;
        let session = self.store.open(&params.session_id, OpenMode::Read)?;
        let state = session.state()?;
        let result = if state.is_terminal() {
            session.result()?
        } else {
            None
        };
        Ok(serde_json::to_value(PollSessionResult { state, result })?)
    }

    fn list_profiles(&self) -> Result<Value, DrydockErr> {
        Ok(serde_json::to_value(profile::list_profiles(&self.ctx)?)?)
    }

    fn list_targets(&self) -> Result<Value, DrydockErr> {
        let names: Vec<&String> = self.ctx.targets.keys().collect();
        Ok(serde_json::to_value(names)?)
    }

    fn status(&self) -> Result<Value, DrydockErr> {
        // Status doubles as the lazy GC tick for abandoned sessions.
        let expired = self.store.sweep_expired()?;
        if expired > 0 {
            warn!("expired {expired} abandoned session(s)");
        }
        Ok(json!({
            "version": self.ctx.version,
            "runtime_present": self.ctx.runtime_present(),
            "session_root": self.ctx.session_root,
            "targets": self.ctx.targets.keys().collect::<Vec<_>>(),
            "profiles": profile::list_profiles(&self.ctx)?,
        }))
    }

    fn send_response(&self, response: JsonRpcResponse) {
        match serde_json::to_string(&response) {
            Ok(line) => {
                if self.outgoing.try_send(line).is_err() {
                    warn!("dropping response: writer is gone or backlogged");
                }
            }
            Err(e) => warn!("failed to serialize response: {e}"),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, DrydockErr> {
    let params = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(params)
        .map_err(|e| DrydockErr::InvalidInput(format!("bad params: {e}")))
}

fn error_kind(e: &DrydockErr) -> &'static str {
    match e {
        DrydockErr::InvalidInput(_) => "invalid_input",
        DrydockErr::NotFound(_) => "not_found",
        DrydockErr::NotPermitted(_) => "not_permitted",
        DrydockErr::Denied(_) => "denied",
        DrydockErr::Locked(_) => "locked",
        DrydockErr::Expired(_) => "expired",
        DrydockErr::Timeout(_) => "timeout",
        DrydockErr::ChildCrashed(_) => "child_crashed",
        DrydockErr::Transport(_) => "transport_error",
        DrydockErr::Protocol(_) => "protocol_violation",
        DrydockErr::IllegalTransition { .. } | DrydockErr::Internal(_) => "internal",
        DrydockErr::Io(_) => "io",
        DrydockErr::Json(_) => "json",
    }
}
