use std::collections::BTreeMap;
use std::sync::Arc;

use drydock_protocol::Capture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::channel::WireValue;
use crate::error::DrydockErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::now_unix_ms;

/// Process mixin: a spawn attempt never runs anything. It is recorded as
/// a `PendingSubprocess` capture and answered with a deterministic
/// synthetic success (exit 0, empty output) so scripts that branch on the
/// exit code behave the same during capture as they will during replay of
/// an approved session.
pub(crate) struct ProcessHandler {
    session: Arc<AsyncMutex<Session>>,
}

impl ProcessHandler {
    pub(crate) fn new(session: Arc<AsyncMutex<Session>>) -> Self {
        Self { session }
    }

    pub(crate) async fn spawn(
        &self,
        argv: Vec<String>,
        cwd: String,
        env_delta: BTreeMap<String, String>,
        stdin: Option<Vec<u8>>,
        required: bool,
    ) -> Result<Vec<WireValue>> {
        if argv.is_empty() {
            return Err(DrydockErr::InvalidInput("empty argv".to_string()));
        }
        debug!("capturing subprocess attempt: {argv:?}");

        let capture = Capture::Subprocess {
            argv,
            cwd,
            env_delta,
            stdin,
            required,
            created_at_ms: now_unix_ms(),
        };
        let mut session = self.session.lock().await;
        session.append_capture_async(capture).await?;

        Ok(vec![
            WireValue::I64(0),
            WireValue::Bytes(Vec::new()),
            WireValue::Bytes(Vec::new()),
        ])
    }
}
