use std::sync::Arc;

use drydock_protocol::Capture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::channel::WireValue;
use crate::error::DrydockErr;
use crate::error::Result;
use crate::session::Session;
use crate::util::now_unix_ms;

/// Socket mixin. The sandbox offers no network access: every socket
/// attempt is recorded for the audit trail and then fails with a
/// permission error. Recorded sockets are never replayed.
pub(crate) struct SocketHandler {
    session: Arc<AsyncMutex<Session>>,
}

impl SocketHandler {
    pub(crate) fn new(session: Arc<AsyncMutex<Session>>) -> Self {
        Self { session }
    }

    pub(crate) async fn create(
        &self,
        family: i64,
        socktype: i64,
        protocol: i64,
    ) -> Result<Vec<WireValue>> {
        debug!("recording denied socket attempt: family={family} type={socktype}");
        let capture = Capture::Socket {
            family: family as i32,
            socktype: socktype as i32,
            protocol: protocol as i32,
            created_at_ms: now_unix_ms(),
        };
        {
            let mut session = self.session.lock().await;
            session.append_capture_async(capture).await?;
        }
        Err(DrydockErr::NotPermitted(
            "socket creation is not available in the sandbox".to_string(),
        ))
    }
}
