use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::debug;

/// Milliseconds since the Unix epoch, the timestamp unit used in capture
/// records.
pub fn now_unix_ms() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000).max(0) as u64
}

/// Make a notifier that fires when SIGINT occurs, so an in-flight capture
/// can be cancelled from the terminal.
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });

    notify
}
