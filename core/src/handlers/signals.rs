use tracing::debug;

use crate::channel::WireValue;
use crate::error::Result;

/// Signal mixin. The sandbox delivers no signals, so queries report the
/// default disposition and action requests are acknowledged without doing
/// anything. This keeps signal-installing scripts (common in CLI tools)
/// running instead of crashing on an unsupported call.
pub(crate) struct SignalHandler;

impl SignalHandler {
    pub(crate) fn query(&self, signo: i64) -> Result<Vec<WireValue>> {
        debug!("signal query for {signo}: reporting default disposition");
        Ok(vec![WireValue::I64(0)])
    }

    pub(crate) fn action(&self, signo: i64, action: i64) -> Result<Vec<WireValue>> {
        debug!("accepting signal action {action} for {signo}; nothing will be delivered");
        Ok(Vec::new())
    }
}
