//! Core of the drydock sandbox: the framed channel to the restricted
//! interpreter, the virtual filesystem, the session store, the approval
//! profile matcher, subprocess capture/replay, the supervisor, the remote
//! executor, and the approval engine. The JSON-RPC surface lives in the
//! `drydock-rpc-server` crate on top of this one.

pub mod approval;
pub mod channel;
pub mod config;
pub mod error;
mod handlers;
pub mod profile;
pub mod remote;
pub mod replay;
pub mod session;
pub mod supervisor;
pub mod util;
pub mod vfs;

pub use config::AppContext;
pub use error::DrydockErr;
pub use error::Result;
