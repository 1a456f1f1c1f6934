//! Per-family handlers for intercepted calls. The supervisor composes one
//! of each by struct field and routes every decoded request to exactly
//! one of them; each handler owns the narrow slice of state it needs.

mod fs;
mod process;
mod signals;
mod sockets;

pub(crate) use fs::FsHandler;
pub(crate) use process::ProcessHandler;
pub(crate) use signals::SignalHandler;
pub(crate) use sockets::SocketHandler;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex as AsyncMutex;

use crate::channel::ChildRequest;
use crate::channel::HostReply;
use crate::channel::WireValue;
use crate::error::Result;
use crate::session::Session;
use crate::vfs::Vfs;

pub(crate) struct Handlers {
    fs: FsHandler,
    process: ProcessHandler,
    signals: SignalHandler,
    sockets: SocketHandler,
}

impl Handlers {
    pub(crate) fn new(vfs: Arc<StdMutex<Vfs>>, session: Arc<AsyncMutex<Session>>) -> Self {
        Self {
            fs: FsHandler::new(vfs, Arc::clone(&session)),
            process: ProcessHandler::new(Arc::clone(&session)),
            signals: SignalHandler,
            sockets: SocketHandler::new(session),
        }
    }

    /// Route one request to its handler and fold the outcome into a reply.
    /// Errors become error-reply frames; they never tear down the session.
    pub(crate) async fn dispatch(&self, request: ChildRequest) -> HostReply {
        let outcome: Result<Vec<WireValue>> = match request {
            ChildRequest::FsStat { vpath } => self.fs.stat(vpath).await,
            ChildRequest::FsOpenRead { vpath } => self.fs.open_read(vpath).await,
            ChildRequest::FsRead {
                handle,
                offset,
                len,
            } => self.fs.read(handle, offset, len).await,
            ChildRequest::FsClose { handle } => self.fs.close(handle).await,
            ChildRequest::FsReaddir { vpath } => self.fs.readdir(vpath).await,
            ChildRequest::FsOpenWrite { vpath, mode } => self.fs.open_write(vpath, mode).await,
            ChildRequest::FsWrite { handle, bytes } => self.fs.write(handle, bytes).await,
            ChildRequest::FsCloseWrite { handle } => self.fs.close_write(handle).await,
            ChildRequest::FsReadlink { vpath } => self.fs.readlink(vpath).await,
            ChildRequest::ProcSpawn {
                argv,
                cwd,
                env_delta,
                stdin,
                required,
            } => {
                self.process
                    .spawn(argv, cwd, env_delta, stdin, required)
                    .await
            }
            ChildRequest::SignalQuery { signo } => self.signals.query(signo),
            ChildRequest::SignalAction { signo, action } => self.signals.action(signo, action),
            ChildRequest::SockCreate {
                family,
                socktype,
                protocol,
            } => self.sockets.create(family, socktype, protocol).await,
        };
        match outcome {
            Ok(values) => HostReply::Values(values),
            Err(e) => HostReply::error(&e),
        }
    }
}
