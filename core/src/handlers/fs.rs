use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex as AsyncMutex;

use crate::channel::WireValue;
use crate::error::DrydockErr;
use crate::error::Result;
use crate::session::Session;
use crate::vfs::Vfs;

/// Filesystem mixin: every fs-family frame lands here. Host-touching
/// operations run on the blocking pool so a slow disk cannot stall frame
/// dispatch; the capture emitted by `close_write` is durable in the
/// session before the reply is released.
pub(crate) struct FsHandler {
    vfs: Arc<StdMutex<Vfs>>,
    session: Arc<AsyncMutex<Session>>,
}

impl FsHandler {
    pub(crate) fn new(vfs: Arc<StdMutex<Vfs>>, session: Arc<AsyncMutex<Session>>) -> Self {
        Self { vfs, session }
    }

    async fn with_vfs<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Vfs) -> Result<T> + Send + 'static,
    {
        let vfs = Arc::clone(&self.vfs);
        tokio::task::spawn_blocking(move || {
            let mut vfs = vfs
                .lock()
                .map_err(|_| DrydockErr::Internal("vfs lock poisoned".to_string()))?;
            op(&mut vfs)
        })
        .await
        .map_err(|e| DrydockErr::Internal(format!("blocking fs task died: {e}")))?
    }

    pub(crate) async fn stat(&self, vpath: String) -> Result<Vec<WireValue>> {
        let stat = self.with_vfs(move |vfs| vfs.stat(&vpath)).await?;
        Ok(vec![
            WireValue::U64(stat.kind.wire_code()),
            WireValue::U64(stat.size),
            WireValue::U64(stat.mode as u64),
            WireValue::U64(stat.mtime_ms),
        ])
    }

    pub(crate) async fn open_read(&self, vpath: String) -> Result<Vec<WireValue>> {
        let handle = self.with_vfs(move |vfs| vfs.open_read(&vpath)).await?;
        Ok(vec![WireValue::U64(handle)])
    }

    pub(crate) async fn read(&self, handle: u64, offset: u64, len: u64) -> Result<Vec<WireValue>> {
        let bytes = self
            .with_vfs(move |vfs| vfs.read(handle, offset, len))
            .await?;
        Ok(vec![WireValue::Bytes(bytes)])
    }

    pub(crate) async fn close(&self, handle: u64) -> Result<Vec<WireValue>> {
        self.with_vfs(move |vfs| vfs.close(handle)).await?;
        Ok(Vec::new())
    }

    pub(crate) async fn readdir(&self, vpath: String) -> Result<Vec<WireValue>> {
        let entries = self.with_vfs(move |vfs| vfs.readdir(&vpath)).await?;
        Ok(vec![WireValue::List(
            entries
                .into_iter()
                .map(|entry| {
                    WireValue::List(vec![
                        WireValue::Str(entry.name),
                        WireValue::U64(entry.kind.wire_code()),
                    ])
                })
                .collect(),
        )])
    }

    pub(crate) async fn open_write(&self, vpath: String, mode: u64) -> Result<Vec<WireValue>> {
        let handle = self
            .with_vfs(move |vfs| vfs.open_write(&vpath, mode))
            .await?;
        Ok(vec![WireValue::U64(handle)])
    }

    pub(crate) async fn write(&self, handle: u64, bytes: Vec<u8>) -> Result<Vec<WireValue>> {
        let written = self.with_vfs(move |vfs| vfs.write(handle, &bytes)).await?;
        Ok(vec![WireValue::U64(written)])
    }

    /// Seal the buffered write into a `PendingWrite` capture. The append
    /// is awaited before replying so the record is on disk by the time
    /// the child continues.
    pub(crate) async fn close_write(&self, handle: u64) -> Result<Vec<WireValue>> {
        let capture = self.with_vfs(move |vfs| vfs.close_write(handle)).await?;
        let mut session = self.session.lock().await;
        session.append_capture_async(capture).await?;
        Ok(Vec::new())
    }

    pub(crate) async fn readlink(&self, vpath: String) -> Result<Vec<WireValue>> {
        let target = self.with_vfs(move |vfs| vfs.readlink(&vpath)).await?;
        Ok(vec![WireValue::Str(target)])
    }
}
