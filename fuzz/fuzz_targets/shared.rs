use std::cell::{LazyCell, RefCell};

use monoio::{
    BufResult, FusionRuntime, IoUringDriver, LegacyDriver,
    buf::{IoBuf, IoVecBuf},
    io::AsyncWriteRent,
};

/// Accepts and discards every write, so replies never fail.
pub struct NullWrite;

impl AsyncWriteRent for NullWrite {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        (Ok(buf.bytes_init()), buf)
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        (Ok(buf_vec.read_iovec_len()), buf_vec)
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

thread_local! {
    // Built once so the driver's intentional leak is not reported on every
    // iteration by LeakSanitizer.
    pub static RUNTIME: LazyCell<RefCell<FusionRuntime<IoUringDriver, LegacyDriver>>> = LazyCell::new(|| {
        RefCell::new(monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
            .build()
            .expect("Failed to create runtime"))
    });
}
