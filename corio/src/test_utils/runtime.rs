use crate::runtime::{Builder, Runtime};
use anyhow::Result;

pub(crate) fn init_local_runtime() -> Result<Runtime> {
    Builder::new_local().try_build()
}

/// A stealing runtime with `worker_threads` threads besides the `block_on`
/// thread.
pub(crate) fn init_stealing_runtime(worker_threads: usize) -> Result<Runtime> {
    Builder::new_stealing()
        .worker_threads(worker_threads)
        .try_build()
}
