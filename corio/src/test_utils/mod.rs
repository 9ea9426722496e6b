mod mocks;
pub(crate) use mocks::{CountingScheduler, DummyScheduler, WakerData, mock_waker};

mod runtime;
pub(crate) use runtime::{init_local_runtime, init_stealing_runtime};
