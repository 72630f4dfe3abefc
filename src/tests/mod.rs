#[cfg(unix)]
mod capture;

use crate::{
    CaptureConfig, CaptureError, CapturedProcess, ChildHandle, Deadline, NeverAbort, Pipe,
    RunState, StreamSet, WindowMode,
};

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn public_types_are_send_and_sync() {
    assert_send_sync::<CapturedProcess>();
    assert_send_sync::<CaptureConfig>();
    assert_send_sync::<CaptureError>();
    assert_send_sync::<RunState>();
    assert_send_sync::<Pipe>();
    assert_send_sync::<StreamSet>();
    assert_send_sync::<Deadline>();
    assert_send_sync::<NeverAbort>();
    assert_send_sync::<WindowMode>();
    assert_send_sync::<ChildHandle>();
}

#[cfg(unix)]
#[test]
fn identity_is_send_and_sync() {
    assert_send_sync::<crate::Identity>();
}
