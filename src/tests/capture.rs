use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::{Drain, Stream};
use crate::posix;
use crate::{
    ABORTED_EXIT_CODE, AbortWhen, CaptureConfig, CaptureError, CapturedProcess, Deadline,
    NeverAbort, RunState, StreamSet, WindowMode, launch,
};

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[test]
fn fresh_instance_is_empty() {
    let mut p = CapturedProcess::new();
    assert_eq!(p.state(), RunState::Idle);
    assert!(!p.has_stdout_data());
    assert!(!p.has_stderr_data());
    assert!(p.fetch_stdout_data().is_empty());
    assert!(p.fetch_stderr_data().is_empty());
    assert!(p.last_error().is_none());
}

#[test]
fn echo_stdin() {
    let mut p = CapturedProcess::new();
    p.set_stdin_data("hello world");
    assert_eq!(p.run("cat", ""), 0);
    assert_eq!(p.state(), RunState::Completed);
    assert!(p.last_error().is_none());
    assert!(p.has_stdout_data());
    assert!(!p.has_stderr_data());
    assert_eq!(p.fetch_stdout_data(), b"hello world");
}

#[test]
fn echo_large_stdin() {
    let data = sample_data(1_000_000);
    let mut p = CapturedProcess::new();
    p.set_stdin_data(data.clone());
    assert_eq!(p.run("cat", ""), 0);
    assert_eq!(p.fetch_stdout_data(), data);
}

#[test]
fn output_before_reading_input() {
    // Fills the stdout pipe before reading any input.
    let mut p = CapturedProcess::new();
    p.set_stdin_data(sample_data(200_000));
    let exit_code = p.run("sh", r#"-c "head -c 200000 /dev/zero; cat""#);
    assert_eq!(exit_code, 0);
    assert_eq!(p.fetch_stdout_data().len(), 400_000);
}

#[test]
fn large_output_on_both_streams() {
    let mut p = CapturedProcess::new();
    let exit_code = p.run(
        "sh",
        r#"-c "head -c 100000 /dev/zero; head -c 100000 /dev/zero >&2""#,
    );
    assert_eq!(exit_code, 0);
    assert_eq!(p.fetch_stdout_data().len(), 100_000);
    assert_eq!(p.fetch_stderr_data().len(), 100_000);
}

#[test]
fn separate_streams() {
    let mut p = CapturedProcess::new();
    assert_eq!(p.run("sh", r#"-c "echo out; echo err >&2""#), 0);
    assert_eq!(p.fetch_stdout_data(), b"out\n");
    assert_eq!(p.fetch_stderr_data(), b"err\n");
}

#[test]
fn arguments_are_split_with_quoting() {
    let mut p = CapturedProcess::new();
    assert_eq!(p.run("printf", r#"'%s|' "a b" c 'd e'"#), 0);
    assert_eq!(p.fetch_stdout_data(), b"a b|c|d e|");
}

#[test]
fn unbalanced_quote_is_rejected() {
    let mut p = CapturedProcess::new();
    let code = p.run("sh", r#"-c "exit 0"#);
    assert_eq!(code, libc::EINVAL as u32);
    assert_eq!(p.state(), RunState::Failed);
    assert!(matches!(
        p.last_error(),
        Some(CaptureError::ProcessCreation { .. })
    ));
}

#[test]
fn exit_code() {
    let mut p = CapturedProcess::new();
    assert_eq!(p.run("sh", r#"-c "exit 13""#), 13);
    assert_eq!(p.state(), RunState::Completed);
}

#[test]
fn killed_by_signal() {
    let mut p = CapturedProcess::new();
    assert_eq!(p.run("sh", r#"-c "kill -9 $$""#), 128 + 9);
}

#[test]
fn nonexistent_program() {
    let mut p = CapturedProcess::new();
    let code = p.run("nosuchcommand-captured", "");
    assert_eq!(code, libc::ENOENT as u32);
    assert_eq!(p.state(), RunState::Failed);
    assert!(!p.has_stdout_data());
    let stderr = String::from_utf8(p.fetch_stderr_data()).unwrap();
    assert!(
        stderr.starts_with("Error creating process 'nosuchcommand-captured': "),
        "unexpected diagnostic: {stderr}"
    );
    match p.last_error() {
        Some(CaptureError::ProcessCreation { program, source }) => {
            assert_eq!(program, "nosuchcommand-captured");
            assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn success_clears_last_error() {
    let mut p = CapturedProcess::new();
    p.run("nosuchcommand-captured", "");
    assert!(p.last_error().is_some());
    assert_eq!(p.run("true", ""), 0);
    assert!(p.last_error().is_none());
    assert!(!p.has_stderr_data());
    assert_eq!(p.state(), RunState::Completed);
}

#[test]
fn fetch_is_destructive() {
    let mut p = CapturedProcess::new();
    assert_eq!(p.run("sh", r#"-c "echo out; echo err >&2""#), 0);
    assert_eq!(p.fetch_stdout_data(), b"out\n");
    assert!(p.fetch_stdout_data().is_empty());
    assert!(!p.has_stdout_data());
    assert_eq!(p.fetch_stderr_data(), b"err\n");
    assert!(p.fetch_stderr_data().is_empty());
    assert!(!p.has_stderr_data());
}

#[test]
fn no_stdin_data_gives_no_stdin() {
    let mut p = CapturedProcess::new();
    let start = Instant::now();
    let code = p.run("cat", "");
    assert_ne!(code, 0);
    assert_ne!(code, ABORTED_EXIT_CODE);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(p.has_stderr_data());
}

#[test]
fn stdin_data_is_consumed_by_run() {
    let mut p = CapturedProcess::new();
    p.set_stdin_data("foo");
    assert_eq!(p.run("cat", ""), 0);
    assert_eq!(p.fetch_stdout_data(), b"foo");
    assert_ne!(p.run("cat", ""), 0);
    assert!(p.fetch_stdout_data().is_empty());
}

#[test]
fn set_stdin_data_replaces() {
    let mut p = CapturedProcess::new();
    p.set_stdin_data("first");
    p.set_stdin_data(b"second".to_vec());
    assert_eq!(p.run("cat", ""), 0);
    assert_eq!(p.fetch_stdout_data(), b"second");
}

#[test]
fn child_ignoring_stdin_fails_run() {
    let mut p = CapturedProcess::new();
    p.set_stdin_data(sample_data(1_000_000));
    let code = p.run("sh", r#"-c "exit 3""#);
    assert_eq!(code, libc::EPIPE as u32);
    assert_eq!(p.state(), RunState::Failed);
    assert!(!p.has_stdout_data());
    let stderr = String::from_utf8(p.fetch_stderr_data()).unwrap();
    assert!(
        stderr.starts_with("Error writing to child's stdin stream: "),
        "unexpected diagnostic: {stderr}"
    );
    match p.last_error() {
        Some(CaptureError::StdinWrite { source }) => {
            assert_eq!(source.raw_os_error(), Some(libc::EPIPE));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn failed_drain_terminates_child() {
    let mut streams = StreamSet::create().unwrap();
    let mut child = launch("sleep", "1000", &streams, false, WindowMode::Hidden, None).unwrap();
    streams.close_child_ends();
    let mut stdout =
        Drain::spawn(Stream::Stdout, || Err(io::Error::from_raw_os_error(libc::EIO))).unwrap();
    let mut stderr = Drain::finished(Stream::Stderr);

    let p = CapturedProcess::with_config(
        CaptureConfig::default().poll_interval(Duration::from_millis(10)),
    );
    let start = Instant::now();
    assert!(p.poll(&mut child, &mut stdout, &mut stderr, &NeverAbort).unwrap());
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(child.exit_code(), Some(ABORTED_EXIT_CODE));
    assert_eq!(stdout.join().unwrap_err().raw_os_error(), Some(libc::EIO));
    assert_eq!(stderr.join().unwrap(), b"");
}

#[test]
fn failed_stderr_drain_terminates_child() {
    let mut streams = StreamSet::create().unwrap();
    let mut child = launch("sleep", "1000", &streams, false, WindowMode::Hidden, None).unwrap();
    streams.close_child_ends();
    let mut stdout = Drain::finished(Stream::Stdout);
    let mut stderr =
        Drain::spawn(Stream::Stderr, || Err(io::Error::from_raw_os_error(libc::EIO))).unwrap();

    let p = CapturedProcess::new();
    assert!(p.poll(&mut child, &mut stdout, &mut stderr, &NeverAbort).unwrap());
    assert_eq!(child.exit_code(), Some(ABORTED_EXIT_CODE));
    assert!(stderr.join().is_err());
}

#[test]
fn finished_drain_does_not_terminate_child() {
    let mut streams = StreamSet::create().unwrap();
    let mut child = launch(
        "sh",
        r#"-c "sleep 0.2; exit 4""#,
        &streams,
        false,
        WindowMode::Hidden,
        None,
    )
    .unwrap();
    streams.close_child_ends();
    let mut stdout = Drain::spawn(Stream::Stdout, || Ok(b"done".to_vec())).unwrap();
    let mut stderr = Drain::finished(Stream::Stderr);

    let p = CapturedProcess::new();
    assert!(!p.poll(&mut child, &mut stdout, &mut stderr, &NeverAbort).unwrap());
    assert_eq!(child.exit_code(), Some(4));
    assert_eq!(stdout.join().unwrap(), b"done");
}

#[test]
fn failed_wait_is_an_error() {
    let mut streams = StreamSet::create().unwrap();
    let mut child = launch("true", "", &streams, false, WindowMode::Hidden, None).unwrap();
    streams.close_child_ends();
    // reap the child behind the handle's back
    posix::waitpid(child.pid(), 0).unwrap();

    let p = CapturedProcess::new();
    let err = p
        .poll(
            &mut child,
            &mut Drain::finished(Stream::Stdout),
            &mut Drain::finished(Stream::Stderr),
            &NeverAbort,
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
}

#[test]
fn no_stdin_data_leaves_descriptor_closed() {
    let mut p = CapturedProcess::new();
    let code = p.run("sh", r#"-c "[ -e /dev/fd/0 ] && echo open || echo closed""#);
    assert_eq!(code, 0);
    assert_eq!(p.fetch_stdout_data(), b"closed\n");
}

#[test]
fn output_closed_before_exit() {
    let mut p = CapturedProcess::new();
    let code = p.run("sh", r#"-c "echo early; exec >&- 2>&-; sleep 0.3; exit 5""#);
    assert_eq!(code, 5);
    assert_eq!(p.fetch_stdout_data(), b"early\n");
}

#[test]
fn abort_with_deadline() {
    let mut p = CapturedProcess::new();
    let start = Instant::now();
    let code = p.run_with_abort("sleep", "1000", &Deadline::after(Duration::from_millis(100)));
    assert_eq!(code, ABORTED_EXIT_CODE);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(p.state(), RunState::Completed);
    assert!(p.last_error().is_none());
}

#[test]
fn abort_from_another_thread() {
    let flag = Arc::new(AtomicBool::new(false));
    let setter = {
        let flag = Arc::clone(&flag);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Release);
        })
    };
    let mut p = CapturedProcess::new();
    p.set_stdin_data("ignored");
    let start = Instant::now();
    assert_eq!(p.run_with_abort("sleep", "1000", &flag), ABORTED_EXIT_CODE);
    assert!(start.elapsed() < Duration::from_secs(10));
    setter.join().unwrap();
}

#[test]
fn abort_keeps_output_so_far() {
    let mut p = CapturedProcess::new();
    let abort = Deadline::after(Duration::from_millis(300));
    let code = p.run_with_abort("sh", r#"-c "echo started; exec sleep 1000""#, &abort);
    assert_eq!(code, ABORTED_EXIT_CODE);
    assert_eq!(p.fetch_stdout_data(), b"started\n");
}

#[test]
fn abort_checked_every_poll() {
    let polls = AtomicUsize::new(0);
    let abort = AbortWhen(|| polls.fetch_add(1, Ordering::Relaxed) >= 3);
    let mut p = CapturedProcess::with_config(
        CaptureConfig::default().poll_interval(Duration::from_millis(10)),
    );
    assert_eq!(p.run_with_abort("sleep", "1000", &abort), ABORTED_EXIT_CODE);
    assert_eq!(polls.load(Ordering::Relaxed), 4);
}

#[test]
fn unset_abort_lets_child_finish() {
    let flag = AtomicBool::new(false);
    let mut p = CapturedProcess::new();
    p.set_stdin_data("foo");
    assert_eq!(p.run_with_abort("cat", "", &flag), 0);
    assert_eq!(p.fetch_stdout_data(), b"foo");
}

#[test]
fn config_defaults() {
    let config = CaptureConfig::default();
    assert_eq!(config.get_window_mode(), WindowMode::Hidden);
    assert_eq!(config.get_poll_interval(), Duration::from_millis(50));
    assert_eq!(CapturedProcess::new().config(), &config);
}

#[test]
fn zero_poll_interval_is_clamped() {
    let mut p = CapturedProcess::new();
    p.set_poll_interval(Duration::ZERO);
    assert_eq!(p.config().get_poll_interval(), Duration::from_millis(1));
    p.set_window_mode(WindowMode::Visible);
    assert_eq!(p.config().get_window_mode(), WindowMode::Visible);
    p.set_stdin_data("foo");
    assert_eq!(p.run("cat", ""), 0);
    assert_eq!(p.fetch_stdout_data(), b"foo");
}
