use super::*;
use crate::process::marker::Marker;
use crate::process::OutputSink;
use crate::transport::LocalTransport;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

fn executor() -> Executor<LocalTransport> {
    Executor::new(LocalTransport::new(), None)
}

fn run(executor: &Executor<LocalTransport>, cmd: Command) -> ProcResult {
    executor.run(&cmd, &RunOptions::default()).unwrap()
}

#[test]
fn test_format_cmd_for_pid() {
    let cmd = format_cmd_for_pid("ls -l", None).unwrap();
    assert_eq!(cmd, "printf \"%s\\n\" \"$$\"; exec ls -l");

    let cmd = format_cmd_for_pid("ls", Some(Path::new("/tmp/a dir"))).unwrap();
    assert_eq!(cmd, "printf \"%s\\n\" \"$$\"; cd '/tmp/a dir' && exec ls");
}

#[test]
fn test_dedicated_session_output() {
    let executor = executor();
    let result = run(
        &executor,
        Command::new("sh -c 'printf \"a\\nb\"; echo oops >&2; exit 4'").fast_path(false),
    );
    assert_eq!(result.stdout, "a\nb");
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(result.exit_code, 4);
    assert!(executor.shell_pid().is_none());
}

#[test]
fn test_dedicated_session_without_shell() {
    let executor = executor();
    let mut proc = executor
        .run_async(&Command::new("printf '%s' 'a b'").shell(false), false)
        .unwrap();
    assert!(!proc.is_interactive());
    assert!(proc.pid().is_some());

    let output = proc.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.stdout, vec!["a b"]);
    assert_eq!(output.exit_code, Some(0));
}

#[test]
fn test_interactive_output_has_no_protocol_lines() {
    let executor = executor();
    let result = run(&executor, Command::new("echo hello"));
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, 0);

    // The shell stays around for the next command.
    let pid = executor.shell_pid();
    assert!(pid.is_some());

    let result = run(
        &executor,
        Command::new("sh -c 'echo \"a, b --- c\"; echo \"--- 1, 2 ---\" >&2; exit 3'"),
    );
    assert_eq!(result.stdout, "a, b --- c\n");
    assert_eq!(result.stderr, "--- 1, 2 ---\n");
    assert_eq!(result.exit_code, 3);
    assert_eq!(executor.shell_pid(), pid);
}

#[test]
fn test_interactive_output_without_newline() {
    let executor = executor();
    let result = run(&executor, Command::new("printf 'no newline'"));
    assert_eq!(result.stdout, "no newline");
    assert_eq!(result.exit_code, 0);
}

#[test]
fn test_interactive_pid_line() {
    let executor = executor();
    let mut proc = executor
        .run_async(&Command::new("sh -c 'echo $$'"), true)
        .unwrap();
    assert!(proc.is_interactive());
    let pid = proc.pid().unwrap();

    let output = proc.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout, vec![format!("{}\n", pid)]);
}

#[test]
fn test_dedicated_pid_line() {
    let executor = executor();
    let mut proc = executor
        .run_async(&Command::new("sh -c 'echo $$'"), false)
        .unwrap();
    assert!(!proc.is_interactive());
    let pid = proc.pid().unwrap();

    let output = proc.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.stdout, vec![format!("{}\n", pid)]);
}

#[test]
fn test_interactive_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor();
    let result = run(&executor, Command::new("pwd -P").cwd(dir.path()));
    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(result.stdout.trim_end(), expected.to_string_lossy());
}

#[test]
fn test_interactive_command_cannot_read_shell_input() {
    let executor = executor();
    let result = run(&executor, Command::new("cat"));
    assert_eq!(result.stdout, "");
    assert_eq!(result.exit_code, 0);

    let result = run(&executor, Command::new("echo still alive"));
    assert_eq!(result.stdout, "still alive\n");
}

#[test]
fn test_adversarial_old_trailer() {
    let executor = executor();
    let old = Marker::generate();
    let trailer = old.trailer(0);
    let result = run(
        &executor,
        Command::new(format!("sh -c 'printf \"%s\\n\" \"{}\"; exit 5'", trailer)),
    );
    assert_eq!(result.stdout, format!("{}\n", trailer));
    assert_eq!(result.exit_code, 5);
}

#[test]
fn test_sequential_commands_reuse_shell() {
    let executor = executor();
    for i in 0..20 {
        let result = run(&executor, Command::new(format!("sh -c 'echo {}; exit {}'", i, i % 3)));
        assert_eq!(result.stdout, format!("{}\n", i));
        assert_eq!(result.exit_code, i % 3);
    }
}

#[test]
fn test_concurrent_commands() {
    let executor = Arc::new(executor());
    let mut handles = Vec::new();

    for i in 0..8 {
        let executor = Arc::clone(&executor);
        handles.push(thread::spawn(move || {
            let cmd = Command::new(format!(
                "sh -c 'date +%s%N; echo out-{i}; echo err-{i} >&2; sleep 0.1; date +%s%N; exit {i}'"
            ));
            let mut proc = executor.run_async(&cmd, true).unwrap();
            let interactive = proc.is_interactive();
            let output = proc.wait(&WaitOptions::default()).unwrap();
            (i, interactive, output)
        }));
    }

    let mut intervals = Vec::new();
    for handle in handles {
        let (i, interactive, output) = handle.join().unwrap();
        assert_eq!(output.exit_code, Some(i));
        assert_eq!(output.stdout.len(), 3);
        assert_eq!(output.stdout[1], format!("out-{}\n", i));
        assert_eq!(output.stderr, vec![format!("err-{}\n", i)]);

        if interactive {
            let start: u128 = output.stdout[0].trim().parse().unwrap();
            let end: u128 = output.stdout[2].trim().parse().unwrap();
            intervals.push((start, end));
        }
    }

    intervals.sort();
    for pair in intervals.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping commands: {:?}", pair);
    }
}

#[test]
fn test_busy_shell_falls_back() {
    let executor = executor();
    let mut slow = executor
        .run_async(&Command::new("sleep 1"), true)
        .unwrap();
    assert!(slow.is_interactive());
    assert!(executor.guard().is_busy());

    let start = Instant::now();
    let mut quick = executor
        .run_async(&Command::new("echo quick"), true)
        .unwrap();
    assert!(!quick.is_interactive());
    let output = quick.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.stdout, vec!["quick\n"]);
    assert!(start.elapsed() < Duration::from_millis(900));

    let output = slow.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert!(!executor.guard().is_busy());
}

#[test]
fn test_lock_timeout_falls_back() {
    let executor = executor().with_lock_timeout(Duration::from_millis(100));
    let held = executor.guard().lock().unwrap();

    let start = Instant::now();
    let mut proc = executor
        .run_async(&Command::new("echo fallback"), true)
        .unwrap();
    assert!(!proc.is_interactive());
    assert!(start.elapsed() < Duration::from_secs(2));
    drop(held);

    let output = proc.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.stdout, vec!["fallback\n"]);
}

#[test]
fn test_recovery_after_shell_dies() {
    let executor = executor();
    run(&executor, Command::new("true"));
    let pid = executor.shell_pid().unwrap();

    let result = run(
        &executor,
        Command::new(format!("kill -9 {}", pid)).fast_path(false),
    );
    assert_eq!(result.exit_code, 0);
    thread::sleep(Duration::from_millis(100));

    let result = run(&executor, Command::new("echo recovered"));
    assert_eq!(result.stdout, "recovered\n");
    assert_eq!(result.exit_code, 0);
    assert!(!executor.guard().is_busy());

    // A new shell takes over.
    let result = run(&executor, Command::new("echo again"));
    assert_eq!(result.stdout, "again\n");
    let new_pid = executor.shell_pid().unwrap();
    assert_ne!(new_pid, pid);
}

#[test]
fn test_retry_when_shell_dies_during_command() {
    let executor = executor();
    run(&executor, Command::new("true"));
    let pid = executor.shell_pid().unwrap();

    // The first run kills the interactive shell it runs in, the second one only prints.
    let dir = tempfile::tempdir().unwrap();
    let flag = quote(&dir.path().join("killed").to_string_lossy()).unwrap();
    let script = format!(
        "if [ ! -e {flag} ]; then touch {flag}; kill -9 $PPID; fi; echo retried",
        flag = flag
    );
    let cmd = Command::new(format!("sh -c {}", quote(&script).unwrap()));

    let result = run(&executor, cmd);
    assert_eq!(result.stdout, "retried\n");
    assert_eq!(result.exit_code, 0);
    assert!(dir.path().join("killed").exists());
    assert!(!executor.guard().is_busy());

    let result = run(&executor, Command::new("echo again"));
    assert_eq!(result.stdout, "again\n");
    let new_pid = executor.shell_pid().unwrap();
    assert_ne!(new_pid, pid);
}

#[test]
fn test_timeout() {
    let executor = executor();
    let start = Instant::now();
    let err = executor
        .run(
            &Command::new("sleep 5"),
            &RunOptions::default().with_timeout(Duration::from_secs(1)),
        )
        .unwrap_err();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));

    match err {
        Error::Timeout { message, .. } => {
            assert!(message.contains("sleep 5"));
            assert!(message.contains("1.0 seconds"));
        }
        other => panic!("unexpected error: {}", other),
    }

    // The abandoned shell is replaced, the next command does not wait for `sleep`.
    let start = Instant::now();
    let result = run(&executor, Command::new("echo next"));
    assert_eq!(result.stdout, "next\n");
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_timeout_keeps_partial_output() {
    let executor = executor();
    let err = executor
        .run(
            &Command::new("sh -c 'echo started; sleep 5'").fast_path(false),
            &RunOptions::default().with_timeout(Duration::from_millis(500)),
        )
        .unwrap_err();
    match err {
        Error::Timeout { stdout, .. } => assert_eq!(stdout, "started\n"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_timeout_keeps_unterminated_line() {
    let executor = executor();
    let opts = RunOptions::default().with_timeout(Duration::from_millis(500));

    for fast_path in [false, true] {
        let cmd = Command::new("sh -c 'printf started; sleep 3'").fast_path(fast_path);
        match executor.run(&cmd, &opts).unwrap_err() {
            Error::Timeout { stdout, stderr, .. } => {
                assert_eq!(stdout, "started");
                assert_eq!(stderr, "");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}

#[test]
fn test_timeout_releases_marker_like_tail() {
    // "--" might start the marker, the interactive shell holds it back until the timeout.
    let executor = executor();
    let err = executor
        .run(
            &Command::new("sh -c 'printf \"started --\"; sleep 3'"),
            &RunOptions::default().with_timeout(Duration::from_millis(500)),
        )
        .unwrap_err();
    match err {
        Error::Timeout { stdout, .. } => assert_eq!(stdout, "started --"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_output_is_echoed_to_sinks() {
    let executor = executor();
    for fast_path in [false, true] {
        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        let err = Arc::new(Mutex::new(Vec::<u8>::new()));
        let out_sink: OutputSink = out.clone();
        let err_sink: OutputSink = err.clone();
        let opts = RunOptions::default().with_sinks(Some(out_sink), Some(err_sink));

        let cmd = Command::new("sh -c 'echo one; echo oops >&2; printf two'").fast_path(fast_path);
        let result = executor.run(&cmd, &opts).unwrap();
        assert_eq!(result.stdout, "one\ntwo");
        assert_eq!(result.stderr, "oops\n");

        assert_eq!(out.lock().unwrap().as_slice(), b"one\ntwo");
        assert_eq!(err.lock().unwrap().as_slice(), b"oops\n");
    }
}

#[test]
fn test_sinks_without_capture() {
    let executor = executor();
    let out = Arc::new(Mutex::new(Vec::<u8>::new()));
    let out_sink: OutputSink = out.clone();
    let opts = RunOptions::default()
        .with_capture_output(false)
        .with_sinks(Some(out_sink), None);

    let result = executor.run(&Command::new("echo streamed"), &opts).unwrap();
    assert_eq!(result.stdout, "");
    assert_eq!(out.lock().unwrap().as_slice(), b"streamed\n");
}

#[test]
fn test_wait_in_steps() {
    let executor = executor();
    let mut proc = executor
        .run_async(&Command::new("sh -c 'echo one; sleep 0.5; echo two'"), true)
        .unwrap();

    let first = proc
        .wait(&WaitOptions::default().with_lines(Some(1), None))
        .unwrap();
    assert_eq!(first.stdout, vec!["one\n"]);
    assert_eq!(first.exit_code, None);

    let rest = proc.wait(&WaitOptions::default()).unwrap();
    assert_eq!(rest.stdout, vec!["two\n"]);
    assert_eq!(rest.exit_code, Some(0));
    assert_eq!(proc.exit_code(), Some(0));
}

#[test]
fn test_zero_timeout_does_not_block() {
    let executor = executor();
    let mut proc = executor
        .run_async(&Command::new("sleep 2").fast_path(false), false)
        .unwrap();

    let start = Instant::now();
    let output = proc
        .wait(&WaitOptions::default().with_timeout(Duration::ZERO))
        .unwrap();
    assert_eq!(output.exit_code, None);
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(proc.poll().unwrap(), None);
}

#[test]
fn test_combine_streams() {
    let executor = executor();
    let result = executor
        .run(
            &Command::new("sh -c 'echo out; echo err >&2'"),
            &RunOptions::default().with_combined_streams(true),
        )
        .unwrap();
    assert_eq!(result.stderr, "");
    let mut lines: Vec<&str> = result.stdout.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["err", "out"]);
}

#[test]
fn test_no_capture() {
    let executor = executor();
    let result = executor
        .run(
            &Command::new("echo hidden"),
            &RunOptions::default().with_capture_output(false),
        )
        .unwrap();
    assert_eq!(result.stdout, "");
    assert_eq!(result.exit_code, 0);
}

#[test]
fn test_write_stdin() {
    let executor = executor();
    let mut proc = executor
        .run_async(&Command::new("cat"), false)
        .unwrap();
    proc.write_stdin(b"ping\n").unwrap();
    proc.close_stdin();

    let output = proc.wait(&WaitOptions::default()).unwrap();
    assert_eq!(output.stdout, vec!["ping\n"]);

    let mut proc = executor.run_async(&Command::new("true"), true).unwrap();
    assert!(proc.is_interactive());
    assert!(matches!(
        proc.write_stdin(b"x"),
        Err(Error::NotSupported(_))
    ));
    proc.wait(&WaitOptions::default()).unwrap();
}

#[test]
fn test_invalid_command() {
    let executor = executor();
    let cmd = Command::new("ls").cwd("/").shell(false);
    assert!(executor.run(&cmd, &RunOptions::default()).is_err());
}

#[test]
fn test_disabled_fast_path() {
    let executor = executor().with_fast_path(false);
    let proc = executor.run_async(&Command::new("true"), true).unwrap();
    assert!(!proc.is_interactive());
}

#[test]
fn test_close_stops_shell() {
    let executor = executor();
    run(&executor, Command::new("true"));
    assert!(executor.shell_pid().is_some());

    executor.close();
    assert!(executor.shell_pid().is_none());

    let result = run(&executor, Command::new("echo after close"));
    assert_eq!(result.stdout, "after close\n");
    assert!(executor.shell_pid().is_none());
}
