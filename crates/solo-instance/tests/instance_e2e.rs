//! End-to-end coverage of the coordination protocol: lock contention,
//! argument forwarding, response matching, listener shutdown, and the
//! secondary's fallback ladder.

use std::{
    path::Path,
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use solo_instance::{
    ChannelListener, DuplexChannel, FileLock, InstanceConfig, InstanceHandler, InstanceRunner,
    LengthPrefixCodec, LockState, NamedLock, UnixChannel, derive_paths, request_exit_code,
};

/// Handler with observable behavior: records every invocation, lets the test
/// decide when the primary's own run finishes, and answers forwarded launches
/// with the code encoded in their first argument.
struct TestApp {
    default_code: i32,
    firsts: Mutex<Vec<Vec<String>>>,
    forwarded: Mutex<Vec<Vec<String>>>,
    release: AtomicBool,
    closed: AtomicUsize,
    shutdown: AtomicUsize,
}

impl TestApp {
    fn new(default_code: i32) -> Arc<Self> {
        Arc::new(Self {
            default_code,
            firsts: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
            release: AtomicBool::new(false),
            closed: AtomicUsize::new(0),
            shutdown: AtomicUsize::new(0),
        })
    }

    fn release_primary(&self) {
        self.release.store(true, Ordering::SeqCst);
    }
}

impl InstanceHandler for TestApp {
    fn run_instance(&self, args: &[String], first_instance: bool) -> i32 {
        if first_instance {
            self.firsts.lock().unwrap().push(args.to_vec());
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            self.default_code
        } else {
            self.forwarded.lock().unwrap().push(args.to_vec());
            args.first()
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.default_code)
        }
    }

    fn on_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_shutdown(&self) {
        assert!(
            self.closed.load(Ordering::SeqCst) > self.shutdown.load(Ordering::SeqCst),
            "on_shutdown must follow on_closed"
        );
        self.shutdown.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config(dir: &tempfile::TempDir) -> InstanceConfig {
    InstanceConfig {
        marshal_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(300),
        busy_retries: 3,
        stop_timeout: Duration::from_secs(5),
        failure_exit_code: -1,
        single_instance: true,
        runtime_dir: Some(dir.path().to_path_buf()),
    }
}

async fn wait_for_path(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never appeared", path.display());
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[test]
fn contended_try_acquire_exactly_one_wins() {
    const N: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contended.lock");

    let start = Arc::new(Barrier::new(N));
    let attempted = Arc::new(Barrier::new(N));
    let results = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let path = path.clone();
            let start = start.clone();
            let attempted = attempted.clone();
            let results = results.clone();
            std::thread::spawn(move || {
                let mut lock = FileLock::new(&path).unwrap();
                start.wait();
                let state = lock.try_acquire().unwrap();
                results.lock().unwrap().push(state);
                // Hold until everyone has attempted, so losers really did
                // race a live holder.
                attempted.wait();
                if state != LockState::AlreadyHeld {
                    lock.release().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let results = results.lock().unwrap();
    let winners = results
        .iter()
        .filter(|s| matches!(s, LockState::Acquired | LockState::AbandonedRecovered))
        .count();
    let losers = results
        .iter()
        .filter(|s| matches!(s, LockState::AlreadyHeld))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(losers, N - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarded_args_and_exit_codes_match() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let app = TestApp::new(5);

    let runner = InstanceRunner::new("e2e-forward", app.clone(), config).unwrap();
    let paths = runner.paths().clone();
    let primary = tokio::spawn(runner.run(strs(&["main"])));

    wait_for_path(&paths.socket).await;
    let channel = UnixChannel::new(&paths.socket, 3);
    let codec = LengthPrefixCodec;

    // Order and spacing survive the wire, and each caller gets the code the
    // callback produced for its own vector.
    let first_args = strs(&["42", "b c", "d"]);
    let code = request_exit_code(&channel, &codec, &first_args, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(code, 42);

    let second_args = strs(&["7", "x"]);
    let code = request_exit_code(&channel, &codec, &second_args, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(code, 7);

    assert_eq!(
        *app.forwarded.lock().unwrap(),
        vec![first_args, second_args]
    );

    app.release_primary();
    let code = primary.await.unwrap().unwrap();
    assert_eq!(code, 5);

    assert_eq!(app.firsts.lock().unwrap().len(), 1);
    assert_eq!(app.closed.load(Ordering::SeqCst), 1);
    assert_eq!(app.shutdown.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_argument_vector_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let app = TestApp::new(3);

    let runner = InstanceRunner::new("e2e-empty", app.clone(), config).unwrap();
    let paths = runner.paths().clone();
    let primary = tokio::spawn(runner.run(vec![]));

    wait_for_path(&paths.socket).await;
    let channel = UnixChannel::new(&paths.socket, 3);
    let code = request_exit_code(&channel, &LengthPrefixCodec, &[], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(code, 3);
    assert_eq!(*app.forwarded.lock().unwrap(), vec![Vec::<String>::new()]);

    app.release_primary();
    primary.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_panic_is_contained_to_one_request() {
    struct Panicky {
        served: AtomicUsize,
    }
    impl InstanceHandler for Panicky {
        fn run_instance(&self, args: &[String], first_instance: bool) -> i32 {
            if first_instance {
                while self.served.load(Ordering::SeqCst) < 2 {
                    std::thread::sleep(Duration::from_millis(10));
                }
                return 0;
            }
            self.served.fetch_add(1, Ordering::SeqCst);
            assert!(!args.is_empty());
            if args[0] == "boom" {
                panic!("requested failure");
            }
            11
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let app = Arc::new(Panicky {
        served: AtomicUsize::new(0),
    });

    let runner = InstanceRunner::new("e2e-panic", app.clone(), config).unwrap();
    let paths = runner.paths().clone();
    let primary = tokio::spawn(runner.run(strs(&["main"])));

    wait_for_path(&paths.socket).await;
    let channel = UnixChannel::new(&paths.socket, 3);
    let codec = LengthPrefixCodec;

    // Panicking request gets the failure code, and the listener survives to
    // serve the next one.
    let code = request_exit_code(&channel, &codec, &strs(&["boom"]), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(code, -1);

    let code = request_exit_code(&channel, &codec, &strs(&["ok"]), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(code, 11);

    primary.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_lock_is_recovered_by_next_runner() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let paths = derive_paths("e2e-abandoned", Some(dir.path()));

    // A holder that dies without releasing: drop leaves the PID marker.
    let mut casualty = FileLock::new(&paths.lock).unwrap();
    assert_eq!(casualty.try_acquire().unwrap(), LockState::Acquired);
    drop(casualty);

    let mut heir = FileLock::new(&paths.lock).unwrap();
    assert_eq!(heir.try_acquire().unwrap(), LockState::AbandonedRecovered);
    heir.release().unwrap();

    // A full runner also proceeds as primary over an abandoned lock.
    drop(heir);
    let mut casualty = FileLock::new(&paths.lock).unwrap();
    casualty.try_acquire().unwrap();
    drop(casualty);

    let app = TestApp::new(4);
    app.release_primary();
    let runner = InstanceRunner::new("e2e-abandoned", app.clone(), config).unwrap();
    let code = runner.run(strs(&["after-crash"])).await.unwrap();
    assert_eq!(code, 4);
    assert_eq!(app.firsts.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_listener_stops_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("idle.sock");
    let channel = UnixChannel::new(&socket, 3);
    let acceptor = channel.bind().await.unwrap();

    let listener = ChannelListener::spawn(
        acceptor,
        TestApp::new(0),
        Arc::new(LengthPrefixCodec),
        -1,
    );

    let started = Instant::now();
    listener.stop(Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_waits_for_inflight_request() {
    struct Slow;
    impl InstanceHandler for Slow {
        fn run_instance(&self, _args: &[String], _first_instance: bool) -> i32 {
            std::thread::sleep(Duration::from_millis(500));
            9
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("slow.sock");
    let channel = UnixChannel::new(&socket, 3);
    let acceptor = channel.bind().await.unwrap();

    let listener =
        ChannelListener::spawn(acceptor, Arc::new(Slow), Arc::new(LengthPrefixCodec), -1);

    let client_socket = socket.clone();
    let client = tokio::spawn(async move {
        let channel = UnixChannel::new(&client_socket, 3);
        request_exit_code(
            &channel,
            &LengthPrefixCodec,
            &strs(&["inflight"]),
            Duration::from_secs(5),
        )
        .await
    });

    // Let the request reach Processing, then ask the listener to stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    listener.stop(Duration::from_secs(5)).await;
    let waited = started.elapsed();

    // Stop must have waited out the 500ms callback instead of aborting it,
    // and the client still gets its matched response.
    assert!(waited >= Duration::from_millis(300), "stop returned in {waited:?}");
    assert_eq!(client.await.unwrap().unwrap(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fallback_ladder_promotes_secondary_to_primary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.marshal_timeout = Duration::from_millis(500);
    let paths = derive_paths("e2e-ladder", Some(dir.path()));

    // Lock held, but nothing listening: both marshal attempts must fail.
    let mut external = FileLock::new(&paths.lock).unwrap();
    assert_eq!(external.try_acquire().unwrap(), LockState::Acquired);

    let app = TestApp::new(7);
    app.release_primary();
    let runner = InstanceRunner::new("e2e-ladder", app.clone(), config).unwrap();
    let run = tokio::spawn(runner.run(strs(&["ladder"])));

    // Release during the retry delay; the post-retry try_acquire should win.
    tokio::time::sleep(Duration::from_millis(100)).await;
    external.release().unwrap();

    let code = run.await.unwrap().unwrap();
    assert_eq!(code, 7);
    assert_eq!(*app.firsts.lock().unwrap(), vec![strs(&["ladder"])]);
    assert!(app.forwarded.lock().unwrap().is_empty());
    assert_eq!(app.closed.load(Ordering::SeqCst), 1);
    assert_eq!(app.shutdown.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_ladder_degrades_to_standalone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.marshal_timeout = Duration::from_millis(300);
    config.retry_delay = Duration::from_millis(100);
    let paths = derive_paths("e2e-standalone", Some(dir.path()));

    // Lock stays held for the whole ladder and there is never a listener.
    let mut external = FileLock::new(&paths.lock).unwrap();
    assert_eq!(external.try_acquire().unwrap(), LockState::Acquired);

    let app = TestApp::new(13);
    app.release_primary();
    let runner = InstanceRunner::new("e2e-standalone", app.clone(), config).unwrap();
    let code = runner.run(strs(&["degraded"])).await.unwrap();

    assert_eq!(code, 13);
    assert_eq!(*app.firsts.lock().unwrap(), vec![strs(&["degraded"])]);
    assert_eq!(app.closed.load(Ordering::SeqCst), 1);

    external.release().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordination_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.single_instance = false;
    let paths = derive_paths("e2e-multi", Some(dir.path()));

    // Even with the lock held elsewhere, a non-coordinating run proceeds.
    let mut external = FileLock::new(&paths.lock).unwrap();
    external.try_acquire().unwrap();

    let app = TestApp::new(2);
    app.release_primary();
    let runner = InstanceRunner::new("e2e-multi", app.clone(), config).unwrap();
    let code = runner.run(strs(&["solo"])).await.unwrap();

    assert_eq!(code, 2);
    assert!(!paths.socket.exists());
    assert_eq!(app.shutdown.load(Ordering::SeqCst), 1);

    external.release().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preprocess_args_runs_before_coordination() {
    struct Rewriting {
        inner: Arc<TestApp>,
    }
    impl InstanceHandler for Rewriting {
        fn run_instance(&self, args: &[String], first_instance: bool) -> i32 {
            self.inner.run_instance(args, first_instance)
        }
        fn preprocess_args(&self, mut args: Vec<String>) -> Vec<String> {
            args.push("injected".to_string());
            args
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let inner = TestApp::new(0);
    inner.release_primary();

    let runner = InstanceRunner::new(
        "e2e-preprocess",
        Arc::new(Rewriting {
            inner: inner.clone(),
        }),
        config,
    )
    .unwrap();
    runner.run(strs(&["original"])).await.unwrap();

    assert_eq!(
        *inner.firsts.lock().unwrap(),
        vec![strs(&["original", "injected"])]
    );
}
