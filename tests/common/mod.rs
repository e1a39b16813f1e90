#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! #[macro_use]
//! mod common;
//! use common::*;
//! ```
//!
//! [`Cluster`] reproduces the forked topology inside one test process: the
//! master and every worker run on their own thread, each with its own
//! scheduler, joined by `UnixStream::pair()` links.

use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::fmt::format::FmtSpan;
use wsrelay::net::websocket::{compute_accept_key, decode, encode_masked, Decoded, Frame, Opcode};
use wsrelay::net::{Listener, Stream};
use wsrelay::server::{DefaultHandler, Handler, Master, Topology, Worker, WorkerLink};
use wsrelay::{ConnectionConfig, Scheduler};

static INIT_LOGGING: Once = Once::new();

/// Key from RFC 6455 section 1.3.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
/// Accept token RFC 6455 derives from [`SAMPLE_KEY`].
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;
const PROPTEST_SEED_ENV: &str = "WSRELAY_PROPTEST_SEED";

/// How long a client waits for a frame before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(5);

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        let seed = std::env::var(PROPTEST_SEED_ENV)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .or_else(|| std::env::var("CI").ok().map(|_| DEFAULT_PROPTEST_SEED));
        if let Some(seed) = seed {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Master plus workers, each on its own thread.
pub struct Cluster {
    /// Client address of each worker, by worker index.
    pub addrs: Vec<SocketAddr>,
    /// Connector socket path, when enabled.
    pub connector: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    _dir: Option<TempDir>,
}

/// Options for [`Cluster::start_with`].
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Number of workers.
    pub workers: usize,
    /// Enable the connector socket.
    pub connector: bool,
    /// All workers accept from one listener instead of one each.
    pub shared_listener: bool,
    /// Connection settings for every process.
    pub connection: ConnectionConfig,
}

impl ClusterOptions {
    /// `workers` workers, separate listeners, no connector.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Enables the connector.
    #[must_use]
    pub fn connector(mut self) -> Self {
        self.connector = true;
        self
    }

    /// Workers race on one listener.
    #[must_use]
    pub fn shared_listener(mut self) -> Self {
        self.shared_listener = true;
        self
    }
}

impl Cluster {
    /// Starts `workers` workers with the default hooks.
    pub fn start(workers: usize) -> Self {
        Self::start_with(ClusterOptions::new(workers), |_| DefaultHandler)
    }

    /// Starts a cluster; `factory` builds each worker's handler on its thread.
    pub fn start_with<H, F>(options: ClusterOptions, factory: F) -> Self
    where
        H: Handler + 'static,
        F: Fn(usize) -> H + Send + Sync + 'static,
    {
        init_test_logging();
        let factory = Arc::new(factory);
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let mut addrs = Vec::new();
        let mut links = Vec::new();

        let shared = options
            .shared_listener
            .then(|| TcpListener::bind("127.0.0.1:0").expect("bind shared listener"));
        for index in 0..options.workers {
            let listener = match &shared {
                Some(shared) => shared.try_clone().expect("clone listener"),
                None => TcpListener::bind("127.0.0.1:0").expect("bind worker listener"),
            };
            addrs.push(listener.local_addr().expect("listener addr"));

            let (master_end, worker_end) = UnixStream::pair().expect("link pair");
            links.push(WorkerLink::new(index, master_end));

            let stop = Arc::clone(&stop);
            let factory = Arc::clone(&factory);
            let connection = options.connection.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || {
                        let worker = Worker::new(
                            index,
                            Listener::from(listener),
                            Stream::from(worker_end),
                            (*factory)(index),
                            connection,
                        )
                        .expect("worker");
                        let mut sched = Scheduler::new().expect("scheduler");
                        worker.spawn_into(&mut sched);
                        drive(&mut sched, &stop);
                    })
                    .expect("spawn worker thread"),
            );
        }

        let (dir, connector_path, connector) = if options.connector {
            let dir = TempDir::new().expect("temp dir");
            let path = dir.path().join("wsc.sock");
            let listener = Listener::bind_unix(&path).expect("bind connector");
            (Some(dir), Some(path), Some(listener))
        } else {
            (None, None, None)
        };

        let topology = Topology {
            workers: links,
            connector,
        };
        let master_stop = Arc::clone(&stop);
        let connection = options.connection;
        handles.push(
            thread::Builder::new()
                .name("master".to_string())
                .spawn(move || {
                    let master = Master::new(topology, connection).expect("master");
                    let mut sched = Scheduler::new().expect("scheduler");
                    master.spawn_into(&mut sched);
                    drive(&mut sched, &master_stop);
                })
                .expect("spawn master thread"),
        );

        Self {
            addrs,
            connector: connector_path,
            stop,
            handles,
            _dir: dir,
        }
    }

    /// Connects and upgrades a client on worker `index`.
    pub fn client(&self, index: usize) -> Client {
        Client::connect(self.addrs[index])
    }

    /// Sends one frame through the connector.
    pub fn inject(&self, payload: &[u8]) {
        let path = self.connector.as_ref().expect("connector enabled");
        let mut injector = UnixStream::connect(path).expect("connect connector");
        injector
            .write_all(&wsrelay::net::websocket::encode(payload, Opcode::Text))
            .expect("inject");
        injector
            .set_read_timeout(Some(RECV_TIMEOUT))
            .expect("timeout");
        // Wait for the master to hang up, which it does after relaying.
        let mut rest = Vec::new();
        let _ = injector.read_to_end(&mut rest);
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn drive(sched: &mut Scheduler, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        sched.turn(Some(TICK)).expect("scheduler turn");
    }
}

/// A blocking WebSocket client that masks its frames.
pub struct Client {
    stream: TcpStream,
    mask: [u8; 4],
}

impl Client {
    /// Connects and completes the upgrade, checking the accept token.
    pub fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(RECV_TIMEOUT)).expect("timeout");
        stream.write_all(&upgrade_request(SAMPLE_KEY)).expect("send upgrade");
        let response = read_http_head(&mut stream);
        assert!(
            response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "unexpected response: {response:?}"
        );
        assert!(
            response.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n")),
            "missing accept token: {response:?}"
        );
        Self {
            stream,
            mask: [0x37, 0xfa, 0x21, 0x3d],
        }
    }

    /// Sends a masked frame.
    pub fn send(&mut self, payload: &[u8], opcode: Opcode) {
        self.stream
            .write_all(&encode_masked(payload, opcode, self.mask))
            .expect("send frame");
    }

    /// Sends a masked text frame.
    pub fn send_text(&mut self, text: &str) {
        self.send(text.as_bytes(), Opcode::Text);
    }

    /// Reads one frame.
    pub fn recv(&mut self) -> Decoded {
        decode(&mut self.stream)
    }

    /// Reads one frame and expects text.
    pub fn recv_text(&mut self) -> String {
        match self.recv() {
            Decoded::Frame(Frame {
                opcode: Opcode::Text,
                payload,
                ..
            }) => String::from_utf8(payload).expect("utf-8 payload"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Asserts nothing arrives within `wait`.
    pub fn expect_silence(&mut self, wait: Duration) {
        self.stream.set_read_timeout(Some(wait)).expect("timeout");
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            other => panic!("expected silence, got {other:?}"),
        }
        self.stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .expect("timeout");
    }

    /// The underlying socket.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// A browser-style upgrade request.
#[must_use]
pub fn upgrade_request(key: &str) -> Vec<u8> {
    format!(
        "GET /chat HTTP/1.1\r\n\
         Host: server.example.com\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Origin: http://example.com\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
    .into_bytes()
}

/// Reads an HTTP response head byte by byte so no frame bytes are consumed.
pub fn read_http_head(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => break,
            Ok(_) => data.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Accept token for `key`, for tests that use their own keys.
#[must_use]
pub fn accept_for(key: &str) -> String {
    compute_accept_key(key)
}
