//! End-to-end tests for the serial link: discovery, handshake, streaming,
//! disconnect handling and setting commands, all driven over in-memory
//! duplex streams against a scripted board emulation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio_test::assert_ok;

use daq_link::serial::{DynSerial, PortProvider};
use daq_link::{
    AccelSample, ConnectionState, LinkConfig, LinkError, ReconnectPolicy, SerialLink,
    SingleChannel, TriAxis,
};

const ACCEL_FRAME: [u8; 8] = [0xA0, 0x00, 0x40, 0x00, 0x40, 0x00, 0x40, 0xC0];
const VOLT_FRAME: [u8; 4] = [0xA0, 0xFF, 0xFF, 0xC0];

/// Behavior of one emulated board.
#[derive(Clone)]
struct BoardSpec {
    /// Reply to the probe command.
    handshake: &'static [u8],
    /// Bytes written per burst once streaming starts.
    frames: Vec<u8>,
    /// Pause between bursts when repeating.
    frame_period: Duration,
    /// Keep bursting until the stop command arrives.
    repeat: bool,
    /// Drop the port after the first burst (simulates unplugging).
    close_after_stream: bool,
    /// Every open after the first one fails (probe succeeds, connect
    /// cannot).
    fail_reopen: bool,
}

impl Default for BoardSpec {
    fn default() -> Self {
        Self {
            handshake: b"$$$",
            frames: Vec::new(),
            frame_period: Duration::from_millis(2),
            repeat: true,
            close_after_stream: false,
            fail_reopen: false,
        }
    }
}

struct Board {
    spec: BoardSpec,
    received: Arc<Mutex<Vec<u8>>>,
    opens: AtomicUsize,
}

/// Scripted port provider: every open spawns a firmware task on the far
/// side of a fresh duplex stream.
struct TestPorts {
    boards: BTreeMap<String, Arc<Board>>,
    empty_scans: AtomicUsize,
}

impl TestPorts {
    fn new(boards: Vec<(&str, BoardSpec)>) -> Arc<Self> {
        Arc::new(Self {
            boards: boards
                .into_iter()
                .map(|(name, spec)| {
                    (
                        name.to_string(),
                        Arc::new(Board {
                            spec,
                            received: Arc::new(Mutex::new(Vec::new())),
                            opens: AtomicUsize::new(0),
                        }),
                    )
                })
                .collect(),
            empty_scans: AtomicUsize::new(0),
        })
    }

    fn with_empty_scans(self: Arc<Self>, scans: usize) -> Arc<Self> {
        self.empty_scans.store(scans, Ordering::SeqCst);
        self
    }

    fn received(&self, name: &str) -> Vec<u8> {
        self.boards[name].received.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortProvider for TestPorts {
    fn list_ports(&self) -> Vec<String> {
        if self.empty_scans.load(Ordering::SeqCst) > 0 {
            self.empty_scans.fetch_sub(1, Ordering::SeqCst);
            return Vec::new();
        }
        self.boards.keys().cloned().collect()
    }

    async fn open(&self, port: &str, _baud_rate: u32) -> Result<DynSerial, LinkError> {
        let board = self.boards.get(port).ok_or_else(|| LinkError::PortOpen {
            port: port.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;

        let opens = board.opens.fetch_add(1, Ordering::SeqCst);
        if board.spec.fail_reopen && opens >= 1 {
            return Err(LinkError::PortOpen {
                port: port.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }

        let (link_side, board_side) = tokio::io::duplex(1024);
        tokio::spawn(run_board(
            board_side,
            board.spec.clone(),
            board.received.clone(),
        ));
        Ok(Box::new(link_side))
    }
}

/// Firmware emulation: answers the probe, streams frames between the start
/// and stop commands, records every byte it receives.
async fn run_board(stream: DuplexStream, spec: BoardSpec, received: Arc<Mutex<Vec<u8>>>) {
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(tokio::sync::Mutex::new(Some(writer)));
    let streaming = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    loop {
        let mut byte = [0u8; 1];
        let read = tokio::select! {
            r = reader.read(&mut byte) => r,
            _ = shutdown.notified() => break,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        received.lock().unwrap().push(byte[0]);

        match byte[0] {
            b'v' => {
                if let Some(w) = writer.lock().await.as_mut() {
                    let _ = w.write_all(spec.handshake).await;
                }
            }
            b'b' => {
                streaming.store(true, Ordering::SeqCst);
                let writer = writer.clone();
                let streaming = streaming.clone();
                let shutdown = shutdown.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    loop {
                        {
                            let mut guard = writer.lock().await;
                            let Some(w) = guard.as_mut() else { break };
                            if !streaming.load(Ordering::SeqCst) {
                                break;
                            }
                            if w.write_all(&spec.frames).await.is_err() {
                                break;
                            }
                        }
                        if spec.close_after_stream {
                            writer.lock().await.take();
                            shutdown.notify_one();
                            break;
                        }
                        if !spec.repeat {
                            break;
                        }
                        tokio::time::sleep(spec.frame_period).await;
                    }
                });
            }
            b's' => streaming.store(false, Ordering::SeqCst),
            _ => {}
        }
    }
}

/// Config with timings scaled down for tests.
fn fast_config() -> LinkConfig {
    LinkConfig {
        probe_settle: Duration::from_millis(5),
        probe_drain_window: Duration::from_millis(20),
        enumerate_backoff: Duration::from_millis(10),
        read_timeout: Duration::from_millis(200),
        ..LinkConfig::default()
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn discovers_connects_and_streams_accelerometer() {
    let ports = TestPorts::new(vec![(
        "ttyACM0",
        BoardSpec {
            handshake: b"xx$$$yy",
            frames: ACCEL_FRAME.to_vec(),
            ..BoardSpec::default()
        },
    )]);
    let link = SerialLink::<TriAxis>::new(fast_config(), ports.clone());

    let samples: Arc<Mutex<Vec<AccelSample>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    link.register_callback(Arc::new(move |sample| {
        sink.lock().unwrap().push(sample);
    }));

    let endpoint = tokio_test::assert_ok!(link.discover().await);
    assert_eq!(endpoint, "ttyACM0");
    assert_eq!(link.connection_state(), ConnectionState::Connected);
    assert!(link.is_connected());
    assert_eq!(link.status(), "Device connected at ttyACM0");
    assert_eq!(link.endpoint().as_deref(), Some("ttyACM0"));

    link.start_streaming().await;
    assert!(link.is_streaming());

    wait_for("three samples", || samples.lock().unwrap().len() >= 3).await;
    for sample in samples.lock().unwrap().iter() {
        assert!((sample.x - 0.004).abs() < 1e-12);
        assert!((sample.y - 0.004).abs() < 1e-12);
        assert!((sample.z - 0.004).abs() < 1e-12);
    }
    assert!(link.sample_rate() > 0.0);

    link.stop_streaming().await;
    assert!(!link.is_streaming());
    assert_eq!(link.status(), "Stopped streaming data");
    // Stopping does not tear down the connection.
    assert_eq!(link.connection_state(), ConnectionState::Connected);

    // Stopping again is a no-op, not an error.
    link.stop_streaming().await;
    assert!(!link.is_streaming());
    assert_eq!(link.status(), "Stopped streaming data");
    assert_eq!(link.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn single_channel_stream_decodes_volts() -> anyhow::Result<()> {
    let ports = TestPorts::new(vec![(
        "ttyUSB0",
        BoardSpec {
            frames: VOLT_FRAME.to_vec(),
            ..BoardSpec::default()
        },
    )]);
    let link = SerialLink::<SingleChannel>::new(fast_config(), ports);

    let volts: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = volts.clone();
    link.register_callback(Arc::new(move |v| sink.lock().unwrap().push(v)));

    link.discover().await?;
    link.start_streaming().await;

    wait_for("two samples", || volts.lock().unwrap().len() >= 2).await;
    for v in volts.lock().unwrap().iter() {
        assert_eq!(*v, 5.0);
    }

    link.stop_streaming().await;
    Ok(())
}

#[tokio::test]
async fn probe_skips_ports_without_marker() {
    let ports = TestPorts::new(vec![
        (
            "ttyACM0",
            BoardSpec {
                handshake: b"xxxxx",
                ..BoardSpec::default()
            },
        ),
        (
            "ttyACM1",
            BoardSpec {
                frames: VOLT_FRAME.to_vec(),
                ..BoardSpec::default()
            },
        ),
    ]);
    let link = SerialLink::<SingleChannel>::new(fast_config(), ports.clone());

    let endpoint = link.discover().await.unwrap();
    assert_eq!(endpoint, "ttyACM1");

    // The rejected port only ever saw the probe command.
    assert_eq!(ports.received("ttyACM0"), vec![b'v']);
}

#[tokio::test]
async fn discovery_backs_off_while_no_ports_exist() {
    let ports = TestPorts::new(vec![(
        "ttyACM0",
        BoardSpec {
            frames: VOLT_FRAME.to_vec(),
            ..BoardSpec::default()
        },
    )])
    .with_empty_scans(2);
    let link = SerialLink::<SingleChannel>::new(fast_config(), ports);

    let mut status_rx = link.subscribe_status();
    let statuses: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = statuses.clone();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            log.lock().unwrap().push(status_rx.borrow().clone());
        }
    });

    link.discover().await.unwrap();
    assert!(link.is_connected());

    let statuses = statuses.lock().unwrap();
    assert!(
        statuses
            .iter()
            .any(|s| s == "No ports found; check your connections"),
        "missing backoff status, saw: {statuses:?}"
    );
}

#[tokio::test]
async fn device_unplug_mid_stream_forces_disconnect() {
    let ports = TestPorts::new(vec![(
        "ttyACM0",
        BoardSpec {
            frames: [ACCEL_FRAME, ACCEL_FRAME].concat(),
            close_after_stream: true,
            ..BoardSpec::default()
        },
    )]);
    let link = SerialLink::<TriAxis>::new(fast_config(), ports);

    let samples: Arc<Mutex<Vec<AccelSample>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    link.register_callback(Arc::new(move |sample| {
        sink.lock().unwrap().push(sample);
    }));

    link.discover().await.unwrap();
    link.start_streaming().await;

    wait_for("disconnect", || {
        link.connection_state() == ConnectionState::Disconnected
    })
    .await;
    assert!(!link.is_streaming());
    assert_eq!(link.status(), "Device disconnected");
    // Both complete frames were delivered before the stream died.
    assert_eq!(samples.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_breaking_the_stream() {
    let mut burst = Vec::new();
    burst.extend_from_slice(&VOLT_FRAME);
    burst.extend_from_slice(&[0xA0, 0x12, 0x34, 0xFF]); // bad tail, discarded
    burst.extend_from_slice(&[0xA0, 0x00, 0x00, 0xC0]);
    let ports = TestPorts::new(vec![(
        "ttyUSB0",
        BoardSpec {
            frames: burst,
            repeat: false,
            ..BoardSpec::default()
        },
    )]);
    // Generous read timeout: the board goes silent after its single burst
    // and that silence must not count as a disconnect before the test
    // stops the session.
    let link = SerialLink::<SingleChannel>::new(
        LinkConfig {
            read_timeout: Duration::from_secs(1),
            ..fast_config()
        },
        ports,
    );

    let volts: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = volts.clone();
    link.register_callback(Arc::new(move |v| sink.lock().unwrap().push(v)));

    link.discover().await.unwrap();
    link.start_streaming().await;

    wait_for("both valid samples", || volts.lock().unwrap().len() >= 2).await;
    assert_eq!(*volts.lock().unwrap(), vec![5.0, 0.0]);

    link.stop_streaming().await;
    // A framing error is not a disconnect.
    assert_eq!(link.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn start_streaming_twice_is_a_noop() {
    let ports = TestPorts::new(vec![(
        "ttyUSB0",
        BoardSpec {
            frames: VOLT_FRAME.to_vec(),
            ..BoardSpec::default()
        },
    )]);
    let link = SerialLink::<SingleChannel>::new(fast_config(), ports);

    link.discover().await.unwrap();
    link.start_streaming().await;
    assert!(link.is_streaming());

    link.start_streaming().await;
    assert!(link.is_streaming());
    assert_eq!(link.status(), "Already streaming");

    link.stop_streaming().await;
}

#[tokio::test]
async fn manual_policy_surfaces_connect_failure() {
    let ports = TestPorts::new(vec![(
        "ttyACM0",
        BoardSpec {
            fail_reopen: true,
            ..BoardSpec::default()
        },
    )]);
    let link = SerialLink::<TriAxis>::new(fast_config(), ports);

    let err = link.discover().await.unwrap_err();
    assert!(matches!(err, LinkError::PortOpen { .. }));
    // The handshake succeeded, so the endpoint is recorded and the state
    // stayed at Candidate.
    assert_eq!(link.connection_state(), ConnectionState::Candidate);
    assert_eq!(link.endpoint().as_deref(), Some("ttyACM0"));
}

#[tokio::test]
async fn retry_policy_resumes_discovery_after_connect_failure() {
    let ports = TestPorts::new(vec![
        (
            "ttyACM0",
            BoardSpec {
                fail_reopen: true,
                ..BoardSpec::default()
            },
        ),
        (
            "ttyACM1",
            BoardSpec {
                frames: ACCEL_FRAME.to_vec(),
                ..BoardSpec::default()
            },
        ),
    ]);
    let link = SerialLink::<TriAxis>::new(
        LinkConfig {
            reconnect: ReconnectPolicy::Retry,
            ..fast_config()
        },
        ports,
    );

    let endpoint = link.discover().await.unwrap();
    assert_eq!(endpoint, "ttyACM1");
    assert!(link.is_connected());
}

#[tokio::test]
async fn wave_and_range_settings_reach_the_board() -> anyhow::Result<()> {
    let ports = TestPorts::new(vec![("ttyUSB0", BoardSpec::default())]);
    let link = SerialLink::<SingleChannel>::new(fast_config(), ports.clone());

    link.discover().await?;

    link.select_wave_shape("Sine").await;
    link.select_output_range("large").await;
    wait_for("setting bytes", || {
        let seen = ports.received("ttyUSB0");
        seen.contains(&b'e') && seen.contains(&b'y')
    })
    .await;

    // Unknown labels are rejected before any I/O happens.
    let before = ports.received("ttyUSB0").len();
    link.select_wave_shape("square").await;
    assert_eq!(link.status(), "unrecognized wave shape: \"square\"");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ports.received("ttyUSB0").len(), before);
    Ok(())
}

#[tokio::test]
async fn output_data_rate_setting_reaches_the_board() {
    let ports = TestPorts::new(vec![("ttyACM0", BoardSpec::default())]);
    let link = SerialLink::<TriAxis>::new(fast_config(), ports.clone());

    link.discover().await.unwrap();

    link.select_output_data_rate("100 Hz").await;
    wait_for("rate byte", || ports.received("ttyACM0").contains(&b'3')).await;

    let before = ports.received("ttyACM0").len();
    link.select_output_data_rate("50 Hz").await;
    assert_eq!(link.status(), "unrecognized output data rate: \"50 Hz\"");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ports.received("ttyACM0").len(), before);
}
