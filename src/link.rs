//! Streaming session and port discovery.
//!
//! [`SerialLink`] is the single owner of the device connection: it finds
//! the device on an unknown port, validates it with a handshake, opens the
//! data connection and runs the decode loop that turns the byte stream
//! into samples. Exactly one link per device is expected per process; the
//! link is cheaply cloneable (all clones share one session) so it can be
//! handed to UI code, background tasks and tests alike.
//!
//! Concurrency model: discovery and the decode loop each run on their own
//! tokio task. The transport handle lives in a `Mutex<Option<DynSerial>>`
//! locked per frame by the decode loop, so command writes interleave
//! between frames and nothing ever touches the port from two tasks at
//! once. Connection state, status text and sample rate cross task
//! boundaries only through watch-backed [`Observable`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{LinkConfig, ReconnectPolicy};
use crate::error::LinkError;
use crate::frame::FrameDecoder;
use crate::observable::Observable;
use crate::protocol::{
    OutputDataRate, OutputRange, WaveShape, HANDSHAKE_MARKER, PROBE_CMD, START_STREAMING_CMD,
    STOP_STREAMING_CMD,
};
use crate::rate::RateEstimator;
use crate::sample::{SampleFormat, SingleChannel, TriAxis};
use crate::serial::{read_buffered, DynSerial, PortProvider};

/// Externally observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No device attached.
    #[default]
    Disconnected,
    /// An endpoint answered the handshake; data connection not yet open.
    Candidate,
    /// Data connection open and owned by the session.
    Connected,
}

/// Consumer callback invoked once per decoded sample, synchronously, in
/// registration order.
pub type SampleCallback<S> = Arc<dyn Fn(S) + Send + Sync>;

struct LinkShared<F: SampleFormat> {
    config: LinkConfig,
    ports: Arc<dyn PortProvider>,
    /// Owned transport; `None` whenever no session holds a connection.
    port: tokio::sync::Mutex<Option<DynSerial>>,
    endpoint: parking_lot::RwLock<Option<String>>,
    connection_state: Observable<ConnectionState>,
    status: Observable<String>,
    sample_rate: Observable<f64>,
    streaming: AtomicBool,
    callbacks: parking_lot::RwLock<Vec<SampleCallback<F::Sample>>>,
}

/// Serial streaming link for one device variant.
///
/// The type parameter selects the payload layout: [`TriAxis`] for the
/// accelerometer board, [`SingleChannel`] for the DAC/ADC board.
///
/// # Example
///
/// ```rust,ignore
/// use daq_link::{LinkConfig, SerialLink, TriAxis};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), daq_link::LinkError> {
///     let link = SerialLink::<TriAxis>::with_system_ports(LinkConfig::default());
///     link.register_callback(Arc::new(|sample| {
///         println!("x={} y={} z={}", sample.x, sample.y, sample.z);
///     }));
///
///     link.discover().await?;
///     link.start_streaming().await;
///     Ok(())
/// }
/// ```
pub struct SerialLink<F: SampleFormat> {
    shared: Arc<LinkShared<F>>,
}

impl<F: SampleFormat> Clone for SerialLink<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: SampleFormat> SerialLink<F> {
    /// Create a link over the given port provider.
    pub fn new(config: LinkConfig, ports: Arc<dyn PortProvider>) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                config,
                ports,
                port: tokio::sync::Mutex::new(None),
                endpoint: parking_lot::RwLock::new(None),
                connection_state: Observable::new(ConnectionState::Disconnected),
                status: Observable::new(String::new()),
                sample_rate: Observable::new(0.0),
                streaming: AtomicBool::new(false),
                callbacks: parking_lot::RwLock::new(Vec::new()),
            }),
        }
    }

    /// Create a link over the host's real serial ports.
    #[cfg(feature = "serial-hardware")]
    pub fn with_system_ports(config: LinkConfig) -> Self {
        Self::new(config, Arc::new(crate::serial::SystemPorts))
    }

    // -------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------

    /// Scan all candidate ports until the device is found and connected.
    ///
    /// Runs until a probe validates an endpoint and the data connection
    /// opens, backing off between enumeration passes while no ports exist.
    /// When the connect attempt after a successful probe fails, behavior
    /// follows [`ReconnectPolicy`]: `Manual` returns the error, `Retry`
    /// resumes scanning. Probe failures of individual ports are never
    /// errors; the scan simply moves on.
    pub async fn discover(&self) -> Result<String, LinkError> {
        let s = &self.shared;
        if !s.config.discovery_delay.is_zero() {
            tokio::time::sleep(s.config.discovery_delay).await;
        }

        loop {
            let candidates = s.ports.list_ports();
            if candidates.is_empty() {
                s.status
                    .set("No ports found; check your connections".to_string());
                tokio::time::sleep(s.config.enumerate_backoff).await;
                continue;
            }

            for endpoint in candidates {
                if !self.probe(&endpoint).await {
                    continue;
                }

                info!(%endpoint, "device answered handshake");
                s.status.set(format!("Device found on port {endpoint}"));
                s.connection_state.set(ConnectionState::Candidate);
                *s.endpoint.write() = Some(endpoint.clone());

                match self.connect().await {
                    Ok(()) => return Ok(endpoint),
                    Err(e) => match s.config.reconnect {
                        ReconnectPolicy::Manual => return Err(e),
                        ReconnectPolicy::Retry => {
                            warn!(%endpoint, error = %e, "connect failed, resuming discovery");
                        }
                    },
                }
            }
        }
    }

    /// Run [`discover`](Self::discover) on its own task.
    pub fn spawn_discovery(&self) -> tokio::task::JoinHandle<Result<String, LinkError>> {
        let link = self.clone();
        tokio::spawn(async move { link.discover().await })
    }

    /// Check whether `endpoint` hosts the expected device.
    ///
    /// Sends the probe command, waits out the settle period (the firmware
    /// needs it to boot and reply), drains whatever arrived and looks for
    /// the handshake marker in the leniently decoded response. The probe
    /// handle is dropped on every path, so a failed probe never leaks a
    /// descriptor.
    async fn probe(&self, endpoint: &str) -> bool {
        let s = &self.shared;
        s.status.set(format!("Checking {endpoint}"));

        let mut port = match s.ports.open(endpoint, s.config.baud_rate).await {
            Ok(port) => port,
            Err(e) => {
                debug!(%endpoint, error = %e, "probe open failed");
                return false;
            }
        };

        if let Err(e) = port.write_all(&[PROBE_CMD]).await {
            debug!(%endpoint, error = %e, "probe write failed");
            return false;
        }
        let _ = port.flush().await;

        tokio::time::sleep(s.config.probe_settle).await;

        let response = read_buffered(&mut port, s.config.probe_drain_window).await;
        let text = String::from_utf8_lossy(&response);
        log::debug!("probe response from {endpoint}: {text:?}");
        text.contains(HANDSHAKE_MARKER)
    }

    // -------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------

    /// Open the data connection to the previously discovered endpoint.
    ///
    /// On success the link owns the transport handle until stop,
    /// disconnect or failure; the handle is never reused across
    /// reconnects. On failure the status text carries the reason and the
    /// connection state is left where it was.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let s = &self.shared;
        let endpoint = s.endpoint.read().clone().ok_or(LinkError::NoEndpoint)?;

        match s.ports.open(&endpoint, s.config.baud_rate).await {
            Ok(port) => {
                *s.port.lock().await = Some(port);
                s.connection_state.set(ConnectionState::Connected);
                s.status.set(format!("Device connected at {endpoint}"));
                info!(%endpoint, "data connection open");
                Ok(())
            }
            Err(e) => {
                s.status.set(format!("Error opening port {endpoint}: {e}"));
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------

    /// Begin streaming samples.
    ///
    /// Writes the start command, resets the decoder and rate estimator and
    /// launches the decode loop on its own task. A no-op (beyond a status
    /// message) when already streaming; sets status and performs no I/O
    /// when not connected.
    pub async fn start_streaming(&self) {
        let s = &self.shared;

        if s.connection_state.get() != ConnectionState::Connected {
            s.status.set("Device is not connected".to_string());
            return;
        }
        if s.streaming.swap(true, Ordering::SeqCst) {
            s.status.set("Already streaming".to_string());
            return;
        }

        if let Err(e) = self.write_command(START_STREAMING_CMD).await {
            s.streaming.store(false, Ordering::SeqCst);
            s.status.set(format!("Could not start streaming: {e}"));
            return;
        }

        s.status.set("Starting data streaming".to_string());
        s.sample_rate.set(0.0);

        let link = self.clone();
        tokio::spawn(async move { link.decode_loop().await });
    }

    /// Stop streaming.
    ///
    /// Flips the streaming flag (the decode loop checks it at the top of
    /// every iteration, so stop latency is bounded by one read timeout)
    /// and writes the stop command. Safe to call repeatedly.
    pub async fn stop_streaming(&self) {
        let s = &self.shared;
        s.streaming.store(false, Ordering::SeqCst);

        if let Err(e) = self.write_command(STOP_STREAMING_CMD).await {
            debug!(error = %e, "stop command not delivered");
        }
        s.status.set("Stopped streaming data".to_string());
    }

    /// Decode loop: one frame per iteration until stopped or the stream
    /// fails. Decoder state and the rate estimator are scoped to this
    /// session and die with it.
    async fn decode_loop(self) {
        let s = &self.shared;
        let mut decoder = FrameDecoder::<F>::new(s.config.max_skip_bytes, s.config.read_timeout);
        let mut rate = RateEstimator::new();

        while s.streaming.load(Ordering::SeqCst) {
            let mut guard = s.port.lock().await;
            let Some(port) = guard.as_mut() else {
                break;
            };

            match decoder.next_frame(port).await {
                Ok(Some(sample)) => {
                    drop(guard);
                    self.dispatch(sample);
                    if let Some(estimate) = rate.record_arrival() {
                        s.sample_rate.set(estimate);
                        if rate.samples() > 2 {
                            s.status.set(format!(
                                "Samples: {:6} | Sample rate: {:.2} Hz",
                                rate.samples(),
                                estimate
                            ));
                        }
                    }
                }
                Ok(None) => {
                    // Malformed frame discarded or resync budget spent;
                    // nothing to emit this iteration.
                }
                Err(e) => {
                    if !s.streaming.load(Ordering::SeqCst) {
                        // The user stopped the session while this read was
                        // in flight; the expiry is not a device fault.
                        debug!(error = %e, "read ended after stop request");
                        break;
                    }
                    // Terminal for the session: discard the handle, it is
                    // never reused.
                    *guard = None;
                    drop(guard);
                    s.streaming.store(false, Ordering::SeqCst);
                    s.connection_state.set(ConnectionState::Disconnected);
                    s.status.set("Device disconnected".to_string());
                    warn!(error = %e, "streaming read failed, session closed");
                    break;
                }
            }
        }
        debug!("decode loop exited");
    }

    fn dispatch(&self, sample: F::Sample) {
        let callbacks = self.shared.callbacks.read().clone();
        for callback in &callbacks {
            callback(sample);
        }
    }

    /// Register a consumer for decoded samples.
    ///
    /// Callbacks are invoked synchronously from the decode loop in
    /// registration order. Registering the same callback (by `Arc`
    /// identity) twice has no additional effect; callbacks are never
    /// removed automatically.
    pub fn register_callback(&self, callback: SampleCallback<F::Sample>) {
        let mut callbacks = self.shared.callbacks.write();
        if !callbacks.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            callbacks.push(callback);
        }
    }

    // -------------------------------------------------------------------
    // Observables and accessors
    // -------------------------------------------------------------------

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state.get()
    }

    /// Subscribe to connection-state changes.
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection_state.subscribe()
    }

    /// Latest human-readable status line. Overwritten on every significant
    /// event; no history is kept.
    pub fn status(&self) -> String {
        self.shared.status.get()
    }

    /// Subscribe to status-line changes.
    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.shared.status.subscribe()
    }

    /// Latest sample-rate estimate in Hz, 0.0 until streaming has produced
    /// at least two samples.
    pub fn sample_rate(&self) -> f64 {
        self.shared.sample_rate.get()
    }

    /// Subscribe to sample-rate updates.
    pub fn subscribe_sample_rate(&self) -> watch::Receiver<f64> {
        self.shared.sample_rate.subscribe()
    }

    /// Whether the data connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Whether the decode loop is (or is about to be) running.
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    /// Endpoint selected by discovery, if any.
    pub fn endpoint(&self) -> Option<String> {
        self.shared.endpoint.read().clone()
    }

    // -------------------------------------------------------------------
    // Command plumbing
    // -------------------------------------------------------------------

    async fn write_command(&self, byte: u8) -> Result<(), LinkError> {
        let mut guard = self.shared.port.lock().await;
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(&[byte]).await?;
        port.flush().await?;
        Ok(())
    }

    async fn apply_setting(&self, byte: u8, label: &str) {
        match self.write_command(byte).await {
            Ok(()) => debug!(%label, command = %(byte as char), "setting applied"),
            Err(e) => self
                .shared
                .status
                .set(format!("Could not apply {label}: {e}")),
        }
    }
}

impl SerialLink<TriAxis> {
    /// Select the accelerometer's output data rate from its human-readable
    /// label ("1 Hz" through "200 Hz").
    ///
    /// An unrecognized label sets the status text and performs no I/O.
    pub async fn select_output_data_rate(&self, label: &str) {
        match label.parse::<OutputDataRate>() {
            Ok(odr) => self.apply_setting(odr.command_byte(), odr.label()).await,
            Err(e) => self.shared.status.set(e.to_string()),
        }
    }
}

impl SerialLink<SingleChannel> {
    /// Select the DAC waveform ("sine" or "triangle").
    ///
    /// An unrecognized label sets the status text and performs no I/O.
    pub async fn select_wave_shape(&self, label: &str) {
        match label.parse::<WaveShape>() {
            Ok(shape) => self.apply_setting(shape.command_byte(), shape.label()).await,
            Err(e) => self.shared.status.set(e.to_string()),
        }
    }

    /// Select the DAC output range ("small" or "large").
    ///
    /// An unrecognized label sets the status text and performs no I/O.
    pub async fn select_output_range(&self, label: &str) {
        match label.parse::<OutputRange>() {
            Ok(range) => self.apply_setting(range.command_byte(), range.label()).await,
            Err(e) => self.shared.status.set(e.to_string()),
        }
    }
}
