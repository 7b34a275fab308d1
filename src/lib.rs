//! # Serial streaming link driver
//!
//! Protocol driver for a family of UART-bridged acquisition boards that
//! stream fixed-layout binary frames. The driver finds the board on an
//! unknown serial port, validates it with a one-byte handshake, opens the
//! data connection and decodes the stream into typed samples that are
//! fanned out to registered consumers, with a running estimate of the
//! effective sample rate.
//!
//! Two board variants share the design and differ only in payload layout:
//!
//! - [`TriAxis`]: accelerometer board, three 16-bit big-endian signed
//!   fields per frame, scaled to g.
//! - [`SingleChannel`]: DAC/ADC board, one 16-bit big-endian unsigned
//!   field per frame, scaled to volts in \[0, 5.0\].
//!
//! ## Crate structure
//!
//! - **`link`**: [`SerialLink`], the session object — discovery,
//!   connection, streaming lifecycle and callback fan-out.
//! - **`frame`**: the header/payload/tail decoding state machine.
//! - **`sample`**: payload-to-sample conversion for both variants.
//! - **`protocol`**: wire constants and the setting-command lookup tables.
//! - **`rate`**: incremental sample-rate estimation.
//! - **`serial`**: transport abstraction; real ports live behind the
//!   `serial-hardware` feature, tests run over in-memory duplex streams.
//! - **`observable`**: watch-backed change notification for connection
//!   state, status text and sample rate.
//! - **`config`** / **`error`**: tunables and the error taxonomy.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use daq_link::{LinkConfig, SerialLink, SingleChannel};
//! use std::sync::Arc;
//!
//! let link = SerialLink::<SingleChannel>::with_system_ports(LinkConfig::default());
//! link.register_callback(Arc::new(|volts| println!("{volts:.3} V")));
//! link.spawn_discovery();
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod observable;
pub mod protocol;
pub mod rate;
pub mod sample;
pub mod serial;

pub use config::{LinkConfig, ReconnectPolicy};
pub use error::LinkError;
pub use link::{ConnectionState, SampleCallback, SerialLink};
pub use sample::{AccelSample, SampleFormat, SingleChannel, TriAxis};
