//! Radio transport abstraction.
//!
//! The mesh engine drives any half-duplex packet radio that can be polled:
//! no interrupts, no timers, no background threads. Implementations decide
//! how frames actually move (hardware FIFO, simulated air, recorded trace);
//! the engine only ever sees the [`Radio`] trait.
//!
//! The contract is deliberately narrow:
//!
//! - `write` starts a transmission; the engine busy-polls `tx_finished`
//!   until it completes and then re-arms receive with `listen`
//! - `check_rx_waiting` is cheap and called once per engine poll
//! - `read` hands back exactly one fixed-size frame
//!
//! There is no carrier-sense or collision-detect hook. Lost frames are
//! expected and recovered by the engine's repeat caches.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Highest valid RF channel index.
pub const MAX_CHANNEL: u8 = 0xA8;

/// Radio transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Hardware bring-up failed
    #[error("radio initialization failed: {0}")]
    Init(String),

    /// Oscillator or filter-bank calibration did not converge
    #[error("radio calibration failed")]
    Calibration,

    /// Channel index outside the supported band plan
    #[error("invalid channel 0x{0:02X} (valid range 0x00-0xA8)")]
    InvalidChannel(u8),

    /// Transmit path failure
    #[error("transmit failed: {0}")]
    Tx(String),

    /// Receive path failure
    #[error("receive failed: {0}")]
    Rx(String),
}

/// Result of polling the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// Nothing received since the last poll
    NoData,
    /// A complete frame is ready to `read`
    DataWaiting,
    /// The receiver faulted and needs to be re-armed with `listen`
    Error,
}

/// On-air data rate.
///
/// Slower rates trade throughput for range. The engine scales its repeat
/// pacing by the configured rate so a slow link is not saturated by
/// relay traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRate {
    Bps2k,
    Bps10k,
    Bps25k,
    Bps50k,
    Bps100k,
    Bps125k,
    Bps250k,
}

impl DataRate {
    /// Nominal bits per second.
    pub fn bps(&self) -> u32 {
        match self {
            DataRate::Bps2k => 2_000,
            DataRate::Bps10k => 10_000,
            DataRate::Bps25k => 25_000,
            DataRate::Bps50k => 50_000,
            DataRate::Bps100k => 100_000,
            DataRate::Bps125k => 125_000,
            DataRate::Bps250k => 250_000,
        }
    }

    /// Rough time on air for a payload of `bytes`, preamble excluded.
    pub fn airtime(&self, bytes: usize) -> Duration {
        let bits = bytes as u64 * 8;
        Duration::from_micros(bits * 1_000_000 / self.bps() as u64)
    }
}

impl Default for DataRate {
    fn default() -> Self {
        DataRate::Bps250k
    }
}

/// Physical-layer parameters handed to [`Radio::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Mesh identifier; radios only exchange frames within one mesh id
    pub mesh_id: u32,
    /// RF channel index, 0x00 through [`MAX_CHANNEL`]
    pub channel: u8,
    /// On-air data rate
    pub data_rate: DataRate,
    /// Transmit power in dBm, implementation defined granularity
    pub tx_power_dbm: i8,
    /// Append and check a hardware frame CRC
    pub crc: bool,
    /// Enable forward error correction where the hardware supports it
    pub fec: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            mesh_id: 0xA7105,
            channel: 0x50,
            data_rate: DataRate::default(),
            tx_power_dbm: 0,
            crc: true,
            fec: true,
        }
    }
}

impl RadioConfig {
    /// Validate the channel against the band plan.
    pub fn validate(&self) -> Result<(), RadioError> {
        if self.channel > MAX_CHANNEL {
            return Err(RadioError::InvalidChannel(self.channel));
        }
        Ok(())
    }
}

/// A polled, half-duplex packet radio.
///
/// All methods are non-blocking except `write`, which may block until the
/// frame has been handed to the hardware (not until it is on the air; the
/// engine polls `tx_finished` for that).
pub trait Radio {
    /// Bring the hardware up with the given parameters.
    ///
    /// Called once before any other method. Implementations should
    /// validate the config and perform any calibration here.
    fn initialize(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    /// Queue one frame for transmission. Leaves the radio in TX state.
    fn write(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    /// Whether the in-flight transmission has completed.
    fn tx_finished(&mut self) -> bool;

    /// Poll the receive path.
    fn check_rx_waiting(&mut self) -> RxStatus;

    /// Copy the waiting frame into `frame`. Only valid after
    /// `check_rx_waiting` returned [`RxStatus::DataWaiting`].
    fn read(&mut self, frame: &mut [u8]) -> Result<(), RadioError>;

    /// Arm the receiver for the next frame of `frame_len` bytes.
    fn listen(&mut self, frame_len: usize);

    /// The configured on-air data rate.
    fn data_rate(&self) -> DataRate;
}
