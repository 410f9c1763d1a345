//! Simulated air for testing without hardware.
//!
//! [`SharedAir`] is a broadcast medium connecting any number of
//! [`SimRadio`]s. A transmitted frame is copied into the receive queue of
//! every other radio configured with the same mesh id and channel, with
//! optional seeded random loss so tests can exercise the repeat caches
//! deterministically.
//!
//! Transmissions complete instantly and there are no collisions; the
//! protocol has to survive loss either way, and loss is the part a test
//! can control.

use crate::packet::PACKET_SIZE;
use crate::radio::{DataRate, Radio, RadioConfig, RadioError, RxStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Delivery counters for the medium as a whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct AirStats {
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

struct RadioSlot {
    mesh_id: u32,
    channel: u8,
    listening: bool,
    queue: VecDeque<[u8; PACKET_SIZE]>,
}

struct AirInner {
    slots: Vec<RadioSlot>,
    loss_permille: u16,
    rng_state: u64,
    stats: AirStats,
}

impl AirInner {
    /// Whether to drop the next delivery. Simple LCG for reproducibility.
    fn roll_loss(&mut self) -> bool {
        if self.loss_permille == 0 {
            return false;
        }
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        ((self.rng_state >> 33) % 1000) < self.loss_permille as u64
    }
}

/// A shared broadcast medium.
///
/// Cloning is cheap and every clone refers to the same air.
#[derive(Clone)]
pub struct SharedAir {
    inner: Arc<Mutex<AirInner>>,
}

impl SharedAir {
    pub fn new() -> Self {
        Self::with_loss(0, 0)
    }

    /// An air that drops `loss_permille` out of every 1000 deliveries,
    /// chosen by a seeded generator so runs are repeatable.
    pub fn with_loss(loss_permille: u16, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AirInner {
                slots: Vec::new(),
                loss_permille,
                rng_state: seed,
                stats: AirStats::default(),
            })),
        }
    }

    /// Attach a new radio to this air.
    pub fn attach(&self) -> SimRadio {
        let mut air = lock(&self.inner);
        air.slots.push(RadioSlot {
            mesh_id: 0,
            channel: 0,
            listening: false,
            queue: VecDeque::new(),
        });
        SimRadio {
            air: Arc::clone(&self.inner),
            index: air.slots.len() - 1,
            data_rate: DataRate::default(),
            initialized: false,
        }
    }

    pub fn stats(&self) -> AirStats {
        lock(&self.inner).stats
    }
}

impl Default for SharedAir {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(inner: &Arc<Mutex<AirInner>>) -> MutexGuard<'_, AirInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One radio on a [`SharedAir`].
pub struct SimRadio {
    air: Arc<Mutex<AirInner>>,
    index: usize,
    data_rate: DataRate,
    initialized: bool,
}

impl Radio for SimRadio {
    fn initialize(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        config.validate()?;
        let mut air = lock(&self.air);
        let slot = &mut air.slots[self.index];
        slot.mesh_id = config.mesh_id;
        slot.channel = config.channel;
        self.data_rate = config.data_rate;
        self.initialized = true;
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        if !self.initialized {
            return Err(RadioError::Tx("radio not initialized".to_string()));
        }
        if frame.len() != PACKET_SIZE {
            return Err(RadioError::Tx(format!(
                "frame must be {} bytes, got {}",
                PACKET_SIZE,
                frame.len()
            )));
        }

        let mut air = lock(&self.air);
        let inner = &mut *air;
        inner.stats.frames_sent += 1;
        let mesh_id = inner.slots[self.index].mesh_id;
        let channel = inner.slots[self.index].channel;

        for i in 0..inner.slots.len() {
            if i == self.index {
                continue;
            }
            if inner.slots[i].mesh_id != mesh_id || inner.slots[i].channel != channel {
                continue;
            }
            if !inner.slots[i].listening || inner.roll_loss() {
                inner.stats.frames_dropped += 1;
                continue;
            }
            let mut buf = [0u8; PACKET_SIZE];
            buf.copy_from_slice(frame);
            inner.slots[i].queue.push_back(buf);
            inner.stats.frames_delivered += 1;
        }
        Ok(())
    }

    fn tx_finished(&mut self) -> bool {
        true
    }

    fn check_rx_waiting(&mut self) -> RxStatus {
        let air = lock(&self.air);
        if air.slots[self.index].queue.is_empty() {
            RxStatus::NoData
        } else {
            RxStatus::DataWaiting
        }
    }

    fn read(&mut self, frame: &mut [u8]) -> Result<(), RadioError> {
        if frame.len() < PACKET_SIZE {
            return Err(RadioError::Rx("read buffer too small".to_string()));
        }
        let mut air = lock(&self.air);
        let slot = &mut air.slots[self.index];
        match slot.queue.pop_front() {
            Some(buf) => {
                frame[..PACKET_SIZE].copy_from_slice(&buf);
                slot.listening = false;
                Ok(())
            }
            None => Err(RadioError::Rx("no frame waiting".to_string())),
        }
    }

    fn listen(&mut self, _frame_len: usize) {
        let mut air = lock(&self.air);
        air.slots[self.index].listening = true;
    }

    fn data_rate(&self) -> DataRate {
        self.data_rate
    }
}
