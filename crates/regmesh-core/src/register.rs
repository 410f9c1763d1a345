//! Named registers, the unit of remote state exchange.
//!
//! A register is a short byte-string name paired with a byte-string value,
//! both packed into one buffer sized to what a single frame can carry.
//! Nodes publish registers; peers read and write them by name from
//! anywhere on the mesh.
//!
//! A register can also carry an error message in place of its value (the
//! error flag). Responders use this to hand a rejection reason back to a
//! writer, and requesters find the reason in their operation register when
//! a set fails. The name always survives; only the value region is
//! repurposed.

use crate::error::MeshError;
use std::fmt;

/// Most bytes one frame can carry of combined name and value.
pub const MAX_REGISTER_DATA: usize = 57;

/// Verdict from a register's set callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Copy the proposed value into the register verbatim
    Accept,
    /// Refuse the write; the rejection reason travels via the error flag
    Reject,
}

/// Invoked when a remote node writes this register. Receives the register
/// and the proposed value; may store a rejection reason with
/// [`Register::set_error`] before returning [`SetOutcome::Reject`].
pub type SetCallback = Box<dyn FnMut(&mut Register, &[u8]) -> SetOutcome + Send>;

/// Invoked just before this register's value is served to a remote
/// reader, so lazily computed values can be refreshed in place.
pub type GetCallback = Box<dyn FnMut(&mut Register) + Send>;

/// A named value servable over the mesh.
pub struct Register {
    data: [u8; MAX_REGISTER_DATA],
    name_len: u8,
    value_len: u8,
    error: bool,
    set_callback: Option<SetCallback>,
    get_callback: Option<GetCallback>,
}

impl Register {
    /// An empty, unnamed register.
    pub fn new() -> Self {
        Self {
            data: [0; MAX_REGISTER_DATA],
            name_len: 0,
            value_len: 0,
            error: false,
            set_callback: None,
            get_callback: None,
        }
    }

    /// A register with a name and no value.
    pub fn named(name: &str) -> Result<Self, MeshError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_REGISTER_DATA {
            return Err(MeshError::InvalidRegisterName);
        }
        let mut reg = Self::new();
        reg.data[..bytes.len()].copy_from_slice(bytes);
        reg.name_len = bytes.len() as u8;
        Ok(reg)
    }

    /// A register with a name and an initial value.
    pub fn with_value(name: &str, value: &[u8]) -> Result<Self, MeshError> {
        let mut reg = Self::named(name)?;
        reg.set_value(value)?;
        Ok(reg)
    }

    /// Attach a set callback. Builder style, for registration time.
    pub fn on_set(mut self, callback: SetCallback) -> Self {
        self.set_callback = Some(callback);
        self
    }

    /// Attach a get callback. Builder style, for registration time.
    pub fn on_get(mut self, callback: GetCallback) -> Self {
        self.get_callback = Some(callback);
        self
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.data[..self.name_len as usize]
    }

    /// Register name as UTF-8, if it is valid UTF-8.
    pub fn name_str(&self) -> Option<&str> {
        std::str::from_utf8(self.name_bytes()).ok()
    }

    /// Current value. Empty while the error flag is set.
    pub fn value_bytes(&self) -> &[u8] {
        if self.error {
            return &[];
        }
        &self.data[self.name_len as usize..(self.name_len + self.value_len) as usize]
    }

    /// Current value as UTF-8, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(self.value_bytes()).ok()
    }

    /// Replace the value. Clears any pending error. Fails if the name and
    /// new value together exceed the frame budget.
    pub fn set_value(&mut self, value: &[u8]) -> Result<(), MeshError> {
        if self.name_len as usize + value.len() > MAX_REGISTER_DATA {
            return Err(MeshError::RegisterTooLarge);
        }
        self.error = false;
        let start = self.name_len as usize;
        self.data[start..start + value.len()].copy_from_slice(value);
        self.value_len = value.len() as u8;
        Ok(())
    }

    pub fn set_value_str(&mut self, value: &str) -> Result<(), MeshError> {
        self.set_value(value.as_bytes())
    }

    /// Store an error message in the value region and raise the error
    /// flag. The message is truncated to the space left after the name.
    pub fn set_error(&mut self, message: &str) {
        let room = MAX_REGISTER_DATA - self.name_len as usize;
        let bytes = message.as_bytes();
        let len = bytes.len().min(room);
        let start = self.name_len as usize;
        self.data[start..start + len].copy_from_slice(&bytes[..len]);
        self.value_len = len as u8;
        self.error = true;
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// The stored error message bytes. Empty unless the flag is set.
    pub fn error_bytes(&self) -> &[u8] {
        if !self.error {
            return &[];
        }
        &self.data[self.name_len as usize..(self.name_len + self.value_len) as usize]
    }

    /// The stored error message, if it is valid UTF-8.
    pub fn error_str(&self) -> Option<&str> {
        if !self.error {
            return None;
        }
        std::str::from_utf8(self.error_bytes()).ok()
    }

    /// Drop the error flag and the message occupying the value region.
    pub fn clear_error(&mut self) {
        if self.error {
            self.error = false;
            self.value_len = 0;
        }
    }

    /// Wipe name, value and error state. Callbacks are kept.
    pub fn reset(&mut self) {
        self.name_len = 0;
        self.value_len = 0;
        self.error = false;
    }

    /// Copy of the visible state (name, value, error) without callbacks.
    pub fn snapshot(&self) -> Register {
        Register {
            data: self.data,
            name_len: self.name_len,
            value_len: self.value_len,
            error: self.error,
            set_callback: None,
            get_callback: None,
        }
    }

    /// Run the get callback, if any, letting it refresh the value.
    pub fn invoke_get_callback(&mut self) {
        if let Some(mut cb) = self.get_callback.take() {
            cb(self);
            self.get_callback = Some(cb);
        }
    }

    /// Run the set callback against a proposed value. A register without
    /// a callback accepts every write.
    pub fn invoke_set_callback(&mut self, proposed: &[u8]) -> SetOutcome {
        match self.set_callback.take() {
            Some(mut cb) => {
                let outcome = cb(self, proposed);
                self.set_callback = Some(cb);
                outcome
            }
            None => SetOutcome::Accept,
        }
    }

    /// Overwrite name and value from decoded wire bytes. Bounds must have
    /// been checked by the codec.
    pub(crate) fn load_from_wire(&mut self, name: &[u8], value: &[u8]) {
        self.error = false;
        self.data[..name.len()].copy_from_slice(name);
        self.data[name.len()..name.len() + value.len()].copy_from_slice(value);
        self.name_len = name.len() as u8;
        self.value_len = value.len() as u8;
    }

    pub(crate) fn clear_lengths(&mut self) {
        self.name_len = 0;
        self.value_len = 0;
    }
}

impl Default for Register {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares visible state only; callbacks do not participate.
impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        self.error == other.error
            && self.name_bytes() == other.name_bytes()
            && self.data[self.name_len as usize..(self.name_len + self.value_len) as usize]
                == other.data[other.name_len as usize..(other.name_len + other.value_len) as usize]
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Register");
        s.field("name", &String::from_utf8_lossy(self.name_bytes()));
        if self.error {
            s.field("error", &String::from_utf8_lossy(self.error_bytes()));
        } else {
            s.field("value", &self.value_bytes());
        }
        s.field("set_callback", &self.set_callback.is_some());
        s.field("get_callback", &self.get_callback.is_some());
        s.finish()
    }
}
