//! Fixed 64-byte frame codec.
//!
//! Every frame on the air has the same shape:
//!
//! ```text
//! byte 0      packet type
//! byte 1      hop count (low nibble) | sequence number (high nibble)
//! byte 2      sender node id
//! bytes 3-4   sender unique id, big endian
//! bytes 5+    type-specific payload
//! ```
//!
//! The hop nibble is the only field a relay may change; everything else
//! travels verbatim, which is what makes duplicate detection a plain
//! byte comparison. Register payloads are length-prefixed strings packed
//! after the header; each type documents where its payload starts.

use crate::register::{Register, MAX_REGISTER_DATA};
use std::fmt;

/// Size of every frame on the air.
pub const PACKET_SIZE: usize = 64;

const OFF_TYPE: usize = 0;
const OFF_HOP_SEQ: usize = 1;
const OFF_SENDER: usize = 2;
const OFF_UNIQUE: usize = 3;
const OFF_TARGET: usize = 5;

/// Frame types.
///
/// `ConflictRegister` is reserved for a future duplicate-register
/// resolution scheme; it is parsed but never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Tell a node its id is already claimed by a longer-established owner
    ConflictName = 0x01,
    /// Reserved, never sent
    ConflictRegister = 0x02,
    /// Claim a node id; unopposed claims succeed after a quiet window
    Join = 0x03,
    /// Ask every node on the mesh to answer
    Ping = 0x04,
    /// Answer to a ping
    Pong = 0x05,
    /// Ask a node how many registers it serves (target at byte 5)
    GetNumRegisters = 0x06,
    /// Register count response (count at byte 5)
    NumRegisters = 0x07,
    /// Ask a node for the name of register `index` (target at 5, index at 6)
    GetRegisterName = 0x08,
    /// Register name response (echoed index at 5, name from byte 6)
    RegisterName = 0x09,
    /// Ask whichever node serves a register for its value (name from byte 5)
    GetRegister = 0x0A,
    /// Register value, directed (target at 5) or broadcast (target 0)
    RegisterValue = 0x0B,
    /// Write a register wherever it is served (name and value from byte 5)
    SetRegister = 0x0C,
    /// Write acknowledgment (target at 5, error text from byte 6, empty = ok)
    SetRegisterAck = 0x0D,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(PacketType::ConflictName),
            0x02 => Some(PacketType::ConflictRegister),
            0x03 => Some(PacketType::Join),
            0x04 => Some(PacketType::Ping),
            0x05 => Some(PacketType::Pong),
            0x06 => Some(PacketType::GetNumRegisters),
            0x07 => Some(PacketType::NumRegisters),
            0x08 => Some(PacketType::GetRegisterName),
            0x09 => Some(PacketType::RegisterName),
            0x0A => Some(PacketType::GetRegister),
            0x0B => Some(PacketType::RegisterValue),
            0x0C => Some(PacketType::SetRegister),
            0x0D => Some(PacketType::SetRegisterAck),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Offset of this type's length-prefixed register payload, if it
    /// carries one.
    fn reg_data_start(&self) -> Option<usize> {
        match self {
            PacketType::GetRegister | PacketType::SetRegister => Some(5),
            PacketType::RegisterName
            | PacketType::RegisterValue
            | PacketType::SetRegisterAck => Some(6),
            _ => None,
        }
    }
}

/// One wire frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    bytes: [u8; PACKET_SIZE],
}

impl Packet {
    /// A zeroed frame. Type byte 0 is not a valid packet type, so this is
    /// only a staging buffer until a header is written.
    pub fn new() -> Self {
        Self {
            bytes: [0; PACKET_SIZE],
        }
    }

    /// A frame with a fresh header and hop count zero.
    pub fn with_header(ptype: PacketType, seq: u8, sender: u8, unique_id: u16) -> Self {
        let mut pkt = Self::new();
        pkt.bytes[OFF_TYPE] = ptype.as_byte();
        pkt.set_seq(seq);
        pkt.bytes[OFF_SENDER] = sender;
        pkt.bytes[OFF_UNIQUE..OFF_UNIQUE + 2].copy_from_slice(&unique_id.to_be_bytes());
        pkt
    }

    /// Parse a received buffer. Only the length is checked here; an
    /// unknown type byte still parses so relays can carry newer types.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PACKET_SIZE {
            return None;
        }
        let mut pkt = Self::new();
        pkt.bytes.copy_from_slice(bytes);
        Some(pkt)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_byte(self.bytes[OFF_TYPE])
    }

    pub fn raw_type(&self) -> u8 {
        self.bytes[OFF_TYPE]
    }

    /// Hop count, 0 through 15.
    pub fn hop(&self) -> u8 {
        self.bytes[OFF_HOP_SEQ] & 0x0F
    }

    pub fn set_hop(&mut self, hop: u8) {
        self.bytes[OFF_HOP_SEQ] = (self.bytes[OFF_HOP_SEQ] & 0xF0) | (hop & 0x0F);
    }

    /// Sender's 4-bit sequence number.
    pub fn seq(&self) -> u8 {
        self.bytes[OFF_HOP_SEQ] >> 4
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.bytes[OFF_HOP_SEQ] = (self.bytes[OFF_HOP_SEQ] & 0x0F) | (seq << 4);
    }

    pub fn sender(&self) -> u8 {
        self.bytes[OFF_SENDER]
    }

    pub fn set_sender(&mut self, node_id: u8) {
        self.bytes[OFF_SENDER] = node_id;
    }

    pub fn unique_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[OFF_UNIQUE], self.bytes[OFF_UNIQUE + 1]])
    }

    pub fn set_unique_id(&mut self, unique_id: u16) {
        self.bytes[OFF_UNIQUE..OFF_UNIQUE + 2].copy_from_slice(&unique_id.to_be_bytes());
    }

    /// Target node id for the types that address one node (byte 5).
    pub fn target(&self) -> u8 {
        self.bytes[OFF_TARGET]
    }

    pub fn set_target(&mut self, node_id: u8) {
        self.bytes[OFF_TARGET] = node_id;
    }

    /// Register count carried by a `NumRegisters` response.
    pub fn register_count(&self) -> u8 {
        self.bytes[OFF_TARGET]
    }

    pub fn set_register_count(&mut self, count: u8) {
        self.bytes[OFF_TARGET] = count;
    }

    /// Register index: byte 6 in a `GetRegisterName` request, echoed at
    /// byte 5 in the `RegisterName` response.
    pub fn register_index(&self) -> u8 {
        match self.packet_type() {
            Some(PacketType::GetRegisterName) => self.bytes[6],
            _ => self.bytes[5],
        }
    }

    pub fn set_register_index(&mut self, index: u8) {
        match self.packet_type() {
            Some(PacketType::GetRegisterName) => self.bytes[6] = index,
            _ => self.bytes[5] = index,
        }
    }

    /// Pack a register into this frame at the type's payload offset.
    ///
    /// Returns false, leaving the frame unchanged, when the type carries
    /// no register payload, the name is empty, the data does not fit, or
    /// a requested value would make the combined payload shorter than
    /// two bytes. Oversized data is never truncated.
    pub fn encode_register(&mut self, reg: &Register, include_value: bool) -> bool {
        let start = match self.packet_type().and_then(|t| t.reg_data_start()) {
            Some(start) => start,
            None => return false,
        };
        let name = reg.name_bytes();
        let value = reg.value_bytes();
        if name.is_empty() {
            return false;
        }
        if include_value {
            if name.len() + value.len() < 2 {
                return false;
            }
            if start + 2 + name.len() + value.len() > PACKET_SIZE {
                return false;
            }
        } else if start + 1 + name.len() > PACKET_SIZE {
            return false;
        }

        let mut at = start;
        self.bytes[at] = name.len() as u8;
        at += 1;
        self.bytes[at..at + name.len()].copy_from_slice(name);
        at += name.len();
        if include_value {
            self.bytes[at] = value.len() as u8;
            at += 1;
            self.bytes[at..at + value.len()].copy_from_slice(value);
        }
        true
    }

    /// Unpack a register from this frame.
    ///
    /// Returns false and zeroes the register's lengths when the type has
    /// no register payload or any length prefix runs past the frame or
    /// the register buffer.
    pub fn decode_register(&self, reg: &mut Register, include_value: bool) -> bool {
        let parsed = self.parse_register_payload(include_value);
        match parsed {
            Some((name, value)) => {
                reg.load_from_wire(name, value);
                true
            }
            None => {
                reg.clear_lengths();
                false
            }
        }
    }

    /// Whether this frame's register payload names `reg`. False for
    /// types without a register payload.
    pub fn names_register(&self, reg: &Register) -> bool {
        match self.parse_register_payload(false) {
            Some((name, _)) => name == reg.name_bytes(),
            None => false,
        }
    }

    fn parse_register_payload(&self, include_value: bool) -> Option<(&[u8], &[u8])> {
        let start = self.packet_type().and_then(|t| t.reg_data_start())?;
        let name_len = self.bytes[start] as usize;
        if name_len == 0 || start + 1 + name_len > PACKET_SIZE || name_len > MAX_REGISTER_DATA {
            return None;
        }
        let name = &self.bytes[start + 1..start + 1 + name_len];
        if !include_value {
            return Some((name, &[]));
        }

        let vstart = start + 1 + name_len;
        if vstart >= PACKET_SIZE {
            return None;
        }
        let value_len = self.bytes[vstart] as usize;
        if vstart + 1 + value_len > PACKET_SIZE || name_len + value_len > MAX_REGISTER_DATA {
            return None;
        }
        if name_len + value_len < 2 {
            return None;
        }
        Some((name, &self.bytes[vstart + 1..vstart + 1 + value_len]))
    }

    /// Write a zero-length register payload, the invalid-index sentinel
    /// in a `RegisterName` response.
    pub fn clear_register_payload(&mut self) {
        if let Some(start) = self.packet_type().and_then(|t| t.reg_data_start()) {
            self.bytes[start] = 0;
        }
    }

    /// Whether the register payload is the zero-length sentinel.
    pub fn register_payload_empty(&self) -> bool {
        match self.packet_type().and_then(|t| t.reg_data_start()) {
            Some(start) => self.bytes[start] == 0,
            None => true,
        }
    }

    /// Error text of a `SetRegisterAck`. `None` means the write was
    /// accepted.
    pub fn ack_error(&self) -> Option<&[u8]> {
        let len = (self.bytes[6] as usize).min(PACKET_SIZE - 7);
        if len == 0 {
            return None;
        }
        Some(&self.bytes[7..7 + len])
    }

    /// Store ack error text, truncated to the frame. Empty marks success.
    pub fn set_ack_error(&mut self, message: &[u8]) {
        let len = message.len().min(PACKET_SIZE - 7);
        self.bytes[6] = len as u8;
        self.bytes[7..7 + len].copy_from_slice(&message[..len]);
    }

    /// Byte equality with the hop nibble masked out. The relay layer uses
    /// this to recognize copies of a frame it has already queued.
    pub fn same_ignoring_hop(&self, other: &Packet) -> bool {
        self.bytes[OFF_TYPE] == other.bytes[OFF_TYPE]
            && self.bytes[OFF_HOP_SEQ] & 0xF0 == other.bytes[OFF_HOP_SEQ] & 0xF0
            && self.bytes[2..] == other.bytes[2..]
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet {{ type: {:?}, hop: {}, seq: {}, sender: {}, unique: 0x{:04X} }}",
            self.packet_type(),
            self.hop(),
            self.seq(),
            self.sender(),
            self.unique_id()
        )
    }
}
