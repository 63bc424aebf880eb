use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

use crate::chunk;

// As defined in nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h

/// First byte of every control point response.
pub const RESPONSE_MARKER: u8 = 0x60;

/// Image object size the bootloader advertises. A create command for an object
/// of exactly this size uses the fixed-size frame.
pub const DATA_OBJECT_SIZE: u32 = 4096;

/// DFU Object variants
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Object {
    /// Init packet
    Command = 0x01,
    /// Firmware image
    Data = 0x02,
}

/// DFU Command opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HardwareVersion = 0x0A,
    FirmwareVersion = 0x0B,
    Abort = 0x0C,
}

impl OpCode {
    /// Requests the transfer engine writes to the control point.
    pub fn is_issued(self) -> bool {
        matches!(
            self,
            OpCode::ObjectSelect | OpCode::ObjectCreate | OpCode::CrcGet | OpCode::ObjectExecute
        )
    }
}

/// DFU Response codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

pub fn crc32(buf: &[u8], init: u32) -> u32 {
    let mut h = crc32fast::Hasher::new_with_initial(init);
    h.update(buf);
    h.finalize()
}

/// Size field of a create command.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjectSize {
    /// Object of [`DATA_OBJECT_SIZE`] bytes, sent as the protocol's fixed frame.
    Full,
    Explicit(u32),
}

impl ObjectSize {
    pub fn bytes(self) -> u32 {
        match self {
            ObjectSize::Full => DATA_OBJECT_SIZE,
            ObjectSize::Explicit(n) => n,
        }
    }
}

/// Outbound control point command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlFrame {
    SelectObject(Object),
    CreateObject { object: Object, size: ObjectSize },
    CalculateChecksum,
    Execute,
}

impl ControlFrame {
    /// Create command for an object chunk cut at `max_object_size`.
    ///
    /// A full-size chunk gets the fixed-size frame when the maximum is the
    /// protocol's own object size; anything else carries its length explicitly.
    pub fn create(object: Object, data: &[u8], max_object_size: usize) -> Self {
        let size = if chunk::is_full(data, max_object_size) && max_object_size == DATA_OBJECT_SIZE as usize {
            ObjectSize::Full
        } else {
            ObjectSize::Explicit(data.len() as u32)
        };
        ControlFrame::CreateObject { object, size }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            ControlFrame::SelectObject(_) => OpCode::ObjectSelect,
            ControlFrame::CreateObject { .. } => OpCode::ObjectCreate,
            ControlFrame::CalculateChecksum => OpCode::CrcGet,
            ControlFrame::Execute => OpCode::ObjectExecute,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = vec![self.opcode().into()];
        match self {
            ControlFrame::SelectObject(object) => payload.push((*object).into()),
            ControlFrame::CreateObject { object, size } => {
                payload.push((*object).into());
                payload.extend_from_slice(&size.bytes().to_le_bytes());
            }
            ControlFrame::CalculateChecksum | ControlFrame::Execute => {}
        }
        payload
    }

    /// Parse a command frame as the bootloader sees it.
    #[cfg(test)]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&op, rest) = bytes.split_first()?;
        match OpCode::try_from(op).ok()? {
            OpCode::ObjectSelect => match rest {
                [object] => Some(ControlFrame::SelectObject(Object::try_from(*object).ok()?)),
                _ => None,
            },
            OpCode::ObjectCreate => {
                if rest.len() != 5 {
                    return None;
                }
                let object = Object::try_from(rest[0]).ok()?;
                let len = u32::from_le_bytes(rest[1..5].try_into().ok()?);
                let size = if len == DATA_OBJECT_SIZE {
                    ObjectSize::Full
                } else {
                    ObjectSize::Explicit(len)
                };
                Some(ControlFrame::CreateObject { object, size })
            }
            OpCode::CrcGet if rest.is_empty() => Some(ControlFrame::CalculateChecksum),
            OpCode::ObjectExecute if rest.is_empty() => Some(ControlFrame::Execute),
            _ => None,
        }
    }
}

/// Decoded control point notification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseEvent {
    /// Select succeeded; the bootloader is ready to receive an object.
    ReadyForInit,
    /// Execute succeeded with a bare three byte response.
    InitAccepted,
    /// Checksum report for the currently selected object type.
    Checksum { offset: u32, crc: u32 },
    /// A request this host sends, answered with a non-success status.
    Rejected { opcode: u8, status: u8 },
    /// Notifications outside the transfer's critical path.
    Ignored,
}

impl ResponseEvent {
    pub fn decode(bytes: &[u8]) -> Self {
        let (opcode, status, body) = match bytes {
            [RESPONSE_MARKER, opcode, status, body @ ..] => (*opcode, *status, body),
            _ => return ResponseEvent::Ignored,
        };
        let op = match OpCode::try_from(opcode) {
            Ok(op) if op.is_issued() => op,
            _ => return ResponseEvent::Ignored,
        };
        if status != u8::from(ResponseCode::Success) {
            return ResponseEvent::Rejected { opcode, status };
        }
        match op {
            OpCode::ObjectSelect => ResponseEvent::ReadyForInit,
            OpCode::ObjectExecute if body.is_empty() => ResponseEvent::InitAccepted,
            OpCode::CrcGet if body.len() >= 8 => ResponseEvent::Checksum {
                offset: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
                crc: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
            },
            _ => ResponseEvent::Ignored,
        }
    }
}

impl fmt::Display for ResponseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseEvent::ReadyForInit => write!(f, "ready"),
            ResponseEvent::InitAccepted => write!(f, "executed"),
            ResponseEvent::Checksum { offset, crc } => write!(f, "checksum offset={} crc={:#010x}", offset, crc),
            ResponseEvent::Rejected { opcode, status } => {
                match OpCode::try_from(*opcode) {
                    Ok(op) => write!(f, "{:?} rejected", op)?,
                    Err(_) => write!(f, "opcode {:#04x} rejected", opcode)?,
                }
                match ResponseCode::try_from(*status) {
                    Ok(code) => write!(f, " with {:?}", code),
                    Err(_) => write!(f, " with status {:#04x}", status),
                }
            }
            ResponseEvent::Ignored => write!(f, "ignored"),
        }
    }
}
