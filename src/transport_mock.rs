//! Simulated Secure DFU bootloader for testing the transfer engine.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};

use crate::error::TransportError;
use crate::protocol::{crc32, ControlFrame, Object, OpCode, ResponseCode, DATA_OBJECT_SIZE, RESPONSE_MARKER};
use crate::transport::dfu_uuids::*;
use crate::transport::DfuTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockChar {
    Control,
    Packet,
    Buttonless,
    LegacySwitch,
}

#[derive(Debug, Default, Clone, Copy)]
struct ObjectState {
    offset: u32,
    crc: u32,
}

#[derive(Default)]
struct State {
    writes: Vec<(MockChar, Vec<u8>)>,
    subscribers: HashMap<MockChar, UnboundedSender<Vec<u8>>>,
    current: Option<Object>,
    command: ObjectState,
    data: ObjectState,
    command_bytes: Vec<u8>,
    data_bytes: Vec<u8>,
}

/// Mock peripheral answering control point requests like an nRF bootloader.
#[derive(Default)]
pub struct MockPeripheral {
    no_dfu_service: bool,
    no_packet_char: bool,
    buttonless: bool,
    legacy_switch: bool,
    silent: bool,
    reject: Option<OpCode>,
    drop: Option<OpCode>,
    fail_after_writes: Option<usize>,
    corrupt_checksum: bool,
    state: Mutex<State>,
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer still running the application firmware.
    pub fn without_dfu_service(mut self) -> Self {
        self.no_dfu_service = true;
        self
    }

    pub fn without_packet_char(mut self) -> Self {
        self.no_packet_char = true;
        self
    }

    pub fn with_buttonless(mut self) -> Self {
        self.buttonless = true;
        self
    }

    /// Application exposing the vendor mode switch service.
    pub fn with_legacy_switch(mut self) -> Self {
        self.legacy_switch = true;
        self
    }

    /// Accept every write but never notify.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn rejecting(mut self, opcode: OpCode) -> Self {
        self.reject = Some(opcode);
        self
    }

    /// Process requests with `opcode` but never answer them.
    pub fn dropping(mut self, opcode: OpCode) -> Self {
        self.drop = Some(opcode);
        self
    }

    pub fn failing_after(mut self, writes: usize) -> Self {
        self.fail_after_writes = Some(writes);
        self
    }

    pub fn corrupting_checksums(mut self) -> Self {
        self.corrupt_checksum = true;
        self
    }

    pub fn writes(&self) -> Vec<(MockChar, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn control_frames(&self) -> Vec<ControlFrame> {
        self.writes()
            .into_iter()
            .filter(|(chr, _)| *chr == MockChar::Control)
            .filter_map(|(_, bytes)| ControlFrame::parse(&bytes))
            .collect()
    }

    pub fn packet_writes(&self) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|(chr, _)| *chr == MockChar::Packet)
            .map(|(_, bytes)| bytes)
            .collect()
    }

    pub fn received_init(&self) -> Vec<u8> {
        self.state.lock().unwrap().command_bytes.clone()
    }

    pub fn received_image(&self) -> Vec<u8> {
        self.state.lock().unwrap().data_bytes.clone()
    }

    fn respond(&self, state: &mut State, bytes: &[u8]) -> Option<Vec<u8>> {
        let opcode = *bytes.first()?;
        if self.reject.map(u8::from) == Some(opcode) {
            return Some(vec![RESPONSE_MARKER, opcode, ResponseCode::InvalidObject.into()]);
        }
        let Some(frame) = ControlFrame::parse(bytes) else {
            return Some(vec![RESPONSE_MARKER, opcode, ResponseCode::OpCodeNotSupported.into()]);
        };
        let mut response = vec![RESPONSE_MARKER, opcode, ResponseCode::Success.into()];
        match frame {
            ControlFrame::SelectObject(object) => {
                let obj = Self::object(state, object);
                response.extend_from_slice(&DATA_OBJECT_SIZE.to_le_bytes());
                response.extend_from_slice(&obj.offset.to_le_bytes());
                response.extend_from_slice(&obj.crc.to_le_bytes());
            }
            ControlFrame::CreateObject { object, .. } => {
                if object == Object::Command {
                    state.command = ObjectState::default();
                    state.command_bytes.clear();
                }
                state.current = Some(object);
            }
            ControlFrame::CalculateChecksum => {
                let object = state.current.unwrap_or(Object::Command);
                let obj = Self::object(state, object);
                let crc = if self.corrupt_checksum { obj.crc ^ 0xFFFF_FFFF } else { obj.crc };
                response.extend_from_slice(&obj.offset.to_le_bytes());
                response.extend_from_slice(&crc.to_le_bytes());
            }
            ControlFrame::Execute => {}
        }
        if self.drop.map(u8::from) == Some(opcode) {
            return None;
        }
        Some(response)
    }

    fn object(state: &State, object: Object) -> ObjectState {
        match object {
            Object::Command => state.command,
            Object::Data => state.data,
        }
    }

    fn notify(state: &State, chr: MockChar, value: Vec<u8>) {
        if let Some(tx) = state.subscribers.get(&chr) {
            let _ = tx.unbounded_send(value);
        }
    }
}

#[async_trait]
impl DfuTransport for MockPeripheral {
    type Service = ();
    type Characteristic = MockChar;

    async fn discover_service(&self, uuid: uuid::Uuid) -> Result<Option<()>, TransportError> {
        let found = (uuid == SERVICE && !self.no_dfu_service) || (uuid == LEGACY_SWITCH && self.legacy_switch);
        Ok(found.then_some(()))
    }

    async fn characteristic(&self, _service: &(), uuid: uuid::Uuid) -> Result<Option<MockChar>, TransportError> {
        let chr = if uuid == CTRL_PT {
            Some(MockChar::Control)
        } else if uuid == DATA_PT && !self.no_packet_char {
            Some(MockChar::Packet)
        } else if uuid == BTTNLSS && self.buttonless {
            Some(MockChar::Buttonless)
        } else if uuid == LEGACY_SWITCH && self.legacy_switch {
            Some(MockChar::LegacySwitch)
        } else {
            None
        };
        Ok(chr)
    }

    async fn write(&self, chr: &MockChar, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = self.fail_after_writes {
            if state.writes.len() >= limit {
                return Err(TransportError::WriteFailed("link lost".into()));
            }
        }
        state.writes.push((*chr, bytes.to_vec()));
        let response = match chr {
            MockChar::Control => self.respond(&mut state, bytes),
            MockChar::Packet => {
                match state.current {
                    Some(Object::Command) => {
                        state.command.offset += bytes.len() as u32;
                        state.command.crc = crc32(bytes, state.command.crc);
                        state.command_bytes.extend_from_slice(bytes);
                    }
                    Some(Object::Data) => {
                        state.data.offset += bytes.len() as u32;
                        state.data.crc = crc32(bytes, state.data.crc);
                        state.data_bytes.extend_from_slice(bytes);
                    }
                    None => {}
                }
                None
            }
            MockChar::Buttonless => (bytes == [0x01]).then(|| vec![0x20, 0x01, 0x01]),
            MockChar::LegacySwitch => None,
        };
        if let Some(value) = response {
            if !self.silent {
                Self::notify(&state, *chr, value);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, chr: &MockChar) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let (tx, rx) = unbounded();
        self.state.lock().unwrap().subscribers.insert(*chr, tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_answers_select() {
        let mock = MockPeripheral::new();
        let mut rx = mock.subscribe(&MockChar::Control).await.unwrap();
        mock.write(&MockChar::Control, &[0x06, 0x01]).await.unwrap();
        let response = rx.next().await.unwrap();
        assert_eq!(response[..3], [0x60, 0x06, 0x01]);
        assert_eq!(response.len(), 15);
    }

    #[tokio::test]
    async fn test_mock_write_capture_and_failure() {
        let mock = MockPeripheral::new().failing_after(2);
        mock.write(&MockChar::Packet, b"Hello").await.unwrap();
        mock.write(&MockChar::Packet, b"World").await.unwrap();
        assert!(mock.write(&MockChar::Packet, b"!").await.is_err());
        assert_eq!(mock.packet_writes(), vec![b"Hello".to_vec(), b"World".to_vec()]);
    }

    #[tokio::test]
    async fn test_mock_drops_answers_to_one_opcode() {
        let mock = MockPeripheral::new().dropping(OpCode::ObjectExecute);
        let mut rx = mock.subscribe(&MockChar::Control).await.unwrap();
        mock.write(&MockChar::Control, &[0x04]).await.unwrap();
        mock.write(&MockChar::Control, &[0x03]).await.unwrap();
        let response = rx.next().await.unwrap();
        assert_eq!(response[..3], [0x60, 0x03, 0x01]);
    }

    #[tokio::test]
    async fn test_mock_service_lookup() {
        let mock = MockPeripheral::new().without_dfu_service();
        assert!(mock.discover_service(SERVICE).await.unwrap().is_none());
        let mock = MockPeripheral::new();
        assert!(mock.discover_service(SERVICE).await.unwrap().is_some());
        assert_eq!(mock.characteristic(&(), BTTNLSS).await.unwrap(), None);
    }
}
