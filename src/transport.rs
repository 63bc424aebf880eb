use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportError;

/// nRF DFU service & characteristic UUIDs
///
/// from [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html)
pub mod dfu_uuids {
    /// DFU Service (16 bit UUID 0xFE59)
    pub const SERVICE: uuid::Uuid = uuid::Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
    /// Control Point Characteristic
    pub const CTRL_PT: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Data Characteristic
    pub const DATA_PT: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds Characteristic
    pub const BTTNLSS: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
    /// Vendor mode switch, used as both the service and the characteristic UUID
    pub const LEGACY_SWITCH: uuid::Uuid = uuid::Uuid::from_u128(0x8E400001_F315_4F60_9FB8_838830DAEA50);
}

/// Connection to a peripheral, as seen by the transfer engine.
///
/// Writes are fire-and-forget: success only means the local stack accepted
/// the bytes, not that the peer processed them.
#[async_trait]
pub trait DfuTransport: Send + Sync {
    type Service: Send + Sync;
    type Characteristic: Clone + Send + Sync;

    /// Look up a GATT service, `None` if the peer does not expose it.
    async fn discover_service(&self, uuid: uuid::Uuid) -> Result<Option<Self::Service>, TransportError>;
    /// Look up a characteristic of `service`.
    async fn characteristic(
        &self,
        service: &Self::Service,
        uuid: uuid::Uuid,
    ) -> Result<Option<Self::Characteristic>, TransportError>;
    /// Write raw bytes to a characteristic.
    async fn write(&self, chr: &Self::Characteristic, bytes: &[u8]) -> Result<(), TransportError>;
    /// Enable notifications and return the stream of notified values.
    async fn subscribe(&self, chr: &Self::Characteristic) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;
}
