use crate::error::TransportError;
use crate::transport::DfuTransport;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::{debug, info};

const WRITE_TIMEOUT_MS: u64 = 500;

async fn timeout<F: std::future::Future>(future: F) -> Result<F::Output, TransportError> {
    tokio::time::timeout(Duration::from_millis(WRITE_TIMEOUT_MS), future)
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_ms: WRITE_TIMEOUT_MS,
        })
}

async fn find_peripheral(
    central: &Adapter,
    name: Option<&str>,
    addr: Option<BDAddr>,
) -> Result<Peripheral, TransportError> {
    info!(?name, ?addr, "Searching for peripheral");
    central.start_scan(ScanFilter::default()).await?;
    let mut events = central.events().await?;

    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await?;
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let by_name = name.is_some_and(|n| props.local_name.as_deref() == Some(n));
            let by_addr = addr.is_some_and(|a| a == props.address);
            if by_name || by_addr {
                info!(name = ?props.local_name, address = %props.address, "Found peripheral");
                central.stop_scan().await?;
                return Ok(peripheral);
            }
            debug!(name = ?props.local_name, address = %props.address, "Skipping peripheral");
        }
    }
    Err(TransportError::PeripheralNotFound("unexpected end of stream".into()))
}

/// Secure DFU transport over a btleplug connection.
pub struct DfuTransportBtleplug {
    peripheral: Peripheral,
}

impl DfuTransportBtleplug {
    /// Scan for a peripheral by advertised name or address, connect and
    /// discover its services.
    pub async fn new(name: Option<&str>, addr: Option<BDAddr>, scan_timeout: Duration) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        let peripheral = tokio::time::timeout(scan_timeout, find_peripheral(&central, name, addr))
            .await
            .map_err(|_| {
                TransportError::PeripheralNotFound(format!("{:?} / {:?} not seen within {:?}", name, addr, scan_timeout))
            })??;
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(DfuTransportBtleplug { peripheral })
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl DfuTransport for DfuTransportBtleplug {
    type Service = Service;
    type Characteristic = Characteristic;

    async fn discover_service(&self, uuid: uuid::Uuid) -> Result<Option<Service>, TransportError> {
        Ok(self.peripheral.services().into_iter().find(|s| s.uuid == uuid))
    }

    async fn characteristic(&self, service: &Service, uuid: uuid::Uuid) -> Result<Option<Characteristic>, TransportError> {
        Ok(service.characteristics.iter().find(|c| c.uuid == uuid).cloned())
    }

    async fn write(&self, chr: &Characteristic, bytes: &[u8]) -> Result<(), TransportError> {
        // the data point is write-without-response, the control point is not
        let write_type = if chr.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        timeout(self.peripheral.write(chr, bytes, write_type))
            .await?
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&self, chr: &Characteristic) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        self.peripheral
            .subscribe(chr)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let uuid = chr.uuid;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter(move |ntf| futures::future::ready(ntf.uuid == uuid))
            .map(|ntf| ntf.value)
            .boxed())
    }
}
