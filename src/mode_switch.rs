//! Switching a running application into the bootloader.

use std::time::Duration;

use futures::stream::StreamExt;
use tracing::{debug, info};

use crate::engine::Phase;
use crate::error::{DfuError, TransportError};
use crate::protocol::ResponseCode;
use crate::transport::dfu_uuids::*;
use crate::transport::DfuTransport;

const ENTER_BOOTLOADER: u8 = 0x01;
const RESPONSE_CODE: u8 = 0x20;
const LEGACY_IMAGE_TYPE: u8 = 0x04;

/// How the application is told to reboot into the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SwitchMethod {
    /// Nordic buttonless DFU characteristic
    Buttonless,
    /// Vendor `8e400001` service of older application firmware
    Legacy,
}

/// Ask the application to reboot into the bootloader with `method`.
///
/// The peer drops the link right after the switch, so the caller has to
/// reconnect (usually to a device advertising under another name) before
/// starting a transfer.
pub async fn enter_bootloader<T: DfuTransport>(
    transport: &T,
    method: SwitchMethod,
    timeout: Duration,
) -> Result<(), DfuError> {
    match method {
        SwitchMethod::Buttonless => enter_buttonless(transport, timeout).await,
        SwitchMethod::Legacy => enter_legacy(transport, timeout).await,
    }
}

async fn enter_buttonless<T: DfuTransport>(transport: &T, timeout: Duration) -> Result<(), DfuError> {
    let service = transport
        .discover_service(SERVICE)
        .await?
        .ok_or(DfuError::ServiceNotFound(SERVICE))?;
    let buttonless = transport
        .characteristic(&service, BTTNLSS)
        .await?
        .ok_or(DfuError::CharacteristicNotFound(BTTNLSS))?;

    let mut notifications = transport.subscribe(&buttonless).await?;
    transport.write(&buttonless, &[ENTER_BOOTLOADER]).await?;
    let res = tokio::time::timeout(timeout, notifications.next())
        .await
        .map_err(|_| DfuError::ResponseTimeout {
            phase: Phase::ModeSwitch,
        })?
        .ok_or(TransportError::NotificationsClosed)?;

    match res.as_slice() {
        [RESPONSE_CODE, ENTER_BOOTLOADER, status] if *status == u8::from(ResponseCode::Success) => {
            info!("Peripheral is restarting into the bootloader");
            Ok(())
        }
        other => Err(DfuError::ProtocolViolation(format!(
            "unexpected buttonless response {:02x?}",
            other
        ))),
    }
}

/// Writes `[0x01, 0x04]` to the characteristic that shares the vendor
/// service's UUID.
///
/// Unverified against real hardware: the characteristic lookup reuses the
/// service UUID and the peer's answer format is unknown, so any notification
/// is only logged and a missing one is not an error.
async fn enter_legacy<T: DfuTransport>(transport: &T, timeout: Duration) -> Result<(), DfuError> {
    let service = transport
        .discover_service(LEGACY_SWITCH)
        .await?
        .ok_or(DfuError::ServiceNotFound(LEGACY_SWITCH))?;
    let switch = transport
        .characteristic(&service, LEGACY_SWITCH)
        .await?
        .ok_or(DfuError::CharacteristicNotFound(LEGACY_SWITCH))?;

    let mut notifications = transport.subscribe(&switch).await?;
    transport.write(&switch, &[ENTER_BOOTLOADER, LEGACY_IMAGE_TYPE]).await?;
    match tokio::time::timeout(timeout, notifications.next()).await {
        Ok(Some(value)) => debug!(?value, "Mode switch notification"),
        _ => debug!("No mode switch notification"),
    }
    info!("Requested legacy switch into the bootloader");
    Ok(())
}
