//! Secure DFU transfer state machine.
//!
//! A transfer walks through
//! `ModeSwitch → AwaitingReady → SendingInit → AwaitingInitAccepted →
//! SendingImageObject ⇄ AwaitingImageObjectAccepted → Finalizing → Complete`.
//! Data channel writes are paced with the fixed delays of [`DfuConfig`]; every
//! delay is also a point where pending notifications are decoded and where a
//! cancellation request is honoured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::chunk;
use crate::config::{ms, DfuConfig};
use crate::error::{DfuError, TransportError};
use crate::package::FirmwarePackage;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::protocol::{crc32, ControlFrame, Object, ObjectSize, ResponseEvent};
use crate::transport::dfu_uuids::*;
use crate::transport::DfuTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ModeSwitch,
    AwaitingReady,
    SendingInit,
    AwaitingInitAccepted,
    SendingImageObject,
    AwaitingImageObjectAccepted,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferId {
    Init,
    Image,
}

/// Mutable state of one upload attempt.
#[derive(Debug)]
pub struct TransferSession {
    pub phase: Phase,
    pub current_buffer: BufferId,
    /// Bytes sent within the current object.
    pub link_offset: usize,
    /// Image offset at the start of the current object.
    pub object_offset: usize,
    pub total_image_bytes: usize,
    pub max_object_size: usize,
    pub max_link_chunk_size: usize,
    /// A checksum command was sent and its object is not executed yet.
    pub pending_validate: bool,
    has_init: bool,
    objects_total: usize,
    objects_executed: usize,
    image_crc: u32,
    verify_checksums: bool,
    expected_checksums: VecDeque<(u32, u32)>,
}

impl TransferSession {
    pub fn new(package: &FirmwarePackage, config: &DfuConfig) -> Result<Self, DfuError> {
        config.validate()?;
        package.validate()?;
        let total_image_bytes = package.image_data.len();
        if total_image_bytes == 0 {
            return Err(DfuError::Format("firmware image is empty".into()));
        }
        Ok(Self {
            phase: Phase::ModeSwitch,
            current_buffer: BufferId::Init,
            link_offset: 0,
            object_offset: 0,
            total_image_bytes,
            max_object_size: config.max_object_size,
            max_link_chunk_size: config.max_link_chunk_size,
            pending_validate: false,
            has_init: package.init_data.is_some(),
            objects_total: chunk::count(total_image_bytes, config.max_object_size),
            objects_executed: 0,
            image_crc: 0,
            verify_checksums: config.verify_checksums,
            expected_checksums: VecDeque::new(),
        })
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Phase changed");
            self.phase = phase;
        }
    }

    /// Apply a decoded notification. Returns `true` when it completes the
    /// wait of the current phase.
    pub fn on_response(&mut self, event: &ResponseEvent) -> Result<bool, DfuError> {
        match (self.phase, event) {
            (_, ResponseEvent::Rejected { .. }) => Err(DfuError::ProtocolViolation(event.to_string())),
            (_, ResponseEvent::Checksum { offset, crc }) => {
                self.check_checksum(*offset, *crc)?;
                Ok(false)
            }
            (Phase::AwaitingReady, ResponseEvent::ReadyForInit) => {
                let next = if self.has_init {
                    Phase::SendingInit
                } else {
                    Phase::SendingImageObject
                };
                self.enter(next);
                Ok(true)
            }
            (Phase::AwaitingInitAccepted, ResponseEvent::InitAccepted) => {
                self.object_offset = 0;
                self.enter(Phase::SendingImageObject);
                Ok(true)
            }
            (
                Phase::SendingImageObject | Phase::AwaitingImageObjectAccepted | Phase::Finalizing,
                ResponseEvent::InitAccepted,
            ) => {
                self.objects_executed = (self.objects_executed + 1).min(self.objects_total);
                Ok(self.phase == Phase::Finalizing && self.image_finalized())
            }
            _ => Ok(false),
        }
    }

    /// Every image object has been executed by the peer.
    pub fn image_finalized(&self) -> bool {
        self.objects_executed >= self.objects_total
    }

    /// The current phase can only be left on a notification.
    pub fn is_waiting(&self) -> bool {
        match self.phase {
            Phase::AwaitingReady | Phase::AwaitingInitAccepted => true,
            Phase::Finalizing => !self.image_finalized(),
            _ => false,
        }
    }

    fn expect_checksum(&mut self, offset: usize, crc: u32) {
        if self.verify_checksums {
            self.expected_checksums.push_back((offset as u32, crc));
        }
    }

    fn check_checksum(&mut self, offset: u32, crc: u32) -> Result<(), DfuError> {
        if !self.verify_checksums {
            return Ok(());
        }
        let Some((want_offset, want_crc)) = self.expected_checksums.pop_front() else {
            debug!(offset, crc, "Unsolicited checksum report");
            return Ok(());
        };
        if (offset, crc) != (want_offset, want_crc) {
            return Err(DfuError::ProtocolViolation(format!(
                "checksum mismatch: expected offset {} crc {:#010x}, peer reported offset {} crc {:#010x}",
                want_offset, want_crc, offset, crc
            )));
        }
        trace!(offset, crc, "Checksum verified");
        Ok(())
    }

    fn abort(&mut self, error: &DfuError) {
        let phase = match error {
            DfuError::Cancelled => Phase::Cancelled,
            _ => Phase::Failed,
        };
        warn!(
            phase = ?self.phase,
            buffer = ?self.current_buffer,
            object_offset = self.object_offset,
            link_offset = self.link_offset,
            pending_validate = self.pending_validate,
            error = %error,
            "Transfer stopped"
        );
        self.enter(phase);
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Connected Secure DFU bootloader.
struct DfuTarget<'a, T: DfuTransport> {
    transport: &'a T,
    config: &'a DfuConfig,
    control: T::Characteristic,
    packet: T::Characteristic,
    notifications: BoxStream<'static, Vec<u8>>,
    cancel: watch::Receiver<bool>,
}

impl<'a, T: DfuTransport> DfuTarget<'a, T> {
    /// Check for the DFU service, subscribe to the control point and ask the
    /// bootloader to select the init object.
    async fn open(
        transport: &'a T,
        config: &'a DfuConfig,
        cancel: watch::Receiver<bool>,
        session: &mut TransferSession,
    ) -> Result<Self, DfuError> {
        session.enter(Phase::ModeSwitch);
        let service = transport
            .discover_service(SERVICE)
            .await?
            .ok_or(DfuError::NotInDfuMode)?;
        let control = transport
            .characteristic(&service, CTRL_PT)
            .await?
            .ok_or(DfuError::CharacteristicNotFound(CTRL_PT))?;
        let packet = transport
            .characteristic(&service, DATA_PT)
            .await?
            .ok_or(DfuError::CharacteristicNotFound(DATA_PT))?;
        let notifications = transport.subscribe(&control).await?;

        let target = DfuTarget {
            transport,
            config,
            control,
            packet,
            notifications,
            cancel,
        };
        target.send(&ControlFrame::SelectObject(Object::Command)).await?;
        session.enter(Phase::AwaitingReady);
        Ok(target)
    }

    async fn send(&self, frame: &ControlFrame) -> Result<(), DfuError> {
        debug!(?frame, "Control point write");
        self.transport.write(&self.control, &frame.encode()).await?;
        Ok(())
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), DfuError> {
        self.transport.write(&self.packet, bytes).await?;
        Ok(())
    }

    fn apply(session: &mut TransferSession, frame: Option<Vec<u8>>) -> Result<bool, DfuError> {
        let frame = frame.ok_or(TransportError::NotificationsClosed)?;
        let event = ResponseEvent::decode(&frame);
        debug!(phase = ?session.phase, %event, "Control point response");
        session.on_response(&event)
    }

    /// Sleep for `delay`, applying notifications that arrive meanwhile.
    async fn settle(&mut self, session: &mut TransferSession, delay: Duration) -> Result<(), DfuError> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(DfuError::Cancelled),
                frame = self.notifications.next() => {
                    Self::apply(session, frame)?;
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
            }
        }
    }

    /// Wait until a notification moves the session out of its waiting phase.
    async fn await_response(&mut self, session: &mut TransferSession) -> Result<(), DfuError> {
        let phase = session.phase;
        let deadline = Instant::now() + self.config.response_timeout();
        while session.is_waiting() {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(DfuError::Cancelled),
                frame = self.notifications.next() => {
                    Self::apply(session, frame)?;
                }
                _ = tokio::time::sleep_until(deadline) => return Err(DfuError::ResponseTimeout { phase }),
            }
        }
        Ok(())
    }

    /// Stream one object over the data channel, one link chunk at a time.
    async fn stream_object(
        &mut self,
        session: &mut TransferSession,
        data: &[u8],
        mut progress: Option<&mut ProgressTracker<'_>>,
    ) -> Result<(), DfuError> {
        let delay = ms(self.config.link_chunk_delay_ms);
        session.link_offset = 0;
        for link in chunk::chunks(data, session.max_link_chunk_size) {
            trace!(offset = link.offset, len = link.len(), "Data write");
            self.write_data(link.data).await?;
            session.link_offset = link.end();
            if let Some(progress) = progress.as_deref_mut() {
                progress.update(session.object_offset, session.total_image_bytes);
            }
            self.settle(session, delay).await?;
        }
        Ok(())
    }

    async fn send_init(&mut self, session: &mut TransferSession, init: &[u8]) -> Result<(), DfuError> {
        let config = self.config;
        session.current_buffer = BufferId::Init;
        info!(len = init.len(), "Sending init packet");

        self.send(&ControlFrame::CreateObject {
            object: Object::Command,
            size: ObjectSize::Explicit(init.len() as u32),
        })
        .await?;
        self.settle(session, ms(config.create_settle_ms)).await?;
        self.stream_object(session, init, None).await?;

        session.expect_checksum(init.len(), crc32(init, 0));
        session.pending_validate = true;
        self.send(&ControlFrame::CalculateChecksum).await?;
        self.settle(session, ms(config.init_checksum_delay_ms)).await?;
        self.send(&ControlFrame::Execute).await?;
        session.pending_validate = false;
        session.enter(Phase::AwaitingInitAccepted);
        Ok(())
    }

    async fn send_image(
        &mut self,
        session: &mut TransferSession,
        image: &[u8],
        progress: &mut ProgressTracker<'_>,
    ) -> Result<(), DfuError> {
        let config = self.config;
        session.current_buffer = BufferId::Image;
        session.object_offset = 0;
        info!(len = image.len(), objects = session.objects_total, "Sending firmware image");

        for object in chunk::chunks(image, session.max_object_size) {
            session.enter(Phase::SendingImageObject);
            debug!(offset = object.offset, len = object.len(), "Image object");
            self.send(&ControlFrame::create(Object::Data, object.data, session.max_object_size))
                .await?;
            self.settle(session, ms(config.create_settle_ms)).await?;
            self.stream_object(session, object.data, Some(&mut *progress)).await?;

            session.object_offset = object.end();
            session.image_crc = crc32(object.data, session.image_crc);
            self.settle(session, ms(config.object_complete_delay_ms)).await?;

            session.enter(Phase::AwaitingImageObjectAccepted);
            session.expect_checksum(session.object_offset, session.image_crc);
            session.pending_validate = true;
            self.send(&ControlFrame::CalculateChecksum).await?;
            self.settle(session, ms(config.image_checksum_delay_ms)).await?;
            self.send(&ControlFrame::Execute).await?;
            session.pending_validate = false;
            self.settle(session, ms(config.image_execute_delay_ms)).await?;
        }
        Ok(())
    }

    async fn finalize(&mut self, session: &mut TransferSession, progress: &mut ProgressTracker<'_>) -> Result<(), DfuError> {
        session.enter(Phase::Finalizing);
        self.await_response(session).await?;

        self.settle(session, ms(self.config.finalize_delay_ms)).await?;
        self.send(&ControlFrame::SelectObject(Object::Data)).await?;
        progress.finish();
        session.enter(Phase::Complete);
        info!(bytes = session.total_image_bytes, "Finished DFU upload");
        Ok(())
    }

    async fn run(
        &mut self,
        session: &mut TransferSession,
        package: &FirmwarePackage,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<(), DfuError> {
        self.await_response(session).await?;
        if let Some(init) = package.init_data.as_deref() {
            self.send_init(session, init).await?;
            self.await_response(session).await?;
        }
        self.send_image(session, &package.image_data, progress).await?;
        self.finalize(session, progress).await
    }
}

async fn drive<T: DfuTransport>(
    transport: &T,
    session: &mut TransferSession,
    package: &FirmwarePackage,
    config: &DfuConfig,
    cancel: watch::Receiver<bool>,
    progress: &mut ProgressTracker<'_>,
) -> Result<(), DfuError> {
    if *cancel.borrow() {
        return Err(DfuError::Cancelled);
    }
    let mut target = DfuTarget::open(transport, config, cancel, session).await?;
    target.run(session, package, progress).await
}

/// Run DFU procedure as specified in
/// [DFU Protocol](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/lib_dfu_transport_ble.html)
///
/// On error the session is left in `Failed` (or `Cancelled`).
pub async fn dfu_run<T: DfuTransport>(
    transport: &T,
    session: &mut TransferSession,
    package: &FirmwarePackage,
    config: &DfuConfig,
    sink: &dyn ProgressSink,
    cancel: watch::Receiver<bool>,
) -> Result<(), DfuError> {
    let mut progress = ProgressTracker::new(sink);
    let result = drive(transport, session, package, config, cancel, &mut progress).await;
    if let Err(e) = &result {
        session.abort(e);
    }
    result
}

/// Requests cancellation of the transfer owned by a [`DfuUpdater`].
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, DfuError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DfuError::TransferInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Entry point for callers: runs at most one transfer at a time and reports
/// its outcome to a [`ProgressSink`].
pub struct DfuUpdater {
    config: DfuConfig,
    active: AtomicBool,
    cancel: Arc<watch::Sender<bool>>,
}

impl DfuUpdater {
    pub fn new(config: DfuConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            active: AtomicBool::new(false),
            cancel: Arc::new(cancel),
        }
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Upload `package`. A second call while one is running is rejected with
    /// [`DfuError::TransferInProgress`] and does not touch `sink`.
    #[instrument(skip_all, fields(image = package.image_data.len()))]
    pub async fn run<T: DfuTransport>(
        &self,
        transport: &T,
        package: &FirmwarePackage,
        sink: &dyn ProgressSink,
    ) -> Result<(), DfuError> {
        let _active = ActiveGuard::acquire(&self.active)?;
        let cancel = self.cancel.subscribe();

        let result = match TransferSession::new(package, &self.config) {
            Ok(mut session) => dfu_run(transport, &mut session, package, &self.config, sink, cancel).await,
            Err(e) => Err(e),
        };
        // a cancel only applies to the transfer it was requested for or the next one
        self.cancel.send_replace(false);
        if let Err(e) = &result {
            error!(error = %e, "DFU failed");
            sink.on_error(e);
        }
        result
    }
}
