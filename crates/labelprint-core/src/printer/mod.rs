//! Printer driver
//!
//! High-level operations on top of the [`Transceiver`]: label settings,
//! status queries, the health check and the full print job sequence.

mod error;
mod raster;
mod status;

pub use error::{DataError, LinkError, PrintJobError, PrintStep, PrinterError, PrinterFault};
pub use raster::{encode_image, pack_row, RasterLine, MAX_RASTER_WIDTH};
pub use status::{DeviceInfo, HeartbeatStatus, PrintStatus, RfidTag};

use image::DynamicImage;
use std::thread;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::config::{validate_density, validate_label_type, PrinterConfig};
use crate::protocol::{
    ConnectionState, InfoKey, Packet, PacketBuilder, ProtocolError, RequestCode, ResponseOffset,
    Transceiver, TransceiverConfig, Transport,
};

/// Payload of the single-flag requests
const FLAG_ON: [u8; 1] = [0x01];

/// Page progress that means the page is done
const PAGE_COMPLETE: u8 = 100;

fn at(step: PrintStep) -> impl FnOnce(PrinterError) -> PrintJobError {
    move |source| PrintJobError { step, source }
}

fn require(command: RequestCode, acknowledged: bool) -> Result<(), PrinterError> {
    if acknowledged {
        Ok(())
    } else {
        Err(PrinterError::NotAcknowledged(command))
    }
}

/// Driver for one label printer
pub struct PrinterDriver {
    transceiver: Transceiver,
    config: PrinterConfig,
    span: Span,
}

impl PrinterDriver {
    /// Wrap a transport without touching it
    pub fn new(transport: Box<dyn Transport>, config: PrinterConfig) -> Self {
        let span = info_span!("printer", port = %transport.describe());
        let transceiver = Transceiver::new(transport, TransceiverConfig::from(&config.timing));
        Self {
            transceiver,
            config,
            span,
        }
    }

    /// Validate settings, open the link and apply density and label type
    pub fn connect(transport: Box<dyn Transport>, config: PrinterConfig) -> Result<Self, PrinterError> {
        config.label.validate()?;

        let mut driver = Self::new(transport, config);
        let span = driver.span.clone();
        let _enter = span.enter();

        driver.transceiver.transport_mut().open()?;
        if let Err(e) = driver.apply_label_settings() {
            error!("Printer initialization failed: {}", e);
            return Err(e);
        }

        info!(
            density = driver.config.label.density,
            label_type = driver.config.label.label_type,
            "Printer initialized"
        );
        Ok(driver)
    }

    /// Abort exchanges between polling rounds once `token` fires
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.transceiver.set_cancellation(token);
    }

    /// Active configuration
    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    /// State of the underlying link
    pub fn link_state(&self) -> ConnectionState {
        self.transceiver.transport().state()
    }

    /// Send the configured density and label type
    pub fn apply_label_settings(&mut self) -> Result<(), PrinterError> {
        let density = self.config.label.density;
        let label_type = self.config.label.label_type;
        let acked = self.set_label_density(density)?;
        require(RequestCode::SetLabelDensity, acked)?;
        let acked = self.set_label_type(label_type)?;
        require(RequestCode::SetLabelType, acked)?;
        Ok(())
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    fn exchange(&mut self, command: RequestCode, payload: &[u8]) -> Result<Packet, ProtocolError> {
        let offset = match command.response_offset() {
            ResponseOffset::Fixed(offset) => offset,
            ResponseOffset::Key => payload.first().copied().unwrap_or_default(),
            // Raster lines are never answered
            ResponseOffset::None => {
                return Err(ProtocolError::Unsupported {
                    code: command.code(),
                })
            }
        };
        self.transceiver.request(command.code(), payload, offset)
    }

    fn non_empty(&mut self, command: RequestCode, payload: &[u8]) -> Result<Packet, PrinterError> {
        let packet = self.exchange(command, payload)?;
        if packet.payload.is_empty() {
            return Err(DataError::Truncated { command }.into());
        }
        Ok(packet)
    }

    fn acknowledged(&mut self, command: RequestCode, payload: &[u8]) -> Result<bool, PrinterError> {
        let packet = self.non_empty(command, payload)?;
        Ok(packet.ack().unwrap_or_default())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Set print density (1-5)
    pub fn set_label_density(&mut self, density: u8) -> Result<bool, PrinterError> {
        let density = validate_density(density)?;
        self.acknowledged(RequestCode::SetLabelDensity, &[density])
    }

    /// Set label type (1-3)
    pub fn set_label_type(&mut self, label_type: u8) -> Result<bool, PrinterError> {
        let label_type = validate_label_type(label_type)?;
        self.acknowledged(RequestCode::SetLabelType, &[label_type])
    }

    /// Begin a job
    pub fn start_print(&mut self) -> Result<bool, PrinterError> {
        self.acknowledged(RequestCode::StartPrint, &FLAG_ON)
    }

    /// Finish the job
    pub fn end_print(&mut self) -> Result<bool, PrinterError> {
        self.acknowledged(RequestCode::EndPrint, &FLAG_ON)
    }

    /// Begin a page
    pub fn start_page_print(&mut self) -> Result<bool, PrinterError> {
        self.acknowledged(RequestCode::StartPagePrint, &FLAG_ON)
    }

    /// Finish the page
    pub fn end_page_print(&mut self) -> Result<bool, PrinterError> {
        self.acknowledged(RequestCode::EndPagePrint, &FLAG_ON)
    }

    /// Let the printer clear its page buffer
    pub fn allow_print_clear(&mut self) -> Result<bool, PrinterError> {
        self.acknowledged(RequestCode::AllowPrintClear, &FLAG_ON)
    }

    /// Announce the page size in pixels
    pub fn set_dimension(&mut self, height: u16, width: u16) -> Result<bool, PrinterError> {
        let packet = PacketBuilder::new(RequestCode::SetDimension.code())
            .u16_be(height)
            .u16_be(width)
            .build();
        self.acknowledged(RequestCode::SetDimension, &packet.payload)
    }

    /// Number of copies of the next page
    pub fn set_quantity(&mut self, quantity: u16) -> Result<bool, PrinterError> {
        let packet = PacketBuilder::new(RequestCode::SetQuantity.code())
            .u16_be(quantity)
            .build();
        self.acknowledged(RequestCode::SetQuantity, &packet.payload)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Heartbeat; which fields come back depends on the model
    pub fn heartbeat(&mut self) -> Result<HeartbeatStatus, ProtocolError> {
        let packet = self.exchange(RequestCode::Heartbeat, &FLAG_ON)?;
        Ok(HeartbeatStatus::from_payload(&packet.payload))
    }

    /// Page progress. `None` when the payload is not a status record.
    pub fn get_print_status(&mut self) -> Result<Option<PrintStatus>, PrinterError> {
        let packet = self.exchange(RequestCode::GetPrintStatus, &FLAG_ON)?;
        Ok(PrintStatus::from_payload(&packet.payload))
    }

    /// Read one device property
    pub fn get_info(&mut self, key: InfoKey) -> Result<DeviceInfo, PrinterError> {
        let packet = self.non_empty(RequestCode::GetInfo, &[key.code()])?;
        Ok(DeviceInfo::from_payload(key, &packet.payload)?)
    }

    /// Read the RFID tag of the loaded roll, `None` when there is no tag
    pub fn get_rfid(&mut self) -> Result<Option<RfidTag>, PrinterError> {
        let packet = self.non_empty(RequestCode::GetRfid, &FLAG_ON)?;
        Ok(RfidTag::from_payload(&packet.payload)?)
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Verify the printer answers and is able to print.
    ///
    /// An unanswered heartbeat triggers one reconnect and one retry before
    /// the printer is declared unreachable.
    pub fn check_printer_status(&mut self) -> Result<HeartbeatStatus, PrinterError> {
        let span = self.span.clone();
        let _enter = span.enter();

        let heartbeat = match self.heartbeat() {
            Ok(heartbeat) => heartbeat,
            Err(e) if e.is_no_response() => {
                warn!("Heartbeat unanswered ({}), reconnecting", e);
                if let Err(e) = self.transceiver.transport_mut().reconnect() {
                    warn!("Reconnect failed: {}", e);
                }
                thread::sleep(self.config.timing.health_retry_delay());
                self.heartbeat().map_err(|cause| {
                    error!("Printer unreachable: {}", cause);
                    LinkError::Unreachable { cause }
                })?
            }
            Err(e) => return Err(e.into()),
        };

        if heartbeat.cover_open() {
            return Err(PrinterFault::CoverOpen.into());
        }
        let minimum = self.config.label.min_power_level;
        if let Some(level) = heartbeat.power_level.filter(|level| *level < minimum) {
            return Err(PrinterFault::LowBattery { level, minimum }.into());
        }

        match self.get_print_status() {
            Ok(Some(status)) if !status.is_enabled => return Err(PrinterFault::Jammed.into()),
            Ok(_) => {}
            Err(e) if e.is_timeout() => debug!("No print status reported"),
            Err(e) => return Err(e),
        }

        debug!(?heartbeat, "Printer healthy");
        Ok(heartbeat)
    }

    // ========================================================================
    // Printing
    // ========================================================================

    /// Stream already rasterized rows
    pub fn send_raster_lines(&mut self, lines: &[RasterLine]) -> Result<(), PrinterError> {
        for line in lines {
            let packet = line.to_packet();
            self.transceiver.send(packet.kind, &packet.payload)?;
        }
        Ok(())
    }

    /// Rasterize and stream an image without any job framing
    pub fn send_image(&mut self, image: &DynamicImage) -> Result<(), PrinterError> {
        let lines = encode_image(image)?;
        self.send_raster_lines(&lines)
    }

    /// Print one image as a complete job.
    ///
    /// On failure a single best-effort `END_PRINT` is sent so the printer
    /// does not stay inside a job.
    pub fn print_image(&mut self, image: &DynamicImage) -> Result<(), PrintJobError> {
        let span = self.span.clone();
        let _enter = span.enter();

        let started = Instant::now();
        let result = self.run_job(image);
        match &result {
            Ok(()) => info!(
                width = image.width(),
                height = image.height(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Label printed"
            ),
            Err(e) => {
                error!("{}", e);
                // A refused END_PRINT was already retried until the bound
                let refused_end = matches!(
                    e.source,
                    PrinterError::NotAcknowledged(RequestCode::EndPrint)
                );
                if !refused_end {
                    self.abort_job();
                }
            }
        }
        result
    }

    /// Print several images, one job each, stopping at the first failure
    pub fn print_images<'a>(
        &mut self,
        images: impl IntoIterator<Item = &'a DynamicImage>,
    ) -> Result<usize, PrintJobError> {
        let mut printed = 0;
        for image in images {
            self.print_image(image)?;
            printed += 1;
        }
        Ok(printed)
    }

    fn run_job(&mut self, image: &DynamicImage) -> Result<(), PrintJobError> {
        let lines = encode_image(image).map_err(at(PrintStep::PrepareImage))?;

        self.check_printer_status()
            .map_err(at(PrintStep::CheckHealth))?;

        self.start_print()
            .and_then(|ack| require(RequestCode::StartPrint, ack))
            .map_err(at(PrintStep::StartPrint))?;

        match self.allow_print_clear() {
            Ok(ack) => require(RequestCode::AllowPrintClear, ack).map_err(at(PrintStep::AllowClear))?,
            Err(PrinterError::Protocol(ProtocolError::Unsupported { .. })) => {
                warn!("Printer does not support ALLOW_PRINT_CLEAR, continuing")
            }
            Err(e) => return Err(at(PrintStep::AllowClear)(e)),
        }

        self.start_page_print()
            .and_then(|ack| require(RequestCode::StartPagePrint, ack))
            .map_err(at(PrintStep::StartPagePrint))?;

        // encode_image bounds both sides to u16
        self.set_dimension(image.height() as u16, image.width() as u16)
            .and_then(|ack| require(RequestCode::SetDimension, ack))
            .map_err(at(PrintStep::SetDimension))?;

        self.send_raster_lines(&lines)
            .map_err(at(PrintStep::StreamRasterLines))?;
        debug!(rows = lines.len(), "Raster lines sent");

        self.end_page_print()
            .and_then(|ack| require(RequestCode::EndPagePrint, ack))
            .map_err(at(PrintStep::EndPagePrint))?;

        self.wait_for_page().map_err(at(PrintStep::PollProgress))?;

        self.finish_print().map_err(at(PrintStep::EndPrint))
    }

    /// Poll print status until the page reports complete
    fn wait_for_page(&mut self) -> Result<(), PrinterError> {
        let started = Instant::now();
        let limit = self.config.timing.progress_timeout();
        let mut last_progress = None;

        loop {
            match self.get_print_status() {
                Ok(Some(status)) => {
                    if !status.is_enabled {
                        return Err(PrinterFault::Jammed.into());
                    }
                    if last_progress != Some(status.progress1) {
                        debug!(progress = status.progress1, page = status.page, "Page progress");
                    }
                    last_progress = Some(status.progress1);
                    if status.progress1 >= PAGE_COMPLETE {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_timeout() => debug!("Print status unanswered, polling again"),
                Err(e) => return Err(e),
            }

            let waited = started.elapsed();
            if waited >= limit {
                return Err(PrinterError::ProgressTimeout {
                    waited,
                    last_progress,
                });
            }
            thread::sleep(self.config.timing.progress_poll());
        }
    }

    /// `END_PRINT` may be refused while the page is still feeding out
    fn finish_print(&mut self) -> Result<(), PrinterError> {
        let started = Instant::now();
        while !self.end_print()? {
            if started.elapsed() >= self.config.timing.progress_timeout() {
                return Err(PrinterError::NotAcknowledged(RequestCode::EndPrint));
            }
            thread::sleep(self.config.timing.round_delay());
        }
        Ok(())
    }

    fn abort_job(&mut self) {
        match self.end_print() {
            Ok(true) => info!("Print job closed after failure"),
            Ok(false) => warn!("Printer refused END_PRINT during cleanup"),
            Err(e) => warn!("END_PRINT during cleanup failed: {}", e),
        }
    }

    // ========================================================================
    // Link management
    // ========================================================================

    /// Close the link, keeping the driver usable for [`reopen_link`](Self::reopen_link)
    pub fn close_link(&mut self) {
        self.transceiver.transport_mut().close();
    }

    /// Open the link again and drop anything left over from before
    pub fn reopen_link(&mut self) -> Result<(), PrinterError> {
        self.transceiver.transport_mut().open()?;
        self.transceiver.discard_pending();
        Ok(())
    }

    /// Close for good; the link refuses to reopen afterwards
    pub fn exhaust_link(&mut self) {
        self.transceiver.transport_mut().exhaust();
    }

    /// Release the link
    pub fn close(&mut self) {
        info!(parent: &self.span, "Closing printer");
        self.transceiver.transport_mut().close();
    }
}
