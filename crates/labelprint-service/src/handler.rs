//! Print request handling
//!
//! One request asks for `amount` labels. Each label carries a QR code of
//! `{"id": <request id>, "number": <1..=amount>}` and the caption
//! `"<requester name> <number>"`. Labels are rendered and printed one at a
//! time, so a failure leaves the labels before it printed.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use labelprint_core::printer::PrintJobError;
use labelprint_core::SharedPrinter;

use crate::config::DEFAULT_MAX_LABELS;
use crate::lookup::FallbackLookup;
use crate::render::{LabelRenderer, RenderError};

/// A request for labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintRequest {
    /// Id encoded into every label
    pub id: String,
    /// Number of labels
    pub amount: u32,
    /// Requester, resolved to the caption name
    pub requested_by: String,
}

/// Change feed envelope: `{"data": {"record": {...}}}`
#[derive(Deserialize)]
struct ChangeEvent {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    record: PrintRequest,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Event(ChangeEvent),
    Bare(PrintRequest),
}

impl PrintRequest {
    /// Parse a bare request or a change feed event wrapping one
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_str(line)? {
            Incoming::Event(event) => event.data.record,
            Incoming::Bare(request) => request,
        })
    }
}

/// Content of one label's QR code
#[derive(Debug, Serialize)]
pub struct LabelPayload<'a> {
    pub id: &'a str,
    pub number: u32,
}

/// Handler failures
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Request asks for {amount} labels, at most {max} allowed")]
    TooManyLabels { amount: u32, max: u32 },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Failed to encode label payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Print(#[from] PrintJobError),

    #[error("Print worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Image of label `number` of request `id`
pub fn render_label(
    renderer: &dyn LabelRenderer,
    id: &str,
    name: &str,
    number: u32,
) -> Result<DynamicImage, HandlerError> {
    let payload = serde_json::to_string(&LabelPayload { id, number })?;
    let caption = format!("{name} {number}");
    Ok(renderer.render(&payload, &caption)?)
}

/// Turns requests into printed labels
pub struct LabelHandler {
    printer: SharedPrinter,
    names: FallbackLookup,
    renderer: Arc<dyn LabelRenderer>,
    max_labels: u32,
}

impl LabelHandler {
    pub fn new(
        printer: SharedPrinter,
        names: FallbackLookup,
        renderer: Arc<dyn LabelRenderer>,
    ) -> Self {
        Self {
            printer,
            names,
            renderer,
            max_labels: DEFAULT_MAX_LABELS,
        }
    }

    /// Reject requests for more than `max` labels
    pub fn with_max_labels(mut self, max: u32) -> Self {
        self.max_labels = max.max(1);
        self
    }

    /// Render and print every label of `request`, returning how many printed.
    ///
    /// The driver lock is held on a blocking worker for the whole request, so
    /// the connection monitor never interleaves with a label.
    pub async fn handle(&self, request: &PrintRequest) -> Result<usize, HandlerError> {
        let span = info_span!("request", id = %request.id, amount = request.amount);
        async {
            info!(requested_by = %request.requested_by, "Print request received");
            if request.amount > self.max_labels {
                return Err(HandlerError::TooManyLabels {
                    amount: request.amount,
                    max: self.max_labels,
                });
            }
            if request.amount == 0 {
                return Ok(0);
            }

            let name = self.names.name_for(&request.requested_by);
            let printer = self.printer.clone();
            let renderer = self.renderer.clone();
            let id = request.id.clone();
            let amount = request.amount;
            let worker_span = Span::current();

            let printed = tokio::task::spawn_blocking(move || {
                let _enter = worker_span.enter();
                let mut driver = printer.lock().unwrap_or_else(PoisonError::into_inner);
                for number in 1..=amount {
                    let printed = render_label(renderer.as_ref(), &id, &name, number)
                        .and_then(|image| Ok(driver.print_image(&image)?));
                    if let Err(e) = printed {
                        warn!(printed = number - 1, "Request stopped at label {}", number);
                        return Err(e);
                    }
                    debug!(number, "Label done");
                }
                Ok(amount as usize)
            })
            .await??;

            info!(printed, "Print request completed");
            Ok(printed)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::MapLookup;
    use labelprint_core::config::PrinterConfig;
    use labelprint_core::printer::{PrinterDriver, PrinterError};
    use labelprint_core::protocol::{
        ConnectionState, Packet, PacketCodec, ProtocolError, ReceiveBuffer, RequestCode,
        ResponseOffset, Transport, TransportError,
    };
    use pretty_assertions::assert_eq;
    use qrcode::types::QrError;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Link that is never open
    struct Unplugged;

    impl Transport for Unplugged {
        fn open(&mut self) -> Result<(), TransportError> {
            Err(TransportError::NotOpen)
        }
        fn close(&mut self) {}
        fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::NotOpen)
        }
        fn write(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::NotOpen)
        }
        fn reconnect(&mut self) -> Result<(), TransportError> {
            Err(TransportError::NotOpen)
        }
        fn clear_input(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Closed
        }
        fn exhaust(&mut self) {}
        fn describe(&self) -> String {
            "unplugged".to_string()
        }
    }

    /// Open link to a printer that never answers
    struct Mute;

    impl Transport for Mute {
        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            Ok(data.len())
        }
        fn reconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn clear_input(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Open
        }
        fn exhaust(&mut self) {}
        fn describe(&self) -> String {
            "mute".to_string()
        }
    }

    /// Healthy printer that acknowledges everything; records request types
    struct Agreeable {
        seen: Arc<Mutex<Vec<u8>>>,
        pending: Vec<u8>,
        codec: PacketCodec,
    }

    impl Agreeable {
        fn reply(request: &Packet) -> Option<Packet> {
            let command = RequestCode::from_code(request.kind)?;
            let kind = match command.response_offset() {
                ResponseOffset::Fixed(offset) => request.kind.wrapping_add(offset),
                ResponseOffset::Key => request.kind.wrapping_add(request.payload[0]),
                ResponseOffset::None => return None,
            };
            let payload = match command {
                RequestCode::Heartbeat => {
                    let mut hb = vec![0u8; 13];
                    hb[10] = 4;
                    hb
                }
                RequestCode::GetPrintStatus => vec![0, 1, 100, 0, 0, 0, 0, 0, 0, 0],
                _ => vec![1],
            };
            Some(Packet::new(kind, payload))
        }
    }

    impl Transport for Agreeable {
        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
            Ok(std::mem::take(&mut self.pending))
        }
        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let mut buffer = ReceiveBuffer::new();
            buffer.extend(data);
            for request in self.codec.decode_all(&mut buffer) {
                self.seen.lock().unwrap().push(request.kind);
                if let Some(reply) = Self::reply(&request) {
                    self.pending.extend(self.codec.encode(&reply).unwrap());
                }
            }
            Ok(data.len())
        }
        fn reconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn clear_input(&mut self) -> Result<(), TransportError> {
            self.pending.clear();
            Ok(())
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Open
        }
        fn exhaust(&mut self) {}
        fn describe(&self) -> String {
            "agreeable".to_string()
        }
    }

    /// Records what it was asked to render; fails on the `fail_at`th call
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
        fail_at: Option<usize>,
    }

    impl LabelRenderer for Recorder {
        fn render(&self, payload: &str, caption: &str) -> Result<DynamicImage, RenderError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((payload.to_string(), caption.to_string()));
            if Some(calls.len()) == self.fail_at {
                return Err(RenderError::Qr(QrError::DataTooLong));
            }
            Ok(DynamicImage::new_luma8(8, 1))
        }
    }

    fn fast_config() -> PrinterConfig {
        let mut config = PrinterConfig::default();
        config.timing.health_retry_delay_ms = 0;
        config.timing.round_delay_ms = 0;
        config.timing.progress_poll_ms = 0;
        config
    }

    fn handler(transport: Box<dyn Transport>, renderer: Arc<dyn LabelRenderer>) -> LabelHandler {
        let driver = PrinterDriver::new(transport, fast_config());
        let names = FallbackLookup::new(
            Box::new(MapLookup::new(HashMap::from([(
                "u-1".to_string(),
                "Mina".to_string(),
            )]))),
            "Unknown",
        );
        LabelHandler::new(Arc::new(Mutex::new(driver)), names, renderer)
    }

    fn agreeable() -> (Box<dyn Transport>, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = Agreeable {
            seen: seen.clone(),
            pending: Vec::new(),
            codec: PacketCodec::default(),
        };
        (Box::new(transport), seen)
    }

    fn start_prints(seen: &Mutex<Vec<u8>>) -> usize {
        let start = RequestCode::StartPrint.code();
        seen.lock().unwrap().iter().filter(|k| **k == start).count()
    }

    fn request(amount: u32, requested_by: &str) -> PrintRequest {
        PrintRequest {
            id: "42".to_string(),
            amount,
            requested_by: requested_by.to_string(),
        }
    }

    #[test]
    fn test_parse_bare_and_wrapped_requests() {
        let bare = PrintRequest::parse(r#"{"id":"42","amount":2,"requested_by":"u-1"}"#).unwrap();
        assert_eq!(bare, request(2, "u-1"));

        let wrapped = PrintRequest::parse(
            r#"{"data":{"record":{"id":"42","amount":2,"requested_by":"u-1","created_at":"x"}}}"#,
        )
        .unwrap();
        assert_eq!(wrapped, bare);

        assert!(PrintRequest::parse(r#"{"id":"42"}"#).is_err());
    }

    #[tokio::test]
    async fn test_labels_numbered_from_one() {
        let recorder = Arc::new(Recorder::default());
        let (transport, seen) = agreeable();
        let handler = handler(transport, recorder.clone());

        assert_eq!(handler.handle(&request(3, "u-1")).await.unwrap(), 3);
        assert_eq!(start_prints(&seen), 3);

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (r#"{"id":"42","number":1}"#.to_string(), "Mina 1".to_string()),
                (r#"{"id":"42","number":2}"#.to_string(), "Mina 2".to_string()),
                (r#"{"id":"42","number":3}"#.to_string(), "Mina 3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_requester_gets_placeholder() {
        let recorder = Arc::new(Recorder::default());
        let (transport, _) = agreeable();
        let handler = handler(transport, recorder.clone());
        handler.handle(&request(1, "u-404")).await.unwrap();
        assert_eq!(recorder.calls.lock().unwrap()[0].1, "Unknown 1");
    }

    #[tokio::test]
    async fn test_render_failure_keeps_earlier_labels() {
        let recorder = Arc::new(Recorder {
            fail_at: Some(2),
            ..Recorder::default()
        });
        let (transport, seen) = agreeable();
        let handler = handler(transport, recorder.clone());

        let err = handler.handle(&request(4, "u-1")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Render(_)));
        assert_eq!(start_prints(&seen), 1);
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_amount_over_limit_rejected_before_rendering() {
        let recorder = Arc::new(Recorder::default());
        let (transport, seen) = agreeable();
        let handler = handler(transport, recorder.clone()).with_max_labels(5);

        let err = handler.handle(&request(1_000_000, "u-1")).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::TooManyLabels {
                amount: 1_000_000,
                max: 5
            }
        ));
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(handler.handle(&request(5, "u-1")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_zero_amount_prints_nothing() {
        let handler = handler(Box::new(Unplugged), Arc::new(Recorder::default()));
        assert_eq!(handler.handle(&request(0, "u-1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_print_failure_reports_job_error() {
        let recorder = Arc::new(Recorder::default());
        let handler = handler(Box::new(Unplugged), recorder.clone());
        let err = handler.handle(&request(3, "u-1")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Print(_)));
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_ends_request_in_flight() {
        let mut config = fast_config();
        config.timing.round_delay_ms = 200;
        let mut driver = PrinterDriver::new(Box::new(Mute), config);
        let token = CancellationToken::new();
        driver.set_cancellation(token.clone());

        let names = FallbackLookup::new(Box::new(MapLookup::default()), "Unknown");
        let handler = Arc::new(LabelHandler::new(
            Arc::new(Mutex::new(driver)),
            names,
            Arc::new(Recorder::default()),
        ));

        // Uncancelled, the first label alone spends seconds in unanswered exchanges
        let task = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle(&request(3, "u-1")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("request ends soon after cancellation")
            .unwrap();
        assert!(matches!(
            result,
            Err(HandlerError::Print(PrintJobError {
                source: PrinterError::Protocol(ProtocolError::Cancelled { .. }),
                ..
            }))
        ));
    }
}
