//! labelprint-service
//!
//! Reads print requests as JSON lines on stdin and prints their labels.
//! Config comes from `LABELPRINT_CONFIG` (default `labelprint.json`).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use labelprint_core::monitor::{ConnectionMonitor, MonitorConfig, MonitorEvent};
use labelprint_core::printer::PrinterDriver;
use labelprint_core::protocol::SerialTransport;
use labelprint_core::SharedPrinter;
use labelprint_service::{
    FallbackLookup, LabelHandler, MapLookup, PrintRequest, QrLabelRenderer, ServiceConfig,
};

const CONFIG_ENV: &str = "LABELPRINT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "labelprint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Interrupted,
    EndOfInput,
    PrinterLost,
}

fn load_config() -> Result<ServiceConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    if !Path::new(&path).exists() {
        warn!("Config file {} not found, using defaults", path);
        return Ok(ServiceConfig::default());
    }
    ServiceConfig::from_file(&path).with_context(|| format!("Failed to load config from {path}"))
}

/// Start printing the request on `line`, if it holds one
fn spawn_request(handler: &Arc<LabelHandler>, line: &str) -> Option<JoinHandle<()>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let request = match PrintRequest::parse(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring malformed request: {}", e);
            return None;
        }
    };
    let handler = handler.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = handler.handle(&request).await {
            error!(id = %request.id, "Print request failed: {:#}", anyhow::Error::new(e));
        }
    }))
}

/// Resolves when the running request ends; never while idle
async fn request_done(job: &mut Option<JoinHandle<()>>) {
    match job {
        Some(task) => {
            if let Err(e) = task.await {
                error!("Print request task failed: {}", e);
            }
        }
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("labelprint-service {}", labelprint_core::VERSION);
    let config = load_config()?;

    let transport = SerialTransport::new(config.printer.link.clone());
    let printer_config = config.printer.clone();
    let mut driver =
        tokio::task::spawn_blocking(move || PrinterDriver::connect(Box::new(transport), printer_config))
            .await?
            .context("Failed to initialize printer")?;

    let cancel = CancellationToken::new();
    driver.set_cancellation(cancel.clone());
    let printer: SharedPrinter = Arc::new(Mutex::new(driver));

    let (monitor, mut events) = ConnectionMonitor::spawn(
        printer.clone(),
        MonitorConfig::from(&config.printer),
        cancel.clone(),
    );

    let names = FallbackLookup::new(
        Box::new(MapLookup::new(config.names.clone())),
        config.placeholder_name.clone(),
    );
    let renderer = match &config.font_path {
        Some(path) => QrLabelRenderer::new(config.label_width)
            .with_font_file(path)
            .with_context(|| format!("Failed to load caption font {}", path.display()))?,
        None => {
            warn!("No font_path configured, captions will not be printed");
            QrLabelRenderer::new(config.label_width)
        }
    };
    let handler = Arc::new(
        LabelHandler::new(printer.clone(), names, Arc::new(renderer))
            .with_max_labels(config.max_labels_per_request),
    );

    info!("Waiting for print requests on stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut job: Option<JoinHandle<()>> = None;
    let shutdown = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Shutdown::Interrupted,
            event = events.recv() => match event {
                Some(MonitorEvent::Fatal { attempts, error }) => {
                    error!(attempts, "Printer connection lost: {}", error);
                    break Shutdown::PrinterLost;
                }
                Some(event) => debug!(?event, "Monitor event"),
                None => break Shutdown::PrinterLost,
            },
            _ = request_done(&mut job) => job = None,
            // One request at a time; the next line waits in the reader
            line = lines.next_line(), if job.is_none() => match line {
                Ok(Some(line)) => job = spawn_request(&handler, &line),
                Ok(None) => break Shutdown::EndOfInput,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break Shutdown::EndOfInput;
                }
            },
        }
    };

    info!(?shutdown, "Shutting down");
    if let Some(task) = job.take() {
        // Exchanges in flight abort between polling rounds
        cancel.cancel();
        if let Err(e) = task.await {
            error!("Print request task failed: {}", e);
        }
    }
    let exit = monitor.stop().await;
    debug!(?exit, "Connection monitor joined");

    tokio::task::spawn_blocking(move || {
        printer.lock().unwrap_or_else(PoisonError::into_inner).close();
    })
    .await?;

    if shutdown == Shutdown::PrinterLost {
        anyhow::bail!("Printer connection lost, exiting");
    }
    Ok(())
}
