//! Connection monitor
//!
//! Background task that heartbeats the printer on a fixed interval and
//! reinitializes the link when it stops answering. After too many failed
//! attempts it gives up, marks the link exhausted and reports
//! [`MonitorEvent::Fatal`] once.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PrinterConfig;
use crate::printer::{PrinterDriver, PrinterError};
use crate::SharedPrinter;

/// Monitor timing and escalation bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Pause between heartbeats
    pub interval: Duration,
    /// Failures tolerated before the link is given up
    pub max_reinit_attempts: u32,
    /// Pause between closing and reopening the link
    pub reconnect_delay: Duration,
    /// Pause after reopening before talking to the printer
    pub reopen_settle: Duration,
}

impl From<&PrinterConfig> for MonitorConfig {
    fn from(config: &PrinterConfig) -> Self {
        Self {
            interval: config.monitor.interval(),
            max_reinit_attempts: config.monitor.max_reinit_attempts.max(1),
            reconnect_delay: config.link.reconnect_delay(),
            reopen_settle: config.link.reopen_settle(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&PrinterConfig::default())
    }
}

/// Status updates published by the monitor
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A heartbeat went unanswered
    HeartbeatFailed {
        attempt: u32,
        error: Arc<PrinterError>,
    },
    /// The link was reopened and the label settings reapplied
    Reinitialized { attempt: u32 },
    /// Reopening the link did not work
    ReinitFailed {
        attempt: u32,
        error: Arc<PrinterError>,
    },
    /// Heartbeats answer again after failures
    Recovered { after_failures: u32 },
    /// The monitor gave up; the link is exhausted
    Fatal {
        attempts: u32,
        error: Arc<PrinterError>,
    },
}

/// Why the monitor task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Cancelled by its owner
    Stopped,
    /// Gave up on the printer
    Fatal,
}

enum Reinit {
    Done,
    Cancelled,
}

async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Run `f` on the blocking pool while holding the driver lock.
///
/// A poisoned lock is recovered; the next exchange resynchronizes the link.
pub async fn with_printer<T, F>(printer: &SharedPrinter, f: F) -> Result<T, PrinterError>
where
    F: FnOnce(&mut PrinterDriver) -> Result<T, PrinterError> + Send + 'static,
    T: Send + 'static,
{
    let printer = printer.clone();
    tokio::task::spawn_blocking(move || {
        let mut driver = printer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut driver)
    })
    .await
    .map_err(|e| PrinterError::Worker(e.to_string()))?
}

/// Handle to a running monitor task
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    /// Cancel the monitor and wait for the task to finish
    pub async fn stop(self) -> MonitorExit {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the task to end on its own
    pub async fn wait(self) -> MonitorExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("Connection monitor task failed: {}", e);
                MonitorExit::Stopped
            }
        }
    }

    /// True once the task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Periodic heartbeat and link recovery
pub struct ConnectionMonitor {
    printer: SharedPrinter,
    config: MonitorConfig,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<MonitorEvent>,
    failures: u32,
}

impl ConnectionMonitor {
    /// Start monitoring `printer` on the current tokio runtime.
    ///
    /// `cancel` should be the token installed on the driver so that stopping
    /// the monitor also interrupts an exchange in flight.
    pub fn spawn(
        printer: SharedPrinter,
        config: MonitorConfig,
        cancel: CancellationToken,
    ) -> (MonitorHandle, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            printer,
            config,
            cancel: cancel.clone(),
            events,
            failures: 0,
        };

        let span = info_span!("monitor", interval_ms = config.interval.as_millis() as u64);
        let task = tokio::spawn(monitor.run().instrument(span));
        (MonitorHandle { cancel, task }, rx)
    }

    fn emit(&self, event: MonitorEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn run(mut self) -> MonitorExit {
        info!("Connection monitor started");

        loop {
            if sleep_or_cancel(&self.cancel, self.config.interval).await {
                break;
            }

            let error = match with_printer(&self.printer, |p| Ok(p.heartbeat()?)).await {
                Ok(status) => {
                    if self.failures > 0 {
                        info!(after_failures = self.failures, "Printer answering again");
                        self.emit(MonitorEvent::Recovered {
                            after_failures: self.failures,
                        });
                    }
                    debug!(?status, "Heartbeat ok");
                    self.failures = 0;
                    continue;
                }
                Err(e) => Arc::new(e),
            };

            if self.cancel.is_cancelled() {
                break;
            }

            self.failures += 1;
            warn!(attempt = self.failures, "Heartbeat failed: {}", error);
            self.emit(MonitorEvent::HeartbeatFailed {
                attempt: self.failures,
                error: error.clone(),
            });

            if self.failures > self.config.max_reinit_attempts {
                return self.give_up(error).await;
            }

            match self.reinitialize().await {
                Ok(Reinit::Done) => {
                    info!(attempt = self.failures, "Printer link reinitialized");
                    self.emit(MonitorEvent::Reinitialized {
                        attempt: self.failures,
                    });
                }
                Ok(Reinit::Cancelled) => break,
                Err(e) => {
                    let error = Arc::new(e);
                    warn!(attempt = self.failures, "Reinitialization failed: {}", error);
                    self.emit(MonitorEvent::ReinitFailed {
                        attempt: self.failures,
                        error: error.clone(),
                    });
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if self.failures >= self.config.max_reinit_attempts {
                        return self.give_up(error).await;
                    }
                }
            }
        }

        info!("Connection monitor stopped");
        MonitorExit::Stopped
    }

    /// Close, pause, reopen, settle, reapply settings
    async fn reinitialize(&self) -> Result<Reinit, PrinterError> {
        with_printer(&self.printer, |p| {
            p.close_link();
            Ok(())
        })
        .await?;
        if sleep_or_cancel(&self.cancel, self.config.reconnect_delay).await {
            return Ok(Reinit::Cancelled);
        }

        with_printer(&self.printer, |p| p.reopen_link()).await?;
        if sleep_or_cancel(&self.cancel, self.config.reopen_settle).await {
            return Ok(Reinit::Cancelled);
        }

        with_printer(&self.printer, |p| p.apply_label_settings()).await?;
        Ok(Reinit::Done)
    }

    async fn give_up(&self, error: Arc<PrinterError>) -> MonitorExit {
        error!(
            attempts = self.failures,
            "Printer lost after {} attempts: {}", self.failures, error
        );
        if let Err(e) = with_printer(&self.printer, |p| {
            p.exhaust_link();
            Ok(())
        })
        .await
        {
            warn!("Could not mark link exhausted: {}", e);
        }
        self.emit(MonitorEvent::Fatal {
            attempts: self.failures,
            error,
        });
        MonitorExit::Fatal
    }
}
