//! Delivery of findings to an external alerting channel.
//!
//! A [`Notifier`] owns a background task holding every pending delivery
//! together with its attempt count and next retry time. Callers hand events
//! over through a [`NotifierHandle`] and never wait on the channel; a
//! [`DeliveryTicket`] can be awaited when the outcome matters.
pub mod telegram;

use std::fmt::Write as _;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::time::DelayQueue;

use crate::error::DeliveryError;
use crate::model::{NotificationEvent, ScanReport};

/// A concrete alerting channel.
#[async_trait]
pub trait Notify: Send + Sync {
    /// Makes one delivery attempt.
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failed` failed attempts.
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Final state of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Undelivered { attempts: u32, error: DeliveryError },
}

impl DeliveryOutcome {
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Totals handed back when the notifier shuts down.
#[derive(Debug, Default)]
pub struct NotifierReport {
    pub delivered: usize,
    /// Events that exhausted their retries, with the last error.
    pub undelivered: Vec<(NotificationEvent, DeliveryError)>,
}

struct Delivery {
    event: NotificationEvent,
    attempts: u32,
    next_retry: Instant,
    reply: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl Delivery {
    fn resolve(mut self, outcome: DeliveryOutcome) -> NotificationEvent {
        if let Some(reply) = self.reply.take() {
            // The caller may have dropped its ticket.
            let _ = reply.send(outcome);
        }
        self.event
    }
}

/// Awaitable outcome of one submitted event.
#[derive(Debug)]
pub struct DeliveryTicket(oneshot::Receiver<DeliveryOutcome>);

impl DeliveryTicket {
    pub async fn outcome(self) -> DeliveryOutcome {
        self.0.await.unwrap_or(DeliveryOutcome::Undelivered {
            attempts: 0,
            error: DeliveryError::Closed,
        })
    }
}

/// Cheap, cloneable submitter of events.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl NotifierHandle {
    /// Queues `event` for delivery and returns immediately.
    pub fn notify(&self, event: NotificationEvent) -> DeliveryTicket {
        let (reply, ticket) = oneshot::channel();
        let delivery = Delivery {
            event,
            attempts: 0,
            next_retry: Instant::now(),
            reply: Some(reply),
        };
        if let Err(mpsc::error::SendError(delivery)) = self.tx.send(delivery) {
            warn!("Notifier stopped, event not queued");
            delivery.resolve(DeliveryOutcome::Undelivered {
                attempts: 0,
                error: DeliveryError::Closed,
            });
        }
        DeliveryTicket(ticket)
    }
}

/// Background delivery task with retries.
pub struct Notifier {
    handle: NotifierHandle,
    task: JoinHandle<NotifierReport>,
}

impl Notifier {
    pub fn spawn(backend: Arc<dyn Notify>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(backend, policy, rx));
        Self {
            handle: NotifierHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> NotifierHandle {
        self.handle.clone()
    }

    pub fn notify(&self, event: NotificationEvent) -> DeliveryTicket {
        self.handle.notify(event)
    }

    /// Stops accepting events once every handle is dropped, finishes all
    /// pending deliveries (including their retries) and reports the totals.
    pub async fn shutdown(self) -> NotifierReport {
        drop(self.handle);
        self.task.await.unwrap_or_else(|e| {
            warn!("Notifier task failed: {e}");
            NotifierReport::default()
        })
    }
}

async fn deliver(
    backend: Arc<dyn Notify>,
    policy: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) -> NotifierReport {
    let mut pending: DelayQueue<Delivery> = DelayQueue::new();
    let mut report = NotifierReport::default();
    let mut accepting = true;

    while accepting || !pending.is_empty() {
        tokio::select! {
            received = rx.recv(), if accepting => match received {
                Some(delivery) => {
                    pending.insert(delivery, Duration::ZERO);
                }
                None => accepting = false,
            },
            Some(expired) = pending.next(), if !pending.is_empty() => {
                let mut delivery = expired.into_inner();
                delivery.attempts += 1;
                debug!(
                    "Delivery attempt {}, {:?} behind schedule",
                    delivery.attempts,
                    delivery.next_retry.elapsed()
                );

                match backend.send(&delivery.event).await {
                    Ok(()) => {
                        debug!("Notification delivered after {} attempts", delivery.attempts);
                        report.delivered += 1;
                        let attempts = delivery.attempts;
                        delivery.resolve(DeliveryOutcome::Delivered { attempts });
                    }
                    Err(error) if delivery.attempts >= policy.max_attempts.get() => {
                        warn!("Notification undelivered after {} attempts: {error}", delivery.attempts);
                        let attempts = delivery.attempts;
                        let event = delivery.resolve(DeliveryOutcome::Undelivered {
                            attempts,
                            error: error.clone(),
                        });
                        report.undelivered.push((event, error));
                    }
                    Err(error) => {
                        let backoff = policy.backoff(delivery.attempts);
                        delivery.next_retry = Instant::now() + backoff;
                        info!(
                            "Notification attempt {} failed ({error}), retrying in {backoff:?}",
                            delivery.attempts
                        );
                        pending.insert(delivery, backoff);
                    }
                }
            }
        }
    }

    report
}

/// Renders an event as Telegram flavoured HTML.
pub fn render(event: &NotificationEvent) -> String {
    match event {
        NotificationEvent::Report(report) => render_report(report),
        NotificationEvent::Changes { target, changes } => {
            let mut text = format!("<b>Changes on {}</b>", escape_html(&target.to_string()));
            for change in changes {
                let _ = write!(text, "\n{}", escape_html(&change.to_string()));
            }
            text
        }
        NotificationEvent::Error { message } => {
            format!("<b>Scan error</b>\n{}", escape_html(message))
        }
        NotificationEvent::Notice { message } => escape_html(message),
    }
}

fn render_report(report: &ScanReport) -> String {
    let mut text = format!(
        "<b>Scan report for {}</b>",
        escape_html(&report.target.to_string())
    );
    match report.host_up {
        Some(true) => text.push_str("\nHost is up"),
        Some(false) => text.push_str("\nHost did not answer ping"),
        None => {}
    }

    let _ = write!(text, "\nOpen ports: {}", report.open_ports.len());
    for finding in &report.open_ports {
        let _ = write!(
            text,
            "\n  {}/{} {}",
            finding.port,
            finding.protocol,
            escape_html(&finding.service)
        );
    }

    let summary = &report.summary;
    let _ = write!(
        text,
        "\nClosed: {}, filtered: {}, timeout: {}, errors: {}",
        summary.closed, summary.filtered, summary.timeout, summary.error
    );
    text
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c => escaped.push(c),
        }
    }
    escaped
}
