use chrono::{DateTime, Local, TimeZone, Utc};
use tokio::sync::mpsc;

/// Events reported by the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
  /// Human-readable status for the current subscription
  Status(String),
  /// A message was surfaced as a notification
  Notified {
    time: i64,
    title: String,
    message: String,
  },
  /// The subscription was stopped
  Unsubscribed { at: DateTime<Utc> },
}

impl PollEvent {
  pub fn status(text: impl Into<String>) -> Self {
    Self::Status(text.into())
  }

  /// Message log line, or None for status updates.
  pub fn log_line(&self) -> Option<String> {
    match self {
      Self::Status(_) => None,
      Self::Notified {
        time,
        title,
        message,
      } => {
        let at = Local
          .timestamp_opt(*time, 0)
          .single()
          .map(|t| t.format("%H:%M:%S").to_string())
          .unwrap_or_else(|| time.to_string());
        Some(format!("[{}] {}: {}", at, title, message))
      }
      Self::Unsubscribed { at } => Some(format!(
        "[{}] Unsubscribed",
        at.with_timezone(&Local).format("%H:%M:%S")
      )),
    }
  }
}

/// Receiving end of the poll loop's event channel
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<PollEvent>,
  tx: mpsc::UnboundedSender<PollEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { rx, tx }
  }

  /// Get a sender for the poll loop
  pub fn sender(&self) -> mpsc::UnboundedSender<PollEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<PollEvent> {
    self.rx.recv().await
  }

  /// Drain events that are already queued
  pub fn drain(&mut self) -> Vec<PollEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}
