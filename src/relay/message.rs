//! Relay message parsing and cursor-based deduplication.

use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// One relay message. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
  /// Unix seconds
  pub time: i64,
  #[serde(default)]
  pub title: Option<String>,
  pub message: String,
}

impl Message {
  pub fn title_or<'a>(&'a self, default: &'a str) -> &'a str {
    match self.title.as_deref() {
      Some(t) if !t.is_empty() => t,
      _ => default,
    }
  }
}

/// Newest message time seen by one subscription.
///
/// Only ever moves forward, even when overlapping cycles race on it.
#[derive(Debug)]
pub struct PollCursor(AtomicI64);

impl PollCursor {
  pub fn new(start: i64) -> Self {
    Self(AtomicI64::new(start))
  }

  pub fn get(&self) -> i64 {
    self.0.load(Ordering::SeqCst)
  }

  pub fn advance(&self, time: i64) {
    self.0.fetch_max(time, Ordering::SeqCst);
  }
}

/// Walk a newline-delimited body in order, handing every message newer than the
/// cursor to `on_message` and advancing the cursor as each one is accepted.
///
/// The comparison is against the cursor as it stands at that record, so an earlier
/// record with a larger time suppresses later, older ones in the same batch.
/// Lines that fail to parse, or carry an empty message, are skipped.
///
/// Returns the number of messages accepted.
pub fn process_batch(body: &str, cursor: &PollCursor, mut on_message: impl FnMut(&Message)) -> usize {
  let mut accepted = 0;

  for line in body.trim().lines() {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let message: Message = match serde_json::from_str(line) {
      Ok(m) => m,
      Err(e) => {
        tracing::trace!(error = %e, "skipping malformed relay record");
        continue;
      }
    };

    if message.message.is_empty() || message.time <= cursor.get() {
      continue;
    }

    on_message(&message);
    cursor.advance(message.time);
    accepted += 1;
  }

  accepted
}
