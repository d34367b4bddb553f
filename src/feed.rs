//! Office events feed loaded through the cache manager.

use chrono::{Local, NaiveDateTime};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

use crate::cache::{CacheManager, CacheResult, CacheStorage};
use crate::net::Network;

/// Resource name of the feed, relative to the app base URL
pub const EVENTS_RESOURCE: &str = "events.json";

#[derive(Debug, Clone, Deserialize)]
pub struct EventsDocument {
  #[serde(default)]
  pub events: Vec<OfficeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficeEvent {
  pub title: String,
  /// `YYYY-MM-DD`
  pub date: String,
  /// `HH:MM`
  pub time: String,
  #[serde(default)]
  pub location: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub registration_url: String,
  #[serde(default)]
  pub capacity: i64,
  #[serde(default)]
  pub registered: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
  Open { spots_left: i64 },
  FullyBooked,
  Past,
}

impl OfficeEvent {
  /// Local start time, if `date` and `time` parse.
  pub fn starts_at(&self) -> Option<NaiveDateTime> {
    let stamp = format!("{} {}", self.date.trim(), self.time.trim());
    ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"]
      .iter()
      .find_map(|fmt| NaiveDateTime::parse_from_str(&stamp, fmt).ok())
  }

  pub fn spots_left(&self) -> i64 {
    self.capacity - self.registered
  }

  pub fn availability(&self, now: NaiveDateTime) -> Availability {
    if self.starts_at().is_some_and(|start| start < now) {
      return Availability::Past;
    }
    let spots_left = self.spots_left();
    if spots_left <= 0 {
      Availability::FullyBooked
    } else {
      Availability::Open { spots_left }
    }
  }

  /// One display line for the terminal listing.
  pub fn summary(&self, now: NaiveDateTime) -> String {
    let when = self
      .starts_at()
      .map(|t| t.format("%A, %B %-d, %Y at %-I:%M %p").to_string())
      .unwrap_or_else(|| format!("{} {}", self.date, self.time));

    let status = match self.availability(now) {
      Availability::Past => "Event Passed".to_string(),
      Availability::FullyBooked => "Fully Booked".to_string(),
      Availability::Open { spots_left } if spots_left <= 5 => {
        format!("{} spots left (filling up)", spots_left)
      }
      Availability::Open { spots_left } => format!("{} spots left", spots_left),
    };

    format!(
      "{} | {} | {} | {}/{} registered | {}",
      self.title, when, self.location, self.registered, self.capacity, status
    )
  }
}

/// Sort by start time; events whose date does not parse go last.
pub fn sort_events(events: &mut [OfficeEvent]) {
  events.sort_by_key(|e| (e.starts_at().is_none(), e.starts_at()));
}

pub fn parse_events(body: &[u8]) -> Result<Vec<OfficeEvent>> {
  let document: EventsDocument =
    serde_json::from_slice(body).map_err(|e| eyre!("Failed to parse events feed: {}", e))?;
  let mut events = document.events;
  sort_events(&mut events);
  Ok(events)
}

/// Load the feed through the cache manager.
pub async fn load_events<S: CacheStorage, N: Network>(
  manager: &CacheManager<S, N>,
) -> Result<CacheResult<Vec<OfficeEvent>>> {
  let result = manager.fetch(EVENTS_RESOURCE).await?;
  if !result.data.is_ok() {
    return Err(eyre!("HTTP error! status: {}", result.data.status));
  }

  let events = parse_events(&result.data.body)?;
  Ok(result.map(|_| events))
}

/// Current local time, for availability checks.
pub fn now() -> NaiveDateTime {
  Local::now().naive_local()
}
