//! Fixed-interval poll loop against the notification relay.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use super::message::{process_batch, PollCursor};
use crate::config::RelayConfig;
use crate::event::PollEvent;
use crate::net::Network;
use crate::notify::{NotificationSink, Permission};

/// Where and how often to poll.
#[derive(Debug, Clone)]
pub struct PollSettings {
  pub relay: Url,
  pub interval: Duration,
  pub default_title: String,
}

impl PollSettings {
  pub fn from_config(config: &RelayConfig) -> Result<Self> {
    Ok(Self {
      relay: config.base()?,
      interval: config.interval(),
      default_title: config.default_title.clone(),
    })
  }

  /// `<relay>/<topic>/json?poll=1&since=<since>`
  pub fn poll_url(&self, topic: &str, since: i64) -> Result<Url> {
    let mut url = self.relay.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Relay url {} cannot carry a path", self.relay))?
      .pop_if_empty()
      .push(topic)
      .push("json");
    url
      .query_pairs_mut()
      .clear()
      .append_pair("poll", "1")
      .append_pair("since", &since.to_string());
    Ok(url)
  }
}

#[derive(Debug)]
struct Shared {
  topic: String,
  cursor: PollCursor,
  cancelled: AtomicBool,
}

/// Handle to one running poll loop. Dropping it stops the loop.
///
/// Cycles that already started are left to finish and may still notify.
#[derive(Debug)]
pub struct Subscription {
  shared: Arc<Shared>,
  timer: JoinHandle<()>,
}

impl Subscription {
  pub fn topic(&self) -> &str {
    &self.shared.topic
  }

  /// Read-only view that outlives the handle.
  pub fn watch(&self) -> SubscriptionWatch {
    SubscriptionWatch(Arc::clone(&self.shared))
  }

  fn cancel(&self) {
    self.shared.cancelled.store(true, Ordering::SeqCst);
    self.timer.abort();
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[derive(Debug, Clone)]
pub struct SubscriptionWatch(Arc<Shared>);

impl SubscriptionWatch {
  #[allow(dead_code)]
  pub fn is_active(&self) -> bool {
    !self.0.cancelled.load(Ordering::SeqCst)
  }

  pub fn last_seen(&self) -> i64 {
    self.0.cursor.get()
  }
}

/// Owns at most one active subscription.
pub struct Poller<N: Network, K: NotificationSink> {
  network: Arc<N>,
  sink: Arc<K>,
  settings: Arc<PollSettings>,
  events: mpsc::UnboundedSender<PollEvent>,
  active: Option<Subscription>,
}

impl<N: Network, K: NotificationSink> Poller<N, K> {
  pub fn new(
    network: Arc<N>,
    sink: Arc<K>,
    settings: PollSettings,
    events: mpsc::UnboundedSender<PollEvent>,
  ) -> Self {
    Self {
      network,
      sink,
      settings: Arc::new(settings),
      events,
      active: None,
    }
  }

  #[allow(dead_code)]
  pub fn subscription(&self) -> Option<&Subscription> {
    self.active.as_ref()
  }

  fn report(&self, status: impl Into<String>) {
    let _ = self.events.send(PollEvent::status(status));
  }

  /// Start polling `topic`, replacing any running loop.
  ///
  /// Only messages newer than the moment of subscribing are surfaced.
  pub async fn subscribe(&mut self, topic: &str) -> Result<&Subscription> {
    let topic = topic.trim();
    if topic.is_empty() {
      self.report("Enter a topic first");
      return Err(eyre!("Enter a topic first"));
    }

    if self.sink.permission() != Permission::Granted {
      if self.sink.request_permission().await != Permission::Granted {
        self.report("Notifications permission required");
        return Err(eyre!("Notifications permission required"));
      }
      if let Err(e) = self
        .sink
        .show("Office Events", "You will now receive event notifications!")
      {
        tracing::warn!(error = %e, "failed to show confirmation notification");
      }
    }

    if let Some(previous) = self.active.take() {
      tracing::debug!(topic = previous.topic(), "replacing running poll loop");
      drop(previous);
    }

    let shared = Arc::new(Shared {
      topic: topic.to_string(),
      cursor: PollCursor::new(Utc::now().timestamp()),
      cancelled: AtomicBool::new(false),
    });

    let timer = tokio::spawn(run_timer(
      Arc::clone(&self.network),
      Arc::clone(&self.sink),
      Arc::clone(&self.settings),
      self.events.clone(),
      Arc::clone(&shared),
    ));

    tracing::info!(topic, interval_ms = self.settings.interval.as_millis() as u64, "subscribed");
    self.report(format!("Connected to {} (polling)", topic));

    let subscription = self.active.insert(Subscription { shared, timer });
    Ok(&*subscription)
  }

  /// Stop the running loop, if any.
  pub fn unsubscribe(&mut self) {
    if let Some(subscription) = self.active.take() {
      tracing::info!(topic = subscription.topic(), "unsubscribed");
      drop(subscription);
    }
    self.report("Disconnected");
    let _ = self.events.send(PollEvent::Unsubscribed { at: Utc::now() });
  }
}

async fn run_timer<N: Network, K: NotificationSink>(
  network: Arc<N>,
  sink: Arc<K>,
  settings: Arc<PollSettings>,
  events: mpsc::UnboundedSender<PollEvent>,
  shared: Arc<Shared>,
) {
  let mut ticker = tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    ticker.tick().await;
    if shared.cancelled.load(Ordering::SeqCst) {
      break;
    }
    // Cycles run detached so a slow relay never delays the next tick
    tokio::spawn(poll_cycle(
      Arc::clone(&network),
      Arc::clone(&sink),
      Arc::clone(&settings),
      events.clone(),
      Arc::clone(&shared),
    ));
  }
}

async fn poll_cycle<N: Network, K: NotificationSink>(
  network: Arc<N>,
  sink: Arc<K>,
  settings: Arc<PollSettings>,
  events: mpsc::UnboundedSender<PollEvent>,
  shared: Arc<Shared>,
) {
  let url = match settings.poll_url(&shared.topic, shared.cursor.get()) {
    Ok(url) => url,
    Err(e) => {
      tracing::warn!(error = %e, "cannot build poll url");
      return;
    }
  };

  let resource = match network.fetch(&url).await {
    Ok(resource) => resource,
    Err(e) => {
      tracing::warn!(topic = %shared.topic, error = %e, "relay polling error");
      let _ = events.send(PollEvent::status("Connection error - retrying..."));
      return;
    }
  };

  if !resource.is_ok() {
    tracing::debug!(topic = %shared.topic, status = resource.status, "relay answered non-OK");
    return;
  }

  let body = resource.text();
  if body.trim().is_empty() {
    return;
  }

  process_batch(&body, &shared.cursor, |message| {
    let title = message.title_or(&settings.default_title);
    if let Err(e) = sink.show(title, &message.message) {
      tracing::warn!(error = %e, "failed to show notification");
    }
    tracing::info!(topic = %shared.topic, time = message.time, title, "notification shown");
    let _ = events.send(PollEvent::Notified {
      time: message.time,
      title: title.to_string(),
      message: message.message.clone(),
    });
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Resource;
  use crate::event::EventHandler;
  use crate::net::testing::FakeNetwork;
  use crate::notify::testing::RecordingSink;

  const RELAY: &str = "https://relay.test";

  fn settings() -> PollSettings {
    PollSettings {
      relay: Url::parse(RELAY).unwrap(),
      interval: Duration::from_millis(3000),
      default_title: "Office Event".to_string(),
    }
  }

  fn poller(
    network: &Arc<FakeNetwork>,
    sink: &Arc<RecordingSink>,
  ) -> (Poller<FakeNetwork, RecordingSink>, EventHandler) {
    let events = EventHandler::new();
    let poller = Poller::new(
      Arc::clone(network),
      Arc::clone(sink),
      settings(),
      events.sender(),
    );
    (poller, events)
  }

  fn statuses(events: &mut EventHandler) -> Vec<String> {
    events
      .drain()
      .into_iter()
      .filter_map(|e| match e {
        PollEvent::Status(s) => Some(s),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn test_poll_url_shape() {
    let url = settings().poll_url("office-events-abc123", 1_700_000_000).unwrap();
    assert_eq!(
      url.as_str(),
      "https://relay.test/office-events-abc123/json?poll=1&since=1700000000"
    );
  }

  #[test]
  fn test_poll_url_keeps_relay_path_prefix() {
    let mut s = settings();
    s.relay = Url::parse("https://example.com/ntfy/").unwrap();
    let url = s.poll_url("t", 5).unwrap();
    assert_eq!(url.as_str(), "https://example.com/ntfy/t/json?poll=1&since=5");
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_topic_is_rejected() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, mut events) = poller(&network, &sink);

    assert!(poller.subscribe("   ").await.is_err());
    assert!(poller.subscription().is_none());
    assert_eq!(statuses(&mut events), vec!["Enter a topic first"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_denied_permission_does_not_start_polling() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::new(Permission::Default, Permission::Denied));
    let (mut poller, mut events) = poller(&network, &sink);

    let err = poller.subscribe("office-events-x").await.unwrap_err();
    assert!(err.to_string().contains("permission required"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(network.request_count(), 0);
    assert_eq!(statuses(&mut events), vec!["Notifications permission required"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_newly_granted_permission_shows_confirmation() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::new(Permission::Default, Permission::Granted));
    let (mut poller, _events) = poller(&network, &sink);

    poller.subscribe("office-events-x").await.unwrap();
    assert_eq!(
      sink.shown(),
      vec![(
        "Office Events".to_string(),
        "You will now receive event notifications!".to_string()
      )]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_poll_waits_one_interval() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, mut events) = poller(&network, &sink);

    poller.subscribe("office-events-x").await.unwrap();
    assert_eq!(
      statuses(&mut events),
      vec!["Connected to office-events-x (polling)"]
    );
    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(network.request_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let requests = network.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path(), "/office-events-x/json");
    assert!(requests[0].query().unwrap().starts_with("poll=1&since="));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cycle_notifies_in_order_and_advances_cursor() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, mut events) = poller(&network, &sink);

    let now = Utc::now().timestamp();
    let body = format!(
      "{{\"time\":{},\"title\":\"Lunch\",\"message\":\"a\"}}\nnot-json\n{{\"time\":{},\"message\":\"b\"}}\n{{\"time\":{},\"message\":\"old\"}}\n",
      now + 100,
      now + 50,
      now - 1000
    );
    network.queue(&format!("{RELAY}/office-events-x/json"), Ok(Resource::new(200, body)));

    let watch = poller.subscribe("office-events-x").await.unwrap().watch();
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(sink.shown(), vec![("Lunch".to_string(), "a".to_string())]);
    assert_eq!(watch.last_seen(), now + 100);

    let notified: Vec<_> = events
      .drain()
      .into_iter()
      .filter(|e| matches!(e, PollEvent::Notified { .. }))
      .collect();
    assert_eq!(notified.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_errors_do_not_stop_the_loop() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, mut events) = poller(&network, &sink);

    let target = format!("{RELAY}/office-events-x/json");
    let now = Utc::now().timestamp();
    network.queue(&target, Err("connection reset".to_string()));
    network.queue(&target, Ok(Resource::new(502, "bad gateway")));
    network.queue(&target, Ok(Resource::new(200, "  \n")));
    network.queue(
      &target,
      Ok(Resource::new(200, format!("{{\"time\":{},\"message\":\"back\"}}", now + 10))),
    );

    poller.subscribe("office-events-x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(12_500)).await;

    assert_eq!(network.request_count(), 4);
    assert_eq!(sink.bodies(), vec!["back"]);
    assert!(statuses(&mut events).contains(&"Connection error - retrying...".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cursor_is_monotonic_across_cycles() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, _events) = poller(&network, &sink);

    let target = format!("{RELAY}/office-events-x/json");
    let now = Utc::now().timestamp();
    for offset in [300, 100, 200, 400] {
      network.queue(
        &target,
        Ok(Resource::new(200, format!("{{\"time\":{},\"message\":\"m{}\"}}", now + offset, offset))),
      );
    }

    let watch = poller.subscribe("office-events-x").await.unwrap().watch();
    let mut last = watch.last_seen();
    tokio::time::sleep(Duration::from_millis(500)).await;
    for _ in 0..4 {
      tokio::time::sleep(Duration::from_millis(3000)).await;
      assert!(watch.last_seen() >= last);
      last = watch.last_seen();
    }

    assert_eq!(sink.bodies(), vec!["m300", "m400"]);
    assert_eq!(watch.last_seen(), now + 400);
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribe_twice_leaves_one_loop() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, _events) = poller(&network, &sink);

    let first = poller.subscribe("topic-a").await.unwrap().watch();
    let second = poller.subscribe("topic-b").await.unwrap().watch();

    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(poller.subscription().unwrap().topic(), "topic-b");

    tokio::time::sleep(Duration::from_millis(6500)).await;
    let requests = network.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|u| u.path() == "/topic-b/json"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribe_stops_polling_and_is_idempotent() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, mut events) = poller(&network, &sink);

    let watch = poller.subscribe("office-events-x").await.unwrap().watch();
    poller.unsubscribe();
    poller.unsubscribe();

    assert!(!watch.is_active());
    assert!(poller.subscription().is_none());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(network.request_count(), 0);

    let drained = events.drain();
    let unsubscribed = drained
      .iter()
      .filter(|e| matches!(e, PollEvent::Unsubscribed { .. }))
      .count();
    assert_eq!(unsubscribed, 2);
    assert!(drained.contains(&PollEvent::status("Disconnected")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropping_the_handle_stops_polling() {
    let network = Arc::new(FakeNetwork::new());
    let sink = Arc::new(RecordingSink::granted());
    let (mut poller, _events) = poller(&network, &sink);

    poller.subscribe("office-events-x").await.unwrap();
    drop(poller);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(network.request_count(), 0);
  }
}
