//! Network reachability and link quality tracking.
//!
//! The state combines two signals: the platform link (pushed in through a
//! [`LinkMonitor`]) and an active probe against a known URL. A link that is
//! down is reported `Offline` without probing. Otherwise the probe round trip
//! decides the quality bucket.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::ApiError;
use crate::lock;
use crate::storage::KeyValueStore;
use crate::transport::Transport;

const COMPONENT: &str = "connectivity manager";
const STATE_KEY: &str = "connectivity_state";
const LAST_ONLINE_KEY: &str = "connectivity_last_online";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
  Wifi,
  Mobile,
  Ethernet,
  Offline,
  Unknown,
  Excellent,
  Good,
  Poor,
  Unstable,
}

impl NetworkState {
  pub fn is_online(self) -> bool {
    !matches!(self, NetworkState::Offline | NetworkState::Unknown)
  }

  pub fn is_high_speed(self) -> bool {
    matches!(
      self,
      NetworkState::Excellent | NetworkState::Good | NetworkState::Ethernet | NetworkState::Wifi
    )
  }

  /// Whether callers should shrink payloads or defer optional work.
  pub fn needs_optimization(self) -> bool {
    matches!(
      self,
      NetworkState::Poor | NetworkState::Unstable | NetworkState::Mobile
    )
  }

  /// Quality bucket for a measured round trip.
  pub fn from_latency(rtt: Duration) -> Self {
    match rtt.as_millis() {
      0..=99 => NetworkState::Excellent,
      100..=299 => NetworkState::Good,
      300..=999 => NetworkState::Poor,
      _ => NetworkState::Unstable,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      NetworkState::Wifi => "wifi",
      NetworkState::Mobile => "mobile",
      NetworkState::Ethernet => "ethernet",
      NetworkState::Offline => "offline",
      NetworkState::Unknown => "unknown",
      NetworkState::Excellent => "excellent",
      NetworkState::Good => "good",
      NetworkState::Poor => "poor",
      NetworkState::Unstable => "unstable",
    }
  }
}

impl fmt::Display for NetworkState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for NetworkState {
  type Err = ApiError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let state = match s {
      "wifi" => NetworkState::Wifi,
      "mobile" => NetworkState::Mobile,
      "ethernet" => NetworkState::Ethernet,
      "offline" => NetworkState::Offline,
      "unknown" => NetworkState::Unknown,
      "excellent" => NetworkState::Excellent,
      "good" => NetworkState::Good,
      "poor" => NetworkState::Poor,
      "unstable" => NetworkState::Unstable,
      other => return Err(ApiError::Parse(format!("unknown network state '{}'", other))),
    };
    Ok(state)
  }
}

/// Physical link as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
  Wifi,
  Mobile,
  Ethernet,
  None,
  Unknown,
}

impl LinkState {
  fn as_network_state(self) -> NetworkState {
    match self {
      LinkState::Wifi => NetworkState::Wifi,
      LinkState::Mobile => NetworkState::Mobile,
      LinkState::Ethernet => NetworkState::Ethernet,
      LinkState::None => NetworkState::Offline,
      LinkState::Unknown => NetworkState::Unknown,
    }
  }
}

/// Source of link change notifications.
pub trait LinkMonitor: Send + Sync {
  fn link_state(&self) -> LinkState;

  fn subscribe(&self) -> watch::Receiver<LinkState>;
}

/// Link monitor driven by explicit `set` calls.
pub struct ManualLinkMonitor {
  tx: watch::Sender<LinkState>,
}

impl ManualLinkMonitor {
  pub fn new(initial: LinkState) -> Self {
    let (tx, _) = watch::channel(initial);
    Self { tx }
  }

  pub fn set(&self, link: LinkState) {
    self.tx.send_replace(link);
  }
}

impl LinkMonitor for ManualLinkMonitor {
  fn link_state(&self) -> LinkState {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<LinkState> {
    self.tx.subscribe()
  }
}

#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
  /// `None` disables probing; the state then mirrors the link.
  pub probe_url: Option<String>,
  pub probe_timeout: Duration,
  pub check_interval: Duration,
  /// Polling cadence once the failure limit is reached.
  pub offline_backoff: BackoffPolicy,
  pub max_consecutive_failures: u32,
  /// Round trips kept for `average_latency`.
  pub latency_samples: usize,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: Some("https://pokeapi.co/api/v2/".to_string()),
      probe_timeout: Duration::from_secs(5),
      check_interval: Duration::from_secs(15),
      offline_backoff: BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(5 * 60)),
      max_consecutive_failures: 3,
      latency_samples: 10,
    }
  }
}

/// Tracks the current [`NetworkState`] and publishes transitions.
#[derive(Clone)]
pub struct ConnectivityManager {
  inner: Arc<ConnectivityInner>,
}

struct ConnectivityInner {
  config: ConnectivityConfig,
  transport: Arc<dyn Transport>,
  link: Arc<dyn LinkMonitor>,
  store: Arc<dyn KeyValueStore>,
  state: Mutex<ProbeState>,
  transitions: broadcast::Sender<NetworkState>,
  current: watch::Sender<NetworkState>,
  monitor: Mutex<Option<JoinHandle<()>>>,
  disposed: AtomicBool,
}

struct ProbeState {
  consecutive_failures: u32,
  latencies: VecDeque<Duration>,
  last_online: Option<DateTime<Utc>>,
}

impl ConnectivityManager {
  /// Create a manager, restoring the last persisted state as the initial one.
  pub fn new(
    config: ConnectivityConfig,
    transport: Arc<dyn Transport>,
    link: Arc<dyn LinkMonitor>,
    store: Arc<dyn KeyValueStore>,
  ) -> Self {
    let (initial, last_online) = restore(store.as_ref());
    let (transitions, _) = broadcast::channel(32);
    let (current, _) = watch::channel(initial);

    Self {
      inner: Arc::new(ConnectivityInner {
        config,
        transport,
        link,
        store,
        state: Mutex::new(ProbeState {
          consecutive_failures: 0,
          latencies: VecDeque::new(),
          last_online,
        }),
        transitions,
        current,
        monitor: Mutex::new(None),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  pub fn state(&self) -> NetworkState {
    *self.inner.current.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state().is_online()
  }

  pub fn is_high_speed(&self) -> bool {
    self.state().is_high_speed()
  }

  pub fn needs_optimization(&self) -> bool {
    self.state().needs_optimization()
  }

  pub fn consecutive_failures(&self) -> u32 {
    lock(&self.inner.state).consecutive_failures
  }

  pub fn last_online(&self) -> Option<DateTime<Utc>> {
    lock(&self.inner.state).last_online
  }

  /// Mean of the recent probe round trips.
  pub fn average_latency(&self) -> Option<Duration> {
    let state = lock(&self.inner.state);
    if state.latencies.is_empty() {
      return None;
    }
    let total: Duration = state.latencies.iter().sum();
    Some(total / state.latencies.len() as u32)
  }

  /// Stream of state transitions. Repeated identical states are not published.
  pub fn subscribe(&self) -> broadcast::Receiver<NetworkState> {
    self.inner.transitions.subscribe()
  }

  /// Latest-value view of the state.
  pub fn watch(&self) -> watch::Receiver<NetworkState> {
    self.inner.current.subscribe()
  }

  /// Probe now and update the state.
  pub async fn check_connectivity(&self) -> Result<NetworkState, ApiError> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }

    let link = self.inner.link.link_state();
    if link == LinkState::None {
      debug!("link down, skipping probe");
      return Ok(self.inner.set_state(NetworkState::Offline));
    }

    let Some(url) = self.inner.config.probe_url.as_deref() else {
      let state = link.as_network_state();
      if state.is_online() {
        lock(&self.inner.state).consecutive_failures = 0;
      }
      return Ok(self.inner.set_state(state));
    };

    let started = Instant::now();
    let probe = self
      .inner
      .transport
      .send_get(url, &[], self.inner.config.probe_timeout)
      .await;
    let rtt = started.elapsed();

    let state = match probe {
      Ok(response) if response.is_success() => self.inner.record_success(link, rtt),
      Ok(response) => self
        .inner
        .record_failure(&format!("probe returned status {}", response.status)),
      Err(e) => self.inner.record_failure(&e.to_string()),
    };
    Ok(self.inner.set_state(state))
  }

  /// Wait until the state is online. Returns `false` on timeout.
  pub async fn wait_for_connectivity(&self, timeout: Duration) -> bool {
    let mut rx = self.watch();
    let online = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_online())).await;
    matches!(online, Ok(Ok(_)))
  }

  /// Start the background monitor: a probe every `check_interval`, an
  /// immediate probe on every link change, and backed-off polling while
  /// offline.
  pub fn start(&self) {
    let mut monitor = lock(&self.inner.monitor);
    if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
      return;
    }
    if self.inner.disposed.load(Ordering::SeqCst) {
      return;
    }

    let manager = self.clone();
    *monitor = Some(tokio::spawn(async move { manager.run_monitor().await }));
    info!("connectivity monitor started");
  }

  async fn run_monitor(self) {
    let mut link_rx = self.inner.link.subscribe();
    let mut link_open = true;

    loop {
      if let Err(e) = self.check_connectivity().await {
        debug!(error = %e, "connectivity monitor exiting");
        break;
      }

      let delay = self.next_delay();
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = link_rx.changed(), if link_open => {
          match changed {
            Ok(()) => debug!(link = ?*link_rx.borrow(), "link changed"),
            Err(_) => link_open = false,
          }
        }
      }
    }
  }

  fn next_delay(&self) -> Duration {
    let failures = self.consecutive_failures();
    let limit = self.inner.config.max_consecutive_failures;
    if failures >= limit {
      self.inner.config.offline_backoff.delay(failures - limit)
    } else {
      self.inner.config.check_interval
    }
  }

  pub fn stop(&self) {
    if let Some(handle) = lock(&self.inner.monitor).take() {
      handle.abort();
      info!("connectivity monitor stopped");
    }
  }

  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    self.stop();
  }
}

impl ConnectivityInner {
  fn record_success(&self, link: LinkState, rtt: Duration) -> NetworkState {
    let mut state = lock(&self.state);
    state.consecutive_failures = 0;
    state.latencies.push_back(rtt);
    while state.latencies.len() > self.config.latency_samples.max(1) {
      state.latencies.pop_front();
    }

    if link == LinkState::Ethernet {
      NetworkState::Ethernet
    } else {
      NetworkState::from_latency(rtt)
    }
  }

  fn record_failure(&self, reason: &str) -> NetworkState {
    let mut state = lock(&self.state);
    state.consecutive_failures += 1;
    let failures = state.consecutive_failures;
    drop(state);

    // A link without a reachable probe target is not online. The failure
    // count only decides when polling switches to the backed-off cadence.
    if failures >= self.config.max_consecutive_failures {
      warn!(failures, reason, "connectivity probe failing, backing off");
    } else {
      debug!(failures, reason, "connectivity probe failed");
    }
    NetworkState::Offline
  }

  /// Publish `next` if it differs from the current state and persist it.
  fn set_state(&self, next: NetworkState) -> NetworkState {
    let now = Utc::now();
    if next.is_online() {
      lock(&self.state).last_online = Some(now);
    }

    let previous = self.current.send_replace(next);
    if previous != next {
      info!(from = %previous, to = %next, "network state changed");
      // No subscribers is fine.
      let _ = self.transitions.send(next);
    }

    self.persist(next, now);
    next
  }

  fn persist(&self, state: NetworkState, now: DateTime<Utc>) {
    if let Err(e) = self.store.set_string(STATE_KEY, state.as_str()) {
      warn!(error = %e, "failed to persist network state");
    }
    if state.is_online() {
      if let Err(e) = self.store.set_int(LAST_ONLINE_KEY, now.timestamp_millis()) {
        warn!(error = %e, "failed to persist last online time");
      }
    }
  }
}

fn restore(store: &dyn KeyValueStore) -> (NetworkState, Option<DateTime<Utc>>) {
  let state = match store.get_string(STATE_KEY) {
    Ok(Some(raw)) => raw.parse::<NetworkState>().unwrap_or_else(|e: ApiError| {
      warn!(error = %e, "discarding persisted network state");
      NetworkState::Unknown
    }),
    Ok(None) => NetworkState::Unknown,
    Err(e) => {
      warn!(error = %e, "failed to read persisted network state");
      NetworkState::Unknown
    }
  };

  let last_online = match store.get_int(LAST_ONLINE_KEY) {
    Ok(Some(millis)) => Utc.timestamp_millis_opt(millis).single(),
    Ok(None) => None,
    Err(e) => {
      warn!(error = %e, "failed to read last online time");
      None
    }
  };

  (state, last_online)
}
