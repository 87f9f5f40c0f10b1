//! Network reachability signal.
//!
//! `ConnectivityMonitor` holds the current best-known online state and
//! publishes an event on every edge. It is fed either directly (tests, UI
//! toggles) or by a background `Probe` loop. The state is only a hint: a
//! reported edge means "worth trying", not "the remote will accept writes".

use async_trait::async_trait;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

/// An edge in the connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

impl ConnectivityEvent {
  fn from_state(online: bool) -> Self {
    if online {
      Self::Online
    } else {
      Self::Offline
    }
  }
}

struct Shared {
  state: watch::Sender<bool>,
  events: broadcast::Sender<ConnectivityEvent>,
}

/// Observable online/offline state with edge notifications.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  shared: Arc<Shared>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (state, _) = watch::channel(online);
    let (events, _) = broadcast::channel(16);
    Self {
      shared: Arc::new(Shared { state, events }),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.shared.state.borrow()
  }

  /// Record the latest signal. Returns `true` if this was an edge.
  ///
  /// Repeating the current state publishes nothing.
  pub fn set_online(&self, online: bool) -> bool {
    let events = &self.shared.events;
    let changed = self.shared.state.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      // Published under the state lock so event order matches state order
      let _ = events.send(ConnectivityEvent::from_state(online));
      true
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Watch the current state.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.shared.state.subscribe()
  }

  /// Receive every edge published after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.shared.events.subscribe()
  }

  /// Edges as a stream, ending when every monitor handle is dropped.
  pub fn transitions(&self) -> impl Stream<Item = ConnectivityEvent> + Send + 'static {
    futures::stream::unfold(self.subscribe(), |mut rx| async move {
      loop {
        match rx.recv().await {
          Ok(event) => return Some((event, rx)),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Connectivity listener lagged");
          }
          Err(broadcast::error::RecvError::Closed) => return None,
        }
      }
    })
  }
}

/// A reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
  async fn check(&self) -> bool;
}

/// Probe that treats any HTTP response from `url` as reachable.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, url })
  }
}

#[async_trait]
impl Probe for HttpProbe {
  async fn check(&self) -> bool {
    // Even a 401/404 proves the network path works
    match self.client.head(self.url.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(url = %self.url, error = %e, "Reachability probe failed");
        false
      }
    }
  }
}

/// Run `probe` every `interval` and feed the result into `monitor`.
pub fn spawn_probe<P>(monitor: ConnectivityMonitor, probe: P, interval: Duration) -> JoinHandle<()>
where
  P: Probe + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let online = probe.check().await;
      monitor.set_online(online);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[test]
  fn test_set_online_reports_edges_only() {
    let monitor = ConnectivityMonitor::new(true);

    assert!(!monitor.set_online(true));
    assert!(monitor.set_online(false));
    assert!(!monitor.is_online());
    assert!(!monitor.set_online(false));
    assert!(monitor.set_online(true));
  }

  #[tokio::test]
  async fn test_one_event_per_edge() {
    let monitor = ConnectivityMonitor::new(true);
    let mut rx = monitor.subscribe();

    monitor.set_online(true);
    monitor.set_online(false);
    monitor.set_online(false);
    monitor.set_online(true);
    monitor.set_online(true);

    assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::Offline);
    assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::Online);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_transitions_stream() {
    let monitor = ConnectivityMonitor::new(false);
    let mut transitions = Box::pin(monitor.transitions());

    monitor.set_online(true);
    monitor.set_online(false);

    assert_eq!(transitions.next().await, Some(ConnectivityEvent::Online));
    assert_eq!(transitions.next().await, Some(ConnectivityEvent::Offline));
  }

  #[tokio::test]
  async fn test_watch_sees_current_state() {
    let monitor = ConnectivityMonitor::new(false);
    let mut state = monitor.watch();

    monitor.set_online(true);
    state.changed().await.unwrap();
    assert!(*state.borrow_and_update());
  }

  struct ScriptedProbe {
    online: Arc<AtomicBool>,
  }

  #[async_trait]
  impl Probe for ScriptedProbe {
    async fn check(&self) -> bool {
      self.online.load(Ordering::SeqCst)
    }
  }

  #[tokio::test]
  async fn test_probe_loop_feeds_monitor() {
    let monitor = ConnectivityMonitor::new(true);
    let online = Arc::new(AtomicBool::new(false));
    let mut rx = monitor.subscribe();

    let handle = spawn_probe(
      monitor.clone(),
      ScriptedProbe {
        online: online.clone(),
      },
      Duration::from_millis(10),
    );

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(event, ConnectivityEvent::Offline);

    online.store(true, Ordering::SeqCst);
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(event, ConnectivityEvent::Online);

    handle.abort();
  }
}
