// =============================================================================
// Event Bus — priority-ordered async pub/sub with bounded history
// =============================================================================
//
// The single coordination fabric between engine components. Handlers for an
// event run in descending priority order; a handler failure is logged and
// counted but never reaches sibling handlers or the publisher.
//
// Two dispatch modes:
//   - sequential (default): handlers run one after another in the publisher's
//     flow;
//   - concurrent: handlers run simultaneously, each under its own timeout.
//
// A bounded ring buffer retains the most recent events for diagnostics.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default per-handler timeout for concurrent dispatch.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the event history ring buffer.
const HISTORY_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Async event handler. Receives the published payload by value.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Predicate applied by [`EventBus::wait_for`] before resolving.
pub type EventFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Subscription options.
#[derive(Clone, Copy)]
pub struct SubscribeOpts {
    /// Handlers with higher priority run first.
    pub priority: i32,
    /// Auto-unsubscribe after the first successful dispatch.
    pub once: bool,
}

impl Default for SubscribeOpts {
    fn default() -> Self {
        Self {
            priority: 0,
            once: false,
        }
    }
}

/// Publish options.
#[derive(Clone, Copy)]
pub struct PublishOpts {
    /// Run handlers concurrently instead of sequentially.
    pub concurrent: bool,
    /// Per-handler timeout in concurrent mode.
    pub timeout: Duration,
}

impl Default for PublishOpts {
    fn default() -> Self {
        Self {
            concurrent: false,
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

/// One retained history entry.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub event: String,
    pub data: Value,
    pub ts: i64,
}

/// Bus counters for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    pub events_published: u64,
    pub events_handled: u64,
    pub errors: u64,
    pub subscriber_count: usize,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct Subscription {
    id: u64,
    priority: i32,
    once: bool,
    handler: EventHandler,
}

struct Waiter {
    filter: Option<EventFilter>,
    tx: oneshot::Sender<Value>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Process-wide event bus. Owned by `AppState`; cloned handles share state
/// through `Arc`.
pub struct EventBus {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    history: RwLock<VecDeque<EventRecord>>,
    next_sub_id: AtomicU64,
    next_event_id: AtomicU64,
    events_published: AtomicU64,
    events_handled: AtomicU64,
    errors: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            next_sub_id: AtomicU64::new(1),
            next_event_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Wrap an async closure into an [`EventHandler`].
    pub fn handler<F, Fut>(f: F) -> EventHandler
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |value| Box::pin(f(value)))
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Register `handler` for `event`. Returns the subscription id.
    pub fn subscribe(&self, event: &str, handler: EventHandler, opts: SubscribeOpts) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscriptions.write();
        let list = subs.entry(event.to_string()).or_default();
        list.push(Subscription {
            id,
            priority: opts.priority,
            once: opts.once,
            handler,
        });
        // Descending priority; insertion order breaks ties (stable sort).
        list.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(event, sub_id = id, priority = opts.priority, once = opts.once, "subscribed");
        id
    }

    /// Remove a subscription. Returns `true` when something was removed.
    pub fn unsubscribe(&self, event: &str, sub_id: u64) -> bool {
        let mut subs = self.subscriptions.write();
        if let Some(list) = subs.get_mut(event) {
            let before = list.len();
            list.retain(|s| s.id != sub_id);
            let removed = list.len() != before;
            if list.is_empty() {
                subs.remove(event);
            }
            return removed;
        }
        false
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Publish `data` under `event`.
    ///
    /// Handler failures are isolated: logged, counted in the error metric, and
    /// never propagated to the publisher or to sibling handlers.
    pub async fn publish(&self, event: &str, data: Value, opts: PublishOpts) {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        self.events_published.fetch_add(1, Ordering::Relaxed);

        // Record history before dispatch so even handler-less events are
        // visible to diagnostics.
        {
            let mut history = self.history.write();
            history.push_back(EventRecord {
                id: event_id,
                event: event.to_string(),
                data: data.clone(),
                ts: Utc::now().timestamp_millis(),
            });
            while history.len() > HISTORY_CAPACITY {
                history.pop_front();
            }
        }

        self.resolve_waiters(event, &data);

        // Snapshot the handlers so no lock is held across awaits.
        let handlers: Vec<(u64, bool, EventHandler)> = {
            let subs = self.subscriptions.read();
            match subs.get(event) {
                Some(list) => list
                    .iter()
                    .map(|s| (s.id, s.once, s.handler.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            return;
        }

        let mut spent: Vec<u64> = Vec::new();

        if opts.concurrent {
            let futures: Vec<_> = handlers
                .iter()
                .map(|(id, once, handler)| {
                    let fut = handler(data.clone());
                    let id = *id;
                    let once = *once;
                    async move {
                        match tokio::time::timeout(opts.timeout, fut).await {
                            Ok(Ok(())) => (id, once, Ok(())),
                            Ok(Err(e)) => (id, once, Err(e)),
                            Err(_) => (id, once, Err(anyhow::anyhow!("handler timed out"))),
                        }
                    }
                })
                .collect();

            for (id, once, result) in futures_util::future::join_all(futures).await {
                self.settle(event, id, once, result, &mut spent);
            }
        } else {
            for (id, once, handler) in &handlers {
                let result = handler(data.clone()).await;
                self.settle(event, *id, *once, result, &mut spent);
            }
        }

        if !spent.is_empty() {
            for id in spent {
                self.unsubscribe(event, id);
            }
        }
    }

    fn settle(
        &self,
        event: &str,
        sub_id: u64,
        once: bool,
        result: anyhow::Result<()>,
        spent: &mut Vec<u64>,
    ) {
        match result {
            Ok(()) => {
                self.events_handled.fetch_add(1, Ordering::Relaxed);
                if once {
                    spent.push(sub_id);
                }
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(event, sub_id, error = %e, "event handler failed");
            }
        }
    }

    fn resolve_waiters(&self, event: &str, data: &Value) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(event) {
            let mut remaining = Vec::with_capacity(list.len());
            for waiter in list.drain(..) {
                let matches = waiter
                    .filter
                    .as_ref()
                    .map(|f| f(data))
                    .unwrap_or(true);
                if matches {
                    // Receiver may already be gone (timed out); ignore.
                    let _ = waiter.tx.send(data.clone());
                } else {
                    remaining.push(waiter);
                }
            }
            *list = remaining;
            if list.is_empty() {
                waiters.remove(event);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Resolve with the next `event` payload (matching `filter` when given)
    /// or `None` after `timeout`.
    pub async fn wait_for(
        &self,
        event: &str,
        timeout: Duration,
        filter: Option<EventFilter>,
    ) -> Option<Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            waiters
                .entry(event.to_string())
                .or_default()
                .push(Waiter { filter, tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Most recent history entries, oldest first. `event = None` returns all
    /// event names.
    pub fn history(&self, event: Option<&str>, limit: usize) -> Vec<EventRecord> {
        let history = self.history.read();
        let filtered: Vec<&EventRecord> = history
            .iter()
            .filter(|r| event.map_or(true, |e| r.event == e))
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].iter().map(|r| (*r).clone()).collect()
    }

    pub fn metrics(&self) -> BusMetrics {
        let subscriber_count = self
            .subscriptions
            .read()
            .values()
            .map(Vec::len)
            .sum();
        BusMetrics {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_handled: self.events_handled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            subscriber_count,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.metrics().subscriber_count)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> EventHandler {
        let tag = tag.to_string();
        EventBus::handler(move |_| {
            let log = log.clone();
            let tag = tag.clone();
            async move {
                log.lock().push(tag);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn handlers_run_in_descending_priority_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "tick",
            recording_handler(log.clone(), "low"),
            SubscribeOpts {
                priority: -5,
                once: false,
            },
        );
        bus.subscribe(
            "tick",
            recording_handler(log.clone(), "high"),
            SubscribeOpts {
                priority: 10,
                once: false,
            },
        );
        bus.subscribe(
            "tick",
            recording_handler(log.clone(), "mid"),
            SubscribeOpts::default(),
        );

        bus.publish("tick", json!({}), PublishOpts::default()).await;

        assert_eq!(*log.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn once_handler_unsubscribes_after_success() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "fill",
            recording_handler(log.clone(), "once"),
            SubscribeOpts {
                priority: 0,
                once: true,
            },
        );

        bus.publish("fill", json!({}), PublishOpts::default()).await;
        bus.publish("fill", json!({}), PublishOpts::default()).await;

        assert_eq!(log.lock().len(), 1);
        assert_eq!(bus.metrics().subscriber_count, 0);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated_and_counted() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "boom",
            EventBus::handler(|_| async { anyhow::bail!("deliberate") }),
            SubscribeOpts {
                priority: 10,
                once: false,
            },
        );
        bus.subscribe(
            "boom",
            recording_handler(log.clone(), "survivor"),
            SubscribeOpts::default(),
        );

        bus.publish("boom", json!({}), PublishOpts::default()).await;

        // The failing handler did not stop the survivor.
        assert_eq!(*log.lock(), vec!["survivor"]);
        let m = bus.metrics();
        assert_eq!(m.errors, 1);
        assert_eq!(m.events_handled, 1);
        assert_eq!(m.events_published, 1);
    }

    #[tokio::test]
    async fn concurrent_handler_timeout_is_an_isolated_error() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "slow",
            EventBus::handler(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
            SubscribeOpts::default(),
        );
        bus.subscribe(
            "slow",
            recording_handler(log.clone(), "fast"),
            SubscribeOpts::default(),
        );

        bus.publish(
            "slow",
            json!({}),
            PublishOpts {
                concurrent: true,
                timeout: Duration::from_millis(20),
            },
        )
        .await;

        assert_eq!(*log.lock(), vec!["fast"]);
        assert_eq!(bus.metrics().errors, 1);
    }

    #[tokio::test]
    async fn history_is_bounded_and_filterable() {
        let bus = EventBus::new();
        for i in 0..1100 {
            bus.publish("a", json!({ "i": i }), PublishOpts::default())
                .await;
        }
        bus.publish("b", json!({}), PublishOpts::default()).await;

        let all = bus.history(None, 2000);
        assert_eq!(all.len(), 1000);

        let only_b = bus.history(Some("b"), 10);
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].event, "b");

        // Oldest entries were evicted.
        let only_a = bus.history(Some("a"), 2000);
        assert!(only_a.first().unwrap().data["i"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn wait_for_applies_filter_and_timeout() {
        let bus = Arc::new(EventBus::new());

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for(
                    "price",
                    Duration::from_secs(1),
                    Some(Arc::new(|v: &Value| {
                        v["pair"].as_str() == Some("BTC/USDT")
                    })),
                )
                .await
            })
        };

        // Give the waiter time to register.
        tokio::time::sleep(Duration::from_millis(10)).await;

        bus.publish("price", json!({ "pair": "ETH/USDT" }), PublishOpts::default())
            .await;
        bus.publish("price", json!({ "pair": "BTC/USDT" }), PublishOpts::default())
            .await;

        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap()["pair"], "BTC/USDT");

        // Timeout path.
        let none = bus
            .wait_for("never", Duration::from_millis(20), None)
            .await;
        assert!(none.is_none());
    }
}
