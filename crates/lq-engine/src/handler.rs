use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use lq_context::AnalysisRegistry;
use lq_query::{canonical_key, referenced_series};
use lq_types::SeriesId;
use lq_vis::{CompiledVisualization, UserVisualization, Visualization, VisualizationPipeline};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{ChangeEvent, ChannelMessage};
use crate::query::{LiveQuery, QuerySubscription};
use crate::transport::{SeriesResolver, Transport};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Query(#[from] lq_query::QueryError),
    #[error("query failed: {0}")]
    Failed(String),
    #[error("the engine shut down before the query completed")]
    Cancelled,
}

/// Callbacks one frontend subscription receives.
pub trait Subscriber: Send + Sync {
    fn on_result(&self, key: &str, visualizations: &[Visualization]);
    fn on_error(&self, key: &str, message: &str);
    fn set_status(&self, _key: &str, _status: &str) {}
}

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on retained subscriber-less queries; the oldest dormant
    /// entry is evicted past this.
    pub dormant_cap: usize,
    /// Initial settings snapshot handed to contexts.
    pub settings: Value,
    /// User visualization programs active from the start.
    pub user_visualizations: Vec<UserVisualization>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dormant_cap: 32,
            settings: Value::Object(serde_json::Map::new()),
            user_visualizations: Vec::new(),
        }
    }
}

struct HandlerState {
    queries: HashMap<String, Arc<LiveQuery>>,
    subscriptions: HashMap<String, (String, Arc<LiveQuery>)>,
    dormant: VecDeque<String>,
    settings: Value,
    connected: bool,
    run_counter: u64,
}

struct HandlerInner {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn SeriesResolver>,
    registry: Arc<AnalysisRegistry>,
    pipeline: Arc<VisualizationPipeline>,
    dormant_cap: usize,
    state: Mutex<HandlerState>,
}

/// The single entry point translating frontend subscribe/unsubscribe and
/// one-shot query requests into canonical-query operations, and routing
/// external change events to every live query.
#[derive(Clone)]
pub struct DatasetHandler {
    inner: Arc<HandlerInner>,
}

impl DatasetHandler {
    /// Handler with the built-in analysis registry and pipeline.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SeriesResolver>,
        config: EngineConfig,
    ) -> Self {
        Self::with_components(
            transport,
            resolver,
            config,
            AnalysisRegistry::with_builtins(),
            VisualizationPipeline::with_builtins(),
        )
    }

    /// Handler with a caller-assembled registry and pipeline.
    #[must_use]
    pub fn with_components(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SeriesResolver>,
        config: EngineConfig,
        registry: AnalysisRegistry,
        pipeline: VisualizationPipeline,
    ) -> Self {
        pipeline.set_user_visualizations(&config.user_visualizations);
        Self {
            inner: Arc::new(HandlerInner {
                transport,
                resolver,
                registry: Arc::new(registry),
                pipeline: Arc::new(pipeline),
                dormant_cap: config.dormant_cap,
                state: Mutex::new(HandlerState {
                    queries: HashMap::new(),
                    subscriptions: HashMap::new(),
                    dormant: VecDeque::new(),
                    settings: config.settings,
                    connected: true,
                    run_counter: 0,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe a frontend key to a query, deduplicating against any
    /// existing query with the same canonical key.
    pub fn subscribe(
        &self,
        key: impl Into<String>,
        query: &Value,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), EngineError> {
        self.subscribe_inner(key.into(), query, subscriber, None)
    }

    /// Subscribe with a per-subscription set of user visualization
    /// programs, replacing the handler-wide ones for this key only.
    pub fn subscribe_with_visualizations(
        &self,
        key: impl Into<String>,
        query: &Value,
        subscriber: Arc<dyn Subscriber>,
        user_visualizations: &[UserVisualization],
    ) -> Result<(), EngineError> {
        let overrides = self.inner.pipeline.prepare_override(user_visualizations);
        self.subscribe_inner(key.into(), query, subscriber, Some(overrides))
    }

    fn subscribe_inner(
        &self,
        key: String,
        query: &Value,
        subscriber: Arc<dyn Subscriber>,
        overrides: Option<Vec<Arc<CompiledVisualization>>>,
    ) -> Result<(), EngineError> {
        let canonical = canonical_key(query)?;
        let series = referenced_series(query)?;

        // A key can only hold one subscription at a time.
        self.unsubscribe(&key);

        let (live, created) = {
            let mut state = self.lock();
            state.dormant.retain(|entry| entry != &canonical);
            match state.queries.get(&canonical) {
                Some(live) => (Arc::clone(live), false),
                None => {
                    let live = LiveQuery::new(
                        query.clone(),
                        canonical.clone(),
                        series,
                        state.settings.clone(),
                        state.connected,
                        Arc::clone(&self.inner.transport),
                        Arc::clone(&self.inner.resolver),
                        Arc::clone(&self.inner.registry),
                    );
                    state.queries.insert(canonical.clone(), Arc::clone(&live));
                    (live, true)
                }
            }
        };
        if created {
            live.start();
        }

        let pipeline = Arc::clone(&self.inner.pipeline);
        let overrides = overrides.map(Arc::new);
        let result_key = key.clone();
        let error_key = key.clone();
        let status_key = key.clone();
        let result_subscriber = Arc::clone(&subscriber);
        let error_subscriber = Arc::clone(&subscriber);

        let subscription = QuerySubscription {
            on_context: Box::new(move |ctx| {
                let visualizations = match &overrides {
                    Some(programs) => pipeline.run_with_overrides(ctx, Some(programs.as_slice())),
                    None => pipeline.run(ctx),
                };
                result_subscriber.on_result(&result_key, &visualizations);
            }),
            on_error: Box::new(move |message| {
                error_subscriber.on_error(&error_key, message);
            }),
            set_status: Box::new(move |status| {
                subscriber.set_status(&status_key, status);
            }),
        };

        live.subscribe(key.clone(), subscription);
        self.lock().subscriptions.insert(key, (canonical, live));
        Ok(())
    }

    /// Detach a frontend key. The query itself is retained, parked
    /// dormant, or dropped per the lifecycle rule.
    pub fn unsubscribe(&self, key: &str) -> bool {
        let Some((canonical, live)) = self.lock().subscriptions.remove(key) else {
            return false;
        };
        debug!(%key, query = %canonical, "unsubscribing");

        if !live.unsubscribe(key) {
            return true;
        }

        // Last subscriber gone: drop immediately when the channel is down
        // or the data is already outdated, otherwise retain dormant.
        let mut state = self.lock();
        if !state.connected || live.is_outdated() {
            state.queries.remove(&canonical);
            state.dormant.retain(|entry| entry != &canonical);
            drop(state);
            live.close();
        } else if !state.dormant.contains(&canonical) {
            state.dormant.push_back(canonical);
            while state.dormant.len() > self.inner.dormant_cap {
                if let Some(evicted) = state.dormant.pop_front()
                    && let Some(old) = state.queries.remove(&evicted)
                {
                    debug!(query = %evicted, "evicting dormant query");
                    old.close();
                }
            }
        }
        true
    }

    /// One-shot query: subscribe, await the first delivery or error, tear
    /// the subscription down, and return the result.
    pub async fn run(&self, query: &Value) -> Result<Vec<Visualization>, EngineError> {
        let key = {
            let mut state = self.lock();
            state.run_counter += 1;
            format!("oneshot-{}", state.run_counter)
        };

        let (tx, rx) = oneshot::channel();
        let subscriber = Arc::new(OneShotSubscriber {
            tx: Mutex::new(Some(tx)),
        });
        self.subscribe(key.clone(), query, subscriber)?;

        let outcome = rx.await;
        self.unsubscribe(&key);
        match outcome {
            Ok(Ok(visualizations)) => Ok(visualizations),
            Ok(Err(message)) => Err(EngineError::Failed(message)),
            Err(_) => Err(EngineError::Cancelled),
        }
    }

    fn live_queries(&self) -> Vec<Arc<LiveQuery>> {
        self.lock().queries.values().cloned().collect()
    }

    /// Route a data change to every live query; each filters by its own
    /// referenced-series set. Affected dormant queries are discarded, since
    /// their cached data just went stale.
    pub fn handle_data_change(&self, event: &ChangeEvent) {
        debug!(series = %event.series, kind = ?event.kind, "data change");
        for live in self.live_queries() {
            if !live.references(&event.series) {
                continue;
            }
            if live.is_active() {
                live.trigger_run();
            } else {
                let canonical = live.canonical().to_owned();
                let mut state = self.lock();
                state.queries.remove(&canonical);
                state.dormant.retain(|entry| entry != &canonical);
                drop(state);
                live.close();
            }
        }
    }

    /// Route a series-metadata change to every live query.
    pub fn handle_series_change(&self, id: &SeriesId) {
        for live in self.live_queries() {
            live.on_series_changed(id);
        }
    }

    /// Connectivity transition. On reconnect every active query re-fetches
    /// once; on disconnect every query is marked outdated and dormant ones
    /// are dropped.
    pub fn handle_connection_change(&self, connected: bool) {
        debug!(connected, "channel connectivity changed");
        self.lock().connected = connected;

        if connected {
            for live in self.live_queries() {
                live.set_connected(true);
                live.trigger_run();
            }
            return;
        }

        let dormant = {
            let mut state = self.lock();
            let drained = state.dormant.drain(..).collect::<Vec<_>>();
            let dropped = drained
                .iter()
                .filter_map(|canonical| state.queries.remove(canonical))
                .collect::<Vec<_>>();
            dropped
        };
        for live in dormant {
            live.close();
        }
        for live in self.live_queries() {
            live.set_connected(false);
        }
    }

    /// Settings update: recompile user visualization programs and refresh
    /// every query's context.
    pub fn update_settings(&self, settings: Value) {
        self.lock().settings = settings.clone();

        match settings.get("visualizations") {
            None => self.inner.pipeline.set_user_visualizations(&[]),
            Some(raw) => match serde_json::from_value::<Vec<UserVisualization>>(raw.clone()) {
                Ok(programs) => self.inner.pipeline.set_user_visualizations(&programs),
                Err(error) => {
                    warn!(%error, "settings carry malformed user visualizations");
                }
            },
        }

        for live in self.live_queries() {
            live.on_settings_change(settings.clone());
        }
    }

    /// Number of queries currently held (active plus dormant).
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.lock().queries.len()
    }

    /// Number of subscriber-less queries retained for re-activation.
    #[must_use]
    pub fn dormant_count(&self) -> usize {
        self.lock().dormant.len()
    }
}

struct OneShotSubscriber {
    tx: Mutex<Option<oneshot::Sender<Result<Vec<Visualization>, String>>>>,
}

impl OneShotSubscriber {
    fn send(&self, outcome: Result<Vec<Visualization>, String>) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Subscriber for OneShotSubscriber {
    fn on_result(&self, _key: &str, visualizations: &[Visualization]) {
        self.send(Ok(visualizations.to_vec()));
    }

    fn on_error(&self, _key: &str, message: &str) {
        self.send(Err(message.to_owned()));
    }
}

/// Drain a live-update channel into the handler until the channel closes.
pub fn spawn_channel_adapter(
    handler: DatasetHandler,
    mut receiver: mpsc::Receiver<ChannelMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            match message {
                ChannelMessage::Change(event) => handler.handle_data_change(&event),
                ChannelMessage::SeriesChange(id) => handler.handle_series_change(&id),
                ChannelMessage::Connection(connected) => {
                    handler.handle_connection_change(connected);
                }
                ChannelMessage::Settings(settings) => handler.update_settings(settings),
            }
        }
    })
}
