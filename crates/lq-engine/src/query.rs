use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use lq_context::{AnalysisRegistry, DatasetContext};
use lq_types::{DataPoint, SeriesId, SeriesMetadata};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::transport::{SeriesResolver, Transport};

/// The per-subscriber callbacks a query fans results out to.
pub(crate) struct QuerySubscription {
    pub on_context: Box<dyn Fn(&Arc<DatasetContext>) + Send + Sync>,
    pub on_error: Box<dyn Fn(&str) + Send + Sync>,
    pub set_status: Box<dyn Fn(&str) + Send + Sync>,
}

#[derive(Default)]
struct QueryState {
    subscriptions: HashMap<String, Arc<QuerySubscription>>,
    fetching: bool,
    requery: bool,
    contexting: bool,
    recontext: bool,
    outdated: bool,
    connected: bool,
    closed: bool,
    has_new_data: bool,
    pending_series: usize,
    dataset: Option<BTreeMap<String, Vec<DataPoint>>>,
    metadata: BTreeMap<SeriesId, SeriesMetadata>,
    settings: Value,
    ctx: Option<Arc<DatasetContext>>,
}

/// One canonical query's lifecycle: fetch, re-fetch on change, context
/// (re)computation, and subscriber fan-out.
///
/// Re-entrancy is handled cooperatively: at most one fetch and one context
/// rebuild are in flight, and requests arriving while busy set the
/// `requery`/`recontext` intent flags, which are examined after the
/// in-flight future settles. No lock is held across an await.
pub(crate) struct LiveQuery {
    raw: Value,
    canonical: String,
    series: BTreeSet<SeriesId>,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn SeriesResolver>,
    registry: Arc<AnalysisRegistry>,
    resolved: Notify,
    state: Mutex<QueryState>,
}

impl LiveQuery {
    pub(crate) fn new(
        raw: Value,
        canonical: String,
        series: BTreeSet<SeriesId>,
        settings: Value,
        connected: bool,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SeriesResolver>,
        registry: Arc<AnalysisRegistry>,
    ) -> Arc<Self> {
        debug!(query = %canonical, series = series.len(), "creating query");
        Arc::new(Self {
            raw,
            canonical,
            series,
            transport,
            resolver,
            registry,
            resolved: Notify::new(),
            state: Mutex::new(QueryState {
                connected,
                outdated: !connected,
                settings,
                ..QueryState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub(crate) fn canonical(&self) -> &str {
        &self.canonical
    }

    #[must_use]
    pub(crate) fn references(&self, id: &SeriesId) -> bool {
        self.series.contains(id)
    }

    #[must_use]
    pub(crate) fn is_active(&self) -> bool {
        !self.lock().subscriptions.is_empty()
    }

    #[must_use]
    pub(crate) fn is_outdated(&self) -> bool {
        self.lock().outdated
    }

    /// Begin resolving metadata for every referenced series. Subscribers
    /// may arrive before resolution completes; context construction waits
    /// for the outstanding lookups.
    pub(crate) fn start(self: &Arc<Self>) {
        for id in self.series.clone() {
            self.spawn_resolution(id);
        }
    }

    fn spawn_resolution(self: &Arc<Self>, id: SeriesId) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.pending_series += 1;
        }
        let query = Arc::clone(self);
        tokio::spawn(async move {
            query.resolve_one(id).await;
        });
    }

    async fn resolve_one(&self, id: SeriesId) {
        let result = self.resolver.get_series(&id).await;
        let mut state = self.lock();
        match result {
            Ok(meta) => {
                state.metadata.insert(id, meta);
            }
            Err(error) => warn!(series = %id, %error, "series resolution failed"),
        }
        state.pending_series -= 1;
        let done = state.pending_series == 0;
        drop(state);
        if done {
            self.resolved.notify_waiters();
        }
    }

    /// A referenced series' metadata changed: re-resolve it, then refresh
    /// the context so subscribers see the updated naming.
    pub(crate) fn on_series_changed(self: &Arc<Self>, id: &SeriesId) {
        if !self.references(id) {
            return;
        }
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.pending_series += 1;
        }
        let query = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            query.resolve_one(id).await;
            {
                let mut state = query.lock();
                // Force a rebuild from the retained dataset so the new
                // metadata lands in the next context.
                if state.dataset.is_some() {
                    state.has_new_data = true;
                }
            }
            query.update_context(false).await;
        });
    }

    pub(crate) fn on_settings_change(self: &Arc<Self>, settings: Value) {
        self.lock().settings = settings;
        let query = Arc::clone(self);
        tokio::spawn(async move {
            query.update_context(false).await;
        });
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        let mut state = self.lock();
        state.connected = connected;
        if !connected {
            // No notifications can arrive while disconnected, so whatever
            // is cached cannot be trusted once subscribers leave.
            state.outdated = true;
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, key: String, subscription: QuerySubscription) {
        let subscription = Arc::new(subscription);
        let (ready, first) = {
            let mut state = self.lock();
            state.subscriptions.insert(key, Arc::clone(&subscription));
            (state.ctx.clone(), state.subscriptions.len() == 1)
        };
        if let Some(ctx) = ready {
            // A valid context is already cached: deliver immediately.
            (subscription.on_context)(&ctx);
        } else if first {
            self.trigger_run();
        }
    }

    /// Remove a subscriber. Returns true when the query just became
    /// inactive; retention is the registry's decision.
    pub(crate) fn unsubscribe(&self, key: &str) -> bool {
        let mut state = self.lock();
        state.subscriptions.remove(key);
        state.subscriptions.is_empty()
    }

    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscriptions.clear();
    }

    /// Request a fetch. If one is already in flight, this collapses into a
    /// single follow-up fetch once the current one settles.
    pub(crate) fn trigger_run(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.closed || state.subscriptions.is_empty() {
                return;
            }
            if state.fetching {
                debug!(query = %self.canonical, "fetch in flight, coalescing re-query");
                state.requery = true;
                return;
            }
            state.fetching = true;
            state.requery = false;
        }
        let query = Arc::clone(self);
        tokio::spawn(async move {
            query.run_loop().await;
        });
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            self.broadcast_status("Querying data...");
            debug!(query = %self.canonical, "fetching dataset");

            let fetched = match self.transport.fetch_dataset(&self.raw).await {
                Ok(response) => {
                    let mut state = self.lock();
                    state.dataset = Some(response.data);
                    state.has_new_data = true;
                    if state.connected {
                        state.outdated = false;
                    }
                    true
                }
                Err(error) => {
                    warn!(query = %self.canonical, %error, "dataset fetch failed");
                    self.broadcast_error(&format!("Query failed: {error}"));
                    false
                }
            };

            if fetched {
                self.update_context(true).await;
            }

            let again = {
                let mut state = self.lock();
                if state.requery && !state.subscriptions.is_empty() && !state.closed {
                    state.requery = false;
                    true
                } else {
                    state.fetching = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    /// Rebuild or refresh the context and fan it out. Symmetric guard to
    /// the fetch path: concurrent requests collapse through `recontext`,
    /// and a settings-only change never triggers a re-fetch.
    pub(crate) async fn update_context(self: &Arc<Self>, from_run: bool) {
        {
            let mut state = self.lock();
            if state.closed || state.subscriptions.is_empty() {
                return;
            }
            if state.contexting {
                state.recontext = true;
                return;
            }
            if state.fetching && !from_run {
                // The fetch in flight rebuilds the context when it lands.
                return;
            }
            state.contexting = true;
            state.recontext = false;
        }

        loop {
            self.broadcast_status("Processing data...");
            self.wait_for_resolution().await;

            let pending_build = {
                let mut state = self.lock();
                if state.has_new_data {
                    state.has_new_data = false;
                    state.dataset.clone().map(|data| {
                        (data, state.metadata.clone(), state.settings.clone())
                    })
                } else {
                    None
                }
            };

            let delivery = match pending_build {
                Some((data, metadata, settings)) => {
                    match DatasetContext::new(
                        self.raw.clone(),
                        data,
                        metadata,
                        settings,
                        Arc::clone(&self.registry),
                    ) {
                        Ok(ctx) => {
                            let ctx = Arc::new(ctx);
                            self.lock().ctx = Some(Arc::clone(&ctx));
                            Some(ctx)
                        }
                        Err(error) => {
                            warn!(query = %self.canonical, %error, "context build failed");
                            self.broadcast_error(&format!("Processing failed: {error}"));
                            None
                        }
                    }
                }
                None => {
                    let state = self.lock();
                    match &state.ctx {
                        // No data fetched yet: nothing to process.
                        None => None,
                        Some(ctx) => {
                            ctx.swap_settings(state.settings.clone());
                            Some(Arc::clone(ctx))
                        }
                    }
                }
            };

            if let Some(ctx) = delivery {
                self.deliver(&ctx);
            }

            let again = {
                let mut state = self.lock();
                if state.recontext && !state.subscriptions.is_empty() && !state.closed {
                    state.recontext = false;
                    true
                } else {
                    state.contexting = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    async fn wait_for_resolution(&self) {
        loop {
            let notified = self.resolved.notified();
            if self.lock().pending_series == 0 {
                break;
            }
            notified.await;
        }
    }

    fn subscribers(&self) -> Vec<Arc<QuerySubscription>> {
        self.lock().subscriptions.values().cloned().collect()
    }

    fn deliver(&self, ctx: &Arc<DatasetContext>) {
        for subscription in self.subscribers() {
            (subscription.on_context)(ctx);
        }
    }

    fn broadcast_status(&self, status: &str) {
        for subscription in self.subscribers() {
            (subscription.set_status)(status);
        }
    }

    fn broadcast_error(&self, message: &str) {
        for subscription in self.subscribers() {
            (subscription.on_error)(message);
        }
    }
}
