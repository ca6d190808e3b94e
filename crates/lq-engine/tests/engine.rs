use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lq_engine::{
    ChangeEvent, ChangeKind, DatasetHandler, EngineConfig, InMemoryBackend, Subscriber,
};
use lq_types::{DataPoint, SeriesId, SeriesMetadata};
use lq_vis::Visualization;
use serde_json::{Value, json};
use tokio::time::sleep;

#[derive(Default)]
struct TestSubscriber {
    results: Mutex<Vec<Vec<Visualization>>>,
    errors: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
}

impl TestSubscriber {
    fn result_count(&self) -> usize {
        self.results.lock().expect("results").len()
    }

    fn last_result(&self) -> Option<Vec<Visualization>> {
        self.results.lock().expect("results").last().cloned()
    }

    fn error_count(&self) -> usize {
        self.errors.lock().expect("errors").len()
    }
}

impl Subscriber for TestSubscriber {
    fn on_result(&self, _key: &str, visualizations: &[Visualization]) {
        self.results
            .lock()
            .expect("results")
            .push(visualizations.to_vec());
    }

    fn on_error(&self, _key: &str, message: &str) {
        self.errors.lock().expect("errors").push(message.to_owned());
    }

    fn set_status(&self, _key: &str, status: &str) {
        self.statuses
            .lock()
            .expect("statuses")
            .push(status.to_owned());
    }
}

fn abc_query() -> Value {
    json!({"y": {"timeseries": "abc"}})
}

fn abc_dataset() -> BTreeMap<String, Vec<DataPoint>> {
    let mut data = BTreeMap::new();
    data.insert(
        "y".to_owned(),
        vec![DataPoint::new(1.0, json!(5)), DataPoint::new(2.0, json!(7))],
    );
    data
}

fn backend_with_abc() -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::new());
    backend.insert_dataset(&abc_query(), abc_dataset());
    backend.insert_series(SeriesMetadata {
        id: SeriesId::from("abc"),
        name: "Steps".to_owned(),
        description: String::new(),
        meta: Value::Null,
    });
    backend
}

fn handler_for(backend: &Arc<InMemoryBackend>) -> DatasetHandler {
    DatasetHandler::new(
        backend.clone(),
        backend.clone(),
        EngineConfig::default(),
    )
}

async fn settle() {
    sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn concurrent_subscribers_share_one_fetch() {
    let backend = backend_with_abc();
    let query = json!({"y": {"timeseries": "abc", "i1": 10}, "x": {"timeseries": "abc"}});
    backend.insert_dataset(&query, abc_dataset());

    let handler = handler_for(&backend);
    backend.pause();

    let subscribers = (0..3)
        .map(|_| Arc::new(TestSubscriber::default()))
        .collect::<Vec<_>>();

    // Key-order permutations and numeric-string formattings of the same
    // query must share the cache slot.
    let variants = [
        query.clone(),
        json!({"x": {"timeseries": "abc"}, "y": {"timeseries": "abc", "i1": 10}}),
        json!({"y": {"i1": "10", "timeseries": "abc"}, "x": {"timeseries": "abc"}}),
    ];
    for (i, (subscriber, query)) in subscribers.iter().zip(variants.iter()).enumerate() {
        handler
            .subscribe(format!("view-{i}"), query, subscriber.clone())
            .expect("subscribe");
    }
    settle().await;

    assert_eq!(backend.fetch_count(), 1);
    assert_eq!(handler.query_count(), 1);

    backend.resume();
    settle().await;

    assert_eq!(backend.fetch_count(), 1);
    for subscriber in &subscribers {
        assert_eq!(subscriber.result_count(), 1);
    }
}

#[tokio::test]
async fn change_events_during_a_fetch_coalesce_into_one_refetch() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;
    assert_eq!(backend.fetch_count(), 1);
    assert_eq!(subscriber.result_count(), 1);

    backend.pause();
    let event = ChangeEvent {
        kind: ChangeKind::DataWrite,
        series: SeriesId::from("abc"),
    };
    for _ in 0..5 {
        handler.handle_data_change(&event);
    }
    settle().await;
    // The second fetch is held at the gate; the other four collapsed into
    // one pending intent.
    assert_eq!(backend.fetch_count(), 2);

    backend.resume();
    settle().await;
    assert_eq!(backend.fetch_count(), 3);
    assert_eq!(subscriber.result_count(), 3);
}

#[tokio::test]
async fn only_affected_queries_refetch() {
    let backend = backend_with_abc();
    let other_query = json!({"z": {"timeseries": "xyz"}});
    let mut other_data = BTreeMap::new();
    other_data.insert("z".to_owned(), vec![DataPoint::new(1.0, json!(1))]);
    backend.insert_dataset(&other_query, other_data);

    let handler = handler_for(&backend);
    let first = Arc::new(TestSubscriber::default());
    let second = Arc::new(TestSubscriber::default());
    handler
        .subscribe("abc-view", &abc_query(), first.clone())
        .expect("subscribe abc");
    handler
        .subscribe("xyz-view", &other_query, second.clone())
        .expect("subscribe xyz");
    settle().await;
    assert_eq!(backend.fetch_count_for(&abc_query()), 1);
    assert_eq!(backend.fetch_count_for(&other_query), 1);

    handler.handle_data_change(&ChangeEvent {
        kind: ChangeKind::DataWrite,
        series: SeriesId::from("xyz"),
    });
    settle().await;

    assert_eq!(backend.fetch_count_for(&abc_query()), 1);
    assert_eq!(backend.fetch_count_for(&other_query), 2);
}

#[tokio::test]
async fn dormant_queries_reactivate_without_a_refetch() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;
    assert_eq!(subscriber.result_count(), 1);

    handler.unsubscribe("view");
    assert_eq!(handler.query_count(), 1);
    assert_eq!(handler.dormant_count(), 1);

    let returning = Arc::new(TestSubscriber::default());
    handler
        .subscribe("view-2", &abc_query(), returning.clone())
        .expect("resubscribe");
    settle().await;

    // Cached context delivered immediately, no second transport call.
    assert_eq!(returning.result_count(), 1);
    assert_eq!(backend.fetch_count(), 1);
    assert_eq!(handler.dormant_count(), 0);
}

#[tokio::test]
async fn disconnect_discards_dormant_queries() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;
    handler.unsubscribe("view");
    assert_eq!(handler.query_count(), 1);

    handler.handle_connection_change(false);
    assert_eq!(handler.query_count(), 0);
    assert_eq!(handler.dormant_count(), 0);
}

#[tokio::test]
async fn unsubscribe_while_disconnected_drops_the_query() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;

    handler.handle_connection_change(false);
    handler.unsubscribe("view");
    assert_eq!(handler.query_count(), 0);
}

#[tokio::test]
async fn reconnect_refetches_once_without_duplicate_deliveries() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;
    assert_eq!(subscriber.result_count(), 1);

    handler.handle_connection_change(false);
    handler.handle_connection_change(true);
    settle().await;

    assert_eq!(backend.fetch_count(), 2);
    assert_eq!(subscriber.result_count(), 2);

    // The end-to-end numbers: the linechart carries the fetched points.
    let result = subscriber.last_result().expect("result");
    let linechart = result
        .iter()
        .find(|vis| vis.key == "linechart")
        .expect("linechart");
    let data = linechart.data.as_ref().expect("data");
    assert_eq!(data["series"][0]["points"], json!([[1.0, 5.0], [2.0, 7.0]]));
}

#[tokio::test]
async fn settings_changes_redeliver_without_refetching() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;
    assert_eq!(subscriber.result_count(), 1);

    handler.update_settings(json!({"theme": "dark"}));
    settle().await;

    assert_eq!(subscriber.result_count(), 2);
    assert_eq!(backend.fetch_count(), 1);
}

#[tokio::test]
async fn fetch_errors_surface_and_stay_retryable() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.insert_error(&abc_query(), "series is gone");
    backend.insert_series(SeriesMetadata {
        id: SeriesId::from("abc"),
        name: "Steps".to_owned(),
        description: String::new(),
        meta: Value::Null,
    });
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;
    assert_eq!(subscriber.error_count(), 1);
    assert_eq!(subscriber.result_count(), 0);
    let statuses = subscriber.statuses.lock().expect("statuses");
    assert!(statuses.iter().any(|status| status == "Querying data..."));
    drop(statuses);

    // The backend recovers; the next change event retries the query.
    backend.insert_dataset(&abc_query(), abc_dataset());
    handler.handle_data_change(&ChangeEvent {
        kind: ChangeKind::DataWrite,
        series: SeriesId::from("abc"),
    });
    settle().await;
    assert_eq!(subscriber.result_count(), 1);
}

#[tokio::test]
async fn one_shot_run_returns_and_tears_down() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);

    let visualizations = handler.run(&abc_query()).await.expect("run");
    assert!(visualizations.iter().any(|vis| vis.key == "table"));

    // The temporary subscription is gone; the query is parked dormant.
    assert_eq!(handler.dormant_count(), 1);

    let failing = json!({"q": {"timeseries": "missing"}});
    let err = handler.run(&failing).await.expect_err("must fail");
    assert!(err.to_string().contains("Query failed"));
}

#[tokio::test]
async fn user_visualizations_flow_through_settings() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler.update_settings(json!({
        "visualizations": [{
            "name": "peak",
            "enabled": true,
            "code": r#"{"emit": [{"key": "peak", "type": "stat", "title": "Peak", "weight": 1, "config": {"value": "${{data.y.max()}}"}}]}"#
        }]
    }));

    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;

    let result = subscriber.last_result().expect("result");
    let peak = result.iter().find(|vis| vis.key == "peak").expect("peak");
    assert_eq!(peak.data.as_ref().expect("data")["value"], json!(7.0));
}

#[tokio::test]
async fn broken_user_visualizations_do_not_break_builtins() {
    let backend = backend_with_abc();
    let handler = handler_for(&backend);
    let subscriber = Arc::new(TestSubscriber::default());

    handler.update_settings(json!({
        "visualizations": [{"name": "bad", "enabled": true, "code": "not json"}]
    }));
    handler
        .subscribe("view", &abc_query(), subscriber.clone())
        .expect("subscribe");
    settle().await;

    let result = subscriber.last_result().expect("result");
    let keys = result.iter().map(|vis| vis.key.as_str()).collect::<Vec<_>>();
    assert!(keys.contains(&"errors"));
    assert!(keys.contains(&"table"));
    assert!(keys.contains(&"linechart"));

    let errors = result.iter().find(|vis| vis.key == "errors").expect("errors");
    assert_eq!(errors.config["errors"][0]["source"], json!("user"));
}

#[tokio::test]
async fn dormant_retention_is_bounded() {
    let backend = Arc::new(InMemoryBackend::new());
    let mut config = EngineConfig::default();
    config.dormant_cap = 2;
    let handler = DatasetHandler::new(
        backend.clone(),
        backend.clone(),
        config,
    );

    for i in 0..4 {
        let query = json!({"y": {"timeseries": format!("s{i}")}});
        let mut data = BTreeMap::new();
        data.insert("y".to_owned(), vec![DataPoint::new(1.0, json!(i))]);
        backend.insert_dataset(&query, data);
        backend.insert_series(SeriesMetadata {
            id: SeriesId::from(format!("s{i}")),
            name: format!("series {i}"),
            description: String::new(),
            meta: Value::Null,
        });

        let subscriber = Arc::new(TestSubscriber::default());
        handler
            .subscribe(format!("view-{i}"), &query, subscriber)
            .expect("subscribe");
        settle().await;
        handler.unsubscribe(&format!("view-{i}"));
    }

    assert_eq!(handler.dormant_count(), 2);
    assert_eq!(handler.query_count(), 2);
}
