use async_trait::async_trait;
use serde_json::{json, Value};
use service_framework::action::ActionDescriptor;
use service_framework::cache::MemoryCacher;
use service_framework::channel::{ChannelHandler, ChannelMessage, DeliveryContext, MessageState};
use service_framework::config::{BrokerConfig, ChannelConfig};
use service_framework::db::DbService;
use service_framework::store::{
    EntityChangedEvent, EntityListener, MemoryStore, Operation, Record, StoreAdapter,
};
use service_framework::validator::{into_params, ParamRule, ParamSchema};
use service_framework::{BrokerBuilder, CallContext, ServiceError, ServiceSchema, StoreError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- Helpers ---

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(Operation, Option<Value>, Option<Value>)>>,
}

#[async_trait]
impl EntityListener for Recorder {
    async fn entity_changed(&self, event: &EntityChangedEvent) {
        self.events.lock().unwrap().push((
            event.operation,
            event.entity.clone().map(|e| e.into_value()),
            event.previous.clone().map(|e| e.into_value()),
        ));
    }
}

/// Fails with a transient store error until `failures` attempts have been made.
struct Flaky {
    failures: u32,
    attempts: AtomicU32,
}

#[async_trait]
impl ChannelHandler for Flaky {
    async fn handle(&self, ctx: DeliveryContext, message: ChannelMessage) -> Result<(), ServiceError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(StoreError::Unavailable("connection reset".into()).into());
        }
        ctx.emit("work.done", Value::Object(message.payload));
        Ok(())
    }
}

fn config() -> BrokerConfig {
    BrokerConfig {
        node_id: "node-it".into(),
        channels: ChannelConfig {
            max_retries: 3,
            retry_backoff_ms: 1,
            ..ChannelConfig::default()
        },
        ..BrokerConfig::default()
    }
}

fn memory_store() -> Arc<dyn StoreAdapter> {
    let (store, client) = MemoryStore::new("items", 32);
    tokio::spawn(store.run());
    Arc::new(client)
}

// --- Tests ---

#[tokio::test]
async fn test_mutation_invalidates_cached_reads() {
    let cacher = Arc::new(MemoryCacher::new());
    let recorder = Arc::new(Recorder::default());
    let db = DbService::builder("items", "items", memory_store())
        .fields(["id", "name", "quantity"])
        .non_negative(["quantity"])
        .cacher(cacher.clone())
        .listener(recorder.clone())
        .build();
    let store = db.store.clone();

    let broker = BrokerBuilder::new(config())
        .cacher(cacher.clone())
        .service(db.schema)
        .start()
        .await
        .unwrap();

    let created = broker
        .call(
            "items.create",
            into_params(json!({ "name": "widget", "quantity": 25, "internal": true })),
            CallContext::new(),
        )
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert!(created.get("internal").is_none());
    assert!(created.get("_id").is_none());

    let first = broker
        .call("items.get", into_params(json!({ "id": id })), CallContext::new())
        .await
        .unwrap();
    assert_eq!(first["quantity"], 25);
    assert_eq!(cacher.len(), 1);

    store
        .adjust(&CallContext::new(), &id, "quantity", 10, "value")
        .await
        .unwrap();
    assert!(cacher.is_empty());

    let second = broker
        .call("items.get", into_params(json!({ "id": id })), CallContext::new())
        .await
        .unwrap();
    assert_eq!(second["quantity"], 35);

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].0, Operation::Update);
    assert_eq!(events[1].2.as_ref().unwrap()["quantity"], 25);
    assert_eq!(events[1].1.as_ref().unwrap()["quantity"], 35);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_list_and_count_through_broker() {
    let db = DbService::builder("items", "items", memory_store()).build();
    let broker = BrokerBuilder::new(config()).service(db.schema).start().await.unwrap();

    for n in 0..3 {
        broker
            .call("items.create", into_params(json!({ "n": n })), CallContext::new())
            .await
            .unwrap();
    }

    let page = broker
        .call("items.list", into_params(json!({ "pageSize": "2" })), CallContext::new())
        .await
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["page"], 1);
    assert_eq!(page["totalPages"], 2);

    let count = broker
        .call("items.count", into_params(json!({ "query": { "n": 1 } })), CallContext::new())
        .await
        .unwrap();
    assert_eq!(count, json!(1));

    let err = broker
        .call("items.get", into_params(json!({ "id": "404" })), CallContext::new())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::EntityNotFound("404".into()));
}

#[tokio::test]
async fn test_deferred_action_is_redelivered_until_it_succeeds() {
    let handler = Arc::new(Flaky {
        failures: 2,
        attempts: AtomicU32::new(0),
    });
    let service = ServiceSchema::new("work")
        .action(
            ActionDescriptor::deferred("submit", "work.submit")
                .params(ParamSchema::new().field("job", ParamRule::string())),
        )
        .channel("work.submit", "work", handler.clone());

    let broker = BrokerBuilder::new(config()).service(service).start().await.unwrap();
    let mut events = broker.subscribe_events();
    let mut outcomes = broker.channels().outcomes();

    let ack = broker
        .call("work.submit", into_params(json!({ "job": "reindex" })), CallContext::new())
        .await
        .unwrap();
    assert_eq!(ack, json!(true));

    let done = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.name, "work.done");
    assert_eq!(done.payload, json!({ "job": "reindex" }));
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);

    let completed = loop {
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        if outcome.state == MessageState::Completed {
            break outcome;
        }
    };
    assert_eq!(completed.attempt, 3);

    broker.shutdown().await;
    let health = broker.health();
    assert_eq!(health.deliveries.redelivered, 2);
    assert_eq!(health.dead_letters, 0);
}

#[tokio::test]
async fn test_exhausted_redelivery_lands_in_dead_letters() {
    let handler = Arc::new(Flaky {
        failures: u32::MAX,
        attempts: AtomicU32::new(0),
    });
    let service = ServiceSchema::new("work").channel("work.submit", "work", handler.clone());
    let broker = BrokerBuilder::new(config()).service(service).start().await.unwrap();

    let payload: Record = into_params(json!({ "job": "never" }));
    broker
        .send_to_channel("work.submit", payload, &CallContext::new())
        .await
        .unwrap();

    // Drains the queue and waits for the in-flight delivery.
    broker.shutdown().await;

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 4);
    let letters = broker.channels().dead_letters();
    assert_eq!(letters.len(), 1);
    assert!(letters[0].error.is_retryable());
    assert_eq!(broker.health().deliveries.failed, 1);
}

#[tokio::test]
async fn test_validation_failure_never_publishes() {
    let handler = Arc::new(Flaky {
        failures: 0,
        attempts: AtomicU32::new(0),
    });
    let service = ServiceSchema::new("work")
        .action(
            ActionDescriptor::deferred("submit", "work.submit")
                .params(ParamSchema::new().field("job", ParamRule::string())),
        )
        .channel("work.submit", "work", handler.clone());
    let broker = BrokerBuilder::new(config()).service(service).start().await.unwrap();

    let err = broker
        .call("work.submit", into_params(json!({ "job": 7 })), CallContext::new())
        .await
        .unwrap_err();
    let payload = err.to_payload();
    assert_eq!(payload.kind, "ValidationError");
    assert_eq!(payload.fields[0].kind, "string");

    broker.shutdown().await;
    assert_eq!(broker.health().deliveries.published, 0);
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deferred_action_publishes_declared_fields_only() {
    let handler = Arc::new(Flaky {
        failures: 0,
        attempts: AtomicU32::new(0),
    });
    let service = ServiceSchema::new("work")
        .action(
            ActionDescriptor::deferred("submit", "work.submit")
                .params(ParamSchema::new().field("job", ParamRule::string())),
        )
        .channel("work.submit", "work", handler.clone());
    let broker = BrokerBuilder::new(config()).service(service).start().await.unwrap();
    let mut events = broker.subscribe_events();

    broker
        .call(
            "work.submit",
            into_params(json!({ "job": "reindex", "extra": { "nested": [1, 2] } })),
            CallContext::new(),
        )
        .await
        .unwrap();

    let done = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.payload, json!({ "job": "reindex" }));
    broker.shutdown().await;
}
