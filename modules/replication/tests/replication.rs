#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use replication::{
    Domain, MemoryTenantStore, Organization, ReplicaRegistry, ReplicatedModel, ReplicationConfig,
    ReplicationError, Replicator, install_lifecycle,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tenant_tasks::{
    DispatchError, Dispatcher, EventName, MemoryPublisher, TaskEnvelope, TaskOutcome,
    TaskRegistry, TasksConfig,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Space {
    id: u64,
    name: String,
    #[serde(default)]
    logo: Option<String>,
    #[serde(default)]
    total_devices: u32,
}

impl ReplicatedModel for Space {
    const SUBJECT: &'static str = "space";
    const SYNC_FIELDS: &'static [&'static str] = &["name", "logo"];
}

#[derive(Debug, Serialize, Deserialize)]
struct Device {
    id: String,
    serial: String,
}

impl ReplicatedModel for Device {
    const SUBJECT: &'static str = "device";
}

const ACME_ID: &str = "0192d1f4-6c1e-7cc1-a1c0-5f0b7c8d9e01";

fn acme() -> Organization {
    Organization {
        id: Uuid::parse_str(ACME_ID).unwrap(),
        name: "Acme".to_owned(),
        slug_name: "acme".to_owned(),
        is_multi_tenant: false,
        is_active: true,
    }
}

fn space(id: u64, name: &str) -> Space {
    Space {
        id,
        name: name.to_owned(),
        logo: None,
        total_devices: 0,
    }
}

/// Owning side: a replicator over a recording publisher.
fn owner(models: &[&str]) -> (Replicator, Arc<MemoryPublisher>) {
    let publisher = Arc::new(MemoryPublisher::new());
    let dispatcher = Dispatcher::new(&TasksConfig::default(), publisher.clone());
    let config = ReplicationConfig {
        models: models.iter().map(|m| (*m).to_owned()).collect(),
    };
    (Replicator::new(dispatcher, &config), publisher)
}

/// Consuming side: tenant store with replica and lifecycle tasks installed.
fn consumer() -> (
    Arc<MemoryTenantStore>,
    TaskRegistry<MemoryTenantStore, MemoryTenantStore>,
) {
    let store = Arc::new(MemoryTenantStore::new());
    let mut tasks = TaskRegistry::new("tenantbus", store.clone(), store.clone());
    ReplicaRegistry::new()
        .register::<Space>()
        .register::<Device>()
        .install(&mut tasks);
    install_lifecycle(&mut tasks, "example.io");
    (store, tasks)
}

fn event(name: &str, tenant: &str, payload: Value) -> TaskEnvelope {
    TaskEnvelope::new("tenantbus", &EventName::parse(name).unwrap(), tenant, payload)
}

async fn deliver(
    tasks: &TaskRegistry<MemoryTenantStore, MemoryTenantStore>,
    publisher: &MemoryPublisher,
) {
    for request in publisher.take() {
        let report = tasks.execute(&request.envelope).await;
        assert_eq!(
            report.outcome,
            TaskOutcome::Committed,
            "{}",
            request.envelope.task
        );
    }
}

async fn ok() -> Result<(), std::io::Error> {
    Ok(())
}

#[tokio::test]
async fn save_dispatches_sync_fields_after_local_write() {
    let (replicator, publisher) = owner(&["space"]);

    let envelope = replicator
        .save("acme", &space(7, "HQ"), ok())
        .await
        .unwrap()
        .expect("space is enrolled");

    assert_eq!(envelope.task, "tenantbus.tasks.update_space");
    assert_eq!(envelope.routing_key(), "acme.space.updated");
    assert_eq!(
        envelope.payload,
        json!({ "data": { "id": 7, "name": "HQ", "logo": null } })
    );
    assert_eq!(publisher.published().len(), 1);
}

#[tokio::test]
async fn delete_dispatches_only_the_key() {
    let (replicator, publisher) = owner(&["space"]);

    replicator
        .delete::<Space, _, _>("acme", &json!(7), ok())
        .await
        .unwrap();

    let sent = publisher.published();
    assert_eq!(sent[0].routing_key, "acme.space.deleted");
    assert_eq!(sent[0].envelope.payload, json!({ "pk": 7 }));
}

#[tokio::test]
async fn models_not_enrolled_are_not_dispatched() {
    let (replicator, publisher) = owner(&["device"]);

    let sent = replicator.save("acme", &space(7, "HQ"), ok()).await.unwrap();

    assert!(sent.is_none());
    assert_eq!(publisher.attempts(), 0);
}

#[tokio::test]
async fn local_failure_dispatches_nothing() {
    let (replicator, publisher) = owner(&["space"]);

    let err = replicator
        .save("acme", &space(7, "HQ"), async {
            Err(std::io::Error::other("disk full"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ReplicationError::Local { operation: "save", .. }));
    assert_eq!(publisher.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn delivery_failure_is_reported_after_local_write() {
    let publisher = Arc::new(MemoryPublisher::failing(u32::MAX));
    let dispatcher = Dispatcher::new(&TasksConfig::default(), publisher.clone());
    let replicator = Replicator::new(
        dispatcher,
        &ReplicationConfig {
            models: vec!["space".to_owned()],
        },
    );
    let mut persisted = false;

    let err = replicator
        .save("acme", &space(7, "HQ"), async {
            persisted = true;
            Ok::<(), std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(persisted);
    assert!(matches!(
        err,
        ReplicationError::Dispatch(DispatchError::DeliveryFailure { attempts: 4, .. })
    ));
}

#[tokio::test]
async fn tenant_lifecycle_end_to_end() {
    let (store, tasks) = consumer();

    let created = event(
        "new_organization",
        "acme",
        json!({
            "id": ACME_ID,
            "name": "Acme",
            "slug_name": "acme",
            "is_multi_tenant": false,
            "is_active": true,
        }),
    );
    assert_eq!(tasks.execute(&created).await.outcome, TaskOutcome::Committed);
    assert_eq!(store.tenant("acme"), Some(acme()));
    assert_eq!(
        store.domains("acme"),
        [Domain {
            domain: "acme.example.io".to_owned(),
            is_primary: true
        }]
    );

    // redelivery is harmless
    assert_eq!(tasks.execute(&created).await.outcome, TaskOutcome::Committed);
    assert_eq!(store.domains("acme").len(), 1);

    let deleted = event("delete_organization", "acme", json!({}));
    assert_eq!(tasks.execute(&deleted).await.outcome, TaskOutcome::Committed);
    assert_eq!(store.tenant("acme"), None);
}

#[tokio::test]
async fn replication_end_to_end() {
    let (replicator, publisher) = owner(&["space"]);
    let (store, tasks) = consumer();
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));

    replicator
        .save("acme", &space(7, "HQ"), ok())
        .await
        .unwrap();
    deliver(&tasks, &publisher).await;
    let record = store.replica("acme", "space", "7").unwrap();
    assert_eq!(record["name"], "HQ");

    replicator
        .save("acme", &space(7, "Head office"), ok())
        .await
        .unwrap();
    deliver(&tasks, &publisher).await;
    assert_eq!(store.replica("acme", "space", "7").unwrap()["name"], "Head office");

    replicator
        .delete::<Space, _, _>("acme", &json!(7), ok())
        .await
        .unwrap();
    deliver(&tasks, &publisher).await;
    assert!(store.replica("acme", "space", "7").is_none());
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let (store, tasks) = consumer();
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));
    let update = event(
        "update_space",
        "acme",
        json!({ "data": { "id": 3, "name": "Lab" } }),
    );

    tasks.execute(&update).await;
    let once = store.replica("acme", "space", "3");
    tasks.execute(&update).await;

    assert_eq!(store.replica("acme", "space", "3"), once);
    assert_eq!(store.replica_count("acme"), 1);
}

#[tokio::test]
async fn update_before_create_creates_the_record() {
    let (store, tasks) = consumer();
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));

    let report = tasks
        .execute(&event(
            "update_device",
            "acme",
            json!({ "data": { "id": "dev-1", "serial": "SN-42" } }),
        ))
        .await;

    assert_eq!(report.outcome, TaskOutcome::Committed);
    assert_eq!(
        store.replica("acme", "device", "dev-1").unwrap()["serial"],
        "SN-42"
    );
}

#[tokio::test]
async fn partial_update_merges_into_existing_record() {
    let (store, tasks) = consumer();
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));
    tasks
        .execute(&event(
            "update_space",
            "acme",
            json!({ "data": { "id": 3, "name": "Lab", "total_devices": 9 } }),
        ))
        .await;

    tasks
        .execute(&event(
            "update_space",
            "acme",
            json!({ "data": { "id": 3, "logo": "lab.png" } }),
        ))
        .await;

    let record = store.replica("acme", "space", "3").unwrap();
    assert_eq!(record["name"], "Lab");
    assert_eq!(record["logo"], "lab.png");
    assert_eq!(record["total_devices"], 9);
}

#[tokio::test]
async fn deleting_missing_record_succeeds() {
    let (store, tasks) = consumer();
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));

    let report = tasks
        .execute(&event("delete_space", "acme", json!({ "pk": 404 })))
        .await;

    assert_eq!(report.outcome, TaskOutcome::Committed);
}

#[tokio::test]
async fn malformed_payloads_are_dead_immediately() {
    let (store, tasks) = consumer();
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));

    for (name, payload) in [
        ("update_space", json!({ "id": 3 })),
        ("update_space", json!({ "data": { "name": "no key" } })),
        ("update_space", json!({ "data": { "id": 3, "name": 12 } })),
        ("delete_space", json!({})),
    ] {
        let report = tasks.execute(&event(name, "acme", payload)).await;
        assert!(
            matches!(report.outcome, TaskOutcome::Dead { .. }),
            "{name} should be dead: {:?}",
            report.outcome
        );
    }
    assert_eq!(store.replica_count("acme"), 0);
}

#[tokio::test]
async fn events_for_unknown_tenants_are_dead() {
    let (_store, tasks) = consumer();

    let report = tasks
        .execute(&event(
            "update_space",
            "ghost",
            json!({ "data": { "id": 1, "name": "x" } }),
        ))
        .await;

    assert!(matches!(report.outcome, TaskOutcome::Dead { .. }));
}

#[tokio::test]
async fn schemaless_replicas_store_payload_as_received() {
    let store = Arc::new(MemoryTenantStore::new());
    store.insert_tenant(acme(), Domain::primary_for("acme", "example.io"));
    let mut tasks = TaskRegistry::new("tenantbus", store.clone(), store.clone());
    ReplicaRegistry::new()
        .schemaless(["organization_role"])
        .install(&mut tasks);

    let report = tasks
        .execute(&event(
            "update_organization_role",
            "acme",
            json!({ "data": { "id": "r1", "name": "admin", "policies": [1, 2] } }),
        ))
        .await;
    assert_eq!(report.outcome, TaskOutcome::Committed);
    let record = store.replica("acme", "organization_role", "r1").unwrap();
    assert_eq!(record["policies"], json!([1, 2]));

    tasks
        .execute(&event(
            "delete_organization_role",
            "acme",
            json!({ "pk": "r1" }),
        ))
        .await;
    assert_eq!(store.replica_count("acme"), 0);
}
