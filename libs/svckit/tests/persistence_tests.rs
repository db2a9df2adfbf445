//! Persistence wiring and schema synchronisation.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde_json::{json, Value};
use sqlx::Row;

use svckit::bootstrap::{AppConfig, DatabaseConfig};
use svckit::mail::LogMailClient;
use svckit::persistence::{wire, WiringError};
use svckit::store::MemoryStore;
use svckit::{
    async_trait, Collaborators, ComponentMap, DbHandle, Mailer, Orchestrator, OrchestratorError, PersistenceComponent,
    PersistenceInit, RegistryBuilder, RequestError, SchemaBuilder,
};

type Log = Arc<Mutex<Vec<String>>>;

/// Needs two neighbours during `associate` and reaches them again through the
/// db handle in `set_db`.
struct Linked {
    name: &'static str,
    needs: [&'static str; 2],
    log: Log,
    peers: OnceLock<Vec<Arc<dyn PersistenceComponent>>>,
}

impl Linked {
    fn new(name: &'static str, needs: [&'static str; 2], log: &Log) -> Arc<dyn PersistenceComponent> {
        Arc::new(Self {
            name,
            needs,
            log: log.clone(),
            peers: OnceLock::new(),
        })
    }
}

#[async_trait]
impl PersistenceComponent for Linked {
    fn name(&self) -> &str {
        self.name
    }

    fn associate(&self, components: &ComponentMap) -> anyhow::Result<()> {
        let mut peers = Vec::new();
        for need in self.needs {
            let peer = components
                .get(need)
                .ok_or_else(|| anyhow::anyhow!("{} needs {need}", self.name))?;
            peers.push(peer.clone());
        }
        let _ = self.peers.set(peers);
        self.log.lock().push(format!("associate:{}", self.name));
        Ok(())
    }

    fn set_db(&self, db: DbHandle) -> anyhow::Result<()> {
        anyhow::ensure!(self.peers.get().is_some(), "{} was not associated", self.name);
        for need in self.needs {
            anyhow::ensure!(db.component(need).is_some(), "{need} missing from db");
        }
        self.log.lock().push(format!("set_db:{}", self.name));
        Ok(())
    }

    async fn read(&self, _filter: svckit::Filter) -> Result<Value, RequestError> {
        let peers = self.peers.get().map(|p| p.iter().map(|c| c.name().to_string()).collect::<Vec<_>>());
        Ok(json!({ "peers": peers }))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[tokio::test]
async fn wiring_runs_associate_on_all_before_set_db() {
    let log: Log = Arc::default();
    let mut components = ComponentMap::new();
    components.insert("a".into(), Linked::new("a", ["b", "c"], &log));
    components.insert("b".into(), Linked::new("b", ["a", "c"], &log));
    components.insert("c".into(), Linked::new("c", ["a", "b"], &log));

    let db = wire(components, None).unwrap();

    let log = log.lock().clone();
    assert_eq!(log.len(), 6);
    assert!(log[..3].iter().all(|e| e.starts_with("associate:")), "{log:?}");
    assert!(log[3..].iter().all(|e| e.starts_with("set_db:")), "{log:?}");

    let peers = db.component("c").unwrap().read(Default::default()).await.unwrap();
    assert_eq!(peers, json!({ "peers": ["a", "b"] }));
}

#[test]
fn wiring_failure_names_the_component() {
    let log: Log = Arc::default();
    let mut components = ComponentMap::new();
    components.insert("a".into(), Linked::new("a", ["b", "ghost"], &log));
    components.insert("b".into(), Linked::new("b", ["a", "a"], &log));

    match wire(components, None) {
        Err(WiringError::Associate { component, .. }) => assert_eq!(component, "a"),
        other => panic!("expected associate failure, got {:?}", other.map(|_| ())),
    }
    assert!(log.lock().iter().all(|e| !e.starts_with("set_db:")));
}

#[tokio::test]
async fn unimplemented_operations_are_501() {
    let log: Log = Arc::default();
    let component = Linked::new("a", ["a", "a"], &log);
    let err = component.create(json!({})).await.unwrap_err();
    assert_eq!(err.status().as_u16(), 501);
}

// ---------- schema sync ----------

struct Ledger;

#[async_trait]
impl PersistenceComponent for Ledger {
    fn name(&self) -> &str {
        "ledger"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn ledger_factory(schema: &mut SchemaBuilder, init: &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>> {
    schema.add(&init.name, "CREATE TABLE IF NOT EXISTS ledger (id INTEGER PRIMARY KEY, label TEXT NOT NULL)");
    Ok(Arc::new(Ledger))
}

fn broken_factory(schema: &mut SchemaBuilder, init: &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>> {
    schema.add(&init.name, "CREATE TABLE (");
    Ok(Arc::new(Ledger))
}

fn sqlite_config() -> AppConfig {
    AppConfig {
        logging: None,
        database: Some(DatabaseConfig {
            url: "sqlite::memory:".into(),
            max_conns: Some(1),
            log_statements: true,
        }),
        ..AppConfig::default()
    }
}

fn collaborators() -> Collaborators {
    Collaborators::new(
        Mailer::new(Arc::new(LogMailClient), "templates/emails"),
        Arc::new(MemoryStore::new()),
    )
}

#[tokio::test]
async fn schema_is_synchronised_before_modules_load() {
    let mut b = RegistryBuilder::default();
    b.register_persistence("ledger", ledger_factory);
    let registry = b.build().unwrap();

    let orch = Orchestrator::build_with(sqlite_config(), &registry, collaborators())
        .await
        .unwrap();
    let pool = orch.db().pool().unwrap();

    sqlx::query("INSERT INTO ledger (label) VALUES ($1)")
        .bind("opening")
        .execute(pool)
        .await
        .unwrap();
    let row = sqlx::query("SELECT COUNT(*) AS n FROM ledger").fetch_one(pool).await.unwrap();
    let n: i64 = row.try_get("n").unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn failing_schema_statement_aborts_startup() {
    let mut b = RegistryBuilder::default();
    b.register_persistence("ledger", ledger_factory)
        .register_persistence("broken", broken_factory);
    let registry = b.build().unwrap();

    let err = Orchestrator::build_with(sqlite_config(), &registry, collaborators())
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Schema(e) => assert_eq!(e.component, "broken"),
        other => panic!("expected schema error, got {other:?}"),
    }
}

#[tokio::test]
async fn without_a_database_schema_sync_is_skipped() {
    let mut b = RegistryBuilder::default();
    b.register_persistence("ledger", ledger_factory);
    let registry = b.build().unwrap();

    let cfg = AppConfig {
        logging: None,
        ..AppConfig::default()
    };
    let orch = Orchestrator::build_with(cfg, &registry, collaborators()).await.unwrap();
    assert!(orch.db().pool().is_none());
    assert!(orch.db().component("ledger").is_some());
}
