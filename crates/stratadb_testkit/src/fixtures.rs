//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores
//! and common test scenarios.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use stratadb_core::{Config, Env, Meta, RecordKeys};
use stratadb_storage::{Arena, ArenaOptions, FileBackend};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once per process. Set `RUST_LOG` to see
/// output, e.g. `RUST_LOG=stratadb_core=debug`.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A test store with automatic cleanup.
#[derive(Debug, Clone)]
pub struct TestStore {
    env: Arc<Env>,
    path: Option<PathBuf>,
    /// Kept alive to prevent cleanup.
    _temp_dir: Option<Arc<TempDir>>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self::memory_with(Config::default())
    }

    /// Creates an in-memory test store with `config`.
    pub fn memory_with(config: Config) -> Self {
        let arena = Arena::in_memory().expect("Failed to create in-memory arena");
        Self {
            env: env(arena, config),
            path: None,
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test store.
    pub fn file() -> Self {
        Self::file_with(Config::default())
    }

    /// Creates a file-based test store with `config`.
    pub fn file_with(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("data").join("strata.db");
        let backend = FileBackend::open_with_create_dirs(&path).expect("Failed to create file backend");
        let arena = Arena::open(Box::new(backend), ArenaOptions::default()).expect("Failed to open arena");
        Self {
            env: env(arena, config),
            path: Some(path),
            _temp_dir: Some(Arc::new(temp_dir)),
        }
    }

    /// Syncs and opens the same file again, as a restarted process would.
    /// An in-memory store is returned as is.
    pub fn reopen(&self) -> Self {
        let Some(path) = &self.path else {
            return self.clone();
        };
        self.env.arena().sync().expect("Failed to sync arena");
        let backend = FileBackend::open_existing(path).expect("Failed to reopen file backend");
        let arena = Arena::open(Box::new(backend), ArenaOptions::default()).expect("Failed to reopen arena");
        Self {
            env: env(arena, self.env.config().clone()),
            path: Some(path.clone()),
            _temp_dir: self._temp_dir.clone(),
        }
    }

    /// The store environment.
    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// Returns the arena file path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Empty metadata on this store.
    pub fn new_meta(&self) -> Meta {
        Meta::new(Arc::clone(&self.env))
    }
}

impl std::ops::Deref for TestStore {
    type Target = Env;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

fn env(arena: Arena, config: Config) -> Arc<Env> {
    Arc::new(Env::new(Arc::new(arena), Arc::new(RecordKeys), config))
}

/// Runs a test with a temporary in-memory store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    init_test_tracing();
    let store = TestStore::memory();
    f(&store)
}

/// Runs a test with a temporary file-based store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore, &Path) -> R,
{
    init_test_tracing();
    let store = TestStore::file();
    let path = store.path().expect("File store should have a path").to_path_buf();
    f(&store, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use stratadb_core::{IndexSpec, Info, Record, Schema};

    /// Customers keyed by id, with a secondary index on city.
    pub fn customers_schema() -> Schema {
        Schema::new(
            "customers",
            vec!["id".into(), "city".into()],
            vec![
                IndexSpec::new("id", vec![0]).unique(),
                IndexSpec::new("city_id", vec![1, 0]),
            ],
        )
    }

    /// Orders keyed by id, with a secondary index on customer.
    pub fn orders_schema() -> Schema {
        Schema::new(
            "orders",
            vec!["id".into(), "customer".into(), "note".into()],
            vec![
                IndexSpec::new("id", vec![0]).unique(),
                IndexSpec::new("customer_id", vec![1, 0]),
            ],
        )
    }

    /// Primary key text for row `id`.
    pub fn row_id(id: u32) -> String {
        format!("{id:06}")
    }

    /// A row of `schema` with primary key `id` and every other column set
    /// to `value`.
    pub fn row(schema: &Schema, id: u32, value: &str) -> Record {
        let mut fields = vec![row_id(id).into_bytes()];
        fields.resize(schema.columns.len().max(1), value.as_bytes().to_vec());
        Record::new(fields)
    }

    /// Metadata holding empty tables for `schemas`.
    pub fn meta_with_tables(store: &TestStore, schemas: Vec<Schema>) -> Meta {
        schemas.into_iter().fold(store.new_meta(), |meta, schema| {
            let info = Info::create(store.env(), &schema).expect("Failed to create table info");
            meta.put(schema, info).expect("Failed to add table")
        })
    }
}
