//! Corruption scenarios for StrataDB integrity checking.
//!
//! Persisted data is never repaired in place. These scenarios damage a copy
//! of a persisted arena file and verify that reading it back reports a
//! fatal error instead of returning wrong answers.
//!
//! ## Test Strategy
//!
//! 1. **Flipped byte in a metadata block** - caught by `Meta::read`
//! 2. **Flipped byte in an index node** - caught by `Meta::check`
//! 3. **Truncated file** - the newest block reaches past the end
//! 4. **Damaged arena header** - refused when the arena is opened
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stratadb_testkit::crash::{CorruptionHarness, Damage};
//!
//! let mut harness = CorruptionHarness::new();
//! assert!(harness.run(Damage::FlipIndexNode).passed);
//! ```

use crate::fixtures::{init_test_tracing, scenarios, TestStore};
use crate::generators::RowChange;
use crate::integration::MetaHarness;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratadb_core::{Config, CoreError, CoreResult, Env, Meta, MetaRoot, RecordKeys};
use stratadb_storage::{Arena, ArenaOptions, FileBackend};

/// Ways a persisted file can be damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damage {
    /// Flip one byte inside the newest info block.
    FlipMetaBlock,
    /// Flip one byte inside the root node of the primary index.
    FlipIndexNode,
    /// Cut the file off in the middle of the newest info block.
    Truncate,
    /// Overwrite the arena magic.
    BadHeader,
}

impl Damage {
    /// All damage kinds.
    pub const ALL: [Damage; 4] = [
        Damage::FlipMetaBlock,
        Damage::FlipIndexNode,
        Damage::Truncate,
        Damage::BadHeader,
    ];
}

/// Result of a corruption scenario.
#[derive(Debug, Clone)]
pub struct CorruptionResult {
    /// Whether the damage was reported as expected.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// The reported error, if any.
    pub error: Option<String>,
}

impl CorruptionResult {
    /// Creates a passing result.
    pub fn pass(description: &str, error: &CoreError) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            error: Some(error.to_string()),
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, error: Option<&CoreError>) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            error: error.map(ToString::to_string),
        }
    }
}

/// Test harness for corruption scenarios.
///
/// Holds a file store with two tables persisted, the root of that persist
/// and the offset of the primary index root node of `customers`.
pub struct CorruptionHarness {
    harness: MetaHarness,
    root: MetaRoot,
    index_root: u64,
    copies: usize,
    /// Results of the scenarios run so far.
    pub results: Vec<CorruptionResult>,
}

impl Default for CorruptionHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CorruptionHarness {
    /// Builds and persists the sample data.
    pub fn new() -> Self {
        init_test_tracing();
        let mut harness = MetaHarness::new(TestStore::file_with(Config::new().max_node_size(128)));
        harness.create_table(scenarios::customers_schema());
        harness.create_table(scenarios::orders_schema());
        let rows: Vec<_> = (0..120)
            .map(|id| RowChange::Upsert {
                id,
                value: format!("city{}", id % 5),
            })
            .collect();
        harness.commit("customers", &rows);
        harness.commit("orders", &rows[..30]);
        let root = harness.persist(false);
        let index_root = harness
            .meta()
            .get_ro_info("customers")
            .expect("customers table missing")
            .indexes[0]
            .base()
            .root();
        Self {
            harness,
            root,
            index_root,
            copies: 0,
            results: Vec::new(),
        }
    }

    /// The root of the persisted metadata.
    pub fn root(&self) -> MetaRoot {
        self.root
    }

    fn path(&self) -> &Path {
        self.harness.store().path().expect("Corruption harness needs a file store")
    }

    /// Writes a damaged copy of the arena file next to it and returns its path.
    pub fn damaged_copy(&mut self, damage: Damage) -> PathBuf {
        self.harness.store().arena().sync().expect("Failed to sync arena");
        let mut image = std::fs::read(self.path()).expect("Failed to read arena file");
        let at = |off: u64| usize::try_from(off).expect("Offset out of range");
        match damage {
            // past the size field, inside the checksummed bytes
            Damage::FlipMetaBlock => image[at(self.root.info) + 3] ^= 0x40,
            Damage::FlipIndexNode => image[at(self.index_root) + 3] ^= 0x40,
            Damage::Truncate => image.truncate(at(self.root.info) + 5),
            Damage::BadHeader => image[0] ^= 0xff,
        }
        self.copies += 1;
        let copy = self.path().with_file_name(format!("damaged-{}.db", self.copies));
        std::fs::write(&copy, image).expect("Failed to write damaged copy");
        copy
    }

    /// Opens the arena at `path`, reads the metadata at the harness root and
    /// fully checks it.
    pub fn open_and_check(&self, path: &Path) -> CoreResult<Meta> {
        let backend = FileBackend::open_existing(path)?;
        let arena = Arena::open(Box::new(backend), ArenaOptions::default())?;
        let config = self.harness.store().config().clone();
        let env = Arc::new(Env::new(Arc::new(arena), Arc::new(RecordKeys), config));
        let meta = Meta::read(env, self.root)?;
        meta.check()?;
        Ok(meta)
    }

    /// Damages a copy, reopens it and records whether the damage was
    /// reported.
    pub fn run(&mut self, damage: Damage) -> CorruptionResult {
        let description = format!("{damage:?} is reported on open");
        let copy = self.damaged_copy(damage);
        let result = match self.open_and_check(&copy) {
            Ok(_) => CorruptionResult::fail(&description, None),
            Err(e) if !e.is_fatal() => CorruptionResult::fail(&description, Some(&e)),
            Err(e) => CorruptionResult::pass(&description, &e),
        };
        if !result.passed {
            tracing::warn!(?damage, error = ?result.error, "damage went unreported");
        }
        self.results.push(result.clone());
        result
    }

    /// Runs every damage kind.
    pub fn run_all(&mut self) -> Vec<CorruptionResult> {
        Damage::ALL.iter().map(|d| self.run(*d)).collect()
    }

    /// Persists more changes, then checks that the earlier root still reads
    /// back the earlier state from an undamaged copy.
    pub fn test_older_root_still_readable(&mut self) -> CorruptionResult {
        let description = "older root still readable after later persists";
        self.harness.drop_table("orders");
        self.harness.commit("customers", &[RowChange::Delete { id: 0 }]);
        self.harness.persist(false);

        self.harness.store().arena().sync().expect("Failed to sync arena");
        let result = match self.open_and_check(self.path()) {
            Ok(old) if old.get_ro_schema("orders").is_some() => {
                let nrows = old.get_ro_info("customers").map(|ti| ti.nrows);
                if nrows == Some(120) {
                    CorruptionResult {
                        passed: true,
                        description: description.to_string(),
                        error: None,
                    }
                } else {
                    CorruptionResult::fail(description, None)
                }
            }
            Ok(_) => CorruptionResult::fail(description, None),
            Err(e) => CorruptionResult::fail(description, Some(&e)),
        };
        self.results.push(result.clone());
        result
    }

    /// Returns whether every scenario run so far passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}
