//! Shared environment handed to every tree and meta operation.

use crate::btree::LeafKeys;
use crate::config::Config;
use std::fmt;
use std::sync::Arc;
use stratadb_storage::Arena;

/// The arena, key accessor and configuration shared by all structures of one
/// store.
///
/// Passed explicitly instead of living in globals so tests can run several
/// independent stores side by side.
pub struct Env {
    arena: Arc<Arena>,
    keys: Arc<dyn LeafKeys>,
    config: Config,
}

impl Env {
    /// Creates an environment.
    pub fn new(arena: Arc<Arena>, keys: Arc<dyn LeafKeys>, config: Config) -> Self {
        Self {
            arena,
            keys,
            config,
        }
    }

    /// The arena everything is stored in.
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Shared handle to the arena.
    #[must_use]
    pub fn arena_handle(&self) -> Arc<Arena> {
        Arc::clone(&self.arena)
    }

    /// The leaf key accessor.
    #[must_use]
    pub fn keys(&self) -> &dyn LeafKeys {
        self.keys.as_ref()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("arena", &self.arena)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
