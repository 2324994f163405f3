//! Per-table statistics and index roots as stored in the info trie.

use super::schema::Schema;
use super::Stamped;
use crate::btree::Btree;
use crate::encoding::{Reader, Writer};
use crate::env::Env;
use crate::error::{CoreError, CoreResult};
use crate::hamt::{HamtItem, PackedItem};
use crate::overlay::Overlay;
use crate::types::TransactionId;
use std::sync::Arc;

/// Row count, data size and index overlays of one table.
///
/// Inside a transaction the row and size fields hold deltas relative to the
/// committed values; they are summed in on commit.
#[derive(Debug, Clone)]
pub struct Info {
    /// Table name.
    pub table: String,
    /// Number of rows.
    pub nrows: i64,
    /// Total record bytes.
    pub size: i64,
    /// One overlay per index, in schema order.
    pub indexes: Vec<Overlay>,
    pub(crate) tombstone: bool,
    pub(crate) lastmod: u64,
}

impl Info {
    /// Creates the info for a new table with an empty tree per index.
    ///
    /// # Errors
    ///
    /// Returns an error if the arena cannot allocate.
    pub fn create(env: &Arc<Env>, schema: &Schema) -> CoreResult<Self> {
        let indexes = schema
            .indexes
            .iter()
            .map(|spec| Btree::create(Arc::clone(env), Arc::clone(spec)).map(Overlay::new))
            .collect::<CoreResult<_>>()?;
        Ok(Self {
            table: schema.table.clone(),
            nrows: 0,
            size: 0,
            indexes,
            tombstone: false,
            lastmod: 0,
        })
    }

    pub(crate) fn tombstone(table: &str, lastmod: u64) -> Self {
        Self {
            table: table.to_string(),
            nrows: 0,
            size: 0,
            indexes: Vec::new(),
            tombstone: true,
            lastmod,
        }
    }

    /// True if this entry marks a dropped table.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Overlay of the index called `name`.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&Overlay> {
        self.indexes.iter().find(|ov| ov.base().spec().name == name)
    }

    /// A transaction's private copy: zeroed counters and a mutable layer on
    /// every index.
    pub(crate) fn transaction_delta(&self, tran: TransactionId) -> Self {
        Self {
            table: self.table.clone(),
            nrows: 0,
            size: 0,
            indexes: self.indexes.iter().map(|ov| ov.mutable(tran)).collect(),
            tombstone: false,
            lastmod: self.lastmod,
        }
    }
}

impl HamtItem for Info {
    fn key(&self) -> &str {
        &self.table
    }
}

impl Stamped for Info {
    fn lastmod(&self) -> u64 {
        self.lastmod
    }

    fn set_lastmod(&mut self, clock: u64) {
        self.lastmod = clock;
    }

    fn is_tombstone(&self) -> bool {
        self.tombstone
    }
}

impl PackedItem for Info {
    type Context = Arc<Env>;

    // only merged bases are persisted; unmerged layers live in memory
    fn write_body(&self, w: &mut Writer) {
        w.put1(u8::from(self.tombstone));
        if self.tombstone {
            return;
        }
        w.put_i64(self.nrows).put_i64(self.size);
        // matches the schema's index count, bounded by `Schema::validate`
        w.put1(self.indexes.len() as u8);
        for ov in &self.indexes {
            ov.base().write(w);
        }
    }

    fn read_body(key: &str, r: &mut Reader<'_>, env: &Arc<Env>) -> CoreResult<Self> {
        let tombstone = match r.get1()? {
            0 => false,
            1 => true,
            n => return Err(CoreError::corruption(format!("bad tombstone flag {n}"))),
        };
        if tombstone {
            return Ok(Self::tombstone(key, 0));
        }
        let nrows = r.get_i64()?;
        let size = r.get_i64()?;
        let nindexes = r.get1()?;
        let indexes = (0..nindexes)
            .map(|_| Btree::read(r, env).map(Overlay::new))
            .collect::<CoreResult<_>>()?;
        Ok(Self {
            table: key.to_string(),
            nrows,
            size,
            indexes,
            tombstone: false,
            lastmod: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ixkey::IndexSpec;
    use crate::record::RecordKeys;
    use stratadb_storage::Arena;

    fn env() -> Arc<Env> {
        Arc::new(Env::new(
            Arc::new(Arena::in_memory().unwrap()),
            Arc::new(RecordKeys),
            Config::new(),
        ))
    }

    #[test]
    fn create_builds_empty_indexes() {
        let env = env();
        let schema = Schema::new(
            "orders",
            vec!["id".into(), "customer".into()],
            vec![IndexSpec::new("id", vec![0]), IndexSpec::new("customer", vec![1])],
        );
        let info = Info::create(&env, &schema).unwrap();
        assert_eq!(info.indexes.len(), 2);
        assert!(info.index("customer").is_some());
        assert!(info.index("missing").is_none());
        assert_eq!(info.index("id").unwrap().lookup(b"1").unwrap(), None);
    }

    #[test]
    fn info_body_round_trip() {
        let env = env();
        let schema = Schema::new("t", vec!["k".into()], vec![IndexSpec::new("k", vec![0])]);
        let mut info = Info::create(&env, &schema).unwrap();
        info.nrows = 42;
        info.size = -7;
        let mut w = Writer::new();
        info.write_body(&mut w);
        let buf = w.into_inner();
        let back = Info::read_body("t", &mut Reader::new(&buf), &env).unwrap();
        assert_eq!(back.nrows, 42);
        assert_eq!(back.size, -7);
        assert_eq!(back.indexes.len(), 1);
        assert_eq!(back.indexes[0].base().root(), info.indexes[0].base().root());
    }

    #[test]
    fn transaction_delta_is_writable_and_zeroed() {
        let env = env();
        let schema = Schema::new("t", vec!["k".into()], vec![IndexSpec::new("k", vec![0])]);
        let mut info = Info::create(&env, &schema).unwrap();
        info.nrows = 10;
        let delta = info.transaction_delta(TransactionId(3));
        assert_eq!(delta.nrows, 0);
        assert!(delta.indexes.iter().all(Overlay::is_mutable));
        assert!(!info.indexes[0].is_mutable());
    }
}
