//! Table schemas as stored in the schema trie.

use super::Stamped;
use crate::encoding::{Reader, Writer};
use crate::error::{CoreError, CoreResult};
use crate::hamt::{HamtItem, PackedItem};
use crate::ixkey::IndexSpec;
use std::sync::Arc;

/// Column names and index definitions of one table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    /// Table name.
    pub table: String,
    /// Column names in record field order.
    pub columns: Vec<String>,
    /// Index definitions. Positions match [`Info::indexes`](super::Info::indexes).
    pub indexes: Vec<Arc<IndexSpec>>,
    pub(crate) tombstone: bool,
    pub(crate) lastmod: u64,
}

impl Schema {
    /// Creates a schema.
    pub fn new(table: impl Into<String>, columns: Vec<String>, indexes: Vec<IndexSpec>) -> Self {
        Self {
            table: table.into(),
            columns,
            indexes: indexes.into_iter().map(Arc::new).collect(),
            tombstone: false,
            lastmod: 0,
        }
    }

    pub(crate) fn tombstone(table: &str, lastmod: u64) -> Self {
        Self {
            table: table.to_string(),
            tombstone: true,
            lastmod,
            ..Self::default()
        }
    }

    /// True if this entry marks a dropped table.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Checks that names and counts fit the persisted format.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for a table or column name over
    /// 65535 bytes, more than 65535 columns, more than 255 indexes, or an
    /// index that fails [`IndexSpec::validate`].
    pub fn validate(&self) -> CoreResult<()> {
        let max_name = usize::from(u16::MAX);
        if self.table.len() > max_name {
            return Err(CoreError::invalid_format(format!(
                "table name of {} bytes is too long",
                self.table.len()
            )));
        }
        if self.columns.len() > usize::from(u16::MAX) {
            return Err(CoreError::invalid_format(format!(
                "{} has {} columns, max {}",
                self.table,
                self.columns.len(),
                u16::MAX
            )));
        }
        if let Some(col) = self.columns.iter().find(|c| c.len() > max_name) {
            return Err(CoreError::invalid_format(format!(
                "column name of {} bytes is too long",
                col.len()
            )));
        }
        if self.indexes.len() > usize::from(u8::MAX) {
            return Err(CoreError::invalid_format(format!(
                "{} has {} indexes, max {}",
                self.table,
                self.indexes.len(),
                u8::MAX
            )));
        }
        self.indexes.iter().try_for_each(|ix| ix.validate())
    }
}

impl HamtItem for Schema {
    fn key(&self) -> &str {
        &self.table
    }
}

impl Stamped for Schema {
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

impl PackedItem for Schema {
    type Context = ();

    // counts bounded by `Schema::validate`
    fn write_body(&self, w: &mut Writer) {
        w.put1(u8::from(self.tombstone));
        if self.tombstone {
            return;
        }
        w.put2(self.columns.len() as u16);
        for col in &self.columns {
            w.put_str(col);
        }
        w.put1(self.indexes.len() as u8);
        for ix in &self.indexes {
            ix.write(w);
        }
    }

    fn read_body(key: &str, r: &mut Reader<'_>, _: &()) -> CoreResult<Self> {
        let tombstone = match r.get1()? {
            0 => false,
            1 => true,
            n => return Err(CoreError::corruption(format!("bad tombstone flag {n}"))),
        };
        if tombstone {
            return Ok(Self::tombstone(key, 0));
        }
        let ncols = r.get2()?;
        let columns = (0..ncols)
            .map(|_| r.get_str().map(str::to_string))
            .collect::<CoreResult<_>>()?;
        let nindexes = r.get1()?;
        let indexes = (0..nindexes)
            .map(|_| IndexSpec::read(r).map(Arc::new))
            .collect::<CoreResult<_>>()?;
        Ok(Self {
            table: key.to_string(),
            columns,
            indexes,
            tombstone: false,
            lastmod: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_body_round_trip() {
        let schema = Schema::new(
            "customers",
            vec!["id".into(), "name".into(), "city".into()],
            vec![
                IndexSpec::new("id", vec![0]).unique(),
                IndexSpec::new("city_name", vec![2, 1]),
            ],
        );
        let mut w = Writer::new();
        schema.write_body(&mut w);
        let buf = w.into_inner();
        let back = Schema::read_body("customers", &mut Reader::new(&buf), &()).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn validate_rejects_oversized_schemas() {
        let cols = |n: usize| (0..n).map(|i| format!("c{i}")).collect::<Vec<_>>();
        let ixs = |n: usize| (0..n).map(|i| IndexSpec::new(format!("ix{i}"), vec![0])).collect();

        assert!(Schema::new("t", cols(3), ixs(255)).validate().is_ok());
        let err = Schema::new("t", cols(3), ixs(256)).validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
        assert!(Schema::new("t", cols(65_536), ixs(1)).validate().is_err());
        assert!(Schema::new("t", vec!["c".repeat(65_536)], ixs(1)).validate().is_err());
        assert!(Schema::new("t".repeat(65_536), cols(1), ixs(1)).validate().is_err());
        let wide = IndexSpec::new("wide", vec![0; 256]);
        assert!(Schema::new("t", cols(1), vec![wide]).validate().is_err());
    }

    #[test]
    fn tombstone_body_is_one_byte() {
        let t = Schema::tombstone("gone", 12);
        let mut w = Writer::new();
        t.write_body(&mut w);
        assert_eq!(w.len(), 1);
        let buf = w.into_inner();
        let back = Schema::read_body("gone", &mut Reader::new(&buf), &()).unwrap();
        assert!(back.is_tombstone());
        assert!(back.columns.is_empty());
    }
}
