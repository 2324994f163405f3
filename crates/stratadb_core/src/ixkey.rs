//! Index specifications and order-preserving key encoding.

use crate::encoding::{Reader, Writer};
use crate::error::{CoreError, CoreResult};
use crate::record::Record;

/// Separator between fields of a composite key.
const FIELD_SEP: [u8; 2] = [0x00, 0x00];
/// Escape for a literal 0x00 inside a field.
const ZERO_ESCAPE: [u8; 2] = [0x00, 0x01];

/// Specification for an index on a table.
///
/// `fields` lists the record field positions that make up the key, in
/// significance order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexSpec {
    /// Name of the index, unique within its table.
    pub name: String,
    /// Record field positions forming the key.
    pub fields: Vec<u16>,
    /// Whether the index was declared unique. Keys are distinct in every
    /// index tree regardless; this flag is recorded for callers that build
    /// non-unique keys by appending disambiguating fields.
    pub unique: bool,
}

impl IndexSpec {
    /// Creates a new index specification over `fields`.
    pub fn new(name: impl Into<String>, fields: Vec<u16>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Builds the index key for `record`.
    ///
    /// A single-field key is the raw field. Composite keys escape 0x00 inside
    /// fields and separate fields with 0x00 0x00, so byte order of keys
    /// matches field-by-field order. Missing fields encode as empty.
    #[must_use]
    pub fn key(&self, record: &Record) -> Vec<u8> {
        if let [only] = self.fields.as_slice() {
            return record.field(usize::from(*only)).to_vec();
        }
        let mut key = Vec::new();
        for (i, &field) in self.fields.iter().enumerate() {
            if i > 0 {
                key.extend_from_slice(&FIELD_SEP);
            }
            for &b in record.field(usize::from(field)) {
                if b == 0 {
                    key.extend_from_slice(&ZERO_ESCAPE);
                } else {
                    key.push(b);
                }
            }
        }
        key
    }

    /// Checks that the name and field list fit the persisted schema format.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for a name over 65535 bytes or
    /// more than 255 key fields.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.len() > usize::from(u16::MAX) {
            return Err(CoreError::invalid_format(format!(
                "index name of {} bytes is too long",
                self.name.len()
            )));
        }
        if self.fields.len() > usize::from(u8::MAX) {
            return Err(CoreError::invalid_format(format!(
                "index {} has {} fields, max {}",
                self.name,
                self.fields.len(),
                u8::MAX
            )));
        }
        Ok(())
    }

    // lengths bounded by `validate`
    pub(crate) fn write(&self, w: &mut Writer) {
        w.put_str(&self.name);
        w.put1(u8::from(self.unique));
        w.put1(self.fields.len() as u8);
        for &f in &self.fields {
            w.put2(f);
        }
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> CoreResult<Self> {
        let name = r.get_str()?.to_string();
        let unique = r.get1()? != 0;
        let nfields = r.get1()?;
        let fields = (0..nfields).map(|_| r.get2()).collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            name,
            fields,
            unique,
        })
    }
}
