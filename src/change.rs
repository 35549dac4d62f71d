//! The mutation shape shared by the host's write callbacks, the table
//! access diff/emit path, and CRDT local-change application
//! (`spec.md` §4.3, §4.6, §6).

use crate::identifier::RecordId;
use crate::value::Row;

/// A single local or remote mutation. `Delete` only needs the id — a
/// tombstone carries no payload of its own.
#[derive(Clone, Debug)]
pub enum Change {
    Insert(Row),
    Update(Row),
    Delete(RecordId),
}

impl Change {
    pub fn row(&self) -> Option<&Row> {
        match self {
            Change::Insert(row) | Change::Update(row) => Some(row),
            Change::Delete(_) => None,
        }
    }
}
