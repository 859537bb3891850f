//! Row mutations applied through a write session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::PartialRow;
use crate::table::Table;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

/// One insert, update or delete against a table.
///
/// Build it with [`Table::new_insert`] and friends, fill the row, then hand it
/// to [`crate::WriteSession::apply`], which takes ownership on success.
#[derive(Clone, Debug)]
pub struct WriteOperation {
    kind: OperationKind,
    table: Table,
    row: PartialRow,
}

impl WriteOperation {
    pub(crate) fn new(kind: OperationKind, table: Table) -> Self {
        let row = PartialRow::new(table.schema().clone());
        Self { kind, table, row }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn row(&self) -> &PartialRow {
        &self.row
    }

    pub fn mutable_row(&mut self) -> &mut PartialRow {
        &mut self.row
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        self.row.size_in_bytes().saturating_add(16)
    }
}

impl fmt::Display for WriteOperation {
    /// Human-readable form, e.g. `INSERT uint32 key=1, string name=x`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.row)
    }
}
