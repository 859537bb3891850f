use std::fmt;
use std::sync::Arc;

use crate::client::Client;
use crate::operation::{OperationKind, WriteOperation};
use crate::scanner::Scanner;
use crate::schema::Schema;

/// Handle to an opened table. Cheap to clone; all clones share one client.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

struct TableInner {
    client: Client,
    name: String,
    schema: Arc<Schema>,
}

impl Table {
    pub(crate) fn new(client: Client, name: String, schema: Schema) -> Self {
        Self {
            inner: Arc::new(TableInner {
                client,
                name,
                schema: Arc::new(schema),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn new_insert(&self) -> WriteOperation {
        WriteOperation::new(OperationKind::Insert, self.clone())
    }

    pub fn new_update(&self) -> WriteOperation {
        WriteOperation::new(OperationKind::Update, self.clone())
    }

    pub fn new_delete(&self) -> WriteOperation {
        WriteOperation::new(OperationKind::Delete, self.clone())
    }

    /// Scanner over all columns with no predicates; configure before `open`.
    pub fn new_scanner(&self) -> Scanner {
        Scanner::new(self.clone())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("schema", &self.inner.schema)
            .finish()
    }
}
