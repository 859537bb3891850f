//! In-memory tablet: one key range of one table.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tabula_client::meta_cache::key_in_range;
use tabula_client::rpc::{ColumnRangePredicate, RowOperation};
use tabula_client::{OperationKind, Result, Row, Schema, Status, Value};

type StoredRow = Vec<Option<Value>>;

#[derive(Debug)]
pub struct Tablet {
    tablet_id: String,
    table_name: String,
    schema: Arc<Schema>,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    rows: RwLock<BTreeMap<Vec<u8>, StoredRow>>,
}

impl Tablet {
    pub fn new(
        tablet_id: impl Into<String>,
        table_name: impl Into<String>,
        schema: Arc<Schema>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    ) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            table_name: table_name.into(),
            schema,
            start_key,
            end_key,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Applies one row mutation.
    pub fn apply(&self, op: &RowOperation) -> Result<()> {
        let row = self.decode_row(op)?;
        let key_values = row[..self.schema.num_key_columns()]
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                value.clone().ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "key column {} not set",
                        self.schema.columns()[idx].name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let key = self.schema.encode_key(&key_values)?;
        if !key_in_range(&key, &self.start_key, &self.end_key) {
            return Err(Status::not_found(format!(
                "tablet {} does not cover the row's key",
                self.tablet_id
            )));
        }

        let mut rows = self
            .rows
            .write()
            .map_err(|_| Status::illegal_state("tablet lock poisoned"))?;
        match op.kind {
            OperationKind::Insert => {
                if rows.contains_key(&key) {
                    return Err(Status::already_present("key already present"));
                }
                if let Some(column) = self
                    .schema
                    .columns()
                    .iter()
                    .zip(&row)
                    .find(|(column, value)| !column.nullable && value.is_none())
                    .map(|(column, _)| column)
                {
                    return Err(Status::invalid_argument(format!(
                        "no value provided for required column: {} {}",
                        column.data_type.name(),
                        column.name
                    )));
                }
                rows.insert(key, row);
            }
            OperationKind::Update => {
                let Some(existing) = rows.get_mut(&key) else {
                    return Err(Status::not_found("key not found"));
                };
                for (slot, value) in existing.iter_mut().zip(row) {
                    if value.is_some() {
                        *slot = value;
                    }
                }
            }
            OperationKind::Delete => {
                if rows.remove(&key).is_none() {
                    return Err(Status::not_found("key not found"));
                }
            }
        }
        Ok(())
    }

    /// Matching rows in key order, projected to `projection`.
    pub fn scan(&self, projection: &[String], predicates: &[ColumnRangePredicate]) -> Result<Vec<Row>> {
        let projected = projection
            .iter()
            .map(|name| self.column_index(name))
            .collect::<Result<Vec<_>>>()?;
        let filters = predicates
            .iter()
            .map(|pred| Ok((self.column_index(&pred.column)?, pred)))
            .collect::<Result<Vec<_>>>()?;

        let rows = self
            .rows
            .read()
            .map_err(|_| Status::illegal_state("tablet lock poisoned"))?;
        Ok(rows
            .values()
            .filter(|row| filters.iter().all(|(idx, pred)| pred.matches(row[*idx].as_ref())))
            .map(|row| Row::new(projected.iter().map(|idx| row[*idx].clone()).collect()))
            .collect())
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.schema
            .find_column(name)
            .ok_or_else(|| Status::invalid_argument(format!("column not found: {name}")))
    }

    fn decode_row(&self, op: &RowOperation) -> Result<StoredRow> {
        let unknown = op
            .cells
            .iter()
            .filter(|(name, _)| self.schema.find_column(name).is_none())
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            return Err(Status::invalid_argument(format!(
                "Some columns are not present in the current schema: {}",
                unknown.join(", ")
            )));
        }

        let mut row = vec![None; self.schema.num_columns()];
        for (name, value) in &op.cells {
            let Some(idx) = self.schema.find_column(name) else {
                continue;
            };
            let column = &self.schema.columns()[idx];
            if value.data_type() != column.data_type {
                return Err(Status::invalid_argument(format!(
                    "column {} expects {}, got {}",
                    column.name,
                    column.data_type.name(),
                    value.data_type().name()
                )));
            }
            row[idx] = Some(value.clone());
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_client::{ColumnSchema, DataType};

    fn tablet() -> Tablet {
        let schema = Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("int_val", DataType::UInt32),
                ColumnSchema::new("string_val", DataType::String).nullable(),
            ],
            1,
        )
        .unwrap();
        Tablet::new("tablet-0", "t", Arc::new(schema), Vec::new(), Vec::new())
    }

    fn insert(key: u32, int_val: u32) -> RowOperation {
        RowOperation {
            kind: OperationKind::Insert,
            cells: vec![
                ("key".into(), Value::UInt32(key)),
                ("int_val".into(), Value::UInt32(int_val)),
            ],
        }
    }

    #[test]
    fn duplicate_insert_is_already_present() {
        let tablet = tablet();
        tablet.apply(&insert(1, 1)).expect("first insert");
        let err = tablet.apply(&insert(1, 2)).expect_err("dup");
        assert!(matches!(err, Status::AlreadyPresent(_)));
        assert_eq!(tablet.row_count(), 1);
    }

    #[test]
    fn unknown_columns_are_listed() {
        let tablet = tablet();
        let mut op = insert(1, 1);
        op.cells.push(("bad_col".into(), Value::UInt32(12345)));
        let err = tablet.apply(&op).expect_err("bad column");
        assert_eq!(
            err.to_string(),
            "Invalid argument: Some columns are not present in the current schema: bad_col"
        );
    }

    #[test]
    fn update_and_delete_require_an_existing_row() {
        let tablet = tablet();
        let update = RowOperation {
            kind: OperationKind::Update,
            cells: vec![
                ("key".into(), Value::UInt32(5)),
                ("int_val".into(), Value::UInt32(50)),
            ],
        };
        assert!(matches!(tablet.apply(&update), Err(Status::NotFound(_))));

        tablet.apply(&insert(5, 1)).unwrap();
        tablet.apply(&update).unwrap();
        let rows = tablet.scan(&["int_val".to_string()], &[]).unwrap();
        assert_eq!(rows[0].get_u32(0).unwrap(), 50);

        let delete = RowOperation {
            kind: OperationKind::Delete,
            cells: vec![("key".into(), Value::UInt32(5))],
        };
        tablet.apply(&delete).unwrap();
        assert!(matches!(tablet.apply(&delete), Err(Status::NotFound(_))));
    }

    #[test]
    fn scan_filters_and_projects_in_key_order() {
        let tablet = tablet();
        for key in [3u32, 1, 2, 10] {
            tablet.apply(&insert(key, key * 10)).unwrap();
        }
        let pred = ColumnRangePredicate::new("key", Some(Value::UInt32(2)), Some(Value::UInt32(3)));
        let rows = tablet.scan(&["int_val".to_string()], &[pred]).unwrap();
        let values = rows.iter().map(|r| r.get_u32(0).unwrap()).collect::<Vec<_>>();
        assert_eq!(values, vec![20, 30]);

        let counted = tablet.scan(&[], &[]).unwrap();
        assert_eq!(counted.len(), 4);
        assert!(counted.iter().all(Row::is_empty));
    }
}
