//! In-memory storage collaborator.

use crate::error::StorageError;
use crate::filter;
use crate::storage::{key_string, Record, Scope, Storage};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use syncwire_protocol::{FilterOption, QueryOptions, SortDirection};

#[derive(Default)]
struct Table {
    rows: HashMap<String, (u64, Record)>,
    next_seq: u64,
    next_id: u64,
}

impl Table {
    fn ordered(&self) -> Vec<&Record> {
        let mut rows: Vec<_> = self.rows.values().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, r)| r).collect()
    }
}

/// Row maps per table, keyed by primary key. Rows keep insertion order.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

fn as_object(data: Record, table: &str) -> Result<Map<String, Value>, StorageError> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::InvalidQuery(format!(
            "record for '{}' must be an object, got {}",
            table, other
        ))),
    }
}

fn project(record: &Record, columns: &[String]) -> Record {
    if columns.is_empty() {
        return record.clone();
    }
    let Some(fields) = record.as_object() else {
        return record.clone();
    };
    let projected: Map<String, Value> = columns
        .iter()
        .filter_map(|c| fields.get(c).map(|v| (c.clone(), v.clone())))
        .collect();
    Value::Object(projected)
}

fn sort_records(records: &mut [Record], options: &QueryOptions) {
    if options.sort.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for sort in &options.sort {
            let av = a.get(&sort.column).filter(|v| !v.is_null());
            let bv = b.get(&sort.column).filter(|v| !v.is_null());
            // Missing values sort last in either direction.
            let ord = match (av, bv) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => return Ordering::Greater,
                (Some(_), None) => return Ordering::Less,
                (Some(x), Some(y)) => filter::compare(x, y).unwrap_or(Ordering::Equal),
            };
            let ord = match sort.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

impl Storage for MemoryStore {
    fn find(&self, scope: Scope<'_>, options: &QueryOptions) -> Result<Vec<Record>, StorageError> {
        scope.check_cancelled()?;
        let tables = self.tables.read();
        let Some(table) = tables.get(scope.table) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<Record> = table
            .ordered()
            .into_iter()
            .filter(|r| filter::matches_all(&options.filters, r))
            .cloned()
            .collect();
        drop(tables);

        sort_records(&mut records, options);

        let offset = options.offset.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(records
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| project(r, &options.columns))
            .collect())
    }

    fn find_by_id(
        &self,
        scope: Scope<'_>,
        id: &str,
        columns: &[String],
    ) -> Result<Record, StorageError> {
        scope.check_cancelled()?;
        self.tables
            .read()
            .get(scope.table)
            .and_then(|t| t.rows.get(id))
            .map(|(_, r)| project(r, columns))
            .ok_or_else(|| StorageError::NotFound {
                table: scope.table.to_string(),
                id: id.to_string(),
            })
    }

    fn insert(&self, scope: Scope<'_>, data: Record) -> Result<Record, StorageError> {
        scope.check_cancelled()?;
        let mut fields = as_object(data, scope.table)?;
        let mut tables = self.tables.write();
        let table = tables.entry(scope.table.to_string()).or_default();

        let id = match fields.get(scope.primary_key).and_then(key_string) {
            Some(id) => id,
            None => {
                // Skip ids already taken by explicitly keyed rows.
                loop {
                    table.next_id += 1;
                    let candidate = table.next_id.to_string();
                    if !table.rows.contains_key(&candidate) {
                        fields.insert(scope.primary_key.to_string(), Value::from(table.next_id));
                        break candidate;
                    }
                }
            }
        };

        if table.rows.contains_key(&id) {
            return Err(StorageError::Conflict {
                table: scope.table.to_string(),
                id,
            });
        }

        let record = Value::Object(fields);
        table.next_seq += 1;
        table.rows.insert(id, (table.next_seq, record.clone()));
        Ok(record)
    }

    fn update(&self, scope: Scope<'_>, id: &str, data: Record) -> Result<Record, StorageError> {
        scope.check_cancelled()?;
        let changes = as_object(data, scope.table)?;
        let mut tables = self.tables.write();
        let row = tables
            .get_mut(scope.table)
            .and_then(|t| t.rows.get_mut(id))
            .ok_or_else(|| StorageError::NotFound {
                table: scope.table.to_string(),
                id: id.to_string(),
            })?;

        if let Value::Object(fields) = &mut row.1 {
            for (column, value) in changes {
                if column != scope.primary_key {
                    fields.insert(column, value);
                }
            }
        }
        Ok(row.1.clone())
    }

    fn delete(&self, scope: Scope<'_>, id: &str) -> Result<Record, StorageError> {
        scope.check_cancelled()?;
        self.tables
            .write()
            .get_mut(scope.table)
            .and_then(|t| t.rows.remove(id))
            .map(|(_, r)| r)
            .ok_or_else(|| StorageError::NotFound {
                table: scope.table.to_string(),
                id: id.to_string(),
            })
    }

    fn count(&self, scope: Scope<'_>, filters: &[FilterOption]) -> Result<u64, StorageError> {
        scope.check_cancelled()?;
        Ok(self.tables.read().get(scope.table).map_or(0, |t| {
            t.rows
                .values()
                .filter(|(_, r)| filter::matches_all(filters, r))
                .count() as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncwire_protocol::{FilterOperator, SortOption};
    use tokio_util::sync::CancellationToken;

    fn seeded(token: &CancellationToken) -> MemoryStore {
        let store = MemoryStore::new();
        let scope = Scope::new("orders", "id", token);
        for (status, amount) in [("open", 10), ("closed", 30), ("open", 20), ("open", 5)] {
            store
                .insert(scope, json!({"status": status, "amount": amount}))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_generated_ids() {
        let token = CancellationToken::new();
        let store = MemoryStore::new();
        let scope = Scope::new("orders", "id", &token);

        let a = store.insert(scope, json!({"x": 1})).unwrap();
        store.insert(scope, json!({"id": 2, "x": 2})).unwrap();
        let c = store.insert(scope, json!({"x": 3})).unwrap();

        assert_eq!(a["id"], 1);
        assert_eq!(c["id"], 3);
        assert_eq!(store.len("orders"), 3);
    }

    #[test]
    fn test_duplicate_key_conflicts() {
        let token = CancellationToken::new();
        let store = MemoryStore::new();
        let scope = Scope::new("orders", "id", &token);
        store.insert(scope, json!({"id": "a"})).unwrap();
        assert!(matches!(
            store.insert(scope, json!({"id": "a"})),
            Err(StorageError::Conflict { .. })
        ));
    }

    #[test]
    fn test_find_filters_sorts_and_paginates() {
        let token = CancellationToken::new();
        let store = seeded(&token);
        let scope = Scope::new("orders", "id", &token);

        let options = QueryOptions {
            filters: vec![FilterOption::eq("status", "open")],
            sort: vec![SortOption {
                column: "amount".into(),
                direction: SortDirection::Desc,
            }],
            limit: Some(2),
            offset: Some(1),
            columns: vec!["amount".into()],
            preload: vec![],
        };
        let rows = store.find(scope, &options).unwrap();
        assert_eq!(rows, vec![json!({"amount": 10}), json!({"amount": 5})]);

        assert_eq!(
            store
                .count(scope, &[FilterOption::eq("status", "open")])
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_find_default_order_is_insertion() {
        let token = CancellationToken::new();
        let store = seeded(&token);
        let rows = store
            .find(Scope::new("orders", "id", &token), &QueryOptions::default())
            .unwrap();
        let amounts: Vec<_> = rows.iter().map(|r| r["amount"].clone()).collect();
        assert_eq!(amounts, vec![json!(10), json!(30), json!(20), json!(5)]);
    }

    #[test]
    fn test_update_merges_and_keeps_key() {
        let token = CancellationToken::new();
        let store = seeded(&token);
        let scope = Scope::new("orders", "id", &token);

        let updated = store
            .update(scope, "1", json!({"id": 99, "status": "closed"}))
            .unwrap();
        assert_eq!(updated, json!({"id": 1, "status": "closed", "amount": 10}));
        assert!(store.update(scope, "404", json!({})).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_returns_record() {
        let token = CancellationToken::new();
        let store = seeded(&token);
        let scope = Scope::new("orders", "id", &token);

        let removed = store.delete(scope, "2").unwrap();
        assert_eq!(removed["status"], "closed");
        assert!(store.find_by_id(scope, "2", &[]).is_err());
        assert_eq!(store.len("orders"), 3);
    }

    #[test]
    fn test_gt_filter_on_missing_table() {
        let token = CancellationToken::new();
        let store = MemoryStore::new();
        let options = QueryOptions::default().with_filter(FilterOption::new(
            "amount",
            FilterOperator::Gt,
            json!(1),
        ));
        let rows = store
            .find(Scope::new("nothing", "id", &token), &options)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_rejects_non_object() {
        let token = CancellationToken::new();
        let store = MemoryStore::new();
        assert!(matches!(
            store.insert(Scope::new("t", "id", &token), json!([1])),
            Err(StorageError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_cancelled_token() {
        let token = CancellationToken::new();
        let store = seeded(&token);
        token.cancel();
        let result = store.find(Scope::new("orders", "id", &token), &QueryOptions::default());
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }
}
