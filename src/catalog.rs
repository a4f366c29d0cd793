//! Table registry: maps table ids to their heap files.

use crate::access::heap::HeapFile;
use crate::error::{DbError, DbResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of open tables. The cache and the log manager resolve table
/// ids through it whenever they need a table's on-disk page store.
pub struct Catalog {
    tables: RwLock<HashMap<u32, Arc<HeapFile>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, table: Arc<HeapFile>) {
        self.tables.write().insert(table.table_id(), table);
    }

    pub fn table(&self, table_id: u32) -> DbResult<Arc<HeapFile>> {
        self.tables
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(DbError::UnknownTable(table_id))
    }

    pub fn table_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.tables.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
