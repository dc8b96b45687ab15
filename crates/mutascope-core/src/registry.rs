//! Process-wide table catalog and the scanner that finds mutation sources.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parking_lot::RwLock;

use crate::error::EngineError;
use crate::storage::StorageEngine;

/// Maximum length for database and table identifiers
const MAX_IDENTIFIER_LEN: usize = 128;

/// Validates a database or table identifier.
///
/// Rules:
/// - Must not be empty
/// - Must not exceed MAX_IDENTIFIER_LEN (128) characters
/// - Must start with a letter or underscore
/// - May only contain letters, digits, underscores
pub fn validate_identifier(name: &str, kind: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidArgument(format!("{kind} name cannot be empty")));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "{kind} name too long ({} > {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    let starts_ok = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !starts_ok {
        return Err(EngineError::InvalidArgument(format!(
            "{kind} name must start with a letter or underscore"
        )));
    }
    if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(EngineError::InvalidArgument(format!(
            "{kind} name contains invalid character: '{c}'"
        )));
    }
    Ok(())
}

type Tables = BTreeMap<String, Arc<dyn StorageEngine>>;

/// Catalog of databases and their tables.
///
/// Shared between DDL (writers) and system table reads. Enumeration copies
/// the current mapping under a short read lock; it is not a snapshot of the
/// whole server, so a concurrent scan may or may not see a table that is
/// being created or dropped.
#[derive(Default)]
pub struct TableRegistry {
    databases: RwLock<BTreeMap<String, Tables>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_database(&self, name: &str) -> Result<(), EngineError> {
        validate_identifier(name, "database")?;
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(EngineError::AlreadyExists(format!("database {name}")));
        }
        databases.insert(name.to_string(), Tables::new());
        tracing::info!(database = %name, "database created");
        Ok(())
    }

    /// Remove a database and mark each of its tables dropped.
    pub fn drop_database(&self, name: &str) -> Result<(), EngineError> {
        let tables = self
            .databases
            .write()
            .remove(name)
            .ok_or_else(|| EngineError::NotFound(format!("database {name}")))?;
        for table in tables.values() {
            table.drop_table();
        }
        tracing::info!(database = %name, tables = tables.len(), "database dropped");
        Ok(())
    }

    /// Register a fully constructed table under its own database and name.
    pub fn attach_table(&self, table: Arc<dyn StorageEngine>) -> Result<(), EngineError> {
        let database = table.database().to_string();
        let name = table.table_name().to_string();
        validate_identifier(&name, "table")?;

        let mut databases = self.databases.write();
        let tables = databases
            .get_mut(&database)
            .ok_or_else(|| EngineError::NotFound(format!("database {database}")))?;
        if tables.contains_key(&name) {
            return Err(EngineError::AlreadyExists(format!("table {database}.{name}")));
        }
        tracing::debug!(
            database = %database,
            table = %name,
            engine = table.engine_name(),
            "table attached"
        );
        tables.insert(name, table);
        Ok(())
    }

    /// Remove a table from the catalog without dropping its data.
    pub fn detach_table(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Arc<dyn StorageEngine>, EngineError> {
        self.databases
            .write()
            .get_mut(database)
            .and_then(|tables| tables.remove(table))
            .ok_or_else(|| EngineError::NotFound(format!("table {database}.{table}")))
    }

    /// Detach a table and mark it dropped for anyone still holding it.
    pub fn drop_table(&self, database: &str, table: &str) -> Result<(), EngineError> {
        let engine = self.detach_table(database, table)?;
        engine.drop_table();
        tracing::info!(database = %database, table = %table, "table dropped");
        Ok(())
    }

    pub fn get_table(&self, database: &str, table: &str) -> Option<Arc<dyn StorageEngine>> {
        self.databases
            .read()
            .get(database)
            .and_then(|tables| tables.get(table))
            .cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    /// Copy of every `(database, table, engine)` triple, ordered by name.
    pub fn tables_snapshot(&self) -> Vec<(String, String, Arc<dyn StorageEngine>)> {
        let databases = self.databases.read();
        let mut out = Vec::new();
        for (database, tables) in databases.iter() {
            for (name, engine) in tables.iter() {
                out.push((database.clone(), name.clone(), engine.clone()));
            }
        }
        out
    }

    pub fn table_count(&self) -> usize {
        self.databases.read().values().map(|t| t.len()).sum()
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// `(database, table)` name of one table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableHandle {
    pub database: String,
    pub table: String,
}

/// Tables that expose a mutation log, as two aligned name columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateTables {
    pub databases: Vec<String>,
    pub tables: Vec<String>,
}

impl CandidateTables {
    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    pub fn push(&mut self, database: String, table: String) {
        self.databases.push(database);
        self.tables.push(table);
    }

    pub fn handle(&self, i: usize) -> TableHandle {
        TableHandle {
            database: self.databases[i].clone(),
            table: self.tables[i].clone(),
        }
    }

    /// Keep only the rows at `indices`, in the given order.
    pub fn select(&self, indices: &[usize]) -> CandidateTables {
        let mut out = CandidateTables::default();
        for &i in indices {
            out.push(self.databases[i].clone(), self.tables[i].clone());
        }
        out
    }

    pub fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("database", DataType::Utf8, false),
            Field::new("table", DataType::Utf8, false),
        ]))
    }

    /// Two-column relation handed to the pushdown filter.
    pub fn to_record_batch(&self) -> Result<RecordBatch, EngineError> {
        let databases: ArrayRef = Arc::new(StringArray::from_iter_values(self.databases.iter()));
        let tables: ArrayRef = Arc::new(StringArray::from_iter_values(self.tables.iter()));
        Ok(RecordBatch::try_new(Self::schema(), vec![databases, tables])?)
    }
}

/// Collect every table whose engine reports a mutation source. Other
/// engines are skipped; that is not an error.
pub fn scan_mutation_sources(registry: &TableRegistry) -> CandidateTables {
    let mut candidates = CandidateTables::default();
    for (database, table, engine) in registry.tables_snapshot() {
        if engine.as_mutation_source().is_some() {
            candidates.push(database, table);
        }
    }
    candidates
}
