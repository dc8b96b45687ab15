//! Catalog description files.
//!
//! A catalog file lists databases, their tables and, for replicated tables,
//! the mutation log entries to load. JSON and TOML are accepted.
//!
//! ```toml
//! [[databases]]
//! name = "db1"
//!
//! [[databases.tables]]
//! name = "events"
//! engine = "ReplicatedMergeTree"
//!
//! [[databases.tables.mutations]]
//! id = "0000000000"
//! command = "DELETE WHERE user_id = 7"
//! create_time = 1700000000
//! block_numbers = [{ partition_id = "202401", number = 12 }]
//! parts_to_do = 2
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::mutations::MutationEntry;
use crate::registry::TableRegistry;
use crate::storage::{create_engine, EngineKind, ReplicatedMergeTree};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub databases: Vec<DatabaseDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDef {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    #[serde(default)]
    pub mutations: Vec<MutationEntry>,
}

fn default_engine() -> EngineKind {
    EngineKind::ReplicatedMergeTree
}

impl CatalogFile {
    pub fn from_json_str(s: &str) -> Result<Self, EngineError> {
        serde_json::from_str(s)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid catalog JSON: {e}")))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid catalog TOML: {e}")))
    }

    /// Load a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::NotFound(format!("cannot read {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("toml") => Self::from_toml_str(&text),
            other => Err(EngineError::InvalidArgument(format!(
                "unsupported catalog file extension: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Create every database and table described by the file.
    pub fn build_registry(&self) -> Result<TableRegistry, EngineError> {
        let registry = TableRegistry::new();
        for database in &self.databases {
            registry.create_database(&database.name)?;
            for def in &database.tables {
                registry.attach_table(build_table(&database.name, def)?)?;
            }
        }
        tracing::info!(
            databases = self.databases.len(),
            tables = registry.table_count(),
            "catalog loaded"
        );
        Ok(registry)
    }
}

fn build_table(
    database: &str,
    def: &TableDef,
) -> Result<Arc<dyn crate::storage::StorageEngine>, EngineError> {
    if def.engine != EngineKind::ReplicatedMergeTree {
        if !def.mutations.is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "{database}.{}: engine {:?} does not keep a mutation log",
                def.name, def.engine
            )));
        }
        return Ok(create_engine(def.engine, database, &def.name));
    }

    let table = ReplicatedMergeTree::new(database, &def.name);
    for entry in &def.mutations {
        table.mutations().import(entry.clone())?;
    }
    Ok(Arc::new(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML: &str = r#"
[[databases]]
name = "db1"

[[databases.tables]]
name = "events"

[[databases.tables.mutations]]
id = "0000000000"
command = "DELETE WHERE user_id = 7"
create_time = 1700000000
block_numbers = [{ partition_id = "202402", number = 3 }, { partition_id = "202401", number = 12 }]
parts_to_do = 2

[[databases.tables]]
name = "scratch"
engine = "Memory"
"#;

    #[test]
    fn test_toml_catalog() {
        let catalog = CatalogFile::from_toml_str(TOML).unwrap();
        let registry = catalog.build_registry().unwrap();
        assert_eq!(registry.table_count(), 2);

        let events = registry.get_table("db1", "events").unwrap();
        let statuses = events
            .as_mutation_source()
            .unwrap()
            .get_mutation_statuses()
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].parts_to_do, 2);
        assert!(!statuses[0].is_done);
        // Sorted on import.
        assert_eq!(statuses[0].block_numbers[0].partition_id, "202401");

        let scratch = registry.get_table("db1", "scratch").unwrap();
        assert_eq!(scratch.engine_name(), "Memory");
    }

    #[test]
    fn test_json_catalog_and_load() {
        let json = r#"{"databases":[{"name":"db","tables":[{"name":"t","engine":"MergeTree"}]}]}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, json).unwrap();

        let catalog = CatalogFile::load(&path).unwrap();
        assert_eq!(catalog.databases[0].tables[0].engine, EngineKind::MergeTree);
        assert!(CatalogFile::load(&dir.path().join("missing.json")).is_err());

        let yaml = dir.path().join("catalog.yaml");
        fs::write(&yaml, "databases: []").unwrap();
        assert!(CatalogFile::load(&yaml).is_err());
    }

    #[test]
    fn test_mutations_on_plain_engine_rejected() {
        let json = r#"{"databases":[{"name":"db","tables":[{"name":"t","engine":"MergeTree",
            "mutations":[{"id":"1","command":"DELETE WHERE 1","create_time":0}]}]}]}"#;
        let catalog = CatalogFile::from_json_str(json).unwrap();
        assert!(matches!(
            catalog.build_registry(),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
