//! Storage engine abstraction and the engines known to the registry.
//!
//! Only replicated MergeTree tables keep a mutation log. Callers discover
//! that through [`StorageEngine::as_mutation_source`] instead of checking
//! the concrete engine type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::mutations::{MutationEntry, MutationLog};

/// Read access to a table's mutation log.
pub trait MutationStatusProvider: Send + Sync {
    /// Owned copy of every mutation entry in id order.
    ///
    /// Fails with [`EngineError::TableUnavailable`] once the table is dropped.
    fn get_mutation_statuses(&self) -> Result<Vec<MutationEntry>, EngineError>;
}

/// A table instance attached to the registry.
pub trait StorageEngine: Send + Sync {
    fn engine_name(&self) -> &'static str;

    fn database(&self) -> &str;

    fn table_name(&self) -> &str;

    fn is_dropped(&self) -> bool;

    /// Mark the table as dropped. Readers holding a handle see
    /// `TableUnavailable` from then on.
    fn drop_table(&self);

    /// `Some` only for engines that track mutations.
    fn as_mutation_source(&self) -> Option<&dyn MutationStatusProvider> {
        None
    }
}

/// Engine kinds that can be created by name, e.g. from a catalog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EngineKind {
    ReplicatedMergeTree,
    MergeTree,
    Memory,
}

impl EngineKind {
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        match name {
            "ReplicatedMergeTree" => Ok(EngineKind::ReplicatedMergeTree),
            "MergeTree" => Ok(EngineKind::MergeTree),
            "Memory" => Ok(EngineKind::Memory),
            other => Err(EngineError::InvalidArgument(format!("unknown engine: {other}"))),
        }
    }
}

#[derive(Debug)]
struct TableIdent {
    database: String,
    table: String,
    dropped: AtomicBool,
}

impl TableIdent {
    fn new(database: &str, table: &str) -> Self {
        TableIdent {
            database: database.to_string(),
            table: table.to_string(),
            dropped: AtomicBool::new(false),
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

// ============================================================================
// ReplicatedMergeTree
// ============================================================================

pub struct ReplicatedMergeTree {
    ident: TableIdent,
    zookeeper_path: String,
    replica_name: String,
    mutations: MutationLog,
}

impl ReplicatedMergeTree {
    pub fn new(database: &str, table: &str) -> Self {
        Self::with_replica(
            database,
            table,
            &format!("/clickhouse/tables/{database}/{table}"),
            "replica_1",
        )
    }

    pub fn with_replica(
        database: &str,
        table: &str,
        zookeeper_path: &str,
        replica_name: &str,
    ) -> Self {
        ReplicatedMergeTree {
            ident: TableIdent::new(database, table),
            zookeeper_path: zookeeper_path.to_string(),
            replica_name: replica_name.to_string(),
            mutations: MutationLog::new(),
        }
    }

    pub fn zookeeper_path(&self) -> &str {
        &self.zookeeper_path
    }

    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// Writer side of the log, used by the mutation executor.
    pub fn mutations(&self) -> &MutationLog {
        &self.mutations
    }
}

impl MutationStatusProvider for ReplicatedMergeTree {
    fn get_mutation_statuses(&self) -> Result<Vec<MutationEntry>, EngineError> {
        if self.is_dropped() {
            return Err(EngineError::TableUnavailable(self.ident.qualified()));
        }
        Ok(self.mutations.statuses())
    }
}

impl StorageEngine for ReplicatedMergeTree {
    fn engine_name(&self) -> &'static str {
        "ReplicatedMergeTree"
    }

    fn database(&self) -> &str {
        &self.ident.database
    }

    fn table_name(&self) -> &str {
        &self.ident.table
    }

    fn is_dropped(&self) -> bool {
        self.ident.dropped.load(Ordering::Acquire)
    }

    fn drop_table(&self) {
        self.ident.dropped.store(true, Ordering::Release);
    }

    fn as_mutation_source(&self) -> Option<&dyn MutationStatusProvider> {
        Some(self)
    }
}

// ============================================================================
// Engines without a mutation log
// ============================================================================

macro_rules! plain_engine {
    ($name:ident, $engine:literal) => {
        pub struct $name {
            ident: TableIdent,
        }

        impl $name {
            pub fn new(database: &str, table: &str) -> Self {
                $name {
                    ident: TableIdent::new(database, table),
                }
            }
        }

        impl StorageEngine for $name {
            fn engine_name(&self) -> &'static str {
                $engine
            }

            fn database(&self) -> &str {
                &self.ident.database
            }

            fn table_name(&self) -> &str {
                &self.ident.table
            }

            fn is_dropped(&self) -> bool {
                self.ident.dropped.load(Ordering::Acquire)
            }

            fn drop_table(&self) {
                self.ident.dropped.store(true, Ordering::Release);
            }
        }
    };
}

plain_engine!(MergeTree, "MergeTree");
plain_engine!(Memory, "Memory");

/// Build an empty table of the given kind.
pub fn create_engine(kind: EngineKind, database: &str, table: &str) -> Arc<dyn StorageEngine> {
    match kind {
        EngineKind::ReplicatedMergeTree => Arc::new(ReplicatedMergeTree::new(database, table)),
        EngineKind::MergeTree => Arc::new(MergeTree::new(database, table)),
        EngineKind::Memory => Arc::new(Memory::new(database, table)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_query() {
        let replicated = create_engine(EngineKind::ReplicatedMergeTree, "db", "r");
        let local = create_engine(EngineKind::MergeTree, "db", "m");
        let memory = create_engine(EngineKind::Memory, "db", "mem");

        assert!(replicated.as_mutation_source().is_some());
        assert!(local.as_mutation_source().is_none());
        assert!(memory.as_mutation_source().is_none());
        assert_eq!(local.engine_name(), "MergeTree");
    }

    #[test]
    fn test_dropped_table_is_unavailable() {
        let table = ReplicatedMergeTree::new("db", "t");
        table
            .mutations()
            .append("DELETE WHERE 1", [("all", 1)], 1)
            .unwrap();
        assert_eq!(table.get_mutation_statuses().unwrap().len(), 1);

        table.drop_table();
        let err = table.get_mutation_statuses().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "table unavailable: db.t");
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!(
            EngineKind::parse("ReplicatedMergeTree").unwrap(),
            EngineKind::ReplicatedMergeTree
        );
        assert!(EngineKind::parse("Kafka").is_err());
    }
}
