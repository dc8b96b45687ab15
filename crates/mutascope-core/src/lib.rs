pub mod catalog_file;
pub mod config;
pub mod error;
pub mod mutations;
pub mod pushdown;
pub mod registry;
pub mod sql;
pub mod storage;
pub mod system_mutations;

pub use catalog_file::{CatalogFile, DatabaseDef, TableDef};
pub use config::{SystemTablesConfig, DEFAULT_MAX_BLOCK_SIZE};
pub use error::EngineError;
pub use mutations::{
    compare_mutation_ids, BlockNumber, MutationEntry, MutationLog, MutationState,
};
pub use pushdown::{predicate_mask, ArrowPushdownFilter, CompareOp, Predicate, PushdownFilter};
pub use registry::{
    scan_mutation_sources, validate_identifier, CandidateTables, TableHandle, TableRegistry,
};
pub use sql::{parse_predicate, parse_system_query, SystemQuery};
pub use storage::{
    create_engine, EngineKind, Memory, MergeTree, MutationStatusProvider, ReplicatedMergeTree,
    StorageEngine,
};
pub use system_mutations::{
    apply_predicate, mutations_schema, project, prune_candidates, MetricsSnapshot,
    MutationRowsBuilder, ProcessingStage, ReadOutput, ReadStats, SystemMutations,
    MUTATIONS_COLUMNS, MUTATIONS_TABLE, SYSTEM_DATABASE,
};
