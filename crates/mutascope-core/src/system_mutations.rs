// system.mutations
//
// Read-only view over the mutation logs of every replicated table. A read
// runs in three stages: scan the registry for tables with a mutation log,
// prune that list with the query predicate on (database, table), and only
// then copy out the mutation entries of the surviving tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::builder::{
    Int64Builder, ListBuilder, StringBuilder, TimestampSecondBuilder, UInt8Builder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow_select::filter::filter_record_batch;
use serde::Serialize;

use crate::config::SystemTablesConfig;
use crate::error::EngineError;
use crate::mutations::MutationEntry;
use crate::pushdown::{predicate_mask, ArrowPushdownFilter, Predicate, PushdownFilter};
use crate::registry::{scan_mutation_sources, CandidateTables, TableHandle, TableRegistry};

pub const SYSTEM_DATABASE: &str = "system";
pub const MUTATIONS_TABLE: &str = "mutations";

/// Column names in schema order.
pub const MUTATIONS_COLUMNS: [&str; 9] = [
    "database",
    "table",
    "mutation_id",
    "command",
    "create_time",
    "block_numbers.partition_id",
    "block_numbers.number",
    "parts_to_do",
    "is_done",
];

/// Fixed output schema of `system.mutations`.
pub fn mutations_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("database", DataType::Utf8, false),
        Field::new("table", DataType::Utf8, false),
        Field::new("mutation_id", DataType::Utf8, false),
        Field::new("command", DataType::Utf8, false),
        Field::new(
            "create_time",
            DataType::Timestamp(TimeUnit::Second, None),
            false,
        ),
        Field::new(
            "block_numbers.partition_id",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            false,
        ),
        Field::new(
            "block_numbers.number",
            DataType::List(Arc::new(Field::new("item", DataType::Int64, true))),
            false,
        ),
        Field::new("parts_to_do", DataType::Int64, false),
        Field::new("is_done", DataType::UInt8, false),
    ]))
}

/// How far a storage read processed the query. `system.mutations` only
/// ever hands back raw columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessingStage {
    /// Raw columns only; the caller still applies the full filter and projection.
    FetchColumns,
}

/// Counters for a single read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadStats {
    /// Tables with a mutation log found by the scan.
    pub candidates: usize,
    /// Tables left after predicate pushdown.
    pub survivors: usize,
    /// Status provider calls made.
    pub status_fetches: usize,
    /// Survivors skipped because they disappeared or became unavailable.
    pub skipped_tables: usize,
    pub rows: usize,
}

#[derive(Debug)]
pub struct ReadOutput {
    pub batches: Vec<RecordBatch>,
    pub stage: ProcessingStage,
    pub stats: ReadStats,
}

impl ReadOutput {
    fn empty(stats: ReadStats) -> Self {
        ReadOutput {
            batches: Vec::new(),
            stage: ProcessingStage::FetchColumns,
            stats,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Process-lifetime counters, readable while reads are running.
#[derive(Debug, Default)]
pub struct SystemMutationsMetrics {
    reads: AtomicU64,
    rows_read: AtomicU64,
    status_fetches: AtomicU64,
    tables_pruned: AtomicU64,
    tables_skipped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub rows_read: u64,
    pub status_fetches: u64,
    pub tables_pruned: u64,
    pub tables_skipped: u64,
}

impl SystemMutationsMetrics {
    fn record(&self, stats: &ReadStats) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.rows_read.fetch_add(stats.rows as u64, Ordering::Relaxed);
        self.status_fetches
            .fetch_add(stats.status_fetches as u64, Ordering::Relaxed);
        self.tables_pruned.fetch_add(
            stats.candidates.saturating_sub(stats.survivors) as u64,
            Ordering::Relaxed,
        );
        self.tables_skipped
            .fetch_add(stats.skipped_tables as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            status_fetches: self.status_fetches.load(Ordering::Relaxed),
            tables_pruned: self.tables_pruned.load(Ordering::Relaxed),
            tables_skipped: self.tables_skipped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Table
// ============================================================================

pub struct SystemMutations {
    config: SystemTablesConfig,
    filter: Arc<dyn PushdownFilter>,
    metrics: SystemMutationsMetrics,
}

impl SystemMutations {
    pub fn new(config: SystemTablesConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(SystemMutations {
            config,
            filter: Arc::new(ArrowPushdownFilter),
            metrics: SystemMutationsMetrics::default(),
        })
    }

    /// Replace the pushdown filter used by [`SystemMutations::read`].
    pub fn with_filter(mut self, filter: Arc<dyn PushdownFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &SystemTablesConfig {
        &self.config
    }

    pub fn schema(&self) -> SchemaRef {
        mutations_schema()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reject empty, unknown or repeated column names.
    pub fn check_columns(&self, columns: &[&str]) -> Result<(), EngineError> {
        if columns.is_empty() {
            return Err(EngineError::EmptyColumnList);
        }
        for (i, name) in columns.iter().enumerate() {
            if !MUTATIONS_COLUMNS.contains(name) {
                return Err(EngineError::UnknownColumn(name.to_string()));
            }
            if columns[..i].contains(name) {
                return Err(EngineError::DuplicateColumn(name.to_string()));
            }
        }
        Ok(())
    }

    pub fn read(
        &self,
        columns: &[&str],
        predicate: &Predicate,
        registry: &TableRegistry,
    ) -> Result<ReadOutput, EngineError> {
        self.read_with(columns, predicate, registry, self.filter.as_ref())
    }

    /// Every schema column is materialized whatever `columns` asks for;
    /// use [`project`] to narrow the result.
    pub fn read_with(
        &self,
        columns: &[&str],
        predicate: &Predicate,
        registry: &TableRegistry,
        filter: &dyn PushdownFilter,
    ) -> Result<ReadOutput, EngineError> {
        self.check_columns(columns)?;
        for column in predicate.columns() {
            if !MUTATIONS_COLUMNS.contains(&column) {
                return Err(EngineError::UnknownColumn(column.to_string()));
            }
        }

        let mut stats = ReadStats::default();

        let candidates = scan_mutation_sources(registry);
        stats.candidates = candidates.len();

        let survivors = prune_candidates(filter, &candidates, predicate)?;
        stats.survivors = survivors.len();
        tracing::debug!(
            candidates = stats.candidates,
            survivors = stats.survivors,
            "system.mutations pushdown"
        );
        if survivors.is_empty() {
            self.metrics.record(&stats);
            return Ok(ReadOutput::empty(stats));
        }

        let mut rows = MutationRowsBuilder::new();
        for i in 0..survivors.len() {
            let handle = survivors.handle(i);
            if let Some(entries) = fetch_statuses(registry, &handle, &mut stats)? {
                for entry in &entries {
                    rows.append(&handle.database, &handle.table, entry)?;
                }
            }
        }
        stats.rows = rows.len();

        let batches = if rows.is_empty() {
            Vec::new()
        } else {
            split_batch(&rows.finish()?, self.config.max_block_size)
        };
        self.metrics.record(&stats);

        Ok(ReadOutput {
            batches,
            stage: ProcessingStage::FetchColumns,
            stats,
        })
    }
}

/// Run the pushdown filter over the candidate names.
pub fn prune_candidates(
    filter: &dyn PushdownFilter,
    candidates: &CandidateTables,
    predicate: &Predicate,
) -> Result<CandidateTables, EngineError> {
    if candidates.is_empty() {
        return Ok(CandidateTables::default());
    }
    let relation = candidates.to_record_batch()?;
    let keep = filter.filter(&relation, predicate)?;
    if keep.iter().any(|&i| i >= candidates.len()) {
        return Err(EngineError::Internal(
            "pushdown filter returned an out of range row".into(),
        ));
    }
    if keep.windows(2).any(|w| w[0] >= w[1]) {
        return Err(EngineError::Internal(
            "pushdown filter returned rows out of order or repeated".into(),
        ));
    }
    Ok(candidates.select(&keep))
}

/// Resolve the table again and copy out its mutation entries. `None` when
/// the table is gone, no longer tracks mutations, or was dropped mid-read.
fn fetch_statuses(
    registry: &TableRegistry,
    handle: &TableHandle,
    stats: &mut ReadStats,
) -> Result<Option<Vec<MutationEntry>>, EngineError> {
    let Some(engine) = registry.get_table(&handle.database, &handle.table) else {
        tracing::debug!(
            database = %handle.database,
            table = %handle.table,
            "table disappeared during read"
        );
        stats.skipped_tables += 1;
        return Ok(None);
    };
    let Some(source) = engine.as_mutation_source() else {
        tracing::debug!(
            database = %handle.database,
            table = %handle.table,
            "table no longer tracks mutations"
        );
        stats.skipped_tables += 1;
        return Ok(None);
    };

    stats.status_fetches += 1;
    match source.get_mutation_statuses() {
        Ok(entries) => Ok(Some(entries)),
        Err(e) if e.is_transient() => {
            tracing::debug!(
                database = %handle.database,
                table = %handle.table,
                error = %e,
                "skipping table"
            );
            stats.skipped_tables += 1;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Row materialization
// ============================================================================

/// Column builders for `system.mutations` rows.
pub struct MutationRowsBuilder {
    database: StringBuilder,
    table: StringBuilder,
    mutation_id: StringBuilder,
    command: StringBuilder,
    create_time: TimestampSecondBuilder,
    partition_ids: ListBuilder<StringBuilder>,
    block_numbers: ListBuilder<Int64Builder>,
    parts_to_do: Int64Builder,
    is_done: UInt8Builder,
    rows: usize,
}

impl MutationRowsBuilder {
    pub fn new() -> Self {
        MutationRowsBuilder {
            database: StringBuilder::new(),
            table: StringBuilder::new(),
            mutation_id: StringBuilder::new(),
            command: StringBuilder::new(),
            create_time: TimestampSecondBuilder::new(),
            partition_ids: ListBuilder::new(StringBuilder::new()),
            block_numbers: ListBuilder::new(Int64Builder::new()),
            parts_to_do: Int64Builder::new(),
            is_done: UInt8Builder::new(),
            rows: 0,
        }
    }

    /// Fails without appending anything when `parts_to_do` does not fit the
    /// Int64 column.
    pub fn append(
        &mut self,
        database: &str,
        table: &str,
        entry: &MutationEntry,
    ) -> Result<(), EngineError> {
        let parts_to_do = i64::try_from(entry.parts_to_do).map_err(|_| {
            EngineError::Internal(format!(
                "parts_to_do {} of mutation {} is out of range",
                entry.parts_to_do, entry.id
            ))
        })?;
        self.database.append_value(database);
        self.table.append_value(table);
        self.mutation_id.append_value(&entry.id);
        self.command.append_value(&entry.command);
        self.create_time.append_value(entry.create_time);
        for block in &entry.block_numbers {
            self.partition_ids.values().append_value(&block.partition_id);
            self.block_numbers.values().append_value(block.number);
        }
        self.partition_ids.append(true);
        self.block_numbers.append(true);
        self.parts_to_do.append_value(parts_to_do);
        self.is_done.append_value(u8::from(entry.is_done));
        self.rows += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn finish(mut self) -> Result<RecordBatch, EngineError> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.database.finish()),
            Arc::new(self.table.finish()),
            Arc::new(self.mutation_id.finish()),
            Arc::new(self.command.finish()),
            Arc::new(self.create_time.finish()),
            Arc::new(self.partition_ids.finish()),
            Arc::new(self.block_numbers.finish()),
            Arc::new(self.parts_to_do.finish()),
            Arc::new(self.is_done.finish()),
        ];
        Ok(RecordBatch::try_new(mutations_schema(), columns)?)
    }
}

impl Default for MutationRowsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn split_batch(batch: &RecordBatch, max_rows: usize) -> Vec<RecordBatch> {
    let total = batch.num_rows();
    if total <= max_rows {
        return vec![batch.clone()];
    }
    (0..total)
        .step_by(max_rows)
        .map(|offset| batch.slice(offset, max_rows.min(total - offset)))
        .collect()
}

/// Rows of a `system.mutations` batch that satisfy `predicate` exactly.
/// Reads stop at [`ProcessingStage::FetchColumns`], so the caller runs this
/// before projecting.
pub fn apply_predicate(
    batch: &RecordBatch,
    predicate: &Predicate,
) -> Result<RecordBatch, EngineError> {
    if *predicate == Predicate::True {
        return Ok(batch.clone());
    }
    let mask = predicate_mask(batch, predicate)?;
    Ok(filter_record_batch(batch, &mask)?)
}

/// Keep only `columns` of a `system.mutations` batch, in the given order.
pub fn project(batch: &RecordBatch, columns: &[&str]) -> Result<RecordBatch, EngineError> {
    let schema = batch.schema();
    let indices = columns
        .iter()
        .map(|name| {
            schema
                .index_of(name)
                .map_err(|_| EngineError::UnknownColumn(name.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(batch.project(&indices)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::BlockNumber;
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Int64Type, TimestampSecondType, UInt8Type};
    use arrow_array::Array;

    fn entry(
        id: &str,
        partitions: &[(&str, i64)],
        parts_to_do: u64,
        is_done: bool,
    ) -> MutationEntry {
        MutationEntry {
            id: id.to_string(),
            command: "DELETE WHERE x = 1".to_string(),
            create_time: 1_700_000_000,
            block_numbers: partitions
                .iter()
                .map(|(p, n)| BlockNumber {
                    partition_id: p.to_string(),
                    number: *n,
                })
                .collect(),
            parts_to_do,
            is_done,
        }
    }

    #[test]
    fn test_schema_matches_column_list() {
        let schema = mutations_schema();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, MUTATIONS_COLUMNS);
    }

    #[test]
    fn test_check_columns() {
        let table = SystemMutations::new(SystemTablesConfig::default()).unwrap();
        assert!(table.check_columns(&MUTATIONS_COLUMNS).is_ok());
        assert!(matches!(
            table.check_columns(&["database", "foo"]),
            Err(EngineError::UnknownColumn(c)) if c == "foo"
        ));
        assert!(matches!(table.check_columns(&[]), Err(EngineError::EmptyColumnList)));
        assert!(matches!(
            table.check_columns(&["table", "table"]),
            Err(EngineError::DuplicateColumn(_))
        ));
    }

    #[test]
    fn test_rows_builder_layout() {
        let mut rows = MutationRowsBuilder::new();
        rows.append("db", "t", &entry("0000000000", &[("a", 4), ("b", 9)], 3, false))
            .unwrap();
        rows.append("db", "t", &entry("0000000001", &[], 0, true)).unwrap();
        let batch = rows.finish().unwrap();

        assert_eq!(batch.num_rows(), 2);
        let ids = batch.column(2).as_string::<i32>();
        assert_eq!(ids.value(1), "0000000001");

        let create = batch.column(4).as_primitive::<TimestampSecondType>();
        assert_eq!(create.value(0), 1_700_000_000);

        let partitions = batch.column(5).as_list::<i32>();
        let numbers = batch.column(6).as_list::<i32>();
        assert_eq!(partitions.value_length(0), 2);
        assert_eq!(numbers.value_length(0), 2);
        assert_eq!(partitions.value_length(1), 0);
        let first = numbers.value(0);
        let first = first.as_primitive::<Int64Type>();
        assert_eq!(first.values().to_vec(), vec![4, 9]);

        let parts = batch.column(7).as_primitive::<Int64Type>();
        assert_eq!(parts.value(0), 3);
        let done = batch.column(8).as_primitive::<UInt8Type>();
        assert_eq!((done.value(0), done.value(1)), (0, 1));
        assert_eq!(done.null_count(), 0);
    }

    #[test]
    fn test_parts_to_do_out_of_range_rejected() {
        let mut rows = MutationRowsBuilder::new();
        rows.append("db", "t", &entry("1", &[], i64::MAX as u64, false))
            .unwrap();
        assert!(matches!(
            rows.append("db", "t", &entry("2", &[], u64::MAX, false)),
            Err(EngineError::Internal(_))
        ));
        assert_eq!(rows.len(), 1);
        let batch = rows.finish().unwrap();
        assert_eq!(batch.column(7).as_primitive::<Int64Type>().value(0), i64::MAX);
    }

    #[test]
    fn test_split_and_project() {
        let mut rows = MutationRowsBuilder::new();
        for i in 0..5 {
            rows.append("db", "t", &entry(&i.to_string(), &[("all", i)], 0, false))
                .unwrap();
        }
        let batch = rows.finish().unwrap();

        let parts = split_batch(&batch, 2);
        let sizes: Vec<_> = parts.iter().map(|b| b.num_rows()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(split_batch(&batch, 10).len(), 1);

        let narrow = project(&batch, &["mutation_id", "database"]).unwrap();
        assert_eq!(narrow.num_columns(), 2);
        assert_eq!(narrow.schema().field(0).name(), "mutation_id");
        assert!(project(&batch, &["foo"]).is_err());
    }

    #[test]
    fn test_apply_predicate_on_mutation_columns() {
        let mut rows = MutationRowsBuilder::new();
        rows.append("db", "t", &entry("0000000000", &[("all", 1)], 0, true)).unwrap();
        rows.append("db", "t", &entry("0000000001", &[("all", 2)], 4, false)).unwrap();
        rows.append("db", "u", &entry("0000000000", &[("all", 1)], 1, false)).unwrap();
        let batch = rows.finish().unwrap();

        let pending = apply_predicate(&batch, &Predicate::eq("is_done", "0")).unwrap();
        assert_eq!(pending.num_rows(), 2);
        let tables = pending.column(1).as_string::<i32>();
        assert_eq!((tables.value(0), tables.value(1)), ("t", "u"));

        let p = Predicate::eq("table", "t").and(Predicate::Compare {
            column: "parts_to_do".into(),
            op: crate::pushdown::CompareOp::Gt,
            value: "0".into(),
        });
        assert_eq!(apply_predicate(&batch, &p).unwrap().num_rows(), 1);
        assert_eq!(apply_predicate(&batch, &Predicate::True).unwrap().num_rows(), 3);

        let on_array = Predicate::eq("block_numbers.number", "1");
        assert!(matches!(
            apply_predicate(&batch, &on_array),
            Err(EngineError::InvalidPredicate(_))
        ));
    }
}
