// Mutation log for replicated MergeTree tables
//
// Each replicated table keeps an append-only log of ALTER ... UPDATE/DELETE
// mutations. Entries are created with a fixed set of per-partition block
// numbers and are then advanced by the background executor, which lowers
// `parts_to_do` and eventually latches `is_done`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Width of generated mutation ids ("0000000000", "0000000001", ...).
pub const MUTATION_ID_WIDTH: usize = 10;

/// Largest `parts_to_do` accepted; it is reported as Int64.
pub const MAX_PARTS_TO_DO: u64 = i64::MAX as u64;

// ============================================================================
// Entries
// ============================================================================

/// Block number assigned to one partition when the mutation was created.
/// Parts of that partition with a lower max block number must be rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNumber {
    pub partition_id: String,
    pub number: i64,
}

/// One entry of a table's mutation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    pub id: String,
    pub command: String,
    /// Seconds since Unix epoch.
    pub create_time: i64,
    /// Sorted by partition id, one entry per partition.
    #[serde(default)]
    pub block_numbers: Vec<BlockNumber>,
    #[serde(default)]
    pub parts_to_do: u64,
    #[serde(default)]
    pub is_done: bool,
}

impl MutationEntry {
    pub fn state(&self) -> MutationState {
        if self.is_done {
            MutationState::Done
        } else {
            MutationState::Queued
        }
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = &str> {
        self.block_numbers.iter().map(|b| b.partition_id.as_str())
    }
}

/// Coarse classification of an entry, derived from `is_done` only.
/// `parts_to_do` is maintained independently and is not consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Queued,
    Done,
}

impl MutationState {
    pub fn name(&self) -> &'static str {
        match self {
            MutationState::Queued => "queued",
            MutationState::Done => "done",
        }
    }
}

/// Orders mutation ids. Two all-digit ids compare numerically, so
/// "0001" < "0000000002"; anything else compares as plain strings.
pub fn compare_mutation_ids(a: &str, b: &str) -> Ordering {
    fn is_numeric(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit())
    }
    if is_numeric(a) && is_numeric(b) {
        let a = a.trim_start_matches('0');
        let b = b.trim_start_matches('0');
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

/// Validate and sort the partition block numbers of a new entry.
pub fn normalize_block_numbers<I, S>(pairs: I) -> Result<Vec<BlockNumber>, EngineError>
where
    I: IntoIterator<Item = (S, i64)>,
    S: Into<String>,
{
    let mut by_partition = BTreeMap::new();
    for (partition_id, number) in pairs {
        let partition_id = partition_id.into();
        if partition_id.is_empty() {
            return Err(EngineError::InvalidArgument("empty partition id".into()));
        }
        if number < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "negative block number {number} for partition {partition_id}"
            )));
        }
        if by_partition.insert(partition_id.clone(), number).is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "duplicate partition id: {partition_id}"
            )));
        }
    }
    Ok(by_partition
        .into_iter()
        .map(|(partition_id, number)| BlockNumber { partition_id, number })
        .collect())
}

fn check_parts_to_do(parts_to_do: u64) -> Result<(), EngineError> {
    if parts_to_do > MAX_PARTS_TO_DO {
        return Err(EngineError::InvalidArgument(format!(
            "parts_to_do {parts_to_do} exceeds {MAX_PARTS_TO_DO}"
        )));
    }
    Ok(())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Log
// ============================================================================

#[derive(Default)]
struct LogState {
    entries: Vec<MutationEntry>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl LogState {
    fn entry_mut(&mut self, id: &str) -> Result<&mut MutationEntry, EngineError> {
        let pos = *self
            .positions
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("mutation {id}")))?;
        Ok(&mut self.entries[pos])
    }

    fn push(&mut self, entry: MutationEntry) -> Result<(), EngineError> {
        if let Some(last) = self.entries.last() {
            if compare_mutation_ids(&entry.id, &last.id) != Ordering::Greater {
                return Err(EngineError::InvalidArgument(format!(
                    "mutation id {} does not follow {}",
                    entry.id, last.id
                )));
            }
        }
        if let Ok(seq) = entry.id.parse::<u64>() {
            self.next_seq = self.next_seq.max(seq.saturating_add(1));
        }
        self.positions.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}

/// Append-only mutation log of one table.
///
/// All access goes through a short `RwLock` critical section; readers get
/// owned copies and never hold the lock after returning.
#[derive(Default)]
pub struct MutationLog {
    state: RwLock<LogState>,
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new entry stamped with the current time. Returns its id.
    pub fn append<I, S>(
        &self,
        command: &str,
        block_numbers: I,
        parts_to_do: u64,
    ) -> Result<String, EngineError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        self.append_at(command, now_secs(), block_numbers, parts_to_do)
    }

    /// Create a new entry with an explicit creation time.
    pub fn append_at<I, S>(
        &self,
        command: &str,
        create_time: i64,
        block_numbers: I,
        parts_to_do: u64,
    ) -> Result<String, EngineError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        if command.trim().is_empty() {
            return Err(EngineError::InvalidArgument("empty mutation command".into()));
        }
        check_parts_to_do(parts_to_do)?;
        let block_numbers = normalize_block_numbers(block_numbers)?;

        let mut state = self.state.write();
        let id = format!("{:0width$}", state.next_seq, width = MUTATION_ID_WIDTH);
        state.push(MutationEntry {
            id: id.clone(),
            command: command.to_string(),
            create_time,
            block_numbers,
            parts_to_do,
            is_done: false,
        })?;
        drop(state);

        tracing::debug!(mutation_id = %id, command, parts_to_do, "mutation entry created");
        Ok(id)
    }

    /// Insert an entry that already has an id, e.g. one fetched from another
    /// replica or loaded from disk. The id must be a sequence number, any
    /// zero padding, that sorts after every existing id; later generated ids
    /// continue from it.
    pub fn import(&self, mut entry: MutationEntry) -> Result<(), EngineError> {
        let is_sequence = !entry.id.is_empty() && entry.id.bytes().all(|c| c.is_ascii_digit());
        match entry.id.parse::<u64>() {
            Ok(seq) if is_sequence && seq < u64::MAX => {}
            _ => {
                return Err(EngineError::InvalidArgument(format!(
                    "mutation id {:?} is not a sequence number",
                    entry.id
                )))
            }
        }
        check_parts_to_do(entry.parts_to_do)?;
        entry.block_numbers = normalize_block_numbers(
            entry
                .block_numbers
                .into_iter()
                .map(|b| (b.partition_id, b.number)),
        )?;
        self.state.write().push(entry)
    }

    /// Lower the number of parts still to rewrite. Raising it is rejected.
    pub fn set_parts_to_do(&self, id: &str, parts_to_do: u64) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        if parts_to_do > entry.parts_to_do {
            return Err(EngineError::InvalidArgument(format!(
                "parts_to_do of mutation {id} cannot grow from {} to {parts_to_do}",
                entry.parts_to_do
            )));
        }
        entry.parts_to_do = parts_to_do;
        Ok(())
    }

    /// Record that one more part has been rewritten.
    pub fn part_done(&self, id: &str) -> Result<u64, EngineError> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        entry.parts_to_do = entry.parts_to_do.saturating_sub(1);
        Ok(entry.parts_to_do)
    }

    /// Latch `is_done`. It is never cleared.
    pub fn mark_done(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let entry = state.entry_mut(id)?;
        if !entry.is_done {
            entry.is_done = true;
            tracing::debug!(mutation_id = %id, parts_to_do = entry.parts_to_do, "mutation done");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<MutationEntry> {
        let state = self.state.read();
        state.positions.get(id).map(|&pos| state.entries[pos].clone())
    }

    /// Copy of every entry in id order.
    pub fn statuses(&self) -> Vec<MutationEntry> {
        self.state.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().entries.iter().filter(|e| !e.is_done).count()
    }
}
