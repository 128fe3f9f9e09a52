//! Pure decision logic for the replication steady-state loop
//! (`spec.md` §4.F steps 5-6): whether a binlog record should be sent at
//! all, and how to group a run of records into conflict-free batches.

use crate::binlog::{BinlogRecord, Op};

/// Decides whether `record` should be replicated to the peer right now,
/// given that peer's catch-up state (`spec.md` §4.F step 5).
///
/// - Every `SOURCE_*` record is always synced: it is this node's own fresh
///   mutation.
/// - `REPLICA_CREATE/DELETE/UPDATE/LINK/RENAME` are only synced while the
///   peer still needs historical catch-up (`need_sync_old &&
///   !sync_old_done`) and the record predates `until_timestamp`.
/// - `REPLICA_APPEND/MODIFY/TRUNCATE` are never resent: the peer already
///   received the matching effect through its own source chain.
pub fn should_sync(record: &BinlogRecord, need_sync_old: bool, sync_old_done: bool, until_timestamp: u32) -> bool {
    if record.op.is_source() {
        return true;
    }

    match record.op {
        Op::ReplicaCreate | Op::ReplicaDelete | Op::ReplicaUpdate | Op::ReplicaLink | Op::ReplicaRename => {
            need_sync_old && !sync_old_done && record.timestamp <= until_timestamp
        }
        Op::ReplicaAppend | Op::ReplicaModify | Op::ReplicaTruncate => false,
        _ => unreachable!("is_source() already handled every SOURCE_* variant"),
    }
}

/// The filename(s) touched by a record, for conflict detection. Rename
/// and link records touch both their primary name and their auxiliary
/// (old/source) name.
fn touched_names(record: &BinlogRecord) -> (&str, Option<&str>) {
    (&record.filename, record.aux.as_deref())
}

fn conflicts(a: &BinlogRecord, b: &BinlogRecord) -> bool {
    let (a_name, a_aux) = touched_names(a);
    let (b_name, b_aux) = touched_names(b);
    a_name == b_name
        || a_aux == Some(b_name)
        || b_aux == Some(a_name)
        || (a_aux.is_some() && a_aux == b_aux)
}

/// Greedily groups `records` (already filtered by [`should_sync`]) into
/// batches of at most `max_batch` records where no two records in the same
/// batch touch the same filename (`spec.md` §4.F step 6: "mutually
/// non-conflicting records"). Preserves input order across batches so a
/// conflicting record always lands in a later batch than the one it
/// conflicts with, keeping per-source ordering intact.
pub fn conflict_free_batches(records: &[BinlogRecord], max_batch: usize) -> Vec<Vec<usize>> {
    let max_batch = max_batch.max(1);
    let mut batches: Vec<Vec<usize>> = Vec::new();

    'outer: for (i, record) in records.iter().enumerate() {
        for batch in batches.iter_mut() {
            if batch.len() >= max_batch {
                continue;
            }
            if batch.iter().any(|&j| conflicts(&records[j], record)) {
                continue;
            }
            batch.push(i);
            continue 'outer;
        }
        batches.push(vec![i]);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ts: u32, op: Op, name: &str) -> BinlogRecord {
        BinlogRecord::new(ts, op, name)
    }

    #[test]
    fn source_ops_always_sync() {
        assert!(should_sync(&rec(1, Op::SourceCreate, "a"), false, true, 0));
    }

    #[test]
    fn replica_append_never_resyncs() {
        assert!(!should_sync(&rec(1, Op::ReplicaAppend, "a"), true, false, 100));
    }

    #[test]
    fn replica_create_syncs_only_during_catch_up_window() {
        assert!(should_sync(&rec(50, Op::ReplicaCreate, "a"), true, false, 100));
        assert!(!should_sync(&rec(150, Op::ReplicaCreate, "a"), true, false, 100));
        assert!(!should_sync(&rec(50, Op::ReplicaCreate, "a"), true, true, 100));
        assert!(!should_sync(&rec(50, Op::ReplicaCreate, "a"), false, false, 100));
    }

    #[test]
    fn non_conflicting_records_batch_together() {
        let records = vec![rec(1, Op::SourceCreate, "a"), rec(2, Op::SourceCreate, "b")];
        let batches = conflict_free_batches(&records, 4);
        assert_eq!(batches, vec![vec![0, 1]]);
    }

    #[test]
    fn conflicting_records_on_the_same_file_split_across_batches() {
        let records = vec![rec(1, Op::SourceCreate, "a"), rec(2, Op::SourceDelete, "a")];
        let batches = conflict_free_batches(&records, 4);
        assert_eq!(batches, vec![vec![0], vec![1]]);
    }

    #[test]
    fn rename_conflicts_with_a_later_op_on_its_old_name() {
        let rename = BinlogRecord::new(1, Op::SourceRename, "new").with_aux("old");
        let records = vec![rename, rec(2, Op::SourceDelete, "old")];
        let batches = conflict_free_batches(&records, 4);
        assert_eq!(batches, vec![vec![0], vec![1]]);
    }

    #[test]
    fn batches_never_exceed_max_size() {
        let records: Vec<_> = (0..10).map(|i| rec(i, Op::SourceCreate, &format!("f{i}"))).collect();
        let batches = conflict_free_batches(&records, 3);
        assert!(batches.iter().all(|b| b.len() <= 3));
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 10);
    }
}
