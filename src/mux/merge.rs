use crate::logs::LogLine;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct MergeKey {
    timestamp: Option<DateTime<Utc>>,
    source_index: usize,
    queue: usize,
}

/// Merge per-source tail batches into one chronological sequence
///
/// Each batch is `(registration index, lines oldest first)`. Lines are
/// ordered by timestamp, ties broken by registration index. A line with
/// no timestamp sorts at the timestamp of the line before it in the same
/// source, or first if none came before. Only the head of each batch is
/// ever compared, so lines from one source keep their original order
/// even when its clock goes backwards.
pub fn merge_batches(batches: Vec<(usize, Vec<LogLine>)>) -> Vec<(usize, LogLine)> {
    let total = batches.iter().map(|(_, lines)| lines.len()).sum();
    let mut merged = Vec::with_capacity(total);
    let mut queues = Vec::with_capacity(batches.len());
    let mut heads = Vec::with_capacity(batches.len());
    let mut heap = BinaryHeap::new();

    for (queue, (source_index, lines)) in batches.into_iter().enumerate() {
        let mut lines = lines.into_iter();
        let head = lines.next();
        if let Some(ref line) = head {
            heap.push(Reverse(MergeKey {
                timestamp: line.timestamp,
                source_index,
                queue,
            }));
        }
        heads.push(head);
        queues.push(lines);
    }

    while let Some(Reverse(key)) = heap.pop() {
        let Some(line) = heads[key.queue].take() else {
            continue;
        };
        merged.push((key.source_index, line));

        if let Some(next) = queues[key.queue].next() {
            heap.push(Reverse(MergeKey {
                timestamp: next.timestamp.or(key.timestamp),
                source_index: key.source_index,
                queue: key.queue,
            }));
            heads[key.queue] = Some(next);
        }
    }

    merged
}
