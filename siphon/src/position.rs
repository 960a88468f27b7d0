//! Kafka position tracker (C1): per-partition min-heap of offsets with a processed
//! bit, emitting monotonically non-decreasing commit watermarks. Ported from the
//! heapq-based `KafkaPositions`/`OffsetInfo` design of the original Python siphon.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KafkaPosition {
    pub topic_idx: usize,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Default)]
struct PartitionTracker {
    // Min-heap on offset; `Reverse` turns BinaryHeap's max-heap into a min-heap.
    heap: BinaryHeap<Reverse<i64>>,
    processed: std::collections::HashSet<i64>,
}

impl PartitionTracker {
    fn add(&mut self, offset: i64) {
        self.heap.push(Reverse(offset));
    }

    fn mark_processed(&mut self, offset: i64) {
        self.processed.insert(offset);
    }

    /// Pops offsets from the heap root while marked processed, returning the
    /// highest contiguously-processed offset seen (or None if the root isn't
    /// processed yet).
    fn drain(&mut self) -> Option<i64> {
        let mut watermark = None;
        while let Some(&Reverse(top)) = self.heap.peek() {
            if !self.processed.remove(&top) {
                break;
            }
            self.heap.pop();
            watermark = Some(top);
        }
        watermark
    }
}

/// Tracks in-flight Kafka offsets across every (topic, partition) pair the
/// consumer has seen, and hands back per-partition commit watermarks as
/// messages are marked processed.
#[derive(Default)]
pub struct KafkaPositions {
    topics: Vec<String>,
    partitions: HashMap<(usize, i32), PartitionTracker>,
}

impl KafkaPositions {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_idx(&mut self, topic: &str) -> usize {
        if let Some(idx) = self.topics.iter().position(|t| t == topic) {
            return idx;
        }
        self.topics.push(topic.to_string());
        self.topics.len() - 1
    }

    /// Idempotent insertion; the offset starts out not-processed.
    pub fn add(&mut self, topic: &str, partition: i32, offset: i64) -> KafkaPosition {
        let topic_idx = self.topic_idx(topic);
        self.partitions
            .entry((topic_idx, partition))
            .or_default()
            .add(offset);
        KafkaPosition {
            topic_idx,
            partition,
            offset,
        }
    }

    pub fn mark_processed(&mut self, pos: KafkaPosition) {
        if let Some(tracker) = self.partitions.get_mut(&(pos.topic_idx, pos.partition)) {
            tracker.mark_processed(pos.offset);
        }
    }

    pub fn mark_topic_processed(&mut self, topic: &str) {
        let Some(topic_idx) = self.topics.iter().position(|t| t == topic) else {
            return;
        };
        for ((t_idx, _), tracker) in self.partitions.iter_mut() {
            if *t_idx == topic_idx {
                let offsets: Vec<i64> = tracker.heap.iter().map(|Reverse(o)| *o).collect();
                for offset in offsets {
                    tracker.mark_processed(offset);
                }
            }
        }
    }

    /// Removes all contiguously-processed offsets per partition and returns the
    /// resulting commit watermarks as `(topic, partition, offset)` triples ready
    /// to hand to `TrackedConsumer::commit`.
    pub fn drain_commits(&mut self) -> Vec<(String, i32, i64)> {
        let mut out = Vec::new();
        for ((topic_idx, partition), tracker) in self.partitions.iter_mut() {
            if let Some(watermark) = tracker.drain() {
                out.push((self.topics[*topic_idx].clone(), *partition, watermark));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_contiguous_prefix() {
        let mut tracker = KafkaPositions::new();
        let p0 = tracker.add("ALS", 0, 0);
        let p1 = tracker.add("ALS", 0, 1);
        let _p2 = tracker.add("ALS", 0, 2);

        tracker.mark_processed(p1);
        assert!(tracker.drain_commits().is_empty());

        tracker.mark_processed(p0);
        let commits = tracker.drain_commits();
        assert_eq!(commits, vec![("ALS".to_string(), 0, 1)]);
    }

    #[test]
    fn watermarks_are_monotonic_per_partition() {
        let mut tracker = KafkaPositions::new();
        for offset in 0..5 {
            let pos = tracker.add("ALS", 0, offset);
            tracker.mark_processed(pos);
        }
        let commits = tracker.drain_commits();
        assert_eq!(commits, vec![("ALS".to_string(), 0, 4)]);
    }

    #[test]
    fn independent_partitions_tracked_separately() {
        let mut tracker = KafkaPositions::new();
        let p0 = tracker.add("ALS", 0, 10);
        let p1 = tracker.add("ALS", 1, 20);
        tracker.mark_processed(p0);
        tracker.mark_processed(p1);
        let mut commits = tracker.drain_commits();
        commits.sort_by_key(|(_, p, _)| *p);
        assert_eq!(
            commits,
            vec![("ALS".to_string(), 0, 10), ("ALS".to_string(), 1, 20)]
        );
    }

    #[test]
    fn mark_topic_processed_flushes_whole_topic() {
        let mut tracker = KafkaPositions::new();
        tracker.add("logs.foo", 0, 0);
        tracker.add("logs.foo", 0, 1);
        tracker.mark_topic_processed("logs.foo");
        assert_eq!(
            tracker.drain_commits(),
            vec![("logs.foo".to_string(), 0, 1)]
        );
    }
}
