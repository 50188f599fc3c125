use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
};

use warden_model::{EpochMs, MAX_PRIORITY, PriorityTask, TaskId};

/// Heap slot. Highest effective priority first, then oldest, then first enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ranked {
    effective_priority: u8,
    created_at: EpochMs,
    seq: u64,
    id: TaskId,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.effective_priority
            .cmp(&other.effective_priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queued {
    seq: u64,
    task: PriorityTask,
}

/// A task whose effective priority was raised by aging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Aged {
    pub id: TaskId,
    pub name: String,
    pub from: u8,
    pub to: u8,
}

/// Max-heap of pending tasks.
///
/// Removal is lazy: the heap may hold slots for tasks no longer queued, and `pop` skips them.
#[derive(Default)]
pub(super) struct TaskQueue {
    heap: BinaryHeap<Ranked>,
    tasks: HashMap<TaskId, Queued>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn push(&mut self, task: PriorityTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Ranked {
            effective_priority: task.effective_priority,
            created_at: task.created_at,
            seq,
            id: task.id.clone(),
        });
        self.tasks.insert(task.id.clone(), Queued { seq, task });
    }

    pub fn pop(&mut self) -> Option<PriorityTask> {
        while let Some(top) = self.heap.pop() {
            let live = self
                .tasks
                .get(&top.id)
                .is_some_and(|q| q.seq == top.seq && q.task.effective_priority == top.effective_priority);
            if live {
                return self.tasks.remove(&top.id).map(|q| q.task);
            }
        }
        None
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<PriorityTask> {
        self.tasks.remove(id).map(|q| q.task)
    }

    pub fn get(&self, id: &TaskId) -> Option<&PriorityTask> {
        self.tasks.get(id).map(|q| &q.task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &PriorityTask> {
        self.tasks.values().map(|q| &q.task)
    }

    pub fn drain(&mut self) -> Vec<PriorityTask> {
        self.heap.clear();
        self.tasks.drain().map(|(_, q)| q.task).collect()
    }

    /// Raise the effective priority of every task waiting longer than `threshold_ms` and re-heapify.
    ///
    /// `effective = min(100, priority + floor((wait - threshold) / 1000) * factor)`.
    pub fn age(&mut self, now: EpochMs, threshold_ms: u64, factor: u32) -> Vec<Aged> {
        let mut aged = Vec::new();
        for q in self.tasks.values_mut() {
            let wait = now.saturating_sub(q.task.queued_at);
            if wait <= threshold_ms {
                continue;
            }
            let steps = (wait - threshold_ms) / 1_000;
            let boost = steps.saturating_mul(factor as u64);
            let effective = (q.task.priority as u64)
                .saturating_add(boost)
                .min(MAX_PRIORITY as u64) as u8;
            if effective > q.task.effective_priority {
                aged.push(Aged {
                    id: q.task.id.clone(),
                    name: q.task.name.clone(),
                    from: q.task.effective_priority,
                    to: effective,
                });
                q.task.effective_priority = effective;
            }
        }

        if !aged.is_empty() || self.heap.len() > self.tasks.len() * 2 {
            self.rebuild();
        }
        aged
    }

    fn rebuild(&mut self) {
        self.heap = self
            .tasks
            .iter()
            .map(|(id, q)| Ranked {
                effective_priority: q.task.effective_priority,
                created_at: q.task.created_at,
                seq: q.seq,
                id: id.clone(),
            })
            .collect();
    }
}
