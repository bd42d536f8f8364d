//! Ready queue: a set of FIFO rings segregated by priority, with an
//! occupancy bitmap for O(1) lookup of the highest ready priority.
use std::collections::VecDeque;

/// Number of distinct priority levels. Level 0 is reserved for the idle
/// process, levels `1..PRIORITY_LEVELS` for configured processes.
pub const PRIORITY_LEVELS: usize = 64;

/// Index of a process control block.
pub type ProcIdx = usize;

pub struct ReadyQueue {
    /// The set of segregated rings, in which each ring stores the Ready
    /// processes at the corresponding priority in dispatch order.
    ///
    /// Invariant: `!queues[i].is_empty() == (bitmap & (1 << i) != 0)`
    queues: Vec<VecDeque<ProcIdx>>,

    /// Each bit indicates whether the ring corresponding to that bit
    /// contains a process or not.
    bitmap: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queues: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            bitmap: 0,
        }
    }

    /// Enqueue a newly readied process behind its priority peers.
    pub fn push_back(&mut self, priority: u8, proc: ProcIdx) {
        self.queues[priority as usize].push_back(proc);
        self.bitmap |= 1 << priority;
    }

    /// Enqueue a preempted process ahead of its priority peers, so it is
    /// resumed before any later activation at the same priority.
    pub fn push_front(&mut self, priority: u8, proc: ProcIdx) {
        self.queues[priority as usize].push_front(proc);
        self.bitmap |= 1 << priority;
    }

    /// The priority of the process that would be dequeued next.
    pub fn front_priority(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some((63 - self.bitmap.leading_zeros()) as u8)
        }
    }

    /// Dequeue the frontmost process of the highest occupied priority.
    pub fn pop_highest(&mut self) -> Option<ProcIdx> {
        let priority = self.front_priority()? as usize;
        let queue = &mut self.queues[priority];
        let proc = queue.pop_front();
        if queue.is_empty() {
            self.bitmap &= !(1 << priority);
        }
        proc
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_wins() {
        let mut q = ReadyQueue::new();
        q.push_back(3, 0);
        q.push_back(10, 1);
        q.push_back(5, 2);
        assert_eq!(q.front_priority(), Some(10));
        assert_eq!(q.pop_highest(), Some(1));
        assert_eq!(q.pop_highest(), Some(2));
        assert_eq!(q.pop_highest(), Some(0));
        assert_eq!(q.pop_highest(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_within_priority() {
        let mut q = ReadyQueue::new();
        q.push_back(7, 4);
        q.push_back(7, 5);
        q.push_back(7, 6);
        assert_eq!(q.pop_highest(), Some(4));
        assert_eq!(q.pop_highest(), Some(5));
        assert_eq!(q.pop_highest(), Some(6));
    }

    #[test]
    fn push_front_precedes_peers() {
        let mut q = ReadyQueue::new();
        q.push_back(7, 4);
        q.push_front(7, 5);
        assert_eq!(q.pop_highest(), Some(5));
        assert_eq!(q.pop_highest(), Some(4));
    }

    #[test]
    fn bitmap_tracks_emptiness() {
        let mut q = ReadyQueue::new();
        q.push_back(63, 1);
        assert_eq!(q.front_priority(), Some(63));
        q.pop_highest();
        assert_eq!(q.front_priority(), None);
    }
}
