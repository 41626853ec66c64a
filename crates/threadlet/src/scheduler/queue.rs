//! Ready queues: one run queue plus one FIFO per priority level.
//!
//! The run queue always dispatches first. When it is empty, a promotion pass
//! moves the head of each level one level up (High's head into the run
//! queue, Default's into High, Low's into Default). Passes repeat until the
//! run queue has an entry, so nothing queued is starved for long: every pass
//! moves the head of Low closer to the run queue.

use crate::threadlet::Priority;
use std::collections::VecDeque;

const LEVELS: usize = 3;

/// Run queue plus three priority FIFOs
#[derive(Debug)]
pub(crate) struct ReadyQueues<T> {
    run: VecDeque<T>,
    levels: [VecDeque<T>; LEVELS],
}

impl<T> ReadyQueues<T> {
    pub(crate) fn new() -> Self {
        Self {
            run: VecDeque::new(),
            levels: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    /// Queue for immediate continuation
    pub(crate) fn push_run(&mut self, item: T) {
        self.run.push_back(item);
    }

    /// Queue at the tail of a priority level
    pub(crate) fn push_priority(&mut self, item: T, priority: Priority) {
        self.levels[priority.level() - 1].push_back(item);
    }

    /// Take the next item to dispatch, promoting as needed.
    /// Returns the item and the number of promotion passes it took.
    pub(crate) fn pop(&mut self) -> Option<(T, usize)> {
        let mut passes = 0;
        while self.run.is_empty() {
            if !self.promote() {
                return None;
            }
            passes += 1;
        }
        self.run.pop_front().map(|item| (item, passes))
    }

    /// One promotion pass. Returns false if every level was empty.
    fn promote(&mut self) -> bool {
        let mut moved = false;
        for level in 0..LEVELS {
            if let Some(item) = self.levels[level].pop_front() {
                if level == 0 {
                    self.run.push_back(item);
                } else {
                    self.levels[level - 1].push_back(item);
                }
                moved = true;
            }
        }
        moved
    }

    /// Remove the first item matching `pred` by linear scan
    pub(crate) fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        if let Some(pos) = self.run.iter().position(&mut pred) {
            return self.run.remove(pos);
        }
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(&mut pred) {
                return level.remove(pos);
            }
        }
        None
    }

    /// Check whether any queued item matches `pred`
    pub(crate) fn contains_where(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.run.iter().any(&pred) || self.levels.iter().any(|l| l.iter().any(&pred))
    }

    /// Length of the run queue
    pub(crate) fn run_len(&self) -> usize {
        self.run.len()
    }

    /// Lengths of the High, Default and Low queues
    pub(crate) fn level_lens(&self) -> [usize; LEVELS] {
        [self.levels[0].len(), self.levels[1].len(), self.levels[2].len()]
    }

    /// Total queued items
    pub(crate) fn len(&self) -> usize {
        self.run.len() + self.levels.iter().map(VecDeque::len).sum::<usize>()
    }

    /// Remove everything, run queue first, then High to Low
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out: Vec<T> = self.run.drain(..).collect();
        for level in &mut self.levels {
            out.extend(level.drain(..));
        }
        out
    }
}
