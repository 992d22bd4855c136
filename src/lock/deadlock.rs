use super::table::LockTable;

impl LockTable {
    /// Whether queuing the waiting entry `start` closes a cycle in the
    /// wait-for relation.
    ///
    /// A waiting entry waits for every conflicting entry of another
    /// transaction queued ahead of it, granted or not. The walk follows
    /// the `wait_lock` of each such transaction and stops when it meets
    /// the owner of `start` again. Every transaction is expanded at most
    /// once per run.
    pub(crate) fn detect_deadlock(&mut self, start: usize) -> bool {
        self.epoch += 1;
        let epoch = self.epoch;
        let origin = self.entries[start].txn;

        let mut stack = vec![start];
        while let Some(waiting) = stack.pop() {
            for blocker in self.ahead_of(waiting) {
                if !self.entries[blocker].conflicts_with(&self.entries[waiting]) {
                    continue;
                }

                let txn = self.entries[blocker].txn;
                if txn == origin {
                    return true;
                }

                if let Some(slot) = self.txns.get_mut(&txn) {
                    if slot.dead_epoch == epoch {
                        continue;
                    }
                    slot.dead_epoch = epoch;
                    if let Some(next) = slot.wait_lock {
                        stack.push(next);
                    }
                }
            }
        }
        false
    }
}
