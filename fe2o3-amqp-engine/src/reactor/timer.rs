use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Instant,
};

use crate::handler::Handler;

/// Identifies a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

/// Tasks ordered by deadline
///
/// Tasks with the same deadline fire in the order they were scheduled.
#[derive(Default)]
pub struct Timer {
    next_id: u64,
    queue: BinaryHeap<Reverse<(Instant, TaskId)>>,
    tasks: HashMap<TaskId, Option<Box<dyn Handler>>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("next_id", &self.next_id)
            .field("queue", &self.queue)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Timer {
    /// Schedules a task at `deadline`
    pub fn schedule(&mut self, deadline: Instant, handler: Option<Box<dyn Handler>>) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.queue.push(Reverse((deadline, id)));
        self.tasks.insert(id, handler);
        id
    }

    /// Cancels a task. Returns false if it has already fired or was cancelled.
    pub fn cancel(&mut self, task: TaskId) -> bool {
        self.tasks.remove(&task).is_some()
    }

    /// Deadline of the earliest pending task
    pub fn deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.queue.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is pending
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Removes the tasks that are due at `now`, earliest first
    pub(crate) fn fire(&mut self, now: Instant) -> Vec<(TaskId, Option<Box<dyn Handler>>)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.queue.peek().copied() {
            if deadline > now {
                break;
            }
            self.queue.pop();
            if let Some(handler) = self.tasks.remove(&id) {
                due.push((id, handler));
            }
        }
        due
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.queue.peek() {
            if self.tasks.contains_key(id) {
                break;
            }
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::Timer;

    #[test]
    fn tasks_fire_in_deadline_order() {
        let mut timer = Timer::default();
        let now = Instant::now();
        let late = timer.schedule(now + Duration::from_millis(20), None);
        let early = timer.schedule(now + Duration::from_millis(10), None);
        let cancelled = timer.schedule(now + Duration::from_millis(5), None);
        assert!(timer.cancel(cancelled));
        assert!(!timer.cancel(cancelled));

        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(10)));
        assert!(timer.fire(now).is_empty());
        let fired: Vec<_> = timer
            .fire(now + Duration::from_millis(30))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(fired, vec![early, late]);
        assert!(timer.is_empty());
        assert_eq!(timer.deadline(), None);
    }
}
