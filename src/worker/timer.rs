use crate::time::{Clock, Instant};
use futures_util::Stream;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{self, Sleep};

/// Handle of a scheduled task, used to cancel it.
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub struct Timeout {
    deadline: Instant,
    id: u64,
}

impl Timeout {
    #[cfg(test)]
    pub(crate) fn new(deadline: Instant, id: u64) -> Self {
        Self { deadline, id }
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Delayed delivery of tasks to the event loop.
pub trait Scheduler<T> {
    /// Deliver `task` once `delay` has elapsed.
    fn schedule_in(&mut self, delay: Duration, task: T) -> Timeout;

    /// Drop a scheduled task. Returns false if it already fired or was cancelled.
    fn cancel(&mut self, timeout: Timeout) -> bool;
}

/// `Scheduler` backed by tokio timers. Yields due tasks as a `Stream`.
///
/// Deadlines are instants of `clock`. The clock has to advance at the pace of tokio time, but
/// its origin may differ.
pub(crate) struct Timer<T> {
    clock: Arc<dyn Clock>,
    next_id: u64,
    current: Option<CurrentTimerEntry<T>>,
    queue: BTreeMap<Timeout, T>,
}

impl<T> Timer<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_id: 0,
            current: None,
            queue: BTreeMap::new(),
        }
    }

    /// Has the timer no scheduled timeouts?
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn schedule_at(&mut self, deadline: Instant, value: T) -> Timeout {
        // If the current timeout is later than the new one, push it back into the queue.
        if let Some(current) = &self.current {
            let key = current.key;

            if deadline < key.deadline {
                if let Some(CurrentTimerEntry { value, .. }) = self.current.take() {
                    self.queue.insert(key, value);
                }
            }
        }

        let id = self.next_id();
        let key = Timeout { deadline, id };
        self.queue.insert(key, value);

        key
    }

    /// Drop every scheduled task.
    pub fn clear(&mut self) {
        self.current = None;
        self.queue.clear();
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

impl<T> Scheduler<T> for Timer<T> {
    fn schedule_in(&mut self, delay: Duration, task: T) -> Timeout {
        let deadline = self.clock.now() + delay;
        self.schedule_at(deadline, task)
    }

    fn cancel(&mut self, timeout: Timeout) -> bool {
        if let Some(current) = &self.current {
            if current.key == timeout {
                self.current = None;
                return true;
            }
        }

        self.queue.remove(&timeout).is_some()
    }
}

impl<T: Unpin> Stream for Timer<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(current) = &mut self.current {
                match current.sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        return Poll::Ready(self.current.take().map(|entry| entry.value));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let (key, value) = match self.queue.pop_first() {
                Some(entry) => entry,
                None => return Poll::Ready(None),
            };

            // Translate the deadline from the clock's timeline to tokio's.
            let remaining = key.deadline.saturating_duration_since(self.clock.now());

            self.current = Some(CurrentTimerEntry {
                sleep: Box::pin(time::sleep_until(Instant::now() + remaining)),
                value,
                key,
            });
        }
    }
}

struct CurrentTimerEntry<T> {
    sleep: Pin<Box<Sleep>>,
    value: T,
    key: Timeout,
}
