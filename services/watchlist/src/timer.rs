//! Timeout timers bucketed by delay
//!
//! Every [`TimerGroup`] has one fixed delay, so the order in which its timers
//! were started is also the order in which they expire. Active timers sit on
//! an intrusive FIFO list; start and stop are O(1) and a stopped timer can be
//! restarted without reallocating.
//!
//! Time is passed in explicitly. Nothing here reads the clock.

use std::time::{Duration, Instant};

use crate::arena::{Arena, Handle};
use crate::list::{IndexList, Link, Linked};

/// Handle of a timer owned by a [`TimerManager`].
pub type TimerId = Handle;

/// Index of a timer group inside its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerGroupId(usize);

#[derive(Debug)]
struct Timer<O> {
    group: TimerGroupId,
    owner: O,
    deadline: Option<Instant>,
    link: Link,
}

impl<O> Linked for Timer<O> {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// A fixed delay and the timers currently running with it.
#[derive(Debug)]
pub struct TimerGroup {
    delay: Duration,
    active: IndexList,
}

impl TimerGroup {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Owns every timer and one group per distinct delay.
///
/// `O` identifies what a timer belongs to and is handed back on expiry.
#[derive(Debug)]
pub struct TimerManager<O> {
    timers: Arena<Timer<O>>,
    groups: Vec<TimerGroup>,
}

impl<O> Default for TimerManager<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> TimerManager<O> {
    pub fn new() -> Self {
        Self {
            timers: Arena::new(),
            groups: Vec::new(),
        }
    }

    /// Group for `delay`, created on first use.
    pub fn add_group(&mut self, delay: Duration) -> TimerGroupId {
        if let Some(index) = self.groups.iter().position(|g| g.delay == delay) {
            return TimerGroupId(index);
        }
        self.groups.push(TimerGroup {
            delay,
            active: IndexList::new(),
        });
        TimerGroupId(self.groups.len() - 1)
    }

    pub fn group(&self, id: TimerGroupId) -> Option<&TimerGroup> {
        self.groups.get(id.0)
    }

    /// Create an inactive timer in `group`.
    pub fn create_timer(&mut self, group: TimerGroupId, owner: O) -> TimerId {
        self.timers.insert(Timer {
            group,
            owner,
            deadline: None,
            link: Link::default(),
        })
    }

    /// Start (or restart) a timer at `now`. Returns its deadline.
    pub fn start(&mut self, id: TimerId, now: Instant) -> Option<Instant> {
        self.stop(id);
        let group_id = self.timers.get(id)?.group;
        let group = self.groups.get_mut(group_id.0)?;
        let deadline = now + group.delay;

        if let Some(timer) = self.timers.get_mut(id) {
            timer.deadline = Some(deadline);
        }
        group.active.push_back(&mut self.timers, id);
        Some(deadline)
    }

    /// Stop a timer. Returns true if it was running.
    pub fn stop(&mut self, id: TimerId) -> bool {
        let group_id = match self.timers.get(id) {
            Some(timer) if timer.deadline.is_some() => timer.group,
            _ => return false,
        };
        if let Some(group) = self.groups.get_mut(group_id.0) {
            group.active.remove(&mut self.timers, id);
        }
        if let Some(timer) = self.timers.get_mut(id) {
            timer.deadline = None;
        }
        true
    }

    /// Stop and free a timer.
    pub fn destroy(&mut self, id: TimerId) -> Option<O> {
        self.stop(id);
        self.timers.remove(id).map(|timer| timer.owner)
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.deadline(id).is_some()
    }

    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.get(id).and_then(|timer| timer.deadline)
    }

    /// Earliest deadline across all groups.
    pub fn next_expiration(&self) -> Option<Instant> {
        self.groups
            .iter()
            .filter_map(|group| group.active.front())
            .filter_map(|head| self.deadline(head))
            .min()
    }

    /// Pop the earliest timer whose deadline is at or before `now`.
    ///
    /// The timer is stopped before it is returned, so each activation fires
    /// at most once.
    pub fn try_get_expired_timer(&mut self, now: Instant) -> Option<(TimerId, O)>
    where
        O: Clone,
    {
        let (group_index, head, _) = self
            .groups
            .iter()
            .enumerate()
            .filter_map(|(index, group)| {
                let head = group.active.front()?;
                let deadline = self.deadline(head)?;
                Some((index, head, deadline))
            })
            .filter(|(_, _, deadline)| *deadline <= now)
            .min_by_key(|(_, _, deadline)| *deadline)?;

        self.groups[group_index].active.remove(&mut self.timers, head);
        let timer = self.timers.get_mut(head)?;
        timer.deadline = None;
        Some((head, timer.owner.clone()))
    }

    /// Stop every running timer. Returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for group in &mut self.groups {
            while let Some(head) = group.active.pop_front(&mut self.timers) {
                if let Some(timer) = self.timers.get_mut(head) {
                    timer.deadline = None;
                }
                stopped += 1;
            }
        }
        stopped
    }

    /// Timers running across all groups
    pub fn active_count(&self) -> usize {
        self.groups.iter().map(|g| g.active.len()).sum()
    }

    /// Timers allocated, running or not
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}
