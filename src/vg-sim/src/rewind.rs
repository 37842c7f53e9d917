use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use thiserror::Error;

use vg_common::base::repl::InstanceId;

use crate::physics::RigidBodyState;

#[derive(Debug, Clone, Error)]
pub enum RewindError {
    /// The requested tick fell off the retained window (or was never
    /// recorded).
    #[error("no physics snapshot retained for tick {0}")]
    OutOfRange(u32),
    #[error("rewind history is not enabled on this peer")]
    Disabled,
}

/// Bounded per-tick history of rigid body snapshots, evicted from the
/// oldest end. Holds at most `tick_rate * rewind_seconds` entries.
#[derive(Debug)]
pub struct RewindBuffer {
    capacity: usize,
    history: VecDeque<(u32, FxHashMap<InstanceId, RigidBodyState>)>,
}

impl RewindBuffer {
    pub fn new(tick_rate: u32, rewind_seconds: f32) -> Self {
        let capacity = ((tick_rate as f32 * rewind_seconds) as usize).max(1);

        Self {
            capacity,
            history: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn oldest_tick(&self) -> Option<u32> {
        self.history.front().map(|(tick, _)| *tick)
    }

    pub fn latest_tick(&self) -> Option<u32> {
        self.history.back().map(|(tick, _)| *tick)
    }

    /// Record this tick's snapshots, evicting the oldest entries beyond
    /// the retention window.
    pub fn record(&mut self, tick: u32, states: FxHashMap<InstanceId, RigidBodyState>) {
        debug_assert!(
            self.latest_tick().map_or(true, |latest| tick > latest),
            "ticks must be recorded in order"
        );

        self.history.push_back((tick, states));
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    pub fn states_at(
        &self,
        tick: u32,
    ) -> Result<&FxHashMap<InstanceId, RigidBodyState>, RewindError> {
        self.history
            .iter()
            .rev()
            .find(|(recorded, _)| *recorded == tick)
            .map(|(_, states)| states)
            .ok_or(RewindError::OutOfRange(tick))
    }
}
