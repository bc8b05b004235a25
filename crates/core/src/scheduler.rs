// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::device::DeviceId;
use crate::{Machine, SimResult};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// One-shot callback run at a tick boundary.
pub type Deferred = Box<dyn FnOnce(&mut Machine) -> SimResult<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

// Devices sort before timers due on the same cycle, and by registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum WakeTarget {
    Device(DeviceId),
    Timer(TimerId),
}

/// Work that became due, in dispatch order.
pub enum Due {
    Device(DeviceId),
    Deferred(TimerId, Deferred),
}

impl fmt::Debug for Due {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Due::Device(id) => f.debug_tuple("Device").field(id).finish(),
            Due::Deferred(id, _) => f.debug_tuple("Deferred").field(id).finish(),
        }
    }
}

/// Owner of simulated time and of every pending wake-up.
#[derive(Default)]
pub struct CycleScheduler {
    cycle: u64,
    queue: BTreeSet<(u64, WakeTarget)>,
    device_wake: HashMap<DeviceId, u64>,
    timers: HashMap<TimerId, Deferred>,
    next_timer: u64,
}

impl fmt::Debug for CycleScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleScheduler")
            .field("cycle", &self.cycle)
            .field("queue", &self.queue)
            .finish()
    }
}

impl CycleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn advance(&mut self, cycles: u64) {
        self.cycle += cycles;
    }

    /// Moves time forward to `cycle`. Time never goes back.
    pub fn advance_to(&mut self, cycle: u64) {
        self.cycle = self.cycle.max(cycle);
    }

    /// Sets the wake point of a device, replacing the previous one.
    pub fn schedule_device(&mut self, id: DeviceId, at: u64) {
        if let Some(old) = self.device_wake.insert(id, at) {
            self.queue.remove(&(old, WakeTarget::Device(id)));
        }
        self.queue.insert((at, WakeTarget::Device(id)));
    }

    pub fn cancel_device(&mut self, id: DeviceId) {
        if let Some(old) = self.device_wake.remove(&id) {
            self.queue.remove(&(old, WakeTarget::Device(id)));
        }
    }

    pub fn device_wake(&self, id: DeviceId) -> Option<u64> {
        self.device_wake.get(&id).copied()
    }

    /// Runs `callback` once, `delay` cycles from now.
    pub fn defer(&mut self, delay: u64, callback: Deferred) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        self.queue.insert((self.cycle + delay, WakeTarget::Timer(id)));
        self.timers.insert(id, callback);
        id
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.timers.remove(&id).is_none() {
            return false;
        }
        self.queue.retain(|(_, t)| *t != WakeTarget::Timer(id));
        true
    }

    pub fn next_due(&self) -> Option<u64> {
        self.queue.first().map(|(when, _)| *when)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Removes and returns everything due at or before the current cycle.
    pub fn take_due(&mut self) -> Vec<Due> {
        let mut due = Vec::new();
        while let Some(&(when, target)) = self.queue.first() {
            if when > self.cycle {
                break;
            }
            self.queue.remove(&(when, target));
            match target {
                WakeTarget::Device(id) => {
                    self.device_wake.remove(&id);
                    due.push(Due::Device(id));
                }
                WakeTarget::Timer(id) => {
                    if let Some(cb) = self.timers.remove(&id) {
                        due.push(Due::Deferred(id, cb));
                    }
                }
            }
        }
        due
    }

    /// Forgets every device wake-up. Deferred callbacks are kept.
    pub fn clear_devices(&mut self) {
        self.queue.retain(|(_, t)| matches!(t, WakeTarget::Timer(_)));
        self.device_wake.clear();
    }
}

/// Ties simulated cycles to the wall clock at a fixed frequency.
#[derive(Debug, Clone)]
pub struct Pacer {
    hz: u64,
    origin_cycle: u64,
    origin: Instant,
    next_check: u64,
    interval: u64,
}

impl Pacer {
    /// Starts pacing at `cycle`. The wall clock is compared roughly once per
    /// simulated millisecond.
    pub fn new(hz: u64, cycle: u64) -> Self {
        let hz = hz.max(1);
        let interval = (hz / 1000).max(1);
        Self {
            hz,
            origin_cycle: cycle,
            origin: Instant::now(),
            next_check: cycle.saturating_add(interval),
            interval,
        }
    }

    /// Wall time the cycles since the origin take on real hardware.
    pub fn wall_time(&self, cycle: u64) -> Duration {
        let cycles = cycle.saturating_sub(self.origin_cycle) as u128;
        let nanos = cycles * 1_000_000_000 / self.hz as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// How far the simulation at `cycle` runs ahead of the wall clock.
    /// `None` between check points or when it is not ahead.
    pub fn lead(&mut self, cycle: u64) -> Option<Duration> {
        if cycle < self.next_check {
            return None;
        }
        self.next_check = cycle.saturating_add(self.interval);
        self.wall_time(cycle)
            .checked_sub(self.origin.elapsed())
            .filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Deferred {
        Box::new(|_: &mut Machine| -> SimResult<()> { Ok(()) })
    }

    fn ids(due: &[Due]) -> Vec<String> {
        due.iter().map(|d| format!("{:?}", d)).collect()
    }

    #[test]
    fn test_due_order() {
        let mut s = CycleScheduler::new();
        s.schedule_device(DeviceId(2), 10);
        let t = s.defer(10, noop());
        s.schedule_device(DeviceId(1), 10);
        s.schedule_device(DeviceId(3), 4);

        assert_eq!(s.next_due(), Some(4));
        assert!(s.take_due().is_empty());

        s.advance(12);
        let due = s.take_due();
        assert_eq!(
            ids(&due),
            vec![
                "Device(DeviceId(3))".to_string(),
                "Device(DeviceId(1))".to_string(),
                "Device(DeviceId(2))".to_string(),
                format!("Deferred({:?})", t),
            ]
        );
        assert!(s.is_idle());
    }

    #[test]
    fn test_reschedule_replaces() {
        let mut s = CycleScheduler::new();
        s.schedule_device(DeviceId(1), 50);
        s.schedule_device(DeviceId(1), 20);
        assert_eq!(s.device_wake(DeviceId(1)), Some(20));
        s.advance_to(60);
        assert_eq!(s.take_due().len(), 1);

        s.schedule_device(DeviceId(1), 70);
        s.cancel_device(DeviceId(1));
        assert_eq!(s.next_due(), None);
    }

    #[test]
    fn test_cancel_timer() {
        let mut s = CycleScheduler::new();
        let a = s.defer(5, noop());
        let b = s.defer(6, noop());
        assert!(s.cancel(a));
        assert!(!s.cancel(a));
        s.advance(10);
        let due = s.take_due();
        assert_eq!(ids(&due), vec![format!("Deferred({:?})", b)]);
    }

    #[test]
    fn test_time_is_monotonic() {
        let mut s = CycleScheduler::new();
        s.advance(100);
        s.advance_to(40);
        assert_eq!(s.cycle(), 100);
    }

    #[test]
    fn test_clear_devices_keeps_timers() {
        let mut s = CycleScheduler::new();
        s.schedule_device(DeviceId(1), 3);
        s.defer(8, noop());
        s.clear_devices();
        assert_eq!(s.next_due(), Some(8));
        assert_eq!(s.device_wake(DeviceId(1)), None);
    }

    #[test]
    fn test_pacer_wall_time() {
        let p = Pacer::new(16_000_000, 1_000);
        assert_eq!(p.wall_time(1_000), Duration::ZERO);
        assert_eq!(p.wall_time(17_000), Duration::from_millis(1));
        assert_eq!(p.wall_time(500), Duration::ZERO);
    }

    #[test]
    fn test_pacer_checks_once_per_interval() {
        let mut p = Pacer::new(1, 0);
        assert_eq!(p.lead(0), None);
        // One cycle at 1 Hz is a full second ahead of a fresh clock.
        assert!(p.lead(1).is_some_and(|d| d > Duration::from_millis(500)));
        assert_eq!(p.lead(1), None);
        let mut fast = Pacer::new(1_000_000, 0);
        assert_eq!(fast.lead(999), None);
    }
}
