//! Tick task table.
//!
//! The controller advances the table once per tick and runs the tasks it
//! returns. Exclusive tasks share the slice rotation, so at most one of them
//! runs per tick; the others run whenever their period says so.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TickTask {
    ZombieCheck,
    LinkMaintenance,
    DeviceDiscovery,
    RouteCalculation,
    FetchZdp,
    Bind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TaskEntry {
    task: TickTask,
    period: u64,
    phase: u64,
    exclusive: bool,
    last_run: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TickScheduler {
    tick: u64,
    entries: Vec<TaskEntry>,
}

/// Length of the slice rotation.
pub const SLICE_PERIOD: u64 = 6;

impl Default for TickScheduler {
    fn default() -> Self {
        Self::standard()
    }
}

impl TickScheduler {
    pub fn empty() -> Self {
        Self {
            tick: 0,
            entries: Vec::new(),
        }
    }

    /// Zombie check, link maintenance, device discovery and route calculation
    /// on slices 0..=3 of a 6 tick rotation; ZDP fetch and bind every tick.
    pub fn standard() -> Self {
        let mut s = Self::empty();
        s.add(TickTask::ZombieCheck, SLICE_PERIOD, 0, true);
        s.add(TickTask::LinkMaintenance, SLICE_PERIOD, 1, true);
        s.add(TickTask::DeviceDiscovery, SLICE_PERIOD, 2, true);
        s.add(TickTask::RouteCalculation, SLICE_PERIOD, 3, true);
        s.add(TickTask::FetchZdp, 1, 0, false);
        s.add(TickTask::Bind, 1, 0, false);
        s
    }

    pub fn add(&mut self, task: TickTask, period: u64, phase: u64, exclusive: bool) {
        let period = period.max(1);
        self.entries.push(TaskEntry {
            task,
            period,
            phase: phase % period,
            exclusive,
            last_run: None,
        });
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn last_run(&self, task: TickTask) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.task == task)
            .and_then(|e| e.last_run)
    }

    /// Tasks due on the current tick, in table order; then move to the next tick.
    pub fn advance(&mut self) -> Vec<TickTask> {
        let tick = self.tick;
        let mut due = Vec::new();
        let mut exclusive_taken = false;
        for e in self.entries.iter_mut() {
            if tick % e.period != e.phase {
                continue;
            }
            if e.exclusive {
                if exclusive_taken {
                    continue;
                }
                exclusive_taken = true;
            }
            e.last_run = Some(tick);
            due.push(e.task);
        }
        self.tick += 1;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_rotate() {
        let mut s = TickScheduler::standard();
        let rounds: Vec<Vec<TickTask>> = (0..6).map(|_| s.advance()).collect();
        assert_eq!(
            rounds[0],
            vec![TickTask::ZombieCheck, TickTask::FetchZdp, TickTask::Bind]
        );
        assert_eq!(rounds[3][0], TickTask::RouteCalculation);
        assert_eq!(rounds[4], vec![TickTask::FetchZdp, TickTask::Bind]);
        assert_eq!(rounds[5], vec![TickTask::FetchZdp, TickTask::Bind]);
        assert_eq!(s.last_run(TickTask::DeviceDiscovery), Some(2));
    }

    #[test]
    fn one_exclusive_per_tick() {
        let mut s = TickScheduler::empty();
        s.add(TickTask::ZombieCheck, 2, 0, true);
        s.add(TickTask::RouteCalculation, 2, 0, true);
        assert_eq!(s.advance(), vec![TickTask::ZombieCheck]);
    }
}
