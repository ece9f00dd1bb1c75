use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::MowJob;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule {0} does not exist")]
    NotFound(u32),
    #[error("window ends at {end} before it starts at {start}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ScheduledTask {
    StartMowing {
        #[serde(default)]
        job: Option<MowJob>,
    },
    Dock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(flatten)]
    pub task: ScheduledTask,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleChange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub task: Option<ScheduledTask>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DueAction {
    pub entry: u32,
    pub at: DateTime<Utc>,
    pub task: ScheduledTask,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    entries: BTreeMap<u32, ScheduleEntry>,
    next_id: u32,
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), ScheduleError> {
    if end <= start {
        return Err(ScheduleError::InvalidWindow { start, end });
    }
    Ok(())
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        task: ScheduledTask,
    ) -> Result<u32, ScheduleError> {
        check_window(start, end)?;
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            ScheduleEntry {
                id,
                start,
                end,
                task,
            },
        );
        Ok(id)
    }

    pub fn remove(&mut self, id: u32) -> Result<ScheduleEntry, ScheduleError> {
        self.entries.remove(&id).ok_or(ScheduleError::NotFound(id))
    }

    pub fn modify(&mut self, id: u32, change: ScheduleChange) -> Result<&ScheduleEntry, ScheduleError> {
        let entry = self.entries.get(&id).ok_or(ScheduleError::NotFound(id))?;
        let start = change.start.unwrap_or(entry.start);
        let end = change.end.unwrap_or(entry.end);
        check_window(start, end)?;

        let entry = self.entries.get_mut(&id).ok_or(ScheduleError::NotFound(id))?;
        entry.start = start;
        entry.end = end;
        if let Some(task) = change.task {
            entry.task = task;
        }
        Ok(entry)
    }

    pub fn list(&self) -> Vec<&ScheduleEntry> {
        self.entries.values().collect()
    }

    /// Actions whose start or end fell in `(since, now]`, oldest first.
    /// The end of every window docks the mower.
    pub fn due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<DueAction> {
        let in_range = |at: DateTime<Utc>| at > since && at <= now;
        let mut due = Vec::new();
        for entry in self.entries.values() {
            if in_range(entry.start) {
                due.push(DueAction {
                    entry: entry.id,
                    at: entry.start,
                    task: entry.task.clone(),
                });
            }
            if in_range(entry.end) {
                due.push(DueAction {
                    entry: entry.id,
                    at: entry.end,
                    task: ScheduledTask::Dock,
                });
            }
        }
        due.sort_by_key(|action| action.at);
        due
    }

    pub fn next_due(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .flat_map(|e| [e.start, e.end])
            .filter(|at| *at > after)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, hour, 0, 0)
            .single()
            .expect("valid date")
    }

    #[test]
    fn window_start_mows_and_end_docks() {
        let mut schedule = Schedule::new();
        let id = schedule
            .add(at(9), at(11), ScheduledTask::StartMowing { job: None })
            .expect("add");

        let morning = schedule.due(at(8), at(10));
        let noon = schedule.due(at(10), at(12));

        assert_eq!(morning.len(), 1);
        assert_eq!(morning[0].task, ScheduledTask::StartMowing { job: None });
        assert_eq!(noon, vec![DueAction { entry: id, at: at(11), task: ScheduledTask::Dock }]);
    }

    #[test]
    fn due_range_excludes_since_and_includes_now() {
        let mut schedule = Schedule::new();
        schedule.add(at(9), at(10), ScheduledTask::Dock).expect("add");

        assert!(schedule.due(at(9), at(9)).is_empty());
        assert_eq!(schedule.due(at(8), at(9)).len(), 1);
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut schedule = Schedule::new();

        let err = schedule.add(at(12), at(9), ScheduledTask::Dock).unwrap_err();

        assert!(matches!(err, ScheduleError::InvalidWindow { .. }));
        assert!(schedule.list().is_empty());
    }

    #[test]
    fn modify_and_remove_by_id() {
        let mut schedule = Schedule::new();
        let first = schedule.add(at(6), at(7), ScheduledTask::Dock).expect("add");
        let second = schedule.add(at(8), at(9), ScheduledTask::Dock).expect("add");

        schedule
            .modify(
                second,
                ScheduleChange {
                    end: Some(at(10)),
                    ..ScheduleChange::default()
                },
            )
            .expect("modify");
        schedule.remove(first).expect("remove");

        assert_eq!(schedule.list().len(), 1);
        assert_eq!(schedule.list()[0].end, at(10));
        assert_eq!(schedule.remove(first), Err(ScheduleError::NotFound(first)));
        assert_eq!(schedule.next_due(at(8)), Some(at(10)));
    }
}
