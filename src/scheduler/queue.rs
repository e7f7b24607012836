//! Dispatch ordering for due schedules.
//!
//! Higher priority first, then earlier due time. Overdue schedules age into
//! higher effective priority so that a steady stream of urgent work cannot
//! starve low-priority schedules forever.

use chrono::{DateTime, Utc};

use super::Schedule;

/// A due schedule with its priority after aging.
#[derive(Debug)]
pub struct QueuedSchedule {
    pub schedule: Schedule,
    pub effective_priority: i64,
}

/// Priority plus one level per `aging_minutes_per_level` minutes overdue.
/// Aging is disabled when the step is zero or negative.
pub fn effective_priority(schedule: &Schedule, now: DateTime<Utc>, aging_minutes_per_level: i64) -> i64 {
    if aging_minutes_per_level <= 0 {
        return schedule.priority;
    }
    let overdue = (now - schedule.run_at_utc).num_minutes().max(0);
    schedule.priority.saturating_add(overdue / aging_minutes_per_level)
}

/// Order due schedules for claiming.
pub fn order(schedules: Vec<Schedule>, now: DateTime<Utc>, aging_minutes_per_level: i64) -> Vec<QueuedSchedule> {
    let mut queued: Vec<QueuedSchedule> = schedules
        .into_iter()
        .map(|schedule| QueuedSchedule {
            effective_priority: effective_priority(&schedule, now, aging_minutes_per_level),
            schedule,
        })
        .collect();

    queued.sort_by(|a, b| {
        b.effective_priority
            .cmp(&a.effective_priority)
            .then(a.schedule.run_at_utc.cmp(&b.schedule.run_at_utc))
            .then(a.schedule.created_at.cmp(&b.schedule.created_at))
    });
    queued
}
