//! Time-triggered job scheduler. Jobs carry an optional repeat interval
//! and end time, and "fast forward" their next scheduled instant across
//! any missed slots rather than replaying each one.

use chrono::{DateTime, NaiveTime, Utc};
use log::warn;

use crate::dispatcher::Command;

/// A scheduled job.
#[derive(Debug, Clone)]
pub struct Job {
    jid: u64,
    at_time: DateTime<Utc>,
    interval: Option<chrono::Duration>,
    end_time: Option<DateTime<Utc>>,
    payload: Command,
    has_run: bool,
    suspended: bool,
}

impl Job {
    pub fn jid(&self) -> u64 {
        self.jid
    }

    pub fn at_time(&self) -> DateTime<Utc> {
        self.at_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn interval(&self) -> Option<chrono::Duration> {
        self.interval
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }

    /// Runnable iff `now >= at_time && !suspended && !has_run && (end_time
    /// is unset || now < end_time)`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        if self.has_run || self.suspended {
            return false;
        }
        if now < self.at_time {
            return false;
        }
        match self.end_time {
            Some(end) => now < end,
            None => true,
        }
    }

    /// Run the job: returns its payload if it was runnable, and advances
    /// `at_time`/`has_run`.
    fn run(&mut self, now: DateTime<Utc>) -> Option<Command> {
        if !self.is_runnable(now) {
            return None;
        }
        let payload = self.payload.clone();
        match self.interval {
            None => self.has_run = true,
            Some(interval) => {
                let elapsed = (now - self.at_time).num_milliseconds();
                let interval_ms = interval.num_milliseconds().max(1);
                let k = elapsed / interval_ms + 1;
                self.at_time += chrono::Duration::milliseconds(interval_ms * k);
                if let Some(end) = self.end_time {
                    if self.at_time >= end {
                        self.has_run = true;
                    }
                }
            }
        }
        Some(payload)
    }
}

/// A daily quiet period during which no job is dispatched.
/// `start > end` means the window crosses midnight.
#[derive(Debug, Clone, Copy)]
pub struct QuietPeriod {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietPeriod {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let t = now.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Crosses midnight: shift `end` by a day when comparing, i.e.
            // "in the window" means "at or after start" OR "before end".
            t >= self.start || t < self.end
        }
    }
}

/// Holds the scheduler's append-only job list. Not
/// thread-safe by itself — the dispatcher owns one `Scheduler` and only
/// ever touches it from its own thread.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
    quiet: Option<QuietPeriod>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            jobs: Vec::new(),
            quiet: None,
        }
    }

    pub fn set_quiet_period(&mut self, quiet: Option<QuietPeriod>) {
        self.quiet = quiet;
    }

    /// Add a job. Validates that `at_time < end_time` when both an interval
    /// and an end time are given; invalid specs log a warning and are
    /// dropped rather than raised.
    pub fn add(
        &mut self,
        at_time: DateTime<Utc>,
        payload: Command,
        interval: Option<chrono::Duration>,
        end_time: Option<DateTime<Utc>>,
    ) -> Option<u64> {
        if let (Some(_), Some(end)) = (interval, end_time) {
            if at_time >= end {
                warn!("rejecting scheduled job: at_time {at_time} is not before end_time {end}");
                return None;
            }
        }

        let jid = self.jobs.len() as u64;
        let now = Utc::now();
        let mut has_run = false;
        if at_time < now {
            warn!("scheduled job {jid} is in the past, marking as already run");
            has_run = true;
        }
        if let Some(end) = end_time {
            if at_time >= end {
                has_run = true;
            }
        }

        self.jobs.push(Job {
            jid,
            at_time,
            interval,
            end_time,
            payload,
            has_run,
            suspended: false,
        });
        Some(jid)
    }

    /// All runnable jobs, in insertion order, advancing each one's internal
    /// state. Returns nothing during the quiet period; new jobs may still
    /// be added during quiet hours, they simply don't fire.
    pub fn drain_runnable(&mut self) -> Vec<Command> {
        let now = Utc::now();
        if let Some(quiet) = self.quiet {
            if quiet.contains(now) {
                return Vec::new();
            }
        }
        self.jobs
            .iter_mut()
            .filter_map(|job| job.run(now))
            .collect()
    }

    pub fn get_job(&self, jid: u64) -> Option<&Job> {
        self.jobs.iter().find(|j| j.jid == jid)
    }

    pub fn suspend(&mut self, jid: u64) -> bool {
        self.set_suspended(jid, true)
    }

    pub fn unsuspend(&mut self, jid: u64) -> bool {
        self.set_suspended(jid, false)
    }

    fn set_suspended(&mut self, jid: u64, suspended: bool) -> bool {
        match self.jobs.iter_mut().find(|j| j.jid == jid) {
            Some(job) => {
                job.suspended = suspended;
                true
            }
            None => false,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Command;
    use chrono::Duration;

    fn noop_command() -> Command {
        Command {
            name: "ping".into(),
            component: None,
            kwargs: Default::default(),
        }
    }

    #[test]
    fn past_job_is_marked_has_run_immediately() {
        let mut s = Scheduler::new();
        let jid = s
            .add(Utc::now() - Duration::seconds(5), noop_command(), None, None)
            .unwrap();
        assert!(s.get_job(jid).unwrap().has_run());
        assert!(s.drain_runnable().is_empty());
    }

    #[test]
    fn future_one_shot_job_runs_once() {
        let mut s = Scheduler::new();
        s.add(Utc::now() - Duration::milliseconds(1), noop_command(), None, None);
        let jid = s
            .add(Utc::now() - Duration::milliseconds(1), noop_command(), None, None)
            .unwrap();
        // Both of these are "past" by construction; runnable immediately.
        assert_eq!(s.drain_runnable().len(), 2);
        assert!(s.get_job(jid).unwrap().has_run());
        assert!(s.drain_runnable().is_empty());
    }

    #[test]
    fn interval_job_fast_forwards_across_missed_slots() {
        let mut s = Scheduler::new();
        // at_time is far enough in the past that several 1s slots were
        // missed; the job should jump straight to the next future slot
        // rather than running once per missed slot.
        let at = Utc::now() - Duration::milliseconds(3500);
        let jid = s
            .add(at, noop_command(), Some(Duration::seconds(1)), None)
            .unwrap();
        let ran = s.drain_runnable();
        assert_eq!(ran.len(), 1, "must fast-forward, not replay every missed instant");
        let job = s.get_job(jid).unwrap();
        assert!(job.at_time() > Utc::now());
    }

    #[test]
    fn interval_job_stops_after_end_time() {
        let mut s = Scheduler::new();
        let at = Utc::now() - Duration::milliseconds(10);
        let jid = s
            .add(
                at,
                noop_command(),
                Some(Duration::milliseconds(5)),
                Some(Utc::now() + Duration::milliseconds(5)),
            )
            .unwrap();
        s.drain_runnable();
        // After fast-forwarding, the new at_time may already be beyond
        // end_time, in which case has_run flips true.
        let job = s.get_job(jid).unwrap();
        if job.at_time() >= job.end_time().unwrap() {
            assert!(job.has_run());
        }
    }

    #[test]
    fn invalid_spec_is_rejected_not_raised() {
        let mut s = Scheduler::new();
        let at = Utc::now() + Duration::seconds(10);
        let end = Utc::now() + Duration::seconds(5);
        let jid = s.add(at, noop_command(), Some(Duration::seconds(1)), Some(end));
        assert!(jid.is_none());
    }

    #[test]
    fn suspended_job_does_not_run() {
        let mut s = Scheduler::new();
        let jid = s
            .add(Utc::now() - Duration::milliseconds(1), noop_command(), None, None)
            .unwrap();
        s.suspend(jid);
        assert!(s.drain_runnable().is_empty());
        s.unsuspend(jid);
        assert_eq!(s.drain_runnable().len(), 1);
    }

    #[test]
    fn quiet_period_suppresses_dispatch_same_day() {
        let mut s = Scheduler::new();
        let now = Utc::now();
        s.add(now - Duration::milliseconds(1), noop_command(), None, None);
        let t = now.time();
        s.set_quiet_period(Some(QuietPeriod {
            start: t - chrono::Duration::minutes(1),
            end: t + chrono::Duration::minutes(1),
        }));
        assert!(s.drain_runnable().is_empty());
    }

    #[test]
    fn quiet_period_crossing_midnight() {
        let quiet = QuietPeriod {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        };
        let during = Utc::now()
            .with_time(NaiveTime::from_hms_opt(23, 30, 0).unwrap())
            .unwrap();
        let outside = Utc::now()
            .with_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap())
            .unwrap();
        assert!(quiet.contains(during));
        assert!(!quiet.contains(outside));
    }
}
