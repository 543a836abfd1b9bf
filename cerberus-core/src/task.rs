//! Cooperative tasks.
//!
//! Long operations (PIN backoff and verification, attestation) are written as
//! explicit step machines. Each call to [`Task::step`] does a bounded amount
//! of work and returns a [`Step`] naming the next yield point. The
//! single-threaded [`Scheduler`] drives a task to completion, forwarding
//! progress to a [`ProgressObserver`] and sleeping on the device [`Clock`].
//!
//! Cancellation is only honoured while the task reports itself
//! [`Task::cancellable`]; signing and commits never are.

use crate::error::{CoreError, CoreResult};
use crate::platform::Clock;

/// Progress in permille plus an optional status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 0..=1000.
    pub permille: u16,
    /// Status line shown next to the progress bar.
    pub message: Option<&'static str>,
}

impl Progress {
    /// Progress without a status line.
    #[must_use]
    pub const fn new(permille: u16) -> Self {
        Self {
            permille: if permille > 1000 { 1000 } else { permille },
            message: None,
        }
    }

    /// Progress with a status line.
    #[must_use]
    pub const fn with_message(permille: u16, message: &'static str) -> Self {
        Self {
            permille: if permille > 1000 { 1000 } else { permille },
            message: Some(message),
        }
    }

    /// `done / total` in permille, saturating at 1000.
    #[must_use]
    pub fn ratio(done: u64, total: u64) -> Self {
        if total == 0 {
            return Self::new(1000);
        }
        let permille = done.saturating_mul(1000) / total;
        Self::new(u16::try_from(permille).unwrap_or(1000))
    }
}

/// What a task wants after one step.
#[derive(Debug, PartialEq, Eq)]
pub enum Step<T> {
    /// Report progress and continue immediately.
    Yield(Progress),
    /// Report progress, then sleep for `ms`.
    Sleep {
        /// Time to wait before the next step.
        ms: u64,
        /// Progress to report before sleeping.
        progress: Progress,
    },
    /// The task finished.
    Done(T),
}

/// Observer verdict on a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep going.
    Continue,
    /// The user asked to abort.
    Abort,
}

/// Receives progress from running tasks.
pub trait ProgressObserver {
    /// Called at every yield point.
    fn report(&mut self, progress: Progress) -> Control;
}

/// Observer that records every report. Useful for tests and logging.
#[derive(Debug, Default)]
pub struct ProgressLog {
    /// Reports in order.
    pub reports: Vec<Progress>,
    /// Abort when this many reports have been received.
    pub abort_after: Option<usize>,
}

impl ProgressObserver for ProgressLog {
    fn report(&mut self, progress: Progress) -> Control {
        self.reports.push(progress);
        match self.abort_after {
            Some(limit) if self.reports.len() >= limit => Control::Abort,
            _ => Control::Continue,
        }
    }
}

/// Step machine driven by a [`Scheduler`].
pub trait Task {
    /// Final result.
    type Output;

    /// Runs until the next yield point.
    ///
    /// # Errors
    ///
    /// Any error ends the task.
    fn step(&mut self) -> CoreResult<Step<Self::Output>>;

    /// Whether an observer abort should end the task now.
    fn cancellable(&self) -> bool {
        false
    }
}

/// Single-threaded cooperative scheduler.
pub struct Scheduler<'c, 'o> {
    clock: &'c dyn Clock,
    observer: Option<&'o mut dyn ProgressObserver>,
}

impl<'c, 'o> Scheduler<'c, 'o> {
    /// Creates a scheduler without an observer.
    #[must_use]
    pub fn new(clock: &'c dyn Clock) -> Self {
        Self {
            clock,
            observer: None,
        }
    }

    /// Attaches an observer that receives progress and may abort.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<&'o mut dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Current time on the scheduler's clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Drives `task` to completion.
    ///
    /// # Errors
    ///
    /// Returns the task's error, or [`CoreError::ActionCancelled`] if the
    /// observer aborts while the task is cancellable.
    pub fn run<T: Task>(&mut self, mut task: T) -> CoreResult<T::Output> {
        loop {
            match task.step()? {
                Step::Done(output) => return Ok(output),
                Step::Yield(progress) => self.report(&task, progress)?,
                Step::Sleep { ms, progress } => {
                    self.report(&task, progress)?;
                    self.clock.sleep_ms(ms);
                }
            }
        }
    }

    fn report<T: Task>(&mut self, task: &T, progress: Progress) -> CoreResult<()> {
        let Some(observer) = self.observer.as_deref_mut() else {
            return Ok(());
        };
        if observer.report(progress) == Control::Abort {
            if task.cancellable() {
                log::info!("task cancelled by user");
                return Err(CoreError::ActionCancelled);
            }
            log::debug!("ignoring abort request at a non-cancellable step");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::MockClock;

    /// Counts to `limit`, sleeping `ms` between steps.
    struct Countdown {
        done: u64,
        limit: u64,
        ms: u64,
        cancellable: bool,
    }

    impl Task for Countdown {
        type Output = u64;

        fn step(&mut self) -> CoreResult<Step<u64>> {
            if self.done == self.limit {
                return Ok(Step::Done(self.done));
            }
            self.done += 1;
            Ok(Step::Sleep {
                ms: self.ms,
                progress: Progress::ratio(self.done, self.limit),
            })
        }

        fn cancellable(&self) -> bool {
            self.cancellable
        }
    }

    #[test]
    fn test_runs_to_completion_and_sleeps() {
        let clock = MockClock::new(0);
        let mut log = ProgressLog::default();
        let mut scheduler = Scheduler::new(&clock).with_observer(Some(&mut log));
        let out = scheduler
            .run(Countdown {
                done: 0,
                limit: 4,
                ms: 100,
                cancellable: false,
            })
            .expect("run");
        assert_eq!(out, 4);
        assert_eq!(clock.slept_ms(), 400);
        let permille: Vec<u16> = log.reports.iter().map(|p| p.permille).collect();
        assert_eq!(permille, vec![250, 500, 750, 1000]);
    }

    #[test]
    fn test_abort_cancels_cancellable_task() {
        let clock = MockClock::new(0);
        let mut log = ProgressLog {
            abort_after: Some(2),
            ..ProgressLog::default()
        };
        let mut scheduler = Scheduler::new(&clock).with_observer(Some(&mut log));
        let result = scheduler.run(Countdown {
            done: 0,
            limit: 10,
            ms: 10,
            cancellable: true,
        });
        assert!(matches!(result, Err(CoreError::ActionCancelled)));
        assert_eq!(clock.slept_ms(), 10);
    }

    #[test]
    fn test_abort_is_ignored_when_not_cancellable() {
        let clock = MockClock::new(0);
        let mut log = ProgressLog {
            abort_after: Some(1),
            ..ProgressLog::default()
        };
        let mut scheduler = Scheduler::new(&clock).with_observer(Some(&mut log));
        let result = scheduler.run(Countdown {
            done: 0,
            limit: 3,
            ms: 1,
            cancellable: false,
        });
        assert_eq!(result.expect("run"), 3);
    }

    #[test]
    fn test_progress_ratio_saturates() {
        assert_eq!(Progress::ratio(5, 0).permille, 1000);
        assert_eq!(Progress::ratio(3, 2).permille, 1000);
        assert_eq!(Progress::ratio(1, 3).permille, 333);
    }
}
