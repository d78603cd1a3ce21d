//! PID 1 duties: reaping every descendant and deriving the exit status.
//!
//! A reaper thread calls `wait4(-1)` until the namespace has no children
//! left, a signal thread forwards `SIGINT`/`SIGTERM`, and a timer fires
//! once the grace window after the tracked child's death has elapsed. All
//! three feed one channel; [`Supervisor`] turns the resulting events into
//! the final exit code.

use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};

/// How long orphans may outlive the tracked child.
pub const RESIDUAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code when the tracked child's fate is unknown.
const UNKNOWN: i32 = 255;
/// Exit code when every child was reaped but the tracked one was never
/// seen.
const NOT_REAPED: i32 = 2;
/// Exit code when waiting failed for an unexpected reason.
const WAIT_FAILED: i32 = 127;

/// Something the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A termination signal was delivered to init.
    Signal(i32),
    /// A child was reaped.
    Reaped(WaitStatus),
    /// No children remain.
    Drained,
    /// `wait4` failed with something other than `ECHILD`.
    WaitFailed(Errno),
    /// The grace window elapsed.
    Timeout,
}

/// What the caller should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Step {
    /// Keep waiting.
    Continue,
    /// Start the grace timer, then keep waiting.
    ArmTimer(Duration),
    /// Exit with this code.
    Exit(i32),
}

/// Maps a wait status to the exit code init reports.
pub fn classify(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => UNKNOWN,
    }
}

/// Exit status bookkeeping for the tracked child.
#[derive(Debug)]
pub struct Supervisor {
    /// The originally started target.
    tracked: Pid,
    /// Its classified status once reaped.
    code: Option<i32>,
    /// Grace window for orphans.
    grace: Duration,
}

impl Supervisor {
    /// Tracks `tracked`, allowing orphans `grace` to exit after it.
    pub const fn new(tracked: Pid, grace: Duration) -> Self {
        Self {
            tracked,
            code: None,
            grace,
        }
    }

    /// Feeds one event.
    pub fn handle(&mut self, event: Event) -> Step {
        match event {
            Event::Signal(sig) => match self.code {
                None => {
                    debug!(signal = sig, "terminating before initial process exit");
                    Step::Exit(0)
                }
                Some(code) => {
                    debug!(signal = sig, "terminating after initial process exit");
                    Step::Exit(code)
                }
            },
            Event::Reaped(status) if status.pid() == Some(self.tracked) => {
                let code = classify(status);
                match status {
                    WaitStatus::Exited(_, c) => debug!(code = c, "initial process exited"),
                    WaitStatus::Signaled(_, s, _) => debug!(signal = %s, "initial process killed"),
                    other => debug!(status = ?other, "initial process stopped waiting"),
                }
                self.code = Some(code);
                Step::ArmTimer(self.grace)
            }
            Event::Reaped(status) => {
                debug!(status = ?status, "reaped orphan");
                Step::Continue
            }
            Event::Drained => Step::Exit(self.code.unwrap_or(NOT_REAPED)),
            Event::WaitFailed(errno) => {
                warn!("unexpected wait4 response: {errno}");
                Step::Exit(self.code.unwrap_or(WAIT_FAILED))
            }
            Event::Timeout => {
                info!("timeout exceeded waiting for lingering processes");
                Step::Exit(self.code.unwrap_or(NOT_REAPED))
            }
        }
    }
}

/// Reaps children until none remain, reporting each on `tx`.
fn reap(tx: &Sender<Event>) {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(status) => {
                if tx.send(Event::Reaped(status)).is_err() {
                    return;
                }
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                let _ = tx.send(Event::Drained);
                return;
            }
            Err(errno) => {
                let _ = tx.send(Event::WaitFailed(errno));
                return;
            }
        }
    }
}

/// Termination signals caught on behalf of init.
///
/// Installed before the target is spawned: PID 1 of a namespace drops
/// signals it has no handler for, so a request arriving while the target
/// starts would otherwise be lost.
pub struct Watch {
    /// `SIGINT` and `SIGTERM`.
    signals: Signals,
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").finish_non_exhaustive()
    }
}

impl Watch {
    /// Starts catching `SIGINT` and `SIGTERM`.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            signals: Signals::new([SIGINT, SIGTERM])?,
        })
    }

    /// Runs the reap loop for `tracked` and returns the exit code.
    ///
    /// Must be called after the tracked child was spawned, otherwise the
    /// reaper sees no children and drains immediately. Signals caught
    /// since [`install`](Self::install) are handled first.
    pub fn supervise(mut self, tracked: Pid, grace: Duration) -> std::io::Result<i32> {
        let mut supervisor = Supervisor::new(tracked, grace);
        for sig in self.signals.pending() {
            if let Step::Exit(code) = supervisor.handle(Event::Signal(sig)) {
                return Ok(code);
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut signals = self.signals;
        let signal_tx = tx.clone();
        thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for sig in signals.forever() {
                    if signal_tx.send(Event::Signal(sig)).is_err() {
                        return;
                    }
                }
            })?;

        let reap_tx = tx.clone();
        thread::Builder::new()
            .name("reaper".into())
            .spawn(move || reap(&reap_tx))?;

        for event in &rx {
            match supervisor.handle(event) {
                Step::Continue => {}
                Step::ArmTimer(after) => {
                    let timer_tx = tx.clone();
                    thread::Builder::new().name("grace".into()).spawn(move || {
                        thread::sleep(after);
                        let _ = timer_tx.send(Event::Timeout);
                    })?;
                }
                Step::Exit(code) => return Ok(code),
            }
        }
        Ok(supervisor.code.unwrap_or(NOT_REAPED))
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::*;

    const TRACKED: Pid = Pid::from_raw(2);
    const ORPHAN: Pid = Pid::from_raw(7);

    fn run(events: &[Event]) -> Vec<Step> {
        let mut s = Supervisor::new(TRACKED, RESIDUAL_TIMEOUT);
        events.iter().map(|e| s.handle(*e)).collect()
    }

    #[test]
    fn clean_exit_passes_through() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Exited(TRACKED, 0)),
            Event::Drained,
        ]);
        assert_eq!(steps, [Step::ArmTimer(RESIDUAL_TIMEOUT), Step::Exit(0)]);
    }

    #[test]
    fn killed_child_reports_128_plus_signal() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Signaled(TRACKED, Signal::SIGKILL, false)),
            Event::Drained,
        ]);
        assert_eq!(steps[1], Step::Exit(137));
    }

    #[test]
    fn exit_code_is_preserved() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Exited(TRACKED, 42)),
            Event::Drained,
        ]);
        assert_eq!(steps[1], Step::Exit(42));
    }

    #[test]
    fn orphan_within_grace_keeps_child_code() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Exited(TRACKED, 42)),
            Event::Reaped(WaitStatus::Exited(ORPHAN, 0)),
            Event::Drained,
        ]);
        assert_eq!(
            steps,
            [
                Step::ArmTimer(RESIDUAL_TIMEOUT),
                Step::Continue,
                Step::Exit(42)
            ]
        );
    }

    #[test]
    fn lingering_orphan_times_out_with_child_code() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Exited(TRACKED, 3)),
            Event::Timeout,
        ]);
        assert_eq!(steps[1], Step::Exit(3));
    }

    #[test]
    fn orphans_reaped_first_do_not_count() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Signaled(ORPHAN, Signal::SIGTERM, false)),
            Event::Reaped(WaitStatus::Exited(TRACKED, 1)),
        ]);
        assert_eq!(steps, [Step::Continue, Step::ArmTimer(RESIDUAL_TIMEOUT)]);
    }

    #[test]
    fn termination_signal_before_child_exit_is_clean() {
        let steps = run(&[Event::Signal(SIGTERM)]);
        assert_eq!(steps, [Step::Exit(0)]);
    }

    #[test]
    fn termination_signal_after_child_exit_keeps_code() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Exited(TRACKED, 9)),
            Event::Signal(SIGINT),
        ]);
        assert_eq!(steps[1], Step::Exit(9));
    }

    #[test]
    fn wait_failure_before_child_exit() {
        let steps = run(&[Event::WaitFailed(Errno::EINVAL)]);
        assert_eq!(steps, [Step::Exit(127)]);
    }

    #[test]
    fn drained_without_tracked_child() {
        let steps = run(&[
            Event::Reaped(WaitStatus::Exited(ORPHAN, 0)),
            Event::Drained,
        ]);
        assert_eq!(steps[1], Step::Exit(2));
    }

    #[test]
    fn signal_caught_before_supervising_is_handled() {
        let watch = Watch::install().unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        // no reaper runs: the pending signal decides the outcome first
        assert_eq!(watch.supervise(TRACKED, RESIDUAL_TIMEOUT).unwrap(), 0);
    }

    #[test]
    fn classify_stopped_is_unknown() {
        let status = WaitStatus::Stopped(TRACKED, Signal::SIGSTOP);
        assert_eq!(classify(status), 255);
    }
}
