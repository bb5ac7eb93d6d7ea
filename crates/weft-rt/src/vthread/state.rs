// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Virtual thread states and the transition table.
//!
//! `State::on` is a pure function so the table can be tested without a
//! scheduler. The core only moves a thread between states with
//! compare-and-set against this table, and carries out the [`Action`] of
//! each step it wins.
//!
//! ```text
//!  NEW -> STARTED                        // start
//!  STARTED -> TERMINATED                 // failed to start
//!  STARTED -> RUNNING                    // first run
//!  RUNNING -> TERMINATED                 // done
//!
//!  RUNNING -> PARKING                    // park
//!  PARKING -> PARKED                     // yielded
//!  PARKING -> RUNNING                    // yield failed, then PINNED
//!  PARKED -> UNPARKED                    // unparked, may be scheduled
//!  UNPARKED -> RUNNING                   // continue execution
//!  RUNNING -> PINNED -> RUNNING          // parked on the carrier
//!
//!  RUNNING -> TIMED_PARKING              // park with timeout
//!  TIMED_PARKING -> TIMED_PARKED         // yielded, timer armed
//!  TIMED_PARKED -> UNPARKED              // unparked or timed out
//!  RUNNING -> TIMED_PINNED -> RUNNING    // timed park on the carrier
//!
//!  RUNNING -> BLOCKING                   // monitor contended
//!  BLOCKING -> BLOCKED                   // yielded
//!  BLOCKED -> UNBLOCKED                  // unblocked, may be scheduled
//!  UNBLOCKED -> RUNNING                  // continue execution
//!
//!  RUNNING -> WAITING                    // monitor wait
//!  WAITING -> WAIT                       // yielded
//!  WAIT -> BLOCKED                       // notified, re-contends
//!  WAIT -> UNBLOCKED                     // interrupted
//!  RUNNING -> TIMED_WAITING              // timed monitor wait
//!  TIMED_WAITING -> TIMED_WAIT           // yielded, timer armed
//!  TIMED_WAIT -> BLOCKED                 // notified
//!  TIMED_WAIT -> UNBLOCKED               // timed out or interrupted
//!
//!  RUNNING -> YIELDING                   // yield_now
//!  YIELDING -> YIELDED                   // yielded
//!  YIELDED -> RUNNING                    // continue execution
//!  YIELDING -> RUNNING                   // yield failed
//! ```

use std::fmt;

/// Fine-grained scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum State {
    New = 0,
    Started = 1,
    Running = 2,
    Parking = 3,
    Parked = 4,
    Pinned = 5,
    TimedParking = 6,
    TimedParked = 7,
    TimedPinned = 8,
    Unparked = 9,
    Yielding = 10,
    Yielded = 11,
    Blocking = 12,
    Blocked = 13,
    Unblocked = 14,
    Waiting = 15,
    Wait = 16,
    TimedWaiting = 17,
    TimedWait = 18,
    Terminated = 99,
}

/// What happened to the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    /// A carrier picked up the resumption task.
    Resume,
    Park,
    TimedPark,
    /// Yield failed; block the carrier instead.
    Pin,
    TimedPin,
    /// Woken on the carrier, or yield failed in a transitional state.
    Unpin,
    /// The continuation has suspended; carrier-side bookkeeping.
    Settle,
    Unpark,
    Timeout,
    Yield,
    MonitorContended,
    Unblock,
    Wait,
    TimedWait,
    Notify,
    Interrupt,
    Terminate,
}

/// Follow-up owed by whoever made a transition. `ArmTimer` is done on
/// the carrier before the settled state is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Submit a resumption task.
    Submit,
    /// Schedule the timeout callback.
    ArmTimer,
    /// Block the carrier thread.
    BlockCarrier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub to: State,
    pub action: Action,
}

const fn step(to: State, action: Action) -> Option<Step> {
    Some(Step { to, action })
}

impl State {
    pub fn from_u8(raw: u8) -> Option<State> {
        use State::*;
        Some(match raw {
            0 => New,
            1 => Started,
            2 => Running,
            3 => Parking,
            4 => Parked,
            5 => Pinned,
            6 => TimedParking,
            7 => TimedParked,
            8 => TimedPinned,
            9 => Unparked,
            10 => Yielding,
            11 => Yielded,
            12 => Blocking,
            13 => Blocked,
            14 => Unblocked,
            15 => Waiting,
            16 => Wait,
            17 => TimedWaiting,
            18 => TimedWait,
            99 => Terminated,
            _ => return None,
        })
    }

    /// The transition `event` causes from this state, if it is allowed.
    pub fn on(self, event: Event) -> Option<Step> {
        use Action as A;
        use Event as E;
        use State::*;
        match (self, event) {
            (New, E::Start) => step(Started, A::Submit),

            (Started | Unparked | Unblocked | Yielded, E::Resume) => step(Running, A::None),

            (Running, E::Park) => step(Parking, A::None),
            (Running, E::TimedPark) => step(TimedParking, A::None),
            (Running, E::Pin) => step(Pinned, A::BlockCarrier),
            (Running, E::TimedPin) => step(TimedPinned, A::BlockCarrier),
            (Running, E::Yield) => step(Yielding, A::None),
            (Running, E::MonitorContended) => step(Blocking, A::None),
            (Running, E::Wait) => step(Waiting, A::None),
            (Running, E::TimedWait) => step(TimedWaiting, A::None),

            (Parking | TimedParking | Yielding | Blocking | Waiting | TimedWaiting, E::Unpin)
            | (Pinned | TimedPinned, E::Unpin) => step(Running, A::None),

            (Parking, E::Settle) => step(Parked, A::None),
            (TimedParking, E::Settle) => step(TimedParked, A::ArmTimer),
            (Yielding, E::Settle) => step(Yielded, A::Submit),
            (Blocking, E::Settle) => step(Blocked, A::None),
            (Waiting, E::Settle) => step(Wait, A::None),
            (TimedWaiting, E::Settle) => step(TimedWait, A::ArmTimer),

            (Parked | TimedParked, E::Unpark) => step(Unparked, A::Submit),
            (TimedParked, E::Timeout) => step(Unparked, A::Submit),

            (Blocked, E::Unblock) => step(Unblocked, A::Submit),

            (Wait | TimedWait, E::Notify) => step(Blocked, A::None),
            (Wait | TimedWait, E::Interrupt) => step(Unblocked, A::Submit),
            (TimedWait, E::Timeout) => step(Unblocked, A::Submit),

            (Terminated | New, E::Terminate) => None,
            (_, E::Terminate) => step(Terminated, A::None),

            _ => None,
        }
    }

    /// Unmounted but owed a carrier: a resumption task is in flight.
    pub fn is_runnable_unmounted(self) -> bool {
        matches!(self, State::Unparked | State::Unblocked | State::Yielded)
    }

    /// Coarse, user-facing state.
    pub fn thread_state(self) -> ThreadState {
        use State::*;
        match self {
            New => ThreadState::New,
            Started | Running | Unparked | Unblocked | Yielded => ThreadState::Runnable,
            Parking | TimedParking | Yielding | Blocking | Waiting | TimedWaiting => {
                ThreadState::Runnable
            }
            Parked | Pinned | Wait => ThreadState::Waiting,
            TimedParked | TimedPinned | TimedWait => ThreadState::TimedWaiting,
            Blocked => ThreadState::Blocked,
            Terminated => ThreadState::Terminated,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use State::*;
        f.write_str(match self {
            New => "NEW",
            Started => "STARTED",
            Running => "RUNNING",
            Parking => "PARKING",
            Parked => "PARKED",
            Pinned => "PINNED",
            TimedParking => "TIMED_PARKING",
            TimedParked => "TIMED_PARKED",
            TimedPinned => "TIMED_PINNED",
            Unparked => "UNPARKED",
            Yielding => "YIELDING",
            Yielded => "YIELDED",
            Blocking => "BLOCKING",
            Blocked => "BLOCKED",
            Unblocked => "UNBLOCKED",
            Waiting => "WAITING",
            Wait => "WAIT",
            TimedWaiting => "TIMED_WAITING",
            TimedWait => "TIMED_WAIT",
            Terminated => "TERMINATED",
        })
    }
}

/// Coarse thread state, in the vocabulary of OS thread monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ThreadState::New => "new",
            ThreadState::Runnable => "runnable",
            ThreadState::Blocked => "blocked",
            ThreadState::Waiting => "waiting",
            ThreadState::TimedWaiting => "timed_waiting",
            ThreadState::Terminated => "terminated",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use State::*;

    const ALL: [State; 20] = [
        New,
        Started,
        Running,
        Parking,
        Parked,
        Pinned,
        TimedParking,
        TimedParked,
        TimedPinned,
        Unparked,
        Yielding,
        Yielded,
        Blocking,
        Blocked,
        Unblocked,
        Waiting,
        Wait,
        TimedWaiting,
        TimedWait,
        Terminated,
    ];

    #[test]
    fn raw_values_round_trip() {
        for s in ALL {
            assert_eq!(State::from_u8(s as u8), Some(s));
        }
        assert_eq!(State::from_u8(42), None);
    }

    #[test]
    fn park_cycle() {
        assert_eq!(Running.on(Event::Park).unwrap().to, Parking);
        assert_eq!(Parking.on(Event::Settle).unwrap().to, Parked);
        assert_eq!(
            Parked.on(Event::Unpark),
            Some(Step {
                to: Unparked,
                action: Action::Submit
            })
        );
        assert_eq!(Unparked.on(Event::Resume).unwrap().to, Running);
    }

    #[test]
    fn timed_park_arms_timer_on_settle() {
        assert_eq!(
            TimedParking.on(Event::Settle),
            Some(Step {
                to: TimedParked,
                action: Action::ArmTimer
            })
        );
        assert_eq!(TimedParked.on(Event::Timeout).unwrap().to, Unparked);
        // Untimed park has no timeout.
        assert_eq!(Parked.on(Event::Timeout), None);
    }

    #[test]
    fn pinning_blocks_the_carrier_without_an_unpark_edge() {
        assert_eq!(Running.on(Event::Pin).unwrap().action, Action::BlockCarrier);
        assert_eq!(Running.on(Event::TimedPin).unwrap().action, Action::BlockCarrier);
        // Unpark wakes the carrier's parker; the state only leaves PINNED by Unpin.
        assert_eq!(Pinned.on(Event::Unpark), None);
        assert_eq!(TimedPinned.on(Event::Unpark), None);
        assert_eq!(Pinned.on(Event::Unpin).unwrap().to, Running);
    }

    #[test]
    fn wait_family() {
        assert_eq!(Running.on(Event::Wait).unwrap().to, Waiting);
        assert_eq!(Waiting.on(Event::Settle).unwrap().to, Wait);
        assert_eq!(Wait.on(Event::Notify).unwrap().to, Blocked);
        assert_eq!(Wait.on(Event::Interrupt).unwrap().to, Unblocked);
        assert_eq!(Wait.on(Event::Timeout), None);
        assert_eq!(TimedWait.on(Event::Timeout).unwrap().to, Unblocked);
        assert_eq!(Blocked.on(Event::Unblock).unwrap().action, Action::Submit);
    }

    #[test]
    fn only_runnable_unmounted_states_resume() {
        for s in ALL {
            let resumes = s.on(Event::Resume).is_some();
            assert_eq!(resumes, s == Started || s.is_runnable_unmounted(), "{s}");
        }
    }

    #[test]
    fn submit_actions_only_target_runnable_states() {
        let events = [
            Event::Start,
            Event::Settle,
            Event::Unpark,
            Event::Timeout,
            Event::Unblock,
            Event::Interrupt,
        ];
        for s in ALL {
            for e in events {
                if let Some(step) = s.on(e) {
                    if step.action == Action::Submit {
                        assert!(
                            step.to == Started || step.to.is_runnable_unmounted(),
                            "{s} --{e:?}--> {}",
                            step.to
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_state_is_final() {
        assert_eq!(Running.on(Event::Terminate).unwrap().to, Terminated);
        assert_eq!(Started.on(Event::Terminate).unwrap().to, Terminated);
        assert_eq!(New.on(Event::Terminate), None);
        assert_eq!(Terminated.on(Event::Terminate), None);
        assert_eq!(Terminated.on(Event::Start), None);
    }

    #[test]
    fn coarse_state_mapping() {
        assert_eq!(Parked.thread_state(), ThreadState::Waiting);
        assert_eq!(Pinned.thread_state(), ThreadState::Waiting);
        assert_eq!(TimedWait.thread_state(), ThreadState::TimedWaiting);
        assert_eq!(Blocked.thread_state(), ThreadState::Blocked);
        assert_eq!(Yielding.thread_state(), ThreadState::Runnable);
        assert_eq!(ThreadState::TimedWaiting.to_string(), "timed_waiting");
    }
}
