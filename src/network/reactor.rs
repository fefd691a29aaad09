//! Readiness notification for connections.
//!
//! The `Reactor` trait is the contract the connection layer programs
//! against: fd watches, plus one-shot timers keyed by token. `PollReactor`
//! is the production implementation over `mio::Poll`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::{error, trace};

use crate::network::EventSet;
use crate::AppResult;

pub const DEFAULT_POLL_CAPACITY: usize = 1024;

/// Readiness and timer registration surface consumed by `Connection`.
///
/// Methods report nothing back; the caller is responsible for avoiding
/// redundant calls (`watch_mask` exists for exactly that). Failures of the
/// underlying OS calls are logged by implementations.
pub trait Reactor {
    /// Installs or replaces the watch for `fd`. Only the READ/WRITE members
    /// of `events` are registrable; a set without them removes the watch.
    fn watch(&mut self, fd: RawFd, token: Token, events: EventSet, persistent: bool);

    /// Removes the watch for `fd`, if any.
    fn unwatch(&mut self, fd: RawFd);

    /// The currently installed watch for `fd`, empty when unwatched.
    fn watch_mask(&self, fd: RawFd) -> EventSet;

    /// True when the installed watch is exactly `events`.
    fn is_watching(&self, fd: RawFd, events: EventSet) -> bool {
        self.watch_mask(fd) == events
    }

    /// Schedules a one-shot timer for `token`, replacing any pending one.
    fn schedule_timer(&mut self, token: Token, timeout: Duration);

    /// Cancels the pending timer for `token`; no-op if none is pending.
    fn cancel_timer(&mut self, token: Token);

    fn timer_pending(&self, token: Token) -> bool;
}

struct Watch {
    token: Token,
    events: EventSet,
    persistent: bool,
}

struct TimerEntry {
    deadline: Instant,
    token: Token,
    generation: u64,
}

// BinaryHeap is a max-heap; reverse the comparison so the soonest deadline
// sits on top.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

/// Single-threaded reactor over `mio::Poll`.
///
/// Watches are raw-fd registrations through `SourceFd`; local bookkeeping
/// decides between register and reregister and answers `watch_mask` without
/// a syscall. Timers live in a deadline-ordered heap; rescheduling bumps a
/// per-token generation so stale heap entries are skipped lazily instead of
/// being dug out of the heap.
pub struct PollReactor {
    poll: Poll,
    events: Events,
    watches: HashMap<RawFd, Watch>,
    tokens: HashMap<Token, RawFd>,
    timers: BinaryHeap<TimerEntry>,
    live_timers: HashMap<Token, u64>,
    next_generation: u64,
}

impl PollReactor {
    pub fn new() -> AppResult<PollReactor> {
        PollReactor::with_capacity(DEFAULT_POLL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> AppResult<PollReactor> {
        Ok(PollReactor {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
            watches: HashMap::new(),
            tokens: HashMap::new(),
            timers: BinaryHeap::new(),
            live_timers: HashMap::new(),
            next_generation: 0,
        })
    }

    /// Nearest live deadline, discarding stale entries on the way.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(next) = self.timers.peek() {
            if self.live_timers.get(&next.token) == Some(&next.generation) {
                return Some(next.deadline);
            }
            self.timers.pop();
        }
        None
    }

    /// Waits for readiness once and appends `(token, events)` pairs to `out`.
    ///
    /// I/O events come first in OS order, then expired timers as TIMEOUT.
    /// `timeout` bounds the wait and is clamped to the nearest timer
    /// deadline; `None` waits indefinitely (or until the next timer).
    /// Returns the number of pairs appended.
    pub fn poll_once(
        &mut self,
        out: &mut Vec<(Token, EventSet)>,
        timeout: Option<Duration>,
    ) -> AppResult<usize> {
        let before = out.len();

        let wait = match self.next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |t| t.min(until)))
            }
            None => timeout,
        };

        if let Err(err) = self.poll.poll(&mut self.events, wait) {
            // an interrupted wait still lets expired timers deliver below
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }

        let mut spent = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            let set = EventSet::from_mio(event);
            if set.is_empty() {
                continue;
            }
            out.push((token, set));
            if let Some(fd) = self.tokens.get(&token) {
                if let Some(watch) = self.watches.get(fd) {
                    if !watch.persistent {
                        spent.push(*fd);
                    }
                }
            }
        }
        for fd in spent {
            self.unwatch(fd);
        }

        let now = Instant::now();
        while let Some(next) = self.timers.peek() {
            if next.deadline > now {
                break;
            }
            if let Some(entry) = self.timers.pop() {
                if self.live_timers.get(&entry.token) == Some(&entry.generation) {
                    self.live_timers.remove(&entry.token);
                    trace!("timer fired for {:?}", entry.token);
                    out.push((entry.token, EventSet::TIMEOUT));
                }
            }
        }

        Ok(out.len() - before)
    }
}

impl Reactor for PollReactor {
    fn watch(&mut self, fd: RawFd, token: Token, events: EventSet, persistent: bool) {
        let Some(interest) = events.to_interest() else {
            self.unwatch(fd);
            return;
        };

        let result = match self.watches.get(&fd) {
            Some(prev) => {
                if prev.token != token {
                    self.tokens.remove(&prev.token);
                }
                self.poll.registry().reregister(&mut SourceFd(&fd), token, interest)
            }
            None => self.poll.registry().register(&mut SourceFd(&fd), token, interest),
        };

        match result {
            Ok(()) => {
                trace!("watch fd {} ({:?}) for {:?}", fd, token, events);
                self.watches.insert(
                    fd,
                    Watch {
                        token,
                        events,
                        persistent,
                    },
                );
                self.tokens.insert(token, fd);
            }
            Err(err) => error!("failed to watch fd {}: {}", fd, err),
        }
    }

    fn unwatch(&mut self, fd: RawFd) {
        if let Some(watch) = self.watches.remove(&fd) {
            self.tokens.remove(&watch.token);
            trace!("unwatch fd {} ({:?})", fd, watch.token);
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                error!("failed to unwatch fd {}: {}", fd, err);
            }
        }
    }

    fn watch_mask(&self, fd: RawFd) -> EventSet {
        self.watches
            .get(&fd)
            .map_or(EventSet::empty(), |watch| watch.events)
    }

    fn schedule_timer(&mut self, token: Token, timeout: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        // the map insert invalidates any earlier heap entry for this token
        self.live_timers.insert(token, generation);
        self.timers.push(TimerEntry {
            deadline: Instant::now() + timeout,
            token,
            generation,
        });
        trace!("timer scheduled for {:?} in {:?}", token, timeout);
    }

    fn cancel_timer(&mut self, token: Token) {
        self.live_timers.remove(&token);
    }

    fn timer_pending(&self, token: Token) -> bool {
        self.live_timers.contains_key(&token)
    }
}
