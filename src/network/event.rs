use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use mio::event::Event;
use mio::Interest;

/// Normalized readiness vocabulary shared by the reactor, the TLS state
/// machine and the application callback.
///
/// READ and WRITE are the only members that may be requested as registration
/// input; TIMEOUT and SOCKET_ERROR only ever flow outward from the reactor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    pub const READ: EventSet = EventSet(0x01);
    pub const WRITE: EventSet = EventSet(0x02);
    pub const TIMEOUT: EventSet = EventSet(0x04);
    pub const SOCKET_ERROR: EventSet = EventSet(0x08);

    pub const fn empty() -> EventSet {
        EventSet(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Translates the registrable part of the set into a reactor interest.
    ///
    /// Returns `None` when neither READ nor WRITE is present: an empty
    /// interest cannot be registered, so "no interest" means "no watch".
    pub fn to_interest(self) -> Option<Interest> {
        match (self.contains(EventSet::READ), self.contains(EventSet::WRITE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Normalizes a raw reactor event.
    ///
    /// A closed read side still surfaces as READ so the owner observes the
    /// orderly shutdown from the next `recv` rather than losing it.
    pub fn from_mio(event: &Event) -> EventSet {
        let mut set = EventSet::empty();
        if event.is_readable() || event.is_read_closed() {
            set |= EventSet::READ;
        }
        if event.is_writable() {
            set |= EventSet::WRITE;
        }
        if event.is_error() {
            set |= EventSet::SOCKET_ERROR;
        }
        set
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventSet {
    type Output = EventSet;

    fn bitand(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut sep = "";
        for (bit, name) in [
            (EventSet::READ, "READ"),
            (EventSet::WRITE, "WRITE"),
            (EventSet::TIMEOUT, "TIMEOUT"),
            (EventSet::SOCKET_ERROR, "SOCKET_ERROR"),
        ] {
            if self.contains(bit) {
                f.write_str(sep)?;
                f.write_str(name)?;
                sep = "|";
            }
        }
        Ok(())
    }
}

/// Why a connection wants to be woken up.
///
/// Two logically separate groups share this word. WANT_READ/WANT_WRITE are
/// application intent; the WANT_TLS_* flags are transport retry state owned
/// by the TLS state machine. The reactor subscription is derived from the
/// application group only; the TLS group influences it indirectly, by adding
/// application intent whenever a retry needs the socket.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IntentFlags(u8);

impl IntentFlags {
    pub const WANT_READ: IntentFlags = IntentFlags(0x01);
    pub const WANT_WRITE: IntentFlags = IntentFlags(0x02);
    pub const WANT_TLS_ACCEPT: IntentFlags = IntentFlags(0x04);
    pub const WANT_TLS_CONNECT: IntentFlags = IntentFlags(0x08);
    pub const WANT_TLS_READ: IntentFlags = IntentFlags(0x10);
    pub const WANT_TLS_WRITE: IntentFlags = IntentFlags(0x20);

    pub const fn empty() -> IntentFlags {
        IntentFlags(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: IntentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: IntentFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: IntentFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: IntentFlags) {
        self.0 &= !other.0;
    }

    /// The reactor subscription implied by the application-intent group.
    pub fn registration_events(self) -> EventSet {
        let mut events = EventSet::empty();
        if self.contains(IntentFlags::WANT_READ) {
            events |= EventSet::READ;
        }
        if self.contains(IntentFlags::WANT_WRITE) {
            events |= EventSet::WRITE;
        }
        events
    }
}

impl BitOr for IntentFlags {
    type Output = IntentFlags;

    fn bitor(self, rhs: IntentFlags) -> IntentFlags {
        IntentFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for IntentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut sep = "";
        for (bit, name) in [
            (IntentFlags::WANT_READ, "WANT_READ"),
            (IntentFlags::WANT_WRITE, "WANT_WRITE"),
            (IntentFlags::WANT_TLS_ACCEPT, "WANT_TLS_ACCEPT"),
            (IntentFlags::WANT_TLS_CONNECT, "WANT_TLS_CONNECT"),
            (IntentFlags::WANT_TLS_READ, "WANT_TLS_READ"),
            (IntentFlags::WANT_TLS_WRITE, "WANT_TLS_WRITE"),
        ] {
            if self.contains(bit) {
                f.write_str(sep)?;
                f.write_str(name)?;
                sep = "|";
            }
        }
        Ok(())
    }
}
