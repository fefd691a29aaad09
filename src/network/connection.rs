use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Token;
use tracing::{debug, error, trace};

use crate::network::reactor::Reactor;
use crate::network::tls::{TlsContext, TlsError, TlsProgress, TlsRole, TlsSession};
use crate::network::{EventSet, IntentFlags};
use crate::{AppError, AppResult};

const CLOSED_FD: RawFd = -1;

/// Outcome of a successful `send`/`recv` call.
///
/// `Transferred(n)` may be shorter than the caller asked for; the caller
/// resends or rereads the remainder. `NotReady` means the operation would
/// have blocked and should be retried on the next readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Transferred(usize),
    NotReady,
}

/// Event sink installed by the owning layer.
///
/// Invoked on the reactor thread; must not block; may re-enter the
/// connection, including closing it.
pub type EventCallback = Box<dyn FnMut(&mut Connection, &mut dyn Reactor, EventSet)>;

enum Transport {
    Plain(TcpStream),
    Tls {
        sock: TcpStream,
        session: Box<dyn TlsSession>,
    },
}

/// A non-blocking socket turned into an event-driven object.
///
/// The connection owns the socket (and TLS session, once one is started) and
/// keeps the reactor subscription in sync with its intent flags. It never
/// closes itself: every orderly-close or fatal outcome is reported to the
/// owner, who decides when to call `close`.
pub struct Connection {
    token: Token,
    fd: RawFd,
    transport: Option<Transport>,
    peer_addr: SocketAddr,
    callback: Option<EventCallback>,
    flags: IntentFlags,
    last_send: Instant,
    last_recv: Instant,
    // length a transient tls write must be retried with, 0 when none
    pending_tls_write: usize,
}

impl Connection {
    /// Takes ownership of a freshly accepted or connected socket.
    ///
    /// The socket is made non-blocking, both activity timestamps are stamped
    /// to now, and a persistent reactor watch is installed for
    /// `initial_events`. Events start flowing as soon as this returns.
    pub fn new(
        reactor: &mut dyn Reactor,
        sock: std::net::TcpStream,
        peer_addr: SocketAddr,
        callback: EventCallback,
        initial_events: EventSet,
        token: Token,
    ) -> AppResult<Connection> {
        sock.set_nonblocking(true)?;
        // SIGPIPE is already ignored process-wide by the Rust runtime on
        // unix; Apple targets need the per-socket option on top.
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket2::SockRef::from(&sock).set_nosigpipe(true)?;

        let sock = TcpStream::from_std(sock);
        let fd = sock.as_raw_fd();

        let mut flags = IntentFlags::empty();
        if initial_events.contains(EventSet::READ) {
            flags.insert(IntentFlags::WANT_READ);
        }
        if initial_events.contains(EventSet::WRITE) {
            flags.insert(IntentFlags::WANT_WRITE);
        }

        let now = Instant::now();
        let mut con = Connection {
            token,
            fd,
            transport: Some(Transport::Plain(sock)),
            peer_addr,
            callback: Some(callback),
            flags,
            last_send: now,
            last_recv: now,
            pending_tls_write: 0,
        };
        con.refresh_registration(reactor);
        debug!("connection {:?} created for {}", token, peer_addr);
        Ok(con)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The OS descriptor, or `-1` once closed.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.fd == CLOSED_FD
    }

    pub fn flags(&self) -> IntentFlags {
        self.flags
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls { .. }))
    }

    /// True once a TLS handshake has completed; false for plaintext
    /// connections and while a handshake is still in flight.
    pub fn tls_established(&self) -> bool {
        self.is_tls()
            && !self
                .flags
                .intersects(IntentFlags::WANT_TLS_ACCEPT | IntentFlags::WANT_TLS_CONNECT)
    }

    /// Instant of the last successful send, for idle bookkeeping.
    pub fn last_send(&self) -> Instant {
        self.last_send
    }

    /// Instant of the last successful receive, for idle bookkeeping.
    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    /// Length the next TLS `send` must present again, 0 when no retry is
    /// pending.
    pub fn pending_tls_write(&self) -> usize {
        self.pending_tls_write
    }

    /// Replaces the event sink. Takes effect from the next delivery; a
    /// callback may install its own successor mid-dispatch.
    pub fn set_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    /// Adds READ/WRITE intent. Additive: flags the caller did not name stay
    /// set; use `set_interest` to shrink. No-op once closed.
    pub fn update_interest(&mut self, reactor: &mut dyn Reactor, events: EventSet) {
        if self.fd == CLOSED_FD {
            return;
        }
        if events.contains(EventSet::READ) {
            self.flags.insert(IntentFlags::WANT_READ);
        }
        if events.contains(EventSet::WRITE) {
            self.flags.insert(IntentFlags::WANT_WRITE);
        }
        self.refresh_registration(reactor);
    }

    /// Replaces the application-intent group with exactly `events`,
    /// clearing whichever of READ/WRITE is absent. Transport-retry flags are
    /// not touched. No-op once closed.
    pub fn set_interest(&mut self, reactor: &mut dyn Reactor, events: EventSet) {
        if self.fd == CLOSED_FD {
            return;
        }
        self.flags
            .remove(IntentFlags::WANT_READ | IntentFlags::WANT_WRITE);
        if events.contains(EventSet::READ) {
            self.flags.insert(IntentFlags::WANT_READ);
        }
        if events.contains(EventSet::WRITE) {
            self.flags.insert(IntentFlags::WANT_WRITE);
        }
        self.refresh_registration(reactor);
    }

    /// Recomputes the reactor subscription from the application-intent
    /// flags. Skipped entirely when the computed watch equals the installed
    /// one; some reactors treat redundant add/remove as an error.
    fn refresh_registration(&mut self, reactor: &mut dyn Reactor) {
        if self.fd == CLOSED_FD {
            return;
        }
        let wanted = self.flags.registration_events();
        if reactor.watch_mask(self.fd) == wanted {
            return;
        }
        if !reactor.watch_mask(self.fd).is_empty() {
            reactor.unwatch(self.fd);
        }
        if !wanted.is_empty() {
            reactor.watch(self.fd, self.token, wanted, true);
        }
        trace!("connection {:?} now watching {:?}", self.token, wanted);
    }

    /// Deregisters, cancels any pending timeout and releases the descriptor
    /// and TLS session. The descriptor reads as `-1` afterwards and every
    /// later operation on the connection degrades to a no-op. A second close
    /// finds the sentinel everywhere and does nothing.
    pub fn close(&mut self, reactor: &mut dyn Reactor) {
        if self.fd != CLOSED_FD {
            debug!("connection {:?} to {} closing", self.token, self.peer_addr);
            if !reactor.watch_mask(self.fd).is_empty() {
                reactor.unwatch(self.fd);
            }
        }
        self.clear_timeout(reactor);
        if let Some(Transport::Tls {
            mut sock,
            mut session,
        }) = self.transport.take()
        {
            session.send_close_notify(&mut sock);
        }
        self.fd = CLOSED_FD;
    }

    /// Schedules the idle timeout, replacing any pending one. The firing
    /// timer reaches the callback as a TIMEOUT event through the reactor.
    pub fn set_timeout(&mut self, reactor: &mut dyn Reactor, timeout: Duration) {
        if self.fd == CLOSED_FD {
            return;
        }
        reactor.schedule_timer(self.token, timeout);
    }

    /// Cancels the pending timeout; no-op if none is scheduled or it
    /// already fired.
    pub fn clear_timeout(&mut self, reactor: &mut dyn Reactor) {
        if reactor.timer_pending(self.token) {
            reactor.cancel_timer(self.token);
        }
    }

    /// Feeds one reactor event through the connection.
    ///
    /// Plaintext events pass straight to the callback. With TLS active, a
    /// pending handshake is re-driven first, and the WANT_TLS_* flags may
    /// reinterpret the physical event: a pure READ while the last write
    /// waits on the socket being readable is reported as WRITE, and a pure
    /// WRITE while the last read waits on writability is filtered to the
    /// READ bits (the empty set for a pure WRITE event; the callback still
    /// fires so the owner re-examines its own state). Events queued before
    /// the owner closed the connection are dropped here.
    pub fn dispatch(&mut self, reactor: &mut dyn Reactor, events: EventSet) {
        if self.is_closed() {
            trace!("dropping {:?} for closed connection {:?}", events, self.token);
            return;
        }
        if !self.is_tls() {
            self.deliver(reactor, events);
            return;
        }
        if events.intersects(EventSet::READ | EventSet::WRITE) {
            if self.flags.contains(IntentFlags::WANT_TLS_ACCEPT) {
                if self.drive_tls_accept(reactor).is_err() {
                    self.deliver(reactor, EventSet::SOCKET_ERROR);
                }
            } else if self.flags.contains(IntentFlags::WANT_TLS_CONNECT) {
                if self.drive_tls_connect(reactor).is_err() {
                    self.deliver(reactor, EventSet::SOCKET_ERROR);
                }
            } else if events == EventSet::READ && self.flags.contains(IntentFlags::WANT_TLS_READ) {
                self.deliver(reactor, EventSet::WRITE);
            } else if events == EventSet::WRITE && self.flags.contains(IntentFlags::WANT_TLS_WRITE)
            {
                self.deliver(reactor, events & EventSet::READ);
            } else {
                self.deliver(reactor, events);
            }
        } else {
            self.deliver(reactor, events);
        }
    }

    fn deliver(&mut self, reactor: &mut dyn Reactor, events: EventSet) {
        if let Some(mut callback) = self.callback.take() {
            callback(self, reactor, events);
            // keep a replacement installed through set_callback during the
            // call, otherwise restore the original
            if self.callback.is_none() {
                self.callback = Some(callback);
            }
        }
    }

    /// Upgrades the plaintext transport and drives the first handshake step
    /// with a session minted from `context`.
    pub fn start_tls(
        &mut self,
        reactor: &mut dyn Reactor,
        context: &TlsContext,
    ) -> AppResult<TlsProgress> {
        let session = context.new_session()?;
        self.start_tls_with(reactor, Box::new(session), context.role())
    }

    /// Like `start_tls` but with a caller-supplied session, for alternative
    /// backends. The upgrade is one-way: a connection that became TLS stays
    /// TLS for the rest of its life.
    pub fn start_tls_with(
        &mut self,
        reactor: &mut dyn Reactor,
        session: Box<dyn TlsSession>,
        role: TlsRole,
    ) -> AppResult<TlsProgress> {
        match self.transport.take() {
            Some(Transport::Plain(sock)) => {
                self.transport = Some(Transport::Tls { sock, session });
            }
            Some(transport) => {
                self.transport = Some(transport);
                return Err(AppError::IllegalStateError(format!(
                    "tls already active on connection to {}",
                    self.peer_addr
                )));
            }
            None => {
                return Err(AppError::IllegalStateError(
                    "tls start on closed connection".to_string(),
                ));
            }
        }
        debug!("connection {:?} starting tls as {:?}", self.token, role);
        match role {
            TlsRole::Server => self.drive_tls_accept(reactor),
            TlsRole::Client => self.drive_tls_connect(reactor),
        }
    }

    /// One step of the server handshake. The accept flag is raised before
    /// the attempt so a synchronous failure still leaves the retry path
    /// armed; success drops it together with its paired read-retry flag.
    fn drive_tls_accept(&mut self, reactor: &mut dyn Reactor) -> AppResult<TlsProgress> {
        self.flags.insert(IntentFlags::WANT_TLS_ACCEPT);
        let result = match self.transport.as_mut() {
            Some(Transport::Tls { sock, session }) => session.accept(sock),
            _ => {
                return Err(AppError::IllegalStateError(
                    "tls accept without a tls transport".to_string(),
                ))
            }
        };
        match result {
            Ok(()) => {
                self.flags.remove(IntentFlags::WANT_TLS_ACCEPT);
                self.flags.remove(IntentFlags::WANT_TLS_READ);
                debug!("connection {:?} tls established (server)", self.token);
                Ok(TlsProgress::Established)
            }
            Err(err) => {
                self.handle_tls_error(reactor, err)?;
                Ok(TlsProgress::InProgress)
            }
        }
    }

    /// One step of the client handshake; mirrors `drive_tls_accept` with
    /// the connect/write-retry flag pair.
    fn drive_tls_connect(&mut self, reactor: &mut dyn Reactor) -> AppResult<TlsProgress> {
        self.flags.insert(IntentFlags::WANT_TLS_CONNECT);
        let result = match self.transport.as_mut() {
            Some(Transport::Tls { sock, session }) => session.connect(sock),
            _ => {
                return Err(AppError::IllegalStateError(
                    "tls connect without a tls transport".to_string(),
                ))
            }
        };
        match result {
            Ok(()) => {
                self.flags.remove(IntentFlags::WANT_TLS_CONNECT);
                self.flags.remove(IntentFlags::WANT_TLS_WRITE);
                debug!("connection {:?} tls established (client)", self.token);
                Ok(TlsProgress::Established)
            }
            Err(err) => {
                self.handle_tls_error(reactor, err)?;
                Ok(TlsProgress::InProgress)
            }
        }
    }

    /// Maps a session retry/failure onto registration and flag changes.
    ///
    /// Transient conditions come back as `NotReady`; everything else is an
    /// error the owner answers by closing the connection.
    fn handle_tls_error(&mut self, reactor: &mut dyn Reactor, err: TlsError) -> AppResult<IoOutcome> {
        match err {
            TlsError::CleanShutdown => Err(AppError::ConnectionClosed),
            TlsError::WantRead => {
                trace!("connection {:?} tls wants read", self.token);
                self.update_interest(reactor, EventSet::READ);
                self.flags.insert(IntentFlags::WANT_TLS_READ);
                Ok(IoOutcome::NotReady)
            }
            TlsError::WantWrite => {
                trace!("connection {:?} tls wants write", self.token);
                self.update_interest(reactor, EventSet::READ | EventSet::WRITE);
                self.flags.insert(IntentFlags::WANT_TLS_WRITE);
                Ok(IoOutcome::NotReady)
            }
            TlsError::WantConnect => {
                trace!("connection {:?} tls wants connect", self.token);
                self.update_interest(reactor, EventSet::READ | EventSet::WRITE);
                self.flags.insert(IntentFlags::WANT_TLS_CONNECT);
                Ok(IoOutcome::NotReady)
            }
            TlsError::WantAccept => {
                trace!("connection {:?} tls wants accept", self.token);
                self.update_interest(reactor, EventSet::READ | EventSet::WRITE);
                self.flags.insert(IntentFlags::WANT_TLS_ACCEPT);
                Ok(IoOutcome::NotReady)
            }
            TlsError::WantX509Lookup => Ok(IoOutcome::NotReady),
            TlsError::Syscall(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(IoOutcome::NotReady)
            }
            TlsError::Syscall(err) => Err(AppError::IoError(err)),
            TlsError::Fatal(reason) => {
                error!("connection {:?} tls failure: {}", self.token, reason);
                Err(AppError::TlsFailure(reason))
            }
        }
    }

    /// Sends bytes, plaintext or TLS transparently.
    ///
    /// `Transferred(n)` may be short; the caller resends the remainder. A
    /// TLS write that previously came back `NotReady` with a pending length
    /// must be retried with at least that many bytes; exactly the pending
    /// length is presented to the session again, whatever the caller now
    /// offers. `last_send` moves only when bytes were transferred.
    pub fn send(&mut self, reactor: &mut dyn Reactor, buf: &[u8]) -> AppResult<IoOutcome> {
        match self.transport.as_mut() {
            None => Err(AppError::IllegalStateError(
                "send on closed connection".to_string(),
            )),
            Some(Transport::Plain(sock)) => match sock.write(buf) {
                Ok(n) => {
                    if n > 0 {
                        self.last_send = Instant::now();
                    }
                    Ok(IoOutcome::Transferred(n))
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    Ok(IoOutcome::NotReady)
                }
                Err(err) => Err(AppError::IoError(err)),
            },
            Some(Transport::Tls { sock, session }) => {
                let len = if self.flags.contains(IntentFlags::WANT_TLS_READ)
                    && self.pending_tls_write > 0
                {
                    if buf.len() < self.pending_tls_write {
                        return Err(AppError::IllegalStateError(format!(
                            "tls write retry needs {} bytes, caller offered {}",
                            self.pending_tls_write,
                            buf.len()
                        )));
                    }
                    self.pending_tls_write
                } else {
                    buf.len()
                };
                match session.write(sock, &buf[..len]) {
                    Ok(n) => {
                        if n > 0 {
                            self.last_send = Instant::now();
                        }
                        self.flags.remove(IntentFlags::WANT_TLS_READ);
                        self.pending_tls_write = 0;
                        Ok(IoOutcome::Transferred(n))
                    }
                    Err(err) => {
                        self.pending_tls_write = len;
                        self.handle_tls_error(reactor, err)
                    }
                }
            }
        }
    }

    /// Receives bytes, plaintext or TLS transparently.
    ///
    /// Zero bytes on a non-empty buffer is the peer's orderly close and
    /// surfaces as `ConnectionClosed`; the connection itself stays open
    /// until the owner closes it. A successful read resolves a pending
    /// read-needs-write condition. `last_recv` moves only when bytes were
    /// transferred.
    pub fn recv(&mut self, reactor: &mut dyn Reactor, buf: &mut [u8]) -> AppResult<IoOutcome> {
        match self.transport.as_mut() {
            None => Err(AppError::IllegalStateError(
                "recv on closed connection".to_string(),
            )),
            Some(Transport::Plain(sock)) => match sock.read(buf) {
                Ok(0) if !buf.is_empty() => Err(AppError::ConnectionClosed),
                Ok(n) => {
                    if n > 0 {
                        self.last_recv = Instant::now();
                    }
                    Ok(IoOutcome::Transferred(n))
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    Ok(IoOutcome::NotReady)
                }
                Err(err) => Err(AppError::IoError(err)),
            },
            Some(Transport::Tls { sock, session }) => match session.read(sock, buf) {
                Ok(n) => {
                    if n > 0 {
                        self.last_recv = Instant::now();
                    }
                    self.flags.remove(IntentFlags::WANT_TLS_WRITE);
                    Ok(IoOutcome::Transferred(n))
                }
                Err(err) => self.handle_tls_error(reactor, err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::net::TcpListener;
    use std::rc::Rc;
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct RecordingReactor {
        masks: HashMap<RawFd, EventSet>,
        watch_calls: usize,
        unwatch_calls: usize,
        scheduled: HashMap<Token, Duration>,
        schedule_calls: usize,
        cancel_calls: usize,
    }

    impl Reactor for RecordingReactor {
        fn watch(&mut self, fd: RawFd, _token: Token, events: EventSet, _persistent: bool) {
            self.watch_calls += 1;
            self.masks.insert(fd, events);
        }

        fn unwatch(&mut self, fd: RawFd) {
            self.unwatch_calls += 1;
            self.masks.remove(&fd);
        }

        fn watch_mask(&self, fd: RawFd) -> EventSet {
            self.masks.get(&fd).copied().unwrap_or(EventSet::empty())
        }

        fn schedule_timer(&mut self, token: Token, timeout: Duration) {
            self.schedule_calls += 1;
            self.scheduled.insert(token, timeout);
        }

        fn cancel_timer(&mut self, token: Token) {
            self.cancel_calls += 1;
            self.scheduled.remove(&token);
        }

        fn timer_pending(&self, token: Token) -> bool {
            self.scheduled.contains_key(&token)
        }
    }

    struct ScriptedSession {
        handshakes: VecDeque<Result<(), TlsError>>,
        reads: VecDeque<Result<usize, TlsError>>,
        writes: VecDeque<Result<usize, TlsError>>,
        write_lens: Rc<RefCell<Vec<usize>>>,
    }

    impl ScriptedSession {
        fn established() -> ScriptedSession {
            ScriptedSession {
                handshakes: VecDeque::from([Ok(())]),
                reads: VecDeque::new(),
                writes: VecDeque::new(),
                write_lens: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl TlsSession for ScriptedSession {
        fn accept(&mut self, _sock: &mut TcpStream) -> Result<(), TlsError> {
            self.handshakes.pop_front().unwrap_or(Ok(()))
        }

        fn connect(&mut self, _sock: &mut TcpStream) -> Result<(), TlsError> {
            self.handshakes.pop_front().unwrap_or(Ok(()))
        }

        fn read(&mut self, _sock: &mut TcpStream, _buf: &mut [u8]) -> Result<usize, TlsError> {
            self.reads.pop_front().unwrap_or(Err(TlsError::WantRead))
        }

        fn write(&mut self, _sock: &mut TcpStream, buf: &[u8]) -> Result<usize, TlsError> {
            self.write_lens.borrow_mut().push(buf.len());
            self.writes.pop_front().unwrap_or(Ok(buf.len()))
        }
    }

    fn socket_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    type EventLog = Rc<RefCell<Vec<EventSet>>>;

    fn new_connection(
        reactor: &mut dyn Reactor,
        initial: EventSet,
    ) -> (Connection, std::net::TcpStream, EventLog) {
        let (local, peer) = socket_pair();
        let addr = local.peer_addr().unwrap();
        let seen: EventLog = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let con = Connection::new(
            reactor,
            local,
            addr,
            Box::new(move |_con, _reactor, events| sink.borrow_mut().push(events)),
            initial,
            Token(1),
        )
        .unwrap();
        (con, peer, seen)
    }

    fn recv_until_transferred(
        con: &mut Connection,
        reactor: &mut dyn Reactor,
        buf: &mut [u8],
    ) -> usize {
        for _ in 0..500 {
            match con.recv(reactor, buf).unwrap() {
                IoOutcome::Transferred(n) => return n,
                IoOutcome::NotReady => thread::sleep(Duration::from_millis(1)),
            }
        }
        panic!("no data arrived");
    }

    #[test]
    fn test_registration_is_union_and_idempotent() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        assert_eq!(reactor.watch_mask(con.raw_fd()), EventSet::READ);
        let calls = reactor.watch_calls;

        // identical request is skipped entirely
        con.update_interest(&mut reactor, EventSet::READ);
        assert_eq!(reactor.watch_calls, calls);

        con.update_interest(&mut reactor, EventSet::WRITE);
        assert_eq!(
            reactor.watch_mask(con.raw_fd()),
            EventSet::READ | EventSet::WRITE
        );
        assert_eq!(reactor.watch_calls, calls + 1);

        // the union already contains WRITE, so this is a no-op too
        con.update_interest(&mut reactor, EventSet::WRITE);
        assert_eq!(reactor.watch_calls, calls + 1);
        assert_eq!(
            con.flags().registration_events(),
            EventSet::READ | EventSet::WRITE
        );
    }

    #[test]
    fn test_set_interest_shrinks_registration() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) =
            new_connection(&mut reactor, EventSet::READ | EventSet::WRITE);
        assert_eq!(
            reactor.watch_mask(con.raw_fd()),
            EventSet::READ | EventSet::WRITE
        );

        con.set_interest(&mut reactor, EventSet::READ);
        assert_eq!(reactor.watch_mask(con.raw_fd()), EventSet::READ);
        assert!(!con.flags().contains(IntentFlags::WANT_WRITE));

        con.set_interest(&mut reactor, EventSet::empty());
        assert_eq!(reactor.watch_mask(con.raw_fd()), EventSet::empty());
    }

    #[test]
    fn test_operations_after_close_are_noops() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        con.close(&mut reactor);
        assert_eq!(con.raw_fd(), -1);

        let watch_calls = reactor.watch_calls;
        let schedule_calls = reactor.schedule_calls;
        con.update_interest(&mut reactor, EventSet::READ | EventSet::WRITE);
        con.set_timeout(&mut reactor, Duration::from_secs(1));
        assert_eq!(reactor.watch_calls, watch_calls);
        assert_eq!(reactor.schedule_calls, schedule_calls);
    }

    #[test]
    fn test_close_releases_watch_and_timer() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        con.set_timeout(&mut reactor, Duration::from_secs(5));
        assert!(reactor.timer_pending(Token(1)));

        let fd = con.raw_fd();
        con.close(&mut reactor);
        assert!(con.is_closed());
        assert_eq!(reactor.watch_mask(fd), EventSet::empty());
        assert!(!reactor.timer_pending(Token(1)));

        // second close finds the sentinel everywhere
        let unwatch_calls = reactor.unwatch_calls;
        con.close(&mut reactor);
        assert_eq!(reactor.unwatch_calls, unwatch_calls);
    }

    #[test]
    fn test_dispatch_after_close_drops_event() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, seen) = new_connection(&mut reactor, EventSet::READ);
        con.close(&mut reactor);
        con.dispatch(&mut reactor, EventSet::READ);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_plain_dispatch_passes_events_through() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, seen) = new_connection(&mut reactor, EventSet::READ);
        con.dispatch(&mut reactor, EventSet::READ);
        con.dispatch(&mut reactor, EventSet::TIMEOUT);
        con.dispatch(&mut reactor, EventSet::SOCKET_ERROR);
        assert_eq!(
            *seen.borrow(),
            vec![EventSet::READ, EventSet::TIMEOUT, EventSet::SOCKET_ERROR]
        );
    }

    #[test]
    fn test_callback_may_close_its_own_connection() {
        let mut reactor = RecordingReactor::default();
        let (local, _peer) = socket_pair();
        let addr = local.peer_addr().unwrap();
        let mut con = Connection::new(
            &mut reactor,
            local,
            addr,
            Box::new(|con, reactor, _events| con.close(reactor)),
            EventSet::READ,
            Token(9),
        )
        .unwrap();

        con.dispatch(&mut reactor, EventSet::READ);
        assert!(con.is_closed());
        // a second queued event for the same connection is dropped
        con.dispatch(&mut reactor, EventSet::READ);
    }

    #[test]
    fn test_set_callback_replaces_sink() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, seen) = new_connection(&mut reactor, EventSet::READ);
        con.dispatch(&mut reactor, EventSet::READ);
        assert_eq!(seen.borrow().len(), 1);

        let replacement: EventLog = Rc::new(RefCell::new(Vec::new()));
        let sink = replacement.clone();
        con.set_callback(Box::new(move |_con, _reactor, events| {
            sink.borrow_mut().push(events)
        }));
        con.dispatch(&mut reactor, EventSet::WRITE);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(*replacement.borrow(), vec![EventSet::WRITE]);
    }

    #[test]
    fn test_plaintext_short_reads_and_timestamps() {
        let mut reactor = RecordingReactor::default();
        let (mut con, mut peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let mut buf = [0u8; 4];

        // nothing buffered: NotReady and an untouched timestamp
        let before = con.last_recv();
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
        assert_eq!(con.last_recv(), before);

        // ten bytes against a four byte buffer drain in three calls
        peer.write_all(b"0123456789").unwrap();
        assert_eq!(recv_until_transferred(&mut con, &mut reactor, &mut buf), 4);
        assert!(con.last_recv() >= before);
        assert_eq!(&buf, b"0123");
        assert_eq!(recv_until_transferred(&mut con, &mut reactor, &mut buf), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(recv_until_transferred(&mut con, &mut reactor, &mut buf), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
    }

    #[test]
    fn test_plaintext_send_updates_timestamp() {
        let mut reactor = RecordingReactor::default();
        let (mut con, mut peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let before = con.last_send();
        match con.send(&mut reactor, b"hello").unwrap() {
            IoOutcome::Transferred(n) => assert_eq!(n, 5),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(con.last_send() >= before);

        let mut echo = [0u8; 5];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        peer.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"hello");
    }

    #[test]
    fn test_plaintext_orderly_close_surfaces_as_connection_closed() {
        let mut reactor = RecordingReactor::default();
        let (mut con, peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        drop(peer);

        let mut buf = [0u8; 8];
        let mut result = con.recv(&mut reactor, &mut buf);
        for _ in 0..500 {
            match result {
                Ok(IoOutcome::NotReady) => {
                    thread::sleep(Duration::from_millis(1));
                    result = con.recv(&mut reactor, &mut buf);
                }
                _ => break,
            }
        }
        assert!(matches!(result, Err(AppError::ConnectionClosed)));
        // reporting the close does not close the connection
        assert!(!con.is_closed());
    }

    #[test]
    fn test_tls_write_retry_presents_pending_length() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let lens = Rc::new(RefCell::new(Vec::new()));
        let session = ScriptedSession {
            handshakes: VecDeque::from([Ok(())]),
            reads: VecDeque::new(),
            writes: VecDeque::from([Err(TlsError::WantRead), Ok(256)]),
            write_lens: lens.clone(),
        };
        assert_eq!(
            con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
                .unwrap(),
            TlsProgress::Established
        );

        let payload = vec![7u8; 300];
        let stamp = con.last_send();
        assert_eq!(
            con.send(&mut reactor, &payload[..256]).unwrap(),
            IoOutcome::NotReady
        );
        assert_eq!(con.pending_tls_write(), 256);
        assert!(con.flags().contains(IntentFlags::WANT_TLS_READ));
        assert!(reactor.watch_mask(con.raw_fd()).contains(EventSet::READ));
        assert_eq!(con.last_send(), stamp);

        // the caller now has 300 bytes queued; the session must still see
        // exactly the 256 the failed attempt carried
        assert_eq!(
            con.send(&mut reactor, &payload).unwrap(),
            IoOutcome::Transferred(256)
        );
        assert_eq!(*lens.borrow(), vec![256, 256]);
        assert_eq!(con.pending_tls_write(), 0);
        assert!(!con.flags().contains(IntentFlags::WANT_TLS_READ));
        assert!(con.last_send() >= stamp);
    }

    #[test]
    fn test_tls_write_retry_rejects_short_buffer() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            writes: VecDeque::from([Err(TlsError::WantRead)]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
            .unwrap();

        let payload = [1u8; 256];
        assert_eq!(
            con.send(&mut reactor, &payload).unwrap(),
            IoOutcome::NotReady
        );
        let result = con.send(&mut reactor, &payload[..100]);
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
    }

    #[test]
    fn test_tls_handshake_progresses_to_established() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            handshakes: VecDeque::from([
                Err(TlsError::WantRead),
                Err(TlsError::WantWrite),
                Ok(()),
            ]),
            ..ScriptedSession::established()
        };

        assert_eq!(
            con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
                .unwrap(),
            TlsProgress::InProgress
        );
        assert!(!con.tls_established());
        assert!(con.flags().contains(IntentFlags::WANT_TLS_ACCEPT));
        assert!(con.flags().contains(IntentFlags::WANT_TLS_READ));
        assert!(reactor.watch_mask(con.raw_fd()).contains(EventSet::READ));

        // readiness re-drives the handshake while the accept flag is up
        con.dispatch(&mut reactor, EventSet::READ);
        assert!(!con.tls_established());
        assert_eq!(
            reactor.watch_mask(con.raw_fd()),
            EventSet::READ | EventSet::WRITE
        );

        con.dispatch(&mut reactor, EventSet::WRITE);
        assert!(con.tls_established());
        assert!(!con.flags().contains(IntentFlags::WANT_TLS_ACCEPT));
        assert!(!con.flags().contains(IntentFlags::WANT_TLS_READ));
        // the handshake never surfaced an error event
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_tls_handshake_failure_reports_socket_error() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            handshakes: VecDeque::from([
                Err(TlsError::WantRead),
                Err(TlsError::Fatal("handshake failure".to_string())),
            ]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Client)
            .unwrap();
        assert!(con.flags().contains(IntentFlags::WANT_TLS_CONNECT));

        con.dispatch(&mut reactor, EventSet::READ);
        assert_eq!(*seen.borrow(), vec![EventSet::SOCKET_ERROR]);
        // reporting the failure leaves the close decision with the owner
        assert!(!con.is_closed());
    }

    #[test]
    fn test_tls_event_inversion() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            writes: VecDeque::from([Err(TlsError::WantRead)]),
            reads: VecDeque::from([Err(TlsError::WantWrite)]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
            .unwrap();

        // the last write needs the socket readable: a pure READ event means
        // "retry your write" and surfaces as WRITE
        assert_eq!(con.send(&mut reactor, b"abcd").unwrap(), IoOutcome::NotReady);
        con.dispatch(&mut reactor, EventSet::READ);

        // the last read needs the socket writable: a pure WRITE event is
        // filtered to its READ bits, here the empty set
        let mut buf = [0u8; 4];
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
        con.dispatch(&mut reactor, EventSet::WRITE);

        // a combined event matches neither exact-equality branch
        con.dispatch(&mut reactor, EventSet::READ | EventSet::WRITE);

        assert_eq!(
            *seen.borrow(),
            vec![
                EventSet::WRITE,
                EventSet::empty(),
                EventSet::READ | EventSet::WRITE
            ]
        );
    }

    #[test]
    fn test_tls_recv_success_clears_want_tls_write() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            reads: VecDeque::from([Err(TlsError::WantWrite), Ok(4)]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
            .unwrap();

        let mut buf = [0u8; 16];
        let before = con.last_recv();
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
        assert!(con.flags().contains(IntentFlags::WANT_TLS_WRITE));
        assert_eq!(con.last_recv(), before);

        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::Transferred(4)
        );
        assert!(!con.flags().contains(IntentFlags::WANT_TLS_WRITE));
        assert!(con.last_recv() >= before);
    }

    #[test]
    fn test_tls_clean_shutdown_surfaces_as_connection_closed() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            reads: VecDeque::from([Err(TlsError::CleanShutdown)]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
            .unwrap();

        let mut buf = [0u8; 16];
        let result = con.recv(&mut reactor, &mut buf);
        assert!(matches!(result, Err(AppError::ConnectionClosed)));
        assert!(!con.is_closed());
    }

    #[test]
    fn test_tls_syscall_would_block_is_transient() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            reads: VecDeque::from([
                Err(TlsError::Syscall(io::Error::from(io::ErrorKind::WouldBlock))),
                Err(TlsError::Syscall(io::Error::from(
                    io::ErrorKind::ConnectionReset,
                ))),
            ]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
        let result = con.recv(&mut reactor, &mut buf);
        assert!(matches!(result, Err(AppError::IoError(_))));
    }

    #[test]
    fn test_tls_renegotiation_wants_map_to_flags() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        let session = ScriptedSession {
            reads: VecDeque::from([Err(TlsError::WantX509Lookup), Err(TlsError::WantAccept)]),
            writes: VecDeque::from([Err(TlsError::WantConnect)]),
            ..ScriptedSession::established()
        };
        con.start_tls_with(&mut reactor, Box::new(session), TlsRole::Server)
            .unwrap();

        // a certificate lookup is transient and touches nothing
        let mut buf = [0u8; 16];
        let watch_calls = reactor.watch_calls;
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
        assert_eq!(reactor.watch_calls, watch_calls);
        assert_eq!(reactor.watch_mask(con.raw_fd()), EventSet::READ);

        // a renegotiation wanting accept re-arms the handshake path
        assert_eq!(
            con.recv(&mut reactor, &mut buf).unwrap(),
            IoOutcome::NotReady
        );
        assert!(con.flags().contains(IntentFlags::WANT_TLS_ACCEPT));
        assert!(!con.tls_established());
        assert_eq!(
            reactor.watch_mask(con.raw_fd()),
            EventSet::READ | EventSet::WRITE
        );

        assert_eq!(con.send(&mut reactor, b"data").unwrap(), IoOutcome::NotReady);
        assert!(con.flags().contains(IntentFlags::WANT_TLS_CONNECT));
    }

    #[test]
    fn test_start_tls_is_one_way_and_needs_a_live_socket() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);
        con.start_tls_with(
            &mut reactor,
            Box::new(ScriptedSession::established()),
            TlsRole::Server,
        )
        .unwrap();
        assert!(con.is_tls());

        let again = con.start_tls_with(
            &mut reactor,
            Box::new(ScriptedSession::established()),
            TlsRole::Server,
        );
        assert!(matches!(again, Err(AppError::IllegalStateError(_))));
        assert!(con.is_tls());

        con.close(&mut reactor);
        let after_close = con.start_tls_with(
            &mut reactor,
            Box::new(ScriptedSession::established()),
            TlsRole::Server,
        );
        assert!(matches!(after_close, Err(AppError::IllegalStateError(_))));
    }

    #[test]
    fn test_timeout_reschedule_keeps_single_timer() {
        let mut reactor = RecordingReactor::default();
        let (mut con, _peer, _seen) = new_connection(&mut reactor, EventSet::READ);

        con.set_timeout(&mut reactor, Duration::from_secs(5));
        con.set_timeout(&mut reactor, Duration::from_secs(2));
        assert_eq!(reactor.schedule_calls, 2);
        assert_eq!(reactor.scheduled.len(), 1);
        assert_eq!(
            reactor.scheduled.get(&Token(1)),
            Some(&Duration::from_secs(2))
        );

        con.clear_timeout(&mut reactor);
        assert!(!reactor.timer_pending(Token(1)));
        assert_eq!(reactor.cancel_calls, 1);

        // clearing again is a no-op, not a second cancel
        con.clear_timeout(&mut reactor);
        assert_eq!(reactor.cancel_calls, 1);
    }
}
