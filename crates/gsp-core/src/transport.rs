//! UDP transport loops
//!
//! Two disciplines share the same handler and task abstractions:
//!
//! - [`PollServer`]: N worker threads on one port, each spinning over a
//!   non-blocking socket. Every spin runs the registered periodic tasks
//!   first, so timers fire even when no traffic arrives, then tries one
//!   receive and sleeps briefly when idle. Used by the room servers and
//!   the client endpoint.
//! - [`BlockingServer`]: one thread blocked on receive (bounded by a read
//!   timeout so the stop flag is observed). Periodic tasks run once after
//!   each received datagram. Used by the relay.
//!
//! A failing handler or task never stops a loop: the error is logged and the
//! loop continues. A panicking one is caught and logged the same way, so
//! handlers must not rely on unwinding to leave shared state consistent.
//!
//! A receive fault that is not transient closes the socket and binds a fresh
//! one on the same address. All workers of a server share that socket and
//! move to the replacement together. A failed rebind ends the workers.

use std::any::Any;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::TransportError;

/// Receive buffer size. Room protocol datagrams are 22 bytes; relayed
/// game traffic is bounded by this.
pub const MAX_DATAGRAM: usize = 2048;

/// Sleep between spins when a poll worker has nothing to receive
pub const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Read timeout of the blocking loop, bounds stop latency
pub const BLOCKING_RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Bind attempts when replacing a faulted socket. Other workers need a
/// moment to let go of the old one before its port is free.
const REBIND_ATTEMPTS: u32 = 50;
const REBIND_BACKOFF: Duration = Duration::from_millis(2);

/// Destination for outgoing datagrams
pub trait DatagramSink {
    fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, bytes, dest)
    }
}

/// Per-datagram callback of a transport loop
pub trait DatagramHandler: Send + Sync + 'static {
    fn handle(
        &self,
        sink: &dyn DatagramSink,
        src: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), TransportError>;
}

/// What a periodic task gets to work with on each tick
pub struct TaskContext<'a> {
    pub sink: &'a dyn DatagramSink,
    pub thread_index: usize,
    pub now: Instant,
}

/// Housekeeping run by a transport loop
pub trait PeriodicTask: Send + Sync + 'static {
    fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TransportError>;
}

struct FnTask<F>(F);

impl<F> PeriodicTask for FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> Result<(), TransportError> + Send + Sync + 'static,
{
    fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TransportError> {
        (self.0)(ctx)
    }
}

/// Which worker threads run a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskScope {
    /// Only thread 0. For housekeeping over process-wide state.
    Global,
    /// Every worker thread.
    EveryThread,
}

/// A task with its own schedule. A zero interval runs on every tick.
struct ScheduledTask {
    name: &'static str,
    every: Duration,
    scope: TaskScope,
    next_due: Mutex<Option<Instant>>,
    task: Box<dyn PeriodicTask>,
}

impl ScheduledTask {
    fn poll(&self, ctx: &TaskContext<'_>) {
        if self.scope == TaskScope::Global && ctx.thread_index != 0 {
            return;
        }
        if !self.every.is_zero() {
            let mut due = self.next_due.lock();
            if matches!(*due, Some(at) if ctx.now < at) {
                return;
            }
            *due = Some(ctx.now + self.every);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.task.run(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(task = self.name, "periodic task failed: {}", e),
            Err(panic) => error!(
                task = self.name,
                "periodic task panicked: {}",
                panic_message(panic.as_ref())
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

struct Shared<H> {
    name: String,
    handler: Arc<H>,
    tasks: Vec<ScheduledTask>,
    stop: Arc<AtomicBool>,
}

impl<H: DatagramHandler> Shared<H> {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn dispatch(&self, sink: &dyn DatagramSink, src: SocketAddr, datagram: &[u8]) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(sink, src, datagram))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: datagram from {} failed: {}", self.name, src, e),
            Err(panic) => error!(
                "{}: handler panicked on datagram from {}: {}",
                self.name,
                src,
                panic_message(panic.as_ref())
            ),
        }
    }

    fn tick(&self, sink: &dyn DatagramSink, thread_index: usize) {
        let ctx = TaskContext {
            sink,
            thread_index,
            now: Instant::now(),
        };
        for task in &self.tasks {
            task.poll(&ctx);
        }
    }
}

/// Task list builder shared by both server kinds
struct TaskList(Vec<ScheduledTask>);

impl TaskList {
    fn push<T: PeriodicTask>(&mut self, name: &'static str, every: Duration, scope: TaskScope, task: T) {
        self.0.push(ScheduledTask {
            name,
            every,
            scope,
            next_due: Mutex::new(None),
            task: Box::new(task),
        });
    }
}

/// Errors that a receive loop should ride out instead of recreating the
/// socket (ICMP unreachable reported on the next receive, signals).
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

/// How a server's socket is configured after each bind
#[derive(Clone, Copy)]
enum SocketMode {
    NonBlocking,
    ReadTimeout(Duration),
}

/// The socket a server's workers share, replaced as a whole on fault.
///
/// The generation changes under the lock whenever the socket is taken out,
/// so a worker can tell from one atomic load that its handle is stale.
struct SocketSlot {
    addr: SocketAddr,
    mode: SocketMode,
    generation: AtomicU64,
    current: Mutex<Option<Arc<UdpSocket>>>,
    #[cfg(test)]
    fault: AtomicBool,
}

impl SocketSlot {
    fn bind(addr: SocketAddr, mode: SocketMode) -> io::Result<Self> {
        let socket = open_socket(addr, mode)?;
        Ok(Self {
            addr: socket.local_addr()?,
            mode,
            generation: AtomicU64::new(0),
            current: Mutex::new(Some(Arc::new(socket))),
            #[cfg(test)]
            fault: AtomicBool::new(false),
        })
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current socket with its generation, or `None` once rebinding failed
    fn acquire(&self) -> Option<(u64, Arc<UdpSocket>)> {
        let current = self.current.lock();
        current.as_ref().map(|s| (self.generation(), s.clone()))
    }

    /// Close the socket of generation `failed` and bind a fresh one.
    ///
    /// Callers holding an older generation find the work done already. The
    /// caller must have dropped its own handle first.
    fn reopen(&self, failed: u64) -> io::Result<()> {
        let mut current = self.current.lock();
        if self.generation() != failed {
            return match *current {
                Some(_) => Ok(()),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is gone")),
            };
        }
        current.take();
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut last_error = None;
        for _ in 0..REBIND_ATTEMPTS {
            match open_socket(self.addr, self.mode) {
                Ok(socket) => {
                    *current = Some(Arc::new(socket));
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    thread::sleep(REBIND_BACKOFF);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "rebind failed")))
    }

    /// Rebinds since start
    fn rebinds(&self) -> u64 {
        self.generation()
    }

    #[cfg(test)]
    fn take_fault(&self) -> Option<io::Error> {
        self.fault
            .swap(false, Ordering::SeqCst)
            .then(|| io::Error::new(io::ErrorKind::Other, "injected socket fault"))
    }

    #[cfg(not(test))]
    fn take_fault(&self) -> Option<io::Error> {
        None
    }
}

fn open_socket(addr: SocketAddr, mode: SocketMode) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    match mode {
        SocketMode::NonBlocking => socket.set_nonblocking(true)?,
        SocketMode::ReadTimeout(timeout) => socket.set_read_timeout(Some(timeout))?,
    }
    Ok(socket)
}

/// Multi-threaded non-blocking poll loop
pub struct PollServer<H> {
    name: String,
    bind: SocketAddr,
    threads: usize,
    handler: Arc<H>,
    tasks: TaskList,
}

impl<H: DatagramHandler> PollServer<H> {
    pub fn new(name: impl Into<String>, bind: SocketAddr, handler: Arc<H>) -> Self {
        Self {
            name: name.into(),
            bind,
            threads: 1,
            handler,
            tasks: TaskList(Vec::new()),
        }
    }

    /// Number of worker threads sharing the port (at least one)
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Register a periodic task
    pub fn with_task<T: PeriodicTask>(
        mut self,
        name: &'static str,
        every: Duration,
        scope: TaskScope,
        task: T,
    ) -> Self {
        self.tasks.push(name, every, scope, task);
        self
    }

    /// Register a closure as a periodic task
    pub fn with_fn_task<F>(self, name: &'static str, every: Duration, scope: TaskScope, f: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        self.with_task(name, every, scope, FnTask(f))
    }

    /// Bind the port and spawn the workers
    pub fn start(self) -> io::Result<ServerHandle> {
        let slot = Arc::new(SocketSlot::bind(self.bind, SocketMode::NonBlocking)?);
        let local_addr = slot.addr;

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            name: self.name.clone(),
            handler: self.handler,
            tasks: self.tasks.0,
            stop: stop.clone(),
        });

        let mut handle = ServerHandle {
            name: self.name.clone(),
            local_addr,
            stop,
            slot: slot.clone(),
            threads: Vec::with_capacity(self.threads),
        };
        for index in 0..self.threads {
            let shared = shared.clone();
            let slot = slot.clone();
            let thread = thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || poll_worker(shared, slot, index))?;
            handle.threads.push(thread);
        }

        info!(
            "{} listening on {} ({} threads)",
            self.name, local_addr, self.threads
        );
        Ok(handle)
    }
}

fn poll_worker<H: DatagramHandler>(shared: Arc<Shared<H>>, slot: Arc<SocketSlot>, index: usize) {
    debug!("{} worker {} started", shared.name, index);
    while !shared.stopped() {
        let Some((generation, socket)) = slot.acquire() else {
            error!("{} worker {}: socket unavailable, stopping", shared.name, index);
            return;
        };

        if let Err(e) = poll_spin(&shared, &slot, &socket, generation, index) {
            drop(socket);
            warn!(
                "{} worker {}: socket fault, rebinding {}: {}",
                shared.name, index, slot.addr, e
            );
            if let Err(e) = slot.reopen(generation) {
                error!(
                    "{} worker {}: cannot bind {}: {}",
                    shared.name, index, slot.addr, e
                );
                return;
            }
        }
    }
    debug!("{} worker {} stopped", shared.name, index);
}

/// Serve `socket` until stopped, until another worker replaced it, or until
/// it faults.
fn poll_spin<H: DatagramHandler>(
    shared: &Shared<H>,
    slot: &SocketSlot,
    socket: &UdpSocket,
    generation: u64,
    index: usize,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shared.stopped() && slot.generation() == generation {
        shared.tick(socket, index);

        if let Some(e) = slot.take_fault() {
            return Err(e);
        }
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => shared.dispatch(socket, src, &buf[..len]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(IDLE_SLEEP),
            Err(e) if is_transient(&e) => trace!("{}: transient receive error: {}", shared.name, e),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Single-threaded blocking receive loop
pub struct BlockingServer<H> {
    name: String,
    bind: SocketAddr,
    handler: Arc<H>,
    tasks: TaskList,
}

impl<H: DatagramHandler> BlockingServer<H> {
    pub fn new(name: impl Into<String>, bind: SocketAddr, handler: Arc<H>) -> Self {
        Self {
            name: name.into(),
            bind,
            handler,
            tasks: TaskList(Vec::new()),
        }
    }

    /// Register a task, run after each received datagram once due
    pub fn with_task<T: PeriodicTask>(mut self, name: &'static str, every: Duration, task: T) -> Self {
        self.tasks.push(name, every, TaskScope::Global, task);
        self
    }

    /// Register a closure as a periodic task
    pub fn with_fn_task<F>(self, name: &'static str, every: Duration, f: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        self.with_task(name, every, FnTask(f))
    }

    /// Bind the port and spawn the receive thread
    pub fn start(self) -> io::Result<ServerHandle> {
        let slot = Arc::new(SocketSlot::bind(
            self.bind,
            SocketMode::ReadTimeout(BLOCKING_RECV_TIMEOUT),
        )?);
        let local_addr = slot.addr;

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            name: self.name.clone(),
            handler: self.handler,
            tasks: self.tasks.0,
            stop: stop.clone(),
        });

        let worker_slot = slot.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || blocking_worker(shared, worker_slot))?;

        info!("{} listening on {}", self.name, local_addr);
        Ok(ServerHandle {
            name: self.name,
            local_addr,
            stop,
            slot,
            threads: vec![thread],
        })
    }
}

fn blocking_worker<H: DatagramHandler>(shared: Arc<Shared<H>>, slot: Arc<SocketSlot>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shared.stopped() {
        let Some((generation, socket)) = slot.acquire() else {
            error!("{}: socket unavailable, stopping", shared.name);
            return;
        };

        let received = match slot.take_fault() {
            Some(e) => Err(e),
            None => socket.recv_from(&mut buf),
        };
        match received {
            Ok((len, src)) => {
                shared.dispatch(socket.as_ref(), src, &buf[..len]);
                shared.tick(socket.as_ref(), 0);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_transient(&e) => {}
            Err(e) => {
                drop(socket);
                warn!("{}: socket fault, rebinding {}: {}", shared.name, slot.addr, e);
                if let Err(e) = slot.reopen(generation) {
                    error!("{}: cannot bind {}: {}", shared.name, slot.addr, e);
                    return;
                }
            }
        }
    }
    debug!("{} stopped", shared.name);
}

/// Running transport loop. Dropping the handle stops and joins it.
pub struct ServerHandle {
    name: String,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    slot: Arc<SocketSlot>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Times the socket was replaced after a fault
    pub fn rebinds(&self) -> u64 {
        self.slot.rebinds()
    }

    /// Ask the workers to stop at their next spin, without waiting
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop and join all workers
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.request_stop();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("{}: worker thread panicked", self.name);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct Echo {
        fail_first: AtomicBool,
    }

    impl DatagramHandler for Echo {
        fn handle(
            &self,
            sink: &dyn DatagramSink,
            src: SocketAddr,
            datagram: &[u8],
        ) -> Result<(), TransportError> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(TransportError::Task {
                    task: "echo",
                    reason: "first datagram rejected".into(),
                });
            }
            sink.send_to(datagram, src)?;
            Ok(())
        }
    }

    fn echo(fail_first: bool) -> Arc<Echo> {
        Arc::new(Echo {
            fail_first: AtomicBool::new(fail_first),
        })
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn client() -> UdpSocket {
        let socket = UdpSocket::bind(loopback()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    #[test]
    fn test_poll_server_echo() {
        let server = PollServer::new("echo", loopback(), echo(false))
            .threads(2)
            .start()
            .unwrap();
        let client = client();

        client.send_to(b"hello", server.local_addr()).unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, server.local_addr());

        server.shutdown();
    }

    #[test]
    fn test_handler_error_does_not_stop_loop() {
        let server = PollServer::new("echo", loopback(), echo(true))
            .start()
            .unwrap();
        let client = client();

        client.send_to(b"dropped", server.local_addr()).unwrap();
        client.send_to(b"answered", server.local_addr()).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"answered");
    }

    #[test]
    fn test_task_scopes() {
        let global = Arc::new(Mutex::new(HashSet::new()));
        let every = Arc::new(Mutex::new(HashSet::new()));

        let g = global.clone();
        let e = every.clone();
        let server = PollServer::new("tasks", loopback(), echo(false))
            .threads(3)
            .with_fn_task("global", Duration::ZERO, TaskScope::Global, move |ctx| {
                g.lock().insert(ctx.thread_index);
                Ok(())
            })
            .with_fn_task("every", Duration::ZERO, TaskScope::EveryThread, move |ctx| {
                e.lock().insert(ctx.thread_index);
                Ok(())
            })
            .start()
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        server.shutdown();

        assert_eq!(*global.lock(), HashSet::from([0]));
        assert_eq!(*every.lock(), HashSet::from([0, 1, 2]));
    }

    #[test]
    fn test_task_interval_and_failure() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let server = PollServer::new("interval", loopback(), echo(false))
            .with_fn_task("hourly", Duration::from_secs(3600), TaskScope::Global, move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Task {
                    task: "hourly",
                    reason: "always fails".into(),
                })
            })
            .start()
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        server.shutdown();

        // Ran immediately, then waits for its next due time
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_server_runs_tasks_per_receive() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let server = BlockingServer::new("blocking", loopback(), echo(false))
            .with_fn_task("count", Duration::ZERO, move |ctx| {
                assert_eq!(ctx.thread_index, 0);
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .start()
            .unwrap();

        // Idle: no receive, no task run
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let client = client();
        let mut buf = [0u8; 64];
        for i in 0..3u8 {
            client.send_to(&[i], server.local_addr()).unwrap();
            let (len, _) = client.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], &[i]);
        }

        server.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_stops_workers() {
        let server = PollServer::new("drop", loopback(), echo(false))
            .threads(2)
            .start()
            .unwrap();
        let addr = server.local_addr();
        drop(server);

        // Port is free again once every worker released the shared socket
        let rebound = UdpSocket::bind(addr);
        assert!(rebound.is_ok());
    }

    struct PanicOnce {
        armed: AtomicBool,
    }

    impl DatagramHandler for PanicOnce {
        fn handle(
            &self,
            sink: &dyn DatagramSink,
            src: SocketAddr,
            datagram: &[u8],
        ) -> Result<(), TransportError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("handler blew up");
            }
            sink.send_to(datagram, src)?;
            Ok(())
        }
    }

    fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    /// Send until an echo comes back; datagrams racing a rebind may be lost
    fn echoes(client: &UdpSocket, to: SocketAddr, payload: &[u8]) -> bool {
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 64];
        for _ in 0..10 {
            client.send_to(payload, to).unwrap();
            if let Ok((len, _)) = client.recv_from(&mut buf) {
                if &buf[..len] == payload {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_handler_panic_does_not_stop_loop() {
        let server = PollServer::new(
            "panicky",
            loopback(),
            Arc::new(PanicOnce {
                armed: AtomicBool::new(true),
            }),
        )
        .start()
        .unwrap();
        let client = client();

        client.send_to(b"boom", server.local_addr()).unwrap();
        assert!(echoes(&client, server.local_addr(), b"still here"));
        server.shutdown();
    }

    #[test]
    fn test_task_panic_does_not_stop_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let server = PollServer::new("panicky-task", loopback(), echo(false))
            .with_fn_task("explodes", Duration::from_millis(10), TaskScope::Global, move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                panic!("task blew up");
            })
            .start()
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) > 3));
        let client = client();
        assert!(echoes(&client, server.local_addr(), b"alive"));
        server.shutdown();
    }

    #[test]
    fn test_poll_fault_rebinds_same_address() {
        let server = PollServer::new("faulty", loopback(), echo(false))
            .threads(2)
            .start()
            .unwrap();
        let addr = server.local_addr();
        let client = client();
        assert!(echoes(&client, addr, b"before"));
        let (old_generation, old_socket) = server.slot.acquire().unwrap();
        drop(old_socket);

        server.slot.fault.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || server.rebinds() == 1));

        let (generation, socket) = server.slot.acquire().unwrap();
        assert_ne!(generation, old_generation);
        assert_eq!(socket.local_addr().unwrap(), addr);
        drop(socket);
        assert!(echoes(&client, addr, b"after"));
        server.shutdown();
    }

    #[test]
    fn test_blocking_fault_rebinds_same_address() {
        let server = BlockingServer::new("faulty-blocking", loopback(), echo(false))
            .start()
            .unwrap();
        let addr = server.local_addr();
        let client = client();

        server.slot.fault.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || server.rebinds() == 1));
        assert!(echoes(&client, addr, b"after"));
        server.shutdown();
    }

    #[test]
    fn test_failed_rebind_ends_workers() {
        let server = PollServer::new("stuck", loopback(), echo(false))
            .threads(2)
            .start()
            .unwrap();

        // Keeping the old socket open keeps its port taken
        let (_, held) = server.slot.acquire().unwrap();
        server.slot.fault.store(true, Ordering::SeqCst);

        assert!(wait_until(Duration::from_secs(3), || server
            .threads
            .iter()
            .all(|t| t.is_finished())));
        assert!(server.slot.acquire().is_none());
        drop(held);
        server.shutdown();
    }

    #[test]
    fn test_reopen_is_done_once_per_generation() {
        let slot = SocketSlot::bind(loopback(), SocketMode::NonBlocking).unwrap();
        let (generation, socket) = slot.acquire().unwrap();
        drop(socket);

        slot.reopen(generation).unwrap();
        // A second worker reporting the same fault finds the new socket
        slot.reopen(generation).unwrap();
        assert_eq!(slot.rebinds(), 1);
        assert_eq!(slot.acquire().unwrap().1.local_addr().unwrap(), slot.addr);
    }
}
