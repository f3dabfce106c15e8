//! The listener/worker fabric: a listening socket on the calling thread and
//! a fixed pool of worker threads, each round-robin-fed connections over a
//! pipe.
//!
//! **Why the listener can park directly.** `corort`'s data model reserves
//! slot 0 (the root coroutine) for a thread's bootstrap execution and never
//! retires it, but nothing in the built runtime stops slot 0 from *parking*
//! — `wait_read`/`wait_write` simply move whichever slot is current out of
//! the ring and into the parked set, and `pick_next` blocks in the reactor
//! once the ring is empty regardless of which slot vacated it. This crate
//! leans on that: the main thread's root IS the listener (no separate
//! listener coroutine is spawned), and each worker thread's root IS its own
//! pipe reader. The alternative — spawning a dedicated coroutine for each
//! and leaving root to busy-poll a non-blocking `yield_now` forever — would
//! burn a core per thread for no reason, since root has nothing else to do
//! on either thread. A genuine extra coroutine only gets spawned for actual
//! concurrent work: the shutdown watcher (parked on the self-pipe alongside
//! the listener, so one poll covers both) and each connection's serving
//! coroutine (parked alongside every other live connection on a worker).

use std::cell::Cell;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::thread::JoinHandle;

use crate::shutdown;

/// The function every accepted connection is served by. Takes ownership of
/// the [`Client`]; the dispatcher closes the underlying descriptor once this
/// returns, regardless of how it returns.
pub type ServeFn = fn(Client);

/// Construction-time parameters for a [`Server`]'s worker pool.
#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    pub thread_count: usize,
    pub backlog: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig { thread_count: detect_thread_count(), backlog: 128 }
    }
}

fn detect_thread_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(256)
}

/// An accepted connection, as handed to a [`ServeFn`].
///
/// `Client` is a plain descriptor, not an owning handle — the same value is
/// returned to `Server::accept`'s caller (for logging/diagnostics) and
/// reconstructed on the worker that ultimately serves it. Whichever serving
/// coroutine's trampoline finishes last closes the fd; `Client` itself never
/// does, so copying it around before that point is harmless.
#[derive(Clone, Copy, Debug)]
pub struct Client {
    fd: RawFd,
    remote: SocketAddrV4,
}

impl Client {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    /// Read into `buf`, parking on readability as needed. Mirrors
    /// `corort::wait_read` + a non-blocking `read(2)`, the same idiom every
    /// suspension point in this crate uses.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                corort::wait_read(self.fd);
                continue;
            }
            return Err(err);
        }
    }

    /// Write `buf` in full, parking on writability as needed.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let rc = unsafe {
                libc::write(self.fd, buf[written..].as_ptr() as *const libc::c_void, buf.len() - written)
            };
            if rc >= 0 {
                written += rc as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                corort::wait_write(self.fd);
                continue;
            }
            return Err(err);
        }
        Ok(written)
    }

    #[cfg(test)]
    pub(crate) fn for_test(fd: RawFd, ip: Ipv4Addr, port: u16) -> Self {
        Client { fd, remote: SocketAddrV4::new(ip, port) }
    }
}

/// What `Server::accept` returns.
pub enum AcceptStatus {
    Error(io::Error),
    ShutdownRequested,
    Connected(Client),
}

/// The fixed-size record handed from the listener to a worker over a pipe.
/// `#[repr(C)]` because it crosses the pipe as raw bytes, and is also
/// round-tripped through `corort::Runtime::spawn`'s payload-copy mechanism.
#[repr(C)]
#[derive(Clone, Copy)]
struct Handoff {
    client_fd: RawFd,
    remote_ip: [u8; 4],
    remote_port: u16,
    serve: ServeFn,
}

impl Handoff {
    fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts((self as *const Self) as *const u8, std::mem::size_of::<Self>()) }
    }

    fn client(&self) -> Client {
        Client {
            fd: self.client_fd,
            remote: SocketAddrV4::new(Ipv4Addr::from(self.remote_ip), self.remote_port),
        }
    }
}

struct WorkerHandle {
    pipe_write: RawFd,
    thread: Option<JoinHandle<()>>,
}

/// A bound listening socket plus its fixed pool of worker threads.
pub struct Server {
    listen_fd: RawFd,
    workers: Vec<WorkerHandle>,
    next: Cell<usize>,
    notify_read: RawFd,
    notify_write: RawFd,
    watcher_spawned: Cell<bool>,
}

impl Server {
    /// Bind a non-blocking IPv4 listening socket on `host`:`port`
    /// (`host = None` binds `INADDR_ANY`) and start `config.thread_count`
    /// worker threads, each with its own pipe and `corort::Runtime`.
    pub fn bind(host: Option<IpAddr>, port: u16, backlog: i32) -> io::Result<Server> {
        Server::bind_with(host, port, DispatcherConfig { backlog, ..DispatcherConfig::default() })
    }

    pub fn bind_with(host: Option<IpAddr>, port: u16, config: DispatcherConfig) -> io::Result<Server> {
        let listen_fd = create_listener(host, port, config.backlog)?;

        let (notify_read, notify_write) = create_nonblocking_pipe()?;
        unsafe {
            shutdown::init(libc::pthread_self(), notify_write);
        }

        let mut workers = Vec::with_capacity(config.thread_count);
        for index in 0..config.thread_count {
            let (pipe_read, pipe_write) = create_nonblocking_pipe()?;
            let thread = std::thread::Builder::new()
                .name(format!("corort-worker-{index}"))
                .spawn(move || worker_main(pipe_read))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            workers.push(WorkerHandle { pipe_write, thread: Some(thread) });
        }

        log::info!("corort-net: listening with {} worker thread(s)", workers.len());
        Ok(Server { listen_fd, workers, next: Cell::new(0), notify_read, notify_write, watcher_spawned: Cell::new(false) })
    }

    /// Accept one connection and hand it to the next worker in round-robin
    /// order. Parks on the listening socket's readiness (and, the first
    /// time this is called, spawns the shutdown watcher alongside it — see
    /// the module docs) until a connection arrives, `shutdown_requested()`
    /// becomes true, or `accept(2)` fails for a reason other than "try
    /// again".
    pub fn accept(&self, serve: ServeFn) -> AcceptStatus {
        self.ensure_watcher_spawned();

        loop {
            if shutdown::shutdown_requested() {
                return AcceptStatus::ShutdownRequested;
            }

            corort::wait_read(self.listen_fd);

            if shutdown::shutdown_requested() {
                return AcceptStatus::ShutdownRequested;
            }

            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let client_fd = unsafe {
                libc::accept(self.listen_fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut addr_len)
            };
            if client_fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                return AcceptStatus::Error(err);
            }

            if let Err(err) = set_nonblocking(client_fd) {
                unsafe { libc::close(client_fd) };
                return AcceptStatus::Error(err);
            }

            let handoff = Handoff {
                client_fd,
                remote_ip: Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)).octets(),
                remote_port: u16::from_be(addr.sin_port),
                serve,
            };
            if let Err(err) = self.dispatch(&handoff) {
                log::warn!("failed to hand connection off to a worker: {err}");
                unsafe { libc::close(client_fd) };
                return AcceptStatus::Error(err);
            }

            return AcceptStatus::Connected(handoff.client());
        }
    }

    /// The address actually bound — useful when `port` was 0 and the kernel
    /// picked one.
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.listen_fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SocketAddrV4::new(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)), u16::from_be(addr.sin_port)))
    }

    fn dispatch(&self, handoff: &Handoff) -> io::Result<()> {
        let index = self.next.get();
        self.next.set((index + 1) % self.workers.len());
        write_full(self.workers[index].pipe_write, handoff.as_bytes())
    }

    fn ensure_watcher_spawned(&self) {
        if self.watcher_spawned.get() {
            return;
        }
        self.watcher_spawned.set(true);
        let notify_read = self.notify_read;
        let payload = notify_read.to_ne_bytes();
        if corort::Runtime::spawn(shutdown_watcher, &payload, None).is_none() {
            log::warn!("failed to spawn the shutdown watcher coroutine; shutdown will only be noticed between accepts");
        }
    }

    /// Signal every worker to drain, join their threads, then tear down the
    /// listening socket and the self-pipe. Each worker independently calls
    /// `Runtime::destroy_all` on its *own* runtime from within its own thread
    /// (in `worker_main`); this only destroys the main thread's.
    pub fn close(mut self) -> io::Result<()> {
        for worker in &mut self.workers {
            unsafe { libc::close(worker.pipe_write) };
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }

        corort::Runtime::destroy_all();

        unsafe {
            libc::close(self.listen_fd);
            libc::close(self.notify_read);
            libc::close(self.notify_write);
        }
        Ok(())
    }
}

/// Parked on the main thread alongside the listening socket. Wakes root once
/// the self-pipe has data (written by `request_shutdown` from any thread, or
/// by the `SIGUSR1` handler) and retires; a fresh shutdown after this point
/// is already visible through the `shutdown_requested()` check `accept`
/// performs on every iteration, so one watcher per `Server` is enough.
unsafe extern "C" fn shutdown_watcher(payload: *mut u8) {
    let notify_read = RawFd::from_ne_bytes(unsafe { *(payload as *const [u8; 4]) });
    corort::wait_read(notify_read);
    let mut drain = [0u8; 64];
    while unsafe { libc::read(notify_read, drain.as_mut_ptr() as *mut libc::c_void, drain.len()) } > 0 {}
    corort::wake_up(corort::SlotId::ROOT);
}

fn worker_main(pipe_read: RawFd) {
    loop {
        corort::wait_read(pipe_read);
        match read_handoff(pipe_read) {
            Some(handoff) => {
                if corort::Runtime::spawn(serve_trampoline, handoff.as_bytes(), None).is_none() {
                    log::warn!("worker dropped a connection: coroutine table is full");
                    unsafe { libc::close(handoff.client_fd) };
                }
            }
            None => {
                log::debug!("worker pipe closed, draining and exiting");
                break;
            }
        }
    }
    corort::Runtime::destroy_all();
}

unsafe extern "C" fn serve_trampoline(payload: *mut u8) {
    let handoff = unsafe { *(payload as *const Handoff) };
    let client = handoff.client();
    (handoff.serve)(client);
    unsafe {
        libc::close(client.fd());
    }
}

fn read_handoff(fd: RawFd) -> Option<Handoff> {
    let mut buf = [0u8; std::mem::size_of::<Handoff>()];
    let mut filled = 0;
    while filled < buf.len() {
        let rc = unsafe {
            libc::read(fd, buf[filled..].as_mut_ptr() as *mut libc::c_void, buf.len() - filled)
        };
        if rc == 0 {
            return None;
        }
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                corort::wait_read(fd);
                continue;
            }
            log::warn!("worker pipe read failed: {err}");
            return None;
        }
        filled += rc as usize;
    }
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Handoff) })
}

fn write_full(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let rc = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                corort::wait_write(fd);
                continue;
            }
            return Err(err);
        }
        bytes = &bytes[rc as usize..];
    }
    Ok(())
}

fn create_listener(host: Option<IpAddr>, port: u16, backlog: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let reuse: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of_val(&reuse) as libc::socklen_t,
        );
    }

    let ip = match host {
        Some(IpAddr::V4(v4)) => v4,
        Some(IpAddr::V6(_)) => {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "corort-net only binds IPv4"));
        }
        None => Ipv4Addr::UNSPECIFIED,
    };

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(ip.octets()) },
        sin_zero: [0; 8],
    };

    let bind_rc = unsafe {
        libc::bind(fd, &addr as *const _ as *const libc::sockaddr, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
    };
    if bind_rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if unsafe { libc::listen(fd, backlog) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    set_nonblocking(fd)?;
    Ok(fd)
}

fn create_nonblocking_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    Ok((fds[0], fds[1]))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // Server::bind installs a process-wide SIGUSR1 handler and writes into
    // process-wide shutdown statics, so only one test may drive a live
    // Server at a time.
    static SERVER_TEST_LOCK: Mutex<()> = Mutex::new(());

    static ECHO_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn echo_once(client: Client) {
        let mut buf = [0u8; 64];
        if let Ok(n) = client.read(&mut buf) {
            let _ = client.write(&buf[..n]);
        }
        ECHO_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn accept_dispatches_a_connection_and_it_gets_served() {
        let _guard = SERVER_TEST_LOCK.lock().unwrap();
        shutdown::reset();
        ECHO_COUNT.store(0, Ordering::SeqCst);

        let server = Server::bind_with(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0,
            DispatcherConfig { thread_count: 2, backlog: 16 },
        )
        .expect("bind");

        let port = local_port(server.listen_fd);
        let client_thread = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
            stream.write_all(b"ping\n").unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });

        match server.accept(echo_once) {
            AcceptStatus::Connected(client) => {
                assert_eq!(client.remote_addr().ip(), &Ipv4Addr::LOCALHOST);
            }
            AcceptStatus::ShutdownRequested => panic!("unexpected shutdown"),
            AcceptStatus::Error(e) => panic!("accept failed: {e}"),
        }

        let echoed = client_thread.join().expect("client thread");
        assert_eq!(&echoed, b"ping\n");

        server.close().expect("close");
    }

    #[test]
    fn shutdown_request_is_observed_by_accept() {
        let _guard = SERVER_TEST_LOCK.lock().unwrap();
        shutdown::reset();

        let server = Server::bind_with(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0,
            DispatcherConfig { thread_count: 1, backlog: 16 },
        )
        .expect("bind");

        let client = Client::for_test(-1, Ipv4Addr::LOCALHOST, 0);
        shutdown::request_shutdown(&client);

        match server.accept(echo_once) {
            AcceptStatus::ShutdownRequested => {}
            _ => panic!("expected shutdown status"),
        }

        server.close().expect("close");
    }

    fn local_port(fd: RawFd) -> u16 {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
        assert_eq!(rc, 0);
        u16::from_be(addr.sin_port)
    }
}
