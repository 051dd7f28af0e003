//! TCP accept loop feeding the connection manager.
//!
//! Wraps each inbound socket in a [`Transport`] with an empty manager slot
//! and submits it to [`ConnectionManager::connection_started`]. Admitted
//! transports are handed to the server's request path; dropped ones are
//! destroyed on the spot, which sends the peer its teardown.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::connmgr::{Admission, ConnectionManager};
use crate::error::{Result, TransportError};
use crate::xprt::Transport;

/// Receives transports admitted by the connection manager.
pub type AdmittedHandler = dyn Fn(Arc<Transport>) + Send + Sync;

struct Running {
    listener: TcpListener,
    running: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Accept loop binding inbound sockets to the connection manager.
pub struct Acceptor {
    manager: Arc<ConnectionManager>,
    handler: Arc<AdmittedHandler>,
    state: Mutex<Option<Running>>,
}

impl Acceptor {
    /// Creates an acceptor that passes admitted transports to `handler`.
    pub fn new(manager: Arc<ConnectionManager>, handler: Arc<AdmittedHandler>) -> Self {
        Self {
            manager,
            handler,
            state: Mutex::new(None),
        }
    }

    /// Binds the given address and spawns the accept thread. Returns the
    /// bound address; starting twice is refused.
    pub fn start(&self, bind: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = TcpListener::bind(bind)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let thread_listener = listener.try_clone()?;
        let thread_manager = Arc::clone(&self.manager);
        let thread_handler = Arc::clone(&self.handler);
        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("transport-accept".to_string())
            .spawn(move || {
                accept_loop(thread_listener, thread_manager, thread_handler, thread_running)
            })?;

        debug!(addr = %local_addr, "acceptor started");
        *state = Some(Running {
            listener,
            running,
            thread,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Shuts the listening socket down and joins the accept thread.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(running) = state.take() {
            running.running.store(false, Ordering::SeqCst);
            unsafe {
                libc::shutdown(running.listener.as_raw_fd(), libc::SHUT_RDWR);
            }
            if running.thread.join().is_err() {
                warn!("acceptor thread panicked");
            }
            debug!(addr = %running.local_addr, "acceptor stopped");
        }
    }

    /// Address the acceptor is currently bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|r| r.local_addr)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    handler: Arc<AdmittedHandler>,
    running: Arc<AtomicBool>,
) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %err, "failed to accept connection");
                continue;
            }
        };
        let transport = match Transport::from_stream(stream) {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                warn!(error = %err, "failed to wrap inbound socket");
                continue;
            }
        };
        match manager.connection_started(&transport) {
            Admission::Allow => handler(transport),
            Admission::Drop => {
                warn!(peer = %transport.peer_addr(), "dropping connection after failed admission");
                transport.destroy();
            }
        }
    }
}
