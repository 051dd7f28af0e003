//! HTTP scrape endpoint for the metric registry.
//!
//! One listening socket, one acceptor thread. The request path and headers
//! are ignored; every GET (or anything else) receives a minimal status line
//! followed by the serialised registry contents, then the connection is
//! closed. Stopping shuts the listening socket down to wake the thread and
//! joins it.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::error::{MonitoringError, Result};
use crate::registry::Registry;
use crate::text;

/// One pending scraper is the expected load; keep the queue tiny.
const LISTEN_BACKLOG: i32 = 3;

struct Running {
    listener: TcpListener,
    running: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Serves Prometheus text format over HTTP for one [`Registry`].
pub struct Exposer {
    registry: Arc<Registry>,
    state: Mutex<Option<Running>>,
}

impl Exposer {
    /// Creates an exposer for the given registry. Nothing is bound until
    /// [`Exposer::start`] is called.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            state: Mutex::new(None),
        }
    }

    /// Binds `0.0.0.0:port` and spawns the acceptor thread.
    ///
    /// Returns the bound address, which carries the actual port when `port`
    /// is zero. Starting an already-running exposer is refused.
    pub fn start(&self, port: u16) -> Result<SocketAddr> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(MonitoringError::AlreadyRunning);
        }

        // std binds with SO_REUSEADDR already set; re-listen to shrink the
        // default backlog.
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        if unsafe { libc::listen(listener.as_raw_fd(), LISTEN_BACKLOG) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let thread_listener = listener.try_clone()?;
        let thread_registry = Arc::clone(&self.registry);
        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("metrics-exposer".to_string())
            .spawn(move || serve_loop(thread_listener, thread_registry, thread_running))?;

        debug!(addr = %local_addr, "metrics exposer started");
        *state = Some(Running {
            listener,
            running,
            thread,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Shuts the listening socket down and joins the acceptor thread.
    /// A stopped (or never-started) exposer is left unchanged.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(running) = state.take() {
            running.running.store(false, Ordering::SeqCst);
            // Wakes the thread out of accept(); std exposes no shutdown on
            // listeners.
            unsafe {
                libc::shutdown(running.listener.as_raw_fd(), libc::SHUT_RDWR);
            }
            if running.thread.join().is_err() {
                warn!("metrics exposer thread panicked");
            }
            debug!(addr = %running.local_addr, "metrics exposer stopped");
        }
    }

    /// Address the exposer is currently bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|r| r.local_addr)
    }
}

impl Drop for Exposer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: TcpListener, registry: Arc<Registry>, running: Arc<AtomicBool>) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %err, "metrics exposer failed to accept connection");
                continue;
            }
        };
        serve_one(stream, &registry);
    }
}

fn serve_one(mut stream: TcpStream, registry: &Registry) {
    // Drain and discard whatever request came in; the response is the same
    // for every path.
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request);

    let body = text::render(&registry.collect());
    if let Err(err) = stream
        .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
        .and_then(|_| stream.write_all(body.as_bytes()))
    {
        warn!(error = %err, "could not send metrics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn scrape(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_start_scrape_stop() {
        let registry = Arc::new(Registry::new());
        let counter = registry
            .register_counter("scraped_total", "Scrapes.", &[])
            .unwrap();
        counter.add(7);

        let exposer = Exposer::new(Arc::clone(&registry));
        let addr = exposer.start(0).unwrap();
        let local = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        let response = scrape(local);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n\r\n"));
        assert!(response.contains("scraped_total 7"));

        exposer.stop();
        assert!(exposer.local_addr().is_none());
    }

    #[test]
    fn test_double_start_refused() {
        let registry = Arc::new(Registry::new());
        let exposer = Exposer::new(registry);
        exposer.start(0).unwrap();
        assert!(matches!(
            exposer.start(0),
            Err(MonitoringError::AlreadyRunning)
        ));
        exposer.stop();
    }

    #[test]
    fn test_restart_after_stop() {
        let registry = Arc::new(Registry::new());
        let exposer = Exposer::new(registry);
        exposer.start(0).unwrap();
        exposer.stop();
        let addr = exposer.start(0).unwrap();
        assert!(addr.port() != 0);
        exposer.stop();
    }

    #[test]
    fn test_each_request_gets_fresh_snapshot() {
        let registry = Arc::new(Registry::new());
        let counter = registry
            .register_counter("fresh_total", "Fresh.", &[])
            .unwrap();
        let exposer = Exposer::new(Arc::clone(&registry));
        let addr = exposer.start(0).unwrap();
        let local = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        counter.inc();
        assert!(scrape(local).contains("fresh_total 1"));
        counter.inc();
        assert!(scrape(local).contains("fresh_total 2"));

        exposer.stop();
    }
}
