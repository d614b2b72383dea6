//! Server module.

use std::io::{self, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

/// Accept loop that stops on Ctrl-C or when told to.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // wake up the blocking accept.
        let _ = TcpStream::connect(self.local_addr);
    }
}

impl Server {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            local_addr: self.local_addr,
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Shut down on SIGINT/SIGTERM.
    pub fn shutdown_on_signal(&self) -> Result<()> {
        let handle = self.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("ctrlc handle ...");
            handle.shutdown();
        })
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    /// Hand every accepted connection to `f` until shut down.
    pub fn running<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(TcpStream),
    {
        info!("listening on {}", self.local_addr);

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Server shutting down...");
                break;
            }

            match stream {
                Ok(stream) => f(stream),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => error!("failed to accept connection: {}", e),
            }
        }

        Ok(())
    }
}
