#![allow(unsafe_code)]
//! Process topology bootstrap.
//!
//! This module uses unsafe code for `fork(2)` via libc.
//!
//! ```text
//! Server::run
//!   ├── bind TCP listener            (ErrorKind::Bind)
//!   ├── bind connector, chmod 0777   (ErrorKind::Connector, optional)
//!   └── for each worker i:
//!         socketpair ─ fork ─┬─ child:  keep listener + link i, run Worker
//!                            └─ parent: keep master end of link i
//!       parent: drop listener, run Master
//! ```
//!
//! Forking happens before any scheduler or thread exists, so each process
//! starts its own single-threaded event loop from a clean state.

use super::handler::Handler;
use super::master::{Master, Topology, WorkerLink};
use super::worker::Worker;
use crate::config::ServerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::net::{Listener, Stream};
use std::convert::Infallible;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::info;

/// Permissions of the connector socket file: any local user may inject.
const CONNECTOR_MODE: u32 = 0o777;

/// Pre-forking server entry point.
#[derive(Debug, Clone)]
pub struct Server {
    config: ServerConfig,
}

impl Server {
    /// Server with `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// The configuration this server runs with.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds, forks the workers, and runs the master in the calling process.
    ///
    /// `handler_factory` is called once in each worker, with the worker index,
    /// after the fork. Neither the master nor any worker returns unless its
    /// poller fails.
    pub fn run<H, F>(self, mut handler_factory: F) -> Result<Infallible>
    where
        H: Handler + 'static,
        F: FnMut(usize) -> H,
    {
        let config = self.config;
        config.validate()?;

        let addr = config.bind_addr();
        let listener = Listener::bind_tcp(&addr).map_err(|e| Error::bind(&addr, e))?;
        info!(addr = %addr, workers = config.workers, "listening");

        let connector = config
            .connector
            .as_deref()
            .map(bind_connector)
            .transpose()?;

        let mut links = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (master_end, worker_end) = UnixStream::pair().map_err(|e| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("cannot create link for worker {index}"))
                    .with_source(e)
            })?;
            match fork_process().map_err(|e| Error::fork(index, e))? {
                Fork::Child => {
                    // Only the listener and this worker's link survive in the child.
                    drop(links);
                    drop(connector);
                    drop(master_end);
                    let handler = handler_factory(index);
                    let worker = Worker::new(
                        index,
                        listener,
                        Stream::from(worker_end),
                        handler,
                        config.connection,
                    )?;
                    return worker.run();
                }
                Fork::Parent(pid) => {
                    info!(worker = index, pid, "worker started");
                    drop(worker_end);
                    links.push(WorkerLink::new(index, master_end));
                }
            }
        }

        drop(listener);
        let topology = Topology {
            workers: links,
            connector,
        };
        Master::new(topology, config.connection)?.run()
    }
}

fn bind_connector(path: &Path) -> Result<Listener> {
    let connector_error = |e: io::Error| {
        Error::new(ErrorKind::Connector)
            .with_message(format!("connector {}", path.display()))
            .with_source(e)
    };
    let listener = Listener::bind_unix(path).map_err(connector_error)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(CONNECTOR_MODE))
        .map_err(connector_error)?;
    info!(path = %path.display(), "connector listening");
    Ok(listener)
}

enum Fork {
    Parent(libc::pid_t),
    Child,
}

fn fork_process() -> io::Result<Fork> {
    // SAFETY: fork has no memory-safety preconditions of its own. It runs
    // before any thread is spawned, so the child's copy of the address space
    // holds no lock owned by a thread that does not exist there.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}
