// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The master process: owns the listening socket, forks workers, and dispatches accepted
//! connections to them round-robin over [`crate::ipc`] channels.

use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn,
};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::ipc::IpcChannel;
use crate::stats::{SharedStats, StatsMonitor};
use crate::worker;

/// Listen backlog. The contract requires at least 128; this is also what `listen(2)` callers
/// conventionally use in production templates.
const LISTEN_BACKLOG: u32 = 128;

static SERVER_RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SERVER_RUNNING.store(false, Ordering::SeqCst);
}

/// Runs the server to completion: binds, forks workers, accepts and dispatches connections, and
/// blocks until a shutdown signal is received and every child has exited.
pub fn run(config: ServerConfig) -> Result<()> {
    SERVER_RUNNING.store(true, Ordering::SeqCst);
    install_signal_handlers()?;

    let listener = bind_listener(config.port)?;
    info!("listening on 0.0.0.0:{}", config.port);

    let stats = SharedStats::new()?;

    let mut workers = Vec::with_capacity(config.num_workers);
    for id in 0..config.num_workers {
        workers.push(spawn_worker(id, &config, &listener, stats)?);
    }
    if workers.is_empty() {
        return Err(ServerError::Fork(nix::Error::EINVAL));
    }
    info!("{} worker processes started", workers.len());

    let monitor = StatsMonitor::spawn(stats, Duration::from_secs(config.timeout_seconds));

    accept_loop(&listener, &workers);

    info!("shutting down: closing worker channels");
    for worker in &workers {
        worker.channel.shutdown_write();
    }
    for worker in workers {
        match nix::sys::wait::waitpid(worker.pid, None) {
            Ok(_) => info!("worker {} exited", worker.pid),
            Err(e) => warn!("waitpid({}) failed: {e}", worker.pid),
        }
    }

    monitor.join();
    info!("shutdown complete");
    Ok(())
}

struct WorkerHandle {
    pid: Pid,
    channel: IpcChannel,
}

fn install_signal_handlers() -> Result<()> {
    // SAFETY: `handle_shutdown_signal` only performs an atomic store, which is signal-safe.
    // Deliberately not `SA_RESTART`: `accept` must return EINTR so the loop can observe the
    // flag promptly instead of blocking through another connection.
    unsafe {
        signal::sigaction(
            Signal::SIGINT,
            &signal::SigAction::new(
                SigHandler::Handler(handle_shutdown_signal),
                signal::SaFlags::empty(),
                signal::SigSet::empty(),
            ),
        )
        .map_err(ServerError::Ipc)?;
        signal::sigaction(
            Signal::SIGTERM,
            &signal::SigAction::new(
                SigHandler::Handler(handle_shutdown_signal),
                signal::SaFlags::empty(),
                signal::SigSet::empty(),
            ),
        )
        .map_err(ServerError::Ipc)?;
    }
    Ok(())
}

fn io_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr_str = format!("0.0.0.0:{port}");
    let bind_err = |e: nix::Error| ServerError::Bind {
        addr: addr_str.clone(),
        source: io_err(e),
    };

    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(bind_err)?;

    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(bind_err)?;

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    bind(fd.as_raw_fd(), &addr).map_err(bind_err)?;
    listen(&fd, Backlog::new(LISTEN_BACKLOG as i32).unwrap()).map_err(bind_err)?;

    // SAFETY: `fd` was just bound and put into listening state by us; ownership transfers
    // cleanly into `std::net::TcpListener`.
    Ok(unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) })
}

fn spawn_worker(
    id: usize,
    config: &ServerConfig,
    listener: &TcpListener,
    stats: SharedStats,
) -> Result<WorkerHandle> {
    let (master_side, worker_side) = IpcChannel::pair()?;

    // SAFETY: `fork` is called with no other threads holding locks this process needs to make
    // progress post-fork; both branches immediately narrow down to their half of the channel.
    match unsafe { fork() }.map_err(ServerError::Fork)? {
        ForkResult::Parent { child } => {
            drop(worker_side);
            Ok(WorkerHandle {
                pid: child,
                channel: master_side,
            })
        }
        ForkResult::Child => {
            drop(master_side);
            drop_listener_in_child(listener);
            let exit_code = match worker::run(id, config.clone(), worker_side, stats) {
                Ok(()) => 0,
                Err(e) => {
                    error!("worker {id} exited with error: {e}");
                    1
                }
            };
            std::process::exit(exit_code);
        }
    }
}

fn drop_listener_in_child(listener: &TcpListener) {
    // The worker never accepts connections directly; it only ever receives already-accepted
    // sockets over IPC. Closing its inherited copy of the listening socket keeps the kernel's
    // accept queue semantics (notably `SO_REUSEPORT`-free single-acceptor behavior) owned solely
    // by the master.
    let fd: RawFd = listener.as_raw_fd();
    // SAFETY: this is the worker's own inherited copy of the descriptor; closing it does not
    // affect the master's copy, which remains open in the parent process.
    unsafe {
        libc::close(fd);
    }
}

fn accept_loop(listener: &TcpListener, workers: &[WorkerHandle]) {
    let mut next = 0usize;
    while SERVER_RUNNING.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let worker = &workers[next % workers.len()];
                next = next.wrapping_add(1);
                if let Err(e) = worker.channel.send_fd(stream.as_raw_fd()) {
                    warn!("failed to dispatch connection from {peer}: {e}");
                }
                drop(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if SERVER_RUNNING.load(Ordering::SeqCst) {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
}

impl IpcChannel {
    /// Half-closes the write direction of this channel by dropping it, signaling EOF to a
    /// `recv_fd` loop on the other side. Named for clarity at master shutdown call sites; the
    /// actual mechanism is just the `Drop` of the underlying descriptor.
    fn shutdown_write(&self) {
        // SAFETY: `shutdown(2)` on a duplicate-free Unix domain socketpair end is always valid;
        // it does not close the descriptor, so the containing `IpcChannel` can still be dropped
        // normally afterward.
        unsafe {
            libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}
