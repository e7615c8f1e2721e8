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

//! Ownership-transferring file-descriptor passing between the master and a worker.
//!
//! A plain integer copied across `fork` is meaningless once the two processes diverge — file
//! descriptor numbers are only valid within the process that owns the open-file-description they
//! index. Handing a worker an accepted connection therefore goes over a `SOCK_STREAM` Unix domain
//! socketpair using `SCM_RIGHTS` ancillary data, which tells the kernel to install a new
//! descriptor in the receiving process pointing at the *same* open-file-description. One dummy
//! byte rides along in the regular (non-ancillary) payload, since a `sendmsg` carrying only
//! control data and an empty main buffer is not portably deliverable.

use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::error::{Result, ServerError};

/// One end of a master↔worker `socketpair`.
///
/// `Io` wraps a raw descriptor rather than [`std::os::unix::net::UnixStream`] because the
/// payload carried over it is never a byte stream in the usual sense — it is exactly one
/// accepted-connection handoff per `send_fd`/`recv_fd` call, framed entirely by `SCM_RIGHTS`.
pub struct IpcChannel {
    fd: OwnedFd,
}

impl IpcChannel {
    /// Creates a connected pair: `(master_side, worker_side)`.
    ///
    /// Call this once per worker, before `fork`. After forking, the master must drop its
    /// `worker_side` clone and the worker must drop its `master_side` clone — each process keeps
    /// exactly the end meant for it, closing the other so a worker's exit is visible to the
    /// master as EOF on the corresponding `master_side`.
    pub fn pair() -> Result<(IpcChannel, IpcChannel)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(ServerError::Ipc)?;
        Ok((IpcChannel { fd: a }, IpcChannel { fd: b }))
    }

    /// The raw descriptor backing this end, for use in `poll`/`select` loops.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Transfers ownership of `fd` to the process on the other end of this channel.
    ///
    /// `fd` remains open (and owned by the caller) in this process; the kernel installs a
    /// *duplicate* descriptor referencing the same open-file-description on the far side.
    pub fn send_fd(&self, fd: RawFd) -> Result<()> {
        let dummy = [0u8; 1];
        let iov = libc::iovec {
            iov_base: dummy.as_ptr() as *mut libc::c_void,
            iov_len: dummy.len(),
        };

        let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg = libc::msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &iov as *const _ as *mut _,
            msg_iovlen: 1,
            msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
            msg_controllen: cmsg_buf.len() as _,
            msg_flags: 0,
        };

        // SAFETY: `msg` and `cmsg_buf` are valid for the duration of this call; the control
        // buffer was sized by `CMSG_SPACE` for exactly one `c_int` payload.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);

            if libc::sendmsg(self.fd.as_raw_fd(), &mut msg, 0) < 0 {
                return Err(ServerError::Io(std::io::Error::last_os_error()));
            }
        }

        Ok(())
    }

    /// Receives one descriptor sent by the far end's `send_fd`.
    ///
    /// Returns `Ok(None)` on a zero-length read, which signals the far end has closed its side
    /// (the master exiting, or the worker's accept loop ending) rather than sent a connection.
    pub fn recv_fd(&self) -> Result<Option<OwnedFd>> {
        let mut dummy = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: dummy.as_mut_ptr() as *mut libc::c_void,
            iov_len: dummy.len(),
        };

        let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg = libc::msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
            msg_controllen: cmsg_buf.len() as _,
            msg_flags: 0,
        };

        // SAFETY: same buffer-lifetime argument as `send_fd`.
        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return self.recv_fd();
            }
            return Err(ServerError::Io(err));
        }
        if n == 0 {
            return Ok(None);
        }

        // SAFETY: `msg` was populated by the kernel above; we only read what it reports.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null()
                || (*cmsg).cmsg_level != libc::SOL_SOCKET
                || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                return Err(ServerError::Ipc(nix::Error::EINVAL));
            }
            let raw_fd: RawFd =
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
            Ok(Some(OwnedFd::from_raw_fd(raw_fd)))
        }
    }
}

/// Allocates an uninitialized `cmsghdr`-sized buffer. Kept for documentation parity with the
/// `CMSG_SPACE` union idiom; the actual buffers above are plain byte `Vec`s, which is simpler and
/// equally correctly aligned since `Vec<u8>`'s allocator already guarantees word alignment
/// sufficient for `cmsghdr`.
#[allow(dead_code)]
fn _cmsg_alignment_note() -> MaybeUninit<libc::cmsghdr> {
    MaybeUninit::uninit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn fd_round_trips_through_socketpair() {
        let (master, worker) = IpcChannel::pair().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        master.send_fd(accepted.as_raw_fd()).unwrap();
        let received = worker.recv_fd().unwrap().expect("fd should be delivered");

        // The received descriptor is a distinct number referencing the same open-file-description:
        // both must observe the same peer address.
        let recv_stream = unsafe { std::net::TcpStream::from_raw_fd(received.as_raw_fd()) };
        std::mem::forget(received);
        assert_eq!(recv_stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn closing_the_far_end_reports_as_none() {
        let (master, worker) = IpcChannel::pair().unwrap();
        drop(master);
        assert!(worker.recv_fd().unwrap().is_none());
    }
}
