//! BlueZ L2CAP socket transport
//!
//! Carries ATT PDUs over the L2CAP fixed channel (CID 4) of an LE
//! connection using a `SOCK_SEQPACKET` Bluetooth socket, so one read
//! always returns one whole PDU. The kernel performs the link-layer
//! connection as part of `connect(2)`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace};

use super::{Connector, Transport};
use crate::addr::{AddressType, BdAddr};
use crate::att::constants::{ATT_CID, ATT_MAX_MTU};
use crate::error::{GattError, GattResult};

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_L2CAP: i32 = 0;
const BDADDR_LE_PUBLIC: u8 = 0x01;
const BDADDR_LE_RANDOM: u8 = 0x02;

// Defined in <bluetooth/l2cap.h>
#[repr(C)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

fn bdaddr_type(addr_type: AddressType) -> u8 {
    match addr_type {
        AddressType::Public => BDADDR_LE_PUBLIC,
        AddressType::Random => BDADDR_LE_RANDOM,
    }
}

fn att_sockaddr(addr: [u8; 6], addr_type: u8) -> SockaddrL2 {
    SockaddrL2 {
        l2_family: AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: 0,
        l2_bdaddr: addr,
        l2_cid: ATT_CID.to_le(),
        l2_bdaddr_type: addr_type,
    }
}

/// An open ATT channel over a BlueZ L2CAP socket.
pub struct L2capSocket {
    fd: RawFd,
    closed: AtomicBool,
}

impl L2capSocket {
    /// Connects to `addr` on the ATT fixed channel.
    ///
    /// Performs exactly one handshake: the socket is put in non-blocking
    /// mode, `connect` is issued, and completion is awaited with `select`
    /// bounded by `timeout`. No retries on failure.
    pub fn open(addr: &BdAddr, addr_type: AddressType, timeout: Duration) -> GattResult<Self> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) };
        if fd < 0 {
            return Err(GattError::Connect(std::io::Error::last_os_error()));
        }

        let socket = L2capSocket {
            fd,
            closed: AtomicBool::new(false),
        };

        // Bind the local end for LE before connecting; BlueZ requires the
        // address type to be set on both sides of the socket.
        let local = att_sockaddr([0u8; 6], BDADDR_LE_PUBLIC);
        let result = unsafe {
            libc::bind(
                fd,
                &local as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(GattError::Connect(std::io::Error::last_os_error()));
        }

        socket.set_nonblocking(true)?;

        let remote = att_sockaddr(addr.bytes, bdaddr_type(addr_type));
        let result = unsafe {
            libc::connect(
                fd,
                &remote as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(GattError::Connect(err));
            }
            socket.await_connect(timeout)?;
        }

        socket.set_nonblocking(false)?;
        debug!("L2CAP ATT channel open to {addr}");
        Ok(socket)
    }

    /// Waits for a non-blocking connect to finish, bounded by `timeout`.
    fn await_connect(&self, timeout: Duration) -> GattResult<()> {
        let mut write_fds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut write_fds);
            libc::FD_SET(self.fd, &mut write_fds);
        }

        let mut timeout_val = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let result = unsafe {
            libc::select(
                self.fd + 1,
                std::ptr::null_mut(),
                &mut write_fds,
                std::ptr::null_mut(),
                &mut timeout_val,
            )
        };

        if result < 0 {
            return Err(GattError::Connect(std::io::Error::last_os_error()));
        }
        if result == 0 {
            return Err(GattError::ConnectTimeout(timeout));
        }

        // Writability alone does not mean success; check SO_ERROR.
        let mut so_error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let result = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if result < 0 {
            return Err(GattError::Connect(std::io::Error::last_os_error()));
        }
        if so_error != 0 {
            return Err(GattError::Connect(std::io::Error::from_raw_os_error(
                so_error,
            )));
        }

        Ok(())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> GattResult<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(GattError::Connect(std::io::Error::last_os_error()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(GattError::Connect(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Transport for L2capSocket {
    fn send(&self, pdu: &[u8]) -> std::io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "channel closed",
            ));
        }
        trace!("-> {} bytes: {}", pdu.len(), hex::encode(pdu));
        let written =
            unsafe { libc::write(self.fd, pdu.as_ptr() as *const libc::c_void, pdu.len()) };
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SEQPACKET writes whole messages; a short write is a kernel bug
        if written as usize != pdu.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short L2CAP write",
            ));
        }
        Ok(())
    }

    fn recv(&self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buffer = [0u8; ATT_MAX_MTU as usize];
        loop {
            let bytes_read = unsafe {
                libc::read(
                    self.fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if bytes_read < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                if self.closed.load(Ordering::SeqCst) {
                    // Local shutdown races the blocked read; report orderly close
                    return Ok(None);
                }
                return Err(err);
            }
            if bytes_read == 0 {
                return Ok(None);
            }
            let pdu = buffer[..bytes_read as usize].to_vec();
            trace!("<- {} bytes: {}", pdu.len(), hex::encode(&pdu));
            return Ok(Some(pdu));
        }
    }

    fn close(&self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing L2CAP ATT channel");
        // shutdown, not close: the fd stays valid until Drop so a reader
        // blocked in recv wakes with EOF instead of touching a stale fd
        let result = unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::NotConnected {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl AsRawFd for L2capSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for L2capSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// [`Connector`] producing [`L2capSocket`] channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct L2capConnector;

impl Connector for L2capConnector {
    type Channel = L2capSocket;

    fn open(
        &self,
        addr: &BdAddr,
        addr_type: AddressType,
        timeout: Duration,
    ) -> GattResult<L2capSocket> {
        L2capSocket::open(addr, addr_type, timeout)
    }
}
