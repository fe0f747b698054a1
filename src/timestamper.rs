//! T1/T4 timestamp capture around the UDP socket.
//!
//! Three strategies, selected by [`crate::config::TimestampMode`]: NIC
//! hardware timestamps and kernel/software timestamps both ride the
//! `SO_TIMESTAMPING` control message machinery (TX timestamps arrive later,
//! on the socket's error queue); userland timestamps are just
//! `clock_gettime` called immediately around the syscall, matching the
//! original `cfg.ts == 'u'` branch in `send_w_ts`.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use socket2::Socket;

use codec::{Dscp, TimePoint};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("sendto failed: {0}")]
    Io(#[source] io::Error),
    #[error("timed out waiting for a TX timestamp on the error queue")]
    TxTimestampTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("recvmsg failed: {0}")]
    Io(#[source] io::Error),
}

const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

use super::config::TimestampMode;

/// Wraps the bound UDP socket, capturing T1 on send and T4 on receive
/// according to the configured [`TimestampMode`].
pub struct Timestamper {
    socket: Socket,
    mode: TimestampMode,
    /// How long to poll the error queue for a TX timestamp before giving up.
    tx_timestamp_budget: Duration,
}

impl Timestamper {
    /// `interface` scopes hardware timestamping to one NIC via
    /// `SO_BINDTODEVICE`, matching the original's `tstamp_mode_hardware(fd,
    /// iface)`. Ignored outside `Hardware` mode, where no particular NIC's
    /// clock is being asked for.
    pub fn new(socket: Socket, mode: TimestampMode, interface: &str) -> io::Result<Self> {
        let fd = socket.as_raw_fd();

        if mode == TimestampMode::Hardware && !interface.is_empty() {
            let iface = std::ffi::CString::new(interface)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_BINDTODEVICE,
                    iface.as_ptr() as *const libc::c_void,
                    iface.as_bytes_with_nul().len() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let flags: u32 = match mode {
            TimestampMode::Hardware => {
                SOF_TIMESTAMPING_TX_HARDWARE
                    | SOF_TIMESTAMPING_RX_HARDWARE
                    | SOF_TIMESTAMPING_RAW_HARDWARE
            }
            TimestampMode::Kernel => {
                SOF_TIMESTAMPING_TX_SOFTWARE | SOF_TIMESTAMPING_RX_SOFTWARE | SOF_TIMESTAMPING_SOFTWARE
            }
            TimestampMode::Userland => 0,
        };

        if flags != 0 {
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMPING,
                    &flags as *const u32 as *const libc::c_void,
                    mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        // Ask for the observed TOS/TCLASS byte as a control message on every
        // received datagram, so a PONG's DSCP can be compared against the
        // session's configured value.
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_RECVTOS,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_RECVTCLASS,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        Ok(Self {
            socket,
            mode,
            tx_timestamp_budget: Duration::from_millis(50),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn set_dscp(&self, addr: SocketAddr, dscp: Dscp) -> io::Result<()> {
        let tos = (dscp.value() as u32) << 2;
        match addr {
            SocketAddr::V4(_) => self.socket.set_tos(tos),
            SocketAddr::V6(_) => self.socket.set_tclass_v6(tos),
        }
    }

    /// Sends `data` to `dst`, returning the T1 timestamp observed for this
    /// send. `TimePoint::ZERO` is returned for `Userland` mode only if
    /// `clock_gettime` itself fails, matching the wire-level "no timestamp"
    /// sentinel.
    pub fn send(&self, dst: SocketAddr, data: &[u8]) -> Result<TimePoint, SendError> {
        if self.mode == TimestampMode::Userland {
            let t1 = userland_now();
            self.socket
                .send_to(data, &dst.into())
                .map_err(SendError::Io)?;
            return Ok(t1);
        }

        self.socket
            .send_to(data, &dst.into())
            .map_err(SendError::Io)?;
        self.poll_tx_timestamp()
    }

    fn poll_tx_timestamp(&self) -> Result<TimePoint, SendError> {
        let fd = self.raw_fd();
        let deadline = std::time::Instant::now() + self.tx_timestamp_budget;

        loop {
            match recv_with_timestamp(fd, libc::MSG_ERRQUEUE) {
                Ok((_, ts)) => return Ok(ts),
                Err(RecvError::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock && std::time::Instant::now() < deadline =>
                {
                    std::thread::sleep(Duration::from_micros(500));
                }
                Err(_) => return Err(SendError::TxTimestampTimeout),
            }
        }
    }

    /// Receives one datagram, returning its bytes, source address, the T4
    /// timestamp observed for this receive, and the DSCP value observed on
    /// the packet (when the kernel reports one).
    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, TimePoint, Option<Dscp>), RecvError> {
        let (n, addr, ts, dscp) = recv_into(self.raw_fd(), buf)?;
        let ts = if self.mode == TimestampMode::Userland { userland_now() } else { ts };
        Ok((n, addr, ts, dscp))
    }
}

fn userland_now() -> TimePoint {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    TimePoint::new(now.as_secs() as i64, now.subsec_nanos() as i64)
}

/// Issues `recvmsg` directly so the `SCM_TIMESTAMPING` control message can
/// be read, discarding the payload (used only for TX-timestamp polling on
/// the error queue).
fn recv_with_timestamp(fd: RawFd, flags: libc::c_int) -> Result<(usize, TimePoint), RecvError> {
    let mut payload = [0u8; 256];
    let mut control = [0u8; 256];
    let mut src: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    let ret = unsafe { libc::recvmsg(fd, &mut msg, flags) };
    if ret < 0 {
        return Err(RecvError::Io(io::Error::last_os_error()));
    }

    let ts = extract_timestamp(&msg).unwrap_or(TimePoint::ZERO);
    Ok((ret as usize, ts))
}

fn recv_into(fd: RawFd, buf: &mut [u8]) -> Result<(usize, SocketAddr, TimePoint, Option<Dscp>), RecvError> {
    let mut control = [0u8; 256];
    let mut src: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    let ret = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if ret < 0 {
        return Err(RecvError::Io(io::Error::last_os_error()));
    }

    let ts = extract_timestamp(&msg).unwrap_or(TimePoint::ZERO);
    let dscp = extract_dscp(&msg);
    let addr = sockaddr_storage_to_std(&src).ok_or_else(|| {
        RecvError::Io(io::Error::new(io::ErrorKind::InvalidData, "unsupported source address family"))
    })?;

    Ok((ret as usize, addr, ts, dscp))
}

/// Reads the TOS (IPv4) or traffic class (IPv6) byte the kernel attaches to
/// an inbound datagram when `IP_RECVTOS`/`IPV6_RECVTCLASS` is enabled. The
/// low two bits are ECN, not part of the DSCP.
fn extract_dscp(msg: &libc::msghdr) -> Option<Dscp> {
    let mut cmsg: *mut libc::cmsghdr = unsafe { libc::CMSG_FIRSTHDR(msg) };

    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        let tos_byte = if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_TOS {
            Some(unsafe { *(libc::CMSG_DATA(cmsg) as *const u8) })
        } else if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_TCLASS {
            Some(unsafe { *(libc::CMSG_DATA(cmsg) as *const libc::c_int) } as u8)
        } else {
            None
        };
        if let Some(byte) = tos_byte {
            return Some(Dscp::new(byte >> 2));
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg as *const libc::msghdr, cmsg) };
    }

    None
}

fn extract_timestamp(msg: &libc::msghdr) -> Option<TimePoint> {
    let mut cmsg: *mut libc::cmsghdr = unsafe { libc::CMSG_FIRSTHDR(msg) };

    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPING {
            let data = unsafe { libc::CMSG_DATA(cmsg) } as *const libc::timespec;
            // SCM_TIMESTAMPING carries three timespecs: software, deprecated,
            // hardware. Prefer hardware when present.
            let ts = unsafe { std::slice::from_raw_parts(data, 3) };
            if ts[2].tv_sec != 0 || ts[2].tv_nsec != 0 {
                return Some(TimePoint::new(ts[2].tv_sec as i64, ts[2].tv_nsec as i64));
            }
            if ts[0].tv_sec != 0 || ts[0].tv_nsec != 0 {
                return Some(TimePoint::new(ts[0].tv_sec as i64, ts[0].tv_nsec as i64));
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg as *const libc::msghdr, cmsg) };
    }

    None
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn userland_now_is_never_the_zero_sentinel_on_a_working_clock() {
        assert!(!userland_now().is_zero());
    }
}
