//! Batched netlink route installation.
//!
//! Grounded byte-for-byte on `examples/original_source/rtnl.c`, but built
//! directly on raw `NETLINK_ROUTE` datagrams via `libc` rather than
//! `libmnl` — there is no Rust binding for that C library in this stack,
//! and the message format itself is simple enough to assemble by hand.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::error::NetlinkError;
use crate::prefix::NetPrefix;

const RTM_NEWROUTE: u16 = 24;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_REPLACE: u16 = 0x100;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLMSG_ERROR: u16 = 0x02;

const RTPROT_STATIC: u8 = 4;
const RT_TABLE_MAIN: u8 = 254;
const RTN_UNICAST: u8 = 1;
const RT_SCOPE_UNIVERSE: u8 = 0;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

const AF_XIA: u8 = 41;
const XRTABLE_MAIN_INDEX: u8 = 1;
const XIDTYPE_AD: u32 = 0x10;
const XIDTYPE_HID: u32 = 0x11;
/// `{xid_type: u32, xid_id: [u8; 20]}`, matching `struct xia_xid`.
const XIA_XID_LEN: usize = 24;

/// Mirrors `libmnl`'s default batch buffer size (one page, with an 8 KiB
/// floor for small-page architectures).
const BATCH_BUFFER_SIZE: usize = 8192;

/// Which wire format route messages carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Ip,
    Xia,
}

/// A router-side egress port: kernel interface index plus next-hop.
#[derive(Debug, Clone, Copy)]
pub struct Port {
    pub index: u16,
    pub iface: i32,
    pub gateway: Gateway,
}

#[derive(Debug, Clone, Copy)]
pub enum Gateway {
    Ip(Ipv4Addr),
    Xid([u8; 20]),
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Owns the netlink socket and the batching buffer. The buffer is `2 *
/// BATCH_BUFFER_SIZE` bytes: the first half is the declared working
/// region, the second is slack so a message straddling the boundary never
/// writes past the allocation.
pub struct RouteBatch {
    fd: RawFd,
    buf: Vec<u8>,
    used: usize,
    seq: u32,
    stack: Stack,
}

impl RouteBatch {
    pub fn new(stack: Stack) -> Result<Self, NetlinkError> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
        if fd < 0 {
            return Err(NetlinkError::Socket(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0; // let the kernel assign one
        addr.nl_groups = 0;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetlinkError::Bind(err));
        }

        let seq = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        Ok(RouteBatch {
            fd,
            buf: vec![0u8; BATCH_BUFFER_SIZE * 2],
            used: 0,
            seq,
            stack,
        })
    }

    /// Appends one `RTM_NEWROUTE` message to the batch, flushing first if
    /// the declared working region is already full.
    pub fn add_route(&mut self, prefix: &NetPrefix, port: &Port, update: bool) -> Result<(), NetlinkError> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let flags = NLM_F_REQUEST | if update { NLM_F_REPLACE } else { NLM_F_CREATE | NLM_F_EXCL };

        let written = match self.stack {
            Stack::Ip => write_ipv4_route(&mut self.buf[self.used..], seq, flags, prefix, port),
            Stack::Xia => write_xia_route(&mut self.buf[self.used..], seq, flags, prefix, port),
        };
        self.used += align4(written);

        if self.used >= BATCH_BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    /// Sends everything queued so far and drains the acknowledgments it
    /// produces. A no-op if the batch is empty.
    pub fn flush(&mut self) -> Result<(), NetlinkError> {
        if self.used == 0 {
            return Ok(());
        }
        let kernel: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let sent = unsafe {
            libc::sendto(
                self.fd,
                self.buf.as_ptr() as *const libc::c_void,
                self.used,
                0,
                &kernel as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if sent < 0 || sent as usize != self.used {
            return Err(NetlinkError::Send(io::Error::last_os_error()));
        }
        self.used = 0;
        self.drain_acks()
    }

    /// Non-blocking: drains every `NLMSG_ERROR` reply currently queued on
    /// the socket. Any nonzero error code is fatal per the harness's
    /// design (a silently dropped route update would invalidate the
    /// experiment). Rebuilds the fd set on every iteration.
    fn drain_acks(&self) -> Result<(), NetlinkError> {
        let mut rcv_buf = [0u8; BATCH_BUFFER_SIZE];
        loop {
            if !self.readable()? {
                return Ok(());
            }
            let n = unsafe {
                libc::recvfrom(
                    self.fd,
                    rcv_buf.as_mut_ptr() as *mut libc::c_void,
                    rcv_buf.len(),
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if n < 0 {
                return Err(NetlinkError::Recv(io::Error::last_os_error()));
            }
            self.check_for_nack(&rcv_buf[..n as usize])?;
        }
    }

    fn readable(&self) -> Result<bool, NetlinkError> {
        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_SET(self.fd, &mut readfds);
        }
        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        let rc = unsafe { libc::select(self.fd + 1, &mut readfds, std::ptr::null_mut(), std::ptr::null_mut(), &mut tv) };
        if rc < 0 {
            return Err(NetlinkError::Select(io::Error::last_os_error()));
        }
        Ok(rc > 0 && unsafe { libc::FD_ISSET(self.fd, &readfds) })
    }

    fn check_for_nack(&self, mut data: &[u8]) -> Result<(), NetlinkError> {
        while data.len() >= 16 {
            let len = u32::from_ne_bytes(data[0..4].try_into().unwrap()) as usize;
            let msg_type = u16::from_ne_bytes(data[4..6].try_into().unwrap());
            let seq = u32::from_ne_bytes(data[8..12].try_into().unwrap());
            if len < 16 || len > data.len() {
                break;
            }
            if msg_type == NLMSG_ERROR {
                let errno = i32::from_ne_bytes(data[16..20].try_into().unwrap());
                if errno != 0 {
                    return Err(NetlinkError::Nack { seq, errno: -errno });
                }
            }
            let advance = align4(len);
            if advance == 0 || advance > data.len() {
                break;
            }
            data = &data[advance..];
        }
        Ok(())
    }
}

impl Drop for RouteBatch {
    fn drop(&mut self) {
        let _ = self.drain_acks();
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn put_nlmsghdr(buf: &mut [u8], len: u32, msg_type: u16, flags: u16, seq: u32) {
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
    buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    buf[6..8].copy_from_slice(&flags.to_ne_bytes());
    buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    buf[12..16].copy_from_slice(&0u32.to_ne_bytes()); // pid, kernel ignores it here
}

fn put_rtattr(buf: &mut [u8], offset: usize, rta_type: u16, payload: &[u8]) -> usize {
    let rta_len = (4 + payload.len()) as u16;
    buf[offset..offset + 2].copy_from_slice(&rta_len.to_ne_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&rta_type.to_ne_bytes());
    buf[offset + 4..offset + 4 + payload.len()].copy_from_slice(payload);
    align4(4 + payload.len())
}

fn write_ipv4_route(buf: &mut [u8], seq: u32, flags: u16, prefix: &NetPrefix, port: &Port) -> usize {
    const NLMSGHDR_LEN: usize = 16;
    const RTMSG_LEN: usize = 12;

    let mut off = NLMSGHDR_LEN;
    buf[off] = libc::AF_INET as u8; // rtm_family
    buf[off + 1] = prefix.mask_bits; // rtm_dst_len
    buf[off + 2] = 0; // rtm_src_len
    buf[off + 3] = 0; // rtm_tos
    buf[off + 4] = RT_TABLE_MAIN; // rtm_table
    buf[off + 5] = RTPROT_STATIC; // rtm_protocol
    buf[off + 6] = RT_SCOPE_UNIVERSE; // rtm_scope
    buf[off + 7] = RTN_UNICAST; // rtm_type
    buf[off + 8..off + 12].copy_from_slice(&0u32.to_ne_bytes()); // rtm_flags
    off += RTMSG_LEN;

    let dst: u32 = u32::from(prefix.addr);
    off += put_rtattr(buf, off, RTA_DST, &dst.to_ne_bytes());
    off += put_rtattr(buf, off, RTA_OIF, &(port.iface as u32).to_ne_bytes());
    let gw = match port.gateway {
        Gateway::Ip(addr) => u32::from(addr),
        Gateway::Xid(_) => 0,
    };
    off += put_rtattr(buf, off, RTA_GATEWAY, &gw.to_ne_bytes());

    put_nlmsghdr(buf, off as u32, RTM_NEWROUTE, flags, seq);
    off
}

fn write_xia_route(buf: &mut [u8], seq: u32, flags: u16, prefix: &NetPrefix, port: &Port) -> usize {
    const NLMSGHDR_LEN: usize = 16;
    const RTMSG_LEN: usize = 12;

    let mut off = NLMSGHDR_LEN;
    buf[off] = AF_XIA;
    buf[off + 1] = XIA_XID_LEN as u8; // rtm_dst_len = sizeof(struct xia_xid)
    buf[off + 2] = 0;
    buf[off + 3] = 0;
    buf[off + 4] = XRTABLE_MAIN_INDEX;
    buf[off + 5] = RTPROT_STATIC;
    buf[off + 6] = RT_SCOPE_UNIVERSE;
    buf[off + 7] = RTN_UNICAST;
    buf[off + 8..off + 12].copy_from_slice(&0u32.to_ne_bytes());
    off += RTMSG_LEN;

    let mut dst_xid = [0u8; XIA_XID_LEN];
    dst_xid[0..4].copy_from_slice(&XIDTYPE_AD.to_be_bytes());
    dst_xid[4..24].copy_from_slice(&crate::sendpkt::embed_xid(prefix.addr));
    off += put_rtattr(buf, off, RTA_DST, &dst_xid);

    let mut gw_xid = [0u8; XIA_XID_LEN];
    gw_xid[0..4].copy_from_slice(&XIDTYPE_HID.to_be_bytes());
    if let Gateway::Xid(id) = port.gateway {
        gw_xid[4..24].copy_from_slice(&id);
    }
    off += put_rtattr(buf, off, RTA_GATEWAY, &gw_xid);

    put_nlmsghdr(buf, off as u32, RTM_NEWROUTE, flags, seq);
    off
}
