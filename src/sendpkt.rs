//! Raw-socket packet send engine.
//!
//! Builds one packet template per process lifetime and patches only the
//! destination (and, for IPv4, the checksum) on every send. Grounded
//! byte-for-byte on `examples/original_source/sndpkt.c`: an `AF_PACKET`/
//! `SOCK_DGRAM` socket (the kernel prepends the Ethernet header for us),
//! a cached partial checksum for IPv4, and a cached patch offset for XIA.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::ip::IpNextHeaderProtocol;

use crate::error::SendEngineError;

const ETH_P_XIP: u16 = 0xC0DE;
const IPV4_HDR_LEN: usize = 20;
const XIA_ROW_SIZE: usize = 28;
const XIP_FIXED_HDR_LEN: usize = 8;
const XIDTYPE_AD: u32 = 0x10;
/// 16-byte constant prefix shared by every AD XID this engine emits; the
/// remaining 4 bytes are a discriminator (the DAG slot index, or for the
/// sink node, the destination's IPv4-shaped address).
const AD_XID_PREFIX: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
/// Sentinel meaning "no outgoing edge here".
const XIA_EMPTY_EDGE: u8 = 0xff;
/// `last_node` value meaning "processing starts at the packet's source".
const XIA_ENTRY_NODE_INDEX: u8 = 0xff;

/// Which wire format this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Ip,
    Xia,
}

/// The XIA destination-DAG shape selected by `--daddr-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XiaDagShape {
    Fb0,
    Fb1,
    Fb2,
    Fb3,
    Via,
}

impl XiaDagShape {
    fn num_dst(self) -> usize {
        match self {
            XiaDagShape::Fb0 => 1,
            XiaDagShape::Fb1 | XiaDagShape::Via => 2,
            XiaDagShape::Fb2 => 3,
            XiaDagShape::Fb3 => 4,
        }
    }
}

/// Per-stack cached state needed to patch a template cheaply on every send.
enum Cookie {
    Ip { sum: u16 },
    Xia { offset: usize },
}

/// Owns the raw socket, the packet template, and the patch cookie. Not
/// `Send`/`Sync`; the control loop that owns it is single-threaded.
pub struct SendEngine {
    sock: RawFd,
    dev: libc::sockaddr_ll,
    template: Vec<u8>,
    cookie: Cookie,
}

impl SendEngine {
    pub fn new(
        stack: Stack,
        ifname: &str,
        pkt_len: usize,
        dst_mac: [u8; 6],
        dst_addr_type: Option<XiaDagShape>,
    ) -> Result<Self, SendEngineError> {
        let sock = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(SendEngineError::Socket(io::Error::last_os_error()));
        }

        let proto = match stack {
            Stack::Ip => libc::ETH_P_IP as u16,
            Stack::Xia => ETH_P_XIP,
        };
        let dev = build_sockaddr_ll(ifname, proto, dst_mac)?;

        let template_len = pkt_len.saturating_sub(14); // kernel adds the Ethernet header
        let (template, cookie) = match stack {
            Stack::Ip => {
                if template_len < IPV4_HDR_LEN {
                    return Err(SendEngineError::PacketTooSmall {
                        given: pkt_len,
                        minimum: IPV4_HDR_LEN + 14,
                    });
                }
                make_ipv4_template(template_len)
            }
            Stack::Xia => {
                let shape = dst_addr_type.ok_or_else(|| {
                    SendEngineError::BadDestinationType("xia stack requires a DAG shape".into())
                })?;
                let min_len = XIP_FIXED_HDR_LEN + shape.num_dst() * XIA_ROW_SIZE;
                if template_len < min_len {
                    return Err(SendEngineError::PacketTooSmall {
                        given: pkt_len,
                        minimum: min_len + 14,
                    });
                }
                make_xia_template(template_len, shape)
            }
        };

        let bind_rc = unsafe {
            libc::bind(
                sock,
                &dev as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if bind_rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(sock) };
            return Err(SendEngineError::Bind {
                iface: ifname.to_string(),
                source: err,
            });
        }

        Ok(SendEngine {
            sock,
            dev,
            template,
            cookie,
        })
    }

    /// Patches the destination into the template and transmits it.
    ///
    /// Returns `true` iff the kernel accepted every byte. `EAGAIN`,
    /// `EWOULDBLOCK` and `ENOBUFS` are backpressure and are reported as a
    /// quiet `false`; any other errno is logged.
    pub fn send(&mut self, dst: Ipv4Addr) -> bool {
        match self.cookie {
            Cookie::Ip { sum } => {
                let dst_bytes = dst.octets();
                let mut packet = MutableIpv4Packet::new(&mut self.template).expect("template sized for an IPv4 header");
                packet.set_destination(dst);
                let check = !sum16(&dst_bytes, sum);
                packet.set_checksum(check);
            }
            Cookie::Xia { offset } => {
                let xid = embed_xid(dst);
                self.template[offset..offset + 20].copy_from_slice(&xid);
            }
        }
        self.transmit()
    }

    fn transmit(&self) -> bool {
        let sent = unsafe {
            libc::sendto(
                self.sock,
                self.template.as_ptr() as *const libc::c_void,
                self.template.len(),
                libc::MSG_DONTWAIT,
                &self.dev as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if sent == self.template.len() as isize {
            return true;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ENOBUFS) => {}
            #[allow(unreachable_patterns)]
            Some(libc::EWOULDBLOCK) => {}
            _ => log::warn!("sendto() failed: {err}"),
        }
        false
    }
}

impl Drop for SendEngine {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sock);
        }
    }
}

fn build_sockaddr_ll(
    ifname: &str,
    proto: u16,
    dst_mac: [u8; 6],
) -> Result<libc::sockaddr_ll, SendEngineError> {
    let cname = CString::new(ifname).map_err(|_| SendEngineError::NoSuchInterface(ifname.to_string()))?;
    let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if ifindex == 0 {
        return Err(SendEngineError::NoSuchInterface(ifname.to_string()));
    }

    let mut sll_addr = [0u8; 8];
    sll_addr[..6].copy_from_slice(&dst_mac);

    Ok(libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as u16,
        sll_protocol: proto.to_be(),
        sll_ifindex: ifindex as i32,
        sll_hatype: 0,
        sll_pkttype: 0,
        sll_halen: 6,
        sll_addr,
    })
}

/// Sums 16-bit big-endian words over `bytes` starting from `start`,
/// carry-folding until the running sum fits in 16 bits. `bytes.len()` must
/// be even.
fn sum16(bytes: &[u8], start: u16) -> u16 {
    debug_assert!(bytes.len() % 2 == 0);
    let mut sum: u32 = start as u32;
    for chunk in bytes.chunks_exact(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    while sum >= 0x1_0000 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    sum as u16
}

/// Fills `payload` with an ascending big-endian 16-bit counter starting at
/// 1. `payload.len()` must be even.
fn fill_payload(payload: &mut [u8]) {
    debug_assert!(payload.len() % 2 == 0);
    for (i, chunk) in payload.chunks_exact_mut(2).enumerate() {
        let v = (i + 1) as u16;
        chunk.copy_from_slice(&v.to_be_bytes());
    }
}

fn make_ipv4_template(template_len: usize) -> (Vec<u8>, Cookie) {
    let mut buf = vec![0u8; template_len];
    {
        let mut packet = MutableIpv4Packet::new(&mut buf).expect("template_len >= 20");
        packet.set_version(4);
        packet.set_header_length(5);
        packet.set_dscp(0);
        packet.set_ecn(0);
        packet.set_total_length(template_len as u16);
        packet.set_identification(0);
        packet.set_flags(pnet::packet::ipv4::Ipv4Flags::DontFragment);
        packet.set_fragment_offset(0);
        packet.set_ttl(255);
        // Reserved-for-experimentation protocol number (RFC 3692).
        packet.set_next_level_protocol(IpNextHeaderProtocol::new(253));
        packet.set_source(Ipv4Addr::new(10, 0, 0, 1));
        packet.set_destination(Ipv4Addr::UNSPECIFIED);
        packet.set_checksum(0);
    }
    let cookie_sum = sum16(&buf[..IPV4_HDR_LEN], 0);
    fill_payload(&mut buf[IPV4_HDR_LEN..]);
    (buf, Cookie::Ip { sum: cookie_sum })
}

fn make_xia_template(template_len: usize, shape: XiaDagShape) -> (Vec<u8>, Cookie) {
    let num_dst = shape.num_dst();
    let hdr_len = XIP_FIXED_HDR_LEN + num_dst * XIA_ROW_SIZE;
    let mut buf = vec![0u8; template_len];

    buf[0] = 1; // version
    buf[1] = 0; // next_hdr
    buf[2..4].copy_from_slice(&((template_len - hdr_len) as u16).to_be_bytes()); // payload_len
    buf[4] = num_dst as u8;
    buf[5] = 0; // num_src
    buf[6] = XIA_ENTRY_NODE_INDEX; // last_node
    buf[7] = 255; // hop_limit

    for row in 0..num_dst {
        let off = XIP_FIXED_HDR_LEN + row * XIA_ROW_SIZE;
        buf[off..off + 4].copy_from_slice(&XIDTYPE_AD.to_be_bytes());
        buf[off + 4..off + 20].copy_from_slice(&AD_XID_PREFIX[..]);
        buf[off + 20..off + 24].copy_from_slice(&((row + 1) as u32).to_be_bytes());
        buf[off + 24..off + 28].copy_from_slice(&[XIA_EMPTY_EDGE; 4]);
    }
    let edge_at = |buf: &mut [u8], row: usize, edge: usize, value: u8| {
        buf[XIP_FIXED_HDR_LEN + row * XIA_ROW_SIZE + 24 + edge] = value;
    };
    match shape {
        XiaDagShape::Fb0 => edge_at(&mut buf, 0, 0, 0),
        XiaDagShape::Fb1 => {
            edge_at(&mut buf, 1, 0, 0);
            edge_at(&mut buf, 1, 1, 1);
        }
        XiaDagShape::Fb2 => {
            edge_at(&mut buf, 2, 0, 0);
            edge_at(&mut buf, 2, 1, 1);
            edge_at(&mut buf, 2, 2, 2);
        }
        XiaDagShape::Fb3 => {
            edge_at(&mut buf, 3, 0, 0);
            edge_at(&mut buf, 3, 1, 1);
            edge_at(&mut buf, 3, 2, 2);
            edge_at(&mut buf, 3, 3, 3);
        }
        XiaDagShape::Via => {
            edge_at(&mut buf, 0, 0, 1);
            edge_at(&mut buf, 1, 0, 0);
        }
    }

    fill_payload(&mut buf[hdr_len..]);

    let offset = XIP_FIXED_HDR_LEN + (num_dst - 1) * XIA_ROW_SIZE + 4;
    (buf, Cookie::Xia { offset })
}

/// Embeds an IPv4-shaped prefix address as the sink XID's 4-byte
/// discriminator, appended to the same 16-byte AD prefix used by the
/// template's other rows. Shared with the netlink engine so a prefix's
/// route destination and its packets' destination XID agree.
pub fn embed_xid(addr: Ipv4Addr) -> [u8; 20] {
    let mut xid = [0u8; 20];
    xid[..16].copy_from_slice(&AD_XID_PREFIX);
    xid[16..20].copy_from_slice(&addr.octets());
    xid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_checksum_validates_after_patch() {
        let (mut template, cookie) = make_ipv4_template(64);
        let sum = match cookie {
            Cookie::Ip { sum } => sum,
            _ => unreachable!(),
        };
        let dst = Ipv4Addr::new(192, 168, 1, 1);
        {
            let mut packet = MutableIpv4Packet::new(&mut template).unwrap();
            packet.set_destination(dst);
            let check = !sum16(&dst.octets(), sum);
            packet.set_checksum(check);
        }
        assert_eq!(sum16(&template[..IPV4_HDR_LEN], 0), 0xFFFF);
    }

    #[test]
    fn ipv4_template_total_length_matches_buffer() {
        let (template, _) = make_ipv4_template(64);
        let packet = pnet::packet::ipv4::Ipv4Packet::new(&template).unwrap();
        assert_eq!(packet.get_total_length() as usize, template.len());
    }

    #[test]
    fn xia_fb0_num_dst_and_offset() {
        let (template, cookie) = make_xia_template(200, XiaDagShape::Fb0);
        assert_eq!(template[4], 1);
        match cookie {
            Cookie::Xia { offset } => assert_eq!(offset, XIP_FIXED_HDR_LEN + 4),
            _ => unreachable!(),
        }
    }

    #[test]
    fn xia_fb3_has_four_dst_rows_and_chained_edges() {
        let (template, cookie) = make_xia_template(400, XiaDagShape::Fb3);
        assert_eq!(template[4], 4);
        match cookie {
            Cookie::Xia { offset } => {
                assert_eq!(offset, XIP_FIXED_HDR_LEN + 3 * XIA_ROW_SIZE + 4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn xia_via_wires_node0_through_node1() {
        let (template, _) = make_xia_template(200, XiaDagShape::Via);
        let edge = |row: usize, edge: usize| template[XIP_FIXED_HDR_LEN + row * XIA_ROW_SIZE + 24 + edge];
        assert_eq!(edge(0, 0), 1);
        assert_eq!(edge(1, 0), 0);
    }

    #[test]
    fn embedded_xid_carries_the_address_as_discriminator() {
        let addr = Ipv4Addr::new(10, 1, 2, 3);
        let xid = embed_xid(addr);
        assert_eq!(&xid[16..20], &addr.octets());
        assert_eq!(&xid[..16], &AD_XID_PREFIX);
    }
}
