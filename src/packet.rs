//! Minimal IP packet parsing.
//!
//! The dispatcher only ever needs the handful of header fields that drive
//! classification: IP version, transport protocol, the address 4-tuple, TCP
//! flags, and ICMP echo detection. Checksums, fragmentation, and everything
//! else stay the embedded stack's problem, so this parser reads fields at
//! fixed offsets and never validates payloads.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// TCP flag bits (header byte 13).
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const ICMP4_ECHO_REQUEST: u8 = 8;
const ICMP4_ECHO_REPLY: u8 = 0;
const ICMP6_ECHO_REQUEST: u8 = 128;
const ICMP6_ECHO_REPLY: u8 = 129;

/// IP family of a packet, used to tag buffers handed to the embedded stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Transport protocol, as far as classification cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProto {
    Tcp,
    Udp,
    Icmp4,
    Icmp6,
    Other(u8),
}

impl IpProto {
    fn from_wire(n: u8) -> Self {
        match n {
            6 => IpProto::Tcp,
            17 => IpProto::Udp,
            1 => IpProto::Icmp4,
            58 => IpProto::Icmp6,
            other => IpProto::Other(other),
        }
    }
}

/// A parsed inbound or outbound IP packet.
///
/// Ports are zero for non-TCP/UDP packets; `tcp_flags` is zero for anything
/// that is not TCP.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub family: IpFamily,
    pub proto: IpProto,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub tcp_flags: u8,
    transport_offset: usize,
    buf: Vec<u8>,
}

impl ParsedPacket {
    /// Parse the fixed-offset header fields out of a raw IP packet.
    ///
    /// Returns `None` for anything too short or with an unknown version
    /// nibble; callers treat that as "not ours" and let the packet through.
    pub fn parse(raw: Vec<u8>) -> Option<Self> {
        let b = raw.as_slice();
        if b.is_empty() {
            return None;
        }
        match b[0] >> 4 {
            4 => {
                if b.len() < 20 {
                    return None;
                }
                let ihl = usize::from(b[0] & 0x0f) * 4;
                if ihl < 20 || b.len() < ihl {
                    return None;
                }
                let proto = IpProto::from_wire(b[9]);
                let src = IpAddr::V4(Ipv4Addr::new(b[12], b[13], b[14], b[15]));
                let dst = IpAddr::V4(Ipv4Addr::new(b[16], b[17], b[18], b[19]));
                Some(Self::assemble(IpFamily::V4, proto, src, dst, ihl, raw))
            }
            6 => {
                if b.len() < 40 {
                    return None;
                }
                let proto = IpProto::from_wire(b[6]);
                let mut src16 = [0u8; 16];
                let mut dst16 = [0u8; 16];
                src16.copy_from_slice(&b[8..24]);
                dst16.copy_from_slice(&b[24..40]);
                let src = IpAddr::V6(Ipv6Addr::from(src16));
                let dst = IpAddr::V6(Ipv6Addr::from(dst16));
                Some(Self::assemble(IpFamily::V6, proto, src, dst, 40, raw))
            }
            _ => None,
        }
    }

    fn assemble(
        family: IpFamily,
        proto: IpProto,
        src: IpAddr,
        dst: IpAddr,
        transport_offset: usize,
        buf: Vec<u8>,
    ) -> Self {
        let (mut src_port, mut dst_port) = (0u16, 0u16);
        let mut tcp_flags = 0u8;
        if matches!(proto, IpProto::Tcp | IpProto::Udp) && buf.len() >= transport_offset + 4 {
            src_port = u16::from_be_bytes([buf[transport_offset], buf[transport_offset + 1]]);
            dst_port = u16::from_be_bytes([buf[transport_offset + 2], buf[transport_offset + 3]]);
        }
        if proto == IpProto::Tcp && buf.len() >= transport_offset + 14 {
            tcp_flags = buf[transport_offset + 13];
        }
        Self {
            family,
            proto,
            src: SocketAddr::new(src, src_port),
            dst: SocketAddr::new(dst, dst_port),
            tcp_flags,
            transport_offset,
            buf,
        }
    }

    /// The raw packet bytes, valid only until the underlying buffer is
    /// reused by the tunnel; copy before handing off.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn icmp_type_code(&self) -> Option<(u8, u8)> {
        if self.buf.len() < self.transport_offset + 2 {
            return None;
        }
        Some((self.buf[self.transport_offset], self.buf[self.transport_offset + 1]))
    }

    /// Reports whether this is an ICMP echo request (either family).
    pub fn is_echo_request(&self) -> bool {
        match (self.proto, self.icmp_type_code()) {
            (IpProto::Icmp4, Some((ICMP4_ECHO_REQUEST, 0))) => true,
            (IpProto::Icmp6, Some((ICMP6_ECHO_REQUEST, 0))) => true,
            _ => false,
        }
    }

    /// Fabricate the echo reply corresponding to this echo request: swap the
    /// IP addresses, rewrite the ICMP type, and patch the ICMP checksum for
    /// the one changed word. The identifier, sequence number, and payload
    /// are carried over untouched.
    pub fn echo_reply(&self) -> Option<Vec<u8>> {
        if !self.is_echo_request() || self.buf.len() < self.transport_offset + 8 {
            return None;
        }
        let mut reply = self.buf.clone();
        let t = self.transport_offset;
        match self.family {
            IpFamily::V4 => {
                // Swapping src and dst leaves the IP header checksum valid.
                swap_ranges(&mut reply, 12, 16, 4);
                reply[t] = ICMP4_ECHO_REPLY;
                patch_checksum(
                    &mut reply,
                    t + 2,
                    u16::from(ICMP4_ECHO_REQUEST) << 8,
                    u16::from(ICMP4_ECHO_REPLY) << 8,
                );
            }
            IpFamily::V6 => {
                // The ICMPv6 pseudo-header sums src and dst symmetrically,
                // so the swap leaves that part of the checksum intact too.
                swap_ranges(&mut reply, 8, 24, 16);
                reply[t] = ICMP6_ECHO_REPLY;
                patch_checksum(
                    &mut reply,
                    t + 2,
                    u16::from(ICMP6_ECHO_REQUEST) << 8,
                    u16::from(ICMP6_ECHO_REPLY) << 8,
                );
            }
        }
        Some(reply)
    }
}

/// Peek the source address out of a raw engine-emitted packet without a full
/// parse. The engine guarantees well-formed packets, so reading the version
/// nibble and the fixed source-field offset is all the outbound pump needs.
pub fn source_ip(raw: &[u8]) -> Option<IpAddr> {
    if raw.is_empty() {
        return None;
    }
    match raw[0] >> 4 {
        4 if raw.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            raw[12], raw[13], raw[14], raw[15],
        ))),
        6 if raw.len() >= 40 => {
            let mut a = [0u8; 16];
            a.copy_from_slice(&raw[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(a)))
        }
        _ => None,
    }
}

fn swap_ranges(buf: &mut [u8], a: usize, b: usize, len: usize) {
    for i in 0..len {
        buf.swap(a + i, b + i);
    }
}

/// RFC 1624 incremental checksum update for a single changed 16-bit word.
fn patch_checksum(buf: &mut [u8], at: usize, old_word: u16, new_word: u16) {
    let sum = u16::from_be_bytes([buf[at], buf[at + 1]]);
    let mut acc = u32::from(!sum) + u32::from(!old_word) + u32::from(new_word);
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    let fixed = !(acc as u16);
    buf[at..at + 2].copy_from_slice(&fixed.to_be_bytes());
}
