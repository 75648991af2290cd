/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Packet buffer and fixed-offset header views.
//!
//! A [`PacketBuf`] owns the bytes of one packet starting at the IP header;
//! owning the buffer is what grants a handler exclusive write access for its
//! whole run. Field offsets come from the kernel-layout header structs in
//! `network-types` so the views and the checksum kit agree on where every
//! field lives.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use memoffset::offset_of;
use network_types::ip::{Ipv4Hdr, Ipv6Hdr};
use network_types::tcp::TcpHdr;

use common::AddressFamily;

use crate::csum;
use crate::error::DataplaneError;

pub const IP4_HDR_LEN: usize = Ipv4Hdr::LEN;
pub const IP6_HDR_LEN: usize = Ipv6Hdr::LEN;
pub const TCP_HDR_LEN: usize = TcpHdr::LEN;

const IP4_TOT_LEN_OFF: usize = offset_of!(Ipv4Hdr, tot_len);
const IP4_FRAG_OFF: usize = offset_of!(Ipv4Hdr, frag_off);
const IP4_TTL_OFF: usize = offset_of!(Ipv4Hdr, ttl);
const IP4_PROTO_OFF: usize = offset_of!(Ipv4Hdr, proto);
const IP4_CSUM_OFF: usize = offset_of!(Ipv4Hdr, check);
const IP4_SRC_OFF: usize = offset_of!(Ipv4Hdr, src_addr);
const IP4_DST_OFF: usize = offset_of!(Ipv4Hdr, dst_addr);

const IP6_PAYLOAD_LEN_OFF: usize = offset_of!(Ipv6Hdr, payload_len);
const IP6_NEXT_HDR_OFF: usize = offset_of!(Ipv6Hdr, next_hdr);
const IP6_HOP_LIMIT_OFF: usize = offset_of!(Ipv6Hdr, hop_limit);
const IP6_SRC_OFF: usize = offset_of!(Ipv6Hdr, src_addr);
const IP6_DST_OFF: usize = offset_of!(Ipv6Hdr, dst_addr);

const TCP_SPORT_OFF: usize = offset_of!(TcpHdr, source);
const TCP_DPORT_OFF: usize = offset_of!(TcpHdr, dest);
const TCP_SEQ_OFF: usize = offset_of!(TcpHdr, seq);
const TCP_ACK_OFF: usize = offset_of!(TcpHdr, ack_seq);
const TCP_WINDOW_OFF: usize = offset_of!(TcpHdr, window);
const TCP_CSUM_OFF: usize = offset_of!(TcpHdr, check);
// data-offset nibble and flag bits sit in the two bytes after ack_seq
const TCP_DOFF_OFF: usize = TCP_ACK_OFF + 4;
const TCP_FLAGS_OFF: usize = TCP_DOFF_OFF + 1;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

pub const IPPROTO_TCP: u8 = 6;
const IP4_DF: u16 = 0x4000;
const DEFAULT_TTL: u8 = 64;
const DEFAULT_MTU: usize = 1500;

/// How much of the checksum work has been done for this packet.
///
/// `Partial` is hardware offload: the stored TCP checksum holds only the
/// pseudo-header sum. `Complete` means the NIC summed the packet on receive.
/// `Unnecessary` means verification already happened and may be skipped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CsumMode {
    None,
    Partial,
    Complete,
    Unnecessary,
}

/// One packet, owned, starting at the IP header.
#[derive(Debug)]
pub struct PacketBuf {
    data: Vec<u8>,
    af: AddressFamily,
    csum: CsumMode,
    mtu: usize,
    mark: u32,
}

impl PacketBuf {
    /// Wrap a received packet. Validates that the fixed IP header and the
    /// full TCP header window (data offset included) are present.
    pub fn new(af: AddressFamily, data: Vec<u8>) -> Result<Self, DataplaneError> {
        let pkt = PacketBuf {
            data,
            af,
            csum: CsumMode::None,
            mtu: DEFAULT_MTU,
            mark: 0,
        };
        let ip_len = match af {
            AddressFamily::Inet => IP4_HDR_LEN,
            AddressFamily::Inet6 => IP6_HDR_LEN,
        };
        if pkt.data.len() < ip_len {
            return Err(DataplaneError::Truncated("ip"));
        }
        pkt.check_tcp_window()?;
        Ok(pkt)
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn af(&self) -> AddressFamily {
        self.af
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn csum_mode(&self) -> CsumMode {
        self.csum
    }

    pub fn set_csum_mode(&mut self, mode: CsumMode) {
        self.csum = mode;
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn set_mark(&mut self, mark: u32) {
        self.mark = mark;
    }

    /// Offset of the TCP header. For IPv6 the frame is assumed to deliver
    /// the L4 header right after the fixed header (no extension chain).
    pub fn l4_off(&self) -> usize {
        match self.af {
            AddressFamily::Inet => ((self.data[0] & 0x0f) as usize) * 4,
            AddressFamily::Inet6 => IP6_HDR_LEN,
        }
    }

    pub fn l4_len(&self) -> usize {
        self.data.len() - self.l4_off()
    }

    pub fn l4_slice(&self) -> &[u8] {
        &self.data[self.l4_off()..]
    }

    /// TCP payload length, after the options window.
    pub fn tcp_payload_len(&self) -> usize {
        let l4 = self.l4_slice();
        let doff = ((l4[12] >> 4) as usize) * 4;
        l4.len().saturating_sub(doff)
    }

    fn check_tcp_window(&self) -> Result<(), DataplaneError> {
        let off = self.l4_off();
        let min_ip = match self.af {
            AddressFamily::Inet => IP4_HDR_LEN,
            AddressFamily::Inet6 => IP6_HDR_LEN,
        };
        if off < min_ip || self.data.len() < off + TCP_HDR_LEN {
            return Err(DataplaneError::Truncated("tcp"));
        }
        let doff = self.data[off + TCP_DOFF_OFF] >> 4;
        if doff < 5 || self.data.len() < off + doff as usize * 4 {
            return Err(DataplaneError::BadDataOffset(doff));
        }
        Ok(())
    }

    pub fn ipv4(&mut self) -> Ipv4<'_> {
        debug_assert_eq!(self.af, AddressFamily::Inet);
        Ipv4 { b: &mut self.data }
    }

    pub fn tcp(&mut self) -> Tcp<'_> {
        let off = self.l4_off();
        Tcp {
            b: &mut self.data[off..],
        }
    }

    pub fn src_addr(&self) -> IpAddr {
        match self.af {
            AddressFamily::Inet => {
                IpAddr::V4(Ipv4Addr::from(read_u32(&self.data, IP4_SRC_OFF)))
            }
            AddressFamily::Inet6 => IpAddr::V6(read_v6(&self.data, IP6_SRC_OFF)),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self.af {
            AddressFamily::Inet => {
                IpAddr::V4(Ipv4Addr::from(read_u32(&self.data, IP4_DST_OFF)))
            }
            AddressFamily::Inet6 => IpAddr::V6(read_v6(&self.data, IP6_DST_OFF)),
        }
    }

    pub fn set_src_addr(&mut self, addr: &IpAddr) {
        match addr {
            IpAddr::V4(a) => write_u32(&mut self.data, IP4_SRC_OFF, (*a).into()),
            IpAddr::V6(a) => self.data[IP6_SRC_OFF..IP6_SRC_OFF + 16].copy_from_slice(&a.octets()),
        }
    }

    pub fn set_dst_addr(&mut self, addr: &IpAddr) {
        match addr {
            IpAddr::V4(a) => write_u32(&mut self.data, IP4_DST_OFF, (*a).into()),
            IpAddr::V6(a) => self.data[IP6_DST_OFF..IP6_DST_OFF + 16].copy_from_slice(&a.octets()),
        }
    }

    /// Grow the packet by `count` zero bytes at `at` (absolute offset),
    /// shifting everything behind it right. Callers fix up lengths,
    /// data offsets and checksums afterwards.
    pub fn insert_bytes(&mut self, at: usize, count: usize) {
        self.data.splice(at..at, std::iter::repeat(0u8).take(count));
    }

    /// Build a minimum-size TCP packet (bare headers, no options or payload)
    /// for control segments synthesized by the dataplane itself.
    pub fn alloc_tcp(af: AddressFamily, src: &IpAddr, dst: &IpAddr) -> PacketBuf {
        let mut pkt = match af {
            AddressFamily::Inet => {
                let mut data = vec![0u8; IP4_HDR_LEN + TCP_HDR_LEN];
                data[0] = 0x45;
                write_u16(&mut data, IP4_TOT_LEN_OFF, (IP4_HDR_LEN + TCP_HDR_LEN) as u16);
                write_u16(&mut data, IP4_FRAG_OFF, IP4_DF);
                data[IP4_TTL_OFF] = DEFAULT_TTL;
                data[IP4_PROTO_OFF] = IPPROTO_TCP;
                PacketBuf {
                    data,
                    af,
                    csum: CsumMode::None,
                    mtu: DEFAULT_MTU,
                    mark: 0,
                }
            }
            AddressFamily::Inet6 => {
                let mut data = vec![0u8; IP6_HDR_LEN + TCP_HDR_LEN];
                data[0] = 0x60;
                write_u16(&mut data, IP6_PAYLOAD_LEN_OFF, TCP_HDR_LEN as u16);
                data[IP6_NEXT_HDR_OFF] = IPPROTO_TCP;
                data[IP6_HOP_LIMIT_OFF] = DEFAULT_TTL;
                PacketBuf {
                    data,
                    af,
                    csum: CsumMode::None,
                    mtu: DEFAULT_MTU,
                    mark: 0,
                }
            }
        };
        pkt.set_src_addr(src);
        pkt.set_dst_addr(dst);
        pkt.tcp().set_doff(5);
        pkt
    }
}

/// Mutable view of an IPv4 header.
pub struct Ipv4<'a> {
    b: &'a mut [u8],
}

impl Ipv4<'_> {
    pub fn header_len(&self) -> usize {
        ((self.b[0] & 0x0f) as usize) * 4
    }

    pub fn tot_len(&self) -> u16 {
        read_u16(self.b, IP4_TOT_LEN_OFF)
    }

    pub fn set_tot_len(&mut self, len: u16) {
        write_u16(self.b, IP4_TOT_LEN_OFF, len);
    }

    /// Recompute the header checksum over the full header window.
    pub fn update_checksum(&mut self) {
        write_u16(self.b, IP4_CSUM_OFF, 0);
        let hlen = self.header_len();
        let check = csum::csum_fold(csum::sum_slice(0, &self.b[..hlen]));
        write_u16(self.b, IP4_CSUM_OFF, check);
    }
}

/// Mutable view of a TCP header; the slice spans the whole L4 window.
pub struct Tcp<'a> {
    b: &'a mut [u8],
}

impl Tcp<'_> {
    pub fn source(&self) -> u16 {
        read_u16(self.b, TCP_SPORT_OFF)
    }

    pub fn set_source(&mut self, port: u16) {
        write_u16(self.b, TCP_SPORT_OFF, port);
    }

    pub fn dest(&self) -> u16 {
        read_u16(self.b, TCP_DPORT_OFF)
    }

    pub fn set_dest(&mut self, port: u16) {
        write_u16(self.b, TCP_DPORT_OFF, port);
    }

    pub fn seq(&self) -> u32 {
        read_u32(self.b, TCP_SEQ_OFF)
    }

    pub fn set_seq(&mut self, seq: u32) {
        write_u32(self.b, TCP_SEQ_OFF, seq);
    }

    pub fn ack_seq(&self) -> u32 {
        read_u32(self.b, TCP_ACK_OFF)
    }

    pub fn set_ack_seq(&mut self, ack: u32) {
        write_u32(self.b, TCP_ACK_OFF, ack);
    }

    pub fn doff(&self) -> u8 {
        self.b[TCP_DOFF_OFF] >> 4
    }

    pub fn set_doff(&mut self, doff: u8) {
        self.b[TCP_DOFF_OFF] = (doff << 4) | (self.b[TCP_DOFF_OFF] & 0x0f);
    }

    pub fn header_len(&self) -> usize {
        self.doff() as usize * 4
    }

    pub fn fin(&self) -> bool {
        self.b[TCP_FLAGS_OFF] & FLAG_FIN != 0
    }

    pub fn syn(&self) -> bool {
        self.b[TCP_FLAGS_OFF] & FLAG_SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.b[TCP_FLAGS_OFF] & FLAG_RST != 0
    }

    pub fn psh(&self) -> bool {
        self.b[TCP_FLAGS_OFF] & FLAG_PSH != 0
    }

    pub fn ack(&self) -> bool {
        self.b[TCP_FLAGS_OFF] & FLAG_ACK != 0
    }

    pub fn set_flags(&mut self, fin: bool, syn: bool, rst: bool, ack: bool) {
        let mut flags = 0u8;
        if fin {
            flags |= FLAG_FIN;
        }
        if syn {
            flags |= FLAG_SYN;
        }
        if rst {
            flags |= FLAG_RST;
        }
        if ack {
            flags |= FLAG_ACK;
        }
        self.b[TCP_FLAGS_OFF] = flags;
    }

    pub fn window(&self) -> u16 {
        read_u16(self.b, TCP_WINDOW_OFF)
    }

    pub fn check(&self) -> u16 {
        read_u16(self.b, TCP_CSUM_OFF)
    }

    pub fn set_check(&mut self, check: u16) {
        write_u16(self.b, TCP_CSUM_OFF, check);
    }

    /// The options window: bytes between the fixed header and the data
    /// offset. Never extends past the segment end.
    pub fn options(&self) -> &[u8] {
        let end = self.header_len().min(self.b.len());
        &self.b[TCP_HDR_LEN.min(end)..end]
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let end = self.header_len().min(self.b.len());
        &mut self.b[TCP_HDR_LEN.min(end)..end]
    }

    pub fn payload_len(&self) -> usize {
        self.b.len().saturating_sub(self.header_len())
    }

    /// Zero the checksum field and recompute over the given address pair.
    pub fn update_checksum(&mut self, src: &IpAddr, dst: &IpAddr) {
        write_u16(self.b, TCP_CSUM_OFF, 0);
        let check = csum::tcp_checksum(src, dst, self.b);
        write_u16(self.b, TCP_CSUM_OFF, check);
    }
}

#[inline]
fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

#[inline]
fn write_u16(b: &mut [u8], off: usize, value: u16) {
    b[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[inline]
fn write_u32(b: &mut [u8], off: usize, value: u32) {
    b[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

fn read_v6(b: &[u8], off: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&b[off..off + 16]);
    Ipv6Addr::from(octets)
}
