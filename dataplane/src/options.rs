/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! TCP option codec.
//!
//! One walker with early-terminate semantics; every mutator is a filter over
//! it. The walker never reads past the options window and stops silently on
//! a malformed length, leaving the remaining bytes untouched.

use arrayvec::ArrayVec;
use log::debug;

use common::ConnFlags;

use crate::conn::Conn;
use crate::packet::{PacketBuf, Tcp, TCP_HDR_LEN};
use crate::seq::seq_after;

pub const KIND_EOL: u8 = 0;
pub const KIND_NOP: u8 = 1;
pub const KIND_MSS: u8 = 2;
pub const KIND_SACK: u8 = 5;
pub const KIND_TIMESTAMP: u8 = 8;

/// Non-standard option carrying the original client address and port.
pub const KIND_CLIENT_ADDR: u8 = 254;
pub const CLIENT_ADDR_OPT_LEN: usize = 8;

const MSS_OPT_LEN: usize = 4;
const TIMESTAMP_OPT_LEN: usize = 10;

/// A 40-byte options window holds at most 4 SACK blocks.
const MAX_SACK_BLOCKS: usize = 4;

/// Iterator over `(offset, kind, len)` option triples.
///
/// EOL terminates, NOP advances one byte, any length below 2 or past the end
/// of the window terminates without error.
pub(crate) struct OptionWalk<'a> {
    opts: &'a [u8],
    off: usize,
}

impl<'a> OptionWalk<'a> {
    pub(crate) fn new(opts: &'a [u8]) -> OptionWalk<'a> {
        OptionWalk { opts, off: 0 }
    }
}

impl Iterator for OptionWalk<'_> {
    type Item = (usize, u8, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.opts.len() {
            return None;
        }
        let kind = self.opts[self.off];
        match kind {
            KIND_EOL => None,
            KIND_NOP => {
                let at = self.off;
                self.off += 1;
                Some((at, KIND_NOP, 1))
            }
            _ => {
                if self.off + 1 >= self.opts.len() {
                    return None;
                }
                let len = self.opts[self.off + 1] as usize;
                if len < 2 || len > self.opts.len() - self.off {
                    return None;
                }
                let at = self.off;
                self.off += len;
                Some((at, kind, len))
            }
        }
    }
}

fn find_option(opts: &[u8], kind: u8, len: usize) -> Option<usize> {
    OptionWalk::new(opts).find(|&(_, k, l)| k == kind && l == len).map(|(at, _, _)| at)
}

/// Shrink an advertised MSS by the client-address option size, so the value
/// the backend echoes still leaves room for the injection.
///
/// Applied on SYN|ACK segments on the backend-to-client path; the caller
/// recomputes the checksum afterwards.
pub(crate) fn adjust_mss(tcp: &mut Tcp<'_>) {
    let Some(at) = find_option(tcp.options(), KIND_MSS, MSS_OPT_LEN) else {
        return;
    };
    let opts = tcp.options_mut();
    let mss = u16::from_be_bytes([opts[at + 2], opts[at + 3]]);
    let adjusted = mss.saturating_sub(CLIENT_ADDR_OPT_LEN as u16);
    opts[at + 2..at + 4].copy_from_slice(&adjusted.to_be_bytes());
    debug!("tcp: mss {} -> {}", mss, adjusted);
}

/// Rewrite the timestamp option to NOPs in place.
///
/// Applied on the client's initial SYN; offsets are preserved so no other
/// byte moves, and the caller's full checksum pass covers the edit.
pub(crate) fn remove_timestamp(tcp: &mut Tcp<'_>) {
    let Some(at) = find_option(tcp.options(), KIND_TIMESTAMP, TIMESTAMP_OPT_LEN) else {
        return;
    };
    let opts = tcp.options_mut();
    for byte in &mut opts[at..at + TIMESTAMP_OPT_LEN] {
        *byte = KIND_NOP;
    }
}

/// Subtract `delta` from every SACK block edge, moving the blocks back into
/// the client's sequence space.
pub(crate) fn adjust_sack(tcp: &mut Tcp<'_>, delta: u32) {
    if delta == 0 {
        return;
    }
    let mut edges: ArrayVec<usize, { MAX_SACK_BLOCKS * 2 }> = ArrayVec::new();
    for (at, kind, len) in OptionWalk::new(tcp.options()) {
        if kind != KIND_SACK || len < 10 || (len - 2) % 8 != 0 {
            continue;
        }
        let mut off = at + 2;
        while off + 4 <= at + len && !edges.is_full() {
            edges.push(off);
            off += 4;
        }
    }
    let opts = tcp.options_mut();
    for at in edges {
        let value = u32::from_be_bytes([opts[at], opts[at + 1], opts[at + 2], opts[at + 3]]);
        opts[at..at + 4].copy_from_slice(&value.wrapping_sub(delta).to_be_bytes());
    }
}

/// Inject the client-address option on the first data-bearing segment of a
/// full-NAT connection. IPv4 only.
///
/// Wire format: `{opcode, opsize = 8, port (be), addr (be)}`, placed right
/// after the fixed TCP header with the existing options shifted back. The
/// caller's full-checksum pass covers the TCP side; the IP header checksum
/// is recomputed here because the total length changes.
pub(crate) fn add_client_addr(pkt: &mut PacketBuf, conn: &Conn) {
    let (seq, doff) = {
        let tcp = pkt.tcp();
        (tcp.seq(), tcp.doff())
    };

    // only the first data segment gets the option
    if seq_after(seq, conn.fnat_seq().fdata_seq) {
        conn.set_flag(ConnFlags::CIP_INSERTED);
        return;
    }

    if pkt.len() + CLIENT_ADDR_OPT_LEN > pkt.mtu() {
        debug!(
            "tcp: skipping client-addr option, {} + {} exceeds mtu {}",
            pkt.len(),
            CLIENT_ADDR_OPT_LEN,
            pkt.mtu()
        );
        conn.set_flag(ConnFlags::CIP_INSERTED);
        return;
    }

    let std::net::IpAddr::V4(caddr) = conn.caddr() else {
        conn.set_flag(ConnFlags::CIP_INSERTED);
        return;
    };

    let at = pkt.l4_off() + TCP_HDR_LEN;
    pkt.insert_bytes(at, CLIENT_ADDR_OPT_LEN);
    {
        let data = pkt.data_mut();
        data[at] = KIND_CLIENT_ADDR;
        data[at + 1] = CLIENT_ADDR_OPT_LEN as u8;
        data[at + 2..at + 4].copy_from_slice(&conn.cport().to_be_bytes());
        data[at + 4..at + 8].copy_from_slice(&caddr.octets());
    }
    pkt.tcp().set_doff(doff + 2);
    let mut ip = pkt.ipv4();
    let tot_len = ip.tot_len();
    ip.set_tot_len(tot_len + CLIENT_ADDR_OPT_LEN as u16);
    ip.update_checksum();

    conn.set_flag(ConnFlags::CIP_INSERTED);
}
