/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Sequence-space bookkeeping for full-NAT and RST synthesis.
//!
//! All arithmetic is modulo 2^32; ordering uses the signed-difference
//! predicates, so comparisons stay correct across wrap.

use std::net::IpAddr;

use log::debug;
use rand::Rng;
use sha2::{Digest, Sha256};

use common::{ConnFlags, TcpState};

use crate::config::TcpConfig;
use crate::conn::{Conn, ConnReuseStats};
use crate::error::DataplaneError;
use crate::options;
use crate::packet::Tcp;
use crate::synproxy::{ProxyAction, SynProxy};

#[inline]
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

/// Full-NAT sequence context of one connection.
///
/// `delta = init_seq - client_isn` is fixed for the connection's lifetime
/// once assigned, except for one sanctioned re-init on connection reuse.
#[derive(Debug, Default, Clone, Copy)]
pub struct FnatSeq {
    /// ISN the balancer chose toward the backend; 0 means unassigned.
    pub init_seq: u32,
    /// Offset between the balancer's and the client's sequence space.
    pub delta: u32,
    /// First data byte of the client stream (client ISN + 1).
    pub fdata_seq: u32,
}

/// Deterministic keyed ISN source.
///
/// A boot-time secret keys a digest over the connection 4-tuple, so the
/// choice is unpredictable to peers but stable per key, which is what the
/// reuse path depends on.
pub struct IsnGenerator {
    secret: [u8; 32],
}

impl IsnGenerator {
    pub fn new() -> IsnGenerator {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret[..]);
        IsnGenerator { secret }
    }

    pub fn with_secret(secret: [u8; 32]) -> IsnGenerator {
        IsnGenerator { secret }
    }

    pub fn isn(&self, laddr: &IpAddr, daddr: &IpAddr, lport: u16, dport: u16) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        match laddr {
            IpAddr::V4(a) => hasher.update(a.octets()),
            IpAddr::V6(a) => hasher.update(a.octets()),
        }
        match daddr {
            IpAddr::V4(a) => hasher.update(a.octets()),
            IpAddr::V6(a) => hasher.update(a.octets()),
        }
        hasher.update(lport.to_be_bytes());
        hasher.update(dport.to_be_bytes());
        let digest = hasher.finalize();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

impl Default for IsnGenerator {
    fn default() -> Self {
        IsnGenerator::new()
    }
}

/// Record the last in-order ack/end sequence seen from the backend; these
/// seed the RSTs synthesized on expiry.
pub(crate) fn save_out_seq(conn: &Conn, tcp: &Tcp<'_>, cfg: &TcpConfig) {
    if !cfg.conn_expire_tcp_rst() || tcp.rst() {
        return;
    }
    let ack = tcp.ack_seq();
    let mut rs = conn.rs_seq();
    if rs.ack_seq != 0 && seq_before(ack, rs.ack_seq) {
        debug!("tcp: out-of-order ack {} < {}, not saved", ack, rs.ack_seq);
        return;
    }
    let advance = if tcp.syn() && tcp.ack() {
        1
    } else {
        tcp.payload_len() as u32
    };
    rs.end_seq = tcp.seq().wrapping_add(advance);
    rs.ack_seq = ack;
}

/// Assign (or sanctioned-reassign) the ISN toward the backend. Runs on the
/// client's initial SYN, before any sequence rewriting.
pub(crate) fn in_init_seq(
    conn: &Conn,
    tcp: &Tcp<'_>,
    cfg: &TcpConfig,
    isn_gen: &IsnGenerator,
    reuse_stats: &ConnReuseStats,
) {
    let client_seq = tcp.seq();
    let (state, old_state) = conn.state();

    let mut fs = conn.fnat_seq();
    fs.fdata_seq = client_seq.wrapping_add(1);
    conn.clear_flag(ConnFlags::CIP_INSERTED);

    let reused = fs.init_seq != 0
        && cfg.conn_reused()
        && matches!(state, TcpState::SynSent | TcpState::SynRecv);
    if fs.init_seq == 0 || reused {
        if reused {
            reuse_stats.bump(old_state);
        }
        fs.init_seq = isn_gen.isn(&conn.laddr(), &conn.daddr(), conn.lport(), conn.dport());
        fs.delta = fs.init_seq.wrapping_sub(client_seq);
    }
}

/// Client-to-backend rewrite: move seq into the balancer's space, then let
/// the syn-proxy fix up ack_seq/SACK for proxied connections.
pub(crate) fn in_adjust_seq(conn: &Conn, tcp: &mut Tcp<'_>, proxy: &dyn SynProxy) {
    let delta = conn.fnat_seq().delta;
    let seq = tcp.seq();
    tcp.set_seq(seq.wrapping_add(delta));
    proxy.dnat_handler(tcp, conn);
}

/// Offer a backend-to-client packet to the proxy's SNAT hook; `Abort` means
/// an ACK storm and the packet must be dropped unchanged.
pub(crate) fn proxy_snat(
    tcp: &mut Tcp<'_>,
    conn: &Conn,
    proxy: &dyn SynProxy,
) -> Result<(), DataplaneError> {
    if proxy.snat_handler(tcp, conn) == ProxyAction::Abort {
        return Err(DataplaneError::ProxyAbort);
    }
    Ok(())
}

/// Backend-to-client rewrite: the proxy hook runs first and may refuse the
/// packet outright (ACK storm); then ack_seq and every SACK block move back
/// into the client's space.
pub(crate) fn out_adjust_seq(
    conn: &Conn,
    tcp: &mut Tcp<'_>,
    proxy: &dyn SynProxy,
) -> Result<(), DataplaneError> {
    proxy_snat(tcp, conn, proxy)?;
    let delta = conn.fnat_seq().delta;
    let ack = tcp.ack_seq();
    tcp.set_ack_seq(ack.wrapping_sub(delta));
    options::adjust_sack(tcp, delta);
    Ok(())
}
