/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Connection record.
//!
//! The record itself is owned by the frame's connection table; the dataplane
//! only mutates the subset below. State, old state and timeout share one
//! mutex; everything else is either fixed at creation, atomic, or guarded by
//! its own small lock so translators never hold the state lock while they
//! rewrite packet bytes.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use common::{AddressFamily, ConnFlags, TcpState};

use crate::framework::AppHelper;
use crate::packet::PacketBuf;
use crate::seq::FnatSeq;
use crate::synproxy::SynProxySeq;

/// A real server with its active/inactive connection counters.
#[derive(Debug)]
pub struct Dest {
    pub addr: IpAddr,
    pub port: u16,
    activeconns: AtomicU32,
    inactconns: AtomicU32,
}

impl Dest {
    pub fn new(addr: IpAddr, port: u16) -> Arc<Dest> {
        Arc::new(Dest {
            addr,
            port,
            activeconns: AtomicU32::new(0),
            inactconns: AtomicU32::new(0),
        })
    }

    pub fn activeconns(&self) -> u32 {
        self.activeconns.load(Ordering::Relaxed)
    }

    pub fn inactconns(&self) -> u32 {
        self.inactconns.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_active(&self) {
        self.activeconns.fetch_add(1, Ordering::Relaxed);
        self.inactconns.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_inactive(&self) {
        self.activeconns.fetch_sub(1, Ordering::Relaxed);
        self.inactconns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_new(&self, established: bool) {
        if established {
            self.activeconns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inactconns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// State, old state and idle timeout, guarded together.
#[derive(Debug)]
pub struct TcpStateCtx {
    pub state: TcpState,
    pub old_state: TcpState,
    pub timeout: Duration,
}

/// Last in-order sequence numbers seen from the backend, seeding expiry RSTs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RsSeq {
    pub ack_seq: u32,
    pub end_seq: u32,
}

/// One balanced connection.
pub struct Conn {
    af: AddressFamily,
    caddr: IpAddr,
    vaddr: IpAddr,
    laddr: IpAddr,
    daddr: IpAddr,
    cport: u16,
    vport: u16,
    lport: u16,
    dport: u16,
    flags: AtomicU32,
    tcp: Mutex<TcpStateCtx>,
    fnat_seq: Mutex<FnatSeq>,
    syn_proxy_seq: Mutex<SynProxySeq>,
    rs_seq: Mutex<RsSeq>,
    /// Single-slot queue: the most recent client ACK seen in SYN_SENT.
    ack_pkt: Mutex<Option<PacketBuf>>,
    dest: Option<Arc<Dest>>,
    app: Mutex<Option<Arc<dyn AppHelper>>>,
}

impl Conn {
    /// Create a connection in classic-NAT shape: the local identity is the
    /// client identity. Full-NAT connections call [`Conn::with_local`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        af: AddressFamily,
        caddr: IpAddr,
        cport: u16,
        vaddr: IpAddr,
        vport: u16,
        daddr: IpAddr,
        dport: u16,
        flags: ConnFlags,
        dest: Option<Arc<Dest>>,
    ) -> Conn {
        let flags = flags | ConnFlags::NO_OUTPUT;
        if let Some(dest) = &dest {
            dest.count_new(false);
        }
        Conn {
            af,
            caddr,
            vaddr,
            laddr: caddr,
            daddr,
            cport,
            vport,
            lport: cport,
            dport,
            // a fresh connection is not yet ESTABLISHED
            flags: AtomicU32::new((flags | ConnFlags::INACTIVE).bits()),
            tcp: Mutex::new(TcpStateCtx {
                state: TcpState::None,
                old_state: TcpState::None,
                timeout: Duration::from_secs(0),
            }),
            fnat_seq: Mutex::new(FnatSeq::default()),
            syn_proxy_seq: Mutex::new(SynProxySeq::default()),
            rs_seq: Mutex::new(RsSeq::default()),
            ack_pkt: Mutex::new(None),
            dest,
            app: Mutex::new(None),
        }
    }

    /// Set the full-NAT local identity used toward the backend.
    pub fn with_local(mut self, laddr: IpAddr, lport: u16) -> Conn {
        self.laddr = laddr;
        self.lport = lport;
        self
    }

    pub fn af(&self) -> AddressFamily {
        self.af
    }

    pub fn caddr(&self) -> IpAddr {
        self.caddr
    }

    pub fn vaddr(&self) -> IpAddr {
        self.vaddr
    }

    pub fn laddr(&self) -> IpAddr {
        self.laddr
    }

    pub fn daddr(&self) -> IpAddr {
        self.daddr
    }

    pub fn cport(&self) -> u16 {
        self.cport
    }

    pub fn vport(&self) -> u16 {
        self.vport
    }

    pub fn lport(&self) -> u16 {
        self.lport
    }

    pub fn dport(&self) -> u16 {
        self.dport
    }

    pub fn dest(&self) -> Option<&Arc<Dest>> {
        self.dest.as_ref()
    }

    pub fn flags(&self) -> ConnFlags {
        ConnFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn test_flag(&self, flag: ConnFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&self, flag: ConnFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: ConnFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    pub fn state_ctx(&self) -> MutexGuard<'_, TcpStateCtx> {
        self.tcp.lock()
    }

    /// Snapshot of (state, old_state) without holding the lock afterwards.
    pub fn state(&self) -> (TcpState, TcpState) {
        let ctx = self.tcp.lock();
        (ctx.state, ctx.old_state)
    }

    pub fn timeout(&self) -> Duration {
        self.tcp.lock().timeout
    }

    pub fn fnat_seq(&self) -> MutexGuard<'_, FnatSeq> {
        self.fnat_seq.lock()
    }

    pub fn syn_proxy_seq(&self) -> MutexGuard<'_, SynProxySeq> {
        self.syn_proxy_seq.lock()
    }

    pub fn rs_seq(&self) -> MutexGuard<'_, RsSeq> {
        self.rs_seq.lock()
    }

    /// Store the most recent SYN_SENT client ACK, replacing any older one.
    pub fn store_ack_pkt(&self, pkt: PacketBuf) {
        *self.ack_pkt.lock() = Some(pkt);
    }

    pub(crate) fn ack_pkt(&self) -> MutexGuard<'_, Option<PacketBuf>> {
        self.ack_pkt.lock()
    }

    pub fn app(&self) -> Option<Arc<dyn AppHelper>> {
        self.app.lock().clone()
    }

    pub(crate) fn bind_app(&self, helper: Arc<dyn AppHelper>) {
        *self.app.lock() = Some(helper);
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("caddr", &(self.caddr, self.cport))
            .field("vaddr", &(self.vaddr, self.vport))
            .field("laddr", &(self.laddr, self.lport))
            .field("daddr", &(self.daddr, self.dport))
            .field("flags", &self.flags())
            .field("state", &self.state().0)
            .finish()
    }
}

/// Counters for sanctioned ISN re-initialization, keyed by the state the
/// connection held before reuse.
#[derive(Debug, Default)]
pub struct ConnReuseStats {
    counts: [AtomicU64; TcpState::TABLE_LEN],
}

impl ConnReuseStats {
    pub(crate) fn bump(&self, old_state: TcpState) {
        self.counts[old_state as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, state: TcpState) -> u64 {
        self.counts[state as usize].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn conn() -> Conn {
        Conn::new(
            AddressFamily::Inet,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)),
            80,
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5)),
            8080,
            ConnFlags::FULLNAT,
            None,
        )
        .with_local(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 2)), 40000)
    }

    #[test]
    fn new_connection_starts_inactive_without_output() {
        let c = conn();
        assert!(c.test_flag(ConnFlags::NO_OUTPUT));
        assert!(c.test_flag(ConnFlags::INACTIVE));
        assert_eq!(c.state().0, TcpState::None);
    }

    #[test]
    fn masq_local_identity_is_client_identity() {
        let c = Conn::new(
            AddressFamily::Inet,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)),
            80,
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5)),
            8080,
            ConnFlags::MASQ,
            None,
        );
        assert_eq!(c.laddr(), c.caddr());
        assert_eq!(c.lport(), c.cport());
    }

    #[test]
    fn dest_counts_new_connection_as_inactive() {
        let dest = Dest::new(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5)), 8080);
        let _c = Conn::new(
            AddressFamily::Inet,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)),
            80,
            dest.addr,
            dest.port,
            ConnFlags::MASQ,
            Some(dest.clone()),
        );
        assert_eq!(dest.activeconns(), 0);
        assert_eq!(dest.inactconns(), 1);
    }
}
