/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Interfaces of the surrounding balancer frame.
//!
//! The dataplane consumes these; the frame (or a test harness) provides
//! them. They mirror the registry/scheduler/transmit split the frame exposes
//! to every protocol module.

use std::net::IpAddr;
use std::sync::Arc;

use common::{AddressFamily, Verdict};

use crate::conn::Conn;
use crate::error::DataplaneError;
use crate::packet::PacketBuf;

/// The 5-tuple-shaped identity of one packet, minus the protocol (always TCP
/// here).
#[derive(Copy, Clone, Debug)]
pub struct Flow {
    pub af: AddressFamily,
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
}

impl Flow {
    pub(crate) fn of(pkt: &mut PacketBuf) -> Flow {
        let af = pkt.af();
        let saddr = pkt.src_addr();
        let daddr = pkt.dst_addr();
        let tcp = pkt.tcp();
        Flow {
            af,
            saddr,
            sport: tcp.source(),
            daddr,
            dport: tcp.dest(),
        }
    }
}

/// One virtual service and its scheduler.
pub trait Service: Send + Sync {
    /// Pick a real server and build the connection record for a first SYN.
    /// `None` means no backend is usable right now.
    fn schedule(&self, flow: &Flow) -> Option<Arc<Conn>>;

    /// Policy verdict when scheduling produced no backend.
    fn no_backend(&self, pkt: &mut PacketBuf, flow: &Flow) -> Verdict;
}

/// Lookup surface of the frame's service registry.
pub trait ServiceRegistry: Send + Sync {
    /// Match a service by (fwmark, destination address, destination port).
    fn lookup(
        &self,
        mark: u32,
        af: AddressFamily,
        daddr: &IpAddr,
        dport: u16,
    ) -> Option<Arc<dyn Service>>;

    /// Whether the address is one of the balancer's virtual IPs at all.
    fn has_vip(&self, af: AddressFamily, addr: &IpAddr) -> bool;

    /// Global admission defense; when true, new connections are shed.
    fn overloaded(&self) -> bool {
        false
    }
}

/// Transmit paths of the frame.
///
/// `xmit_in` injects a packet toward the backend as if it arrived from the
/// client, so the connection's translation applies downstream. The two
/// response paths deliver toward the client, with and without the full-NAT
/// rewrite.
pub trait Transmit: Send + Sync {
    fn xmit_in(&self, pkt: PacketBuf, conn: &Arc<Conn>) -> Result<(), DataplaneError>;

    fn xmit_out(&self, pkt: PacketBuf, conn: &Arc<Conn>) -> Result<(), DataplaneError>;

    fn xmit_out_fnat(&self, pkt: PacketBuf, conn: &Arc<Conn>) -> Result<(), DataplaneError>;
}

/// An application-layer helper bound to a virtual port (FTP and friends).
pub trait AppHelper: Send + Sync {
    fn port(&self) -> u16;

    fn name(&self) -> &str;

    /// Called once when a connection binds to this helper.
    fn init(&self, _conn: &Conn) {}

    /// Pre-mangling callback on the client-to-backend path; `false` drops.
    fn pkt_in(&self, _conn: &Conn, _pkt: &mut PacketBuf) -> bool {
        true
    }

    /// Pre-mangling callback on the backend-to-client path; `false` drops.
    fn pkt_out(&self, _conn: &Conn, _pkt: &mut PacketBuf) -> bool {
        true
    }
}
