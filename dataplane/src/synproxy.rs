/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! SYN-proxy collaborator interface.
//!
//! The proxy module answers client SYNs with cookies and completes the
//! handshake toward the backend after verification. The TCP dataplane only
//! calls its three hooks and carries its per-connection sequence context
//! opaquely; the default implementation is used when no proxy is deployed.

use std::sync::Arc;

use common::Verdict;

use crate::conn::Conn;
use crate::framework::Flow;
use crate::packet::{PacketBuf, Tcp};

/// Sequence context of a proxied connection: the cookie ISN the proxy chose
/// toward the client and its offset from the backend's real ISN.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynProxySeq {
    pub isn: u32,
    pub delta: u32,
}

/// Outcome of the proxy's SNAT-side hook.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProxyAction {
    Continue,
    /// ACK storm detected; the caller drops the packet unchanged.
    Abort,
}

pub trait SynProxy: Send + Sync {
    /// Step-2 hook of the proxied 3-way handshake, run before connection
    /// scheduling. `Some` means the proxy consumed the packet, possibly
    /// producing a connection of its own.
    fn ack_rcv(
        &self,
        pkt: &mut PacketBuf,
        flow: &Flow,
    ) -> Option<(Verdict, Option<Arc<Conn>>)>;

    /// Backend-to-client hook: rewrites sequence space for proxied
    /// connections and suppresses ACK storms.
    fn snat_handler(&self, tcp: &mut Tcp<'_>, conn: &Conn) -> ProxyAction;

    /// Client-to-backend hook: rewrites ack_seq and SACK blocks for proxied
    /// connections.
    fn dnat_handler(&self, tcp: &mut Tcp<'_>, conn: &Conn);
}

/// No proxy deployed: every hook is a no-op.
#[derive(Debug, Default)]
pub struct NoSynProxy;

impl SynProxy for NoSynProxy {
    fn ack_rcv(
        &self,
        _pkt: &mut PacketBuf,
        _flow: &Flow,
    ) -> Option<(Verdict, Option<Arc<Conn>>)> {
        None
    }

    fn snat_handler(&self, _tcp: &mut Tcp<'_>, _conn: &Conn) -> ProxyAction {
        ProxyAction::Continue
    }

    fn dnat_handler(&self, _tcp: &mut Tcp<'_>, _conn: &Conn) {}
}
