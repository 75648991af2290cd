/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! RST synthesis on connection expiry.
//!
//! Both RSTs are composed in the sequence space the receiving translation
//! path expects: the inbound one travels like a client packet and is
//! rewritten downstream, the outbound one leaves through the response path
//! of the connection's mode.

use std::sync::Arc;

use log::debug;

use common::{AddressFamily, ConnFlags, TcpState};

use crate::conn::Conn;
use crate::error::DataplaneError;
use crate::packet::PacketBuf;
use crate::proto::TcpProto;

impl TcpProto {
    /// RST toward the backend, composed as a client packet so the
    /// connection's translation applies on the way out.
    pub(crate) fn tcp_send_rst_in(&self, conn: &Arc<Conn>) -> Result<(), DataplaneError> {
        let (state, _) = conn.state();
        let seq = match state {
            TcpState::SynSent => {
                // single-slot queue: dequeue, read, re-enqueue for the
                // sibling RST
                let mut slot = conn.ack_pkt();
                let Some(mut stored) = slot.take() else {
                    return Ok(());
                };
                let seq = stored.tcp().seq();
                *slot = Some(stored);
                seq
            }
            TcpState::Established => {
                let ack_seq = conn.rs_seq().ack_seq;
                if conn.test_flag(ConnFlags::FULLNAT) {
                    ack_seq.wrapping_sub(conn.fnat_seq().delta)
                } else {
                    ack_seq
                }
            }
            _ => return Ok(()),
        };

        let mut pkt = PacketBuf::alloc_tcp(conn.af(), &conn.caddr(), &conn.vaddr());
        {
            let mut tcp = pkt.tcp();
            tcp.set_source(conn.cport());
            tcp.set_dest(conn.vport());
            tcp.set_seq(seq);
            tcp.set_ack_seq(0);
            tcp.set_flags(false, false, true, false);
        }
        pkt.tcp().update_checksum(&conn.caddr(), &conn.vaddr());
        if pkt.af() == AddressFamily::Inet {
            pkt.ipv4().update_checksum();
        }
        self.xmit().xmit_in(pkt, conn)
    }

    /// RST toward the client, composed as a backend packet and delivered
    /// through the response path of the connection's mode.
    pub(crate) fn tcp_send_rst_out(&self, conn: &Arc<Conn>) -> Result<(), DataplaneError> {
        let (state, _) = conn.state();
        let seq = match state {
            TcpState::SynSent => {
                let mut slot = conn.ack_pkt();
                let Some(mut stored) = slot.take() else {
                    return Ok(());
                };
                let ack_seq = stored.tcp().ack_seq();
                *slot = Some(stored);
                ack_seq.wrapping_sub(conn.syn_proxy_seq().delta)
            }
            TcpState::Established => conn.rs_seq().end_seq,
            _ => return Ok(()),
        };

        let fullnat = conn.test_flag(ConnFlags::FULLNAT);
        let (dst_addr, dst_port) = if fullnat {
            (conn.laddr(), conn.lport())
        } else {
            (conn.caddr(), conn.cport())
        };

        let mut pkt = PacketBuf::alloc_tcp(conn.af(), &conn.daddr(), &dst_addr);
        {
            let mut tcp = pkt.tcp();
            tcp.set_source(conn.dport());
            tcp.set_dest(dst_port);
            tcp.set_seq(seq);
            tcp.set_ack_seq(0);
            tcp.set_flags(false, false, true, false);
        }
        pkt.tcp().update_checksum(&conn.daddr(), &dst_addr);
        if pkt.af() == AddressFamily::Inet {
            pkt.ipv4().update_checksum();
        }
        if fullnat {
            self.xmit().xmit_out_fnat(pkt, conn)
        } else {
            self.xmit().xmit_out(pkt, conn)
        }
    }

    /// Expiry dispatcher: reset both peers of a NAT-mode connection when the
    /// feature is on. Failures only skip the RST, never the expiry.
    pub(crate) fn tcp_conn_expire(&self, conn: &Arc<Conn>) {
        if !self.config().conn_expire_tcp_rst() {
            return;
        }
        if !conn.test_flag(ConnFlags::MASQ) && !conn.test_flag(ConnFlags::FULLNAT) {
            return;
        }
        if let Err(err) = self.tcp_send_rst_in(conn) {
            debug!("tcp: expiry rst toward backend skipped: {}", err);
        }
        if let Err(err) = self.tcp_send_rst_out(conn) {
            debug!("tcp: expiry rst toward client skipped: {}", err);
        }
    }
}
