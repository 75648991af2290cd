/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! The four translation handlers.
//!
//! Each handler owns the packet for its whole run, reads the pre-rewrite
//! identity from the connection record (never from bytes it already wrote),
//! and finishes with the checksum discipline: partial-mode fixup for offload
//! packets, incremental update when only addresses and ports moved, full
//! recomputation otherwise.

use log::debug;

use common::{AddressFamily, ConnFlags};

use crate::conn::Conn;
use crate::csum;
use crate::error::DataplaneError;
use crate::options;
use crate::packet::{CsumMode, PacketBuf};
use crate::proto::TcpProto;
use crate::seq;

use std::net::IpAddr;

fn csum_replace_addr(check: u16, old: &IpAddr, new: &IpAddr) -> u16 {
    match (old, new) {
        (IpAddr::V4(o), IpAddr::V4(n)) => {
            csum::csum_replace4(check, (*o).into(), (*n).into())
        }
        (IpAddr::V6(o), IpAddr::V6(n)) => {
            csum::csum_replace16(check, &o.octets(), &n.octets())
        }
        _ => unreachable!("mixed address families in translator"),
    }
}

impl TcpProto {
    /// Checksum-verify then run the app helper's out-path callback. Only
    /// connections with a bound helper pay for this.
    fn app_hook_out(&self, pkt: &mut PacketBuf, conn: &Conn) -> Result<(), DataplaneError> {
        let Some(app) = conn.app() else {
            return Ok(());
        };
        if !self.csum_check_inner(pkt) {
            return Err(DataplaneError::Checksum);
        }
        if !app.pkt_out(conn, pkt) {
            return Err(DataplaneError::AppReject);
        }
        Ok(())
    }

    fn app_hook_in(&self, pkt: &mut PacketBuf, conn: &Conn) -> Result<(), DataplaneError> {
        let Some(app) = conn.app() else {
            return Ok(());
        };
        if !self.csum_check_inner(pkt) {
            return Err(DataplaneError::Checksum);
        }
        if !app.pkt_in(conn, pkt) {
            return Err(DataplaneError::AppReject);
        }
        Ok(())
    }

    /// Backend-to-client translation for classic NAT (and DR return traffic):
    /// the source becomes the virtual identity.
    pub(crate) fn tcp_snat(&self, pkt: &mut PacketBuf, conn: &Conn) -> Result<(), DataplaneError> {
        let old_l4_len = pkt.l4_len() as u16;
        let app_bound = conn.app().is_some();
        self.app_hook_out(pkt, conn)?;

        {
            let mut tcp = pkt.tcp();
            tcp.set_source(conn.vport());
            seq::save_out_seq(conn, &tcp, self.config());
            seq::proxy_snat(&mut tcp, conn, self.synproxy())?;
        }
        pkt.set_src_addr(&conn.vaddr());
        let new_l4_len = pkt.l4_len() as u16;

        match pkt.csum_mode() {
            CsumMode::Partial => {
                let check = csum::partial_csum_update(
                    pkt.tcp().check(),
                    &conn.daddr(),
                    &conn.vaddr(),
                    old_l4_len,
                    new_l4_len,
                );
                pkt.tcp().set_check(check);
            }
            mode if !app_bound => {
                // only port and address changed, fast incremental update
                let mut check = pkt.tcp().check();
                check = csum_replace_addr(check, &conn.daddr(), &conn.vaddr());
                check = csum::csum_replace2(check, conn.dport(), conn.vport());
                pkt.tcp().set_check(check);
                if mode == CsumMode::Complete {
                    pkt.set_csum_mode(CsumMode::None);
                }
            }
            _ => {
                pkt.tcp().update_checksum(&conn.vaddr(), &conn.caddr());
                pkt.set_csum_mode(CsumMode::None);
            }
        }
        if pkt.af() == AddressFamily::Inet {
            pkt.ipv4().update_checksum();
        }
        Ok(())
    }

    /// Client-to-backend translation for classic NAT: the destination becomes
    /// the real server.
    pub(crate) fn tcp_dnat(&self, pkt: &mut PacketBuf, conn: &Conn) -> Result<(), DataplaneError> {
        let old_l4_len = pkt.l4_len() as u16;
        let app_bound = conn.app().is_some();
        self.app_hook_in(pkt, conn)?;

        {
            let mut tcp = pkt.tcp();
            tcp.set_dest(conn.dport());
            self.synproxy().dnat_handler(&mut tcp, conn);
        }
        pkt.set_dst_addr(&conn.daddr());
        let new_l4_len = pkt.l4_len() as u16;

        match pkt.csum_mode() {
            CsumMode::Partial => {
                let check = csum::partial_csum_update(
                    pkt.tcp().check(),
                    &conn.vaddr(),
                    &conn.daddr(),
                    old_l4_len,
                    new_l4_len,
                );
                pkt.tcp().set_check(check);
            }
            mode if !app_bound => {
                let mut check = pkt.tcp().check();
                check = csum_replace_addr(check, &conn.vaddr(), &conn.daddr());
                check = csum::csum_replace2(check, conn.vport(), conn.dport());
                pkt.tcp().set_check(check);
                if mode == CsumMode::Complete {
                    pkt.set_csum_mode(CsumMode::None);
                }
            }
            _ => {
                pkt.tcp().update_checksum(&conn.caddr(), &conn.daddr());
                pkt.set_csum_mode(CsumMode::Unnecessary);
            }
        }
        if pkt.af() == AddressFamily::Inet {
            pkt.ipv4().update_checksum();
        }
        Ok(())
    }

    /// Client-to-backend translation for full NAT: both source and
    /// destination are rewritten and the sequence space moves by delta.
    /// Option injection may grow the buffer in place.
    pub(crate) fn tcp_fnat_in(
        &self,
        pkt: &mut PacketBuf,
        conn: &Conn,
    ) -> Result<(), DataplaneError> {
        self.app_hook_in(pkt, conn)?;

        {
            let mut tcp = pkt.tcp();
            tcp.set_source(conn.lport());
            tcp.set_dest(conn.dport());
        }

        let (syn, ack) = {
            let tcp = pkt.tcp();
            (tcp.syn(), tcp.ack())
        };
        if syn && !ack {
            if self.config().timestamp_remove() {
                options::remove_timestamp(&mut pkt.tcp());
            }
            seq::in_init_seq(
                conn,
                &pkt.tcp(),
                self.config(),
                self.isn_generator(),
                self.reuse_stats(),
            );
        }

        if self.config().toa()
            && pkt.af() == AddressFamily::Inet
            && !conn.test_flag(ConnFlags::CIP_INSERTED)
            && !syn
        {
            options::add_client_addr(pkt, conn);
        }

        seq::in_adjust_seq(conn, &mut pkt.tcp(), self.synproxy());

        pkt.set_src_addr(&conn.laddr());
        pkt.set_dst_addr(&conn.daddr());

        pkt.tcp().update_checksum(&conn.laddr(), &conn.daddr());
        pkt.set_csum_mode(CsumMode::Unnecessary);
        if pkt.af() == AddressFamily::Inet {
            pkt.ipv4().update_checksum();
        }
        Ok(())
    }

    /// Backend-to-client translation for full NAT: the virtual identity
    /// replaces the local one and ack/SACK move back into client space.
    pub(crate) fn tcp_fnat_out(
        &self,
        pkt: &mut PacketBuf,
        conn: &Conn,
    ) -> Result<(), DataplaneError> {
        self.app_hook_out(pkt, conn)?;

        {
            let mut tcp = pkt.tcp();
            tcp.set_source(conn.vport());
            tcp.set_dest(conn.cport());
            if tcp.syn() && tcp.ack() && self.config().mss_adjust() {
                options::adjust_mss(&mut tcp);
            }
            seq::save_out_seq(conn, &tcp, self.config());
        }
        seq::out_adjust_seq(conn, &mut pkt.tcp(), self.synproxy())?;

        pkt.set_src_addr(&conn.vaddr());
        pkt.set_dst_addr(&conn.caddr());

        pkt.tcp().update_checksum(&conn.vaddr(), &conn.caddr());
        pkt.set_csum_mode(CsumMode::None);
        if pkt.af() == AddressFamily::Inet {
            pkt.ipv4().update_checksum();
        }
        Ok(())
    }
}

pub(crate) fn log_drop(which: &str, err: &DataplaneError) {
    debug!("tcp: {} dropping packet: {}", which, err);
}
