/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! The TCP protocol object: one capability record carrying every hook the
//! frame dispatches to, plus the process-wide pieces those hooks share
//! (config, timeout table, app registry, ISN source, secure-table toggle).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use common::{AddressFamily, Direction, TcpState, Verdict};

use crate::app::AppRegistry;
use crate::config::{TcpConfig, TimeoutTable};
use crate::conn::{Conn, ConnReuseStats};
use crate::csum;
use crate::error::DataplaneError;
use crate::framework::{AppHelper, ServiceRegistry, Transmit};
use crate::packet::{CsumMode, PacketBuf};
use crate::seq::IsnGenerator;
use crate::state::{set_tcp_state, FlagSnapshot};
use crate::synproxy::{NoSynProxy, SynProxy};
use crate::translate::log_drop;

/// Control bit for [`Protocol::timeout_change`]: select the secure tables.
pub const TIMEOUT_FLAG_SECURE: u8 = 0x01;

/// The hook surface every protocol module exposes to the frame.
pub trait Protocol: Send + Sync {
    fn conn_schedule(
        &self,
        af: AddressFamily,
        pkt: &mut PacketBuf,
    ) -> (Verdict, Option<Arc<Conn>>);

    fn snat_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool;

    fn dnat_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool;

    /// May grow the packet buffer in place (option injection).
    fn fnat_in_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool;

    fn fnat_out_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool;

    fn csum_check(&self, af: AddressFamily, pkt: &mut PacketBuf) -> bool;

    fn state_transition(&self, conn: &Conn, direction: Direction, pkt: &mut PacketBuf) -> bool;

    fn register_app(&self, helper: Arc<dyn AppHelper>) -> Result<(), DataplaneError>;

    fn unregister_app(&self, port: u16);

    fn app_conn_bind(&self, conn: &Conn);

    fn conn_expire_handler(&self, conn: &Arc<Conn>);

    fn timeout_change(&self, flags: u8);

    fn set_state_timeout(&self, state: &str, seconds: u32) -> Result<(), DataplaneError>;

    fn debug_packet(&self, pkt: &mut PacketBuf, msg: &str);

    fn state_name(&self, state: usize) -> &'static str;
}

/// TCP's implementation of the protocol surface.
pub struct TcpProto {
    config: TcpConfig,
    timeouts: TimeoutTable,
    secure: AtomicBool,
    isn: IsnGenerator,
    apps: AppRegistry,
    reuse_stats: ConnReuseStats,
    registry: Arc<dyn ServiceRegistry>,
    synproxy: Arc<dyn SynProxy>,
    xmit: Arc<dyn Transmit>,
}

impl TcpProto {
    pub fn new(registry: Arc<dyn ServiceRegistry>, xmit: Arc<dyn Transmit>) -> TcpProto {
        TcpProto {
            config: TcpConfig::default(),
            timeouts: TimeoutTable::default(),
            secure: AtomicBool::new(false),
            isn: IsnGenerator::new(),
            apps: AppRegistry::default(),
            reuse_stats: ConnReuseStats::default(),
            registry,
            synproxy: Arc::new(NoSynProxy),
            xmit,
        }
    }

    pub fn with_synproxy(mut self, synproxy: Arc<dyn SynProxy>) -> TcpProto {
        self.synproxy = synproxy;
        self
    }

    pub fn with_isn_secret(mut self, secret: [u8; 32]) -> TcpProto {
        self.isn = IsnGenerator::with_secret(secret);
        self
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    pub fn timeouts(&self) -> &TimeoutTable {
        &self.timeouts
    }

    pub fn reuse_stats(&self) -> &ConnReuseStats {
        &self.reuse_stats
    }

    pub fn secure_tables(&self) -> bool {
        self.secure.load(Ordering::Relaxed)
    }

    pub(crate) fn isn_generator(&self) -> &IsnGenerator {
        &self.isn
    }

    pub(crate) fn registry(&self) -> &dyn ServiceRegistry {
        &*self.registry
    }

    pub(crate) fn synproxy(&self) -> &dyn SynProxy {
        &*self.synproxy
    }

    pub(crate) fn xmit(&self) -> &dyn Transmit {
        &*self.xmit
    }

    /// Full checksum verification against the packet's current address pair.
    pub(crate) fn csum_check_inner(&self, pkt: &mut PacketBuf) -> bool {
        match pkt.csum_mode() {
            CsumMode::Unnecessary => true,
            _ => {
                let src = pkt.src_addr();
                let dst = pkt.dst_addr();
                let ok = csum::tcp_checksum_valid(&src, &dst, pkt.l4_slice());
                if ok {
                    pkt.set_csum_mode(CsumMode::Unnecessary);
                }
                ok
            }
        }
    }
}

impl Protocol for TcpProto {
    fn conn_schedule(
        &self,
        af: AddressFamily,
        pkt: &mut PacketBuf,
    ) -> (Verdict, Option<Arc<Conn>>) {
        self.tcp_conn_schedule(af, pkt)
    }

    fn snat_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        match self.tcp_snat(pkt, conn) {
            Ok(()) => true,
            Err(err) => {
                log_drop("snat", &err);
                false
            }
        }
    }

    fn dnat_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        match self.tcp_dnat(pkt, conn) {
            Ok(()) => true,
            Err(err) => {
                log_drop("dnat", &err);
                false
            }
        }
    }

    fn fnat_in_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        match self.tcp_fnat_in(pkt, conn) {
            Ok(()) => true,
            Err(err) => {
                log_drop("fnat-in", &err);
                false
            }
        }
    }

    fn fnat_out_handler(&self, pkt: &mut PacketBuf, conn: &Conn) -> bool {
        match self.tcp_fnat_out(pkt, conn) {
            Ok(()) => true,
            Err(err) => {
                log_drop("fnat-out", &err);
                false
            }
        }
    }

    fn csum_check(&self, _af: AddressFamily, pkt: &mut PacketBuf) -> bool {
        self.csum_check_inner(pkt)
    }

    fn state_transition(&self, conn: &Conn, direction: Direction, pkt: &mut PacketBuf) -> bool {
        let th = {
            let tcp = pkt.tcp();
            FlagSnapshot {
                syn: tcp.syn(),
                fin: tcp.fin(),
                ack: tcp.ack(),
                rst: tcp.rst(),
            }
        };
        set_tcp_state(conn, direction, th, self.secure_tables(), &self.timeouts)
    }

    fn register_app(&self, helper: Arc<dyn AppHelper>) -> Result<(), DataplaneError> {
        self.apps.register(helper)
    }

    fn unregister_app(&self, port: u16) {
        self.apps.unregister(port)
    }

    fn app_conn_bind(&self, conn: &Conn) {
        self.apps.conn_bind(conn)
    }

    fn conn_expire_handler(&self, conn: &Arc<Conn>) {
        self.tcp_conn_expire(conn)
    }

    fn timeout_change(&self, flags: u8) {
        let secure = flags & TIMEOUT_FLAG_SECURE != 0;
        self.secure.store(secure, Ordering::Relaxed);
        debug!(
            "tcp: switched to {} transition tables",
            if secure { "secure" } else { "normal" }
        );
    }

    fn set_state_timeout(&self, state: &str, seconds: u32) -> Result<(), DataplaneError> {
        self.timeouts.set_by_name(state, seconds)
    }

    fn debug_packet(&self, pkt: &mut PacketBuf, msg: &str) {
        let src = pkt.src_addr();
        let dst = pkt.dst_addr();
        let tcp = pkt.tcp();
        debug!(
            "{}: TCP {}:{} -> {}:{} syn={} ack={} fin={} rst={}",
            msg,
            src,
            tcp.source(),
            dst,
            tcp.dest(),
            tcp.syn(),
            tcp.ack(),
            tcp.fin(),
            tcp.rst(),
        );
    }

    fn state_name(&self, state: usize) -> &'static str {
        if state >= TcpState::COUNT {
            return TcpState::Last.name();
        }
        [
            TcpState::None,
            TcpState::Established,
            TcpState::SynSent,
            TcpState::SynRecv,
            TcpState::FinWait,
            TcpState::TimeWait,
            TcpState::Close,
            TcpState::CloseWait,
            TcpState::LastAck,
            TcpState::Listen,
            TcpState::SynAck,
        ][state]
            .name()
    }
}
