/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Shared fixtures: a static service registry, a recording transmit path and
//! packet builders/verifiers backed by etherparse so the checksum math is
//! checked against an independent implementation.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use etherparse::{Ipv4Header, PacketBuilder, TcpHeader};

use dataplane::{
    AddressFamily, Conn, ConnFlags, DataplaneError, Dest, Flow, PacketBuf, Service,
    ServiceRegistry, TcpProto, Transmit, Verdict,
};

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);
pub const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 2);
pub const BACKEND: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 5);

pub const CLIENT_PORT: u16 = 5000;
pub const VPORT: u16 = 80;
pub const LPORT: u16 = 40000;
pub const DPORT: u16 = 8080;

pub const ISN_SECRET: [u8; 32] = [0x42; 32];

/// A service that always schedules the same prebuilt connection.
pub struct StaticService {
    pub conn: Mutex<Option<Arc<Conn>>>,
    pub no_backend_verdict: Verdict,
}

impl Service for StaticService {
    fn schedule(&self, _flow: &Flow) -> Option<Arc<Conn>> {
        self.conn.lock().unwrap().clone()
    }

    fn no_backend(&self, _pkt: &mut PacketBuf, _flow: &Flow) -> Verdict {
        self.no_backend_verdict
    }
}

pub struct StaticRegistry {
    pub vaddr: IpAddr,
    pub vport: u16,
    pub service: Arc<StaticService>,
    pub overloaded: AtomicBool,
}

impl StaticRegistry {
    pub fn new(service: Arc<StaticService>) -> StaticRegistry {
        StaticRegistry {
            vaddr: IpAddr::V4(VIP),
            vport: VPORT,
            service,
            overloaded: AtomicBool::new(false),
        }
    }
}

impl ServiceRegistry for StaticRegistry {
    fn lookup(
        &self,
        _mark: u32,
        _af: AddressFamily,
        daddr: &IpAddr,
        dport: u16,
    ) -> Option<Arc<dyn Service>> {
        (*daddr == self.vaddr && dport == self.vport)
            .then(|| self.service.clone() as Arc<dyn Service>)
    }

    fn has_vip(&self, _af: AddressFamily, addr: &IpAddr) -> bool {
        *addr == self.vaddr
    }

    fn overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }
}

/// Records every transmitted packet with the path it left through.
#[derive(Default)]
pub struct RecordingXmit {
    pub sent: Mutex<Vec<(&'static str, Vec<u8>)>>,
}

impl Transmit for RecordingXmit {
    fn xmit_in(&self, pkt: PacketBuf, _conn: &Arc<Conn>) -> Result<(), DataplaneError> {
        self.sent.lock().unwrap().push(("in", pkt.data().to_vec()));
        Ok(())
    }

    fn xmit_out(&self, pkt: PacketBuf, _conn: &Arc<Conn>) -> Result<(), DataplaneError> {
        self.sent.lock().unwrap().push(("out", pkt.data().to_vec()));
        Ok(())
    }

    fn xmit_out_fnat(&self, pkt: PacketBuf, _conn: &Arc<Conn>) -> Result<(), DataplaneError> {
        self.sent
            .lock()
            .unwrap()
            .push(("out-fnat", pkt.data().to_vec()));
        Ok(())
    }
}

pub struct Harness {
    pub proto: TcpProto,
    pub service: Arc<StaticService>,
    pub xmit: Arc<RecordingXmit>,
}

pub fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let service = Arc::new(StaticService {
        conn: Mutex::new(None),
        no_backend_verdict: Verdict::Drop,
    });
    let xmit = Arc::new(RecordingXmit::default());
    let proto = TcpProto::new(
        Arc::new(StaticRegistry::new(service.clone())),
        xmit.clone(),
    )
    .with_isn_secret(ISN_SECRET);
    Harness {
        proto,
        service,
        xmit,
    }
}

pub fn fnat_conn() -> Arc<Conn> {
    Arc::new(
        Conn::new(
            AddressFamily::Inet,
            IpAddr::V4(CLIENT),
            CLIENT_PORT,
            IpAddr::V4(VIP),
            VPORT,
            IpAddr::V4(BACKEND),
            DPORT,
            ConnFlags::FULLNAT,
            Some(Dest::new(IpAddr::V4(BACKEND), DPORT)),
        )
        .with_local(IpAddr::V4(LOCAL), LPORT),
    )
}

pub fn masq_conn() -> Arc<Conn> {
    Arc::new(Conn::new(
        AddressFamily::Inet,
        IpAddr::V4(CLIENT),
        CLIENT_PORT,
        IpAddr::V4(VIP),
        VPORT,
        IpAddr::V4(BACKEND),
        DPORT,
        ConnFlags::MASQ,
        Some(Dest::new(IpAddr::V4(BACKEND), DPORT)),
    ))
}

/// Build an IPv4 TCP packet with a valid checksum via etherparse.
pub struct Segment {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub syn: bool,
    pub ack: Option<u32>,
    pub fin: bool,
    pub rst: bool,
    pub options: Vec<etherparse::TcpOptionElement>,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Segment {
        Segment {
            src,
            dst,
            sport,
            dport,
            seq: 0,
            syn: false,
            ack: None,
            fin: false,
            rst: false,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn seq(mut self, seq: u32) -> Segment {
        self.seq = seq;
        self
    }

    pub fn syn(mut self) -> Segment {
        self.syn = true;
        self
    }

    pub fn ack(mut self, ack: u32) -> Segment {
        self.ack = Some(ack);
        self
    }

    pub fn fin(mut self) -> Segment {
        self.fin = true;
        self
    }

    pub fn rst(mut self) -> Segment {
        self.rst = true;
        self
    }

    pub fn options(mut self, options: &[etherparse::TcpOptionElement]) -> Segment {
        self.options = options.to_vec();
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Segment {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> PacketBuf {
        let mut builder = PacketBuilder::ipv4(self.src.octets(), self.dst.octets(), 64).tcp(
            self.sport,
            self.dport,
            self.seq,
            65535,
        );
        if self.syn {
            builder = builder.syn();
        }
        if let Some(ack) = self.ack {
            builder = builder.ack(ack);
        }
        if self.fin {
            builder = builder.fin();
        }
        if self.rst {
            builder = builder.rst();
        }
        if !self.options.is_empty() {
            builder = builder.options(&self.options).unwrap();
        }
        let mut buf = Vec::with_capacity(builder.size(self.payload.len()));
        builder.write(&mut buf, &self.payload).unwrap();
        PacketBuf::new(AddressFamily::Inet, buf).unwrap()
    }
}

/// Parse a finished packet and re-derive its TCP checksum independently.
pub fn parse_v4(data: &[u8]) -> (Ipv4Header, TcpHeader, Vec<u8>) {
    let (ip, rest) = Ipv4Header::from_slice(data).unwrap();
    let (tcp, payload) = TcpHeader::from_slice(rest).unwrap();
    (ip, tcp, payload.to_vec())
}

pub fn checksum_valid(data: &[u8]) -> bool {
    let (ip, tcp, payload) = parse_v4(data);
    tcp.calc_checksum_ipv4(&ip, &payload).unwrap() == tcp.checksum
}

pub fn l4_off(data: &[u8]) -> usize {
    ((data[0] & 0x0f) as usize) * 4
}

/// TCP data offset in 32-bit words, read off the wire.
pub fn doff(data: &[u8]) -> u8 {
    data[l4_off(data) + 12] >> 4
}

/// The raw option bytes between the fixed TCP header and the data offset.
pub fn raw_options(data: &[u8]) -> Vec<u8> {
    let l4 = l4_off(data);
    let header_len = (doff(data) as usize) * 4;
    data[l4 + 20..l4 + header_len].to_vec()
}
