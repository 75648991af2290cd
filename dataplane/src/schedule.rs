/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! First-packet admission: service lookup and backend scheduling.

use std::sync::Arc;

use log::debug;

use common::{AddressFamily, Verdict};

use crate::conn::Conn;
use crate::framework::Flow;
use crate::packet::PacketBuf;
use crate::proto::TcpProto;

impl TcpProto {
    /// Decide whether this packet opens a balanced connection.
    ///
    /// `(Accept, Some(conn))` hands a fresh connection to the caller,
    /// `(Accept, None)` lets the packet pass untouched, `(Drop, None)` sheds
    /// it. The packet's TCP window was validated when the buffer was built,
    /// so no re-parse can fail here.
    pub(crate) fn tcp_conn_schedule(
        &self,
        af: AddressFamily,
        pkt: &mut PacketBuf,
    ) -> (Verdict, Option<Arc<Conn>>) {
        let flow = Flow::of(pkt);

        // step 2 of a proxied handshake may complete here, before any
        // service lookup
        if let Some((verdict, conn)) = self.synproxy().ack_rcv(pkt, &flow) {
            return (verdict, conn);
        }

        let opens_flow = {
            let tcp = pkt.tcp();
            tcp.syn() && !tcp.ack() && !tcp.fin() && !tcp.rst()
        };

        if opens_flow {
            let Some(svc) = self
                .registry()
                .lookup(pkt.mark(), af, &flow.daddr, flow.dport)
            else {
                return (Verdict::Accept, None);
            };
            if self.registry().overloaded() {
                debug!("tcp: overloaded, shedding new connection {:?}", flow);
                return (Verdict::Drop, None);
            }
            match svc.schedule(&flow) {
                Some(conn) => (Verdict::Accept, Some(conn)),
                None => (svc.no_backend(pkt, &flow), None),
            }
        } else {
            // stray non-opening traffic to a virtual IP with no service
            if self.config().drop_entry()
                && self
                    .registry()
                    .lookup(pkt.mark(), af, &flow.daddr, flow.dport)
                    .is_none()
                && self.registry().has_vip(af, &flow.daddr)
            {
                debug!("tcp: dropping stray packet to vip {:?}", flow.daddr);
                return (Verdict::Drop, None);
            }
            (Verdict::Accept, None)
        }
    }
}
