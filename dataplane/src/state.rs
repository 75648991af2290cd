/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Per-connection TCP state machine.
//!
//! Two fixed tables (normal and secure) with three direction blocks each.
//! The secure table biases toward early termination when the balancer is
//! under suspected attack; selection is a single process-wide toggle read
//! once per packet.

use log::debug;

use common::{ConnFlags, Direction, TcpState};

use crate::config::TimeoutTable;
use crate::conn::Conn;

const DIR_INPUT: usize = 0;
const DIR_OUTPUT: usize = 4;
const DIR_INPUT_ONLY: usize = 8;

// Short aliases so the tables line up the way they are usually read.
use common::TcpState::{
    Close as CL, CloseWait as CW, Established as ES, FinWait as FW, LastAck as LA, Listen as LI,
    None as NO, SynAck as SA, SynRecv as SR, SynSent as SS, TimeWait as TW,
};

type StateRow = [TcpState; TcpState::COUNT];

#[rustfmt::skip]
static TCP_STATES: [StateRow; 12] = [
    // INPUT
    //        NO   ES   SS   SR   FW   TW   CL   CW   LA   LI   SA
    /* syn */ [SR,  ES,  ES,  SR,  SR,  SR,  SR,  SR,  SR,  SR,  SR],
    /* fin */ [CL,  CW,  SS,  TW,  TW,  TW,  CL,  CW,  LA,  LI,  TW],
    /* ack */ [CL,  ES,  SS,  ES,  FW,  TW,  CL,  CW,  CL,  LI,  ES],
    /* rst */ [CL,  CL,  CL,  SR,  CL,  CL,  CL,  CL,  LA,  LI,  SR],

    // OUTPUT
    //        NO   ES   SS   SR   FW   TW   CL   CW   LA   LI   SA
    /* syn */ [SS,  ES,  SS,  SR,  SS,  SS,  SS,  SS,  SS,  LI,  SR],
    /* fin */ [TW,  FW,  SS,  TW,  FW,  TW,  CL,  TW,  LA,  LI,  TW],
    /* ack */ [ES,  ES,  SS,  ES,  FW,  TW,  CL,  CW,  LA,  ES,  ES],
    /* rst */ [CL,  CL,  SS,  CL,  CL,  TW,  CL,  CL,  CL,  CL,  CL],

    // INPUT-ONLY
    //        NO   ES   SS   SR   FW   TW   CL   CW   LA   LI   SA
    /* syn */ [SR,  ES,  ES,  SR,  SR,  SR,  SR,  SR,  SR,  SR,  SR],
    /* fin */ [CL,  FW,  SS,  TW,  FW,  TW,  CL,  CW,  LA,  LI,  TW],
    /* ack */ [CL,  ES,  SS,  ES,  FW,  TW,  CL,  CW,  CL,  LI,  ES],
    /* rst */ [CL,  CL,  CL,  SR,  CL,  CL,  CL,  CL,  LA,  LI,  CL],
];

#[rustfmt::skip]
static TCP_STATES_DOS: [StateRow; 12] = [
    // INPUT
    //        NO   ES   SS   SR   FW   TW   CL   CW   LA   LI   SA
    /* syn */ [SR,  ES,  ES,  SR,  SR,  SR,  SR,  SR,  SR,  SR,  SA],
    /* fin */ [CL,  CW,  SS,  TW,  TW,  TW,  CL,  CW,  LA,  LI,  TW],
    /* ack */ [CL,  ES,  SS,  SR,  FW,  TW,  CL,  CW,  CL,  LI,  SA],
    /* rst */ [CL,  CL,  CL,  SR,  CL,  CL,  CL,  CL,  LA,  LI,  CL],

    // OUTPUT
    //        NO   ES   SS   SR   FW   TW   CL   CW   LA   LI   SA
    /* syn */ [SS,  ES,  SS,  SA,  SS,  SS,  SS,  SS,  SS,  LI,  SA],
    /* fin */ [TW,  FW,  SS,  TW,  FW,  TW,  CL,  TW,  LA,  LI,  TW],
    /* ack */ [ES,  ES,  SS,  ES,  FW,  TW,  CL,  CW,  LA,  ES,  ES],
    /* rst */ [CL,  CL,  SS,  CL,  CL,  TW,  CL,  CL,  CL,  CL,  CL],

    // INPUT-ONLY
    //        NO   ES   SS   SR   FW   TW   CL   CW   LA   LI   SA
    /* syn */ [SA,  ES,  ES,  SR,  SA,  SA,  SA,  SA,  SA,  SA,  SA],
    /* fin */ [CL,  FW,  SS,  TW,  FW,  TW,  CL,  CW,  LA,  LI,  TW],
    /* ack */ [CL,  ES,  SS,  ES,  FW,  TW,  CL,  CW,  CL,  LI,  ES],
    /* rst */ [CL,  CL,  CL,  SR,  CL,  CL,  CL,  CL,  LA,  LI,  CL],
];

/// Flag bits of one packet, snapshotted before taking the connection lock.
#[derive(Copy, Clone, Debug)]
pub struct FlagSnapshot {
    pub syn: bool,
    pub fin: bool,
    pub ack: bool,
    pub rst: bool,
}

/// Input symbol with priority RST > SYN > FIN > ACK. Any other combination
/// produces no transition.
fn state_idx(th: FlagSnapshot) -> Option<usize> {
    if th.rst {
        Some(3)
    } else if th.syn {
        Some(0)
    } else if th.fin {
        Some(1)
    } else if th.ack {
        Some(2)
    } else {
        None
    }
}

/// Drive one transition attempt under the connection lock.
///
/// Returns `true`; the state machine never asks the frame to drop a packet,
/// it only retimes the connection.
pub(crate) fn set_tcp_state(
    conn: &Conn,
    direction: Direction,
    th: FlagSnapshot,
    secure: bool,
    timeouts: &TimeoutTable,
) -> bool {
    let table: &[StateRow; 12] = if secure { &TCP_STATES_DOS } else { &TCP_STATES };

    let mut ctx = conn.state_ctx();

    let mut off = match direction {
        Direction::Input => DIR_INPUT,
        Direction::Output => DIR_OUTPUT,
    };
    if conn.test_flag(ConnFlags::NO_OUTPUT) {
        if direction == Direction::Output {
            conn.clear_flag(ConnFlags::NO_OUTPUT);
        } else {
            off = DIR_INPUT_ONLY;
        }
    }

    let Some(idx) = state_idx(th) else {
        debug!("tcp: no state symbol for flags {:?}", th);
        return true;
    };

    let new_state = table[off + idx][ctx.state as usize];
    if new_state != ctx.state {
        debug!(
            "tcp: {:?} {}:{}->{}:{} state {} -> {}",
            direction,
            conn.caddr(),
            conn.cport(),
            conn.daddr(),
            conn.dport(),
            ctx.state.name(),
            new_state.name(),
        );

        if let Some(dest) = conn.dest() {
            // one counter pair moves per crossing of the ESTABLISHED boundary
            if !conn.test_flag(ConnFlags::INACTIVE) && new_state != TcpState::Established {
                dest.mark_inactive();
                conn.set_flag(ConnFlags::INACTIVE);
            } else if conn.test_flag(ConnFlags::INACTIVE) && new_state == TcpState::Established {
                dest.mark_active();
                conn.clear_flag(ConnFlags::INACTIVE);
            }
        }

        ctx.old_state = ctx.state;
        ctx.state = new_state;
        ctx.timeout = timeouts.get(new_state);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AddressFamily;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::conn::Dest;

    const SYN: FlagSnapshot = FlagSnapshot {
        syn: true,
        fin: false,
        ack: false,
        rst: false,
    };
    const SYN_ACK: FlagSnapshot = FlagSnapshot {
        syn: true,
        fin: false,
        ack: true,
        rst: false,
    };
    const ACK: FlagSnapshot = FlagSnapshot {
        syn: false,
        fin: false,
        ack: true,
        rst: false,
    };
    const FIN: FlagSnapshot = FlagSnapshot {
        syn: false,
        fin: true,
        ack: true,
        rst: false,
    };
    const RST: FlagSnapshot = FlagSnapshot {
        syn: false,
        fin: false,
        ack: false,
        rst: true,
    };

    fn conn(dest: Option<Arc<Dest>>) -> Conn {
        Conn::new(
            AddressFamily::Inet,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)),
            80,
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5)),
            8080,
            common::ConnFlags::FULLNAT,
            dest,
        )
    }

    #[test]
    fn handshake_walks_none_syn_sent_established() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);

        // first SYN leaves on the OUTPUT direction toward the backend
        set_tcp_state(&c, Direction::Output, SYN, false, &timeouts);
        assert_eq!(c.state().0, TcpState::SynSent);

        set_tcp_state(&c, Direction::Input, SYN_ACK, false, &timeouts);
        assert_eq!(c.state().0, TcpState::Established);
        assert_eq!(c.state().1, TcpState::SynSent);
        assert_eq!(c.timeout(), Duration::from_secs(90));
    }

    #[test]
    fn rst_closes_from_established() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);
        set_tcp_state(&c, Direction::Output, SYN, false, &timeouts);
        set_tcp_state(&c, Direction::Input, SYN_ACK, false, &timeouts);
        set_tcp_state(&c, Direction::Input, RST, false, &timeouts);
        assert_eq!(c.state().0, TcpState::Close);
    }

    #[test]
    fn fin_teardown_reaches_time_wait() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);
        set_tcp_state(&c, Direction::Output, SYN, false, &timeouts);
        set_tcp_state(&c, Direction::Input, SYN_ACK, false, &timeouts);
        set_tcp_state(&c, Direction::Output, FIN, false, &timeouts);
        assert_eq!(c.state().0, TcpState::FinWait);
        set_tcp_state(&c, Direction::Input, FIN, false, &timeouts);
        assert_eq!(c.state().0, TcpState::TimeWait);
    }

    #[test]
    fn no_output_downgrades_input_direction() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);
        // NO_OUTPUT holds, so INPUT uses the input-only block:
        // a FIN in ESTABLISHED goes to FIN_WAIT there, not CLOSE_WAIT.
        {
            let mut ctx = c.state_ctx();
            ctx.state = TcpState::Established;
        }
        set_tcp_state(&c, Direction::Input, FIN, false, &timeouts);
        assert_eq!(c.state().0, TcpState::FinWait);
    }

    #[test]
    fn output_clears_no_output_and_uses_output_block() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);
        assert!(c.test_flag(ConnFlags::NO_OUTPUT));
        set_tcp_state(&c, Direction::Output, ACK, false, &timeouts);
        assert!(!c.test_flag(ConnFlags::NO_OUTPUT));
        assert_eq!(c.state().0, TcpState::Established);
    }

    #[test]
    fn secure_table_parks_input_syn_on_synack() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);
        {
            let mut ctx = c.state_ctx();
            ctx.state = TcpState::SynAck;
        }
        set_tcp_state(&c, Direction::Input, SYN, true, &timeouts);
        assert_eq!(c.state().0, TcpState::SynAck);
        // the normal table would have moved to SYN_RECV
        let c2 = conn(None);
        {
            let mut ctx = c2.state_ctx();
            ctx.state = TcpState::SynAck;
        }
        set_tcp_state(&c2, Direction::Input, SYN, false, &timeouts);
        assert_eq!(c2.state().0, TcpState::SynRecv);
    }

    #[test]
    fn flag_combination_without_symbol_is_a_no_op() {
        let timeouts = TimeoutTable::default();
        let c = conn(None);
        let none = FlagSnapshot {
            syn: false,
            fin: false,
            ack: false,
            rst: false,
        };
        assert!(set_tcp_state(&c, Direction::Input, none, false, &timeouts));
        assert_eq!(c.state().0, TcpState::None);
    }

    #[test]
    fn counters_conserve_across_established_boundary() {
        let timeouts = TimeoutTable::default();
        let dest = Dest::new(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5)), 8080);
        let c = conn(Some(dest.clone()));
        assert_eq!((dest.activeconns(), dest.inactconns()), (0, 1));

        set_tcp_state(&c, Direction::Output, SYN, false, &timeouts);
        assert_eq!((dest.activeconns(), dest.inactconns()), (0, 1));

        set_tcp_state(&c, Direction::Input, SYN_ACK, false, &timeouts);
        assert_eq!((dest.activeconns(), dest.inactconns()), (1, 0));

        set_tcp_state(&c, Direction::Input, FIN, false, &timeouts);
        assert_eq!(c.state().0, TcpState::CloseWait);
        assert_eq!((dest.activeconns(), dest.inactconns()), (0, 1));

        // a transition that does not change state moves no counters
        set_tcp_state(&c, Direction::Output, ACK, false, &timeouts);
        assert_eq!(c.state().0, TcpState::CloseWait);
        assert_eq!((dest.activeconns(), dest.inactconns()), (0, 1));
    }

    #[test]
    fn determinism_per_table_selection() {
        // next state is a pure function of
        // (direction block, symbol, current state)
        let timeouts = TimeoutTable::default();
        for secure in [false, true] {
            for sym in [SYN, FIN, ACK, RST] {
                for state_idx in 0..TcpState::COUNT {
                    let next = |_: ()| {
                        let c = conn(None);
                        {
                            let mut ctx = c.state_ctx();
                            ctx.state = state_from(state_idx);
                        }
                        c.clear_flag(ConnFlags::NO_OUTPUT);
                        set_tcp_state(&c, Direction::Input, sym, secure, &timeouts);
                        c.state().0
                    };
                    assert_eq!(next(()), next(()));
                }
            }
        }
    }

    fn state_from(idx: usize) -> TcpState {
        [NO, ES, SS, SR, FW, TW, CL, CW, LA, LI, SA][idx]
    }
}
