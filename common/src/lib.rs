/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Vocabulary types shared between the dataplane and the embedding frame.

use bitflags::bitflags;

/// Address family of a packet or connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// What the frame should do with a packet after a hook returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Which block of the state tables drives a transition.
///
/// The frame picks the direction per packet path and forwarding mode; for a
/// full-NAT connection the balancer originates toward the backend, so
/// client-to-backend traffic runs the `Output` block and backend replies the
/// `Input` block. The input-only block that replaces `Input` while the
/// connection has seen no `Output` packet is derived internally from the
/// connection flags, not expressed here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// Per-connection TCP state.
///
/// `Last` is a table sentinel: it sizes the timeout table and bounds state
/// name lookups, and is never a valid connection state or transition target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum TcpState {
    None = 0,
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait = 4,
    TimeWait = 5,
    Close = 6,
    CloseWait = 7,
    LastAck = 8,
    Listen = 9,
    SynAck = 10,
    Last = 11,
}

impl TcpState {
    /// Number of real states, excluding the `Last` sentinel.
    pub const COUNT: usize = 11;

    /// Table entries, including the sentinel slot.
    pub const TABLE_LEN: usize = 12;

    pub const fn name(self) -> &'static str {
        match self {
            TcpState::None => "NONE",
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::SynAck => "SYNACK",
            TcpState::Last => "ERR!",
        }
    }

    pub fn from_name(name: &str) -> Option<TcpState> {
        let all = [
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
        ];
        all.into_iter().find(|s| s.name() == name)
    }
}

bitflags! {
    /// Connection mode and bookkeeping bits.
    ///
    /// The bits mutated by the dataplane after connection setup (`NO_OUTPUT`,
    /// `INACTIVE`, `CIP_INSERTED`) live in an atomic on the connection record;
    /// the forwarding-mode bits are fixed at creation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ConnFlags: u32 {
        /// Classic NAT: destination rewritten on ingress, source on egress.
        const MASQ = 1 << 0;
        /// Full NAT: both source and destination rewritten on ingress.
        const FULLNAT = 1 << 1;
        /// No Output-direction packet observed on this connection yet.
        const NO_OUTPUT = 1 << 2;
        /// Connection is counted against the destination's inactive counter.
        const INACTIVE = 1 << 3;
        /// The client-address option was already handled for this connection.
        /// Monotonic: once set it is never cleared except by an ISN re-init.
        const CIP_INSERTED = 1 << 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for idx in 0..TcpState::COUNT {
            let state = match idx {
                0 => TcpState::None,
                1 => TcpState::Established,
                2 => TcpState::SynSent,
                3 => TcpState::SynRecv,
                4 => TcpState::FinWait,
                5 => TcpState::TimeWait,
                6 => TcpState::Close,
                7 => TcpState::CloseWait,
                8 => TcpState::LastAck,
                9 => TcpState::Listen,
                10 => TcpState::SynAck,
                _ => unreachable!(),
            };
            assert_eq!(TcpState::from_name(state.name()), Some(state));
        }
    }

    #[test]
    fn sentinel_has_no_name() {
        assert_eq!(TcpState::Last.name(), "ERR!");
        assert_eq!(TcpState::from_name("ERR!"), None);
    }
}
