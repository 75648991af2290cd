/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Runtime configuration: feature toggles and per-state idle timeouts.
//!
//! The embedding frame owns how these get set (flags, control API, whatever);
//! the dataplane only reads them per packet, so every entry is an atomic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use common::TcpState;

use crate::error::DataplaneError;

/// Feature toggles of the TCP dataplane.
#[derive(Debug)]
pub struct TcpConfig {
    /// Drop non-SYN packets addressed to a virtual IP without a service.
    pub drop_entry: AtomicBool,
    /// Shrink the advertised MSS so the client-address option still fits.
    pub mss_adjust: AtomicBool,
    /// NOP-out the timestamp option on the client's initial SYN.
    pub timestamp_remove: AtomicBool,
    /// Inject the client-address option on full-NAT connections.
    pub toa: AtomicBool,
    /// Send RSTs toward both peers when a connection expires.
    pub conn_expire_tcp_rst: AtomicBool,
    /// Permit ISN re-initialization for reused SYN_SENT/SYN_RECV connections.
    pub conn_reused: AtomicBool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            drop_entry: AtomicBool::new(false),
            mss_adjust: AtomicBool::new(true),
            timestamp_remove: AtomicBool::new(true),
            toa: AtomicBool::new(true),
            conn_expire_tcp_rst: AtomicBool::new(true),
            conn_reused: AtomicBool::new(true),
        }
    }
}

impl TcpConfig {
    pub fn drop_entry(&self) -> bool {
        self.drop_entry.load(Ordering::Relaxed)
    }

    pub fn mss_adjust(&self) -> bool {
        self.mss_adjust.load(Ordering::Relaxed)
    }

    pub fn timestamp_remove(&self) -> bool {
        self.timestamp_remove.load(Ordering::Relaxed)
    }

    pub fn toa(&self) -> bool {
        self.toa.load(Ordering::Relaxed)
    }

    pub fn conn_expire_tcp_rst(&self) -> bool {
        self.conn_expire_tcp_rst.load(Ordering::Relaxed)
    }

    pub fn conn_reused(&self) -> bool {
        self.conn_reused.load(Ordering::Relaxed)
    }
}

/// Idle timeout per state, in whole seconds.
///
/// Handshake states stay short, LISTEN is long, ESTABLISHED is moderate.
/// The sentinel slot exists so indexing by any state is total.
#[derive(Debug)]
pub struct TimeoutTable {
    secs: [AtomicU32; TcpState::TABLE_LEN],
}

const DEFAULT_TIMEOUTS: [u32; TcpState::TABLE_LEN] = [
    120, // NONE
    90,  // ESTABLISHED
    3,   // SYN_SENT
    30,  // SYN_RECV
    7,   // FIN_WAIT
    7,   // TIME_WAIT
    3,   // CLOSE
    7,   // CLOSE_WAIT
    7,   // LAST_ACK
    120, // LISTEN
    30,  // SYNACK
    2,   // sentinel
];

impl Default for TimeoutTable {
    fn default() -> Self {
        TimeoutTable {
            secs: std::array::from_fn(|i| AtomicU32::new(DEFAULT_TIMEOUTS[i])),
        }
    }
}

impl TimeoutTable {
    pub fn get(&self, state: TcpState) -> Duration {
        Duration::from_secs(self.secs[state as usize].load(Ordering::Relaxed) as u64)
    }

    pub fn set(&self, state: TcpState, seconds: u32) {
        self.secs[state as usize].store(seconds, Ordering::Relaxed);
    }

    /// Set a timeout by its state name, for control-surface plumbing.
    pub fn set_by_name(&self, name: &str, seconds: u32) -> Result<(), DataplaneError> {
        let state = TcpState::from_name(name)
            .ok_or_else(|| DataplaneError::UnknownState(name.to_string()))?;
        self.set(state, seconds);
        Ok(())
    }
}
