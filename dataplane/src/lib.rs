/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! TCP dataplane of the virga layer-4 virtual server.
//!
//! For each TCP packet the frame hands over, this crate decides whether the
//! packet opens a balanced connection, rewrites addresses, ports, sequence
//! numbers, options and checksums for the connection's translation mode,
//! drives the per-connection state machine that assigns idle timeouts, and
//! synthesizes RSTs when a connection expires.
//!
//! The frame keeps the connection table, the service registry and the
//! transmit paths; this crate reaches them through the traits in
//! [`framework`] and [`synproxy`]. Everything here either completes
//! synchronously or returns a drop verdict; nothing blocks.

mod app;
pub mod config;
pub mod conn;
pub mod csum;
pub mod error;
pub mod framework;
pub mod options;
pub mod packet;
pub mod proto;
mod rst;
mod schedule;
pub mod seq;
pub mod state;
pub mod synproxy;
mod translate;

pub use common::{AddressFamily, ConnFlags, Direction, TcpState, Verdict};

pub use crate::config::{TcpConfig, TimeoutTable};
pub use crate::conn::{Conn, ConnReuseStats, Dest, RsSeq};
pub use crate::error::DataplaneError;
pub use crate::framework::{AppHelper, Flow, Service, ServiceRegistry, Transmit};
pub use crate::packet::{CsumMode, PacketBuf};
pub use crate::proto::{Protocol, TcpProto, TIMEOUT_FLAG_SECURE};
pub use crate::seq::{seq_after, seq_before, FnatSeq, IsnGenerator};
pub use crate::synproxy::{NoSynProxy, ProxyAction, SynProxy, SynProxySeq};
