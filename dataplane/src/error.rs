/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use thiserror::Error;

/// Internal error kinds of the TCP dataplane.
///
/// The hooks exported through [`crate::Protocol`] map every error to a drop
/// verdict or a `false` return; the variants exist so call sites inside the
/// crate can log and test the precise failure.
#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("bad TCP data offset {0}")]
    BadDataOffset(u8),

    #[error("TCP checksum verification failed")]
    Checksum,

    #[error("application helper rejected packet")]
    AppReject,

    #[error("syn-proxy refused packet (ack storm)")]
    ProxyAbort,

    #[error("application helper already registered on port {0}")]
    AppExists(u16),

    #[error("unknown TCP state name {0:?}")]
    UnknownState(String),

    #[error("transmit path refused packet")]
    Xmit,
}
