/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Ones-complement checksum kit.
//!
//! Accumulators are wide (`u64`) sums of big-endian 16-bit words. A stored
//! TCP/IP checksum field is the complemented fold of such a sum, except in
//! partial (hardware offload) mode where the field holds the un-complemented
//! pseudo-header sum and the NIC finishes the job.

use std::net::IpAddr;

const TCP_PROTO: u64 = 6;

/// Reduce a wide accumulator to 16 bits with end-around carry.
#[inline]
fn reduce(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Fold an accumulator into the complemented form stored in checksum fields.
#[inline]
pub fn csum_fold(sum: u64) -> u16 {
    !reduce(sum)
}

/// Load a stored (complemented) checksum field back into an accumulator.
#[inline]
pub fn csum_unfold(check: u16) -> u64 {
    (!check) as u64
}

/// Sum a byte slice as big-endian 16-bit words; an odd tail byte is padded
/// with zero on the right.
pub fn sum_slice(mut sum: u64, bytes: &[u8]) -> u64 {
    let mut chunks = bytes.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [tail] = chunks.remainder() {
        sum += u16::from_be_bytes([*tail, 0]) as u64;
    }
    sum
}

/// Incremental replacement of one 16-bit quantity in a stored checksum.
#[inline]
pub fn csum_replace2(check: u16, old: u16, new: u16) -> u16 {
    csum_fold(csum_unfold(check) + (!old) as u64 + new as u64)
}

/// Incremental replacement of a 32-bit quantity (an IPv4 address).
#[inline]
pub fn csum_replace4(check: u16, old: u32, new: u32) -> u16 {
    let mut sum = csum_unfold(check);
    sum = sum_slice(sum, &(!old).to_be_bytes());
    sum = sum_slice(sum, &new.to_be_bytes());
    csum_fold(sum)
}

/// Incremental replacement of a 16-byte quantity (an IPv6 address).
pub fn csum_replace16(check: u16, old: &[u8; 16], new: &[u8; 16]) -> u16 {
    let mut sum = csum_unfold(check);
    let mut flipped = *old;
    for byte in &mut flipped {
        *byte = !*byte;
    }
    sum = sum_slice(sum, &flipped);
    sum = sum_slice(sum, new);
    csum_fold(sum)
}

/// Pseudo-header sum for the given address pair and L4 length.
fn pseudo_sum(src: &IpAddr, dst: &IpAddr, l4_len: usize) -> u64 {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum_slice(sum_slice(0, &s.octets()), &d.octets())
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum_slice(sum_slice(0, &s.octets()), &d.octets())
        }
        _ => unreachable!("mixed address families in pseudo header"),
    };
    sum += TCP_PROTO;
    sum += l4_len as u64;
    sum
}

/// Folded, un-complemented pseudo-header checksum: the value an offload
/// packet carries in its checksum field for the hardware to finish.
pub fn pseudo_checksum(src: &IpAddr, dst: &IpAddr, l4_len: usize) -> u16 {
    reduce(pseudo_sum(src, dst, l4_len))
}

/// Full TCP checksum over the pseudo-header and the L4 segment.
///
/// The caller zeroes the checksum field before handing over `l4`.
pub fn tcp_checksum(src: &IpAddr, dst: &IpAddr, l4: &[u8]) -> u16 {
    csum_fold(sum_slice(pseudo_sum(src, dst, l4.len()), l4))
}

/// Verify a full TCP checksum; `l4` includes the stored checksum field.
pub fn tcp_checksum_valid(src: &IpAddr, dst: &IpAddr, l4: &[u8]) -> bool {
    reduce(sum_slice(pseudo_sum(src, dst, l4.len()), l4)) == 0xffff
}

/// Partial-mode (offload) update.
///
/// In partial mode the stored field is the un-complemented pseudo-header sum,
/// so only the L4 length word and the translated address contribute.
pub fn partial_csum_update(
    check: u16,
    old_addr: &IpAddr,
    new_addr: &IpAddr,
    old_l4_len: u16,
    new_l4_len: u16,
) -> u16 {
    let mut sum = check as u64;
    sum += (!old_l4_len) as u64 + new_l4_len as u64;
    match (old_addr, new_addr) {
        (IpAddr::V4(old), IpAddr::V4(new)) => {
            sum = sum_slice(sum, &(!u32::from(*old)).to_be_bytes());
            sum = sum_slice(sum, &new.octets());
        }
        (IpAddr::V6(old), IpAddr::V6(new)) => {
            let mut flipped = old.octets();
            for byte in &mut flipped {
                *byte = !*byte;
            }
            sum = sum_slice(sum, &flipped);
            sum = sum_slice(sum, &new.octets());
        }
        _ => unreachable!("mixed address families in partial csum update"),
    }
    reduce(sum)
}
