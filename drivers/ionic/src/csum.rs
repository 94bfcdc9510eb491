// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! TCP pseudo-header preload for segmentation offload.
//!
//! The device adds each segment's length into the TCP checksum field, so the
//! field must start out holding the pseudo-header sum computed with a zero
//! length.

use crate::{
    error::{IonicError, IonicResult},
    stack::{L3Proto, TxPacket},
};

const IPPROTO_TCP: u16 = 6;
const IPV4_HDR_LEN: usize = 20;
const IPV4_CHECK: usize = 10;
const IPV4_ADDRS: core::ops::Range<usize> = 12..20;
const IPV6_HDR_LEN: usize = 40;
const IPV6_ADDRS: core::ops::Range<usize> = 8..40;
const TCP_MIN_HDR_LEN: usize = 20;
const TCP_CHECK: usize = 16;
const TCP_DOFF: usize = 12;

/// Adds big-endian 16-bit words of `bytes` into `sum`.
fn add_words(sum: u32, bytes: &[u8]) -> u32 {
    bytes
        .chunks(2)
        .fold(sum, |acc, w| acc + u32::from(u16::from_be_bytes([w[0], *w.get(1).unwrap_or(&0)])))
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Pseudo-header sum over `addrs` with zero length, not complemented.
pub fn pseudo_hdr_sum(addrs: &[u8]) -> u16 {
    fold(add_words(u32::from(IPPROTO_TCP), addrs))
}

/// Length of the TCP header at `th`, from its data offset.
pub fn tcp_hdrlen(data: &[u8], th: usize) -> IonicResult<usize> {
    let doff = data.get(th + TCP_DOFF).ok_or(IonicError::BadHeader)?;
    let len = usize::from(doff >> 4) * 4;
    if len < TCP_MIN_HDR_LEN || th + len > data.len() {
        return Err(IonicError::BadHeader);
    }
    Ok(len)
}

/// Acquires the header and preloads the (inner, if `inner`) TCP checksum.
pub fn tcp_pseudo_csum<T: TxPacket>(pkt: &mut T, inner: bool) -> IonicResult {
    pkt.cow_head()?;
    let proto = pkt.l3_proto(inner);
    let nh = pkt.network_offset(inner);
    let th = pkt.transport_offset(inner);
    let data = pkt.data_mut();
    if th + TCP_MIN_HDR_LEN > data.len() {
        return Err(IonicError::BadHeader);
    }

    let sum = match proto {
        L3Proto::Ipv4 => {
            if nh + IPV4_HDR_LEN > data.len() {
                return Err(IonicError::BadHeader);
            }
            data[nh + IPV4_CHECK..nh + IPV4_CHECK + 2].fill(0);
            pseudo_hdr_sum(&data[nh + IPV4_ADDRS.start..nh + IPV4_ADDRS.end])
        }
        L3Proto::Ipv6 => {
            if nh + IPV6_HDR_LEN > data.len() {
                return Err(IonicError::BadHeader);
            }
            pseudo_hdr_sum(&data[nh + IPV6_ADDRS.start..nh + IPV6_ADDRS.end])
        }
        L3Proto::Other => return Ok(()),
    };
    data[th + TCP_CHECK..th + TCP_CHECK + 2].copy_from_slice(&sum.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_pseudo_sum() {
        // 10.0.0.1 -> 10.0.0.2
        let addrs = [10, 0, 0, 1, 10, 0, 0, 2];
        assert_eq!(pseudo_hdr_sum(&addrs), 0x1409);
    }

    #[test]
    fn sum_folds_carries() {
        let addrs = [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        // 0xffff + 0xffff + 6 = 0x20004 -> 0x0006
        assert_eq!(pseudo_hdr_sum(&addrs), 0x0006);
    }

    #[test]
    fn tcp_hdrlen_reads_data_offset() {
        let mut hdr = [0u8; 40];
        hdr[TCP_DOFF] = 0x80;
        assert_eq!(tcp_hdrlen(&hdr, 0), Ok(32));
        hdr[TCP_DOFF] = 0x40;
        assert_eq!(tcp_hdrlen(&hdr, 0), Err(IonicError::BadHeader));
        hdr[TCP_DOFF] = 0xf0;
        assert_eq!(tcp_hdrlen(&hdr, 0), Err(IonicError::BadHeader));
    }
}
