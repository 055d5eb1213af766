//! Fragment size negotiation.
//!
//! The data link may aggregate several information PDUs into one link-level
//! frame. When the peer's link MIU is much larger than its per-connection
//! MIU, shrinking each fragment a little lets a whole aggregated frame fill
//! up evenly instead of ending in a short tail. The result only affects
//! throughput.

/// Aggregation-frame header plus per-fragment header overhead.
pub const AGGREGATION_OVERHEAD: u16 = 9;

/// Per-fragment overhead inside an aggregated frame
/// (length field, PDU header, sequence byte).
pub const FRAGMENT_OVERHEAD: u16 = 5;

/// Compute the per-fragment payload size to use towards a peer.
///
/// * `remote_link_miu` - largest link-level frame the peer accepts
/// * `peer_miu` - MIU the peer declared for this connection
/// * `peer_rw` - peer's receive window
///
/// The result never exceeds `peer_miu`.
///
/// # Example
///
/// ```
/// use snep_exchange::protocol::efficient_miu;
///
/// // 2 fragments of 123 fit an aggregated 256-byte frame.
/// assert_eq!(efficient_miu(256, 128, 2), 123);
/// // Window too small to benefit: keep the declared MIU.
/// assert_eq!(efficient_miu(256, 128, 1), 128);
/// ```
pub fn efficient_miu(remote_link_miu: u16, peer_miu: u16, peer_rw: u8) -> u16 {
    let link = u32::from(remote_link_miu);
    let miu = u32::from(peer_miu);

    if link <= miu + u32::from(AGGREGATION_OVERHEAD) {
        return peer_miu;
    }

    let per_fragment = miu + u32::from(FRAGMENT_OVERHEAD);
    let fragments = link.div_ceil(per_fragment);

    if fragments > u32::from(peer_rw) {
        return peer_miu;
    }

    let redistributed = (link / fragments).saturating_sub(u32::from(FRAGMENT_OVERHEAD));
    if redistributed == 0 {
        return peer_miu;
    }
    redistributed.min(miu) as u16
}
