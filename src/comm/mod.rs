//! Communication: structured data movement integrated with coherence
//!
//! Sending a tile reads its best valid instance; receiving one installs
//! (or refreshes) a workspace instance in `Shared` — moving a tile *is* a
//! coherence transition. On top of point-to-point movement this module
//! provides broadcast trees, reduction trees, and tagged variable-count
//! gather/scatter, all disambiguated through reserved tag ranges.

mod pattern;
mod tags;
mod transport;

pub use pattern::{cube_bcast_pattern, cube_reduce_pattern};
pub use tags::{salt, TagPool, TagRange};
pub use transport::{ChannelTransport, Transport, RECV_TIMEOUT};

use crate::coherence::{Access, Coherence};
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::tile::{Layout, MemLoc, Tile};
use std::collections::HashMap;
use std::sync::Arc;

/// Tree radix used by the built-in collectives
pub const BCAST_RADIX: usize = 2;

/// One broadcast work item: deliver tile `(i, j)` from `root` to `ranks`
#[derive(Clone, Debug)]
pub struct BcastItem {
    /// Tile row index
    pub i: i64,
    /// Tile column index
    pub j: i64,
    /// Rank holding the source instance
    pub root: usize,
    /// Destination ranks (the root may appear; it is ignored)
    pub ranks: Vec<usize>,
}

/// Send tile `(i, j)` to `dst`. The sender's state is unchanged.
pub fn tile_send<T: Scalar>(
    coh: &Coherence<T>,
    transport: &Arc<dyn Transport>,
    i: i64,
    j: i64,
    dst: usize,
    tag: u32,
) -> Result<()> {
    let bytes = coh.pack_for_send(i, j)?;
    transport.send(&bytes, dst, tag)
}

/// Receive tile `(i, j)` from `src` into a host workspace instance.
pub fn tile_recv<T: Scalar>(
    coh: &Coherence<T>,
    transport: &Arc<dyn Transport>,
    i: i64,
    j: i64,
    src: usize,
    layout: Layout,
    tag: u32,
) -> Result<()> {
    let bytes = transport.recv(src, tag)?;
    coh.install_received(i, j, MemLoc::Host, layout, &bytes)
}

/// Deterministic participant order for a collective: root first, the
/// remaining ranks ascending.
fn participant_order(root: usize, ranks: &[usize]) -> Vec<usize> {
    let mut rest: Vec<usize> = ranks.iter().copied().filter(|r| *r != root).collect();
    rest.sort_unstable();
    rest.dedup();
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(root);
    out.extend(rest);
    out
}

/// Run a list of broadcasts down per-set hypercube trees.
///
/// Items sharing a destination set share one tree shape; every item gets
/// its own tag from `tags` at `tag_base + position`, so concurrent trees
/// on overlapping rank sets cannot cross. On return, every destination
/// rank holds the tile in `Shared` with the root's exact bytes; the
/// root's state is unchanged.
pub fn list_bcast<T: Scalar>(
    coh: &Coherence<T>,
    transport: &Arc<dyn Transport>,
    items: &[BcastItem],
    layout: Layout,
    tags: &TagRange,
    tag_base: u32,
) -> Result<()> {
    let me = transport.rank();

    // group by (root, destination set) to amortise tree construction
    let mut groups: HashMap<(usize, Vec<usize>), Vec<usize>> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
        let order = participant_order(item.root, &item.ranks);
        groups.entry((item.root, order)).or_default().push(idx);
    }
    // every rank must walk the groups in the same order, or chains of
    // blocking receives across trees could cycle
    let mut groups: Vec<((usize, Vec<usize>), Vec<usize>)> = groups.into_iter().collect();
    groups.sort();

    for ((_, order), group_items) in groups {
        if order.len() < 2 {
            continue; // nothing to deliver
        }
        let my_idx = match order.iter().position(|r| *r == me) {
            Some(p) => p,
            None => continue,
        };
        let (recv_from, send_to) = cube_bcast_pattern(order.len(), my_idx, BCAST_RADIX);
        log::debug!(
            "bcast group of {} ({} items): idx {} recv {:?} send {:?}",
            order.len(),
            group_items.len(),
            my_idx,
            recv_from,
            send_to
        );

        for idx in group_items {
            let item = &items[idx];
            let tag = tags.tag(tag_base + idx as u32);

            let bytes = if my_idx == 0 {
                coh.pack_for_send(item.i, item.j)?
            } else {
                let src = order[recv_from[0]];
                let bytes = transport.recv(src, tag)?;
                coh.install_received(item.i, item.j, MemLoc::Host, layout, &bytes)?;
                bytes
            };
            // forward before returning
            for &child in &send_to {
                transport.send(&bytes, order[child], tag)?;
            }
        }
    }
    Ok(())
}

/// Fold each participant's copy of tile `(i, j)` up a reduction tree.
///
/// `combine(acc, incoming)` accumulates in place. Every rank in `ranks`
/// must hold a valid contribution before the call; afterwards the root
/// holds the accumulated tile in `Modified` and the other participants'
/// copies are consumed (workspace to release).
pub fn tile_reduce<T: Scalar>(
    coh: &Coherence<T>,
    transport: &Arc<dyn Transport>,
    i: i64,
    j: i64,
    root: usize,
    ranks: &[usize],
    layout: Layout,
    tag: u32,
    combine: &(dyn Fn(&Tile<T>, &Tile<T>) + Sync),
) -> Result<()> {
    let me = transport.rank();
    let order = participant_order(root, ranks);
    let my_idx = match order.iter().position(|r| *r == me) {
        Some(p) => p,
        None => return Ok(()),
    };
    if order.len() < 2 {
        return Ok(());
    }
    let (recv_from, send_to) = cube_reduce_pattern(order.len(), my_idx, BCAST_RADIX);

    let acc = coh.acquire(i, j, MemLoc::Host, Access::ReadWrite, layout)?;
    let mb = acc.mb();
    let nb = acc.nb();

    let mut scratch = vec![T::zero(); (mb * nb) as usize];
    let scratch_tile = Tile::new(
        scratch.as_mut_ptr(),
        mb,
        nb,
        mb,
        Layout::ColMajor,
        MemLoc::Host,
        false,
    );
    for &child in &recv_from {
        let bytes = transport.recv(order[child], tag)?;
        scratch_tile.unpack_from(&bytes);
        combine(&acc.tile(), &scratch_tile);
    }

    if let Some(&parent) = send_to.first() {
        let mut bytes = Vec::new();
        acc.tile().pack_into(&mut bytes);
        transport.send(&bytes, order[parent], tag)?;
    }
    Ok(())
}

/// Variable-count gather to `root` under a caller-supplied tag.
///
/// Returns `Some(parts)` (indexed by rank) on the root, `None` elsewhere.
pub fn tagged_gatherv(
    transport: &Arc<dyn Transport>,
    send: &[u8],
    root: usize,
    tag: u32,
) -> Result<Option<Vec<Vec<u8>>>> {
    if transport.rank() == root {
        let mut parts = Vec::with_capacity(transport.size());
        for r in 0..transport.size() {
            if r == root {
                parts.push(send.to_vec());
            } else {
                parts.push(transport.recv(r, tag)?);
            }
        }
        Ok(Some(parts))
    } else {
        transport.send(send, root, tag)?;
        Ok(None)
    }
}

/// Variable-count scatter from `root` under a caller-supplied tag.
///
/// `parts` must be `Some` on the root (indexed by rank) and is ignored
/// elsewhere; every rank returns its own part.
pub fn tagged_scatterv(
    transport: &Arc<dyn Transport>,
    parts: Option<&[Vec<u8>]>,
    root: usize,
    tag: u32,
) -> Result<Vec<u8>> {
    if transport.rank() == root {
        let parts = parts.ok_or_else(|| Error::invalid_arg("parts", "root must supply parts"))?;
        if parts.len() != transport.size() {
            return Err(Error::invalid_arg("parts", "one part per rank required"));
        }
        for (r, part) in parts.iter().enumerate() {
            if r != root {
                transport.send(part, r, tag)?;
            }
        }
        Ok(parts[root].clone())
    } else {
        transport.recv(root, tag)
    }
}
