//! Bounded pool of logical stream slots with version-tagged reuse.
//!
//! Grounded on `original_source/freeidx.go` and `original_source/proxy/reqq.go`
//! (the `FreeIdx` free-list plus `Reqq` slot table), reworked as an owned
//! Rust table instead of a slice of pointers.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;

/// A client-facing byte stream handed off by the acceptor, type-erased so the
/// slot table can hold SOCKS5, hijacked HTTP-CONNECT and synthetic plain-HTTP
/// connections uniformly.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

pub type BoxedStream = Box<dyn ClientStream>;

/// Shared handle to a slot's connection. Wrapped in its own async mutex so a
/// caller can perform I/O on one slot's connection without blocking table
/// operations (alloc/free/lookup) on unrelated slots.
pub type SharedConn = Arc<AsyncMutex<BoxedStream>>;

/// One entry of the slot table.
///
/// `tag` increments on every allocation AND on every free, so a frame that
/// names a stale `(idx, tag)` after the slot has been recycled never matches
/// the new occupant.
struct Slot {
    tag: u16,
    in_use: bool,
    conn: Option<SharedConn>,
}

/// Single-tunnel-scoped table of logical stream slots.
///
/// Invariant: `busy_count + free_list.len() == cap` after every operation.
pub struct SlotTable {
    slots: Vec<Slot>,
    free_list: Vec<u16>,
    busy_count: usize,
}

impl SlotTable {
    pub fn new(cap: u16) -> Self {
        let mut slots = Vec::with_capacity(cap as usize);
        let mut free_list = Vec::with_capacity(cap as usize);
        for idx in 0..cap {
            slots.push(Slot {
                tag: 0,
                in_use: false,
                conn: None,
            });
            free_list.push(idx);
        }
        // Pop from the end, so hand out idx 0 first.
        free_list.reverse();
        Self {
            slots,
            free_list,
            busy_count: 0,
        }
    }

    pub fn cap(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Allocate a free slot for `conn`. Returns `(idx, tag)` or `None` if the
    /// table is full. O(1).
    pub fn alloc(&mut self, conn: BoxedStream) -> Option<(u16, u16)> {
        let idx = self.free_list.pop()?;
        let slot = &mut self.slots[idx as usize];
        slot.tag = slot.tag.wrapping_add(1);
        slot.in_use = true;
        slot.conn = Some(Arc::new(AsyncMutex::new(conn)));
        self.busy_count += 1;
        Some((idx, slot.tag))
    }

    /// True iff `idx < cap`, the tags match, and the slot is occupied.
    pub fn valid(&self, idx: u16, tag: u16) -> bool {
        match self.slots.get(idx as usize) {
            Some(slot) => slot.in_use && slot.tag == tag,
            None => false,
        }
    }

    /// Clone out a shared handle to the slot's connection, if `(idx, tag)` is
    /// still live. The returned handle may be used for I/O without holding
    /// the table lock.
    pub fn get(&self, idx: u16, tag: u16) -> Option<SharedConn> {
        let slot = self.slots.get(idx as usize)?;
        if slot.in_use && slot.tag == tag {
            slot.conn.clone()
        } else {
            None
        }
    }

    /// Free `(idx, tag)`. No-op if the tag no longer matches (stale frame) or
    /// `idx` is out of range.
    pub fn free(&mut self, idx: u16, tag: u16) {
        let Some(slot) = self.slots.get_mut(idx as usize) else {
            return;
        };
        if !slot.in_use || slot.tag != tag {
            return;
        }
        slot.conn = None; // dropping closes the connection
        slot.in_use = false;
        slot.tag = slot.tag.wrapping_add(1);
        self.busy_count -= 1;
        self.free_list.push(idx);
    }

    pub fn is_full(&self) -> bool {
        self.free_list.is_empty()
    }

    /// Number of currently allocated slots.
    pub fn len(&self) -> usize {
        self.busy_count
    }

    pub fn is_empty(&self) -> bool {
        self.busy_count == 0
    }

    /// Free every in-use slot, closing its connection. Used when the owning
    /// tunnel is destroyed.
    pub fn drain_all(&mut self) {
        let busy: Vec<(u16, u16)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(idx, s)| (idx as u16, s.tag))
            .collect();
        for (idx, tag) in busy {
            self.free(idx, tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn stream() -> BoxedStream {
        let (a, _b) = duplex(64);
        Box::new(a)
    }

    #[test]
    fn alloc_free_roundtrip() {
        let mut table = SlotTable::new(2);
        let (idx0, tag0) = table.alloc(stream()).unwrap();
        assert_eq!((idx0, tag0), (0, 1));
        let (idx1, tag1) = table.alloc(stream()).unwrap();
        assert_eq!((idx1, tag1), (1, 1));
        assert!(table.is_full());
        assert!(table.alloc(stream()).is_none());

        table.free(idx0, tag0);
        assert!(!table.is_full());
        assert!(!table.valid(idx0, tag0));

        // Reuse: same idx, tag incremented by 2 (alloc + free both bump it).
        let (idx2, tag2) = table.alloc(stream()).unwrap();
        assert_eq!(idx2, 0);
        assert_eq!(tag2, 2);
    }

    #[test]
    fn stale_tag_after_reuse_is_rejected() {
        let mut table = SlotTable::new(1);
        let (idx, tag) = table.alloc(stream()).unwrap();
        table.free(idx, tag);
        let (idx2, tag2) = table.alloc(stream()).unwrap();
        assert_eq!(idx2, idx);
        assert_ne!(tag2, tag);
        // Old tag no longer validates against the new occupant.
        assert!(!table.valid(idx, tag));
        assert!(table.get(idx, tag).is_none());
        assert!(table.valid(idx2, tag2));
    }

    #[test]
    fn out_of_range_idx_is_absent() {
        let table = SlotTable::new(1);
        assert!(!table.valid(5, 0));
    }

    #[test]
    fn free_with_mismatched_tag_is_noop() {
        let mut table = SlotTable::new(1);
        let (idx, tag) = table.alloc(stream()).unwrap();
        table.free(idx, tag.wrapping_add(5));
        // Slot is still occupied under the original tag.
        assert!(table.valid(idx, tag));
    }

    #[test]
    fn drain_all_frees_every_busy_slot() {
        let mut table = SlotTable::new(3);
        let (i0, t0) = table.alloc(stream()).unwrap();
        let (i1, t1) = table.alloc(stream()).unwrap();
        table.drain_all();
        assert!(!table.valid(i0, t0));
        assert!(!table.valid(i1, t1));
        assert!(!table.is_full());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn busy_plus_free_equals_cap() {
        let mut table = SlotTable::new(4);
        let a = table.alloc(stream()).unwrap();
        let _b = table.alloc(stream()).unwrap();
        assert_eq!(table.len() + table.free_list.len(), 4);
        table.free(a.0, a.1);
        assert_eq!(table.len() + table.free_list.len(), 4);
    }
}
