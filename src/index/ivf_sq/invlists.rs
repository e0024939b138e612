//! Inverted-list storage: one growable (id, code) arena per coarse cluster.
//!
//! Entries are addressed by [`ListHandle`] (list id + offset) and are never
//! reordered. Capacity is tracked logically per list so that memory
//! accounting is exact: one entry costs `code_size + 8` bytes and every
//! capacity change is charged to (or credited back to) the
//! [`MemoryBudget`](crate::resources::MemoryBudget) of the calling context.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IvfSqError, Result};
use crate::resources::Resources;
use crate::types::VectorId;

/// How a full list grows on append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Double the current capacity (or jump straight to what is required).
    #[default]
    Doubling,
    /// Grow by a fixed number of entries.
    Linear { step: usize },
}

impl GrowthPolicy {
    /// Capacity to grow to when a list with capacity `current` must hold
    /// `required` entries. Always `>= required`.
    pub fn next_capacity(self, current: usize, required: usize) -> usize {
        let proposed = match self {
            GrowthPolicy::Doubling => current.saturating_mul(2),
            GrowthPolicy::Linear { step } => current.saturating_add(step.max(1)),
        };
        proposed.max(required)
    }
}

/// Stable address of one list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListHandle {
    pub list: usize,
    pub offset: usize,
}

#[derive(Debug, Default, Clone)]
struct ListArena {
    ids: Vec<VectorId>,
    codes: Vec<u8>,
    /// Entries paid for, independent of the allocator's own rounding.
    capacity: usize,
}

impl ListArena {
    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Per-list code storage for an index.
#[derive(Debug)]
pub struct InvertedLists {
    code_size: usize,
    lists: Vec<ListArena>,
    total: usize,
}

impl InvertedLists {
    pub fn new(nlist: usize, code_size: usize) -> Self {
        Self {
            code_size,
            lists: vec![ListArena::default(); nlist],
            total: 0,
        }
    }

    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Bytes charged per stored entry.
    pub fn entry_bytes(&self) -> usize {
        self.code_size + std::mem::size_of::<VectorId>()
    }

    /// Number of entries in `list_id`; 0 for unknown lists.
    pub fn list_length(&self, list_id: usize) -> usize {
        self.lists.get(list_id).map_or(0, ListArena::len)
    }

    pub fn list_capacity(&self, list_id: usize) -> usize {
        self.lists.get(list_id).map_or(0, |l| l.capacity)
    }

    pub fn total_count(&self) -> usize {
        self.total
    }

    pub fn reserved_bytes(&self) -> usize {
        self.lists.iter().map(|l| l.capacity).sum::<usize>() * self.entry_bytes()
    }

    pub fn used_bytes(&self) -> usize {
        self.total * self.entry_bytes()
    }

    /// Ids of `list_id` in append order.
    pub fn ids(&self, list_id: usize) -> &[VectorId] {
        self.lists
            .get(list_id)
            .map(|l| l.ids.as_slice())
            .unwrap_or(&[])
    }

    /// Codes of `list_id`, `code_size` bytes per entry, in append order.
    pub fn codes(&self, list_id: usize) -> &[u8] {
        self.lists
            .get(list_id)
            .map(|l| l.codes.as_slice())
            .unwrap_or(&[])
    }

    /// Iterate `(id, code)` pairs of one list.
    pub fn iter_list(&self, list_id: usize) -> impl Iterator<Item = (VectorId, &[u8])> + '_ {
        let code_size = self.code_size;
        self.ids(list_id)
            .iter()
            .copied()
            .zip(self.codes(list_id).chunks_exact(code_size.max(1)))
    }

    pub fn get(&self, handle: ListHandle) -> Option<(VectorId, &[u8])> {
        let list = self.lists.get(handle.list)?;
        let id = *list.ids.get(handle.offset)?;
        let start = handle.offset * self.code_size;
        Some((id, &list.codes[start..start + self.code_size]))
    }

    fn check_list(&self, list_id: usize) -> Result<()> {
        if list_id >= self.lists.len() {
            return Err(IvfSqError::InvalidArgument(format!(
                "list id {list_id} out of range (nlist = {})",
                self.lists.len()
            )));
        }
        Ok(())
    }

    /// Raise the capacity of one list to `new_capacity` entries, charging the
    /// budget first. Contents are untouched.
    fn grow_list(&mut self, list_id: usize, new_capacity: usize, res: &Resources) -> Result<()> {
        let entry_bytes = self.entry_bytes();
        let code_size = self.code_size;
        let list = &mut self.lists[list_id];
        if new_capacity <= list.capacity {
            return Ok(());
        }
        let bytes = (new_capacity - list.capacity).saturating_mul(entry_bytes);
        res.budget().try_charge(bytes)?;

        let len = list.len();
        let reserved = list
            .ids
            .try_reserve_exact(new_capacity - len)
            .and_then(|_| list.codes.try_reserve_exact((new_capacity - len) * code_size));
        if reserved.is_err() {
            res.budget().release(bytes);
            crate::metrics::ALLOCATION_FAILURES_TOTAL.inc();
            return Err(IvfSqError::OutOfMemory {
                requested: bytes,
                available: res.budget().available(),
            });
        }
        list.capacity = new_capacity;
        Ok(())
    }

    /// Grow each list to a capacity of at least `ceil(num_vectors_hint / nlist)`
    /// entries. Returns the number of bytes newly reserved.
    pub fn reserve(&mut self, num_vectors_hint: usize, res: &Resources) -> Result<usize> {
        if self.lists.is_empty() || num_vectors_hint == 0 {
            return Ok(0);
        }
        let per_list = num_vectors_hint.div_ceil(self.lists.len());
        let before = self.reserved_bytes();

        let needed: usize = self
            .lists
            .iter()
            .map(|l| per_list.saturating_sub(l.capacity))
            .sum::<usize>()
            .saturating_mul(self.entry_bytes());
        if needed > res.budget().available() {
            return Err(IvfSqError::OutOfMemory {
                requested: needed,
                available: res.budget().available(),
            });
        }

        for list_id in 0..self.lists.len() {
            self.grow_list(list_id, per_list, res)?;
        }
        let added = self.reserved_bytes() - before;
        debug!(num_vectors_hint, per_list, bytes = added, "reserved list storage");
        Ok(added)
    }

    /// Append one entry, growing the list per the context's growth policy.
    pub fn append(
        &mut self,
        list_id: usize,
        id: VectorId,
        code: &[u8],
        res: &Resources,
    ) -> Result<ListHandle> {
        self.check_list(list_id)?;
        if code.len() != self.code_size {
            return Err(IvfSqError::InvalidArgument(format!(
                "code has {} bytes, expected {}",
                code.len(),
                self.code_size
            )));
        }
        let (len, capacity) = {
            let list = &self.lists[list_id];
            (list.len(), list.capacity)
        };
        if len == capacity {
            let target = res.growth_policy().next_capacity(capacity, len + 1);
            self.grow_list(list_id, target, res)?;
        }
        Ok(self.push_unchecked(list_id, id, code))
    }

    fn push_unchecked(&mut self, list_id: usize, id: VectorId, code: &[u8]) -> ListHandle {
        let list = &mut self.lists[list_id];
        let offset = list.len();
        list.ids.push(id);
        list.codes.extend_from_slice(code);
        self.total += 1;
        ListHandle {
            list: list_id,
            offset,
        }
    }

    /// Append a batch of entries in input order.
    ///
    /// All capacity the batch needs is obtained before the first entry is
    /// written: on `OutOfMemory` (or any validation error) no entry is
    /// appended. Capacity already obtained for other lists is kept and stays
    /// accounted.
    pub fn append_batch(
        &mut self,
        list_ids: &[usize],
        ids: &[VectorId],
        codes: &[u8],
        res: &Resources,
    ) -> Result<Vec<ListHandle>> {
        if list_ids.len() != ids.len() || codes.len() != ids.len() * self.code_size {
            return Err(IvfSqError::InvalidArgument(format!(
                "batch shape mismatch: {} list ids, {} ids, {} code bytes (code size {})",
                list_ids.len(),
                ids.len(),
                codes.len(),
                self.code_size
            )));
        }

        let mut incoming = vec![0usize; self.lists.len()];
        for &list_id in list_ids {
            self.check_list(list_id)?;
            incoming[list_id] += 1;
        }

        let policy = res.growth_policy();
        let targets: Vec<Option<usize>> = self
            .lists
            .iter()
            .zip(incoming.iter())
            .map(|(list, &extra)| {
                let required = list.len() + extra;
                (required > list.capacity).then(|| policy.next_capacity(list.capacity, required))
            })
            .collect();

        let needed: usize = targets
            .iter()
            .zip(self.lists.iter())
            .filter_map(|(t, l)| t.map(|cap| cap - l.capacity))
            .sum::<usize>()
            .saturating_mul(self.entry_bytes());
        if needed > res.budget().available() {
            crate::metrics::ALLOCATION_FAILURES_TOTAL.inc();
            return Err(IvfSqError::OutOfMemory {
                requested: needed,
                available: res.budget().available(),
            });
        }

        for (list_id, target) in targets.into_iter().enumerate() {
            if let Some(capacity) = target {
                self.grow_list(list_id, capacity, res)?;
            }
        }

        let code_size = self.code_size;
        let handles = list_ids
            .iter()
            .zip(ids.iter())
            .enumerate()
            .map(|(i, (&list_id, &id))| {
                self.push_unchecked(list_id, id, &codes[i * code_size..(i + 1) * code_size])
            })
            .collect();
        Ok(handles)
    }

    /// Replace the contents of one (empty) list wholesale, with capacity
    /// exactly equal to its length.
    pub(crate) fn load_list(
        &mut self,
        list_id: usize,
        ids: &[VectorId],
        codes: &[u8],
        res: &Resources,
    ) -> Result<()> {
        self.check_list(list_id)?;
        if codes.len() != ids.len() * self.code_size {
            return Err(IvfSqError::InvalidArgument(format!(
                "list {list_id}: {} code bytes for {} ids (code size {})",
                codes.len(),
                ids.len(),
                self.code_size
            )));
        }
        if self.lists[list_id].len() != 0 {
            return Err(IvfSqError::InvalidArgument(format!(
                "list {list_id} is not empty"
            )));
        }
        self.grow_list(list_id, ids.len(), res)?;
        let list = &mut self.lists[list_id];
        list.ids.extend_from_slice(ids);
        list.codes.extend_from_slice(codes);
        self.total += ids.len();
        Ok(())
    }

    /// Release capacity beyond each list's length. Returns bytes freed.
    pub fn reclaim(&mut self, res: &Resources) -> usize {
        let entry_bytes = self.entry_bytes();
        let mut freed = 0usize;
        for list in &mut self.lists {
            let len = list.len();
            if list.capacity > len {
                freed += (list.capacity - len) * entry_bytes;
                list.ids.shrink_to_fit();
                list.codes.shrink_to_fit();
                list.capacity = len;
            }
        }
        res.budget().release(freed);
        if freed > 0 {
            crate::metrics::BYTES_RECLAIMED_TOTAL.inc_by(freed as u64);
        }
        debug!(bytes = freed, "reclaimed list storage");
        freed
    }

    /// Drop every entry and release all list storage.
    pub fn reset(&mut self, res: &Resources) {
        let released = self.reserved_bytes();
        for list in &mut self.lists {
            *list = ListArena::default();
        }
        self.total = 0;
        res.budget().release(released);
        info!(bytes = released, "inverted lists reset");
    }

    /// Verify the cached total and per-list shapes.
    pub fn check_invariants(&self) -> Result<()> {
        let sum: usize = self.lists.iter().map(ListArena::len).sum();
        if sum != self.total {
            return Err(IvfSqError::InternalInvariant(format!(
                "list lengths sum to {sum} but total count is {}",
                self.total
            )));
        }
        for (i, list) in self.lists.iter().enumerate() {
            if list.codes.len() != list.ids.len() * self.code_size {
                return Err(IvfSqError::InternalInvariant(format!(
                    "list {i} holds {} ids but {} code bytes",
                    list.ids.len(),
                    list.codes.len()
                )));
            }
            if list.capacity < list.len() {
                return Err(IvfSqError::InternalInvariant(format!(
                    "list {i} length {} exceeds capacity {}",
                    list.len(),
                    list.capacity
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(byte: u8) -> Vec<u8> {
        vec![byte; 4]
    }

    #[test]
    fn test_growth_policy() {
        assert_eq!(GrowthPolicy::Doubling.next_capacity(0, 1), 1);
        assert_eq!(GrowthPolicy::Doubling.next_capacity(4, 5), 8);
        assert_eq!(GrowthPolicy::Doubling.next_capacity(4, 20), 20);
        assert_eq!(GrowthPolicy::Linear { step: 3 }.next_capacity(4, 5), 7);
        assert_eq!(GrowthPolicy::Linear { step: 0 }.next_capacity(4, 5), 5);
    }

    #[test]
    fn test_append_and_get() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(3, 4);
        let h0 = lists.append(1, 10, &code(1), &res).unwrap();
        let h1 = lists.append(1, 11, &code(2), &res).unwrap();
        let h2 = lists.append(2, 12, &code(3), &res).unwrap();

        assert_eq!(h1, ListHandle { list: 1, offset: 1 });
        assert_eq!(lists.get(h0), Some((10, code(1).as_slice())));
        assert_eq!(lists.get(h2), Some((12, code(3).as_slice())));
        assert_eq!(lists.list_length(0), 0);
        assert_eq!(lists.list_length(1), 2);
        assert_eq!(lists.total_count(), 3);
        lists.check_invariants().unwrap();
    }

    #[test]
    fn test_append_rejects_bad_input() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(2, 4);
        assert!(lists.append(2, 0, &code(0), &res).is_err());
        assert!(lists.append(0, 0, &[0u8; 3], &res).is_err());
        assert_eq!(lists.total_count(), 0);
    }

    #[test]
    fn test_doubling_growth_accounting() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(1, 4);
        for i in 0..5 {
            lists.append(0, i, &code(0), &res).unwrap();
        }
        // 1 -> 2 -> 4 -> 8
        assert_eq!(lists.list_capacity(0), 8);
        assert_eq!(lists.reserved_bytes(), 8 * 12);
        assert_eq!(res.budget().allocated(), 8 * 12);
        assert_eq!(lists.used_bytes(), 5 * 12);
    }

    #[test]
    fn test_reserve_keeps_contents() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(4, 4);
        lists.append(0, 7, &code(9), &res).unwrap();
        let added = lists.reserve(10, &res).unwrap();
        // ceil(10 / 4) = 3 per list; list 0 already had capacity 1.
        assert_eq!(added, (2 + 3 * 3) * 12);
        assert_eq!(lists.list_capacity(3), 3);
        assert_eq!(lists.ids(0), &[7]);
        assert_eq!(lists.total_count(), 1);
    }

    #[test]
    fn test_reserve_is_a_per_list_target() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(2, 4);
        for i in 0..4 {
            lists.append(0, i, &code(0), &res).unwrap();
        }
        // ceil(6 / 2) = 3: list 0 already holds 4, so only list 1 grows.
        let added = lists.reserve(6, &res).unwrap();
        assert_eq!(added, 3 * 12);
        assert_eq!(lists.list_capacity(0), 4);
        assert_eq!(lists.list_capacity(1), 3);
        assert_eq!(lists.reserve(6, &res).unwrap(), 0);
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(2, 4);
        lists.reserve(20, &res).unwrap();
        lists.append(0, 1, &code(1), &res).unwrap();
        lists.append(1, 2, &code(2), &res).unwrap();
        let freed = lists.reclaim(&res);
        assert_eq!(freed, 18 * 12);
        assert_eq!(lists.reclaim(&res), 0);
        assert_eq!(lists.total_count(), 2);
        assert_eq!(lists.reserved_bytes(), lists.used_bytes());
        assert_eq!(res.budget().allocated(), 2 * 12);
    }

    #[test]
    fn test_batch_is_all_or_nothing_on_oom() {
        let res = Resources::with_memory_limit(5 * 12);
        let mut lists = InvertedLists::new(2, 4);
        let list_ids = [0, 1, 0, 1, 0, 0];
        let ids = [0, 1, 2, 3, 4, 5];
        let codes = vec![0u8; 6 * 4];
        let err = lists.append_batch(&list_ids, &ids, &codes, &res).unwrap_err();
        assert!(matches!(err, IvfSqError::OutOfMemory { .. }));
        assert_eq!(lists.total_count(), 0);
        assert_eq!(lists.list_length(0), 0);
        lists.check_invariants().unwrap();
    }

    #[test]
    fn test_batch_preserves_input_order() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(2, 1);
        let handles = lists
            .append_batch(&[1, 0, 1, 1], &[5, 6, 7, 8], &[50, 60, 70, 80], &res)
            .unwrap();
        assert_eq!(lists.ids(1), &[5, 7, 8]);
        assert_eq!(lists.codes(1), &[50, 70, 80]);
        assert_eq!(handles[3], ListHandle { list: 1, offset: 2 });
    }

    #[test]
    fn test_reset_releases_budget() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(2, 4);
        lists.append(0, 1, &code(1), &res).unwrap();
        lists.reserve(100, &res).unwrap();
        lists.reset(&res);
        assert_eq!(lists.total_count(), 0);
        assert_eq!(lists.reserved_bytes(), 0);
        assert_eq!(res.budget().allocated(), 0);
        assert_eq!(lists.nlist(), 2);
    }

    #[test]
    fn test_load_list_exact_capacity() {
        let res = Resources::unbounded();
        let mut lists = InvertedLists::new(2, 2);
        lists.load_list(1, &[3, 4], &[1, 2, 3, 4], &res).unwrap();
        assert_eq!(lists.list_capacity(1), 2);
        assert_eq!(lists.reclaim(&res), 0);
        assert!(lists.load_list(1, &[5], &[0, 0], &res).is_err());
    }
}
