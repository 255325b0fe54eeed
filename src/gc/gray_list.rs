//! The gray list: units reached by marking whose children still need
//! tracing.
//!
//! A singly-linked CAS stack of nodes, each carrying one unit head plus
//! the becoming-old flag computed when it was marked. Mutators and the
//! collector push concurrently; `pick_all` swaps the head with null so
//! the collector drains a private working set. Spent nodes go onto a
//! second stack and are reused, so steady-state marking allocates
//! nothing. Node allocation itself aborts on OOM, which the error
//! design accepts as fatal.

use atomic::Ordering;
use std::sync::atomic::AtomicPtr;

use crate::policy::unit::Unit;

pub struct GrayNode {
    pub unit: Unit,
    /// Whether surviving this cycle moves the unit into the old
    /// generation, which obliges the collector to dirty its cards.
    pub becoming_old: bool,
    next: *mut GrayNode,
}

pub struct GrayList {
    head: AtomicPtr<GrayNode>,
    /// Node cache: spent nodes waiting for reuse.
    dropped: AtomicPtr<GrayNode>,
}

unsafe impl Send for GrayList {}
unsafe impl Sync for GrayList {}

impl GrayList {
    pub fn new() -> GrayList {
        GrayList {
            head: AtomicPtr::new(std::ptr::null_mut()),
            dropped: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn push(&self, unit: Unit, becoming_old: bool) {
        let node = self.acquire_node(unit, becoming_old);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Takes the entire list as the caller's private working set.
    pub fn pick_all_units(&self) -> PickedUnits<'_> {
        PickedUnits {
            list: self,
            cursor: self.head.swap(std::ptr::null_mut(), Ordering::AcqRel),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    fn acquire_node(&self, unit: Unit, becoming_old: bool) -> *mut GrayNode {
        // Prefer a cached node.
        let mut cached = self.dropped.load(Ordering::Acquire);
        loop {
            if cached.is_null() {
                break;
            }
            let next = unsafe { (*cached).next };
            match self.dropped.compare_exchange_weak(
                cached,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    unsafe {
                        (*cached).unit = unit;
                        (*cached).becoming_old = becoming_old;
                    }
                    return cached;
                }
                Err(observed) => cached = observed,
            }
        }
        Box::into_raw(Box::new(GrayNode {
            unit,
            becoming_old,
            next: std::ptr::null_mut(),
        }))
    }

    fn recycle_node(&self, node: *mut GrayNode) {
        let mut cached = self.dropped.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = cached };
            match self.dropped.compare_exchange_weak(
                cached,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => cached = observed,
            }
        }
    }

    /// Frees every cached node. Shutdown only.
    pub fn drain_node_cache(&self) {
        let mut cursor = self.dropped.swap(std::ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            drop(unsafe { Box::from_raw(cursor) });
            cursor = next;
        }
    }
}

impl Default for GrayList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a picked working set; recycles nodes as it goes.
pub struct PickedUnits<'a> {
    list: &'a GrayList,
    cursor: *mut GrayNode,
}

impl Iterator for PickedUnits<'_> {
    type Item = (Unit, bool);

    fn next(&mut self) -> Option<(Unit, bool)> {
        if self.cursor.is_null() {
            return None;
        }
        let node = self.cursor;
        let (unit, becoming_old) = unsafe { ((*node).unit, (*node).becoming_old) };
        self.cursor = unsafe { (*node).next };
        self.list.recycle_node(node);
        Some((unit, becoming_old))
    }
}

impl Drop for PickedUnits<'_> {
    fn drop(&mut self) {
        // Units left unconsumed go back on the list rather than leaking.
        while !self.cursor.is_null() {
            let node = self.cursor;
            self.cursor = unsafe { (*node).next };
            let (unit, becoming_old) = unsafe { ((*node).unit, (*node).becoming_old) };
            self.list.recycle_node(node);
            self.list.push(unit, becoming_old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn unit_at(raw: usize) -> Unit {
        Unit::from_head_address(unsafe { Address::from_usize(raw) })
    }

    #[test]
    fn push_and_pick_all() {
        let list = GrayList::new();
        assert!(list.is_empty());

        list.push(unit_at(0x1000), false);
        list.push(unit_at(0x2000), true);
        assert!(!list.is_empty());

        let picked: Vec<_> = list.pick_all_units().collect();
        assert_eq!(picked, vec![(unit_at(0x2000), true), (unit_at(0x1000), false)]);

        // The pick emptied the shared list.
        assert!(list.is_empty());
        assert_eq!(list.pick_all_units().count(), 0);
        list.drain_node_cache();
    }

    #[test]
    fn nodes_are_reused() {
        let list = GrayList::new();
        list.push(unit_at(0x1000), false);
        let _ = list.pick_all_units().count();

        // The next push must reuse the cached node rather than allocate.
        list.push(unit_at(0x3000), false);
        let picked: Vec<_> = list.pick_all_units().collect();
        assert_eq!(picked, vec![(unit_at(0x3000), false)]);
        list.drain_node_cache();
    }

    #[test]
    fn concurrent_pushes_survive_a_drain() {
        use std::sync::Arc;
        let list = Arc::new(GrayList::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let list = Arc::clone(&list);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    list.push(unit_at(0x10000 + t * 0x1000 + i * 8), false);
                }
            }));
        }
        let mut drained = 0;
        while drained < 400 {
            drained += list.pick_all_units().count();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(list.is_empty());
        list.drain_node_cache();
    }
}
