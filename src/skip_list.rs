use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::concurrent_index::ConcurrentIndex;

pub const MAX_LEVEL: usize = 16;

type Tower<V> = [Atomic<Node<V>>; MAX_LEVEL];

thread_local! {
    // Level generation is per-thread; a shared source would serialize inserters.
    static LEVEL_RNG: RefCell<StdRng> = RefCell::new(StdRng::from_entropy());
}

/// Reseeds the calling thread's level generator, making tower shapes
/// reproducible for single-threaded tests.
pub fn seed_level_rng(seed: u64) {
    LEVEL_RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// The level cap passed to [`SkipList::with_max_level`] was zero or above
/// [`MAX_LEVEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidMaxLevel(pub usize);

impl fmt::Display for InvalidMaxLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "max level must be in 1..={}, got {}", MAX_LEVEL, self.0)
    }
}

impl std::error::Error for InvalidMaxLevel {}

struct Node<V> {
    key: i32,
    value: Atomic<V>,
    next: Tower<V>,
    level: usize,
    /// Set exactly once, by the remover that wins the claim. A marked node is
    /// logically absent even while it remains linked.
    marked: AtomicBool,
    refs: AtomicUsize,
}

impl<V> Node<V> {
    fn new(key: i32, value: V, level: usize) -> Self {
        Self {
            key,
            value: Atomic::new(value),
            next: Default::default(),
            level,
            marked: AtomicBool::new(false),
            // One token per forward link plus one for the inserting thread.
            refs: AtomicUsize::new(level + 1),
        }
    }

    // The head bounds the structure from below and its key is never compared.
    fn head() -> Self {
        Self {
            key: i32::MIN,
            value: Atomic::null(),
            next: Default::default(),
            level: MAX_LEVEL,
            marked: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
        }
    }

    fn decrement(&self, guard: &Guard) {
        if self.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe { guard.defer_destroy(Shared::from(self as *const _)) };
        }
    }
}

impl<V> Drop for Node<V> {
    fn drop(&mut self) {
        let value = self.value.load(Ordering::Relaxed, unsafe { unprotected() });
        if !value.is_null() {
            drop(unsafe { value.into_owned() });
        }
    }
}

struct Cursor<'g, V> {
    preds: [&'g Tower<V>; MAX_LEVEL],
    succs: [Shared<'g, Node<V>>; MAX_LEVEL],
}

impl<'g, V> Cursor<'g, V> {
    fn new(head: &Atomic<Node<V>>, guard: &'g Guard) -> Self {
        let head = head.load(Ordering::Relaxed, guard);
        let next = &unsafe { head.deref() }.next;
        Self {
            preds: [next; MAX_LEVEL],
            succs: [Shared::null(); MAX_LEVEL],
        }
    }

    /// The level-0 successor, if it carries the search key. `locate` has
    /// already rechecked that this node is unmarked.
    fn found(&self, key: i32) -> Option<&'g Node<V>> {
        let node = unsafe { self.succs[0].as_ref() }?;
        if node.key == key {
            Some(node)
        } else {
            None
        }
    }
}

pub struct SkipList<V> {
    head: Atomic<Node<V>>,
    max_level: usize,
}

impl<V> Default for SkipList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for SkipList<V> {
    fn drop(&mut self) {
        unsafe {
            let head = self.head.load(Ordering::Relaxed, unprotected()).into_owned();
            // A partially removed node may survive on upper chains only, so
            // every level is walked and each node freed exactly once.
            let mut nodes = Vec::new();
            for level in (0..self.max_level).rev() {
                let mut curr = head.next[level].load(Ordering::Relaxed, unprotected());
                while let Some(curr_ref) = curr.as_ref() {
                    nodes.push(curr);
                    curr = curr_ref.next[level].load(Ordering::Relaxed, unprotected());
                }
            }
            nodes.sort_unstable_by_key(|node| node.as_raw() as usize);
            nodes.dedup_by_key(|node| node.as_raw() as usize);
            for node in nodes {
                drop(node.into_owned());
            }
        }
    }
}

impl<V> SkipList<V> {
    pub fn new() -> Self {
        Self {
            head: Atomic::new(Node::head()),
            max_level: MAX_LEVEL,
        }
    }

    /// Builds a list whose towers are capped below [`MAX_LEVEL`]. Rejects a
    /// cap of zero or one above [`MAX_LEVEL`] up front.
    pub fn with_max_level(max_level: usize) -> Result<Self, InvalidMaxLevel> {
        if max_level == 0 || max_level > MAX_LEVEL {
            return Err(InvalidMaxLevel(max_level));
        }
        Ok(Self {
            head: Atomic::new(Node::head()),
            max_level,
        })
    }

    fn random_level(&self) -> usize {
        LEVEL_RNG.with(|rng| {
            let rng = &mut *rng.borrow_mut();
            let mut level = 1;
            while level < self.max_level && rng.gen::<bool>() {
                level += 1;
            }
            level
        })
    }

    /// Records, for every level, the last node with a key below `key` and its
    /// successor. Marked nodes met on the way are unlinked; losing such an
    /// unlink race restarts the whole traversal, as does finding the level-0
    /// successor marked after the bottom level was recorded.
    fn locate<'g>(&'g self, key: i32, guard: &'g Guard) -> Cursor<'g, V> {
        'search: loop {
            let mut cursor = Cursor::new(&self.head, guard);
            let head = cursor.preds[0];

            let mut level = self.max_level;
            while level >= 1 && head[level - 1].load(Ordering::Relaxed, guard).is_null() {
                level -= 1;
            }

            let mut pred = head;
            while level >= 1 {
                level -= 1;
                let mut curr = pred[level].load(Ordering::Acquire, guard);

                loop {
                    let curr_ref = match unsafe { curr.as_ref() } {
                        Some(c) => c,
                        None => break,
                    };
                    let succ = curr_ref.next[level].load(Ordering::Acquire, guard);

                    if curr_ref.marked.load(Ordering::Acquire) {
                        match pred[level].compare_exchange(
                            curr,
                            succ,
                            Ordering::Release,
                            Ordering::Relaxed,
                            guard,
                        ) {
                            Ok(_) => {
                                unsafe { curr.deref() }.decrement(guard);
                                curr = succ;
                                continue;
                            }
                            // Someone else rewired this neighborhood.
                            Err(_) => continue 'search,
                        }
                    }

                    if curr_ref.key < key {
                        pred = &curr_ref.next;
                        curr = succ;
                        continue;
                    }
                    break;
                }

                cursor.preds[level] = pred;
                cursor.succs[level] = curr;
            }

            // A removal may have claimed the successor after level 0 was
            // recorded; the caller must never see a marked node.
            if let Some(succ) = unsafe { cursor.succs[0].as_ref() } {
                if succ.marked.load(Ordering::Acquire) {
                    continue 'search;
                }
            }

            return cursor;
        }
    }

    pub fn get<'g>(&'g self, key: i32, guard: &'g Guard) -> Option<&'g V> {
        let cursor = self.locate(key, guard);
        let node = cursor.found(key)?;
        Some(unsafe { node.value.load(Ordering::Acquire, guard).deref() })
    }

    /// Inserts `value` under `key`, overwriting the payload in place if a
    /// live node already carries the key.
    pub fn insert(&self, key: i32, value: V, guard: &Guard) {
        let new_node = Owned::new(Node::new(key, value, self.random_level())).into_shared(guard);
        let new_node_ref = unsafe { new_node.deref() };
        let top = new_node_ref.level;

        let mut cursor;
        loop {
            cursor = self.locate(key, guard);

            if let Some(found) = cursor.found(key) {
                // Upsert: hand our payload to the live node and discard the
                // never-linked shell.
                let value = new_node_ref
                    .value
                    .swap(Shared::null(), Ordering::Relaxed, guard);
                let old = found.value.swap(value, Ordering::SeqCst, guard);
                unsafe {
                    guard.defer_destroy(old);
                    drop(new_node.into_owned());
                }
                return;
            }

            new_node_ref.next[0].store(cursor.succs[0], Ordering::Relaxed);
            if cursor.preds[0][0]
                .compare_exchange(
                    cursor.succs[0],
                    new_node,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                )
                .is_ok()
            {
                break;
            }
        }

        // The key is live from here on; lookups may see the node before its
        // upper shortcuts exist.
        'build: for level in 1..top {
            loop {
                // A remover already claimed the node. Leave the tower
                // unfinished and give back the tokens for the unlinked levels.
                if new_node_ref.marked.load(Ordering::Acquire) {
                    new_node_ref.refs.fetch_sub(top - level, Ordering::Release);
                    break 'build;
                }

                let pred = cursor.preds[level];
                let succ = cursor.succs[level];
                new_node_ref.next[level].store(succ, Ordering::Release);

                if pred[level]
                    .compare_exchange(succ, new_node, Ordering::SeqCst, Ordering::SeqCst, guard)
                    .is_ok()
                {
                    break;
                }

                // The neighborhood moved; refresh and retry this level.
                cursor = self.locate(key, guard);
            }
        }

        new_node_ref.decrement(guard);
    }

    /// Removes the live node carrying `key`, reporting whether this call won
    /// the removal.
    pub fn remove(&self, key: i32, guard: &Guard) -> bool {
        let cursor = self.locate(key, guard);
        let node = match cursor.found(key) {
            Some(node) => node,
            None => return false,
        };

        // The claim must be won, not merely written: of any number of racing
        // removers, exactly one observes the false-to-true transition.
        if node
            .marked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // Best-effort unlink from the bottom up. A lost race at any level is
        // left to helping traversals; the removal already took effect.
        let node_ptr = Shared::from(node as *const _);
        for level in 0..node.level {
            // The successor slot is stable only once the link at this level
            // is visible; reading it any earlier could race the tower build.
            if cursor.preds[level][level].load(Ordering::Acquire, guard) != node_ptr {
                break;
            }
            let succ = node.next[level].load(Ordering::Acquire, guard);
            if cursor.preds[level][level]
                .compare_exchange(node_ptr, succ, Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_err()
            {
                break;
            }
            node.decrement(guard);
        }
        true
    }
}

impl<V> ConcurrentIndex<V> for SkipList<V> {
    fn new() -> Self {
        SkipList::new()
    }

    #[inline(always)]
    fn get<'g>(&'g self, key: i32, guard: &'g Guard) -> Option<&'g V> {
        self.get(key, guard)
    }

    #[inline(always)]
    fn insert(&self, key: i32, value: V, guard: &Guard) {
        self.insert(key, value, guard)
    }

    #[inline(always)]
    fn remove(&self, key: i32, guard: &Guard) -> bool {
        self.remove(key, guard)
    }
}

#[cfg(test)]
mod tests {
    use super::{seed_level_rng, SkipList, MAX_LEVEL};
    use crate::concurrent_index;
    use crossbeam_epoch::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Unmarked keys on the chain at `level`, head to tail.
    fn level_keys<V>(list: &SkipList<V>, level: usize) -> Vec<i32> {
        let guard = &pin();
        let head = list.head.load(Ordering::Relaxed, guard);
        let mut keys = Vec::new();
        let mut curr = unsafe { head.deref() }.next[level].load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            if !node.marked.load(Ordering::Acquire) {
                keys.push(node.key);
            }
            curr = node.next[level].load(Ordering::Acquire, guard);
        }
        keys
    }

    fn assert_invariants<V>(list: &SkipList<V>) {
        let bottom = level_keys(list, 0);
        assert!(
            bottom.windows(2).all(|w| w[0] < w[1]),
            "level 0 must be strictly increasing: {:?}",
            bottom,
        );
        let mut lower: HashSet<i32> = bottom.into_iter().collect();
        for level in 1..MAX_LEVEL {
            let keys = level_keys(list, level);
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
            let keys: HashSet<i32> = keys.into_iter().collect();
            assert!(
                keys.is_subset(&lower),
                "level {} must be a subsequence of level {}",
                level,
                level - 1,
            );
            lower = keys;
        }
    }

    #[test]
    fn smoke_skip_list() {
        concurrent_index::tests::smoke::<_, SkipList<String>, _>(&|k| k.to_string());
    }

    #[test]
    fn upsert_overwrites_in_place() {
        let list = SkipList::new();
        let guard = &pin();

        list.insert(1, "One".to_string(), guard);
        list.insert(2, "Two".to_string(), guard);
        assert_eq!(list.get(2, guard), Some(&"Two".to_string()));

        list.insert(1, "OneAgain".to_string(), guard);
        assert_eq!(list.get(1, guard), Some(&"OneAgain".to_string()));
        // Upsert must not leave a second node for the key behind.
        assert_eq!(level_keys(&list, 0), vec![1, 2]);

        assert!(list.remove(2, guard));
        assert_eq!(list.get(2, guard), None);

        list.insert(2, "TwoAgain".to_string(), guard);
        assert_eq!(list.get(2, guard), Some(&"TwoAgain".to_string()));
    }

    #[test]
    fn remove_reports_absence() {
        let list = SkipList::new();
        let guard = &pin();

        assert!(!list.remove(7, guard));
        list.insert(7, 7, guard);
        assert!(list.remove(7, guard));
        assert_eq!(list.get(7, guard), None);
        assert!(!list.remove(7, guard));
    }

    #[test]
    fn max_level_is_validated() {
        assert!(SkipList::<i32>::with_max_level(0).is_err());
        assert!(SkipList::<i32>::with_max_level(MAX_LEVEL + 1).is_err());

        // A single-level list degenerates to a sorted linked list but must
        // still honor every operation.
        let list = SkipList::with_max_level(1).unwrap();
        let guard = &pin();
        for key in 0..100 {
            list.insert(key, key, guard);
        }
        for key in 0..100 {
            assert_eq!(list.get(key, guard), Some(&key));
        }
        assert!(list.remove(50, guard));
        assert_eq!(list.get(50, guard), None);
    }

    #[test]
    fn seeded_levels_are_deterministic() {
        let list = SkipList::<i32>::new();

        seed_level_rng(0xdecade);
        let first: Vec<usize> = (0..256).map(|_| list.random_level()).collect();
        seed_level_rng(0xdecade);
        let second: Vec<usize> = (0..256).map(|_| list.random_level()).collect();

        assert_eq!(first, second);
        assert!(first.iter().all(|&level| (1..=MAX_LEVEL).contains(&level)));
    }

    #[test]
    fn chains_stay_ordered_and_nested() {
        seed_level_rng(42);
        let list = SkipList::new();
        let guard = &pin();
        let mut rng = StdRng::seed_from_u64(42);

        let mut live = HashSet::new();
        for _ in 0..2000 {
            let key = rng.gen_range(0..500);
            list.insert(key, key, guard);
            live.insert(key);
        }
        for key in (0..500).step_by(3) {
            assert_eq!(list.remove(key, guard), live.remove(&key));
        }

        assert_invariants(&list);
        let mut expected: Vec<i32> = live.into_iter().collect();
        expected.sort_unstable();
        assert_eq!(level_keys(&list, 0), expected);
    }

    #[test]
    fn racing_removers_have_one_winner() {
        let list = &SkipList::new();
        for round in 0..200 {
            list.insert(42, round, &pin());

            let wins = &AtomicUsize::new(0);
            thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(move |_| {
                        if list.remove(42, &pin()) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            })
            .unwrap();

            assert_eq!(wins.load(Ordering::Relaxed), 1);
            assert_eq!(list.get(42, &pin()), None);
        }
    }

    #[test]
    fn contended_key_range_converges() {
        let list = &SkipList::new();
        const KEYS: i32 = 16;

        thread::scope(|s| {
            for t in 0..8 {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    for i in 0..4000 {
                        let key = rng.gen_range(0..KEYS);
                        if t % 2 == 0 {
                            list.insert(key, i, &pin());
                        } else {
                            list.remove(key, &pin());
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_invariants(list);
        let present: HashSet<i32> = level_keys(list, 0).into_iter().collect();
        let guard = &pin();
        for key in 0..KEYS {
            assert_eq!(list.get(key, guard).is_some(), present.contains(&key));
        }
    }
}
