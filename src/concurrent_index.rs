use crossbeam_epoch::Guard;

/// Point-operation surface shared by the bench harness and the concurrent
/// tests. Keys are the fixed-width ordered domain the index is built for.
pub trait ConcurrentIndex<V> {
    fn new() -> Self;
    fn get<'g>(&'g self, key: i32, guard: &'g Guard) -> Option<&'g V>;
    /// Upserts: overwrites the value if the key is live, creates it otherwise.
    fn insert(&self, key: i32, value: V, guard: &Guard);
    /// Returns whether a live entry was removed by this call.
    fn remove(&self, key: i32, guard: &Guard) -> bool;
}
