use foldhash::fast::FixedState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::hash::BuildHasherDefault;
use std::hash::Hash;
use std::hash::Hasher;

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    FixedState::default().hash_one(bytes)
}

/// A value together with its precomputed hash, so that we only pay the cost of
/// hashing once even when a value is looked up in several tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PreHashed<T> {
    value: T,
    hash: u64,
}

impl<T> PreHashed<T> {
    pub(crate) fn new(value: T, hash: u64) -> PreHashed<T> {
        PreHashed { value, hash }
    }
}

impl<T> std::ops::Deref for PreHashed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Hash for PreHashed<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// A map keyed by prehashed values. The hasher just passes the already
/// computed hash through.
pub(crate) type PassThroughHashMap<K, V> =
    HashMap<PreHashed<K>, V, BuildHasherDefault<PassThroughHasher>>;

#[derive(Default)]
pub(crate) struct PassThroughHasher {
    hash: u64,
}

impl Hasher for PassThroughHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write(&mut self, _bytes: &[u8]) {
        unimplemented!("PassThroughHasher is only for prehashed keys");
    }

    fn write_u64(&mut self, value: u64) {
        self.hash = value;
    }
}
