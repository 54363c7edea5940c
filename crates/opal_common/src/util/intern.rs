use hashbrown::hash_map::{HashMap, RawEntryMut};
use id_collections::{Id, IdVec};
use rustc_hash::FxHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};

/// Hash-consing table mapping structurally equal keys to a single id.
///
/// Interning is what keeps the analysis lattice finite: two values (or calls, or environments)
/// built from equal components always receive the same id, so growth of the model can be
/// detected by comparing ids alone.
#[derive(Clone, Debug)]
pub struct Interner<K, I: Id> {
    ids: HashMap<K, I, BuildHasherDefault<FxHasher>>,
    keys: IdVec<I, K>,
}

impl<K: Hash + Eq + Clone, I: Id> Interner<K, I> {
    pub fn new() -> Self {
        Interner {
            ids: HashMap::default(),
            keys: IdVec::new(),
        }
    }

    /// Returns the id for `key`, together with a flag indicating whether the key was freshly
    /// interned by this call.
    pub fn intern(&mut self, key: K) -> (I, bool) {
        let hash = self.ids.hasher().hash_one(&key);
        match self
            .ids
            .raw_entry_mut()
            .from_key_hashed_nocheck(hash, &key)
        {
            RawEntryMut::Occupied(occupied) => (*occupied.get(), false),
            RawEntryMut::Vacant(vacant) => {
                let id = self.keys.push(key.clone());
                vacant.insert_hashed_nocheck(hash, key, id);
                (id, true)
            }
        }
    }

    pub fn get_id(&self, key: &K) -> Option<I> {
        self.ids.get(key).copied()
    }

    pub fn get(&self, id: I) -> &K {
        &self.keys[id]
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (I, &K)> {
        self.keys.iter()
    }
}

impl<K: Hash + Eq + Clone, I: Id> Default for Interner<K, I> {
    fn default() -> Self {
        Self::new()
    }
}
