//! The opaque CRDT boundary (spec §9 Design Notes).
//!
//! The concrete CRDT library is an external collaborator; this crate only
//! depends on the trait below. `map::MapCrdt` is a minimal reference
//! implementation used by the crate's own tests and as a demo — it is not
//! "the" CRDT production users are expected to supply.

/// Opaque heads set identifying a CRDT document's current causal frontier.
pub trait Heads: Clone + Eq + std::fmt::Debug {}
impl<T: Clone + Eq + std::fmt::Debug> Heads for T {}

/// A mergeable, incrementally-syncable document type. Exactly the
/// operations named in spec.md §9: `init`, `load_incremental`, `save`,
/// `clone`, `merge`, `get_heads`, `change`, `generate_sync_message`,
/// `receive_sync_message`.
pub trait CrdtDoc: Sized {
    /// Opaque per-peer sync protocol state.
    type SyncState: Default;
    /// Opaque heads marker, compared for convergence (testable property 5).
    type Heads: Heads;
    /// Description of what a `change` mutated, handed to patch callbacks.
    type Patch;

    fn init() -> Self;

    /// Loads an incremental binary produced by [`CrdtDoc::save`], merging it
    /// into `self`.
    fn load_incremental(&mut self, bytes: &[u8]);

    /// Serializes the full document state.
    fn save(&self) -> Vec<u8>;

    fn clone_doc(&self) -> Self;

    /// Merges `other`'s state into `self`.
    fn merge(&mut self, other: &Self);

    fn get_heads(&self) -> Self::Heads;

    /// Applies a local mutation, returning any patches produced.
    fn change(&mut self, f: impl FnOnce(&mut Self)) -> Vec<Self::Patch>;

    /// Same as [`CrdtDoc::change`], but rooted at a given historical heads
    /// set instead of the live state.
    fn change_at(&mut self, heads: &Self::Heads, f: impl FnOnce(&mut Self)) -> Vec<Self::Patch>;

    /// Produces the next outbound sync message for a peer in `state`,
    /// advancing `state`. Returns `None` when there is nothing to send.
    fn generate_sync_message(&self, state: &mut Self::SyncState) -> Option<Vec<u8>>;

    /// Applies an inbound sync message from a peer in `state`, returning any
    /// patches the merge produced.
    fn receive_sync_message(&mut self, state: &mut Self::SyncState, message: &[u8]) -> Vec<Self::Patch>;
}

pub mod map {
    //! A last-writer-wins register map keyed by string path, with heads
    //! derived from a vector clock. Grounded in the teacher's own
    //! `Clock`/`Dot` machinery (`src/clock.rs`, `src/dot.rs`).

    use super::CrdtDoc;
    use crate::clock::Clock;
    use crate::dot::Dot;
    use rand_core::RngCore;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    pub type Actor = [u8; 16];

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub enum Value {
        Null,
        Bool(bool),
        Int(i64),
        Str(String),
    }

    #[derive(Clone, Debug)]
    struct Entry {
        dot: Dot<Actor>,
        value: Value,
    }

    /// A patch produced by a `MapCrdt` mutation: `(path, old, new)`.
    pub struct MapPatch {
        pub path: String,
        pub before: Option<Value>,
        pub after: Option<Value>,
    }

    #[derive(Serialize, Deserialize)]
    struct SyncMessage {
        clock: Vec<(Actor, u64)>,
        entries: Vec<(String, Actor, u64, Value)>,
    }

    /// Per-peer sync state: the last clock we know the peer has seen.
    #[derive(Default)]
    pub struct MapSyncState {
        sent_up_to: Option<Clock<Actor>>,
    }

    pub struct MapCrdt {
        actor: Actor,
        clock: Clock<Actor>,
        entries: BTreeMap<String, Entry>,
    }

    impl MapCrdt {
        pub fn with_actor(actor: Actor) -> Self {
            Self {
                actor,
                clock: Clock::new(),
                entries: BTreeMap::new(),
            }
        }

        pub fn get(&self, path: &str) -> Option<&Value> {
            self.entries.get(path).map(|e| &e.value)
        }

        pub fn set(&mut self, path: &str, value: Value) -> MapPatch {
            let dot = self.clock.inc(self.actor);
            self.clock.apply(dot);
            let before = self.entries.get(path).map(|e| e.value.clone());
            self.entries.insert(
                path.to_string(),
                Entry {
                    dot,
                    value: value.clone(),
                },
            );
            MapPatch {
                path: path.to_string(),
                before,
                after: Some(value),
            }
        }

        fn apply_entry(&mut self, path: String, dot: Dot<Actor>, value: Value) -> Option<MapPatch> {
            let existing_dot = self.entries.get(&path).map(|e| e.dot);
            if existing_dot.map(|d| dot > d).unwrap_or(true) {
                let before = self.entries.get(&path).map(|e| e.value.clone());
                self.clock.apply(dot);
                self.entries.insert(
                    path.clone(),
                    Entry {
                        dot,
                        value: value.clone(),
                    },
                );
                Some(MapPatch {
                    path,
                    before,
                    after: Some(value),
                })
            } else {
                None
            }
        }
    }

    fn diff_entries(before: &BTreeMap<String, Entry>, after: &BTreeMap<String, Entry>) -> Vec<MapPatch> {
        after
            .iter()
            .filter_map(|(path, entry)| {
                let before_value = before.get(path).map(|e| e.value.clone());
                if before_value.as_ref() == Some(&entry.value) {
                    None
                } else {
                    Some(MapPatch {
                        path: path.clone(),
                        before: before_value,
                        after: Some(entry.value.clone()),
                    })
                }
            })
            .collect()
    }

    impl CrdtDoc for MapCrdt {
        type SyncState = MapSyncState;
        type Heads = Clock<Actor>;
        type Patch = MapPatch;

        fn init() -> Self {
            let mut actor = [0u8; 16];
            rand_core::OsRng.fill_bytes(&mut actor);
            Self::with_actor(actor)
        }

        fn load_incremental(&mut self, bytes: &[u8]) {
            if let Ok(msg) = serde_cbor::from_slice::<SyncMessage>(bytes) {
                for (path, actor, counter, value) in msg.entries {
                    self.apply_entry(path, Dot::new(actor, counter), value);
                }
            }
        }

        fn save(&self) -> Vec<u8> {
            let entries = self
                .entries
                .iter()
                .map(|(path, e)| (path.clone(), e.dot.actor, e.dot.counter, e.value.clone()))
                .collect();
            let msg = SyncMessage {
                clock: self.clock.dots.iter().map(|(a, c)| (*a, *c)).collect(),
                entries,
            };
            serde_cbor::to_vec(&msg).expect("map crdt state always encodes")
        }

        fn clone_doc(&self) -> Self {
            Self {
                actor: self.actor,
                clock: self.clock.clone(),
                entries: self.entries.clone(),
            }
        }

        fn merge(&mut self, other: &Self) {
            for (path, entry) in &other.entries {
                self.apply_entry(path.clone(), entry.dot, entry.value.clone());
            }
        }

        fn get_heads(&self) -> Self::Heads {
            self.clock.clone()
        }

        fn change(&mut self, f: impl FnOnce(&mut Self)) -> Vec<Self::Patch> {
            let before = self.entries.clone();
            f(self);
            diff_entries(&before, &self.entries)
        }

        /// The reference map keeps no branch log, so there is no stored
        /// snapshot to resume from at an arbitrary past heads set. Instead
        /// it reconstructs the view as of `heads` by holding out any entry
        /// whose dot is causally newer, lets `f` mutate that view, then
        /// merges the result back with the same causal-dot rule a remote
        /// peer's concurrent edit would go through.
        fn change_at(&mut self, heads: &Self::Heads, f: impl FnOnce(&mut Self)) -> Vec<Self::Patch> {
            let rooted: BTreeMap<String, Entry> = self
                .entries
                .iter()
                .filter(|(_, e)| e.dot.counter <= heads.get(&e.dot.actor))
                .map(|(path, e)| (path.clone(), e.clone()))
                .collect();
            let mut snapshot = Self {
                actor: self.actor,
                clock: heads.clone(),
                entries: rooted.clone(),
            };
            f(&mut snapshot);
            let patches = diff_entries(&rooted, &snapshot.entries);
            self.merge(&snapshot);
            patches
        }

        fn generate_sync_message(&self, state: &mut Self::SyncState) -> Option<Vec<u8>> {
            let entries: Vec<(String, Actor, u64, Value)> = self
                .entries
                .iter()
                .filter(|(_, e)| {
                    state
                        .sent_up_to
                        .as_ref()
                        .map(|c| e.dot.counter > c.get(&e.dot.actor))
                        .unwrap_or(true)
                })
                .map(|(path, e)| (path.clone(), e.dot.actor, e.dot.counter, e.value.clone()))
                .collect();
            if entries.is_empty() {
                return None;
            }
            state.sent_up_to = Some(self.clock.clone());
            let msg = SyncMessage {
                clock: self.clock.dots.iter().map(|(a, c)| (*a, *c)).collect(),
                entries,
            };
            Some(serde_cbor::to_vec(&msg).expect("map crdt sync message always encodes"))
        }

        fn receive_sync_message(
            &mut self,
            _state: &mut Self::SyncState,
            message: &[u8],
        ) -> Vec<Self::Patch> {
            let mut patches = Vec::new();
            if let Ok(msg) = serde_cbor::from_slice::<SyncMessage>(message) {
                for (path, actor, counter, value) in msg.entries {
                    if let Some(patch) = self.apply_entry(path, Dot::new(actor, counter), value) {
                        patches.push(patch);
                    }
                }
            }
            patches
        }
    }
}

#[cfg(test)]
mod tests {
    use super::map::*;
    use super::CrdtDoc;

    #[test]
    fn set_and_get() {
        let mut doc = MapCrdt::init();
        doc.set("count", Value::Int(1));
        assert_eq!(doc.get("count"), Some(&Value::Int(1)));
    }

    #[test]
    fn sync_converges() {
        let mut a = MapCrdt::init();
        let mut b = MapCrdt::init();
        a.set("n", Value::Int(42));

        let mut state = MapSyncState::default();
        let msg = a.generate_sync_message(&mut state).unwrap();
        let mut b_state = MapSyncState::default();
        b.receive_sync_message(&mut b_state, &msg);

        assert_eq!(b.get("n"), Some(&Value::Int(42)));
        assert_eq!(a.get_heads(), b.get_heads());
    }

    #[test]
    fn save_load_round_trip() {
        let mut a = MapCrdt::init();
        a.set("title", Value::Str("x".into()));
        let bytes = a.save();
        let mut b = MapCrdt::init();
        b.load_incremental(&bytes);
        assert_eq!(b.get("title"), Some(&Value::Str("x".into())));
    }

    #[test]
    fn change_reports_the_patches_it_produced() {
        let mut doc = MapCrdt::init();
        let patches = doc.change(|d| {
            d.set("n", Value::Int(1));
            d.set("title", Value::Str("hi".into()));
        });
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().any(|p| p.path == "n" && p.before.is_none() && p.after == Some(Value::Int(1))));

        let patches = doc.change(|d| {
            d.set("n", Value::Int(2));
        });
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].before, Some(Value::Int(1)));
        assert_eq!(patches[0].after, Some(Value::Int(2)));
    }

    #[test]
    fn change_at_roots_the_mutation_at_a_past_heads_set_and_merges_forward() {
        let mut doc = MapCrdt::init();
        doc.set("n", Value::Int(1));
        let heads = doc.get_heads();
        doc.set("n", Value::Int(2));

        // Mutating rooted at the older heads still merges in causally,
        // losing to the already-applied newer write for the same path.
        let patches = doc.change_at(&heads, |d| {
            d.set("other", Value::Int(9));
        });
        assert_eq!(doc.get("n"), Some(&Value::Int(2)));
        assert_eq!(doc.get("other"), Some(&Value::Int(9)));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, "other");
    }
}
