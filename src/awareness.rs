//! Ephemeral per-document presence state.
//!
//! Each actor (one participant, typically one open tab) publishes an opaque
//! JSON payload guarded by a logical clock. Entries never touch the durable
//! replica; they live exactly as long as some connection controls them.
//!
//! Wire encoding of a presence delta (see [`crate::protocol`] for the
//! primitives):
//!
//! ```text
//! ┌─────────┬────────────────────────────────────────────┐
//! │ count   │ per actor: id, clock, state                │
//! │ varint  │ varint, varint, varint-prefixed UTF-8 JSON │
//! └─────────┴────────────────────────────────────────────┘
//! ```
//!
//! The JSON text `null` marks a removal. The table never interprets
//! payloads beyond that sentinel.

use std::collections::HashMap;

use crate::protocol::{FrameReader, FrameWriter, ProtocolError};

/// JSON sentinel for "this actor is gone".
const NULL_STATE: &str = "null";

/// Actors touched by one applied delta.
/// `added ∪ updated ∪ removed` is the set receivers must re-derive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessDelta {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched actor ids, added then updated then removed.
    pub fn changed(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        out.extend_from_slice(&self.added);
        out.extend_from_slice(&self.updated);
        out.extend_from_slice(&self.removed);
        out
    }
}

/// Presence store: actor id → (JSON payload, logical clock).
///
/// Last-writer-wins per actor: an incoming record is applied only when its
/// clock is newer, with one tie-break — an equal-clock removal of a
/// currently present actor wins, which is how a disconnect delta encoded at
/// the same clock propagates. Clocks of departed actors are retained so a
/// stale re-add loses.
#[derive(Debug, Default)]
pub struct AwarenessTable {
    states: HashMap<u64, String>,
    clocks: HashMap<u64, u64>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present actors.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, actor: u64) -> bool {
        self.states.contains_key(&actor)
    }

    /// Current payload for a present actor.
    pub fn state(&self, actor: u64) -> Option<&str> {
        self.states.get(&actor).map(String::as_str)
    }

    /// Present actor ids, unordered.
    pub fn actors(&self) -> Vec<u64> {
        self.states.keys().copied().collect()
    }

    /// Merge an encoded delta, returning which actors changed.
    ///
    /// A record for an unknown actor with a `null` payload records the
    /// clock but lists the actor in no delta bucket.
    pub fn apply_update(&mut self, delta: &[u8]) -> Result<AwarenessDelta, ProtocolError> {
        let mut r = FrameReader::new(delta);
        let count = r.read_varint()?;
        let mut out = AwarenessDelta::default();
        for _ in 0..count {
            let actor = r.read_varint()?;
            let clock = r.read_varint()?;
            let state = r.read_var_string()?;
            let removal = state == NULL_STATE;

            let was_present = self.states.contains_key(&actor);
            let current = self.clocks.get(&actor).copied().unwrap_or(0);
            let accept = current < clock || (current == clock && removal && was_present);
            if !accept {
                continue;
            }

            if removal {
                self.states.remove(&actor);
            } else {
                self.states.insert(actor, state);
            }
            self.clocks.insert(actor, clock);

            if !was_present && !removal {
                out.added.push(actor);
            } else if was_present && removal {
                out.removed.push(actor);
            } else if was_present {
                out.updated.push(actor);
            }
        }
        Ok(out)
    }

    /// Set (or with `None` clear) an actor's payload locally, bumping its
    /// clock. Used by publishing peers; the server only merges.
    pub fn set_state(&mut self, actor: u64, state: Option<&str>) -> AwarenessDelta {
        let clock = self.clocks.get(&actor).copied().unwrap_or(0) + 1;
        let known = self.clocks.contains_key(&actor);
        let mut out = AwarenessDelta::default();
        match state {
            Some(json) => {
                self.states.insert(actor, json.to_owned());
                if known {
                    out.updated.push(actor);
                } else {
                    out.added.push(actor);
                }
            }
            None => {
                if self.states.remove(&actor).is_some() {
                    out.removed.push(actor);
                }
            }
        }
        self.clocks.insert(actor, clock);
        out
    }

    /// Drop every given actor that is currently present.
    ///
    /// Clocks are retained unchanged; receivers accept the removal through
    /// the equal-clock tie-break. Returns the ids actually removed.
    pub fn remove_actors(&mut self, actors: &[u64]) -> AwarenessDelta {
        let mut out = AwarenessDelta::default();
        for &actor in actors {
            if self.states.remove(&actor).is_some() {
                out.removed.push(actor);
            }
        }
        out
    }

    /// Encode the given actors into a delta blob. Absent actors encode as
    /// `null` at their retained clock; actors this table has never seen are
    /// skipped.
    pub fn encode_actors(&self, actors: &[u64]) -> Vec<u8> {
        let entries: Vec<u64> = actors
            .iter()
            .copied()
            .filter(|a| self.clocks.contains_key(a))
            .collect();
        let mut w = FrameWriter::new();
        w.push_varint(entries.len() as u64);
        for actor in entries {
            let clock = self.clocks[&actor];
            w.push_varint(actor);
            w.push_varint(clock);
            match self.states.get(&actor) {
                Some(json) => w.push_var_string(json),
                None => w.push_var_string(NULL_STATE),
            }
        }
        w.into_vec()
    }

    /// Encode a snapshot of every present actor, for the connect handshake.
    pub fn encode_full(&self) -> Vec<u8> {
        let actors: Vec<u64> = self.states.keys().copied().collect();
        self.encode_actors(&actors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(actor: u64, clock: u64, state: &str) -> Vec<u8> {
        let mut w = FrameWriter::new();
        w.push_varint(1);
        w.push_varint(actor);
        w.push_varint(clock);
        w.push_var_string(state);
        w.into_vec()
    }

    #[test]
    fn test_new_actor_is_added() {
        let mut table = AwarenessTable::new();
        let delta = table
            .apply_update(&encode_one(7, 1, r#"{"cursor":3}"#))
            .unwrap();
        assert_eq!(delta.added, vec![7]);
        assert!(table.contains(7));
        assert_eq!(table.state(7), Some(r#"{"cursor":3}"#));
    }

    #[test]
    fn test_newer_clock_updates() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 1, "{}")).unwrap();
        let delta = table
            .apply_update(&encode_one(7, 2, r#"{"cursor":9}"#))
            .unwrap();
        assert_eq!(delta.updated, vec![7]);
        assert_eq!(table.state(7), Some(r#"{"cursor":9}"#));
    }

    #[test]
    fn test_stale_clock_rejected() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        let delta = table.apply_update(&encode_one(7, 3, r#"{"v":0}"#)).unwrap();
        assert!(delta.is_empty());
        assert_eq!(table.state(7), Some(r#"{"v":1}"#));
    }

    #[test]
    fn test_equal_clock_update_rejected() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        let delta = table.apply_update(&encode_one(7, 5, r#"{"v":2}"#)).unwrap();
        assert!(delta.is_empty());
        assert_eq!(table.state(7), Some(r#"{"v":1}"#));
    }

    #[test]
    fn test_equal_clock_removal_wins() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        let delta = table.apply_update(&encode_one(7, 5, "null")).unwrap();
        assert_eq!(delta.removed, vec![7]);
        assert!(!table.contains(7));
    }

    #[test]
    fn test_removal_of_unknown_actor_records_clock() {
        let mut table = AwarenessTable::new();
        let delta = table.apply_update(&encode_one(7, 4, "null")).unwrap();
        assert!(delta.is_empty());
        // The retained clock still fences off stale re-adds.
        let delta = table.apply_update(&encode_one(7, 4, r#"{"v":1}"#)).unwrap();
        assert!(delta.is_empty());
        assert!(!table.contains(7));
    }

    #[test]
    fn test_stale_re_add_after_removal_loses() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        table.remove_actors(&[7]);
        let delta = table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        assert!(delta.is_empty());
        assert!(!table.contains(7));
    }

    #[test]
    fn test_fresh_re_add_after_removal_is_added() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        table.remove_actors(&[7]);
        let delta = table.apply_update(&encode_one(7, 6, r#"{"v":2}"#)).unwrap();
        assert_eq!(delta.added, vec![7]);
        assert_eq!(table.state(7), Some(r#"{"v":2}"#));
    }

    #[test]
    fn test_remove_actors_encodes_null() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        let delta = table.remove_actors(&[7, 99]);
        assert_eq!(delta.removed, vec![7]);

        let blob = table.encode_actors(&delta.removed);
        let mut receiver = AwarenessTable::new();
        receiver.apply_update(&encode_one(7, 5, r#"{"v":1}"#)).unwrap();
        let received = receiver.apply_update(&blob).unwrap();
        assert_eq!(received.removed, vec![7]);
        assert!(!receiver.contains(7));
    }

    #[test]
    fn test_full_snapshot_roundtrip() {
        let mut table = AwarenessTable::new();
        table.apply_update(&encode_one(1, 1, r#"{"a":1}"#)).unwrap();
        table.apply_update(&encode_one(2, 3, r#"{"b":2}"#)).unwrap();

        let mut other = AwarenessTable::new();
        let delta = other.apply_update(&table.encode_full()).unwrap();
        assert_eq!(delta.added.len(), 2);
        assert_eq!(other.state(1), Some(r#"{"a":1}"#));
        assert_eq!(other.state(2), Some(r#"{"b":2}"#));
    }

    #[test]
    fn test_set_state_bumps_clock() {
        let mut publisher = AwarenessTable::new();
        let mut server = AwarenessTable::new();

        let d1 = publisher.set_state(9, Some(r#"{"v":1}"#));
        assert_eq!(d1.added, vec![9]);
        server
            .apply_update(&publisher.encode_actors(&d1.changed()))
            .unwrap();

        let d2 = publisher.set_state(9, Some(r#"{"v":2}"#));
        assert_eq!(d2.updated, vec![9]);
        let delta = server
            .apply_update(&publisher.encode_actors(&d2.changed()))
            .unwrap();
        assert_eq!(delta.updated, vec![9]);
        assert_eq!(server.state(9), Some(r#"{"v":2}"#));
    }

    #[test]
    fn test_set_state_none_propagates_removal() {
        let mut publisher = AwarenessTable::new();
        let mut server = AwarenessTable::new();

        let d1 = publisher.set_state(9, Some("{}"));
        server
            .apply_update(&publisher.encode_actors(&d1.changed()))
            .unwrap();
        assert!(server.contains(9));

        let d2 = publisher.set_state(9, None);
        assert_eq!(d2.removed, vec![9]);
        server
            .apply_update(&publisher.encode_actors(&d2.changed()))
            .unwrap();
        assert!(!server.contains(9));
    }

    #[test]
    fn test_combined_delta_applies_atomically() {
        let mut source = AwarenessTable::new();
        source.set_state(1, Some(r#"{"a":1}"#));
        source.set_state(2, Some(r#"{"b":1}"#));

        let mut sink = AwarenessTable::new();
        sink.apply_update(&source.encode_full()).unwrap();

        // One blob carrying an update for 1 and a removal for 2.
        let up = source.set_state(1, Some(r#"{"a":2}"#));
        let rm = source.set_state(2, None);
        let mut ids = up.changed();
        ids.extend(rm.changed());
        let delta = sink.apply_update(&source.encode_actors(&ids)).unwrap();

        assert_eq!(delta.updated, vec![1]);
        assert_eq!(delta.removed, vec![2]);
        assert_eq!(sink.state(1), Some(r#"{"a":2}"#));
        assert!(!sink.contains(2));
    }

    #[test]
    fn test_encode_skips_unseen_actor() {
        let table = AwarenessTable::new();
        let blob = table.encode_actors(&[123]);
        let mut other = AwarenessTable::new();
        let delta = other.apply_update(&blob).unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn test_malformed_delta_rejected() {
        let mut table = AwarenessTable::new();
        // Claims two entries, carries one.
        let mut blob = encode_one(7, 1, "{}");
        blob[0] = 2;
        assert!(table.apply_update(&blob).is_err());
    }
}
