//! Per-client presence aggregate and its binary update format.
//!
//! Update layout:
//! ```text
//! ┌────────────┬──────────────────────────────────────────┐
//! │ count      │ entry × count                            │
//! │ varint     │ client_id varint │ clock varint │ value  │
//! └────────────┴──────────────────────────────────────────┘
//! ```
//! A `null` value marks the client as offline.
//!
//! Every change to a client's state, including clearing it, bumps that
//! client's clock. Receivers keep whichever entry carries the higher clock,
//! which makes duplicate and reordered deliveries harmless.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Detecting Concurrent Writes)

use std::collections::HashMap;
use std::time::Instant;

use crate::any::Any;
use crate::encoding::{DecodeError, Decoder, Encoder};

/// Numeric client identifier, shared with the browser-side editing library.
pub type ClientId = u64;

/// Bookkeeping kept for every client we have ever heard from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMeta {
    pub clock: u64,
    pub last_updated: Instant,
}

/// One decoded `(client, clock, value)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// `Any::Null` when the client went offline.
    pub state: Any,
}

impl AwarenessEntry {
    pub fn new(client_id: ClientId, clock: u64, state: Any) -> Self {
        Self {
            client_id,
            clock,
            state,
        }
    }

    pub fn offline(client_id: ClientId, clock: u64) -> Self {
        Self::new(client_id, clock, Any::Null)
    }
}

/// Which clients an applied update touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched client ids, in added → updated → removed order.
    pub fn all(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// In-memory presence aggregate for one document.
///
/// Editors keep one of these; the relay only needs the free functions below
/// to inspect or rewrite updates in transit.
#[derive(Debug, Clone)]
pub struct Awareness {
    client_id: ClientId,
    states: HashMap<ClientId, Any>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            states: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Any> {
        self.states.get(&self.client_id)
    }

    pub fn set_local_state(&mut self, state: Option<Any>) -> u64 {
        self.set_state(self.client_id, state)
    }

    /// Store or clear `client_id`'s state and return its new clock.
    ///
    /// The clock advances on every call, including `None`.
    pub fn set_state(&mut self, client_id: ClientId, state: Option<Any>) -> u64 {
        let clock = self.clock(client_id).unwrap_or(0) + 1;
        match state {
            Some(state) if !state.is_null() => {
                self.states.insert(client_id, state);
            }
            _ => {
                self.states.remove(&client_id);
            }
        }
        self.meta.insert(
            client_id,
            ClientMeta {
                clock,
                last_updated: Instant::now(),
            },
        );
        clock
    }

    pub fn state(&self, client_id: ClientId) -> Option<&Any> {
        self.states.get(&client_id)
    }

    pub fn states(&self) -> &HashMap<ClientId, Any> {
        &self.states
    }

    pub fn meta(&self, client_id: ClientId) -> Option<&ClientMeta> {
        self.meta.get(&client_id)
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    /// Drop the states of `clients` and return the ones that had a state.
    ///
    /// Only the local client's clock is advanced; remote clocks are owned by
    /// their peers and arrive with their own offline updates.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        let mut removed = Vec::new();
        for &client_id in clients {
            if self.states.remove(&client_id).is_none() {
                continue;
            }
            if client_id == self.client_id {
                let clock = self.clock(client_id).unwrap_or(0) + 1;
                self.meta.insert(
                    client_id,
                    ClientMeta {
                        clock,
                        last_updated: Instant::now(),
                    },
                );
            }
            removed.push(client_id);
        }
        removed
    }

    /// Encode the current entries for `clients`. Clients we have no record
    /// of are skipped; known clients without a state encode as offline.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let entries: Vec<AwarenessEntry> = clients
            .iter()
            .filter_map(|&client_id| {
                let meta = self.meta.get(&client_id)?;
                let state = self.states.get(&client_id).cloned().unwrap_or(Any::Null);
                Some(AwarenessEntry::new(client_id, meta.clock, state))
            })
            .collect();
        encode_entries(&entries)
    }

    /// Merge a remote update.
    ///
    /// The whole update is decoded before anything is applied, so a malformed
    /// update leaves the aggregate untouched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessChanges, DecodeError> {
        let entries = decode_update(update)?;
        let now = Instant::now();
        let mut changes = AwarenessChanges::default();

        for AwarenessEntry {
            client_id,
            mut clock,
            state,
        } in entries
        {
            let current_clock = self.clock(client_id).unwrap_or(0);
            let had_state = self.states.contains_key(&client_id);
            let newer = current_clock < clock;
            let equal_removal = current_clock == clock && state.is_null() && had_state;
            if !newer && !equal_removal {
                log::trace!(
                    "Ignoring stale awareness entry for {client_id} (clock {clock} <= {current_clock})"
                );
                continue;
            }

            if state.is_null() {
                if client_id == self.client_id && had_state {
                    // A peer cannot take our own state offline; reassert it
                    // with a newer clock instead.
                    clock += 1;
                } else {
                    self.states.remove(&client_id);
                }
            } else {
                let previous = self.states.insert(client_id, state.clone());
                match previous {
                    None => changes.added.push(client_id),
                    Some(prev) if prev != state => changes.updated.push(client_id),
                    Some(_) => {}
                }
            }

            if state.is_null() && had_state && client_id != self.client_id {
                changes.removed.push(client_id);
            }

            self.meta.insert(
                client_id,
                ClientMeta {
                    clock,
                    last_updated: now,
                },
            );
        }

        Ok(changes)
    }
}

/// Encode a list of entries in the update layout.
pub fn encode_entries(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(1 + entries.len() * 8);
    enc.write_var_u64(entries.len() as u64);
    for entry in entries {
        enc.write_var_u64(entry.client_id);
        enc.write_var_u64(entry.clock);
        entry.state.encode(&mut enc);
    }
    enc.into_inner()
}

/// Decode every entry of an update.
pub fn decode_update(update: &[u8]) -> Result<Vec<AwarenessEntry>, DecodeError> {
    let mut dec = Decoder::new(update);
    let count = dec.read_len()?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let client_id = dec.read_var_u64()?;
        let clock = dec.read_var_u64()?;
        let state = Any::decode(&mut dec)?;
        entries.push(AwarenessEntry::new(client_id, clock, state));
    }
    Ok(entries)
}

/// Rewrite every state of an encoded update with `f`, keeping client ids and
/// clocks intact.
pub fn modify_update<F>(update: &[u8], mut f: F) -> Result<Vec<u8>, DecodeError>
where
    F: FnMut(Any) -> Any,
{
    let entries = decode_update(update)?
        .into_iter()
        .map(|entry| AwarenessEntry {
            state: f(entry.state),
            ..entry
        })
        .collect::<Vec<_>>();
    Ok(encode_entries(&entries))
}

/// Single-entry update announcing that `client_id` went offline at `clock`.
pub fn encode_remove_update(client_id: ClientId, clock: u64) -> Vec<u8> {
    encode_entries(&[AwarenessEntry::offline(client_id, clock)])
}

/// Highest clock carried for `client_id` in an encoded update, if any.
pub fn max_clock_for(update: &[u8], client_id: ClientId) -> Result<Option<u64>, DecodeError> {
    Ok(decode_update(update)?
        .iter()
        .filter(|e| e.client_id == client_id)
        .map(|e| e.clock)
        .max())
}
