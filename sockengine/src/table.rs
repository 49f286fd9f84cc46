//! Bounded descriptor table.
//!
//! Binds a small stable integer (the slot) to a handler. Every time a slot
//! goes from free to occupied its generation advances, and every reference
//! the engine hands out or posts to the OS is a [`Token`] carrying both. A
//! token whose generation no longer matches the slot refers to a previous
//! occupant and resolves to nothing, which is how late events for removed
//! handlers are absorbed instead of being misdelivered.

use crate::error::EngineError;
use crate::handler::{EventHandler, HandlerRef};
use crate::poller::{Interest, RawSocket};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Identity of one registration: slot plus the generation it was bound at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    slot: u32,
    generation: u32,
}

impl Token {
    /// Slot index in `[0, capacity)`.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    /// Generation of the slot when this registration was made.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the token into the `u64` handed to OS primitives.
    pub(crate) fn to_raw(self) -> u64 {
        ((self.slot as u64) << 32) | self.generation as u64
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self {
            slot: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Registration state held for an occupied slot.
pub(crate) struct Occupant {
    pub(crate) handler: Weak<RefCell<dyn EventHandler>>,
    pub(crate) socket: RawSocket,
    pub(crate) listener: bool,
    pub(crate) interest: Interest,

    /// `on_error` was delivered; the slot waits for `del_fd`.
    pub(crate) errored: bool,

    /// Engine-owned read/accept operation (completion backend).
    pub(crate) standing_op: Option<u64>,

    /// Caller-requested write operation (completion backend).
    pub(crate) write_op: Option<u64>,
}

impl Occupant {
    pub(crate) fn new(handler: &HandlerRef, socket: RawSocket, listener: bool) -> Self {
        Self {
            handler: Rc::downgrade(handler),
            socket,
            listener,
            interest: Interest::standing(listener),
            errored: false,
            standing_op: None,
            write_op: None,
        }
    }
}

struct Entry {
    generation: u32,
    occupant: Option<Occupant>,
}

/// Fixed-capacity slot array.
pub(crate) struct FdTable {
    entries: Vec<Entry>,

    /// Number of occupied slots.
    bound: usize,

    /// Reverse map used to refuse double registration of one socket.
    sockets: HashMap<RawSocket, usize>,
}

impl FdTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Entry {
                generation: 0,
                occupant: None,
            })
            .collect();

        Self {
            entries,
            bound: 0,
            sockets: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.bound
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity() - self.bound
    }

    /// Refuses sockets that are already bound and reports a full table,
    /// without touching anything.
    pub(crate) fn check_insert(&self, socket: RawSocket) -> Result<(), EngineError> {
        if let Some(&slot) = self.sockets.get(&socket) {
            return Err(EngineError::AlreadyBound { slot });
        }
        if self.remaining() == 0 {
            return Err(EngineError::NoCapacity {
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Binds `occupant` to the lowest free slot.
    pub(crate) fn allocate(&mut self, occupant: Occupant) -> Result<Token, EngineError> {
        self.check_insert(occupant.socket)?;

        let capacity = self.capacity();
        let slot = self
            .entries
            .iter()
            .position(|e| e.occupant.is_none())
            .ok_or(EngineError::NoCapacity { capacity })?;

        let entry = &mut self.entries[slot];
        entry.generation = entry.generation.wrapping_add(1);
        self.sockets.insert(occupant.socket, slot);
        entry.occupant = Some(occupant);
        self.bound += 1;

        Ok(Token {
            slot: slot as u32,
            generation: entry.generation,
        })
    }

    /// Vacates the slot named by `token`.
    ///
    /// Without `force`, a pending caller-requested operation keeps the
    /// registration alive and the call fails with `OperationInFlight`.
    pub(crate) fn free(&mut self, token: Token, force: bool) -> Result<Occupant, EngineError> {
        let occupant = self.get(token).ok_or(EngineError::NotFound {
            slot: token.slot(),
            generation: token.generation(),
        })?;

        if !force && occupant.write_op.is_some() {
            return Err(EngineError::OperationInFlight { slot: token.slot() });
        }

        let occupant = self.entries[token.slot()]
            .occupant
            .take()
            .ok_or(EngineError::NotFound {
                slot: token.slot(),
                generation: token.generation(),
            })?;

        self.sockets.remove(&occupant.socket);
        self.bound -= 1;

        Ok(occupant)
    }

    /// Returns the occupant only if it was bound under `token`.
    pub(crate) fn get(&self, token: Token) -> Option<&Occupant> {
        let entry = self.entries.get(token.slot())?;
        if entry.generation != token.generation {
            return None;
        }
        entry.occupant.as_ref()
    }

    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut Occupant> {
        let entry = self.entries.get_mut(token.slot())?;
        if entry.generation != token.generation {
            return None;
        }
        entry.occupant.as_mut()
    }

    /// Slot holding the given handler object, if any.
    pub(crate) fn slot_of(&self, handler: &Weak<RefCell<dyn EventHandler>>) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.occupant
                .as_ref()
                .is_some_and(|o| Weak::ptr_eq(&o.handler, handler))
        })
    }

    /// Token of the slot's current occupant.
    pub(crate) fn token_at(&self, slot: usize) -> Option<Token> {
        let entry = self.entries.get(slot)?;
        entry.occupant.as_ref().map(|_| Token {
            slot: slot as u32,
            generation: entry.generation,
        })
    }

    pub(crate) fn lookup(&self, slot: usize) -> Option<HandlerRef> {
        self.entries
            .get(slot)?
            .occupant
            .as_ref()?
            .handler
            .upgrade()
    }

    pub(crate) fn contains(&self, slot: usize) -> bool {
        self.entries
            .get(slot)
            .is_some_and(|e| e.occupant.is_some())
    }

    /// Tokens of every occupied slot, in ascending slot order.
    pub(crate) fn tokens(&self) -> Vec<Token> {
        (0..self.entries.len())
            .filter_map(|slot| self.token_at(slot))
            .collect()
    }
}
