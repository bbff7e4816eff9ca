//! Fixed-capacity session slots.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::proxy::stream::ProxyStream;

use super::session::{Session, SessionContext, StateKind};

/// A fixed number of session slots, processed in index order each pass.
pub struct SlotPool {
    slots: Box<[Option<Session>]>,
    ctx: Arc<SessionContext>,
}

impl SlotPool {
    /// Create a pool with `capacity` empty slots.
    pub fn new(capacity: usize, ctx: Arc<SessionContext>) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            ctx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// State of the session in `slot`, if any.
    pub fn state_of(&self, slot: usize) -> Option<StateKind> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map(|session| session.state().kind())
    }

    /// Place a new connection into the first free slot.
    ///
    /// A slot is free when empty or when its session has closed. With every
    /// slot busy the stream is closed at once and `NoFreeSlot` returned.
    pub fn accept(&mut self, mut stream: Box<dyn ProxyStream>) -> Result<usize> {
        let free = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map_or(true, Session::is_closed));

        let Some(index) = free else {
            stream.close();
            self.ctx.metrics.increment_rejected();
            return Err(Error::NoFreeSlot);
        };

        if self.slots[index].take().is_some() {
            self.ctx.metrics.session_closed();
        }
        self.slots[index] = Some(Session::new(index, stream, Arc::clone(&self.ctx)));
        self.ctx.metrics.session_opened();

        Ok(index)
    }

    /// Run one scheduler pass over every occupied slot, then free the slots
    /// whose sessions closed.
    pub async fn tick(&mut self) {
        for entry in self.slots.iter_mut() {
            let closed = match entry.as_mut() {
                Some(session) => {
                    session.process().await;
                    session.is_closed()
                }
                None => continue,
            };

            if closed {
                if let Some(session) = entry.take() {
                    match session.peer_addr() {
                        Some(peer) => {
                            tracing::debug!(slot = session.slot(), "slot released by {}", peer)
                        }
                        None => tracing::debug!(slot = session.slot(), "slot released"),
                    }
                }
                self.ctx.metrics.session_closed();
            }
        }
    }
}
