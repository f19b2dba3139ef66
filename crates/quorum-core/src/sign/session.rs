//! Signing sessions keyed by relay nonce

use super::{RoundState, SigningRound};
use crate::quorum::Quorum;
use crate::{Error, Result};
use bitcoin::psbt::Psbt;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Active signing rounds, one per block template nonce
#[derive(Clone)]
pub struct SessionManager {
    quorum: Arc<Quorum>,
    rounds: Arc<DashMap<u64, SigningRound>>,
}

impl SessionManager {
    /// Create an empty manager for `quorum`
    pub fn new(quorum: Arc<Quorum>) -> Self {
        Self {
            quorum,
            rounds: Arc::new(DashMap::new()),
        }
    }

    /// Start (or join) the session for `nonce`.
    ///
    /// If the session exists, `psbt` is merged into it instead.
    pub fn start(&self, nonce: u64, psbt: Psbt) -> Result<RoundState> {
        // The entry lock covers both construction and insertion
        match self.rounds.entry(nonce) {
            Entry::Occupied(mut entry) => entry.get_mut().merge(&psbt),
            Entry::Vacant(entry) => {
                let round = SigningRound::new(self.quorum.clone(), psbt)?;
                let state = round.state();
                entry.insert(round);
                info!(nonce, ?state, "Signing session started");
                Ok(state)
            }
        }
    }

    /// Remove a session, returning its round
    pub fn end(&self, nonce: u64) -> Option<SigningRound> {
        self.rounds.remove(&nonce).map(|(_, round)| round)
    }

    /// Drop every session (a block was found elsewhere)
    pub fn end_all(&self) {
        let count = self.rounds.len();
        self.rounds.clear();
        if count > 0 {
            info!(count, "Signing sessions surrendered");
        }
    }

    pub fn has(&self, nonce: u64) -> bool {
        self.rounds.contains_key(&nonce)
    }

    /// Run `f` with exclusive access to the session's round
    pub fn with_round<R>(&self, nonce: u64, f: impl FnOnce(&mut SigningRound) -> R) -> Result<R> {
        let mut round = self
            .rounds
            .get_mut(&nonce)
            .ok_or(Error::SessionNotFound(nonce))?;
        Ok(f(round.value_mut()))
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
