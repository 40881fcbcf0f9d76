//! Signup admission: a bounded, duplicate-free ledger of join requests.
//!
//! JOINs arrive concurrently on many channels. The ledger is the only place
//! that decides who gets in, and every decision is made under one lock so
//! that the record and the session it belongs to are stored together.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use geogrid_protocol::{NodeAddress, STATUS_DUPLICATE, STATUS_FULL};
use geogrid_topology::Location;
use thiserror::Error;

use crate::lock;

/// A node asking to be admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub address: NodeAddress,
    pub location: Location,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("address already admitted")]
    Duplicate,
    #[error("grid is full")]
    Full,
}

impl Rejection {
    /// CONFIRM status reported to the node.
    pub fn status(&self) -> i32 {
        match self {
            Self::Duplicate => STATUS_DUPLICATE,
            Self::Full => STATUS_FULL,
        }
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// Number of admitted requests, this one included.
    pub count: usize,
    /// This admission filled the last slot.
    pub completes: bool,
}

struct Ledger<S> {
    entries: Vec<(JoinRequest, S)>,
    addresses: HashSet<NodeAddress>,
}

/// Bounded ledger of admitted join requests.
///
/// `S` is whatever the caller needs to reach the node later (the coordinator
/// stores the node's messaging channel).
pub struct JoinRequestManager<S = ()> {
    capacity: NonZeroUsize,
    ledger: Mutex<Ledger<S>>,
}

impl<S> JoinRequestManager<S> {
    /// Create an empty ledger admitting at most `capacity` requests.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger {
                entries: Vec::with_capacity(capacity.get()),
                addresses: HashSet::with_capacity(capacity.get()),
            }),
        }
    }

    /// Admit `request` unless its address is already in or the ledger is full.
    ///
    /// Duplicates are reported as such even once the ledger is full.
    pub fn try_admit(&self, request: JoinRequest, session: S) -> Result<Admitted, Rejection> {
        let mut ledger = lock(&self.ledger);
        if ledger.addresses.contains(&request.address) {
            return Err(Rejection::Duplicate);
        }
        if ledger.entries.len() >= self.capacity.get() {
            return Err(Rejection::Full);
        }

        ledger.addresses.insert(request.address.clone());
        ledger.entries.push((request, session));
        let count = ledger.entries.len();
        Ok(Admitted {
            count,
            completes: count == self.capacity.get(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn admitted(&self) -> usize {
        lock(&self.ledger).entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.admitted() >= self.capacity.get()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        lock(&self.ledger).addresses.contains(address)
    }

    /// Admitted requests in admission order.
    pub fn requests(&self) -> Vec<JoinRequest> {
        lock(&self.ledger)
            .entries
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }
}

impl<S: Clone> JoinRequestManager<S> {
    /// Admitted requests with their sessions, in admission order.
    pub fn entries(&self) -> Vec<(JoinRequest, S)> {
        lock(&self.ledger).entries.clone()
    }
}
