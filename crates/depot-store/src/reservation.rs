use depot_schema::ContainerId;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

type ClaimTable = Rc<RefCell<HashSet<(ContainerId, usize)>>>;

/// Shared table of claimed `(container, slot)` pairs.
///
/// A slot is claimed before a move is dispatched against it and released
/// when the returned [`SlotClaim`] is dropped, so two operations can never
/// target the same slot at once.
#[derive(Debug, Clone, Default)]
pub struct Reservations {
    claimed: ClaimTable,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot, or `None` if someone else holds it.
    pub fn claim(&self, container: &ContainerId, slot: usize) -> Option<SlotClaim> {
        let key = (container.clone(), slot);
        if !self.claimed.borrow_mut().insert(key.clone()) {
            return None;
        }
        Some(SlotClaim {
            table: Rc::clone(&self.claimed),
            key,
        })
    }

    pub fn is_claimed(&self, container: &ContainerId, slot: usize) -> bool {
        self.claimed.borrow().contains(&(container.clone(), slot))
    }

    pub fn len(&self) -> usize {
        self.claimed.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.borrow().is_empty()
    }
}

#[derive(Debug)]
pub struct SlotClaim {
    table: ClaimTable,
    key: (ContainerId, usize),
}

impl SlotClaim {
    pub fn container(&self) -> &ContainerId {
        &self.key.0
    }

    pub fn slot(&self) -> usize {
        self.key.1
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.table.borrow_mut().remove(&self.key);
    }
}
