//! Aggregated item index and slot reservations for Depot.
//!
//! `ItemIndex` is an immutable snapshot mapping each `ItemKey` to its total
//! and ordered locations. Rebuilds accumulate into a separate
//! `IndexBuilder` and confirmed moves derive a new snapshot via
//! `with_deltas`, so the live index is only ever replaced whole.
//! `Reservations` is the claim table behind reserve-then-execute moves.

pub mod index;
pub mod reservation;

pub use index::{
    ContainerInfo, Discrepancy, IndexBuilder, IndexEntry, ItemIndex, ItemSummary, Location,
    SlotDelta,
};
pub use reservation::{Reservations, SlotClaim};
