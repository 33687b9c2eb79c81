use crate::adapter::{AdapterKind, Capabilities, StorageAdapter, WrapOptions};
use crate::generic::Slotted;
use crate::native::Inventory;
use crate::AdapterError;
use depot_schema::{ContainerId, ItemStack};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Discrete capacity tier of a tiered container, detected from its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Copper,
    Iron,
    Gold,
    Diamond,
    Obsidian,
    Netherite,
}

impl Tier {
    /// Tier from a type-tag path such as `diamond_chest`.
    pub fn from_path(path: &str) -> Option<Self> {
        let prefix = path.split('_').next()?;
        match prefix {
            "copper" => Some(Tier::Copper),
            "iron" => Some(Tier::Iron),
            "gold" | "golden" => Some(Tier::Gold),
            "diamond" => Some(Tier::Diamond),
            "obsidian" => Some(Tier::Obsidian),
            "netherite" => Some(Tier::Netherite),
            _ => None,
        }
    }

    pub fn multiplier(self) -> u32 {
        match self {
            Tier::Copper => 2,
            Tier::Iron => 4,
            Tier::Gold => 8,
            Tier::Diamond | Tier::Obsidian => 16,
            Tier::Netherite => 32,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Copper => write!(f, "copper"),
            Tier::Iron => write!(f, "iron"),
            Tier::Gold => write!(f, "gold"),
            Tier::Diamond => write!(f, "diamond"),
            Tier::Obsidian => write!(f, "obsidian"),
            Tier::Netherite => write!(f, "netherite"),
        }
    }
}

/// Container whose per-slot limit is the stack size times its tier multiplier.
pub struct TieredAdapter {
    core: Slotted,
    tier: Tier,
    priority: i32,
}

impl TieredAdapter {
    pub fn new(
        id: ContainerId,
        native: Rc<dyn Inventory>,
        tier: Tier,
        options: &WrapOptions,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            core: Slotted::probe(id, native)?,
            tier,
            priority: options.priority.unwrap_or(0),
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }
}

impl StorageAdapter for TieredAdapter {
    fn id(&self) -> &ContainerId {
        &self.core.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Tiered
    }

    fn capabilities(&self) -> Capabilities {
        self.core.caps
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn stack_multiplier(&self) -> u32 {
        self.tier.multiplier()
    }

    fn slot_count(&self) -> Result<usize, AdapterError> {
        self.core.slot_count()
    }

    fn list_occupied_slots(&self) -> Result<BTreeMap<usize, ItemStack>, AdapterError> {
        self.core.list()
    }

    fn slot_detail(&self, slot: usize) -> Result<Option<ItemStack>, AdapterError> {
        self.core.detail(slot)
    }

    fn slot_limit(&self, _slot: usize, max_stack: u32) -> Result<u32, AdapterError> {
        Ok(max_stack.saturating_mul(self.tier.multiplier()))
    }

    fn move_out(
        &self,
        dest: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        self.core.move_out(dest, from_slot, limit, to_slot)
    }

    fn move_in(
        &self,
        src: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        self.core.move_in(src, from_slot, limit, to_slot)
    }
}
