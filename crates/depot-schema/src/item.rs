use crate::types::ItemName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exact identity of an item: registry name plus an optional metadata
/// signature (variant, tag hash, enchantments...). No fuzzy matching.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub name: ItemName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ItemKey {
    pub fn new(name: impl Into<ItemName>) -> Self {
        Self {
            name: name.into(),
            signature: None,
        }
    }

    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Parse `name` or `name@signature`.
    pub fn parse(input: &str) -> Self {
        match input.split_once('@') {
            Some((name, sig)) if !sig.is_empty() => Self::new(name).with_signature(sig),
            Some((name, _)) => Self::new(name),
            None => Self::new(input),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.signature {
            Some(sig) => write!(f, "{}@{sig}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// One physical stack sitting in a container slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub key: ItemKey,
    pub count: u32,
    /// Vanilla stack size of the item type (64, 16 or 1).
    pub max_stack: u32,
}

impl ItemStack {
    pub fn new(key: impl Into<ItemKey>, count: u32, max_stack: u32) -> Self {
        Self {
            key: key.into(),
            count,
            max_stack,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
