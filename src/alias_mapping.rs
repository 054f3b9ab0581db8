use heapless::Vec;

use crate::{
    config::ALIAS_MAPPING_BUFFER_DEPTH,
    defines::{ALIAS_MASK, NODE_ID_MASK},
};

/// One of our own aliases and the node that claimed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AliasMapping {
    pub alias: u16,
    pub node_id: u64,
    /// The alias has been defined with an AMD and may be used for traffic
    pub is_permitted: bool,
    /// Another node on the bus was seen using this alias
    pub is_duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AliasMappingError {
    #[error("Tried to register an alias ({0:?}) outside of the valid range (0x001..=0xFFF)")]
    InvalidAlias(u16),
    #[error("Tried to register a node id ({0:?}) outside of the valid range (1..=0xFFFFFFFFFFFF)")]
    InvalidNodeId(u64),
    #[error("The alias ({0:?}) is already mapped to another node")]
    AliasInUse(u16),
    #[error("The alias mapping table is full")]
    TableFull,
}

/// Read-only snapshot of the table handed out by [`AliasMappingTable::info`].
#[derive(Debug, Clone, Copy)]
pub struct AliasMappingInfo<'a> {
    pub mappings: &'a [AliasMapping],
    pub has_duplicate_alias: bool,
}

/// Aliases owned by the nodes of this stack.
#[derive(Debug, Default)]
pub struct AliasMappingTable {
    mappings: Vec<AliasMapping, ALIAS_MAPPING_BUFFER_DEPTH>,
    has_duplicate_alias: bool,
}

impl AliasMappingTable {
    pub const fn new() -> Self {
        Self {
            mappings: Vec::new(),
            has_duplicate_alias: false,
        }
    }

    /// Maps `alias` to `node_id`, replacing any alias the node held before.
    /// The mapping always starts out not permitted.
    pub fn register(
        &mut self,
        alias: u16,
        node_id: u64,
    ) -> Result<&mut AliasMapping, AliasMappingError> {
        if alias == 0 || alias > ALIAS_MASK {
            return Err(AliasMappingError::InvalidAlias(alias));
        }

        if node_id == 0 || node_id > NODE_ID_MASK {
            return Err(AliasMappingError::InvalidNodeId(node_id));
        }

        if self
            .mappings
            .iter()
            .any(|mapping| mapping.alias == alias && mapping.node_id != node_id)
        {
            return Err(AliasMappingError::AliasInUse(alias));
        }

        let mapping = AliasMapping {
            alias,
            node_id,
            is_permitted: false,
            is_duplicate: false,
        };

        let index = match self
            .mappings
            .iter()
            .position(|existing| existing.node_id == node_id)
        {
            Some(index) => {
                self.mappings[index] = mapping;
                index
            }
            None => {
                self.mappings
                    .push(mapping)
                    .map_err(|_| AliasMappingError::TableFull)?;
                self.mappings.len() - 1
            }
        };

        Ok(&mut self.mappings[index])
    }

    /// Removes the mapping for `alias`, returning it if there was one.
    pub fn unregister(&mut self, alias: u16) -> Option<AliasMapping> {
        let index = self.mappings.iter().position(|mapping| mapping.alias == alias)?;

        Some(self.mappings.swap_remove(index))
    }

    pub fn find_by_alias(&self, alias: u16) -> Option<&AliasMapping> {
        if alias == 0 {
            return None;
        }

        self.mappings.iter().find(|mapping| mapping.alias == alias)
    }

    pub fn find_by_alias_mut(&mut self, alias: u16) -> Option<&mut AliasMapping> {
        if alias == 0 {
            return None;
        }

        self.mappings.iter_mut().find(|mapping| mapping.alias == alias)
    }

    pub fn find_by_node_id(&self, node_id: u64) -> Option<&AliasMapping> {
        if node_id == 0 {
            return None;
        }

        self.mappings.iter().find(|mapping| mapping.node_id == node_id)
    }

    /// Flags the mapping for `alias` as duplicated together with the table
    /// wide flag. Returns the mapping if `alias` is one of ours.
    pub fn mark_duplicate(&mut self, alias: u16) -> Option<AliasMapping> {
        let mapping = self.find_by_alias_mut(alias)?;
        mapping.is_duplicate = true;
        let mapping = *mapping;

        self.has_duplicate_alias = true;

        Some(mapping)
    }

    pub fn set_has_duplicate_flag(&mut self) {
        self.has_duplicate_alias = true;
    }

    pub fn clear_has_duplicate_flag(&mut self) {
        self.has_duplicate_alias = false;
    }

    pub fn has_duplicate_flag(&self) -> bool {
        self.has_duplicate_alias
    }

    pub fn info(&self) -> AliasMappingInfo<'_> {
        AliasMappingInfo {
            mappings: &self.mappings,
            has_duplicate_alias: self.has_duplicate_alias,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AliasMapping> {
        self.mappings.iter()
    }

    /// First mapping flagged as duplicated, if any.
    pub fn next_duplicate(&self) -> Option<AliasMapping> {
        self.mappings.iter().find(|mapping| mapping.is_duplicate).copied()
    }

    pub fn flush(&mut self) {
        self.mappings.clear();
        self.has_duplicate_alias = false;
    }
}
