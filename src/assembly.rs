use heapless::Vec;

use crate::{config::MESSAGE_BUFFER_DEPTH, message::MessageHandle};

/// Identifies the multi-frame message a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AssemblyKey {
    pub source_alias: u16,
    pub dest_alias: u16,
    pub mti: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AssemblyError {
    #[error("A message with the same key is already being assembled ({0:?})")]
    DuplicateKey(MessageHandle),
    #[error("The assembly list is full")]
    Full,
}

/// Messages currently being reassembled from CAN frames.
#[derive(Debug, Default)]
pub struct AssemblyList {
    entries: Vec<(AssemblyKey, MessageHandle), MESSAGE_BUFFER_DEPTH>,
}

impl AssemblyList {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, key: AssemblyKey, handle: MessageHandle) -> Result<(), AssemblyError> {
        if let Some(existing) = self.find(key.source_alias, key.dest_alias, key.mti) {
            return Err(AssemblyError::DuplicateKey(existing));
        }

        self.entries
            .push((key, handle))
            .map_err(|_| AssemblyError::Full)
    }

    pub fn find(&self, source_alias: u16, dest_alias: u16, mti: u16) -> Option<MessageHandle> {
        let key = AssemblyKey {
            source_alias,
            dest_alias,
            mti,
        };

        self.entries
            .iter()
            .find(|(entry_key, _)| *entry_key == key)
            .map(|(_, handle)| *handle)
    }

    /// Removes `handle` from the list without freeing it. Returns false if it
    /// was not listed.
    pub fn release(&mut self, handle: MessageHandle) -> bool {
        match self.entries.iter().position(|(_, entry)| *entry == handle) {
            Some(position) => {
                self.entries.swap_remove(position);
                true
            }
            None => false,
        }
    }

    pub fn index_of(&self, index: usize) -> Option<MessageHandle> {
        self.entries.get(index).map(|(_, handle)| *handle)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(AssemblyKey, MessageHandle)> {
        self.entries.iter()
    }
}
