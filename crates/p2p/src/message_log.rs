//! In-memory [`MessageLog`].

use crate::transport::{LogError, MessageLog};
use parking_lot::RwLock;

/// Keeps received direct messages for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    entries: RwLock<Vec<Vec<u8>>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl MessageLog for MemoryMessageLog {
    fn append(&self, entry: &[u8]) -> Result<(), LogError> {
        self.entries.write().push(entry.to_vec());
        Ok(())
    }

    fn load(&self) -> Result<Vec<Vec<u8>>, LogError> {
        Ok(self.entries.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_come_back_in_append_order() {
        let log = MemoryMessageLog::new();
        log.append(b"first").unwrap();
        log.append(b"second").unwrap();
        assert_eq!(log.load().unwrap(), vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(log.len(), 2);
    }
}
