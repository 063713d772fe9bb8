//! Open handle tracking
//!
//! Handle-based APIs come back with only the handle a shim opened
//! earlier. Each process keeps its own registry of open handles with
//! the virtual and real paths they were resolved against; the shared
//! inverse index answers the cross-process side of the question.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Paths an open handle was resolved against
#[derive(Debug, Clone)]
pub struct OpenHandle {
    /// Host handle value as reported by the shim
    pub handle: u64,
    /// Virtual path the application asked for
    pub virtual_path: String,
    /// Real path the call was forwarded to
    pub real_path: String,
}

/// Per-process registry of handles opened through the shims
pub struct HandleMap {
    open: RwLock<HashMap<u64, OpenHandle>>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Record a handle the shim just opened
    pub fn insert(&self, handle: u64, virtual_path: String, real_path: String) {
        self.open.write().insert(
            handle,
            OpenHandle {
                handle,
                virtual_path,
                real_path,
            },
        );
    }

    /// Forget a closed handle, returning what it pointed at
    pub fn remove(&self, handle: u64) -> Option<OpenHandle> {
        self.open.write().remove(&handle)
    }

    /// Paths for a live handle
    pub fn get(&self, handle: u64) -> Option<OpenHandle> {
        self.open.read().get(&handle).cloned()
    }

    /// All live handles resolved against a virtual path
    pub fn handles_for_virtual(&self, virtual_path: &str) -> Vec<u64> {
        let key = crate::paths::fold(virtual_path);
        self.open
            .read()
            .values()
            .filter(|h| crate::paths::fold(&h.virtual_path) == key)
            .map(|h| h.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.open.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.read().is_empty()
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let map = HandleMap::new();

        map.insert(7, "/data/a.txt".to_string(), "C:\\real\\a.txt".to_string());
        let handle = map.get(7).unwrap();
        assert_eq!(handle.virtual_path, "/data/a.txt");
        assert_eq!(handle.real_path, "C:\\real\\a.txt");

        let removed = map.remove(7).unwrap();
        assert_eq!(removed.real_path, "C:\\real\\a.txt");
        assert!(map.get(7).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_handles_for_virtual_is_case_insensitive() {
        let map = HandleMap::new();

        map.insert(1, "/data/a.txt".to_string(), "C:\\r\\a".to_string());
        map.insert(2, "/DATA/A.TXT".to_string(), "C:\\r\\a".to_string());
        map.insert(3, "/data/b.txt".to_string(), "C:\\r\\b".to_string());

        let mut handles = map.handles_for_virtual("/Data/A.txt");
        handles.sort_unstable();
        assert_eq!(handles, vec![1, 2]);
    }
}
