//! The inverse index
//!
//! Companion tree keyed by real path components, answering "which
//! virtual paths does this real path back?". It shares the node layout
//! with the virtual tree and is maintained write-through from every
//! virtual tree mutation.

use super::node::{self, KIND_DIR};
use crate::error::{Error, Result};
use crate::paths::{fold, real_components};
use crate::shm::SharedSegment;
use tracing::debug;

/// Real path → virtual paths index inside a named segment
pub struct InverseTree {
    seg: SharedSegment,
    root: u32,
}

impl InverseTree {
    /// Open the named segment, creating and rooting it if needed
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let (seg, _) = SharedSegment::create_or_open(name, size)?;
        let root = match seg.find_named("root") {
            Some(offset) => offset,
            None => {
                let offset = node::new_node(&seg, "", 0, KIND_DIR, 0)?;
                seg.insert_named("root", offset)?;
                offset
            }
        };
        Ok(InverseTree { seg, root })
    }

    /// Open an existing segment
    pub fn open(name: &str) -> Result<Self> {
        let seg = SharedSegment::open(name)?;
        let root = seg
            .find_named("root")
            .ok_or_else(|| Error::Internal(format!("segment {} has no tree root", name)))?;
        Ok(InverseTree { seg, root })
    }

    /// Logical name of the backing segment
    pub fn shm_name(&self) -> &str {
        self.seg.name()
    }

    /// Size of the backing segment in bytes
    pub fn segment_size(&self) -> usize {
        self.seg.size()
    }

    /// Record that `real` backs `virtual_path`
    pub fn add_mapping(&self, real: &str, virtual_path: &str) -> Result<()> {
        let components = real_components(real);
        let leaf = node::ensure_chain(&self.seg, self.root, &components)?;
        node::push_real(&self.seg, leaf, virtual_path)?;
        Ok(())
    }

    /// Drop one backing association; empty nodes are left in place
    pub fn remove_mapping(&self, real: &str, virtual_path: &str) {
        if let Some(leaf) = self.find(real) {
            node::remove_real(&self.seg, leaf, virtual_path);
        }
    }

    /// All virtual paths backed by this real path
    pub fn lookup_by_real(&self, real: &str) -> Vec<String> {
        match self.find(real) {
            Some(leaf) => node::reals(&self.seg, leaf),
            None => Vec::new(),
        }
    }

    fn find(&self, real: &str) -> Option<u32> {
        let mut cur = self.root;
        for component in real_components(real) {
            cur = node::find_child(&self.seg, cur, &fold(&component))?;
        }
        Some(cur)
    }

    /// Copy the index into a fresh, larger segment under a new name
    pub fn rebuild_into(&self, name: &str, size: usize) -> Result<InverseTree> {
        let fresh = InverseTree::create(name, size)?;

        let mut cur = node::node(&self.seg, self.root).first_child;
        while cur != 0 {
            node::copy_subtree(&self.seg, cur, &fresh.seg, fresh.root)?;
            cur = node::node(&self.seg, cur).next_sibling;
        }

        debug!(
            from = self.seg.name(),
            to = name,
            size,
            "rebuilt inverse index into new segment"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unique_name;

    fn scratch(tag: &str) -> (InverseTree, String) {
        let name = unique_name(tag);
        let tree = InverseTree::create(&name, 65536).unwrap();
        (tree, name)
    }

    fn cleanup(tree: InverseTree, name: &str) {
        drop(tree);
        SharedSegment::unlink(name).unwrap();
    }

    #[test]
    fn test_mapping_roundtrip() {
        let (inverse, name) = scratch("inverse");

        inverse.add_mapping("C:\\real\\a.txt", "/data/a.txt").unwrap();
        inverse.add_mapping("C:\\real\\a.txt", "/other/a.txt").unwrap();

        let virtuals = inverse.lookup_by_real("C:\\real\\a.txt");
        assert_eq!(virtuals, vec!["/data/a.txt", "/other/a.txt"]);

        cleanup(inverse, &name);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let (inverse, name) = scratch("inverse-case");

        inverse.add_mapping("C:\\Real\\A.txt", "/data/a.txt").unwrap();
        assert_eq!(
            inverse.lookup_by_real("c:\\real\\a.TXT"),
            vec!["/data/a.txt"]
        );

        cleanup(inverse, &name);
    }

    #[test]
    fn test_duplicate_mapping_collapsed() {
        let (inverse, name) = scratch("inverse-dup");

        inverse.add_mapping("C:\\r\\x", "/x").unwrap();
        inverse.add_mapping("C:\\r\\x", "/x").unwrap();
        assert_eq!(inverse.lookup_by_real("C:\\r\\x").len(), 1);

        cleanup(inverse, &name);
    }

    #[test]
    fn test_remove_mapping() {
        let (inverse, name) = scratch("inverse-remove");

        inverse.add_mapping("C:\\r\\x", "/x").unwrap();
        inverse.add_mapping("C:\\r\\x", "/y").unwrap();
        inverse.remove_mapping("C:\\r\\x", "/x");

        assert_eq!(inverse.lookup_by_real("C:\\r\\x"), vec!["/y"]);
        inverse.remove_mapping("C:\\r\\x", "/y");
        assert!(inverse.lookup_by_real("C:\\r\\x").is_empty());

        cleanup(inverse, &name);
    }
}
