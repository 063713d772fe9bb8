//! The virtual tree
//!
//! The primary overlay index: a node graph rooted at a synthetic root,
//! living entirely inside one named tree segment. All mutation happens
//! under the instance mutex; this type only enforces tree invariants.

use super::node::{self, NodeFlags, NodeKind, KIND_DIR, KIND_FILE, KIND_TOMBSTONE};
use crate::error::{Error, Result};
use crate::paths::{fold, VirtualPath};
use crate::shm::SharedSegment;
use tracing::debug;

/// Result of a tree lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// No node, or an ancestor tombstone masks the path
    Absent,
    /// The path itself is tombstoned
    Tombstoned,
    File {
        real: String,
        flags: NodeFlags,
    },
    Directory {
        reals: Vec<String>,
        flags: NodeFlags,
    },
}

/// Deepest directory prefix of a path that carries a layer stack
#[derive(Debug, Clone)]
pub struct PrefixMatch {
    /// Number of leading components covered by the directory
    pub covered: usize,
    /// That directory's real-path layers, deepest layer last
    pub reals: Vec<String>,
    /// A tombstone or file interrupted the walk; the path is masked
    pub blocked: bool,
}

/// One virtual child of a directory node
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub name: String,
    pub kind: NodeKind,
    pub flags: NodeFlags,
}

/// A node dropped by [`VirtualTree::remove`], reported for inverse
/// index upkeep
#[derive(Debug, Clone)]
pub struct RemovedEntry {
    pub virtual_path: String,
    pub reals: Vec<String>,
}

/// The virtual overlay tree inside a named segment
pub struct VirtualTree {
    seg: SharedSegment,
    root: u32,
}

impl VirtualTree {
    /// Open the named tree segment, creating and rooting it if needed.
    /// Concurrent first-attach is serialized by the instance mutex.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let (seg, created) = SharedSegment::create_or_open(name, size)?;
        let root = match seg.find_named("root") {
            Some(offset) => offset,
            None => {
                let offset = node::new_node(&seg, "", 0, KIND_DIR, 0)?;
                seg.insert_named("root", offset)?;
                if created {
                    debug!(segment = name, "created tree segment");
                }
                offset
            }
        };
        Ok(VirtualTree { seg, root })
    }

    /// Open an existing tree segment
    pub fn open(name: &str) -> Result<Self> {
        let seg = SharedSegment::open(name)?;
        let root = seg
            .find_named("root")
            .ok_or_else(|| Error::Internal(format!("segment {} has no tree root", name)))?;
        Ok(VirtualTree { seg, root })
    }

    /// Logical name of the backing segment
    pub fn shm_name(&self) -> &str {
        self.seg.name()
    }

    /// Size of the backing segment in bytes
    pub fn segment_size(&self) -> usize {
        self.seg.size()
    }

    /// Install or update a file leaf, creating directory nodes along
    /// the way. A tombstoned leaf is replaced. Returns the previous
    /// real path when an existing file was updated.
    pub fn add_file(
        &self,
        path: &VirtualPath,
        real: &str,
        flags: NodeFlags,
    ) -> Result<Option<String>> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::PathInvalid("cannot add a file at the root".to_string()))?;

        let dir = node::ensure_chain(&self.seg, self.root, path.parent().components())?;

        match node::find_child(&self.seg, dir, &fold(name)) {
            Some(existing) => {
                let mut rec = node::node(&self.seg, existing);
                match rec.kind {
                    KIND_FILE => {
                        let old = node::reals(&self.seg, existing).into_iter().next();
                        node::clear_reals(&self.seg, existing);
                        rec = node::node(&self.seg, existing);
                        rec.flags = flags.bits();
                        node::put_node(&self.seg, existing, rec);
                        node::push_real(&self.seg, existing, real)?;
                        Ok(old)
                    }
                    KIND_TOMBSTONE => {
                        rec.kind = KIND_FILE;
                        rec.flags = flags.bits();
                        node::put_node(&self.seg, existing, rec);
                        node::push_real(&self.seg, existing, real)?;
                        Ok(None)
                    }
                    _ => {
                        if rec.first_child != 0 {
                            return Err(Error::PathInvalid(format!(
                                "{} is a directory with children",
                                path
                            )));
                        }
                        node::clear_reals(&self.seg, existing);
                        rec = node::node(&self.seg, existing);
                        rec.kind = KIND_FILE;
                        rec.flags = flags.bits();
                        node::put_node(&self.seg, existing, rec);
                        node::push_real(&self.seg, existing, real)?;
                        Ok(None)
                    }
                }
            }
            None => {
                let leaf = node::new_node(&self.seg, name, dir, KIND_FILE, flags.bits())?;
                node::push_real(&self.seg, leaf, real)?;
                node::append_child(&self.seg, dir, leaf);
                Ok(None)
            }
        }
    }

    /// Ensure a directory node exists and append real-path layers to
    /// its stack, collapsing duplicates. Returns the layers actually
    /// added (for inverse index upkeep).
    pub fn add_directory(
        &self,
        path: &VirtualPath,
        reals: &[String],
        flags: NodeFlags,
    ) -> Result<Vec<String>> {
        let dir = node::ensure_chain(&self.seg, self.root, path.components())?;

        let mut added = Vec::new();
        for real in reals {
            if node::push_real(&self.seg, dir, real)? {
                added.push(real.clone());
            }
        }

        let mut merged = NodeFlags::from_bits(node::node(&self.seg, dir).flags) | flags;
        if node::reals(&self.seg, dir).len() > 1 {
            merged = merged | NodeFlags::ALTERNATIVE;
        }
        let mut rec = node::node(&self.seg, dir);
        rec.flags = merged.bits();
        node::put_node(&self.seg, dir, rec);

        Ok(added)
    }

    /// Descend by case-folded components, honoring tombstones
    pub fn lookup(&self, path: &VirtualPath) -> Lookup {
        let mut cur = self.root;
        for component in path.components() {
            let rec = node::node(&self.seg, cur);
            if rec.kind != KIND_DIR {
                return Lookup::Absent;
            }
            match node::find_child(&self.seg, cur, &fold(component)) {
                Some(child) => cur = child,
                None => return Lookup::Absent,
            }
        }

        let rec = node::node(&self.seg, cur);
        match rec.kind {
            KIND_TOMBSTONE => Lookup::Tombstoned,
            KIND_FILE => Lookup::File {
                real: node::reals(&self.seg, cur).into_iter().next().unwrap_or_default(),
                flags: NodeFlags::from_bits(rec.flags),
            },
            _ => Lookup::Directory {
                reals: node::reals(&self.seg, cur),
                flags: NodeFlags::from_bits(rec.flags),
            },
        }
    }

    /// Find the deepest directory prefix carrying a non-empty layer
    /// stack. Used to produce real-path candidates for uncovered
    /// suffixes.
    pub fn resolve_prefix(&self, path: &VirtualPath) -> PrefixMatch {
        let mut best_covered = 0;
        let mut best_reals: Vec<String> = Vec::new();

        let mut cur = self.root;
        for (i, component) in path.components().iter().enumerate() {
            let rec = node::node(&self.seg, cur);
            if rec.kind != KIND_DIR {
                return PrefixMatch {
                    covered: best_covered,
                    reals: Vec::new(),
                    blocked: true,
                };
            }

            let layers = node::reals(&self.seg, cur);
            if !layers.is_empty() {
                best_covered = i;
                best_reals = layers;
            }

            match node::find_child(&self.seg, cur, &fold(component)) {
                Some(child) => cur = child,
                None => {
                    return PrefixMatch {
                        covered: best_covered,
                        reals: best_reals,
                        blocked: false,
                    }
                }
            }
        }

        let rec = node::node(&self.seg, cur);
        PrefixMatch {
            covered: best_covered,
            reals: best_reals,
            blocked: rec.kind == KIND_TOMBSTONE,
        }
    }

    /// Replace a file leaf with a tombstone; prune a directory subtree
    /// and tombstone the directory node. Returns every dropped node
    /// with its real paths, the target itself included.
    pub fn remove(&self, path: &VirtualPath) -> Result<Vec<RemovedEntry>> {
        if path.is_root() {
            return Err(Error::PathInvalid("cannot remove the root".to_string()));
        }

        let mut cur = self.root;
        for component in path.components() {
            let rec = node::node(&self.seg, cur);
            if rec.kind != KIND_DIR {
                return Ok(Vec::new());
            }
            match node::find_child(&self.seg, cur, &fold(component)) {
                Some(child) => cur = child,
                None => return Ok(Vec::new()),
            }
        }

        let mut rec = node::node(&self.seg, cur);
        let mut removed = Vec::new();
        match rec.kind {
            KIND_TOMBSTONE => {}
            KIND_FILE => {
                removed.push(RemovedEntry {
                    virtual_path: path.to_string(),
                    reals: node::reals(&self.seg, cur),
                });
                node::clear_reals(&self.seg, cur);
                rec = node::node(&self.seg, cur);
                rec.kind = KIND_TOMBSTONE;
                node::put_node(&self.seg, cur, rec);
            }
            _ => {
                let mut dropped = Vec::new();
                node::free_children(&self.seg, cur, &path.to_string(), &mut dropped);
                removed.extend(dropped.into_iter().map(|(virtual_path, reals)| RemovedEntry {
                    virtual_path,
                    reals,
                }));
                removed.push(RemovedEntry {
                    virtual_path: path.to_string(),
                    reals: node::reals(&self.seg, cur),
                });
                node::clear_reals(&self.seg, cur);
                rec = node::node(&self.seg, cur);
                rec.kind = KIND_TOMBSTONE;
                rec.flags = (NodeFlags::from_bits(rec.flags) | NodeFlags::PRUNED).bits();
                node::put_node(&self.seg, cur, rec);
            }
        }
        Ok(removed)
    }

    /// Children of a directory node in insertion order, tombstones
    /// included (the redirection engine uses them for masking)
    pub fn virtual_children(&self, path: &VirtualPath) -> Option<Vec<ChildEntry>> {
        let mut cur = self.root;
        for component in path.components() {
            let rec = node::node(&self.seg, cur);
            if rec.kind != KIND_DIR {
                return None;
            }
            cur = node::find_child(&self.seg, cur, &fold(component))?;
        }

        let rec = node::node(&self.seg, cur);
        if rec.kind != KIND_DIR {
            return None;
        }

        let mut entries = Vec::new();
        let mut child = rec.first_child;
        while child != 0 {
            let child_rec = node::node(&self.seg, child);
            entries.push(ChildEntry {
                name: node::node_name(&self.seg, child),
                kind: NodeKind::from_raw(child_rec.kind),
                flags: NodeFlags::from_bits(child_rec.flags),
            });
            child = child_rec.next_sibling;
        }
        Some(entries)
    }

    /// Total nodes in the tree, root included
    pub fn node_count(&self) -> usize {
        node::count_nodes(&self.seg, self.root)
    }

    /// Copy the whole tree into a fresh, larger segment under a new
    /// name. The old segment is left untouched for readers still
    /// holding it.
    pub fn rebuild_into(&self, name: &str, size: usize) -> Result<VirtualTree> {
        let fresh = VirtualTree::create(name, size)?;

        let src_root = node::node(&self.seg, self.root);
        for real in node::reals(&self.seg, self.root) {
            node::push_real(&fresh.seg, fresh.root, &real)?;
        }
        let mut root_rec = node::node(&fresh.seg, fresh.root);
        root_rec.flags = src_root.flags;
        node::put_node(&fresh.seg, fresh.root, root_rec);

        let mut cur = src_root.first_child;
        while cur != 0 {
            node::copy_subtree(&self.seg, cur, &fresh.seg, fresh.root)?;
            cur = node::node(&self.seg, cur).next_sibling;
        }

        debug!(
            from = self.seg.name(),
            to = name,
            size,
            "rebuilt tree into new segment"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedSegment;
    use crate::testing::unique_name;

    fn vp(raw: &str) -> VirtualPath {
        VirtualPath::parse(raw).unwrap()
    }

    fn scratch(tag: &str) -> (VirtualTree, String) {
        let name = unique_name(tag);
        let tree = VirtualTree::create(&name, 65536).unwrap();
        (tree, name)
    }

    fn cleanup(tree: VirtualTree, name: &str) {
        drop(tree);
        SharedSegment::unlink(name).unwrap();
    }

    #[test]
    fn test_add_file_then_lookup() {
        let (tree, name) = scratch("tree-roundtrip");

        tree.add_file(&vp("\\data\\a.txt"), "C:\\real\\a.txt", NodeFlags::empty())
            .unwrap();

        match tree.lookup(&vp("\\data\\a.txt")) {
            Lookup::File { real, .. } => assert_eq!(real, "C:\\real\\a.txt"),
            other => panic!("expected file, got {:?}", other),
        }

        cleanup(tree, &name);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let (tree, name) = scratch("tree-case");

        tree.add_file(&vp("\\data\\a.txt"), "C:\\real\\a.txt", NodeFlags::empty())
            .unwrap();

        assert_eq!(
            tree.lookup(&vp("\\DATA\\A.TXT")),
            tree.lookup(&vp("\\data\\a.txt"))
        );

        cleanup(tree, &name);
    }

    #[test]
    fn test_empty_tree_lookup_absent() {
        let (tree, name) = scratch("tree-empty");
        assert_eq!(tree.lookup(&vp("\\data\\a.txt")), Lookup::Absent);
        cleanup(tree, &name);
    }

    #[test]
    fn test_root_lookup_is_directory() {
        let (tree, name) = scratch("tree-root");
        assert!(matches!(
            tree.lookup(&VirtualPath::root()),
            Lookup::Directory { .. }
        ));
        cleanup(tree, &name);
    }

    #[test]
    fn test_add_directory_layers_idempotent() {
        let (tree, name) = scratch("tree-layers");

        tree.add_directory(
            &vp("\\data"),
            &["C:\\s1".to_string(), "C:\\s2".to_string()],
            NodeFlags::empty(),
        )
        .unwrap();
        let added = tree
            .add_directory(&vp("\\data"), &["C:\\s2".to_string()], NodeFlags::empty())
            .unwrap();
        assert!(added.is_empty());

        match tree.lookup(&vp("\\data")) {
            Lookup::Directory { reals, flags } => {
                assert_eq!(reals, vec!["C:\\s1", "C:\\s2"]);
                assert!(flags.contains(NodeFlags::ALTERNATIVE));
            }
            other => panic!("expected directory, got {:?}", other),
        }

        cleanup(tree, &name);
    }

    #[test]
    fn test_remove_file_leaves_tombstone() {
        let (tree, name) = scratch("tree-tombstone");

        tree.add_file(&vp("\\data\\b.txt"), "C:\\s2\\b.txt", NodeFlags::empty())
            .unwrap();
        let removed = tree.remove(&vp("\\data\\b.txt")).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].reals, vec!["C:\\s2\\b.txt"]);

        assert_eq!(tree.lookup(&vp("\\data\\b.txt")), Lookup::Tombstoned);

        // A replacing add revives the leaf.
        tree.add_file(&vp("\\data\\b.txt"), "C:\\s1\\b.txt", NodeFlags::empty())
            .unwrap();
        assert!(matches!(
            tree.lookup(&vp("\\data\\b.txt")),
            Lookup::File { .. }
        ));

        cleanup(tree, &name);
    }

    #[test]
    fn test_remove_directory_prunes_subtree() {
        let (tree, name) = scratch("tree-prune");

        tree.add_file(&vp("\\data\\sub\\a.txt"), "C:\\r\\a.txt", NodeFlags::empty())
            .unwrap();
        tree.add_file(&vp("\\data\\sub\\b.txt"), "C:\\r\\b.txt", NodeFlags::empty())
            .unwrap();

        let removed = tree.remove(&vp("\\data\\sub")).unwrap();
        let paths: Vec<_> = removed.iter().map(|r| r.virtual_path.as_str()).collect();
        assert!(paths.contains(&"/data/sub/a.txt"));
        assert!(paths.contains(&"/data/sub/b.txt"));
        assert!(paths.contains(&"/data/sub"));

        // Descendants are masked by the tombstoned ancestor.
        assert_eq!(tree.lookup(&vp("\\data\\sub\\a.txt")), Lookup::Absent);
        assert_eq!(tree.lookup(&vp("\\data\\sub")), Lookup::Tombstoned);

        cleanup(tree, &name);
    }

    #[test]
    fn test_children_in_insertion_order() {
        let (tree, name) = scratch("tree-order");

        tree.add_file(&vp("\\d\\one"), "C:\\r\\one", NodeFlags::empty())
            .unwrap();
        tree.add_file(&vp("\\d\\two"), "C:\\r\\two", NodeFlags::empty())
            .unwrap();
        tree.add_file(&vp("\\d\\three"), "C:\\r\\three", NodeFlags::empty())
            .unwrap();

        let children = tree.virtual_children(&vp("\\d")).unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);

        cleanup(tree, &name);
    }

    #[test]
    fn test_resolve_prefix_finds_deepest_layered_dir() {
        let (tree, name) = scratch("tree-prefix");

        tree.add_directory(&vp("\\data"), &["C:\\s1".to_string()], NodeFlags::empty())
            .unwrap();

        let prefix = tree.resolve_prefix(&vp("\\data\\sub\\x.txt"));
        assert!(!prefix.blocked);
        assert_eq!(prefix.covered, 1);
        assert_eq!(prefix.reals, vec!["C:\\s1"]);

        cleanup(tree, &name);
    }

    #[test]
    fn test_resolve_prefix_blocked_by_tombstone() {
        let (tree, name) = scratch("tree-prefix-blocked");

        tree.add_directory(&vp("\\data"), &["C:\\s1".to_string()], NodeFlags::empty())
            .unwrap();
        tree.add_file(&vp("\\data\\sub"), "C:\\s1\\sub", NodeFlags::empty())
            .unwrap();
        tree.remove(&vp("\\data\\sub")).unwrap();

        let prefix = tree.resolve_prefix(&vp("\\data\\sub\\x.txt"));
        assert!(prefix.blocked);

        cleanup(tree, &name);
    }

    #[test]
    fn test_rebuild_preserves_contents() {
        let (tree, name) = scratch("tree-rebuild");

        tree.add_directory(
            &vp("\\data"),
            &["C:\\s1".to_string(), "C:\\s2".to_string()],
            NodeFlags::empty(),
        )
        .unwrap();
        tree.add_file(&vp("\\data\\a.txt"), "C:\\s1\\a.txt", NodeFlags::empty())
            .unwrap();
        tree.remove(&vp("\\data\\a.txt")).unwrap();

        let rebuilt_name = unique_name("tree-rebuilt");
        let rebuilt = tree.rebuild_into(&rebuilt_name, 131072).unwrap();

        match rebuilt.lookup(&vp("\\data")) {
            Lookup::Directory { reals, .. } => assert_eq!(reals, vec!["C:\\s1", "C:\\s2"]),
            other => panic!("expected directory, got {:?}", other),
        }
        assert_eq!(rebuilt.lookup(&vp("\\data\\a.txt")), Lookup::Tombstoned);
        assert_eq!(rebuilt.node_count(), tree.node_count());

        cleanup(tree, &name);
        cleanup(rebuilt, &rebuilt_name);
    }
}
