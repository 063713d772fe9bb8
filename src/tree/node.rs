//! Node records and arena primitives shared by both trees
//!
//! Nodes are fixed-layout records in a tree segment. Children hang off
//! their parent as a singly linked sibling chain in insertion order;
//! the parent field is a back reference for walks only, ownership runs
//! strictly downward. Every string hangs off the segment allocator.

use crate::error::{Error, Result};
use crate::paths::fold;
use crate::shm::SharedSegment;
use std::ops::BitOr;

pub(super) const KIND_FILE: u8 = 0;
pub(super) const KIND_DIR: u8 = 1;
pub(super) const KIND_TOMBSTONE: u8 = 2;

/// Kind of a tree entry as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Tombstone,
}

impl NodeKind {
    pub(super) fn from_raw(raw: u8) -> Self {
        match raw {
            KIND_DIR => NodeKind::Directory,
            KIND_TOMBSTONE => NodeKind::Tombstone,
            _ => NodeKind::File,
        }
    }
}

/// Node flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// Children of this node are hidden
    pub const PRUNED: NodeFlags = NodeFlags(0b0000_0001);
    /// Synthesized by the overlay, not backed by a real directory
    pub const FROM_OVERLAY: NodeFlags = NodeFlags(0b0000_0010);
    /// Part of a layered stack rather than the base tree
    pub const ALTERNATIVE: NodeFlags = NodeFlags(0b0000_0100);

    pub fn empty() -> Self {
        NodeFlags(0)
    }

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(super) fn bits(self) -> u8 {
        self.0
    }

    pub(super) fn from_bits(bits: u8) -> Self {
        NodeFlags(bits)
    }

    pub(super) fn without(self, other: NodeFlags) -> Self {
        NodeFlags(self.0 & !other.0)
    }
}

impl BitOr for NodeFlags {
    type Output = NodeFlags;

    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct NodeRec {
    pub name: u32,
    pub parent: u32,
    pub first_child: u32,
    pub next_sibling: u32,
    pub reals: u32,
    pub kind: u8,
    pub flags: u8,
    pub pad: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RealRec {
    next: u32,
    path: u32,
}

pub(super) fn new_node(
    seg: &SharedSegment,
    name: &str,
    parent: u32,
    kind: u8,
    flags: u8,
) -> Result<u32> {
    let offset = seg.alloc(std::mem::size_of::<NodeRec>())?;
    let name_off = match seg.alloc_str(name) {
        Ok(off) => off,
        Err(e) => {
            seg.free(offset);
            return Err(e);
        }
    };

    seg.write_at(
        offset,
        NodeRec {
            name: name_off,
            parent,
            first_child: 0,
            next_sibling: 0,
            reals: 0,
            kind,
            flags,
            pad: [0; 2],
        },
    );
    Ok(offset)
}

pub(super) fn node(seg: &SharedSegment, offset: u32) -> NodeRec {
    seg.read_at(offset)
}

pub(super) fn put_node(seg: &SharedSegment, offset: u32, rec: NodeRec) {
    seg.write_at(offset, rec);
}

pub(super) fn node_name(seg: &SharedSegment, offset: u32) -> String {
    let rec = node(seg, offset);
    seg.read_str(rec.name)
}

/// Case-insensitive child lookup; `key` must already be folded
pub(super) fn find_child(seg: &SharedSegment, parent: u32, key: &str) -> Option<u32> {
    let mut cur = node(seg, parent).first_child;
    while cur != 0 {
        if fold(&node_name(seg, cur)) == key {
            return Some(cur);
        }
        cur = node(seg, cur).next_sibling;
    }
    None
}

/// Append a child at the tail of the sibling chain, preserving
/// insertion order for enumeration
pub(super) fn append_child(seg: &SharedSegment, parent: u32, child: u32) {
    let mut parent_rec = node(seg, parent);
    if parent_rec.first_child == 0 {
        parent_rec.first_child = child;
        put_node(seg, parent, parent_rec);
        return;
    }

    let mut cur = parent_rec.first_child;
    loop {
        let rec = node(seg, cur);
        if rec.next_sibling == 0 {
            let mut tail = rec;
            tail.next_sibling = child;
            put_node(seg, cur, tail);
            return;
        }
        cur = rec.next_sibling;
    }
}

/// Append a payload string to the node's list unless an equal entry
/// (case-insensitive) is already present. Returns whether it was added.
pub(super) fn push_real(seg: &SharedSegment, offset: u32, value: &str) -> Result<bool> {
    let key = fold(value);
    let mut rec = node(seg, offset);

    let mut tail = 0;
    let mut cur = rec.reals;
    while cur != 0 {
        let entry: RealRec = seg.read_at(cur);
        if fold(&seg.read_str(entry.path)) == key {
            return Ok(false);
        }
        tail = cur;
        cur = entry.next;
    }

    let entry_off = seg.alloc(std::mem::size_of::<RealRec>())?;
    let path_off = match seg.alloc_str(value) {
        Ok(off) => off,
        Err(e) => {
            seg.free(entry_off);
            return Err(e);
        }
    };
    seg.write_at(
        entry_off,
        RealRec {
            next: 0,
            path: path_off,
        },
    );

    if tail == 0 {
        rec.reals = entry_off;
        put_node(seg, offset, rec);
    } else {
        let mut tail_rec: RealRec = seg.read_at(tail);
        tail_rec.next = entry_off;
        seg.write_at(tail, tail_rec);
    }
    Ok(true)
}

/// Remove a payload string (case-insensitive). Returns whether it was
/// present.
pub(super) fn remove_real(seg: &SharedSegment, offset: u32, value: &str) -> bool {
    let key = fold(value);
    let mut rec = node(seg, offset);

    let mut prev = 0;
    let mut cur = rec.reals;
    while cur != 0 {
        let entry: RealRec = seg.read_at(cur);
        if fold(&seg.read_str(entry.path)) == key {
            if prev == 0 {
                rec.reals = entry.next;
                put_node(seg, offset, rec);
            } else {
                let mut prev_rec: RealRec = seg.read_at(prev);
                prev_rec.next = entry.next;
                seg.write_at(prev, prev_rec);
            }
            seg.free_str(entry.path);
            seg.free(cur);
            return true;
        }
        prev = cur;
        cur = entry.next;
    }
    false
}

pub(super) fn reals(seg: &SharedSegment, offset: u32) -> Vec<String> {
    let mut values = Vec::new();
    let mut cur = node(seg, offset).reals;
    while cur != 0 {
        let entry: RealRec = seg.read_at(cur);
        values.push(seg.read_str(entry.path));
        cur = entry.next;
    }
    values
}

pub(super) fn clear_reals(seg: &SharedSegment, offset: u32) {
    let mut rec = node(seg, offset);
    let mut cur = rec.reals;
    while cur != 0 {
        let entry: RealRec = seg.read_at(cur);
        seg.free_str(entry.path);
        seg.free(cur);
        cur = entry.next;
    }
    rec.reals = 0;
    put_node(seg, offset, rec);
}

/// Free a node record with its name and payload list. The caller must
/// have released the children first.
pub(super) fn free_node(seg: &SharedSegment, offset: u32) {
    clear_reals(seg, offset);
    let rec = node(seg, offset);
    seg.free_str(rec.name);
    seg.free(offset);
}

/// Recursively free all children of a node, children before parents.
/// Every freed node is reported with its virtual path and payloads.
pub(super) fn free_children(
    seg: &SharedSegment,
    offset: u32,
    prefix: &str,
    removed: &mut Vec<(String, Vec<String>)>,
) {
    let mut rec = node(seg, offset);
    let mut cur = rec.first_child;
    while cur != 0 {
        let child = node(seg, cur);
        let next = child.next_sibling;
        let path = format!("{}/{}", prefix, seg.read_str(child.name));

        free_children(seg, cur, &path, removed);
        removed.push((path, reals(seg, cur)));
        free_node(seg, cur);

        cur = next;
    }
    rec.first_child = 0;
    put_node(seg, offset, rec);
}

/// Copy a subtree into another segment, preserving names, kinds, flags,
/// payloads and child order. Returns the destination node offset.
pub(super) fn copy_subtree(
    src: &SharedSegment,
    src_off: u32,
    dst: &SharedSegment,
    dst_parent: u32,
) -> Result<u32> {
    let rec = node(src, src_off);
    let name = src.read_str(rec.name);

    let dst_off = new_node(dst, &name, dst_parent, rec.kind, rec.flags)?;
    for value in reals(src, src_off) {
        push_real(dst, dst_off, &value)?;
    }
    append_child(dst, dst_parent, dst_off);

    let mut cur = rec.first_child;
    while cur != 0 {
        copy_subtree(src, cur, dst, dst_off)?;
        cur = node(src, cur).next_sibling;
    }
    Ok(dst_off)
}

/// Walk or create a chain of directory nodes under `root`. Tombstones
/// along the way are revived into directories; a file in the way is a
/// path error.
pub(super) fn ensure_chain(seg: &SharedSegment, root: u32, components: &[String]) -> Result<u32> {
    let mut cur = root;
    for component in components {
        match find_child(seg, cur, &fold(component)) {
            Some(child) => {
                let mut rec = node(seg, child);
                match rec.kind {
                    KIND_DIR => {}
                    KIND_TOMBSTONE => {
                        rec.kind = KIND_DIR;
                        rec.flags = NodeFlags::from_bits(rec.flags)
                            .without(NodeFlags::PRUNED)
                            .bits();
                        put_node(seg, child, rec);
                    }
                    _ => {
                        return Err(Error::PathInvalid(format!(
                            "{} is a file, not a directory",
                            component
                        )))
                    }
                }
                cur = child;
            }
            None => {
                let child = new_node(seg, component, cur, KIND_DIR, 0)?;
                append_child(seg, cur, child);
                cur = child;
            }
        }
    }
    Ok(cur)
}

/// Count nodes reachable from `offset`, including itself
pub(super) fn count_nodes(seg: &SharedSegment, offset: u32) -> usize {
    let mut count = 1;
    let mut cur = node(seg, offset).first_child;
    while cur != 0 {
        count += count_nodes(seg, cur);
        cur = node(seg, cur).next_sibling;
    }
    count
}
