//! Path redirection engine
//!
//! Stateless query layer the shims call with every intercepted path.
//! Given a virtual path and an operation class it produces the real
//! path to forward to the genuine host call, or reports the path as
//! absent or as missing its recorded backing. Write-class resolution
//! additionally clears deletion tombstones and materializes
//! copy-on-write targets under the writable overlay root.

use crate::context::{HookContext, ReadGuard, WriteGuard};
use crate::error::{Error, Result};
use crate::handles::OpenHandle;
use crate::paths::{fold, real_candidate, VirtualPath};
use crate::tree::{Lookup, NodeFlags, NodeKind};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What an intercepted call is about to do with the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    OpenExisting,
    CreateNew,
    OpenOrCreate,
    Enumerate,
    Delete,
    Rename,
}

impl OpClass {
    fn creates(self) -> bool {
        matches!(self, OpClass::CreateNew | OpClass::OpenOrCreate)
    }
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Forward the genuine call to this real path
    Real(PathBuf),
    /// The virtual path does not exist
    Absent,
    /// The tree records a backing that is gone from disk
    MissingBacking,
}

/// Kind of a merged directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of a merged directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Original-case name
    pub name: String,
    pub kind: EntryKind,
    /// Backing real path; `None` for purely virtual entries
    pub real: Option<PathBuf>,
}

/// Source and destination of an observed rename, both real paths the
/// shim should hand to the genuine move call
#[derive(Debug, Clone)]
pub struct RenamePlan {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Translate a virtual path for a read-only caller. Create-class
/// operations report the path they would target without mutating any
/// shared state; use [`resolve_write`] to actually materialize.
pub fn resolve(guard: &ReadGuard, raw: &str, op: OpClass) -> Result<Resolution> {
    let path = VirtualPath::parse(raw)?;
    resolve_path(guard, None, &path, op)
}

/// Translate a virtual path for a mutating caller: deletion tombstones
/// are cleared for create-class operations, and copy-on-write targets
/// are materialized under the overlay root.
pub fn resolve_write(guard: &WriteGuard, raw: &str, op: OpClass) -> Result<Resolution> {
    let path = VirtualPath::parse(raw)?;
    resolve_path(guard, Some(guard), &path, op)
}

fn resolve_path(
    guard: &ReadGuard,
    write: Option<&WriteGuard>,
    path: &VirtualPath,
    op: OpClass,
) -> Result<Resolution> {
    // Deletion tracker masks everything except re-creation.
    if guard.exists_deleted_file(path) {
        if !op.creates() {
            return Ok(Resolution::Absent);
        }

        let hidden = guard.lookup_deleted_file(path);
        if let Some(w) = write {
            w.forget_deleted_file(path);
        }
        if let Some(hidden) = hidden {
            let target = PathBuf::from(hidden);
            if let Some(w) = write {
                prepare_parent(&target)?;
                w.add_file(path, &target.to_string_lossy(), NodeFlags::empty())?;
            }
            debug!(path = %path, target = %target.display(), "re-creating deleted entry");
            return Ok(Resolution::Real(target));
        }
        return create_target(guard, write, path);
    }

    match guard.lookup(path) {
        Lookup::File { real, .. } => {
            if op.creates() {
                return materialize(guard, write, path, Path::new(&real), op);
            }
            let real_path = PathBuf::from(&real);
            if real_path.exists() {
                Ok(Resolution::Real(real_path))
            } else {
                Ok(Resolution::MissingBacking)
            }
        }

        Lookup::Directory { reals, .. } => {
            // Deepest layer wins.
            for layer in reals.iter().rev() {
                let candidate = PathBuf::from(layer);
                if candidate.exists() {
                    return Ok(Resolution::Real(candidate));
                }
            }
            if let Some(to) = guard.lookup_fake_directory(path) {
                return Ok(Resolution::Real(PathBuf::from(to)));
            }
            if reals.is_empty() {
                Ok(Resolution::Absent)
            } else {
                Ok(Resolution::MissingBacking)
            }
        }

        Lookup::Tombstoned => {
            if op.creates() {
                create_target(guard, write, path)
            } else {
                Ok(Resolution::Absent)
            }
        }

        Lookup::Absent => {
            let prefix = guard.resolve_prefix(path);
            if !prefix.blocked {
                let suffix = &path.components()[prefix.covered..];
                for layer in prefix.reals.iter().rev() {
                    let candidate = real_candidate(layer, suffix);
                    if candidate.exists() {
                        if op.creates() {
                            return materialize(guard, write, path, &candidate, op);
                        }
                        return Ok(Resolution::Real(candidate));
                    }
                }
            }

            if matches!(op, OpClass::OpenExisting | OpClass::Enumerate) {
                if let Some(to) = guard.lookup_fake_directory(path) {
                    return Ok(Resolution::Real(PathBuf::from(to)));
                }
            }

            if op.creates() {
                create_target(guard, write, path)
            } else {
                Ok(Resolution::Absent)
            }
        }
    }
}

/// Copy-on-write: route a write-class open of a read-only backed file
/// to a per-instance writable copy
fn materialize(
    guard: &ReadGuard,
    write: Option<&WriteGuard>,
    path: &VirtualPath,
    source: &Path,
    op: OpClass,
) -> Result<Resolution> {
    if let Some(root) = guard.overlay_root() {
        // Already writable; no copy needed.
        if source.starts_with(&root) {
            return Ok(Resolution::Real(source.to_path_buf()));
        }
    }

    let target = overlay_target(guard, path)?;
    if let Some(w) = write {
        prepare_parent(&target)?;
        // CreateNew truncates anyway; only a preserving open copies.
        if op == OpClass::OpenOrCreate && source.exists() {
            fs::copy(source, &target)?;
        }
        w.add_file(path, &target.to_string_lossy(), NodeFlags::FROM_OVERLAY)?;
        debug!(
            path = %path,
            source = %source.display(),
            target = %target.display(),
            "materialized writable copy"
        );
    }
    Ok(Resolution::Real(target))
}

/// Target for creating a path that has no backing anywhere
fn create_target(
    guard: &ReadGuard,
    write: Option<&WriteGuard>,
    path: &VirtualPath,
) -> Result<Resolution> {
    let target = overlay_target(guard, path)?;
    if write.is_some() {
        prepare_parent(&target)?;
    }
    Ok(Resolution::Real(target))
}

fn overlay_target(guard: &ReadGuard, path: &VirtualPath) -> Result<PathBuf> {
    let root = guard.overlay_root().ok_or(Error::OverlayUnconfigured)?;
    let mut target = root;
    for component in path.components() {
        target.push(component);
    }
    Ok(target)
}

fn prepare_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Merged listing of a virtual directory: virtual children first in
/// insertion order, then each layer's real children in host order,
/// case-insensitive first-wins de-duplication, tombstone and
/// deletion-tracker masking. An absent or masked directory lists as
/// empty; callers check existence with [`resolve`] first.
pub fn enumerate(guard: &ReadGuard, raw: &str) -> Result<Vec<DirEntry>> {
    let path = VirtualPath::parse(raw)?;

    if guard.exists_deleted_file(&path) {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut masked: HashSet<String> = HashSet::new();

    let mut layers: Vec<PathBuf> = Vec::new();
    match guard.lookup(&path) {
        Lookup::Directory { reals, .. } => {
            for child in guard.virtual_children(&path).unwrap_or_default() {
                let key = fold(&child.name);
                match child.kind {
                    NodeKind::Tombstone => {
                        masked.insert(key);
                    }
                    kind => {
                        if guard.exists_deleted_file(&path.join(&child.name)) {
                            masked.insert(key);
                        } else if seen.insert(key) {
                            entries.push(DirEntry {
                                name: child.name,
                                kind: match kind {
                                    NodeKind::Directory => EntryKind::Directory,
                                    _ => EntryKind::File,
                                },
                                real: None,
                            });
                        }
                    }
                }
            }
            layers.extend(reals.iter().map(PathBuf::from));
        }
        Lookup::Tombstoned | Lookup::File { .. } => return Ok(Vec::new()),
        Lookup::Absent => {
            // A real subdirectory below a layered prefix enumerates
            // through its candidates.
            let prefix = guard.resolve_prefix(&path);
            if prefix.blocked {
                return Ok(Vec::new());
            }
            let suffix = &path.components()[prefix.covered..];
            layers.extend(
                prefix
                    .reals
                    .iter()
                    .map(|layer| real_candidate(layer, suffix))
                    .filter(|candidate| candidate.is_dir()),
            );
        }
    }

    // A fake directory projects one more real directory for listing.
    if let Some(projected) = guard.lookup_fake_directory(&path) {
        layers.push(PathBuf::from(projected));
    }

    for layer in layers {
        let read_dir = match fs::read_dir(&layer) {
            Ok(read_dir) => read_dir,
            Err(_) => continue,
        };
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = fold(&name);
            if masked.contains(&key) || seen.contains(&key) {
                continue;
            }
            if guard.exists_deleted_file(&path.join(&name)) {
                continue;
            }

            let kind = match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => EntryKind::Directory,
                Ok(_) => EntryKind::File,
                Err(_) => continue,
            };
            seen.insert(key);
            entries.push(DirEntry {
                name,
                kind,
                real: Some(entry.path()),
            });
        }
    }

    Ok(entries)
}

/// Record a handle the shim opened, for later handle-only queries
pub fn observe_open(guard: &WriteGuard, raw: &str, real: &Path, handle: u64) -> Result<()> {
    let path = VirtualPath::parse(raw)?;
    guard
        .handles()
        .insert(handle, path.to_string(), real.to_string_lossy().into_owned());
    guard.add_mapping(&real.to_string_lossy(), &path)
}

/// Forget a closed handle
pub fn observe_close(context: &HookContext, handle: u64) -> Option<OpenHandle> {
    context.handles().remove(handle)
}

/// Record a creation the shim completed: the virtual path now has a
/// real backing
pub fn observe_create(guard: &WriteGuard, raw: &str, real: &Path) -> Result<()> {
    let path = VirtualPath::parse(raw)?;
    guard.forget_deleted_file(&path);

    let flags = match guard.overlay_root() {
        Some(root) if real.starts_with(&root) => NodeFlags::FROM_OVERLAY,
        _ => NodeFlags::empty(),
    };
    guard.add_file(&path, &real.to_string_lossy(), flags)
}

/// Record a deletion: the resolved backing is hidden behind a tracker
/// entry and the tree node is tombstoned. Returns whether anything was
/// there to delete.
pub fn observe_delete(guard: &WriteGuard, raw: &str) -> Result<bool> {
    let path = VirtualPath::parse(raw)?;

    let resolved = resolve_path(guard, None, &path, OpClass::Delete)?;
    let real = match resolved {
        Resolution::Real(real) => real,
        Resolution::MissingBacking | Resolution::Absent => {
            // Tombstone whatever node is left so lookups stay masked.
            guard.remove(&path)?;
            return Ok(false);
        }
    };

    guard.add_deleted_file(&path, &real.to_string_lossy())?;
    guard.remove(&path)?;
    debug!(path = %path, real = %real.display(), "virtual delete");
    Ok(true)
}

/// Plan and record a rename as an atomic delete-at-source plus
/// add-at-destination under the caller's single write guard. The shim
/// performs the genuine move between the returned paths afterwards.
pub fn observe_rename(guard: &WriteGuard, from_raw: &str, to_raw: &str) -> Result<RenamePlan> {
    let from = VirtualPath::parse(from_raw)?;
    let to = VirtualPath::parse(to_raw)?;

    let source = match resolve_path(guard, None, &from, OpClass::Rename)? {
        Resolution::Real(source) => source,
        Resolution::Absent => return Err(Error::BackingMissing(from.to_string())),
        Resolution::MissingBacking => return Err(Error::BackingMissing(from.to_string())),
    };

    let target = match resolve_path(guard, Some(guard), &to, OpClass::CreateNew)? {
        Resolution::Real(target) => target,
        _ => return Err(Error::BackingMissing(to.to_string())),
    };

    guard.add_deleted_file(&from, &source.to_string_lossy())?;
    guard.remove(&from)?;
    guard.add_file(&to, &target.to_string_lossy(), NodeFlags::FROM_OVERLAY)?;
    guard.forget_deleted_file(&to);

    debug!(
        from = %from,
        to = %to,
        source = %source.display(),
        target = %target.display(),
        "virtual rename"
    );
    Ok(RenamePlan { source, target })
}

/// Whether a child process about to be created should be virtualized
pub fn should_inject(guard: &ReadGuard, app_name: Option<&str>, command_line: Option<&str>) -> bool {
    if guard.executable_blacklisted(app_name, command_line) {
        warn!(
            app = app_name.unwrap_or("<none>"),
            "blacklisted executable, creating without virtualization"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::context::HookContext;
    use crate::testing::unique_name;
    use crate::tree::Lookup;
    use std::fs;
    use tempfile::tempdir;

    fn attach(tag: &str) -> HookContext {
        let config = InstanceConfig::new(&unique_name(tag));
        HookContext::attach_unmanaged(&config).unwrap()
    }

    fn vp(raw: &str) -> VirtualPath {
        VirtualPath::parse(raw).unwrap()
    }

    #[test]
    fn test_resolve_on_empty_instance_is_absent() {
        let ctx = attach("rd-empty");
        let guard = ctx.read_access().unwrap();
        assert_eq!(
            resolve(&guard, "\\data\\a.txt", OpClass::OpenExisting).unwrap(),
            Resolution::Absent
        );
    }

    #[test]
    fn test_missing_backing_is_distinct_from_absent() {
        let ctx = attach("rd-missing");
        let guard = ctx.write_access().unwrap();
        guard
            .add_file(&vp("\\data\\a.txt"), "/nonexistent/backing/a.txt", NodeFlags::empty())
            .unwrap();

        assert_eq!(
            resolve(&guard, "\\data\\a.txt", OpClass::OpenExisting).unwrap(),
            Resolution::MissingBacking
        );
    }

    #[test]
    fn test_layered_lookup_top_wins() {
        let s1 = tempdir().unwrap();
        let s2 = tempdir().unwrap();
        fs::write(s1.path().join("b.txt"), b"from s1").unwrap();
        fs::write(s2.path().join("b.txt"), b"from s2").unwrap();
        fs::write(s1.path().join("only1.txt"), b"solo").unwrap();

        let ctx = attach("rd-layers");
        let guard = ctx.write_access().unwrap();
        guard
            .add_directory(
                &vp("\\data"),
                &[
                    s1.path().to_string_lossy().into_owned(),
                    s2.path().to_string_lossy().into_owned(),
                ],
                NodeFlags::empty(),
            )
            .unwrap();

        match resolve(&guard, "\\data\\b.txt", OpClass::OpenExisting).unwrap() {
            Resolution::Real(real) => assert_eq!(real, s2.path().join("b.txt")),
            other => panic!("expected s2's copy, got {:?}", other),
        }

        // A file present only in the bottom layer still resolves.
        match resolve(&guard, "\\data\\only1.txt", OpClass::OpenExisting).unwrap() {
            Resolution::Real(real) => assert_eq!(real, s1.path().join("only1.txt")),
            other => panic!("expected s1's file, got {:?}", other),
        }
    }

    #[test]
    fn test_enumerate_dedups_across_layers() {
        let s1 = tempdir().unwrap();
        let s2 = tempdir().unwrap();
        fs::write(s1.path().join("b.txt"), b"1").unwrap();
        fs::write(s2.path().join("b.txt"), b"2").unwrap();
        fs::write(s2.path().join("c.txt"), b"2").unwrap();

        let ctx = attach("rd-enum");
        let guard = ctx.write_access().unwrap();
        guard
            .add_directory(
                &vp("\\data"),
                &[
                    s1.path().to_string_lossy().into_owned(),
                    s2.path().to_string_lossy().into_owned(),
                ],
                NodeFlags::empty(),
            )
            .unwrap();
        guard
            .add_file(&vp("\\data\\virt.txt"), "/backing/virt.txt", NodeFlags::empty())
            .unwrap();

        let entries = enumerate(&guard, "\\data").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();

        // Virtual child first, then real children, b.txt exactly once.
        assert_eq!(names[0], "virt.txt");
        assert_eq!(names.iter().filter(|n| **n == "b.txt").count(), 1);
        assert!(names.contains(&"c.txt"));
    }

    #[test]
    fn test_delete_masks_and_recreate_unmasks() {
        let s1 = tempdir().unwrap();
        fs::write(s1.path().join("b.txt"), b"gone").unwrap();

        let ctx = attach("rd-delete");
        let guard = ctx.write_access().unwrap();
        guard
            .add_directory(
                &vp("\\data"),
                &[s1.path().to_string_lossy().into_owned()],
                NodeFlags::empty(),
            )
            .unwrap();

        assert!(observe_delete(&guard, "\\data\\b.txt").unwrap());
        assert!(guard.exists_deleted_file(&vp("\\data\\b.txt")));

        assert_eq!(
            resolve(&guard, "\\data\\b.txt", OpClass::OpenExisting).unwrap(),
            Resolution::Absent
        );
        let names: Vec<_> = enumerate(&guard, "\\data")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(!names.contains(&"b.txt".to_string()));

        // Re-creating routes back to the hidden real path and clears
        // the tracker.
        match resolve_write(&guard, "\\data\\b.txt", OpClass::OpenOrCreate).unwrap() {
            Resolution::Real(real) => assert_eq!(real, s1.path().join("b.txt")),
            other => panic!("expected the hidden backing, got {:?}", other),
        }
        assert!(!guard.exists_deleted_file(&vp("\\data\\b.txt")));
    }

    #[test]
    fn test_copy_on_write_materializes_into_overlay() {
        let source = tempdir().unwrap();
        let overlay = tempdir().unwrap();
        fs::write(source.path().join("save.dat"), b"original").unwrap();

        let ctx = attach("rd-cow");
        let guard = ctx.write_access().unwrap();
        guard.set_overlay_root(overlay.path()).unwrap();
        guard
            .add_file(
                &vp("\\game\\save.dat"),
                &source.path().join("save.dat").to_string_lossy(),
                NodeFlags::empty(),
            )
            .unwrap();

        let target = match resolve_write(&guard, "\\game\\save.dat", OpClass::OpenOrCreate).unwrap()
        {
            Resolution::Real(real) => real,
            other => panic!("expected a writable copy, got {:?}", other),
        };

        assert!(target.starts_with(overlay.path()));
        assert_eq!(fs::read(&target).unwrap(), b"original");

        // The node now points at the copy and the inverse index
        // followed.
        match guard.lookup(&vp("\\game\\save.dat")) {
            Lookup::File { real, flags } => {
                assert_eq!(PathBuf::from(real), target);
                assert!(flags.contains(NodeFlags::FROM_OVERLAY));
            }
            other => panic!("expected updated node, got {:?}", other),
        }
        assert_eq!(
            guard.lookup_by_real(&target.to_string_lossy()),
            vec!["/game/save.dat"]
        );

        // A second write-open stays on the overlay copy without
        // re-copying.
        match resolve_write(&guard, "\\game\\save.dat", OpClass::OpenOrCreate).unwrap() {
            Resolution::Real(real) => assert_eq!(real, target),
            other => panic!("expected the same copy, got {:?}", other),
        }
    }

    #[test]
    fn test_create_in_layered_directory_lands_in_overlay() {
        let s1 = tempdir().unwrap();
        let overlay = tempdir().unwrap();

        let ctx = attach("rd-create");
        let guard = ctx.write_access().unwrap();
        guard.set_overlay_root(overlay.path()).unwrap();
        guard
            .add_directory(
                &vp("\\data"),
                &[s1.path().to_string_lossy().into_owned()],
                NodeFlags::empty(),
            )
            .unwrap();

        match resolve_write(&guard, "\\data\\new.txt", OpClass::CreateNew).unwrap() {
            Resolution::Real(real) => {
                assert_eq!(real, overlay.path().join("data").join("new.txt"));
                assert!(real.parent().unwrap().is_dir());
            }
            other => panic!("expected an overlay target, got {:?}", other),
        }
    }

    #[test]
    fn test_create_without_overlay_root_fails() {
        let ctx = attach("rd-noroot");
        let guard = ctx.write_access().unwrap();

        assert!(matches!(
            resolve_write(&guard, "\\data\\new.txt", OpClass::CreateNew),
            Err(Error::OverlayUnconfigured)
        ));
    }

    #[test]
    fn test_fake_directory_projects_real_listing() {
        let projected = tempdir().unwrap();
        fs::write(projected.path().join("mod.pak"), b"pak").unwrap();

        let ctx = attach("rd-fake");
        let guard = ctx.write_access().unwrap();
        guard
            .add_fake_directory(
                &vp("\\virtual\\mods"),
                &projected.path().to_string_lossy(),
            )
            .unwrap();

        match resolve(&guard, "\\virtual\\mods", OpClass::OpenExisting).unwrap() {
            Resolution::Real(real) => assert_eq!(real, projected.path()),
            other => panic!("expected the projected directory, got {:?}", other),
        }

        let names: Vec<_> = enumerate(&guard, "\\virtual\\mods")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["mod.pak"]);
    }

    #[test]
    fn test_enumerate_subdirectory_through_layers() {
        let s1 = tempdir().unwrap();
        fs::create_dir(s1.path().join("sub")).unwrap();
        fs::write(s1.path().join("sub").join("x.txt"), b"x").unwrap();

        let ctx = attach("rd-subenum");
        let guard = ctx.write_access().unwrap();
        guard
            .add_directory(
                &vp("\\data"),
                &[s1.path().to_string_lossy().into_owned()],
                NodeFlags::empty(),
            )
            .unwrap();

        // \data\sub has no tree node of its own; it enumerates through
        // the layer candidates.
        let names: Vec<_> = enumerate(&guard, "\\data\\sub")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["x.txt"]);

        match resolve(&guard, "\\data\\sub\\x.txt", OpClass::OpenExisting).unwrap() {
            Resolution::Real(real) => assert_eq!(real, s1.path().join("sub").join("x.txt")),
            other => panic!("expected the layered file, got {:?}", other),
        }
    }

    #[test]
    fn test_rename_is_delete_plus_add() {
        let s1 = tempdir().unwrap();
        let overlay = tempdir().unwrap();
        fs::write(s1.path().join("old.txt"), b"payload").unwrap();

        let ctx = attach("rd-rename");
        let guard = ctx.write_access().unwrap();
        guard.set_overlay_root(overlay.path()).unwrap();
        guard
            .add_directory(
                &vp("\\data"),
                &[s1.path().to_string_lossy().into_owned()],
                NodeFlags::empty(),
            )
            .unwrap();

        let plan = observe_rename(&guard, "\\data\\old.txt", "\\data\\new.txt").unwrap();
        assert_eq!(plan.source, s1.path().join("old.txt"));
        assert!(plan.target.starts_with(overlay.path()));

        // Source is masked, destination resolves to the target.
        assert_eq!(
            resolve(&guard, "\\data\\old.txt", OpClass::OpenExisting).unwrap(),
            Resolution::Absent
        );
        match guard.lookup(&vp("\\data\\new.txt")) {
            Lookup::File { real, .. } => assert_eq!(PathBuf::from(real), plan.target),
            other => panic!("expected destination node, got {:?}", other),
        }
    }

    #[test]
    fn test_observed_handles_answer_reverse_queries() {
        let ctx = attach("rd-handles");
        {
            let guard = ctx.write_access().unwrap();
            observe_open(&guard, "\\data\\a.txt", Path::new("/real/a.txt"), 42).unwrap();
            assert_eq!(guard.lookup_by_real("/real/a.txt"), vec!["/data/a.txt"]);
        }

        let open = ctx.handles().get(42).unwrap();
        assert_eq!(open.virtual_path, "/data/a.txt");

        let closed = observe_close(&ctx, 42).unwrap();
        assert_eq!(closed.real_path, "/real/a.txt");
        assert!(ctx.handles().get(42).is_none());
    }

    #[test]
    fn test_should_inject_honors_blacklist() {
        let ctx = attach("rd-inject");
        let guard = ctx.write_access().unwrap();
        guard.blacklist_executable(".tmp.exe").unwrap();

        assert!(!should_inject(&guard, Some("C:\\x\\helper.TMP.EXE"), None));
        assert!(!should_inject(&guard, None, Some("spawn helper.tmp.exe now")));
        assert!(should_inject(&guard, Some("C:\\x\\game.exe"), None));
    }

    #[test]
    fn test_invalid_path_reported_for_passthrough() {
        let ctx = attach("rd-invalid");
        let guard = ctx.read_access().unwrap();
        assert!(matches!(
            resolve(&guard, "\\..\\outside", OpClass::OpenExisting),
            Err(Error::PathInvalid(_))
        ));
    }
}
