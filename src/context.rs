//! Hook context
//!
//! The per-process object every shim goes through. It owns this
//! process's handles to the three instance segments and the instance
//! mutex, and hands out read and write guards over the shared state.
//! At most one context exists per process; duplicate attachment fails
//! loudly.

use crate::config::{
    truncate_to, CrashDumpsType, InstanceConfig, LogLevel, CONFIG_SEGMENT_SIZE,
    TREE_SEGMENT_SIZE,
};
use crate::error::{Error, Result};
use crate::handles::HandleMap;
use crate::params::SharedParams;
use crate::paths::VirtualPath;
use crate::shm::{InstanceMutex, MutexGuard, SharedSegment};
use crate::tree::{
    ChildEntry, InverseTree, Lookup, NodeFlags, PrefixMatch, RemovedEntry, VirtualTree,
};
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bound on every cross-process lock acquisition
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(200);

static ATTACHED: AtomicBool = AtomicBool::new(false);

/// Per-process handle to one instance
pub struct HookContext {
    instance_name: String,
    config_seg: SharedSegment,
    params_off: u32,
    tree: RwLock<VirtualTree>,
    inverse: RwLock<InverseTree>,
    mutex: InstanceMutex,
    handles: HandleMap,
    delayed: Mutex<Vec<JoinHandle<i32>>>,
    hook_library: Option<PathBuf>,
    debug_mode: bool,
    managed: bool,
}

impl HookContext {
    /// Attach this process to the instance the configuration names,
    /// creating the instance if this is the first attach. A second
    /// attach within the same process fails with `DuplicateAttach`.
    pub fn attach(config: &InstanceConfig) -> Result<Self> {
        if ATTACHED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::DuplicateAttach);
        }

        match Self::open_instance(config, true) {
            Ok(context) => Ok(context),
            Err(e) => {
                ATTACHED.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Attach without claiming the per-process slot. Used by tooling
    /// that inspects an instance it does not participate in, and by
    /// tests exercising multiple attachments in one process.
    pub fn attach_unmanaged(config: &InstanceConfig) -> Result<Self> {
        Self::open_instance(config, false)
    }

    fn open_instance(config: &InstanceConfig, managed: bool) -> Result<Self> {
        let mut config = config.clone();
        config.truncate_names();
        config.validate()?;

        let mutex = InstanceMutex::open(&config.instance_name)?;

        // Hold the instance lock through the whole attach so a
        // concurrent first attach cannot observe a half-built
        // configuration segment and a concurrent last detach cannot
        // unlink segments under us.
        let lock = mutex.acquire(LOCK_TIMEOUT)?;

        let (config_seg, created) =
            SharedSegment::create_or_open(&config.instance_name, CONFIG_SEGMENT_SIZE)?;
        let params = match SharedParams::find(&config_seg) {
            Some(params) => {
                debug!(
                    instance = %config.instance_name,
                    "adopting existing shared parameters"
                );
                params
            }
            None => {
                info!(
                    instance = %config.instance_name,
                    created_segment = created,
                    "seeding shared parameters"
                );
                SharedParams::construct(&config_seg, &config)?
            }
        };
        let params_off = params.offset();
        let debug_mode = params.debug_mode() || config.debug_mode;
        let tree_name = params.current_shm_name();
        let inverse_name = params.current_inverse_shm_name();

        let tree = VirtualTree::create(&tree_name, TREE_SEGMENT_SIZE)?;
        let inverse = InverseTree::create(&inverse_name, TREE_SEGMENT_SIZE)?;
        let users = params.increment_user_count();
        debug!(
            instance = %config.instance_name,
            users,
            tree = %tree_name,
            "attached hook context"
        );
        drop(lock);

        Ok(HookContext {
            instance_name: config.instance_name.clone(),
            config_seg,
            params_off,
            tree: RwLock::new(tree),
            inverse: RwLock::new(inverse),
            mutex,
            handles: HandleMap::new(),
            delayed: Mutex::new(Vec::new()),
            hook_library: config.hook_library.clone(),
            debug_mode,
            managed,
        })
    }

    /// Explicit detach; identical to dropping the context
    pub fn detach(self) {}

    fn params(&self) -> SharedParams<'_> {
        SharedParams::at(&self.config_seg, self.params_off)
    }

    /// Acquire the instance mutex for reading shared state
    pub fn read_access(&self) -> Result<ReadGuard<'_>> {
        let lock = self.mutex.acquire(LOCK_TIMEOUT)?;
        self.refresh_trees()?;
        Ok(ReadGuard { ctx: self, _lock: lock })
    }

    /// Acquire the instance mutex for mutating shared state
    pub fn write_access(&self) -> Result<WriteGuard<'_>> {
        Ok(WriteGuard {
            inner: self.read_access()?,
        })
    }

    /// Reopen tree handles if another process republished them under
    /// new segment names. Called with the instance mutex held.
    fn refresh_trees(&self) -> Result<()> {
        let params = self.params();

        let want = params.current_shm_name();
        if self.tree.read().shm_name() != want {
            debug!(segment = %want, "switching to republished tree segment");
            *self.tree.write() = VirtualTree::open(&want)?;
        }

        let want = params.current_inverse_shm_name();
        if self.inverse.read().shm_name() != want {
            debug!(segment = %want, "switching to republished inverse segment");
            *self.inverse.write() = InverseTree::open(&want)?;
        }
        Ok(())
    }

    /// Park an outstanding asynchronous result so it is not dropped
    /// before process exit
    pub fn register_delayed(&self, pending: JoinHandle<i32>) {
        self.delayed.lock().push(pending);
    }

    /// Take ownership of all parked results
    pub fn drain_delayed(&self) -> Vec<JoinHandle<i32>> {
        self.delayed.lock().drain(..).collect()
    }

    /// This process's open handle registry
    pub fn handles(&self) -> &HandleMap {
        &self.handles
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Path of the hook library handed to child processes
    pub fn hook_library(&self) -> Option<&Path> {
        self.hook_library.as_deref()
    }

    /// Local copy of the debug flag; a relaxed read, not suitable for
    /// invariants
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }
}

impl Drop for HookContext {
    fn drop(&mut self) {
        // Outstanding asynchronous results first; they may still need
        // the shared state.
        for pending in self.delayed.lock().drain(..) {
            let _ = pending.join();
        }

        match self.mutex.acquire(LOCK_TIMEOUT) {
            Ok(_lock) => {
                let params = self.params();
                let remaining = params.decrement_user_count();
                if remaining == 0 {
                    let tree_name = params.current_shm_name();
                    let inverse_name = params.current_inverse_shm_name();
                    info!(
                        instance = %self.instance_name,
                        "last user detached, removing instance"
                    );
                    if let Err(e) = SharedSegment::unlink(&tree_name) {
                        warn!(error = %e, segment = %tree_name, "failed to unlink segment");
                    }
                    if let Err(e) = SharedSegment::unlink(&inverse_name) {
                        warn!(error = %e, segment = %inverse_name, "failed to unlink segment");
                    }
                    if let Err(e) = SharedSegment::unlink(&self.instance_name) {
                        warn!(
                            error = %e,
                            segment = %self.instance_name,
                            "failed to unlink segment"
                        );
                    }
                    self.mutex.unlink();
                } else {
                    info!(instance = %self.instance_name, remaining, "detached");
                }
            }
            Err(e) => {
                warn!(
                    instance = %self.instance_name,
                    error = %e,
                    "detach could not take the instance lock"
                );
            }
        }

        if self.managed {
            ATTACHED.store(false, Ordering::SeqCst);
        }
    }
}

/// Read-only access to the shared state, held under the instance mutex
pub struct ReadGuard<'a> {
    ctx: &'a HookContext,
    _lock: MutexGuard<'a>,
}

impl ReadGuard<'_> {
    // --- virtual tree ---

    pub fn lookup(&self, path: &VirtualPath) -> Lookup {
        self.ctx.tree.read().lookup(path)
    }

    pub fn resolve_prefix(&self, path: &VirtualPath) -> PrefixMatch {
        self.ctx.tree.read().resolve_prefix(path)
    }

    pub fn virtual_children(&self, path: &VirtualPath) -> Option<Vec<ChildEntry>> {
        self.ctx.tree.read().virtual_children(path)
    }

    pub fn tree_node_count(&self) -> usize {
        self.ctx.tree.read().node_count()
    }

    // --- inverse index ---

    pub fn lookup_by_real(&self, real: &str) -> Vec<String> {
        self.ctx.inverse.read().lookup_by_real(real)
    }

    // --- trackers ---

    pub fn exists_deleted_file(&self, path: &VirtualPath) -> bool {
        self.ctx.params().exists_deleted_file(&path.to_string())
    }

    pub fn lookup_deleted_file(&self, path: &VirtualPath) -> Option<String> {
        self.ctx.params().lookup_deleted_file(&path.to_string())
    }

    pub fn deleted_files(&self) -> Vec<(String, String)> {
        self.ctx.params().deleted_files()
    }

    pub fn exists_fake_directory(&self, path: &VirtualPath) -> bool {
        self.ctx.params().exists_fake_directory(&path.to_string())
    }

    pub fn lookup_fake_directory(&self, path: &VirtualPath) -> Option<String> {
        self.ctx.params().lookup_fake_directory(&path.to_string())
    }

    pub fn fake_directories(&self) -> Vec<(String, String)> {
        self.ctx.params().fake_directories()
    }

    // --- process propagation state ---

    pub fn executable_blacklisted(
        &self,
        app_name: Option<&str>,
        command_line: Option<&str>,
    ) -> bool {
        self.ctx.params().executable_blacklisted(app_name, command_line)
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.ctx.params().blacklist()
    }

    pub fn libraries_to_force_load(&self, process_name: &str) -> Vec<String> {
        self.ctx.params().libraries_to_force_load(process_name)
    }

    pub fn registered_processes(&self) -> Vec<u32> {
        self.ctx.params().registered_processes()
    }

    // --- instance-wide settings ---

    pub fn user_count(&self) -> u32 {
        self.ctx.params().user_count()
    }

    pub fn log_level(&self) -> LogLevel {
        self.ctx.params().log_level()
    }

    pub fn crash_dumps_type(&self) -> CrashDumpsType {
        self.ctx.params().crash_dumps_type()
    }

    pub fn crash_dumps_path(&self) -> String {
        self.ctx.params().crash_dumps_path()
    }

    pub fn overlay_root(&self) -> Option<PathBuf> {
        self.ctx.params().overlay_root()
    }

    /// Snapshot the shared parameters for handing to a child process.
    /// Always reflects the currently published tree segment names.
    pub fn call_parameters(&self) -> InstanceConfig {
        let mut config = self.ctx.params().to_config();
        config.hook_library = self.ctx.hook_library.clone();
        config
    }

    /// This process's open handle registry
    pub fn handles(&self) -> &HandleMap {
        &self.ctx.handles
    }
}

/// Mutating access to the shared state, held under the instance mutex
pub struct WriteGuard<'a> {
    inner: ReadGuard<'a>,
}

impl<'a> Deref for WriteGuard<'a> {
    type Target = ReadGuard<'a>;

    fn deref(&self) -> &ReadGuard<'a> {
        &self.inner
    }
}

impl WriteGuard<'_> {
    fn ctx(&self) -> &HookContext {
        self.inner.ctx
    }

    // --- virtual tree mutation, with inverse index write-through ---

    pub fn add_file(&self, path: &VirtualPath, real: &str, flags: NodeFlags) -> Result<()> {
        let replaced = self.with_tree_retry(|tree| tree.add_file(path, real, flags))?;

        let virtual_path = path.to_string();
        if let Some(old) = replaced {
            self.ctx().inverse.read().remove_mapping(&old, &virtual_path);
        }
        self.with_inverse_retry(|inverse| inverse.add_mapping(real, &virtual_path))
    }

    pub fn add_directory(
        &self,
        path: &VirtualPath,
        reals: &[String],
        flags: NodeFlags,
    ) -> Result<()> {
        let added = self.with_tree_retry(|tree| tree.add_directory(path, reals, flags))?;

        let virtual_path = path.to_string();
        for real in &added {
            self.with_inverse_retry(|inverse| inverse.add_mapping(real, &virtual_path))?;
        }
        Ok(())
    }

    pub fn remove(&self, path: &VirtualPath) -> Result<Vec<RemovedEntry>> {
        let removed = self.ctx().tree.read().remove(path)?;

        let inverse = self.ctx().inverse.read();
        for entry in &removed {
            for real in &entry.reals {
                inverse.remove_mapping(real, &entry.virtual_path);
            }
        }
        drop(inverse);
        Ok(removed)
    }

    /// Record a backing association in the inverse index without
    /// touching the virtual tree (observed opens)
    pub fn add_mapping(&self, real: &str, path: &VirtualPath) -> Result<()> {
        let virtual_path = path.to_string();
        self.with_inverse_retry(|inverse| inverse.add_mapping(real, &virtual_path))
    }

    // --- trackers ---

    pub fn add_deleted_file(&self, path: &VirtualPath, real: &str) -> Result<()> {
        self.ctx().params().add_deleted_file(&path.to_string(), real)
    }

    pub fn forget_deleted_file(&self, path: &VirtualPath) -> bool {
        self.ctx().params().forget_deleted_file(&path.to_string())
    }

    pub fn add_fake_directory(&self, path: &VirtualPath, real: &str) -> Result<()> {
        self.ctx().params().add_fake_directory(&path.to_string(), real)
    }

    pub fn forget_fake_directory(&self, path: &VirtualPath) -> bool {
        self.ctx().params().forget_fake_directory(&path.to_string())
    }

    // --- process propagation state ---

    pub fn register_process(&self, pid: u32) -> Result<()> {
        self.ctx().params().register_process(pid)
    }

    pub fn unregister_process(&self, pid: u32) -> bool {
        self.ctx().params().unregister_process(pid)
    }

    pub fn unregister_current_process(&self) -> bool {
        self.ctx().params().unregister_process(std::process::id())
    }

    pub fn blacklist_executable(&self, suffix: &str) -> Result<()> {
        self.ctx().params().blacklist_executable(suffix)
    }

    pub fn clear_blacklist(&self) {
        self.ctx().params().clear_blacklist()
    }

    pub fn force_load_library(&self, process_name: &str, library_path: &str) -> Result<()> {
        self.ctx().params().force_load_library(process_name, library_path)
    }

    pub fn clear_forced_libraries(&self) {
        self.ctx().params().clear_forced_libraries()
    }

    // --- instance-wide settings ---

    pub fn set_log_level(&self, level: LogLevel) {
        self.ctx().params().set_log_level(level)
    }

    pub fn set_crash_dumps_type(&self, dumps: CrashDumpsType) {
        self.ctx().params().set_crash_dumps_type(dumps)
    }

    pub fn set_overlay_root(&self, root: &Path) -> Result<()> {
        self.ctx().params().set_overlay_root(&root.to_string_lossy())
    }

    // --- tree growth ---

    /// Run a tree mutation, rebuilding the tree into a larger segment
    /// once if the current one is exhausted
    fn with_tree_retry<T>(&self, op: impl Fn(&VirtualTree) -> Result<T>) -> Result<T> {
        match op(&self.ctx().tree.read()) {
            Err(Error::SegmentExhausted(_)) => {
                self.grow_tree()?;
                op(&self.ctx().tree.read())
            }
            other => other,
        }
    }

    fn with_inverse_retry<T>(&self, op: impl Fn(&InverseTree) -> Result<T>) -> Result<T> {
        match op(&self.ctx().inverse.read()) {
            Err(Error::SegmentExhausted(_)) => {
                self.grow_inverse()?;
                op(&self.ctx().inverse.read())
            }
            other => other,
        }
    }

    fn grow_tree(&self) -> Result<()> {
        let params = self.ctx().params();
        let generation = params.next_tree_generation();
        let base = truncate_to(
            &format!("{}_tree", self.ctx().instance_name),
            crate::config::NAME_LIMIT,
        );
        let name = format!("{}_{}", base, generation);

        let (old_name, fresh) = {
            let tree = self.ctx().tree.read();
            let size = tree.segment_size() * 2;
            info!(
                from = tree.shm_name(),
                to = %name,
                size,
                "tree segment exhausted, rebuilding"
            );
            (tree.shm_name().to_string(), tree.rebuild_into(&name, size)?)
        };

        params.set_current_shm_name(&name)?;
        *self.ctx().tree.write() = fresh;
        // Readers in other processes refresh from the published name on
        // their next guard; the kernel keeps the old mapping alive for
        // them until then.
        SharedSegment::unlink(&old_name)?;
        Ok(())
    }

    fn grow_inverse(&self) -> Result<()> {
        let params = self.ctx().params();
        let generation = params.next_tree_generation();
        let base = truncate_to(
            &format!("{}_inverse", self.ctx().instance_name),
            crate::config::NAME_LIMIT,
        );
        let name = format!("{}_{}", base, generation);

        let (old_name, fresh) = {
            let inverse = self.ctx().inverse.read();
            let size = inverse.segment_size() * 2;
            info!(
                from = inverse.shm_name(),
                to = %name,
                size,
                "inverse segment exhausted, rebuilding"
            );
            (
                inverse.shm_name().to_string(),
                inverse.rebuild_into(&name, size)?,
            )
        };

        params.set_current_inverse_shm_name(&name)?;
        *self.ctx().inverse.write() = fresh;
        SharedSegment::unlink(&old_name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unique_name;
    use crate::tree::Lookup;
    use std::thread;

    fn vp(raw: &str) -> VirtualPath {
        VirtualPath::parse(raw).unwrap()
    }

    fn instance(tag: &str) -> InstanceConfig {
        InstanceConfig::new(&unique_name(tag))
    }

    #[test]
    fn test_attach_seeds_then_adopts() {
        let config = instance("ctx-seed");

        let first = HookContext::attach_unmanaged(&config).unwrap();
        {
            let guard = first.read_access().unwrap();
            assert_eq!(guard.user_count(), 1);
        }

        let second = HookContext::attach_unmanaged(&config).unwrap();
        {
            let guard = second.read_access().unwrap();
            assert_eq!(guard.user_count(), 2);
        }

        drop(second);
        {
            let guard = first.read_access().unwrap();
            assert_eq!(guard.user_count(), 1);
        }
        drop(first);
    }

    #[test]
    fn test_last_detach_unlinks_instance() {
        let config = instance("ctx-unlink");

        let a = HookContext::attach_unmanaged(&config).unwrap();
        let b = HookContext::attach_unmanaged(&config).unwrap();
        drop(a);

        // Still attached: the configuration segment must survive.
        assert!(SharedSegment::open(&config.instance_name).is_ok());

        drop(b);
        assert!(matches!(
            SharedSegment::open(&config.instance_name),
            Err(Error::SegmentNotFound(_))
        ));
        assert!(matches!(
            SharedSegment::open(&config.current_shm_name),
            Err(Error::SegmentNotFound(_))
        ));
        assert!(matches!(
            SharedSegment::open(&config.current_inverse_shm_name),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_managed_attach_fails() {
        let config = instance("ctx-dup");

        let first = HookContext::attach(&config).unwrap();
        assert!(matches!(
            HookContext::attach(&config),
            Err(Error::DuplicateAttach)
        ));

        drop(first);
        // The slot frees on detach.
        let again = HookContext::attach(&config).unwrap();
        drop(again);
    }

    #[test]
    fn test_writes_visible_after_guard_release() {
        let config = instance("ctx-visible");

        let writer = HookContext::attach_unmanaged(&config).unwrap();
        let reader = HookContext::attach_unmanaged(&config).unwrap();

        let guard = writer.write_access().unwrap();
        guard
            .add_file(&vp("\\data\\a.txt"), "C:\\real\\a.txt", NodeFlags::empty())
            .unwrap();

        // While the writer holds the mutex, a reader times out.
        assert!(matches!(
            reader.read_access(),
            Err(Error::LockTimeout(_))
        ));

        let watcher = thread::spawn(move || {
            let result = loop {
                match reader.read_access() {
                    Ok(guard) => {
                        let result = guard.lookup(&vp("\\data\\a.txt"));
                        drop(guard);
                        break result;
                    }
                    Err(Error::LockTimeout(_)) => continue,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            };
            (reader, result)
        });

        drop(guard);
        let (reader, seen) = watcher.join().unwrap();
        match seen {
            Lookup::File { real, .. } => assert_eq!(real, "C:\\real\\a.txt"),
            other => panic!("expected the writer's file, got {:?}", other),
        }

        drop(reader);
        drop(writer);
    }

    #[test]
    fn test_inverse_index_follows_mutations() {
        let config = instance("ctx-inverse");
        let ctx = HookContext::attach_unmanaged(&config).unwrap();

        let guard = ctx.write_access().unwrap();
        guard
            .add_file(&vp("\\data\\a.txt"), "C:\\real\\a.txt", NodeFlags::empty())
            .unwrap();
        assert_eq!(
            guard.lookup_by_real("C:\\real\\a.txt"),
            vec!["/data/a.txt"]
        );

        // Re-pointing the file moves the mapping.
        guard
            .add_file(&vp("\\data\\a.txt"), "C:\\over\\a.txt", NodeFlags::empty())
            .unwrap();
        assert!(guard.lookup_by_real("C:\\real\\a.txt").is_empty());
        assert_eq!(guard.lookup_by_real("C:\\over\\a.txt"), vec!["/data/a.txt"]);

        // Removal drops it.
        guard.remove(&vp("\\data\\a.txt")).unwrap();
        assert!(guard.lookup_by_real("C:\\over\\a.txt").is_empty());

        drop(guard);
        drop(ctx);
    }

    #[test]
    fn test_tree_grows_when_segment_fills() {
        let config = instance("ctx-grow");
        let writer = HookContext::attach_unmanaged(&config).unwrap();
        let reader = HookContext::attach_unmanaged(&config).unwrap();

        {
            let guard = writer.write_access().unwrap();
            for i in 0..900 {
                let path = vp(&format!("\\grow\\file-{:04}.txt", i));
                guard
                    .add_file(
                        &path,
                        &format!("C:\\backing\\file-{:04}.txt", i),
                        NodeFlags::empty(),
                    )
                    .unwrap();
            }
        }

        // The reader follows the republished segment name and sees
        // everything.
        {
            let guard = reader.read_access().unwrap();
            assert!(matches!(
                guard.lookup(&vp("\\grow\\file-0000.txt")),
                Lookup::File { .. }
            ));
            assert!(matches!(
                guard.lookup(&vp("\\grow\\file-0899.txt")),
                Lookup::File { .. }
            ));
        }

        drop(reader);
        drop(writer);
    }

    #[test]
    fn test_delayed_results_drain() {
        let config = instance("ctx-delayed");
        let ctx = HookContext::attach_unmanaged(&config).unwrap();

        ctx.register_delayed(thread::spawn(|| 7));
        ctx.register_delayed(thread::spawn(|| 9));

        let mut results: Vec<i32> = ctx
            .drain_delayed()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        results.sort_unstable();
        assert_eq!(results, vec![7, 9]);
        assert!(ctx.drain_delayed().is_empty());

        drop(ctx);
    }

    #[test]
    fn test_call_parameters_reflect_shared_state() {
        let config = instance("ctx-params");
        let ctx = HookContext::attach_unmanaged(&config).unwrap();

        {
            let guard = ctx.write_access().unwrap();
            guard.set_log_level(LogLevel::Error);
            guard.set_overlay_root(Path::new("/tmp/overlay")).unwrap();
        }

        {
            let guard = ctx.read_access().unwrap();
            let snapshot = guard.call_parameters();
            assert_eq!(snapshot.instance_name, config.instance_name);
            assert_eq!(snapshot.log_level, LogLevel::Error);
            assert_eq!(snapshot.overlay_root, Some(PathBuf::from("/tmp/overlay")));
        }

        drop(ctx);
    }
}
