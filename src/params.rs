//! Shared parameters
//!
//! The singleton record inside the configuration segment. Every
//! attached process sees the same record; all strings and list entries
//! are allocated from the configuration segment's allocator. Access is
//! serialized by the instance mutex, which the hook context guards
//! enforce.

use crate::config::{CrashDumpsType, InstanceConfig, LogLevel};
use crate::error::Result;
use crate::paths::{contains_fold, ends_with_fold, eq_fold, fold};
use crate::shm::SharedSegment;
use std::path::PathBuf;

/// Name of the record in the configuration segment directory
const PARAMETERS_OBJECT: &str = "parameters";

#[repr(C)]
#[derive(Clone, Copy)]
struct ParamsRec {
    instance_name: u32,
    current_shm: u32,
    current_inverse_shm: u32,
    crash_dumps_path: u32,
    overlay_root: u32,
    debug_mode: u8,
    log_level: u8,
    crash_dumps_type: u8,
    pad: u8,
    user_count: u32,
    tree_generation: u32,
    process_head: u32,
    blacklist_head: u32,
    forced_head: u32,
    deleted_head: u32,
    fakedir_head: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PidRec {
    next: u32,
    pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct StrRec {
    next: u32,
    value: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PairRec {
    next: u32,
    from: u32,
    to: u32,
}

/// View over the shared parameters record of one instance
pub struct SharedParams<'a> {
    seg: &'a SharedSegment,
    offset: u32,
}

impl<'a> SharedParams<'a> {
    /// Adopt the record an earlier process published
    pub fn find(seg: &'a SharedSegment) -> Option<Self> {
        seg.find_named(PARAMETERS_OBJECT)
            .map(|offset| SharedParams { seg, offset })
    }

    /// Rebuild a view from an offset obtained earlier
    pub(crate) fn at(seg: &'a SharedSegment, offset: u32) -> Self {
        SharedParams { seg, offset }
    }

    /// Offset of the record inside the configuration segment
    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    /// Seed the record from the attaching process's configuration
    pub fn construct(seg: &'a SharedSegment, config: &InstanceConfig) -> Result<Self> {
        let offset = seg.alloc(std::mem::size_of::<ParamsRec>())?;

        let rec = ParamsRec {
            instance_name: seg.alloc_str(&config.instance_name)?,
            current_shm: seg.alloc_str(&config.current_shm_name)?,
            current_inverse_shm: seg.alloc_str(&config.current_inverse_shm_name)?,
            crash_dumps_path: seg.alloc_str(&config.crash_dumps_path)?,
            overlay_root: match &config.overlay_root {
                Some(root) => seg.alloc_str(&root.to_string_lossy())?,
                None => 0,
            },
            debug_mode: config.debug_mode as u8,
            log_level: config.log_level.to_raw(),
            crash_dumps_type: config.crash_dumps_type.to_raw(),
            pad: 0,
            user_count: 0,
            tree_generation: 0,
            process_head: 0,
            blacklist_head: 0,
            forced_head: 0,
            deleted_head: 0,
            fakedir_head: 0,
        };
        seg.write_at(offset, rec);
        seg.insert_named(PARAMETERS_OBJECT, offset)?;

        Ok(SharedParams { seg, offset })
    }

    fn rec(&self) -> ParamsRec {
        self.seg.read_at(self.offset)
    }

    fn put(&self, rec: ParamsRec) {
        self.seg.write_at(self.offset, rec);
    }

    // --- plain fields ---

    pub fn instance_name(&self) -> String {
        self.seg.read_str(self.rec().instance_name)
    }

    pub fn current_shm_name(&self) -> String {
        self.seg.read_str(self.rec().current_shm)
    }

    pub fn current_inverse_shm_name(&self) -> String {
        self.seg.read_str(self.rec().current_inverse_shm)
    }

    /// Publish a new virtual tree segment name after a rebuild
    pub fn set_current_shm_name(&self, name: &str) -> Result<()> {
        let mut rec = self.rec();
        rec.current_shm = self.seg.replace_str(rec.current_shm, name)?;
        self.put(rec);
        Ok(())
    }

    /// Publish a new inverse tree segment name after a rebuild
    pub fn set_current_inverse_shm_name(&self, name: &str) -> Result<()> {
        let mut rec = self.rec();
        rec.current_inverse_shm = self.seg.replace_str(rec.current_inverse_shm, name)?;
        self.put(rec);
        Ok(())
    }

    /// Monotonic counter naming rebuilt tree segments
    pub fn next_tree_generation(&self) -> u32 {
        let mut rec = self.rec();
        rec.tree_generation += 1;
        self.put(rec);
        rec.tree_generation
    }

    pub fn debug_mode(&self) -> bool {
        self.rec().debug_mode != 0
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_raw(self.rec().log_level)
    }

    pub fn set_log_level(&self, level: LogLevel) {
        let mut rec = self.rec();
        rec.log_level = level.to_raw();
        self.put(rec);
    }

    pub fn crash_dumps_type(&self) -> CrashDumpsType {
        CrashDumpsType::from_raw(self.rec().crash_dumps_type)
    }

    pub fn set_crash_dumps_type(&self, dumps: CrashDumpsType) {
        let mut rec = self.rec();
        rec.crash_dumps_type = dumps.to_raw();
        self.put(rec);
    }

    pub fn crash_dumps_path(&self) -> String {
        self.seg.read_str(self.rec().crash_dumps_path)
    }

    pub fn overlay_root(&self) -> Option<PathBuf> {
        let rec = self.rec();
        if rec.overlay_root == 0 {
            return None;
        }
        Some(PathBuf::from(self.seg.read_str(rec.overlay_root)))
    }

    pub fn set_overlay_root(&self, root: &str) -> Result<()> {
        let mut rec = self.rec();
        rec.overlay_root = if rec.overlay_root == 0 {
            self.seg.alloc_str(root)?
        } else {
            self.seg.replace_str(rec.overlay_root, root)?
        };
        self.put(rec);
        Ok(())
    }

    /// Snapshot the shared record into a local configuration, for
    /// handing to a child process
    pub fn to_config(&self) -> InstanceConfig {
        let mut config = InstanceConfig::new(&self.instance_name());
        config.current_shm_name = self.current_shm_name();
        config.current_inverse_shm_name = self.current_inverse_shm_name();
        config.debug_mode = self.debug_mode();
        config.log_level = self.log_level();
        config.crash_dumps_type = self.crash_dumps_type();
        config.crash_dumps_path = self.crash_dumps_path();
        config.overlay_root = self.overlay_root();
        config
    }

    // --- reference count ---

    pub fn user_count(&self) -> u32 {
        self.rec().user_count
    }

    pub fn increment_user_count(&self) -> u32 {
        let mut rec = self.rec();
        rec.user_count += 1;
        self.put(rec);
        rec.user_count
    }

    pub fn decrement_user_count(&self) -> u32 {
        let mut rec = self.rec();
        rec.user_count = rec.user_count.saturating_sub(1);
        self.put(rec);
        rec.user_count
    }

    // --- process list ---

    pub fn register_process(&self, pid: u32) -> Result<()> {
        let mut cur = self.rec().process_head;
        while cur != 0 {
            let entry: PidRec = self.seg.read_at(cur);
            if entry.pid == pid {
                return Ok(());
            }
            cur = entry.next;
        }

        let entry = self.seg.alloc(std::mem::size_of::<PidRec>())?;
        let mut rec = self.rec();
        self.seg.write_at(
            entry,
            PidRec {
                next: rec.process_head,
                pid,
            },
        );
        rec.process_head = entry;
        self.put(rec);
        Ok(())
    }

    pub fn unregister_process(&self, pid: u32) -> bool {
        let mut rec = self.rec();
        let mut prev = 0;
        let mut cur = rec.process_head;
        while cur != 0 {
            let entry: PidRec = self.seg.read_at(cur);
            if entry.pid == pid {
                if prev == 0 {
                    rec.process_head = entry.next;
                    self.put(rec);
                } else {
                    let mut prev_rec: PidRec = self.seg.read_at(prev);
                    prev_rec.next = entry.next;
                    self.seg.write_at(prev, prev_rec);
                }
                self.seg.free(cur);
                return true;
            }
            prev = cur;
            cur = entry.next;
        }
        false
    }

    pub fn registered_processes(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        let mut cur = self.rec().process_head;
        while cur != 0 {
            let entry: PidRec = self.seg.read_at(cur);
            pids.push(entry.pid);
            cur = entry.next;
        }
        pids
    }

    // --- executable blacklist ---

    pub fn blacklist_executable(&self, suffix: &str) -> Result<()> {
        let key = fold(suffix);
        let mut cur = self.rec().blacklist_head;
        while cur != 0 {
            let entry: StrRec = self.seg.read_at(cur);
            if fold(&self.seg.read_str(entry.value)) == key {
                return Ok(());
            }
            cur = entry.next;
        }

        let entry = self.seg.alloc(std::mem::size_of::<StrRec>())?;
        let value = match self.seg.alloc_str(suffix) {
            Ok(off) => off,
            Err(e) => {
                self.seg.free(entry);
                return Err(e);
            }
        };
        let mut rec = self.rec();
        self.seg.write_at(
            entry,
            StrRec {
                next: rec.blacklist_head,
                value,
            },
        );
        rec.blacklist_head = entry;
        self.put(rec);
        Ok(())
    }

    pub fn clear_blacklist(&self) {
        let mut rec = self.rec();
        let mut cur = rec.blacklist_head;
        while cur != 0 {
            let entry: StrRec = self.seg.read_at(cur);
            self.seg.free_str(entry.value);
            self.seg.free(cur);
            cur = entry.next;
        }
        rec.blacklist_head = 0;
        self.put(rec);
    }

    pub fn blacklist(&self) -> Vec<String> {
        let mut items = Vec::new();
        let mut cur = self.rec().blacklist_head;
        while cur != 0 {
            let entry: StrRec = self.seg.read_at(cur);
            items.push(self.seg.read_str(entry.value));
            cur = entry.next;
        }
        items
    }

    /// Application name matches by case-insensitive suffix, command
    /// line by case-insensitive substring
    pub fn executable_blacklisted(
        &self,
        app_name: Option<&str>,
        command_line: Option<&str>,
    ) -> bool {
        for item in self.blacklist() {
            if let Some(app) = app_name {
                if ends_with_fold(app, &item) {
                    return true;
                }
            }
            if let Some(cmd) = command_line {
                if contains_fold(cmd, &item) {
                    return true;
                }
            }
        }
        false
    }

    // --- forced libraries ---

    /// Newest registrations are served first
    pub fn force_load_library(&self, process_name: &str, library_path: &str) -> Result<()> {
        let entry = self.seg.alloc(std::mem::size_of::<PairRec>())?;
        let from = self.seg.alloc_str(process_name)?;
        let to = self.seg.alloc_str(library_path)?;

        let mut rec = self.rec();
        self.seg.write_at(
            entry,
            PairRec {
                next: rec.forced_head,
                from,
                to,
            },
        );
        rec.forced_head = entry;
        self.put(rec);
        Ok(())
    }

    pub fn clear_forced_libraries(&self) {
        let mut rec = self.rec();
        let mut cur = rec.forced_head;
        while cur != 0 {
            let entry: PairRec = self.seg.read_at(cur);
            self.seg.free_str(entry.from);
            self.seg.free_str(entry.to);
            self.seg.free(cur);
            cur = entry.next;
        }
        rec.forced_head = 0;
        self.put(rec);
    }

    /// Libraries to load into a process with this executable name,
    /// case-insensitive exact match
    pub fn libraries_to_force_load(&self, process_name: &str) -> Vec<String> {
        let mut libraries = Vec::new();
        let mut cur = self.rec().forced_head;
        while cur != 0 {
            let entry: PairRec = self.seg.read_at(cur);
            if eq_fold(&self.seg.read_str(entry.from), process_name) {
                libraries.push(self.seg.read_str(entry.to));
            }
            cur = entry.next;
        }
        libraries
    }

    // --- deleted file tracker ---

    pub fn add_deleted_file(&self, from: &str, to: &str) -> Result<()> {
        let head = self.rec().deleted_head;
        let head = pair_insert(self.seg, head, from, to)?;
        let mut rec = self.rec();
        rec.deleted_head = head;
        self.put(rec);
        Ok(())
    }

    pub fn exists_deleted_file(&self, from: &str) -> bool {
        pair_find(self.seg, self.rec().deleted_head, from).is_some()
    }

    pub fn lookup_deleted_file(&self, from: &str) -> Option<String> {
        pair_find(self.seg, self.rec().deleted_head, from)
    }

    pub fn forget_deleted_file(&self, from: &str) -> bool {
        let (head, found) = pair_remove(self.seg, self.rec().deleted_head, from);
        let mut rec = self.rec();
        rec.deleted_head = head;
        self.put(rec);
        found
    }

    pub fn deleted_files(&self) -> Vec<(String, String)> {
        pair_entries(self.seg, self.rec().deleted_head)
    }

    // --- fake directory tracker ---

    pub fn add_fake_directory(&self, from: &str, to: &str) -> Result<()> {
        let head = self.rec().fakedir_head;
        let head = pair_insert(self.seg, head, from, to)?;
        let mut rec = self.rec();
        rec.fakedir_head = head;
        self.put(rec);
        Ok(())
    }

    pub fn exists_fake_directory(&self, from: &str) -> bool {
        pair_find(self.seg, self.rec().fakedir_head, from).is_some()
    }

    pub fn lookup_fake_directory(&self, from: &str) -> Option<String> {
        pair_find(self.seg, self.rec().fakedir_head, from)
    }

    pub fn forget_fake_directory(&self, from: &str) -> bool {
        let (head, found) = pair_remove(self.seg, self.rec().fakedir_head, from);
        let mut rec = self.rec();
        rec.fakedir_head = head;
        self.put(rec);
        found
    }

    pub fn fake_directories(&self) -> Vec<(String, String)> {
        pair_entries(self.seg, self.rec().fakedir_head)
    }
}

// Pair-list helpers shared by the two trackers. Keys compare
// case-insensitively; insert replaces an existing entry.

fn pair_insert(seg: &SharedSegment, head: u32, from: &str, to: &str) -> Result<u32> {
    let key = fold(from);
    let mut cur = head;
    while cur != 0 {
        let entry: PairRec = seg.read_at(cur);
        if fold(&seg.read_str(entry.from)) == key {
            let mut updated = entry;
            updated.to = seg.replace_str(entry.to, to)?;
            seg.write_at(cur, updated);
            return Ok(head);
        }
        cur = entry.next;
    }

    let entry = seg.alloc(std::mem::size_of::<PairRec>())?;
    let from_off = seg.alloc_str(from)?;
    let to_off = seg.alloc_str(to)?;
    seg.write_at(
        entry,
        PairRec {
            next: head,
            from: from_off,
            to: to_off,
        },
    );
    Ok(entry)
}

fn pair_find(seg: &SharedSegment, head: u32, from: &str) -> Option<String> {
    let key = fold(from);
    let mut cur = head;
    while cur != 0 {
        let entry: PairRec = seg.read_at(cur);
        if fold(&seg.read_str(entry.from)) == key {
            return Some(seg.read_str(entry.to));
        }
        cur = entry.next;
    }
    None
}

fn pair_remove(seg: &SharedSegment, head: u32, from: &str) -> (u32, bool) {
    let key = fold(from);
    let mut prev = 0;
    let mut cur = head;
    while cur != 0 {
        let entry: PairRec = seg.read_at(cur);
        if fold(&seg.read_str(entry.from)) == key {
            let new_head = if prev == 0 {
                entry.next
            } else {
                let mut prev_rec: PairRec = seg.read_at(prev);
                prev_rec.next = entry.next;
                seg.write_at(prev, prev_rec);
                head
            };
            seg.free_str(entry.from);
            seg.free_str(entry.to);
            seg.free(cur);
            return (new_head, true);
        }
        prev = cur;
        cur = entry.next;
    }
    (head, false)
}

fn pair_entries(seg: &SharedSegment, head: u32) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut cur = head;
    while cur != 0 {
        let entry: PairRec = seg.read_at(cur);
        entries.push((seg.read_str(entry.from), seg.read_str(entry.to)));
        cur = entry.next;
    }
    entries
}
