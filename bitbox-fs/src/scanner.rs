//! Periodic change detection.
//!
//! Every sync interval the detector walks the watched directory and diffs it
//! against the model's index. Unchanged files are recognized by size and
//! modification time alone; content is only re-hashed when the metadata
//! moved. The detector also produces the full-tree announce set that is
//! rebroadcast each cycle.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use bitbox_proto::FileDescriptor;

use crate::errors::Result;
use crate::model::{describe, FileTreeModel, TreeEntry, SIDECAR_SUFFIX};

/// A local change observed by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSystemEvent {
    FileCreate {
        path: String,
        descriptor: FileDescriptor,
    },
    FileModify {
        path: String,
        descriptor: FileDescriptor,
    },
    FileDelete {
        path: String,
        descriptor: FileDescriptor,
    },
    DirectoryCreate {
        path: String,
    },
    DirectoryDelete {
        path: String,
    },
}

impl FileSystemEvent {
    pub fn path(&self) -> &str {
        match self {
            FileSystemEvent::FileCreate { path, .. }
            | FileSystemEvent::FileModify { path, .. }
            | FileSystemEvent::FileDelete { path, .. }
            | FileSystemEvent::DirectoryCreate { path }
            | FileSystemEvent::DirectoryDelete { path } => path,
        }
    }
}

pub struct ChangeDetector {
    model: Arc<FileTreeModel>,
}

impl ChangeDetector {
    pub fn new(model: Arc<FileTreeModel>) -> Self {
        Self { model }
    }

    /// Walk the watched directory and emit one event per observed change,
    /// updating the model's index as a side effect. Events within a cycle
    /// are unique per (kind, path).
    pub fn scan(&self) -> Result<Vec<FileSystemEvent>> {
        let (disk_files, disk_dirs) = self.walk()?;
        let loading: HashSet<String> = self.model.loading_paths().into_iter().collect();
        let snapshot = self.model.snapshot();

        let mut events = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |events: &mut Vec<FileSystemEvent>, event: FileSystemEvent| {
            let key = (std::mem::discriminant(&event), event.path().to_string());
            if seen.insert(key) {
                events.push(event);
            }
        };

        // New directories, shallowest first so parents precede children.
        let mut new_dirs: Vec<&String> = disk_dirs
            .iter()
            .filter(|path| !self.model.is_directory(path))
            .collect();
        new_dirs.sort_by_key(|path| path.matches('/').count());
        for path in new_dirs {
            self.model.record_local_directory(path);
            push(
                &mut events,
                FileSystemEvent::DirectoryCreate { path: path.clone() },
            );
        }

        // New and changed files.
        for (path, (size, modified)) in &disk_files {
            if loading.contains(path) {
                continue;
            }
            let known = self.model.lookup_file(path).and_then(|state| state.present);
            match known {
                Some(existing)
                    if existing.file_size == *size && existing.last_modified == *modified =>
                {
                    // Metadata unchanged: content taken as unchanged.
                }
                known => {
                    let descriptor = match describe(&self.model.root().join(path)) {
                        Ok(descriptor) => descriptor,
                        Err(error) => {
                            // The file may have vanished mid-scan; next cycle
                            // will settle it.
                            warn!(path = %path, %error, "could not hash file");
                            continue;
                        }
                    };
                    match known {
                        None => {
                            self.model.record_local_file(path, descriptor.clone());
                            push(
                                &mut events,
                                FileSystemEvent::FileCreate {
                                    path: path.clone(),
                                    descriptor,
                                },
                            );
                        }
                        Some(existing) if existing.md5 != descriptor.md5 => {
                            self.model.record_local_file(path, descriptor.clone());
                            push(
                                &mut events,
                                FileSystemEvent::FileModify {
                                    path: path.clone(),
                                    descriptor,
                                },
                            );
                        }
                        Some(_) => {
                            // Touched but identical: refresh the metadata so
                            // the next scan stays cheap, emit nothing.
                            self.model.record_local_file(path, descriptor);
                        }
                    }
                }
            }
        }

        // Deletions: files first, then directories deepest-first.
        let mut deleted_dirs = Vec::new();
        for (path, entry) in snapshot {
            match entry {
                TreeEntry::File(descriptor) => {
                    if !disk_files.contains_key(&path) && !loading.contains(&path) {
                        self.model.forget(&path);
                        push(
                            &mut events,
                            FileSystemEvent::FileDelete { path, descriptor },
                        );
                    }
                }
                TreeEntry::Directory => {
                    if !disk_dirs.contains(&path) {
                        deleted_dirs.push(path);
                    }
                }
            }
        }
        deleted_dirs.sort_by_key(|path| std::cmp::Reverse(path.matches('/').count()));
        for path in deleted_dirs {
            self.model.forget(&path);
            push(&mut events, FileSystemEvent::DirectoryDelete { path });
        }

        if !events.is_empty() {
            debug!(count = events.len(), "local changes detected");
        }
        Ok(events)
    }

    /// The full-tree announce set: a create event for every settled entry,
    /// parents before children. Rebroadcast each cycle as keep-alive
    /// traffic; receivers treat repeats as benign.
    pub fn announce(&self) -> Vec<FileSystemEvent> {
        let mut entries = self.model.snapshot();
        entries.sort_by_key(|(path, _)| (path.matches('/').count(), path.clone()));
        entries
            .into_iter()
            .map(|(path, entry)| match entry {
                TreeEntry::Directory => FileSystemEvent::DirectoryCreate { path },
                TreeEntry::File(descriptor) => FileSystemEvent::FileCreate { path, descriptor },
            })
            .collect()
    }

    /// One pass over the directory tree: relative file paths with their
    /// (size, mtime), and the set of relative directory paths. Sidecars are
    /// invisible to the scan.
    fn walk(&self) -> Result<(HashMap<String, (u64, u64)>, HashSet<String>)> {
        let mut files = HashMap::new();
        let mut dirs = HashSet::new();
        let mut pending: Vec<(PathBuf, String)> = vec![(self.model.root().to_path_buf(), String::new())];

        while let Some((dir, rel_dir)) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(path = %dir.display(), %error, "could not read directory");
                    continue;
                }
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = if rel_dir.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", rel_dir, name)
                };
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    dirs.insert(rel.clone());
                    pending.push((entry.path(), rel));
                } else if file_type.is_file() && !name.ends_with(SIDECAR_SUFFIX) {
                    let meta = entry.metadata()?;
                    files.insert(rel, (meta.len(), crate::model::modified_secs(&meta)));
                }
            }
        }
        Ok((files, dirs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<FileTreeModel>, ChangeDetector) {
        let model = Arc::new(FileTreeModel::new(dir).unwrap());
        let detector = ChangeDetector::new(model.clone());
        (model, detector)
    }

    #[test]
    fn scan_emits_create_modify_delete() {
        let dir = tempdir().unwrap();
        let (model, detector) = setup(dir.path());

        // Nothing yet.
        assert!(detector.scan().unwrap().is_empty());

        // Creation.
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        let events = detector.scan().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FileSystemEvent::FileCreate { path, .. } if path == "a.txt"));

        // Unchanged: no events.
        assert!(detector.scan().unwrap().is_empty());

        // Modification. Force a different mtime so metadata moves.
        fs::write(dir.path().join("a.txt"), b"two!").unwrap();
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(dir.path().join("a.txt"))
            .unwrap()
            .set_modified(newer)
            .unwrap();
        let events = detector.scan().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FileSystemEvent::FileModify { path, .. } if path == "a.txt"));

        // Deletion carries the old descriptor.
        let old = model.descriptor_of("a.txt").unwrap();
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let events = detector.scan().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FileSystemEvent::FileDelete { path, descriptor } => {
                assert_eq!(path, "a.txt");
                assert_eq!(descriptor, &old);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn scan_orders_directories_before_contents() {
        let dir = tempdir().unwrap();
        let (_, detector) = setup(dir.path());

        fs::create_dir_all(dir.path().join("outer/inner")).unwrap();
        fs::write(dir.path().join("outer/inner/f.txt"), b"x").unwrap();
        let events = detector.scan().unwrap();
        let paths: Vec<&str> = events.iter().map(|e| e.path()).collect();
        assert_eq!(paths, vec!["outer", "outer/inner", "outer/inner/f.txt"]);
    }

    #[test]
    fn sidecars_are_invisible() {
        let dir = tempdir().unwrap();
        let (_, detector) = setup(dir.path());
        fs::write(dir.path().join(format!("f.txt{}", SIDECAR_SUFFIX)), b"partial").unwrap();
        assert!(detector.scan().unwrap().is_empty());
    }

    #[test]
    fn loading_paths_are_not_reported_deleted() {
        let dir = tempdir().unwrap();
        let (model, detector) = setup(dir.path());

        let descriptor = FileDescriptor::new("0123456789abcdef0123456789abcdef", 100, 4);
        let loader = model.create_file_loader("inflight.bin", descriptor).unwrap();
        assert!(detector.scan().unwrap().is_empty());
        model.cancel_file_loader(loader);
    }

    #[test]
    fn announce_lists_whole_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/f.txt"), b"x").unwrap();
        let (_, detector) = setup(dir.path());

        let events = detector.announce();
        let paths: Vec<&str> = events.iter().map(|e| e.path()).collect();
        assert_eq!(paths, vec!["d", "d/f.txt"]);
        assert!(matches!(events[0], FileSystemEvent::DirectoryCreate { .. }));
        assert!(matches!(events[1], FileSystemEvent::FileCreate { .. }));
    }
}
