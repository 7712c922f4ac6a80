//! Content-addressed view of the watched directory.
//!
//! The model mirrors the directory as a map from relative path to entry. File
//! entries carry the descriptor last observed on disk; while a remote
//! transfer is in flight the entry additionally records the incoming
//! descriptor, and the bytes accumulate in a sidecar file next to the target
//! path. At most one loader exists per path; a loader owns its sidecar until
//! it is completed or cancelled.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use md5::{Digest, Md5};
use tracing::{debug, trace, warn};

use bitbox_proto::FileDescriptor;

use crate::errors::{FsError, Result};

/// Suffix of the sidecar file holding the bytes of an in-flight transfer.
pub const SIDECAR_SUFFIX: &str = ".bbsync";

#[derive(Debug, Clone)]
pub(crate) enum Entry {
    File(FileState),
    Directory,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FileState {
    /// Descriptor of the content present on disk, if any.
    pub(crate) present: Option<FileDescriptor>,
    /// Descriptor of the content an active loader is receiving.
    pub(crate) loading: Option<FileDescriptor>,
}

/// Handle to an in-flight inbound transfer. Owns the open sidecar file.
#[derive(Debug)]
pub struct FileLoader {
    path: String,
    descriptor: FileDescriptor,
    sidecar: PathBuf,
    file: File,
    bytes_received: u64,
}

impl FileLoader {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

/// A path plus its kind, as reported by [`FileTreeModel::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    File(FileDescriptor),
    Directory,
}

pub struct FileTreeModel {
    root: PathBuf,
    index: Mutex<HashMap<String, Entry>>,
}

impl FileTreeModel {
    /// Open the watched directory, creating it if necessary, and build the
    /// initial index from what is on disk. Stale sidecars from an earlier
    /// run are removed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let model = Self {
            root,
            index: Mutex::new(HashMap::new()),
        };
        model.bootstrap()?;
        Ok(model)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bootstrap(&self) -> Result<()> {
        let mut index = self.index.lock().expect("index lock poisoned");
        let mut pending = vec![PathBuf::new()];
        while let Some(rel_dir) = pending.pop() {
            for entry in fs::read_dir(self.root.join(&rel_dir))? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = if rel_dir.as_os_str().is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", rel_dir.to_string_lossy(), name)
                };
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    index.insert(rel.clone(), Entry::Directory);
                    pending.push(PathBuf::from(rel));
                } else if file_type.is_file() {
                    if name.ends_with(SIDECAR_SUFFIX) {
                        warn!(path = %rel, "removing stale sidecar");
                        let _ = fs::remove_file(entry.path());
                        continue;
                    }
                    let descriptor = describe(&entry.path())?;
                    index.insert(
                        rel,
                        Entry::File(FileState {
                            present: Some(descriptor),
                            loading: None,
                        }),
                    );
                }
            }
        }
        debug!(entries = index.len(), root = %self.root.display(), "file tree indexed");
        Ok(())
    }

    /// Resolve a relative wire path against the root, rejecting anything
    /// that would escape it.
    fn checked_path(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(FsError::UnsafePathname);
        }
        let rel = Path::new(path);
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(FsError::UnsafePathname),
            }
        }
        Ok(self.root.join(rel))
    }

    /// The parent of `path` must be the root or a known directory.
    fn check_parent(index: &HashMap<String, Entry>, path: &str) -> Result<()> {
        match path.rsplit_once('/') {
            None => Ok(()),
            Some((parent, _)) => match index.get(parent) {
                Some(Entry::Directory) => Ok(()),
                _ => Err(FsError::ParentDoesNotExist),
            },
        }
    }

    /// Allocate a loader for a brand-new file.
    pub fn create_file_loader(
        &self,
        path: &str,
        descriptor: FileDescriptor,
    ) -> Result<FileLoader> {
        let target = self.checked_path(path)?;
        let mut index = self.index.lock().expect("index lock poisoned");
        match index.get(path) {
            Some(Entry::Directory) => return Err(FsError::PathNameAlreadyInUse),
            Some(Entry::File(state)) if state.loading.is_some() => {
                return Err(FsError::FileAlreadyExists)
            }
            Some(Entry::File(state)) if state.present.is_some() => {
                return Err(FsError::FileAlreadyExists)
            }
            _ => {}
        }
        Self::check_parent(&index, path)?;

        let loader = open_sidecar(path, &target, &descriptor)?;
        index.insert(
            path.to_string(),
            Entry::File(FileState {
                present: None,
                loading: Some(descriptor),
            }),
        );
        trace!(path, "file loader created");
        Ok(loader)
    }

    /// Allocate a loader replacing an existing file. Only granted when the
    /// incoming content differs and wins the newer-decision.
    pub fn modify_file_loader(
        &self,
        path: &str,
        descriptor: FileDescriptor,
    ) -> Result<FileLoader> {
        let target = self.checked_path(path)?;
        let mut index = self.index.lock().expect("index lock poisoned");
        let state = match index.get(path) {
            Some(Entry::File(state)) => state,
            _ => return Err(FsError::FileDoesNotExist),
        };
        // A create still in flight has no settled content to modify; a
        // second modify while one is loading is a plain conflict.
        let existing = state.present.as_ref().ok_or(FsError::FileDoesNotExist)?;
        if state.loading.is_some() {
            return Err(FsError::FileAlreadyExists);
        }
        if existing.same_content(&descriptor) {
            return Err(FsError::FileAlreadyExists);
        }
        if !descriptor.newer_than(existing) {
            return Err(FsError::NewerFileExists);
        }

        let loader = open_sidecar(path, &target, &descriptor)?;
        if let Some(Entry::File(state)) = index.get_mut(path) {
            state.loading = Some(descriptor);
        }
        trace!(path, "modify loader created");
        Ok(loader)
    }

    /// Write one block of a transfer into the sidecar.
    pub fn write_file_block(
        &self,
        loader: &mut FileLoader,
        position: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let end = position
            .checked_add(bytes.len() as u64)
            .ok_or(FsError::BlockOutOfRange)?;
        if end > loader.descriptor.file_size {
            return Err(FsError::BlockOutOfRange);
        }
        loader.file.seek(SeekFrom::Start(position))?;
        loader.file.write_all(bytes)?;
        loader.bytes_received = loader.bytes_received.max(end);
        Ok(())
    }

    /// Finish a transfer: verify the received bytes against the descriptor
    /// digest and move the sidecar into place. Returns false (and discards
    /// the transfer) when the digest does not match.
    pub fn complete_file_loader(&self, mut loader: FileLoader) -> Result<bool> {
        loader.file.flush()?;
        let received = md5_of_file(&loader.sidecar)?;
        if received != loader.descriptor.md5 {
            warn!(
                path = %loader.path,
                expected = %loader.descriptor.md5,
                %received,
                "digest mismatch, discarding transfer"
            );
            self.cancel_file_loader(loader);
            return Ok(false);
        }

        let target = self.root.join(&loader.path);
        fs::rename(&loader.sidecar, &target)?;
        set_modified(&target, loader.descriptor.last_modified);

        let mut index = self.index.lock().expect("index lock poisoned");
        index.insert(
            loader.path.clone(),
            Entry::File(FileState {
                present: Some(loader.descriptor.clone()),
                loading: None,
            }),
        );
        debug!(path = %loader.path, "transfer complete");
        Ok(true)
    }

    /// Abandon a transfer, releasing the sidecar and the loading slot.
    pub fn cancel_file_loader(&self, loader: FileLoader) {
        let _ = fs::remove_file(&loader.sidecar);
        let mut index = self.index.lock().expect("index lock poisoned");
        let entry_gone = match index.get_mut(&loader.path) {
            Some(Entry::File(state)) => {
                state.loading = None;
                state.present.is_none()
            }
            _ => false,
        };
        if entry_gone {
            index.remove(&loader.path);
        }
        trace!(path = %loader.path, "loader cancelled");
    }

    /// If identical content already exists at another path, copy it into
    /// place and skip the network transfer entirely.
    pub fn check_shortcut(&self, path: &str, descriptor: &FileDescriptor) -> Result<bool> {
        let target = self.checked_path(path)?;
        let mut index = self.index.lock().expect("index lock poisoned");
        match index.get(path) {
            Some(Entry::Directory) => return Err(FsError::PathNameAlreadyInUse),
            Some(Entry::File(state)) if state.loading.is_some() || state.present.is_some() => {
                return Err(FsError::FileAlreadyExists)
            }
            _ => {}
        }
        Self::check_parent(&index, path)?;

        let source = index.iter().find_map(|(other, entry)| match entry {
            Entry::File(FileState {
                present: Some(d),
                loading: None,
            }) if d.same_content(descriptor) && d.file_size == descriptor.file_size => {
                Some((other.clone(), d.clone()))
            }
            _ => None,
        });
        let (source_path, source_descriptor) = match source {
            Some(found) => found,
            None => return Ok(false),
        };

        // The index may be stale; only take the shortcut if the source file
        // is still the content the descriptor names.
        let source_full = self.root.join(&source_path);
        match fs::metadata(&source_full) {
            Ok(meta)
                if meta.len() == source_descriptor.file_size
                    && modified_secs(&meta) == source_descriptor.last_modified => {}
            _ => return Ok(false),
        }

        fs::copy(&source_full, &target)?;
        set_modified(&target, descriptor.last_modified);
        index.insert(
            path.to_string(),
            Entry::File(FileState {
                present: Some(descriptor.clone()),
                loading: None,
            }),
        );
        debug!(path, source = %source_path, "shortcut copy");
        Ok(true)
    }

    /// Delete a file if the request names our version or a newer one.
    pub fn delete_file(&self, path: &str, descriptor: &FileDescriptor) -> Result<()> {
        let target = self.checked_path(path)?;
        let mut index = self.index.lock().expect("index lock poisoned");
        let state = match index.get(path) {
            Some(Entry::File(state)) => state,
            _ => return Err(FsError::FileDoesNotExist),
        };
        if state.loading.is_some() {
            return Err(FsError::FileDoesNotExist);
        }
        let local = state.present.as_ref().ok_or(FsError::FileDoesNotExist)?;
        if !local.same_content(descriptor) && descriptor.last_modified <= local.last_modified {
            return Err(FsError::NewerFileExists);
        }
        fs::remove_file(&target)?;
        index.remove(path);
        debug!(path, "file deleted");
        Ok(())
    }

    pub fn make_directory(&self, path: &str) -> Result<()> {
        let target = self.checked_path(path)?;
        let mut index = self.index.lock().expect("index lock poisoned");
        if index.contains_key(path) {
            return Err(FsError::PathNameAlreadyInUse);
        }
        Self::check_parent(&index, path)?;
        fs::create_dir(&target)?;
        index.insert(path.to_string(), Entry::Directory);
        debug!(path, "directory created");
        Ok(())
    }

    /// Delete a directory; it must be empty.
    pub fn delete_directory(&self, path: &str) -> Result<()> {
        let target = self.checked_path(path)?;
        let mut index = self.index.lock().expect("index lock poisoned");
        match index.get(path) {
            Some(Entry::Directory) => {}
            _ => return Err(FsError::FileDoesNotExist),
        }
        let prefix = format!("{}/", path);
        if index.keys().any(|other| other.starts_with(&prefix)) {
            return Err(FsError::DirectoryNotEmpty);
        }
        fs::remove_dir(&target)?;
        index.remove(path);
        debug!(path, "directory deleted");
        Ok(())
    }

    /// Read a byte range of a stored file, provided its content is still the
    /// version the descriptor names.
    pub fn read_file_block(
        &self,
        path: &str,
        descriptor: &FileDescriptor,
        position: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let target = self.checked_path(path)?;
        let local = {
            let index = self.index.lock().expect("index lock poisoned");
            match index.get(path) {
                Some(Entry::File(FileState {
                    present: Some(d), ..
                })) => d.clone(),
                _ => return Err(FsError::FileDoesNotExist),
            }
        };
        if !local.same_content(descriptor) {
            return Err(FsError::DigestMismatch);
        }
        // Detect content changed on disk since the last scan.
        let meta = fs::metadata(&target)?;
        if meta.len() != local.file_size || modified_secs(&meta) != local.last_modified {
            return Err(FsError::DigestMismatch);
        }
        let end = position.checked_add(length).ok_or(FsError::BlockOutOfRange)?;
        if end > local.file_size {
            return Err(FsError::BlockOutOfRange);
        }

        let mut file = File::open(&target)?;
        file.seek(SeekFrom::Start(position))?;
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// All settled entries: present files with their descriptors, and
    /// directories. Loading-only paths are omitted.
    pub fn snapshot(&self) -> Vec<(String, TreeEntry)> {
        let index = self.index.lock().expect("index lock poisoned");
        index
            .iter()
            .filter_map(|(path, entry)| match entry {
                Entry::Directory => Some((path.clone(), TreeEntry::Directory)),
                Entry::File(FileState {
                    present: Some(d), ..
                }) => Some((path.clone(), TreeEntry::File(d.clone()))),
                Entry::File(_) => None,
            })
            .collect()
    }

    /// Paths with an active loader; the change detector must not treat the
    /// not-yet-materialized target as a local deletion.
    pub fn loading_paths(&self) -> Vec<String> {
        let index = self.index.lock().expect("index lock poisoned");
        index
            .iter()
            .filter_map(|(path, entry)| match entry {
                Entry::File(state) if state.loading.is_some() => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn descriptor_of(&self, path: &str) -> Option<FileDescriptor> {
        let index = self.index.lock().expect("index lock poisoned");
        match index.get(path) {
            Some(Entry::File(FileState {
                present: Some(d), ..
            })) => Some(d.clone()),
            _ => None,
        }
    }

    // Index maintenance for locally observed changes (used by the detector).

    pub(crate) fn record_local_file(&self, path: &str, descriptor: FileDescriptor) {
        let mut index = self.index.lock().expect("index lock poisoned");
        let loading = match index.get(path) {
            Some(Entry::File(state)) => state.loading.clone(),
            _ => None,
        };
        index.insert(
            path.to_string(),
            Entry::File(FileState {
                present: Some(descriptor),
                loading,
            }),
        );
    }

    pub(crate) fn record_local_directory(&self, path: &str) {
        let mut index = self.index.lock().expect("index lock poisoned");
        index.insert(path.to_string(), Entry::Directory);
    }

    pub(crate) fn forget(&self, path: &str) {
        let mut index = self.index.lock().expect("index lock poisoned");
        index.remove(path);
    }

    pub(crate) fn lookup_file(&self, path: &str) -> Option<FileState> {
        let index = self.index.lock().expect("index lock poisoned");
        match index.get(path) {
            Some(Entry::File(state)) => Some(state.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_directory(&self, path: &str) -> bool {
        let index = self.index.lock().expect("index lock poisoned");
        matches!(index.get(path), Some(Entry::Directory))
    }
}

fn open_sidecar(path: &str, target: &Path, descriptor: &FileDescriptor) -> Result<FileLoader> {
    let mut sidecar = target.as_os_str().to_owned();
    sidecar.push(SIDECAR_SUFFIX);
    let sidecar = PathBuf::from(sidecar);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&sidecar)?;
    file.set_len(descriptor.file_size)?;
    Ok(FileLoader {
        path: path.to_string(),
        descriptor: descriptor.clone(),
        sidecar,
        file,
        bytes_received: 0,
    })
}

/// Build a descriptor for a file on disk: content MD5, size, mtime seconds.
pub fn describe(path: &Path) -> Result<FileDescriptor> {
    let meta = fs::metadata(path)?;
    Ok(FileDescriptor::new(
        md5_of_file(path)?,
        modified_secs(&meta),
        meta.len(),
    ))
}

pub(crate) fn md5_of_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn modified_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn set_modified(path: &Path, seconds: u64) {
    let time = UNIX_EPOCH + Duration::from_secs(seconds);
    match File::options().write(true).open(path) {
        Ok(file) => {
            if let Err(error) = file.set_modified(time) {
                warn!(path = %path.display(), %error, "could not set modification time");
            }
        }
        Err(error) => warn!(path = %path.display(), %error, "could not set modification time"),
    }
}
