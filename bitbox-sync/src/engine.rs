//! The sync engine: every file-transfer sub-protocol lives here.
//!
//! Local change events fan out as requests to all active peers. Inbound
//! requests mutate the file-tree model and answer with a status response;
//! accepted create/modify requests additionally start a byte-pull — a
//! strictly sequential series of `FILE_BYTES_REQUEST`s, one block at a time,
//! finished by a digest check over the materialized content. Pending
//! transfers are keyed by (path, md5); a deadline sweeps away transfers
//! whose source stopped answering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, trace, warn};

use bitbox_fs::{FileLoader, FileSystemEvent, FileTreeModel};
use bitbox_net::PeerRegistry;
use bitbox_proto::{FileDescriptor, HostPort, Message};

/// The protocol request a local change event turns into.
pub fn event_message(event: &FileSystemEvent) -> Message {
    match event.clone() {
        FileSystemEvent::FileCreate { path, descriptor } => Message::FileCreateRequest {
            path_name: path,
            file_descriptor: descriptor,
        },
        FileSystemEvent::FileModify { path, descriptor } => Message::FileModifyRequest {
            path_name: path,
            file_descriptor: descriptor,
        },
        FileSystemEvent::FileDelete { path, descriptor } => Message::FileDeleteRequest {
            path_name: path,
            file_descriptor: descriptor,
        },
        FileSystemEvent::DirectoryCreate { path } => {
            Message::DirectoryCreateRequest { path_name: path }
        }
        FileSystemEvent::DirectoryDelete { path } => {
            Message::DirectoryDeleteRequest { path_name: path }
        }
    }
}

/// A transfer is identified by what is being fetched, not who from.
type TransferKey = (String, String);

struct PendingTransfer {
    loader: FileLoader,
    descriptor: FileDescriptor,
    source: HostPort,
    cursor: u64,
    block_size: u64,
    deadline: Instant,
}

pub struct SyncEngine {
    model: Arc<FileTreeModel>,
    registry: Arc<PeerRegistry>,
    block_size: AtomicU64,
    transfer_timeout: Duration,
    transfers: Mutex<HashMap<TransferKey, PendingTransfer>>,
}

impl SyncEngine {
    pub fn new(
        model: Arc<FileTreeModel>,
        registry: Arc<PeerRegistry>,
        block_size: u64,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            model,
            registry,
            block_size: AtomicU64::new(block_size.max(1)),
            transfer_timeout,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// Hot-reload hook for `blockSize`. Transfers already running keep the
    /// block size they started with.
    pub fn set_block_size(&self, block_size: u64) {
        self.block_size.store(block_size.max(1), Ordering::Relaxed);
    }

    /// Broadcast a local change to every active peer. A deletion first
    /// evicts any still-queued create or modify request for the same path;
    /// those are moot once the file is gone.
    pub fn broadcast_event(&self, event: &FileSystemEvent) {
        match event {
            FileSystemEvent::FileDelete { path, .. } => {
                let evicted = self.registry.discard_queued(|message| {
                    matches!(
                        message,
                        Message::FileCreateRequest { path_name, .. }
                        | Message::FileModifyRequest { path_name, .. } if path_name == path
                    )
                });
                if evicted > 0 {
                    trace!(path = %path, peers = evicted, "superseded file requests evicted");
                }
            }
            FileSystemEvent::DirectoryDelete { path } => {
                let evicted = self.registry.discard_queued(|message| {
                    matches!(
                        message,
                        Message::DirectoryCreateRequest { path_name } if path_name == path
                    )
                });
                if evicted > 0 {
                    trace!(path = %path, peers = evicted, "superseded directory requests evicted");
                }
            }
            _ => {}
        }
        let message = event_message(event);
        let sent = self.registry.broadcast(&message);
        trace!(command = message.command(), peers = sent, "event broadcast");
    }

    /// Send a change event to one peer only (used for the announce burst a
    /// freshly activated peer receives).
    pub fn send_event_to(&self, peer: &HostPort, event: &FileSystemEvent) -> bool {
        self.registry.send_to(peer, event_message(event))
    }

    /// Handle a routed message from an active peer, sending any replies back
    /// to it.
    pub fn handle_message(&self, from: &HostPort, message: Message) {
        for reply in self.process_message(from, message) {
            if !self.registry.send_to(from, reply) {
                // The peer may have vanished between receive and reply.
                debug!(%from, "reply dropped, peer gone");
            }
        }
    }

    /// The protocol logic proper: consume one message, return the messages
    /// owed to the sender.
    pub fn process_message(&self, from: &HostPort, message: Message) -> Vec<Message> {
        match message {
            Message::FileCreateRequest {
                path_name,
                file_descriptor,
            } => self.on_file_create(from, path_name, file_descriptor),
            Message::FileModifyRequest {
                path_name,
                file_descriptor,
            } => self.on_file_modify(from, path_name, file_descriptor),
            Message::FileDeleteRequest {
                path_name,
                file_descriptor,
            } => {
                let (status, reply) = match self.model.delete_file(&path_name, &file_descriptor) {
                    Ok(()) => (true, "file deleted".to_string()),
                    Err(error) => (false, error.to_string()),
                };
                vec![Message::FileDeleteResponse {
                    path_name,
                    file_descriptor,
                    status,
                    message: reply,
                }]
            }
            Message::DirectoryCreateRequest { path_name } => {
                let (status, reply) = match self.model.make_directory(&path_name) {
                    Ok(()) => (true, "directory created".to_string()),
                    Err(error) => (false, error.to_string()),
                };
                vec![Message::DirectoryCreateResponse {
                    path_name,
                    status,
                    message: reply,
                }]
            }
            Message::DirectoryDeleteRequest { path_name } => {
                let (status, reply) = match self.model.delete_directory(&path_name) {
                    Ok(()) => (true, "directory deleted".to_string()),
                    Err(error) => (false, error.to_string()),
                };
                vec![Message::DirectoryDeleteResponse {
                    path_name,
                    status,
                    message: reply,
                }]
            }
            Message::FileBytesRequest {
                path_name,
                file_descriptor,
                position,
                length,
            } => self.on_bytes_request(path_name, file_descriptor, position, length),
            Message::FileBytesResponse {
                path_name,
                file_descriptor,
                position,
                content,
                status,
                message,
                ..
            } => self.on_bytes_response(
                path_name,
                file_descriptor,
                position,
                content,
                status,
                message,
            ),
            // Responses to our own requests need no action: a refusal such
            // as "file already exists" just means the peer is already
            // converged (or winning), and an acceptance means the peer will
            // pull bytes from us.
            Message::FileCreateResponse {
                path_name,
                status,
                message,
                ..
            }
            | Message::FileModifyResponse {
                path_name,
                status,
                message,
                ..
            }
            | Message::FileDeleteResponse {
                path_name,
                status,
                message,
                ..
            }
            | Message::DirectoryCreateResponse {
                path_name,
                status,
                message,
            }
            | Message::DirectoryDeleteResponse {
                path_name,
                status,
                message,
            } => {
                trace!(%from, path = %path_name, status, %message, "peer response");
                vec![]
            }
            other => {
                // Handshake-phase traffic never reaches the engine.
                debug!(%from, command = other.command(), "unroutable message ignored");
                vec![]
            }
        }
    }

    fn on_file_create(
        &self,
        from: &HostPort,
        path_name: String,
        descriptor: FileDescriptor,
    ) -> Vec<Message> {
        let respond = |status: bool, message: String| Message::FileCreateResponse {
            path_name: path_name.clone(),
            file_descriptor: descriptor.clone(),
            status,
            message,
        };

        match self.model.check_shortcut(&path_name, &descriptor) {
            Ok(true) => {
                info!(path = %path_name, "created from local content");
                return vec![respond(true, "file loader ready".to_string())];
            }
            Ok(false) => {}
            Err(error) => return vec![respond(false, error.to_string())],
        }

        match self.model.create_file_loader(&path_name, descriptor.clone()) {
            Ok(loader) => {
                let mut replies = vec![respond(true, "file loader ready".to_string())];
                replies.extend(self.start_transfer(from, path_name, descriptor, loader));
                replies
            }
            Err(error) => vec![respond(false, error.to_string())],
        }
    }

    fn on_file_modify(
        &self,
        from: &HostPort,
        path_name: String,
        descriptor: FileDescriptor,
    ) -> Vec<Message> {
        let respond = |status: bool, message: String| Message::FileModifyResponse {
            path_name: path_name.clone(),
            file_descriptor: descriptor.clone(),
            status,
            message,
        };

        match self.model.modify_file_loader(&path_name, descriptor.clone()) {
            Ok(loader) => {
                let mut replies = vec![respond(true, "file loader ready".to_string())];
                replies.extend(self.start_transfer(from, path_name, descriptor, loader));
                replies
            }
            Err(error) => vec![respond(false, error.to_string())],
        }
    }

    /// Register the pending transfer and issue the first block request. A
    /// zero-length file needs no bytes and settles immediately.
    fn start_transfer(
        &self,
        from: &HostPort,
        path_name: String,
        descriptor: FileDescriptor,
        loader: FileLoader,
    ) -> Vec<Message> {
        if descriptor.file_size == 0 {
            match self.model.complete_file_loader(loader) {
                Ok(true) => info!(path = %path_name, "empty file created"),
                Ok(false) => warn!(path = %path_name, "empty file digest mismatch"),
                Err(error) => warn!(path = %path_name, %error, "could not finish empty file"),
            }
            return vec![];
        }

        let block_size = self.block_size.load(Ordering::Relaxed);
        let length = descriptor.file_size.min(block_size);
        let request = Message::FileBytesRequest {
            path_name: path_name.clone(),
            file_descriptor: descriptor.clone(),
            position: 0,
            length,
        };

        let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
        transfers.insert(
            (path_name, descriptor.md5.clone()),
            PendingTransfer {
                loader,
                descriptor,
                source: from.clone(),
                cursor: 0,
                block_size,
                deadline: Instant::now() + self.transfer_timeout,
            },
        );
        vec![request]
    }

    fn on_bytes_request(
        &self,
        path_name: String,
        descriptor: FileDescriptor,
        position: u64,
        length: u64,
    ) -> Vec<Message> {
        match self
            .model
            .read_file_block(&path_name, &descriptor, position, length)
        {
            Ok(bytes) => vec![Message::FileBytesResponse {
                path_name,
                file_descriptor: descriptor,
                position,
                length,
                content: BASE64.encode(bytes),
                status: true,
                message: "successful read".to_string(),
            }],
            Err(error) => vec![Message::FileBytesResponse {
                path_name,
                file_descriptor: descriptor,
                position,
                length,
                content: String::new(),
                status: false,
                message: error.to_string(),
            }],
        }
    }

    fn on_bytes_response(
        &self,
        path_name: String,
        descriptor: FileDescriptor,
        position: u64,
        content: String,
        status: bool,
        message: String,
    ) -> Vec<Message> {
        let key = (path_name.clone(), descriptor.md5.clone());
        let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
        let Some(transfer) = transfers.get_mut(&key) else {
            debug!(path = %path_name, "bytes response without a pending transfer");
            return vec![];
        };

        if !status {
            warn!(path = %path_name, %message, "source aborted transfer");
            let transfer = transfers.remove(&key).expect("transfer just seen");
            self.model.cancel_file_loader(transfer.loader);
            return vec![];
        }

        let bytes = match BASE64.decode(&content) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(path = %path_name, %error, "undecodable block content");
                let transfer = transfers.remove(&key).expect("transfer just seen");
                self.model.cancel_file_loader(transfer.loader);
                return vec![];
            }
        };

        if position != transfer.cursor {
            // Blocks are requested strictly sequentially; anything else is a
            // stray duplicate.
            debug!(path = %path_name, position, cursor = transfer.cursor, "out-of-order block dropped");
            return vec![];
        }

        if let Err(error) = self
            .model
            .write_file_block(&mut transfer.loader, position, &bytes)
        {
            warn!(path = %path_name, %error, "could not write block");
            let transfer = transfers.remove(&key).expect("transfer just seen");
            self.model.cancel_file_loader(transfer.loader);
            return vec![];
        }
        transfer.cursor = position + bytes.len() as u64;

        if transfer.cursor < transfer.descriptor.file_size {
            transfer.deadline = Instant::now() + self.transfer_timeout;
            let length = transfer.block_size.min(transfer.descriptor.file_size - transfer.cursor);
            return vec![Message::FileBytesRequest {
                path_name,
                file_descriptor: transfer.descriptor.clone(),
                position: transfer.cursor,
                length,
            }];
        }

        // Last block received: verify and settle.
        let transfer = transfers.remove(&key).expect("transfer just seen");
        match self.model.complete_file_loader(transfer.loader) {
            Ok(true) => info!(path = %path_name, "file transfer complete"),
            Ok(false) => warn!(path = %path_name, "transfer discarded, digest mismatch"),
            Err(error) => warn!(path = %path_name, %error, "could not finish transfer"),
        }
        vec![]
    }

    /// Cancel transfers whose deadline passed; their loaders release the
    /// sidecars, and the next announce cycle may restart them.
    pub fn sweep_deadlines(&self) {
        let now = Instant::now();
        let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
        let expired: Vec<TransferKey> = transfers
            .iter()
            .filter(|(_, transfer)| transfer.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(transfer) = transfers.remove(&key) {
                warn!(path = %key.0, source = %transfer.source, "transfer timed out");
                self.model.cancel_file_loader(transfer.loader);
            }
        }
    }

    /// Shutdown: cancel everything in flight so sidecars are released.
    pub fn cancel_all(&self) {
        let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
        for (_, transfer) in transfers.drain() {
            self.model.cancel_file_loader(transfer.loader);
        }
    }

    pub fn pending_transfers(&self) -> usize {
        self.transfers.lock().expect("transfers lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md5::{Digest, Md5};
    use std::fs;
    use tempfile::tempdir;

    fn descriptor_for(content: &[u8], last_modified: u64) -> FileDescriptor {
        let mut hasher = Md5::new();
        hasher.update(content);
        FileDescriptor::new(
            hex::encode(hasher.finalize()),
            last_modified,
            content.len() as u64,
        )
    }

    fn engine_in(dir: &std::path::Path, block_size: u64) -> SyncEngine {
        let model = Arc::new(FileTreeModel::new(dir).unwrap());
        let registry = PeerRegistry::new(HostPort::new("localhost", 8111), 10);
        SyncEngine::new(model, registry, block_size, Duration::from_secs(30))
    }

    fn peer() -> HostPort {
        HostPort::new("peer.example", 8112)
    }

    fn encode_block(content: &[u8]) -> String {
        BASE64.encode(content)
    }

    #[test]
    fn create_request_single_block_transfer() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), 4096);
        let content = b"hello";
        let descriptor = descriptor_for(content, 1000);

        let replies = engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "f".into(),
                file_descriptor: descriptor.clone(),
            },
        );
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            &replies[0],
            Message::FileCreateResponse { status: true, message, .. }
                if message == "file loader ready"
        ));
        assert!(matches!(
            &replies[1],
            Message::FileBytesRequest { position: 0, length: 5, .. }
        ));
        assert_eq!(engine.pending_transfers(), 1);

        let replies = engine.process_message(
            &peer(),
            Message::FileBytesResponse {
                path_name: "f".into(),
                file_descriptor: descriptor.clone(),
                position: 0,
                length: 5,
                content: encode_block(content),
                status: true,
                message: "successful read".into(),
            },
        );
        assert!(replies.is_empty());
        assert_eq!(engine.pending_transfers(), 0);
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), content.to_vec());
    }

    #[test]
    fn multi_block_transfer_is_sequential() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), 2);
        let content = b"abcde";
        let descriptor = descriptor_for(content, 1000);

        let replies = engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "f".into(),
                file_descriptor: descriptor.clone(),
            },
        );
        let mut request = replies[1].clone();

        let mut served = Vec::new();
        loop {
            let Message::FileBytesRequest {
                position, length, ..
            } = request
            else {
                panic!("expected bytes request");
            };
            served.push((position, length));
            let start = position as usize;
            let end = start + length as usize;
            let replies = engine.process_message(
                &peer(),
                Message::FileBytesResponse {
                    path_name: "f".into(),
                    file_descriptor: descriptor.clone(),
                    position,
                    length,
                    content: encode_block(&content[start..end]),
                    status: true,
                    message: "successful read".into(),
                },
            );
            match replies.into_iter().next() {
                Some(next) => request = next,
                None => break,
            }
        }
        assert_eq!(served, vec![(0, 2), (2, 2), (4, 1)]);
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), content.to_vec());
    }

    #[test]
    fn zero_length_file_needs_no_bytes() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), 8);
        let descriptor = descriptor_for(b"", 1000);

        let replies = engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "empty".into(),
                file_descriptor: descriptor,
            },
        );
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            &replies[0],
            Message::FileCreateResponse { status: true, .. }
        ));
        assert_eq!(engine.pending_transfers(), 0);
        assert!(dir.path().join("empty").exists());
    }

    #[test]
    fn concurrent_create_for_same_path_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), 8);
        let descriptor = descriptor_for(b"data", 1000);

        let request = Message::FileCreateRequest {
            path_name: "f".into(),
            file_descriptor: descriptor,
        };
        let first = engine.process_message(&peer(), request.clone());
        assert!(matches!(
            &first[0],
            Message::FileCreateResponse { status: true, .. }
        ));

        let second = engine.process_message(&peer(), request);
        assert_eq!(second.len(), 1);
        assert!(matches!(
            &second[0],
            Message::FileCreateResponse { status: false, message, .. }
                if message == "file already exists"
        ));
    }

    #[test]
    fn aborted_source_cancels_the_loader() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), 8);
        let descriptor = descriptor_for(b"data", 1000);

        engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "f".into(),
                file_descriptor: descriptor.clone(),
            },
        );
        assert_eq!(engine.pending_transfers(), 1);

        // The source's content changed mid-transfer: status false.
        let replies = engine.process_message(
            &peer(),
            Message::FileBytesResponse {
                path_name: "f".into(),
                file_descriptor: descriptor.clone(),
                position: 0,
                length: 4,
                content: String::new(),
                status: false,
                message: "file content does not match descriptor".into(),
            },
        );
        assert!(replies.is_empty());
        assert_eq!(engine.pending_transfers(), 0);

        // The path is free for the re-announced transfer.
        let replies = engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "f".into(),
                file_descriptor: descriptor,
            },
        );
        assert!(matches!(
            &replies[0],
            Message::FileCreateResponse { status: true, .. }
        ));
    }

    #[test]
    fn bytes_request_serves_content_and_rejects_stale_digest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("src.txt"), b"hello world").unwrap();
        let engine = engine_in(dir.path(), 8);
        let local = engine.model.descriptor_of("src.txt").unwrap();

        let replies = engine.process_message(
            &peer(),
            Message::FileBytesRequest {
                path_name: "src.txt".into(),
                file_descriptor: local.clone(),
                position: 6,
                length: 5,
            },
        );
        match &replies[0] {
            Message::FileBytesResponse {
                status: true,
                content,
                ..
            } => {
                assert_eq!(BASE64.decode(content).unwrap(), b"world".to_vec());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let stale = FileDescriptor::new("00000000000000000000000000000000", 0, 11);
        let replies = engine.process_message(
            &peer(),
            Message::FileBytesRequest {
                path_name: "src.txt".into(),
                file_descriptor: stale,
                position: 0,
                length: 4,
            },
        );
        assert!(matches!(
            &replies[0],
            Message::FileBytesResponse { status: false, content, .. } if content.is_empty()
        ));
    }

    #[test]
    fn delete_request_respects_newer_local_version() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("g"), b"").unwrap();
        let engine = engine_in(dir.path(), 8);
        let local = engine.model.descriptor_of("g").unwrap();

        let older = FileDescriptor::new(
            "00000000000000000000000000000000",
            local.last_modified.saturating_sub(500),
            0,
        );
        let replies = engine.process_message(
            &peer(),
            Message::FileDeleteRequest {
                path_name: "g".into(),
                file_descriptor: older,
            },
        );
        assert!(matches!(
            &replies[0],
            Message::FileDeleteResponse { status: false, message, .. }
                if message == "newer file exists"
        ));
        assert!(dir.path().join("g").exists());

        let replies = engine.process_message(
            &peer(),
            Message::FileDeleteRequest {
                path_name: "g".into(),
                file_descriptor: local,
            },
        );
        assert!(matches!(
            &replies[0],
            Message::FileDeleteResponse { status: true, .. }
        ));
        assert!(!dir.path().join("g").exists());
    }

    #[test]
    fn directory_requests_follow_legacy_semantics() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), 8);

        let create = Message::DirectoryCreateRequest {
            path_name: "d".into(),
        };
        let replies = engine.process_message(&peer(), create.clone());
        assert!(matches!(
            &replies[0],
            Message::DirectoryCreateResponse { status: true, .. }
        ));

        // Creating an existing directory answers false; the requester treats
        // it as benign.
        let replies = engine.process_message(&peer(), create);
        assert!(matches!(
            &replies[0],
            Message::DirectoryCreateResponse { status: false, message, .. }
                if message == "pathname already exists"
        ));

        fs::write(dir.path().join("d/child"), b"x").unwrap();
        let model = Arc::new(FileTreeModel::new(dir.path()).unwrap());
        let registry = PeerRegistry::new(HostPort::new("localhost", 8111), 10);
        let engine = SyncEngine::new(model, registry, 8, Duration::from_secs(30));
        let replies = engine.process_message(
            &peer(),
            Message::DirectoryDeleteRequest {
                path_name: "d".into(),
            },
        );
        assert!(matches!(
            &replies[0],
            Message::DirectoryDeleteResponse { status: false, message, .. }
                if message == "directory is not empty"
        ));
    }

    #[test]
    fn shortcut_skips_the_byte_pull() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("original"), b"shared bytes").unwrap();
        let engine = engine_in(dir.path(), 8);
        let local = engine.model.descriptor_of("original").unwrap();

        let incoming = FileDescriptor::new(local.md5.clone(), local.last_modified, local.file_size);
        let replies = engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "duplicate".into(),
                file_descriptor: incoming,
            },
        );
        // Acceptance without a FILE_BYTES_REQUEST.
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            &replies[0],
            Message::FileCreateResponse { status: true, .. }
        ));
        assert_eq!(
            fs::read(dir.path().join("duplicate")).unwrap(),
            b"shared bytes".to_vec()
        );
    }

    #[test]
    fn deadline_sweep_cancels_stalled_transfers() {
        let dir = tempdir().unwrap();
        let model = Arc::new(FileTreeModel::new(dir.path()).unwrap());
        let registry = PeerRegistry::new(HostPort::new("localhost", 8111), 10);
        let engine = SyncEngine::new(model, registry, 8, Duration::from_millis(0));

        engine.process_message(
            &peer(),
            Message::FileCreateRequest {
                path_name: "slow".into(),
                file_descriptor: descriptor_for(b"data", 1000),
            },
        );
        assert_eq!(engine.pending_transfers(), 1);
        engine.sweep_deadlines();
        assert_eq!(engine.pending_transfers(), 0);
        // Sidecar released.
        assert!(!dir.path().join("slow.bbsync").exists());
    }
}
