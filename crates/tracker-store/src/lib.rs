//! Transactional storage for the tracker federation.
//!
//! Backed by [`redb`], an embedded, single-file, ACID key-value store.
//! `Store` owns uniqueness and foreign-key-shaped invariants that a
//! relational schema would enforce declaratively; redb gives us atomic
//! multi-table writes but nothing else, so each method here is a small
//! hand-rolled constraint check wrapped in one `WriteTransaction`.

pub mod error;
pub mod tables;

use std::path::Path;

use redb::{Database, ReadableTable};
use tracker_types::{Chunk, DatabaseDump, File, Peer, Tracker};
use uuid::Uuid;

pub use error::{Result, StoreError};

/// Outcome of [`Store::apply_add_file`]: the invariant violations the
/// caller must translate into domain errors, or a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddFileOutcome {
    Applied { file_id: u64 },
    ChunkMismatch,
    AlreadyHosting,
}

/// Outcome of [`Store::apply_deregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterOutcome {
    Applied,
    NotHosting,
}

pub struct Store {
    db: Database,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let store = Store { db };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            txn.open_table(tables::TRACKERS)?;
            txn.open_table(tables::PEERS)?;
            txn.open_table(tables::FILES_BY_HASH)?;
            txn.open_table(tables::FILE_ID_TO_HASH)?;
            txn.open_table(tables::CHUNKS)?;
            txn.open_table(tables::HOSTS)?;
            txn.open_table(tables::HOSTS_BY_PEER)?;
            txn.open_table(tables::META)?;
        }
        txn.commit()?;
        Ok(())
    }

    // -- trackers --------------------------------------------------------

    pub fn create_tracker(&self, tracker: &Tracker) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(tables::TRACKERS)?;
            let encoded = bincode::serialize(tracker)?;
            table.insert(tracker.ip.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn tracker_exists(&self, ip: &str) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::TRACKERS)?;
        Ok(table.get(ip)?.is_some())
    }

    pub fn remove_tracker_by_ip(&self, ip: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(tables::TRACKERS)?;
            table.remove(ip)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_trackers(&self) -> Result<Vec<Tracker>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::TRACKERS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            out.push(bincode::deserialize(value.value())?);
        }
        Ok(out)
    }

    // -- peers -------------------------------------------------------------

    pub fn create_peer(&self, peer: &Peer) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(tables::PEERS)?;
            let encoded = bincode::serialize(peer)?;
            table.insert(peer.uuid.as_u128(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_peer(&self, uuid: Uuid) -> Result<Option<Peer>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::PEERS)?;
        table
            .get(uuid.as_u128())?
            .map(|value| bincode::deserialize(value.value()).map_err(StoreError::from))
            .transpose()
    }

    pub fn update_peer(&self, peer: &Peer) -> Result<()> {
        self.create_peer(peer)
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::PEERS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            out.push(bincode::deserialize(value.value())?);
        }
        Ok(out)
    }

    // -- files & chunks ------------------------------------------------------

    pub fn get_file_by_hash(&self, full_hash: &str) -> Result<Option<File>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::FILES_BY_HASH)?;
        table
            .get(full_hash)?
            .map(|value| bincode::deserialize(value.value()).map_err(StoreError::from))
            .transpose()
    }

    pub fn get_file_by_id(&self, file_id: u64) -> Result<Option<File>> {
        let hash = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(tables::FILE_ID_TO_HASH)?;
            match table.get(file_id)? {
                Some(value) => value.value().to_string(),
                None => return Ok(None),
            }
        };
        self.get_file_by_hash(&hash)
    }

    pub fn get_chunks(&self, file_id: u64) -> Result<Vec<Chunk>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::CHUNKS)?;
        let prefix = tables::pack_file_prefix(file_id);
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            if key.value().starts_with(prefix.as_slice()) {
                out.push(bincode::deserialize(value.value())?);
            }
        }
        Ok(out)
    }

    pub fn list_files_with_chunks(&self) -> Result<Vec<(File, Vec<Chunk>)>> {
        let txn = self.db.begin_read()?;
        let files_table = txn.open_table(tables::FILES_BY_HASH)?;
        let chunks_table = txn.open_table(tables::CHUNKS)?;
        let mut out = Vec::new();
        for row in files_table.iter()? {
            let (_, value) = row?;
            let file: File = bincode::deserialize(value.value())?;
            let prefix = tables::pack_file_prefix(file.id);
            let mut chunks = Vec::new();
            for chunk_row in chunks_table.iter()? {
                let (key, value) = chunk_row?;
                if key.value().starts_with(prefix.as_slice()) {
                    chunks.push(bincode::deserialize::<Chunk>(value.value())?);
                }
            }
            chunks.sort();
            out.push((file, chunks));
        }
        Ok(out)
    }

    /// Allocates a new file id, stores the file and its chunks, and bumps
    /// the `next_file_id` counter in the same transaction (invariant 1: ids
    /// are assigned locally and never reused, even across snapshot/restore).
    pub fn create_file_with_chunks(&self, name: &str, full_hash: &str, chunks: &[Chunk]) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let file_id = {
            let mut meta = txn.open_table(tables::META)?;
            let next = meta
                .get(tables::NEXT_FILE_ID_KEY)?
                .map(|v| v.value())
                .unwrap_or(0);
            meta.insert(tables::NEXT_FILE_ID_KEY, next + 1)?;
            next
        };
        {
            let file = File {
                id: file_id,
                name: name.to_string(),
                full_hash: full_hash.to_string(),
            };
            let mut files = txn.open_table(tables::FILES_BY_HASH)?;
            files.insert(full_hash, bincode::serialize(&file)?.as_slice())?;

            let mut index = txn.open_table(tables::FILE_ID_TO_HASH)?;
            index.insert(file_id, full_hash)?;

            let mut chunk_table = txn.open_table(tables::CHUNKS)?;
            for chunk in chunks {
                let key = tables::pack_file_chunk(file_id, chunk.id);
                chunk_table.insert(key.as_slice(), bincode::serialize(chunk)?.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(file_id)
    }

    /// Applies the full `add_file` mutation — file create-or-reuse, the
    /// chunk-list mismatch check, the host edge insert, and the peer row
    /// update — as a single `WriteTransaction`, so a crash partway through
    /// can never leave a file with no host edge or a host edge whose
    /// peer's sequence counter never made it to disk (spec §4.2: each
    /// mutating op "runs under a single transaction"). `peer` must already
    /// carry whatever counter value the caller wants persisted; `chunks`
    /// must already be sorted by `id`. On `ChunkMismatch` or
    /// `AlreadyHosting` nothing is written — the transaction is dropped
    /// uncommitted, which redb rolls back.
    pub fn apply_add_file(&self, name: &str, full_hash: &str, chunks: &[Chunk], peer: &Peer) -> Result<AddFileOutcome> {
        let txn = self.db.begin_write()?;

        let existing_file: Option<File> = {
            let files = txn.open_table(tables::FILES_BY_HASH)?;
            files
                .get(full_hash)?
                .map(|value| bincode::deserialize(value.value()))
                .transpose()?
        };

        let file_id = match existing_file {
            Some(existing) => {
                let mut stored = {
                    let chunk_table = txn.open_table(tables::CHUNKS)?;
                    let prefix = tables::pack_file_prefix(existing.id);
                    let mut stored = Vec::new();
                    for row in chunk_table.iter()? {
                        let (key, value) = row?;
                        if key.value().starts_with(prefix.as_slice()) {
                            stored.push(bincode::deserialize::<Chunk>(value.value())?);
                        }
                    }
                    stored
                };
                stored.sort();
                if stored.as_slice() != chunks {
                    return Ok(AddFileOutcome::ChunkMismatch);
                }
                existing.id
            }
            None => {
                let file_id = {
                    let mut meta = txn.open_table(tables::META)?;
                    let next = meta
                        .get(tables::NEXT_FILE_ID_KEY)?
                        .map(|v| v.value())
                        .unwrap_or(0);
                    meta.insert(tables::NEXT_FILE_ID_KEY, next + 1)?;
                    next
                };
                let file = File {
                    id: file_id,
                    name: name.to_string(),
                    full_hash: full_hash.to_string(),
                };
                {
                    let mut files = txn.open_table(tables::FILES_BY_HASH)?;
                    files.insert(full_hash, bincode::serialize(&file)?.as_slice())?;
                }
                {
                    let mut index = txn.open_table(tables::FILE_ID_TO_HASH)?;
                    index.insert(file_id, full_hash)?;
                }
                {
                    let mut chunk_table = txn.open_table(tables::CHUNKS)?;
                    for chunk in chunks {
                        let key = tables::pack_file_chunk(file_id, chunk.id);
                        chunk_table.insert(key.as_slice(), bincode::serialize(chunk)?.as_slice())?;
                    }
                }
                file_id
            }
        };

        let inserted = {
            let fp_key = tables::pack_file_peer(file_id, peer.uuid);
            let mut hosts = txn.open_table(tables::HOSTS)?;
            let already = hosts.get(fp_key.as_slice())?.is_some();
            if !already {
                hosts.insert(fp_key.as_slice(), 1u8)?;
                let pf_key = tables::pack_peer_file(peer.uuid, file_id);
                let mut hosts_by_peer = txn.open_table(tables::HOSTS_BY_PEER)?;
                hosts_by_peer.insert(pf_key.as_slice(), 1u8)?;
            }
            !already
        };
        if !inserted {
            return Ok(AddFileOutcome::AlreadyHosting);
        }

        {
            let mut peers = txn.open_table(tables::PEERS)?;
            peers.insert(peer.uuid.as_u128(), bincode::serialize(peer)?.as_slice())?;
        }

        txn.commit()?;
        Ok(AddFileOutcome::Applied { file_id })
    }

    /// Applies the host-detach half of `deregister_file`/
    /// `deregister_file_by_hash` — host edge removal, peer row update, and
    /// (if the file is now unhosted) the file-and-chunks cascade delete —
    /// as a single `WriteTransaction`. On `NotHosting` nothing is written.
    pub fn apply_deregister(&self, file_id: u64, full_hash: &str, peer: &Peer) -> Result<DeregisterOutcome> {
        let txn = self.db.begin_write()?;

        let removed = {
            let fp_key = tables::pack_file_peer(file_id, peer.uuid);
            let mut hosts = txn.open_table(tables::HOSTS)?;
            let removed = hosts.remove(fp_key.as_slice())?.is_some();
            if removed {
                let pf_key = tables::pack_peer_file(peer.uuid, file_id);
                let mut hosts_by_peer = txn.open_table(tables::HOSTS_BY_PEER)?;
                hosts_by_peer.remove(pf_key.as_slice())?;
            }
            removed
        };
        if !removed {
            return Ok(DeregisterOutcome::NotHosting);
        }

        {
            let mut peers = txn.open_table(tables::PEERS)?;
            peers.insert(peer.uuid.as_u128(), bincode::serialize(peer)?.as_slice())?;
        }

        let remaining = {
            let hosts = txn.open_table(tables::HOSTS)?;
            let prefix = tables::pack_file_prefix(file_id);
            hosts
                .iter()?
                .filter_map(|row| row.ok())
                .filter(|(key, _)| key.value().starts_with(prefix.as_slice()))
                .count()
        };

        if remaining == 0 {
            // No other peer hosts this file, so every `hosts_by_peer`
            // entry pointing at it was already removed above alongside its
            // matching `hosts` row — only the file and chunk rows remain.
            let mut files = txn.open_table(tables::FILES_BY_HASH)?;
            files.remove(full_hash)?;

            let mut index = txn.open_table(tables::FILE_ID_TO_HASH)?;
            index.remove(file_id)?;

            let mut chunk_table = txn.open_table(tables::CHUNKS)?;
            let prefix = tables::pack_file_prefix(file_id);
            let stale: Vec<Vec<u8>> = chunk_table
                .iter()?
                .filter_map(|row| row.ok())
                .map(|(key, _)| key.value().to_vec())
                .filter(|key| key.starts_with(prefix.as_slice()))
                .collect();
            for key in stale {
                chunk_table.remove(key.as_slice())?;
            }
        }

        txn.commit()?;
        Ok(DeregisterOutcome::Applied)
    }

    /// Removes a file, its chunks, and every host edge pointing at it.
    pub fn delete_file(&self, file_id: u64, full_hash: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut files = txn.open_table(tables::FILES_BY_HASH)?;
            files.remove(full_hash)?;

            let mut index = txn.open_table(tables::FILE_ID_TO_HASH)?;
            index.remove(file_id)?;

            let mut chunk_table = txn.open_table(tables::CHUNKS)?;
            let prefix = tables::pack_file_prefix(file_id);
            let stale: Vec<Vec<u8>> = chunk_table
                .iter()?
                .filter_map(|row| row.ok())
                .map(|(k, _)| k.value().to_vec())
                .filter(|k| k.starts_with(prefix.as_slice()))
                .collect();
            for key in stale {
                chunk_table.remove(key.as_slice())?;
            }

            let mut hosts = txn.open_table(tables::HOSTS)?;
            let stale_hosts: Vec<Vec<u8>> = hosts
                .iter()?
                .filter_map(|row| row.ok())
                .map(|(k, _)| k.value().to_vec())
                .filter(|k| k.starts_with(prefix.as_slice()))
                .collect();
            for key in &stale_hosts {
                hosts.remove(key.as_slice())?;
            }

            // hosts_by_peer is keyed (peer, file), not (file, peer), so its
            // stale rows can't be derived from `stale_hosts` above — filter
            // by the file_id suffix instead.
            let mut hosts_by_peer = txn.open_table(tables::HOSTS_BY_PEER)?;
            let reverse_stale: Vec<Vec<u8>> = hosts_by_peer
                .iter()?
                .filter_map(|row| row.ok())
                .map(|(k, _)| k.value().to_vec())
                .filter(|k| k.ends_with(&file_id.to_be_bytes()))
                .collect();
            for key in reverse_stale {
                hosts_by_peer.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    // -- host edges --------------------------------------------------------

    pub fn add_host(&self, file_id: u64, peer: Uuid) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let inserted = {
            let fp_key = tables::pack_file_peer(file_id, peer);
            let mut hosts = txn.open_table(tables::HOSTS)?;
            let already = hosts.get(fp_key.as_slice())?.is_some();
            if !already {
                hosts.insert(fp_key.as_slice(), 1u8)?;
                let pf_key = tables::pack_peer_file(peer, file_id);
                let mut hosts_by_peer = txn.open_table(tables::HOSTS_BY_PEER)?;
                hosts_by_peer.insert(pf_key.as_slice(), 1u8)?;
            }
            !already
        };
        txn.commit()?;
        Ok(inserted)
    }

    pub fn is_hosting(&self, file_id: u64, peer: Uuid) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::HOSTS)?;
        let key = tables::pack_file_peer(file_id, peer);
        Ok(table.get(key.as_slice())?.is_some())
    }

    pub fn remove_host(&self, file_id: u64, peer: Uuid) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let fp_key = tables::pack_file_peer(file_id, peer);
            let mut hosts = txn.open_table(tables::HOSTS)?;
            let removed = hosts.remove(fp_key.as_slice())?.is_some();
            if removed {
                let pf_key = tables::pack_peer_file(peer, file_id);
                let mut hosts_by_peer = txn.open_table(tables::HOSTS_BY_PEER)?;
                hosts_by_peer.remove(pf_key.as_slice())?;
            }
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn count_hosts(&self, file_id: u64) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::HOSTS)?;
        let prefix = tables::pack_file_prefix(file_id);
        let count = table
            .iter()?
            .filter_map(|row| row.ok())
            .filter(|(k, _)| k.value().starts_with(prefix.as_slice()))
            .count();
        Ok(count)
    }

    pub fn hosts_for_file(&self, file_id: u64) -> Result<Vec<Uuid>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::HOSTS)?;
        let prefix = tables::pack_file_prefix(file_id);
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, _) = row?;
            let key = key.value();
            if key.starts_with(prefix.as_slice()) {
                out.push(tables::unpack_file_peer_suffix(key));
            }
        }
        Ok(out)
    }

    pub fn files_hosted_by(&self, peer: Uuid) -> Result<Vec<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(tables::HOSTS_BY_PEER)?;
        let prefix = tables::pack_peer_prefix(peer);
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, _) = row?;
            let key = key.value();
            if key.starts_with(prefix.as_slice()) {
                out.push(tables::unpack_peer_suffix(key));
            }
        }
        Ok(out)
    }

    // -- snapshot / restore -------------------------------------------------

    pub fn snapshot(&self) -> Result<DatabaseDump> {
        let txn = self.db.begin_read()?;

        let trackers = {
            let table = txn.open_table(tables::TRACKERS)?;
            table
                .iter()?
                .map(|row| row.map_err(StoreError::from).and_then(|(_, v)| Ok(bincode::deserialize(v.value())?)))
                .collect::<Result<Vec<Tracker>>>()?
        };

        let peers = {
            let table = txn.open_table(tables::PEERS)?;
            table
                .iter()?
                .map(|row| row.map_err(StoreError::from).and_then(|(_, v)| Ok(bincode::deserialize(v.value())?)))
                .collect::<Result<Vec<Peer>>>()?
        };

        let files = {
            let files_table = txn.open_table(tables::FILES_BY_HASH)?;
            let chunks_table = txn.open_table(tables::CHUNKS)?;
            let mut out = Vec::new();
            for row in files_table.iter()? {
                let (_, value) = row?;
                let file: File = bincode::deserialize(value.value())?;
                let prefix = tables::pack_file_prefix(file.id);
                let mut chunks = Vec::new();
                for chunk_row in chunks_table.iter()? {
                    let (key, value) = chunk_row?;
                    if key.value().starts_with(prefix.as_slice()) {
                        chunks.push(bincode::deserialize::<Chunk>(value.value())?);
                    }
                }
                chunks.sort();
                out.push((file, chunks));
            }
            out
        };

        let hosts = {
            let table = txn.open_table(tables::HOSTS)?;
            let mut out = Vec::new();
            for row in table.iter()? {
                let (key, _) = row?;
                let key = key.value();
                let mut file_id_buf = [0u8; 8];
                file_id_buf.copy_from_slice(&key[0..8]);
                let file_id = u64::from_be_bytes(file_id_buf);
                let mut peer_buf = [0u8; 16];
                peer_buf.copy_from_slice(&key[8..24]);
                let peer = Uuid::from_u128(u128::from_be_bytes(peer_buf));
                out.push((file_id, peer));
            }
            out
        };

        let next_file_id = {
            let meta = txn.open_table(tables::META)?;
            meta.get(tables::NEXT_FILE_ID_KEY)?.map(|v| v.value()).unwrap_or(0)
        };

        Ok(DatabaseDump {
            trackers,
            peers,
            files,
            hosts,
            next_file_id,
        })
    }

    /// Replaces the entire contents of every table with `dump`'s rows. Used
    /// once, at bootstrap, to adopt a sibling tracker's full state: there is
    /// no partial-resync path, so this is a clear-then-bulk-insert, not a
    /// merge.
    pub fn restore(&self, dump: &DatabaseDump) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut trackers = txn.open_table(tables::TRACKERS)?;
            trackers.retain(|_, _| false)?;
            for tracker in &dump.trackers {
                trackers.insert(tracker.ip.as_str(), bincode::serialize(tracker)?.as_slice())?;
            }

            let mut peers = txn.open_table(tables::PEERS)?;
            peers.retain(|_, _| false)?;
            for peer in &dump.peers {
                peers.insert(peer.uuid.as_u128(), bincode::serialize(peer)?.as_slice())?;
            }

            let mut files = txn.open_table(tables::FILES_BY_HASH)?;
            files.retain(|_, _| false)?;
            let mut file_index = txn.open_table(tables::FILE_ID_TO_HASH)?;
            file_index.retain(|_, _| false)?;
            let mut chunks = txn.open_table(tables::CHUNKS)?;
            chunks.retain(|_, _| false)?;
            for (file, file_chunks) in &dump.files {
                files.insert(file.full_hash.as_str(), bincode::serialize(file)?.as_slice())?;
                file_index.insert(file.id, file.full_hash.as_str())?;
                for chunk in file_chunks {
                    let key = tables::pack_file_chunk(file.id, chunk.id);
                    chunks.insert(key.as_slice(), bincode::serialize(chunk)?.as_slice())?;
                }
            }

            let mut hosts = txn.open_table(tables::HOSTS)?;
            hosts.retain(|_, _| false)?;
            let mut hosts_by_peer = txn.open_table(tables::HOSTS_BY_PEER)?;
            hosts_by_peer.retain(|_, _| false)?;
            for (file_id, peer) in &dump.hosts {
                hosts.insert(tables::pack_file_peer(*file_id, *peer).as_slice(), 1u8)?;
                hosts_by_peer.insert(tables::pack_peer_file(*peer, *file_id).as_slice(), 1u8)?;
            }

            let mut meta = txn.open_table(tables::META)?;
            meta.retain(|_, _| false)?;
            meta.insert(tables::NEXT_FILE_ID_KEY, dump.next_file_id)?;
        }
        txn.commit()?;
        Ok(())
    }
}
