//! Encrypted append-only message log.
//!
//! A store is two files under `{profile_folder}/messages/`:
//! `<id>.index` holds fixed 16-byte records (`offset:u64_le ||
//! length:u64_le`, one per message number) and `<id>.data` holds the
//! encrypted entries. Entries are ChaCha20-Poly1305 sealed under the
//! store key with a random prepended nonce; the message number is bound
//! as associated data, so entries cannot be swapped on disk.
//!
//! The whole store sits behind one async mutex. Delivery-status updates
//! are read-modify-write under that lock, which is what keeps concurrent
//! group acknowledgments from losing each other. The index record is
//! written only after the data write succeeds, so a failed append never
//! advances the count.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::UserId;
use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use crate::messaging::message::{MessageItem, MessageType};

/// Size of one index record.
const INDEX_RECORD_SIZE: u64 = 16;

/// AEAD nonce size.
const NONCE_SIZE: usize = 12;

struct StoreInner {
    index: File,
    data: File,
    count: u32,
}

/// An encrypted, numbered message log owned by one live network.
pub struct MessageStore {
    id: String,
    dir: PathBuf,
    key: Zeroizing<[u8; 32]>,
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    /// Open or create the store `<id>` under `dir`.
    pub fn open(dir: &Path, id: &str, key: [u8; 32]) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("failed to create store directory: {e}")))?;

        let open = |name: &str| -> Result<File> {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(dir.join(name))
                .map_err(|e| Error::Storage(format!("failed to open {name}: {e}")))
        };
        let index = open(&format!("{id}.index"))?;
        let data = open(&format!("{id}.data"))?;

        let index_len = index
            .metadata()
            .map_err(|e| Error::Storage(e.to_string()))?
            .len();
        let count = (index_len / INDEX_RECORD_SIZE) as u32;

        debug!(id = %RedactedHex(id), count, "message store opened");

        Ok(Self {
            id: id.to_string(),
            dir: dir.to_path_buf(),
            key: Zeroizing::new(key),
            inner: Mutex::new(StoreInner { index, data, count }),
        })
    }

    /// Store id (file name stem).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store key bytes, for snapshotting.
    pub fn key_bytes(&self) -> [u8; 32] {
        *self.key
    }

    /// Number of entries.
    pub async fn message_count(&self) -> u32 {
        self.inner.lock().await.count
    }

    /// Append an entry and return its message number.
    pub async fn append(&self, item: &MessageItem) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let number = inner.count;
        let entry = self.seal(item, number)?;

        let offset = inner
            .data
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::Storage(e.to_string()))?;
        inner
            .data
            .write_all(&entry)
            .map_err(|e| Error::Storage(format!("data write failed: {e}")))?;
        inner
            .data
            .flush()
            .map_err(|e| Error::Storage(e.to_string()))?;

        // The count only advances once the index record lands.
        let mut record = [0u8; INDEX_RECORD_SIZE as usize];
        record[..8].copy_from_slice(&offset.to_le_bytes());
        record[8..].copy_from_slice(&(entry.len() as u64).to_le_bytes());
        inner
            .index
            .seek(SeekFrom::Start(number as u64 * INDEX_RECORD_SIZE))
            .map_err(|e| Error::Storage(e.to_string()))?;
        inner
            .index
            .write_all(&record)
            .map_err(|e| Error::Storage(format!("index write failed: {e}")))?;
        inner
            .index
            .flush()
            .map_err(|e| Error::Storage(e.to_string()))?;

        inner.count += 1;
        Ok(number)
    }

    /// Read the entry at `number`.
    pub async fn read(&self, number: u32) -> Result<MessageItem> {
        let mut inner = self.inner.lock().await;
        Self::read_locked(&mut inner, &self.key, number)
    }

    /// Mark `recipient`'s row of entry `number` delivered and rewrite the
    /// entry in place. The read-modify-write runs under the store lock.
    pub async fn update_delivery(
        &self,
        number: u32,
        recipient: &UserId,
        delivered_at: i64,
    ) -> Result<MessageItem> {
        let mut inner = self.inner.lock().await;
        let mut item = Self::read_locked(&mut inner, &self.key, number)?;
        if !item.mark_delivered(recipient, delivered_at) {
            return Err(Error::NotFound(format!(
                "user is not a recipient of message {number}"
            )));
        }
        self.rewrite_locked(&mut inner, number, &item)?;
        Ok(item)
    }

    /// Contiguous run of our own undelivered text messages, walking from
    /// the newest entry backwards and stopping at the first entry that is
    /// delivered to `recipient` or does not match. Returned oldest-first,
    /// which is the re-send order.
    pub async fn undelivered_from_tail(
        &self,
        local: &UserId,
        recipient: &UserId,
    ) -> Result<Vec<(u32, MessageItem)>> {
        let mut inner = self.inner.lock().await;
        let mut run = Vec::new();

        for number in (0..inner.count).rev() {
            let item = Self::read_locked(&mut inner, &self.key, number)?;
            let matches = item.sender == *local
                && item.message_type == MessageType::TextMessage
                && !item.is_delivered_to(recipient);
            if !matches {
                break;
            }
            run.push((number, item));
        }

        run.reverse();
        Ok(run)
    }

    /// Delete the store's files.
    pub fn delete_files(dir: &Path, id: &str) -> Result<()> {
        for suffix in ["index", "data"] {
            let path = dir.join(format!("{id}.{suffix}"));
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| Error::Storage(format!("failed to remove {path:?}: {e}")))?;
            }
        }
        Ok(())
    }

    /// Delete this store's files.
    pub async fn delete(&self) -> Result<()> {
        let _inner = self.inner.lock().await;
        Self::delete_files(&self.dir, &self.id)
    }

    fn read_locked(
        inner: &mut StoreInner,
        key: &[u8; 32],
        number: u32,
    ) -> Result<MessageItem> {
        if number >= inner.count {
            return Err(Error::NotFound(format!("no message number {number}")));
        }
        let (offset, length) = Self::index_record(inner, number)?;

        let mut entry = vec![0u8; length as usize];
        inner
            .data
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(e.to_string()))?;
        inner
            .data
            .read_exact(&mut entry)
            .map_err(|e| Error::Storage(e.to_string()))?;

        Self::unseal(key, &entry, number)
    }

    fn rewrite_locked(
        &self,
        inner: &mut StoreInner,
        number: u32,
        item: &MessageItem,
    ) -> Result<()> {
        let (offset, length) = Self::index_record(inner, number)?;
        let entry = self.seal(item, number)?;
        if entry.len() as u64 != length {
            return Err(Error::Storage(format!(
                "rewrite of message {number} changed entry size"
            )));
        }
        inner
            .data
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(e.to_string()))?;
        inner
            .data
            .write_all(&entry)
            .map_err(|e| Error::Storage(format!("rewrite failed: {e}")))?;
        inner
            .data
            .flush()
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn index_record(inner: &mut StoreInner, number: u32) -> Result<(u64, u64)> {
        let mut record = [0u8; INDEX_RECORD_SIZE as usize];
        inner
            .index
            .seek(SeekFrom::Start(number as u64 * INDEX_RECORD_SIZE))
            .map_err(|e| Error::Storage(e.to_string()))?;
        inner
            .index
            .read_exact(&mut record)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let offset = u64::from_le_bytes(record[..8].try_into().expect("8 bytes"));
        let length = u64::from_le_bytes(record[8..].try_into().expect("8 bytes"));
        Ok((offset, length))
    }

    fn seal(&self, item: &MessageItem, number: u32) -> Result<Vec<u8>> {
        let plaintext = bincode::serialize(item)?;
        let nonce: [u8; NONCE_SIZE] = crate::crypto::random_bytes();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &number.to_le_bytes(),
                },
            )
            .map_err(|_| Error::Storage("entry encryption failed".into()))?;

        let mut entry = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        entry.extend_from_slice(&nonce);
        entry.extend_from_slice(&ciphertext);
        Ok(entry)
    }

    fn unseal(key: &[u8; 32], entry: &[u8], number: u32) -> Result<MessageItem> {
        if entry.len() < NONCE_SIZE {
            return Err(Error::Storage("entry too short".into()));
        }
        let (nonce, ciphertext) = entry.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &number.to_le_bytes(),
                },
            )
            .map_err(|_| Error::Storage("entry authentication failed".into()))?;
        Ok(bincode::deserialize(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::RecipientStatus;

    fn uid(b: u8) -> UserId {
        UserId([b; 32])
    }

    fn open_store(dir: &Path) -> MessageStore {
        MessageStore::open(dir, "store-a", [7u8; 32]).expect("open store")
    }

    #[tokio::test]
    async fn test_append_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let item = MessageItem::new_text(uid(1), vec![uid(2)], b"first", 100);
        assert_eq!(store.append(&item).await.unwrap(), 0);
        assert_eq!(store.append(&item).await.unwrap(), 1);
        assert_eq!(store.message_count().await, 2);

        let read = store.read(0).await.unwrap();
        assert_eq!(read.payload, b"first");
        assert!(store.read(2).await.is_err());
    }

    #[tokio::test]
    async fn test_delivery_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open_store(tmp.path());
            let item = MessageItem::new_text(uid(1), vec![uid(2)], b"hello", 100);
            store.append(&item).await.unwrap();
            store.update_delivery(0, &uid(2), 150).await.unwrap();
        }

        let store = open_store(tmp.path());
        let item = store.read(0).await.unwrap();
        assert_eq!(item.recipients[0].status, RecipientStatus::Delivered);
        assert_eq!(item.recipients[0].delivered_at, 150);
    }

    #[tokio::test]
    async fn test_update_delivery_rejects_non_recipient() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let item = MessageItem::new_text(uid(1), vec![uid(2)], b"hello", 100);
        store.append(&item).await.unwrap();

        assert!(store.update_delivery(0, &uid(9), 150).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open_store(tmp.path());
            let item = MessageItem::new_text(uid(1), vec![uid(2)], b"hello", 100);
            store.append(&item).await.unwrap();
        }

        let store = MessageStore::open(tmp.path(), "store-a", [8u8; 32]).unwrap();
        assert!(store.read(0).await.is_err());
    }

    #[tokio::test]
    async fn test_undelivered_walk_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let me = uid(1);
        let them = uid(2);

        // 0: delivered, 1..=3: undelivered run from the tail.
        for text in [b"m0".as_slice(), b"m1", b"m2", b"m3"] {
            let item = MessageItem::new_text(me, vec![them], text, 100);
            store.append(&item).await.unwrap();
        }
        store.update_delivery(0, &them, 150).await.unwrap();

        let run = store.undelivered_from_tail(&me, &them).await.unwrap();
        let numbers: Vec<u32> = run.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        // A delivery in the middle cuts the walk short.
        store.update_delivery(2, &them, 160).await.unwrap();
        let run = store.undelivered_from_tail(&me, &them).await.unwrap();
        let numbers: Vec<u32> = run.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![3]);
    }

    #[tokio::test]
    async fn test_undelivered_walk_stops_at_foreign_sender() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let me = uid(1);
        let them = uid(2);

        store
            .append(&MessageItem::new_text(me, vec![them], b"mine", 100))
            .await
            .unwrap();
        store
            .append(&MessageItem::new_text(them, vec![me], b"theirs", 101))
            .await
            .unwrap();

        // The newest entry is theirs, so nothing is re-sent even though
        // entry 0 is undelivered.
        let run = store.undelivered_from_tail(&me, &them).await.unwrap();
        assert!(run.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store
            .append(&MessageItem::new_text(uid(1), vec![uid(2)], b"x", 1))
            .await
            .unwrap();
        store.delete().await.unwrap();

        assert!(!tmp.path().join("store-a.index").exists());
        assert!(!tmp.path().join("store-a.data").exists());
    }
}
