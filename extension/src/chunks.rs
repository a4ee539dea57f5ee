// Chunked transfer of large payloads across contexts
// A payload (tags + bytes) is split into start / tag* / data* / end fragments
// and rebuilt by index on the receiving side

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::protocol::CollectionId;

/// Default size of one `data` slice
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Collections one owner may hold at a time, incomplete or waiting for the
/// call that consumes them
pub const MAX_OPEN_COLLECTIONS: usize = 64;

/// Name/value pair attached to a transaction or data item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// What gets chunked: a tag list plus raw bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(tags: Vec<Tag>, data: Vec<u8>) -> Self {
        Self { tags, data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkBody {
    Start,
    Tag(Tag),
    Data(Vec<u8>),
    End,
}

/// One fragment of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChunk", into = "RawChunk")]
pub struct Chunk {
    pub collection_id: CollectionId,
    pub index: u32,
    pub body: ChunkBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ChunkKind {
    Start,
    Tag,
    Data,
    End,
}

#[derive(Serialize, Deserialize)]
struct RawChunk {
    #[serde(rename = "collectionID")]
    collection_id: CollectionId,
    #[serde(rename = "type")]
    kind: ChunkKind,
    index: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    value: Value,
}

impl TryFrom<RawChunk> for Chunk {
    type Error = String;

    fn try_from(raw: RawChunk) -> Result<Self, Self::Error> {
        let body = match raw.kind {
            ChunkKind::Start => ChunkBody::Start,
            ChunkKind::End => ChunkBody::End,
            ChunkKind::Tag => ChunkBody::Tag(
                serde_json::from_value(raw.value).map_err(|e| format!("Invalid tag chunk: {}", e))?,
            ),
            ChunkKind::Data => ChunkBody::Data(
                serde_json::from_value(raw.value)
                    .map_err(|e| format!("Invalid data chunk: {}", e))?,
            ),
        };

        Ok(Self {
            collection_id: raw.collection_id,
            index: raw.index,
            body,
        })
    }
}

impl From<Chunk> for RawChunk {
    fn from(chunk: Chunk) -> Self {
        let (kind, value) = match chunk.body {
            ChunkBody::Start => (ChunkKind::Start, Value::Null),
            ChunkBody::End => (ChunkKind::End, Value::Null),
            ChunkBody::Tag(tag) => (ChunkKind::Tag, serde_json::json!(tag)),
            ChunkBody::Data(bytes) => (ChunkKind::Data, serde_json::json!(bytes)),
        };
        Self {
            collection_id: chunk.collection_id,
            kind,
            index: chunk.index,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("no chunks to reassemble")]
    Empty,
    #[error("chunk collection {collection} is incomplete ({received} chunks received)")]
    Incomplete {
        collection: CollectionId,
        received: usize,
    },
    #[error("chunk for collection {found} pushed into collection {expected}")]
    MixedCollections {
        expected: CollectionId,
        found: CollectionId,
    },
    #[error("too many open chunk collections")]
    TooManyCollections,
}

/// Split a payload into an ordered chunk sequence.
///
/// Indices are assigned sequentially across the whole collection, so the
/// receiver can rebuild the payload regardless of arrival order.
pub fn split(payload: &Payload, collection_id: &CollectionId, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let data_chunks = payload.data.len().div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(2 + payload.tags.len() + data_chunks);
    let mut index = 0u32;
    let mut push = |body: ChunkBody| {
        chunks.push(Chunk {
            collection_id: collection_id.clone(),
            index,
            body,
        });
        index += 1;
    };

    push(ChunkBody::Start);
    for tag in &payload.tags {
        push(ChunkBody::Tag(tag.clone()));
    }
    for slice in payload.data.chunks(chunk_size) {
        push(ChunkBody::Data(slice.to_vec()));
    }
    push(ChunkBody::End);

    chunks
}

/// Rebuild the payload of one collection from all of its chunks
pub fn reassemble(chunks: impl IntoIterator<Item = Chunk>) -> Result<Payload, ChunkError> {
    let mut buffer = ChunkBuffer::default();
    let mut any = false;
    for chunk in chunks {
        any = true;
        buffer.push(chunk)?;
    }
    if !any {
        return Err(ChunkError::Empty);
    }
    buffer.finish()
}

/// Accumulates the chunks of a single collection
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    collection_id: Option<CollectionId>,
    entries: BTreeMap<u32, ChunkBody>,
    end_index: Option<u32>,
}

impl ChunkBuffer {
    pub fn new(collection_id: CollectionId) -> Self {
        Self {
            collection_id: Some(collection_id),
            ..Self::default()
        }
    }

    pub fn collection_id(&self) -> Option<&CollectionId> {
        self.collection_id.as_ref()
    }

    /// Add a chunk; returns true once every chunk up to `end` is present.
    ///
    /// Duplicate indices keep the first copy.
    pub fn push(&mut self, chunk: Chunk) -> Result<bool, ChunkError> {
        match &self.collection_id {
            Some(expected) if *expected != chunk.collection_id => {
                return Err(ChunkError::MixedCollections {
                    expected: expected.clone(),
                    found: chunk.collection_id,
                });
            }
            Some(_) => {}
            None => self.collection_id = Some(chunk.collection_id.clone()),
        }

        if matches!(chunk.body, ChunkBody::End) {
            self.end_index = Some(chunk.index);
        }
        if self.entries.contains_key(&chunk.index) {
            tracing::warn!(
                "Duplicate chunk {} for collection {}, ignoring",
                chunk.index,
                chunk.collection_id
            );
        } else {
            self.entries.insert(chunk.index, chunk.body);
        }

        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        let Some(end) = self.end_index else {
            return false;
        };
        matches!(self.entries.get(&0), Some(ChunkBody::Start))
            && self.entries.len() == end as usize + 1
            && self.entries.keys().next_back() == Some(&end)
    }

    pub fn received(&self) -> usize {
        self.entries.len()
    }

    /// Consume the buffer into the original payload
    pub fn finish(self) -> Result<Payload, ChunkError> {
        if !self.is_complete() {
            return Err(ChunkError::Incomplete {
                collection: self.collection_id.unwrap_or_else(|| CollectionId::from("")),
                received: self.entries.len(),
            });
        }

        let mut payload = Payload::default();
        for body in self.entries.into_values() {
            match body {
                ChunkBody::Tag(tag) => payload.tags.push(tag),
                ChunkBody::Data(bytes) => payload.data.extend_from_slice(&bytes),
                ChunkBody::Start | ChunkBody::End => {}
            }
        }
        Ok(payload)
    }
}

/// Chunk buffers for many collections, partitioned by owner.
///
/// The background keys owners by application so one site can never complete
/// or read another site's collection.
#[derive(Default)]
pub struct ChunkStore {
    inner: Mutex<ChunkStoreInner>,
}

#[derive(Default)]
struct ChunkStoreInner {
    open: HashMap<(String, CollectionId), ChunkBuffer>,
    ready: HashMap<(String, CollectionId), Payload>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk; a completed collection is reassembled immediately and
    /// its buffer dropped.
    pub fn push(&self, owner: &str, chunk: Chunk) -> Result<(), ChunkError> {
        let key = (owner.to_string(), chunk.collection_id.clone());
        let mut inner = self.inner.lock();

        if !inner.open.contains_key(&key) {
            if inner.ready.contains_key(&key) {
                tracing::warn!(
                    "Chunk {} arrived for already completed collection {}, ignoring",
                    chunk.index,
                    chunk.collection_id
                );
                return Ok(());
            }
            let held = inner.open.keys().filter(|(o, _)| o == owner).count()
                + inner.ready.keys().filter(|(o, _)| o == owner).count();
            if held >= MAX_OPEN_COLLECTIONS {
                return Err(ChunkError::TooManyCollections);
            }
            if !matches!(chunk.body, ChunkBody::Start) {
                tracing::debug!(
                    "Chunk {} for unknown collection {} arrived before start, buffering",
                    chunk.index,
                    chunk.collection_id
                );
            }
        }

        let buffer = inner
            .open
            .entry(key.clone())
            .or_insert_with(|| ChunkBuffer::new(chunk.collection_id.clone()));
        if buffer.push(chunk)? {
            if let Some(buffer) = inner.open.remove(&key) {
                let payload = buffer.finish()?;
                tracing::debug!(
                    "Chunk collection {} complete ({} bytes, {} tags)",
                    key.1,
                    payload.data.len(),
                    payload.tags.len()
                );
                inner.ready.insert(key, payload);
            }
        }
        Ok(())
    }

    /// Remove and return a completed collection
    pub fn take(&self, owner: &str, collection_id: &CollectionId) -> Option<Payload> {
        self.inner
            .lock()
            .ready
            .remove(&(owner.to_string(), collection_id.clone()))
    }

    /// Drop every buffer (open or completed) belonging to `owner`
    pub fn discard_owner(&self, owner: &str) {
        let mut inner = self.inner.lock();
        inner.open.retain(|(o, _), _| o != owner);
        inner.ready.retain(|(o, _), _| o != owner);
    }

    pub fn open_collections(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Completed collections not yet taken by a call
    pub fn ready_collections(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(len: usize) -> Payload {
        Payload::new(
            vec![
                Tag::new("Content-Type", "text/plain"),
                Tag::new("App-Name", "test"),
                Tag::new("App-Version", "1"),
            ],
            (0..len).map(|i| (i % 251) as u8).collect(),
        )
    }

    #[test]
    fn split_layout() {
        let payload = sample_payload(10);
        let id = CollectionId::random();
        let chunks = split(&payload, &id, 4);

        // start + 3 tags + 3 data + end
        assert_eq!(chunks.len(), 8);
        assert_eq!(chunks[0].body, ChunkBody::Start);
        assert!(matches!(chunks[1].body, ChunkBody::Tag(_)));
        assert_eq!(chunks[4].body, ChunkBody::Data(vec![0, 1, 2, 3]));
        assert_eq!(chunks[6].body, ChunkBody::Data(vec![8, 9]));
        assert_eq!(chunks[7].body, ChunkBody::End);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u32);
            assert_eq!(chunk.collection_id, id);
        }
    }

    #[test]
    fn roundtrip_various_sizes() {
        for (len, size) in [(0, 4), (1, 4), (4, 4), (5, 4), (1000, 7), (3000, 3000)] {
            let payload = sample_payload(len);
            let chunks = split(&payload, &CollectionId::random(), size);
            assert_eq!(reassemble(chunks).unwrap(), payload, "len={} size={}", len, size);
        }
    }

    #[test]
    fn empty_payload_is_start_and_end() {
        let chunks = split(&Payload::default(), &CollectionId::random(), 16);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].body, ChunkBody::Start);
        assert_eq!(chunks[1].body, ChunkBody::End);
        assert_eq!(reassemble(chunks).unwrap(), Payload::default());
    }

    #[test]
    fn reordered_data_chunks_reassemble_by_index() {
        let payload = Payload::new(vec![], b"abcdefghi".to_vec());
        let chunks = split(&payload, &CollectionId::random(), 3);
        // start, data(1..=3), end
        let start = chunks[0].clone();
        let end = chunks[4].clone();
        let data = [chunks[3].clone(), chunks[1].clone(), chunks[2].clone()];

        let mut buffer = ChunkBuffer::default();
        assert!(!buffer.push(start).unwrap());
        for chunk in data {
            assert!(!buffer.push(chunk).unwrap());
        }
        assert!(buffer.push(end).unwrap());
        assert_eq!(buffer.finish().unwrap(), payload);
    }

    #[test]
    fn missing_chunk_is_incomplete() {
        let mut chunks = split(&sample_payload(20), &CollectionId::random(), 5);
        chunks.remove(5);
        assert!(matches!(reassemble(chunks), Err(ChunkError::Incomplete { .. })));
    }

    #[test]
    fn mixed_collections_rejected() {
        let a = split(&sample_payload(2), &CollectionId::from("a"), 5);
        let b = split(&sample_payload(2), &CollectionId::from("b"), 5);
        let mut buffer = ChunkBuffer::default();
        buffer.push(a[0].clone()).unwrap();
        assert!(matches!(
            buffer.push(b[1].clone()),
            Err(ChunkError::MixedCollections { .. })
        ));
    }

    #[test]
    fn wire_format() {
        let id = CollectionId::from("c1");
        let chunks = split(&Payload::new(vec![Tag::new("a", "b")], vec![7, 8]), &id, 10);
        let values: Vec<_> = chunks.iter().map(|c| serde_json::to_value(c).unwrap()).collect();
        assert_eq!(values[0], serde_json::json!({"collectionID": "c1", "type": "start", "index": 0}));
        assert_eq!(values[1]["value"], serde_json::json!({"name": "a", "value": "b"}));
        assert_eq!(values[2]["type"], "data");
        assert_eq!(values[2]["value"], serde_json::json!([7, 8]));

        let parsed: Vec<Chunk> = values
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(parsed, chunks);
    }

    #[test]
    fn store_partitions_by_owner() {
        let store = ChunkStore::new();
        let id = CollectionId::random();
        let payload = sample_payload(30);
        let chunks = split(&payload, &id, 8);

        let (first, rest) = chunks.split_at(3);
        for chunk in first {
            store.push("evil.example", chunk.clone()).unwrap();
        }
        for chunk in chunks.iter() {
            store.push("trusted.example", chunk.clone()).unwrap();
        }
        for chunk in rest {
            // data before start for a fresh owner is buffered, not an error
            store.push("other.example", chunk.clone()).unwrap();
        }

        assert_eq!(store.take("trusted.example", &id), Some(payload));
        assert_eq!(store.take("trusted.example", &id), None);
        assert_eq!(store.take("evil.example", &id), None);
        assert_eq!(store.open_collections(), 2);

        store.discard_owner("evil.example");
        assert_eq!(store.open_collections(), 1);
    }

    #[test]
    fn store_limits_open_collections() {
        let store = ChunkStore::new();
        for _ in 0..MAX_OPEN_COLLECTIONS {
            let chunks = split(&Payload::default(), &CollectionId::random(), 8);
            store.push("spam.example", chunks[0].clone()).unwrap();
        }
        let chunks = split(&Payload::default(), &CollectionId::random(), 8);
        assert_eq!(
            store.push("spam.example", chunks[0].clone()),
            Err(ChunkError::TooManyCollections)
        );
        store.push("fine.example", chunks[0].clone()).unwrap();
    }

    #[test]
    fn completed_collections_count_toward_the_limit() {
        let store = ChunkStore::new();
        let payload = sample_payload(1024);
        let mut ids = Vec::new();
        for _ in 0..MAX_OPEN_COLLECTIONS {
            let id = CollectionId::random();
            for chunk in split(&payload, &id, 256) {
                store.push("hoarder.example", chunk).unwrap();
            }
            ids.push(id);
        }
        assert_eq!(store.open_collections(), 0);
        assert_eq!(store.ready_collections(), MAX_OPEN_COLLECTIONS);

        let extra = split(&payload, &CollectionId::random(), 256);
        assert_eq!(
            store.push("hoarder.example", extra[0].clone()),
            Err(ChunkError::TooManyCollections)
        );

        // consuming one frees a slot
        assert!(store.take("hoarder.example", &ids[0]).is_some());
        for chunk in extra {
            store.push("hoarder.example", chunk).unwrap();
        }
        assert_eq!(store.ready_collections(), MAX_OPEN_COLLECTIONS);
    }
}
