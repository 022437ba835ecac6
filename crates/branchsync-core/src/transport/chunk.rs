//! Payload chunking and reassembly
//!
//! QR frames and BLE writes cannot carry a whole payload, so the
//! sender splits the JSON text into indexed chunks and the receiver
//! reassembles them from a sparse map - tolerant of any arrival order,
//! duplicate frames, and frames missed then re-shown on a later pass.
//!
//! The chunk wire form is deliberately terse (`{"i":0,"n":5,"d":"..."}`)
//! since every byte competes with payload data for QR capacity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// One chunk of a split payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based chunk index
    #[serde(rename = "i")]
    pub index: usize,
    /// Total chunk count for the payload
    #[serde(rename = "n")]
    pub total: usize,
    /// The chunk's slice of the payload text
    #[serde(rename = "d")]
    pub data: String,
}

impl Chunk {
    /// Encode to the JSON frame text.
    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from a frame text.
    pub fn decode(data: &str) -> SyncResult<Self> {
        serde_json::from_str(data).map_err(|e| SyncError::Parse(e.to_string()))
    }
}

/// Split payload text into chunks of at most `max_bytes` bytes each,
/// on char boundaries.
///
/// An empty payload still yields one (empty) chunk so the receiver
/// observes a complete transfer.
pub fn split_payload(payload: &str, max_bytes: usize) -> Vec<Chunk> {
    let mut pieces: Vec<&str> = Vec::new();
    let mut start = 0;
    while start < payload.len() {
        let mut end = (start + max_bytes.max(1)).min(payload.len());
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_bytes smaller than one char; take the whole char
            end = payload[start..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| start + i)
                .unwrap_or(payload.len());
        }
        pieces.push(&payload[start..end]);
        start = end;
    }
    if pieces.is_empty() {
        pieces.push("");
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| Chunk {
            index,
            total,
            data: data.to_string(),
        })
        .collect()
}

/// Sparse-map reassembly of a chunked payload.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    total: Option<usize>,
    parts: HashMap<usize, String>,
}

impl ChunkAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed chunk.
    ///
    /// Duplicates are ignored. A chunk disagreeing with the previously
    /// observed total, or indexed outside it, is a parse error - the
    /// frames belong to different transfers.
    pub fn insert(&mut self, chunk: Chunk) -> SyncResult<()> {
        if chunk.total == 0 {
            return Err(SyncError::Parse("chunk with zero total".to_string()));
        }
        match self.total {
            Some(total) if total != chunk.total => {
                return Err(SyncError::Parse(format!(
                    "chunk total {} conflicts with {}",
                    chunk.total, total
                )));
            }
            None => self.total = Some(chunk.total),
            _ => {}
        }
        if chunk.index >= chunk.total {
            return Err(SyncError::Parse(format!(
                "chunk index {} out of range for total {}",
                chunk.index, chunk.total
            )));
        }

        self.parts.entry(chunk.index).or_insert(chunk.data);
        Ok(())
    }

    /// Number of distinct chunks observed so far.
    pub fn received(&self) -> usize {
        self.parts.len()
    }

    /// Total chunk count, once any chunk has been observed.
    pub fn total(&self) -> Option<usize> {
        self.total
    }

    /// Whether every index `0..total` has been observed.
    pub fn is_complete(&self) -> bool {
        match self.total {
            Some(total) => self.parts.len() == total,
            None => false,
        }
    }

    /// Concatenate the chunks in index order, if complete.
    pub fn assemble(&self) -> Option<String> {
        let total = self.total?;
        if self.parts.len() != total {
            return None;
        }
        let mut out = String::new();
        for index in 0..total {
            out.push_str(self.parts.get(&index)?);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_reassemble() {
        let payload = "abcdefghij".repeat(10);
        let chunks = split_payload(&payload, 16);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.total == chunks.len()));

        let mut assembler = ChunkAssembler::new();
        for chunk in chunks {
            assembler.insert(chunk).unwrap();
        }
        assert_eq!(assembler.assemble().unwrap(), payload);
    }

    #[test]
    fn test_reassembly_out_of_order_with_duplicates() {
        let payload = "0123456789abcdef";
        let chunks = split_payload(payload, 4);
        assert_eq!(chunks.len(), 4);

        let mut assembler = ChunkAssembler::new();
        assembler.insert(chunks[2].clone()).unwrap();
        assembler.insert(chunks[0].clone()).unwrap();
        assembler.insert(chunks[2].clone()).unwrap(); // duplicate
        assembler.insert(chunks[3].clone()).unwrap();
        assert!(!assembler.is_complete());
        assembler.insert(chunks[1].clone()).unwrap();

        assert!(assembler.is_complete());
        assert_eq!(assembler.assemble().unwrap(), payload);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let payload = "héllo wörld ←→ done";
        let chunks = split_payload(payload, 5);
        let reassembled: String = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_empty_payload_single_chunk() {
        let chunks = split_payload("", 16);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total, 1);

        let mut assembler = ChunkAssembler::new();
        assembler.insert(chunks[0].clone()).unwrap();
        assert_eq!(assembler.assemble().unwrap(), "");
    }

    #[test]
    fn test_conflicting_total_rejected() {
        let mut assembler = ChunkAssembler::new();
        assembler
            .insert(Chunk {
                index: 0,
                total: 3,
                data: "a".into(),
            })
            .unwrap();
        let err = assembler
            .insert(Chunk {
                index: 1,
                total: 4,
                data: "b".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut assembler = ChunkAssembler::new();
        let err = assembler
            .insert(Chunk {
                index: 5,
                total: 3,
                data: "x".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn test_chunk_wire_form_is_terse() {
        let chunk = Chunk {
            index: 2,
            total: 7,
            data: "xyz".into(),
        };
        let encoded = chunk.encode().unwrap();
        assert_eq!(encoded, r#"{"i":2,"n":7,"d":"xyz"}"#);
        assert_eq!(Chunk::decode(&encoded).unwrap(), chunk);
    }
}
