use crate::domain::SessionRecord;
use crate::sender::{CodecError, Payload, PayloadCodec};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Protocol version stamped on every upload.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One chunk of the session cache, ready to be encoded and sent once.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    /// 1-based sequence number.
    pub batch: usize,
    pub total_batches: usize,
    pub sessions: Vec<SessionRecord>,
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl UploadBatch {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Compress the sessions and wrap them in the batch envelope.
    pub fn encode(&self, codec: &PayloadCodec) -> Result<BatchEnvelope, CodecError> {
        let payload = codec.encode(&self.sessions)?;
        Ok(BatchEnvelope {
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            version: self.version.clone(),
            machine_id: self.machine_id.clone(),
            batch: self.batch,
            total_batches: self.total_batches,
            session_count: self.sessions.len(),
            payload,
        })
    }
}

/// Wire body of one batch: batch metadata alongside the encoded sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub timestamp: String,
    pub version: String,
    pub machine_id: String,
    pub batch: usize,
    pub total_batches: usize,
    pub session_count: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Document encoded by a full (unchunked) upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSnapshot {
    pub timestamp: String,
    pub version: String,
    pub machine_id: String,
    pub sessions: Vec<SessionRecord>,
}

impl FullSnapshot {
    pub fn new(machine_id: &str, sessions: Vec<SessionRecord>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            version: PROTOCOL_VERSION.to_string(),
            machine_id: machine_id.to_string(),
            sessions,
        }
    }
}

/// Split `records` into ordered chunks of at most `chunk_size`.
///
/// A `chunk_size` of zero is treated as one. No records, no batches.
pub fn partition(
    records: Vec<SessionRecord>,
    chunk_size: usize,
    machine_id: &str,
) -> Vec<UploadBatch> {
    let chunk_size = chunk_size.max(1);
    let total_batches = records.len().div_ceil(chunk_size);
    let timestamp = Utc::now();

    let mut batches = Vec::with_capacity(total_batches);
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        let sessions: Vec<SessionRecord> = records.by_ref().take(chunk_size).collect();
        batches.push(UploadBatch {
            batch: batches.len() + 1,
            total_batches,
            sessions,
            machine_id: machine_id.to_string(),
            timestamp,
            version: PROTOCOL_VERSION.to_string(),
        });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<SessionRecord> {
        (0..n).map(|i| SessionRecord::new(format!("s-{i}"))).collect()
    }

    #[test]
    fn test_partition_sizes_and_numbering() {
        let batches = partition(records(120), 50, "m1");
        let sizes: Vec<usize> = batches.iter().map(UploadBatch::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        for (index, batch) in batches.iter().enumerate() {
            assert_eq!(batch.batch, index + 1);
            assert_eq!(batch.total_batches, 3);
            assert_eq!(batch.machine_id, "m1");
        }
    }

    #[test]
    fn test_partition_preserves_order() {
        for chunk_size in [1, 3, 7, 10, 11] {
            let input = records(10);
            let rebuilt: Vec<SessionRecord> = partition(input.clone(), chunk_size, "m")
                .into_iter()
                .flat_map(|b| b.sessions)
                .collect();
            assert_eq!(rebuilt, input, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(partition(Vec::new(), 50, "m").is_empty());
        assert_eq!(partition(records(3), 0, "m").len(), 3);
        assert_eq!(partition(records(50), 50, "m").len(), 1);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let batch = &partition(records(2), 50, "m1")[0];
        let envelope = batch.encode(&PayloadCodec::new()).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();

        for key in [
            "timestamp",
            "version",
            "machine_id",
            "batch",
            "total_batches",
            "compressed",
            "encoding",
            "original_size",
            "compressed_size",
            "data",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["encoding"], "gzip+base64");

        let decoded: Vec<SessionRecord> = PayloadCodec::new().decode(&envelope.payload).unwrap();
        assert_eq!(decoded, batch.sessions);
    }
}
