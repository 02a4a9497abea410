//! Raw batch files: one JSON record per line

use bytes::Bytes;
use serde_json::Value;
use serde_jsonlines::{JsonLinesReader, JsonLinesWriter};

use crate::error::{IngestError, Result};

pub fn encode(records: &[Value]) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(records.len() * 256);
    let mut writer = JsonLinesWriter::new(&mut buf);
    writer.write_all(records)?;
    writer.flush()?;
    drop(writer);
    Ok(Bytes::from(buf))
}

/// Parse a raw file; a malformed line fails the whole file
pub fn decode(data: &[u8]) -> Result<Vec<Value>> {
    JsonLinesReader::new(data)
        .read_all::<Value>()
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| IngestError::Validation(format!("malformed JSON lines: {}", e)))
}
