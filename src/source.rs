use std::collections::VecDeque;
use std::io::BufRead;

use serde::Deserialize;

use crate::model::{OperationType, Record, RecordAttributes, RecordType, WriteBatch};
use crate::store::{Result, StoreError};

/// A pluggable source of record batches: "give me the next up-to-N records
/// and an operation tag". One implementation per import format; the write
/// pipeline is oblivious to format specifics. An empty batch means the
/// source is exhausted.
pub trait RecordSource {
    fn next_batch(&mut self, max_records: usize) -> Result<WriteBatch>;
}

/// One line of a line-delimited JSON stream.
#[derive(Debug, Deserialize)]
struct RecordLine {
    #[serde(default)]
    operation: OperationType,
    id: String,
    #[serde(rename = "type")]
    record_type: Option<RecordType>,
    #[serde(default)]
    attributes: RecordAttributes,
}

/// Line-delimited JSON record source. Each line is one record with an
/// operation tag:
///
/// ```text
/// {"operation": "upsert", "id": "s1", "type": "sample", "attributes": {"x": 1}}
/// {"operation": "delete", "id": "s2", "type": "sample"}
/// ```
///
/// Consecutive records with the same operation are grouped into one batch,
/// up to the batch size; an operation change ends the batch early so every
/// batch carries a single tag.
pub struct JsonLinesSource<R: BufRead> {
    reader: R,
    line_number: usize,
    default_type: Option<RecordType>,
    pending: Option<(OperationType, Record)>,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R, default_type: Option<RecordType>) -> Self {
        Self {
            reader,
            line_number: 0,
            default_type,
            pending: None,
        }
    }

    fn read_record(&mut self) -> Result<Option<(OperationType, Record)>> {
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).map_err(|e| {
                StoreError::InvalidRecordStream {
                    reason: e.to_string(),
                }
            })?;
            if read == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            let parsed: RecordLine = serde_json::from_str(&line).map_err(|e| {
                StoreError::InvalidRecordStream {
                    reason: format!("line {}: {e}", self.line_number),
                }
            })?;
            let record_type = parsed
                .record_type
                .or_else(|| self.default_type.clone())
                .ok_or_else(|| StoreError::InvalidRecordStream {
                    reason: format!(
                        "line {}: no record type given and no default set",
                        self.line_number
                    ),
                })?;

            return Ok(Some((
                parsed.operation,
                Record {
                    id: parsed.id,
                    record_type,
                    attributes: parsed.attributes,
                },
            )));
        }
    }
}

impl<R: BufRead> RecordSource for JsonLinesSource<R> {
    fn next_batch(&mut self, max_records: usize) -> Result<WriteBatch> {
        let mut batch = WriteBatch::empty();

        while batch.records.len() < max_records {
            let (operation, record) = match self.pending.take() {
                Some(pending) => pending,
                None => match self.read_record()? {
                    Some(next) => next,
                    None => break,
                },
            };

            if batch.records.is_empty() {
                batch.operation = operation;
            } else if batch.operation != operation {
                // operation changed: push back and end the batch
                self.pending = Some((operation, record));
                break;
            }
            batch.records.push(record);
        }

        Ok(batch)
    }
}

/// In-memory record source, mainly for tests and programmatic writes.
/// Kept out of `#[cfg(test)]` so integration tests can use it.
pub struct VecSource {
    batches: VecDeque<WriteBatch>,
}

impl VecSource {
    pub fn new(batches: Vec<WriteBatch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    pub fn upserts(records: Vec<Record>) -> Self {
        Self::new(vec![WriteBatch {
            operation: OperationType::Upsert,
            records,
        }])
    }
}

impl RecordSource for VecSource {
    fn next_batch(&mut self, _max_records: usize) -> Result<WriteBatch> {
        Ok(self.batches.pop_front().unwrap_or_else(WriteBatch::empty))
    }
}
