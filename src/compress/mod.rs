//! Streaming zstd compressor for the multipart ingest body. Operations are
//! framed into multipart parts (`src/multipart.rs`) and written through a
//! zstd encoder as they're added to the current batch, so the uploader
//! never needs to buffer an uncompressed copy of the whole batch.
//!
//! Grounded on `CompressedTraces` (`original_source/.../_compressed_traces.py`):
//! same buffer/reset/uncompressed-size/context-list fields, re-expressed
//! against the `zstd` crate's streaming `Encoder` instead of
//! `python-zstandard`'s `stream_writer`.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{LangSmithError, Result};
use crate::models::operation::Operation;
use crate::multipart::{operation_to_parts, trace_context_header, Part};

const BOUNDARY: &str = "tracehook-batch-boundary";

struct Inner {
    encoder: zstd::stream::write::Encoder<'static, Vec<u8>>,
    contexts: Vec<String>,
    op_count: usize,
}

/// One batch's compressed bytes, ready for upload.
pub struct CompressedBatch {
    pub body: Vec<u8>,
    pub op_count: usize,
    pub trace_context_header: String,
}

pub struct Compressor {
    inner: Mutex<Inner>,
    uncompressed_size: AtomicU64,
    level: i32,
}

fn new_encoder(level: i32) -> Result<zstd::stream::write::Encoder<'static, Vec<u8>>> {
    zstd::stream::write::Encoder::new(Vec::new(), level)
        .map_err(|e| LangSmithError::Other(format!("failed to start zstd encoder: {e}")))
}

fn write_part(encoder: &mut zstd::stream::write::Encoder<'static, Vec<u8>>, part: &Part) -> Result<usize> {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{}\"\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        part.name, part.content_type, part.body.len()
    );
    encoder
        .write_all(header.as_bytes())
        .and_then(|_| encoder.write_all(&part.body))
        .and_then(|_| encoder.write_all(b"\r\n"))
        .map_err(|e| LangSmithError::Other(format!("zstd write failed: {e}")))?;
    Ok(header.len() + part.body.len() + 2)
}

impl Compressor {
    pub fn new(level: i32) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Inner {
                encoder: new_encoder(level)?,
                contexts: Vec::new(),
                op_count: 0,
            }),
            uncompressed_size: AtomicU64::new(0),
            level,
        })
    }

    /// Writes one operation's parts into the current batch. Returns the
    /// number of uncompressed bytes written, for the caller to add to the
    /// queue's byte-budget accounting.
    pub fn write_operation(&self, op: &Operation) -> Result<usize> {
        let parts_and_context = operation_to_parts(op);
        let mut inner = self.inner.lock();
        let mut written = 0;
        for part in &parts_and_context.parts {
            written += write_part(&mut inner.encoder, part)?;
        }
        inner.contexts.push(parts_and_context.context);
        inner.op_count += 1;
        self.uncompressed_size
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    /// Current uncompressed byte count written into the batch so far.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size.load(Ordering::Relaxed)
    }

    /// Current compressed size of the batch in progress, for checking
    /// against the server-advertised `batch_byte_limit` before adding more.
    pub fn compressed_size_so_far(&self) -> usize {
        self.inner.lock().encoder.get_ref().len()
    }

    pub fn op_count(&self) -> usize {
        self.inner.lock().op_count
    }

    /// Finalizes the batch: closes the final multipart boundary, finishes
    /// the zstd frame, and resets internal state for the next batch.
    pub fn finish_batch(&self) -> Result<CompressedBatch> {
        let mut inner = self.inner.lock();
        inner
            .encoder
            .write_all(format!("--{BOUNDARY}--\r\n").as_bytes())
            .map_err(|e| LangSmithError::Other(format!("zstd write failed: {e}")))?;

        let finished_encoder = std::mem::replace(&mut inner.encoder, new_encoder(self.level)?);
        let body = finished_encoder
            .finish()
            .map_err(|e| LangSmithError::Other(format!("zstd finish failed: {e}")))?;

        let batch = CompressedBatch {
            body,
            op_count: inner.op_count,
            trace_context_header: trace_context_header(&inner.contexts),
        };

        inner.contexts.clear();
        inner.op_count = 0;
        self.uncompressed_size.store(0, Ordering::Relaxed);

        Ok(batch)
    }
}

pub const MULTIPART_BOUNDARY: &str = BOUNDARY;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::run::RunType;
    use crate::models::Run;
    use crate::serialize::run_to_post_operation;
    use serde_json::json;

    #[test]
    fn finish_batch_resets_counters() {
        let compressor = Compressor::new(1).unwrap();
        let mut run = Run::new("root", RunType::Chain, json!({"a": 1}));
        run.ensure_root_identity();
        let op = run_to_post_operation(&run, false, false).unwrap();
        compressor.write_operation(&op).unwrap();
        assert!(compressor.uncompressed_size() > 0);
        assert_eq!(compressor.op_count(), 1);

        let batch = compressor.finish_batch().unwrap();
        assert_eq!(batch.op_count, 1);
        assert!(!batch.body.is_empty());
        assert_eq!(compressor.uncompressed_size(), 0);
        assert_eq!(compressor.op_count(), 0);
    }

    #[test]
    fn batch_body_is_valid_zstd() {
        let compressor = Compressor::new(1).unwrap();
        let mut run = Run::new("root", RunType::Chain, json!({}));
        run.ensure_root_identity();
        let op = run_to_post_operation(&run, false, false).unwrap();
        compressor.write_operation(&op).unwrap();
        let batch = compressor.finish_batch().unwrap();

        let decompressed = zstd::stream::decode_all(batch.body.as_slice()).unwrap();
        let text = String::from_utf8(decompressed).unwrap();
        assert!(text.contains(&format!("--{BOUNDARY}")));
        assert!(text.contains("Content-Disposition"));
    }
}
