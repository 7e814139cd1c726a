//! Partition Consumer
//!
//! Reads one log partition and turns each record into store mutations:
//!
//! ```text
//! poll ─→ envelope.open ─→ LogMessage::decode ─┬─ Store   ─→ rows ─→ WriteBuffer
//!            │                                 ├─ Delete  ─→ DeleteExecutor
//!            └─ MAC / decrypt failure:         └─ Archive ─→ unimplemented (fatal)
//!               count, drop, continue
//! ```
//!
//! Once a record is fully handled (or dropped) its offset is marked as
//! consumed in the buffer. Any other failure aborts the generation.

use std::sync::Arc;
use std::time::Duration;

use tidestore_core::{
    CryptoEnvelope, DatapointCodec, EnvelopeError, LogMessage, PendingWrite, RowKeyCodec,
    StorageSealer, StoreMessage,
};
use tidestore_observability::metrics;

use crate::abort::{AbortListener, AbortReason, AbortSignal};
use crate::buffer::WriteBuffer;
use crate::counters::OffsetCounters;
use crate::delete::DeleteExecutor;
use crate::error::{Result, StorageError};
use crate::log::{LogRecord, LogStream};

/// Shared, read-only pieces every consumer needs to decode records.
#[derive(Clone)]
pub struct MessageDecoder {
    pub envelope: Arc<CryptoEnvelope>,
    pub sealer: Arc<StorageSealer>,
    pub codec: Arc<dyn DatapointCodec>,
    pub rowkeys: RowKeyCodec,
}

pub struct PartitionConsumer {
    partition: u32,
    stream: Box<dyn LogStream>,
    buffer: Arc<WriteBuffer>,
    deletes: DeleteExecutor,
    decoder: MessageDecoder,
    counters: Arc<OffsetCounters>,
    abort: Arc<AbortSignal>,
    poll_timeout: Duration,
}

impl PartitionConsumer {
    pub fn new(
        stream: Box<dyn LogStream>,
        buffer: Arc<WriteBuffer>,
        deletes: DeleteExecutor,
        decoder: MessageDecoder,
        counters: Arc<OffsetCounters>,
        abort: Arc<AbortSignal>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            partition: stream.partition(),
            stream,
            buffer,
            deletes,
            decoder,
            counters,
            abort,
            poll_timeout,
        }
    }

    /// Consume until the generation aborts. Failures raise the abort signal.
    pub async fn run(mut self) {
        let mut abort = self.abort.listener();
        if let Err(e) = self.run_loop(&mut abort).await {
            if !matches!(e, StorageError::Interrupted) {
                tracing::error!(partition = self.partition, error = %e, "Partition consumer failed");
            }
            self.abort.abort(AbortReason::worker(self.partition, &e));
        }
        tracing::debug!(partition = self.partition, "Partition consumer stopped");
    }

    async fn run_loop(&mut self, abort: &mut AbortListener) -> Result<()> {
        let label = self.partition.to_string();

        loop {
            let polled = tokio::select! {
                _ = abort.aborted() => return Ok(()),
                polled = self.stream.poll(self.poll_timeout) => polled?,
            };
            let Some(record) = polled else {
                continue;
            };

            self.counters
                .count(self.partition, record.offset, record.high_watermark);
            metrics::MESSAGES_CONSUMED_TOTAL
                .with_label_values(&[&label])
                .inc();
            metrics::BYTES_CONSUMED_TOTAL
                .with_label_values(&[&label])
                .inc_by(record.payload.len() as u64);

            let offset = record.offset;
            self.handle_record(record, abort).await?;
            self.buffer.mark_consumed(offset, abort).await?;
        }
    }

    async fn handle_record(&self, record: LogRecord, abort: &mut AbortListener) -> Result<()> {
        let payload = match self.decoder.envelope.open(record.payload) {
            Ok(payload) => payload,
            Err(e) => {
                match e {
                    EnvelopeError::AuthFailure => metrics::FAILED_MACS_TOTAL.inc(),
                    _ => metrics::FAILED_DECRYPTS_TOTAL.inc(),
                }
                tracing::warn!(
                    partition = self.partition,
                    offset = record.offset,
                    error = %e,
                    "Dropping log message"
                );
                return Ok(());
            }
        };

        match LogMessage::decode(&payload)? {
            LogMessage::Store(store) => self.handle_store(&store, abort).await,
            LogMessage::Delete(delete) => {
                self.deletes.execute(&delete, abort).await?;
                Ok(())
            }
            LogMessage::Archive(_) => Err(StorageError::Unimplemented("archive")),
        }
    }

    async fn handle_store(&self, message: &StoreMessage, abort: &mut AbortListener) -> Result<()> {
        if message.data.is_empty() {
            return Ok(());
        }

        let points = self.decoder.codec.decode_block(&message.data)?;
        metrics::BLOCKS_DECODED_TOTAL.inc();

        for point in &points {
            let row = self
                .decoder
                .rowkeys
                .encode(message.class_id, message.labels_id, point.timestamp);
            let value = self.decoder.sealer.seal(&row, point, self.decoder.codec.as_ref())?;
            self.buffer.append(PendingWrite::new(row, value), abort).await?;
        }
        metrics::DATAPOINTS_BUFFERED_TOTAL.inc_by(points.len() as u64);

        Ok(())
    }
}
