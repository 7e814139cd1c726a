//! Core types for the tidestore ingest path: log message and datapoint wire
//! formats, row key encoding, and the crypto envelope.

pub mod crypto;
pub mod datapoint;
pub mod error;
pub mod keys;
pub mod message;
pub mod rowkey;
pub mod varint;
pub mod write;

pub use crypto::{CryptoEnvelope, EnvelopeError, StorageSealer};
pub use datapoint::{Datapoint, DatapointCodec, Value, VarintBlockCodec};
pub use error::{CoreError, Result};
pub use keys::{KeyKind, KeyProvider, StaticKeyProvider};
pub use message::{ArchiveMessage, DeleteMessage, LogMessage, SeriesMetadata, StoreMessage};
pub use rowkey::{RowKey, RowKeyCodec, ScanRange};
pub use write::PendingWrite;
