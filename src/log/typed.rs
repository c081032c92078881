//! Schema-validated record log.
//!
//! [`TypedLog`] wraps a [`JsonlEngine`](super::engine::JsonlEngine) with a
//! serde-typed record shape. Writes serialize through the type; reads
//! deserialize and silently skip any line that fails to parse, so corruption
//! in one record never blocks access to later records in the same stream.

use crate::error::{HindsightError, Result};
use crate::log::engine::{JsonlEngine, MessagePointer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A record decoded from the log together with its pointer.
#[derive(Debug, Clone)]
pub struct TypedRecord<T> {
    pub pointer: MessagePointer,
    pub record: T,
}

pub struct TypedLog<T> {
    engine: Arc<JsonlEngine>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(engine: Arc<JsonlEngine>) -> Self {
        Self {
            engine,
            _marker: PhantomData,
        }
    }

    /// Serialize and append one record.
    pub fn append(&self, stream_path: &str, record: &T) -> Result<MessagePointer> {
        let bytes = serde_json::to_vec(record)?;
        self.engine.append(stream_path, &bytes)
    }

    /// Read records after the given cursor, skipping unparseable lines.
    ///
    /// Only when every stored record fails to decode does the read surface a
    /// [`HindsightError::Corruption`]; a partly readable stream is served.
    pub fn read(
        &self,
        stream_path: &str,
        after: Option<(u64, u64)>,
        limit: Option<usize>,
    ) -> Result<Vec<TypedRecord<T>>> {
        let raw = self.engine.read_after(stream_path, after, limit)?;
        let total = raw.len();
        let mut out = Vec::with_capacity(total);
        for stored in raw {
            match serde_json::from_slice::<T>(&stored.bytes) {
                Ok(record) => out.push(TypedRecord {
                    pointer: stored.pointer,
                    record,
                }),
                Err(e) => {
                    tracing::warn!(
                        stream = stream_path,
                        offset = %stored.pointer.offset(),
                        error = %e,
                        "skipping unparseable record"
                    );
                }
            }
        }
        if out.is_empty() && total > 0 {
            return Err(HindsightError::Corruption(format!(
                "all {total} records in {stream_path} failed to decode"
            )));
        }
        Ok(out)
    }
}
