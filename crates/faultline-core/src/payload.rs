// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Experiment payloads.
//!
//! The coordinator never looks inside a payload. It only needs to turn one
//! into bytes for the wire and back, which is what [`Serializable`] captures.
//! Protobuf records get an implementation for free; serde records can be
//! wrapped in [`Json`].

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::job::WorkloadId;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Bytes did not form a valid protobuf record.
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Capability to cross the wire as an opaque byte sequence.
pub trait Serializable: Send + Sync + Sized + 'static {
    /// Encode into wire bytes.
    fn encode(&self) -> Result<Bytes, PayloadError>;

    /// Decode from wire bytes.
    fn decode(bytes: &[u8]) -> Result<Self, PayloadError>;
}

impl<M> Serializable for M
where
    M: prost::Message + Default + 'static,
{
    fn encode(&self) -> Result<Bytes, PayloadError> {
        Ok(Bytes::from(self.encode_to_vec()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(<M as prost::Message>::decode(bytes)?)
    }
}

/// Serde-backed payload encoded as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Serializable for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Bytes, PayloadError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }
}

/// An experiment payload tagged with its workload id.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentData<P> {
    /// Id assigned when the experiment was enqueued.
    pub workload_id: WorkloadId,
    /// Researcher-defined experiment record.
    pub data: P,
}

impl<P> ExperimentData<P> {
    /// Tag `data` with `workload_id`.
    pub fn new(workload_id: WorkloadId, data: P) -> Self {
        Self { workload_id, data }
    }
}
