//! Identifier transformation chains.
//!
//! A chain is an ordered list of [`Adapter`] values: scalar rewriters map one
//! identifier string at a time, structural processors see the whole payload.
//! Ingest chains come from a subscription's [`AdapterSpec`] list, egress
//! chains from a consumer's [`IdPolicy`](crate::model::IdPolicy).

mod adapter;
mod processors;
mod registry;
mod scalar;

pub use adapter::{Adapter, ChainReport, ScalarFn, StructuralFn, TransformChain};
pub use processors::{apply_id_policy, ensure_increasing_times, operator_filter};
pub use registry::{AdapterSpec, TransformRegistry};
pub use scalar::{alias, prefix_codespace};
