//! Conversion between [`Base`](speckle_model::Base) graphs and
//! content-addressed JSON fragments.
//!
//! [`BaseSerializer`] walks a graph depth first, writing one fragment per
//! detached object and one for the root. Each fragment id is the truncated
//! SHA-256 of its canonical body, so identical content always produces the
//! same id and is only emitted once per call.
//!
//! [`BaseDeserializer`] goes the other way. A single fragment is decoded with
//! [`BaseDeserializer::decode_step`], which reports the references it is still
//! waiting on; [`BaseDeserializer::deserialize`] drives that over a whole
//! [`FragmentSet`] in dependency order. Concurrent decoders share a
//! [`DecodeCache`] instead.

pub mod cache;
pub mod deserializer;
pub mod error;
pub mod plan;
pub mod resolve;
pub mod serializer;
pub mod sink;

pub use cache::DecodeCache;
pub use deserializer::{
    BaseDeserializer, DecodeLookup, DecodeStep, DeserializerOptions, MissingReferencePolicy, NoReferences, RefState,
};
pub use error::{DeserializeError, DeserializeResult, SerializeError, SerializeResult};
pub use plan::{FragmentMap, FragmentSet};
pub use resolve::{FnSource, FragmentSource};
pub use serializer::{BaseSerializer, BlobRef, SerializeSummary, SerializedGraph, SerializerOptions};
pub use sink::{FnSink, FragmentSink};
