//! Reflection-driven schema generation: metadata to serialization contract.

pub mod codec;
pub mod descriptor;
pub mod generate;

pub use codec::{decode_bytes, encode_bytes, Codec, CodecHandler, CodecRegistry};
pub use descriptor::{
    FieldDescriptor, RelationshipDescriptor, SchemaDescriptor, WriteMode,
};
pub use generate::SchemaGenerator;
