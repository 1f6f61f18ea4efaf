//! Purpose: Define the public Rust API boundary for the record engine.
//! Exports: Engine, registry, schema source, and the core types bindings need.
//! Role: Public, additive-only surface shared by the CLI, the C ABI, and tests.
//! Invariants: Records leave this layer only as managed handles or owned copies.
//! Invariants: Schema lookup by name follows the same rules as the CLI.

mod engine;
mod registry;
mod source;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorClass, ErrorKind};
pub use crate::core::interp::ParseOptions;
pub use crate::core::io::{ByteSink, ByteSource, ReadSource, SliceSource, WriteSink};
pub use crate::core::lifecycle::{
    Identity, Manager, OpenHandle, ProxyHandle, ShutdownGuard, TeardownFn, WeakManager,
};
pub use crate::core::record::{DataKind, FieldValue, Number, Record};
pub use crate::core::schema::{Count, DescriptorKind, FieldDescriptor, Schema, compile};
pub use engine::{
    Engine, FieldHandle, ManagedField, ManagedRecord, RecordHandle, field_json, record_from_json,
    record_json,
};
pub use registry::{SchemaRef, SchemaRegistry};
pub use source::{CountSource, DescriptorSource, SchemaSource, parse_schema_json};
