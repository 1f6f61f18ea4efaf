//! Purpose: Shared library crate used by the `tre` CLI, the C ABI, and tests.
//! Exports: `core` (schemas, interpreter, lifecycle, errors), `api` (engine surface), `abi`.
//! Role: Library backing the binary and the language bindings.
//! Invariants: `api` is the supported Rust surface; `core` stays usable on its own.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod abi;
pub mod api;
pub mod core;
mod schema_paths;
