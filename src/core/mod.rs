// Core modules implementing the schema engine, record interpreter, and lifecycle tracking.
pub mod error;
pub mod expr;
pub mod interp;
pub mod io;
pub mod lifecycle;
pub mod plan;
pub mod record;
pub mod schema;
