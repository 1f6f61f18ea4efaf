//! Purpose: C ABI bridge for bindings (libtrecore).
//! Exports: C-callable engine/schema/record/handle functions and buffer/error helpers.
//! Role: Stable ABI surface for non-Rust bindings.
//! Invariants: JSON or raw bytes in/out; opaque engine pointer; explicit free functions.
//! Invariants: Record and field handles are manager identities; 0 is never valid.
//! Invariants: Error kinds map 1:1 with core error kinds.
#![allow(clippy::result_large_err)]

use crate::api::{
    Engine, Error, ErrorKind, Identity, ManagedField, ParseOptions, SchemaRegistry, field_json,
    record_from_json, record_json,
};
use serde_json::{Value, json};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::ptr;

/// Bit 0 of `tre_record_parse` flags: reject trailing bytes.
pub const TRE_PARSE_STRICT: u32 = 1;

#[repr(C)]
pub struct tre_engine {
    engine: Engine,
}

#[repr(C)]
pub struct tre_buf {
    data: *mut u8,
    len: usize,
}

#[repr(C)]
pub struct tre_error {
    kind: i32,
    message: *mut c_char,
    tag: *mut c_char,
    offset: u64,
    has_offset: u8,
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_engine_new(
    schema_dir: *const c_char,
    out_engine: *mut *mut tre_engine,
    out_err: *mut *mut tre_error,
) -> i32 {
    if out_engine.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_engine is null"),
        );
    }
    let mut registry = SchemaRegistry::new();
    if !schema_dir.is_null() {
        match read_str(schema_dir, "schema_dir") {
            Ok(dir) => registry = registry.with_schema_dir(PathBuf::from(dir)),
            Err(err) => return fail(out_err, err),
        }
    }
    let handle = Box::new(tre_engine {
        engine: Engine::new().with_registry(registry),
    });
    unsafe {
        *out_engine = Box::into_raw(handle);
    }
    0
}

/// Shuts the engine's manager down, then frees the engine.
#[unsafe(no_mangle)]
pub extern "C" fn tre_engine_free(engine: *mut tre_engine) {
    if engine.is_null() {
        return;
    }
    unsafe {
        let engine = Box::from_raw(engine);
        engine.engine.shutdown();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_engine_shutdown(engine: *mut tre_engine) {
    if engine.is_null() {
        return;
    }
    unsafe { &*engine }.engine.shutdown();
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_schema_register_json(
    engine: *mut tre_engine,
    json_bytes: *const u8,
    json_len: usize,
    default_tag: *const c_char,
    out_info: *mut tre_buf,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let text = match read_utf8(json_bytes, json_len, "json_bytes") {
        Ok(text) => text,
        Err(err) => return fail(out_err, err),
    };
    let default_tag = if default_tag.is_null() {
        None
    } else {
        match read_str(default_tag, "default_tag") {
            Ok(tag) => Some(tag),
            Err(err) => return fail(out_err, err),
        }
    };
    let schema = match engine.engine.register_schema_json(text, default_tag) {
        Ok(schema) => schema,
        Err(err) => return fail(out_err, err),
    };
    if out_info.is_null() {
        return 0;
    }
    let info = json!({
        "tag": schema.tag(),
        "fingerprint": schema.fingerprint(),
        "min_len": schema.min_len(),
    });
    match write_json_buf(out_info, &info) {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_record_parse(
    engine: *mut tre_engine,
    tag: *const c_char,
    bytes: *const u8,
    len: usize,
    flags: u32,
    out_handle: *mut u64,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let tag = match read_str(tag, "tag") {
        Ok(tag) => tag,
        Err(err) => return fail(out_err, err),
    };
    if bytes.is_null() && len != 0 {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("bytes is null"),
        );
    }
    if out_handle.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_handle is null"),
        );
    }
    let slice: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(bytes, len) }
    };
    let options = ParseOptions {
        declared_len: None,
        strict: flags & TRE_PARSE_STRICT != 0,
    };
    match engine.engine.parse_record(tag, slice, options) {
        Ok(handle) => {
            unsafe {
                *out_handle = handle.into_identity().value();
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_record_from_json(
    engine: *mut tre_engine,
    json_bytes: *const u8,
    json_len: usize,
    out_handle: *mut u64,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    if out_handle.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_handle is null"),
        );
    }
    let value = match parse_json_bytes(json_bytes, json_len) {
        Ok(value) => value,
        Err(err) => return fail(out_err, err),
    };
    let handle = record_from_json(&value).and_then(|record| engine.engine.adopt_record(record));
    match handle {
        Ok(handle) => {
            unsafe {
                *out_handle = handle.into_identity().value();
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_record_serialize(
    engine: *mut tre_engine,
    handle: u64,
    out_buf: *mut tre_buf,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let result = identity(handle)
        .and_then(|id| engine.engine.serialize(id))
        .and_then(|bytes| write_buf(out_buf, bytes));
    match result {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_record_json(
    engine: *mut tre_engine,
    handle: u64,
    out_buf: *mut tre_buf,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let result = identity(handle)
        .and_then(|id| engine.engine.record(id))
        .and_then(|managed| write_json_buf(out_buf, &record_json(managed.record())));
    match result {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_record_query_json(
    engine: *mut tre_engine,
    handle: u64,
    tag: *const c_char,
    out_buf: *mut tre_buf,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let tag = match read_str(tag, "tag") {
        Ok(tag) => tag,
        Err(err) => return fail(out_err, err),
    };
    let result = identity(handle)
        .and_then(|id| engine.engine.query(id, tag))
        .and_then(|hits| {
            let values: Vec<Value> = hits.iter().map(field_json).collect();
            write_json_buf(out_buf, &Value::Array(values))
        });
    match result {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

/// Hands out a field handle owned by its record.
#[unsafe(no_mangle)]
pub extern "C" fn tre_record_field(
    engine: *mut tre_engine,
    handle: u64,
    tag: *const c_char,
    out_handle: *mut u64,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let tag = match read_str(tag, "tag") {
        Ok(tag) => tag,
        Err(err) => return fail(out_err, err),
    };
    if out_handle.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_handle is null"),
        );
    }
    match identity(handle).and_then(|id| engine.engine.field(id, tag)) {
        Ok(field) => {
            unsafe {
                *out_handle = field.into_identity().value();
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_field_json(
    engine: *mut tre_engine,
    handle: u64,
    out_buf: *mut tre_buf,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let result = identity(handle)
        .and_then(|id| {
            engine
                .engine
                .manager()
                .get::<ManagedField>(id)
        })
        .and_then(|field| write_json_buf(out_buf, &field_json(&field.value)));
    match result {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_handle_retain(
    engine: *mut tre_engine,
    handle: u64,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    match identity(handle).and_then(|id| engine.engine.retain(id)) {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

/// Returns 1 when this release tore the resource down, 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn tre_handle_release(
    engine: *mut tre_engine,
    handle: u64,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    match identity(handle).and_then(|id| engine.engine.release(id)) {
        Ok(torn_down) => i32::from(torn_down),
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_handle_set_external(
    engine: *mut tre_engine,
    handle: u64,
    external: u8,
    out_err: *mut *mut tre_error,
) -> i32 {
    let engine = match borrow_engine(engine, out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let result = identity(handle).and_then(|id| {
        engine
            .engine
            .manager()
            .set_externally_owned(id, external != 0)
    });
    match result {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_buf_free(buf: *mut tre_buf) {
    if buf.is_null() {
        return;
    }
    unsafe {
        let buf = &mut *buf;
        if !buf.data.is_null() && buf.len != 0 {
            drop(Vec::from_raw_parts(buf.data, buf.len, buf.len));
        }
        buf.data = ptr::null_mut();
        buf.len = 0;
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tre_error_free(err: *mut tre_error) {
    if err.is_null() {
        return;
    }
    unsafe {
        let err = Box::from_raw(err);
        if !err.message.is_null() {
            drop(CString::from_raw(err.message));
        }
        if !err.tag.is_null() {
            drop(CString::from_raw(err.tag));
        }
    }
}

fn borrow_engine<'a>(
    engine: *mut tre_engine,
    out_err: *mut *mut tre_error,
) -> Result<&'a tre_engine, i32> {
    if engine.is_null() {
        return Err(fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("engine is null"),
        ));
    }
    unsafe { Ok(&*engine) }
}

fn identity(handle: u64) -> Result<Identity, Error> {
    if handle == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("handle 0 is never valid"));
    }
    Ok(Identity::new(handle))
}

fn read_str<'a>(input: *const c_char, what: &str) -> Result<&'a str, Error> {
    if input.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(input) }
        .to_str()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message(format!("{what} is not valid UTF-8")))
}

fn read_utf8<'a>(bytes: *const u8, len: usize, what: &str) -> Result<&'a str, Error> {
    if bytes.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{what} is null")));
    }
    let slice = unsafe { std::slice::from_raw_parts(bytes, len) };
    std::str::from_utf8(slice).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{what} is not valid UTF-8"))
            .with_source(err)
    })
}

fn parse_json_bytes(bytes: *const u8, len: usize) -> Result<Value, Error> {
    let text = read_utf8(bytes, len, "json_bytes")?;
    serde_json::from_str(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_source(err)
    })
}

fn write_json_buf(out_buf: *mut tre_buf, value: &Value) -> Result<(), Error> {
    let bytes = serde_json::to_vec(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to serialize json")
            .with_source(err)
    })?;
    write_buf(out_buf, bytes)
}

fn write_buf(out_buf: *mut tre_buf, bytes: Vec<u8>) -> Result<(), Error> {
    if out_buf.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message("out_buf is null"));
    }
    unsafe {
        let buf = &mut *out_buf;
        let mut data = bytes.into_boxed_slice();
        buf.len = data.len();
        buf.data = if data.is_empty() {
            ptr::null_mut()
        } else {
            data.as_mut_ptr()
        };
        std::mem::forget(data);
    }
    Ok(())
}

fn fail(out_err: *mut *mut tre_error, err: Error) -> i32 {
    if out_err.is_null() {
        return -1;
    }
    let error = Box::new(tre_error {
        kind: error_kind_code(err.kind()),
        message: to_c_string(err.message().unwrap_or("")),
        tag: err.tag().map(to_c_string).unwrap_or(ptr::null_mut()),
        offset: err.offset().unwrap_or(0),
        has_offset: u8::from(err.offset().is_some()),
    });
    unsafe {
        *out_err = Box::into_raw(error);
    }
    -1
}

fn to_c_string(input: &str) -> *mut c_char {
    CString::new(input)
        .map(|s| s.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn error_kind_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Io => 4,
        ErrorKind::Unbalanced => 10,
        ErrorKind::DuplicateTag => 11,
        ErrorKind::ForwardReference => 12,
        ErrorKind::MisplacedMarker => 13,
        ErrorKind::InvalidExpression => 14,
        ErrorKind::UnknownTag => 20,
        ErrorKind::TypeMismatch => 21,
        ErrorKind::Truncated => 30,
        ErrorKind::LengthMismatch => 31,
        ErrorKind::TrailingData => 32,
        ErrorKind::MissingField => 33,
        ErrorKind::Released => 40,
    }
}
