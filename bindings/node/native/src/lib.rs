/*
Purpose: Provide a Node N-API binding over the libtrecore C ABI.
Key Exports: Engine, Record, ErrorKind.
Role: Node/TypeScript binding for schema registration and managed records.
Invariants: Calls into C ABI only; JSON or raw bytes in/out; explicit close/release methods.
Invariants: A Record keeps its engine allocation alive; Drop releases what close/release did not.
Invariants: Errors include stable kinds and context in message text.
*/

use libc::{c_char, c_int};
use napi::bindgen_prelude::{BigInt, Buffer, Status};
use napi::{Error, Result};
use napi_derive::napi;
use std::ffi::{CStr, CString};
use std::ptr;
use std::rc::Rc;

#[repr(C)]
struct tre_engine_t {
    _private: [u8; 0],
}

#[repr(C)]
struct tre_buf_t {
    data: *mut u8,
    len: usize,
}

#[repr(C)]
struct tre_error_t {
    kind: i32,
    message: *mut c_char,
    tag: *mut c_char,
    offset: u64,
    has_offset: u8,
}

const TRE_PARSE_STRICT: u32 = 1;

unsafe extern "C" {
    fn tre_engine_new(
        schema_dir: *const c_char,
        out_engine: *mut *mut tre_engine_t,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_engine_free(engine: *mut tre_engine_t);
    fn tre_engine_shutdown(engine: *mut tre_engine_t);

    fn tre_schema_register_json(
        engine: *mut tre_engine_t,
        json_bytes: *const u8,
        json_len: usize,
        default_tag: *const c_char,
        out_info: *mut tre_buf_t,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;

    fn tre_record_parse(
        engine: *mut tre_engine_t,
        tag: *const c_char,
        bytes: *const u8,
        len: usize,
        flags: u32,
        out_handle: *mut u64,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_record_from_json(
        engine: *mut tre_engine_t,
        json_bytes: *const u8,
        json_len: usize,
        out_handle: *mut u64,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_record_serialize(
        engine: *mut tre_engine_t,
        handle: u64,
        out_buf: *mut tre_buf_t,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_record_json(
        engine: *mut tre_engine_t,
        handle: u64,
        out_buf: *mut tre_buf_t,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_record_query_json(
        engine: *mut tre_engine_t,
        handle: u64,
        tag: *const c_char,
        out_buf: *mut tre_buf_t,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_record_field(
        engine: *mut tre_engine_t,
        handle: u64,
        tag: *const c_char,
        out_handle: *mut u64,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_field_json(
        engine: *mut tre_engine_t,
        handle: u64,
        out_buf: *mut tre_buf_t,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;

    fn tre_handle_retain(
        engine: *mut tre_engine_t,
        handle: u64,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;
    fn tre_handle_release(
        engine: *mut tre_engine_t,
        handle: u64,
        out_err: *mut *mut tre_error_t,
    ) -> c_int;

    fn tre_buf_free(buf: *mut tre_buf_t);
    fn tre_error_free(err: *mut tre_error_t);
}

#[napi]
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Internal = 1,
    Usage = 2,
    NotFound = 3,
    Io = 4,
    Unbalanced = 10,
    DuplicateTag = 11,
    ForwardReference = 12,
    MisplacedMarker = 13,
    InvalidExpression = 14,
    UnknownTag = 20,
    TypeMismatch = 21,
    Truncated = 30,
    LengthMismatch = 31,
    TrailingData = 32,
    MissingField = 33,
    Released = 40,
}

/// Owns the C engine; freed when the last JS object referencing it goes away.
struct EngineInner {
    ptr: *mut tre_engine_t,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { tre_engine_free(self.ptr) };
        }
    }
}

#[napi]
pub struct Engine {
    inner: Option<Rc<EngineInner>>,
}

#[napi]
impl Engine {
    #[napi(constructor)]
    pub fn new(schema_dir: Option<String>) -> Result<Self> {
        let schema_dir = schema_dir
            .map(|dir| {
                CString::new(dir)
                    .map_err(|_| Error::new(Status::InvalidArg, "schema_dir contains NUL"))
            })
            .transpose()?;
        let mut out = ptr::null_mut();
        let mut err = ptr::null_mut();
        let dir_ptr = schema_dir.as_ref().map_or(ptr::null(), |dir| dir.as_ptr());
        let rc = unsafe { tre_engine_new(dir_ptr, &mut out, &mut err) };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(Self {
            inner: Some(Rc::new(EngineInner { ptr: out })),
        })
    }

    /// Registers a schema document; returns `{tag, fingerprint, min_len}` as JSON bytes.
    #[napi]
    pub fn register_schema(&self, schema_json: Buffer, default_tag: Option<String>) -> Result<Buffer> {
        let inner = self.inner()?;
        let default_tag = default_tag
            .map(|tag| {
                CString::new(tag).map_err(|_| Error::new(Status::InvalidArg, "default_tag contains NUL"))
            })
            .transpose()?;
        let tag_ptr = default_tag.as_ref().map_or(ptr::null(), |tag| tag.as_ptr());
        let mut out = tre_buf_t { data: ptr::null_mut(), len: 0 };
        let mut err = ptr::null_mut();
        let rc = unsafe {
            tre_schema_register_json(
                inner.ptr,
                schema_json.as_ptr(),
                schema_json.len(),
                tag_ptr,
                &mut out,
                &mut err,
            )
        };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(copy_and_free_buf(out))
    }

    #[napi]
    pub fn parse(&self, tag: String, bytes: Buffer, strict: Option<bool>) -> Result<Record> {
        let inner = self.inner()?;
        let tag = CString::new(tag).map_err(|_| Error::new(Status::InvalidArg, "tag contains NUL"))?;
        let flags = if strict.unwrap_or(false) { TRE_PARSE_STRICT } else { 0 };
        let mut handle = 0u64;
        let mut err = ptr::null_mut();
        let rc = unsafe {
            tre_record_parse(
                inner.ptr,
                tag.as_ptr(),
                bytes.as_ptr(),
                bytes.len(),
                flags,
                &mut handle,
                &mut err,
            )
        };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(Record::new(Rc::clone(inner), handle))
    }

    #[napi]
    pub fn record_from_json(&self, record_json: Buffer) -> Result<Record> {
        let inner = self.inner()?;
        let mut handle = 0u64;
        let mut err = ptr::null_mut();
        let rc = unsafe {
            tre_record_from_json(
                inner.ptr,
                record_json.as_ptr(),
                record_json.len(),
                &mut handle,
                &mut err,
            )
        };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(Record::new(Rc::clone(inner), handle))
    }

    /// Releases every live record; the allocation goes once no Record refers to it.
    #[napi]
    pub fn close(&mut self) {
        if let Some(inner) = self.inner.take() {
            unsafe { tre_engine_shutdown(inner.ptr) };
        }
    }

    fn inner(&self) -> Result<&Rc<EngineInner>> {
        self.inner
            .as_ref()
            .ok_or_else(|| Error::new(Status::GenericFailure, "engine is closed"))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

#[napi]
pub struct Record {
    engine: Rc<EngineInner>,
    handle: u64,
}

impl Record {
    fn new(engine: Rc<EngineInner>, handle: u64) -> Self {
        Self { engine, handle }
    }

    fn live_handle(&self) -> Result<u64> {
        if self.handle == 0 {
            return Err(Error::new(Status::GenericFailure, "record is released"));
        }
        Ok(self.handle)
    }
}

#[napi]
impl Record {
    #[napi(getter)]
    pub fn handle(&self) -> BigInt {
        BigInt::from(self.handle)
    }

    #[napi]
    pub fn to_json(&self) -> Result<Buffer> {
        let handle = self.live_handle()?;
        let mut out = tre_buf_t { data: ptr::null_mut(), len: 0 };
        let mut err = ptr::null_mut();
        let rc = unsafe { tre_record_json(self.engine.ptr, handle, &mut out, &mut err) };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(copy_and_free_buf(out))
    }

    #[napi]
    pub fn serialize(&self) -> Result<Buffer> {
        let handle = self.live_handle()?;
        let mut out = tre_buf_t { data: ptr::null_mut(), len: 0 };
        let mut err = ptr::null_mut();
        let rc = unsafe { tre_record_serialize(self.engine.ptr, handle, &mut out, &mut err) };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(copy_and_free_buf(out))
    }

    /// Every field matching a qualified or base tag, as a JSON array.
    #[napi]
    pub fn query(&self, tag: String) -> Result<Buffer> {
        let handle = self.live_handle()?;
        let tag = CString::new(tag).map_err(|_| Error::new(Status::InvalidArg, "tag contains NUL"))?;
        let mut out = tre_buf_t { data: ptr::null_mut(), len: 0 };
        let mut err = ptr::null_mut();
        let rc = unsafe {
            tre_record_query_json(self.engine.ptr, handle, tag.as_ptr(), &mut out, &mut err)
        };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(copy_and_free_buf(out))
    }

    /// One field by qualified tag; the field handle stays owned by this record.
    #[napi]
    pub fn field(&self, tag: String) -> Result<Buffer> {
        let handle = self.live_handle()?;
        let tag = CString::new(tag).map_err(|_| Error::new(Status::InvalidArg, "tag contains NUL"))?;
        let mut field = 0u64;
        let mut err = ptr::null_mut();
        let rc = unsafe {
            tre_record_field(self.engine.ptr, handle, tag.as_ptr(), &mut field, &mut err)
        };
        if rc != 0 {
            return Err(take_error(err));
        }
        let mut out = tre_buf_t { data: ptr::null_mut(), len: 0 };
        let rc = unsafe { tre_field_json(self.engine.ptr, field, &mut out, &mut err) };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(copy_and_free_buf(out))
    }

    /// A second reference to the same managed record.
    #[napi]
    pub fn retain(&self) -> Result<Record> {
        let handle = self.live_handle()?;
        let mut err = ptr::null_mut();
        let rc = unsafe { tre_handle_retain(self.engine.ptr, handle, &mut err) };
        if rc != 0 {
            return Err(take_error(err));
        }
        Ok(Record::new(Rc::clone(&self.engine), handle))
    }

    /// Returns true when this release tore the record down.
    #[napi]
    pub fn release(&mut self) -> Result<bool> {
        if self.handle == 0 {
            return Ok(false);
        }
        let handle = std::mem::replace(&mut self.handle, 0);
        let mut err = ptr::null_mut();
        let rc = unsafe { tre_handle_release(self.engine.ptr, handle, &mut err) };
        match rc {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(take_error(err)),
        }
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn copy_and_free_buf(mut buf: tre_buf_t) -> Buffer {
    let data = if buf.data.is_null() || buf.len == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(buf.data, buf.len) }.to_vec()
    };
    unsafe { tre_buf_free(&mut buf) };
    Buffer::from(data)
}

fn take_error(err: *mut tre_error_t) -> Error {
    if err.is_null() {
        return Error::new(Status::GenericFailure, "trecore: unknown error");
    }
    let owned = unsafe { &*err };
    let mut message = unsafe { cstring_to_string(owned.message) };
    let tag = unsafe { cstring_to_string(owned.tag) };
    let mut details = Vec::new();
    let kind_label = error_kind_label(owned.kind);
    details.push(format!("kind={}", kind_label));
    if message.is_empty() {
        message = default_error_message(kind_label).to_string();
    }
    details.push(format!("message={}", message));
    if !tag.is_empty() {
        details.push(format!("tag={}", tag));
    }
    if owned.has_offset != 0 {
        details.push(format!("offset={}", owned.offset));
    }
    unsafe { tre_error_free(err) };
    Error::new(Status::GenericFailure, format!("trecore error: {}", details.join("; ")))
}

fn default_error_message(kind: &str) -> &'static str {
    match kind {
        "Usage" => "usage error",
        "NotFound" => "not found",
        "Io" => "io error",
        "Truncated" => "record is truncated",
        "TrailingData" => "trailing data",
        "Released" => "already released",
        _ => "error",
    }
}

fn error_kind_label(kind: i32) -> &'static str {
    match kind {
        2 => "Usage",
        3 => "NotFound",
        4 => "Io",
        10 => "Unbalanced",
        11 => "DuplicateTag",
        12 => "ForwardReference",
        13 => "MisplacedMarker",
        14 => "InvalidExpression",
        20 => "UnknownTag",
        21 => "TypeMismatch",
        30 => "Truncated",
        31 => "LengthMismatch",
        32 => "TrailingData",
        33 => "MissingField",
        40 => "Released",
        _ => "Internal",
    }
}

unsafe fn cstring_to_string(ptr: *mut c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string()
}
