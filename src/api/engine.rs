//! Purpose: Engine tying the schema registry, interpreter, and lifecycle manager together.
//! Exports: `Engine`, `ManagedRecord`, `ManagedField`, `RecordHandle`, `FieldHandle`,
//! `record_json`, `record_from_json`.
//! Role: Every record produced here is a managed resource released through the manager.
//! Invariants: Field handles are owned by their record and become stale when it is torn down.
//! Invariants: JSON views round-trip through `record_from_json` for well-formed records.
//! Invariants: Adopted records are normalized to their schema widths before they are managed.
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::registry::{SchemaRef, SchemaRegistry};
use crate::core::error::{Error, ErrorKind};
use crate::core::interp::{self, ParseOptions};
use crate::core::io::{ByteSource, SliceSource};
use crate::core::lifecycle::{Identity, Manager, ProxyHandle};
use crate::core::plan;
use crate::core::record::{DataKind, FieldValue, Number, Record};
use crate::core::schema::Schema;

/// Payload stored for a record identity.
#[derive(Debug)]
pub struct ManagedRecord {
    schema: Arc<Schema>,
    record: Record,
    /// `None` once the record has been torn down.
    children: Arc<Mutex<Option<Vec<Identity>>>>,
}

impl ManagedRecord {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

/// Payload stored for a field identity.
#[derive(Debug)]
pub struct ManagedField {
    pub record: Identity,
    pub value: FieldValue,
}

#[derive(Debug)]
pub struct RecordHandle {
    proxy: ProxyHandle,
}

impl RecordHandle {
    pub fn identity(&self) -> Identity {
        self.proxy.identity()
    }

    pub fn get(&self) -> Result<Arc<ManagedRecord>, Error> {
        self.proxy.get::<ManagedRecord>()
    }

    pub fn try_clone(&self) -> Result<RecordHandle, Error> {
        Ok(Self {
            proxy: self.proxy.try_clone()?,
        })
    }

    pub fn release(self) -> Result<bool, Error> {
        self.proxy.release()
    }

    pub fn into_identity(self) -> Identity {
        self.proxy.into_identity()
    }
}

#[derive(Debug)]
pub struct FieldHandle {
    proxy: ProxyHandle,
}

impl FieldHandle {
    pub fn identity(&self) -> Identity {
        self.proxy.identity()
    }

    pub fn get(&self) -> Result<Arc<ManagedField>, Error> {
        self.proxy.get::<ManagedField>()
    }

    pub fn release(self) -> Result<bool, Error> {
        self.proxy.release()
    }

    pub fn into_identity(self) -> Identity {
        self.proxy.into_identity()
    }
}

#[derive(Debug, Default)]
pub struct Engine {
    manager: Manager,
    registry: SchemaRegistry,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manager(mut self, manager: Manager) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn register_schema_json(
        &self,
        text: &str,
        default_tag: Option<&str>,
    ) -> Result<Arc<Schema>, Error> {
        self.registry.register_json(text, default_tag)
    }

    pub fn load_schema(&self, schema_ref: &SchemaRef) -> Result<Arc<Schema>, Error> {
        self.registry.load(schema_ref)
    }

    pub fn parse_record(
        &self,
        tag: &str,
        bytes: &[u8],
        options: ParseOptions,
    ) -> Result<RecordHandle, Error> {
        let mut source = SliceSource::new(bytes);
        self.parse_from(tag, &mut source, options)
    }

    pub fn parse_from(
        &self,
        tag: &str,
        source: &mut dyn ByteSource,
        options: ParseOptions,
    ) -> Result<RecordHandle, Error> {
        let schema = self.registry.resolve(tag)?;
        let record = interp::parse(&schema, source, options)?;
        self.manage_record(schema, record)
    }

    /// Explicit construction: manages a caller-built record under its registered schema.
    pub fn adopt_record(&self, record: Record) -> Result<RecordHandle, Error> {
        let schema = self.registry.resolve(record.tag())?;
        let record = match plan::normalize(&schema, &record) {
            Ok(normalized) => normalized,
            Err(err) => {
                tracing::debug!(tre = schema.tag(), error = %err, "adopting record as given");
                record
            }
        };
        self.manage_record(schema, record)
    }

    fn manage_record(&self, schema: Arc<Schema>, record: Record) -> Result<RecordHandle, Error> {
        let children = Arc::new(Mutex::new(Some(Vec::new())));
        let weak = self.manager.downgrade();
        let owned = Arc::clone(&children);
        let proxy = self.manager.manage_with(
            ManagedRecord {
                schema,
                record,
                children,
            },
            move || {
                let Some(manager) = weak.upgrade() else {
                    return Ok(());
                };
                let children = owned.lock().unwrap_or_else(PoisonError::into_inner).take();
                for child in children.into_iter().flatten() {
                    manager.destroy(child)?;
                }
                Ok(())
            },
        )?;
        Ok(RecordHandle { proxy })
    }

    pub fn record(&self, identity: Identity) -> Result<Arc<ManagedRecord>, Error> {
        self.manager.get::<ManagedRecord>(identity)
    }

    pub fn serialize(&self, identity: Identity) -> Result<Vec<u8>, Error> {
        let managed = self.record(identity)?;
        plan::serialize(&managed.schema, &managed.record)
    }

    pub fn validate(&self, identity: Identity) -> Result<bool, Error> {
        let managed = self.record(identity)?;
        Ok(plan::validate(&managed.record, &managed.schema))
    }

    pub fn query(&self, identity: Identity, tag: &str) -> Result<Vec<FieldValue>, Error> {
        let managed = self.record(identity)?;
        Ok(managed.record.query(tag).into_iter().cloned().collect())
    }

    /// A handle to one field, owned by its record.
    pub fn field(&self, identity: Identity, tag: &str) -> Result<FieldHandle, Error> {
        let managed = self.record(identity)?;
        let value = managed.record.get(tag).cloned().ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("record has no field with this qualified tag")
                .with_tag(tag.to_string())
        })?;
        let proxy = self.manager.manage(ManagedField {
            record: identity,
            value,
        })?;
        self.manager.set_externally_owned(proxy.identity(), true)?;
        self.attach_child(&managed, identity, proxy.identity())?;
        Ok(FieldHandle { proxy })
    }

    /// Hands `child` to the record for teardown, or destroys it if the record is gone.
    fn attach_child(
        &self,
        managed: &ManagedRecord,
        record: Identity,
        child: Identity,
    ) -> Result<(), Error> {
        let mut children = managed.children.lock().unwrap_or_else(PoisonError::into_inner);
        match children.as_mut() {
            Some(children) => {
                children.push(child);
                Ok(())
            }
            None => {
                drop(children);
                self.manager.destroy(child)?;
                Err(Error::new(ErrorKind::Released)
                    .with_message(format!("record {record} was torn down while taking a field")))
            }
        }
    }

    pub fn retain(&self, identity: Identity) -> Result<(), Error> {
        self.manager.register(identity).map(ProxyHandle::into_identity)?;
        Ok(())
    }

    pub fn release(&self, identity: Identity) -> Result<bool, Error> {
        self.manager.release_identity(identity)
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

/// JSON view of a record: decoded values, hex for binary.
pub fn record_json(record: &Record) -> Value {
    let fields: Vec<Value> = record.iter().map(field_json).collect();
    json!({
        "tag": record.tag(),
        "fields": fields,
    })
}

pub fn field_json(field: &FieldValue) -> Value {
    let mut out = Map::new();
    out.insert("tag".to_string(), json!(field.tag()));
    out.insert("kind".to_string(), json!(field.kind()));
    let value = match field.kind() {
        DataKind::Binary => json!(to_hex(field.raw())),
        DataKind::Text => match field.as_text() {
            Ok(text) => json!(text),
            Err(_) => {
                out.insert("raw".to_string(), json!(to_hex(field.raw())));
                Value::Null
            }
        },
        DataKind::Numeric => {
            let ascii = field.raw().iter().all(|byte| (0x20..=0x7e).contains(byte));
            if !ascii {
                out.insert("raw".to_string(), json!(to_hex(field.raw())));
            }
            match field.as_number() {
                Ok(Number::Int(value)) => json!(value),
                Ok(Number::Decimal(value)) => json!(value),
                Err(_) => match field.as_text() {
                    Ok(text) => json!(text),
                    Err(_) => Value::Null,
                },
            }
        }
    };
    out.insert("value".to_string(), value);
    Value::Object(out)
}

#[derive(Deserialize)]
struct RecordDoc {
    tag: String,
    fields: Vec<FieldDoc>,
}

#[derive(Deserialize)]
struct FieldDoc {
    tag: String,
    kind: DataKind,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    raw: Option<String>,
}

/// Inverse of `record_json`; a `raw` hex entry wins over `value`.
pub fn record_from_json(value: &Value) -> Result<Record, Error> {
    let doc = RecordDoc::deserialize(value).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("record JSON must be {\"tag\", \"fields\": [{\"tag\", \"kind\", \"value\"}]}")
            .with_hint(err.to_string())
            .with_source(err)
    })?;
    let mut record = Record::new(doc.tag);
    for field in doc.fields {
        let raw = match (&field.raw, field.kind, &field.value) {
            (Some(hex), _, _) => from_hex(hex).map_err(|err| err.with_tag(field.tag.clone()))?,
            (None, DataKind::Binary, Value::String(hex)) => {
                from_hex(hex).map_err(|err| err.with_tag(field.tag.clone()))?
            }
            (None, DataKind::Text | DataKind::Numeric, Value::String(text)) => {
                text.as_bytes().to_vec()
            }
            (None, DataKind::Text | DataKind::Numeric, Value::Number(number)) => {
                number.to_string().into_bytes()
            }
            (None, _, other) => {
                return Err(Error::new(ErrorKind::TypeMismatch)
                    .with_message(format!("cannot store {other} in a {:?} field", field.kind))
                    .with_tag(field.tag));
            }
        };
        record.insert(FieldValue::new(field.tag, field.kind, raw))?;
    }
    Ok(record)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn from_hex(hex: &str) -> Result<Vec<u8>, Error> {
    let invalid = || Error::new(ErrorKind::Usage).with_message("binary values must be even-length hex");
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(invalid());
    }
    (0..hex.len())
        .step_by(2)
        .map(|pos| u8::from_str_radix(&hex[pos..pos + 2], 16).map_err(|_| invalid()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{record_from_json, record_json, Engine, ManagedField};
    use crate::core::error::ErrorKind;
    use crate::core::interp::ParseOptions;
    use crate::core::record::{FieldValue, Record};
    use serde_json::json;

    const COUNTED: &str = r#"{"tag":"TEST","fields":[
        {"kind":"text","tag":"A","count":4},
        {"kind":"loop_start","ref":"A","expr":"*1"},
        {"kind":"numeric","tag":"B","count":2},
        {"kind":"loop_end"},
        {"kind":"end"}]}"#;

    fn engine() -> Engine {
        let engine = Engine::new();
        engine.register_schema_json(COUNTED, None).expect("schema");
        engine
    }

    #[test]
    fn parsed_records_are_managed() {
        let engine = engine();
        let handle = engine
            .parse_record("TEST", b"0002\x00\x01\x00\x02", ParseOptions::default())
            .expect("parse");
        let id = handle.identity();
        assert_eq!(engine.manager().proxy_count(id), Some(1));
        let hits = engine.query(id, "B").expect("query");
        assert_eq!(hits.len(), 2);
        assert_eq!(engine.serialize(id).expect("serialize"), b"0002\x00\x01\x00\x02");
        assert!(engine.validate(id).expect("validate"));
        assert!(handle.release().expect("release"));
        assert_eq!(engine.record(id).expect_err("gone").kind(), ErrorKind::Released);
    }

    #[test]
    fn unknown_tag_has_no_handler() {
        let engine = engine();
        let err = engine
            .parse_record("NOPE", b"", ParseOptions::default())
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn field_handles_die_with_their_record() {
        let engine = engine();
        let record = engine
            .parse_record("TEST", b"0001\x00\x09", ParseOptions::default())
            .expect("parse");
        let field = engine.field(record.identity(), "B[0]").expect("field");
        let field_id = field.identity();
        assert_eq!(field.get().expect("value").value.as_i64().expect("num"), 9);

        // Releasing the child proxy does not free what the record owns.
        let alias = engine.field(record.identity(), "A").expect("field A");
        assert!(!alias.release().expect("release child"));

        assert!(record.release().expect("release record"));
        assert_eq!(field.get().expect_err("stale").kind(), ErrorKind::Released);
        assert!(engine.manager().is_released(field_id));
        drop(field);
    }

    #[test]
    fn fields_cannot_attach_to_a_torn_down_record() {
        let engine = engine();
        let record = engine
            .parse_record("TEST", b"0001\x00\x09", ParseOptions::default())
            .expect("parse");
        let id = record.identity();
        let managed = record.get().expect("record");
        assert!(record.release().expect("release"));
        assert_eq!(engine.field(id, "A").expect_err("gone").kind(), ErrorKind::Released);

        let child = engine
            .manager()
            .manage(ManagedField {
                record: id,
                value: FieldValue::text("A", "0001"),
            })
            .expect("child")
            .into_identity();
        engine.manager().set_externally_owned(child, true).expect("claim");
        let err = engine.attach_child(&managed, id, child).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Released);
        assert!(engine.manager().is_released(child));
        assert_eq!(engine.manager().live_count(), 0);
    }

    #[test]
    fn adopted_records_round_trip_through_bytes() {
        let engine = engine();
        let record = Record::from_fields(
            "TEST",
            [
                FieldValue::text("A", "1"),
                FieldValue::numeric("B[0]", 7),
            ],
        )
        .expect("record");
        let handle = engine.adopt_record(record).expect("adopt");
        let id = handle.identity();
        assert!(engine.validate(id).expect("validate"));
        let bytes = engine.serialize(id).expect("serialize");
        assert_eq!(bytes, b"1   07");
        let parsed = engine
            .parse_record("TEST", &bytes, ParseOptions::default().strict())
            .expect("parse");
        assert_eq!(
            parsed.get().expect("parsed").record(),
            handle.get().expect("adopted").record()
        );
    }

    #[test]
    fn retain_and_release_by_identity() {
        let engine = engine();
        let id = engine
            .parse_record("TEST", b"0000", ParseOptions::default())
            .expect("parse")
            .into_identity();
        engine.retain(id).expect("retain");
        assert!(!engine.release(id).expect("first"));
        assert!(engine.release(id).expect("second"));
        assert!(!engine.release(id).expect("no-op"));
    }

    #[test]
    fn json_view_round_trips() {
        let engine = engine();
        let handle = engine
            .parse_record("TEST", b"0002\x00\x01\x00\x02", ParseOptions::default())
            .expect("parse");
        let managed = handle.get().expect("record");
        let view = record_json(managed.record());
        assert_eq!(view["fields"][0], json!({"tag": "A", "kind": "text", "value": "0002"}));
        assert_eq!(view["fields"][1]["value"], json!(1));
        assert_eq!(view["fields"][1]["raw"], json!("0001"));

        let rebuilt = record_from_json(&view).expect("rebuild");
        assert_eq!(&rebuilt, managed.record());
        let adopted = engine.adopt_record(rebuilt).expect("adopt");
        assert_eq!(
            engine.serialize(adopted.identity()).expect("serialize"),
            b"0002\x00\x01\x00\x02"
        );
    }

    #[test]
    fn record_json_rejects_bad_values() {
        let err = record_from_json(&json!({"tag": "T", "fields": [
            {"tag": "X", "kind": "binary", "value": "abc"}
        ]}))
        .expect_err("odd hex");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = record_from_json(&json!({"tag": "T", "fields": [
            {"tag": "X", "kind": "text", "value": [1]}
        ]}))
        .expect_err("array");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn shutdown_releases_everything() {
        let engine = engine();
        let _a = engine
            .parse_record("TEST", b"0000", ParseOptions::default())
            .expect("a");
        let _b = engine
            .parse_record("TEST", b"0000", ParseOptions::default())
            .expect("b");
        assert_eq!(engine.manager().live_count(), 2);
        engine.shutdown();
        assert_eq!(engine.manager().live_count(), 0);
        assert_eq!(
            engine
                .parse_record("TEST", b"0000", ParseOptions::default())
                .expect_err("after shutdown")
                .kind(),
            ErrorKind::Usage
        );
    }
}
