//! Purpose: Field values, records, and qualified-tag addressing.
//! Exports: `DataKind`, `FieldValue`, `Number`, `Record`, `LoopFrame`, `qualify`, `base_tag`.
//! Role: The value table shared by parse (decode target), serialize (source of truth), and query.
//! Invariants: A qualified tag is unique within a `Record`; insertion order is preserved.
//! Invariants: Raw bytes are kept verbatim; decoding happens on demand.
use std::collections::HashMap;
use std::fmt;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::expr::ValueLookup;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Text,
    Numeric,
    Binary,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Decimal(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(value) => value as f64,
            Number::Decimal(value) => value,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct FieldValue {
    tag: String,
    kind: DataKind,
    raw: Vec<u8>,
}

impl FieldValue {
    pub fn new(tag: impl Into<String>, kind: DataKind, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: tag.into(),
            kind,
            raw: raw.into(),
        }
    }

    pub fn text(tag: impl Into<String>, value: &str) -> Self {
        Self::new(tag, DataKind::Text, value.as_bytes())
    }

    /// ASCII decimal; the serializer zero-pads it to the schema width.
    pub fn numeric(tag: impl Into<String>, value: i64) -> Self {
        Self::new(tag, DataKind::Numeric, value.to_string().into_bytes())
    }

    pub fn binary(tag: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, DataKind::Binary, bytes)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn base_tag(&self) -> &str {
        base_tag(&self.tag)
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    fn trimmed(&self) -> &[u8] {
        self.raw.trim_with(|c| c == ' ' || c == '\0')
    }

    /// True when nothing but padding is stored.
    pub fn is_blank(&self) -> bool {
        match self.kind {
            DataKind::Binary => self.raw.is_empty(),
            DataKind::Text | DataKind::Numeric => self.trimmed().is_empty(),
        }
    }

    pub fn as_text(&self) -> Result<&str, Error> {
        if self.kind == DataKind::Binary {
            return Err(self.mismatch("binary field has no text form"));
        }
        self.trimmed()
            .to_str()
            .map_err(|err| self.mismatch("field is not valid UTF-8").with_source(err))
    }

    pub fn as_number(&self) -> Result<Number, Error> {
        match self.kind {
            DataKind::Binary => self.be_uint().map(|value| Number::Int(value as i64)),
            DataKind::Numeric if !is_ascii_text(&self.raw) => {
                let value = self.be_uint()?;
                i64::try_from(value)
                    .map(Number::Int)
                    .map_err(|_| self.mismatch("binary numeric exceeds i64"))
            }
            DataKind::Text | DataKind::Numeric => {
                let text = self.as_text()?;
                if let Ok(value) = text.parse::<i64>() {
                    return Ok(Number::Int(value));
                }
                match text.parse::<f64>() {
                    Ok(value) if value.is_finite() => Ok(Number::Decimal(value)),
                    _ => Err(self.mismatch(format!("`{text}` is not numeric"))),
                }
            }
        }
    }

    pub fn as_i64(&self) -> Result<i64, Error> {
        match self.as_number()? {
            Number::Int(value) => Ok(value),
            Number::Decimal(value) if value.fract() == 0.0 => Ok(value as i64),
            Number::Decimal(_) => Err(self.mismatch("decimal value used as an integer")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, Error> {
        self.as_number().map(Number::as_f64)
    }

    /// Bit-pattern view used by the `&` conditional.
    pub fn as_bits(&self) -> Result<u64, Error> {
        match self.kind {
            DataKind::Binary => self.be_uint(),
            _ => match self.as_number()? {
                Number::Int(value) => Ok(value as u64),
                Number::Decimal(_) => Err(self.mismatch("decimal value has no bit pattern")),
            },
        }
    }

    /// Whether the raw bytes decode as the declared kind.
    pub fn is_decodable(&self) -> bool {
        match self.kind {
            DataKind::Binary => true,
            DataKind::Text => self.raw.to_str().is_ok(),
            DataKind::Numeric => self.as_number().is_ok(),
        }
    }

    fn be_uint(&self) -> Result<u64, Error> {
        if self.raw.is_empty() || self.raw.len() > 8 {
            return Err(self.mismatch(format!(
                "{} bytes cannot be read as an integer",
                self.raw.len()
            )));
        }
        Ok(self
            .raw
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    fn mismatch(&self, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::TypeMismatch)
            .with_message(message)
            .with_tag(self.tag.clone())
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldValue")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("raw", &self.raw.as_bstr())
            .finish()
    }
}

fn is_ascii_text(raw: &[u8]) -> bool {
    raw.iter().all(|byte| (0x20..=0x7e).contains(byte))
}

/// One active loop iteration while walking a schema.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoopFrame {
    pub name: Option<String>,
    pub index: usize,
}

impl LoopFrame {
    pub fn new(name: Option<&str>, index: usize) -> Self {
        Self {
            name: name.map(str::to_string),
            index,
        }
    }
}

/// Builds the qualified tag for `tag` under the given loop frames.
///
/// Unnamed loops append `[i]` to the field tag; a named loop `G` becomes a
/// `G[i].` path segment carrying any indices collected before it.
pub fn qualify(tag: &str, frames: &[LoopFrame]) -> String {
    let mut out = String::new();
    let mut pending = String::new();
    for frame in frames {
        pending.push_str(&format!("[{}]", frame.index));
        if let Some(name) = &frame.name {
            out.push_str(name);
            out.push_str(&pending);
            out.push('.');
            pending.clear();
        }
    }
    out.push_str(tag);
    out.push_str(&pending);
    out
}

/// Last path segment of a qualified tag, without loop indices.
pub fn base_tag(qualified: &str) -> &str {
    let last = qualified.rsplit('.').next().unwrap_or(qualified);
    match last.find('[') {
        Some(pos) => &last[..pos],
        None => last,
    }
}

#[derive(Clone, Debug, Default)]
pub struct Record {
    tag: String,
    fields: Vec<FieldValue>,
    index: HashMap<String, usize>,
}

impl Record {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Builds a record from values, rejecting duplicate qualified tags.
    pub fn from_fields(
        tag: impl Into<String>,
        fields: impl IntoIterator<Item = FieldValue>,
    ) -> Result<Self, Error> {
        let mut record = Self::new(tag);
        for field in fields {
            record.insert(field)?;
        }
        Ok(record)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldValue> {
        self.fields.iter()
    }

    pub fn insert(&mut self, value: FieldValue) -> Result<(), Error> {
        if self.index.contains_key(value.tag()) {
            return Err(Error::new(ErrorKind::DuplicateTag)
                .with_message("qualified tag already present in record")
                .with_tag(value.tag().to_string()));
        }
        self.index.insert(value.tag.clone(), self.fields.len());
        self.fields.push(value);
        Ok(())
    }

    /// Inserts or replaces in place, returning the previous value.
    pub fn set(&mut self, value: FieldValue) -> Option<FieldValue> {
        match self.index.get(value.tag()) {
            Some(&pos) => Some(std::mem::replace(&mut self.fields[pos], value)),
            None => {
                self.index.insert(value.tag.clone(), self.fields.len());
                self.fields.push(value);
                None
            }
        }
    }

    pub fn remove(&mut self, tag: &str) -> Option<FieldValue> {
        let pos = self.index.remove(tag)?;
        let removed = self.fields.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn get(&self, tag: &str) -> Option<&FieldValue> {
        self.index.get(tag).map(|&pos| &self.fields[pos])
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.index.contains_key(tag)
    }

    /// Exact qualified-tag match when one exists, otherwise every
    /// occurrence of `tag` as a base tag across loop iterations.
    pub fn query(&self, tag: &str) -> Vec<&FieldValue> {
        let exact = self.query_exact(tag);
        if exact.is_empty() {
            self.query_base(tag)
        } else {
            exact
        }
    }

    pub fn query_exact(&self, tag: &str) -> Vec<&FieldValue> {
        self.get(tag).into_iter().collect()
    }

    pub fn query_base(&self, base: &str) -> Vec<&FieldValue> {
        self.fields
            .iter()
            .filter(|field| field.base_tag() == base)
            .collect()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.fields == other.fields
    }
}

impl Eq for Record {}

impl ValueLookup for Record {
    fn lookup(&self, qualified: &str) -> Option<&FieldValue> {
        self.get(qualified)
    }
}

#[cfg(test)]
mod tests {
    use super::{base_tag, qualify, DataKind, FieldValue, LoopFrame, Number, Record};
    use crate::core::error::ErrorKind;

    #[test]
    fn unnamed_loops_append_indices() {
        let frames = [LoopFrame::new(None, 1), LoopFrame::new(None, 3)];
        assert_eq!(qualify("F", &frames), "F[1][3]");
        assert_eq!(qualify("A", &[]), "A");
    }

    #[test]
    fn named_loops_become_path_segments() {
        let frames = [LoopFrame::new(Some("BAND"), 2), LoopFrame::new(None, 0)];
        assert_eq!(qualify("LUT", &frames), "BAND[2].LUT[0]");

        let frames = [LoopFrame::new(None, 0), LoopFrame::new(Some("G"), 1)];
        assert_eq!(qualify("F", &frames), "G[0][1].F");
    }

    #[test]
    fn base_tag_strips_path_and_indices() {
        assert_eq!(base_tag("BAND[2].LUT[0]"), "LUT");
        assert_eq!(base_tag("B[1]"), "B");
        assert_eq!(base_tag("A"), "A");
        assert_eq!(base_tag("G[0].NAME"), "NAME");
    }

    #[test]
    fn text_values_trim_padding() {
        let value = FieldValue::new("T", DataKind::Text, &b"  GEOD  "[..]);
        assert_eq!(value.as_text().expect("text"), "GEOD");
        assert!(!value.is_blank());
        assert!(FieldValue::text("E", "    ").is_blank());
    }

    #[test]
    fn numeric_decodes_ascii_and_big_endian() {
        assert_eq!(FieldValue::text("A", "0002").as_i64().expect("ascii"), 2);
        let be = FieldValue::new("B", DataKind::Numeric, vec![0x00, 0x02]);
        assert_eq!(be.as_i64().expect("be"), 2);
        let dec = FieldValue::new("C", DataKind::Numeric, &b"12.50"[..]);
        assert_eq!(dec.as_number().expect("decimal"), Number::Decimal(12.5));
        assert_eq!(dec.as_i64().expect_err("fractional").kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn non_numeric_text_is_type_mismatch() {
        let err = FieldValue::text("T", "GEOD").as_i64().expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(err.tag(), Some("T"));
    }

    #[test]
    fn record_rejects_duplicate_tags_and_keeps_order() {
        let mut record = Record::new("TEST");
        record.insert(FieldValue::numeric("A", 2)).expect("insert");
        record.insert(FieldValue::numeric("B[0]", 1)).expect("insert");
        let err = record
            .insert(FieldValue::numeric("A", 3))
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::DuplicateTag);

        let previous = record.set(FieldValue::numeric("A", 7)).expect("replaced");
        assert_eq!(previous.as_i64().expect("num"), 2);
        let tags: Vec<_> = record.iter().map(FieldValue::tag).collect();
        assert_eq!(tags, ["A", "B[0]"]);
    }

    #[test]
    fn remove_reindexes_later_fields() {
        let mut record = Record::from_fields(
            "TEST",
            [
                FieldValue::text("A", "x"),
                FieldValue::text("B", "y"),
                FieldValue::text("C", "z"),
            ],
        )
        .expect("record");
        assert!(record.remove("A").is_some());
        assert_eq!(record.get("C").expect("C").as_text().expect("text"), "z");
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn query_prefers_exact_then_base() {
        let record = Record::from_fields(
            "TEST",
            [
                FieldValue::numeric("A", 2),
                FieldValue::numeric("B[0]", 1),
                FieldValue::numeric("B[1]", 2),
            ],
        )
        .expect("record");
        let hits: Vec<_> = record.query("B").into_iter().map(FieldValue::tag).collect();
        assert_eq!(hits, ["B[0]", "B[1]"]);
        let exact: Vec<_> = record.query("B[1]").into_iter().map(FieldValue::tag).collect();
        assert_eq!(exact, ["B[1]"]);
        assert!(record.query_exact("B").is_empty());
        assert!(record.query("Z").is_empty());
    }
}
