//! Purpose: Plan and emit the byte image of a record against its schema.
//! Exports: `plan_encode`, `EncodePlan`, `Patch`, `serialize`, `write_record`, `check`, `validate`,
//! `normalize`.
//! Role: Pass one walks the schema writing values and zero placeholders; pass two applies patches.
//! Invariants: The record is the source of truth; loop counts come from the groups it holds.
//! Invariants: `check` additionally requires each count field to agree with those groups.
//! Invariants: `check` rejects fixed-width values not already at their width; `normalize` pads them.
//! Invariants: Computed-length targets are always recomputed, never copied from the record.
use std::collections::{HashMap, HashSet};

use crate::core::error::{Error, ErrorKind};
use crate::core::expr::CountExpr;
use crate::core::io::ByteSink;
use crate::core::record::{qualify, DataKind, FieldValue, LoopFrame, Record};
use crate::core::schema::{LoopCount, Node, Reference, Schema, Width};

/// Bytes to overwrite once the span a length field covers is known.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Patch {
    pub tag: String,
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncodePlan {
    pub bytes: Vec<u8>,
    pub patches: Vec<Patch>,
}

impl EncodePlan {
    pub fn apply(mut self) -> Vec<u8> {
        for patch in &self.patches {
            self.bytes[patch.offset..patch.offset + patch.bytes.len()].copy_from_slice(&patch.bytes);
        }
        self.bytes
    }
}

pub fn plan_encode(schema: &Schema, record: &Record) -> Result<EncodePlan, Error> {
    let mut encoder = Encoder::new(schema, record, Mode::Encode);
    encoder.walk(schema.nodes())?;
    Ok(EncodePlan {
        bytes: encoder.out,
        patches: encoder.patches,
    })
}

pub fn serialize(schema: &Schema, record: &Record) -> Result<Vec<u8>, Error> {
    let plan = plan_encode(schema, record)?;
    tracing::debug!(
        tre = schema.tag(),
        len = plan.bytes.len(),
        patches = plan.patches.len(),
        "serialized record"
    );
    Ok(plan.apply())
}

pub fn write_record(schema: &Schema, record: &Record, sink: &mut dyn ByteSink) -> Result<(), Error> {
    let bytes = serialize(schema, record)?;
    sink.write_exactly(&bytes)
}

/// Like `validate`, reporting the first problem found.
pub fn check(schema: &Schema, record: &Record) -> Result<(), Error> {
    let mut encoder = Encoder::new(schema, record, Mode::Check);
    encoder.walk(schema.nodes())
}

/// Copy of `record` with every fixed-width value padded to the bytes `serialize` would
/// write and computed lengths filled in, so parsing the serialized image gives it back.
pub fn normalize(schema: &Schema, record: &Record) -> Result<Record, Error> {
    let mut encoder = Encoder::new(schema, record, Mode::Normalize);
    encoder.walk(schema.nodes())?;
    let mut out = record.clone();
    for value in encoder.fitted {
        out.set(value);
    }
    Ok(out)
}

/// True iff every field the schema mandates for this record is present,
/// decodes as its declared kind, and fits its width.
pub fn validate(record: &Record, schema: &Schema) -> bool {
    match check(schema, record) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(tre = schema.tag(), error = %err, "record failed validation");
            false
        }
    }
}

struct Placeholder {
    offset: usize,
    width: usize,
    kind: DataKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Encode,
    Check,
    Normalize,
}

struct Encoder<'a> {
    record: &'a Record,
    targets: HashSet<(String, usize)>,
    frames: Vec<LoopFrame>,
    out: Vec<u8>,
    placeholders: HashMap<String, Placeholder>,
    patches: Vec<Patch>,
    fitted: Vec<FieldValue>,
    mode: Mode,
}

impl<'a> Encoder<'a> {
    fn new(schema: &Schema, record: &'a Record, mode: Mode) -> Self {
        let targets = schema
            .length_targets()
            .into_iter()
            .map(|target| (target.tag.clone(), target.depth))
            .collect();
        Self {
            record,
            targets,
            frames: Vec::new(),
            out: Vec::new(),
            placeholders: HashMap::new(),
            patches: Vec::new(),
            fitted: Vec::new(),
            mode,
        }
    }

    fn walk(&mut self, nodes: &[Node]) -> Result<(), Error> {
        for node in nodes {
            match node {
                Node::Field { tag, kind, width } => self.field(tag, *kind, *width)?,
                Node::Loop { name, count, body } => {
                    let times = match count {
                        LoopCount::Fixed(n) => *n,
                        LoopCount::Ref(reference, expr) => {
                            let held = self.group_count(name.as_deref(), body);
                            if self.mode == Mode::Check {
                                self.check_count(reference, expr, held)?;
                            }
                            held
                        }
                    };
                    for index in 0..times {
                        self.frames.push(LoopFrame::new(name.as_deref(), index));
                        let walked = self.walk(body);
                        self.frames.pop();
                        walked?;
                    }
                }
                Node::Cond {
                    reference,
                    expr,
                    body,
                } => {
                    if expr.eval(self.record, &self.qualify_ref(reference))? {
                        self.walk(body)?;
                    }
                }
                Node::Length { total } => {
                    if let Some((reference, expr)) = total {
                        self.patch_length(reference, expr)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn field(&mut self, tag: &str, kind: DataKind, width: Width) -> Result<(), Error> {
        let qualified = qualify(tag, &self.frames);
        if let Width::Fixed(n) = width {
            if self.targets.contains(&(tag.to_string(), self.frames.len())) {
                self.placeholders.insert(
                    qualified,
                    Placeholder {
                        offset: self.out.len(),
                        width: n,
                        kind,
                    },
                );
                self.out.extend(std::iter::repeat_n(placeholder_byte(kind), n));
                return Ok(());
            }
        }
        let value = self.record.get(&qualified).ok_or_else(|| {
            Error::new(ErrorKind::MissingField)
                .with_message("schema requires a value for this field")
                .with_tag(qualified.clone())
        })?;
        if let Width::Fixed(n) = width {
            if self.mode == Mode::Check && value.raw().len() != n {
                return Err(Error::new(ErrorKind::LengthMismatch)
                    .with_message(format!(
                        "value is {} bytes, field is {n} wide",
                        value.raw().len()
                    ))
                    .with_hint("normalize the record to pad values to their widths")
                    .with_tag(qualified)
                    .with_offset(self.out.len() as u64));
            }
        }
        let bytes = match width {
            Width::Fixed(n) => fit(value.raw(), kind, n).map_err(|err| {
                err.with_tag(qualified.clone())
                    .with_offset(self.out.len() as u64)
            })?,
            Width::Remaining => value.raw().to_vec(),
        };
        let fitted = FieldValue::new(qualified.as_str(), kind, bytes.as_slice());
        if self.mode == Mode::Check && !fitted.is_decodable() {
            return Err(Error::new(ErrorKind::TypeMismatch)
                .with_message(format!("value does not decode as {kind:?}"))
                .with_tag(qualified));
        }
        self.out.extend_from_slice(&bytes);
        if self.mode == Mode::Normalize {
            self.fitted.push(fitted);
        }
        Ok(())
    }

    fn check_count(&self, reference: &Reference, expr: &CountExpr, held: usize) -> Result<(), Error> {
        let qualified = self.qualify_ref(reference);
        let expected = expr.eval_count(self.record, &qualified)?;
        if expected != held {
            return Err(Error::new(ErrorKind::LengthMismatch)
                .with_message(format!(
                    "count field gives {expected} loop groups, record holds {held}"
                ))
                .with_tag(qualified));
        }
        Ok(())
    }

    fn patch_length(&mut self, reference: &Reference, expr: &CountExpr) -> Result<(), Error> {
        let qualified = self.qualify_ref(reference);
        let span = self.out.len() as i64;
        let placeholder = self.placeholders.get(&qualified).ok_or_else(|| {
            Error::new(ErrorKind::MissingField)
                .with_message("length field was not written before its marker")
                .with_tag(qualified.clone())
        })?;
        let value = expr.invert(span).ok_or_else(|| {
            Error::new(ErrorKind::LengthMismatch)
                .with_message(format!("no stored value yields a length of {span}"))
                .with_tag(qualified.clone())
        })?;
        let bytes = encode_length(value, placeholder.kind, placeholder.width)
            .map_err(|err| err.with_tag(qualified.clone()))?;
        if self.mode == Mode::Normalize {
            self.fitted
                .push(FieldValue::new(qualified.as_str(), placeholder.kind, bytes.as_slice()));
        }
        self.patches.push(Patch {
            tag: qualified,
            offset: placeholder.offset,
            bytes,
        });
        Ok(())
    }

    fn qualify_ref(&self, reference: &Reference) -> String {
        let depth = reference.depth.min(self.frames.len());
        qualify(&reference.tag, &self.frames[..depth])
    }

    fn group_count(&mut self, name: Option<&str>, body: &[Node]) -> usize {
        let mut count = 0;
        loop {
            self.frames.push(LoopFrame::new(name, count));
            let present = self.group_present(body);
            self.frames.pop();
            if !present {
                return count;
            }
            count += 1;
        }
    }

    fn group_present(&mut self, body: &[Node]) -> bool {
        body.iter().any(|node| match node {
            Node::Field { tag, .. } => self.record.contains(&qualify(tag, &self.frames)),
            Node::Cond { body, .. } => self.group_present(body),
            Node::Loop { name, body, .. } => {
                self.frames.push(LoopFrame::new(name.as_deref(), 0));
                let present = self.group_present(body);
                self.frames.pop();
                present
            }
            Node::Length { .. } => false,
        })
    }
}

fn placeholder_byte(kind: DataKind) -> u8 {
    match kind {
        DataKind::Binary => 0,
        DataKind::Text | DataKind::Numeric => b'0',
    }
}

/// Pads `raw` to `width` the way each kind is conventionally filled.
fn fit(raw: &[u8], kind: DataKind, width: usize) -> Result<Vec<u8>, Error> {
    if raw.len() > width {
        return Err(Error::new(ErrorKind::LengthMismatch)
            .with_message(format!("{} bytes do not fit a {width}-byte field", raw.len())));
    }
    let pad = width - raw.len();
    let mut out = Vec::with_capacity(width);
    match kind {
        DataKind::Text => {
            out.extend_from_slice(raw);
            out.resize(width, b' ');
        }
        DataKind::Binary => {
            out.extend_from_slice(raw);
            out.resize(width, 0);
        }
        DataKind::Numeric if raw.iter().all(|byte| (0x20..=0x7e).contains(byte)) => {
            let (sign, digits) = match raw.first() {
                Some(b'+' | b'-') => raw.split_at(1),
                _ => (&raw[..0], raw),
            };
            out.extend_from_slice(sign);
            out.extend(std::iter::repeat_n(b'0', pad));
            out.extend_from_slice(digits);
        }
        DataKind::Numeric => {
            out.extend(std::iter::repeat_n(0, pad));
            out.extend_from_slice(raw);
        }
    }
    Ok(out)
}

fn encode_length(value: i64, kind: DataKind, width: usize) -> Result<Vec<u8>, Error> {
    let too_wide = || {
        Error::new(ErrorKind::LengthMismatch)
            .with_message(format!("length {value} does not fit a {width}-byte field"))
    };
    let value = u64::try_from(value).map_err(|_| too_wide())?;
    match kind {
        DataKind::Text | DataKind::Numeric => {
            let digits = format!("{value:0width$}");
            if digits.len() > width {
                return Err(too_wide());
            }
            Ok(digits.into_bytes())
        }
        DataKind::Binary => {
            let be = value.to_be_bytes();
            let significant = be.iter().skip_while(|byte| **byte == 0).count();
            if significant > width {
                return Err(too_wide());
            }
            let mut out = vec![0u8; width.saturating_sub(be.len())];
            out.extend_from_slice(&be[be.len() - width.min(be.len())..]);
            Ok(out)
        }
    }
}
