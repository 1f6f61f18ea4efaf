//! Purpose: Validate descriptor lists and compile them into a reusable node tree.
//! Exports: `FieldDescriptor`, `DescriptorKind`, `Count`, `Schema`, `Node`, `Width`,
//! `LoopCount`, `Reference`, `compile`.
//! Role: Single compile step per record type; parse and serialize walk the tree only.
//! Invariants: Markers balance and exactly one `End` closes the list.
//! Invariants: Tags are unique per scope; loop bodies open a scope, conditionals do not.
//! Invariants: References name a data field declared earlier in the same or an enclosing scope.
use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::expr::{CondExpr, CountExpr};
use crate::core::record::DataKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Text,
    Numeric,
    Binary,
    LoopStart,
    LoopEnd,
    CondStart,
    CondEnd,
    ComputedLength,
    End,
}

impl DescriptorKind {
    pub fn data_kind(self) -> Option<DataKind> {
        match self {
            DescriptorKind::Text => Some(DataKind::Text),
            DescriptorKind::Numeric => Some(DataKind::Numeric),
            DescriptorKind::Binary => Some(DataKind::Binary),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DescriptorKind::Text => "text",
            DescriptorKind::Numeric => "numeric",
            DescriptorKind::Binary => "binary",
            DescriptorKind::LoopStart => "loop_start",
            DescriptorKind::LoopEnd => "loop_end",
            DescriptorKind::CondStart => "cond_start",
            DescriptorKind::CondEnd => "cond_end",
            DescriptorKind::ComputedLength => "computed_length",
            DescriptorKind::End => "end",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Count {
    Absent,
    Fixed(usize),
    /// Length taken from what is left of the declared total.
    Remaining,
    Ref { tag: String, expr: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub kind: DescriptorKind,
    pub tag: String,
    pub label: String,
    pub count: Count,
}

impl FieldDescriptor {
    fn marker(kind: DescriptorKind, count: Count) -> Self {
        Self {
            kind,
            tag: String::new(),
            label: String::new(),
            count,
        }
    }

    fn data(kind: DescriptorKind, tag: &str, count: Count) -> Self {
        Self {
            kind,
            tag: tag.to_string(),
            label: String::new(),
            count,
        }
    }

    pub fn text(tag: &str, width: usize) -> Self {
        Self::data(DescriptorKind::Text, tag, Count::Fixed(width))
    }

    pub fn numeric(tag: &str, width: usize) -> Self {
        Self::data(DescriptorKind::Numeric, tag, Count::Fixed(width))
    }

    pub fn binary(tag: &str, width: usize) -> Self {
        Self::data(DescriptorKind::Binary, tag, Count::Fixed(width))
    }

    pub fn remaining(kind: DescriptorKind, tag: &str) -> Self {
        Self::data(kind, tag, Count::Remaining)
    }

    pub fn loop_start(reference: &str, expr: &str) -> Self {
        Self::marker(
            DescriptorKind::LoopStart,
            Count::Ref {
                tag: reference.to_string(),
                expr: expr.to_string(),
            },
        )
    }

    pub fn loop_fixed(times: usize) -> Self {
        Self::marker(DescriptorKind::LoopStart, Count::Fixed(times))
    }

    /// Loop whose iterations become `name[i].` path segments.
    pub fn named_loop(name: &str, reference: &str, expr: &str) -> Self {
        let mut desc = Self::loop_start(reference, expr);
        desc.tag = name.to_string();
        desc
    }

    pub fn loop_end() -> Self {
        Self::marker(DescriptorKind::LoopEnd, Count::Absent)
    }

    pub fn cond_start(reference: &str, expr: &str) -> Self {
        Self::marker(
            DescriptorKind::CondStart,
            Count::Ref {
                tag: reference.to_string(),
                expr: expr.to_string(),
            },
        )
    }

    pub fn cond_end() -> Self {
        Self::marker(DescriptorKind::CondEnd, Count::Absent)
    }

    pub fn computed_length() -> Self {
        Self::marker(DescriptorKind::ComputedLength, Count::Absent)
    }

    pub fn computed_length_ref(reference: &str, expr: &str) -> Self {
        Self::marker(
            DescriptorKind::ComputedLength,
            Count::Ref {
                tag: reference.to_string(),
                expr: expr.to_string(),
            },
        )
    }

    pub fn end() -> Self {
        Self::marker(DescriptorKind::End, Count::Absent)
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
}

/// A reference resolved at compile time to the loop depth its field lives at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reference {
    pub tag: String,
    pub depth: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Width {
    Fixed(usize),
    Remaining,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoopCount {
    Fixed(usize),
    Ref(Reference, CountExpr),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Field {
        tag: String,
        kind: DataKind,
        width: Width,
    },
    Loop {
        name: Option<String>,
        count: LoopCount,
        body: Vec<Node>,
    },
    Cond {
        reference: Reference,
        expr: CondExpr,
        body: Vec<Node>,
    },
    Length {
        total: Option<(Reference, CountExpr)>,
    },
}

#[derive(Debug)]
pub struct Schema {
    tag: String,
    descriptors: Vec<FieldDescriptor>,
    nodes: Vec<Node>,
    fingerprint: String,
}

impl Schema {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn descriptors(&self) -> &[FieldDescriptor] {
        &self.descriptors
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Hex SHA-256 over the tag and descriptor list.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Fixed bytes outside any loop or conditional.
    pub fn min_len(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::Field {
                    width: Width::Fixed(n),
                    ..
                } => *n,
                _ => 0,
            })
            .fold(0, usize::saturating_add)
    }

    /// Fields whose value is a computed-length total.
    pub fn length_targets(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        collect_length_targets(&self.nodes, &mut out);
        out
    }
}

fn collect_length_targets<'a>(nodes: &'a [Node], out: &mut Vec<&'a Reference>) {
    for node in nodes {
        match node {
            Node::Length {
                total: Some((reference, _)),
            } => out.push(reference),
            Node::Loop { body, .. } | Node::Cond { body, .. } => {
                collect_length_targets(body, out)
            }
            _ => {}
        }
    }
}

pub fn compile(tag: &str, descriptors: &[FieldDescriptor]) -> Result<Schema, Error> {
    check_tag(tag).map_err(|err| err.with_message("record type tag is invalid"))?;
    check_balance(descriptors)?;
    let mut compiler = Compiler {
        descriptors,
        pos: 0,
        scopes: vec![TagScope::default()],
    };
    let nodes = compiler.body(None)?;
    Ok(Schema {
        tag: tag.to_string(),
        descriptors: descriptors.to_vec(),
        nodes,
        fingerprint: fingerprint(tag, descriptors),
    })
}

fn check_balance(descriptors: &[FieldDescriptor]) -> Result<(), Error> {
    let mut stack: Vec<(DescriptorKind, usize)> = Vec::new();
    let mut end = None;
    for (idx, desc) in descriptors.iter().enumerate() {
        match desc.kind {
            DescriptorKind::LoopStart | DescriptorKind::CondStart => stack.push((desc.kind, idx)),
            DescriptorKind::LoopEnd | DescriptorKind::CondEnd => {
                let opener = match desc.kind {
                    DescriptorKind::LoopEnd => DescriptorKind::LoopStart,
                    _ => DescriptorKind::CondStart,
                };
                match stack.pop() {
                    Some((kind, _)) if kind == opener => {}
                    Some((kind, open_idx)) => {
                        return Err(unbalanced(format!(
                            "{} at {idx} closes {} opened at {open_idx}",
                            desc.kind.name(),
                            kind.name()
                        )));
                    }
                    None => {
                        return Err(unbalanced(format!(
                            "{} at {idx} has no opener",
                            desc.kind.name()
                        )));
                    }
                }
            }
            DescriptorKind::End => {
                if end.is_some() {
                    return Err(unbalanced(format!("second end marker at {idx}")));
                }
                end = Some(idx);
            }
            _ => {}
        }
    }
    if let Some((kind, idx)) = stack.pop() {
        return Err(unbalanced(format!("{} at {idx} is never closed", kind.name())));
    }
    match end {
        Some(idx) if idx + 1 == descriptors.len() => Ok(()),
        Some(idx) => Err(unbalanced(format!("end marker at {idx} is not last"))),
        None => Err(unbalanced("missing end marker")),
    }
}

fn unbalanced(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Unbalanced).with_message(message)
}

fn check_tag(tag: &str) -> Result<(), Error> {
    if tag.is_empty() || tag.contains(['[', ']', '.']) || tag.trim() != tag {
        return Err(Error::new(ErrorKind::Usage)
            .with_tag(tag.to_string())
            .with_hint("tags are non-empty and may not contain '[', ']', '.', or edge spaces"));
    }
    Ok(())
}

fn fingerprint(tag: &str, descriptors: &[FieldDescriptor]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for desc in descriptors {
        hasher.update([0u8]);
        hasher.update(desc.kind.name().as_bytes());
        hasher.update([0u8]);
        hasher.update(desc.tag.as_bytes());
        hasher.update([0u8]);
        hasher.update(desc.label.as_bytes());
        hasher.update([0u8]);
        match &desc.count {
            Count::Absent => hasher.update(b"-"),
            Count::Fixed(n) => hasher.update(n.to_string().as_bytes()),
            Count::Remaining => hasher.update(b"remaining"),
            Count::Ref { tag, expr } => {
                hasher.update(tag.as_bytes());
                hasher.update([0u8]);
                hasher.update(expr.as_bytes());
            }
        }
    }
    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[derive(Default)]
struct TagScope {
    names: HashSet<String>,
    fields: HashSet<String>,
}

struct Compiler<'a> {
    descriptors: &'a [FieldDescriptor],
    pos: usize,
    scopes: Vec<TagScope>,
}

impl Compiler<'_> {
    fn body(&mut self, closer: Option<DescriptorKind>) -> Result<Vec<Node>, Error> {
        let mut nodes = Vec::new();
        // Balance was checked up front, so a closer or End always arrives.
        while let Some(desc) = self.descriptors.get(self.pos) {
            let idx = self.pos;
            self.pos += 1;
            match desc.kind {
                DescriptorKind::Text | DescriptorKind::Numeric | DescriptorKind::Binary => {
                    nodes.push(self.field(desc, idx)?);
                }
                DescriptorKind::LoopStart => nodes.push(self.loop_node(desc, idx)?),
                DescriptorKind::CondStart => nodes.push(self.cond_node(desc, idx)?),
                DescriptorKind::ComputedLength => nodes.push(self.length_node(desc, idx)?),
                DescriptorKind::LoopEnd | DescriptorKind::CondEnd | DescriptorKind::End => {
                    if closer.is_none_or(|kind| kind == desc.kind) {
                        return Ok(nodes);
                    }
                    return Err(unbalanced(format!("unexpected {} at {idx}", desc.kind.name())));
                }
            }
        }
        Err(unbalanced("descriptor list ended inside an open scope"))
    }

    fn field(&mut self, desc: &FieldDescriptor, idx: usize) -> Result<Node, Error> {
        let kind = desc
            .kind
            .data_kind()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("not a data field"))?;
        self.declare(&desc.tag, true)?;
        let width = match &desc.count {
            Count::Fixed(n) => Width::Fixed(*n),
            Count::Remaining => {
                let next = self.descriptors.get(self.pos).map(|next| next.kind);
                if next != Some(DescriptorKind::ComputedLength) {
                    return Err(Error::new(ErrorKind::MisplacedMarker)
                        .with_message(format!(
                            "remaining-length field at {idx} must be followed by computed_length"
                        ))
                        .with_tag(desc.tag.clone()));
                }
                Width::Remaining
            }
            Count::Absent | Count::Ref { .. } => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("data field at {idx} needs a byte count"))
                    .with_tag(desc.tag.clone()));
            }
        };
        Ok(Node::Field {
            tag: desc.tag.clone(),
            kind,
            width,
        })
    }

    fn loop_node(&mut self, desc: &FieldDescriptor, idx: usize) -> Result<Node, Error> {
        let count = match &desc.count {
            Count::Fixed(n) => LoopCount::Fixed(*n),
            Count::Ref { tag, expr } => {
                let reference = self.resolve(tag, idx)?;
                LoopCount::Ref(reference, CountExpr::parse(expr).map_err(|err| err.with_tag(tag.clone()))?)
            }
            Count::Remaining => return Err(misplaced_remaining(desc, idx)),
            Count::Absent => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("loop at {idx} needs a count or reference")));
            }
        };
        let name = if desc.tag.is_empty() {
            None
        } else {
            self.declare(&desc.tag, false)?;
            Some(desc.tag.clone())
        };
        self.scopes.push(TagScope::default());
        let body = self.body(Some(DescriptorKind::LoopEnd));
        self.scopes.pop();
        Ok(Node::Loop {
            name,
            count,
            body: body?,
        })
    }

    fn cond_node(&mut self, desc: &FieldDescriptor, idx: usize) -> Result<Node, Error> {
        let (reference, expr) = match &desc.count {
            Count::Ref { tag, expr } => (
                self.resolve(tag, idx)?,
                CondExpr::parse(expr).map_err(|err| err.with_tag(tag.clone()))?,
            ),
            Count::Remaining => return Err(misplaced_remaining(desc, idx)),
            Count::Absent | Count::Fixed(_) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("conditional at {idx} needs a reference")));
            }
        };
        let body = self.body(Some(DescriptorKind::CondEnd))?;
        Ok(Node::Cond {
            reference,
            expr,
            body,
        })
    }

    fn length_node(&mut self, desc: &FieldDescriptor, idx: usize) -> Result<Node, Error> {
        let total = match &desc.count {
            Count::Absent => None,
            Count::Ref { tag, expr } => Some((
                self.resolve(tag, idx)?,
                CountExpr::parse(expr).map_err(|err| err.with_tag(tag.clone()))?,
            )),
            Count::Remaining => return Err(misplaced_remaining(desc, idx)),
            Count::Fixed(_) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("computed_length at {idx} takes a reference, not a count")));
            }
        };
        Ok(Node::Length { total })
    }

    fn declare(&mut self, tag: &str, is_field: bool) -> Result<(), Error> {
        check_tag(tag)?;
        let Some(scope) = self.scopes.last_mut() else {
            return Err(Error::new(ErrorKind::Internal).with_message("scope stack is empty"));
        };
        if !scope.names.insert(tag.to_string()) {
            return Err(Error::new(ErrorKind::DuplicateTag)
                .with_message("tag already declared in this scope")
                .with_tag(tag.to_string()));
        }
        if is_field {
            scope.fields.insert(tag.to_string());
        }
        Ok(())
    }

    fn resolve(&self, tag: &str, idx: usize) -> Result<Reference, Error> {
        self.scopes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, scope)| scope.fields.contains(tag))
            .map(|(depth, _)| Reference {
                tag: tag.to_string(),
                depth,
            })
            .ok_or_else(|| {
                Error::new(ErrorKind::ForwardReference)
                    .with_message(format!(
                        "marker at {idx} references a field not declared before it"
                    ))
                    .with_tag(tag.to_string())
            })
    }
}

fn misplaced_remaining(desc: &FieldDescriptor, idx: usize) -> Error {
    Error::new(ErrorKind::MisplacedMarker).with_message(format!(
        "remaining count is only valid on data fields, found on {} at {idx}",
        desc.kind.name()
    ))
}
