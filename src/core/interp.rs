// Schema-driven decode of one tagged record from a byte source.
use crate::core::error::{Error, ErrorKind};
use crate::core::expr::CountExpr;
use crate::core::io::{ByteSource, SliceSource};
use crate::core::record::{qualify, DataKind, FieldValue, LoopFrame, Record};
use crate::core::schema::{LoopCount, Node, Reference, Schema, Width};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ParseOptions {
    /// Total record length when the caller knows it (e.g. from a container header).
    pub declared_len: Option<usize>,
    /// Reject bytes left inside the declared total after `End`.
    pub strict: bool,
}

impl ParseOptions {
    pub fn declared(len: usize) -> Self {
        Self {
            declared_len: Some(len),
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

pub fn parse(
    schema: &Schema,
    source: &mut dyn ByteSource,
    options: ParseOptions,
) -> Result<Record, Error> {
    let total = options.declared_len.or_else(|| source.remaining());
    let mut parser = Parser {
        source,
        record: Record::new(schema.tag()),
        frames: Vec::new(),
        consumed: 0,
        total,
        pending: None,
    };
    parser.walk(schema.nodes())?;

    let trailing = total.map_or(0, |total| total.saturating_sub(parser.consumed));
    if trailing > 0 {
        if options.strict {
            return Err(Error::new(ErrorKind::TrailingData)
                .with_message(format!("{trailing} bytes follow the end marker"))
                .with_tag(schema.tag().to_string())
                .with_offset(parser.consumed as u64));
        }
        if options.declared_len.is_some() {
            parser.source.read_exactly(trailing)?;
            tracing::debug!(tre = schema.tag(), trailing, "drained trailing bytes");
        }
    }
    tracing::debug!(
        tre = schema.tag(),
        consumed = parser.consumed,
        fields = parser.record.len(),
        "parsed record"
    );
    Ok(parser.record)
}

pub fn parse_bytes(schema: &Schema, bytes: &[u8], options: ParseOptions) -> Result<Record, Error> {
    let mut source = SliceSource::new(bytes);
    parse(schema, &mut source, options)
}

struct Parser<'a> {
    source: &'a mut dyn ByteSource,
    record: Record,
    frames: Vec<LoopFrame>,
    consumed: usize,
    total: Option<usize>,
    pending: Option<(String, DataKind)>,
}

impl Parser<'_> {
    fn walk(&mut self, nodes: &[Node]) -> Result<(), Error> {
        for node in nodes {
            match node {
                Node::Field { tag, kind, width } => {
                    let qualified = qualify(tag, &self.frames);
                    match width {
                        Width::Fixed(n) => self.read_field(qualified, *kind, *n)?,
                        Width::Remaining => self.pending = Some((qualified, *kind)),
                    }
                }
                Node::Loop { name, count, body } => {
                    let times = match count {
                        LoopCount::Fixed(n) => *n,
                        LoopCount::Ref(reference, expr) => {
                            expr.eval_count(&self.record, &self.qualify_ref(reference))?
                        }
                    };
                    for index in 0..times {
                        let (consumed, fields) = (self.consumed, self.record.len());
                        self.frames.push(LoopFrame::new(name.as_deref(), index));
                        let walked = self.walk(body);
                        self.frames.pop();
                        walked?;
                        if self.consumed == consumed {
                            self.stalled_loop(times - index - 1, fields)?;
                            if self.record.len() == fields {
                                break;
                            }
                        }
                    }
                }
                Node::Cond {
                    reference,
                    expr,
                    body,
                } => {
                    if expr.eval(&self.record, &self.qualify_ref(reference))? {
                        self.walk(body)?;
                    }
                }
                Node::Length { total } => self.computed_length(total.as_ref())?,
            }
        }
        Ok(())
    }

    fn qualify_ref(&self, reference: &Reference) -> String {
        let depth = reference.depth.min(self.frames.len());
        qualify(&reference.tag, &self.frames[..depth])
    }

    fn computed_length(&mut self, total: Option<&(Reference, CountExpr)>) -> Result<(), Error> {
        let declared = match total {
            Some((reference, expr)) => Some(expr.eval(&self.record, &self.qualify_ref(reference))?),
            None => self.total.map(|total| total as i64),
        };
        let consumed = self.consumed as i64;
        match (self.pending.take(), declared) {
            (Some((tag, _)), None) => Err(Error::new(ErrorKind::Usage)
                .with_message("remaining-length field needs a declared record length")
                .with_tag(tag)),
            (Some((tag, kind)), Some(declared)) => {
                let len = declared - consumed;
                if len < 0 {
                    return Err(Error::new(ErrorKind::LengthMismatch)
                        .with_message(format!(
                            "declared length {declared} is shorter than {consumed} bytes consumed"
                        ))
                        .with_tag(tag)
                        .with_offset(self.consumed as u64));
                }
                self.read_field(tag, kind, len as usize)
            }
            (None, Some(declared)) if declared != consumed => {
                Err(Error::new(ErrorKind::LengthMismatch)
                    .with_message(format!("declared length {declared}, consumed {consumed}"))
                    .with_offset(self.consumed as u64))
            }
            (None, _) => Ok(()),
        }
    }

    /// An iteration that read no bytes. If it also produced no fields the rest are no-ops;
    /// otherwise the iterations still to run must fit in the bytes left.
    fn stalled_loop(&self, left: usize, fields: usize) -> Result<(), Error> {
        if self.record.len() == fields {
            tracing::debug!(skipped = left, "loop body consumed nothing; skipping");
            return Ok(());
        }
        let Some(total) = self.total else {
            return Ok(());
        };
        let available = total.saturating_sub(self.consumed);
        if left > available {
            return Err(Error::new(ErrorKind::Truncated)
                .with_message(format!(
                    "loop has {left} iterations left but reads no bytes; {available} bytes remain"
                ))
                .with_offset(self.consumed as u64));
        }
        Ok(())
    }

    fn read_field(&mut self, qualified: String, kind: DataKind, n: usize) -> Result<(), Error> {
        if let Some(total) = self.total {
            let end = self.consumed.checked_add(n);
            if end.is_none_or(|end| end > total) {
                return Err(Error::new(ErrorKind::Truncated)
                    .with_message(format!(
                        "need {n} bytes, {} left of declared {total}",
                        total - self.consumed.min(total)
                    ))
                    .with_tag(qualified)
                    .with_offset(self.consumed as u64));
            }
        }
        let raw = self
            .source
            .read_exactly(n)
            .map_err(|err| err.with_tag(qualified.clone()))?;
        self.consumed += n;
        self.record.insert(FieldValue::new(qualified, kind, raw))
    }
}
