//! Purpose: JSON schema source format and its mapping to field descriptors.
//! Exports: `SchemaSource`, `DescriptorSource`, `CountSource`, `parse_schema_json`.
//! Role: The only on-disk schema representation; compile still goes through `core::schema`.
//! Invariants: `ref`/`expr` and a literal `count` are mutually exclusive.
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{self, Count, DescriptorKind, FieldDescriptor, Schema};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountSource {
    Fixed(usize),
    Keyword(String),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorSource {
    pub kind: DescriptorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountSource>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl DescriptorSource {
    pub fn to_descriptor(&self, index: usize) -> Result<FieldDescriptor, Error> {
        let count = match (&self.count, &self.reference) {
            (Some(_), Some(_)) => {
                return Err(source_error(index, "`count` and `ref` are mutually exclusive"));
            }
            (Some(CountSource::Fixed(n)), None) => Count::Fixed(*n),
            (Some(CountSource::Keyword(word)), None) if word == "remaining" => Count::Remaining,
            (Some(CountSource::Keyword(word)), None) => {
                return Err(source_error(index, format!("unknown count keyword `{word}`")));
            }
            (None, Some(reference)) => Count::Ref {
                tag: reference.clone(),
                expr: self.expr.clone().unwrap_or_default(),
            },
            (None, None) => Count::Absent,
        };
        if self.expr.is_some() && self.reference.is_none() {
            return Err(source_error(index, "`expr` needs a `ref`"));
        }
        Ok(FieldDescriptor {
            kind: self.kind,
            tag: self.tag.clone().unwrap_or_default(),
            label: self.label.clone().unwrap_or_default(),
            count,
        })
    }

    pub fn from_descriptor(desc: &FieldDescriptor) -> Self {
        let (count, reference, expr) = match &desc.count {
            Count::Absent => (None, None, None),
            Count::Fixed(n) => (Some(CountSource::Fixed(*n)), None, None),
            Count::Remaining => (Some(CountSource::Keyword("remaining".to_string())), None, None),
            Count::Ref { tag, expr } => (
                None,
                Some(tag.clone()),
                (!expr.is_empty()).then(|| expr.clone()),
            ),
        };
        Self {
            kind: desc.kind,
            tag: (!desc.tag.is_empty()).then(|| desc.tag.clone()),
            label: (!desc.label.is_empty()).then(|| desc.label.clone()),
            count,
            reference,
            expr,
        }
    }
}

fn source_error(index: usize, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_hint(format!("schema field #{index}"))
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SchemaSource {
    pub tag: String,
    pub fields: Vec<DescriptorSource>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaDocument {
    Named(SchemaSource),
    Bare(Vec<DescriptorSource>),
}

impl SchemaSource {
    pub fn descriptors(&self) -> Result<Vec<FieldDescriptor>, Error> {
        self.fields
            .iter()
            .enumerate()
            .map(|(index, field)| field.to_descriptor(index))
            .collect()
    }

    pub fn compile(&self) -> Result<Schema, Error> {
        schema::compile(&self.tag, &self.descriptors()?)
    }

    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            tag: schema.tag().to_string(),
            fields: schema
                .descriptors()
                .iter()
                .map(DescriptorSource::from_descriptor)
                .collect(),
        }
    }
}

/// Parses either `{"tag": .., "fields": [..]}` or a bare descriptor array
/// named by `default_tag`.
pub fn parse_schema_json(text: &str, default_tag: Option<&str>) -> Result<SchemaSource, Error> {
    let doc: SchemaDocument = serde_json::from_str(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("schema source is not valid schema JSON")
            .with_hint(err.to_string())
            .with_source(err)
    })?;
    match doc {
        SchemaDocument::Named(source) => Ok(source),
        SchemaDocument::Bare(fields) => {
            let tag = default_tag.ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("bare descriptor array needs a record type tag")
            })?;
            Ok(SchemaSource {
                tag: tag.to_string(),
                fields,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_schema_json, SchemaSource};
    use crate::core::error::ErrorKind;
    use crate::core::schema::Count;

    const COUNTED: &str = r#"{
        "tag": "TEST",
        "fields": [
            {"kind": "text", "tag": "A", "label": "count", "count": 4},
            {"kind": "loop_start", "ref": "A", "expr": "*1"},
            {"kind": "numeric", "tag": "B", "count": 2},
            {"kind": "loop_end"},
            {"kind": "end"}
        ]
    }"#;

    #[test]
    fn named_document_compiles() {
        let source = parse_schema_json(COUNTED, None).expect("parse");
        let descriptors = source.descriptors().expect("descriptors");
        assert_eq!(descriptors[0].label, "count");
        assert_eq!(
            descriptors[1].count,
            Count::Ref {
                tag: "A".to_string(),
                expr: "*1".to_string()
            }
        );
        let schema = source.compile().expect("compile");
        assert_eq!(schema.tag(), "TEST");
        assert_eq!(SchemaSource::from_schema(&schema), source);
    }

    #[test]
    fn bare_array_uses_default_tag() {
        let text = r#"[{"kind":"binary","tag":"DATA","count":"remaining"},
                       {"kind":"computed_length"},{"kind":"end"}]"#;
        let source = parse_schema_json(text, Some("BLOB")).expect("parse");
        assert_eq!(source.tag, "BLOB");
        assert_eq!(source.descriptors().expect("descriptors")[0].count, Count::Remaining);
        let err = parse_schema_json(text, None).expect_err("no tag");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn rejects_conflicting_and_unknown_entries() {
        let both = r#"{"tag":"T","fields":[{"kind":"text","tag":"A","count":1,"ref":"A"}]}"#;
        let source = parse_schema_json(both, None).expect("parse");
        assert_eq!(source.descriptors().expect_err("both").kind(), ErrorKind::Usage);

        let keyword = r#"{"tag":"T","fields":[{"kind":"text","tag":"A","count":"lots"}]}"#;
        let source = parse_schema_json(keyword, None).expect("parse");
        assert_eq!(source.descriptors().expect_err("keyword").kind(), ErrorKind::Usage);

        let bad_kind = r#"{"tag":"T","fields":[{"kind":"float","tag":"A","count":1}]}"#;
        assert_eq!(
            parse_schema_json(bad_kind, None).expect_err("kind").kind(),
            ErrorKind::Usage
        );
    }
}
