// Error kinds and the structured error carried through schema, interpreter, and lifecycle code.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    Io,
    Unbalanced,
    DuplicateTag,
    ForwardReference,
    MisplacedMarker,
    InvalidExpression,
    UnknownTag,
    TypeMismatch,
    Truncated,
    LengthMismatch,
    TrailingData,
    MissingField,
    Released,
}

/// Coarse grouping of error kinds, matching the layer that raises them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Schema,
    Expression,
    Format,
    Ownership,
    Other,
}

impl ErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::Unbalanced
            | ErrorKind::DuplicateTag
            | ErrorKind::ForwardReference
            | ErrorKind::MisplacedMarker
            | ErrorKind::InvalidExpression => ErrorClass::Schema,
            ErrorKind::UnknownTag | ErrorKind::TypeMismatch => ErrorClass::Expression,
            ErrorKind::Truncated
            | ErrorKind::LengthMismatch
            | ErrorKind::TrailingData
            | ErrorKind::MissingField => ErrorClass::Format,
            ErrorKind::Released => ErrorClass::Ownership,
            ErrorKind::Internal | ErrorKind::Usage | ErrorKind::NotFound | ErrorKind::Io => {
                ErrorClass::Other
            }
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    tag: Option<String>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            tag: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(tag) = &self.tag {
            write!(f, " (tag: {tag})")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Io => 4,
        ErrorKind::Unbalanced
        | ErrorKind::DuplicateTag
        | ErrorKind::ForwardReference
        | ErrorKind::MisplacedMarker
        | ErrorKind::InvalidExpression => 5,
        ErrorKind::UnknownTag | ErrorKind::TypeMismatch => 6,
        ErrorKind::Truncated
        | ErrorKind::LengthMismatch
        | ErrorKind::TrailingData
        | ErrorKind::MissingField => 7,
        ErrorKind::Released => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::{to_exit_code, Error, ErrorClass, ErrorKind};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::Io, 4),
            (ErrorKind::Unbalanced, 5),
            (ErrorKind::InvalidExpression, 5),
            (ErrorKind::UnknownTag, 6),
            (ErrorKind::Truncated, 7),
            (ErrorKind::MissingField, 7),
            (ErrorKind::Released, 8),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn kinds_group_into_classes() {
        assert_eq!(ErrorKind::DuplicateTag.class(), ErrorClass::Schema);
        assert_eq!(ErrorKind::TypeMismatch.class(), ErrorClass::Expression);
        assert_eq!(ErrorKind::TrailingData.class(), ErrorClass::Format);
        assert_eq!(ErrorKind::Released.class(), ErrorClass::Ownership);
        assert_eq!(ErrorKind::Io.class(), ErrorClass::Other);
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Truncated)
            .with_message("need 4 bytes")
            .with_tag("B[1]")
            .with_offset(6);
        assert_eq!(
            err.to_string(),
            "Truncated: need 4 bytes (tag: B[1]) (offset: 6)"
        );
    }
}
