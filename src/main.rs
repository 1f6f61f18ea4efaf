//! Purpose: `tre` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable JSON on stdout (`encode -o` writes bytes to the file).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Records are parsed and serialized only through `api::Engine`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use trecore::api::{
    Engine, Error, ErrorKind, ParseOptions, Schema, SchemaRef, SchemaRegistry, SchemaSource,
    field_json, record_from_json, record_json, to_exit_code,
};

const SCHEMA_DIR_ENV: &str = "TRE_SCHEMA_DIR";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `tre --help`."));
            }
        },
    };

    let mut registry = SchemaRegistry::new();
    if let Some(dir) = cli.schema_dir {
        registry = registry.with_schema_dir(dir);
    }
    let engine = Engine::new().with_registry(registry);
    let result = dispatch(&engine, cli.command);
    engine.shutdown();
    result
}

#[derive(Parser)]
#[command(
    name = "tre",
    version,
    about = "Parse, inspect, and encode schema-driven tagged record extensions",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tre schema check schemas/BANDSA.json
  $ tre parse BANDSA record.bin
  $ tre query BANDSA record.bin 'BAND[0].CWAVE'
  $ tre encode BANDSA record.json -o record.bin

Schemas given by bare name resolve to <schema-dir>/<name>.json."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        env = SCHEMA_DIR_ENV,
        help = "Directory for schemas given by name (default: ~/.tre/schemas)",
        value_hint = ValueHint::DirPath
    )]
    schema_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Schema inspection")]
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    #[command(about = "Parse a record and print its JSON view")]
    Parse {
        #[arg(help = "Schema name or path to a schema .json file")]
        schema: String,
        #[arg(help = "Record bytes (`-` reads stdin)", value_hint = ValueHint::FilePath)]
        input: PathBuf,
        #[arg(long, help = "Reject bytes left over after the end marker")]
        strict: bool,
        #[arg(long, help = "Pretty-print the JSON output")]
        pretty: bool,
    },
    #[command(about = "Encode a record JSON view back to bytes")]
    Encode {
        #[arg(help = "Schema name or path to a schema .json file")]
        schema: String,
        #[arg(help = "Record JSON (`-` reads stdin)", value_hint = ValueHint::FilePath)]
        input: PathBuf,
        #[arg(
            short,
            long,
            help = "Output file (default: raw bytes to stdout)",
            value_hint = ValueHint::FilePath
        )]
        output: Option<PathBuf>,
    },
    #[command(about = "Print every field matching a qualified or base tag")]
    Query {
        #[arg(help = "Schema name or path to a schema .json file")]
        schema: String,
        #[arg(help = "Record bytes (`-` reads stdin)", value_hint = ValueHint::FilePath)]
        input: PathBuf,
        #[arg(help = "Qualified tag (`B[1]`) or base tag (`B`)")]
        tag: String,
    },
    #[command(about = "Check a record JSON view against its schema")]
    Validate {
        #[arg(help = "Schema name or path to a schema .json file")]
        schema: String,
        #[arg(help = "Record JSON (`-` reads stdin)", value_hint = ValueHint::FilePath)]
        input: PathBuf,
    },
}

#[derive(Subcommand)]
enum SchemaCommand {
    #[command(about = "Compile a schema and print its summary")]
    Check {
        #[arg(help = "Schema name or path to a schema .json file")]
        schema: String,
    },
    #[command(about = "Print a schema in canonical JSON form")]
    Show {
        #[arg(help = "Schema name or path to a schema .json file")]
        schema: String,
    },
}

fn dispatch(engine: &Engine, command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Schema { command } => match command {
            SchemaCommand::Check { schema } => {
                let schema = load_schema(engine, &schema)?;
                emit_json(&schema_summary(&schema), false)?;
            }
            SchemaCommand::Show { schema } => {
                let schema = load_schema(engine, &schema)?;
                let source = serde_json::to_value(SchemaSource::from_schema(&schema))
                    .map_err(json_encode_error)?;
                emit_json(&source, true)?;
            }
        },
        Command::Parse {
            schema,
            input,
            strict,
            pretty,
        } => {
            let schema = load_schema(engine, &schema)?;
            let bytes = read_input(&input)?;
            let options = ParseOptions {
                declared_len: None,
                strict,
            };
            let handle = engine.parse_record(schema.tag(), &bytes, options)?;
            let managed = handle.get()?;
            emit_json(&record_json(managed.record()), pretty)?;
            handle.release()?;
        }
        Command::Encode {
            schema,
            input,
            output,
        } => {
            let schema = load_schema(engine, &schema)?;
            let handle = engine.adopt_record(read_record(&schema, &input)?)?;
            let bytes = engine.serialize(handle.identity())?;
            handle.release()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes).map_err(|err| {
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write output")
                            .with_hint(path.display().to_string())
                            .with_source(err)
                    })?;
                    emit_json(
                        &json!({
                            "tag": schema.tag(),
                            "path": path.display().to_string(),
                            "bytes": bytes.len(),
                        }),
                        false,
                    )?;
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    stdout
                        .write_all(&bytes)
                        .and_then(|()| stdout.flush())
                        .map_err(stdout_error)?;
                }
            }
        }
        Command::Query {
            schema,
            input,
            tag,
        } => {
            let schema = load_schema(engine, &schema)?;
            let bytes = read_input(&input)?;
            let handle = engine.parse_record(schema.tag(), &bytes, ParseOptions::default())?;
            let hits = engine.query(handle.identity(), &tag)?;
            handle.release()?;
            if hits.is_empty() {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message("no field matches this tag")
                    .with_tag(tag)
                    .with_hint("use `tre parse` to list the record's qualified tags"));
            }
            let values: Vec<Value> = hits.iter().map(field_json).collect();
            emit_json(&Value::Array(values), false)?;
        }
        Command::Validate { schema, input } => {
            let schema = load_schema(engine, &schema)?;
            let handle = engine.adopt_record(read_record(&schema, &input)?)?;
            let valid = engine.validate(handle.identity())?;
            let mut ok = valid;
            let mut report = Map::new();
            report.insert("tag".to_string(), json!(schema.tag()));
            match engine.serialize(handle.identity()) {
                Ok(bytes) => {
                    report.insert("valid".to_string(), json!(valid));
                    report.insert("bytes".to_string(), json!(bytes.len()));
                }
                Err(err) => {
                    ok = false;
                    report.insert("valid".to_string(), json!(false));
                    if let Some(detail) = error_json(&err).get("error") {
                        report.insert("error".to_string(), detail.clone());
                    }
                }
            }
            handle.release()?;
            emit_json(&Value::Object(report), false)?;
            if !ok {
                return Ok(RunOutcome::with_code(1));
            }
        }
    }
    Ok(RunOutcome::ok())
}

fn load_schema(engine: &Engine, input: &str) -> Result<Arc<Schema>, Error> {
    engine.load_schema(&SchemaRef::parse(input))
}

fn schema_summary(schema: &Schema) -> Value {
    json!({
        "tag": schema.tag(),
        "fingerprint": schema.fingerprint(),
        "descriptors": schema.descriptors().len(),
        "min_len": schema.min_len(),
    })
}

/// Reads a record JSON view; a missing `tag` takes the schema's tag.
fn read_record(schema: &Schema, input: &Path) -> Result<trecore::api::Record, Error> {
    let bytes = read_input(input)?;
    let mut value: Value = serde_json::from_slice(&bytes).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("record input is not valid JSON")
            .with_hint(input.display().to_string())
            .with_source(err)
    })?;
    if let Value::Object(map) = &mut value {
        map.entry("tag")
            .or_insert_with(|| Value::String(schema.tag().to_string()));
    }
    let record = record_from_json(&value)?;
    if record.tag() != schema.tag() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "record is tagged `{}` but the schema describes `{}`",
                record.tag(),
                schema.tag()
            ))
            .with_tag(record.tag().to_string()));
    }
    Ok(record)
}

fn read_input(path: &Path) -> Result<Vec<u8>, Error> {
    if path == Path::new("-") {
        let mut bytes = Vec::new();
        io::stdin().lock().read_to_end(&mut bytes).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })?;
        return Ok(bytes);
    }
    std::fs::read(path).map_err(|err| {
        let kind = if err.kind() == io::ErrorKind::NotFound {
            ErrorKind::NotFound
        } else {
            ErrorKind::Io
        };
        Error::new(kind)
            .with_message("failed to read input")
            .with_hint(path.display().to_string())
            .with_source(err)
    })
}

fn emit_json(value: &Value, pretty: bool) -> Result<(), Error> {
    let text = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(json_encode_error)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{text}").map_err(stdout_error)
}

fn json_encode_error(err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("failed to encode json")
        .with_source(err)
}

fn stdout_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write stdout")
        .with_source(err)
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::Io => "i/o error",
        ErrorKind::Unbalanced => "unbalanced loop or conditional markers",
        ErrorKind::DuplicateTag => "duplicate tag",
        ErrorKind::ForwardReference => "reference to a field not yet declared",
        ErrorKind::MisplacedMarker => "misplaced marker",
        ErrorKind::InvalidExpression => "invalid expression",
        ErrorKind::UnknownTag => "unknown tag",
        ErrorKind::TypeMismatch => "type mismatch",
        ErrorKind::Truncated => "record is truncated",
        ErrorKind::LengthMismatch => "length mismatch",
        ErrorKind::TrailingData => "trailing data",
        ErrorKind::MissingField => "missing field",
        ErrorKind::Released => "resource already released",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(tag) = err.tag() {
        inner.insert("tag".to_string(), json!(tag));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(tag) = err.tag() {
        lines.push(format!("tag: {tag}"));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
