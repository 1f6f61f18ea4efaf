// Interpreter contract tests through the public API: parse, query, serialize.
use trecore::api::{
    DataKind, Engine, ErrorKind, FieldDescriptor as F, FieldValue, ParseOptions, Record,
    SliceSource, compile, record_json,
};
use trecore::core::{interp, plan};

fn counted() -> trecore::api::Schema {
    compile(
        "TEST",
        &[
            F::text("A", 4),
            F::loop_start("A", "*1"),
            F::numeric("B", 2),
            F::loop_end(),
            F::end(),
        ],
    )
    .expect("compile")
}

fn survey() -> trecore::api::Schema {
    compile(
        "SURVEY",
        &[
            F::text("MODE", 4),
            F::cond_start("MODE", "eq GEOD"),
            F::numeric("ZONE", 2),
            F::cond_end(),
            F::numeric("N", 1),
            F::named_loop("BAND", "N", ""),
            F::text("NAME", 3),
            F::loop_end(),
            F::end(),
        ],
    )
    .expect("compile")
}

#[test]
fn counted_loop_parses_and_queries_in_order() {
    let schema = counted();
    let record =
        interp::parse_bytes(&schema, b"0002\x00\x01\x00\x02", ParseOptions::default()).expect("parse");
    assert_eq!(record.get("A").expect("A").as_i64().expect("num"), 2);
    let hits = record.query("B");
    let tags: Vec<_> = hits.iter().map(|field| field.tag()).collect();
    assert_eq!(tags, ["B[0]", "B[1]"]);
    assert_eq!(hits[0].as_i64().expect("num"), 1);
    assert_eq!(hits[1].as_i64().expect("num"), 2);
    assert_eq!(record.query("B[1]").len(), 1);
}

#[test]
fn unbalanced_schema_is_rejected() {
    let err = compile("BAD", &[F::loop_start("X", ""), F::end()]).expect_err("unbalanced");
    assert_eq!(err.kind(), ErrorKind::Unbalanced);

    let err = compile("BAD", &[F::cond_end(), F::end()]).expect_err("stray end");
    assert_eq!(err.kind(), ErrorKind::Unbalanced);
}

#[test]
fn forward_reference_is_rejected() {
    let err = compile(
        "BAD",
        &[F::loop_start("LATER", ""), F::text("LATER", 1), F::loop_end(), F::end()],
    )
    .expect_err("forward");
    assert_eq!(err.kind(), ErrorKind::ForwardReference);
}

#[test]
fn conditional_and_named_loop_round_trip() {
    let schema = survey();
    for bytes in [&b"GEOD072abcxyz"[..], &b"UTM 1abc"[..], &b"UTM 0"[..]] {
        let record = interp::parse_bytes(&schema, bytes, ParseOptions::default().strict())
            .expect("parse");
        assert_eq!(plan::serialize(&schema, &record).expect("serialize"), bytes);
        assert!(plan::validate(&record, &schema));
    }

    let record =
        interp::parse_bytes(&schema, b"GEOD072abcxyz", ParseOptions::default()).expect("parse");
    assert_eq!(record.get("ZONE").expect("zone").as_i64().expect("num"), 7);
    assert_eq!(
        record.get("BAND[1].NAME").expect("name").as_text().expect("text"),
        "xyz"
    );

    let skipped = interp::parse_bytes(&schema, b"UTM 1abc", ParseOptions::default()).expect("parse");
    assert!(!skipped.contains("ZONE"));
}

#[test]
fn reads_stop_at_the_end_marker() {
    let schema = counted();
    let mut source = SliceSource::new(b"0001\x00\x05NEXT");
    let record = interp::parse(&schema, &mut source, ParseOptions::default()).expect("parse");
    assert_eq!(record.len(), 2);
    assert_eq!(source.position(), 6);
}

#[test]
fn missing_fields_fail_serialize() {
    let schema = counted();
    let record = Record::from_fields(
        "TEST",
        [FieldValue::new("B[0]", DataKind::Numeric, b"\x00\x01".to_vec())],
    )
    .expect("record");
    let err = plan::serialize(&schema, &record).expect_err("no A");
    assert_eq!(err.kind(), ErrorKind::MissingField);
    assert!(!plan::validate(&record, &schema));
}

#[test]
fn engine_parses_through_registered_json_schema() {
    let engine = Engine::new();
    engine
        .register_schema_json(
            r#"[{"kind":"numeric","tag":"LEN","count":2},
                {"kind":"text","tag":"BODY","count":"remaining"},
                {"kind":"computed_length","ref":"LEN"},
                {"kind":"end"}]"#,
            Some("BLOB"),
        )
        .expect("register");
    let handle = engine
        .parse_record("BLOB", b"07hello", ParseOptions::default())
        .expect("parse");
    let managed = handle.get().expect("record");
    let view = record_json(managed.record());
    assert_eq!(view["fields"][1]["value"], "hello");
    assert_eq!(
        engine.serialize(handle.identity()).expect("serialize"),
        b"07hello"
    );
    assert!(handle.release().expect("release"));
}
