//! Parser for the GDB/MI output grammar: result records (`^done,...`),
//! asynchronous records (`*stopped,...`, `=thread-created,...`), stream
//! output (`~"..."`) and the `(gdb)` prompt.

use crate::engine::error::Error;
use indexmap::IndexMap;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1, one_of};
use nom::combinator::{map, opt};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, preceded, separated_pair};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A value inside an MI record payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MiValue {
    Const(String),
    Tuple(IndexMap<String, MiValue>),
    List(Vec<MiValue>),
}

impl MiValue {
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        match self {
            MiValue::Tuple(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Const(s) => Some(s),
            _ => None,
        }
    }

    /// Shorthand for `get(key).and_then(as_str)`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }
}

impl Serialize for MiValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MiValue::Const(s) => serializer.serialize_str(s),
            MiValue::Tuple(fields) => {
                let mut m = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            MiValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for v in items {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*` records: execution state changes.
    Exec,
    /// `+` records: ongoing status.
    Status,
    /// `=` records: notifications.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `~` console output.
    Console,
    /// `@` target output.
    Target,
    /// `&` gdb log output.
    Log,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MiRecord {
    Result {
        token: Option<u64>,
        class: ResultClass,
        payload: MiValue,
    },
    Async {
        token: Option<u64>,
        kind: AsyncKind,
        class: String,
        payload: MiValue,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    Prompt,
}

/// Parse one line of MI output.
pub fn parse_line(line: &str) -> Result<MiRecord, Error> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_end() == "(gdb)" {
        return Ok(MiRecord::Prompt);
    }

    let (rest, record) =
        mi_record(line).map_err(|_| Error::MiParse(format!("unrecognized output: {line}")))?;
    if !rest.is_empty() {
        return Err(Error::MiParse(format!("trailing garbage `{rest}` in: {line}")));
    }
    Ok(record)
}

/// Decode a gdb string literal like `0x7f801c "/tmp/a.php"`: everything up to
/// the first quote is dropped, the quoted part is unescaped.
pub fn decode_string_literal(raw: &str) -> Result<String, Error> {
    let at = raw
        .find('"')
        .ok_or_else(|| Error::MiParse(format!("not a string literal: {raw}")))?;
    let (_, s) = c_string(&raw[at..])
        .map_err(|_| Error::MiParse(format!("unterminated string literal: {raw}")))?;
    Ok(s)
}

fn mi_record(input: &str) -> IResult<&str, MiRecord> {
    alt((result_record, async_record, stream_record))(input)
}

fn token(input: &str) -> IResult<&str, Option<u64>> {
    map(opt(digit1), |d: Option<&str>| {
        d.and_then(|d| d.parse().ok())
    })(input)
}

fn class(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_')(input)
}

fn result_record(input: &str) -> IResult<&str, MiRecord> {
    let (input, token) = token(input)?;
    let (input, _) = char('^')(input)?;
    let (input, class_name) = class(input)?;
    let (input, payload) = payload(input)?;

    let class = match class_name {
        "done" => ResultClass::Done,
        "running" => ResultClass::Running,
        "connected" => ResultClass::Connected,
        "error" => ResultClass::Error,
        "exit" => ResultClass::Exit,
        _ => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
    };

    Ok((input, MiRecord::Result {
        token,
        class,
        payload,
    }))
}

fn async_record(input: &str) -> IResult<&str, MiRecord> {
    let (input, token) = token(input)?;
    let (input, marker) = one_of("*+=")(input)?;
    let (input, class_name) = class(input)?;
    let (input, payload) = payload(input)?;

    let kind = match marker {
        '*' => AsyncKind::Exec,
        '+' => AsyncKind::Status,
        _ => AsyncKind::Notify,
    };

    Ok((input, MiRecord::Async {
        token,
        kind,
        class: class_name.to_string(),
        payload,
    }))
}

fn stream_record(input: &str) -> IResult<&str, MiRecord> {
    let (input, marker) = one_of("~@&")(input)?;
    let (input, text) = c_string(input)?;

    let kind = match marker {
        '~' => StreamKind::Console,
        '@' => StreamKind::Target,
        _ => StreamKind::Log,
    };

    Ok((input, MiRecord::Stream { kind, text }))
}

/// The `,var=value` tail of a record, gathered into a tuple.
fn payload(input: &str) -> IResult<&str, MiValue> {
    map(many0(preceded(char(','), result_pair)), |pairs| {
        MiValue::Tuple(pairs.into_iter().collect())
    })(input)
}

fn result_pair(input: &str) -> IResult<&str, (String, MiValue)> {
    map(
        separated_pair(class, char('='), mi_value),
        |(name, value)| (name.to_string(), value),
    )(input)
}

fn mi_value(input: &str) -> IResult<&str, MiValue> {
    alt((
        map(c_string, MiValue::Const),
        tuple_value,
        list_value,
        // lists may carry bare `var=value` results; keep the value
        map(result_pair, |(_, v)| v),
    ))(input)
}

fn tuple_value(input: &str) -> IResult<&str, MiValue> {
    map(
        delimited(
            char('{'),
            separated_list0(char(','), result_pair),
            char('}'),
        ),
        |pairs| MiValue::Tuple(pairs.into_iter().collect()),
    )(input)
}

fn list_value(input: &str) -> IResult<&str, MiValue> {
    map(
        delimited(char('['), separated_list0(char(','), mi_value), char(']')),
        MiValue::List,
    )(input)
}

/// A double-quoted MI c-string with backslash escapes (incl. octal).
fn c_string(input: &str) -> IResult<&str, String> {
    let mut rest = match input.strip_prefix('"') {
        Some(rest) => rest,
        None => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Char,
            )));
        }
    };

    let mut out = String::new();
    loop {
        let mut it = rest.chars();
        match it.next() {
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )));
            }
            Some('"') => return Ok((it.as_str(), out)),
            Some('\\') => {
                match it.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(d) if d.is_digit(8) => {
                        let mut v = d.to_digit(8).expect("is octal");
                        for _ in 0..2 {
                            let mut probe = it.clone();
                            match probe.next() {
                                Some(d2) if d2.is_digit(8) => {
                                    v = v * 8 + d2.to_digit(8).expect("is octal");
                                    it = probe;
                                }
                                _ => break,
                            }
                        }
                        if let Some(c) = char::from_u32(v) {
                            out.push(c);
                        }
                    }
                    Some(c) => out.push(c),
                    None => {
                        return Err(nom::Err::Error(nom::error::Error::new(
                            input,
                            nom::error::ErrorKind::Char,
                        )));
                    }
                }
                rest = it.as_str();
            }
            Some(c) => {
                out.push(c);
                rest = it.as_str();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_result_records() {
        let rec = parse_line("^done").unwrap();
        assert!(matches!(
            rec,
            MiRecord::Result {
                class: ResultClass::Done,
                ..
            }
        ));

        let rec = parse_line("42^error,msg=\"No symbol table\"").unwrap();
        match rec {
            MiRecord::Result {
                token,
                class,
                payload,
            } => {
                assert_eq!(token, Some(42));
                assert_eq!(class, ResultClass::Error);
                assert_eq!(payload.str_field("msg"), Some("No symbol table"));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        assert!(matches!(
            parse_line("^running").unwrap(),
            MiRecord::Result {
                class: ResultClass::Running,
                ..
            }
        ));
    }

    #[test]
    fn test_break_insert_payload() {
        let line = r#"^done,bkpt={number="2",type="breakpoint",disp="keep",enabled="y",addr="0x00000000004004b4",func="main",file="retrograde_break.c",line="94",times="0"}"#;
        let rec = parse_line(line).unwrap();
        let MiRecord::Result { payload, .. } = rec else {
            panic!("not a result record");
        };
        let bkpt = payload.get("bkpt").unwrap();
        assert_eq!(bkpt.str_field("number"), Some("2"));
        assert_eq!(bkpt.str_field("line"), Some("94"));
    }

    #[test]
    fn test_stopped_async_record() {
        let line = r#"*stopped,reason="breakpoint-hit",disp="keep",bkptno="1",frame={addr="0x04",func="step_location",args=[]},thread-id="1",stopped-threads="all""#;
        let rec = parse_line(line).unwrap();
        let MiRecord::Async {
            kind,
            class,
            payload,
            ..
        } = rec
        else {
            panic!("not an async record");
        };
        assert_eq!(kind, AsyncKind::Exec);
        assert_eq!(class, "stopped");
        assert_eq!(payload.str_field("reason"), Some("breakpoint-hit"));
        assert_eq!(payload.str_field("bkptno"), Some("1"));
        assert!(matches!(
            payload.get("frame").unwrap().get("args").unwrap(),
            MiValue::List(items) if items.is_empty()
        ));
    }

    #[test]
    fn test_notify_and_stream_records() {
        let rec = parse_line("=thread-group-added,id=\"i1\"").unwrap();
        assert!(matches!(
            rec,
            MiRecord::Async {
                kind: AsyncKind::Notify,
                ..
            }
        ));

        let rec = parse_line(r#"~"Reading symbols...\n""#).unwrap();
        assert_eq!(rec, MiRecord::Stream {
            kind: StreamKind::Console,
            text: "Reading symbols...\n".to_string(),
        });
    }

    #[test]
    fn test_prompt_and_garbage() {
        assert_eq!(parse_line("(gdb) ").unwrap(), MiRecord::Prompt);
        assert!(parse_line("not mi output").is_err());
    }

    #[test]
    fn test_string_escapes() {
        let (_, s) = c_string(r#""a\"b\\c\n\t\040z""#).unwrap();
        assert_eq!(s, "a\"b\\c\n\t z");
    }

    #[test]
    fn test_decode_string_literal() {
        let v = decode_string_literal(r#"0x7ffff3a1e000 "/var/www/index.php""#).unwrap();
        assert_eq!(v, "/var/www/index.php");

        let v = decode_string_literal(r#""with \"escapes\" inside""#).unwrap();
        assert_eq!(v, "with \"escapes\" inside");

        assert!(decode_string_literal("0x0").is_err());
    }

    #[test]
    fn test_nested_lists() {
        let line = r#"^done,stack=[frame={level="0",func="a"},frame={level="1",func="b"}]"#;
        let MiRecord::Result { payload, .. } = parse_line(line).unwrap() else {
            panic!("not a result record");
        };
        let MiValue::List(frames) = payload.get("stack").unwrap() else {
            panic!("stack is not a list");
        };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].str_field("func"), Some("b"));
    }
}
