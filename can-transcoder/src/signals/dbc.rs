//! DBC parser
//!
//! Parses Vector DBC text into a [`NetworkDefinition`]. The parser is lenient:
//! only malformed `BO_`/`SG_` statements are fatal. Every other section
//! (attributes, value tables, environment variables, vendor extensions) is
//! skipped, and the supported extras (`CM_`, `VAL_`, `SIG_VALTYPE_`,
//! `BO_TX_BU_`) are applied when they parse and ignored with a warning when
//! they do not.
//!
//! The text is first split into logical statements (a quoted string may span
//! several lines); each statement is then parsed with `nom` combinators.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till},
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace0, none_of, one_of},
    combinator::{map, map_opt, map_res, opt, recognize, value, verify},
    error::{context, VerboseError, VerboseErrorKind},
    multi::{fold_many0, many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::signals::database::{
    ByteOrder, MessageDefinition, Multiplexing, NetworkDefinition, SignalDefinition, ValueType,
};
use crate::types::{MAX_EXTENDED_ID, MAX_STANDARD_ID};

/// Bit 31 of a DBC message ID marks an extended (29-bit) identifier
const EXTENDED_ID_FLAG: u64 = 0x8000_0000;

/// Placeholder node name meaning "no node"
const NO_NODE: &str = "Vector__XXX";

/// Pseudo message Vector tools use to hold signals not mapped to any frame
const INDEPENDENT_SIGNALS_MSG: &str = "VECTOR__INDEPENDENT_SIG_MSG";

type Res<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

/// (29-bit ID, extended flag)
type MessageKey = (u32, bool);

/// Structural error in a `BO_` or `SG_` statement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    /// 1-based line where the offending statement starts
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }

    /// Build from a combinator failure, reporting the innermost `context` label
    fn syntax(line: usize, keyword: &str, err: nom::Err<VerboseError<&str>>) -> Self {
        let label = match &err {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                e.errors.iter().find_map(|(_, kind)| match kind {
                    VerboseErrorKind::Context(label) => Some(*label),
                    _ => None,
                })
            }
            nom::Err::Incomplete(_) => None,
        };
        Self::new(line, format!("{}: {}", keyword, label.unwrap_or("syntax error")))
    }
}

/// Read a DBC file into a string.
///
/// DBC files exported by Windows tools are frequently Windows-1252; if the
/// content is not valid UTF-8 it is decoded as Latin-1.
pub fn read_dbc_file(path: &Path) -> crate::types::Result<String> {
    let bytes = std::fs::read(path)?;

    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) => {
            log::warn!("DBC file {:?} is not UTF-8, falling back to Latin-1", path);
            Ok(err.into_bytes().iter().map(|&b| b as char).collect())
        }
    }
}

/// Parse DBC source text into a network definition
pub fn parse_dbc(text: &str) -> Result<NetworkDefinition, ParseError> {
    let mut version = None;
    let mut nodes = Vec::new();
    let mut messages: Vec<MessageDefinition> = Vec::new();
    let mut index: HashMap<MessageKey, usize> = HashMap::new();
    let mut extras = Vec::new();

    // Index of the message currently receiving SG_ lines
    let mut current: Option<usize> = None;
    let mut skipping_pseudo_message = false;
    let mut in_ns_block = false;

    for stmt in statements(text.trim_start_matches('\u{feff}')) {
        let body = stmt.text.trim();

        if in_ns_block {
            if stmt.indented {
                continue;
            }
            in_ns_block = false;
        }

        let (args, keyword) = match statement_keyword(body) {
            Ok(split) => split,
            Err(_) => continue,
        };
        if keyword != "SG_" {
            current = None;
            skipping_pseudo_message = false;
        }

        match keyword {
            "VERSION" => match quoted(args) {
                Ok((_, v)) => version = Some(v),
                Err(_) => log::warn!("line {}: ignoring malformed VERSION", stmt.line),
            },
            "NS_" => in_ns_block = true,
            "BU_" => {
                if let Ok((_, list)) = node_list(args) {
                    nodes.extend(list.into_iter().map(str::to_string));
                }
            }
            "BO_" => match parse_message(args, stmt.line)? {
                Some(message) => {
                    let key = (message.id, message.is_extended);
                    if let Some(&previous) = index.get(&key) {
                        return Err(ParseError::new(
                            stmt.line,
                            format!(
                                "duplicate message ID 0x{:X} ({} conflicts with {})",
                                message.id, message.name, messages[previous].name
                            ),
                        ));
                    }
                    index.insert(key, messages.len());
                    current = Some(messages.len());
                    messages.push(message);
                }
                None => skipping_pseudo_message = true,
            },
            "SG_" => {
                if skipping_pseudo_message {
                    continue;
                }
                let idx = current.ok_or_else(|| {
                    ParseError::new(stmt.line, "SG_ statement outside of a BO_ block")
                })?;
                let signal = parse_signal(args, stmt.line)?;
                messages[idx].signals.push(signal);
            }
            "CM_" | "VAL_" | "SIG_VALTYPE_" | "BO_TX_BU_" => match parse_extra(keyword, args) {
                Some(extra) => extras.push((stmt.line, extra)),
                None => log::warn!("line {}: ignoring malformed {} statement", stmt.line, keyword),
            },
            "" => {}
            other => log::debug!("line {}: skipping unsupported section {}", stmt.line, other),
        }
    }

    for (line, extra) in extras {
        apply_extra(&mut messages, &index, line, extra);
    }

    let definition = NetworkDefinition::with_metadata(version, nodes, messages)
        .map_err(|e| ParseError::new(0, e.to_string()))?;

    let stats = definition.stats();
    log::info!(
        "Parsed DBC: {} messages, {} signals",
        stats.num_messages,
        stats.num_signals
    );

    Ok(definition)
}

/// A logical DBC statement; quoted strings may span several physical lines
struct Statement<'a> {
    line: usize,
    indented: bool,
    text: Cow<'a, str>,
}

fn statements(text: &str) -> Vec<Statement<'_>> {
    let mut out = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }

        let indented = line.starts_with(|c: char| c.is_whitespace());
        let mut open_quote = has_open_quote(line, false);
        if !open_quote {
            out.push(Statement {
                line: idx + 1,
                indented,
                text: Cow::Borrowed(line),
            });
            continue;
        }

        let mut joined = line.to_string();
        while open_quote {
            match lines.next() {
                Some((_, next)) => {
                    joined.push('\n');
                    joined.push_str(next);
                    open_quote = has_open_quote(next, true);
                }
                None => break,
            }
        }
        out.push(Statement {
            line: idx + 1,
            indented,
            text: Cow::Owned(joined),
        });
    }

    out
}

/// Track quote state through one line; returns whether a string is still open
fn has_open_quote(line: &str, mut open: bool) -> bool {
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if open => {
                chars.next();
            }
            '"' => open = !open,
            _ => {}
        }
    }
    open
}

/// Split a DBC message ID into (29-bit ID, extended flag)
fn normalize_id(raw: u64) -> Option<MessageKey> {
    if raw > u32::MAX as u64 {
        return None;
    }
    if raw & EXTENDED_ID_FLAG != 0 {
        Some(((raw & MAX_EXTENDED_ID as u64) as u32, true))
    } else if raw <= MAX_EXTENDED_ID as u64 {
        Some((raw as u32, raw > MAX_STANDARD_ID as u64))
    } else {
        None
    }
}

// Lexemes skip leading whitespace, including newlines inside joined statements

/// Leading keyword of a statement: everything up to whitespace or ':'
fn statement_keyword(input: &str) -> Res<'_, &str> {
    take_till(|c: char| c.is_whitespace() || c == ':')(input)
}

fn symbol<'a>(c: char) -> impl FnMut(&'a str) -> Res<'a, char> {
    preceded(multispace0, char(c))
}

fn identifier(input: &str) -> Res<'_, &str> {
    preceded(
        multispace0,
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_")))),
        )),
    )(input)
}

/// An identifier equal to `word`
fn token<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    verify(identifier, move |id: &str| id == word)
}

fn unsigned(input: &str) -> Res<'_, u64> {
    preceded(multispace0, map_res(digit1, str::parse::<u64>))(input)
}

/// DBC numeric literal: `[+-]digits[.digits][(e|E)[+-]digits]`
fn number(input: &str) -> Res<'_, f64> {
    preceded(
        multispace0,
        map_res(
            recognize(tuple((
                opt(one_of("+-")),
                alt((
                    recognize(pair(digit1, opt(pair(char('.'), digit0)))),
                    recognize(pair(char('.'), digit1)),
                )),
                opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
            ))),
            str::parse::<f64>,
        ),
    )(input)
}

/// Double-quoted string; `\"` and `\\` are unescaped, any other backslash is kept
fn quoted(input: &str) -> Res<'_, String> {
    preceded(
        multispace0,
        delimited(
            char('"'),
            fold_many0(
                alt((preceded(char('\\'), one_of("\\\"")), none_of("\""))),
                String::new,
                |mut text, c| {
                    text.push(c);
                    text
                },
            ),
            char('"'),
        ),
    )(input)
}

fn message_id(input: &str) -> Res<'_, MessageKey> {
    map_opt(unsigned, normalize_id)(input)
}

/// `BU_: <node>*`
fn node_list(input: &str) -> Res<'_, Vec<&str>> {
    preceded(opt(symbol(':')), many0(identifier))(input)
}

struct MessageHeader<'a> {
    key: MessageKey,
    name: &'a str,
    size: u64,
    transmitter: Option<&'a str>,
}

/// `BO_ <id> <name>: <size> <transmitter>`
fn message_header(input: &str) -> Res<'_, MessageHeader<'_>> {
    map(
        tuple((
            context("invalid message identifier", message_id),
            context("missing message name", identifier),
            context("expected ':' after name", symbol(':')),
            context("invalid message size", unsigned),
            opt(identifier),
        )),
        |(key, name, _, size, transmitter)| MessageHeader {
            key,
            name,
            size,
            transmitter,
        },
    )(input)
}

struct SignalLine<'a> {
    name: &'a str,
    multiplexing: Multiplexing,
    start_bit: u64,
    length: u64,
    byte_order: ByteOrder,
    value_type: ValueType,
    factor: f64,
    offset: f64,
    min: f64,
    max: f64,
    unit: String,
    receivers: Vec<&'a str>,
}

/// `SG_ <name> [M|mN] : <start>|<len>@<order><sign> (<factor>,<offset>) [<min>|<max>] "<unit>" <receivers>`
fn signal_line(input: &str) -> Res<'_, SignalLine<'_>> {
    map(
        tuple((
            context("missing signal name", identifier),
            opt(mux_indicator),
            context("expected ':' or a multiplexer indicator", symbol(':')),
            bit_position,
            scaling,
            physical_range,
            context("missing unit string", quoted),
            many0(preceded(opt(symbol(',')), identifier)),
        )),
        |(name, multiplexing, _, position, (factor, offset), (min, max), unit, receivers)| {
            let (start_bit, length, byte_order, value_type) = position;
            SignalLine {
                name,
                multiplexing: multiplexing.unwrap_or(Multiplexing::Plain),
                start_bit,
                length,
                byte_order,
                value_type,
                factor,
                offset,
                min,
                max,
                unit,
                receivers,
            }
        },
    )(input)
}

/// `M`, `mN`, or the extended form `mNM`, which is read as `mN`
fn mux_indicator(input: &str) -> Res<'_, Multiplexing> {
    preceded(
        multispace0,
        alt((
            map(
                tuple((char('m'), map_res(digit1, str::parse::<u64>), opt(char('M')))),
                |(_, switch, extended)| {
                    if extended.is_some() {
                        log::debug!("extended multiplexing m{}M treated as simple multiplexing", switch);
                    }
                    Multiplexing::Multiplexed(switch)
                },
            ),
            value(Multiplexing::Multiplexor, char('M')),
        )),
    )(input)
}

/// `<start>|<length>@<order><sign>`
fn bit_position(input: &str) -> Res<'_, (u64, u64, ByteOrder, ValueType)> {
    map(
        tuple((
            context("invalid start bit", unsigned),
            context("expected '|' after start bit", symbol('|')),
            context("invalid bit length", unsigned),
            context("expected '@' before byte order", symbol('@')),
            context(
                "byte order must be 0 or 1",
                preceded(
                    multispace0,
                    alt((
                        value(ByteOrder::LittleEndian, char('1')),
                        value(ByteOrder::BigEndian, char('0')),
                    )),
                ),
            ),
            context(
                "sign must be '+' or '-'",
                alt((
                    value(ValueType::Unsigned, char('+')),
                    value(ValueType::Signed, char('-')),
                )),
            ),
        )),
        |(start, _, length, _, order, sign)| (start, length, order, sign),
    )(input)
}

/// `(<factor>,<offset>)`
fn scaling(input: &str) -> Res<'_, (f64, f64)> {
    map(
        tuple((
            context("expected '(' before factor", symbol('(')),
            context("non-numeric factor", number),
            context("expected ',' after factor", symbol(',')),
            context("non-numeric offset", number),
            context("expected ')' after offset", symbol(')')),
        )),
        |(_, factor, _, offset, _)| (factor, offset),
    )(input)
}

/// `[<min>|<max>]`
fn physical_range(input: &str) -> Res<'_, (f64, f64)> {
    map(
        tuple((
            context("expected '[' before range", symbol('[')),
            context("non-numeric minimum", number),
            context("expected '|' in range", symbol('|')),
            context("non-numeric maximum", number),
            context("expected ']' after range", symbol(']')),
        )),
        |(_, min, _, max, _)| (min, max),
    )(input)
}

/// `None` for the independent-signals pseudo message
fn parse_message(input: &str, line: usize) -> Result<Option<MessageDefinition>, ParseError> {
    let (_, header) = message_header(input).map_err(|e| ParseError::syntax(line, "BO_", e))?;

    if header.name == INDEPENDENT_SIGNALS_MSG {
        log::debug!("line {}: skipping {}", line, INDEPENDENT_SIGNALS_MSG);
        return Ok(None);
    }

    let (id, is_extended) = header.key;
    let mut message = MessageDefinition::new(id, header.name, header.size as usize);
    message.is_extended = is_extended;
    message.transmitter = header
        .transmitter
        .filter(|t| *t != NO_NODE)
        .map(str::to_string);
    Ok(Some(message))
}

/// Parse an `SG_` statement and check the values the grammar cannot
fn parse_signal(input: &str, line: usize) -> Result<SignalDefinition, ParseError> {
    let (_, sig) = signal_line(input).map_err(|e| ParseError::syntax(line, "SG_", e))?;
    let err = |what: String| ParseError::new(line, format!("SG_ {}: {}", sig.name, what));

    if sig.start_bit > 63 {
        return Err(err(format!("start bit {} out of range 0-63", sig.start_bit)));
    }
    if !(1..=64).contains(&sig.length) {
        return Err(err(format!("bit length {} out of range 1-64", sig.length)));
    }
    if sig.factor.abs() <= f64::EPSILON {
        return Err(err("factor must be non-zero".to_string()));
    }

    let mut signal =
        SignalDefinition::new(sig.name, sig.start_bit as u16, sig.length as u16, sig.byte_order)
            .with_value_type(sig.value_type)
            .with_scaling(sig.factor, sig.offset)
            .with_range(sig.min, sig.max)
            .with_unit(sig.unit)
            .with_multiplexing(sig.multiplexing);
    signal.receivers = sig
        .receivers
        .into_iter()
        .filter(|node| *node != NO_NODE)
        .map(str::to_string)
        .collect();
    Ok(signal)
}

/// Optional statements applied once every message is known
#[derive(Debug, Clone, PartialEq)]
enum Extra {
    /// Well-formed but not kept (network, node and environment comments)
    Skipped(&'static str),
    MessageComment {
        message: MessageKey,
        text: String,
    },
    SignalComment {
        message: MessageKey,
        signal: String,
        text: String,
    },
    ValueDescriptions {
        message: MessageKey,
        signal: String,
        values: Vec<(i64, String)>,
    },
    ValueType {
        message: MessageKey,
        signal: String,
        kind: u64,
    },
    Transmitters {
        message: MessageKey,
        nodes: Vec<String>,
    },
}

fn parse_extra(keyword: &str, input: &str) -> Option<Extra> {
    let result = match keyword {
        "CM_" => comment(input),
        "VAL_" => value_descriptions(input),
        "SIG_VALTYPE_" => signal_value_type(input),
        "BO_TX_BU_" => transmitters(input),
        _ => return None,
    };
    result.ok().map(|(_, extra)| extra)
}

/// `CM_ "<text>"`, `CM_ BO_ <id> "<text>"`, `CM_ SG_ <id> <signal> "<text>"`, `CM_ BU_|EV_ ...`
fn comment(input: &str) -> Res<'_, Extra> {
    alt((
        map(quoted, |_| Extra::Skipped("network comment")),
        map(
            preceded(token("BO_"), pair(message_id, quoted)),
            |(message, text)| Extra::MessageComment { message, text },
        ),
        map(
            preceded(token("SG_"), tuple((message_id, identifier, quoted))),
            |(message, signal, text)| Extra::SignalComment {
                message,
                signal: signal.to_string(),
                text,
            },
        ),
        map(alt((token("BU_"), token("EV_"))), |_| {
            Extra::Skipped("node or environment comment")
        }),
    ))(input)
}

/// `VAL_ <id> <signal> (<raw> "<text>")* ;`, or `VAL_ <env var> ...` which is skipped
fn value_descriptions(input: &str) -> Res<'_, Extra> {
    alt((
        map(
            tuple((message_id, identifier, many0(pair(number, quoted)))),
            |(message, signal, values)| Extra::ValueDescriptions {
                message,
                signal: signal.to_string(),
                values: values
                    .into_iter()
                    .map(|(raw, text)| (raw as i64, text))
                    .collect(),
            },
        ),
        map(identifier, |_| {
            Extra::Skipped("environment variable value table")
        }),
    ))(input)
}

/// `SIG_VALTYPE_ <id> <signal> : <kind> ;`
fn signal_value_type(input: &str) -> Res<'_, Extra> {
    map(
        tuple((message_id, identifier, opt(symbol(':')), unsigned)),
        |(message, signal, _, kind)| Extra::ValueType {
            message,
            signal: signal.to_string(),
            kind,
        },
    )(input)
}

/// `BO_TX_BU_ <id> : <node>,<node>... ;`
fn transmitters(input: &str) -> Res<'_, Extra> {
    map(
        tuple((message_id, symbol(':'), separated_list0(symbol(','), identifier))),
        |(message, _, nodes)| Extra::Transmitters {
            message,
            nodes: nodes.into_iter().map(str::to_string).collect(),
        },
    )(input)
}

fn apply_extra(
    messages: &mut [MessageDefinition],
    index: &HashMap<MessageKey, usize>,
    line: usize,
    extra: Extra,
) {
    let key = match &extra {
        Extra::Skipped(what) => {
            log::debug!("line {}: skipping {}", line, what);
            return;
        }
        Extra::MessageComment { message, .. }
        | Extra::SignalComment { message, .. }
        | Extra::ValueDescriptions { message, .. }
        | Extra::ValueType { message, .. }
        | Extra::Transmitters { message, .. } => *message,
    };
    let Some(&idx) = index.get(&key) else {
        log::warn!("line {}: reference to unknown message ID 0x{:X}", line, key.0);
        return;
    };
    let message = &mut messages[idx];

    match extra {
        Extra::Skipped(_) => {}
        Extra::MessageComment { text, .. } => message.comment = Some(text),
        Extra::Transmitters { nodes, .. } => message.extra_transmitters = nodes,
        Extra::SignalComment { signal, text, .. } => match message.signal_mut(&signal) {
            Some(sig) => sig.comment = Some(text),
            None => log::warn!("line {}: comment for unknown signal {}", line, signal),
        },
        Extra::ValueDescriptions { signal, values, .. } => match message.signal_mut(&signal) {
            Some(sig) => sig.value_descriptions = values.into_iter().collect(),
            None => log::warn!("line {}: value table for unknown signal {}", line, signal),
        },
        Extra::ValueType { signal, kind, .. } => match message.signal_mut(&signal) {
            Some(sig) => match (kind, sig.length()) {
                (0, _) => {}
                (1, 32) => sig.value_type = ValueType::Float32,
                (2, 64) => sig.value_type = ValueType::Float64,
                (kind, length) => log::warn!(
                    "line {}: SIG_VALTYPE_ {} does not fit {}-bit signal {}",
                    line,
                    kind,
                    length,
                    signal
                ),
            },
            None => log::warn!("line {}: value type for unknown signal {}", line, signal),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENGINE_DBC: &str = r#"
VERSION "1.0"

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_
    SIG_VALTYPE_
    BO_TX_BU_
    SG_MUL_VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2,ECU1

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let net = parse_dbc(ENGINE_DBC).unwrap();

        assert_eq!(net.version(), Some("1.0"));
        assert_eq!(net.nodes(), &["ECU1".to_string(), "ECU2".to_string()]);
        assert_eq!(net.messages().len(), 2);

        let msg1 = net.message(291).unwrap();
        assert_eq!(msg1.name, "EngineData");
        assert_eq!(msg1.size, 8);
        assert_eq!(msg1.transmitter, Some("ECU1".to_string()));
        assert_eq!(msg1.signals.len(), 2);

        let sig1 = &msg1.signals[0];
        assert_eq!(sig1.name, "EngineSpeed");
        assert_eq!(sig1.start_bit(), 0);
        assert_eq!(sig1.length(), 16);
        assert_eq!(sig1.byte_order(), ByteOrder::LittleEndian);
        assert_eq!(sig1.value_type, ValueType::Unsigned);
        assert_eq!(sig1.factor, 1.0);
        assert_eq!(sig1.offset, 0.0);
        assert_eq!(sig1.max, 8000.0);
        assert_eq!(sig1.unit, Some("rpm".to_string()));

        let temp = msg1.signal("EngineTemp").unwrap();
        assert_eq!(temp.offset, -40.0);
        assert_eq!(temp.receivers, vec!["ECU2".to_string(), "ECU1".to_string()]);

        let volt = &net.message(512).unwrap().signals[0];
        assert_eq!(volt.factor, 0.01);
    }

    #[test]
    fn test_parse_is_deterministic() {
        assert_eq!(parse_dbc(ENGINE_DBC).unwrap(), parse_dbc(ENGINE_DBC).unwrap());
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let dbc = r#"
BO_ 512 MultiplexedMsg: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" ECU1
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" ECU1
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" ECU1
"#;
        let net = parse_dbc(dbc).unwrap();
        let msg = net.message(512).unwrap();
        assert!(msg.is_multiplexed());
        assert_eq!(msg.multiplexor().unwrap().name, "Mode");
        assert_eq!(msg.signal("Mode").unwrap().unit, None);
        assert_eq!(
            msg.signal("SignalB").unwrap().multiplexing,
            Multiplexing::Multiplexed(1)
        );
    }

    #[test]
    fn test_motorola_signed_and_exponent_literals() {
        let dbc = r#"
BO_ 100 Chassis: 8 Vector__XXX
 SG_ YawRate : 7|16@0- (1E-002,-2.5e+1) [-327.68|327.67] "deg/s" Vector__XXX
"#;
        let net = parse_dbc(dbc).unwrap();
        let msg = net.message(100).unwrap();
        assert_eq!(msg.transmitter, None);
        let sig = &msg.signals[0];
        assert_eq!(sig.byte_order(), ByteOrder::BigEndian);
        assert_eq!(sig.value_type, ValueType::Signed);
        assert!((sig.factor - 0.01).abs() < 1e-12);
        assert_eq!(sig.offset, -25.0);
        assert_eq!(sig.min, -327.68);
        assert!(sig.receivers.is_empty());
    }

    #[test]
    fn test_extended_identifier() {
        let dbc = "BO_ 2566844926 J1939Msg: 8 Vector__XXX\n SG_ S : 0|8@1+ (1,0) [0|0] \"\" Vector__XXX\n";
        let net = parse_dbc(dbc).unwrap();
        let msg = net.message(0x18FE_F1FE).unwrap();
        assert!(msg.is_extended);
        assert_eq!(msg.name, "J1939Msg");
    }

    #[test]
    fn test_unknown_sections_are_skipped() {
        let dbc = r#"
VERSION ""
BS_:
BU_: A
VAL_TABLE_ Gears 0 "P" 1 "R" 2 "N" 3 "D" ;
BO_ 100 Speed: 8 A
 SG_ VehicleSpeed : 0|16@1+ (0.01,0) [0|655.35] "km/h" A
BA_DEF_ BO_ "GenMsgCycleTime" INT 0 65535;
BA_DEF_DEF_ "GenMsgCycleTime" 100;
BA_ "GenMsgCycleTime" BO_ 100 20;
EV_ Env: 0 [0|1] "" 0 1 DUMMY_NODE_VECTOR0 Vector__XXX;
SG_MUL_VAL_ 100 X Y 0-0;
VENDOR_THING_ whatever this is { } ;
CM_ SG_ 100 VehicleSpeed "Vehicle speed
spanning lines, mentions SG_ Fake : 0|8@1+ (1,0) [0|1] inside";
CM_ BO_ 100 "Speed frame";
CM_ "network comment";
VAL_ 100 VehicleSpeed 0 "Stopped" ;
"#;
        let net = parse_dbc(dbc).unwrap();
        let msg = net.message(100).unwrap();
        assert_eq!(msg.signals.len(), 1);
        assert_eq!(msg.comment.as_deref(), Some("Speed frame"));

        let sig = msg.signal("VehicleSpeed").unwrap();
        assert!(sig.comment.as_deref().unwrap().contains("spanning lines"));
        assert_eq!(sig.describe(0), Some("Stopped"));
    }

    #[test]
    fn test_extras_for_unknown_targets_are_ignored() {
        let dbc = r#"
BO_ 100 Speed: 8 A
 SG_ S : 0|8@1+ (1,0) [0|0] "" A
CM_ BO_ 999 "no such message";
VAL_ 100 Missing 0 "x" ;
SIG_VALTYPE_ 100 S : 1;
"#;
        let net = parse_dbc(dbc).unwrap();
        // Float32 needs a 32-bit signal, so S stays an integer
        assert_eq!(net.message(100).unwrap().signals[0].value_type, ValueType::Unsigned);
    }

    #[test]
    fn test_sig_valtype_float() {
        let dbc = r#"
BO_ 300 Floats: 8 A
 SG_ F32 : 0|32@1- (1,0) [0|0] "" A
 SG_ F64 : 0|64@1- (1,0) [0|0] "" A
SIG_VALTYPE_ 300 F32 : 1;
SIG_VALTYPE_ 300 F64 : 2;
BO_TX_BU_ 300 : A,B;
"#;
        let net = parse_dbc(dbc).unwrap();
        let msg = net.message(300).unwrap();
        assert_eq!(msg.signals[0].value_type, ValueType::Float32);
        assert_eq!(msg.signals[1].value_type, ValueType::Float64);
        assert_eq!(msg.extra_transmitters, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_independent_signal_message_skipped() {
        let dbc = r#"
BO_ 3221225472 VECTOR__INDEPENDENT_SIG_MSG: 0 Vector__XXX
 SG_ Orphan : 0|8@1+ (1,0) [0|0] "" Vector__XXX
BO_ 1 Real: 1 Vector__XXX
"#;
        let net = parse_dbc(dbc).unwrap();
        assert_eq!(net.messages().len(), 1);
        assert!(net.message(0).is_none());
    }

    #[test]
    fn test_malformed_statements_fail() {
        let cases = [
            ("BO_ abc Speed: 8 A", "invalid message identifier"),
            ("BO_ 1 Speed: x A", "invalid message size"),
            (
                "BO_ 1 M: 8 A\n SG_ S : 64|8@1+ (1,0) [0|0] \"\" A",
                "out of range 0-63",
            ),
            (
                "BO_ 1 M: 8 A\n SG_ S : 0|0@1+ (1,0) [0|0] \"\" A",
                "out of range 1-64",
            ),
            (
                "BO_ 1 M: 8 A\n SG_ S : 0|8@2+ (1,0) [0|0] \"\" A",
                "byte order",
            ),
            (
                "BO_ 1 M: 8 A\n SG_ S : 0|8@1+ (abc,0) [0|0] \"\" A",
                "non-numeric factor",
            ),
            (
                "BO_ 1 M: 8 A\n SG_ S : 0|8@1+ (1,x) [0|0] \"\" A",
                "non-numeric offset",
            ),
            (
                "BO_ 1 M: 8 A\n SG_ S : 0|8@1+ (0,0) [0|0] \"\" A",
                "non-zero",
            ),
            (" SG_ S : 0|8@1+ (1,0) [0|0] \"\" A", "outside of a BO_"),
            ("BO_ 1 A: 8 X\nBO_ 1 B: 8 X", "duplicate message ID"),
        ];

        for (dbc, expected) in cases {
            let err = parse_dbc(dbc).unwrap_err();
            assert!(
                err.message.contains(expected),
                "{:?} -> {:?}, expected {:?}",
                dbc,
                err,
                expected
            );
        }
    }

    #[test]
    fn test_error_reports_line() {
        let dbc = "VERSION \"\"\n\nBO_ 1 M: 8 A\n SG_ S : 0|8@1+ (1,0) [0|0] \"\" A\n SG_ T : 99|8@1+ (1,0) [0|0] \"\" A\n";
        let err = parse_dbc(dbc).unwrap_err();
        assert_eq!(err.line, 5);
    }

    #[test]
    fn test_quoted_escapes_and_extended_mux() {
        let dbc = r#"
BO_ 600 Mux: 8 A
 SG_ Switch M : 0|8@1+ (1,0) [0|0] "" A
 SG_ Inner m2M : 8|8@1+ (1,0) [0|0] "" A
CM_ SG_ 600 Inner "say \"hi\" at C:\temp";
"#;
        let net = parse_dbc(dbc).unwrap();
        let inner = net.message(600).unwrap().signal("Inner").unwrap();
        assert_eq!(inner.multiplexing, Multiplexing::Multiplexed(2));
        assert_eq!(inner.comment.as_deref(), Some(r#"say "hi" at C:\temp"#));
    }

    #[test]
    fn test_same_id_standard_and_extended() {
        let dbc = r#"
BO_ 512 Standard: 8 A
 SG_ S : 0|8@1+ (1,0) [0|0] "" A
BO_ 2147484160 Extended: 8 A
 SG_ E : 0|8@1+ (1,0) [0|0] "" A
CM_ BO_ 2147484160 "the extended one";
"#;
        let net = parse_dbc(dbc).unwrap();
        assert_eq!(net.lookup(512, false).unwrap().name, "Standard");
        let extended = net.lookup(512, true).unwrap();
        assert_eq!(extended.name, "Extended");
        assert_eq!(extended.comment.as_deref(), Some("the extended one"));
        assert!(net.lookup(512, false).unwrap().comment.is_none());
    }

    #[test]
    fn test_lexemes() {
        assert_eq!(number(" -2.5e+1,").unwrap(), (",", -25.0));
        assert_eq!(number(".5]").unwrap(), ("]", 0.5));
        assert!(number("abc").is_err());
        assert_eq!(quoted(" \"\"").unwrap(), ("", String::new()));
        assert!(quoted("\"unterminated").is_err());
        assert_eq!(message_id("2147484160").unwrap().1, (0x200, true));
        assert!(message_id("4294967296").is_err());
    }

    #[test]
    fn test_read_latin1_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        // "°C" in Latin-1
        file.write_all(b"BO_ 1 M: 8 A\n SG_ T : 0|8@1+ (1,0) [0|0] \"\xB0C\" A\n")
            .unwrap();
        file.flush().unwrap();

        let text = read_dbc_file(file.path()).unwrap();
        let net = parse_dbc(&text).unwrap();
        assert_eq!(net.message(1).unwrap().signals[0].unit.as_deref(), Some("°C"));
    }
}
