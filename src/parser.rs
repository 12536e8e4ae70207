//! Filter expressions for the CLI and the wire protocol.
//!
//! ```text
//! category = 'Shipping' AND lang = en AND created >= 2024-09-01 AND created < 2024-10-01
//! ```
//!
//! Every clause is ANDed. `created` bounds build the creation-time range; any other key is
//! an equality test against record metadata.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, not, opt, recognize},
    error::ErrorKind,
    multi::separated_list1,
    sequence::{delimited, pair, terminated, tuple},
    IResult,
};

use crate::error::{KairosError, Result};
use crate::filter::{SearchFilter, TimeRange};
use crate::model::MetaValue;

pub const TIME_KEY: &str = "created";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Date(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    key: String,
    op: Op,
    value: Literal,
}

// --- BASIC PARSERS ---

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn parse_key(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')),
    ))(input)
}

fn parse_op(input: &str) -> IResult<&str, Op> {
    alt((
        map(tag(">="), |_| Op::Ge),
        map(tag("<="), |_| Op::Le),
        map(tag(">"), |_| Op::Gt),
        map(tag("<"), |_| Op::Lt),
        map(tag("=="), |_| Op::Eq),
        map(tag("="), |_| Op::Eq),
    ))(input)
}

fn parse_quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
    ))(input)
}

fn parse_date(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        digit1,
        char('-'),
        digit1,
        char('-'),
        digit1,
        opt(pair(
            alt((char('T'), char('t'))),
            take_while1(|c: char| c.is_ascii_digit() || matches!(c, ':' | '.' | '+' | '-' | 'Z' | 'z')),
        )),
    )))(input)
}

fn parse_number(input: &str) -> IResult<&str, Literal> {
    let (rest, raw) = recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1)))))(input)?;
    let fail = |kind| nom::Err::Error(nom::error::Error::new(input, kind));
    let lit = if raw.contains('.') {
        Literal::Float(raw.parse().map_err(|_| fail(ErrorKind::Float))?)
    } else {
        Literal::Int(raw.parse().map_err(|_| fail(ErrorKind::Digit))?)
    };
    Ok((rest, lit))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn parse_word(input: &str) -> IResult<&str, &str> {
    take_while1(is_word_char)(input)
}

/// Succeeds without consuming when the next char cannot continue a bare word.
fn word_end(input: &str) -> IResult<&str, ()> {
    not(satisfy(is_word_char))(input)
}

// Typed literals only match whole tokens: `1.2.3`, `12ab` and `trueish` fall through to text.
fn parse_literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(parse_quoted, |s| Literal::Text(s.to_string())),
        map(terminated(parse_date, word_end), |s| Literal::Date(s.to_string())),
        terminated(parse_number, word_end),
        map(terminated(tag_no_case("true"), word_end), |_| Literal::Bool(true)),
        map(terminated(tag_no_case("false"), word_end), |_| Literal::Bool(false)),
        map(parse_word, |s| Literal::Text(s.to_string())),
    ))(input)
}

fn parse_clause(input: &str) -> IResult<&str, Clause> {
    let (input, (key, op, value)) = tuple((ws(parse_key), parse_op, ws(parse_literal)))(input)?;
    Ok((input, Clause { key: key.to_string(), op, value }))
}

// --- SEMANTICS ---

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| KairosError::Parse(format!("'{}' is not a date (YYYY-MM-DD) or RFC 3339 timestamp", raw)))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| KairosError::Parse(format!("'{}' has no midnight", raw)))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn literal_time(lit: &Literal) -> Result<DateTime<Utc>> {
    match lit {
        Literal::Date(s) | Literal::Text(s) => parse_time(s),
        other => Err(KairosError::Parse(format!("'{}' needs a date, got {:?}", TIME_KEY, other))),
    }
}

fn literal_meta(lit: Literal) -> MetaValue {
    match lit {
        Literal::Text(s) | Literal::Date(s) => MetaValue::Str(s),
        Literal::Int(i) => MetaValue::Int(i),
        Literal::Float(x) => MetaValue::Float(x),
        Literal::Bool(b) => MetaValue::Bool(b),
    }
}

pub fn parse_filter(input: &str) -> Result<SearchFilter> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(SearchFilter::default());
    }

    let clauses = match all_consuming(separated_list1(tag_no_case("AND"), parse_clause))(input) {
        Ok((_, clauses)) => clauses,
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            let context = if e.input.chars().count() > 20 { format!("{}...", context) } else { context };
            return Err(KairosError::Parse(format!("invalid syntax near: '{}'", context)));
        }
        Err(nom::Err::Incomplete(_)) => return Err(KairosError::Parse("incomplete filter".into())),
    };

    let mut filter = SearchFilter::default();
    let mut start: Option<DateTime<Utc>> = None;
    let mut end: Option<DateTime<Utc>> = None;
    let one_ms = Duration::milliseconds(1);

    for clause in clauses {
        if clause.key.eq_ignore_ascii_case(TIME_KEY) {
            let t = literal_time(&clause.value)?;
            let (lo, hi) = match clause.op {
                Op::Ge => (Some(t), None),
                Op::Gt => (Some(t + one_ms), None),
                Op::Lt => (None, Some(t)),
                Op::Le => (None, Some(t + one_ms)),
                Op::Eq => {
                    return Err(KairosError::Parse(format!("'{}' takes range operators (>=, >, <, <=)", TIME_KEY)));
                }
            };
            // Repeated bounds tighten the range.
            start = start.max(lo).or(lo);
            end = match (end, hi) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        } else {
            if clause.op != Op::Eq {
                return Err(KairosError::Parse(format!("metadata key '{}' only supports '='", clause.key)));
            }
            let metadata = std::mem::take(&mut filter.metadata);
            filter.metadata = metadata.with(clause.key, literal_meta(clause.value));
        }
    }

    if start.is_some() || end.is_some() {
        filter.time_range = Some(TimeRange::new(
            start.unwrap_or(DateTime::<Utc>::MIN_UTC),
            end.unwrap_or(DateTime::<Utc>::MAX_UTC),
        )?);
    }
    Ok(filter)
}
