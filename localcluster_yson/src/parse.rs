/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Parser for the text YSON subset written by
//! [`crate::to_string_pretty`].
//! ```text
//! node        ::= map | list | string | entity | boolean | number | identifier
//! map         ::= "{" ( pair ( ";" pair )* ";"? )? "}"
//! pair        ::= ( string | identifier ) "=" node
//! list        ::= "[" ( node ( ";" node )* ";"? )? "]"
//! string      ::= '"' ( char | escape )* '"'
//! escape      ::= "\" ( '"' | "\" | "n" | "t" | "r" | "x" hex hex )
//! entity      ::= "#"
//! boolean     ::= "%true" | "%false"
//! number      ::= [+-]? digit+ ( "." digit* )? ( [eE] [+-]? digit+ )? "u"?
//! identifier  ::= [A-Za-z_] [A-Za-z0-9_.-]*
//! ```
//!
//! Whitespace is admitted between all tokens.

use nom::IResult;
use nom::Parser;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::bytes::complete::take_while;
use nom::bytes::complete::take_while_m_n;
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::character::complete::digit0;
use nom::character::complete::digit1;
use nom::character::complete::multispace0;
use nom::character::complete::one_of;
use nom::combinator::all_consuming;
use nom::combinator::map;
use nom::combinator::map_res;
use nom::combinator::opt;
use nom::combinator::recognize;
use nom::combinator::value;
use nom::error::Error;
use nom::error::ErrorKind;
use nom::multi::separated_list0;
use nom::sequence::delimited;
use nom::sequence::preceded;
use nom::sequence::separated_pair;
use nom::sequence::terminated;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;

/// A YSON document could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid yson at byte {offset}: {message}")]
pub struct ParseError {
    /// Byte offset into the input where parsing stopped.
    pub offset: usize,
    /// What the parser was attempting at that point.
    pub message: String,
}

/// Parse a complete text YSON document.
pub fn from_str(input: &str) -> Result<Value, ParseError> {
    match all_consuming(ws(node)).parse(input) {
        Ok((_, value)) => Ok(value),
        Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => Err(ParseError {
            offset: input.len() - err.input.len(),
            message: format!("{:?}", err.code),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ParseError {
            offset: input.len(),
            message: "unexpected end of input".to_string(),
        }),
    }
}

fn ws<'a, O, P>(inner: P) -> impl Parser<&'a str, Output = O, Error = Error<&'a str>>
where
    P: Parser<&'a str, Output = O, Error = Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn node(input: &str) -> IResult<&str, Value> {
    alt((
        map(map_node, Value::Object),
        map(list_node, Value::Array),
        map(quoted_string, Value::String),
        value(Value::Null, char('#')),
        value(Value::Bool(true), tag("%true")),
        value(Value::Bool(false), tag("%false")),
        number,
        map(identifier, |s: &str| Value::String(s.to_string())),
    ))
    .parse(input)
}

fn map_node(input: &str) -> IResult<&str, Map<String, Value>> {
    map(
        delimited(
            char('{'),
            terminated(
                separated_list0(ws(char(';')), key_value),
                opt(ws(char(';'))),
            ),
            preceded(multispace0, char('}')),
        ),
        |pairs| pairs.into_iter().collect(),
    )
    .parse(input)
}

fn key_value(input: &str) -> IResult<&str, (String, Value)> {
    separated_pair(
        ws(alt((quoted_string, map(identifier, str::to_string)))),
        char('='),
        ws(node),
    )
    .parse(input)
}

fn list_node(input: &str) -> IResult<&str, Vec<Value>> {
    delimited(
        char('['),
        terminated(
            separated_list0(ws(char(';')), ws(node)),
            opt(ws(char(';'))),
        ),
        preceded(multispace0, char(']')),
    )
    .parse(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize((
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')),
    ))
    .parse(input)
}

fn number(input: &str) -> IResult<&str, Value> {
    let (rest, (text, unsigned)) = (
        recognize((
            opt(one_of("+-")),
            digit1,
            opt((char('.'), digit0)),
            opt((one_of("eE"), opt(one_of("+-")), digit1)),
        )),
        opt(char('u')),
    )
        .parse(input)?;

    let parsed = if text.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    } else if unsigned.is_some() {
        text.parse::<u64>().ok().map(Value::from)
    } else {
        text.parse::<i64>().ok().map(Value::from)
    };

    match parsed {
        Some(value) => Ok((rest, value)),
        None => Err(nom::Err::Error(Error::new(input, ErrorKind::Digit))),
    }
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"').parse(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            // Unterminated: nothing else can match here, so don't backtrack.
            None => return Err(nom::Err::Failure(Error::new(rest, ErrorKind::Char))),
            Some('"') => return Ok((chars.as_str(), out)),
            Some('\\') => {
                let (after, c) = escape(chars.as_str())?;
                out.push(c);
                rest = after;
            }
            Some(c) => {
                out.push(c);
                rest = chars.as_str();
            }
        }
    }
}

fn escape(input: &str) -> IResult<&str, char> {
    alt((
        value('"', char('"')),
        value('\\', char('\\')),
        value('\n', char('n')),
        value('\t', char('t')),
        value('\r', char('r')),
        preceded(
            char('x'),
            map_res(
                take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
                |hex: &str| u8::from_str_radix(hex, 16).map(char::from),
            ),
        ),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(from_str("#").unwrap(), Value::Null);
        assert_eq!(from_str(" %true ").unwrap(), json!(true));
        assert_eq!(from_str("%false").unwrap(), json!(false));
        assert_eq!(from_str("-42").unwrap(), json!(-42));
        assert_eq!(from_str("42u").unwrap(), json!(42u64));
        assert_eq!(from_str("1.").unwrap(), json!(1.0));
        assert_eq!(from_str("2.5e3").unwrap(), json!(2500.0));
        assert_eq!(from_str("localhost").unwrap(), json!("localhost"));
        assert_eq!(
            from_str(r#""a\"b\\c\n\x41""#).unwrap(),
            json!("a\"b\\c\nA")
        );
    }

    #[test]
    fn test_compact_and_trailing_separators() {
        assert_eq!(
            from_str("{a=1;b=[x;y;];c={};}").unwrap(),
            json!({"a": 1, "b": ["x", "y"], "c": {}})
        );
        assert_eq!(from_str("[ ]").unwrap(), json!([]));
        assert_eq!(
            from_str("{ \"rpc_port\" = 9013 ; \"tags\" = [ 1 ; 2 ] }").unwrap(),
            json!({"rpc_port": 9013, "tags": [1, 2]})
        );
    }

    #[test]
    fn test_rejects_garbage() {
        let err = from_str("{a=1} trailing").unwrap_err();
        assert_eq!(err.offset, 6);
        assert!(from_str("\"unterminated").is_err());
        assert!(from_str("<attr=1>5").is_err());
        assert!(from_str("{a=}").is_err());
        assert!(from_str("99999999999999999999").is_err());
    }
}
