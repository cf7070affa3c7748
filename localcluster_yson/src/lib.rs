/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Text YSON codec for configuration documents.
//!
//! Configuration documents are held as [`serde_json::Value`] trees and
//! persisted as pretty-printed text YSON:
//!
//! ```text
//! {
//!     "address_resolver" = {
//!         "localhost_fqdn" = "localhost";
//!     };
//!     "port" = 10012;
//!     "rpc_port" = 10013u;
//!     "timeout" = 0.5;
//!     "enable" = %true;
//!     "peer" = #;
//! }
//! ```
//!
//! The writer is canonical: map keys come out in the order of the
//! underlying map (sorted, for `serde_json::Map`), and doubles always
//! carry a `.` or an exponent so that they read back as doubles. As a
//! consequence, a document read from disk and written again reproduces
//! the original bytes.
//!
//! Attributes (`<a=b>value`) and stream fragments are not supported;
//! the parser rejects them.

mod parse;

use std::fmt::Write as _;

pub use parse::ParseError;
pub use parse::from_str;
use serde_json::Number;
use serde_json::Value;

const INDENT: &str = "    ";

/// Render `value` as pretty text YSON, terminated by a newline.
pub fn to_string_pretty(value: &Value) -> String {
    let mut out = String::new();
    write_node(&mut out, value, 0);
    out.push('\n');
    out
}

fn write_node(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Null => out.push('#'),
        Value::Bool(true) => out.push_str("%true"),
        Value::Bool(false) => out.push_str("%false"),
        Value::Number(number) => write_number(out, number),
        Value::String(string) => write_string(out, string),
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            out.push_str("[\n");
            for item in items {
                indent(out, depth + 1);
                write_node(out, item, depth + 1);
                out.push_str(";\n");
            }
            indent(out, depth);
            out.push(']');
        }
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Object(map) => {
            out.push_str("{\n");
            for (key, item) in map {
                indent(out, depth + 1);
                write_string(out, key);
                out.push_str(" = ");
                write_node(out, item, depth + 1);
                out.push_str(";\n");
            }
            indent(out, depth);
            out.push('}');
        }
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn write_number(out: &mut String, number: &Number) {
    // Writing to a String cannot fail.
    if let Some(signed) = number.as_i64() {
        let _ = write!(out, "{}", signed);
    } else if let Some(unsigned) = number.as_u64() {
        let _ = write!(out, "{}u", unsigned);
    } else if let Some(double) = number.as_f64() {
        // Debug formatting keeps a trailing ".0" on integral doubles.
        let _ = write!(out, "{:?}", double);
    }
}

fn write_string(out: &mut String, string: &str) {
    out.push('"');
    for c in string.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
