use crate::bdoc::{BdocView, Kind};
use crate::node::JsonNode;

/// JSON printer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrintFlags {
    /// Two-space indentation and newlines.
    pub pretty: bool,
    /// Escape all non-ASCII characters as `\uXXXX`.
    pub codepoints: bool,
}

impl PrintFlags {
    pub const PLAIN: PrintFlags = PrintFlags {
        pretty: false,
        codepoints: false,
    };
    pub const PRETTY: PrintFlags = PrintFlags {
        pretty: true,
        codepoints: false,
    };
}

pub fn print_node(node: &JsonNode, flags: PrintFlags) -> String {
    let mut out = String::with_capacity(128);
    write_node(&mut out, node, flags, 0);
    out
}

pub fn print_packed(view: BdocView<'_>, flags: PrintFlags) -> String {
    let mut out = String::with_capacity(view.total_size() * 2);
    write_packed(&mut out, view, flags, 0);
    out
}

fn write_node(out: &mut String, node: &JsonNode, flags: PrintFlags, depth: usize) {
    match node {
        JsonNode::Null => out.push_str("null"),
        JsonNode::Bool(true) => out.push_str("true"),
        JsonNode::Bool(false) => out.push_str("false"),
        JsonNode::I64(v) => out.push_str(&v.to_string()),
        JsonNode::F64(v) => write_f64(out, *v),
        JsonNode::String(s) => write_string(out, s, flags),
        JsonNode::Binary(b) => write_binary(out, b),
        JsonNode::Array(items) => {
            open(out, '[', items.is_empty(), flags, depth);
            for (i, item) in items.iter().enumerate() {
                sep(out, i, flags, depth);
                write_node(out, item, flags, depth + 1);
            }
            close(out, ']', items.is_empty(), flags, depth);
        }
        JsonNode::Object(members) => {
            open(out, '{', members.is_empty(), flags, depth);
            for (i, (k, v)) in members.iter().enumerate() {
                sep(out, i, flags, depth);
                write_string(out, k, flags);
                out.push(':');
                if flags.pretty {
                    out.push(' ');
                }
                write_node(out, v, flags, depth + 1);
            }
            close(out, '}', members.is_empty(), flags, depth);
        }
    }
}

fn write_packed(out: &mut String, view: BdocView<'_>, flags: PrintFlags, depth: usize) {
    match view.kind() {
        Kind::Null => out.push_str("null"),
        Kind::Bool => out.push_str(if view.as_bool() == Some(true) {
            "true"
        } else {
            "false"
        }),
        Kind::I64 => out.push_str(&view.as_i64().unwrap_or(0).to_string()),
        Kind::F64 => write_f64(out, view.as_f64().unwrap_or(0.0)),
        Kind::String => write_string(out, view.as_str().unwrap_or_default(), flags),
        Kind::Binary => write_binary(out, view.as_bin().unwrap_or_default()),
        Kind::Array | Kind::Object => {
            let object = view.kind() == Kind::Object;
            let empty = view.count() == 0;
            open(out, if object { '{' } else { '[' }, empty, flags, depth);
            for (i, (k, child)) in view.children().enumerate() {
                sep(out, i, flags, depth);
                if let Some(k) = k {
                    write_string(out, k, flags);
                    out.push(':');
                    if flags.pretty {
                        out.push(' ');
                    }
                }
                write_packed(out, child, flags, depth + 1);
            }
            close(out, if object { '}' } else { ']' }, empty, flags, depth);
        }
    }
}

fn open(out: &mut String, ch: char, empty: bool, flags: PrintFlags, _depth: usize) {
    out.push(ch);
    if flags.pretty && !empty {
        out.push('\n');
    }
}

fn sep(out: &mut String, i: usize, flags: PrintFlags, depth: usize) {
    if i > 0 {
        out.push(',');
        if flags.pretty {
            out.push('\n');
        }
    }
    if flags.pretty {
        for _ in 0..=depth {
            out.push_str("  ");
        }
    }
}

fn close(out: &mut String, ch: char, empty: bool, flags: PrintFlags, depth: usize) {
    if flags.pretty && !empty {
        out.push('\n');
        for _ in 0..depth {
            out.push_str("  ");
        }
    }
    out.push(ch);
}

fn write_f64(out: &mut String, v: f64) {
    if v.is_finite() {
        out.push_str(&v.to_string());
    } else {
        out.push_str("null");
    }
}

/// Binary payloads have no JSON form; they print as a hex string.
fn write_binary(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out.push('"');
}

fn write_string(out: &mut String, s: &str, flags: PrintFlags) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if flags.codepoints && !c.is_ascii() => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
