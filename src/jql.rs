use std::collections::HashMap;

use regex::Regex;

use crate::bdoc::{BdocView, Kind};
use crate::error::{Error, Result};
use crate::node::JsonNode;
use crate::pointer::Pointer;

/// Comparison operators of the filter expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Re,
    Prefix,
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    And,
    Or,
}

/// Left-hand side of an expression, resolved relative to the element the
/// expression node is matched against.
#[derive(Debug, Clone)]
pub enum Lhs {
    Key(String),
    Any,
}

/// Right-hand side: a literal or a placeholder slot.
#[derive(Debug, Clone)]
pub enum Operand {
    Value(JsonNode),
    Param(usize),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub lhs: Lhs,
    pub op: CompOp,
    pub rhs: Operand,
    /// Compiled form of a literal `re`/`like` right-hand side.
    pub(crate) rx: Option<Regex>,
}

/// One step of the filter path.
#[derive(Debug, Clone)]
pub enum FilterNode {
    /// `*`: any single child.
    Any,
    /// `**`: any chain of one or more descent steps.
    AnyDeep,
    Key(String),
    /// `[expr and expr or expr]`, applied to the current element without
    /// descending.
    Exprs(Vec<(Join, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotUse {
    Plain,
    Regex,
    Like,
}

#[derive(Debug, Clone)]
enum SlotVal {
    Unbound,
    Node(JsonNode),
    Re { rx: Regex, raw: String },
}

#[derive(Debug, Clone)]
struct Slot {
    val: SlotVal,
    name: Option<String>,
    usage: SlotUse,
}

/// Addresses a placeholder either positionally (`?`) or by name (`:name`).
#[derive(Debug, Clone, Copy)]
pub enum ParamRef<'a> {
    Pos(usize),
    Name(&'a str),
}

impl From<usize> for ParamRef<'_> {
    fn from(i: usize) -> Self {
        ParamRef::Pos(i)
    }
}

impl<'a> From<&'a str> for ParamRef<'a> {
    fn from(name: &'a str) -> Self {
        ParamRef::Name(name)
    }
}

/// A compiled query: filter path, directives and placeholder slots. The
/// parse tree is retained; binding a parameter only mutates its slot.
#[derive(Debug, Clone)]
pub struct Query {
    text: String,
    pub(crate) collection: Option<String>,
    pub(crate) nodes: Vec<FilterNode>,
    pub(crate) skip: Option<Operand>,
    pub(crate) limit: Option<Operand>,
    pub(crate) count: bool,
    pub(crate) noidx: bool,
    pub(crate) inverse: bool,
    /// (pointer, descending) pairs, in priority order.
    pub(crate) order: Vec<(Pointer, bool)>,
    pub(crate) apply: Option<Operand>,
    pub(crate) upsert: Option<Operand>,
    pub(crate) del: bool,
    pub(crate) projection: Option<Vec<Pointer>>,
    slots: Vec<Slot>,
    named: HashMap<String, usize>,
}

impl Query {
    /// Parse a query. The error of a failed parse carries the human-readable
    /// message a caller would show.
    pub fn parse(text: &str) -> Result<Query> {
        let mut p = Parser {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        };
        p.parse_query()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn param_count(&self) -> usize {
        self.slots.len()
    }

    // -- Placeholder binding -------------------------------------------------

    pub fn set_str<'a>(&mut self, at: impl Into<ParamRef<'a>>, v: &str) -> Result<()> {
        let i = self.slot_index(at.into())?;
        self.slots[i].val = match self.slots[i].usage {
            SlotUse::Plain => SlotVal::Node(JsonNode::String(v.to_string())),
            SlotUse::Regex => SlotVal::Re {
                rx: compile_regex(v)?,
                raw: v.to_string(),
            },
            SlotUse::Like => SlotVal::Re {
                rx: compile_like(v)?,
                raw: v.to_string(),
            },
        };
        Ok(())
    }

    pub fn set_i64<'a>(&mut self, at: impl Into<ParamRef<'a>>, v: i64) -> Result<()> {
        self.set_node(at.into(), JsonNode::I64(v))
    }

    pub fn set_f64<'a>(&mut self, at: impl Into<ParamRef<'a>>, v: f64) -> Result<()> {
        self.set_node(at.into(), JsonNode::F64(v))
    }

    pub fn set_bool<'a>(&mut self, at: impl Into<ParamRef<'a>>, v: bool) -> Result<()> {
        self.set_node(at.into(), JsonNode::Bool(v))
    }

    pub fn set_null<'a>(&mut self, at: impl Into<ParamRef<'a>>) -> Result<()> {
        self.set_node(at.into(), JsonNode::Null)
    }

    pub fn set_json<'a>(&mut self, at: impl Into<ParamRef<'a>>, json: &str) -> Result<()> {
        let node = JsonNode::from_json(json)?;
        self.set_node(at.into(), node)
    }

    pub fn set_regexp<'a>(&mut self, at: impl Into<ParamRef<'a>>, pattern: &str) -> Result<()> {
        let i = self.slot_index(at.into())?;
        self.slots[i].val = SlotVal::Re {
            rx: compile_regex(pattern)?,
            raw: pattern.to_string(),
        };
        Ok(())
    }

    fn set_node(&mut self, at: ParamRef<'_>, node: JsonNode) -> Result<()> {
        let i = self.slot_index(at)?;
        self.slots[i].val = SlotVal::Node(node);
        Ok(())
    }

    fn slot_index(&self, at: ParamRef<'_>) -> Result<usize> {
        match at {
            ParamRef::Pos(i) if i < self.slots.len() => Ok(i),
            ParamRef::Pos(i) => Err(Error::InvalidArgument(format!(
                "no positional placeholder {i}"
            ))),
            ParamRef::Name(name) => self
                .named
                .get(name)
                .copied()
                .ok_or_else(|| Error::InvalidArgument(format!("no placeholder :{name}"))),
        }
    }

    // -- Operand resolution (used by the executor) ---------------------------

    pub(crate) fn resolve_node<'a>(&'a self, operand: &'a Operand) -> Result<&'a JsonNode> {
        match operand {
            Operand::Value(node) => Ok(node),
            Operand::Param(i) => match &self.slots[*i].val {
                SlotVal::Node(node) => Ok(node),
                SlotVal::Re { .. } => Err(Error::InvalidState(
                    "placeholder bound to a regexp where a value is expected".into(),
                )),
                SlotVal::Unbound => {
                    let label = match &self.slots[*i].name {
                        Some(name) => format!(":{name}"),
                        None => i.to_string(),
                    };
                    Err(Error::InvalidState(format!(
                        "placeholder {label} is not bound"
                    )))
                }
            },
        }
    }

    pub(crate) fn resolve_regex<'q>(&'q self, expr: &'q Expr) -> Result<(&'q Regex, &'q str)> {
        if let Some(rx) = &expr.rx {
            return Ok((rx, rx.as_str()));
        }
        if let Operand::Param(i) = &expr.rhs {
            if let SlotVal::Re { rx, raw } = &self.slots[*i].val {
                return Ok((rx, raw));
            }
        }
        Err(Error::InvalidState(
            "regexp operand is not bound".into(),
        ))
    }

    pub(crate) fn resolve_u64(&self, operand: &Operand) -> Result<u64> {
        let node = self.resolve_node(operand)?;
        match node {
            JsonNode::I64(v) if *v >= 0 => Ok(*v as u64),
            _ => Err(Error::InvalidArgument(
                "skip/limit must be a non-negative integer".into(),
            )),
        }
    }

    /// The raw string of a prefix-shaped operand, if it is one.
    pub(crate) fn operand_str(&self, expr: &Expr) -> Option<String> {
        match &expr.rhs {
            Operand::Value(JsonNode::String(s)) => Some(s.clone()),
            Operand::Param(i) => match &self.slots[*i].val {
                SlotVal::Node(JsonNode::String(s)) => Some(s.clone()),
                SlotVal::Re { raw, .. } => Some(raw.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    // -- Matching ------------------------------------------------------------

    /// Evaluate the filter against a packed document.
    pub fn matches(&self, view: BdocView<'_>) -> Result<bool> {
        self.match_at(&self.nodes, view)
    }

    fn match_at(&self, nodes: &[FilterNode], view: BdocView<'_>) -> Result<bool> {
        let Some(node) = nodes.first() else {
            return Ok(true);
        };
        let rest = &nodes[1..];
        match node {
            FilterNode::Key(k) => match child_by_name(view, k) {
                Some(child) => self.match_at(rest, child),
                None => Ok(false),
            },
            FilterNode::Any => {
                for (_, child) in view.children() {
                    if self.match_at(rest, child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FilterNode::AnyDeep => {
                for (_, child) in view.children() {
                    if self.match_at(rest, child)? {
                        return Ok(true);
                    }
                    if self.match_at(nodes, child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FilterNode::Exprs(exprs) => {
                if self.eval_exprs(exprs, view)? {
                    self.match_at(rest, view)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn eval_exprs(&self, exprs: &[(Join, Expr)], view: BdocView<'_>) -> Result<bool> {
        let mut acc = true;
        for (i, (join, expr)) in exprs.iter().enumerate() {
            let joined = if i == 0 { Join::And } else { *join };
            match joined {
                Join::And => {
                    if acc {
                        acc = self.eval_expr(expr, view)?;
                    }
                }
                Join::Or => {
                    if !acc {
                        acc = self.eval_expr(expr, view)?;
                    }
                }
            }
        }
        Ok(acc)
    }

    pub(crate) fn eval_expr(&self, expr: &Expr, view: BdocView<'_>) -> Result<bool> {
        match &expr.lhs {
            Lhs::Key(k) => match child_by_name(view, k) {
                Some(child) => self.eval_op(expr, child),
                None => Ok(false),
            },
            Lhs::Any => {
                for (_, child) in view.children() {
                    if self.eval_op(expr, child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn eval_op(&self, expr: &Expr, value: BdocView<'_>) -> Result<bool> {
        use std::cmp::Ordering;
        match expr.op {
            CompOp::Eq => Ok(compare(value, self.resolve_node(&expr.rhs)?) == Some(Ordering::Equal)),
            CompOp::Ne => Ok(compare(value, self.resolve_node(&expr.rhs)?) != Some(Ordering::Equal)),
            CompOp::Gt => Ok(compare(value, self.resolve_node(&expr.rhs)?) == Some(Ordering::Greater)),
            CompOp::Ge => Ok(matches!(
                compare(value, self.resolve_node(&expr.rhs)?),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            )),
            CompOp::Lt => Ok(compare(value, self.resolve_node(&expr.rhs)?) == Some(Ordering::Less)),
            CompOp::Le => Ok(matches!(
                compare(value, self.resolve_node(&expr.rhs)?),
                Some(Ordering::Less) | Some(Ordering::Equal)
            )),
            CompOp::In | CompOp::NotIn => {
                let JsonNode::Array(items) = self.resolve_node(&expr.rhs)? else {
                    return Err(Error::InvalidArgument(
                        "'in'/'ni' needs an array operand".into(),
                    ));
                };
                let found = items
                    .iter()
                    .any(|item| compare(value, item) == Some(Ordering::Equal));
                Ok(if expr.op == CompOp::In { found } else { !found })
            }
            CompOp::Re | CompOp::Like => {
                let (rx, _) = self.resolve_regex(expr)?;
                Ok(value.as_str().is_some_and(|s| rx.is_match(s)))
            }
            CompOp::Prefix => {
                let JsonNode::String(prefix) = self.resolve_node(&expr.rhs)? else {
                    return Err(Error::InvalidArgument("'~' needs a string operand".into()));
                };
                Ok(value.as_str().is_some_and(|s| s.starts_with(prefix.as_str())))
            }
        }
    }
}

fn child_by_name<'a>(view: BdocView<'a>, name: &str) -> Option<BdocView<'a>> {
    match view.kind() {
        Kind::Object => view.get(name),
        Kind::Array => name.parse::<usize>().ok().and_then(|i| view.idx(i)),
        _ => None,
    }
}

/// Compare a packed value with a literal. Numbers compare numerically across
/// i64/f64, and decimal strings coerce to numbers when the other side is
/// numeric. Anything else compares only within its own type.
pub(crate) fn compare(view: BdocView<'_>, rhs: &JsonNode) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (view.kind(), rhs) {
        (Kind::I64, JsonNode::I64(b)) => Some(view.as_i64()?.cmp(b)),
        (Kind::I64, JsonNode::F64(b)) => view.as_f64()?.partial_cmp(b),
        (Kind::F64, JsonNode::I64(b)) => view.as_f64()?.partial_cmp(&(*b as f64)),
        (Kind::F64, JsonNode::F64(b)) => view.as_f64()?.partial_cmp(b),
        (Kind::String, JsonNode::I64(b)) => {
            let parsed: f64 = view.as_str()?.trim().parse().ok()?;
            parsed.partial_cmp(&(*b as f64))
        }
        (Kind::String, JsonNode::F64(b)) => {
            let parsed: f64 = view.as_str()?.trim().parse().ok()?;
            parsed.partial_cmp(b)
        }
        (Kind::I64 | Kind::F64, JsonNode::String(s)) => {
            let parsed: f64 = s.trim().parse().ok()?;
            view.as_f64()?.partial_cmp(&parsed)
        }
        (Kind::String, JsonNode::String(b)) => Some(view.as_str()?.cmp(b.as_str())),
        (Kind::Bool, JsonNode::Bool(b)) => Some(view.as_bool()?.cmp(b)),
        (Kind::Null, JsonNode::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::InvalidArgument(format!("bad regexp: {e}")))
}

/// Translate a `like` pattern (`%` matches any run of characters) into an
/// anchored regex.
fn compile_like(pattern: &str) -> Result<Regex> {
    let mut rx = String::with_capacity(pattern.len() + 8);
    rx.push('^');
    for ch in pattern.chars() {
        if ch == '%' {
            rx.push_str(".*");
        } else {
            rx.push_str(&regex::escape(&ch.to_string()));
        }
    }
    rx.push('$');
    compile_regex(&rx)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: &str) -> Error {
        Error::QueryParse(format!("{msg} at byte {} in '{}'", self.pos, self.text))
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_query(&mut self) -> Result<Query> {
        let mut q = Query {
            text: self.text.to_string(),
            collection: None,
            nodes: Vec::new(),
            skip: None,
            limit: None,
            count: false,
            noidx: false,
            inverse: false,
            order: Vec::new(),
            apply: None,
            upsert: None,
            del: false,
            projection: None,
            slots: Vec::new(),
            named: HashMap::new(),
        };
        self.skip_ws();
        if self.eat(b'@') {
            let name = self.parse_name(&mut q)?;
            q.collection = Some(name);
        }
        self.skip_ws();
        if self.peek() != Some(b'/') {
            return Err(self.err("expected '/' to start the filter"));
        }
        while self.eat(b'/') {
            let node = self.parse_node(&mut q)?;
            q.nodes.push(node);
            self.skip_ws();
        }
        while self.eat(b'|') {
            self.parse_directive(&mut q)?;
            self.skip_ws();
        }
        self.skip_ws();
        if self.pos != self.bytes.len() {
            return Err(self.err("trailing input after query"));
        }
        mark_slot_usages(&mut q)?;
        compile_literal_patterns(&mut q)?;
        Ok(q)
    }

    fn parse_name(&mut self, q: &mut Query) -> Result<String> {
        self.skip_ws();
        if self.peek() == Some(b'"') {
            let node = self.parse_json(q)?;
            if let Operand::Value(JsonNode::String(s)) = node {
                return Ok(s);
            }
            return Err(self.err("expected a string"));
        }
        let word = self.parse_word();
        if word.is_empty() {
            return Err(self.err("expected a name"));
        }
        Ok(word)
    }

    fn parse_word(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b >= 0x80 {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.text[start..self.pos].to_string()
    }

    fn parse_node(&mut self, q: &mut Query) -> Result<FilterNode> {
        self.skip_ws();
        match self.peek() {
            Some(b'[') => {
                self.pos += 1;
                let exprs = self.parse_exprs(q)?;
                if !self.eat(b']') {
                    return Err(self.err("expected ']'"));
                }
                Ok(FilterNode::Exprs(exprs))
            }
            Some(b'*') => {
                self.pos += 1;
                if self.eat(b'*') {
                    Ok(FilterNode::AnyDeep)
                } else {
                    Ok(FilterNode::Any)
                }
            }
            Some(b'"') => {
                let node = self.parse_json(q)?;
                if let Operand::Value(JsonNode::String(s)) = node {
                    Ok(FilterNode::Key(s))
                } else {
                    Err(self.err("expected a string key"))
                }
            }
            _ => {
                let word = self.parse_word();
                if word.is_empty() {
                    return Err(self.err("expected a filter node"));
                }
                Ok(FilterNode::Key(word))
            }
        }
    }

    fn parse_exprs(&mut self, q: &mut Query) -> Result<Vec<(Join, Expr)>> {
        let mut exprs = Vec::new();
        loop {
            let join = if exprs.is_empty() {
                Join::And
            } else {
                self.skip_ws();
                let save = self.pos;
                let word = self.parse_word();
                match word.as_str() {
                    "and" => Join::And,
                    "or" => Join::Or,
                    _ => {
                        self.pos = save;
                        break;
                    }
                }
            };
            exprs.push((join, self.parse_expr(q)?));
            self.skip_ws();
            if self.peek() == Some(b']') {
                break;
            }
        }
        if exprs.is_empty() {
            return Err(self.err("empty expression node"));
        }
        Ok(exprs)
    }

    fn parse_expr(&mut self, q: &mut Query) -> Result<Expr> {
        self.skip_ws();
        let lhs = match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                Lhs::Any
            }
            Some(b'"') => {
                let node = self.parse_json(q)?;
                if let Operand::Value(JsonNode::String(s)) = node {
                    Lhs::Key(s)
                } else {
                    return Err(self.err("expected a string key"));
                }
            }
            _ => {
                let word = self.parse_word();
                if word.is_empty() {
                    return Err(self.err("expected an expression key"));
                }
                Lhs::Key(word)
            }
        };
        self.skip_ws();
        let op = self.parse_op()?;
        self.skip_ws();
        let rhs = self.parse_json(q)?;
        Ok(Expr {
            lhs,
            op,
            rhs,
            rx: None,
        })
    }

    fn parse_op(&mut self) -> Result<CompOp> {
        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                Ok(CompOp::Eq)
            }
            Some(b'!') => {
                self.pos += 1;
                if self.eat(b'=') {
                    Ok(CompOp::Ne)
                } else {
                    Err(self.err("expected '!='"))
                }
            }
            Some(b'>') => {
                self.pos += 1;
                Ok(if self.eat(b'=') { CompOp::Ge } else { CompOp::Gt })
            }
            Some(b'<') => {
                self.pos += 1;
                Ok(if self.eat(b'=') { CompOp::Le } else { CompOp::Lt })
            }
            Some(b'~') => {
                self.pos += 1;
                Ok(CompOp::Prefix)
            }
            _ => {
                let save = self.pos;
                let word = self.parse_word();
                match word.as_str() {
                    "in" => Ok(CompOp::In),
                    "ni" => Ok(CompOp::NotIn),
                    "re" => Ok(CompOp::Re),
                    "like" => Ok(CompOp::Like),
                    _ => {
                        self.pos = save;
                        Err(self.err("expected a comparison operator"))
                    }
                }
            }
        }
    }

    /// Parse a JSON value, `?` or `:name` placeholder.
    fn parse_json(&mut self, q: &mut Query) -> Result<Operand> {
        self.skip_ws();
        if self.eat(b'?') {
            let i = q.slots.len();
            q.slots.push(Slot {
                val: SlotVal::Unbound,
                name: None,
                usage: SlotUse::Plain,
            });
            return Ok(Operand::Param(i));
        }
        if self.peek() == Some(b':') {
            self.pos += 1;
            let name = self.parse_word();
            if name.is_empty() {
                return Err(self.err("expected a placeholder name"));
            }
            if let Some(&i) = q.named.get(&name) {
                return Ok(Operand::Param(i));
            }
            let i = q.slots.len();
            q.slots.push(Slot {
                val: SlotVal::Unbound,
                name: Some(name.clone()),
                usage: SlotUse::Plain,
            });
            q.named.insert(name, i);
            return Ok(Operand::Param(i));
        }
        let rest = &self.text[self.pos..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) => {
                self.pos += stream.byte_offset();
                Ok(Operand::Value(JsonNode::from_value(&value)))
            }
            _ => Err(self.err("expected a JSON value")),
        }
    }

    fn parse_pointer(&mut self) -> Result<Pointer> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if b.is_ascii_whitespace() || b == b'|' || b == b',' {
                break;
            }
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        let ptr = Pointer::parse(text).map_err(|e| Error::QueryParse(e.to_string()))?;
        if !ptr.is_simple() {
            return Err(Error::QueryParse(format!(
                "ordering/projection pointer may not contain wildcards: {text}"
            )));
        }
        Ok(ptr)
    }

    fn parse_directive(&mut self, q: &mut Query) -> Result<()> {
        self.skip_ws();
        let word = self.parse_word();
        match word.as_str() {
            "skip" => q.skip = Some(self.parse_json(q)?),
            "limit" => q.limit = Some(self.parse_json(q)?),
            "count" => q.count = true,
            "noidx" => q.noidx = true,
            "inverse" => q.inverse = true,
            "del" => q.del = true,
            "asc" => {
                let ptr = self.parse_pointer()?;
                q.order.push((ptr, false));
            }
            "desc" => {
                let ptr = self.parse_pointer()?;
                q.order.push((ptr, true));
            }
            "apply" => q.apply = Some(self.parse_json(q)?),
            "upsert" => q.upsert = Some(self.parse_json(q)?),
            "fields" => {
                let mut ptrs = vec![self.parse_pointer()?];
                loop {
                    self.skip_ws();
                    if !self.eat(b',') {
                        break;
                    }
                    ptrs.push(self.parse_pointer()?);
                }
                q.projection = Some(ptrs);
            }
            other => {
                return Err(self.err(&format!("unknown directive '{other}'")));
            }
        }
        Ok(())
    }
}

/// Record which slots feed `re`/`like` so that later `set_str` binds compile.
fn mark_slot_usages(q: &mut Query) -> Result<()> {
    let mut usages: Vec<(usize, SlotUse)> = Vec::new();
    for node in &q.nodes {
        if let FilterNode::Exprs(exprs) = node {
            for (_, expr) in exprs {
                if let Operand::Param(i) = &expr.rhs {
                    match expr.op {
                        CompOp::Re => usages.push((*i, SlotUse::Regex)),
                        CompOp::Like => usages.push((*i, SlotUse::Like)),
                        _ => {}
                    }
                }
            }
        }
    }
    for (i, usage) in usages {
        q.slots[i].usage = usage;
    }
    Ok(())
}

/// Compile literal `re`/`like` right-hand sides once, at parse time.
fn compile_literal_patterns(q: &mut Query) -> Result<()> {
    for node in &mut q.nodes {
        if let FilterNode::Exprs(exprs) = node {
            for (_, expr) in exprs {
                if let Operand::Value(JsonNode::String(s)) = &expr.rhs {
                    match expr.op {
                        CompOp::Re => expr.rx = Some(compile_regex(s)?),
                        CompOp::Like => expr.rx = Some(compile_like(s)?),
                        _ => {}
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdoc::Bdoc;

    fn doc(text: &str) -> Bdoc {
        Bdoc::from_json(text).unwrap()
    }

    fn matches(query: &str, json: &str) -> bool {
        let q = Query::parse(query).unwrap();
        q.matches(doc(json).view()).unwrap()
    }

    #[test]
    fn collection_prefix() {
        let q = Query::parse("@users/*").unwrap();
        assert_eq!(q.collection(), Some("users"));
        assert_eq!(q.nodes.len(), 1);
        assert!(matches!(q.nodes[0], FilterNode::Any));
    }

    #[test]
    fn simple_eq() {
        assert!(matches(r#"/[name = "Andy"]"#, r#"{"name":"Andy"}"#));
        assert!(!matches(r#"/[name = "Andy"]"#, r#"{"name":"Bob"}"#));
        assert!(!matches(r#"/[name = "Andy"]"#, r#"{"age":1}"#));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(matches("/[n > 1]", r#"{"n":3}"#));
        assert!(!matches("/[n > 1]", r#"{"n":1}"#));
        assert!(matches("/[n >= 1]", r#"{"n":1}"#));
        assert!(matches("/[n < 2.5]", r#"{"n":2}"#));
        assert!(matches("/[n <= 2]", r#"{"n":2}"#));
        assert!(matches("/[n != 2]", r#"{"n":3}"#));
    }

    #[test]
    fn numeric_string_coercion_in_comparisons() {
        // Decimal strings coerce against numeric operands.
        assert!(matches("/[n = 10]", r#"{"n":"10"}"#));
        assert!(matches("/[n > 5]", r#"{"n":"10"}"#));
        assert!(!matches(r#"/[n = "x"]"#, r#"{"n":10}"#));
    }

    #[test]
    fn and_or_chains() {
        assert!(matches(
            r#"/[a = 1 and b = 2]"#,
            r#"{"a":1,"b":2}"#
        ));
        assert!(!matches(r#"/[a = 1 and b = 3]"#, r#"{"a":1,"b":2}"#));
        assert!(matches(r#"/[a = 9 or b = 2]"#, r#"{"a":1,"b":2}"#));
    }

    #[test]
    fn nested_path_filter() {
        assert!(matches(
            r#"/address/[street = "main"]"#,
            r#"{"address":{"street":"main"}}"#
        ));
        assert!(!matches(
            r#"/address/[street = "main"]"#,
            r#"{"address":{"street":"side"}}"#
        ));
    }

    #[test]
    fn wildcard_nodes() {
        assert!(matches("/*", r#"{"a":1}"#));
        assert!(!matches("/*", "{}"));
        assert!(matches(r#"/*/[street = "main"]"#, r#"{"home":{"street":"main"}}"#));
    }

    #[test]
    fn deep_wildcard_matches_descendants_not_root() {
        // `**` needs at least one descent step.
        assert!(matches(r#"/**/[street = "main"]"#, r#"{"a":{"b":{"street":"main"}}}"#));
        assert!(matches(r#"/**/[street = "main"]"#, r#"{"street":{"street":"main"}}"#));
        assert!(!matches(r#"/**/[street = "main"]"#, r#"{"street":"main"}"#));
    }

    #[test]
    fn in_and_ni() {
        assert!(matches("/[n in [1,2,3]]", r#"{"n":2}"#));
        assert!(!matches("/[n in [1,2,3]]", r#"{"n":5}"#));
        assert!(matches("/[n ni [1,2,3]]", r#"{"n":5}"#));
    }

    #[test]
    fn regex_and_prefix_and_like() {
        assert!(matches(r#"/[name re "^An.*"]"#, r#"{"name":"Andy"}"#));
        assert!(!matches(r#"/[name re "^An.*$"]"#, r#"{"name":"Bob"}"#));
        assert!(matches(r#"/[name ~ "An"]"#, r#"{"name":"Andy"}"#));
        assert!(matches(r#"/[name like "A%y"]"#, r#"{"name":"Andy"}"#));
        assert!(!matches(r#"/[name like "A%z"]"#, r#"{"name":"Andy"}"#));
    }

    #[test]
    fn array_index_key() {
        assert!(matches(r#"/list/0/[k = 1]"#, r#"{"list":[{"k":1}]}"#));
    }

    #[test]
    fn positional_placeholders() {
        let mut q = Query::parse("/[n = ?] | limit ?").unwrap();
        assert_eq!(q.param_count(), 2);
        q.set_i64(0usize, 42).unwrap();
        q.set_i64(1usize, 10).unwrap();
        assert!(q.matches(doc(r#"{"n":42}"#).view()).unwrap());
        assert_eq!(q.resolve_u64(q.limit.as_ref().unwrap()).unwrap(), 10);
    }

    #[test]
    fn named_placeholders_shared() {
        let mut q = Query::parse("/[a = :v or b = :v]").unwrap();
        assert_eq!(q.param_count(), 1);
        q.set_str("v", "x").unwrap();
        assert!(q.matches(doc(r#"{"b":"x"}"#).view()).unwrap());
    }

    #[test]
    fn unbound_placeholder_errors() {
        let q = Query::parse("/[n = ?]").unwrap();
        let err = q.matches(doc(r#"{"n":1}"#).view());
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }

    #[test]
    fn rebinding_is_cheap_and_repeatable() {
        let mut q = Query::parse("/[n = ?]").unwrap();
        q.set_i64(0usize, 1).unwrap();
        assert!(q.matches(doc(r#"{"n":1}"#).view()).unwrap());
        q.set_i64(0usize, 2).unwrap();
        assert!(!q.matches(doc(r#"{"n":1}"#).view()).unwrap());
        assert!(q.matches(doc(r#"{"n":2}"#).view()).unwrap());
    }

    #[test]
    fn regexp_placeholder() {
        let mut q = Query::parse("/[name re ?]").unwrap();
        q.set_regexp(0usize, "^A").unwrap();
        assert!(q.matches(doc(r#"{"name":"Andy"}"#).view()).unwrap());
        // set_str on a regexp slot compiles too.
        q.set_str(0usize, "^B").unwrap();
        assert!(q.matches(doc(r#"{"name":"Bob"}"#).view()).unwrap());
    }

    #[test]
    fn directives_parse() {
        let q = Query::parse(
            r#"@c/[a = 1] | skip 2 | limit 5 | asc /a | desc /b/c | fields /a, /b | inverse | noidx"#,
        )
        .unwrap();
        assert!(q.noidx);
        assert!(q.inverse);
        assert_eq!(q.order.len(), 2);
        assert!(!q.order[0].1);
        assert!(q.order[1].1);
        assert_eq!(q.order[1].0.to_string(), "/b/c");
        let fields = q.projection.as_ref().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(q.resolve_u64(q.skip.as_ref().unwrap()).unwrap(), 2);
    }

    #[test]
    fn apply_and_del_directives() {
        let q = Query::parse(r#"/[a = 1] | apply {"b":2}"#).unwrap();
        assert!(q.apply.is_some());
        let q = Query::parse("/* | del").unwrap();
        assert!(q.del);
        let q = Query::parse("/* | count").unwrap();
        assert!(q.count);
    }

    #[test]
    fn parse_errors_carry_messages() {
        for bad in ["", "users", "/[a >]", "/[a = 1", "/ | skip x", "/* | bogus", "/* trailing"] {
            let err = Query::parse(bad);
            match err {
                Err(Error::QueryParse(msg)) => assert!(!msg.is_empty()),
                other => panic!("expected parse error for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn quoted_keys() {
        assert!(matches(r#"/"odd key"/[v = 1]"#, r#"{"odd key":{"v":1}}"#));
        assert!(matches(r#"/["some field" = 3]"#, r#"{"some field":3}"#));
    }

    #[test]
    fn bool_and_null_literals() {
        assert!(matches("/[flag = true]", r#"{"flag":true}"#));
        assert!(matches("/[gone = null]", r#"{"gone":null}"#));
        assert!(!matches("/[flag = true]", r#"{"flag":false}"#));
    }
}
