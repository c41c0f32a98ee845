use serde_json::Value;

use crate::bdoc::{self, Bdoc, BdocView, Kind};
use crate::error::Result;
use crate::json::{self, PrintFlags};
use crate::pointer::{Pointer, Token};

/// Mutable tree form of a document. Object members keep insertion order.
///
/// This is the in-flight representation used when a query must mutate or
/// project a document; the packed form (`Bdoc`) is the storage and transport
/// representation.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonNode {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<JsonNode>),
    Object(Vec<(String, JsonNode)>),
}

impl JsonNode {
    pub fn kind(&self) -> Kind {
        match self {
            JsonNode::Null => Kind::Null,
            JsonNode::Bool(_) => Kind::Bool,
            JsonNode::I64(_) => Kind::I64,
            JsonNode::F64(_) => Kind::F64,
            JsonNode::String(_) => Kind::String,
            JsonNode::Binary(_) => Kind::Binary,
            JsonNode::Array(_) => Kind::Array,
            JsonNode::Object(_) => Kind::Object,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, JsonNode::Array(_) | JsonNode::Object(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JsonNode::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsonNode::F64(v) => Some(*v),
            JsonNode::I64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonNode::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonNode> {
        match self {
            JsonNode::Object(members) => members.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut JsonNode> {
        match self {
            JsonNode::Object(members) => {
                members.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Insert or replace an object member, keeping the position of a replaced
    /// key and appending new keys.
    pub fn set_member(&mut self, key: &str, value: JsonNode) {
        if let JsonNode::Object(members) = self {
            for (k, v) in members.iter_mut() {
                if k == key {
                    *v = value;
                    return;
                }
            }
            members.push((key.to_string(), value));
        }
    }

    pub fn remove_member(&mut self, key: &str) -> Option<JsonNode> {
        if let JsonNode::Object(members) = self {
            let i = members.iter().position(|(k, _)| k == key)?;
            return Some(members.remove(i).1);
        }
        None
    }

    // -- Pointer navigation --------------------------------------------------

    pub fn at(&self, ptr: &Pointer) -> Option<&JsonNode> {
        self.at_tokens(ptr.tokens())
    }

    fn at_tokens(&self, tokens: &[Token]) -> Option<&JsonNode> {
        let Some(tok) = tokens.first() else {
            return Some(self);
        };
        let rest = &tokens[1..];
        match (tok, self) {
            (Token::Key(k), JsonNode::Object(_)) => self.get(k)?.at_tokens(rest),
            (Token::Index(i), JsonNode::Array(items)) => items.get(*i)?.at_tokens(rest),
            (Token::Index(i), JsonNode::Object(_)) => self.get(&i.to_string())?.at_tokens(rest),
            (Token::Any, _) => {
                for child in self.children() {
                    if let Some(found) = child.at_tokens(rest) {
                        return Some(found);
                    }
                }
                None
            }
            _ => None,
        }
    }

    pub fn at_mut(&mut self, ptr: &Pointer) -> Option<&mut JsonNode> {
        let mut cur = self;
        for tok in ptr.tokens() {
            cur = match (tok, cur) {
                (Token::Key(k), node @ JsonNode::Object(_)) => node.get_mut(k)?,
                (Token::Index(i), JsonNode::Array(items)) => items.get_mut(*i)?,
                (Token::Index(i), node @ JsonNode::Object(_)) => node.get_mut(&i.to_string())?,
                _ => return None,
            };
        }
        Some(cur)
    }

    fn children(&self) -> Box<dyn Iterator<Item = &JsonNode> + '_> {
        match self {
            JsonNode::Array(items) => Box::new(items.iter()),
            JsonNode::Object(members) => Box::new(members.iter().map(|(_, v)| v)),
            _ => Box::new(std::iter::empty()),
        }
    }

    // -- Equality ------------------------------------------------------------

    /// Structural equality: objects compare by key set and per-key value
    /// regardless of member order; arrays compare positionally; numbers and
    /// strings compare by type then value, with no cross-type coercion.
    pub fn structural_eq(&self, other: &JsonNode) -> bool {
        match (self, other) {
            (JsonNode::Object(a), JsonNode::Object(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        other.get(k).is_some_and(|ov| v.structural_eq(ov))
                    })
            }
            (JsonNode::Array(a), JsonNode::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structural_eq(y))
            }
            (JsonNode::F64(a), JsonNode::F64(b)) => a == b,
            (a, b) => a == b,
        }
    }

    // -- JSON text boundary --------------------------------------------------

    pub fn from_json(text: &str) -> Result<JsonNode> {
        let value: Value = serde_json::from_str(text)?;
        Ok(JsonNode::from_value(&value))
    }

    pub fn from_value(value: &Value) -> JsonNode {
        match value {
            Value::Null => JsonNode::Null,
            Value::Bool(b) => JsonNode::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    JsonNode::I64(i)
                } else {
                    JsonNode::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => JsonNode::String(s.clone()),
            Value::Array(items) => {
                JsonNode::Array(items.iter().map(JsonNode::from_value).collect())
            }
            Value::Object(members) => JsonNode::Object(
                members
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonNode::from_value(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self, flags: PrintFlags) -> String {
        json::print_node(self, flags)
    }

    // -- Packed form conversion ----------------------------------------------

    pub fn from_packed(view: BdocView<'_>) -> JsonNode {
        match view.kind() {
            Kind::Null => JsonNode::Null,
            Kind::Bool => JsonNode::Bool(view.as_bool().unwrap_or(false)),
            Kind::I64 => JsonNode::I64(view.as_i64().unwrap_or(0)),
            Kind::F64 => JsonNode::F64(view.as_f64().unwrap_or(0.0)),
            Kind::String => JsonNode::String(view.as_str().unwrap_or_default().to_string()),
            Kind::Binary => JsonNode::Binary(view.as_bin().unwrap_or_default().to_vec()),
            Kind::Array => JsonNode::Array(
                view.children()
                    .map(|(_, v)| JsonNode::from_packed(v))
                    .collect(),
            ),
            Kind::Object => JsonNode::Object(
                view.children()
                    .map(|(k, v)| (k.unwrap_or_default().to_string(), JsonNode::from_packed(v)))
                    .collect(),
            ),
        }
    }

    /// Serialize to the packed form. Containers are emitted bottom-up: the
    /// child payload is produced first, then wrapped with the sized header.
    pub fn pack(&self) -> Bdoc {
        let mut buf = Vec::with_capacity(64);
        self.pack_into(&mut buf);
        Bdoc::from_packed_unchecked(buf)
    }

    pub(crate) fn pack_into(&self, buf: &mut Vec<u8>) {
        match self {
            JsonNode::Null => buf.push(bdoc::T_NULL),
            JsonNode::Bool(b) => bdoc::push_bool(buf, *b),
            JsonNode::I64(v) => bdoc::push_int(buf, *v),
            JsonNode::F64(v) => bdoc::push_f64(buf, *v),
            JsonNode::String(s) => bdoc::push_str(buf, s),
            JsonNode::Binary(b) => bdoc::push_bin(buf, b),
            JsonNode::Array(items) => {
                let mut payload = Vec::with_capacity(items.len() * 8);
                for item in items {
                    item.pack_into(&mut payload);
                }
                bdoc::push_container(buf, bdoc::T_ARRAY, items.len() as u64, &payload);
            }
            JsonNode::Object(members) => {
                let mut payload = Vec::with_capacity(members.len() * 16);
                for (k, v) in members {
                    bdoc::push_key(&mut payload, k);
                    v.pack_into(&mut payload);
                }
                bdoc::push_container(buf, bdoc::T_OBJECT, members.len() as u64, &payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(text: &str) -> JsonNode {
        JsonNode::from_json(text).unwrap()
    }

    #[test]
    fn packed_roundtrip_preserves_order() {
        let n = node(r#"{"z":1,"a":[true,null,{"k":"v"}],"m":2.5}"#);
        let packed = n.pack();
        let back = JsonNode::from_packed(packed.view());
        assert_eq!(n, back);
        let reparsed = Bdoc::parse(packed.as_bytes()).unwrap();
        assert_eq!(JsonNode::from_packed(reparsed.view()), n);
    }

    #[test]
    fn structural_eq_ignores_member_order() {
        let a = node(r#"{"x":1,"y":{"p":1,"q":2}}"#);
        let b = node(r#"{"y":{"q":2,"p":1},"x":1}"#);
        assert!(a.structural_eq(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn structural_eq_no_cross_type_coercion() {
        assert!(!JsonNode::I64(10).structural_eq(&JsonNode::String("10".into())));
        assert!(!JsonNode::I64(10).structural_eq(&JsonNode::F64(10.0)));
    }

    #[test]
    fn structural_eq_arrays_positional() {
        let a = node("[1,2]");
        let b = node("[2,1]");
        assert!(!a.structural_eq(&b));
        assert!(a.structural_eq(&node("[1,2]")));
    }

    #[test]
    fn set_member_keeps_position() {
        let mut n = node(r#"{"a":1,"b":2,"c":3}"#);
        n.set_member("b", JsonNode::I64(9));
        if let JsonNode::Object(members) = &n {
            let keys: Vec<_> = members.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, vec!["a", "b", "c"]);
        } else {
            unreachable!()
        }
        assert_eq!(n.get("b").unwrap().as_i64(), Some(9));
    }

    #[test]
    fn at_mut_navigates() {
        let mut n = node(r#"{"a":{"b":[10,20]}}"#);
        let p = Pointer::parse("/a/b/0").unwrap();
        *n.at_mut(&p).unwrap() = JsonNode::I64(99);
        assert_eq!(n.at(&p).unwrap().as_i64(), Some(99));
    }

    #[test]
    fn wildcard_lookup() {
        let n = node(r#"{"u":{"name":"a"},"v":{"name":"b"}}"#);
        let p = Pointer::parse("/*/name").unwrap();
        assert_eq!(n.at(&p).unwrap().as_str(), Some("a"));
    }

    #[test]
    fn numeric_segment_on_object() {
        let n = node(r#"{"0":"zero"}"#);
        let p = Pointer::parse("/0").unwrap();
        assert_eq!(n.at(&p).unwrap().as_str(), Some("zero"));
    }

    #[test]
    fn big_u64_from_json_becomes_f64() {
        let n = node(&format!("{{\"n\":{}}}", u64::MAX));
        assert!(matches!(n.get("n").unwrap(), JsonNode::F64(_)));
    }
}
