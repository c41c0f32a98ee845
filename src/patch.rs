use crate::error::{Error, Result};
use crate::node::JsonNode;
use crate::pointer::{Pointer, Token};

/// One parsed RFC 6902 operation, including the engine extensions
/// `increment`, `swap` and `add_create`.
#[derive(Debug, Clone)]
pub enum PatchOp {
    Add { path: Pointer, value: JsonNode },
    Remove { path: Pointer },
    Replace { path: Pointer, value: JsonNode },
    Move { from: Pointer, path: Pointer },
    Copy { from: Pointer, path: Pointer },
    Test { path: Pointer, value: JsonNode },
    Increment { path: Pointer, value: JsonNode },
    Swap { from: Pointer, path: Pointer },
    AddCreate { path: Pointer, value: JsonNode },
}

/// Apply a patch document: an array is treated as an RFC 6902 patch, an
/// object as an RFC 7396 merge patch.
pub fn apply_auto(doc: &mut JsonNode, patch: &JsonNode) -> Result<()> {
    match patch {
        JsonNode::Array(_) => apply_patch(doc, patch),
        JsonNode::Object(_) => {
            merge_patch(doc, patch);
            Ok(())
        }
        _ => Err(Error::PatchParse(
            "patch must be an array (rfc6902) or object (rfc7396)".into(),
        )),
    }
}

/// Apply an RFC 6902 patch (array of operation objects) in order.
pub fn apply_patch(doc: &mut JsonNode, patch: &JsonNode) -> Result<()> {
    for op in parse_patch(patch)? {
        apply_op(doc, &op)?;
    }
    Ok(())
}

pub fn parse_patch(patch: &JsonNode) -> Result<Vec<PatchOp>> {
    let JsonNode::Array(ops) = patch else {
        return Err(Error::PatchParse("rfc6902 patch must be an array".into()));
    };
    ops.iter().map(parse_op).collect()
}

fn parse_op(op: &JsonNode) -> Result<PatchOp> {
    let JsonNode::Object(_) = op else {
        return Err(Error::PatchParse("patch operation must be an object".into()));
    };
    let name = op
        .get("op")
        .and_then(JsonNode::as_str)
        .ok_or_else(|| Error::PatchParse("operation is missing 'op'".into()))?;
    let path = parse_ptr_member(op, "path")?;
    let value = || {
        op.get("value")
            .cloned()
            .ok_or_else(|| Error::PatchParse(format!("'{name}' requires 'value'")))
    };
    let from = || parse_ptr_member(op, "from");
    Ok(match name {
        "add" => PatchOp::Add { path, value: value()? },
        "remove" => PatchOp::Remove { path },
        "replace" => PatchOp::Replace { path, value: value()? },
        "move" => PatchOp::Move { from: from()?, path },
        "copy" => PatchOp::Copy { from: from()?, path },
        "test" => PatchOp::Test { path, value: value()? },
        "increment" => PatchOp::Increment { path, value: value()? },
        "swap" => PatchOp::Swap { from: from()?, path },
        "add_create" => PatchOp::AddCreate { path, value: value()? },
        other => return Err(Error::PatchParse(format!("unknown op '{other}'"))),
    })
}

fn parse_ptr_member(op: &JsonNode, member: &str) -> Result<Pointer> {
    let text = op
        .get(member)
        .and_then(JsonNode::as_str)
        .ok_or_else(|| Error::PatchParse(format!("operation is missing '{member}'")))?;
    let ptr = Pointer::parse(text).map_err(|e| Error::PatchParse(e.to_string()))?;
    let plain = ptr
        .tokens()
        .iter()
        .all(|t| matches!(t, Token::Key(_) | Token::Index(_) | Token::End));
    if !plain {
        return Err(Error::PatchParse(format!(
            "patch pointers may not contain wildcards: {text}"
        )));
    }
    Ok(ptr)
}

fn apply_op(doc: &mut JsonNode, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Add { path, value } => add(doc, path, value.clone(), false),
        PatchOp::AddCreate { path, value } => add(doc, path, value.clone(), true),
        PatchOp::Remove { path } => {
            remove(doc, path)?;
            Ok(())
        }
        PatchOp::Replace { path, value } => {
            let target = doc
                .at_mut(path)
                .ok_or_else(|| Error::PatchTargetInvalid(path.to_string()))?;
            *target = value.clone();
            Ok(())
        }
        PatchOp::Move { from, path } => {
            if is_prefix(from, path) {
                return Err(Error::PatchTargetInvalid(format!(
                    "cannot move {from} into itself"
                )));
            }
            let value = remove(doc, from)?;
            add(doc, path, value, false)
        }
        PatchOp::Copy { from, path } => {
            let value = doc
                .at(from)
                .ok_or_else(|| Error::PatchTargetInvalid(from.to_string()))?
                .clone();
            add(doc, path, value, false)
        }
        PatchOp::Test { path, value } => {
            let target = doc
                .at(path)
                .ok_or_else(|| Error::PatchTestFailed(path.to_string()))?;
            if target.structural_eq(value) {
                Ok(())
            } else {
                Err(Error::PatchTestFailed(path.to_string()))
            }
        }
        PatchOp::Increment { path, value } => {
            let target = doc
                .at_mut(path)
                .ok_or_else(|| Error::PatchTargetInvalid(path.to_string()))?;
            *target = match (&*target, value) {
                (JsonNode::I64(a), JsonNode::I64(b)) => JsonNode::I64(a.wrapping_add(*b)),
                (JsonNode::I64(a), JsonNode::F64(b)) => JsonNode::F64(*a as f64 + b),
                (JsonNode::F64(a), JsonNode::I64(b)) => JsonNode::F64(a + *b as f64),
                (JsonNode::F64(a), JsonNode::F64(b)) => JsonNode::F64(a + b),
                _ => {
                    return Err(Error::PatchInvalidValue(format!(
                        "increment needs numeric target and value at {path}"
                    )));
                }
            };
            Ok(())
        }
        PatchOp::Swap { from, path } => {
            // Both ends must resolve; detach, exchange, reattach.
            doc.at(from)
                .ok_or_else(|| Error::PatchTargetInvalid(from.to_string()))?;
            doc.at(path)
                .ok_or_else(|| Error::PatchTargetInvalid(path.to_string()))?;
            let a = std::mem::replace(doc.at_mut(from).unwrap(), JsonNode::Null);
            let b = std::mem::replace(doc.at_mut(path).unwrap(), a);
            *doc.at_mut(from).unwrap() = b;
            Ok(())
        }
    }
}

fn is_prefix(prefix: &Pointer, path: &Pointer) -> bool {
    let p = prefix.tokens();
    let q = path.tokens();
    p.len() < q.len() && q[..p.len()] == *p
}

fn add(doc: &mut JsonNode, path: &Pointer, value: JsonNode, create: bool) -> Result<()> {
    let Some((parent_ptr, last)) = path.split_last() else {
        // Adding at the root replaces the whole document.
        *doc = value;
        return Ok(());
    };
    let parent = if create {
        materialize_parent(doc, &parent_ptr)?
    } else {
        doc.at_mut(&parent_ptr)
            .ok_or_else(|| Error::PatchTargetInvalid(path.to_string()))?
    };
    match (parent, last) {
        (node @ JsonNode::Object(_), Token::Key(k)) => {
            node.set_member(k, value);
            Ok(())
        }
        (node @ JsonNode::Object(_), Token::Index(i)) => {
            node.set_member(&i.to_string(), value);
            Ok(())
        }
        (node @ JsonNode::Object(_), Token::End) => {
            node.set_member("-", value);
            Ok(())
        }
        (JsonNode::Array(items), Token::Index(i)) => {
            if *i > items.len() {
                return Err(Error::PatchTargetInvalid(path.to_string()));
            }
            items.insert(*i, value);
            Ok(())
        }
        (JsonNode::Array(items), Token::End) => {
            items.push(value);
            Ok(())
        }
        _ => Err(Error::PatchTargetInvalid(path.to_string())),
    }
}

/// Walk to the parent of an `add_create` target, inserting empty objects for
/// missing key segments along the way.
fn materialize_parent<'a>(doc: &'a mut JsonNode, parent: &Pointer) -> Result<&'a mut JsonNode> {
    let mut cur = doc;
    for tok in parent.tokens() {
        cur = match tok {
            Token::Key(k) => {
                if let JsonNode::Object(_) = cur {
                    if cur.get(k).is_none() {
                        cur.set_member(k, JsonNode::Object(Vec::new()));
                    }
                    cur.get_mut(k).unwrap()
                } else {
                    return Err(Error::PatchTargetInvalid(parent.to_string()));
                }
            }
            Token::Index(i) => match cur {
                JsonNode::Array(items) => items
                    .get_mut(*i)
                    .ok_or_else(|| Error::PatchTargetInvalid(parent.to_string()))?,
                node @ JsonNode::Object(_) => {
                    let k = i.to_string();
                    if node.get(&k).is_none() {
                        node.set_member(&k, JsonNode::Object(Vec::new()));
                    }
                    node.get_mut(&k).unwrap()
                }
                _ => return Err(Error::PatchTargetInvalid(parent.to_string())),
            },
            _ => return Err(Error::PatchTargetInvalid(parent.to_string())),
        };
    }
    Ok(cur)
}

fn remove(doc: &mut JsonNode, path: &Pointer) -> Result<JsonNode> {
    let Some((parent_ptr, last)) = path.split_last() else {
        // Removing the root yields an empty object.
        return Ok(std::mem::replace(doc, JsonNode::Object(Vec::new())));
    };
    let parent = doc
        .at_mut(&parent_ptr)
        .ok_or_else(|| Error::PatchTargetInvalid(path.to_string()))?;
    match (parent, last) {
        (node @ JsonNode::Object(_), Token::Key(k)) => node
            .remove_member(k)
            .ok_or_else(|| Error::PatchTargetInvalid(path.to_string())),
        (node @ JsonNode::Object(_), Token::Index(i)) => node
            .remove_member(&i.to_string())
            .ok_or_else(|| Error::PatchTargetInvalid(path.to_string())),
        (JsonNode::Array(items), Token::Index(i)) => {
            if *i < items.len() {
                Ok(items.remove(*i))
            } else {
                Err(Error::PatchTargetInvalid(path.to_string()))
            }
        }
        _ => Err(Error::PatchTargetInvalid(path.to_string())),
    }
}

/// RFC 7396 merge patch: null member values remove keys, nested objects merge
/// recursively, anything else replaces the target wholesale.
pub fn merge_patch(doc: &mut JsonNode, patch: &JsonNode) {
    let JsonNode::Object(members) = patch else {
        *doc = patch.clone();
        return;
    };
    if !matches!(doc, JsonNode::Object(_)) {
        *doc = JsonNode::Object(Vec::new());
    }
    for (k, pv) in members {
        match pv {
            JsonNode::Null => {
                doc.remove_member(k);
            }
            JsonNode::Object(_) => {
                if doc.get(k).is_none() {
                    doc.set_member(k, JsonNode::Object(Vec::new()));
                }
                merge_patch(doc.get_mut(k).unwrap(), pv);
            }
            other => doc.set_member(k, other.clone()),
        }
    }
}
