use std::fmt;

use crate::error::{Error, Result};

/// One parsed segment of a JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Object member name, unescaped. Never a plain integer.
    Key(String),
    /// Numeric segment: array index, or the member of that name on objects.
    Index(usize),
    /// `*` wildcard: any single child, first match wins.
    Any,
    /// `**` wildcard: any chain of one or more descent steps (filters only).
    AnyDeep,
    /// `-`: one past the end of an array (patch append position).
    End,
}

impl Token {
    fn parse(raw: &str) -> Token {
        match raw {
            "*" => return Token::Any,
            "**" => return Token::AnyDeep,
            "-" => return Token::End,
            _ => {}
        }
        let numeric = !raw.is_empty()
            && raw.bytes().all(|b| b.is_ascii_digit())
            && (raw.len() == 1 || !raw.starts_with('0'));
        if numeric {
            if let Ok(i) = raw.parse::<usize>() {
                return Token::Index(i);
            }
        }
        Token::Key(raw.replace("~1", "/").replace("~0", "~"))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Key(k) => write!(f, "{}", k.replace('~', "~0").replace('/', "~1")),
            Token::Index(i) => write!(f, "{i}"),
            Token::Any => write!(f, "*"),
            Token::AnyDeep => write!(f, "**"),
            Token::End => write!(f, "-"),
        }
    }
}

/// A parsed JSON pointer (RFC 6901 plus `*`/`**` wildcard segments).
///
/// The empty pointer addresses the root. `"/"` and any pointer containing an
/// empty segment (`"//"`) are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    tokens: Vec<Token>,
}

impl Pointer {
    pub fn root() -> Pointer {
        Pointer { tokens: Vec::new() }
    }

    pub fn parse(s: &str) -> Result<Pointer> {
        if s.is_empty() {
            return Ok(Pointer::root());
        }
        if !s.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "json pointer must start with '/': {s}"
            )));
        }
        let mut tokens = Vec::new();
        for raw in s[1..].split('/') {
            if raw.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "json pointer has an empty segment: {s}"
                )));
            }
            tokens.push(Token::parse(raw));
        }
        Ok(Pointer { tokens })
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Pointer {
        Pointer { tokens }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    /// True when every segment is a plain key or index (usable as an index
    /// path or projection mask).
    pub fn is_simple(&self) -> bool {
        self.tokens
            .iter()
            .all(|t| matches!(t, Token::Key(_) | Token::Index(_)))
    }

    /// Split into (parent, last). Root has no last segment.
    pub fn split_last(&self) -> Option<(Pointer, &Token)> {
        let (last, init) = self.tokens.split_last()?;
        Some((
            Pointer {
                tokens: init.to_vec(),
            },
            last,
        ))
    }

    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.tokens {
            write!(f, "/{t}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_pointer() {
        let p = Pointer::parse("").unwrap();
        assert!(p.is_root());
        assert_eq!(p.to_string(), "");
    }

    #[test]
    fn plain_segments() {
        let p = Pointer::parse("/foo/bar/3").unwrap();
        assert_eq!(
            p.tokens(),
            &[
                Token::Key("foo".into()),
                Token::Key("bar".into()),
                Token::Index(3)
            ]
        );
    }

    #[test]
    fn unescaping() {
        let p = Pointer::parse("/a~1b/c~0d").unwrap();
        assert_eq!(
            p.tokens(),
            &[Token::Key("a/b".into()), Token::Key("c~d".into())]
        );
        assert_eq!(p.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn leading_zero_is_a_key() {
        let p = Pointer::parse("/01").unwrap();
        assert_eq!(p.tokens(), &[Token::Key("01".into())]);
        let p = Pointer::parse("/0").unwrap();
        assert_eq!(p.tokens(), &[Token::Index(0)]);
    }

    #[test]
    fn wildcards_and_end() {
        let p = Pointer::parse("/*/x/**/-").unwrap();
        assert_eq!(
            p.tokens(),
            &[
                Token::Any,
                Token::Key("x".into()),
                Token::AnyDeep,
                Token::End
            ]
        );
        assert!(!p.is_simple());
    }

    #[test]
    fn empty_segments_rejected() {
        assert!(Pointer::parse("/").is_err());
        assert!(Pointer::parse("//").is_err());
        assert!(Pointer::parse("/a//b").is_err());
        assert!(Pointer::parse("a/b").is_err());
    }

    #[test]
    fn split_last_parent() {
        let p = Pointer::parse("/a/b/c").unwrap();
        let (parent, last) = p.split_last().unwrap();
        assert_eq!(parent.to_string(), "/a/b");
        assert_eq!(last, &Token::Key("c".into()));
        assert!(Pointer::root().split_last().is_none());
    }
}
