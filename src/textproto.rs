//! Text-format records.
//!
//! Package metadata and build recipes are stored as UTF-8 text-format
//! messages: `key: "value"` scalar fields, `key { ... }` nested messages,
//! fields repeatable, `#` comments. This module implements the subset
//! those files use; [`crate::meta`] layers typed views on top.

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Message(Message),
}

/// An ordered multimap of fields. Repeated fields keep their file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_message(&self, name: &str) -> Option<&Message> {
        match self.get(name) {
            Some(Value::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub fn strings<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields.iter().filter_map(move |(k, v)| match v {
            Value::Str(s) if k == name => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn messages<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Message> {
        self.fields.iter().filter_map(move |(k, v)| match v {
            Value::Message(m) if k == name => Some(m),
            _ => None,
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn add(&mut self, name: &str, value: Value) -> &mut Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn add_str(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.add(name, Value::Str(value.into()))
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out, 0);
        out
    }

    fn serialize_into(&self, out: &mut String, indent: usize) {
        for (k, v) in &self.fields {
            for _ in 0..indent {
                out.push_str("  ");
            }
            match v {
                Value::Str(s) => {
                    out.push_str(k);
                    out.push_str(": \"");
                    for c in s.chars() {
                        match c {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\t' => out.push_str("\\t"),
                            c => out.push(c),
                        }
                    }
                    out.push_str("\"\n");
                }
                Value::Int(i) => {
                    out.push_str(k);
                    out.push_str(": ");
                    out.push_str(&i.to_string());
                    out.push('\n');
                }
                Value::Bool(b) => {
                    out.push_str(k);
                    out.push_str(": ");
                    out.push_str(if *b { "true" } else { "false" });
                    out.push('\n');
                }
                Value::Message(m) => {
                    out.push_str(k);
                    out.push_str(" {\n");
                    m.serialize_into(out, indent + 1);
                    for _ in 0..indent {
                        out.push_str("  ");
                    }
                    out.push_str("}\n");
                }
            }
        }
    }
}

pub fn parse(input: &str, file: &str) -> Result<Message, Error> {
    let mut p = Parser { input: input.as_bytes(), pos: 0, line: 1, file };
    let msg = p.message(true)?;
    Ok(msg)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    file: &'a str,
}

impl Parser<'_> {
    fn err(&self, msg: impl Into<String>) -> Error {
        Error::Textproto { file: self.file.to_string(), line: self.line, msg: msg.into() }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_space(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' | b';' => {
                    self.bump();
                }
                b'#' => {
                    while let Some(b) = self.bump() {
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn message(&mut self, top_level: bool) -> Result<Message, Error> {
        let mut msg = Message::new();
        loop {
            self.skip_space();
            match self.peek() {
                None => {
                    if top_level {
                        return Ok(msg);
                    }
                    return Err(self.err("unexpected end of input, missing '}'"));
                }
                Some(b'}') => {
                    if top_level {
                        return Err(self.err("unexpected '}'"));
                    }
                    self.bump();
                    return Ok(msg);
                }
                _ => {}
            }
            let key = self.identifier()?;
            self.skip_space();
            match self.peek() {
                Some(b':') => {
                    self.bump();
                    self.skip_space();
                    if self.peek() == Some(b'{') {
                        self.bump();
                        msg.add(&key, Value::Message(self.message(false)?));
                    } else {
                        let v = self.scalar()?;
                        msg.add(&key, v);
                    }
                }
                Some(b'{') => {
                    self.bump();
                    msg.add(&key, Value::Message(self.message(false)?));
                }
                _ => return Err(self.err(format!("expected ':' or '{{' after {key:?}"))),
            }
        }
    }

    fn identifier(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err("expected field name"));
        }
        Ok(String::from_utf8(self.input[start..self.pos].to_vec()).unwrap())
    }

    fn scalar(&mut self) -> Result<Value, Error> {
        match self.peek() {
            Some(b'"') => {
                self.bump();
                let mut s = String::new();
                loop {
                    match self.bump() {
                        None => return Err(self.err("unterminated string")),
                        Some(b'"') => break,
                        Some(b'\\') => match self.bump() {
                            Some(b'"') => s.push('"'),
                            Some(b'\\') => s.push('\\'),
                            Some(b'n') => s.push('\n'),
                            Some(b't') => s.push('\t'),
                            other => {
                                return Err(self.err(format!(
                                    "unsupported escape \\{}",
                                    other.map(char::from).unwrap_or('?')
                                )))
                            }
                        },
                        Some(b) => {
                            // re-assemble multi-byte UTF-8 sequences
                            if b < 0x80 {
                                s.push(b as char);
                            } else {
                                let start = self.pos - 1;
                                let mut end = self.pos;
                                while end < self.input.len() && self.input[end] & 0xc0 == 0x80 {
                                    end += 1;
                                }
                                let chunk = std::str::from_utf8(&self.input[start..end])
                                    .map_err(|_| self.err("invalid UTF-8 in string"))?;
                                s.push_str(chunk);
                                self.pos = end;
                            }
                        }
                    }
                }
                Ok(Value::Str(s))
            }
            Some(b) if b == b'-' || b.is_ascii_digit() => {
                let start = self.pos;
                self.bump();
                while let Some(b) = self.peek() {
                    if b.is_ascii_digit() {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap();
                text.parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| self.err(format!("invalid integer {text:?}")))
            }
            Some(b't') | Some(b'f') => {
                let word = self.identifier()?;
                match word.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(self.err(format!("expected scalar, found {word:?}"))),
                }
            }
            _ => Err(self.err("expected scalar value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars_and_repeats() {
        let msg = parse(
            r#"
# a recipe
source: "https://example.org/less-530.tar.gz"
dep: "ncurses"
dep: "glibc"
writable_sourcedir: true
jobs: 4
"#,
            "less.textproto",
        )
        .unwrap();
        assert_eq!(msg.get_str("source"), Some("https://example.org/less-530.tar.gz"));
        assert_eq!(msg.strings("dep").collect::<Vec<_>>(), vec!["ncurses", "glibc"]);
        assert_eq!(msg.get_bool("writable_sourcedir"), Some(true));
        assert_eq!(msg.get_int("jobs"), Some(4));
    }

    #[test]
    fn test_parse_nested() {
        let msg = parse(
            r#"
runtime_union {
  pkg: "emacs"
  dir: "share/emacs"
}
install {
  symlink { oldname: "spim" newname: "bin/spim" }
}
"#,
            "meta",
        )
        .unwrap();
        let union = msg.get_message("runtime_union").unwrap();
        assert_eq!(union.get_str("pkg"), Some("emacs"));
        let link = msg.get_message("install").unwrap().get_message("symlink").unwrap();
        assert_eq!(link.get_str("newname"), Some("bin/spim"));
    }

    #[test]
    fn test_roundtrip() {
        let mut inner = Message::new();
        inner.add_str("pkg", "fonts");
        inner.add_str("dir", "share/fonts");
        let mut msg = Message::new();
        msg.add_str("version", "530-2");
        msg.add("runtime_union", Value::Message(inner));
        msg.add("jobs", Value::Int(8));
        msg.add("hermetic", Value::Bool(false));
        msg.add_str("quoted", "a \"b\"\nc");

        let text = msg.serialize();
        assert_eq!(parse(&text, "t").unwrap(), msg);
    }

    #[test]
    fn test_error_carries_line() {
        let err = parse("good: \"x\"\nbad: @", "f.textproto").unwrap_err();
        match err {
            Error::Textproto { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
