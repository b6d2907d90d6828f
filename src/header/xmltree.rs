//! Minimal owned XML tree and the dynamically-typed metadata values
//! extracted from it.
//!
//! Bruker headers are XML documents where almost everything is a
//! `ClassInstance` element discriminated by its `Type` attribute. Consumers
//! want plain nested dictionaries, so `dictionarize` flattens a node the way
//! downstream tooling expects: `ClassInstance` children collapse into their
//! parent key, attributes on elements that also have children are prefixed
//! with `XmlClass` to avoid key collisions, and leaf text is interpreted as
//! integer, float, boolean or string.

use std::collections::BTreeMap;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use crate::error::{Error, Result};

/// One element of the parsed document.
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    /// Parse a whole document and return its root element.
    pub fn parse(xml: &[u8]) -> Result<XmlNode> {
        let mut reader = Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut stack: Vec<XmlNode> = Vec::new();
        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| Error::BadHeader(format!("XML parse error: {e}")))?;
            match event {
                Event::Start(e) => {
                    stack.push(Self::open(&e)?);
                }
                Event::Empty(e) => {
                    let node = Self::open(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                }
                Event::Text(e) => {
                    if let Some(open) = stack.last_mut() {
                        let text = e
                            .unescape()
                            .map_err(|e| Error::BadHeader(format!("XML text error: {e}")))?;
                        open.text.push_str(&text);
                    }
                }
                Event::CData(e) => {
                    if let Some(open) = stack.last_mut() {
                        open.text.push_str(&String::from_utf8_lossy(&e));
                    }
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| Error::BadHeader("unbalanced XML".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                }
                Event::Eof => {
                    return Err(Error::BadHeader("empty or unterminated XML".to_string()))
                }
                _ => {}
            }
            buf.clear();
        }
    }

    fn open(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlNode> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| Error::BadHeader(format!("XML attribute error: {e}")))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| Error::BadHeader(format!("XML attribute error: {e}")))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(XmlNode {
            tag,
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// First direct child with the given tag.
    pub fn find(&self, tag: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn find_all<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// First direct `ClassInstance` child with the given `Type` attribute.
    pub fn find_class(&self, type_name: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|c| c.tag == "ClassInstance" && c.attr("Type") == Some(type_name))
    }

    pub fn find_classes<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children
            .iter()
            .filter(move |c| c.tag == "ClassInstance" && c.attr("Type") == Some(type_name))
    }

    /// First direct `ClassInstance` child with the given `Name` attribute.
    pub fn find_class_named(&self, name: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|c| c.tag == "ClassInstance" && c.attr("Name") == Some(name))
    }
}

/// A dynamically-typed metadata value: the XML text-interpretation ladder
/// maps leaf text to `Int`, `Float`, `Bool` or `Str`; elements become nested
/// maps and repeated keys become lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

/// Interpret leaf text: integer, then float, then boolean literal,
/// otherwise the string itself.
pub fn interpret(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Float(f);
    }
    match s {
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        _ => Value::Str(s.to_string()),
    }
}

/// Convert an element to a metadata value keyed by its tag, collapsing a
/// top-level `ClassInstance` to its bare content.
pub fn dictionarize(node: &XmlNode) -> Value {
    let content = node_content(node);
    if node.tag == "ClassInstance" {
        content
    } else {
        let mut m = BTreeMap::new();
        m.insert(node.tag.clone(), content);
        Value::Map(m)
    }
}

fn node_content(node: &XmlNode) -> Value {
    if node.children.is_empty() && node.attributes.is_empty() {
        let text = node.text();
        if text.is_empty() {
            return Value::Null;
        }
        return interpret(text);
    }

    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for child in &node.children {
        let content = node_content(child);
        if child.tag == "ClassInstance" {
            // ClassInstance children collapse: their keys merge into ours.
            match content {
                Value::Map(m) => {
                    for (k, v) in m {
                        grouped.entry(k).or_default().push(v);
                    }
                }
                other => grouped.entry(child.tag.clone()).or_default().push(other),
            }
        } else {
            grouped.entry(child.tag.clone()).or_default().push(content);
        }
    }

    let mut content: BTreeMap<String, Value> = grouped
        .into_iter()
        .map(|(k, mut vs)| {
            if vs.len() == 1 {
                let v = vs.remove(0);
                (k, v)
            } else {
                (k, Value::List(vs))
            }
        })
        .collect();

    let has_children = !node.children.is_empty();
    for (k, v) in &node.attributes {
        let key = if has_children {
            format!("XmlClass{k}")
        } else {
            k.clone()
        };
        content.insert(key, interpret(v));
    }
    let text = node.text();
    if !text.is_empty() {
        content.insert("#text".to_string(), interpret(text));
    }
    Value::Map(content)
}
