//! Minimal owned XML element tree used for every unit that crosses the wire.

use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An element with its resolved namespace. `ns` is the effective namespace, whether
/// declared on the element itself or inherited from an ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, ns: &str) -> Self {
        Self {
            prefix: None,
            name: name.to_string(),
            ns: Some(ns.to_string()),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// An element that inherits its namespace from wherever it is placed.
    pub fn unqualified(name: &str) -> Self {
        Self {
            prefix: None,
            name: name.to_string(),
            ns: None,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.children.push(Node::Text(text));
        }
        self
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// True when both the local name and the effective namespace match.
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn find(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, ns))
    }

    /// Concatenated direct text content.
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize as a fragment whose surrounding default namespace is `context_ns`.
    pub fn to_xml(&self, context_ns: Option<&str>) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, context_ns);
        out
    }

    fn write_xml(&self, out: &mut String, context_ns: Option<&str>) {
        out.push('<');
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);

        let mut child_context = context_ns;
        match (&self.prefix, self.ns.as_deref()) {
            (Some(prefix), Some(ns)) => {
                if ns != NS_STREAMS {
                    push_attr(out, &format!("xmlns:{prefix}"), ns);
                }
            }
            (None, Some(ns)) => {
                if context_ns != Some(ns) {
                    push_attr(out, "xmlns", ns);
                }
                child_context = Some(ns);
            }
            _ => {}
        }
        for (k, v) in &self.attrs {
            push_attr(out, k, v);
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_xml(out, child_context),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse one complete element. `default_ns` is the namespace in effect around it
    /// (the stream's default namespace for top-level units).
    pub fn parse(xml: &str, default_ns: &str) -> Result<Element, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let root_scope = Scope {
            default_ns: Some(default_ns.to_string()),
            prefixes: vec![("stream".to_string(), NS_STREAMS.to_string())],
        };
        let mut stack: Vec<(Element, Scope)> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().map_err(|e| e.to_string())? {
                Event::Start(e) => {
                    let parent = stack.last().map(|(_, s)| s).unwrap_or(&root_scope);
                    let (el, scope) = open_element(&e, parent)?;
                    stack.push((el, scope));
                }
                Event::Empty(e) => {
                    let parent = stack.last().map(|(_, s)| s).unwrap_or(&root_scope);
                    let (el, _) = open_element(&e, parent)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::End(_) => {
                    let (el, _) = stack.pop().ok_or("unbalanced closing tag")?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(|e| e.to_string())?;
                    match stack.last_mut() {
                        Some((parent, _)) => {
                            if !text.is_empty() {
                                parent.children.push(Node::Text(text.into_owned()));
                            }
                        }
                        None if text.trim().is_empty() => {}
                        None => return Err("text outside of an element".to_string()),
                    }
                }
                Event::CData(c) => {
                    let text = std::str::from_utf8(&c).map_err(|e| e.to_string())?;
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.children.push(Node::Text(text.to_string()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err("element not closed".to_string());
        }
        root.ok_or_else(|| "no element found".to_string())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml(None))
    }
}

struct Scope {
    default_ns: Option<String>,
    prefixes: Vec<(String, String)>,
}

impl Scope {
    fn lookup(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(NS_XML);
        }
        self.prefixes
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, ns)| ns.as_str())
    }
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

fn open_element(start: &BytesStart<'_>, parent: &Scope) -> Result<(Element, Scope), String> {
    let qname = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| e.to_string())?
        .to_string();
    let mut scope = Scope {
        default_ns: parent.default_ns.clone(),
        prefixes: parent.prefixes.clone(),
    };
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| e.to_string())?
            .to_string();
        let value = attr.unescape_value().map_err(|e| e.to_string())?.into_owned();
        if key == "xmlns" {
            scope.default_ns = Some(value).filter(|v| !v.is_empty());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.push((prefix.to_string(), value));
        } else {
            attrs.push((key, value));
        }
    }

    let (prefix, name) = match qname.split_once(':') {
        Some((p, n)) => (Some(p.to_string()), n.to_string()),
        None => (None, qname),
    };
    let ns = match &prefix {
        Some(p) => Some(
            scope
                .lookup(p)
                .ok_or_else(|| format!("undeclared namespace prefix '{p}'"))?
                .to_string(),
        ),
        None => scope.default_ns.clone(),
    };

    Ok((
        Element {
            prefix,
            name,
            ns,
            attrs,
            children: Vec::new(),
        },
        scope,
    ))
}

fn attach(
    stack: &mut [(Element, Scope)],
    root: &mut Option<Element>,
    el: Element,
) -> Result<(), String> {
    match stack.last_mut() {
        Some((parent, _)) => {
            parent.children.push(Node::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err("more than one root element".to_string()),
    }
}
