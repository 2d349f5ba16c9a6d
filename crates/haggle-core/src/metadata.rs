//! XML-shaped metadata documents
//!
//! Data objects and node descriptions travel as tree-structured metadata
//! with a `Haggle` root element. The tree is owned by value under the data
//! object; serialized bytes are produced on demand rather than cached.

use crate::error::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Root element of every Haggle metadata document
pub const HAGGLE_TAG: &str = "Haggle";
/// Attribute element tag (parameter `name`, optional `weight`, text = value)
pub const ATTRIBUTE_TAG: &str = "Attribute";

/// A named element with parameters, optional text content and children
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    name: String,
    parameters: Vec<(String, String)>,
    content: Option<String>,
    children: Vec<Metadata>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Metadata {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Metadata {
            name: name.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
    }

    /// Set a parameter, replacing any existing value for the same key
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        if let Some(p) = self.parameters.iter_mut().find(|(k, _)| *k == key) {
            p.1 = value;
        } else {
            self.parameters.push((key, value));
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn add_child(&mut self, child: Metadata) -> &mut Metadata {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    /// First child with the given tag
    pub fn child(&self, name: &str) -> Option<&Metadata> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Metadata> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All children with the given tag
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Metadata> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn children(&self) -> &[Metadata] {
        &self.children
    }

    /// Serialize to XML bytes with a standard declaration
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(xml_err)?;
        self.write_element(&mut writer)?;
        Ok(writer.into_inner().into_inner())
    }

    fn write_element(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.parameters {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.content.is_none() && self.children.is_empty() {
            writer.write_event(XmlEvent::Empty(start)).map_err(xml_err)?;
            return Ok(());
        }
        writer.write_event(XmlEvent::Start(start)).map_err(xml_err)?;
        if let Some(content) = &self.content {
            writer
                .write_event(XmlEvent::Text(BytesText::new(content)))
                .map_err(xml_err)?;
        }
        for child in &self.children {
            child.write_element(writer)?;
        }
        writer
            .write_event(XmlEvent::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_err)?;
        Ok(())
    }

    /// Parse a document from XML bytes; returns the root element
    pub fn from_xml(bytes: &[u8]) -> Result<Metadata> {
        let mut reader = Reader::from_reader(bytes);
        reader.trim_text(true);

        let mut stack: Vec<Metadata> = Vec::new();
        let mut root: Option<Metadata> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(xml_err)? {
                XmlEvent::Start(ref e) => {
                    stack.push(element_from_start(e)?);
                }
                XmlEvent::Empty(ref e) => {
                    let elem = element_from_start(e)?;
                    attach(&mut stack, &mut root, elem)?;
                }
                XmlEvent::Text(ref t) => {
                    let text = t
                        .unescape()
                        .map_err(xml_err)?
                        .trim()
                        .to_string();
                    if text.is_empty() {
                        continue;
                    }
                    let top = stack
                        .last_mut()
                        .ok_or_else(|| Error::Metadata("text outside any element".into()))?;
                    match &mut top.content {
                        Some(existing) => existing.push_str(&text),
                        None => top.content = Some(text),
                    }
                }
                XmlEvent::End(_) => {
                    let elem = stack
                        .pop()
                        .ok_or_else(|| Error::Metadata("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, elem)?;
                }
                XmlEvent::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(Error::Metadata("truncated document".into()));
        }
        root.ok_or_else(|| Error::Metadata("empty document".into()))
    }
}

fn attach(stack: &mut [Metadata], root: &mut Option<Metadata>, elem: Metadata) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(elem);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(elem);
            Ok(())
        }
        None => Err(Error::Metadata("multiple root elements".into())),
    }
}

fn element_from_start(e: &BytesStart<'_>) -> Result<Metadata> {
    let name = String::from_utf8(e.name().as_ref().to_vec())
        .map_err(|_| Error::Metadata("non-utf8 element name".into()))?;
    let mut elem = Metadata::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Metadata(e.to_string()))?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())
            .map_err(|_| Error::Metadata("non-utf8 attribute key".into()))?;
        let value = attr
            .unescape_value()
            .map_err(xml_err)?
            .into_owned();
        elem.parameters.push((key, value));
    }
    Ok(elem)
}

fn xml_err(e: quick_xml::Error) -> Error {
    Error::Metadata(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut doc = Metadata::new(HAGGLE_TAG);
        doc.set_parameter("persistent", "yes");
        doc.set_parameter("create_time", "1234.000500");
        let mut attr = Metadata::with_content(ATTRIBUTE_TAG, "weather");
        attr.set_parameter("name", "Topic");
        attr.set_parameter("weight", 3);
        doc.add_child(attr);
        doc.add_child(Metadata::new("Data"));

        let bytes = doc.to_xml().unwrap();
        let parsed = Metadata::from_xml(&bytes).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_parse_external_shape() {
        let xml = br#"<?xml version="1.0"?>
            <Haggle persistent="no">
              <Attribute name="Control">registration_request</Attribute>
              <Attribute name="ApplicationName">demo</Attribute>
            </Haggle>"#;
        let doc = Metadata::from_xml(xml).unwrap();
        assert_eq!(doc.name(), HAGGLE_TAG);
        assert_eq!(doc.parameter("persistent"), Some("no"));
        let attrs: Vec<_> = doc.children_named(ATTRIBUTE_TAG).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].parameter("name"), Some("Control"));
        assert_eq!(attrs[0].content(), Some("registration_request"));
    }

    #[test]
    fn test_escaped_content() {
        let mut doc = Metadata::new(HAGGLE_TAG);
        doc.add_child(Metadata::with_content("Filename", "a<b&c.txt"));
        let bytes = doc.to_xml().unwrap();
        let parsed = Metadata::from_xml(&bytes).unwrap();
        assert_eq!(
            parsed.child("Filename").unwrap().content(),
            Some("a<b&c.txt")
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Metadata::from_xml(b"<open><unclosed>").is_err());
        assert!(Metadata::from_xml(b"").is_err());
    }
}
