//! XML stream reassembly
//!
//! The INDI-server writes a stream of XML elements over TCP with no framing,
//! so chunk boundaries fall anywhere. [`XmlFlattener`] buffers incoming bytes
//! and cuts them back into complete elements, including the protocol's
//! self-closing variants that never get a closing tag. It also carries the
//! XML to JSON translation used by the WebSocket bridge.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{AgentError, Result};
use crate::limits::MAX_LOCAL_READ;

/// Tags that are always emitted self-closed by the INDI protocol.
/// For these the element ends at the first `/>`.
const SELF_CLOSING_TAGS: [&[u8]; 3] = [b"message", b"delProperty", b"getProperties"];

/// Key used for element text content in the JSON mapping.
const TEXT_KEY: &str = "#text";

/// Prefix for attribute keys in the JSON mapping.
const ATTR_PREFIX: &str = "attr_";

/// Reassembles an INDI XML byte stream into complete elements.
///
/// Feed arbitrary chunks in arrival order; complete elements come out in the
/// same order. Unterminated trailing bytes stay buffered until later chunks
/// complete them. The flattener never resynchronizes on its own: a buffer
/// that never closes is bounded only by the caller closing the channel.
pub struct XmlFlattener {
    buffer: Vec<u8>,
    next_end: Vec<u8>,
}

impl Default for XmlFlattener {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlFlattener {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_LOCAL_READ),
            next_end: Vec::new(),
        }
    }

    /// Append a chunk and return every element completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut elements = Vec::new();
        if chunk.is_empty() {
            return elements;
        }

        self.buffer.extend_from_slice(chunk);

        loop {
            if self.next_end.is_empty() {
                // skip stray bytes (newlines between elements) up to the next '<'
                if let Some(n) = self.buffer.iter().position(|&b| b == b'<') {
                    if n > 0 {
                        self.buffer.drain(..n);
                    }
                }
                if self.buffer.first() != Some(&b'<') {
                    return elements;
                }

                let Some(end) = expected_end(&self.buffer) else {
                    // opening tag not complete yet
                    return elements;
                };
                self.next_end = end;
            }

            let Some(n) = find(&self.buffer, &self.next_end) else {
                // closer not buffered yet, wait for the next chunk
                return elements;
            };

            let end = (n + self.next_end.len()).min(self.buffer.len());
            elements.push(self.buffer[..end].to_vec());
            self.next_end.clear();

            if end == self.buffer.len() {
                self.buffer.clear();
                return elements;
            }
            self.buffer.drain(..end);
        }
    }

    /// Feed a chunk and translate each completed element to a JSON document.
    ///
    /// An element that fails to parse is logged and dropped; the stream
    /// itself stays in sync because framing is purely boundary-driven.
    pub fn xml_chunk_to_json(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let elements = self.feed(chunk);
        let mut docs = Vec::with_capacity(elements.len());
        for el in elements {
            match element_to_json(&el) {
                Ok(doc) => docs.push(doc),
                Err(err) => warn!("could not parse XML element: {err}"),
            }
        }
        docs
    }

    /// Translate a single JSON document back into its XML element.
    pub fn json_to_xml(&self, doc: &[u8]) -> Result<Vec<u8>> {
        json_to_xml(doc)
    }
}

/// Determine the byte sequence that will terminate the element starting at
/// the head of `buffer`, or `None` when the opening tag is still incomplete.
fn expected_end(buffer: &[u8]) -> Option<Vec<u8>> {
    // tag name runs from after '<' to the first space, newline, '/' or '>'
    let rel = buffer[1..]
        .iter()
        .position(|&b| b == b' ' || b == b'\n' || b == b'/' || b == b'>')?;
    let name = &buffer[1..1 + rel];
    if name.is_empty() {
        return None;
    }

    let terminator = buffer[1 + rel];
    if SELF_CLOSING_TAGS.contains(&name) || terminator == b'/' {
        return Some(b"/>".to_vec());
    }

    let mut end = Vec::with_capacity(name.len() + 3);
    end.extend_from_slice(b"</");
    end.extend_from_slice(name);
    end.push(b'>');
    Some(end)
}

/// Return the tag name of a complete element, e.g. `defSwitch` for
/// `<defSwitch name='x'>...</defSwitch>`.
pub fn tag_name(element: &[u8]) -> Option<&[u8]> {
    if element.first() != Some(&b'<') {
        return None;
    }
    let rel = element[1..]
        .iter()
        .position(|&b| b == b' ' || b == b'\n' || b == b'/' || b == b'>')?;
    let name = &element[1..1 + rel];
    (!name.is_empty()).then_some(name)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// XML <-> JSON mapping
//
// Attributes become "attr_"-prefixed keys, element text becomes "#text"
// (or the value itself when the element carries nothing else), and repeated
// child tags collapse into arrays. The mapping round-trips the element
// shapes the INDI protocol produces, modulo attribute ordering.
// ---------------------------------------------------------------------------

/// Convert one complete XML element into a JSON document
/// `{"<tag>": <content>}`.
pub fn element_to_json(element: &[u8]) -> Result<Vec<u8>> {
    let mut parser = ElementParser {
        input: element,
        pos: 0,
    };
    let (name, content) = parser.parse_element()?;
    let mut doc = Map::new();
    doc.insert(name, content);
    Ok(serde_json::to_vec(&Value::Object(doc))?)
}

/// Convert a JSON document of the shape produced by [`element_to_json`]
/// back into an XML element.
pub fn json_to_xml(doc: &[u8]) -> Result<Vec<u8>> {
    let value: Value = serde_json::from_slice(doc)?;
    let Value::Object(map) = value else {
        return Err(AgentError::Xml("document root is not an object".into()));
    };
    if map.len() != 1 {
        return Err(AgentError::Xml(format!(
            "document must have exactly one root element, got {}",
            map.len()
        )));
    }
    let mut out = Vec::new();
    for (tag, content) in map {
        write_element(&mut out, &tag, &content)?;
    }
    Ok(out)
}

struct ElementParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> ElementParser<'a> {
    fn parse_element(&mut self) -> Result<(String, Value)> {
        self.expect(b'<')?;
        let name = self.read_name()?;

        let mut attrs = Map::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    // self-closed element: attributes only
                    let content = if attrs.is_empty() {
                        Value::String(String::new())
                    } else {
                        Value::Object(attrs)
                    };
                    return Ok((name, content));
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let (key, val) = self.read_attribute()?;
                    attrs.insert(format!("{ATTR_PREFIX}{key}"), Value::String(val));
                }
                None => return Err(AgentError::Xml("unterminated opening tag".into())),
            }
        }

        // body: text and/or child elements, up to the matching closer
        let mut text = String::new();
        let mut children: Vec<(String, Value)> = Vec::new();
        loop {
            let chunk_start = self.pos;
            while self.peek().is_some() && self.peek() != Some(b'<') {
                self.pos += 1;
            }
            if self.pos > chunk_start {
                text.push_str(&decode_entities(&self.input[chunk_start..self.pos])?);
            }
            match self.peek() {
                Some(b'<') if self.input[self.pos..].starts_with(b"</") => {
                    self.pos += 2;
                    let closer = self.read_name()?;
                    self.skip_whitespace();
                    self.expect(b'>')?;
                    if closer != name {
                        return Err(AgentError::Xml(format!(
                            "mismatched closing tag </{closer}> for <{name}>"
                        )));
                    }
                    break;
                }
                Some(b'<') => {
                    let child = self.parse_element()?;
                    children.push(child);
                }
                None => {
                    return Err(AgentError::Xml(format!("missing closing tag for <{name}>")))
                }
                Some(_) => unreachable!("preceding loop only stops at '<' or end of input"),
            }
        }

        let text = text.trim().to_string();
        let content = if children.is_empty() && attrs.is_empty() {
            Value::String(text)
        } else {
            let mut map = attrs;
            if !text.is_empty() {
                map.insert(TEXT_KEY.to_string(), Value::String(text));
            }
            for (child_name, child_value) in children {
                match map.remove(&child_name) {
                    None => {
                        map.insert(child_name, child_value);
                    }
                    Some(Value::Array(mut items)) => {
                        items.push(child_value);
                        map.insert(child_name, Value::Array(items));
                    }
                    Some(existing) => {
                        map.insert(child_name, Value::Array(vec![existing, child_value]));
                    }
                }
            }
            Value::Object(map)
        };

        Ok((name, content))
    }

    fn read_name(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\n' || b == b'\t' || b == b'/' || b == b'>' {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(AgentError::Xml("empty tag name".into()));
        }
        String::from_utf8(self.input[start..self.pos].to_vec())
            .map_err(|_| AgentError::Xml("tag name is not valid UTF-8".into()))
    }

    fn read_attribute(&mut self) -> Result<(String, String)> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' || b == b' ' || b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        let key = String::from_utf8(self.input[start..self.pos].to_vec())
            .map_err(|_| AgentError::Xml("attribute name is not valid UTF-8".into()))?;
        self.skip_whitespace();
        self.expect(b'=')?;
        self.skip_whitespace();
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => q,
            _ => return Err(AgentError::Xml(format!("attribute {key} is not quoted"))),
        };
        self.pos += 1;
        let val_start = self.pos;
        while self.peek().is_some() && self.peek() != Some(quote) {
            self.pos += 1;
        }
        if self.peek() != Some(quote) {
            return Err(AgentError::Xml(format!("unterminated value for {key}")));
        }
        let val = decode_entities(&self.input[val_start..self.pos])?;
        self.pos += 1;
        Ok((key, val))
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\n' | b'\t' | b'\r')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(AgentError::Xml(format!(
                "expected {:?} at offset {}",
                b as char, self.pos
            )))
        }
    }
}

fn write_element(out: &mut Vec<u8>, tag: &str, content: &Value) -> Result<()> {
    match content {
        // repeated elements at the same level
        Value::Array(items) => {
            for item in items {
                write_element(out, tag, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            out.push(b'<');
            out.extend_from_slice(tag.as_bytes());
            let mut text = None;
            let mut children: Vec<(&String, &Value)> = Vec::new();
            for (key, val) in map {
                if let Some(attr) = key.strip_prefix(ATTR_PREFIX) {
                    let Value::String(s) = val else {
                        return Err(AgentError::Xml(format!(
                            "attribute {attr} is not a string"
                        )));
                    };
                    out.push(b' ');
                    out.extend_from_slice(attr.as_bytes());
                    out.extend_from_slice(b"=\"");
                    out.extend_from_slice(encode_entities(s, true).as_bytes());
                    out.push(b'"');
                } else if key == TEXT_KEY {
                    text = Some(val);
                } else {
                    children.push((key, val));
                }
            }
            if text.is_none() && children.is_empty() {
                out.extend_from_slice(b"/>");
                return Ok(());
            }
            out.push(b'>');
            if let Some(Value::String(s)) = text {
                out.extend_from_slice(encode_entities(s, false).as_bytes());
            }
            for (child_tag, child_val) in children {
                write_element(out, child_tag, child_val)?;
            }
            out.extend_from_slice(b"</");
            out.extend_from_slice(tag.as_bytes());
            out.push(b'>');
            Ok(())
        }
        Value::String(s) if s.is_empty() => {
            out.push(b'<');
            out.extend_from_slice(tag.as_bytes());
            out.extend_from_slice(b"/>");
            Ok(())
        }
        Value::String(s) => {
            write_text_element(out, tag, &encode_entities(s, false));
            Ok(())
        }
        Value::Number(n) => {
            write_text_element(out, tag, &n.to_string());
            Ok(())
        }
        Value::Bool(b) => {
            write_text_element(out, tag, if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Null => {
            out.push(b'<');
            out.extend_from_slice(tag.as_bytes());
            out.extend_from_slice(b"/>");
            Ok(())
        }
    }
}

fn write_text_element(out: &mut Vec<u8>, tag: &str, text: &str) {
    out.push(b'<');
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"</");
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
}

fn decode_entities(raw: &[u8]) -> Result<String> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| AgentError::Xml("element text is not valid UTF-8".into()))?;
    if !s.contains('&') {
        return Ok(s.to_string());
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let (entity, len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else if rest.starts_with("&quot;") {
            ('"', 6)
        } else if rest.starts_with("&apos;") {
            ('\'', 6)
        } else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        out.push(entity);
        rest = &rest[len..];
    }
    out.push_str(rest);
    Ok(out)
}

fn encode_entities(s: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\'' if attribute => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
