//! xsbug message parser
//!
//! Turns one complete textual message into typed [`DebugEvent`]s, one per
//! child of the `<xsbug>` root, in document order.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::types::{DebugEvent, Instrument, Property, PropertyFlags, SourceLocation, StackFrame};
use super::{ProtocolError, ROOT_ELEMENT};

/// Element tree built from the reader events
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(e: &BytesStart) -> Result<Self, ProtocolError> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| ProtocolError::Parse(err.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn required(&self, name: &str) -> Result<&str, ProtocolError> {
        self.attribute(name).ok_or_else(|| {
            ProtocolError::Parse(format!("<{}> is missing attribute '{}'", self.name, name))
        })
    }
}

/// Parse one xsbug message into its events
pub fn parse_message(xml: &str) -> Result<Vec<DebugEvent>, ProtocolError> {
    let root = read_document(xml)?;
    if root.name != ROOT_ELEMENT {
        return Err(ProtocolError::Parse(format!(
            "unexpected root element <{}>",
            root.name
        )));
    }

    root.children.iter().map(parse_event).collect()
}

fn read_document(xml: &str) -> Result<Element, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => stack.push(Element::from_start(e)?),
            Event::Empty(ref e) => attach(&mut stack, &mut root, Element::from_start(e)?)?,
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ProtocolError::Parse("unmatched closing tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(ref e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&e.unescape()?);
                }
            }
            Event::CData(ref e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(ProtocolError::Parse(format!("<{}> is not closed", open.name)));
    }
    root.ok_or_else(|| ProtocolError::Parse("empty message".into()))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ProtocolError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => {
            return Err(ProtocolError::Parse("more than one root element".into()))
        }
        None => *root = Some(element),
    }
    Ok(())
}

fn parse_event(node: &Element) -> Result<DebugEvent, ProtocolError> {
    let event = match node.name.as_str() {
        "login" => DebugEvent::Login {
            name: node.required("name")?.to_string(),
            value: node.required("value")?.to_string(),
        },
        "frames" => DebugEvent::Frames {
            frames: node
                .children
                .iter()
                .map(parse_frame)
                .collect::<Result<_, _>>()?,
        },
        "local" => parse_local(node)?,
        "global" => DebugEvent::Global {
            properties: parse_properties(&node.children)?,
        },
        "grammar" => DebugEvent::Module {
            properties: parse_properties(&node.children)?,
        },
        "break" => DebugEvent::Break {
            path: node.required("path")?.to_string(),
            line: parse_line(node)?,
            message: node.text.clone(),
        },
        "log" => DebugEvent::Log {
            text: node.text.clone(),
        },
        "instruments" => DebugEvent::Instrument {
            instruments: node
                .children
                .iter()
                .map(|child| {
                    Ok(Instrument {
                        name: child.required("name")?.to_string(),
                        value: child.required("value")?.to_string(),
                    })
                })
                .collect::<Result<_, ProtocolError>>()?,
        },
        "samples" => DebugEvent::InstrumentSample {
            samples: parse_samples(&node.text)?,
        },
        other => {
            tracing::debug!(element = other, "unhandled xsbug element");
            DebugEvent::Other {
                element: other.to_string(),
            }
        }
    };
    Ok(event)
}

/// `<local>` carries the frame in its own attributes; a leading `<frame>`
/// child is accepted as well.
fn parse_local(node: &Element) -> Result<DebugEvent, ProtocolError> {
    let (frame, properties) = match node.children.split_first() {
        Some((first, rest)) if first.name == "frame" => (parse_frame(first)?, rest),
        _ => (parse_frame(node)?, node.children.as_slice()),
    };
    Ok(DebugEvent::Local {
        frame,
        properties: parse_properties(properties)?,
    })
}

fn parse_frame(node: &Element) -> Result<StackFrame, ProtocolError> {
    let location = match node.attribute("path") {
        Some(path) => Some(SourceLocation {
            path: path.to_string(),
            line: parse_line(node)?,
        }),
        None => None,
    };
    Ok(StackFrame {
        name: node.required("name")?.to_string(),
        value: node.attribute("value").map(str::to_string),
        location,
    })
}

fn parse_properties(nodes: &[Element]) -> Result<Vec<Property>, ProtocolError> {
    let mut properties = nodes
        .iter()
        .map(parse_property)
        .collect::<Result<Vec<_>, _>>()?;
    Property::sort_by_name(&mut properties);
    Ok(properties)
}

fn parse_property(node: &Element) -> Result<Property, ProtocolError> {
    let children = if node.children.is_empty() {
        None
    } else {
        Some(parse_properties(&node.children)?)
    };
    Ok(Property {
        name: node.required("name")?.to_string(),
        value: node.attribute("value").map(str::to_string),
        flags: PropertyFlags::from_wire(node.attribute("flags").unwrap_or_default()),
        children,
    })
}

fn parse_line(node: &Element) -> Result<u32, ProtocolError> {
    let line = node.required("line")?;
    line.trim().parse().map_err(|_| {
        ProtocolError::Parse(format!("<{}> has invalid line '{}'", node.name, line))
    })
}

fn parse_samples(text: &str) -> Result<Vec<i64>, ProtocolError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|sample| {
            sample
                .trim()
                .parse()
                .map_err(|_| ProtocolError::Parse(format!("invalid sample '{}'", sample)))
        })
        .collect()
}
