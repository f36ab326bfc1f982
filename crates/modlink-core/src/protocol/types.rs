//! Debugger data model
//!
//! Typed forms of the values carried by xsbug messages.

use serde::{Deserialize, Serialize};

/// Separator value the runtime uses to join two instruments into one group
const INSTRUMENT_GROUP_SEPARATOR: &str = " / ";

/// A source position reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Path as compiled on the device (not stripped)
    pub path: String,
    /// 1-based line number
    pub line: u32,
}

/// One entry of the call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    pub value: Option<String>,
    pub location: Option<SourceLocation>,
}

/// Capabilities of a property
///
/// On the wire each letter *removes* a capability: `C` clears delete, `E`
/// clears enumerate, `W` clears write. A property without a flags attribute
/// has all three.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFlags {
    /// Flag characters exactly as received
    pub raw: String,
    pub deletable: bool,
    pub enumerable: bool,
    pub writable: bool,
}

impl PropertyFlags {
    /// Decode the compact flag-character encoding
    pub fn from_wire(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            deletable: !raw.contains('C'),
            enumerable: !raw.contains('E'),
            writable: !raw.contains('W'),
        }
    }
}

impl Default for PropertyFlags {
    fn default() -> Self {
        Self::from_wire("")
    }
}

/// An inspected variable, possibly with nested children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: Option<String>,
    pub flags: PropertyFlags,
    /// Present for structured values; sorted by name
    pub children: Option<Vec<Property>>,
}

impl Property {
    /// Sort a property list by name, recursively
    pub(crate) fn sort_by_name(properties: &mut [Property]) {
        properties.sort_by(|a, b| a.name.cmp(&b.name));
        for property in properties.iter_mut() {
            if let Some(children) = property.children.as_mut() {
                Property::sort_by_name(children);
            }
        }
    }
}

/// Instrument definition sent once after login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub value: String,
}

/// Instruments as they are displayed: separator entries merge neighbours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentGroup {
    pub name: String,
    pub values: Vec<String>,
    /// Index of each value within the sample vector
    pub indices: Vec<usize>,
}

/// Collapse `" / "` separator entries into grouped instruments
///
/// The runtime describes paired values (e.g. "used / total") as two adjacent
/// instruments where the first one's value is the separator; both then map to
/// one group whose `indices` point into the `samples` vector.
pub fn group_instruments(instruments: &[Instrument]) -> Vec<InstrumentGroup> {
    let mut groups: Vec<InstrumentGroup> = Vec::new();
    for (index, instrument) in instruments.iter().enumerate() {
        match groups.last_mut() {
            Some(last)
                if last.values.len() == 1 && last.values[0] == INSTRUMENT_GROUP_SEPARATOR =>
            {
                last.values.push(instrument.value.clone());
                last.indices.push(index);
            }
            _ => groups.push(InstrumentGroup {
                name: instrument.name.clone(),
                values: vec![instrument.value.clone()],
                indices: vec![index],
            }),
        }
    }
    groups
}

/// A breakpoint as sent to the device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Breakpoint {
    pub path: String,
    pub line: u32,
}

impl Breakpoint {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }
}

/// Strip the build prefix the device compiles sources under (e.g. `/mc`)
///
/// Returns the path unchanged when the prefix does not match.
pub fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

/// One event decoded from a textual debugger message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugEvent {
    /// The runtime's debugger session started
    Login { name: String, value: String },
    /// The call stack, innermost first
    Frames { frames: Vec<StackFrame> },
    /// Locals of the selected frame
    Local {
        frame: StackFrame,
        properties: Vec<Property>,
    },
    /// Global variables
    Global { properties: Vec<Property> },
    /// Module (`grammar`) variables
    Module { properties: Vec<Property> },
    /// Execution stopped
    Break {
        path: String,
        line: u32,
        message: String,
    },
    /// A console line
    Log { text: String },
    /// One sample per instrument, in definition order
    InstrumentSample { samples: Vec<i64> },
    /// Instrument definitions
    Instrument { instruments: Vec<Instrument> },
    /// An element this version does not know
    Other { element: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flags_absence_grants_capability() {
        let flags = PropertyFlags::from_wire("");
        assert!(flags.deletable && flags.enumerable && flags.writable);

        let flags = PropertyFlags::from_wire("CW");
        assert!(!flags.deletable);
        assert!(flags.enumerable);
        assert!(!flags.writable);
        assert_eq!(flags.raw, "CW");
    }

    #[test]
    fn test_group_instruments() {
        let instruments = vec![
            Instrument {
                name: "Pixels drawn".into(),
                value: " pixels".into(),
            },
            Instrument {
                name: "Chunk used".into(),
                value: " / ".into(),
            },
            Instrument {
                name: "Chunk available".into(),
                value: " bytes".into(),
            },
            Instrument {
                name: "Timers".into(),
                value: " timers".into(),
            },
        ];

        let groups = group_instruments(&instruments);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].indices, vec![0]);
        assert_eq!(groups[1].name, "Chunk used");
        assert_eq!(groups[1].values, vec![" / ".to_string(), " bytes".to_string()]);
        assert_eq!(groups[1].indices, vec![1, 2]);
        assert_eq!(groups[2].indices, vec![3]);
    }

    #[test]
    fn test_strip_path_prefix() {
        assert_eq!(strip_path_prefix("/mc/app/main.js", "/mc"), "/app/main.js");
        assert_eq!(strip_path_prefix("/other/main.js", "/mc"), "/other/main.js");
    }

    #[test]
    fn test_sort_by_name_recursive() {
        let leaf = |name: &str| Property {
            name: name.into(),
            value: None,
            flags: PropertyFlags::default(),
            children: None,
        };
        let mut props = vec![
            Property {
                name: "b".into(),
                value: None,
                flags: PropertyFlags::default(),
                children: Some(vec![leaf("z"), leaf("a")]),
            },
            leaf("a"),
        ];
        Property::sort_by_name(&mut props);
        assert_eq!(props[0].name, "a");
        let children = props[1].children.as_ref().unwrap();
        assert_eq!(children[0].name, "a");
        assert_eq!(children[1].name, "z");
    }
}
