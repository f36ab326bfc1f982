//! Protocol commands
//!
//! Defines the debugger commands (xsbug text) and the control commands
//! (binary opcodes) understood by the device.

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use super::packet::{ControlPacket, PacketBuilder};
use super::types::Breakpoint;

const CRLF: &str = "\r\n";

/// Debugger commands, sent as xsbug text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugCommand {
    /// Resume execution (`<go/>`)
    Go,
    /// Step over (`<step/>`)
    Step,
    /// Step into (`<step-inside/>`)
    StepInside,
    /// Step out (`<step-outside/>`)
    StepOutside,
    /// Add one breakpoint
    SetBreakpoint(Breakpoint),
    /// Remove one breakpoint
    ClearBreakpoint(Breakpoint),
    /// Replace every breakpoint on the device
    SetAllBreakpoints {
        breakpoints: Vec<Breakpoint>,
        /// Also break on uncaught exceptions
        exceptions: bool,
        /// Also break when the program starts
        start: bool,
    },
    /// Select a stack frame by id
    Select(String),
    /// Expand or collapse a property by id
    Toggle(String),
}

impl DebugCommand {
    /// The command element without framing
    pub fn element(&self) -> String {
        match self {
            DebugCommand::Go => "<go/>".to_string(),
            DebugCommand::Step => "<step/>".to_string(),
            DebugCommand::StepInside => "<step-inside/>".to_string(),
            DebugCommand::StepOutside => "<step-outside/>".to_string(),
            DebugCommand::SetBreakpoint(bp) => breakpoint_element("set-breakpoint", bp),
            DebugCommand::ClearBreakpoint(bp) => breakpoint_element("clear-breakpoint", bp),
            DebugCommand::SetAllBreakpoints {
                breakpoints,
                exceptions,
                start,
            } => {
                let mut xml = String::from("<set-all-breakpoints>");
                if *start {
                    xml.push_str(&breakpoint_element("breakpoint", &Breakpoint::new("start", 0)));
                }
                if *exceptions {
                    xml.push_str(&breakpoint_element(
                        "breakpoint",
                        &Breakpoint::new("exceptions", 0),
                    ));
                }
                for bp in breakpoints {
                    xml.push_str(&breakpoint_element("breakpoint", bp));
                }
                xml.push_str("</set-all-breakpoints>");
                xml
            }
            DebugCommand::Select(id) => format!(r#"<select id="{}"/>"#, escape(id.as_str())),
            DebugCommand::Toggle(id) => format!(r#"<toggle id="{}"/>"#, escape(id.as_str())),
        }
    }

    /// The command framed with CRLF on both sides, ready to send
    pub fn to_wire(&self) -> String {
        format!("{CRLF}{}{CRLF}", self.element())
    }
}

fn breakpoint_element(tag: &str, bp: &Breakpoint) -> String {
    format!(
        r#"<{} path="{}" line="{}"/>"#,
        tag,
        escape(bp.path.as_str()),
        bp.line
    )
}

/// Binary control opcodes
///
/// These values are fixed by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Restart = 1,
    Uninstall = 2,
    InstallChunk = 3,
    SetPreference = 4,
    /// Device → host reply frame
    Reply = 5,
    GetPreference = 6,
}

impl Opcode {
    /// Wire value
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Opcode::Restart),
            2 => Some(Opcode::Uninstall),
            3 => Some(Opcode::InstallChunk),
            4 => Some(Opcode::SetPreference),
            5 => Some(Opcode::Reply),
            6 => Some(Opcode::GetPreference),
            _ => None,
        }
    }
}

/// Control commands, sent as binary packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Restart the device
    Restart,
    /// Remove the installed mod
    Uninstall,
    /// Write one chunk of a firmware image at an absolute offset
    InstallChunk { offset: u32, data: Vec<u8> },
    /// Store a preference value
    SetPreference {
        domain: String,
        key: String,
        value: String,
    },
    /// Read a preference value
    GetPreference { domain: String, key: String },
}

impl ControlCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlCommand::Restart => Opcode::Restart,
            ControlCommand::Uninstall => Opcode::Uninstall,
            ControlCommand::InstallChunk { .. } => Opcode::InstallChunk,
            ControlCommand::SetPreference { .. } => Opcode::SetPreference,
            ControlCommand::GetPreference { .. } => Opcode::GetPreference,
        }
    }

    /// Whether the device answers this command with a reply frame
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            ControlCommand::Uninstall
                | ControlCommand::InstallChunk { .. }
                | ControlCommand::GetPreference { .. }
        )
    }

    /// Command payload (without opcode and request id)
    pub fn payload(&self) -> Vec<u8> {
        match self {
            ControlCommand::Restart | ControlCommand::Uninstall => Vec::new(),
            ControlCommand::InstallChunk { offset, data } => PacketBuilder::new()
                .u32_be(*offset)
                .bytes(data)
                .into_bytes(),
            ControlCommand::SetPreference { domain, key, value } => PacketBuilder::new()
                .nul_terminated(domain)
                .nul_terminated(key)
                .nul_terminated(value)
                .into_bytes(),
            ControlCommand::GetPreference { domain, key } => PacketBuilder::new()
                .nul_terminated(domain)
                .nul_terminated(key)
                .into_bytes(),
        }
    }

    /// Build the packet; `request_id` is set when a reply is awaited
    pub fn to_packet(&self, request_id: Option<u16>) -> ControlPacket {
        ControlPacket {
            opcode: self.opcode().byte(),
            request_id,
            payload: self.payload(),
        }
    }

    /// Encode straight to wire bytes
    pub fn encode(&self, request_id: Option<u16>) -> Vec<u8> {
        self.to_packet(request_id).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_commands_are_crlf_framed() {
        assert_eq!(DebugCommand::Go.to_wire(), "\r\n<go/>\r\n");
        assert_eq!(DebugCommand::Step.to_wire(), "\r\n<step/>\r\n");
        assert_eq!(DebugCommand::StepInside.to_wire(), "\r\n<step-inside/>\r\n");
        assert_eq!(DebugCommand::StepOutside.to_wire(), "\r\n<step-outside/>\r\n");
    }

    #[test]
    fn test_breakpoint_commands() {
        let bp = Breakpoint::new("/mc/app/main.js", 12);
        assert_eq!(
            DebugCommand::SetBreakpoint(bp.clone()).element(),
            r#"<set-breakpoint path="/mc/app/main.js" line="12"/>"#
        );
        assert_eq!(
            DebugCommand::ClearBreakpoint(bp).element(),
            r#"<clear-breakpoint path="/mc/app/main.js" line="12"/>"#
        );
    }

    #[test]
    fn test_attribute_values_are_escaped() {
        let bp = Breakpoint::new(r#"/mc/a"b<c>.js"#, 1);
        assert_eq!(
            DebugCommand::SetBreakpoint(bp).element(),
            r#"<set-breakpoint path="/mc/a&quot;b&lt;c&gt;.js" line="1"/>"#
        );
        assert_eq!(
            DebugCommand::Select("@1&2".into()).element(),
            r#"<select id="@1&amp;2"/>"#
        );
    }

    #[test]
    fn test_set_all_breakpoints() {
        let cmd = DebugCommand::SetAllBreakpoints {
            breakpoints: vec![Breakpoint::new("/mc/main.js", 4)],
            exceptions: true,
            start: true,
        };
        assert_eq!(
            cmd.element(),
            concat!(
                "<set-all-breakpoints>",
                r#"<breakpoint path="start" line="0"/>"#,
                r#"<breakpoint path="exceptions" line="0"/>"#,
                r#"<breakpoint path="/mc/main.js" line="4"/>"#,
                "</set-all-breakpoints>"
            )
        );

        let empty = DebugCommand::SetAllBreakpoints {
            breakpoints: vec![],
            exceptions: false,
            start: false,
        };
        assert_eq!(empty.element(), "<set-all-breakpoints></set-all-breakpoints>");
    }

    #[test]
    fn test_select_and_toggle() {
        assert_eq!(
            DebugCommand::Select("@3".into()).to_wire(),
            "\r\n<select id=\"@3\"/>\r\n"
        );
        assert_eq!(
            DebugCommand::Toggle("@7".into()).element(),
            r#"<toggle id="@7"/>"#
        );
    }

    #[test]
    fn test_opcodes_are_fixed() {
        assert_eq!(ControlCommand::Restart.opcode().byte(), 1);
        assert_eq!(ControlCommand::Uninstall.opcode().byte(), 2);
        assert_eq!(
            ControlCommand::InstallChunk {
                offset: 0,
                data: vec![]
            }
            .opcode()
            .byte(),
            3
        );
        assert_eq!(Opcode::SetPreference.byte(), 4);
        assert_eq!(Opcode::Reply.byte(), 5);
        assert_eq!(Opcode::GetPreference.byte(), 6);
        assert_eq!(Opcode::from_byte(6), Some(Opcode::GetPreference));
        assert_eq!(Opcode::from_byte(9), None);
    }

    #[test]
    fn test_restart_is_a_single_byte() {
        assert_eq!(ControlCommand::Restart.encode(None), vec![1]);
    }

    #[test]
    fn test_uninstall_carries_request_id() {
        assert_eq!(ControlCommand::Uninstall.encode(Some(0x0102)), vec![2, 1, 2]);
    }

    #[test]
    fn test_preference_payloads() {
        let get = ControlCommand::GetPreference {
            domain: "config".into(),
            key: "when".into(),
        };
        assert_eq!(get.encode(Some(7)), b"\x06\x00\x07config\0when\0".to_vec());

        let set = ControlCommand::SetPreference {
            domain: "config".into(),
            key: "when".into(),
            value: "boot".into(),
        };
        // payload without reply still reserves the id slot
        assert_eq!(set.encode(None), b"\x04\x00\x00config\0when\0boot\0".to_vec());
    }

    #[test]
    fn test_install_chunk_offset_is_big_endian() {
        let chunk = ControlCommand::InstallChunk {
            offset: 0x0102_0304,
            data: vec![0xAA, 0xBB],
        };
        assert_eq!(
            chunk.encode(Some(9)),
            vec![3, 0, 9, 1, 2, 3, 4, 0xAA, 0xBB]
        );
    }
}
