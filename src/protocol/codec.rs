//! ARIES/LYNX wire codec.
//!
//! Protocol overview:
//! - Format: ASCII request/response lines over TCP, CRLF terminated
//! - Outbound: `CMD` or `CMD<TAB>p1/p2/.../pN`, optional leading STX (0x02)
//! - Inbound: `T<TAB>CMDAXIS[<TAB>f1<TAB>f2...]` where `T` is `C` (complete),
//!   `W` (warning) or `E` (error), `CMD` is three uppercase letters and
//!   `AXIS` is an optional decimal digit run; the axis-less notifications
//!   `SYS` and `CERR` occupy the whole first field instead
//!
//! The separators are asymmetric (TAB + `/` outbound, TAB-only inbound);
//! that asymmetry is the device's and this module is the only place in the
//! crate allowed to know about it. Everything else passes commands as
//! `(mnemonic, params)` and consumes parsed [`Reply`] values.

use crate::error::{AriesError, AriesResult};

/// STX framing byte some firmware revisions expect in front of a command.
pub const STX: char = '\x02';

/// Axis placeholder used in correlation keys for axis-less commands.
const NO_AXIS: &str = "-1";

// =============================================================================
// Reply
// =============================================================================

/// Reply class reported in the first byte of every inbound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `C` - command accepted / completed.
    Completion,
    /// `W` - completed with a warning.
    Warning,
    /// `E` - rejected or failed.
    Error,
}

impl ReplyKind {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'C' => Some(ReplyKind::Completion),
            'W' => Some(ReplyKind::Warning),
            'E' => Some(ReplyKind::Error),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            ReplyKind::Completion => 'C',
            ReplyKind::Warning => 'W',
            ReplyKind::Error => 'E',
        }
    }
}

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    /// Uppercase mnemonic, e.g. `APS`, `RDP`, `SYS`, `CERR`.
    pub cmd: String,
    /// Axis digit run from the first field; empty for axis-less replies.
    pub axis: String,
    /// Remaining TAB-separated fields. `SYS` notifications keep at most one.
    pub params: Vec<String>,
    /// Original line, CRLF stripped.
    pub raw: String,
}

impl Reply {
    /// Parse a single CRLF-stripped line.
    ///
    /// A leading STX is tolerated and stripped. Lines that violate the
    /// grammar return a `Protocol` error; the caller is expected to log and
    /// drop them (an unattributable line must never fail a pending request).
    pub fn parse(line: &str) -> AriesResult<Reply> {
        let raw = line.to_string();
        let line = line.strip_prefix(STX).unwrap_or(line);

        let mut chars = line.chars();
        let kind = chars
            .next()
            .and_then(ReplyKind::from_char)
            .ok_or_else(|| AriesError::Protocol(format!("bad reply type: {raw:?}")))?;

        // One optional TAB between the type char and the command field.
        let rest = chars.as_str();
        if rest.is_empty() {
            return Err(AriesError::Protocol(format!("empty reply body: {raw:?}")));
        }
        let rest = rest.strip_prefix('\t').unwrap_or(rest);

        let fields: Vec<&str> = rest.split('\t').collect();
        let cmd_field = fields[0];
        if cmd_field.len() < 3 || !cmd_field.is_ascii() {
            return Err(AriesError::Protocol(format!(
                "bad command field: {raw:?}"
            )));
        }

        // Axis-less mnemonics are matched on the whole first field, before
        // the three-letter truncation; `CERR` would otherwise read as `CER`
        // with a non-digit `R` tail. `SYS` keeps only the first trailing
        // field (the error/warning code); `CERR` keeps its full field list.
        let whole = cmd_field.to_ascii_uppercase();
        if whole == "SYS" {
            let params = match fields.get(1) {
                Some(p) if !p.is_empty() => vec![p.to_string()],
                _ => Vec::new(),
            };
            return Ok(Reply {
                kind,
                cmd: whole,
                axis: String::new(),
                params,
                raw,
            });
        }
        if whole == "CERR" {
            let params = fields[1..].iter().map(|f| f.to_string()).collect();
            return Ok(Reply {
                kind,
                cmd: whole,
                axis: String::new(),
                params,
                raw,
            });
        }

        let cmd = cmd_field[..3].to_ascii_uppercase();
        let tail = &cmd_field[3..];

        let axis = if tail.is_empty() {
            String::new()
        } else if tail.bytes().all(|b| b.is_ascii_digit()) {
            tail.to_string()
        } else {
            return Err(AriesError::Protocol(format!(
                "non-numeric axis suffix: {raw:?}"
            )));
        };

        let params = fields[1..].iter().map(|f| f.to_string()).collect();

        Ok(Reply {
            kind,
            cmd,
            axis,
            params,
            raw,
        })
    }

    /// Correlation key for matching this reply to a pending request.
    pub fn key(&self) -> String {
        if self.axis.is_empty() {
            format!("{}:{}", self.cmd, NO_AXIS)
        } else {
            format!("{}:{}", self.cmd, self.axis)
        }
    }

    /// Axis number as an integer, when present and numeric.
    pub fn axis_no(&self) -> Option<u32> {
        self.axis.parse().ok()
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Build the on-wire form of a command.
///
/// Parameters are sanitized: embedded CR/LF bytes are removed so a malformed
/// value can never break line framing. An empty mnemonic is refused.
pub fn encode_command(cmd: &str, params: &[String], include_stx: bool) -> AriesResult<String> {
    let cmd = sanitize(cmd);
    if cmd.is_empty() {
        return Err(AriesError::Protocol("empty command mnemonic".into()));
    }

    let mut line = String::new();
    if include_stx {
        line.push(STX);
    }
    line.push_str(&cmd);
    if !params.is_empty() {
        line.push('\t');
        let joined: Vec<String> = params.iter().map(|p| sanitize(p)).collect();
        line.push_str(&joined.join("/"));
    }
    line.push_str("\r\n");
    Ok(line)
}

/// Re-encode a reply into its line form (without CRLF handling quirks).
///
/// Used by the mock device in tests and by hosts that record traffic.
pub fn encode_reply(reply: &Reply) -> String {
    let mut line = String::new();
    line.push(reply.kind.as_char());
    line.push('\t');
    line.push_str(&reply.cmd);
    line.push_str(&reply.axis);
    for p in &reply.params {
        line.push('\t');
        line.push_str(p);
    }
    line.push_str("\r\n");
    line
}

/// Correlation key for an outbound request: `CMD:axis` with the literal first
/// parameter standing in for the axis, or `-1` when there is none.
pub fn request_key(cmd: &str, params: &[String]) -> String {
    match params.first() {
        Some(first) if !first.is_empty() => format!("{cmd}:{first}"),
        _ => format!("{cmd}:{NO_AXIS}"),
    }
}

fn sanitize(s: &str) -> String {
    s.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

// =============================================================================
// Controller error codes
// =============================================================================

/// Human-readable text for the controller's numeric error/warning codes,
/// as reported in `SYS` notifications and `E`-class replies.
pub fn error_text(code: &str) -> Option<&'static str> {
    match code {
        "100" => Some("total number of parameters is incorrect"),
        "101" => Some("parameter type or value is incorrect"),
        "102" => Some("command is undefined"),
        "103" => Some("command not accepted in current state"),
        "300" => Some("emergency stop signal is active"),
        "301" => Some("axis is driving"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn encodes_move_command() {
        let line = encode_command("APS", &p(&["1", "0", "1000", "0"]), false).unwrap();
        assert_eq!(line, "APS\t1/0/1000/0\r\n");
    }

    #[test]
    fn encodes_parameterless_command() {
        assert_eq!(encode_command("CERR", &[], false).unwrap(), "CERR\r\n");
    }

    #[test]
    fn encodes_optional_stx() {
        let line = encode_command("RDP", &p(&["2"]), true).unwrap();
        assert_eq!(line, "\x02RDP\t2\r\n");
    }

    #[test]
    fn sanitizes_embedded_line_breaks() {
        let line = encode_command("WSY", &p(&["1", "2\r\n", "3"]), false).unwrap();
        assert_eq!(line, "WSY\t1/23/3\r\n");
    }

    #[test]
    fn refuses_empty_command() {
        assert!(encode_command("", &[], false).is_err());
        assert!(encode_command("\r\n", &[], false).is_err());
    }

    #[test]
    fn parses_completion_with_axis_and_params() {
        let r = Reply::parse("C\tRDP2\t42").unwrap();
        assert_eq!(r.kind, ReplyKind::Completion);
        assert_eq!(r.cmd, "RDP");
        assert_eq!(r.axis, "2");
        assert_eq!(r.params, p(&["42"]));
        assert_eq!(r.key(), "RDP:2");
        assert_eq!(r.axis_no(), Some(2));
    }

    #[test]
    fn parses_axisless_reply() {
        let r = Reply::parse("C\tCERR\t0").unwrap();
        assert_eq!(r.cmd, "CERR");
        assert_eq!(r.axis, "");
        assert_eq!(r.params, p(&["0"]));
        assert_eq!(r.key(), "CERR:-1");
        assert_eq!(r.axis_no(), None);
    }

    #[test]
    fn cerr_keeps_full_field_list() {
        let r = Reply::parse("C\tCERR\t100\t3").unwrap();
        assert_eq!(r.cmd, "CERR");
        assert_eq!(r.axis, "");
        assert_eq!(r.params, p(&["100", "3"]));
    }

    #[test]
    fn tolerates_missing_tab_after_type() {
        let r = Reply::parse("CAPS1").unwrap();
        assert_eq!(r.cmd, "APS");
        assert_eq!(r.axis, "1");
    }

    #[test]
    fn strips_leading_stx() {
        let r = Reply::parse("\x02C\tSTR1\t0").unwrap();
        assert_eq!(r.cmd, "STR");
    }

    #[test]
    fn rejects_unknown_type_char() {
        assert!(Reply::parse("Z\tFOO1").is_err());
    }

    #[test]
    fn rejects_short_command_field() {
        assert!(Reply::parse("C\tAB").is_err());
    }

    #[test]
    fn rejects_non_digit_axis_tail() {
        assert!(Reply::parse("C\tRDPx\t1").is_err());
    }

    #[test]
    fn rejects_empty_line() {
        assert!(Reply::parse("").is_err());
        assert!(Reply::parse("C").is_err());
    }

    #[test]
    fn sys_keeps_exactly_first_field() {
        let r = Reply::parse("E\tSYS\t0x1234\t0x5678\textra").unwrap();
        assert_eq!(r.kind, ReplyKind::Error);
        assert_eq!(r.cmd, "SYS");
        assert_eq!(r.axis, "");
        assert_eq!(r.params, p(&["0x1234"]));
    }

    #[test]
    fn sys_with_no_fields_has_empty_params() {
        let r = Reply::parse("W\tSYS").unwrap();
        assert!(r.params.is_empty());
        let r = Reply::parse("W\tSYS\t").unwrap();
        assert!(r.params.is_empty());
    }

    #[test]
    fn reply_roundtrips_through_encoding() {
        let cases = vec![
            Reply {
                kind: ReplyKind::Completion,
                cmd: "RDP".into(),
                axis: "3".into(),
                params: p(&["-1500"]),
                raw: String::new(),
            },
            Reply {
                kind: ReplyKind::Warning,
                cmd: "STR".into(),
                axis: "12".into(),
                params: p(&["1", "0", "0", "0", "0", "0"]),
                raw: String::new(),
            },
            Reply {
                kind: ReplyKind::Error,
                cmd: "SYS".into(),
                axis: String::new(),
                params: p(&["0x0064"]),
                raw: String::new(),
            },
            Reply {
                kind: ReplyKind::Completion,
                cmd: "CERR".into(),
                axis: String::new(),
                params: p(&["0"]),
                raw: String::new(),
            },
        ];
        for expected in cases {
            let line = encode_reply(&expected);
            let parsed = Reply::parse(line.trim_end_matches("\r\n")).unwrap();
            assert_eq!(parsed.kind, expected.kind);
            assert_eq!(parsed.cmd, expected.cmd);
            assert_eq!(parsed.axis, expected.axis);
            assert_eq!(parsed.params, expected.params);
        }
    }

    #[test]
    fn request_keys_use_first_param_or_placeholder() {
        assert_eq!(request_key("RDP", &p(&["2"])), "RDP:2");
        assert_eq!(request_key("APS", &p(&["1", "0", "500", "0"])), "APS:1");
        assert_eq!(request_key("CERR", &[]), "CERR:-1");
    }

    #[test]
    fn known_error_codes_have_text() {
        assert!(error_text("100").unwrap().contains("parameters"));
        assert!(error_text("999").is_none());
    }
}
