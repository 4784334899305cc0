//! C1 — parses PLC-originated lines into a typed command, and formats the
//! single-letter PLC acknowledgements that go back out.
//!
//! Two shapes of PLC input exist: a bare standard command token, looked up
//! in the `command_definitions` table, and a direct action of the form
//! `<base>:I` (Inference) or `<base>:T[:R|:L]` (Follow Trajectory, with an
//! optional arm qualifier). Direct actions bypass the workflow mapping
//! entirely and are handed straight to the order builder.

use bridge_shared::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arm {
    Right,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectActionKind {
    Inference,
    FollowTrajectory(Option<Arm>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Standard(String),
    DirectAction {
        base: String,
        kind: DirectActionKind,
    },
}

impl ParsedCommand {
    /// The token the PLC used to address this command, echoed back
    /// verbatim in every response line.
    pub fn base_token(&self) -> &str {
        match self {
            ParsedCommand::Standard(token) => token,
            ParsedCommand::DirectAction { base, .. } => base,
        }
    }
}

/// Letters the bridge is allowed to emit back to the PLC. `A` is reserved
/// exclusively for command acknowledgement; `Running` is emitted once per
/// command rather than once per order, since the PLC only tracks a single
/// in-flight command at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcLetter {
    Acknowledged,
    Running,
    Success,
    Failure,
    Rejected,
}

impl PlcLetter {
    pub fn as_char(self) -> char {
        match self {
            PlcLetter::Acknowledged => 'A',
            PlcLetter::Running => 'R',
            PlcLetter::Success => 'S',
            PlcLetter::Failure => 'F',
            PlcLetter::Rejected => 'X',
        }
    }
}

pub struct CommandCodec;

impl CommandCodec {
    /// Splits on `:`. A single token is a standard command; `I` or `T`
    /// directly after the first `:` selects a direct action. An optional
    /// third segment (`R`/`L`) qualifies `T` with an arm; it is never
    /// defaulted when absent for `I`, which takes no arm at all.
    pub fn parse_payload(line: &str) -> BridgeResult<ParsedCommand> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::InvalidFormat("empty command line".into()));
        }

        let parts: Vec<&str> = trimmed.split(':').collect();
        match parts.as_slice() {
            [token] => Ok(ParsedCommand::Standard(token.to_string())),
            [base, "I"] => Ok(ParsedCommand::DirectAction {
                base: base.to_string(),
                kind: DirectActionKind::Inference,
            }),
            [base, "T"] => Ok(ParsedCommand::DirectAction {
                base: base.to_string(),
                kind: DirectActionKind::FollowTrajectory(None),
            }),
            [base, "T", arm] => {
                let arm = match *arm {
                    "R" => Arm::Right,
                    "L" => Arm::Left,
                    other => {
                        return Err(BridgeError::InvalidFormat(format!(
                            "unknown arm qualifier: {other}"
                        )))
                    }
                };
                Ok(ParsedCommand::DirectAction {
                    base: base.to_string(),
                    kind: DirectActionKind::FollowTrajectory(Some(arm)),
                })
            }
            _ => Err(BridgeError::InvalidFormat(format!(
                "malformed command line: {trimmed}"
            ))),
        }
    }

    pub fn format_response(base_token: &str, letter: PlcLetter) -> String {
        format!("{base_token}:{}", letter.as_char())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_token() {
        let parsed = CommandCodec::parse_payload("DOCK01").unwrap();
        assert_eq!(parsed, ParsedCommand::Standard("DOCK01".to_string()));
    }

    #[test]
    fn parses_inference_direct_action() {
        let parsed = CommandCodec::parse_payload("ROBOT1:I").unwrap();
        assert_eq!(
            parsed,
            ParsedCommand::DirectAction {
                base: "ROBOT1".to_string(),
                kind: DirectActionKind::Inference,
            }
        );
    }

    #[test]
    fn parses_follow_trajectory_without_arm() {
        let parsed = CommandCodec::parse_payload("ROBOT1:T").unwrap();
        assert_eq!(
            parsed,
            ParsedCommand::DirectAction {
                base: "ROBOT1".to_string(),
                kind: DirectActionKind::FollowTrajectory(None),
            }
        );
    }

    #[test]
    fn parses_follow_trajectory_with_arm() {
        let parsed = CommandCodec::parse_payload("ROBOT1:T:R").unwrap();
        assert_eq!(
            parsed,
            ParsedCommand::DirectAction {
                base: "ROBOT1".to_string(),
                kind: DirectActionKind::FollowTrajectory(Some(Arm::Right)),
            }
        );
    }

    #[test]
    fn rejects_unknown_arm_qualifier() {
        assert!(CommandCodec::parse_payload("ROBOT1:T:X").is_err());
    }

    #[test]
    fn rejects_empty_line() {
        assert!(CommandCodec::parse_payload("   ").is_err());
    }

    #[test]
    fn formats_response_with_letter() {
        assert_eq!(
            CommandCodec::format_response("DOCK01", PlcLetter::Acknowledged),
            "DOCK01:A"
        );
        assert_eq!(
            CommandCodec::format_response("DOCK01", PlcLetter::Running),
            "DOCK01:R"
        );
    }
}
