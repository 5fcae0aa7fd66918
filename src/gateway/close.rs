use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What the session loop does after the socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseAction {
    /// Reconnect and replay missed events with RESUME.
    Resume,
    /// Drop the session and IDENTIFY from scratch.
    Reidentify,
    /// Stop without retrying.
    Shutdown,
}

struct KnownCode {
    code: u16,
    action: CloseAction,
    reason: &'static str,
}

const fn known(code: u16, action: CloseAction, reason: &'static str) -> KnownCode {
    KnownCode {
        code,
        action,
        reason,
    }
}

const KNOWN_CODES: &[KnownCode] = &[
    known(1000, CloseAction::Reidentify, "Normal closure"),
    known(1001, CloseAction::Reidentify, "Going away"),
    known(1006, CloseAction::Resume, "Abnormal closure"),
    known(4000, CloseAction::Resume, "Unknown error"),
    known(4001, CloseAction::Resume, "Unknown opcode"),
    known(4002, CloseAction::Resume, "Decode error"),
    known(4003, CloseAction::Resume, "Not authenticated"),
    known(4004, CloseAction::Shutdown, "Authentication failed"),
    known(4005, CloseAction::Resume, "Already authenticated"),
    known(4007, CloseAction::Reidentify, "Invalid sequence"),
    known(4008, CloseAction::Resume, "Rate limited"),
    known(4009, CloseAction::Reidentify, "Session timed out"),
    known(4010, CloseAction::Shutdown, "Invalid shard"),
    known(4011, CloseAction::Shutdown, "Sharding required"),
    known(4012, CloseAction::Shutdown, "Invalid API version"),
    known(4013, CloseAction::Shutdown, "Invalid intents"),
    known(4014, CloseAction::Shutdown, "Disallowed intents"),
];

/// Close code to [`CloseAction`] mapping.
///
/// The defaults follow the gateway's documented close codes. Unknown codes
/// resume. Deployments can override single entries from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseCodeTable {
    actions: HashMap<u16, CloseAction>,
}

impl Default for CloseCodeTable {
    fn default() -> Self {
        Self {
            actions: KNOWN_CODES.iter().map(|k| (k.code, k.action)).collect(),
        }
    }
}

impl CloseCodeTable {
    pub fn with_overrides(mut self, overrides: HashMap<u16, CloseAction>) -> Self {
        self.actions.extend(overrides);
        self
    }

    pub fn action(&self, code: u16) -> CloseAction {
        self.actions
            .get(&code)
            .copied()
            .unwrap_or(CloseAction::Resume)
    }

    pub fn reason(code: u16) -> &'static str {
        KNOWN_CODES
            .iter()
            .find(|k| k.code == code)
            .map(|k| k.reason)
            .unwrap_or("Unknown close code")
    }

    /// Decides the next step after a close.
    ///
    /// `code` is `None` when the socket died without a close frame.
    /// `can_resume` is whether a session id and sequence are still held.
    pub fn decide(&self, code: Option<u16>, can_resume: bool) -> CloseAction {
        let action = match code {
            Some(code) => self.action(code),
            None => CloseAction::Resume,
        };
        match action {
            CloseAction::Resume if !can_resume => CloseAction::Reidentify,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_documented_code_has_a_fixed_decision() {
        let table = CloseCodeTable::default();
        let expected = [
            (1000, CloseAction::Reidentify, CloseAction::Reidentify),
            (1001, CloseAction::Reidentify, CloseAction::Reidentify),
            (1006, CloseAction::Resume, CloseAction::Reidentify),
            (4000, CloseAction::Resume, CloseAction::Reidentify),
            (4001, CloseAction::Resume, CloseAction::Reidentify),
            (4002, CloseAction::Resume, CloseAction::Reidentify),
            (4003, CloseAction::Resume, CloseAction::Reidentify),
            (4004, CloseAction::Shutdown, CloseAction::Shutdown),
            (4005, CloseAction::Resume, CloseAction::Reidentify),
            (4007, CloseAction::Reidentify, CloseAction::Reidentify),
            (4008, CloseAction::Resume, CloseAction::Reidentify),
            (4009, CloseAction::Reidentify, CloseAction::Reidentify),
            (4010, CloseAction::Shutdown, CloseAction::Shutdown),
            (4011, CloseAction::Shutdown, CloseAction::Shutdown),
            (4012, CloseAction::Shutdown, CloseAction::Shutdown),
            (4013, CloseAction::Shutdown, CloseAction::Shutdown),
            (4014, CloseAction::Shutdown, CloseAction::Shutdown),
        ];
        for (code, with_session, without_session) in expected {
            assert_eq!(table.decide(Some(code), true), with_session, "code {code}");
            assert_eq!(
                table.decide(Some(code), false),
                without_session,
                "code {code}"
            );
            // Same inputs, same answer.
            assert_eq!(table.decide(Some(code), true), with_session);
        }
    }

    #[test]
    fn unknown_and_missing_codes_follow_session_state() {
        let table = CloseCodeTable::default();
        assert_eq!(table.decide(Some(4999), true), CloseAction::Resume);
        assert_eq!(table.decide(Some(4999), false), CloseAction::Reidentify);
        assert_eq!(table.decide(None, true), CloseAction::Resume);
        assert_eq!(table.decide(None, false), CloseAction::Reidentify);
    }

    #[test]
    fn overrides_replace_single_entries() {
        let table = CloseCodeTable::default()
            .with_overrides(HashMap::from([(4008, CloseAction::Shutdown)]));
        assert_eq!(table.decide(Some(4008), true), CloseAction::Shutdown);
        assert_eq!(table.decide(Some(4000), true), CloseAction::Resume);
        assert_eq!(CloseCodeTable::reason(4004), "Authentication failed");
    }
}
