//! Block classification: maps a block hash to ON / OFF under the active rule.
//!
//! Exactly one rule is in effect per process. Switching rules is a privileged
//! operation whose side effects (machine resets, ring clear) belong to the
//! orchestrator — the judge only swaps the rule and classifies.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// The globally selected classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rule {
    Lucky,
    Big,
    Odd,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::Lucky => "lucky",
            Rule::Big => "big",
            Rule::Odd => "odd",
        }
    }

    /// Parse a rule label as it appears on the wire / in the config document.
    pub fn parse(s: &str) -> Option<Rule> {
        match s {
            "lucky" => Some(Rule::Lucky),
            "big" => Some(Rule::Big),
            "odd" => Some(Rule::Odd),
            _ => None,
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification outcome of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    On,
    Off,
}

impl State {
    pub fn reverse(&self) -> State {
        match self {
            State::On => State::Off,
            State::Off => State::On,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::On => f.write_str("ON"),
            State::Off => f.write_str("OFF"),
        }
    }
}

/// ON / OFF decision engine. The rule is held behind a lock so that the
/// orchestrator can swap it atomically while the runner keeps classifying.
pub struct Judge {
    rule: RwLock<Rule>,
}

impl Judge {
    pub fn new(rule: Rule) -> Self {
        Self {
            rule: RwLock::new(rule),
        }
    }

    pub fn rule(&self) -> Rule {
        *self.rule.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a new rule. The caller owns the reset cascade.
    pub fn set_rule(&self, rule: Rule) {
        *self.rule.write().unwrap_or_else(|e| e.into_inner()) = rule;
    }

    /// Classify a block hash under the active rule. Depends only on the hash
    /// and the rule — hashes are treated case-insensitively.
    pub fn decide(&self, hash: &str) -> State {
        let h = hash.trim().to_ascii_lowercase();
        match self.rule() {
            Rule::Lucky => decide_lucky(&h),
            Rule::Big => decide_big(&h),
            Rule::Odd => decide_odd(&h),
        }
    }
}

/// LUCKY: last two characters — exactly one hex letter (a-f) and one digit
/// is ON; two letters or two digits is OFF. Anything outside [0-9a-f] is OFF.
fn decide_lucky(hash: &str) -> State {
    let bytes = hash.as_bytes();
    if bytes.len() < 2 {
        return State::Off;
    }
    let a = bytes[bytes.len() - 2];
    let b = bytes[bytes.len() - 1];

    let class = |c: u8| -> Option<bool> {
        // Some(true) = hex letter, Some(false) = digit
        match c {
            b'a'..=b'f' => Some(true),
            b'0'..=b'9' => Some(false),
            _ => None,
        }
    };

    match (class(a), class(b)) {
        (Some(x), Some(y)) if x != y => State::On,
        _ => State::Off,
    }
}

/// BIG: first digit scanning from the end. 0-4 is ON, 5-9 is OFF.
fn decide_big(hash: &str) -> State {
    for &c in hash.as_bytes().iter().rev() {
        if c.is_ascii_digit() {
            return if c <= b'4' { State::On } else { State::Off };
        }
    }
    State::Off
}

/// ODD: first digit scanning from the end. Even is ON, odd is OFF.
fn decide_odd(hash: &str) -> State {
    for &c in hash.as_bytes().iter().rev() {
        if c.is_ascii_digit() {
            return if (c - b'0') % 2 == 0 {
                State::On
            } else {
                State::Off
            };
        }
    }
    State::Off
}
