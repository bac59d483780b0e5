//! Normalization of stored vote values.
//!
//! Shapes seen in `votesByUser` across client generations:
//!
//! ```text
//! true / false                       bool flag (false = no vote)
//! "up", " Thumbs_Up ", "downvote"    free-form token, any case
//! 1 / -1 / 0                         signed integer
//! { "value": "up" }                  wrapped token
//! { "direction": "down" }            wrapped token
//! { "state": { "choice": "-1" } }    reaction-style payload
//! ```
//!
//! Anything else maps to [`Vote::None`]. The mapping is total: a value
//! written by an unknown client must never stop the current client from
//! voting.

use crate::vote::Vote;
use serde_json::{Map, Number, Value};

/// Maximum object nesting followed before giving up.
const MAX_DEPTH: usize = 4;

const UP_TOKENS: &[&str] = &[
    "up", "upvote", "upvoted", "thumbs_up", "thumbsup", "thumbs-up", "like", "liked", "+1", "1",
    "yes", "true",
];

const DOWN_TOKENS: &[&str] = &[
    "down",
    "downvote",
    "downvoted",
    "thumbs_down",
    "thumbsdown",
    "thumbs-down",
    "dislike",
    "disliked",
    "-1",
];

/// Map any stored vote value to a [`Vote`].
pub fn normalize_vote(raw: &Value) -> Vote {
    normalize_at(raw, 0)
}

fn normalize_at(raw: &Value, depth: usize) -> Vote {
    if depth > MAX_DEPTH {
        return Vote::None;
    }

    match raw {
        Value::Bool(true) => Vote::Up,
        Value::String(token) => from_token(token),
        Value::Number(number) => from_number(number),
        Value::Object(map) => from_object(map, depth),
        Value::Bool(false) | Value::Null | Value::Array(_) => Vote::None,
    }
}

fn from_token(token: &str) -> Vote {
    let token = token.trim().to_ascii_lowercase();
    if UP_TOKENS.contains(&token.as_str()) {
        Vote::Up
    } else if DOWN_TOKENS.contains(&token.as_str()) {
        Vote::Down
    } else {
        Vote::None
    }
}

fn from_number(number: &Number) -> Vote {
    if let Some(n) = number.as_i64() {
        return match n {
            1 => Vote::Up,
            -1 => Vote::Down,
            _ => Vote::None,
        };
    }

    match number.as_f64() {
        Some(f) if f == 1.0 => Vote::Up,
        Some(f) if f == -1.0 => Vote::Down,
        _ => Vote::None,
    }
}

fn from_object(map: &Map<String, Value>, depth: usize) -> Vote {
    let wrapped = ["value", "direction"]
        .iter()
        .filter_map(|key| map.get(*key))
        .map(|inner| normalize_at(inner, depth + 1))
        .find(|vote| *vote != Vote::None);
    if let Some(vote) = wrapped {
        return vote;
    }

    // `state.choice` uses "1" / "-1" / "0", which the token table covers
    map.get("state")
        .and_then(|state| state.get("choice"))
        .map(|choice| normalize_at(choice, depth + 1))
        .unwrap_or(Vote::None)
}
