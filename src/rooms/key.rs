use std::fmt;

use serde::Serialize;

const SEPARATOR: char = '-';

/// Canonical name of the conversation between two participants.
///
/// The key is a pure function of the pair: both ids are sorted and joined, so
/// `RoomKey::resolve(a, b) == RoomKey::resolve(b, a)`. There is no room entity
/// behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn resolve(a: &str, b: &str) -> RoomKey {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        RoomKey(format!("{low}{SEPARATOR}{high}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
