//! Server IDs and user IDs.
//!
//! A SID is three characters, the first a digit, the rest digits or
//! uppercase letters; it is globally unique on the network. A UUID is
//! the owning server's SID followed by six uppercase letters.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid server ID {0:?}")]
    BadSid(String),
    #[error("invalid user ID {0:?}")]
    BadUid(String),
}

/// A three-character server ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid([u8; 3]);

impl Sid {
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// True if `s` has the shape of a SID.
    pub fn is_valid(s: &str) -> bool {
        let b = s.as_bytes();
        b.len() == 3
            && b[0].is_ascii_digit()
            && b[1..]
                .iter()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
    }
}

impl FromStr for Sid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(IdError::BadSid(s.to_string()));
        }
        let b = s.as_bytes();
        Ok(Self([b[0], b[1], b[2]]))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A nine-character user ID: SID + six uppercase letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(String);

impl Uid {
    /// True if `s` has the shape of a UUID.
    pub fn is_valid(s: &str) -> bool {
        let b = s.as_bytes();
        b.len() == 9 && Sid::is_valid(&s[..3]) && b[3..].iter().all(u8::is_ascii_uppercase)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SID of the server that owns this user.
    pub fn sid(&self) -> Sid {
        self.0[..3].parse().expect("uid carries a valid sid")
    }
}

impl FromStr for Uid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(IdError::BadUid(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out sequential UUIDs for one server, `AAAAAA` upward,
/// wrapping after `ZZZZZZ`.
#[derive(Debug)]
pub struct UidGenerator {
    sid: Sid,
    current: [u8; 6],
}

impl UidGenerator {
    pub fn new(sid: Sid) -> Self {
        Self {
            sid,
            // One before AAAAAA so the first next() yields it.
            current: *b"AAAAA@",
        }
    }

    /// The next UUID in sequence.
    pub fn next_uid(&mut self) -> Uid {
        for pos in (0..6).rev() {
            if self.current[pos] < b'Z' {
                self.current[pos] = if self.current[pos] == b'@' {
                    b'A'
                } else {
                    self.current[pos] + 1
                };
                break;
            }
            self.current[pos] = b'A';
        }
        let mut s = String::with_capacity(9);
        s.push_str(self.sid.as_str());
        s.push_str(std::str::from_utf8(&self.current).expect("ascii"));
        Uid(s)
    }
}

/// Generates a printable random string for CAPAB challenges.
pub fn random_challenge(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            // Printable, no spaces, no ':' so the token never needs quoting.
            let c = rng.gen_range(0x3Fu8..=0x7E);
            (if c == b':' { b'?' } else { c }) as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_shape() {
        assert!(Sid::is_valid("001"));
        assert!(Sid::is_valid("9Z2"));
        assert!(!Sid::is_valid("A01"));
        assert!(!Sid::is_valid("01"));
        assert!(!Sid::is_valid("0011"));
        assert!(!Sid::is_valid("0a1"));
    }

    #[test]
    fn uid_shape_and_sid() {
        assert!(Uid::is_valid("001AAAAAB"));
        assert!(!Uid::is_valid("001AAAAA1"));
        assert!(!Uid::is_valid("001aaaaab"));
        let uid: Uid = "042ABCDEF".parse().unwrap();
        assert_eq!(uid.sid().as_str(), "042");
    }

    #[test]
    fn generator_is_sequential() {
        let sid: Sid = "001".parse().unwrap();
        let mut generator = UidGenerator::new(sid);
        assert_eq!(generator.next_uid().as_str(), "001AAAAAA");
        assert_eq!(generator.next_uid().as_str(), "001AAAAAB");
    }

    #[test]
    fn generator_carries_over() {
        let sid: Sid = "001".parse().unwrap();
        let mut generator = UidGenerator::new(sid);
        generator.current = *b"AAAAZZ";
        assert_eq!(generator.next_uid().as_str(), "001AAABAA");
    }

    #[test]
    fn challenge_has_requested_length() {
        let token = random_challenge(20);
        assert_eq!(token.len(), 20);
        assert!(!token.contains(':'));
        assert!(!token.contains(' '));
    }
}
