use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A revision number of a commit.
///
/// A revision number is an integer which refers to a specific point of
/// repository history. When a repository is created, it starts with an initial
/// commit whose revision is 1. As new commits are added, each commit gets its
/// own revision number, monotonically increasing from the previous commit's
/// revision. i.e. 1, 2, 3, ...
///
/// A revision number can also be non-positive, in which case it is an offset
/// from the current head of the repository: 0 refers to the head itself,
/// -1 to the commit before the head, and so on. Such a revision is called a
/// 'relative revision'; a positive one is called an 'absolute revision'.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(i32);

impl Revision {
    /// The head revision, also spelled `head` on the wire.
    pub const HEAD: Revision = Revision(0);
    /// Revision `1`, the initial commit of every repository.
    pub const INIT: Revision = Revision(1);

    /// Creates a new instance with the specified revision number.
    pub fn from(i: i32) -> Self {
        Revision(i)
    }

    pub fn value(self) -> i32 {
        self.0
    }

    /// Whether this revision is relative to the head.
    pub fn is_relative(self) -> bool {
        self.0 <= 0
    }

    /// Resolves this revision against the given head.
    ///
    /// A positive revision must not exceed the head; a non-positive revision
    /// is an offset from the head and must land on `1..=head`. Anything else
    /// fails with [`Error::RevisionNotFound`].
    pub fn normalize(self, head: Revision) -> Result<Revision> {
        if self.0 > 0 {
            if self.0 <= head.0 {
                Ok(self)
            } else {
                Err(Error::RevisionNotFound(self))
            }
        } else {
            // i64 arithmetic so that i32::MIN cannot wrap around.
            let n = i64::from(head.0) + i64::from(self.0);
            if n >= 1 {
                Ok(Revision(n as i32))
            } else {
                Err(Error::RevisionNotFound(self))
            }
        }
    }

    /// The revision right after this one. Caller must hold an absolute revision.
    pub fn forward(self) -> Revision {
        Revision(self.0 + 1)
    }

    /// The revision right before this one, floored at `INIT`.
    pub fn backward(self) -> Revision {
        Revision((self.0 - 1).max(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("head") {
            return Ok(Revision::HEAD);
        }
        s.parse::<i32>()
            .map(Revision)
            .map_err(|_| Error::InvalidInput(format!("invalid revision: {}", s)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_relative() {
        let head = Revision::from(5);
        assert_eq!(Revision::from(-1).normalize(head).unwrap(), Revision::from(4));
        assert_eq!(Revision::HEAD.normalize(head).unwrap(), Revision::from(5));
        assert_eq!(Revision::from(-4).normalize(head).unwrap(), Revision::from(1));
    }

    #[test]
    fn normalize_absolute() {
        let head = Revision::from(5);
        assert_eq!(Revision::from(5).normalize(head).unwrap(), Revision::from(5));
        assert_eq!(Revision::from(1).normalize(head).unwrap(), Revision::from(1));
    }

    #[test]
    fn normalize_out_of_range() {
        let head = Revision::from(5);
        match Revision::from(i32::MAX).normalize(head) {
            Err(Error::RevisionNotFound(r)) => assert_eq!(r.value(), i32::MAX),
            other => panic!("unexpected: {:?}", other),
        }
        match Revision::from(i32::MIN).normalize(head) {
            Err(Error::RevisionNotFound(r)) => assert_eq!(r.value(), i32::MIN),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(Revision::from(6).normalize(head).is_err());
        assert!(Revision::from(-5).normalize(head).is_err());
    }

    #[test]
    fn parse() {
        assert_eq!("head".parse::<Revision>().unwrap(), Revision::HEAD);
        assert_eq!("HEAD".parse::<Revision>().unwrap(), Revision::HEAD);
        assert_eq!("-2".parse::<Revision>().unwrap(), Revision::from(-2));
        assert_eq!("42".parse::<Revision>().unwrap(), Revision::from(42));
        assert!("1.5".parse::<Revision>().is_err());
    }
}
