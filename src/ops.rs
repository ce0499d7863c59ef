//! Interest and readiness masks for selection keys.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Identifies a single registration within a multiplexer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Token(pub u32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bitset over the four operations a selection key can be interested in
/// or ready for.
///
/// Multiplexers report raw [`Ops::READ`] and [`Ops::WRITE`] readiness only;
/// the selector expands those against the key interest into [`Ops::ACCEPT`]
/// and [`Ops::CONNECT`] where applicable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(1);
    pub const WRITE: Ops = Ops(1 << 1);
    pub const CONNECT: Ops = Ops(1 << 2);
    pub const ACCEPT: Ops = Ops(1 << 3);

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn union(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }

    #[inline]
    pub const fn remove(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    /// True if any of the bits map onto multiplexer read readiness.
    #[inline]
    pub const fn readable(self) -> bool {
        self.intersects(Ops::READ.union(Ops::ACCEPT))
    }

    /// True if any of the bits map onto multiplexer write readiness.
    #[inline]
    pub const fn writable(self) -> bool {
        self.intersects(Ops::WRITE.union(Ops::CONNECT))
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        self.union(rhs)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        *self = self.union(rhs)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for (op, c) in [
            (Ops::READ, 'r'),
            (Ops::WRITE, 'w'),
            (Ops::CONNECT, 'c'),
            (Ops::ACCEPT, 'a'),
        ] {
            if self.contains(op) {
                f.write_fmt(format_args!("{c}"))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_combine_and_query_bits() {
        let ops = Ops::READ | Ops::CONNECT;
        assert!(ops.contains(Ops::READ));
        assert!(ops.contains(Ops::CONNECT));
        assert!(!ops.contains(Ops::WRITE));
        assert!(ops.intersects(Ops::CONNECT | Ops::ACCEPT));
        assert!(!ops.intersects(Ops::WRITE));
        assert!(ops.readable());
        assert!(ops.writable());
        assert!(!Ops::READ.writable());
        assert!(!Ops::WRITE.readable());
    }

    #[test]
    fn should_remove_bits() {
        let ops = (Ops::READ | Ops::WRITE).remove(Ops::READ);
        assert_eq!(ops, Ops::WRITE);
        assert!(ops.remove(Ops::WRITE).is_empty());
    }

    #[test]
    fn should_format_compactly() {
        assert_eq!("-", format!("{:?}", Ops::NONE));
        assert_eq!("rw", format!("{:?}", Ops::READ | Ops::WRITE));
        assert_eq!("ca", format!("{:?}", Ops::CONNECT | Ops::ACCEPT));
    }
}
