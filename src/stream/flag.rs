//! Routing flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bit set describing which path class a stream needs.
///
/// `NORMAL` is the empty set. The other bits combine, e.g. `FAST | VOIP`
/// for low latency calls.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouteFlag(u32);

impl RouteFlag {
    /// Mixed through the normal path.
    pub const NORMAL: Self = Self(0);
    /// Direct output bypassing the mixer.
    pub const DIRECT: Self = Self(1 << 0);
    /// High resolution direct output.
    pub const HD: Self = Self(1 << 1);
    /// More than two channels.
    pub const MULTICHANNEL: Self = Self(1 << 2);
    /// Low power offload playback.
    pub const LOWPOWER: Self = Self(1 << 3);
    /// Low latency memory mapped path.
    pub const FAST: Self = Self(1 << 4);
    /// Voice communication path.
    pub const VOIP: Self = Self(1 << 5);

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a flag from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `true` for the normal path.
    pub const fn is_normal(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the flag needs a dedicated path that cannot take a
    /// stream over with a plain move.
    pub const fn needs_recreate(self) -> bool {
        self.intersects(Self(Self::FAST.0 | Self::DIRECT.0 | Self::HD.0))
    }
}

impl BitOr for RouteFlag {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RouteFlag {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RouteFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteFlag({self})")
    }
}

impl fmt::Display for RouteFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_normal() {
            return f.write_str("normal");
        }
        let names = [
            (Self::DIRECT, "direct"),
            (Self::HD, "hd"),
            (Self::MULTICHANNEL, "multichannel"),
            (Self::LOWPOWER, "lowpower"),
            (Self::FAST, "fast"),
            (Self::VOIP, "voip"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_is_empty() {
        assert!(RouteFlag::NORMAL.is_normal());
        assert!(RouteFlag::default().is_normal());
        assert!(!RouteFlag::FAST.is_normal());
    }

    #[test]
    fn test_combination() {
        let flag = RouteFlag::FAST | RouteFlag::VOIP;
        assert!(flag.contains(RouteFlag::FAST));
        assert!(flag.contains(RouteFlag::VOIP));
        assert!(!flag.contains(RouteFlag::DIRECT));
        assert_eq!(flag.to_string(), "fast|voip");
    }

    #[test]
    fn test_needs_recreate() {
        assert!(RouteFlag::FAST.needs_recreate());
        assert!(RouteFlag::DIRECT.needs_recreate());
        assert!(!RouteFlag::LOWPOWER.needs_recreate());
        assert!(!RouteFlag::VOIP.needs_recreate());
    }
}
