use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bitflags::bitflags;

/// The primary outcome of an operation step. Exactly one is present in
/// every [Reply].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Ok,
    Error,
    CriticalError,
    WouldBlock,
    Continue,
}

impl ReplyKind {
    const fn code(self) -> u32 {
        match self {
            ReplyKind::Ok => 0x00,
            ReplyKind::WouldBlock => 0x01,
            ReplyKind::Error => 0x02,
            ReplyKind::CriticalError => 0x04,
            ReplyKind::Continue => 0x08,
        }
    }

    const fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => Some(ReplyKind::Ok),
            0x01 => Some(ReplyKind::WouldBlock),
            0x02 => Some(ReplyKind::Error),
            0x04 => Some(ReplyKind::CriticalError),
            0x08 => Some(ReplyKind::Continue),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReplyFlags: u32 {
        const DISCONNECTED = 1 << 0;
        const CANCELED = 1 << 1;
        const NOTSUPPORTED = 1 << 2;
        const ALREADYCONNECTED = 1 << 3;
        const LINKNOTDIR = 1 << 4;
        const PASSWORDFAILED = 1 << 5;
        const INTERNALERROR = 1 << 6;
        const TIMEOUT = 1 << 7;
        const BUSY = 1 << 8;
        const NOTCONNECTED = 1 << 9;
        const SYNTAXERROR = 1 << 10;
        const WRITEFAILED = 1 << 11;
    }
}

/// Result of a single operation step: one [ReplyKind] plus orthogonal flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reply {
    kind: ReplyKind,
    flags: ReplyFlags,
}

impl Reply {
    pub const OK: Reply = Reply::new(ReplyKind::Ok);
    pub const ERROR: Reply = Reply::new(ReplyKind::Error);
    pub const CRITICAL_ERROR: Reply = Reply::new(ReplyKind::CriticalError);
    pub const WOULDBLOCK: Reply = Reply::new(ReplyKind::WouldBlock);
    pub const CONTINUE: Reply = Reply::new(ReplyKind::Continue);

    pub const fn new(kind: ReplyKind) -> Self {
        Self {
            kind,
            flags: ReplyFlags::empty(),
        }
    }

    pub const fn error(flags: ReplyFlags) -> Self {
        Self {
            kind: ReplyKind::Error,
            flags,
        }
    }

    pub const fn kind(&self) -> ReplyKind {
        self.kind
    }

    pub const fn flags(&self) -> ReplyFlags {
        self.flags
    }

    /// Replaces the primary value, keeping flags.
    pub const fn with_kind(self, kind: ReplyKind) -> Self {
        Self {
            kind,
            flags: self.flags,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == ReplyKind::Ok
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ReplyKind::Error | ReplyKind::CriticalError)
    }

    pub fn is_critical(&self) -> bool {
        self.kind == ReplyKind::CriticalError
    }

    pub fn would_block(&self) -> bool {
        self.kind == ReplyKind::WouldBlock
    }

    pub fn is_continue(&self) -> bool {
        self.kind == ReplyKind::Continue
    }

    pub fn has(&self, flags: ReplyFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Kind in the low byte, flags above it.
    pub fn to_bits(self) -> u32 {
        self.kind.code() | (self.flags.bits() << 8)
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        let kind = ReplyKind::from_code(bits & 0xff)?;
        let flags = ReplyFlags::from_bits(bits >> 8)?;
        Some(Self { kind, flags })
    }
}

impl Default for Reply {
    fn default() -> Self {
        Reply::OK
    }
}

impl BitOr<ReplyFlags> for Reply {
    type Output = Reply;

    fn bitor(self, rhs: ReplyFlags) -> Self::Output {
        Self {
            kind: self.kind,
            flags: self.flags | rhs,
        }
    }
}

impl BitOrAssign<ReplyFlags> for Reply {
    fn bitor_assign(&mut self, rhs: ReplyFlags) {
        self.flags |= rhs;
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ReplyKind::Ok => "OK",
            ReplyKind::Error => "ERROR",
            ReplyKind::CriticalError => "CRITICALERROR",
            ReplyKind::WouldBlock => "WOULDBLOCK",
            ReplyKind::Continue => "CONTINUE",
        };
        f.write_str(kind)?;
        for (name, _) in self.flags.iter_names() {
            write!(f, "|{name}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [ReplyKind; 5] = [
        ReplyKind::Ok,
        ReplyKind::Error,
        ReplyKind::CriticalError,
        ReplyKind::WouldBlock,
        ReplyKind::Continue,
    ];

    #[test]
    fn flags_do_not_change_kind() {
        for kind in ALL_KINDS {
            let reply = Reply::new(kind) | ReplyFlags::DISCONNECTED | ReplyFlags::CANCELED;
            assert_eq!(reply.kind(), kind);
            assert!(reply.has(ReplyFlags::DISCONNECTED));
            assert!(reply.has(ReplyFlags::CANCELED));
            assert!(!reply.has(ReplyFlags::NOTSUPPORTED));
        }
    }

    #[test]
    fn flag_order_is_irrelevant() {
        let a = Reply::ERROR | ReplyFlags::CANCELED | ReplyFlags::TIMEOUT;
        let b = Reply::ERROR | ReplyFlags::TIMEOUT | ReplyFlags::CANCELED;
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ERROR|CANCELED|TIMEOUT");
    }

    #[test]
    fn bits_carry_exactly_one_kind() {
        for kind in ALL_KINDS {
            let reply = Reply::new(kind) | ReplyFlags::all();
            let bits = reply.to_bits();
            assert_eq!(Reply::from_bits(bits), Some(reply));
        }
        // Two primary values at once are not representable
        assert_eq!(Reply::from_bits(0x02 | 0x08), None);
    }

    #[test]
    fn error_predicates() {
        assert!(Reply::ERROR.is_error());
        assert!(Reply::CRITICAL_ERROR.is_error());
        assert!(Reply::CRITICAL_ERROR.is_critical());
        assert!(!Reply::OK.is_error());
        assert!(!Reply::WOULDBLOCK.is_error());
        assert!(Reply::CONTINUE.is_continue());
    }
}
