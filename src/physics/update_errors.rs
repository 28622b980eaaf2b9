use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

/// Soft capacity limits hit during an update.
///
/// The update still completes with whatever fit; raise the matching limit
/// and the next update will process the rest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateErrors(u32);

impl UpdateErrors {
    pub const MANIFOLD_CACHE_FULL: Self = Self(1 << 0);
    pub const BODY_PAIR_CACHE_FULL: Self = Self(1 << 1);
    pub const CONTACT_CONSTRAINTS_FULL: Self = Self(1 << 2);

    const NAMES: [(Self, &'static str); 3] = [
        (Self::MANIFOLD_CACHE_FULL, "ManifoldCacheFull"),
        (Self::BODY_PAIR_CACHE_FULL, "BodyPairCacheFull"),
        (Self::CONTACT_CONSTRAINTS_FULL, "ContactConstraintsFull"),
    ];

    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for UpdateErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        UpdateErrors(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for UpdateErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("UpdateErrors(empty)");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "UpdateErrors({})", names.join(" | "))
    }
}

/// Flags raised concurrently by the jobs of one update.
#[derive(Debug, Default)]
pub struct AtomicUpdateErrors(AtomicU32);

impl AtomicUpdateErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, errors: UpdateErrors) {
        self.0.fetch_or(errors.bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> UpdateErrors {
        UpdateErrors(self.0.load(Ordering::Relaxed))
    }
}
