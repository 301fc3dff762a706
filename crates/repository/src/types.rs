//! Scalar domain types shared across the directory engine.

/// Identifier of a file in the external byte-stream store.
///
/// The engine never touches file contents; it stores only these 32-bit ids
/// and hands them to a [`crate::store::SidStore`] when bytes are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ShortId(pub u32);

/// The null shortid, never assigned to a file.
pub const NULL_SHORTID: ShortId = ShortId(0);

impl ShortId {
    /// Directory shortids are distinguished from file shortids by their
    /// high bit, so either kind can be recognized in isolation.
    #[inline]
    pub fn is_dir(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ShortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Seconds since the Unix epoch, as stored in packed records.
pub type Timestamp = u32;

/// Returns the current wall-clock time as a packed timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as Timestamp
}

/// Maximum length of a single pathname component (arc), in bytes.
pub const MAX_ARC_LEN: usize = 255;

/// Type tag of a directory entry or node.
///
/// The discriminants are stored on disk (4 bits of every packed entry) and
/// in checkpoints; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceKind {
    /// Unused tag kept so that valid tags are nonzero in scribble checks.
    Unused = 0,
    ImmutableFile = 1,
    MutableFile = 2,
    ImmutableDirectory = 3,
    AppendableDirectory = 4,
    MutableDirectory = 5,
    VolatileDirectory = 6,
    EvaluatorDirectory = 7,
    Device = 8,
    /// Tombstone visible to clients.
    Ghost = 9,
    /// Placeholder visible to clients.
    Stub = 10,
    /// Tombstone invisible to clients; may carry a forwarding pointer.
    Deleted = 11,
    /// Superseded entry, eligible for gap compression.
    Outdated = 12,
    VolatileROEDirectory = 13,
    EvaluatorROEDirectory = 14,
    /// A run of N absent indices stored as one entry.
    Gap = 15,
}

impl SourceKind {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        use SourceKind::*;
        Some(match value {
            0 => Unused,
            1 => ImmutableFile,
            2 => MutableFile,
            3 => ImmutableDirectory,
            4 => AppendableDirectory,
            5 => MutableDirectory,
            6 => VolatileDirectory,
            7 => EvaluatorDirectory,
            8 => Device,
            9 => Ghost,
            10 => Stub,
            11 => Deleted,
            12 => Outdated,
            13 => VolatileROEDirectory,
            14 => EvaluatorROEDirectory,
            15 => Gap,
            _ => return None,
        })
    }

    /// True for the kinds a client can observe in a listing.
    #[inline]
    pub fn is_visible(self) -> bool {
        !matches!(
            self,
            SourceKind::Deleted | SourceKind::Outdated | SourceKind::Gap | SourceKind::Unused
        )
    }

    /// True for the directory kinds backed by a packed rep in the pool.
    #[inline]
    pub fn is_local_directory(self) -> bool {
        matches!(
            self,
            SourceKind::ImmutableDirectory
                | SourceKind::AppendableDirectory
                | SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        )
    }

    /// True for remote evaluator surrogates.
    #[inline]
    pub fn is_evaluator(self) -> bool {
        matches!(
            self,
            SourceKind::EvaluatorDirectory | SourceKind::EvaluatorROEDirectory
        )
    }

    #[inline]
    pub fn is_directory(self) -> bool {
        self.is_local_directory() || self.is_evaluator()
    }

    #[inline]
    pub fn is_file(self) -> bool {
        matches!(self, SourceKind::ImmutableFile | SourceKind::MutableFile)
    }

    /// True for the writable directory kinds whose own rep uses odd indices.
    #[inline]
    pub fn is_changeable(self) -> bool {
        matches!(
            self,
            SourceKind::AppendableDirectory
                | SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        )
    }
}

/// Policy for inserts that find an existing entry under the same arc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupeCheck {
    /// Replace whatever is there (the entry is outdated).
    ReplaceDiff,
    /// Replace only a non-master entry.
    ReplaceNonMaster,
    /// Fail with `NameInUse` if the arc is bound.
    DontReplace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        for raw in 0..=15u8 {
            let kind = SourceKind::from_u8(raw).unwrap();
            assert_eq!(kind as u8, raw);
        }
        assert!(SourceKind::from_u8(16).is_none());
    }

    #[test]
    fn visibility() {
        assert!(SourceKind::Ghost.is_visible());
        assert!(SourceKind::Stub.is_visible());
        assert!(!SourceKind::Deleted.is_visible());
        assert!(!SourceKind::Outdated.is_visible());
        assert!(!SourceKind::Gap.is_visible());
    }

    #[test]
    fn dir_shortid_discrimination() {
        assert!(!ShortId(0x17).is_dir());
        assert!(ShortId(0x8000_0001).is_dir());
    }
}
