//! 16-byte content fingerprints.
//!
//! Fingerprints give immutable files and directories a stable identity that
//! is independent of their position in the namespace, and drive the
//! deduplication table ([`crate::fpindex`]). Files are fingerprinted by
//! content with a short prefix recording whether the file was executable;
//! directories extend their parent's fingerprint with the arc under which
//! they were sealed.

use std::io::Read;

/// Fingerprint prefix for a plain file's contents.
pub const CONTENTS_PREFIX: &str = "TextD";
/// Fingerprint prefix for an executable file's contents.
pub const EXECUTABLE_PREFIX: &str = "TextX";
/// Fingerprint prefix for fingerprint-by-unique-id.
pub const UNIQUE_PREFIX: &str = "Textd";

/// A 128-bit fingerprint, stored little-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    /// The all-zero fingerprint used where none is meaningful.
    pub const NULL: Fingerprint = Fingerprint([0; 16]);

    /// Fingerprints a byte string.
    pub fn of_bytes(bytes: &[u8]) -> Fingerprint {
        Fingerprint(cityhash_rs::cityhash_110_128(bytes).to_le_bytes())
    }

    /// Fingerprints a text seed, e.g. `"(PATHNAME)/repo"`.
    pub fn of_text(text: &str) -> Fingerprint {
        Self::of_bytes(text.as_bytes())
    }

    /// Extends this fingerprint with more bytes.
    ///
    /// Extension is positional: `a.extend(b).extend(c)` differs from
    /// `a.extend(c).extend(b)` for `b != c`.
    pub fn extend(&self, bytes: &[u8]) -> Fingerprint {
        let mut buf = Vec::with_capacity(16 + bytes.len());
        buf.extend_from_slice(&self.0);
        buf.extend_from_slice(bytes);
        Self::of_bytes(&buf)
    }

    /// Fingerprints a file's contents, seeded with the given prefix.
    ///
    /// Streams the reader so arbitrarily large files do not need to be
    /// resident; the file bytes are appended to the prefix seed.
    pub fn of_file_contents<R: Read>(prefix: &str, reader: &mut R) -> std::io::Result<Fingerprint> {
        let mut buf = Vec::with_capacity(prefix.len() + 8192);
        buf.extend_from_slice(prefix.as_bytes());
        reader.read_to_end(&mut buf)?;
        Ok(Self::of_bytes(&buf))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Prints the journal form: 16 space-separated hex bytes.
    pub fn to_journal(&self) -> String {
        let mut out = String::with_capacity(16 * 3);
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Fingerprint::of_text("TextDhello");
        let b = Fingerprint::of_text("TextDhello");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::of_text("TextDhellp"));
    }

    #[test]
    fn file_contents_matches_concatenation() {
        let mut cursor = std::io::Cursor::new(b"hello".to_vec());
        let fp = Fingerprint::of_file_contents(CONTENTS_PREFIX, &mut cursor).unwrap();
        assert_eq!(fp, Fingerprint::of_text("TextDhello"));
    }

    #[test]
    fn extend_is_positional() {
        let base = Fingerprint::of_text("base");
        assert_ne!(base.extend(b"/a"), base.extend(b"/b"));
        assert_ne!(base.extend(b"/a").extend(b"/b"), base.extend(b"/b").extend(b"/a"));
    }

    #[test]
    fn journal_form() {
        let fp = Fingerprint([0xab; 16]);
        let text = fp.to_journal();
        assert_eq!(text.split(' ').count(), 16);
        assert!(text.starts_with("ab ab"));
    }
}
