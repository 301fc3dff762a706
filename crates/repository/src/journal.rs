//! The transactional journal: an append-only text log of every mutation
//! of the stable trees.
//!
//! Records are `(<tag> <field>…)\n`: longids as hex bytes with a trailing
//! slash (or `@<hex>` for bare roots), strings quoted with backslash
//! escapes, fingerprints as sixteen hex bytes, integers decimal or
//! `0x`-prefixed. Records batch into transactions; the outermost commit
//! flushes to stable storage and releases deferred shortid unlinks.
//!
//! On recovery the whole journal replays against the in-memory state with
//! logging disabled. A record that fails to apply is corruption and
//! aborts recovery. The `vers` record gates semantic refinements:
//!
//! * v2: deletions that shadow nothing are written as `outdated`
//! * v3: the same when a base exists but lacks the arc
//! * v4: `maki` records always precede the `insi` that sinks a mutable
//!   directory, so replay reconstructs file references exactly

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use logos::Logos;
use parking_lot::Mutex;

use crate::fingerprint::Fingerprint;
use crate::longid::LongId;
use crate::types::{ShortId, Timestamp};

/// Newest journal semantics this build writes and understands.
pub const MAX_LOG_VERSION: u32 = 4;

/// Quotes a string for a journal record.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

struct JournalInner {
    file: Option<File>,
    path: Option<PathBuf>,
    nesting: u32,
    buffer: String,
    pending_unlinks: Vec<ShortId>,
}

/// The journal writer.
///
/// `enabled` is off during recovery so replayed operations do not journal
/// themselves again.
pub struct Journal {
    inner: Mutex<JournalInner>,
    enabled: AtomicBool,
    version: AtomicU32,
}

impl Journal {
    /// A journal appending to `path` (created if missing). Logging starts
    /// disabled; recovery enables it.
    pub fn open(path: &Path) -> std::io::Result<Journal> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Journal {
            inner: Mutex::new(JournalInner {
                file: Some(file),
                path: Some(path.to_path_buf()),
                nesting: 0,
                buffer: String::new(),
                pending_unlinks: Vec::new(),
            }),
            enabled: AtomicBool::new(false),
            version: AtomicU32::new(1),
        })
    }

    /// The journal's backing path, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    /// Truncates the journal (after a successful checkpoint).
    pub fn truncate(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.nesting, 0);
        if let Some(path) = inner.path.clone() {
            inner.file = Some(OpenOptions::new().write(true).truncate(true).open(&path)?);
        }
        Ok(())
    }

    /// Opens a transaction (transactions nest).
    pub fn start(&self) {
        self.inner.lock().nesting += 1;
    }

    /// Appends a serialized record to the open transaction.
    pub fn put(&self, record: &str) {
        debug_assert!(record.ends_with('\n'));
        let mut inner = self.inner.lock();
        debug_assert!(inner.nesting > 0, "put outside a transaction");
        inner.buffer.push_str(record);
    }

    /// Closes one transaction level. The outermost commit writes and
    /// syncs the buffered records and returns the shortids whose unlink
    /// was deferred to it. A failed flush is fatal: the in-memory state
    /// is already ahead of the log, so the server cannot continue.
    #[must_use = "drain the returned unlinks"]
    pub fn commit(&self) -> Vec<ShortId> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.nesting > 0, "commit outside a transaction");
        inner.nesting -= 1;
        if inner.nesting > 0 {
            return Vec::new();
        }
        if !inner.buffer.is_empty() {
            let buffer = std::mem::take(&mut inner.buffer);
            if let Some(file) = inner.file.as_mut() {
                if let Err(e) = file
                    .write_all(buffer.as_bytes())
                    .and_then(|_| file.sync_data())
                {
                    panic!("journal commit failed: {e}");
                }
            }
        }
        std::mem::take(&mut inner.pending_unlinks)
    }

    /// Current transaction depth.
    pub fn nesting(&self) -> u32 {
        self.inner.lock().nesting
    }

    /// Defers a shortid unlink to the outermost commit.
    pub fn defer_unlink(&self, sid: ShortId) {
        self.inner.lock().pending_unlinks.push(sid);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Release);
    }

    /// The log version governing record semantics.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Journal tokens.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("(")]
    Open,

    #[token(")")]
    Close,

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    Str(String),

    #[regex(r#"[^()\s"]+"#, |lex| lex.slice().to_string())]
    Word(String),
}

fn unquote(quoted: &str) -> String {
    let body = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut escape = false;
    for ch in body.chars() {
        if escape {
            out.push(ch);
            escape = false;
        } else if ch == '\\' {
            escape = true;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Cursor over the tokens of one journal.
pub struct RecordReader {
    tokens: Vec<Token>,
    pos: usize,
}

impl RecordReader {
    pub fn new(text: &str) -> RecordReader {
        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(text).spanned() {
            match token {
                Ok(token) => tokens.push(token),
                Err(()) => panic!("corrupt journal near byte {}", span.start),
            }
        }
        RecordReader { tokens, pos: 0 }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    /// Starts the next record, returning its tag; `None` at end of log.
    pub fn open_record(&mut self) -> Option<String> {
        match self.next() {
            None => None,
            Some(Token::Open) => match self.next() {
                Some(Token::Word(tag)) => Some(tag),
                other => panic!("corrupt journal: expected tag, found {other:?}"),
            },
            Some(other) => panic!("corrupt journal: expected '(', found {other:?}"),
        }
    }

    pub fn close_record(&mut self) {
        match self.next() {
            Some(Token::Close) => {}
            other => panic!("corrupt journal: expected ')', found {other:?}"),
        }
    }

    pub fn at_close(&self) -> bool {
        matches!(self.peek(), Some(Token::Close))
    }

    fn word(&mut self) -> String {
        match self.next() {
            Some(Token::Word(word)) => word,
            other => panic!("corrupt journal: expected word, found {other:?}"),
        }
    }

    pub fn longid(&mut self) -> LongId {
        let word = self.word();
        LongId::from_journal(&word)
            .unwrap_or_else(|| panic!("corrupt journal: bad longid {word:?}"))
    }

    pub fn quoted(&mut self) -> String {
        match self.next() {
            Some(Token::Str(text)) => text,
            other => panic!("corrupt journal: expected string, found {other:?}"),
        }
    }

    pub fn integer(&mut self) -> u64 {
        let word = self.word();
        parse_integer(&word)
            .unwrap_or_else(|| panic!("corrupt journal: bad integer {word:?}"))
    }

    pub fn timestamp(&mut self) -> Timestamp {
        self.integer() as Timestamp
    }

    pub fn shortid(&mut self) -> ShortId {
        ShortId(self.integer() as u32)
    }

    pub fn boolean(&mut self) -> bool {
        self.integer() != 0
    }

    /// Sixteen space-separated hex bytes.
    pub fn fingerprint(&mut self) -> Fingerprint {
        let mut fp = Fingerprint::NULL;
        for byte in fp.0.iter_mut() {
            let word = self.word();
            *byte = u8::from_str_radix(&word, 16)
                .unwrap_or_else(|_| panic!("corrupt journal: bad fingerprint byte {word:?}"));
        }
        fp
    }
}

fn parse_integer(word: &str) -> Option<u64> {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        word.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_round_trip() {
        let original = r#"a "quoted" \ name"#;
        let quoted = quote(original);
        let mut reader = RecordReader::new(&format!("(attr {quoted})\n"));
        assert_eq!(reader.open_record().as_deref(), Some("attr"));
        assert_eq!(reader.quoted(), original);
        reader.close_record();
    }

    #[test]
    fn integers_and_ids() {
        let id = LongId::MUTABLE_ROOT.append(5);
        let text = format!("(makm {} 17 0x2a)\n", id);
        let mut reader = RecordReader::new(&text);
        assert_eq!(reader.open_record().as_deref(), Some("makm"));
        assert_eq!(reader.longid(), id);
        assert_eq!(reader.integer(), 17);
        assert_eq!(reader.shortid(), ShortId(0x2a));
        reader.close_record();
        assert!(reader.open_record().is_none());
    }

    #[test]
    fn optional_fields_via_at_close() {
        let fp = Fingerprint([0x5a; 16]);
        let text = format!("(maki @0 3 {})\n(maki @0 5)\n", fp.to_journal());
        let mut reader = RecordReader::new(&text);
        assert_eq!(reader.open_record().as_deref(), Some("maki"));
        reader.longid();
        reader.integer();
        assert!(!reader.at_close());
        assert_eq!(reader.fingerprint(), fp);
        assert!(reader.at_close());
        reader.close_record();
        assert_eq!(reader.open_record().as_deref(), Some("maki"));
        reader.longid();
        reader.integer();
        assert!(reader.at_close());
        reader.close_record();
    }

    #[test]
    fn nesting_and_deferred_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(&dir.path().join("log")).unwrap();
        journal.start();
        journal.put("(vers 4)\n");
        journal.start();
        journal.defer_unlink(ShortId(9));
        assert!(journal.commit().is_empty()); // inner: nothing released
        assert_eq!(journal.nesting(), 1);
        let released = journal.commit();
        assert_eq!(released, vec![ShortId(9)]);
        assert_eq!(journal.nesting(), 0);
    }
}
