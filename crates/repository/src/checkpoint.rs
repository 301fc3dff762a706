//! Checkpointing: two-phase serialization of the pool.
//!
//! A checkpoint file holds a compacted image of the stable trees followed
//! by one of the volatile trees (kept so a server restart does not lose
//! build sessions):
//!
//! ```text
//! (smem <version>\n<endian-word><next-short-pointer><bytes…>\n)\n
//! (rroot <repo-root-rep-sp> <repo-root-attrib-sp>)\n
//! (mroot <mutable-root-rep-sp> <mutable-root-attrib-sp>)\n
//! (vmem <version>\n<endian-word><next-short-pointer><bytes…>\n)\n
//! (vroot <volatile-root-attrib-sp>)\n
//! ```
//!
//! Writing is a post-order traversal assigning fresh consecutive short
//! pointers, so the image is also a compaction; it destroys the
//! in-memory pointers, and the caller must reload the image (or exit)
//! immediately after. The volatile region starts with the volatile
//! root's own rep block, which is how the reader finds it again.

use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};

use crate::attrib::AttrRec;
use crate::dir::gc::{checkpoint_children, checkpoint_dir, compose_merged_block};
use crate::pool::ShortPtr;
use crate::repository::{Repository, RootCell};

/// Checkpoint format version.
pub const CKPT_VERSION: u32 = 11;
/// Oldest format this build still reads.
pub const CKPT_MIN_VERSION: u32 = 11;

const ENDIAN_WORD: u32 = 0x0102_0304;

/// Serialized root pointers, parsed back by [`read_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRoots {
    pub repository_rep: ShortPtr,
    pub repository_attribs: ShortPtr,
    pub mutable_rep: ShortPtr,
    pub mutable_attribs: ShortPtr,
    pub volatile_rep: ShortPtr,
    pub volatile_attribs: ShortPtr,
}

/// Writes a full checkpoint of `repo` to `out`.
///
/// The pool's short pointers are consumed by the traversal (visited bits
/// set, fields smashed with forwarding stashes); the repository must
/// reload the checkpoint before serving again.
pub fn write_checkpoint<W: Write + Seek>(repo: &Repository, out: &mut W) -> io::Result<()> {
    let pool = repo.pool();
    let mut next_sp: u32 = 1;

    // Stable region.
    write!(out, "(smem {CKPT_VERSION}\n")?;
    out.write_all(&ENDIAN_WORD.to_le_bytes())?;
    let stable_size_at = out.stream_position()?;
    out.write_all(&0u32.to_le_bytes())?;

    let repo_rep = checkpoint_dir(repo, &mut next_sp, out, repo.root_rep(RootCell::Repository))?;
    let repo_attribs =
        checkpoint_root_attribs(repo, &mut next_sp, out, RootCell::Repository)?;
    let mutable_rep = checkpoint_dir(repo, &mut next_sp, out, repo.root_rep(RootCell::Mutable))?;
    let mutable_attribs = checkpoint_root_attribs(repo, &mut next_sp, out, RootCell::Mutable)?;
    let stable_end = next_sp;
    write!(out, "\n)\n")?;
    write!(out, "(rroot {} {})\n", repo_rep.0, repo_attribs.0)?;
    write!(out, "(mroot {} {})\n", mutable_rep.0, mutable_attribs.0)?;

    // Volatile region, led by the volatile root's own rep.
    write!(out, "(vmem {CKPT_VERSION}\n")?;
    out.write_all(&ENDIAN_WORD.to_le_bytes())?;
    let volatile_size_at = out.stream_position()?;
    out.write_all(&0u32.to_le_bytes())?;

    let vroot_rep = repo.root_rep(RootCell::Volatile);
    // Reserve the slot at the region start; the merged block's length is
    // independent of the child pointers patched in below.
    let reserved = compose_merged_block(repo, vroot_rep, None).len() as u32;
    let vroot_sp = ShortPtr(next_sp);
    next_sp += reserved;
    let mut children = Vec::new();
    let base_link = checkpoint_children(repo, &mut next_sp, &mut children, vroot_rep)?;
    debug_assert!(base_link.is_none());
    let buf = compose_merged_block(repo, vroot_rep, base_link);
    debug_assert_eq!(buf.len() as u32, reserved);
    out.write_all(&buf)?;
    out.write_all(&children)?;
    pool.set_visited(vroot_rep, true);
    debug_assert_eq!(vroot_sp.0, stable_end);

    let volatile_attribs =
        checkpoint_root_attribs(repo, &mut next_sp, out, RootCell::Volatile)?;
    let volatile_end = next_sp;
    write!(out, "\n)\n")?;
    write!(out, "(vroot {})\n", volatile_attribs.0)?;

    // Back-patch the two region sizes.
    let end = out.stream_position()?;
    out.seek(SeekFrom::Start(stable_size_at))?;
    out.write_all(&stable_end.to_le_bytes())?;
    out.seek(SeekFrom::Start(volatile_size_at))?;
    out.write_all(&volatile_end.to_le_bytes())?;
    out.seek(SeekFrom::Start(end))?;
    out.flush()
}

fn checkpoint_root_attribs<W: Write>(
    repo: &Repository,
    next_sp: &mut u32,
    out: &mut W,
    cell: RootCell,
) -> io::Result<ShortPtr> {
    let head = repo.root_attrib_cell(cell);
    if head.is_null() {
        return Ok(ShortPtr::NULL);
    }
    AttrRec(head).checkpoint(repo.pool(), next_sp, out)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn read_line<R: BufRead>(input: &mut R) -> io::Result<String> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

fn corrupt(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("corrupt checkpoint: {what}"))
}

fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn parse_region_header<R: BufRead>(input: &mut R, tag: &str) -> io::Result<u32> {
    let line = read_line(input)?;
    let version: u32 = line
        .strip_prefix(&format!("({tag} "))
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| corrupt("bad region header"))?;
    if !(CKPT_MIN_VERSION..=CKPT_VERSION).contains(&version) {
        return Err(corrupt("unsupported checkpoint version"));
    }
    let endian = read_u32(input)?;
    if endian != ENDIAN_WORD {
        return Err(corrupt("endian marker mismatch"));
    }
    read_u32(input)
}

fn expect_close<R: BufRead>(input: &mut R) -> io::Result<()> {
    // The region bytes are followed by "\n)\n".
    let mut buf = [0u8; 3];
    input.read_exact(&mut buf)?;
    if &buf != b"\n)\n" {
        return Err(corrupt("missing region terminator"));
    }
    Ok(())
}

fn parse_root_line(line: &str, tag: &str, fields: usize) -> io::Result<Vec<u32>> {
    let body = line
        .strip_prefix(&format!("({tag} "))
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| corrupt("bad root line"))?;
    let values: Vec<u32> = body
        .split_whitespace()
        .map(|word| word.parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| corrupt("bad root pointer"))?;
    if values.len() != fields {
        return Err(corrupt("wrong root field count"));
    }
    Ok(values)
}

/// Loads a checkpoint into `repo`'s pool, returning the parsed roots.
///
/// With `read_volatile` off, the volatile region is consumed but not
/// loaded and the volatile roots come back null. The caller is expected
/// to reset derived state and run the pool rebuild pass afterwards.
pub fn read_checkpoint<R: BufRead>(
    repo: &Repository,
    input: &mut R,
    read_volatile: bool,
) -> io::Result<CheckpointRoots> {
    let pool = repo.pool();

    let stable_end = parse_region_header(input, "smem")?;
    pool.reset();
    pool.load_region(input, 1, stable_end)?;
    expect_close(input)?;

    let rroot = parse_root_line(&read_line(input)?, "rroot", 2)?;
    let mroot = parse_root_line(&read_line(input)?, "mroot", 2)?;

    let volatile_end = parse_region_header(input, "vmem")?;
    let mut volatile_rep = ShortPtr::NULL;
    if read_volatile {
        pool.load_region(input, stable_end, volatile_end)?;
        if volatile_end > stable_end {
            volatile_rep = ShortPtr(stable_end);
        }
    } else {
        // Seek past without loading.
        let mut remaining = (volatile_end - stable_end) as u64;
        let mut sink = [0u8; 8192];
        while remaining > 0 {
            let want = sink.len().min(remaining as usize);
            input.read_exact(&mut sink[..want])?;
            remaining -= want as u64;
        }
    }
    expect_close(input)?;
    let vroot = parse_root_line(&read_line(input)?, "vroot", 1)?;

    Ok(CheckpointRoots {
        repository_rep: ShortPtr(rroot[0]),
        repository_attribs: ShortPtr(rroot[1]),
        mutable_rep: ShortPtr(mroot[0]),
        mutable_attribs: ShortPtr(mroot[1]),
        volatile_rep,
        volatile_attribs: if read_volatile {
            ShortPtr(vroot[0])
        } else {
            ShortPtr::NULL
        },
    })
}
