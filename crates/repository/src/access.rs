//! Access control: the predicate the engine consumes, and the text files
//! that configure it.
//!
//! The directory engine only ever asks one question: may `identity`
//! exercise `class` on a node with these owner/group/mode facts? The
//! machinery answering it — alias expansion, group membership, export
//! filtering for the network-filesystem frontier — is configured by three
//! text files sharing one grammar:
//!
//! * comment lines start with `;`, `#`, or `//`
//! * `. <includefile>` splices another file in
//! * membership lines are `name : value[, value]*`
//! * export lines are `pattern [:] level [flavor [arg]] [, …]` where
//!   `pattern` is a DNS wildcard, an IP address, or `address/netmask`,
//!   `level` is `allow`/`rw`/`readwrite`, `readonly`/`ro`, or `deny`, and
//!   `flavor` is `unix`/`global`/`gssapi`/`any`/`all`.
//!
//! Refreshing from disk is rate limited (minimum interval, default one
//! hour) and single-flight.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fnv::{FnvHashMap, FnvHashSet};
use logos::Logos;
use parking_lot::{Mutex, RwLock};

/// What a caller wants to do to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    Read,
    Write,
    Search,
    Ownership,
    Administrative,
    /// Replication-agreement changes (master flags, unsafe replacements).
    Agreement,
    Delete,
}

/// The caller's identity as established by the RPC layer.
///
/// `None` at the check sites means an internal caller (recovery, the
/// engine itself) and is always allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Principal names, most specific first.
    pub users: Vec<String>,
    /// Group names the principal belongs to at the caller's site.
    pub groups: Vec<String>,
}

impl Identity {
    pub fn user(name: &str) -> Identity {
        Identity {
            users: vec![name.to_string()],
            groups: Vec::new(),
        }
    }
}

/// Owner/group/mode facts about one node, resolved from its attributes.
#[derive(Debug, Clone, Default)]
pub struct NodeAc {
    pub owners: Vec<String>,
    pub groups: Vec<String>,
    /// Octal permission bits, `0o777` space.
    pub mode: u32,
}

/// Host-level export decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportLevel {
    ReadWrite,
    ReadOnly,
    Deny,
}

/// Authentication flavor an export rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFlavor {
    Unix,
    Global,
    Gssapi,
    Any,
}

#[derive(Debug, Clone)]
enum HostPattern {
    /// DNS name, `*` matching any one label prefix.
    Dns(String),
    Addr(Ipv4Addr),
    Subnet(Ipv4Addr, Ipv4Addr),
}

#[derive(Debug, Clone)]
struct ExportRule {
    pattern: HostPattern,
    level: ExportLevel,
    flavor: ExportFlavor,
}

#[derive(Debug, Default)]
struct Tables {
    /// group name -> member principals (after alias expansion).
    members: FnvHashMap<String, FnvHashSet<String>>,
    /// principal -> aliases treated as the same principal.
    aliases: FnvHashMap<String, FnvHashSet<String>>,
    exports: Vec<ExportRule>,
}

/// Knobs for [`AccessControl`].
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub group_file: Option<PathBuf>,
    pub alias_file: Option<PathBuf>,
    pub export_file: Option<PathBuf>,
    /// Group whose members may do anything.
    pub admin_group: String,
    /// Principal volatile directories are owned by after recovery.
    pub runtool_user: String,
    /// When set, deleting requires ownership rather than write access.
    pub restrict_delete: bool,
    /// Minimum interval between refreshes from disk.
    pub refresh_interval: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        AccessConfig {
            group_file: None,
            alias_file: None,
            export_file: None,
            admin_group: "vadmin".to_string(),
            runtool_user: "runtool".to_string(),
            restrict_delete: false,
            refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// The access-control oracle.
pub struct AccessControl {
    config: AccessConfig,
    tables: RwLock<Tables>,
    refresh: Mutex<RefreshState>,
}

struct RefreshState {
    last: Option<Instant>,
    count: u64,
}

impl AccessControl {
    pub fn new(config: AccessConfig) -> AccessControl {
        let ac = AccessControl {
            config,
            tables: RwLock::new(Tables::default()),
            refresh: Mutex::new(RefreshState {
                last: None,
                count: 0,
            }),
        };
        ac.reload();
        ac
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    /// The central predicate: may `who` exercise `class` on a node with
    /// access facts `ac`?
    pub fn check(&self, who: Option<&Identity>, class: AccessClass, ac: &NodeAc) -> bool {
        let Some(who) = who else {
            // Internal callers (recovery, engine maintenance) are root.
            return true;
        };
        if self.is_admin(who) {
            return true;
        }
        match class {
            AccessClass::Administrative | AccessClass::Agreement => false,
            AccessClass::Ownership => self.is_owner(who, ac),
            AccessClass::Delete => {
                if self.config.restrict_delete {
                    self.is_owner(who, ac)
                } else {
                    self.check(Some(who), AccessClass::Write, ac)
                }
            }
            AccessClass::Read | AccessClass::Write | AccessClass::Search => {
                let bit = match class {
                    AccessClass::Read => 0o4,
                    AccessClass::Write => 0o2,
                    _ => 0o1,
                };
                let triplet = if self.is_owner(who, ac) {
                    (ac.mode >> 6) & 0o7
                } else if self.in_node_group(who, ac) {
                    (ac.mode >> 3) & 0o7
                } else {
                    ac.mode & 0o7
                };
                triplet & bit != 0
            }
        }
    }

    /// True if `who` is in the administrators group.
    pub fn is_admin(&self, who: &Identity) -> bool {
        self.in_group(who, &self.config.admin_group)
    }

    fn is_owner(&self, who: &Identity, ac: &NodeAc) -> bool {
        let tables = self.tables.read();
        ac.owners
            .iter()
            .any(|owner| who.users.iter().any(|user| tables.same_principal(user, owner)))
    }

    fn in_node_group(&self, who: &Identity, ac: &NodeAc) -> bool {
        ac.groups.iter().any(|group| self.in_group(who, group))
    }

    /// Group membership, honoring both caller-supplied groups and the
    /// membership file.
    pub fn in_group(&self, who: &Identity, group: &str) -> bool {
        if who.groups.iter().any(|g| g == group) {
            return true;
        }
        let tables = self.tables.read();
        if let Some(members) = tables.members.get(group) {
            return who
                .users
                .iter()
                .any(|user| members.iter().any(|m| tables.same_principal(user, m)));
        }
        false
    }

    /// Export decision for a client host.
    pub fn export_level(&self, host: &str, flavor: ExportFlavor) -> ExportLevel {
        let tables = self.tables.read();
        for rule in &tables.exports {
            if rule.flavor != ExportFlavor::Any && rule.flavor != flavor {
                continue;
            }
            if rule.pattern.matches(host) {
                return rule.level;
            }
        }
        ExportLevel::Deny
    }

    /// Re-reads the three files if the minimum interval has elapsed.
    /// Concurrent callers coalesce into one reload.
    pub fn refresh(&self) -> bool {
        {
            let mut state = self.refresh.lock();
            if let Some(last) = state.last {
                if last.elapsed() < self.config.refresh_interval {
                    return false;
                }
            }
            state.last = Some(Instant::now());
            state.count += 1;
        }
        self.reload();
        true
    }

    fn reload(&self) {
        let mut tables = Tables::default();
        if let Some(path) = &self.config.group_file {
            if let Err(e) = parse_members_file(path, &mut tables.members) {
                log::warn!("cannot read group file {}: {e}", path.display());
            }
        }
        if let Some(path) = &self.config.alias_file {
            if let Err(e) = parse_members_file_into_aliases(path, &mut tables.aliases) {
                log::warn!("cannot read alias file {}: {e}", path.display());
            }
        }
        if let Some(path) = &self.config.export_file {
            match parse_export_file(path) {
                Ok(rules) => tables.exports = rules,
                Err(e) => log::warn!("cannot read export file {}: {e}", path.display()),
            }
        }
        *self.tables.write() = tables;
    }
}

impl Tables {
    /// True if `a` and `b` name the same principal under aliasing.
    fn same_principal(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let alias_of = |x: &str, y: &str| {
            self.aliases
                .get(x)
                .map(|set| set.contains(y))
                .unwrap_or(false)
        };
        alias_of(a, b) || alias_of(b, a)
    }
}

/// Parses an octal `#mode` attribute value; garbage maps to 0.
pub fn parse_mode_bits(value: &str) -> u32 {
    u32::from_str_radix(value.trim(), 8).unwrap_or(0) & 0o7777
}

// ---------------------------------------------------------------------------
// File grammar
// ---------------------------------------------------------------------------

/// Tokens within one non-comment line.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t]+")]
enum LineToken {
    #[token(":")]
    Colon,

    #[token(",")]
    Comma,

    /// Bare word: name, value, pattern, level, or flavor.
    #[regex(r"[^ \t:,]+", |lex| lex.slice().to_string())]
    Word(String),
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty()
        || trimmed.starts_with(';')
        || trimmed.starts_with('#')
        || trimmed.starts_with("//")
}

fn tokenize_line(line: &str) -> Result<Vec<LineToken>, String> {
    let mut out = Vec::new();
    for token in LineToken::lexer(line) {
        match token {
            Ok(t) => out.push(t),
            Err(()) => return Err(format!("bad token in line {line:?}")),
        }
    }
    Ok(out)
}

/// Walks a file line by line, handling comments and `. include`, invoking
/// `on_line` for the rest.
fn walk_file(
    path: &Path,
    on_line: &mut dyn FnMut(&str) -> Result<(), String>,
) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    for line in text.lines() {
        if is_comment(line) {
            continue;
        }
        let trimmed = line.trim_start();
        if let Some(include) = trimmed.strip_prefix(". ") {
            let include = include.trim();
            let target = if Path::new(include).is_absolute() {
                PathBuf::from(include)
            } else {
                path.parent().unwrap_or(Path::new(".")).join(include)
            };
            walk_file(&target, on_line)?;
            continue;
        }
        on_line(line)?;
    }
    Ok(())
}

/// `name : value[, value]*` lines into a membership table.
fn parse_members_file(
    path: &Path,
    table: &mut FnvHashMap<String, FnvHashSet<String>>,
) -> Result<(), String> {
    walk_file(path, &mut |line| {
        let tokens = tokenize_line(line)?;
        let mut iter = tokens.into_iter();
        let name = match iter.next() {
            Some(LineToken::Word(w)) => w,
            other => return Err(format!("expected name, got {other:?}")),
        };
        if iter.next() != Some(LineToken::Colon) {
            return Err(format!("expected ':' after {name:?}"));
        }
        let entry = table.entry(name).or_default();
        let mut expect_value = true;
        for token in iter {
            match token {
                LineToken::Word(w) if expect_value => {
                    entry.insert(w);
                    expect_value = false;
                }
                LineToken::Comma if !expect_value => expect_value = true,
                other => return Err(format!("unexpected {other:?} in member list")),
            }
        }
        Ok(())
    })
}

fn parse_members_file_into_aliases(
    path: &Path,
    table: &mut FnvHashMap<String, FnvHashSet<String>>,
) -> Result<(), String> {
    // Same grammar; aliases are just a membership table keyed by principal.
    parse_members_file(path, table)
}

fn parse_level(word: &str) -> Option<ExportLevel> {
    match word {
        "allow" | "rw" | "readwrite" => Some(ExportLevel::ReadWrite),
        "readonly" | "ro" => Some(ExportLevel::ReadOnly),
        "deny" => Some(ExportLevel::Deny),
        _ => None,
    }
}

fn parse_flavor(word: &str) -> Option<ExportFlavor> {
    match word {
        "unix" => Some(ExportFlavor::Unix),
        "global" => Some(ExportFlavor::Global),
        "gssapi" => Some(ExportFlavor::Gssapi),
        "any" | "all" => Some(ExportFlavor::Any),
        _ => None,
    }
}

fn parse_pattern(word: &str) -> HostPattern {
    if let Some((addr, mask)) = word.split_once('/') {
        if let (Ok(addr), Ok(mask)) = (addr.parse(), mask.parse()) {
            return HostPattern::Subnet(addr, mask);
        }
    }
    if let Ok(addr) = word.parse() {
        return HostPattern::Addr(addr);
    }
    HostPattern::Dns(word.to_string())
}

/// `pattern [:] level [flavor [arg]] [, …]` lines.
fn parse_export_file(path: &Path) -> Result<Vec<ExportRule>, String> {
    let mut rules = Vec::new();
    walk_file(path, &mut |line| {
        let tokens = tokenize_line(line)?;
        let mut iter = tokens.into_iter().peekable();
        let pattern = match iter.next() {
            Some(LineToken::Word(w)) => parse_pattern(&w),
            other => return Err(format!("expected pattern, got {other:?}")),
        };
        if iter.peek() == Some(&LineToken::Colon) {
            iter.next();
        }
        loop {
            let level = match iter.next() {
                Some(LineToken::Word(w)) => {
                    parse_level(&w).ok_or_else(|| format!("bad export level {w:?}"))?
                }
                other => return Err(format!("expected level, got {other:?}")),
            };
            let mut flavor = ExportFlavor::Any;
            // Optional flavor and flavor argument up to the next comma.
            while let Some(LineToken::Word(_)) = iter.peek() {
                let Some(LineToken::Word(w)) = iter.next() else {
                    unreachable!()
                };
                if let Some(f) = parse_flavor(&w) {
                    flavor = f;
                }
            }
            rules.push(ExportRule {
                pattern: pattern.clone(),
                level,
                flavor,
            });
            match iter.next() {
                Some(LineToken::Comma) => continue,
                None => break,
                other => return Err(format!("unexpected {other:?} in export line")),
            }
        }
        Ok(())
    })?;
    Ok(rules)
}

impl HostPattern {
    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Dns(pattern) => {
                if let Some(suffix) = pattern.strip_prefix("*.") {
                    host.ends_with(suffix)
                        && host.len() > suffix.len()
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                } else {
                    pattern == host
                }
            }
            HostPattern::Addr(addr) => host.parse() == Ok(*addr),
            HostPattern::Subnet(net, mask) => match host.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    u32::from(addr) & u32::from(*mask) == u32::from(*net) & u32::from(*mask)
                }
                Err(_) => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn control(dir: &tempfile::TempDir) -> AccessControl {
        let groups = write_file(
            dir,
            "groups",
            "; group memberships\n\
             vadmin : alice\n\
             devs : bob, carol\n",
        );
        let aliases = write_file(dir, "aliases", "bob : robert\n");
        let exports = write_file(
            dir,
            "exports",
            "# exports\n\
             *.example.com : allow unix\n\
             10.0.0.0/255.0.0.0 ro\n\
             badhost.example.com deny\n",
        );
        AccessControl::new(AccessConfig {
            group_file: Some(groups),
            alias_file: Some(aliases),
            export_file: Some(exports),
            ..AccessConfig::default()
        })
    }

    fn node(owner: &str, group: &str, mode: u32) -> NodeAc {
        NodeAc {
            owners: vec![owner.to_string()],
            groups: vec![group.to_string()],
            mode,
        }
    }

    #[test]
    fn internal_caller_is_root() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        assert!(ac.check(None, AccessClass::Administrative, &node("x", "y", 0)));
    }

    #[test]
    fn admin_group_grants_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        let alice = Identity::user("alice");
        assert!(ac.check(Some(&alice), AccessClass::Agreement, &node("other", "devs", 0)));
    }

    #[test]
    fn owner_uses_owner_triplet() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        let bob = Identity::user("bob");
        let n = node("bob", "devs", 0o750);
        assert!(ac.check(Some(&bob), AccessClass::Write, &n));
        let dave = Identity::user("dave");
        assert!(!ac.check(Some(&dave), AccessClass::Write, &n));
        assert!(!ac.check(Some(&dave), AccessClass::Read, &n));
    }

    #[test]
    fn group_membership_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        let carol = Identity::user("carol");
        let n = node("bob", "devs", 0o640);
        assert!(ac.check(Some(&carol), AccessClass::Read, &n));
        assert!(!ac.check(Some(&carol), AccessClass::Write, &n));
    }

    #[test]
    fn aliases_unify_principals() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        let robert = Identity::user("robert");
        let n = node("bob", "devs", 0o700);
        assert!(ac.check(Some(&robert), AccessClass::Ownership, &n));
    }

    #[test]
    fn export_rules() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        assert_eq!(
            ac.export_level("host.example.com", ExportFlavor::Unix),
            ExportLevel::ReadWrite
        );
        assert_eq!(
            ac.export_level("10.1.2.3", ExportFlavor::Unix),
            ExportLevel::ReadOnly
        );
        assert_eq!(
            ac.export_level("elsewhere.net", ExportFlavor::Unix),
            ExportLevel::Deny
        );
    }

    #[test]
    fn refresh_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let ac = control(&dir);
        assert!(ac.refresh());
        // Immediately again: suppressed by the interval.
        assert!(!ac.refresh());
    }

    #[test]
    fn mode_bits_parse() {
        assert_eq!(parse_mode_bits("755"), 0o755);
        assert_eq!(parse_mode_bits(" 644 "), 0o644);
        assert_eq!(parse_mode_bits("bogus"), 0);
    }
}
