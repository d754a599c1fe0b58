//! Lexical path normalisation and allow/forbid pattern matching.

use crate::error::SandboxError;
use glob::{MatchOptions, Pattern};
use std::path::{Component, Path, PathBuf};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Fold `.` and `..` without touching the filesystem.
///
/// `..` never climbs above the root, so `/workspace/../../etc` becomes `/etc`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir => out.push(component.as_os_str()),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::Normal(seg) => out.push(seg),
        }
    }
    out
}

/// Number of normal components, used as the "depth" risk signal.
pub fn path_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

#[derive(Debug, Clone)]
enum Matcher {
    /// `/a/b` or `/a/b/**`: the directory and everything below it.
    Subtree,
    /// Any other glob.
    Glob(Pattern),
}

/// A compiled allow/forbid path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    base: PathBuf,
    matcher: Matcher,
}

impl PathPattern {
    /// Compile an absolute pattern such as `/workspace/**` or `/home/*/.ssh`.
    pub fn parse(raw: &str) -> Result<Self, SandboxError> {
        let trimmed = raw.trim();
        if !Path::new(trimmed).is_absolute() {
            return Err(SandboxError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern must be an absolute path".to_string(),
            });
        }

        let subtree_root = trimmed.strip_suffix("/**").unwrap_or(trimmed);
        let subtree_root = if subtree_root.is_empty() { "/" } else { subtree_root };

        if !has_wildcard(subtree_root) {
            return Ok(Self {
                raw: trimmed.to_string(),
                base: normalize_path(Path::new(subtree_root)),
                matcher: Matcher::Subtree,
            });
        }

        let pattern = Pattern::new(trimmed).map_err(|e| SandboxError::InvalidPattern {
            pattern: raw.to_string(),
            reason: e.to_string(),
        })?;
        let base: PathBuf = Path::new(trimmed)
            .components()
            .take_while(|c| !has_wildcard(&c.as_os_str().to_string_lossy()))
            .collect();

        Ok(Self {
            raw: trimmed.to_string(),
            base,
            matcher: Matcher::Glob(pattern),
        })
    }

    /// Original pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Literal directory prefix before the first wildcard.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Length of the literal prefix; longer is more specific.
    pub fn specificity(&self) -> usize {
        self.base.as_os_str().len()
    }

    /// Whether a normalised absolute `path` is covered by this pattern.
    ///
    /// Every pattern covers the subtree below what it names: `/home/*/.ssh`
    /// matches `/home/bob/.ssh/id_rsa` just as `/home/bob/.ssh` does.
    pub fn matches(&self, path: &Path) -> bool {
        if !path.starts_with(&self.base) {
            return false;
        }
        match &self.matcher {
            Matcher::Subtree => true,
            Matcher::Glob(pattern) => {
                path.ancestors()
                    .take_while(|ancestor| ancestor.starts_with(&self.base))
                    .any(|ancestor| pattern.matches_path_with(ancestor, MATCH_OPTIONS))
                    || self.matches_ancestor(path)
            }
        }
    }

    /// Concrete directory this pattern grants, specialised to `target` for
    /// globs with inner wildcards. Returns `None` when a glob cannot be
    /// pinned to a concrete directory.
    pub fn concrete_root(&self, target: Option<&Path>) -> Option<PathBuf> {
        match &self.matcher {
            Matcher::Subtree => Some(self.base.clone()),
            Matcher::Glob(_) => {
                let target = target?;
                let depth = self.granted_depth();
                let root: PathBuf = target.components().take(depth).collect();
                if root.components().count() == depth && self.matches(target) {
                    Some(root)
                } else {
                    None
                }
            }
        }
    }

    /// Concrete paths this pattern names: the root of a subtree pattern, or
    /// whatever a glob currently expands to on disk.
    pub fn expand(&self) -> Vec<PathBuf> {
        match &self.matcher {
            Matcher::Subtree => vec![self.base.clone()],
            Matcher::Glob(_) => {
                let head = self.raw.strip_suffix("/**").unwrap_or(&self.raw);
                glob::glob_with(head, MATCH_OPTIONS)
                    .into_iter()
                    .flatten()
                    .filter_map(Result::ok)
                    .map(|path| normalize_path(&path))
                    .collect()
            }
        }
    }

    /// A trailing `/**` extends a glob to every descendant of a match.
    fn matches_ancestor(&self, path: &Path) -> bool {
        if !self.raw.ends_with("/**") {
            return false;
        }
        let head = &self.raw[..self.raw.len() - 3];
        let Ok(head) = Pattern::new(head) else {
            return false;
        };
        path.ancestors()
            .any(|ancestor| head.matches_path_with(ancestor, MATCH_OPTIONS))
    }

    fn granted_depth(&self) -> usize {
        let head = self.raw.strip_suffix("/**").unwrap_or(&self.raw);
        Path::new(head).components().count()
    }
}

/// The most specific pattern in `patterns` matching `path`.
pub fn longest_match<'a>(patterns: &'a [PathPattern], path: &Path) -> Option<&'a PathPattern> {
    patterns
        .iter()
        .filter(|p| p.matches(path))
        .max_by_key(|p| p.specificity())
}

/// Compile a list of patterns, failing on the first invalid one.
pub fn compile_patterns<S: AsRef<str>>(raw: &[S]) -> Result<Vec<PathPattern>, SandboxError> {
    raw.iter().map(|p| PathPattern::parse(p.as_ref())).collect()
}

/// Intersect two sets of directory roots: each result lies inside a root of
/// both sets. Redundant descendants are removed.
pub fn intersect_roots(left: &[PathBuf], right: &[PathBuf]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for l in left {
        for r in right {
            if l.starts_with(r) {
                out.push(l.clone());
            } else if r.starts_with(l) {
                out.push(r.clone());
            }
        }
    }
    out.sort();
    out.dedup();

    let minimal: Vec<PathBuf> = out
        .iter()
        .filter(|p| !out.iter().any(|other| other != *p && p.starts_with(other)))
        .cloned()
        .collect();
    minimal
}

fn has_wildcard(s: &str) -> bool {
    s.contains(&['*', '?', '['][..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> PathPattern {
        PathPattern::parse(raw).unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/workspace/./a/../b")), PathBuf::from("/workspace/b"));
        assert_eq!(normalize_path(Path::new("/workspace/../../etc/passwd")), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_path_depth() {
        assert_eq!(path_depth(Path::new("/")), 0);
        assert_eq!(path_depth(Path::new("/a/b/c")), 3);
    }

    #[test]
    fn test_subtree_patterns() {
        let ws = p("/workspace/**");
        assert!(ws.matches(Path::new("/workspace")));
        assert!(ws.matches(Path::new("/workspace/src/main.rs")));
        assert!(!ws.matches(Path::new("/workspace2/file")));
        assert!(!ws.matches(Path::new("/etc/passwd")));

        let literal = p("/etc/passwd");
        assert!(literal.matches(Path::new("/etc/passwd")));
        assert!(!literal.matches(Path::new("/etc/shadow")));
    }

    #[test]
    fn test_glob_patterns() {
        let ssh = p("/home/*/.ssh/**");
        assert_eq!(ssh.base(), Path::new("/home"));
        assert!(ssh.matches(Path::new("/home/bob/.ssh/id_rsa")));
        assert!(ssh.matches(Path::new("/home/bob/.ssh")));
        assert!(!ssh.matches(Path::new("/home/bob/project")));

        let env = p("/workspace/*.env");
        assert!(env.matches(Path::new("/workspace/prod.env")));
        assert!(!env.matches(Path::new("/workspace/nested/prod.env")));
    }

    #[test]
    fn test_glob_without_trailing_wildcard_covers_descendants() {
        let ssh = p("/home/*/.ssh");
        assert!(ssh.matches(Path::new("/home/bob/.ssh")));
        assert!(ssh.matches(Path::new("/home/bob/.ssh/id_rsa")));
        assert!(ssh.matches(Path::new("/home/bob/.ssh/keys/deploy")));
        assert!(!ssh.matches(Path::new("/home/bob/.sshrc")));
        assert!(!ssh.matches(Path::new("/home/bob")));

        let env = p("/workspace/*.env");
        assert!(env.matches(Path::new("/workspace/prod.env/override")));
    }

    #[test]
    fn test_rejects_relative_pattern() {
        assert!(matches!(
            PathPattern::parse("workspace/**"),
            Err(SandboxError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_longest_match_prefers_specific_pattern() {
        let patterns = vec![p("/workspace/**"), p("/workspace/secrets/**")];
        let best = longest_match(&patterns, Path::new("/workspace/secrets/key")).unwrap();
        assert_eq!(best.as_str(), "/workspace/secrets/**");
        assert!(longest_match(&patterns, Path::new("/tmp/x")).is_none());
    }

    #[test]
    fn test_expand_lists_existing_glob_matches() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("bob/.ssh")).unwrap();
        std::fs::create_dir_all(root.join("carol/.ssh")).unwrap();
        std::fs::create_dir_all(root.join("dave")).unwrap();

        let ssh = p(&format!("{}/*/.ssh", root.display()));
        let mut found = ssh.expand();
        found.sort();
        assert_eq!(found, vec![root.join("bob/.ssh"), root.join("carol/.ssh")]);

        assert_eq!(p("/workspace/.git/**").expand(), vec![PathBuf::from("/workspace/.git")]);
    }

    #[test]
    fn test_concrete_root() {
        assert_eq!(p("/workspace/**").concrete_root(None), Some(PathBuf::from("/workspace")));

        let homes = p("/home/*/proj/**");
        assert_eq!(homes.concrete_root(None), None);
        assert_eq!(
            homes.concrete_root(Some(Path::new("/home/bob/proj/src/lib.rs"))),
            Some(PathBuf::from("/home/bob/proj"))
        );
        assert_eq!(homes.concrete_root(Some(Path::new("/home/bob/other"))), None);
    }

    #[test]
    fn test_intersect_roots_only_narrows() {
        let policy = vec![PathBuf::from("/workspace"), PathBuf::from("/data/shared")];
        let floor = vec![PathBuf::from("/workspace/project"), PathBuf::from("/data")];
        assert_eq!(
            intersect_roots(&policy, &floor),
            vec![PathBuf::from("/data/shared"), PathBuf::from("/workspace/project")]
        );

        let disjoint = vec![PathBuf::from("/srv")];
        assert!(intersect_roots(&policy, &disjoint).is_empty());

        let root = vec![PathBuf::from("/")];
        assert_eq!(intersect_roots(&policy, &root), {
            let mut expected = policy.clone();
            expected.sort();
            expected
        });
    }
}
