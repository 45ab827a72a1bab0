// Copyright (c) The stagerunner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test file collection.
//!
//! Walks a project's test directory depth-first in lexicographic order,
//! honoring an optional `.gitignore` hierarchy, then applies the project's
//! `test_match` / `test_ignore` globs, CLI file filters, and the permitted
//! extension set.

use crate::{
    config::{Project, TestFileFilter, TEST_FILE_EXTENSIONS},
    errors::TestError,
};
use camino::{Utf8Path, Utf8PathBuf};
use globset::{GlobBuilder, GlobMatcher};
use std::io;
use tracing::warn;

/// Collects the test files of one project: the ordered walk output filtered
/// by extension, `test_ignore`, `test_match`, and CLI file patterns.
pub(crate) fn collect_project_files(
    project: &Project,
    cli_filters: &[TestFileFilter],
) -> Result<Vec<Utf8PathBuf>, TestError> {
    let files = walk_test_dir(&project.test_dir, project.respect_git_ignore).map_err(|error| {
        TestError::new(format!(
            "failed to collect test files under {}: {error}",
            project.test_dir
        ))
    })?;
    let test_match = FileMatcher::new(&project.test_match, &project.test_dir)?;
    let test_ignore = FileMatcher::new(&project.test_ignore, &project.test_dir)?;

    Ok(files
        .into_iter()
        .filter(|file| {
            let Some(extension) = file.extension() else {
                return false;
            };
            if !TEST_FILE_EXTENSIONS.contains(&extension) {
                return false;
            }
            if test_ignore.is_match(file) {
                return false;
            }
            if !(test_match.is_empty() || test_match.is_match(file)) {
                return false;
            }
            cli_filters.is_empty()
                || cli_filters
                    .iter()
                    .any(|filter| cli_pattern_matches(&filter.pattern, file))
        })
        .collect())
}

/// Walks `test_dir` depth-first, entries in lexicographic order by name,
/// returning the absolute paths of files that are not git-ignored.
///
/// Never descends into `node_modules` and never emits `.gitignore` files.
pub(crate) fn walk_test_dir(
    test_dir: &Utf8Path,
    respect_git_ignore: bool,
) -> io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    let mut rules = Vec::new();
    visit(
        test_dir,
        respect_git_ignore,
        &mut rules,
        WalkStatus::Included,
        &mut files,
    )?;
    Ok(files)
}

/// The gitignore status of one walked entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WalkStatus {
    Included,
    Ignored,
    /// The directory itself is ignored, but a re-include rule targets one of
    /// its descendants: descend without emitting.
    IgnoredButRecurse,
}

fn visit(
    dir: &Utf8Path,
    respect_git_ignore: bool,
    rules: &mut Vec<IgnoreRule>,
    status: WalkStatus,
    out: &mut Vec<Utf8PathBuf>,
) -> io::Result<()> {
    let mut entries = dir
        .read_dir_utf8()?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));

    let inherited_rules = rules.len();
    if respect_git_ignore {
        if let Ok(contents) = std::fs::read_to_string(dir.join(".gitignore")) {
            rules.extend(parse_gitignore_rules(dir, &contents));
        }
    }

    for entry in &entries {
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let path = entry.path();
        if file_type.is_dir() {
            if name == "node_modules" {
                continue;
            }
            let entry_status = check_ignores(path, rules, true, status);
            if entry_status != WalkStatus::Ignored {
                visit(path, respect_git_ignore, rules, entry_status, out)?;
            }
        } else if file_type.is_file() {
            if name == ".gitignore" {
                continue;
            }
            if check_ignores(path, rules, false, status) == WalkStatus::Included {
                out.push(path.to_owned());
            }
        }
    }

    rules.truncate(inherited_rules);
    Ok(())
}

/// Applies the rule list in order. A rule flips the status only when the
/// current status direction differs from the rule's polarity.
fn check_ignores(
    entry_path: &Utf8Path,
    rules: &[IgnoreRule],
    is_directory: bool,
    parent_status: WalkStatus,
) -> WalkStatus {
    let mut status = parent_status;
    for rule in rules {
        let rule_includes = rule.negate;
        if (status == WalkStatus::Included) == rule_includes {
            continue;
        }
        let relative = entry_path
            .strip_prefix(&rule.base)
            .unwrap_or(entry_path)
            .as_str();
        if rule.matches(&format!("/{relative}")) || rule.matches(relative) {
            status = if rule_includes {
                WalkStatus::Included
            } else {
                WalkStatus::Ignored
            };
        } else if is_directory
            && (rule.matches(&format!("/{relative}/")) || rule.matches(&format!("{relative}/")))
        {
            status = if rule_includes {
                WalkStatus::Included
            } else {
                WalkStatus::Ignored
            };
        } else if is_directory && rule_includes && rule.matches_prefix(relative) {
            // A re-include targets a descendant of this otherwise-ignored
            // directory.
            status = WalkStatus::IgnoredButRecurse;
        }
    }
    status
}

/// One parsed `.gitignore` line.
struct IgnoreRule {
    /// `!rule` re-includes.
    negate: bool,
    /// Directory the defining `.gitignore` lives in; paths are matched
    /// relative to it.
    base: Utf8PathBuf,
    matcher: GlobMatcher,
    /// Slash-free patterns match against the basename.
    match_base: bool,
    /// Per-component matchers for descendant prefix checks.
    components: Vec<RuleComponent>,
}

enum RuleComponent {
    /// A `**` component: matches any number of path components.
    Any,
    Component(GlobMatcher),
}

impl IgnoreRule {
    fn matches(&self, candidate: &str) -> bool {
        if self.match_base {
            let basename = candidate
                .rsplit('/')
                .find(|part| !part.is_empty())
                .unwrap_or(candidate);
            self.matcher.is_match(basename)
        } else {
            self.matcher.is_match(candidate)
        }
    }

    /// Returns true if `candidate` names a proper ancestor of a path the
    /// rule could match.
    fn matches_prefix(&self, candidate: &str) -> bool {
        let parts: Vec<&str> = candidate.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() >= self.components.len() {
            return false;
        }
        for (part, component) in parts.iter().zip(&self.components) {
            match component {
                RuleComponent::Any => return true,
                RuleComponent::Component(matcher) => {
                    if !matcher.is_match(part) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

fn parse_gitignore_rules(dir: &Utf8Path, contents: &str) -> Vec<IgnoreRule> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (negate, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            build_rule(dir, negate, pattern)
        })
        .collect()
}

fn build_rule(dir: &Utf8Path, negate: bool, pattern: &str) -> Option<IgnoreRule> {
    let matcher = match compile_glob(pattern) {
        Ok(matcher) => matcher,
        Err(error) => {
            warn!(pattern, %error, "skipping malformed gitignore rule");
            return None;
        }
    };
    let components = pattern
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part == "**" {
                Ok(RuleComponent::Any)
            } else {
                compile_glob(part).map(RuleComponent::Component)
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    Some(IgnoreRule {
        negate,
        base: dir.to_owned(),
        matcher,
        match_base: !pattern.contains('/'),
        components,
    })
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

/// A set of globs matched against paths relative to a base directory, with
/// basename matching for slash-free patterns.
pub(crate) struct FileMatcher {
    patterns: Vec<(GlobMatcher, bool)>,
    base_dir: Utf8PathBuf,
}

impl FileMatcher {
    pub(crate) fn new(patterns: &[String], base_dir: &Utf8Path) -> Result<Self, TestError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                compile_glob(pattern)
                    .map(|matcher| (matcher, !pattern.contains('/')))
                    .map_err(|error| {
                        TestError::new(format!("invalid file pattern '{pattern}': {error}"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            base_dir: base_dir.to_owned(),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub(crate) fn is_match(&self, file: &Utf8Path) -> bool {
        let relative = file
            .strip_prefix(&self.base_dir)
            .map(Utf8Path::as_str)
            .unwrap_or(file.as_str());
        self.patterns.iter().any(|(matcher, match_base)| {
            if *match_base {
                let basename = relative.rsplit('/').next().unwrap_or(relative);
                matcher.is_match(basename)
            } else {
                matcher.is_match(relative)
            }
        })
    }
}

/// Matches a CLI file filter pattern against an absolute file path: glob
/// matching when the pattern carries glob metacharacters, substring matching
/// otherwise.
pub(crate) fn cli_pattern_matches(pattern: &str, file: &Utf8Path) -> bool {
    let has_glob_meta = pattern
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | '{'));
    if !has_glob_meta {
        return file.as_str().contains(pattern);
    }
    let direct = compile_glob(pattern)
        .map(|m| m.is_match(file.as_str()))
        .unwrap_or(false);
    if direct {
        return true;
    }
    // Allow bare globs like `smoke*.spec.ts` to match at any depth.
    if !pattern.starts_with("**") && !pattern.starts_with('/') {
        return compile_glob(&format!("**/{pattern}"))
            .map(|m| m.is_match(file.as_str()))
            .unwrap_or(false);
    }
    false
}
