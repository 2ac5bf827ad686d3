//! Pure parsing helpers for git porcelain and plumbing output.

use super::types::{CommitChange, CommitEntry, DiffStats};

/// Parse `git diff --shortstat` output, e.g.
/// ` 3 files changed, 14 insertions(+), 2 deletions(-)`.
pub fn parse_shortstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for part in output.trim().split(',') {
        let part = part.trim();
        let count: usize = part
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if part.contains("file") {
            stats.files_changed = count;
        } else if part.contains("insertion") {
            stats.insertions = count;
        } else if part.contains("deletion") {
            stats.deletions = count;
        }
    }
    stats
}

/// Parse `git log --format=%H%x09%s` output into commit entries.
pub fn parse_commit_log(output: &str) -> Vec<CommitEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (sha, subject) = line.split_once('\t')?;
            Some(CommitEntry {
                sha: sha.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}

/// Parse `git show --name-status --format=` output into (status, path)
/// pairs. Rename lines (`R100\told\tnew`) report the new path.
pub fn parse_name_status(output: &str) -> Vec<CommitChange> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let status = fields.next()?.trim();
            if status.is_empty() {
                return None;
            }
            let path = fields.next_back()?.trim();
            Some(CommitChange {
                status: status.chars().next()?.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

/// Parse `git merge-tree --write-tree --name-only` output.
///
/// The first line is always the (possibly partial) tree OID; when the merge
/// conflicted, the conflicted file names follow until the first blank line.
pub fn parse_merge_tree(output: &str) -> (String, Vec<String>) {
    let mut lines = output.lines();
    let tree = lines.next().unwrap_or("").trim().to_string();
    let files = lines
        .take_while(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .collect();
    (tree, files)
}

/// `git stash push` prints this when the working tree was already clean.
pub fn stash_created(stdout: &str) -> bool {
    !stdout.contains("No local changes to save")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortstat_full_line() {
        let stats = parse_shortstat(" 3 files changed, 14 insertions(+), 2 deletions(-)\n");
        assert_eq!(stats.files_changed, 3);
        assert_eq!(stats.insertions, 14);
        assert_eq!(stats.deletions, 2);
    }

    #[test]
    fn shortstat_insertions_only() {
        let stats = parse_shortstat(" 1 file changed, 5 insertions(+)");
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.insertions, 5);
        assert_eq!(stats.deletions, 0);
    }

    #[test]
    fn shortstat_empty() {
        assert_eq!(parse_shortstat(""), DiffStats::default());
    }

    #[test]
    fn commit_log_lines() {
        let entries = parse_commit_log("abc123\tfirst\ndef456\tsecond: with tabs? no\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sha, "abc123");
        assert_eq!(entries[1].subject, "second: with tabs? no");
    }

    #[test]
    fn name_status_handles_renames() {
        let changes = parse_name_status("M\tsrc/lib.rs\nR100\told.rs\tnew.rs\nA\tadded.rs\n");
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].status, "M");
        assert_eq!(changes[1].status, "R");
        assert_eq!(changes[1].path, "new.rs");
        assert_eq!(changes[2].path, "added.rs");
    }

    #[test]
    fn merge_tree_clean() {
        let (tree, files) = parse_merge_tree("1234567890abcdef\n");
        assert_eq!(tree, "1234567890abcdef");
        assert!(files.is_empty());
    }

    #[test]
    fn merge_tree_conflicts() {
        let out = "1234567890abcdef\nsrc/main.rs\nREADME.md\n\nAuto-merging src/main.rs\n";
        let (tree, files) = parse_merge_tree(out);
        assert_eq!(tree, "1234567890abcdef");
        assert_eq!(files, vec!["src/main.rs", "README.md"]);
    }

    #[test]
    fn stash_detection() {
        assert!(stash_created("Saved working directory and index state"));
        assert!(!stash_created("No local changes to save\n"));
    }
}
