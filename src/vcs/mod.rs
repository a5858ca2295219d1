//! The git backend.
//!
//! Every operation runs `git -C <repo_dir>` and returns a typed result.
//! A [`GitRepo`] owns the single working tree of the repository: it tracks
//! the checked out branch itself, so only one handle should exist per
//! repository at a time.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sys;

/// Subject of the root commit of every etcdrift repository.
pub const FIRST_COMMIT_MSG: &str = "First etcdrift commit";

/// Result of replaying a commit with `git cherry-pick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPick {
    Applied,
    Conflict { paths: Vec<PathBuf>, output: String },
}

#[derive(Debug)]
pub struct GitRepo {
    repo_dir: PathBuf,
    git: PathBuf,
    /// Run git as this user when running as root through sudo.
    sudo_uid: Option<u32>,
    current_branch: Option<String>,
    initial_branch: Option<String>,
}

pub fn check_git() -> Result<PathBuf> {
    which::which("git").map_err(|e| {
        Error::GitSpawn(std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))
    })
}

impl GitRepo {
    fn new(repo_dir: &Path) -> Result<Self> {
        Ok(GitRepo {
            repo_dir: repo_dir.to_path_buf(),
            git: check_git()?,
            sudo_uid: sys::detect_sudo_context().map(|ctx| ctx.uid),
            current_branch: None,
            initial_branch: None,
        })
    }

    /// Create a new repository whose root commit is on `branch`.
    pub fn create(repo_dir: &Path, branch: &str) -> Result<Self> {
        if repo_dir.is_dir() {
            let mut entries = fs::read_dir(repo_dir).map_err(|e| Error::io(repo_dir, e))?;
            if entries.next().is_some() {
                return Err(Error::RepositoryExists {
                    path: repo_dir.to_path_buf(),
                });
            }
        }
        fs::create_dir_all(repo_dir).map_err(|e| Error::io(repo_dir, e))?;

        let mut repo = GitRepo::new(repo_dir)?;
        repo.git_cmd(["init", "--quiet"])?;
        let head_ref = format!("refs/heads/{}", branch);
        repo.git_cmd(["symbolic-ref", "HEAD", head_ref.as_str()])?;

        if !repo.output(["config", "user.email"])?.status.success() {
            repo.git_cmd(["config", "user.name", "etcdrift"])?;
            repo.git_cmd(["config", "user.email", "etcdrift@localhost"])?;
        }
        repo.git_cmd(["config", "commit.gpgsign", "false"])?;

        let mut files = BTreeMap::new();
        files.insert(".gitignore".to_string(), ".swp\n".to_string());
        repo.add_files(&files, FIRST_COMMIT_MSG)?;

        repo.current_branch = Some(branch.to_string());
        repo.initial_branch = Some(branch.to_string());
        Ok(repo)
    }

    /// Open an existing repository whose root commit is on `branch`.
    ///
    /// Fails when the repository was not created by etcdrift, when its
    /// working tree is dirty, or when an empty cherry-pick is pending.
    pub fn open(repo_dir: &Path, branch: &str) -> Result<Self> {
        let repo = GitRepo::open_unchecked(repo_dir, branch)?;

        let dirty = repo.status()?;
        if !dirty.is_empty() {
            return Err(Error::NotClean {
                path: repo_dir.to_path_buf(),
                dirty,
            });
        }

        if repo.cherry_pick_in_progress() {
            return Err(Error::EmptyCherryPick {
                remedy: repo.command_line("reset"),
            });
        }

        Ok(repo)
    }

    /// Open an existing repository without checking its working tree.
    pub fn open_unchecked(repo_dir: &Path, branch: &str) -> Result<Self> {
        if !repo_dir.is_dir() {
            return Err(Error::NoRepository {
                path: repo_dir.to_path_buf(),
            });
        }
        let mut repo = GitRepo::new(repo_dir)?;

        let output = repo.output(["rev-list", "--max-parents=0", "--format=%s", branch, "--"])?;
        if !output.status.success() {
            return Err(Error::NoRepository {
                path: repo_dir.to_path_buf(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_commit_msg = stdout.lines().nth(1).unwrap_or_default().to_string();
        if first_commit_msg != FIRST_COMMIT_MSG {
            return Err(Error::NotOurRepository {
                found: first_commit_msg,
                expected: FIRST_COMMIT_MSG.to_string(),
            });
        }

        let head = repo.output(["symbolic-ref", "--short", "HEAD"])?;
        if head.status.success() {
            let name = String::from_utf8_lossy(&head.stdout).trim().to_string();
            repo.initial_branch = Some(name.clone());
            repo.current_branch = Some(name);
        }

        Ok(repo)
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// The shell command line running `args` against this repository.
    pub fn command_line(&self, args: &str) -> String {
        let dir = self.repo_dir.to_string_lossy();
        format!("git -C {} {}", shell_escape::escape(dir), args)
    }

    /// The program and leading arguments of every git command.
    fn program(&self) -> Vec<OsString> {
        let mut program: Vec<OsString> = match self.sudo_uid {
            Some(uid) => sys::sudo_prefix(uid).into_iter().map(OsString::from).collect(),
            None => Vec::new(),
        };
        program.push(self.git.clone().into_os_string());
        program.push(OsString::from("-C"));
        program.push(self.repo_dir.clone().into_os_string());
        program
    }

    fn output<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = self.program();
        Command::new(&program[0])
            .args(&program[1..])
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .map_err(Error::GitSpawn)
    }

    /// Run a git command, failing on a non-zero exit status.
    pub fn git_cmd<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let command = args
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(repo = %self.repo_dir.display(), "git {}", command);

        let output = self.output(&args)?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git {
                command,
                output: format!("{}{}", stdout, stderr).trim_end().to_string(),
            });
        }
        if !stdout.is_empty() {
            debug!("{}", stdout);
        }
        Ok(stdout)
    }

    /// `git status --porcelain` lines, empty when the working tree is clean.
    pub fn status(&self) -> Result<Vec<String>> {
        let output = self.git_cmd(["status", "--porcelain", "-z"])?;
        Ok(output
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn cherry_pick_in_progress(&self) -> bool {
        self.repo_dir.join(".git").join("CHERRY_PICK_HEAD").is_file()
    }

    /// Paths with unmerged changes in the working tree.
    pub fn unmerged_paths(&self) -> Result<Vec<PathBuf>> {
        let unmerged = ["DD", "AU", "UD", "UA", "DU", "AA", "UU"];
        Ok(self
            .status()?
            .iter()
            .filter(|line| line.len() > 3 && unmerged.contains(&&line[..2]))
            .map(|line| PathBuf::from(&line[3..]))
            .collect())
    }

    pub fn checkout(&mut self, branch: &str) -> Result<()> {
        if self.current_branch.as_deref() == Some(branch) {
            return Ok(());
        }
        self.git_cmd(["checkout", "--quiet", branch])?;
        self.current_branch = Some(branch.to_string());
        Ok(())
    }

    /// Create `branch` at `start` and check it out.
    pub fn create_branch(&mut self, branch: &str, start: &str) -> Result<()> {
        self.git_cmd(["checkout", "--quiet", "-b", branch, start])?;
        self.current_branch = Some(branch.to_string());
        Ok(())
    }

    pub fn delete_branch(&mut self, branch: &str) -> Result<()> {
        self.git_cmd(["branch", "--delete", "--force", branch])?;
        Ok(())
    }

    pub fn branches(&self) -> Result<Vec<String>> {
        let output = self.git_cmd(["for-each-ref", "--format=%(refname:short)", "refs/heads/"])?;
        Ok(output.lines().map(str::to_string).collect())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branches()?.iter().any(|b| b == branch))
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.git_cmd(["rev-parse", "--verify", "--quiet", rev])
    }

    /// Stage `files` and commit them.
    ///
    /// Nothing is committed when staging left the index unchanged.
    pub fn commit(&self, files: &[PathBuf], msg: &str) -> Result<()> {
        let mut args: Vec<&OsStr> = vec![OsStr::new("add"), OsStr::new("--")];
        args.extend(files.iter().map(|f| f.as_os_str()));
        self.git_cmd(args)?;
        if !self.has_staged_changes()? {
            debug!("nothing to commit for \"{}\"", msg);
            return Ok(());
        }
        self.git_cmd(["commit", "--quiet", "-m", msg])?;
        Ok(())
    }

    fn has_staged_changes(&self) -> Result<bool> {
        let output = self.output(["diff", "--cached", "--quiet"])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(Error::Git {
                command: "diff --cached --quiet".to_string(),
                output: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            }),
        }
    }

    /// Remove `files` from the index and the working tree and commit.
    pub fn remove(&self, files: &[PathBuf], msg: &str) -> Result<()> {
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("rm"),
            OsStr::new("--quiet"),
            OsStr::new("--force"),
            OsStr::new("--"),
        ];
        args.extend(files.iter().map(|f| f.as_os_str()));
        self.git_cmd(args)?;
        self.git_cmd(["commit", "--quiet", "-m", msg])?;
        Ok(())
    }

    /// Write `files` (name to content) in the working tree and commit them.
    pub fn add_files(&self, files: &BTreeMap<String, String>, msg: &str) -> Result<()> {
        let mut paths = Vec::new();
        for (name, content) in files {
            let path = self.repo_dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
            paths.push(PathBuf::from(name));
        }
        if !paths.is_empty() {
            self.commit(&paths, msg)?;
        }
        Ok(())
    }

    /// The files tracked on `branch`, the `.gitignore` file left out.
    pub fn tracked_files(&self, branch: &str) -> Result<BTreeSet<PathBuf>> {
        let output = self.git_cmd(["ls-tree", "-r", "-z", "--name-only", "--full-tree", branch])?;
        Ok(output
            .split('\0')
            .filter(|name| !name.is_empty() && *name != ".gitignore")
            .map(PathBuf::from)
            .collect())
    }

    /// True when `to` has commits that `from` does not have.
    pub fn range_has_commits(&self, from: &str, to: &str) -> Result<bool> {
        let range = format!("{}..{}", from, to);
        let output = self.git_cmd(["rev-list", range.as_str()])?;
        Ok(!output.is_empty())
    }

    /// Check out `branch` and fast-forward it to `source`.
    pub fn fast_forward(&mut self, branch: &str, source: &str) -> Result<()> {
        self.checkout(branch)?;
        self.git_cmd(["merge", "--quiet", "--ff-only", source])?;
        Ok(())
    }

    pub fn tag(&self, name: &str, target: &str) -> Result<()> {
        self.git_cmd(["tag", "--force", name, target])?;
        Ok(())
    }

    /// Replay `commit` on the current branch.
    ///
    /// The `(cherry picked from commit ...)` trailer is added to the
    /// message. A conflict leaves the cherry-pick in progress.
    pub fn cherry_pick(&self, commit: &str) -> Result<CherryPick> {
        debug!(repo = %self.repo_dir.display(), "git cherry-pick -x {}", commit);
        let output = self.output(["cherry-pick", "-x", "--keep-redundant-commits", commit])?;
        if output.status.success() {
            return Ok(CherryPick::Applied);
        }

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let paths = self.unmerged_paths()?;
        if paths.is_empty() {
            self.git_cmd(["reset", "--hard", "--quiet", "HEAD"])?;
            return Err(Error::CherryPickFailed {
                commit: commit.to_string(),
                output: text.trim_end().to_string(),
            });
        }

        Ok(CherryPick::Conflict {
            paths,
            output: text.trim_end().to_string(),
        })
    }

    pub fn abort_cherry_pick(&self) -> Result<()> {
        self.git_cmd(["cherry-pick", "--abort"])?;
        Ok(())
    }

    /// The paths changed by `commit`.
    pub fn commit_paths(&self, commit: &str) -> Result<Vec<PathBuf>> {
        let output = self.git_cmd(["diff-tree", "--no-commit-id", "--name-only", "-r", "-z", commit])?;
        Ok(output
            .split('\0')
            .filter(|name| !name.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// The commits of `from..to` whose message carries a cherry-pick
    /// trailer, newest first.
    pub fn cherry_picked_commits(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{}..{}", from, to);
        let output = self.git_cmd(["rev-list", "--format=%B", range.as_str()])?;
        find_cherry_picked(&output)
    }

    /// Throw away uncommitted changes and untracked files.
    pub fn discard_changes(&self) -> Result<()> {
        self.git_cmd(["reset", "--hard", "--quiet", "HEAD"])?;
        self.git_cmd(["clean", "-d", "-x", "-f", "-q"])?;
        Ok(())
    }

    /// Return to the branch that was checked out when the repository was
    /// opened, unless the working tree is dirty.
    pub fn close(&mut self, fallback: &str) -> Result<()> {
        if !self.status()?.is_empty() || self.cherry_pick_in_progress() {
            return Ok(());
        }
        let branch = match &self.initial_branch {
            Some(initial) if self.branch_exists(initial)? => initial.clone(),
            _ => fallback.to_string(),
        };
        self.checkout(&branch)
    }
}

fn find_cherry_picked(rev_list: &str) -> Result<Vec<String>> {
    let re_commit = Regex::new(r"^commit (?P<commit>[0-9a-fA-F]{40,64})$")?;
    let re_trailer = Regex::new(r"^\(cherry picked from commit [0-9a-fA-F]{40,64}\)$")?;

    let mut found = Vec::new();
    let mut commit: Option<String> = None;
    for line in rev_list.lines() {
        if let Some(caps) = re_commit.captures(line) {
            commit = Some(caps["commit"].to_string());
            continue;
        }
        if re_trailer.is_match(line.trim()) {
            if let Some(sha) = commit.take() {
                found.push(sha);
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_cherry_picked() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let c = "c".repeat(40);
        let rev_list = format!(
            "commit {a}\nUpdate files with user changes\n\ncommit {b}\nMerge with upgraded package files not copied to /etc\n\n(cherry picked from commit {c})\n\ncommit {c}\nOther\n"
        );
        assert_eq!(find_cherry_picked(&rev_list).unwrap(), vec![b]);
    }

    #[test]
    fn test_find_cherry_picked_none() {
        let rev_list = format!("commit {}\nAdd files with user changes\n", "d".repeat(40));
        assert!(find_cherry_picked(&rev_list).unwrap().is_empty());
    }

    #[test]
    fn test_command_line_escapes_repo_dir() {
        let repo = GitRepo {
            repo_dir: PathBuf::from("/tmp/my repo"),
            git: PathBuf::from("git"),
            sudo_uid: None,
            current_branch: None,
            initial_branch: None,
        };
        assert_eq!(repo.command_line("reset"), "git -C '/tmp/my repo' reset");
    }

    #[test]
    fn test_program_runs_git_as_sudo_user() {
        let mut repo = GitRepo {
            repo_dir: PathBuf::from("/home/alice/.local/share/etcdrift"),
            git: PathBuf::from("/usr/bin/git"),
            sudo_uid: None,
            current_branch: None,
            initial_branch: None,
        };
        assert_eq!(
            repo.program(),
            ["/usr/bin/git", "-C", "/home/alice/.local/share/etcdrift"]
                .map(OsString::from)
                .to_vec()
        );

        repo.sudo_uid = Some(1000);
        assert_eq!(
            repo.program(),
            ["sudo", "--user", "#1000", "/usr/bin/git", "-C", "/home/alice/.local/share/etcdrift"]
                .map(OsString::from)
                .to_vec()
        );
    }

    #[test]
    fn test_commit_of_unchanged_files_is_skipped() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let repo = GitRepo::create(&temp_dir.path().join("repo"), "user").unwrap();
        let head = repo.rev_parse("HEAD").unwrap();

        repo.commit(&[PathBuf::from(".gitignore")], "Nothing changed").unwrap();
        assert_eq!(repo.rev_parse("HEAD").unwrap(), head);

        fs::write(temp_dir.path().join("repo/.gitignore"), ".swp\n*.bak\n").unwrap();
        repo.commit(&[PathBuf::from(".gitignore")], "Ignore backups").unwrap();
        assert_ne!(repo.rev_parse("HEAD").unwrap(), head);
    }
}
