use etcdrift::cfg::Config;
use etcdrift::report::UpdateReport;
use etcdrift::workspace::{PassOutcome, Workspace, WorkspaceState};
use etcdrift::Error;
use filetime::{set_file_mtime, FileTime};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

const BASE: &str = "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n";

struct Fixture {
    _temp_dir: TempDir,
    root: PathBuf,
    repo: PathBuf,
    cache: PathBuf,
    config: Config,
    next_mtime: i64,
}

impl Fixture {
    fn new() -> Self {
        Fixture::with_repo("repo")
    }

    /// A fixture whose repository is at `repo_rel` in the temporary directory.
    fn with_repo(repo_rel: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let repo = temp_dir.path().join(repo_rel);
        let cache = temp_dir.path().join("cache");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(&cache).unwrap();

        let mut config = Config::default();
        config.general.root_dir = root.clone();
        config.general.repo_dir = repo.clone();
        config.packages.cache_dirs = vec![cache.clone()];

        Fixture {
            _temp_dir: temp_dir,
            root,
            repo,
            cache,
            config,
            next_mtime: 1_600_000_000,
        }
    }

    fn write_live(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read_live(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel)).unwrap()
    }

    /// Add a package archive, newer than every archive added before.
    fn add_package(&mut self, name: &str, version: &str, files: &[(&str, &str)]) -> PathBuf {
        self.next_mtime += 100;
        let mtime = self.next_mtime;
        self.add_package_at(name, version, files, mtime)
    }

    fn add_package_at(&self, name: &str, version: &str, files: &[(&str, &str)], mtime: i64) -> PathBuf {
        self.write_package(name, version, files, &[], mtime)
    }

    /// Add a package holding `files` and the hard links `links`, as
    /// (link, target) pairs.
    fn add_package_with_links(
        &mut self,
        name: &str,
        version: &str,
        files: &[(&str, &str)],
        links: &[(&str, &str)],
    ) -> PathBuf {
        self.next_mtime += 100;
        let mtime = self.next_mtime;
        self.write_package(name, version, files, links, mtime)
    }

    fn write_package(
        &self,
        name: &str,
        version: &str,
        files: &[(&str, &str)],
        links: &[(&str, &str)],
        mtime: i64,
    ) -> PathBuf {
        let path = self.cache.join(format!("{}-{}-x86_64.pkg.tar.zst", name, version));
        let file = File::create(&path).unwrap();
        let encoder = zstd::Encoder::new(file, 0).unwrap().auto_finish();
        let mut builder = tar::Builder::new(encoder);
        for (member, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, member, content.as_bytes()).unwrap();
        }
        for (link, target) in links {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
            header.set_mode(0o644);
            header.set_path(link).unwrap();
            header.set_link_name(target).unwrap();
            header.set_cksum();
            builder.append(&header, std::io::empty()).unwrap();
        }
        builder.into_inner().unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        path
    }

    fn create(&self) -> UpdateReport {
        let mut workspace = Workspace::create(&self.config).unwrap();
        let report = workspace.update(false).unwrap();
        workspace.close().unwrap();
        report
    }

    fn update(&self) -> UpdateReport {
        self.try_update(false).unwrap()
    }

    fn try_update(&self, dry_run: bool) -> etcdrift::Result<UpdateReport> {
        let mut workspace = Workspace::open(&self.config)?;
        let report = workspace.update(dry_run)?;
        workspace.close()?;
        Ok(report)
    }

    fn sync(&self) -> Vec<PathBuf> {
        let mut workspace = Workspace::open(&self.config).unwrap();
        let report = workspace.sync(false).unwrap();
        workspace.close().unwrap();
        report.synced
    }

    fn state(&self) -> WorkspaceState {
        Workspace::status(&self.config).unwrap()
    }

    fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn tracked(&self, branch: &str) -> Vec<String> {
        self.git(&["ls-tree", "-r", "--name-only", branch])
            .lines()
            .filter(|l| *l != ".gitignore")
            .map(str::to_string)
            .collect()
    }

    fn show(&self, branch: &str, rel: &str) -> String {
        self.git(&["show", &format!("{}:{}", branch, rel)])
    }

    fn branches(&self) -> BTreeSet<String> {
        self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn paths(rels: &[&str]) -> BTreeSet<PathBuf> {
    rels.iter().map(PathBuf::from).collect()
}

fn replace_line(content: &str, line: usize, new: &str) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, l)| if i + 1 == line { new.to_string() } else { l.to_string() })
        .map(|l| l + "\n")
        .collect()
}

#[test]
fn test_create_initializes_branches() {
    let fixture = Fixture::new();
    let report = fixture.create();

    assert!(report.changes.is_empty());
    assert_eq!(
        fixture.branches(),
        ["cursor", "user", "vendor"].iter().map(|s| s.to_string()).collect()
    );
    let first = fixture.git(&["log", "--format=%s", "--max-parents=0", "user"]);
    assert_eq!(first.trim(), "First etcdrift commit");
    assert_eq!(fixture.show("user", ".gitignore"), ".swp\n");
}

#[test]
fn test_create_fails_on_non_empty_directory() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.repo).unwrap();
    fs::write(fixture.repo.join("README"), "hello").unwrap();

    let result = Workspace::create(&fixture.config);
    assert!(matches!(result, Err(Error::RepositoryExists { .. })));
}

#[test]
fn test_open_rejects_foreign_repository() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.repo).unwrap();
    fixture.git(&["init", "--quiet"]);
    fixture.git(&["symbolic-ref", "HEAD", "refs/heads/user"]);
    fixture.git(&["-c", "user.name=t", "-c", "user.email=t@t", "commit", "--allow-empty", "-m", "Initial"]);

    let result = Workspace::open(&fixture.config);
    assert!(matches!(result, Err(Error::NotOurRepository { .. })));
}

#[test]
fn test_fresh_install_identical_to_live() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=1\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);

    let report = fixture.create();

    assert_eq!(report.changes.vendor_add, paths(&["etc/foo.conf"]));
    assert!(report.changes.user_add.is_empty());
    assert_eq!(report.outcome, PassOutcome::Finalized);
    assert_eq!(fixture.tracked("vendor"), vec!["etc/foo.conf"]);
    assert!(fixture.tracked("user").is_empty());
    assert_eq!(fixture.tracked("cursor"), vec!["cursors/foo"]);
    assert_eq!(fixture.state(), WorkspaceState::Idle);
}

#[test]
fn test_divergent_install_keeps_live_content() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=2\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);

    let report = fixture.create();

    assert_eq!(report.changes.vendor_add, paths(&["etc/foo.conf"]));
    assert_eq!(report.changes.user_add, paths(&["etc/foo.conf"]));
    assert_eq!(fixture.show("vendor", "etc/foo.conf"), "foo=1\n");
    assert_eq!(fixture.show("user", "etc/foo.conf"), "foo=2\n");
    assert_eq!(fixture.read_live("etc/foo.conf"), "foo=2\n");
}

#[test]
fn test_second_pass_is_idempotent() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=2\n");
    fixture.write_live("etc/bar.conf", "bar\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);
    fixture.add_package("bar", "1.0-1", &[("etc/bar.conf", "bar\n")]);
    fixture.create();
    let user_head = fixture.git(&["rev-parse", "user"]);
    let vendor_head = fixture.git(&["rev-parse", "vendor"]);

    let report = fixture.update();

    assert!(report.changes.is_empty());
    assert!(report.packages.is_empty());
    assert_eq!(fixture.git(&["rev-parse", "user"]), user_head);
    assert_eq!(fixture.git(&["rev-parse", "vendor"]), vendor_head);
}

#[test]
fn test_user_edit_then_update() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=1\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);
    fixture.create();

    fixture.write_live("etc/foo.conf", "foo=local\n");
    let report = fixture.update();
    assert_eq!(report.changes.user_add, paths(&["etc/foo.conf"]));

    fixture.write_live("etc/foo.conf", "foo=local again\n");
    let report = fixture.update();
    assert_eq!(report.changes.user_update, paths(&["etc/foo.conf"]));
    assert_eq!(fixture.show("user", "etc/foo.conf"), "foo=local again\n");
    let subject = fixture.git(&["log", "-1", "--format=%s", "user"]);
    assert_eq!(subject.trim(), "Update files with user changes");
}

#[test]
fn test_simultaneous_edit_clean_merge_and_sync() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", BASE);
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", BASE)]);
    fixture.create();

    let user_version = replace_line(BASE, 1, "user");
    fixture.write_live("etc/foo.conf", &user_version);
    fixture.update();
    fs::set_permissions(
        fixture.root.join("etc/foo.conf"),
        fs::Permissions::from_mode(0o640),
    )
    .unwrap();

    let vendor_version = replace_line(BASE, 10, "vendor");
    fixture.add_package("foo", "1.1-1", &[("etc/foo.conf", &vendor_version)]);
    let report = fixture.update();

    assert_eq!(report.changes.needs_merge, paths(&["etc/foo.conf"]));
    assert!(matches!(report.outcome, PassOutcome::PendingSync { .. }));
    assert!(matches!(fixture.state(), WorkspaceState::PendingMerge { .. }));
    // The live file is untouched until the sync.
    assert_eq!(fixture.read_live("etc/foo.conf"), user_version);

    let synced = fixture.sync();

    let merged = replace_line(&user_version, 10, "vendor");
    assert_eq!(synced, vec![PathBuf::from("etc/foo.conf")]);
    assert_eq!(fixture.read_live("etc/foo.conf"), merged);
    let mode = fs::metadata(fixture.root.join("etc/foo.conf")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);
    assert_eq!(fixture.state(), WorkspaceState::Idle);
    assert_eq!(fixture.show("user", "etc/foo.conf"), merged);
    assert_eq!(fixture.show("vendor", "etc/foo.conf"), vendor_version);
    assert_eq!(fixture.show("vendor-prev", "etc/foo.conf"), BASE);

    let report = fixture.update();
    assert!(report.changes.is_empty());
}

#[test]
fn test_true_conflict_and_resolution() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", BASE);
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", BASE)]);
    fixture.create();

    fixture.write_live("etc/foo.conf", &replace_line(BASE, 5, "user"));
    fixture.update();
    fixture.add_package("foo", "1.1-1", &[("etc/foo.conf", &replace_line(BASE, 5, "vendor"))]);

    let report = fixture.update();
    match &report.outcome {
        PassOutcome::Conflicted { paths, remedy, .. } => {
            assert_eq!(paths, &vec![PathBuf::from("etc/foo.conf")]);
            assert!(remedy.ends_with("cherry-pick --abort"));
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
    assert_eq!(
        fixture.state(),
        WorkspaceState::Conflicted {
            paths: vec![PathBuf::from("etc/foo.conf")]
        }
    );

    // Finalizing before the conflict is resolved is refused.
    let err = fixture.try_update(false).unwrap_err();
    assert!(matches!(err, Error::NotClean { .. }));
    assert!(err.to_string().contains("not clean"));

    fs::write(fixture.repo.join("etc/foo.conf"), "resolved\n").unwrap();
    fixture.git(&["add", "etc/foo.conf"]);
    fixture.git(&["commit", "--quiet", "--no-edit"]);
    assert!(matches!(fixture.state(), WorkspaceState::PendingMerge { .. }));

    let report = fixture.update();
    assert!(report.resumed);
    assert_eq!(report.synced, vec![PathBuf::from("etc/foo.conf")]);
    assert_eq!(fixture.read_live("etc/foo.conf"), "resolved\n");
    assert_eq!(fixture.state(), WorkspaceState::Idle);
    assert!(!fixture.branches().contains("user-staging"));
}

#[test]
fn test_removal_cascade() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=local\n");
    fixture.write_live("etc/local.conf", "mine\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);
    fixture.create();
    assert_eq!(fixture.tracked("user"), vec!["etc/foo.conf"]);

    fs::remove_file(fixture.root.join("etc/foo.conf")).unwrap();
    let report = fixture.update();

    assert_eq!(report.changes.vendor_remove, paths(&["etc/foo.conf"]));
    assert_eq!(report.changes.user_remove, paths(&["etc/foo.conf"]));
    assert!(fixture.tracked("vendor").is_empty());
    assert!(fixture.tracked("user").is_empty());
}

#[test]
fn test_cursor_never_decreases() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=2\n");
    fixture.add_package("foo", "2.0-1", &[("etc/foo.conf", "foo=2\n")]);
    fixture.create();
    let cursor = fixture.show("cursor", "cursors/foo");

    // An older archive showing up later is not scanned.
    fixture.add_package_at("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")], 1_500_000_000);
    let report = fixture.update();

    assert!(report.packages.is_empty());
    assert_eq!(fixture.show("cursor", "cursors/foo"), cursor);
    assert_eq!(fixture.show("vendor", "etc/foo.conf"), "foo=2\n");
}

#[test]
fn test_dry_run_changes_nothing() {
    let mut fixture = Fixture::new();
    fixture.create();
    fixture.write_live("etc/foo.conf", "foo=1\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);
    let vendor_head = fixture.git(&["rev-parse", "vendor"]);

    let report = fixture.try_update(true).unwrap();

    assert!(report.dry_run);
    assert_eq!(report.changes.vendor_add, paths(&["etc/foo.conf"]));
    assert_eq!(fixture.git(&["rev-parse", "vendor"]), vendor_head);
    assert_eq!(
        fixture.branches(),
        ["cursor", "user", "vendor"].iter().map(|s| s.to_string()).collect()
    );

    let report = fixture.update();
    assert_eq!(report.changes.vendor_add, paths(&["etc/foo.conf"]));
}

#[test]
fn test_stale_staging_is_discarded() {
    let fixture = Fixture::new();
    fixture.create();
    fixture.git(&["branch", "vendor-staging", "vendor"]);
    assert_eq!(fixture.state(), WorkspaceState::Staged);

    let report = fixture.update();

    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.message.contains("discarding")));
    assert_eq!(fixture.state(), WorkspaceState::Idle);
}

#[test]
fn test_sync_without_pending_merge() {
    let fixture = Fixture::new();
    fixture.create();

    let mut workspace = Workspace::open(&fixture.config).unwrap();
    let report = workspace.sync(false).unwrap();
    assert!(report.commit.is_none());

    fixture.git(&["branch", "user-staging", "user"]);
    let result = workspace.sync(false);
    assert!(matches!(result, Err(Error::NoPendingMerge { .. })));
}

#[test]
fn test_diff_lists_untracked_live_files() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "foo=1\n");
    fixture.write_live("etc/hostname", "box\n");
    fixture.write_live("etc/foo.conf.pacnew", "foo=2\n");
    fixture.write_live("etc/ssl/certs/ca.pem", "cert\n");
    fixture.write_live("etc/passwd", "root:x:0:0\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);
    fixture.create();

    let workspace = Workspace::open(&fixture.config).unwrap();
    let files = workspace.diff(false).unwrap();
    assert_eq!(files, vec![PathBuf::from("etc/hostname")]);
}

#[test]
fn test_excluded_package_files_are_not_extracted() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/passwd", "root:x:0:0\n");
    fixture.write_live("etc/filesystem.conf", "fs\n");
    fixture.add_package(
        "filesystem",
        "2024.01-1",
        &[("etc/passwd", "root:x:0:0\n"), ("etc/filesystem.conf", "fs\n")],
    );

    let report = fixture.create();

    assert_eq!(report.changes.vendor_add, paths(&["etc/filesystem.conf"]));
    assert_eq!(fixture.tracked("vendor"), vec!["etc/filesystem.conf"]);
    assert!(fixture.root.join("etc/passwd").exists());
}

#[test]
fn test_escaping_symlink_with_repository_deeper_than_root() {
    let mut fixture = Fixture::with_repo("a/b/c/repo");
    symlink("../../../outside", fixture.root.join("etc/link")).unwrap();
    fixture.add_package("link", "1.0-1", &[("etc/link", "regular\n")]);

    let report = fixture.create();
    assert_eq!(report.changes.user_add, paths(&["etc/link"]));
    let user_head = fixture.git(&["rev-parse", "user"]);

    let report = fixture.update();
    assert!(report.changes.is_empty());
    assert_eq!(fixture.git(&["rev-parse", "user"]), user_head);
    assert_eq!(fixture.state(), WorkspaceState::Idle);
}

#[test]
fn test_hard_link_to_file_outside_etc() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", "shared\n");
    fixture.add_package_with_links(
        "foo",
        "1.0-1",
        &[("usr/share/foo/foo.conf", "shared\n")],
        &[("etc/foo.conf", "usr/share/foo/foo.conf")],
    );

    let report = fixture.create();

    assert_eq!(report.changes.vendor_add, paths(&["etc/foo.conf"]));
    assert!(report.changes.user_add.is_empty());
    assert_eq!(fixture.tracked("vendor"), vec!["etc/foo.conf"]);
    assert_eq!(fixture.show("vendor", "etc/foo.conf"), "shared\n");
}

/// A workspace where the next update conflicts on `etc/foo.conf`.
fn conflicting_fixture() -> Fixture {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", BASE);
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", BASE)]);
    fixture.create();

    fixture.write_live("etc/foo.conf", &replace_line(BASE, 5, "user"));
    fixture.update();
    fixture.add_package("foo", "1.1-1", &[("etc/foo.conf", &replace_line(BASE, 5, "vendor"))]);
    fixture
}

#[test]
fn test_dry_run_reports_conflict_and_discards_staging() {
    let fixture = conflicting_fixture();
    let vendor_head = fixture.git(&["rev-parse", "vendor"]);
    let cursor_head = fixture.git(&["rev-parse", "cursor"]);

    let report = fixture.try_update(true).unwrap();

    assert!(report.dry_run);
    assert_eq!(report.changes.needs_merge, paths(&["etc/foo.conf"]));
    match &report.outcome {
        PassOutcome::Conflicted { paths, .. } => {
            assert_eq!(paths, &vec![PathBuf::from("etc/foo.conf")]);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
    assert_eq!(fixture.state(), WorkspaceState::Idle);
    assert_eq!(
        fixture.branches(),
        ["cursor", "user", "vendor"].iter().map(|s| s.to_string()).collect()
    );
    assert_eq!(fixture.git(&["rev-parse", "vendor"]), vendor_head);
    assert_eq!(fixture.git(&["rev-parse", "cursor"]), cursor_head);
    assert_eq!(fixture.read_live("etc/foo.conf"), replace_line(BASE, 5, "user"));
}

#[test]
fn test_sync_dry_run_copies_nothing() {
    let mut fixture = Fixture::new();
    fixture.write_live("etc/foo.conf", BASE);
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", BASE)]);
    fixture.create();
    let user_version = replace_line(BASE, 1, "user");
    fixture.write_live("etc/foo.conf", &user_version);
    fixture.update();
    fixture.add_package("foo", "1.1-1", &[("etc/foo.conf", &replace_line(BASE, 10, "vendor"))]);
    let report = fixture.update();
    assert!(matches!(report.outcome, PassOutcome::PendingSync { .. }));
    let pending = fixture.state();

    let mut workspace = Workspace::open(&fixture.config).unwrap();
    let preview = workspace.sync(true).unwrap();
    workspace.close().unwrap();

    assert!(preview.dry_run);
    match &pending {
        WorkspaceState::PendingMerge { commit } => assert_eq!(preview.commit.as_ref(), Some(commit)),
        other => panic!("expected a pending merge, got {:?}", other),
    }
    assert_eq!(preview.synced, vec![PathBuf::from("etc/foo.conf")]);
    assert_eq!(fixture.read_live("etc/foo.conf"), user_version);
    assert_eq!(fixture.state(), pending);

    assert_eq!(fixture.sync(), vec![PathBuf::from("etc/foo.conf")]);
    assert_eq!(fixture.state(), WorkspaceState::Idle);
}

#[test]
fn test_empty_cherry_pick_is_refused() {
    let fixture = conflicting_fixture();
    let report = fixture.update();
    assert!(matches!(report.outcome, PassOutcome::Conflicted { .. }));

    // Resolving the conflict with the user version leaves nothing to commit.
    fixture.git(&["checkout", "HEAD", "--", "etc/foo.conf"]);

    match Workspace::open(&fixture.config) {
        Err(Error::EmptyCherryPick { remedy }) => {
            assert!(remedy.ends_with(" reset"));
        }
        Err(other) => panic!("expected an empty cherry-pick, got {:?}", other),
        Ok(_) => panic!("expected an empty cherry-pick"),
    }

    fixture.git(&["reset", "--quiet"]);
    assert!(Workspace::open(&fixture.config).is_ok());
}

#[test]
fn test_two_merge_commits_are_ambiguous() {
    let fixture = Fixture::new();
    fixture.create();
    let origin = fixture.git(&["rev-parse", "user"]);
    let trailer = format!("(cherry picked from commit {})", origin.trim());

    fixture.git(&["checkout", "--quiet", "-b", "user-staging", "user"]);
    for _ in 0..2 {
        fixture.git(&["commit", "--quiet", "--allow-empty", "-m", "Merge", "-m", &trailer]);
    }
    fixture.git(&["checkout", "--quiet", "user"]);

    let result = Workspace::status(&fixture.config);
    assert!(matches!(result, Err(Error::AmbiguousMerge { count: 2, .. })));

    let mut workspace = Workspace::open(&fixture.config).unwrap();
    let result = workspace.sync(false);
    assert!(matches!(result, Err(Error::AmbiguousMerge { count: 2, .. })));
}

#[test]
fn test_failed_pass_leaves_clean_working_tree() {
    let mut fixture = Fixture::new();
    fixture.create();
    fixture.write_live("etc/foo.conf", "foo=1\n");
    fixture.add_package("foo", "1.0-1", &[("etc/foo.conf", "foo=1\n")]);
    fs::write(fixture.cache.join("broken-1.0-1-x86_64.pkg.tar.zst"), "not zstd").unwrap();

    let err = fixture.try_update(false).unwrap_err();
    assert!(matches!(err, Error::Archive { .. }));
    assert!(fixture.git(&["status", "--porcelain"]).is_empty());

    fs::remove_file(fixture.cache.join("broken-1.0-1-x86_64.pkg.tar.zst")).unwrap();
    let report = fixture.update();
    assert!(report.diagnostics.iter().any(|d| d.message.contains("discarding")));
    assert_eq!(report.changes.vendor_add, paths(&["etc/foo.conf"]));
    assert_eq!(fixture.state(), WorkspaceState::Idle);
}
