use std::fs;
use std::path::Path;

use ojsup_core::{parse_release_version, Settings, UpgradeError};

use super::*;

fn test_settings(releases_dir: &Path) -> Settings {
    let raw = format!(
        r#"
owner = "www-data"
group = "www-data"
locations = ["dbscripts", "tools"]
version_file = "dbscripts/xml/version.xml"
config_file = "config.inc.php"
releases_dir = "{}"
backup_dir = "/srv/backup"
db_backup_dir = "/srv/backup/db"
www_backup_dir = "/srv/backup/www"
files_backup_dir = "/srv/backup/files"
timestamp_format = "%Y-%m-%d_%H-%M-%S"
suffix_new = ".new"
"#,
        releases_dir.display()
    );
    Settings::from_toml_str(&raw).expect("settings should parse")
}

fn write_release(root: &Path, dir_name: &str, release: &str) {
    let tree = root.join(dir_name);
    fs::create_dir_all(tree.join("dbscripts/xml")).expect("create dbscripts");
    fs::create_dir_all(tree.join("tools")).expect("create tools");
    fs::write(
        tree.join("dbscripts/xml/version.xml"),
        format!(
            "<version>\n  <application>ojs2</application>\n  <release>{release}</release>\n</version>\n"
        ),
    )
    .expect("write descriptor");
}

#[test]
fn discover_sorts_by_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.4.0", "3.4.0");
    write_release(dir.path(), "ojs-3.2.0", "3.2.0");
    write_release(dir.path(), "ojs-3.3.0", "3.3.0");

    let settings = test_settings(dir.path());
    let candidates = discover_candidates(&settings).expect("must discover");
    let versions: Vec<String> = candidates
        .iter()
        .map(|candidate| candidate.version.to_string())
        .collect();
    assert_eq!(versions, vec!["3.2.0", "3.3.0", "3.4.0"]);
}

#[test]
fn discover_skips_malformed_descriptor() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.4.0", "3.4.0");
    write_release(dir.path(), "ojs-broken", "not-a-version");

    let settings = test_settings(dir.path());
    let candidates = discover_candidates(&settings).expect("scan must survive bad candidate");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].version.to_string(), "3.4.0");
}

#[test]
fn discover_skips_non_release_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.4.0", "3.4.0");
    fs::create_dir_all(dir.path().join("lost+found")).expect("create dir");

    let settings = test_settings(dir.path());
    let candidates = discover_candidates(&settings).expect("must discover");
    assert_eq!(candidates.len(), 1);
}

#[test]
fn discover_fails_when_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = test_settings(dir.path());
    let err = discover_candidates(&settings).expect_err("empty root should fail");
    assert!(matches!(err, UpgradeError::NoCandidateFound { .. }));
}

#[test]
fn discover_fails_on_missing_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = test_settings(&dir.path().join("does-not-exist"));
    let err = discover_candidates(&settings).expect_err("missing root should fail");
    assert!(matches!(err, UpgradeError::NoCandidateFound { .. }));
}

#[test]
fn discover_rejects_duplicate_versions() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.4.0", "3.4.0");
    write_release(dir.path(), "ojs-3.4.0-copy", "3.4.0");

    let settings = test_settings(dir.path());
    let err = discover_candidates(&settings).expect_err("duplicate versions are ambiguous");
    assert!(matches!(err, UpgradeError::MalformedVersion(_)));
    assert!(err.to_string().contains("ambiguous"));
}

#[test]
fn select_highest_by_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.2.0", "3.2.0");
    write_release(dir.path(), "ojs-3.4.0", "3.4.0");
    write_release(dir.path(), "ojs-3.4.0-dev", "3.5.0-dev");

    let settings = test_settings(dir.path());
    let candidates = discover_candidates(&settings).expect("must discover");
    let chosen = select_candidate(&candidates, None).expect("must select");
    // A pre-release still counts as strictly greater than 3.4.0.
    assert_eq!(chosen.version.to_string(), "3.5.0-dev");
}

#[test]
fn select_forced_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.2.0", "3.2.0");
    write_release(dir.path(), "ojs-3.4.0", "3.4.0");

    let settings = test_settings(dir.path());
    let candidates = discover_candidates(&settings).expect("must discover");

    let target = parse_release_version("3.2.0").expect("must parse");
    let chosen = select_candidate(&candidates, Some(&target)).expect("must select");
    assert_eq!(chosen.version.to_string(), "3.2.0");

    let missing = parse_release_version("3.9.0").expect("must parse");
    let err = select_candidate(&candidates, Some(&missing)).expect_err("must fail");
    assert!(matches!(err, UpgradeError::MalformedVersion(_)));
}

#[test]
fn upgrade_needed_gate() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_release(dir.path(), "ojs-3.2.0", "3.2.0");
    let settings = test_settings(dir.path());
    let candidates = discover_candidates(&settings).expect("must discover");
    let chosen = select_candidate(&candidates, None).expect("must select");

    let current = parse_release_version("3.2.0").expect("must parse");
    let err = check_upgrade_needed(&current, chosen, false).expect_err("equal version must halt");
    assert!(matches!(err, UpgradeError::NoUpgradeNeeded { .. }));

    check_upgrade_needed(&current, chosen, true).expect("force must override the gate");

    let older = parse_release_version("3.1.0").expect("must parse");
    check_upgrade_needed(&older, chosen, false).expect("newer target must pass");
}
