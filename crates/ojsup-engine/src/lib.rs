//! Execution engine for the upgrade transaction: pre-flight auditing,
//! privilege handling, backups, migration, rollback, and the orchestrator
//! that sequences them under an instance lock.

pub mod audit;
pub mod backup;
pub mod command;
pub mod fs_ops;
pub mod lockfile;
pub mod migrate;
pub mod privileges;
pub mod rollback;
pub mod term;
pub mod upgrade;

pub use audit::{audit, AccessMode, AuditPath, AuditReport, SpaceCheck};
pub use backup::{BackupManager, BackupSet};
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use lockfile::InstanceLock;
pub use migrate::MigrationEngine;
pub use privileges::{apply_boundary, PrivilegeBoundary, SystemPrivilegeBoundary};
pub use rollback::RollbackCoordinator;
pub use term::{cleanup_on_termination, install_termination_handler, CleanupGuard};
pub use upgrade::{Orchestrator, UpgradeOptions, UpgradeOutcome, UpgradePhase};

#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap};
    use std::ffi::OsString;
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use ojsup_core::{Settings, UpgradeError};

    use crate::command::{CommandOutput, CommandRunner};
    use crate::privileges::PrivilegeBoundary;

    /// Scripted command runner. Responses are keyed by the program's file
    /// name; anything unscripted succeeds with empty output.
    pub struct FakeRunner {
        calls: RefCell<Vec<(PathBuf, Vec<OsString>)>>,
        responses: RefCell<HashMap<String, CommandOutput>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                responses: RefCell::new(HashMap::new()),
            }
        }

        pub fn respond_stdout(&self, program: &str, stdout: &[u8]) {
            self.responses.borrow_mut().insert(
                program.to_string(),
                CommandOutput {
                    status: 0,
                    stdout: stdout.to_vec(),
                    stderr: String::new(),
                },
            );
        }

        pub fn respond_failure(&self, program: &str, status: i32, stderr: &str) {
            self.responses.borrow_mut().insert(
                program.to_string(),
                CommandOutput {
                    status,
                    stdout: Vec::new(),
                    stderr: stderr.to_string(),
                },
            );
        }

        pub fn calls(&self) -> Vec<(PathBuf, Vec<OsString>)> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &Path, args: &[OsString]) -> Result<CommandOutput> {
            self.calls
                .borrow_mut()
                .push((program.to_path_buf(), args.to_vec()));
            let key = program
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(self
                .responses
                .borrow()
                .get(&key)
                .cloned()
                .unwrap_or(CommandOutput {
                    status: 0,
                    stdout: Vec::new(),
                    stderr: String::new(),
                }))
        }
    }

    /// Boundary that never reports elevation, so tests exercise the skip
    /// path of the privilege policy.
    pub struct NoopBoundary;

    impl PrivilegeBoundary for NoopBoundary {
        fn is_elevated(&self) -> bool {
            false
        }

        fn drop_to(&self, owner: &str, group: &str) -> Result<(), UpgradeError> {
            Err(UpgradeError::PrivilegeDropFailed {
                owner: owner.to_string(),
                group: group.to_string(),
                detail: "not elevated".to_string(),
            })
        }
    }

    pub fn test_settings(base: &Path) -> Settings {
        let backup_dir = base.join("backup");
        let settings = Settings {
            owner: "www-data".to_string(),
            group: "www-data".to_string(),
            locations: vec![PathBuf::from("dbscripts"), PathBuf::from("tools")],
            version_file: PathBuf::from("dbscripts/xml/version.xml"),
            config_file: PathBuf::from("config.inc.php"),
            releases_dir: base.join("releases"),
            backup_dir: backup_dir.clone(),
            db_backup_dir: backup_dir.join("db"),
            www_backup_dir: backup_dir.join("www"),
            files_backup_dir: backup_dir.join("files"),
            run_dir: base.join("run"),
            temp_dir: base.join("tmp"),
            timestamp_format: "%Y-%m-%d_%H-%M-%S".to_string(),
            suffix_new: ".new".to_string(),
            mysql_dump: None,
            mysql: None,
            php_interpreter: None,
            disk_space_margin: 0,
            custom_files: BTreeMap::from([
                ("all".to_string(), vec![PathBuf::from("public")]),
                (
                    "journal-a".to_string(),
                    vec![PathBuf::from("plugins/themes/houseTheme")],
                ),
            ]),
        };

        for dir in [
            &settings.releases_dir,
            &settings.db_backup_dir,
            &settings.www_backup_dir,
            &settings.files_backup_dir,
            &settings.run_dir,
            &settings.temp_dir,
        ] {
            fs::create_dir_all(dir).expect("create fixture directory");
        }
        settings
    }

    /// Lay down a minimal live instance under `<base>/www/<name>`, with its
    /// submission tree under `<base>/files/<name>`.
    pub fn write_instance(base: &Path, name: &str, release: &str) -> PathBuf {
        let dir = base.join("www").join(name);
        let files_dir = base.join("files").join(name);
        for sub in ["dbscripts/xml", "tools", "lib", "public", "plugins/themes/houseTheme"] {
            fs::create_dir_all(dir.join(sub)).expect("create instance tree");
        }
        fs::create_dir_all(&files_dir).expect("create files tree");

        fs::write(
            dir.join("config.inc.php"),
            format!(
                "; operator notes survive rewrites\n\
                 [general]\n\
                 installed = On\n\
                 \n\
                 [database]\n\
                 driver = mysqli\n\
                 host = localhost\n\
                 username = ojs\n\
                 password = s3cret\n\
                 name = ojs_a\n\
                 \n\
                 [files]\n\
                 files_dir = {}\n",
                files_dir.display()
            ),
        )
        .expect("write config");
        write_version_xml(&dir, release);
        fs::write(dir.join("tools/upgrade.php"), "<?php // upgrade tool\n").expect("write tool");
        fs::write(dir.join("lib/code.php"), "<?php // old code\n").expect("write lib");
        fs::write(dir.join("public/index.html"), "old landing page\n").expect("write public");
        fs::write(
            dir.join("plugins/themes/houseTheme/theme.php"),
            "<?php // house theme\n",
        )
        .expect("write theme");
        fs::write(files_dir.join("submission1.pdf"), b"%PDF-1.4\n").expect("write submission");
        dir
    }

    /// Lay down an extracted release tree under the releases root.
    pub fn write_release(releases_dir: &Path, dirname: &str, release: &str) -> PathBuf {
        let dir = releases_dir.join(dirname);
        for sub in ["dbscripts/xml", "tools", "lib", "public"] {
            fs::create_dir_all(dir.join(sub)).expect("create release tree");
        }
        write_version_xml(&dir, release);
        fs::write(
            dir.join("config.TEMPLATE.inc.php"),
            "; fill in before installing\n[general]\ninstalled = Off\n",
        )
        .expect("write template");
        fs::write(
            dir.join("tools/upgrade.php"),
            format!("<?php // upgrade tool {release}\n"),
        )
        .expect("write tool");
        fs::write(
            dir.join("lib/code.php"),
            format!("<?php // release {release} code\n"),
        )
        .expect("write lib");
        fs::write(dir.join("public/index.html"), "release landing page\n")
            .expect("write public");
        dir
    }

    fn write_version_xml(root: &Path, release: &str) {
        fs::write(
            root.join("dbscripts/xml/version.xml"),
            format!(
                "<?xml version=\"1.0\"?>\n\
                 <version>\n\
                 \t<application>ojs2</application>\n\
                 \t<type>application</type>\n\
                 \t<release>{release}</release>\n\
                 \t<date>2024-01-01</date>\n\
                 \t<patch>0</patch>\n\
                 </version>\n"
            ),
        )
        .expect("write version descriptor");
    }
}
