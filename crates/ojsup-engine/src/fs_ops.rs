use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Recursive copy preserving unix permissions and symlink semantics (links
/// are recreated, never followed).
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow!("not a directory: {}", src.display()));
    }

    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    fs::set_permissions(dst, metadata.permissions())
        .with_context(|| format!("failed to set permissions on {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;

        if metadata.file_type().is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        } else if metadata.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
        }
    }
    Ok(())
}

pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target =
        fs::read_link(src).with_context(|| format!("failed to read symlink {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dst).with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            dst.display(),
            target.display()
        )
    })?;
    Ok(())
}

/// Copy a single path of any kind: file, directory tree, or symlink.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;
    if metadata.file_type().is_symlink() {
        copy_symlink(src, dst)
    } else if metadata.is_dir() {
        copy_tree(src, dst)
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(src, dst)
            .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
        Ok(())
    }
}

/// Total size in bytes of all regular files under a path. Symlinks count as
/// their own length, not their target's.
pub fn tree_size(path: &Path) -> Result<u64> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for entry in
        fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?
    {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display()))?;
    } else {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display()))?;
    }
    Ok(())
}

/// Append a suffix to the final path component: `config.inc.php` + `.new`
/// becomes `config.inc.php.new`.
pub fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Rename a path out of the way by appending the suffix, returning the new
/// location.
pub fn move_aside(path: &Path, suffix: &str) -> Result<PathBuf> {
    let target = path_with_suffix(path, suffix);
    fs::rename(path, &target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            path.display(),
            target.display()
        )
    })?;
    Ok(target)
}

/// Byte-level comparison, length first to avoid reading unchanged large
/// files in full when sizes already differ.
pub fn files_differ(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::metadata(a).with_context(|| format!("failed to stat {}", a.display()))?;
    let meta_b = fs::metadata(b).with_context(|| format!("failed to stat {}", b.display()))?;
    if meta_a.len() != meta_b.len() {
        return Ok(true);
    }
    let data_a = fs::read(a).with_context(|| format!("failed to read {}", a.display()))?;
    let data_b = fs::read(b).with_context(|| format!("failed to read {}", b.display()))?;
    Ok(data_a != data_b)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{copy_tree, files_differ, move_aside, path_with_suffix, tree_size};

    #[test]
    fn copy_tree_preserves_symlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("inner")).expect("create tree");
        fs::write(src.join("inner/file.txt"), b"payload").expect("write file");
        std::os::unix::fs::symlink("inner/file.txt", src.join("link")).expect("create symlink");

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).expect("must copy");

        assert_eq!(
            fs::read(dst.join("inner/file.txt")).expect("read copy"),
            b"payload"
        );
        let link = fs::read_link(dst.join("link")).expect("read link");
        assert_eq!(link, Path::new("inner/file.txt"));
    }

    #[test]
    fn tree_size_sums_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("a/b")).expect("create tree");
        fs::write(dir.path().join("a/one"), vec![0u8; 10]).expect("write file");
        fs::write(dir.path().join("a/b/two"), vec![0u8; 32]).expect("write file");
        assert_eq!(tree_size(&dir.path().join("a")).expect("must size"), 42);
    }

    #[test]
    fn suffix_and_move_aside() {
        assert_eq!(
            path_with_suffix(Path::new("/x/config.inc.php"), ".new"),
            Path::new("/x/config.inc.php.new")
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("file.txt");
        fs::write(&file, b"old").expect("write file");
        let moved = move_aside(&file, ".new").expect("must move");
        assert!(!file.exists());
        assert_eq!(fs::read(moved).expect("read moved"), b"old");
    }

    #[test]
    fn files_differ_compares_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").expect("write a");
        fs::write(&b, b"same").expect("write b");
        assert!(!files_differ(&a, &b).expect("must compare"));
        fs::write(&b, b"diff").expect("rewrite b");
        assert!(files_differ(&a, &b).expect("must compare"));
    }
}
