//! Filesystem helpers shared by the unit and gateway managers.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::Result;

/// Atomically replace `path` with `content`: write to a temp sibling in the
/// same directory, fsync, set `mode`, then rename over the target. Readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, content: &str, mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pockestrator".into())
    ));

    let mut file = File::create(&tmp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Probe that `dir` is writable by creating and removing a marker file.
/// Creates the directory first when missing.
pub fn check_dir_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(".write_test");
    File::create(&probe)?;
    fs::remove_file(&probe)?;
    Ok(())
}

/// Probe that an existing regular file can be opened for writing.
pub fn check_file_writable(path: &Path) -> std::io::Result<()> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not a regular file: {}", path.display()),
        ));
    }
    OpenOptions::new().append(true).open(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_sets_content_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.service");

        write_atomic(&path, "[Unit]\n", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Unit]\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        // Overwrite replaces content and leaves no temp file behind.
        write_atomic(&path, "[Unit]\nDescription = x\n", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Unit]\nDescription = x\n");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn writable_probes() {
        let dir = tempfile::tempdir().unwrap();
        check_dir_writable(dir.path()).unwrap();
        // Probe creates missing directories.
        check_dir_writable(&dir.path().join("nested/deeper")).unwrap();

        let file = dir.path().join("config");
        fs::write(&file, "x").unwrap();
        check_file_writable(&file).unwrap();
        assert!(check_file_writable(&dir.path().join("missing")).is_err());
    }
}
