use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::unistd::{chown, Gid, Uid};
use std::io::{ErrorKind, Result};
use std::path::Path;

/// Creates `path` owned by `uid:gid` with mode 0770, replacing any stale
/// directory left over from an earlier step.
pub fn mkdir(path: &Path, uid: u32, gid: u32) -> Result<()> {
    log::debug!("mkdir(path: {:?}, uid: {}, gid: {})", path, uid, gid);
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => rmdir_recursively(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    std::fs::create_dir(path)?;
    // umask may have stripped group bits
    fchmodat(None, path, Mode::from_bits_truncate(0o770), FchmodatFlags::FollowSymlink)?;
    let (uid, gid) = (Uid::from_raw(uid), Gid::from_raw(gid));
    if Uid::effective() != uid || Gid::effective() != gid {
        chown(path, Some(uid), Some(gid))?;
    }
    Ok(())
}

/// Removes `path` and everything below it. A missing directory is not an
/// error.
pub fn rmdir_recursively(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod test {
    use crate::dir::*;
    use std::os::unix::fs::PermissionsExt;

    fn scratch(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("stepio-{}-{}", name, std::process::id()));
        let _ = rmdir_recursively(&path);
        path
    }

    #[test]
    fn replaces_stale_dir() {
        let path = scratch("stale");
        std::fs::create_dir_all(path.join("left/over")).unwrap();
        std::fs::write(path.join("left/over/sock"), b"x").unwrap();

        mkdir(&path, Uid::effective().as_raw(), Gid::effective().as_raw()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o770);
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);

        rmdir_recursively(&path).unwrap();
        assert!(!path.exists());
        rmdir_recursively(&path).unwrap();
    }
}
