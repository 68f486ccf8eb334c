use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Write `data` to `path` through a temp file in the same directory, then
/// rename it over the target. Readers see the old file or the new one, never
/// a partial write.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(data)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|meta| meta.permissions().mode())
            .unwrap_or(0o600);
        let _ = temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(mode));
    }

    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
