//! The output file: a temp file sized up front, mmapped, filled in by the chunk writers, then
//! atomically renamed over the destination. On a fatal error the temp file is unlinked.

use crate::error::Result;
use anyhow::Context as _;
use memmap2::MmapMut;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

static TEMP_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub(crate) struct OutputFile {
    pub(crate) buffer: MmapMut,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl OutputFile {
    pub(crate) fn create(path: &Path, size: u64) -> Result<OutputFile> {
        let file_name = path
            .file_name()
            .context("output path has no file name")?
            .to_string_lossy();
        let temp_path = path.with_file_name(format!(".{file_name}.{}", std::process::id()));

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("cannot create {}", temp_path.display()))?;
        file.set_len(size)
            .with_context(|| format!("cannot resize {}", temp_path.display()))?;

        // Freshly extended file bytes read as zero, so gaps between chunks need no explicit
        // clearing.
        let buffer = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("cannot mmap {}", temp_path.display()))?;

        *TEMP_PATH.lock().unwrap() = Some(temp_path.clone());

        Ok(OutputFile {
            buffer,
            temp_path,
            final_path: path.to_owned(),
        })
    }

    /// Flushes and renames the temp file over the destination, marking it executable.
    pub(crate) fn commit(self, executable: bool) -> Result {
        use std::os::unix::fs::PermissionsExt as _;

        self.buffer.flush().context("cannot flush output")?;
        drop(self.buffer);

        let mode = if executable { 0o775 } else { 0o664 };
        std::fs::set_permissions(&self.temp_path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("cannot chmod {}", self.temp_path.display()))?;
        std::fs::rename(&self.temp_path, &self.final_path).with_context(|| {
            format!(
                "cannot rename {} to {}",
                self.temp_path.display(),
                self.final_path.display()
            )
        })?;
        *TEMP_PATH.lock().unwrap() = None;
        Ok(())
    }
}

/// Called from the fatal-error path: don't leave a partially written temp file behind.
pub(crate) fn remove_temporary_output() {
    if let Ok(mut guard) = TEMP_PATH.lock() {
        if let Some(path) = guard.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
