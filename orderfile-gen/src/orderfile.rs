//! Orderfile Writer/Patcher and the scoped "no orderfile" backup.
//!
//! Every write goes to a temporary sibling that is then renamed over the
//! destination, so a reader never sees a half-written orderfile.

use std::{
    collections::HashSet,
    ffi::OsString,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tempfile::NamedTempFile;

use crate::error::{IoResultExt, Result};

fn write_atomically(path: &Path, lines: &[&str]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).io_context(|| format!("Failed to create {}", dir.display()))?;
    let mut file = NamedTempFile::new_in(dir)
        .io_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
    for line in lines {
        writeln!(file, "{line}").io_context(|| format!("Failed to write {}", path.display()))?;
    }
    file.persist(path)
        .map_err(|err| err.error)
        .io_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).io_context(|| format!("Failed to read {}", path.display()))
}

/// Copies `src` to `dst` without blank lines. Kept lines are written as they
/// are. A symbol listed more than once keeps its first position. `src` and
/// `dst` may be the same file.
pub fn remove_blank_lines(src: &Path, dst: &Path) -> Result<()> {
    let contents = read(src)?;
    let mut seen = HashSet::new();
    let lines = contents
        .lines()
        .filter(|line| {
            let symbol = line.trim();
            !symbol.is_empty() && seen.insert(symbol)
        })
        .collect::<Vec<_>>();
    log::debug!(
        "{} symbols from {} written to {}",
        lines.len(),
        src.display(),
        dst.display()
    );
    write_atomically(dst, &lines)
}

/// Moves `anchors` to the end of the orderfile, in order.
pub fn add_anchor_symbols(path: &Path, anchors: &[String]) -> Result<()> {
    let contents = read(path)?;
    let lines = contents
        .lines()
        .filter(|line| {
            !line.trim().is_empty() && !anchors.iter().any(|anchor| anchor.as_str() == *line)
        })
        .chain(anchors.iter().map(String::as_str))
        .collect::<Vec<_>>();
    write_atomically(path, &lines)
}

/// While alive, the orderfile at `path` is empty and its previous content
/// sits in a `.backup` sibling. Dropping (or [`restore`](Self::restore))
/// puts the original back and bumps its mtime so the next build relinks.
#[derive(Debug)]
pub struct OrderfileBackup {
    path: PathBuf,
    backup: PathBuf,
    /// Whether there was a file to back up.
    had_original: bool,
    restored: bool,
}

impl OrderfileBackup {
    pub fn empty(path: &Path) -> Result<Self> {
        let mut name = path.file_name().map(OsString::from).unwrap_or_default();
        name.push(".backup");
        let backup = path.with_file_name(name);

        let had_original = path.exists();
        if had_original {
            fs::rename(path, &backup).io_context(|| {
                format!("Failed to move {} to {}", path.display(), backup.display())
            })?;
        }
        let guard = Self {
            path: path.to_path_buf(),
            backup,
            had_original,
            restored: false,
        };
        File::create(path).io_context(|| format!("Failed to empty {}", path.display()))?;
        log::info!("{} emptied for the baseline", path.display());
        Ok(guard)
    }

    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.put_back()
    }

    fn put_back(&self) -> Result<()> {
        if !self.had_original {
            return fs::remove_file(&self.path)
                .io_context(|| format!("Failed to remove {}", self.path.display()));
        }
        fs::rename(&self.backup, &self.path).io_context(|| {
            format!(
                "Failed to restore {} from {}",
                self.path.display(),
                self.backup.display()
            )
        })?;
        File::options()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .io_context(|| format!("Failed to touch {}", self.path.display()))?;
        log::info!("{} restored", self.path.display());
        Ok(())
    }
}

impl Drop for OrderfileBackup {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Err(err) = self.put_back() {
            log::error!("{err}");
        }
    }
}
