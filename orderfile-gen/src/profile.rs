//! Profile Collector: runs stories against an instrumented build and pulls
//! the per-run offset profiles to a host directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use globset::GlobBuilder;
use ignore::WalkBuilder;
use orderfile_mobile::{Invocation, Runner, android::Device};
use tempfile::TempDir;

use crate::error::{Error, IoResultExt, Result};

/// What the profile tool should drive.
#[derive(Debug, Clone, Copy)]
pub enum ProfileTarget<'a> {
    /// An installed WebView, exercised through this APK.
    Apk(&'a Path),
    /// A browser identifier understood by the harness.
    Browser(&'a str),
}

/// Owns the host directory profiles are pulled into. The directory is
/// removed on drop unless `keep` was requested.
pub struct ProfileCollector<'a> {
    runner: &'a dyn Runner,
    tool: PathBuf,
    verbosity: u8,
    dir: Option<TempDir>,
    keep: bool,
}

impl<'a> ProfileCollector<'a> {
    pub fn new(runner: &'a dyn Runner, tool: PathBuf, verbosity: u8, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("profile_data")
            .tempdir()
            .io_context(|| "Failed to create the profile directory".to_string())?;
        Ok(Self {
            runner,
            tool,
            verbosity,
            dir: Some(dir),
            keep,
        })
    }

    pub fn dir(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Runs every story once and returns the pulled profile files.
    pub fn collect(
        &self,
        target: ProfileTarget<'_>,
        device: &Device,
        stories: &[String],
    ) -> Result<Vec<PathBuf>> {
        let dir = self.dir();
        let mut cmd = Invocation::new(&self.tool)
            .arg("--output-directory")
            .arg(dir)
            .args(["--device", device.serial_no()]);
        cmd = match target {
            ProfileTarget::Apk(apk) => cmd.arg("--apk-path").arg(apk),
            ProfileTarget::Browser(id) => cmd.args(["--browser", id]),
        };
        for _ in 0..self.verbosity {
            cmd = cmd.arg("-v");
        }
        cmd = cmd.arg("--stories").args(stories.iter());

        log::info!("profiling {} stories on {device}", stories.len());
        self.runner.run(&cmd)?;

        let files = list_files(dir);
        if files.is_empty() {
            return Err(Error::Profile(format!(
                "{} pulled no profiles into {}",
                self.tool.display(),
                dir.display()
            )));
        }
        log::info!("collected {} profiles", files.len());
        Ok(files)
    }
}

impl Drop for ProfileCollector<'_> {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if self.keep {
            let kept = dir.keep();
            log::info!("profile data kept in {}", kept.display());
        }
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = WalkBuilder::new(dir)
        .standard_filters(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    files.sort();
    files
}

/// The directory a glob can be walked from: its leading components up to
/// the first one with a wildcard.
fn walk_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    let parts = pattern.split('/').collect::<Vec<_>>();
    for part in &parts[..parts.len().saturating_sub(1)] {
        if part.contains(['*', '?', '[', '{']) {
            break;
        }
        if part.is_empty() {
            if root.as_os_str().is_empty() {
                root.push("/");
            }
            continue;
        }
        root.push(part);
    }
    root
}

/// Files matching `pattern`, sorted. No match is an error.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| Error::Configuration(format!("Invalid profile glob {pattern:?}: {err}")))?
        .compile_matcher();

    let root = walk_root(pattern);
    let relative = root.as_os_str().is_empty();
    let walk_from = if relative { Path::new(".") } else { root.as_path() };

    let mut files = WalkBuilder::new(walk_from)
        .standard_filters(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .map(|entry| entry.into_path())
        .filter(|path| {
            let candidate = if relative {
                path.strip_prefix(".").unwrap_or(path)
            } else {
                path
            };
            matcher.is_match(candidate)
        })
        .collect::<Vec<_>>();
    files.sort();

    if files.is_empty() {
        return Err(Error::Profile(format!(
            "No pregenerated profiles match {pattern:?}"
        )));
    }
    log::info!("using {} pregenerated profiles", files.len());
    Ok(files)
}

/// Copies `files` into `dir`, creating it.
pub fn save_profiles(files: &[PathBuf], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).io_context(|| format!("Failed to create {}", dir.display()))?;
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let dst = dir.join(name);
        fs::copy(file, &dst).io_context(|| {
            format!("Failed to copy {} to {}", file.display(), dst.display())
        })?;
    }
    log::info!("saved {} profiles to {}", files.len(), dir.display());
    Ok(())
}
