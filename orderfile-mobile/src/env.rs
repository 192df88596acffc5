use std::{
    env,
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "Couldn't find `adb`. Pass --adb-path, set ANDROID_HOME, or put platform-tools on PATH."
    )]
    AdbNotFound,
    #[error("{0} doesn't exist")]
    AdbMissing(PathBuf),
}

/// Where the Android SDK tools live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Env {
    adb: PathBuf,
    emulator: PathBuf,
}

impl Env {
    /// Resolves `adb` from an explicit path, then `$ANDROID_HOME`
    /// (or `$ANDROID_SDK_ROOT`), then `PATH`.
    pub fn new(adb_path: Option<&Path>) -> Result<Self, Error> {
        let sdk_root = android_home();
        let adb = match adb_path {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => return Err(Error::AdbMissing(path.to_path_buf())),
            None => sdk_root
                .as_ref()
                .map(|root| root.join("platform-tools").join("adb"))
                .filter(|path| path.is_file())
                .or_else(|| which::which("adb").ok())
                .ok_or(Error::AdbNotFound)?,
        };
        let emulator = sdk_root
            .map(|root| root.join("emulator").join("emulator"))
            .filter(|path| path.is_file())
            .or_else(|| which::which("emulator").ok())
            .unwrap_or_else(|| PathBuf::from("emulator"));
        log::debug!(
            "using adb at {} and emulator at {}",
            adb.display(),
            emulator.display()
        );
        Ok(Self { adb, emulator })
    }

    /// An environment with fixed tool paths, no lookup.
    pub fn with_tools(adb: impl Into<PathBuf>, emulator: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            emulator: emulator.into(),
        }
    }

    pub fn adb(&self) -> &Path {
        &self.adb
    }

    pub fn emulator(&self) -> &Path {
        &self.emulator
    }
}

fn android_home() -> Option<PathBuf> {
    ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
        .into_iter()
        .filter_map(env::var_os)
        .map(PathBuf::from)
        .find(|path| path.is_dir())
}
