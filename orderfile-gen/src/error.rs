use std::{io, path::PathBuf};

use orderfile_mobile::{
    android::{device, emulator},
    env, exec,
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),
    #[error("Failed to load settings from {}: {message}", .path.display())]
    Settings { path: PathBuf, message: String },
    #[error(transparent)]
    Command(#[from] exec::Error),
    #[error(transparent)]
    Device(#[from] device::Error),
    #[error(transparent)]
    Emulator(#[from] emulator::Error),
    #[error(transparent)]
    Env(#[from] env::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Profile(String),
    #[error("{tool} produced unusable output: {message}")]
    ToolOutput { tool: String, message: String },
    #[error("Build server `{pattern}` still running after SIGINT")]
    BuildServerStuck { pattern: String },
    #[error("Symbol order in {} doesn't match {}", .library.display(), .orderfile.display())]
    VerificationFailed {
        library: PathBuf,
        orderfile: PathBuf,
    },
}

impl Error {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => 2,
            _ => 1,
        }
    }

    /// Output of the subprocess behind this failure, if any was captured.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::Command(err) => err.captured_output(),
            Self::Device(device::Error::InstallFailed { source, .. })
            | Self::Device(device::Error::LaunchFailed { source, .. }) => source.captured_output(),
            Self::Emulator(emulator::Error::Command(err)) => err.captured_output(),
            _ => None,
        }
    }
}

pub(crate) trait IoResultExt<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: context(),
            source,
        })
    }
}
