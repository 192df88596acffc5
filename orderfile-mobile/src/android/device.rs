use std::{
    fmt::{self, Display},
    path::Path,
    time::Duration,
};

use thiserror::Error;

use crate::{
    Env, Runner,
    exec::{self, Invocation},
};

use super::adb::{self, get_prop};

/// Printed by the browser once it is past cold start.
pub const NATIVE_LIBRARY_LOADED: &str = "Successfully loaded native library";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to list devices: {0}")]
    DevicesFailed(#[from] adb::RunCheckedError),
    #[error("No healthy device with SDK level >= {min_sdk} is connected")]
    NoSuitableDevice { min_sdk: u32 },
    #[error("Failed to install with {script}: {source}")]
    InstallFailed {
        script: String,
        #[source]
        source: exec::Error,
    },
    #[error("Failed to launch with {script}: {source}")]
    LaunchFailed {
        script: String,
        #[source]
        source: exec::Error,
    },
}

#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[non_exhaustive]
pub enum ConnectionStatus {
    Connected,
    Offline,
    Unauthorized,
    Authorizing,
}

/// A physical device or emulator known to `adb`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Device {
    serial_no: String,
    status: ConnectionStatus,
    sdk_level: Option<u32>,
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial_no)?;
        if let Some(level) = self.sdk_level {
            write!(f, " (SDK {level})")?;
        }
        Ok(())
    }
}

impl Device {
    pub fn new(
        serial_no: impl Into<String>,
        status: ConnectionStatus,
        sdk_level: Option<u32>,
    ) -> Self {
        Self {
            serial_no: serial_no.into(),
            status,
            sdk_level,
        }
    }

    pub fn serial_no(&self) -> &str {
        &self.serial_no
    }

    pub fn sdk_level(&self) -> Option<u32> {
        self.sdk_level
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Every device `adb` knows about. SDK levels are only looked up for
/// connected devices; a failed lookup leaves the level unknown.
pub fn device_list(runner: &dyn Runner, env: &Env) -> Result<Vec<Device>, Error> {
    Ok(adb::device_list(runner, env)?
        .into_iter()
        .map(|(serial_no, status)| {
            let sdk_level = (status == ConnectionStatus::Connected)
                .then(|| get_prop::sdk_level(runner, env, &serial_no))
                .and_then(|level| level.inspect_err(|err| log::warn!("{err}")).ok());
            Device::new(serial_no, status, sdk_level)
        })
        .collect())
}

/// Picks the device to profile on. An explicit serial is used as is;
/// otherwise the first healthy device at or above `min_sdk` wins.
pub fn select_device(
    runner: &dyn Runner,
    env: &Env,
    serial_no: Option<&str>,
    min_sdk: u32,
) -> Result<Device, Error> {
    if let Some(serial_no) = serial_no {
        let sdk_level = get_prop::sdk_level(runner, env, serial_no)
            .inspect_err(|err| log::warn!("{err}"))
            .ok();
        return Ok(Device::new(serial_no, ConnectionStatus::Connected, sdk_level));
    }

    let device = device_list(runner, env)?
        .into_iter()
        .find(|device| {
            device.is_healthy() && device.sdk_level.is_some_and(|level| level >= min_sdk)
        })
        .ok_or(Error::NoSuitableDevice { min_sdk })?;
    log::info!("selected device {device}");
    Ok(device)
}

/// Installs through the build's wrapper script, then launches once with the
/// first-run experience disabled and waits (up to `warmup`) for the native
/// library to load so later runs don't pay for cold start.
pub fn install(
    runner: &dyn Runner,
    installer_script: &Path,
    device: &Device,
    warmup: Duration,
) -> Result<(), Error> {
    let script = installer_script.display().to_string();
    runner
        .run(
            &Invocation::new(installer_script).args(["install", "--device", device.serial_no()]),
        )
        .map_err(|source| Error::InstallFailed {
            script: script.clone(),
            source,
        })?;

    let launch = Invocation::new(installer_script).args([
        "run",
        "--device",
        device.serial_no(),
        "--args=--disable-fre",
    ]);
    let loaded = runner
        .run_until(&launch, NATIVE_LIBRARY_LOADED, warmup)
        .map_err(|source| Error::LaunchFailed { script, source })?;
    if !loaded {
        log::warn!(
            "native library didn't report loading on {device} within {}s",
            warmup.as_secs()
        );
    }
    Ok(())
}
