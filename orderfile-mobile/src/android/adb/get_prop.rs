use thiserror::Error;

use crate::{Env, Runner};

use super::adb;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run `adb shell getprop {prop}`: {source}")]
    LookupFailed {
        prop: String,
        source: super::RunCheckedError,
    },
    #[error("`{prop}` on {serial_no} isn't a number: {value:?}")]
    NotANumber {
        serial_no: String,
        prop: String,
        value: String,
    },
}

pub fn get_prop(
    runner: &dyn Runner,
    env: &Env,
    serial_no: &str,
    prop: &str,
) -> Result<String, Error> {
    let cmd = adb(env, ["-s", serial_no, "shell", "getprop", prop]);
    super::run_checked(runner, &cmd).map_err(|source| Error::LookupFailed {
        prop: prop.to_owned(),
        source,
    })
}

/// The device's API level (`ro.build.version.sdk`).
pub fn sdk_level(runner: &dyn Runner, env: &Env, serial_no: &str) -> Result<u32, Error> {
    const PROP: &str = "ro.build.version.sdk";
    let value = get_prop(runner, env, serial_no, PROP)?;
    value.parse().map_err(|_| Error::NotANumber {
        serial_no: serial_no.to_owned(),
        prop: PROP.to_owned(),
        value,
    })
}
