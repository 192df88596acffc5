pub mod device_list;
pub mod get_prop;

use std::ffi::OsString;

use thiserror::Error;

use crate::{Env, exec::Invocation};

pub use self::{device_list::device_list, get_prop::get_prop};

/// An `adb` invocation with captured output.
pub fn adb<U>(env: &Env, args: U) -> Invocation
where
    U: IntoIterator,
    U::Item: Into<OsString>,
{
    Invocation::new(env.adb()).args(args).capture()
}

#[derive(Debug, Error)]
pub enum RunCheckedError {
    #[error(
        "This device doesn't yet trust this computer. On the device, you should see a prompt like \"Allow USB debugging?\". Pressing \"Allow\" should fix this."
    )]
    Unauthorized,
    #[error(transparent)]
    Command(#[from] crate::exec::Error),
}

/// Runs an `adb` invocation and returns its trimmed output, telling an
/// unauthorized device apart from other failures.
fn run_checked(
    runner: &dyn crate::Runner,
    invocation: &Invocation,
) -> Result<String, RunCheckedError> {
    match runner.run(invocation) {
        Ok(output) => Ok(output.text.trim().to_string()),
        Err(err)
            if err
                .captured_output()
                .is_some_and(|text| text.contains("error: device unauthorized")) =>
        {
            Err(RunCheckedError::Unauthorized)
        }
        Err(err) => Err(err.into()),
    }
}
