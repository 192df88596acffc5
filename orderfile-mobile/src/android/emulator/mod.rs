//! Scoped emulator lifecycle: `absent → starting → running → stopping → absent`.
//!
//! At most one emulator may be visible to `adb` at any time. [`EmulatorScope`]
//! refuses to start while one is listed, and on release (explicit
//! [`EmulatorScope::stop`] or drop) kills it and waits until none is listed.

mod avd_list;

use std::{fmt::Display, thread::sleep, time::Duration};

use thiserror::Error;

use crate::{
    Env, Runner,
    android::{
        adb::{self, RunCheckedError, get_prop},
        device::{ConnectionStatus, Device},
    },
    exec::{self, Invocation, Process},
};

pub use avd_list::avd_list;

#[derive(Debug, Error)]
pub enum Error {
    #[error("An emulator is already running ({}); stop it first", .0.join(", "))]
    AlreadyRunning(Vec<String>),
    #[error("No AVD named {avd:?} (available: {available})")]
    UnknownAvd { avd: String, available: String },
    #[error("Emulator {avd} didn't show up in `adb devices` within {}s", .waited.as_secs())]
    DidNotAppear { avd: String, waited: Duration },
    #[error("{serial_no} didn't finish booting within {}s", .waited.as_secs())]
    DidNotBoot { serial_no: String, waited: Duration },
    #[error("{serial_no} was still listed {}s after being killed", .waited.as_secs())]
    DidNotStop { serial_no: String, waited: Duration },
    #[error(transparent)]
    Adb(#[from] RunCheckedError),
    #[error(transparent)]
    Command(#[from] exec::Error),
}

/// `attempts` probes, each one `interval` after the previous sleep, so a
/// policy that gives up has waited exactly [`PollPolicy::waited`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub fn waited(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Probes until it yields `Some`, giving up with `None` once every
    /// attempt is spent.
    pub fn poll<T, E>(
        &self,
        mut probe: impl FnMut() -> Result<Option<T>, E>,
    ) -> Result<Option<T>, E> {
        for _ in 0..self.attempts.max(1) {
            sleep(self.interval);
            if let Some(value) = probe()? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct EmulatorOptions {
    pub appear: PollPolicy,
    pub boot: PollPolicy,
    pub stop: PollPolicy,
    /// Pass `-no-window -no-audio`.
    pub headless: bool,
    /// Skip the quick-boot snapshot and cold boot.
    pub full_boot: bool,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        Self {
            appear: PollPolicy::new(30, Duration::from_secs(1)),
            boot: PollPolicy::new(150, Duration::from_secs(2)),
            stop: PollPolicy::new(30, Duration::from_secs(1)),
            headless: true,
            full_boot: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Emulator {
    name: String,
}

impl Display for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Emulator {
    fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, env: &Env, options: &EmulatorOptions) -> Invocation {
        let mut cmd = Invocation::new(env.emulator()).args([
            "-avd",
            self.name.as_str(),
            "-restart-when-stalled",
        ]);
        if options.full_boot {
            cmd = cmd.arg("-no-snapshot-load");
        }
        if options.headless {
            cmd = cmd.args(["-no-window", "-no-audio"]);
        }
        cmd
    }
}

/// Serials of every emulator `adb` currently lists, whatever its state.
pub fn running_emulators(runner: &dyn Runner, env: &Env) -> Result<Vec<String>, Error> {
    Ok(adb::device_list(runner, env)?
        .into_iter()
        .map(|(serial_no, _)| serial_no)
        .filter(|serial_no| serial_no.starts_with("emulator-"))
        .collect())
}

/// Kills every listed emulator until none is left. Used when a start attempt
/// is abandoned before there is a scope to release.
fn kill_all(runner: &dyn Runner, env: &Env, policy: PollPolicy) -> Result<(), Error> {
    let mut last_seen = Vec::new();
    let cleared = policy.poll(|| -> Result<Option<()>, Error> {
        let running = running_emulators(runner, env)?;
        for serial_no in &running {
            runner.run(&adb::adb(env, ["-s", serial_no.as_str(), "emu", "kill"]).unchecked())?;
        }
        let cleared = running.is_empty().then_some(());
        last_seen = running;
        Ok(cleared)
    })?;
    cleared.ok_or_else(|| Error::DidNotStop {
        serial_no: last_seen.join(", "),
        waited: policy.waited(),
    })
}

/// A running emulator that is killed again when the scope ends.
pub struct EmulatorScope<'a> {
    runner: &'a dyn Runner,
    env: &'a Env,
    process: Box<dyn Process>,
    device: Device,
    stop_policy: PollPolicy,
    released: bool,
}

impl<'a> EmulatorScope<'a> {
    pub fn start(
        runner: &'a dyn Runner,
        env: &'a Env,
        avd: &str,
        options: &EmulatorOptions,
    ) -> Result<Self, Error> {
        let running = running_emulators(runner, env)?;
        if !running.is_empty() {
            return Err(Error::AlreadyRunning(running));
        }

        let avds = avd_list(runner, env)?;
        let emulator = avds
            .iter()
            .find(|emulator| emulator.name() == avd)
            .ok_or_else(|| Error::UnknownAvd {
                avd: avd.to_owned(),
                available: avds
                    .iter()
                    .map(Emulator::name)
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        log::info!("starting emulator {emulator}");
        let process = runner.launch(&emulator.command(env, options))?;

        let appeared = options
            .appear
            .poll(|| {
                Ok::<_, Error>(match running_emulators(runner, env)?.as_slice() {
                    [serial_no] => Some(serial_no.clone()),
                    _ => None,
                })
            })
            .and_then(|serial_no| {
                serial_no.ok_or_else(|| Error::DidNotAppear {
                    avd: avd.to_owned(),
                    waited: options.appear.waited(),
                })
            });
        let serial_no = match appeared {
            Ok(serial_no) => serial_no,
            Err(err) => {
                log::warn!("giving up on emulator {emulator}, killing it");
                if let Err(kill_err) = process.kill() {
                    log::error!("{kill_err}");
                }
                if let Err(cleanup_err) = kill_all(runner, env, options.stop) {
                    log::error!("{cleanup_err}");
                }
                return Err(err);
            }
        };

        // From here on a failure still kills the emulator through `Drop`.
        let mut scope = Self {
            runner,
            env,
            process,
            device: Device::new(serial_no, ConnectionStatus::Connected, None),
            stop_policy: options.stop,
            released: false,
        };
        scope.wait_for_boot(options.boot)?;
        Ok(scope)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Kills the emulator and waits for it to disappear.
    pub fn stop(mut self) -> Result<(), Error> {
        self.released = true;
        self.shutdown()
    }

    fn wait_for_boot(&mut self, policy: PollPolicy) -> Result<(), Error> {
        let serial_no = self.device.serial_no().to_owned();
        policy
            .poll(|| Ok::<_, Error>(self.boot_completed().then_some(())))?
            .ok_or_else(|| Error::DidNotBoot {
                serial_no: serial_no.clone(),
                waited: policy.waited(),
            })?;
        let sdk_level = get_prop::sdk_level(self.runner, self.env, &serial_no).ok();
        self.device = Device::new(serial_no, ConnectionStatus::Connected, sdk_level);
        log::info!("emulator {} booted", self.device);
        Ok(())
    }

    /// Booted and, when storage is encrypted, decrypted. Lookups fail while
    /// the device is coming up, which just means "not yet".
    fn boot_completed(&self) -> bool {
        let prop =
            |name: &str| get_prop(self.runner, self.env, self.device.serial_no(), name).ok();
        prop("sys.boot_completed").as_deref() == Some("1")
            && matches!(
                prop("vold.decrypt").as_deref(),
                Some("" | "trigger_restart_framework")
            )
    }

    fn shutdown(&self) -> Result<(), Error> {
        let serial_no = self.device.serial_no();
        log::info!("stopping emulator {serial_no}");
        let kill = adb::adb(self.env, ["-s", serial_no, "emu", "kill"]).unchecked();
        let output = self.runner.run(&kill)?;
        if !output.success() {
            log::warn!("{kill} exited with {:?}: {}", output.code, output.text.trim());
        }

        let stopped = self
            .stop_policy
            .poll(|| {
                let running = running_emulators(self.runner, self.env)?;
                Ok::<_, Error>(running.is_empty().then_some(()))
            })?
            .ok_or_else(|| Error::DidNotStop {
                serial_no: serial_no.to_owned(),
                waited: self.stop_policy.waited(),
            });
        // The launcher normally exits along with the emulator; reap it either way.
        if let Err(err) = self.process.kill() {
            log::debug!("{err}");
        }
        stopped
    }
}

impl Drop for EmulatorScope<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.shutdown() {
            log::error!("{err}");
        }
    }
}
