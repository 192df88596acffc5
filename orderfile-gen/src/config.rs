//! Command line surface and the settings file.
//!
//! [`Cli`] is what clap parses. [`Config::from_cli`] turns it into a typed
//! [`Config`], rejecting every invalid flag combination before anything
//! touches a device or a build directory. [`Settings`] holds the tunables
//! (tool locations, stories, anchors, benchmark names, timeouts), all of
//! which have defaults and can be overridden from a TOML file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{ArgAction, Parser};
use orderfile_mobile::android::{EmulatorOptions, PollPolicy};
use serde::Deserialize;

use crate::{
    arch::{Arch, Browser},
    error::{Error, Result},
};

#[derive(Debug, Parser)]
#[command(name = "orderfile-gen")]
#[command(version, about = "Generate, verify and benchmark Android orderfiles", long_about = None)]
pub struct Cli {
    /// Target architecture
    #[arg(long, value_enum)]
    pub arch: Arch,
    /// Skip the with/without orderfile benchmarks
    #[arg(long)]
    pub no_benchmark: bool,
    /// Serial of the device to profile on
    #[arg(long)]
    pub device: Option<String>,
    /// Don't build instrumented or collect profiles; reuse the unpatched orderfile on disk
    #[arg(long)]
    pub skip_profile: bool,
    /// Build with remote execution
    #[arg(long)]
    pub use_remoteexec: bool,
    /// Path to the adb binary
    #[arg(long)]
    pub adb_path: Option<PathBuf>,
    /// Use public (unbranded) targets and the public orderfile directory
    #[arg(long)]
    pub public: bool,
    /// Glob of previously collected profiles to use instead of profiling
    #[arg(long, value_name = "GLOB")]
    pub pregenerated_profiles: Option<String>,
    /// Copy collected profiles here (must not exist yet)
    #[arg(long, value_name = "DIR")]
    pub profile_save_dir: Option<PathBuf>,
    /// Only relink with the current orderfile and check the symbol order
    #[arg(long)]
    pub verify: bool,
    /// Generate the WebView orderfile instead of Chrome's
    #[arg(long)]
    pub profile_webview: bool,
    /// Log level; may be given more than once, values add up
    #[arg(long, value_name = "N", action = ArgAction::Append)]
    pub verbosity: Vec<u8>,
    /// Keep the host profile directory after the run
    #[arg(long)]
    pub save_profile_data: bool,
    /// Root of the source checkout
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub src_dir: PathBuf,
    /// TOML file overriding tool paths, stories, anchors and timeouts
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,
    /// Also write the report to this file
    #[arg(long, value_name = "FILE")]
    pub output_json: Option<PathBuf>,
    /// Profile a single story and run each benchmark once
    #[arg(long)]
    pub streamline_for_debugging: bool,
}

impl Cli {
    pub fn total_verbosity(&self) -> u8 {
        self.verbosity
            .iter()
            .fold(0u8, |total, level| total.saturating_add(*level))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    /// Reuse the unpatched orderfile already on disk.
    Skip,
    /// Build instrumented and profile on a device.
    Live,
    /// Use files matching this glob.
    Pregenerated(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub arch: Arch,
    pub browser: Browser,
    pub mode: Mode,
    pub profile: ProfileSource,
    pub profile_save_dir: Option<PathBuf>,
    pub public: bool,
    pub use_remoteexec: bool,
    pub benchmark: bool,
    pub device: Option<String>,
    pub adb_path: Option<PathBuf>,
    pub verbosity: u8,
    pub save_profile_data: bool,
    pub streamline: bool,
    pub src_dir: PathBuf,
    pub settings: Option<PathBuf>,
    pub output_json: Option<PathBuf>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let verbosity = cli.total_verbosity();
        let conflict = |message: &str| -> Result<Self> {
            Err(Error::Configuration(message.to_string()))
        };

        if cli.verify {
            for (set, flag) in [
                (cli.skip_profile, "--skip-profile"),
                (cli.pregenerated_profiles.is_some(), "--pregenerated-profiles"),
                (cli.profile_save_dir.is_some(), "--profile-save-dir"),
            ] {
                if set {
                    return Err(Error::Configuration(format!(
                        "--verify can't be combined with {flag}"
                    )));
                }
            }
        }

        let profile = match (cli.skip_profile, cli.pregenerated_profiles) {
            (true, Some(_)) => {
                return conflict("--pregenerated-profiles requires profiling; drop --skip-profile");
            }
            (true, None) => ProfileSource::Skip,
            (false, Some(pattern)) => ProfileSource::Pregenerated(pattern),
            (false, None) => ProfileSource::Live,
        };

        if let Some(dir) = &cli.profile_save_dir {
            match profile {
                ProfileSource::Skip => {
                    return conflict("--profile-save-dir requires profiling; drop --skip-profile");
                }
                ProfileSource::Pregenerated(_) => {
                    return conflict(
                        "--profile-save-dir can't be combined with --pregenerated-profiles",
                    );
                }
                ProfileSource::Live => {}
            }
            if dir.exists() {
                return Err(Error::Configuration(format!(
                    "--profile-save-dir {} already exists",
                    dir.display()
                )));
            }
        }

        if !cli.src_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "--src-dir {} is not a directory",
                cli.src_dir.display()
            )));
        }
        let src_dir = cli
            .src_dir
            .canonicalize()
            .map_err(|err| Error::Configuration(format!("--src-dir: {err}")))?;

        Ok(Self {
            arch: cli.arch,
            browser: Browser::from_webview_flag(cli.profile_webview),
            mode: if cli.verify { Mode::Verify } else { Mode::Generate },
            profile,
            profile_save_dir: cli.profile_save_dir,
            public: cli.public,
            use_remoteexec: cli.use_remoteexec,
            benchmark: !cli.no_benchmark,
            device: cli.device,
            adb_path: cli.adb_path,
            verbosity,
            save_profile_data: cli.save_profile_data,
            streamline: cli.streamline_for_debugging,
            src_dir,
            settings: cli.settings,
            output_json: cli.output_json,
        })
    }

    /// Whether this run talks to a device or emulator at all.
    pub fn needs_device(&self) -> bool {
        self.mode == Mode::Generate && (self.profile == ProfileSource::Live || self.benchmark)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub tools: Tools,
    pub orderfile: OrderfileSettings,
    pub profile: ProfileSettings,
    pub benchmark: BenchmarkSettings,
    pub emulator: EmulatorSettings,
    pub build_server: BuildServerSettings,
}

impl Settings {
    /// Defaults, overridden by `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path).map_err(|err| Error::Settings {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(&contents).map_err(|message| Error::Settings {
            path: path.to_path_buf(),
            message,
        })
    }

    fn parse(contents: &str) -> std::result::Result<Self, String> {
        toml::from_str(contents).map_err(|err| err.to_string())
    }

    pub fn min_sdk(&self, browser: Browser) -> u32 {
        match browser {
            Browser::Chrome => self.profile.min_sdk_chrome,
            Browser::WebView => self.profile.min_sdk_webview,
        }
    }
}

/// Helper scripts and build tools. Relative paths are resolved against the
/// source root.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tools {
    pub gn: PathBuf,
    pub autoninja: PathBuf,
    pub siso: PathBuf,
    pub out_root: PathBuf,
    pub profile_tool: PathBuf,
    pub symbol_tool: PathBuf,
    pub check_tool: PathBuf,
    pub benchmark_tool: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            gn: "gn".into(),
            autoninja: "autoninja".into(),
            siso: "siso".into(),
            out_root: "out".into(),
            profile_tool: "tools/cygprofile/android_profile_tool.py".into(),
            symbol_tool: "tools/cygprofile/process_profiles.py".into(),
            check_tool: "tools/cygprofile/check_orderfile.py".into(),
            benchmark_tool: "tools/perf/run_benchmark".into(),
        }
    }
}

impl Tools {
    /// Paths with a directory part live in the checkout; bare names are
    /// looked up on `PATH`.
    pub fn resolve(src_dir: &Path, tool: &Path) -> PathBuf {
        if tool.components().count() > 1 {
            src_dir.join(tool)
        } else {
            tool.to_path_buf()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrderfileSettings {
    /// Appended after the ordered symbols so the linker has a stable end marker.
    pub anchors: Vec<String>,
    /// Touched before relinking so the linker runs even if nothing else changed.
    pub relink_touch_file: PathBuf,
}

impl Default for OrderfileSettings {
    fn default() -> Self {
        Self {
            anchors: vec!["dummy_function_end_of_ordered_text".to_string()],
            relink_touch_file: "base/android/library_loader/anchor_functions.cc".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileSettings {
    pub stories: Vec<String>,
    pub min_sdk_chrome: u32,
    pub min_sdk_webview: u32,
    pub warmup_secs: u64,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            stories: [
                "browse:news:cnn:2021",
                "browse:social:facebook:2019",
                "browse:media:youtube:2019",
                "browse:shopping:amazon:2019",
                "load:search:google:2018",
            ]
            .map(String::from)
            .to_vec(),
            min_sdk_chrome: 29,
            min_sdk_webview: 24,
            warmup_secs: 60,
        }
    }
}

impl ProfileSettings {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchmarkSettings {
    pub speedometer: String,
    /// Key the speedometer samples are reported under.
    pub speedometer_label: String,
    pub memory: String,
    pub webview_startup: String,
    pub repeats: u32,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            speedometer: "speedometer2".to_string(),
            speedometer_label: "Speedometer2.0".to_string(),
            memory: "orderfile.memory_mobile".to_string(),
            webview_startup: "system_health.webview_startup".to_string(),
            repeats: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorSettings {
    pub avd: String,
    pub appear_secs: u64,
    pub boot_secs: u64,
    pub stop_secs: u64,
    pub poll_interval_ms: u64,
    pub headless: bool,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            avd: "android_34_google_apis_x64".to_string(),
            appear_secs: 30,
            boot_secs: 300,
            stop_secs: 30,
            poll_interval_ms: 1000,
            headless: true,
        }
    }
}

impl EmulatorSettings {
    pub fn options(&self) -> EmulatorOptions {
        let interval = Duration::from_millis(self.poll_interval_ms);
        let policy = |secs: u64| {
            let attempts = if self.poll_interval_ms == 0 {
                secs.max(1)
            } else {
                (secs * 1000).div_ceil(self.poll_interval_ms).max(1)
            };
            PollPolicy::new(u32::try_from(attempts).unwrap_or(u32::MAX), interval)
        };
        EmulatorOptions {
            appear: policy(self.appear_secs),
            boot: policy(self.boot_secs),
            stop: policy(self.stop_secs),
            headless: self.headless,
            full_boot: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildServerSettings {
    /// Matched against full command lines with `pgrep -f`.
    pub pattern: String,
    pub polls: u32,
    pub poll_interval_ms: u64,
}

impl Default for BuildServerSettings {
    fn default() -> Self {
        Self {
            pattern: "fast_local_dev_server".to_string(),
            polls: 5,
            poll_interval_ms: 1000,
        }
    }
}

impl BuildServerSettings {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(self.polls, Duration::from_millis(self.poll_interval_ms))
    }
}
