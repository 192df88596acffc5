//! Build Driver: GN args, `gn gen`, the build itself, and cleanup of the
//! background build server afterwards.

use std::{
    fmt::Write as _,
    fs::{self, File},
    path::{Path, PathBuf},
    time::SystemTime,
};

use orderfile_mobile::{Invocation, Runner};

use crate::{
    arch::{Arch, Browser},
    config::{BuildServerSettings, Tools},
    error::{Error, IoResultExt, Result},
};

/// Which of the three per-run output directories a build lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRole {
    Instrumented,
    Uninstrumented,
    /// Baseline build with an empty orderfile.
    NoOrderfile,
}

impl OutputRole {
    fn suffix(self) -> &'static str {
        match self {
            OutputRole::Instrumented => "instrumented",
            OutputRole::Uninstrumented => "uninstrumented",
            OutputRole::NoOrderfile => "no_orderfile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildIntent {
    pub arch: Arch,
    pub browser: Browser,
    pub public: bool,
    pub use_remoteexec: bool,
    pub role: OutputRole,
}

impl BuildIntent {
    pub fn instrumented(&self) -> bool {
        self.role == OutputRole::Instrumented
    }

    /// The installable target: an APK for WebView, a trichrome bundle for Chrome.
    pub fn app_target(&self) -> String {
        match self.browser {
            Browser::WebView if self.arch.is_64bit() => "system_webview_64_32_apk".to_string(),
            Browser::WebView => "system_webview_apk".to_string(),
            Browser::Chrome => {
                let branding = if self.public { "" } else { "_google" };
                let variant = if self.arch == Arch::Arm64 { "_64_32" } else { "" };
                format!("trichrome_chrome{branding}{variant}_bundle")
            }
        }
    }

    /// The native library target, also the stem of the `.so` on the host.
    pub fn library_target(&self) -> &'static str {
        match (self.browser, self.arch.is_64bit()) {
            (Browser::WebView, true) => "libwebviewchromium_64",
            (Browser::WebView, false) => "libwebviewchromium",
            (Browser::Chrome, _) if self.arch == Arch::Arm64 => "libmonochrome_64",
            (Browser::Chrome, _) => "libmonochrome",
        }
    }
}

/// Stable location of the orderfile pair for one arch and browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderfilePaths {
    /// Raw output of the offset processor.
    pub unpatched: PathBuf,
    /// What the linker consumes.
    pub orderfile: PathBuf,
}

impl OrderfilePaths {
    pub fn new(src_dir: &Path, arch: Arch, browser: Browser, public: bool) -> Self {
        let mut dir = if public {
            src_dir.join("orderfiles")
        } else {
            src_dir.join("clank").join("orderfiles")
        };
        if browser == Browser::WebView {
            dir.push("webview");
        }
        Self {
            unpatched: dir.join(format!("unpatched_orderfile.{arch}")),
            orderfile: dir.join(format!("orderfile.{arch}.out")),
        }
    }
}

/// Where a build's outputs end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPaths {
    pub out_dir: PathBuf,
    /// Wrapper script that installs and launches the app.
    pub installer_script: PathBuf,
    /// Unstripped native library.
    pub library: PathBuf,
    /// Only meaningful in WebView mode.
    pub apk: PathBuf,
    /// Passed to the harness as `--browser`.
    pub browser_id: String,
}

/// `gn args` for `intent`. `orderfile` is the source-absolute (`//...`)
/// path of the orderfile, if one should be linked in.
pub fn generate_args(intent: &BuildIntent, orderfile: Option<&str>) -> String {
    let mut args = String::new();
    let mut line = |key: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(args, "{key}={value}");
    };
    line("enable_resource_allowlist_generation", &false);
    line("is_chrome_branded", &!intent.public);
    line("is_debug", &false);
    line("is_official_build", &true);
    line("symbol_level", &1);
    line("target_os", &"\"android\"");
    line("enable_proguard_obfuscation", &false);
    line("use_remoteexec", &intent.use_remoteexec);
    line("use_order_profiling", &intent.instrumented());
    line("devtools_instrumentation_dumping", &intent.instrumented());
    line("target_cpu", &format!("\"{}\"", intent.arch));
    if let Some(path) = orderfile {
        line("chrome_orderfile_path", &format!("\"{path}\""));
    }
    args
}

/// `path` as a GN source-absolute label, when it lives under `src_dir`.
fn source_absolute(src_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(src_dir).ok()?;
    let parts = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>();
    Some(format!("//{}", parts.join("/")))
}

pub struct BuildDriver<'a> {
    runner: &'a dyn Runner,
    src_dir: &'a Path,
    tools: &'a Tools,
    server: &'a BuildServerSettings,
    relink_touch_file: &'a Path,
    orderfile: &'a OrderfilePaths,
}

impl<'a> BuildDriver<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        src_dir: &'a Path,
        tools: &'a Tools,
        server: &'a BuildServerSettings,
        relink_touch_file: &'a Path,
        orderfile: &'a OrderfilePaths,
    ) -> Self {
        Self {
            runner,
            src_dir,
            tools,
            server,
            relink_touch_file,
            orderfile,
        }
    }

    pub fn out_dir(&self, intent: &BuildIntent) -> PathBuf {
        let webview = match intent.browser {
            Browser::WebView => "_webview",
            Browser::Chrome => "",
        };
        self.src_dir.join(&self.tools.out_root).join(format!(
            "orderfile_{}{webview}_{}",
            intent.arch,
            intent.role.suffix()
        ))
    }

    pub fn derived_paths(&self, intent: &BuildIntent) -> DerivedPaths {
        let out_dir = self.out_dir(intent);
        let target = intent.app_target();
        let apk = if intent.arch.is_64bit() {
            "SystemWebView6432.apk"
        } else {
            "SystemWebView.apk"
        };
        let browser_id = match intent.browser {
            Browser::WebView => "android-webview".to_string(),
            Browser::Chrome => format!("android-{}", target.replace('_', "-")),
        };
        DerivedPaths {
            installer_script: out_dir.join("bin").join(&target),
            library: out_dir
                .join("lib.unstripped")
                .join(format!("{}.so", intent.library_target())),
            apk: out_dir.join("apks").join(apk),
            out_dir,
            browser_id,
        }
    }

    /// The orderfile to link against. Instrumented builds never get one.
    fn linked_orderfile(&self, intent: &BuildIntent) -> Option<String> {
        if intent.instrumented() || !self.orderfile.orderfile.is_file() {
            return None;
        }
        source_absolute(self.src_dir, &self.orderfile.orderfile)
    }

    fn resolve(&self, tool: &Path) -> PathBuf {
        Tools::resolve(self.src_dir, tool)
    }

    /// `siso` when the output directory was last built with it, `autoninja`
    /// otherwise.
    fn build_tool(&self, out_dir: &Path) -> PathBuf {
        if out_dir.join(".siso_deps").exists() {
            self.resolve(&self.tools.siso)
        } else {
            self.resolve(&self.tools.autoninja)
        }
    }

    /// Writes `args.gn`, generates, and builds `targets`. A failed build is
    /// retried once after `gn clean`.
    pub fn build(&self, intent: &BuildIntent, targets: &[&str]) -> Result<DerivedPaths> {
        let paths = self.derived_paths(intent);
        let out_dir = &paths.out_dir;
        fs::create_dir_all(out_dir)
            .io_context(|| format!("Failed to create {}", out_dir.display()))?;
        let args = generate_args(intent, self.linked_orderfile(intent).as_deref());
        log::debug!("args.gn for {}:\n{args}", out_dir.display());
        fs::write(out_dir.join("args.gn"), args)
            .io_context(|| format!("Failed to write args.gn in {}", out_dir.display()))?;

        let gn = self.resolve(&self.tools.gn);
        self.runner
            .run(&Invocation::new(&gn).arg("gen").arg(out_dir).cwd(self.src_dir))?;

        let result = self.run_build(out_dir, targets).or_else(|err| {
            log::warn!("build failed ({err}), cleaning {} and retrying", out_dir.display());
            self.runner
                .run(&Invocation::new(&gn).arg("clean").arg(out_dir).cwd(self.src_dir))?;
            self.run_build(out_dir, targets)
        });
        let stopped = self.stop_build_server();
        result?;
        stopped?;
        Ok(paths)
    }

    fn run_build(&self, out_dir: &Path, targets: &[&str]) -> Result<()> {
        let build = Invocation::new(self.build_tool(out_dir))
            .arg("-C")
            .arg(out_dir)
            .args(targets.iter().copied())
            .cwd(self.src_dir)
            .env("PYTHONUNBUFFERED", "1");
        self.runner.run(&build)?;
        Ok(())
    }

    /// Interrupts a lingering build server so one build can't leak into the
    /// next, and waits for it to exit.
    pub fn stop_build_server(&self) -> Result<()> {
        let pattern = self.server.pattern.as_str();
        let pids = self.server_pids()?;
        if pids.is_empty() {
            return Ok(());
        }
        log::info!("interrupting build server ({})", pids.join(", "));
        let kill = Invocation::new("kill")
            .arg("-INT")
            .args(pids.iter())
            .capture()
            .unchecked();
        self.runner.run(&kill)?;

        self.server
            .policy()
            .poll(|| Ok::<_, Error>(self.server_pids()?.is_empty().then_some(())))?
            .ok_or_else(|| Error::BuildServerStuck {
                pattern: pattern.to_owned(),
            })
    }

    fn server_pids(&self) -> Result<Vec<String>> {
        let output = self.runner.run(
            &Invocation::new("pgrep")
                .args(["-f", self.server.pattern.as_str()])
                .capture()
                .unchecked(),
        )?;
        Ok(output
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_owned)
            .collect())
    }

    /// Bumps the mtime of a source file the native library depends on so
    /// the next build relinks even if the orderfile path is unchanged.
    pub fn force_relink(&self) -> Result<()> {
        let path = self.src_dir.join(self.relink_touch_file);
        log::debug!("touching {}", path.display());
        File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .io_context(|| format!("Failed to touch {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use orderfile_mobile::exec::{Output, testing::ScriptedRunner};
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn intent(arch: Arch, browser: Browser, role: OutputRole) -> BuildIntent {
        BuildIntent {
            arch,
            browser,
            public: false,
            use_remoteexec: false,
            role,
        }
    }

    fn instant_server() -> BuildServerSettings {
        BuildServerSettings {
            poll_interval_ms: 0,
            ..BuildServerSettings::default()
        }
    }

    #[rstest(arch, browser,
        case(Arch::Arm, Browser::Chrome),
        case(Arch::Arm64, Browser::Chrome),
        case(Arch::X86, Browser::WebView),
        case(Arch::X64, Browser::WebView),
    )]
    fn args_follow_intent(arch: Arch, browser: Browser) {
        for role in [OutputRole::Instrumented, OutputRole::Uninstrumented] {
            let intent = intent(arch, browser, role);
            let args = generate_args(&intent, None);
            assert!(args.contains(&format!("target_cpu=\"{arch}\"\n")));
            let instrumented = role == OutputRole::Instrumented;
            assert!(args.contains(&format!("use_order_profiling={instrumented}\n")));
            assert!(args.contains(&format!("devtools_instrumentation_dumping={instrumented}\n")));
            assert!(args.contains("target_os=\"android\"\n"));
            assert!(args.contains("is_chrome_branded=true\n"));
            assert!(!args.contains("chrome_orderfile_path"));
        }
    }

    #[test]
    fn args_reference_orderfile() {
        let intent = intent(Arch::Arm64, Browser::Chrome, OutputRole::Uninstrumented);
        let args = generate_args(&intent, Some("//clank/orderfiles/orderfile.arm64.out"));
        assert!(
            args.ends_with("chrome_orderfile_path=\"//clank/orderfiles/orderfile.arm64.out\"\n")
        );
    }

    #[rstest(arch, browser, public, expected,
        case(Arch::Arm, Browser::Chrome, false, "trichrome_chrome_google_bundle"),
        case(Arch::Arm64, Browser::Chrome, false, "trichrome_chrome_google_64_32_bundle"),
        case(Arch::Arm64, Browser::Chrome, true, "trichrome_chrome_64_32_bundle"),
        case(Arch::Arm, Browser::WebView, false, "system_webview_apk"),
        case(Arch::X64, Browser::WebView, true, "system_webview_64_32_apk"),
    )]
    fn target_names(arch: Arch, browser: Browser, public: bool, expected: &str) {
        let intent = BuildIntent {
            public,
            ..intent(arch, browser, OutputRole::Uninstrumented)
        };
        assert_eq!(intent.app_target(), expected);
    }

    #[test]
    fn orderfile_locations() {
        let src = Path::new("/src");
        let internal = OrderfilePaths::new(src, Arch::Arm64, Browser::Chrome, false);
        assert_eq!(
            internal.orderfile,
            Path::new("/src/clank/orderfiles/orderfile.arm64.out")
        );
        let public = OrderfilePaths::new(src, Arch::Arm, Browser::WebView, true);
        assert_eq!(
            public.unpatched,
            Path::new("/src/orderfiles/webview/unpatched_orderfile.arm")
        );
    }

    struct Fixture {
        src: TempDir,
        tools: Tools,
        server: BuildServerSettings,
        orderfile: OrderfilePaths,
    }

    impl Fixture {
        fn new() -> Self {
            let src = TempDir::new().unwrap();
            let orderfile = OrderfilePaths::new(src.path(), Arch::Arm64, Browser::Chrome, false);
            Self {
                src,
                tools: Tools::default(),
                server: instant_server(),
                orderfile,
            }
        }

        fn driver<'a>(&'a self, runner: &'a dyn Runner) -> BuildDriver<'a> {
            BuildDriver::new(
                runner,
                self.src.path(),
                &self.tools,
                &self.server,
                Path::new("base/anchor_functions.cc"),
                &self.orderfile,
            )
        }
    }

    #[test]
    fn build_writes_args_and_links_existing_orderfile() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.orderfile.orderfile.parent().unwrap()).unwrap();
        fs::write(&fixture.orderfile.orderfile, "sym\n").unwrap();
        let runner = ScriptedRunner::succeeding();
        let driver = fixture.driver(&runner);

        let intent = intent(Arch::Arm64, Browser::Chrome, OutputRole::Uninstrumented);
        let paths = driver.build(&intent, &["libmonochrome_64"]).unwrap();

        let args = fs::read_to_string(paths.out_dir.join("args.gn")).unwrap();
        assert!(args.contains("chrome_orderfile_path=\"//clank/orderfiles/orderfile.arm64.out\""));
        assert_eq!(
            paths.library,
            paths.out_dir.join("lib.unstripped/libmonochrome_64.so")
        );
        assert_eq!(
            paths.browser_id,
            "android-trichrome-chrome-google-64-32-bundle"
        );

        let commands = runner.command_lines();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].starts_with("gn gen "));
        assert!(commands[1].starts_with("autoninja -C "));
        assert!(commands[1].ends_with(" libmonochrome_64"));
        assert_eq!(commands[2], "pgrep -f fast_local_dev_server");
    }

    #[test]
    fn instrumented_build_ignores_orderfile() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.orderfile.orderfile.parent().unwrap()).unwrap();
        fs::write(&fixture.orderfile.orderfile, "sym\n").unwrap();
        let runner = ScriptedRunner::succeeding();
        let driver = fixture.driver(&runner);

        let intent = intent(Arch::Arm64, Browser::Chrome, OutputRole::Instrumented);
        let paths = driver.build(&intent, &["x"]).unwrap();
        let args = fs::read_to_string(paths.out_dir.join("args.gn")).unwrap();
        assert!(!args.contains("chrome_orderfile_path"));
        assert!(args.contains("use_order_profiling=true"));
    }

    #[test]
    fn failed_build_is_retried_once_after_clean() {
        let fixture = Fixture::new();
        let attempts = Rc::new(Cell::new(0));
        let counter = attempts.clone();
        let runner = ScriptedRunner::new(move |invocation| {
            if invocation.program() == Path::new("autoninja") {
                counter.set(counter.get() + 1);
                if counter.get() == 1 {
                    return Ok(Output::exit(1, "ninja: build stopped"));
                }
            }
            Ok(Output::ok(""))
        });
        let driver = fixture.driver(&runner);
        let intent = intent(Arch::Arm, Browser::WebView, OutputRole::Uninstrumented);
        driver.build(&intent, &["system_webview_apk"]).unwrap();

        assert_eq!(attempts.get(), 2);
        assert!(runner
            .command_lines()
            .iter()
            .any(|line| line.starts_with("gn clean ")));
    }

    #[test]
    fn second_build_failure_is_fatal() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new(|invocation| {
            if invocation.program() == Path::new("autoninja") {
                Ok(Output::exit(1, ""))
            } else {
                Ok(Output::ok(""))
            }
        });
        let driver = fixture.driver(&runner);
        let intent = intent(Arch::Arm, Browser::Chrome, OutputRole::NoOrderfile);
        let err = driver.build(&intent, &["x"]).unwrap_err();
        assert!(matches!(err, Error::Command(_)));
        assert_eq!(
            runner.command_lines().last().unwrap(),
            "pgrep -f fast_local_dev_server",
            "the build server is stopped even after a failed build"
        );
    }

    #[test]
    fn gn_failure_is_not_retried() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new(|invocation| {
            if invocation.program() == Path::new("gn") {
                Ok(Output::exit(1, "ERROR at //BUILD.gn"))
            } else {
                Ok(Output::ok(""))
            }
        });
        let driver = fixture.driver(&runner);
        let intent = intent(Arch::X86, Browser::Chrome, OutputRole::Uninstrumented);
        assert!(driver.build(&intent, &["x"]).is_err());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn build_server_is_interrupted() {
        let fixture = Fixture::new();
        let alive = Rc::new(Cell::new(true));
        let state = alive.clone();
        let runner = ScriptedRunner::new(move |invocation| {
            let argv = invocation.argv();
            match argv[0].as_str() {
                "pgrep" if state.get() => Ok(Output::ok("4242\n")),
                "pgrep" => Ok(Output::exit(1, "")),
                "kill" => {
                    state.set(false);
                    Ok(Output::ok(""))
                }
                _ => Ok(Output::ok("")),
            }
        });
        fixture.driver(&runner).stop_build_server().unwrap();
        assert!(!alive.get());
        assert!(runner.command_lines().contains(&"kill -INT 4242".to_string()));
    }

    #[test]
    fn stubborn_build_server_is_an_error() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new(|invocation| {
            if invocation.program() == Path::new("pgrep") {
                Ok(Output::ok("4242\n"))
            } else {
                Ok(Output::ok(""))
            }
        });
        let err = fixture.driver(&runner).stop_build_server().unwrap_err();
        assert!(matches!(err, Error::BuildServerStuck { .. }));
        let polls = runner
            .command_lines()
            .iter()
            .filter(|line| line.starts_with("pgrep"))
            .count();
        assert_eq!(polls, 1 + fixture.server.polls as usize);
    }

    #[test]
    fn force_relink_bumps_mtime() {
        let fixture = Fixture::new();
        let touched = fixture.src.path().join("base/anchor_functions.cc");
        fs::create_dir_all(touched.parent().unwrap()).unwrap();
        fs::write(&touched, "// anchors\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&touched)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let runner = ScriptedRunner::succeeding();
        fixture.driver(&runner).force_relink().unwrap();
        let modified = fs::metadata(&touched).unwrap().modified().unwrap();
        assert!(modified > old);
        assert_eq!(fs::read_to_string(&touched).unwrap(), "// anchors\n");
    }
}
