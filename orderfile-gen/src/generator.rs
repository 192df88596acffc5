//! The orchestrator: runs the stages a [`Config`] asks for, in order, and
//! fills in the [`Report`].

use std::path::{Path, PathBuf};

use orderfile_mobile::{Env, Runner, android};

use crate::{
    arch::Browser,
    benchmark::BenchmarkRunner,
    build::{BuildDriver, BuildIntent, OrderfilePaths, OutputRole},
    config::{Config, Mode, ProfileSource, Settings, Tools},
    error::{Error, Result},
    offsets,
    orderfile::{self, OrderfileBackup},
    output::{self, Stage},
    profile::{self, ProfileCollector, ProfileTarget},
    report::Report,
    verify,
};

pub struct Generator<'a> {
    config: &'a Config,
    settings: &'a Settings,
    runner: &'a dyn Runner,
    env: Option<&'a Env>,
    paths: OrderfilePaths,
    report: Report,
}

impl<'a> Generator<'a> {
    /// `env` is only needed when the config talks to a device.
    pub fn new(
        config: &'a Config,
        settings: &'a Settings,
        runner: &'a dyn Runner,
        env: Option<&'a Env>,
    ) -> Self {
        Self {
            config,
            settings,
            runner,
            env,
            paths: OrderfilePaths::new(
                &config.src_dir,
                config.arch,
                config.browser,
                config.public,
            ),
            report: Report::default(),
        }
    }

    pub fn into_report(self) -> Report {
        self.report
    }

    pub fn run(&mut self) -> Result<()> {
        match self.config.mode {
            Mode::Verify => self.verify_only(),
            Mode::Generate => self.generate(),
        }
    }

    fn intent(&self, role: OutputRole) -> BuildIntent {
        BuildIntent {
            arch: self.config.arch,
            browser: self.config.browser,
            public: self.config.public,
            use_remoteexec: self.config.use_remoteexec,
            role,
        }
    }

    fn builder(&self) -> BuildDriver<'_> {
        BuildDriver::new(
            self.runner,
            &self.config.src_dir,
            &self.settings.tools,
            &self.settings.build_server,
            &self.settings.orderfile.relink_touch_file,
            &self.paths,
        )
    }

    fn tool(&self, tool: &Path) -> PathBuf {
        Tools::resolve(&self.config.src_dir, tool)
    }

    fn env(&self) -> Result<&'a Env> {
        self.env.ok_or_else(|| {
            Error::Configuration("this run needs adb, but no Android environment was set up".into())
        })
    }

    fn verify_only(&mut self) -> Result<()> {
        let stage = Stage::start(
            "Verifying",
            format!("{} against {}", self.config.arch, self.paths.orderfile.display()),
        );
        self.relink_and_verify()?;
        stage.done();
        Ok(())
    }

    fn generate(&mut self) -> Result<()> {
        if self.config.profile == ProfileSource::Skip && !self.paths.unpatched.is_file() {
            return Err(Error::Configuration(format!(
                "--skip-profile needs an existing unpatched orderfile at {}",
                self.paths.unpatched.display()
            )));
        }

        if self.config.profile != ProfileSource::Skip {
            self.profile_and_process()?;
        }

        let stage = Stage::start("Patching", self.paths.orderfile.display());
        orderfile::remove_blank_lines(&self.paths.unpatched, &self.paths.orderfile)?;
        orderfile::add_anchor_symbols(&self.paths.orderfile, &self.settings.orderfile.anchors)?;
        stage.done();

        let stage = Stage::start("Verifying", "relinking with the new orderfile");
        self.relink_and_verify()?;
        stage.done();

        if self.config.benchmark {
            self.benchmark()?;
        }
        Ok(())
    }

    /// Collects or loads profiles and writes the unpatched orderfile.
    fn profile_and_process(&mut self) -> Result<()> {
        let instrumented = self.intent(OutputRole::Instrumented);
        let builder = self.builder();
        // Owns the pulled profiles until they are processed.
        let mut collector = None;

        let stage = Stage::start("Profiling", self.config.browser);
        let (files, library) = match &self.config.profile {
            ProfileSource::Pregenerated(pattern) => {
                output::note(format!("using pregenerated profiles from {pattern}"));
                let library = builder.derived_paths(&instrumented).library;
                (profile::expand_glob(pattern)?, library)
            }
            ProfileSource::Live => {
                let env = self.env()?;
                let target = instrumented.app_target();
                let paths = builder.build(&instrumented, &[target.as_str()])?;
                let device = android::select_device(
                    self.runner,
                    env,
                    self.config.device.as_deref(),
                    self.settings.min_sdk(self.config.browser),
                )?;
                android::install(
                    self.runner,
                    &paths.installer_script,
                    &device,
                    self.settings.profile.warmup(),
                )?;
                let profile_target = match self.config.browser {
                    Browser::WebView => ProfileTarget::Apk(&paths.apk),
                    Browser::Chrome => ProfileTarget::Browser(&paths.browser_id),
                };
                let stories = &self.settings.profile.stories;
                let stories = if self.config.streamline {
                    &stories[..stories.len().min(1)]
                } else {
                    &stories[..]
                };
                let collector = collector.insert(ProfileCollector::new(
                    self.runner,
                    self.tool(&self.settings.tools.profile_tool),
                    self.config.verbosity,
                    self.config.save_profile_data,
                )?);
                let files = collector.collect(profile_target, &device, stories)?;
                (files, paths.library)
            }
            ProfileSource::Skip => return Ok(()),
        };
        stage.done();

        if let Some(dir) = &self.config.profile_save_dir {
            profile::save_profiles(&files, dir)?;
            output::step(format!("profiles saved to {}", dir.display()));
        }

        let stage = Stage::start("Processing", format!("{} profiles", files.len()));
        let order = offsets::process(
            self.runner,
            &self.tool(&self.settings.tools.symbol_tool),
            &files,
            &library,
            &self.paths.unpatched,
        )?;
        self.report.offsets_kib = Some(order.covered_kib());
        output::step(format!(
            "{} symbols covering {:.1} KiB",
            order.symbols.len(),
            order.covered_kib()
        ));
        stage.done();
        Ok(())
    }

    fn relink_and_verify(&self) -> Result<()> {
        let builder = self.builder();
        let intent = self.intent(OutputRole::Uninstrumented);
        builder.force_relink()?;
        let paths = builder.build(&intent, &[intent.library_target()])?;
        let matched = verify::verify(
            self.runner,
            &self.tool(&self.settings.tools.check_tool),
            self.config.arch,
            &paths.library,
            &self.paths.orderfile,
        )?;
        if !matched {
            return Err(Error::VerificationFailed {
                library: paths.library,
                orderfile: self.paths.orderfile.clone(),
            });
        }
        output::step("symbol order matches the orderfile");
        Ok(())
    }

    fn benchmark(&mut self) -> Result<()> {
        let env = self.env()?;
        let builder = self.builder();
        let benchmarks = BenchmarkRunner::new(
            self.runner,
            env,
            &builder,
            self.settings,
            &self.config.src_dir,
            self.config.streamline,
        );

        let stage = Stage::start("Benchmarking", "with the orderfile");
        let with_orderfile = benchmarks.run_all(&self.intent(OutputRole::Uninstrumented))?;
        stage.done();

        let stage = Stage::start("Benchmarking", "without an orderfile");
        let backup = OrderfileBackup::empty(&self.paths.orderfile)?;
        let without_orderfile = benchmarks.run_all(&self.intent(OutputRole::NoOrderfile));
        backup.restore()?;
        let without_orderfile = without_orderfile?;
        stage.done();

        // Only Chrome runs speedometer, so WebView reports no speedup.
        let key = self.settings.benchmark.speedometer_label.clone();
        self.report
            .record_benchmarks(with_orderfile, without_orderfile, &key);
        Ok(())
    }
}
