//! Benchmark Runner.
//!
//! Every benchmark runs in a freshly started emulator. A benchmark that
//! fails, whether it's the install, the harness, or parsing its output,
//! is recorded as [`Outcome::Failed`] rather than aborting the run.
//! Failing to build or to bring the emulator up and down again is fatal.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use orderfile_mobile::{
    Env, Invocation, Runner,
    android::{self, Device, EmulatorScope},
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::{
    arch::Browser,
    build::{BuildDriver, BuildIntent, DerivedPaths},
    config::{Settings, Tools},
    error::Result,
    output,
};

/// Either the data or why it couldn't be produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Done(T),
    Failed { error: String },
}

impl<T> Outcome<T> {
    pub fn failed(error: impl ToString) -> Self {
        Outcome::Failed {
            error: error.to_string(),
        }
    }

    pub fn done(&self) -> Option<&T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Failed { .. } => None,
        }
    }
}

impl<T, E: ToString> From<std::result::Result<T, E>> for Outcome<T> {
    fn from(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Done(value),
            Err(err) => Outcome::failed(err),
        }
    }
}

/// metric → story → averages
pub type StoryResults = BTreeMap<String, BTreeMap<String, Vec<f64>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BenchmarkData {
    Samples(Vec<f64>),
    Stories(StoryResults),
}

/// Keyed by [`Benchmark::key`].
pub type BenchmarkResults = BTreeMap<String, Outcome<BenchmarkData>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Benchmark {
    Speedometer,
    NativeCodeMemory,
    WebViewStartup,
}

impl Benchmark {
    pub fn for_browser(browser: Browser) -> &'static [Benchmark] {
        match browser {
            Browser::Chrome => &[Benchmark::Speedometer, Benchmark::NativeCodeMemory],
            Browser::WebView => &[Benchmark::NativeCodeMemory, Benchmark::WebViewStartup],
        }
    }

    /// Harness benchmark name.
    pub fn name(self, settings: &Settings) -> &str {
        let names = &settings.benchmark;
        match self {
            Benchmark::Speedometer => &names.speedometer,
            Benchmark::NativeCodeMemory => &names.memory,
            Benchmark::WebViewStartup => &names.webview_startup,
        }
    }

    /// Key in the report.
    pub fn key(self, settings: &Settings) -> &str {
        match self {
            Benchmark::Speedometer => &settings.benchmark.speedometer_label,
            other => other.name(settings),
        }
    }

    fn output_format(self) -> &'static str {
        match self {
            Benchmark::Speedometer => "histograms",
            Benchmark::NativeCodeMemory | Benchmark::WebViewStartup => "csv",
        }
    }

    fn parse(self, dir: &Path) -> Result<BenchmarkData, String> {
        match self {
            Benchmark::Speedometer => {
                parse_histograms(&dir.join("histograms.json"), "Total").map(BenchmarkData::Samples)
            }
            Benchmark::NativeCodeMemory => parse_csv(&dir.join("results.csv"), |name| {
                name.ends_with("NativeCodeResidentMemory")
            })
            .map(BenchmarkData::Stories),
            Benchmark::WebViewStartup => parse_csv(&dir.join("results.csv"), |name| {
                name.starts_with("webview_startup")
            })
            .map(BenchmarkData::Stories),
        }
    }
}

/// `sampleValues` of the histogram called `name`.
pub fn parse_histograms(path: &Path, name: &str) -> Result<Vec<f64>, String> {
    let text = fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()))?;
    let histograms: Vec<serde_json::Value> =
        serde_json::from_str(&text).map_err(|err| format!("{}: {err}", path.display()))?;
    histograms
        .iter()
        .find(|histogram| histogram.get("name").and_then(|value| value.as_str()) == Some(name))
        .and_then(|histogram| histogram.get("sampleValues")?.as_array())
        .map(|samples| samples.iter().filter_map(|sample| sample.as_f64()).collect())
        .ok_or_else(|| format!("no {name:?} histogram in {}", path.display()))
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    name: String,
    #[serde(default)]
    stories: String,
    avg: Option<f64>,
}

/// Averages of the rows whose name passes `keep`, grouped by name and story.
pub fn parse_csv(path: &Path, keep: impl Fn(&str) -> bool) -> Result<StoryResults, String> {
    let mut reader =
        csv::Reader::from_path(path).map_err(|err| format!("{}: {err}", path.display()))?;
    let mut results = StoryResults::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|err| format!("{}: {err}", path.display()))?;
        let Some(avg) = row.avg.filter(|_| keep(&row.name)) else {
            continue;
        };
        results
            .entry(row.name)
            .or_default()
            .entry(row.stories)
            .or_default()
            .push(avg);
    }
    if results.is_empty() {
        return Err(format!("no matching rows in {}", path.display()));
    }
    Ok(results)
}

pub struct BenchmarkRunner<'a> {
    runner: &'a dyn Runner,
    env: &'a Env,
    builder: &'a BuildDriver<'a>,
    settings: &'a Settings,
    tool: PathBuf,
    repeats: u32,
}

impl<'a> BenchmarkRunner<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        env: &'a Env,
        builder: &'a BuildDriver<'a>,
        settings: &'a Settings,
        src_dir: &Path,
        streamline: bool,
    ) -> Self {
        Self {
            runner,
            env,
            builder,
            settings,
            tool: Tools::resolve(src_dir, &settings.tools.benchmark_tool),
            repeats: if streamline {
                1
            } else {
                settings.benchmark.repeats
            },
        }
    }

    /// Builds `intent` and runs every benchmark for its browser.
    pub fn run_all(&self, intent: &BuildIntent) -> Result<BenchmarkResults> {
        let target = intent.app_target();
        let paths = self.builder.build(intent, &[target.as_str()])?;
        let options = self.settings.emulator.options();

        let mut results = BenchmarkResults::new();
        for &benchmark in Benchmark::for_browser(intent.browser) {
            let scope =
                EmulatorScope::start(self.runner, self.env, &self.settings.emulator.avd, &options)?;
            let outcome = self.run_one(benchmark, intent.browser, &paths, scope.device());
            scope.stop()?;
            if let Outcome::Failed { error } = &outcome {
                output::warn(format!("{} failed: {error}", benchmark.key(self.settings)));
            }
            results.insert(benchmark.key(self.settings).to_owned(), outcome);
        }
        Ok(results)
    }

    fn run_one(
        &self,
        benchmark: Benchmark,
        browser: Browser,
        paths: &DerivedPaths,
        device: &Device,
    ) -> Outcome<BenchmarkData> {
        if let Err(err) = android::install(
            self.runner,
            &paths.installer_script,
            device,
            self.settings.profile.warmup(),
        ) {
            return Outcome::failed(err);
        }
        self.harness(benchmark, browser, paths, device).into()
    }

    fn harness(
        &self,
        benchmark: Benchmark,
        browser: Browser,
        paths: &DerivedPaths,
        device: &Device,
    ) -> Result<BenchmarkData, String> {
        let out = TempDir::new().map_err(|err| err.to_string())?;
        let mut cmd = Invocation::new(&self.tool)
            .arg(benchmark.name(self.settings))
            .arg(format!("--device={}", device.serial_no()));
        cmd = match browser {
            Browser::Chrome => cmd.arg(format!("--browser={}", paths.browser_id)),
            Browser::WebView => cmd
                .arg("--browser=exact")
                .arg(format!("--browser-executable={}", paths.apk.display())),
        };
        cmd = cmd
            .arg(format!("--output-format={}", benchmark.output_format()))
            .arg(format!("--output-dir={}", out.path().display()))
            .arg(format!("--pageset-repeat={}", self.repeats))
            .capture();
        log::info!("running {} on {device}", benchmark.name(self.settings));
        self.runner.run(&cmd).map_err(|err| match err.captured_output() {
            Some(output) => format!("{err}\n{}", output.trim_end()),
            None => err.to_string(),
        })?;
        benchmark.parse(out.path())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        arch::Arch,
        build::{OrderfilePaths, OutputRole},
        config::tests::instant_settings,
        fake::FakeChromium,
    };

    #[test]
    fn histogram_total_is_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("histograms.json");
        fs::write(
            &path,
            r#"[{"guid":"x","type":"GenericSet","values":[1]},
                {"name":"Iteration","sampleValues":[1,2]},
                {"name":"Total","sampleValues":[100.5,102,98]}]"#,
        )
        .unwrap();
        assert_eq!(
            parse_histograms(&path, "Total").unwrap(),
            [100.5, 102.0, 98.0]
        );
        assert!(parse_histograms(&path, "Score").is_err());
    }

    #[test]
    fn csv_rows_are_grouped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(
            &path,
            "name,unit,stories,avg,count\n\
             a:NativeCodeResidentMemory,bytes,s1,10,1\n\
             a:NativeCodeResidentMemory,bytes,s1,12,1\n\
             a:NativeCodeResidentMemory,bytes,s2,,0\n\
             b:PrivateDirtySize,bytes,s1,5,1\n",
        )
        .unwrap();
        let results =
            parse_csv(&path, |name| name.ends_with("NativeCodeResidentMemory")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results["a:NativeCodeResidentMemory"]["s1"], [10.0, 12.0]);
        assert!(!results["a:NativeCodeResidentMemory"].contains_key("s2"));
    }

    #[test]
    fn failure_serializes_as_error_object() {
        let outcome: Outcome<BenchmarkData> = Outcome::failed("harness exited with 1");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"error": "harness exited with 1"})
        );
        let done = Outcome::Done(BenchmarkData::Samples(vec![1.0]));
        assert_eq!(serde_json::to_value(&done).unwrap(), serde_json::json!([1.0]));
    }

    struct Fixture {
        src: TempDir,
        settings: Settings,
        orderfile: OrderfilePaths,
        fake: Rc<FakeChromium>,
        env: Env,
    }

    impl Fixture {
        fn new(browser: Browser) -> Self {
            let src = TempDir::new().unwrap();
            let orderfile = OrderfilePaths::new(src.path(), Arch::Arm64, browser, false);
            let fake = Rc::new(FakeChromium::new(orderfile.orderfile.clone()));
            Self {
                src,
                settings: instant_settings(),
                orderfile,
                fake,
                env: Env::with_tools("adb", "emulator"),
            }
        }

        fn run(&self, runner: &dyn Runner, browser: Browser) -> BenchmarkResults {
            let builder = BuildDriver::new(
                runner,
                self.src.path(),
                &self.settings.tools,
                &self.settings.build_server,
                &self.settings.orderfile.relink_touch_file,
                &self.orderfile,
            );
            let benchmarks = BenchmarkRunner::new(
                runner,
                &self.env,
                &builder,
                &self.settings,
                self.src.path(),
                false,
            );
            let intent = BuildIntent {
                arch: Arch::Arm64,
                browser,
                public: false,
                use_remoteexec: false,
                role: OutputRole::Uninstrumented,
            };
            benchmarks.run_all(&intent).unwrap()
        }
    }

    #[test]
    fn chrome_runs_speedometer_and_memory() {
        let fixture = Fixture::new(Browser::Chrome);
        let runner = fixture.fake.runner();
        let results = fixture.run(&runner, Browser::Chrome);

        assert_eq!(
            results["Speedometer2.0"],
            Outcome::Done(BenchmarkData::Samples(vec![100.0, 102.0, 98.0]))
        );
        assert!(results["orderfile.memory_mobile"].done().is_some());
        assert_eq!(fixture.fake.emulators_started.get(), 2);
        assert!(!fixture.fake.emulator_running.get());

        let harness = runner
            .command_lines()
            .into_iter()
            .find(|line| line.contains("run_benchmark speedometer2"))
            .unwrap();
        assert!(harness.contains("--device=emulator-5554"));
        assert!(harness.contains("--browser=android-trichrome-chrome-google-64-32-bundle"));
        assert!(harness.contains("--pageset-repeat=5"));
    }

    #[test]
    fn webview_uses_exact_apk() {
        let fixture = Fixture::new(Browser::WebView);
        let runner = fixture.fake.runner();
        let results = fixture.run(&runner, Browser::WebView);

        assert_eq!(
            results.keys().collect::<Vec<_>>(),
            ["orderfile.memory_mobile", "system_health.webview_startup"]
        );
        let Outcome::Done(BenchmarkData::Stories(startup)) =
            &results["system_health.webview_startup"]
        else {
            panic!("startup benchmark failed: {results:?}");
        };
        assert_eq!(startup["webview_startup_wall_time_avg"]["load:chrome"], [300.0]);
        assert!(runner.command_lines().iter().any(|line| line
            .contains("--browser=exact --browser-executable=")
            && line.contains("SystemWebView6432.apk")));
    }

    #[test]
    fn failed_benchmark_is_recorded() {
        let fixture = Fixture::new(Browser::Chrome);
        *fixture.fake.broken_benchmark.borrow_mut() = Some("speedometer2".to_string());
        let runner = fixture.fake.runner();
        let results = fixture.run(&runner, Browser::Chrome);

        let Outcome::Failed { error } = &results["Speedometer2.0"] else {
            panic!("expected a failure");
        };
        assert!(error.contains("browser crashed"));
        assert!(results["orderfile.memory_mobile"].done().is_some());
        assert!(!fixture.fake.emulator_running.get());
    }
}
