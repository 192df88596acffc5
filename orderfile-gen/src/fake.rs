//! A scripted checkout, device and emulator for pipeline tests.

use std::{
    cell::{Cell, RefCell},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use orderfile_mobile::exec::{Invocation, Output, testing::ScriptedRunner};

pub(crate) const AVD: &str = "android_34_google_apis_x64";

pub(crate) struct FakeChromium {
    /// Final orderfile; the harness reports baseline numbers while it's empty.
    pub orderfile: PathBuf,
    pub physical_device: bool,
    pub emulator_running: Cell<bool>,
    pub emulators_started: Cell<u32>,
    pub verify_ok: Cell<bool>,
    pub symbols: Vec<&'static str>,
    pub total_size: u64,
    pub profiles_per_run: usize,
    pub with_orderfile: Vec<f64>,
    pub without_orderfile: Vec<f64>,
    /// Benchmark name that fails when run.
    pub broken_benchmark: RefCell<Option<String>>,
}

impl FakeChromium {
    pub fn new(orderfile: PathBuf) -> Self {
        Self {
            orderfile,
            physical_device: true,
            emulator_running: Cell::new(false),
            emulators_started: Cell::new(0),
            verify_ok: Cell::new(true),
            symbols: vec!["_ZN4base4InitEv", "", "_ZN7content4MainEv", "_ZN4base4InitEv"],
            total_size: 4096,
            profiles_per_run: 3,
            with_orderfile: vec![100.0, 102.0, 98.0],
            without_orderfile: vec![110.0, 112.0, 108.0],
            broken_benchmark: RefCell::new(None),
        }
    }

    pub fn runner(self: &Rc<Self>) -> ScriptedRunner {
        let fake = Rc::clone(self);
        ScriptedRunner::new(move |invocation| Ok(fake.answer(invocation)))
    }

    fn answer(&self, invocation: &Invocation) -> Output {
        let argv = invocation.argv();
        let args = argv[1..].iter().map(String::as_str).collect::<Vec<_>>();
        let program = Path::new(&argv[0])
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match program.as_str() {
            "adb" => self.adb(&args),
            "emulator" => match args.as_slice() {
                ["-list-avds"] => Output::ok(format!("{AVD}\n")),
                ["-avd", ..] => {
                    self.emulator_running.set(true);
                    self.emulators_started.set(self.emulators_started.get() + 1);
                    Output::ok("")
                }
                other => panic!("unexpected emulator call {other:?}"),
            },
            "gn" | "autoninja" | "siso" => Output::ok(""),
            "pgrep" => Output::exit(1, ""),
            "android_profile_tool.py" => {
                let out = value_after(&args, "--output-directory");
                for n in 0..self.profiles_per_run {
                    fs::write(Path::new(out).join(format!("profile-hitmap-{n}.txt")), "")
                        .unwrap();
                }
                Output::ok("")
            }
            "process_profiles.py" => {
                let out = value_after(&args, "--output");
                fs::write(out, self.symbols.join("\n")).unwrap();
                Output::ok(format!("{{\"total_size\": {}}}\n", self.total_size))
            }
            "check_orderfile.py" => {
                if self.verify_ok.get() {
                    Output::ok("Orderfile matches")
                } else {
                    Output::exit(1, "Symbol _ZN4base4InitEv out of order")
                }
            }
            "run_benchmark" => self.benchmark(&args),
            _ if argv[0].contains("/bin/") => match args.first() {
                Some(&"install") => Output::ok("Installed"),
                Some(&"run") => Output::ok("Successfully loaded native library"),
                other => panic!("unexpected installer call {other:?}"),
            },
            other => panic!("unexpected program {other}"),
        }
    }

    fn adb(&self, args: &[&str]) -> Output {
        match args {
            ["devices"] => {
                let mut list = "List of devices attached\n".to_string();
                if self.physical_device {
                    list.push_str("0123456789ab\tdevice\n");
                }
                if self.emulator_running.get() {
                    list.push_str("emulator-5554\tdevice\n");
                }
                Output::ok(list)
            }
            [.., "emu", "kill"] => {
                self.emulator_running.set(false);
                Output::ok("OK: killing emulator, bye bye")
            }
            [.., "getprop", "sys.boot_completed"] => Output::ok("1"),
            [.., "getprop", "vold.decrypt"] => Output::ok(""),
            [.., "getprop", "ro.build.version.sdk"] => Output::ok("34"),
            other => panic!("unexpected adb call {other:?}"),
        }
    }

    fn benchmark(&self, args: &[&str]) -> Output {
        assert!(
            self.emulator_running.get(),
            "benchmarks run inside an emulator scope"
        );
        let name = args[0];
        if self.broken_benchmark.borrow().as_deref() == Some(name) {
            return Output::exit(1, "Traceback: browser crashed");
        }
        let out = Path::new(flag_value(args, "--output-dir"));
        let baseline = fs::metadata(&self.orderfile).is_ok_and(|meta| meta.len() == 0);
        match flag_value(args, "--output-format") {
            "histograms" => {
                let samples = if baseline {
                    &self.without_orderfile
                } else {
                    &self.with_orderfile
                };
                let histograms = serde_json::json!([
                    {"guid": "a1", "type": "GenericSet", "values": ["speedometer2"]},
                    {"name": "Total", "unit": "ms_smallerIsBetter", "sampleValues": samples},
                ]);
                fs::write(out.join("histograms.json"), histograms.to_string()).unwrap();
            }
            "csv" => {
                let memory = if baseline { 2048.0 } else { 1024.0 };
                fs::write(
                    out.join("results.csv"),
                    format!(
                        "name,unit,stories,avg,count\n\
                         memory:chrome:all_processes:reported_by_os:NativeCodeResidentMemory,bytes,browse:news,{memory},1\n\
                         memory:chrome:all_processes:reported_by_os:PrivateDirtySize,bytes,browse:news,5,1\n\
                         webview_startup_wall_time_avg,ms,load:chrome,300,1\n"
                    ),
                )
                .unwrap();
            }
            other => panic!("unexpected output format {other}"),
        }
        Output::ok("")
    }
}

fn value_after<'a>(args: &[&'a str], flag: &str) -> &'a str {
    let at = args.iter().position(|arg| *arg == flag).unwrap();
    args[at + 1]
}

fn flag_value<'a>(args: &[&'a str], flag: &str) -> &'a str {
    args.iter()
        .find_map(|arg| arg.strip_prefix(flag)?.strip_prefix('='))
        .unwrap()
}
