use std::collections::BTreeSet;

use crate::{Env, Runner, exec};

use super::Emulator;

/// The AVDs the emulator launcher knows about.
pub fn avd_list(runner: &dyn Runner, env: &Env) -> Result<BTreeSet<Emulator>, exec::Error> {
    let cmd = exec::Invocation::new(env.emulator())
        .arg("-list-avds")
        .capture();
    let raw_list = runner.run(&cmd)?.text;
    Ok(parse_avd_list(&raw_list))
}

fn parse_avd_list(raw_list: &str) -> BTreeSet<Emulator> {
    raw_list
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && !is_emulator_log_line(name))
        .map(|name| Emulator::new(name.into()))
        .collect()
}

fn is_emulator_log_line(name: &str) -> bool {
    ["INFO    |", "WARNING |", "ERROR   |"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}
