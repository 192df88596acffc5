//! Verifier: checks that the linked library follows the orderfile.

use std::path::Path;

use orderfile_mobile::{Invocation, Runner};

use crate::{arch::Arch, error::Result};

/// Whether the symbols of `library` appear in the order `orderfile` lists
/// them. The check tool's exit code is the verdict.
pub fn verify(
    runner: &dyn Runner,
    tool: &Path,
    arch: Arch,
    library: &Path,
    orderfile: &Path,
) -> Result<bool> {
    let cmd = Invocation::new(tool)
        .args(["--target-arch", arch.as_str()])
        .arg(library)
        .arg(orderfile)
        .capture()
        .unchecked();
    let output = runner.run(&cmd)?;
    if !output.success() {
        log::warn!("{cmd} reported a mismatch:\n{}", output.text.trim_end());
    }
    Ok(output.success())
}
