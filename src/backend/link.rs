//! Glue between the assembly emitter and the system toolchain: the generated
//! text is assembled and linked by `cc`, and `--run` executes the result,
//! propagating the child's exit status.

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::atomic::{AtomicUsize, Ordering},
};

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn scratch_path(extension: &str) -> PathBuf {
    let unique = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "brook-{}-{unique}.{extension}",
        std::process::id()
    ))
}

fn run_cc(args: &[&str]) -> Result<(), String> {
    let output = Command::new("cc")
        .args(args)
        .output()
        .map_err(|error| format!("cc not found (need system C compiler): {error}"))?;

    if !output.status.success() {
        return Err(format!(
            "cc failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(())
}

fn with_temp_asm<T>(
    asm: &str,
    f: impl FnOnce(&Path) -> Result<T, String>,
) -> Result<T, String> {
    let asm_path = scratch_path("s");
    std::fs::write(&asm_path, asm)
        .map_err(|error| format!("cannot write '{}': {error}", asm_path.display()))?;

    let result = f(&asm_path);
    let _ = std::fs::remove_file(&asm_path);
    result
}

/// `--compile`: assemble to an object file without linking.
pub fn assemble_to_object(asm: &str, output: &Path) -> Result<(), String> {
    with_temp_asm(asm, |asm_path| {
        run_cc(&[
            "-c",
            asm_path.to_str().ok_or("non-UTF-8 scratch path")?,
            "-o",
            output.to_str().ok_or("non-UTF-8 output path")?,
        ])
    })
}

/// Default mode: assemble and link in one `cc` invocation. `-lm` backs the
/// float power intrinsic.
pub fn link_executable(asm: &str, output: &Path) -> Result<(), String> {
    with_temp_asm(asm, |asm_path| {
        run_cc(&[
            "-no-pie",
            asm_path.to_str().ok_or("non-UTF-8 scratch path")?,
            "-o",
            output.to_str().ok_or("non-UTF-8 output path")?,
            "-lm",
        ])
    })
}

/// Runs a produced executable and returns its exit status.
pub fn run_executable(path: &Path) -> Result<i32, String> {
    let status = Command::new(path)
        .status()
        .map_err(|error| format!("failed to run '{}': {error}", path.display()))?;

    // A signal death has no code; report it as a plain failure
    Ok(status.code().unwrap_or(1))
}
