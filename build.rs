use std::env;

const PATH_TO_LINKER_SCRIPT: &str = "kernel.ld";

fn main() -> Result<(), String> {
    // "The build script’s current directory is the source directory of the build script’s
    // package."
    let path = env::current_dir()
        .map_err(|err| format!("Unable to access project directory: {err}"))?
        .into_os_string()
        .into_string()
        .map_err(|err| {
            format!(
                "Project directory path is not valid unicode (approximately {})",
                err.to_string_lossy()
            )
        })?;

    // The kernel binary and the in-kernel test binaries all need the custom
    // memory layout; host tooling (build scripts etc.) must not.
    println!("cargo:rustc-link-arg-bins=--script={path}/{PATH_TO_LINKER_SCRIPT}");
    println!("cargo:rustc-link-arg-tests=--script={path}/{PATH_TO_LINKER_SCRIPT}");
    // Disable section alignment padding between the load segments
    println!("cargo:rustc-link-arg-bins=-n");
    println!("cargo:rustc-link-arg-tests=-n");
    println!("cargo:rerun-if-changed={PATH_TO_LINKER_SCRIPT}");

    Ok(())
}
