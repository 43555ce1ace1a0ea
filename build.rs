use std::path::Path;

fn main() {
    // The CLI injects tprof-runtime into profiled programs, so it needs the
    // runtime's version rather than its own.
    let runtime_cargo = Path::new("tprof-runtime").join("Cargo.toml");
    println!("cargo::rerun-if-changed={}", runtime_cargo.display());

    let version = match std::fs::read_to_string(&runtime_cargo) {
        Ok(contents) => contents
            .parse::<toml_edit::DocumentMut>()
            .expect("failed to parse tprof-runtime/Cargo.toml")
            .get("package")
            .and_then(|p| p.get("version"))
            .and_then(|v| v.as_str())
            .expect("missing [package].version in tprof-runtime/Cargo.toml")
            .to_owned(),
        // Installed from crates.io: the sibling crate is absent and both
        // crates are published with the same version.
        Err(_) => std::env::var("CARGO_PKG_VERSION").expect("CARGO_PKG_VERSION not set"),
    };

    println!("cargo::rustc-env=TPROF_RUNTIME_VERSION={version}");
}
