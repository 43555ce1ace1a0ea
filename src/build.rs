use std::path::{Path, PathBuf};
use std::process::Command;

use ignore::WalkBuilder;
use toml_edit::DocumentMut;

use crate::error::Error;
use crate::resolve::{CrateKind, CrateRoot};

/// Copy the user's package into a staging directory, respecting .gitignore
/// and skipping the `target/` directory.
pub fn prepare_staging(project_root: &Path, staging_dir: &Path) -> Result<(), Error> {
    let walker = WalkBuilder::new(project_root)
        .hidden(false)
        .follow_links(true)
        .filter_entry(|entry| {
            // Skip target/ only at the project root level (depth 1).
            entry.depth() != 1 || entry.file_name().to_string_lossy() != "target"
        })
        .build();

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let source = entry.path();
        let relative = source
            .strip_prefix(project_root)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let dest = staging_dir.join(relative);

        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_some_and(|ft| ft.is_file()) {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(source, &dest)?;
        }
    }

    Ok(())
}

/// Stage a standalone `.rs` file as a one-file Cargo package.
///
/// The package and its binary are named after the sanitized file stem, and
/// the manifest carries an empty `[workspace]` so a staging directory nested
/// in some other workspace still builds on its own. Returns the package name.
pub fn stage_script(script: &Path, staging_dir: &Path) -> Result<String, Error> {
    let source = std::fs::read_to_string(script).map_err(|source| Error::ReadError {
        path: script.to_path_buf(),
        source,
    })?;
    let stem = script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = sanitize_package_name(&stem);

    let mut doc = DocumentMut::new();
    doc["package"] = toml_edit::table();
    doc["package"]["name"] = toml_edit::value(name.as_str());
    doc["package"]["version"] = toml_edit::value("0.0.0");
    doc["package"]["edition"] = toml_edit::value("2024");
    doc["package"]["publish"] = toml_edit::value(false);
    doc["workspace"] = toml_edit::table();

    let src_dir = staging_dir.join("src");
    std::fs::create_dir_all(&src_dir)?;
    std::fs::write(staging_dir.join("Cargo.toml"), doc.to_string())?;
    std::fs::write(src_dir.join("main.rs"), source)?;

    Ok(name)
}

/// Turn a file stem into a valid package name: lowercase ASCII alphanumerics
/// and underscores, not starting with a digit, and not a name Cargo reserves.
pub fn sanitize_package_name(stem: &str) -> String {
    const RESERVED: &[&str] = &[
        "alloc", "core", "proc_macro", "std", "test", "self", "super", "crate", "fn", "mod",
        "main",
    ];

    let mut name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "script_");
    }
    if RESERVED.contains(&name.as_str()) {
        name.push_str("_script");
    }
    name
}

/// How to reference tprof-runtime in the staged Cargo.toml.
pub(crate) enum RuntimeSource<'a> {
    /// Published crate version (e.g. "0.1.0").
    Version(&'a str),
    /// Local path (for development before publishing).
    Path(&'a Path),
}

/// Add `tprof-runtime` as a dependency in the staged package's Cargo.toml.
/// Uses `toml_edit` for structured manipulation (never string replacement).
pub fn inject_runtime_dependency(staging_dir: &Path, runtime_version: &str) -> Result<(), Error> {
    inject_runtime(staging_dir, RuntimeSource::Version(runtime_version))
}

/// Add `tprof-runtime` as a path dependency in the staged package's Cargo.toml.
pub fn inject_runtime_path_dependency(staging_dir: &Path, runtime_path: &Path) -> Result<(), Error> {
    inject_runtime(staging_dir, RuntimeSource::Path(runtime_path))
}

fn inject_runtime(staging_dir: &Path, source: RuntimeSource<'_>) -> Result<(), Error> {
    let cargo_toml_path = staging_dir.join("Cargo.toml");
    let mut doc = read_manifest(staging_dir)?;

    if !doc.contains_table("dependencies") {
        doc["dependencies"] = toml_edit::Item::Table(toml_edit::Table::new());
    }

    match source {
        RuntimeSource::Version(v) => {
            doc["dependencies"]["tprof-runtime"] = toml_edit::value(v);
        }
        RuntimeSource::Path(p) => {
            let mut table = toml_edit::InlineTable::new();
            table.insert("path", p.to_string_lossy().as_ref().into());
            doc["dependencies"]["tprof-runtime"] =
                toml_edit::Item::Value(toml_edit::Value::InlineTable(table));
        }
    }

    std::fs::write(&cargo_toml_path, doc.to_string())?;
    tracing::debug!(manifest = %cargo_toml_path.display(), "injected tprof-runtime dependency");

    Ok(())
}

fn read_manifest(package_dir: &Path) -> Result<DocumentMut, Error> {
    let path = package_dir.join("Cargo.toml");
    if !path.is_file() {
        return Err(Error::NoPackage(package_dir.to_path_buf()));
    }
    let content = std::fs::read_to_string(&path).map_err(|source| Error::ReadError {
        path: path.clone(),
        source,
    })?;
    content
        .parse::<DocumentMut>()
        .map_err(|e| Error::BuildFailed(format!("failed to parse {}: {e}", path.display())))
}

/// The `[package].name` of the manifest in `package_dir`.
pub fn package_name(package_dir: &Path) -> Result<String, Error> {
    let doc = read_manifest(package_dir)?;
    manifest_package_name(&doc)
}

fn manifest_package_name(doc: &DocumentMut) -> Result<String, Error> {
    doc.get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .map(String::from)
        .ok_or_else(|| Error::BuildFailed("Cargo.toml missing package.name".into()))
}

/// Extract human-readable compiler errors from cargo's JSON output.
fn extract_rendered_errors(json_output: &str) -> Vec<String> {
    json_output
        .lines()
        .filter_map(|line| {
            let msg: serde_json::Value = serde_json::from_str(line).ok()?;
            if msg.get("reason")?.as_str()? != "compiler-message" {
                return None;
            }
            msg.get("message")?
                .get("rendered")?
                .as_str()
                .map(String::from)
        })
        .collect()
}

/// Find the workspace root for a package directory.
///
/// Walks up from `project_dir` looking for the nearest parent `Cargo.toml`
/// containing a `[workspace]` table. Does not validate that this package
/// is an actual member of the workspace -- Cargo will catch mismatches at
/// build time. Returns `None` if no workspace root is found.
pub fn find_workspace_root(project_dir: &Path) -> Option<PathBuf> {
    let project_dir = project_dir.canonicalize().ok()?;
    let mut dir = project_dir.parent()?;
    loop {
        let cargo_toml = dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml).ok()?;
            let doc: DocumentMut = content.parse().ok()?;
            if doc.get("workspace").is_some() {
                return Some(dir.to_path_buf());
            }
        }
        dir = dir.parent()?;
    }
}

/// A binary target of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinTarget {
    pub name: String,
    /// Relative to the package directory.
    pub path: PathBuf,
}

/// Find the binary entry point for a Cargo package.
///
/// Reads `Cargo.toml` and resolves the entry point using Cargo's rules:
///
/// 1. `[[bin]]` entries with an explicit `path` field -- returns the first match.
/// 2. `[[bin]]` entries with a `name` but no `path` -- infers the source as
///    `src/bin/<name>.rs` or `src/bin/<name>/main.rs` (Cargo's convention).
/// 3. Falls back to `src/main.rs`, named after the package.
/// 4. Falls back to the first auto-discovered `src/bin/*.rs`.
///
/// When multiple `[[bin]]` entries exist, the first match (in declaration order)
/// is used. Returns an error if no entry point can be found.
pub fn find_bin_entry_point(project_dir: &Path) -> Result<BinTarget, Error> {
    let doc = read_manifest(project_dir)?;
    let package = manifest_package_name(&doc)?;

    if let Some(bins) = doc.get("bin").and_then(|b| b.as_array_of_tables()) {
        for bin in bins {
            if let Some(path) = bin.get("path").and_then(|p| p.as_str()) {
                let name = bin
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or(&package)
                    .to_string();
                return Ok(BinTarget {
                    name,
                    path: PathBuf::from(path),
                });
            }
        }

        for bin in bins {
            if let Some(name) = bin.get("name").and_then(|n| n.as_str()) {
                let single_file = PathBuf::from("src").join("bin").join(format!("{name}.rs"));
                if project_dir.join(&single_file).exists() {
                    return Ok(BinTarget {
                        name: name.to_string(),
                        path: single_file,
                    });
                }

                let dir_main = PathBuf::from("src").join("bin").join(name).join("main.rs");
                if project_dir.join(&dir_main).exists() {
                    return Ok(BinTarget {
                        name: name.to_string(),
                        path: dir_main,
                    });
                }
            }
        }
    }

    let default = PathBuf::from("src").join("main.rs");
    if project_dir.join(&default).exists() {
        return Ok(BinTarget {
            name: package,
            path: default,
        });
    }

    if let Some(bin) = discover_bin_file(project_dir) {
        return Ok(bin);
    }

    Err(Error::BuildFailed(format!(
        "could not find binary entry point: no [[bin]] path in Cargo.toml and {} does not exist",
        project_dir.join(&default).display()
    )))
}

fn discover_bin_file(project_dir: &Path) -> Option<BinTarget> {
    let bin_dir = project_dir.join("src").join("bin");
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&bin_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect();
    candidates.sort();
    let first = candidates.into_iter().next()?;
    let name = first.file_stem()?.to_string_lossy().into_owned();
    Some(BinTarget {
        path: PathBuf::from("src").join("bin").join(format!("{name}.rs")),
        name,
    })
}

/// Find the package's library crate root, if it has one.
///
/// Uses `[lib].path` when present, otherwise Cargo's `src/lib.rs`. The crate
/// name comes from `[lib].name`, falling back to the package name.
pub fn find_lib_root(project_dir: &Path) -> Result<Option<CrateRoot>, Error> {
    let doc = read_manifest(project_dir)?;
    let package = manifest_package_name(&doc)?;
    let lib = doc.get("lib");

    let path = lib
        .and_then(|l| l.get("path"))
        .and_then(|p| p.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("src").join("lib.rs"));
    if !project_dir.join(&path).is_file() {
        return Ok(None);
    }

    let name = lib
        .and_then(|l| l.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or(&package);
    Ok(Some(CrateRoot {
        kind: CrateKind::Lib,
        name: crate_name(name),
        root: path,
    }))
}

/// The crates tprof instruments in a package: its binary, then its library
/// if present.
pub fn crate_roots(project_dir: &Path) -> Result<(BinTarget, Vec<CrateRoot>), Error> {
    let bin = find_bin_entry_point(project_dir)?;
    let mut crates = vec![CrateRoot {
        kind: CrateKind::Bin,
        name: crate_name(&bin.name),
        root: bin.path.clone(),
    }];
    crates.extend(find_lib_root(project_dir)?);
    Ok((bin, crates))
}

/// The name a target is referred to by in paths.
pub fn crate_name(target_name: &str) -> String {
    target_name.replace('-', "_")
}

/// Build the instrumented binary using `cargo build --message-format=json`.
/// Returns the path to the compiled executable.
///
/// When `package` is `Some`, passes `-p <name>` to cargo to build a specific
/// workspace member (used when staging an entire workspace).
pub fn build_instrumented(
    staging_dir: &Path,
    target_dir: &Path,
    package: Option<&str>,
    bin: &str,
) -> Result<PathBuf, Error> {
    // Remove RUSTUP_TOOLCHAIN so the profiled package's rust-toolchain.toml
    // is respected. Without this, nested cargo invocations inherit the
    // parent's toolchain, ignoring the package's pinned version.
    let mut cmd = Command::new("cargo");
    cmd.arg("build")
        .arg("--message-format=json")
        .arg("--bin")
        .arg(bin)
        .env("CARGO_TARGET_DIR", target_dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .current_dir(staging_dir);
    if let Some(pkg) = package {
        cmd.arg("-p").arg(pkg);
    }
    tracing::info!(staging = %staging_dir.display(), target_dir = %target_dir.display(), bin, "building instrumented program");
    let output = cmd.output()?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let rendered = extract_rendered_errors(&stdout);
        if rendered.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::BuildFailed(stderr.into_owned()));
        }
        return Err(Error::BuildFailed(rendered.join("")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    find_executable(&stdout, bin)
        .ok_or_else(|| Error::BuildFailed("no executable found in cargo build output".into()))
}

/// The executable of the binary target `bin` in cargo's JSON output.
/// Cargo emits dependencies first, so the last matching artifact wins.
fn find_executable(json_output: &str, bin: &str) -> Option<PathBuf> {
    let mut binary_path = None;
    for line in json_output.lines() {
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if msg.get("reason").and_then(|r| r.as_str()) != Some("compiler-artifact") {
            continue;
        }
        let Some(exe) = msg.get("executable").and_then(|e| e.as_str()) else {
            continue;
        };
        let target_name = msg
            .get("target")
            .and_then(|t| t.get("name"))
            .and_then(|n| n.as_str());
        if target_name.is_none_or(|name| name == bin) {
            binary_path = Some(PathBuf::from(exe));
        }
    }
    binary_path
}
