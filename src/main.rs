use std::path::{Path, PathBuf};
use std::process::{self, Command, ExitStatus};

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use tprof::build::{
    BinTarget, build_instrumented, crate_roots, find_workspace_root, inject_runtime_dependency,
    inject_runtime_path_dependency, package_name, prepare_staging, stage_script,
};
use tprof::error::Error;
use tprof::resolve::{
    CrateKind, CrateRoot, ResolvedTarget, SourceMap, TargetSpec, collect_sites, resolve_targets,
};
use tprof::rewrite::{
    CODES_MODULE, CodeTable, RegionSpec, append_code_table, instrument_source, probes_by_file,
    wrap_main,
};

#[derive(Parser, Debug)]
#[command(
    name = "tprof",
    about = "Time chosen functions of a Rust program and report per-function call statistics",
    version,
    override_usage = "tprof [-x] -t TARGET [-t TARGET ...] (SCRIPT | -m MODULE) [ARGS]...",
    after_help = "Targets are `module:qualname`, e.g. `mini::parser:Parser::parse`.\n\
                  Without a `:` a target names an item in the program's root module."
)]
struct Cli {
    /// Function to time, as `module:qualname` (repeatable).
    #[arg(short = 't', long = "target", value_name = "TARGET", required = true)]
    targets: Vec<String>,

    /// Compare each target's mean time against the first target.
    #[arg(short = 'x', long)]
    compare: bool,

    /// Profile a Cargo package directory instead of a script.
    #[arg(short = 'm', long = "module", value_name = "MODULE")]
    module: Option<PathBuf>,

    /// Path to tprof-runtime source (for development before publishing).
    #[arg(long, hide = true, env = "TPROF_RUNTIME_PATH")]
    runtime_path: Option<PathBuf>,

    /// Script to run (unless -m is given), then arguments passed to the program.
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    args: Vec<String>,
}

/// What to build.
#[derive(Debug)]
enum Program {
    Script(PathBuf),
    Package(PathBuf),
}

/// A program staged for instrumentation.
struct Staged {
    /// Directory to run cargo in.
    root: PathBuf,
    /// The profiled package inside `root`.
    package_dir: PathBuf,
    /// `-p` argument when `root` is a workspace.
    package: Option<String>,
    bin: BinTarget,
    crates: Vec<CrateRoot>,
    target_dir: PathBuf,
}

fn main() {
    if std::env::args_os().len() <= 1 {
        let _ = Cli::command().print_help();
        process::exit(2);
    }

    let cli = Cli::parse();
    init_tracing();

    if let Some(flag) = stray_flag(cli.module.as_deref(), &cli.args) {
        Cli::command()
            .error(
                ErrorKind::UnknownArgument,
                format!("unexpected argument '{flag}' found"),
            )
            .exit();
    }

    let (program, args) = split_program(cli.module.clone(), cli.args.clone());
    let Some(program) = program else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "one of SCRIPT or -m MODULE is required",
            )
            .exit();
    };

    match run(&cli, program, &args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            anstream::eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TPROF_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// An unknown flag where the script path should be. With `-m` the program's
/// arguments may start with a flag.
fn stray_flag<'a>(module: Option<&Path>, args: &'a [String]) -> Option<&'a str> {
    match (module, args.first()) {
        (None, Some(first)) if first.starts_with('-') && first != "-" => Some(first.as_str()),
        _ => None,
    }
}

/// With `-m` every positional argument goes to the program; otherwise the
/// first one is the script.
fn split_program(module: Option<PathBuf>, mut args: Vec<String>) -> (Option<Program>, Vec<String>) {
    match module {
        Some(dir) => (Some(Program::Package(dir)), args),
        None if args.is_empty() => (None, args),
        None => {
            let script = args.remove(0);
            (Some(Program::Script(PathBuf::from(script))), args)
        }
    }
}

fn run(cli: &Cli, program: Program, args: &[String]) -> Result<i32, Error> {
    let specs: Vec<TargetSpec> = cli.targets.iter().map(|t| TargetSpec::parse(t)).collect();

    let staging = tempfile::tempdir()?;
    let staged = stage(&program, staging.path())?;

    // Resolution errors surface before anything is built.
    let map = collect_sites(&staged.package_dir, &staged.crates)?;
    let targets = resolve_targets(&specs, &staged.crates, &map)?;
    instrument(&staged, &map, &targets, cli.compare)?;

    match &cli.runtime_path {
        Some(path) => {
            let abs_path = std::fs::canonicalize(path)?;
            inject_runtime_path_dependency(&staged.package_dir, &abs_path)?;
        }
        None => inject_runtime_dependency(&staged.package_dir, env!("TPROF_RUNTIME_VERSION"))?,
    }

    let binary = build_instrumented(
        &staged.root,
        &staged.target_dir,
        staged.package.as_deref(),
        &staged.bin.name,
    )?;

    tracing::info!(binary = %binary.display(), "running instrumented program");
    let status = Command::new(&binary)
        .args(args)
        .status()
        .map_err(|e| Error::RunFailed(format!("failed to run {}: {e}", binary.display())))?;

    Ok(exit_code(status))
}

fn stage(program: &Program, staging: &Path) -> Result<Staged, Error> {
    match program {
        Program::Script(script) => {
            let name = stage_script(script, staging)?;
            let (bin, crates) = crate_roots(staging)?;
            tracing::debug!(script = %script.display(), package = %name, "staged script");
            Ok(Staged {
                root: staging.to_path_buf(),
                package_dir: staging.to_path_buf(),
                package: None,
                bin,
                crates,
                target_dir: target_dir(|| std::env::temp_dir().join("tprof").join("target")),
            })
        }
        Program::Package(dir) => {
            if !dir.join("Cargo.toml").is_file() {
                return Err(Error::NoPackage(dir.clone()));
            }
            let project = std::fs::canonicalize(dir)?;

            // A workspace member is staged from the workspace root so
            // inherited fields and path dependencies keep resolving.
            let (root, member) = match find_workspace_root(&project) {
                Some(ws_root) => {
                    let relative = project
                        .strip_prefix(&ws_root)
                        .map_err(|e| std::io::Error::other(e.to_string()))?
                        .to_path_buf();
                    (ws_root, Some(relative))
                }
                None => (project.clone(), None),
            };

            prepare_staging(&root, staging)?;
            let package_dir = match &member {
                Some(relative) => staging.join(relative),
                None => staging.to_path_buf(),
            };
            let package = match member {
                Some(_) => Some(package_name(&package_dir)?),
                None => None,
            };
            let (bin, crates) = crate_roots(&package_dir)?;
            tracing::debug!(package = %project.display(), bin = %bin.name, "staged package");

            Ok(Staged {
                root: staging.to_path_buf(),
                package_dir,
                package,
                bin,
                crates,
                target_dir: target_dir(|| project.join("target").join("tprof")),
            })
        }
    }
}

fn target_dir(default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var_os("TPROF_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(default)
}

/// Rewrite the staged sources: frames in every target function, a code table
/// in each crate that needs one, and a profiling region around `main`.
fn instrument(
    staged: &Staged,
    map: &SourceMap,
    targets: &[ResolvedTarget],
    compare: bool,
) -> Result<(), Error> {
    let table = CodeTable::from_targets(targets);
    let files = probes_by_file(map, &table);

    for file in &files {
        rewrite_file(&staged.package_dir, &file.path, |source| {
            instrument_source(source, &file.module, &file.probes)
        })?;
        tracing::debug!(file = %file.path.display(), probes = file.probes.len(), "instrumented");
    }

    let mut tables = Vec::new();
    for (krate, root) in staged.crates.iter().enumerate() {
        let slots = table.crate_slots(krate, map, &files);
        if slots.is_empty() {
            continue;
        }
        rewrite_file(&staged.package_dir, &root.root, |source| {
            append_code_table(source, &table, krate, &slots)
        })?;
        if table.entries.iter().any(|e| e.krate == krate) {
            tables.push(match root.kind {
                CrateKind::Bin => format!("crate::{CODES_MODULE}"),
                CrateKind::Lib => format!("::{}::{CODES_MODULE}", root.name),
            });
        }
    }

    let region = RegionSpec {
        targets: targets.iter().map(|t| t.spec.raw.clone()).collect(),
        compare,
        tables,
    };
    let bin_root = &staged.bin.path;
    rewrite_file(&staged.package_dir, bin_root, |source| wrap_main(source, &region))
}

fn rewrite_file(
    package_dir: &Path,
    relative: &Path,
    rewrite: impl FnOnce(&str) -> Result<String, syn::Error>,
) -> Result<(), Error> {
    let path = package_dir.join(relative);
    let source = std::fs::read_to_string(&path).map_err(|source| Error::ReadError {
        path: relative.to_path_buf(),
        source,
    })?;
    let rewritten = rewrite(&source).map_err(|source| Error::ParseError {
        path: relative.to_path_buf(),
        source,
    })?;
    std::fs::write(&path, rewritten)?;
    Ok(())
}

/// The status to exit with: the program's own code, or 1 when it was killed
/// by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
