use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use syn::ext::IdentExt;
use syn::visit::Visit;

use crate::error::Error;

/// A `-t` argument: `module:qualname`, or a bare `qualname` naming an item in
/// the program's root module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// The argument as given. Also the label the report shows.
    pub raw: String,
    /// Rust module path (`mini`, `mini::parser`), or `None` for the root module
    /// of the binary crate.
    pub module: Option<String>,
    pub qualname: String,
}

impl TargetSpec {
    /// Split at the first `:` that is not part of a `::` path separator.
    pub fn parse(raw: &str) -> Self {
        match find_separator(raw) {
            Some(at) => Self {
                raw: raw.to_owned(),
                module: Some(raw[..at].to_owned()),
                qualname: raw[at + 1..].to_owned(),
            },
            None => Self {
                raw: raw.to_owned(),
                module: None,
                qualname: raw.to_owned(),
            },
        }
    }
}

fn find_separator(raw: &str) -> Option<usize> {
    let bytes = raw.as_bytes();
    (0..bytes.len()).find(|&i| {
        bytes[i] == b':' && (i == 0 || bytes[i - 1] != b':') && bytes.get(i + 1) != Some(&b':')
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrateKind {
    Bin,
    Lib,
}

/// One crate of the profiled package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrateRoot {
    pub kind: CrateKind,
    /// Crate name as written in paths (`-` replaced by `_`).
    pub name: String,
    /// Root source file, relative to the package directory.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Function,
    ConstFn,
    Const,
    Static,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemKind::Function => "fn",
            ItemKind::ConstFn => "const fn",
            ItemKind::Const => "const",
            ItemKind::Static => "static",
        })
    }
}

/// A named item found in a crate's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    /// Index into the crate list passed to [`collect_sites`].
    pub krate: usize,
    pub file: PathBuf,
    pub module: String,
    pub qualname: String,
    pub kind: ItemKind,
}

/// A source file reachable from a crate root, with the module its top level
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub krate: usize,
    /// Relative to the package directory.
    pub path: PathBuf,
    pub module: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    pub files: Vec<SourceFile>,
    pub sites: Vec<Site>,
}

/// Walk every crate from its root file through `mod` declarations and record
/// the functions, methods and value items each module defines.
///
/// Module declarations whose file does not exist (typically behind a `cfg`
/// for another platform) are skipped.
pub fn collect_sites(package_dir: &Path, crates: &[CrateRoot]) -> Result<SourceMap, Error> {
    let mut map = SourceMap::default();

    for (krate, root) in crates.iter().enumerate() {
        let child_dir = root.root.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut queue = VecDeque::from([PendingFile {
            path: root.root.clone(),
            module: root.name.clone(),
            child_dir,
        }]);

        while let Some(pending) = queue.pop_front() {
            if map
                .files
                .iter()
                .any(|f| f.krate == krate && f.path == pending.path)
            {
                continue;
            }
            let source = std::fs::read_to_string(package_dir.join(&pending.path)).map_err(
                |source| Error::ReadError {
                    path: pending.path.clone(),
                    source,
                },
            )?;
            let syntax = syn::parse_file(&source).map_err(|source| Error::ParseError {
                path: pending.path.clone(),
                source,
            })?;

            let mut collector = SiteCollector::new(package_dir, krate, &pending);
            collector.visit_file(&syntax);
            map.sites.extend(collector.sites);
            queue.extend(collector.pending);
            map.files.push(SourceFile {
                krate,
                path: pending.path,
                module: pending.module,
            });
        }
    }

    Ok(map)
}

/// A target matched to the crate that defines it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub spec: TargetSpec,
    pub krate: usize,
    pub module: String,
}

impl ResolvedTarget {
    pub fn qualname(&self) -> &str {
        &self.spec.qualname
    }
}

/// Match each target against the collected sites.
///
/// Crates are searched in order, so a binary crate shadows a library crate
/// of the same name. A target that names only a `const`, `static` or
/// `const fn` has no call to time and is rejected the way the runtime rejects
/// non-code objects.
pub fn resolve_targets(
    specs: &[TargetSpec],
    crates: &[CrateRoot],
    map: &SourceMap,
) -> Result<Vec<ResolvedTarget>, Error> {
    if specs.is_empty() {
        return Err(tprof_runtime::Error::NoTargets.into());
    }

    let mut resolved = Vec::with_capacity(specs.len());
    for spec in specs {
        let module = match &spec.module {
            Some(module) => module.clone(),
            None => crates.first().map(|c| c.name.clone()).unwrap_or_default(),
        };

        let found = (0..crates.len()).find_map(|krate| {
            let matching: Vec<&Site> = map
                .sites
                .iter()
                .filter(|s| s.krate == krate && s.module == module && s.qualname == spec.qualname)
                .collect();
            (!matching.is_empty()).then_some((krate, matching))
        });

        let Some((krate, matching)) = found else {
            return Err(tprof_runtime::Error::Unresolved {
                name: spec.raw.clone(),
            }
            .into());
        };

        if !matching.iter().any(|s| s.kind == ItemKind::Function) {
            let site = matching[0];
            return Err(tprof_runtime::Error::NotCode(format!(
                "{} {}::{}",
                site.kind, site.module, site.qualname
            ))
            .into());
        }

        tracing::debug!(raw = %spec.raw, crate_index = krate, %module, "resolved target");
        resolved.push(ResolvedTarget {
            spec: spec.clone(),
            krate,
            module,
        });
    }

    Ok(resolved)
}

struct PendingFile {
    path: PathBuf,
    module: String,
    /// Directory that `mod name;` declarations at the file's top level resolve against.
    child_dir: PathBuf,
}

/// AST visitor that records the items of one file. Function bodies are not
/// entered: items declared inside them are not addressable by path.
struct SiteCollector<'a> {
    package_dir: &'a Path,
    krate: usize,
    file: PathBuf,
    modules: Vec<String>,
    dirs: Vec<PathBuf>,
    current_impl: Option<String>,
    current_trait: Option<String>,
    sites: Vec<Site>,
    pending: Vec<PendingFile>,
}

impl<'a> SiteCollector<'a> {
    fn new(package_dir: &'a Path, krate: usize, file: &PendingFile) -> Self {
        Self {
            package_dir,
            krate,
            file: file.path.clone(),
            modules: file.module.split("::").map(String::from).collect(),
            dirs: vec![file.child_dir.clone()],
            current_impl: None,
            current_trait: None,
            sites: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn push(&mut self, qualname: String, kind: ItemKind) {
        self.sites.push(Site {
            krate: self.krate,
            file: self.file.clone(),
            module: self.modules.join("::"),
            qualname,
            kind,
        });
    }

    fn current_dir(&self) -> PathBuf {
        self.dirs.last().cloned().unwrap_or_default()
    }

    /// Locate the file behind `mod name;` using Cargo's lookup rules.
    fn module_file(&self, name: &str, path_attr: Option<&str>) -> Option<(PathBuf, PathBuf)> {
        let dir = self.current_dir();
        if let Some(path) = path_attr {
            // At a file's top level `#[path]` is relative to the file itself.
            let base = if self.dirs.len() == 1 {
                self.file.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                dir
            };
            let file = base.join(path);
            let child_dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
            return Some((file, child_dir));
        }

        let flat = dir.join(format!("{name}.rs"));
        if self.package_dir.join(&flat).is_file() {
            return Some((flat, dir.join(name)));
        }
        let nested = dir.join(name).join("mod.rs");
        if self.package_dir.join(&nested).is_file() {
            return Some((nested, dir.join(name)));
        }
        None
    }
}

impl<'ast> Visit<'ast> for SiteCollector<'_> {
    fn visit_item_fn(&mut self, node: &'ast syn::ItemFn) {
        let kind = fn_kind(&node.sig);
        self.push(node.sig.ident.unraw().to_string(), kind);
    }

    fn visit_item_impl(&mut self, node: &'ast syn::ItemImpl) {
        let type_name = type_name_from_type(&node.self_ty);
        let prev = self.current_impl.replace(type_name);
        syn::visit::visit_item_impl(self, node);
        self.current_impl = prev;
    }

    fn visit_impl_item_fn(&mut self, node: &'ast syn::ImplItemFn) {
        let method = node.sig.ident.unraw().to_string();
        let qualname = match &self.current_impl {
            Some(ty) => format!("{ty}::{method}"),
            None => method,
        };
        self.push(qualname, fn_kind(&node.sig));
    }

    fn visit_item_trait(&mut self, node: &'ast syn::ItemTrait) {
        let prev = self.current_trait.replace(node.ident.unraw().to_string());
        syn::visit::visit_item_trait(self, node);
        self.current_trait = prev;
    }

    fn visit_trait_item_fn(&mut self, node: &'ast syn::TraitItemFn) {
        // Only default bodies have code to time.
        if node.default.is_none() {
            return;
        }
        let method = node.sig.ident.unraw().to_string();
        let qualname = match &self.current_trait {
            Some(trait_name) => format!("{trait_name}::{method}"),
            None => method,
        };
        self.push(qualname, fn_kind(&node.sig));
    }

    fn visit_item_const(&mut self, node: &'ast syn::ItemConst) {
        self.push(node.ident.unraw().to_string(), ItemKind::Const);
    }

    fn visit_item_static(&mut self, node: &'ast syn::ItemStatic) {
        self.push(node.ident.unraw().to_string(), ItemKind::Static);
    }

    fn visit_item_mod(&mut self, node: &'ast syn::ItemMod) {
        let name = node.ident.unraw().to_string();
        let path_attr = path_attribute(&node.attrs);

        match &node.content {
            Some((_, items)) => {
                let dir = match &path_attr {
                    Some(path) => self.current_dir().join(path),
                    None => self.current_dir().join(&name),
                };
                self.modules.push(name);
                self.dirs.push(dir);
                for item in items {
                    self.visit_item(item);
                }
                self.dirs.pop();
                self.modules.pop();
            }
            None => {
                let module = format!("{}::{name}", self.modules.join("::"));
                match self.module_file(&name, path_attr.as_deref()) {
                    Some((path, child_dir)) => self.pending.push(PendingFile {
                        path,
                        module,
                        child_dir,
                    }),
                    None => tracing::debug!(%module, "no source file for module declaration"),
                }
            }
        }
    }
}

fn fn_kind(sig: &syn::Signature) -> ItemKind {
    if sig.constness.is_some() {
        ItemKind::ConstFn
    } else {
        ItemKind::Function
    }
}

fn path_attribute(attrs: &[syn::Attribute]) -> Option<String> {
    attrs.iter().find_map(|attr| {
        if !attr.path().is_ident("path") {
            return None;
        }
        match &attr.meta {
            syn::Meta::NameValue(syn::MetaNameValue {
                value:
                    syn::Expr::Lit(syn::ExprLit {
                        lit: syn::Lit::Str(path),
                        ..
                    }),
                ..
            }) => Some(path.value()),
            _ => None,
        }
    })
}

/// Extract a human-readable type name from a `syn::Type` (best-effort).
pub(crate) fn type_name_from_type(ty: &syn::Type) -> String {
    match ty {
        syn::Type::Path(tp) => tp
            .path
            .segments
            .last()
            .map(|seg| seg.ident.unraw().to_string())
            .unwrap_or_else(|| "_".to_string()),
        syn::Type::Reference(reference) => type_name_from_type(&reference.elem),
        _ => "_".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use tprof_runtime::ErrorKind;

    use super::*;

    fn create_file(base: &Path, relative: &str, content: &str) {
        let path = base.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn bin(name: &str) -> CrateRoot {
        CrateRoot {
            kind: CrateKind::Bin,
            name: name.into(),
            root: PathBuf::from("src/main.rs"),
        }
    }

    fn lib(name: &str) -> CrateRoot {
        CrateRoot {
            kind: CrateKind::Lib,
            name: name.into(),
            root: PathBuf::from("src/lib.rs"),
        }
    }

    /// Build a package with a binary and a library crate, both named `mini`.
    fn create_test_package(dir: &Path) {
        create_file(
            dir,
            "src/main.rs",
            "\
mod parser;
mod render;
#[path = \"extra/odd_name.rs\"]
mod odd;
#[cfg(windows)]
mod missing;

const LIMIT: usize = 3;
static GREETING: &str = \"hi\";

fn main() { walk(); }
fn walk() {
    fn nested() {}
    nested();
}
const fn square(x: u32) -> u32 { x * x }

mod inline {
    pub fn helper() {}
    pub mod deeper {
        pub fn leaf() {}
    }
}
",
        );
        create_file(
            dir,
            "src/parser.rs",
            "\
mod lexer;
pub struct Parser;
impl Parser {
    pub fn parse(&self) -> bool { true }
}
pub trait Visit {
    fn visit(&self) {}
    fn required(&self);
}
impl Visit for Parser {
    fn required(&self) {}
}
",
        );
        create_file(dir, "src/parser/lexer.rs", "pub fn lex() {}\n");
        create_file(dir, "src/render/mod.rs", "pub fn draw() {}\n");
        create_file(dir, "src/extra/odd_name.rs", "pub fn odd() {}\n");
        create_file(dir, "src/lib.rs", "pub fn shared() {}\npub fn walk() {}\n");
    }

    fn qualnames(map: &SourceMap, module: &str) -> Vec<String> {
        let mut names: Vec<String> = map
            .sites
            .iter()
            .filter(|s| s.module == module)
            .map(|s| s.qualname.clone())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn parse_splits_at_single_colon() {
        let spec = TargetSpec::parse("mini::parser:Parser::parse");
        assert_eq!(spec.module.as_deref(), Some("mini::parser"));
        assert_eq!(spec.qualname, "Parser::parse");
        assert_eq!(spec.raw, "mini::parser:Parser::parse");
    }

    #[test]
    fn parse_without_colon_targets_root_module() {
        let spec = TargetSpec::parse("walk");
        assert_eq!(spec.module, None);
        assert_eq!(spec.qualname, "walk");

        let spec = TargetSpec::parse("Parser::parse");
        assert_eq!(spec.module, None);
        assert_eq!(spec.qualname, "Parser::parse");
    }

    #[test]
    fn collects_items_through_module_tree() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());

        let crates = [bin("mini"), lib("mini")];
        let map = collect_sites(tmp.path(), &crates).unwrap();

        let root: Vec<String> = map
            .sites
            .iter()
            .filter(|s| s.krate == 0 && s.module == "mini")
            .map(|s| s.qualname.clone())
            .collect();
        assert_eq!(root, ["LIMIT", "GREETING", "main", "walk", "square"]);

        assert_eq!(
            qualnames(&map, "mini::parser"),
            ["Parser::parse", "Parser::required", "Visit::visit"]
        );
        assert_eq!(qualnames(&map, "mini::parser::lexer"), ["lex"]);
        assert_eq!(qualnames(&map, "mini::render"), ["draw"]);
        assert_eq!(qualnames(&map, "mini::odd"), ["odd"]);
        assert_eq!(qualnames(&map, "mini::inline"), ["helper"]);
        assert_eq!(qualnames(&map, "mini::inline::deeper"), ["leaf"]);
    }

    #[test]
    fn nested_fns_are_not_sites() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());

        let map = collect_sites(tmp.path(), &[bin("mini")]).unwrap();
        assert!(!map.sites.iter().any(|s| s.qualname == "nested"));
    }

    #[test]
    fn source_files_record_their_module() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());

        let map = collect_sites(tmp.path(), &[bin("mini")]).unwrap();
        let lexer = map
            .files
            .iter()
            .find(|f| f.path == Path::new("src/parser/lexer.rs"))
            .unwrap();
        assert_eq!(lexer.module, "mini::parser::lexer");
        assert_eq!(map.files[0].path, Path::new("src/main.rs"));
        assert_eq!(map.files.len(), 5);
    }

    #[test]
    fn parse_error_names_file() {
        let tmp = TempDir::new().unwrap();
        create_file(tmp.path(), "src/main.rs", "mod broken;\nfn main() {}\n");
        create_file(tmp.path(), "src/broken.rs", "fn oops( {\n");

        let err = collect_sites(tmp.path(), &[bin("mini")]).unwrap_err();
        assert!(matches!(err, Error::ParseError { .. }));
        assert!(err.to_string().contains("broken.rs"), "{err}");
    }

    #[test]
    fn resolves_module_and_bare_targets() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());
        let crates = [bin("mini"), lib("mini")];
        let map = collect_sites(tmp.path(), &crates).unwrap();

        let specs = [
            TargetSpec::parse("mini::parser:Parser::parse"),
            TargetSpec::parse("walk"),
            TargetSpec::parse("mini:shared"),
        ];
        let resolved = resolve_targets(&specs, &crates, &map).unwrap();

        assert_eq!(resolved[0].module, "mini::parser");
        assert_eq!(resolved[0].qualname(), "Parser::parse");
        assert_eq!(resolved[0].krate, 0);
        // The binary crate shadows the library's `walk`.
        assert_eq!(resolved[1].module, "mini");
        assert_eq!(resolved[1].krate, 0);
        // Only the library defines `shared`.
        assert_eq!(resolved[2].krate, 1);
    }

    #[test]
    fn unknown_target_is_resolution_error() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());
        let crates = [bin("mini")];
        let map = collect_sites(tmp.path(), &crates).unwrap();

        let err = resolve_targets(&[TargetSpec::parse("mini:nope")], &crates, &map).unwrap_err();
        assert_eq!(err.to_string(), "cannot resolve target `mini:nope`");
        match err {
            Error::Target(inner) => assert_eq!(inner.kind(), ErrorKind::Resolution),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn value_items_are_not_code() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());
        let crates = [bin("mini")];
        let map = collect_sites(tmp.path(), &crates).unwrap();

        let err = resolve_targets(&[TargetSpec::parse("mini:LIMIT")], &crates, &map).unwrap_err();
        assert_eq!(err.to_string(), "cannot extract code object from const mini::LIMIT");

        let err = resolve_targets(&[TargetSpec::parse("GREETING")], &crates, &map).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot extract code object from static mini::GREETING"
        );

        let err = resolve_targets(&[TargetSpec::parse("square")], &crates, &map).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot extract code object from const fn mini::square"
        );
    }

    #[test]
    fn trait_methods_without_body_do_not_resolve() {
        let tmp = TempDir::new().unwrap();
        create_test_package(tmp.path());
        let crates = [bin("mini")];
        let map = collect_sites(tmp.path(), &crates).unwrap();

        assert!(resolve_targets(&[TargetSpec::parse("mini::parser:Visit::visit")], &crates, &map).is_ok());
        let err = resolve_targets(&[TargetSpec::parse("mini::parser:Visit::required")], &crates, &map)
            .unwrap_err();
        assert!(err.to_string().contains("cannot resolve target"));
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let err = resolve_targets(&[], &[bin("mini")], &SourceMap::default()).unwrap_err();
        assert_eq!(err.to_string(), "at least one target required");
    }
}
