use std::path::PathBuf;

use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::visit_mut::VisitMut;

use crate::resolve::{ItemKind, ResolvedTarget, SourceMap, type_name_from_type};

/// Name of the generated module holding a crate's `Code` statics.
pub const CODES_MODULE: &str = "__tprof_codes";

/// One function with a `Code` static in the generated tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEntry {
    /// The crate the target resolved to; only that crate binds its names.
    pub krate: usize,
    pub module: String,
    pub qualname: String,
    /// Every `-t` string that names this function, in command-line order.
    pub names: Vec<String>,
}

/// Every function that gets a `Code` static, in first-use order. A slot is
/// the same in every crate, so a file compiled into two crates refers to
/// the same static name in both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeTable {
    pub entries: Vec<CodeEntry>,
}

impl CodeTable {
    pub fn from_targets(targets: &[ResolvedTarget]) -> Self {
        let mut table = Self::default();
        for target in targets {
            table.insert(
                target.krate,
                &target.module,
                target.qualname(),
                &target.spec.raw,
            );
        }
        table
    }

    /// Record `name` as a name of `module::qualname` in `krate` and return
    /// its slot.
    pub fn insert(&mut self, krate: usize, module: &str, qualname: &str, name: &str) -> usize {
        let slot = match self.slot(krate, module, qualname) {
            Some(slot) => slot,
            None => {
                self.entries.push(CodeEntry {
                    krate,
                    module: module.to_owned(),
                    qualname: qualname.to_owned(),
                    names: Vec::new(),
                });
                self.entries.len() - 1
            }
        };
        let names = &mut self.entries[slot].names;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
        slot
    }

    pub fn slot(&self, krate: usize, module: &str, qualname: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.krate == krate && e.module == module && e.qualname == qualname)
    }

    /// Slots whose statics crate `krate` must define: its own targets, plus
    /// any probe in a file the crate also compiles.
    pub fn crate_slots(&self, krate: usize, map: &SourceMap, files: &[FileProbes]) -> Vec<usize> {
        let mut slots: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.krate == krate)
            .map(|(slot, _)| slot)
            .collect();
        for file in files {
            let compiled_here = map
                .files
                .iter()
                .any(|f| f.krate == krate && f.path == file.path);
            if compiled_here {
                slots.extend(file.probes.iter().map(|p| p.slot));
            }
        }
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A function to instrument, and the slot of its `Code` static.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub module: String,
    pub qualname: String,
    pub slot: usize,
}

/// The probes that fall in one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProbes {
    pub path: PathBuf,
    /// Module of the file's top level.
    pub module: String,
    pub probes: Vec<Probe>,
}

/// Group the function sites named by the code table by the file that
/// defines them. A function defined more than once (for example behind
/// alternative `cfg`s) gets a probe at every definition.
pub fn probes_by_file(map: &SourceMap, table: &CodeTable) -> Vec<FileProbes> {
    let mut files: Vec<FileProbes> = Vec::new();
    for site in &map.sites {
        if site.kind != ItemKind::Function {
            continue;
        }
        let Some(slot) = table.slot(site.krate, &site.module, &site.qualname) else {
            continue;
        };
        let probe = Probe {
            module: site.module.clone(),
            qualname: site.qualname.clone(),
            slot,
        };
        match files.iter_mut().find(|f| f.path == site.file) {
            Some(file) => {
                if !file.probes.contains(&probe) {
                    file.probes.push(probe);
                }
            }
            None => {
                let module = map
                    .files
                    .iter()
                    .find(|f| f.krate == site.krate && f.path == site.file)
                    .map(|f| f.module.clone())
                    .unwrap_or_else(|| site.module.clone());
                files.push(FileProbes {
                    path: site.file.clone(),
                    module,
                    probes: vec![probe],
                });
            }
        }
    }
    files
}

/// Rewrite `source` so that every function matched by `probes` opens a frame
/// on its `Code` static as its first statement.
///
/// `file_module` is the module path of the file's top level. Functions match
/// by module and qualified name: bare names for free functions,
/// `Type::method` for impl methods and `Trait::method` for default trait
/// methods.
pub fn instrument_source(
    source: &str,
    file_module: &str,
    probes: &[Probe],
) -> Result<String, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    let mut instrumenter = Instrumenter {
        probes,
        modules: file_module.split("::").map(String::from).collect(),
        current_impl: None,
        current_trait: None,
    };
    instrumenter.visit_file_mut(&mut file);
    Ok(prettyplease::unparse(&file))
}

struct Instrumenter<'a> {
    probes: &'a [Probe],
    modules: Vec<String>,
    current_impl: Option<String>,
    current_trait: Option<String>,
}

impl Instrumenter<'_> {
    fn inject_frame(&self, block: &mut syn::Block, sig: &syn::Signature, qualname: &str) {
        if sig.constness.is_some() {
            return;
        }
        let module = self.modules.join("::");
        let Some(probe) = self
            .probes
            .iter()
            .find(|p| p.module == module && p.qualname == qualname)
        else {
            return;
        };
        let codes = format_ident!("{CODES_MODULE}");
        let code = format_ident!("CODE_{}", probe.slot);
        let frame_stmt: syn::Stmt = syn::parse_quote! {
            let __tprof_frame = ::tprof_runtime::enter(&crate::#codes::#code);
        };
        block.stmts.insert(0, frame_stmt);
    }
}

// Function bodies are never entered: nested items are not addressable by path.
impl VisitMut for Instrumenter<'_> {
    fn visit_item_fn_mut(&mut self, node: &mut syn::ItemFn) {
        let name = node.sig.ident.unraw().to_string();
        self.inject_frame(&mut node.block, &node.sig, &name);
    }

    fn visit_item_impl_mut(&mut self, node: &mut syn::ItemImpl) {
        let prev = self.current_impl.replace(type_name_from_type(&node.self_ty));
        syn::visit_mut::visit_item_impl_mut(self, node);
        self.current_impl = prev;
    }

    fn visit_impl_item_fn_mut(&mut self, node: &mut syn::ImplItemFn) {
        let method = node.sig.ident.unraw().to_string();
        let qualified = match &self.current_impl {
            Some(ty) => format!("{ty}::{method}"),
            None => method,
        };
        self.inject_frame(&mut node.block, &node.sig, &qualified);
    }

    fn visit_item_trait_mut(&mut self, node: &mut syn::ItemTrait) {
        let prev = self.current_trait.replace(node.ident.unraw().to_string());
        syn::visit_mut::visit_item_trait_mut(self, node);
        self.current_trait = prev;
    }

    fn visit_trait_item_fn_mut(&mut self, node: &mut syn::TraitItemFn) {
        let method = node.sig.ident.unraw().to_string();
        let qualified = match &self.current_trait {
            Some(trait_name) => format!("{trait_name}::{method}"),
            None => method,
        };
        if let Some(block) = &mut node.default {
            self.inject_frame(block, &node.sig, &qualified);
        }
    }

    fn visit_item_mod_mut(&mut self, node: &mut syn::ItemMod) {
        if node.content.is_none() {
            return;
        }
        self.modules.push(node.ident.unraw().to_string());
        syn::visit_mut::visit_item_mod_mut(self, node);
        self.modules.pop();
    }
}

/// Append the generated `__tprof_codes` module to the root of crate `krate`.
///
/// The module holds a `Code` static for each of `slots` and a `define`
/// function that binds the `-t` strings of the crate's own targets to their
/// statics in a `SymbolTable`.
pub fn append_code_table(
    source: &str,
    table: &CodeTable,
    krate: usize,
    slots: &[usize],
) -> Result<String, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    let codes = format_ident!("{CODES_MODULE}");

    let entries: Vec<(usize, &CodeEntry)> = slots
        .iter()
        .filter_map(|&slot| table.entries.get(slot).map(|entry| (slot, entry)))
        .collect();
    let statics = entries.iter().map(|(slot, entry)| {
        let ident = format_ident!("CODE_{slot}");
        let module = &entry.module;
        let qualname = &entry.qualname;
        quote! {
            pub static #ident: ::tprof_runtime::Code =
                ::tprof_runtime::Code::new(#module, #qualname);
        }
    });
    let defines = entries
        .iter()
        .filter(|(_, entry)| entry.krate == krate)
        .flat_map(|(slot, entry)| {
            let ident = format_ident!("CODE_{slot}");
            entry.names.iter().map(move |name| {
                quote! {
                    symbols.define(#name, &#ident);
                }
            })
        });

    let item: syn::Item = syn::parse_quote! {
        #[doc(hidden)]
        #[allow(dead_code, missing_docs, unused_variables)]
        pub mod #codes {
            #(#statics)*

            pub fn define(symbols: &mut ::tprof_runtime::SymbolTable) {
                #(#defines)*
            }
        }
    };
    file.items.push(item);
    Ok(prettyplease::unparse(&file))
}

/// How the wrapped `main` opens its profiling region.
#[derive(Debug, Clone, Default)]
pub struct RegionSpec {
    /// `-t` strings in command-line order; they are the report labels.
    pub targets: Vec<String>,
    pub compare: bool,
    /// Paths of the generated code modules to load names from, e.g.
    /// `crate::__tprof_codes` or `::mini::__tprof_codes`.
    pub tables: Vec<String>,
}

/// Move the body of `fn main` into an inner function and run it inside a
/// profiling region.
///
/// The report is printed only when `main`'s return value counts as success.
/// Target errors detected by the runtime are printed as `error: ...` and end
/// the program with status 1 before the original body runs.
pub fn wrap_main(source: &str, region: &RegionSpec) -> Result<String, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;

    let tables = region
        .tables
        .iter()
        .map(|path| syn::parse_str::<syn::Path>(path))
        .collect::<Result<Vec<_>, _>>()?;

    let main = file
        .items
        .iter_mut()
        .find_map(|item| match item {
            syn::Item::Fn(f) if f.sig.ident == "main" => Some(f),
            _ => None,
        })
        .ok_or_else(|| syn::Error::new(Span::call_site(), "no `fn main` found"))?;

    let body = &main.block;
    let output = &main.sig.output;
    let (inner, call) = if main.sig.asyncness.is_some() {
        (
            quote! { async fn __tprof_main() #output #body },
            quote! { __tprof_main().await },
        )
    } else {
        (
            quote! { fn __tprof_main() #output #body },
            quote! { __tprof_main() },
        )
    };
    let targets = &region.targets;
    let compare = region.compare;

    let wrapped: syn::Block = syn::parse_quote! {
        {
            #inner

            let mut __tprof_symbols = ::tprof_runtime::SymbolTable::new();
            #( #tables::define(&mut __tprof_symbols); )*
            let __tprof_region = match ::tprof_runtime::profile([#(#targets),*])
                .symbols(__tprof_symbols)
                .compare(#compare)
                .start()
            {
                Ok(region) => region,
                Err(error) => {
                    ::std::eprintln!("error: {error}");
                    ::std::process::exit(1);
                }
            };
            let __tprof_result = #call;
            if ::tprof_runtime::Outcome::succeeded(&__tprof_result) {
                __tprof_region.finish();
            }
            __tprof_result
        }
    };
    *main.block = wrapped;

    Ok(prettyplease::unparse(&file))
}
