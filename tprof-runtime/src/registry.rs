//! Target registry: resolves user-supplied targets to code identities.
//!
//! A target is either an [`Object`] (a nameable unit of code, or some other
//! value) or a qualified name looked up in a [`SymbolTable`]. Objects go through
//! a fixed extraction chain (function, method, call operator) and the first
//! extractor that yields a [`Code`] wins. The resulting [`Registry`] is frozen:
//! once a region starts nothing is added or removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::code::{Code, CodeId};
use crate::error::Error;

/// Module tag used in labels when the defining module is unknown.
pub const UNKNOWN_MODULE: &str = "<unknown>";

/// A plain function: a code handle plus the name it is reported under.
#[derive(Debug, Clone, Copy)]
pub struct Function {
    code: &'static Code,
    module: Option<&'static str>,
    qualname: &'static str,
}

impl Function {
    pub fn new(code: &'static Code) -> Self {
        Self {
            code,
            module: code.module(),
            qualname: code.qualname(),
        }
    }

    /// Report this function under a different module (`None` = unknown).
    pub fn with_module(mut self, module: Option<&'static str>) -> Self {
        self.module = module;
        self
    }

    pub fn code(&self) -> &'static Code {
        self.code
    }

    pub fn module(&self) -> Option<&'static str> {
        self.module
    }

    pub fn qualname(&self) -> &'static str {
        self.qualname
    }
}

/// A method, either looked up through its type or bound to a receiver.
///
/// Binding does not change the identity: a bound method and its underlying
/// function resolve to the same code.
#[derive(Debug, Clone)]
pub struct Method {
    function: Function,
    receiver: Option<String>,
}

impl Method {
    pub fn unbound(function: Function) -> Self {
        Self {
            function,
            receiver: None,
        }
    }

    pub fn bound(function: Function, receiver: &impl fmt::Debug) -> Self {
        Self {
            function,
            receiver: Some(format!("{receiver:?}")),
        }
    }

    pub fn function(&self) -> Function {
        self.function
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }
}

/// An object that can be called through its own call operator.
pub trait CallOperator: fmt::Debug + Send + Sync {
    /// The code run when this object is called, if that code is instrumented.
    fn call_code(&self) -> Option<&'static Code>;

    /// Module the object's type is defined in.
    fn module(&self) -> Option<&'static str> {
        let name = std::any::type_name::<Self>();
        let base = name.split('<').next().unwrap_or(name);
        base.rsplit_once("::").map(|(module, _)| module)
    }
}

/// A nameable unit of code, or any other value (which never resolves).
#[derive(Debug, Clone)]
pub enum Object {
    Code(&'static Code),
    Function(Function),
    Method(Method),
    Callable(Arc<dyn CallOperator>),
    /// Anything else, carried by its `Debug` representation.
    Value(String),
}

impl Object {
    pub fn callable(operator: impl CallOperator + 'static) -> Self {
        Object::Callable(Arc::new(operator))
    }

    pub fn value(value: &impl fmt::Debug) -> Self {
        Object::Value(format!("{value:?}"))
    }

    /// Human-readable representation, used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Object::Code(code) => format!("{code:?}"),
            Object::Function(function) => format!("<function {}>", function.qualname),
            Object::Method(method) => match &method.receiver {
                Some(receiver) => format!(
                    "<bound method {} of {}>",
                    method.function.qualname, receiver
                ),
                None => format!("<function {}>", method.function.qualname),
            },
            Object::Callable(operator) => format!("{operator:?}"),
            Object::Value(repr) => repr.clone(),
        }
    }

    fn label(&self) -> String {
        let (module, qualname) = match self {
            Object::Code(code) => (code.module(), code.qualname().to_string()),
            Object::Function(function) => (function.module, function.qualname.to_string()),
            Object::Method(method) => (
                method.function.module,
                method.function.qualname.to_string(),
            ),
            Object::Callable(operator) => (operator.module(), format!("{operator:?}")),
            Object::Value(repr) => (None, repr.clone()),
        };
        format!("{}:{}", module.unwrap_or(UNKNOWN_MODULE), qualname)
    }
}

impl From<&'static Code> for Object {
    fn from(code: &'static Code) -> Self {
        Object::Code(code)
    }
}

impl From<Function> for Object {
    fn from(function: Function) -> Self {
        Object::Function(function)
    }
}

impl From<Method> for Object {
    fn from(method: Method) -> Self {
        Object::Method(method)
    }
}

/// What the caller asked to profile.
#[derive(Debug, Clone)]
pub enum Target {
    Object(Object),
    /// A qualified name (`module:qualname`) resolved through a [`SymbolTable`].
    Name(String),
}

impl Target {
    pub fn name(name: impl Into<String>) -> Self {
        Target::Name(name.into())
    }

    pub fn callable(operator: impl CallOperator + 'static) -> Self {
        Target::Object(Object::callable(operator))
    }

    pub fn value(value: &impl fmt::Debug) -> Self {
        Target::Object(Object::value(value))
    }
}

impl From<Object> for Target {
    fn from(object: Object) -> Self {
        Target::Object(object)
    }
}

impl From<&'static Code> for Target {
    fn from(code: &'static Code) -> Self {
        Target::Object(Object::Code(code))
    }
}

impl From<Function> for Target {
    fn from(function: Function) -> Self {
        Target::Object(Object::Function(function))
    }
}

impl From<Method> for Target {
    fn from(method: Method) -> Self {
        Target::Object(Object::Method(method))
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_owned())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

/// Explicit name -> object table backing [`Target::Name`] resolution.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Object>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `object`, replacing any previous binding.
    pub fn define(&mut self, name: impl Into<String>, object: impl Into<Object>) -> &mut Self {
        self.symbols.insert(name.into(), object.into());
        self
    }

    pub fn resolve(&self, name: &str) -> Result<&Object, Error> {
        self.symbols.get(name).ok_or_else(|| Error::Unresolved {
            name: name.to_owned(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Merge every binding of `other` into this table.
    pub fn extend(&mut self, other: SymbolTable) {
        self.symbols.extend(other.symbols);
    }
}

type Extractor = fn(&Object) -> Option<&'static Code>;

fn function_code(object: &Object) -> Option<&'static Code> {
    match object {
        Object::Function(function) => Some(function.code),
        _ => None,
    }
}

fn method_code(object: &Object) -> Option<&'static Code> {
    match object {
        Object::Method(method) => Some(method.function.code),
        _ => None,
    }
}

fn call_operator_code(object: &Object) -> Option<&'static Code> {
    match object {
        Object::Callable(operator) => operator.call_code(),
        _ => None,
    }
}

const EXTRACTORS: [Extractor; 3] = [function_code, method_code, call_operator_code];

/// Find the code an object runs when called.
pub fn extract_code(object: &Object) -> Result<&'static Code, Error> {
    if let Object::Code(code) = object {
        return Ok(*code);
    }
    EXTRACTORS
        .iter()
        .find_map(|extract| extract(object))
        .ok_or_else(|| Error::NotCode(object.describe()))
}

/// One registered target.
#[derive(Debug, Clone)]
pub struct TargetRecord {
    code: &'static Code,
    label: String,
}

impl TargetRecord {
    pub(crate) fn new(code: &'static Code, label: impl Into<String>) -> Self {
        Self {
            code,
            label: label.into(),
        }
    }

    pub fn id(&self) -> CodeId {
        self.code.id()
    }

    pub fn code(&self) -> &'static Code {
        self.code
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Ordered, de-duplicated set of targets for one session.
#[derive(Debug, Default)]
pub struct Registry {
    records: Vec<TargetRecord>,
    index: HashMap<CodeId, usize>,
}

impl Registry {
    pub fn records(&self) -> &[TargetRecord] {
        &self.records
    }

    /// Position of `id` in registration order, if it is registered.
    pub fn index_of(&self, id: CodeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, code: &'static Code, label: String) {
        let id = code.id();
        if self.index.contains_key(&id) {
            return;
        }
        self.index.insert(id, self.records.len());
        self.records.push(TargetRecord::new(code, label));
    }
}

/// Resolve `targets` into a registry, in the order given.
///
/// Fails on the first target that cannot be resolved. Targets that share an
/// identity collapse into the first record.
pub fn register(targets: &[Target], symbols: &SymbolTable) -> Result<Registry, Error> {
    if targets.is_empty() {
        return Err(Error::NoTargets);
    }

    let mut registry = Registry::default();
    for target in targets {
        let (code, label) = match target {
            Target::Name(name) => (extract_code(symbols.resolve(name)?)?, name.clone()),
            Target::Object(object) => (extract_code(object)?, object.label()),
        };
        registry.insert(code, label);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    static JUMP: Code = Code::new("robots", "Robot::jump");
    static SAMPLE: Code = Code::new("tests", "sample");
    static CALL: Code = Code::new("robots", "Dancer::call");

    #[derive(Debug)]
    struct Dancer;

    impl CallOperator for Dancer {
        fn call_code(&self) -> Option<&'static Code> {
            Some(&CALL)
        }
    }

    #[derive(Debug)]
    struct Statue;

    impl CallOperator for Statue {
        fn call_code(&self) -> Option<&'static Code> {
            None
        }
    }

    #[derive(Debug)]
    struct Robot {
        serial: u32,
    }

    #[test]
    fn extracts_code_object_directly() {
        let code = extract_code(&Object::Code(&JUMP)).unwrap();
        assert_eq!(code.id(), JUMP.id());
    }

    #[test]
    fn extracts_from_function() {
        let code = extract_code(&Function::new(&JUMP).into()).unwrap();
        assert_eq!(code.id(), JUMP.id());
    }

    #[test]
    fn extracts_from_unbound_and_bound_method() {
        let unbound = Method::unbound(Function::new(&JUMP));
        let bound = Method::bound(Function::new(&JUMP), &Robot { serial: 7 });
        assert_eq!(extract_code(&unbound.into()).unwrap().id(), JUMP.id());
        assert_eq!(extract_code(&bound.into()).unwrap().id(), JUMP.id());
    }

    #[test]
    fn extracts_from_call_operator() {
        let code = extract_code(&Object::callable(Dancer)).unwrap();
        assert_eq!(code.id(), CALL.id());
    }

    #[test]
    fn call_operator_without_code_is_rejected() {
        let err = extract_code(&Object::callable(Statue)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "cannot extract code object from Statue");
    }

    #[test]
    fn plain_value_is_rejected() {
        let err = register(&[Target::value(&1)], &SymbolTable::new()).unwrap_err();
        assert_eq!(err.to_string(), "cannot extract code object from 1");
    }

    #[test]
    fn bound_method_is_described_with_receiver() {
        let bound = Object::Method(Method::bound(
            Function::new(&JUMP),
            &Robot { serial: 7 },
        ));
        assert_eq!(
            bound.describe(),
            "<bound method Robot::jump of Robot { serial: 7 }>"
        );
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let err = register(&[], &SymbolTable::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "at least one target required");
    }

    #[test]
    fn unknown_name_fails_resolution() {
        let err = register(&[Target::name("tests:missing")], &SymbolTable::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(err.to_string().contains("tests:missing"), "{err}");
    }

    #[test]
    fn name_bound_to_value_is_not_code() {
        let mut symbols = SymbolTable::new();
        symbols.define("tests:VERSION", Object::value(&"1.0"));
        let err = register(&[Target::name("tests:VERSION")], &symbols).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn labels_follow_module_and_qualname() {
        let mut symbols = SymbolTable::new();
        symbols.define("tests.sample", &SAMPLE);
        let targets = [
            Target::from(Function::new(&JUMP)),
            Target::name("tests.sample"),
        ];
        let registry = register(&targets, &symbols).unwrap();
        let labels: Vec<&str> = registry.records().iter().map(|r| r.label()).collect();
        assert_eq!(labels, ["robots:Robot::jump", "tests.sample"]);
    }

    #[test]
    fn function_without_module_uses_unknown_tag() {
        let function = Function::new(&SAMPLE).with_module(None);
        let registry = register(&[function.into()], &SymbolTable::new()).unwrap();
        assert_eq!(registry.records()[0].label(), "<unknown>:sample");
    }

    #[test]
    fn call_operator_label_uses_type_module() {
        let registry = register(&[Target::callable(Dancer)], &SymbolTable::new()).unwrap();
        assert_eq!(
            registry.records()[0].label(),
            format!("{}:Dancer", module_path!())
        );
    }

    #[test]
    fn same_code_through_many_refs_collapses_to_one_record() {
        let mut symbols = SymbolTable::new();
        symbols.define("robots:Robot::jump", Function::new(&JUMP));
        let targets = [
            Target::from(Method::bound(Function::new(&JUMP), &Robot { serial: 1 })),
            Target::from(Function::new(&JUMP)),
            Target::name("robots:Robot::jump"),
            Target::from(&SAMPLE),
            Target::from(&JUMP),
        ];
        let registry = register(&targets, &symbols).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.records()[0].id(), JUMP.id());
        assert_eq!(registry.records()[0].label(), "robots:Robot::jump");
        assert_eq!(registry.index_of(SAMPLE.id()), Some(1));
        assert_eq!(registry.index_of(CALL.id()), None);
    }
}
