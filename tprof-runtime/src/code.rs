//! Code handles: one `static` descriptor per instrumented function.
//!
//! A `Code` is what the event source reports on entry and exit. Its address is
//! its identity, so every reference to the same static collapses to one
//! `CodeId` no matter how the caller reached it (directly, through a
//! `Function`, a bound `Method`, or a symbol-table name).

use std::fmt;

/// A unit of instrumented code.
///
/// Declare it as a `static` (never a `const`: constants have no stable
/// address) and pass `&STATIC` to [`enter`](crate::enter).
pub struct Code {
    module: Option<&'static str>,
    qualname: &'static str,
}

impl Code {
    /// A code unit defined in `module` (usually `module_path!()`).
    pub const fn new(module: &'static str, qualname: &'static str) -> Self {
        Self {
            module: Some(module),
            qualname,
        }
    }

    /// A code unit whose defining module is unknown.
    pub const fn detached(qualname: &'static str) -> Self {
        Self {
            module: None,
            qualname,
        }
    }

    pub fn id(&'static self) -> CodeId {
        CodeId(self as *const Code as usize)
    }

    pub fn module(&self) -> Option<&'static str> {
        self.module
    }

    pub fn qualname(&self) -> &'static str {
        self.qualname
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code {} of {}>",
            self.qualname,
            self.module.unwrap_or("<unknown>")
        )
    }
}

/// Stable identity of a [`Code`]: the address of its static.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(usize);

/// Declare a [`Code`] static for the current module.
///
/// ```
/// tprof_runtime::code!(static PARSE = "Parser::parse";);
/// assert_eq!(PARSE.qualname(), "Parser::parse");
/// ```
#[macro_export]
macro_rules! code {
    ($(#[$meta:meta])* $vis:vis static $name:ident = $qualname:expr;) => {
        $(#[$meta])*
        $vis static $name: $crate::Code = $crate::Code::new(module_path!(), $qualname);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    static WALK: Code = Code::new("mini", "walk");
    static WALK_TWIN: Code = Code::new("mini", "walk");
    static LOOSE: Code = Code::detached("loose");

    crate::code!(static PARSE = "Parser::parse";);

    #[test]
    fn identity_is_per_static_not_per_name() {
        assert_eq!(WALK.id(), WALK.id());
        assert_ne!(WALK.id(), WALK_TWIN.id());
    }

    #[test]
    fn detached_code_has_no_module() {
        assert_eq!(LOOSE.module(), None);
        assert_eq!(LOOSE.qualname(), "loose");
        assert_eq!(format!("{LOOSE:?}"), "<code loose of <unknown>>");
    }

    #[test]
    fn code_macro_captures_module_path() {
        assert_eq!(PARSE.module(), Some(module_path!()));
        assert_eq!(PARSE.qualname(), "Parser::parse");
    }
}
