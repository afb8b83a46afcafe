//! Selector DSL.
//!
//! Turns text such as `+orders tag:nightly,path:models/staging` into a
//! [`CompiledSelector`] that both the planner and the engine adapter can use.
//! Compilation is pure: the same text always yields the same tree.

mod parser;
mod types;

pub use parser::{compile, SelectionSyntaxError, SyntaxErrorKind};
pub use types::{CompiledSelector, GraphOp, SelectionMethod, SelectorExpr};

/// Stateless compiler handle, for callers that prefer a value over a free function.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorCompiler;

impl SelectorCompiler {
    pub fn compile(&self, text: &str) -> Result<CompiledSelector, SelectionSyntaxError> {
        compile(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_selector_compiles_to_same_tree() {
        for text in ["+model_b", "2+orders", "orders+3", "@a b,tag:x", "path:models/*.sql"] {
            let first = compile(text).unwrap();
            let rendered = first.to_engine_arg().unwrap();
            let second = compile(&rendered).unwrap();
            assert_eq!(first.expr, second.expr, "{text}");
        }
    }

    #[test]
    fn test_extra_whitespace_is_normalized() {
        let compiled = SelectorCompiler.compile("  a \t  b  ").unwrap();
        assert_eq!(compiled.text, "  a \t  b  ");
        assert_eq!(compiled.to_engine_arg().as_deref(), Some("a b"));
    }
}
