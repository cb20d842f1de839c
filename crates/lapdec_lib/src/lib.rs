use std::fmt::Write as _;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod tables {
    use serde::{Deserialize, Serialize};

    include!(concat!(env!("OUT_DIR"), "/lap_tables.rs"));
}

pub mod bb;
pub mod grammar;
pub mod parser;
pub mod scanner;
pub mod semantics;
pub mod token;
pub mod transform;
pub mod tree;

pub use parser::ParseError;
pub use scanner::{FnKind, LapFunction};
pub use tables::Opcode;

use crate::grammar::NodeKind;
use crate::parser::{Grammar, Parser};
use crate::token::{EffectTable, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Source,
    /// The scanned listing with merge and stack-access markers.
    Assembly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeDump {
    None,
    Before,
    After,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    pub show_blocks: bool,
    pub show_grammar: bool,
    pub tree: TreeDump,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Source,
            show_blocks: false,
            show_grammar: false,
            tree: TreeDump::None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LapError {
    #[error("jump to unknown label {label} at offset {offset}")]
    UnresolvedLabel { label: String, offset: u32 },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("render inconsistency: {0}")]
    RenderInconsistency(String),

    #[error("line {line}: malformed instruction `{text}`")]
    MalformedLine { line: usize, text: String },

    #[error("line {line}: unknown opcode `{mnemonic}`")]
    UnknownOpcode { line: usize, mnemonic: String },

    #[error("line {line}: unexpected end of listing")]
    UnexpectedEof { line: usize },

    #[error("bad grammar: {0}")]
    Grammar(String),
}

#[derive(Debug)]
pub struct FunctionFailure {
    pub name: String,
    pub error: LapError,
}

/// Output of a run; failed functions appear in `text` as comments.
#[derive(Debug)]
pub struct Decompiled {
    pub text: String,
    pub failures: Vec<FunctionFailure>,
}

const BODY_INDENT: &str = "  ";

/// Every function in the listing followed by the functions embedded in
/// its constants, depth first.
fn flatten_functions(fns: Vec<LapFunction>) -> Vec<LapFunction> {
    fn visit(f: LapFunction, out: &mut Vec<LapFunction>) {
        let nested: Vec<LapFunction> = f
            .instructions
            .iter()
            .filter_map(|i| match &i.attr {
                Some(Value::Function(inner)) => Some(inner.as_ref().clone()),
                _ => None,
            })
            .collect();
        out.push(f);
        for inner in nested {
            visit(inner, out);
        }
    }
    let mut out = Vec::new();
    for f in fns {
        visit(f, &mut out);
    }
    out
}

fn lisp_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn comment_lines(out: &mut String, text: &str) {
    for line in text.lines() {
        let _ = writeln!(out, ";; {line}");
    }
}

fn wrap(f: &LapFunction, body: &str) -> String {
    if f.kind == FnKind::File {
        return format!("{body}\n");
    }
    let mut out = format!("({} {} {}", f.kind.keyword(), f.name, f.args);
    if let Some(doc) = &f.docstring {
        let _ = write!(out, "\n{BODY_INDENT}{}", lisp_string(doc));
    }
    if let Some(spec) = &f.interactive {
        let _ = write!(out, "\n{BODY_INDENT}(interactive {spec})");
    }
    if !body.trim().is_empty() {
        out.push('\n');
        out.push_str(body);
    }
    out.push_str(")\n");
    out
}

fn decompile_function(f: &LapFunction, options: &DecompileOptions) -> Result<String, LapError> {
    let effects = EffectTable::default();
    let seg = bb::segment(&f.instructions, &effects)?;
    let tokens = bb::ingest(&seg, &effects);
    let mut out = String::new();

    if options.show_blocks {
        let _ = writeln!(out, ";; blocks of {}", f.name);
        for block in &seg.blocks {
            let _ = writeln!(out, ";; {block}");
        }
    }

    if options.mode == DecompileMode::Assembly {
        let _ = writeln!(out, ";; {}{}", f.name, f.args);
        for tok in &tokens {
            let _ = writeln!(out, "{tok}");
        }
        return Ok(out);
    }

    let extra = grammar::synthesize_rules(&tokens);
    let mut parser = Parser::new(Grammar::with_base(&extra)?).with_trace(options.show_grammar);
    let tree = parser.parse(&tokens, NodeKind::FnBody)?;
    if options.show_grammar {
        comment_lines(&mut out, &parser.reductions().join("\n"));
    }
    if matches!(options.tree, TreeDump::Before | TreeDump::Full) {
        comment_lines(&mut out, &tree.to_string());
    }

    let tree = transform::transform(tree);
    if matches!(options.tree, TreeDump::After | TreeDump::Full) {
        comment_lines(&mut out, &tree.to_string());
    }

    let indent = if f.kind == FnKind::File { "" } else { BODY_INDENT };
    let body = semantics::render(&tree, indent)?;
    out.push_str(&wrap(f, &body));
    Ok(out)
}

/// A function that fails is reported in `failures` and replaced by a comment.
pub fn decompile_with_options(listing: &str, options: &DecompileOptions) -> Result<Decompiled, LapError> {
    let functions = flatten_functions(scanner::scan(listing)?);
    let mut parts = Vec::with_capacity(functions.len());
    let mut failures = Vec::new();

    for f in &functions {
        debug!("decompiling {}", f.name);
        match decompile_function(f, options) {
            Ok(text) => parts.push(text),
            Err(error) => {
                warn!("{}: {error}", f.name);
                let mut text = format!(";; {}: {error}\n", f.name);
                if let LapError::Parse(e) = &error {
                    comment_lines(&mut text, &e.context.join("\n"));
                }
                parts.push(text);
                failures.push(FunctionFailure {
                    name: f.name.clone(),
                    error,
                });
            }
        }
    }

    Ok(Decompiled {
        text: parts.join("\n"),
        failures,
    })
}

/// Decompile with default options, failing on the first function that
/// does not decompile.
pub fn decompile(listing: &str) -> Result<String, LapError> {
    let mut out = decompile_with_options(listing, &DecompileOptions::default())?;
    if out.failures.is_empty() {
        Ok(out.text)
    } else {
        Err(out.failures.remove(0).error)
    }
}
