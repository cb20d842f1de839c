use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scanner::LapFunction;
use crate::tables::{OPCODE_INFO, OpClass, Opcode};

/// `Max`, `Min` and `Nconc` never come out of the reader; the transform
/// produces them when it flattens nested binary applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Family {
    Call,
    List,
    Concat,
    Insert,
    Max,
    Min,
    Nconc,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::Call => "CALL",
            Family::List => "LIST",
            Family::Concat => "CONCAT",
            Family::Insert => "INSERT",
            Family::Max => "MAX",
            Family::Min => "MIN",
            Family::Nconc => "NCONC",
        }
    }

    pub fn nonterminal(self) -> &'static str {
        match self {
            Family::Call => "call_exprn",
            Family::List => "list_exprn",
            Family::Concat => "concat_exprn",
            Family::Insert => "insert_exprn",
            Family::Max => "max_exprn",
            Family::Min => "min_exprn",
            Family::Nconc => "nconc_exprn",
        }
    }

    pub fn from_nonterminal(s: &str) -> Option<Family> {
        [
            Family::Call,
            Family::List,
            Family::Concat,
            Family::Insert,
            Family::Max,
            Family::Min,
            Family::Nconc,
        ]
        .into_iter()
        .find(|f| f.nonterminal() == s)
    }

    pub fn display(self) -> &'static str {
        match self {
            Family::Call => "funcall",
            Family::List => "list",
            Family::Concat => "concat",
            Family::Insert => "insert",
            Family::Max => "max",
            Family::Min => "min",
            Family::Nconc => "nconc",
        }
    }

    /// Number of stack values an instruction with count `n` consumes.
    /// A call also pops the function it applies.
    pub fn operands(self, n: u16) -> u32 {
        match self {
            Family::Call => u32::from(n) + 1,
            _ => u32::from(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Fixed(Opcode),
    VarArity(Family, u16),
}

impl OpKind {
    /// Terminal name used by the grammar, e.g. `GOTO-IF-NIL` or `CALL_3`.
    pub fn name(&self) -> String {
        match self {
            OpKind::Fixed(op) => op.info().name.to_string(),
            OpKind::VarArity(family, n) => format!("{}_{}", family.name(), n),
        }
    }

    pub fn class(&self) -> OpClass {
        match self {
            OpKind::Fixed(op) => op.info().class,
            OpKind::VarArity(..) => OpClass::Other,
        }
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.class(), OpClass::Jump | OpClass::JumpCond)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Fixed { pops: u32, pushes: u32 },
    /// `(pops, pushes)` when execution falls through and when the jump is taken.
    Branch { fallthrough: (u32, u32), taken: (u32, u32) },
}

impl Effect {
    /// Net change along the fallthrough path.
    pub fn net(&self) -> i32 {
        match *self {
            Effect::Fixed { pops, pushes } => pushes as i32 - pops as i32,
            Effect::Branch { fallthrough: (pops, pushes), .. } => pushes as i32 - pops as i32,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Effect::Branch { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EffectTable {
    fixed: Vec<Effect>,
}

impl Default for EffectTable {
    fn default() -> Self {
        let fixed = OPCODE_INFO
            .iter()
            .map(|info| match info.branch {
                Some([fp, fpush, tp, tpush]) => Effect::Branch {
                    fallthrough: (fp as u32, fpush as u32),
                    taken: (tp as u32, tpush as u32),
                },
                None => Effect::Fixed {
                    pops: info.n_pop as u32,
                    pushes: info.n_push as u32,
                },
            })
            .collect();
        Self { fixed }
    }
}

impl EffectTable {
    pub fn effect(&self, kind: &OpKind) -> Effect {
        match kind {
            OpKind::Fixed(op) => self.fixed[*op as usize],
            OpKind::VarArity(family, n) => Effect::Fixed {
                pops: family.operands(*n),
                pushes: 1,
            },
        }
    }

    pub fn net(&self, instructions: &[Instruction]) -> i32 {
        instructions.iter().map(|i| self.effect(&i.kind).net()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Str(String),
    Symbol(String),
    Function(Box<LapFunction>),
}

impl Value {
    pub fn parse_constant(s: &str) -> Value {
        match s.parse::<i64>() {
            Ok(n) if !s.starts_with('+') => Value::Int(n),
            _ if s.starts_with('"') => Value::Str(s.to_string()),
            _ => Value::Symbol(s.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s),
            Value::Function(f) => Some(&f.name),
            Value::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) | Value::Symbol(s) => write!(f, "{s}"),
            Value::Function(func) => write!(f, "<compiled-function {}>", func.name),
        }
    }
}

/// Two instructions compare equal when their kinds match; offset, operand
/// and label are payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: OpKind,
    pub attr: Option<Value>,
    pub offset: u32,
    pub label: Option<String>,
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Instruction {
    pub fn new(kind: OpKind, attr: Option<Value>, offset: u32) -> Self {
        Self { kind, attr, offset, label: None }
    }

    pub fn op(op: Opcode, attr: Option<Value>, offset: u32) -> Self {
        Self::new(OpKind::Fixed(op), attr, offset)
    }

    pub fn name(&self) -> String {
        self.kind.name()
    }

    pub fn is(&self, op: Opcode) -> bool {
        self.kind == OpKind::Fixed(op)
    }

    pub fn attr_text(&self) -> Option<&str> {
        self.attr.as_ref().and_then(Value::as_text)
    }

    pub fn attr_int(&self) -> Option<i64> {
        self.attr.as_ref().and_then(Value::as_int)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = format!("{:>5} {:<10}", self.offset, self.name());
        match &self.attr {
            Some(attr) => write!(f, "{head} {attr}"),
            None => write!(f, "{}", head.trim_end()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_payload() {
        let a = Instruction::op(Opcode::Varref, Some(Value::Symbol("x".into())), 0);
        let b = Instruction::op(Opcode::Varref, Some(Value::Symbol("y".into())), 7);
        assert_eq!(a, b);
        assert_ne!(a, Instruction::op(Opcode::Varset, None, 0));
    }

    #[test]
    fn call_consumes_its_function() {
        let table = EffectTable::default();
        let call = OpKind::VarArity(Family::Call, 3);
        assert_eq!(table.effect(&call), Effect::Fixed { pops: 4, pushes: 1 });
        assert_eq!(call.name(), "CALL_3");
        let list = OpKind::VarArity(Family::List, 3);
        assert_eq!(table.effect(&list).net(), -2);
    }

    #[test]
    fn widest_call_does_not_overflow() {
        let table = EffectTable::default();
        let call = OpKind::VarArity(Family::Call, u16::MAX);
        assert_eq!(table.effect(&call), Effect::Fixed { pops: 65536, pushes: 1 });
    }

    #[test]
    fn branch_effects_use_fallthrough_for_net() {
        let table = EffectTable::default();
        let e = table.effect(&OpKind::Fixed(Opcode::GotoIfNilElsePop));
        assert!(e.is_branch());
        assert_eq!(e.net(), -1);
    }

    #[test]
    fn constants_are_classified() {
        assert_eq!(Value::parse_constant("42"), Value::Int(42));
        assert_eq!(Value::parse_constant("-3"), Value::Int(-3));
        assert_eq!(Value::parse_constant("\"hi\""), Value::Str("\"hi\"".into()));
        assert_eq!(Value::parse_constant("foo"), Value::Symbol("foo".into()));
    }
}
