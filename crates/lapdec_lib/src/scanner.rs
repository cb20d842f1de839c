use log::debug;
use serde::{Deserialize, Serialize};

use crate::LapError;
use crate::tables::Opcode;
use crate::token::{Family, Instruction, OpKind, Value};

/// Largest operand count accepted for `call`, `listN`, `concatN` and `insertN`.
const MAX_ARITY: u16 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FnKind {
    Defun,
    Defmacro,
    /// Top-level byte code of a compiled file.
    File,
}

impl FnKind {
    pub fn keyword(self) -> &'static str {
        match self {
            FnKind::Defun => "defun",
            FnKind::Defmacro => "defmacro",
            FnKind::File => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapFunction {
    pub name: String,
    pub args: String,
    pub docstring: Option<String>,
    pub interactive: Option<String>,
    pub kind: FnKind,
    pub instructions: Vec<Instruction>,
}

struct Scanner<'a> {
    lines: Vec<&'a str>,
    pos: usize,
    anonymous: usize,
    compiled: usize,
}

/// Scan every top-level function in a listing. Functions embedded as
/// constants are reachable through `Value::Function` operands.
pub fn scan(text: &str) -> Result<Vec<LapFunction>, LapError> {
    let mut s = Scanner {
        lines: text.lines().collect(),
        pos: 0,
        anonymous: 0,
        compiled: 0,
    };
    let mut fns = Vec::new();
    while s.pos < s.lines.len() {
        let line = s.lines[s.pos];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            s.pos += 1;
            continue;
        }
        let (name, kind) = if let Some(name) = header_name(trimmed, "byte code for macro ") {
            s.pos += 1;
            (name.to_string(), FnKind::Defmacro)
        } else if let Some(name) = header_name(trimmed, "byte code for ") {
            s.pos += 1;
            (name.to_string(), FnKind::Defun)
        } else if trimmed == "byte code:" {
            s.pos += 1;
            (s.next_anonymous(), FnKind::File)
        } else if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            // A bare instruction listing is treated as file-level code.
            (s.next_anonymous(), FnKind::File)
        } else {
            return Err(LapError::MalformedLine {
                line: s.pos + 1,
                text: line.to_string(),
            });
        };
        fns.push(s.function(name, kind)?);
    }
    Ok(fns)
}

fn header_name<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let name = line.strip_prefix(prefix)?.strip_suffix(':')?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        None
    } else {
        Some(name)
    }
}

fn parse_offset(s: &str) -> Option<u32> {
    s.parse().ok()
}

impl<'a> Scanner<'a> {
    fn next_anonymous(&mut self) -> String {
        let name = format!("anonymous{}", self.anonymous);
        self.anonymous += 1;
        name
    }

    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn function(&mut self, name: String, kind: FnKind) -> Result<LapFunction, LapError> {
        if self.peek().is_none() {
            return Err(LapError::UnexpectedEof { line: self.pos + 1 });
        }
        let docstring = self.docstring();
        let args = self.args();
        let interactive = self.interactive();
        let instructions = self.instructions()?;
        debug!("scanned {name}{args}: {} instructions", instructions.len());
        Ok(LapFunction {
            name,
            args,
            docstring,
            interactive,
            kind,
            instructions,
        })
    }

    fn docstring(&mut self) -> Option<String> {
        let line = self.peek()?.trim_start();
        if let Some(doc) = line.strip_prefix("doc:") {
            self.pos += 1;
            return Some(doc.trim().to_string());
        }
        let rest = line.strip_prefix("doc-start ")?;
        let (len, text) = rest.split_once(':')?;
        let total: usize = len.trim().parse().ok()?;
        self.pos += 1;
        let text = text.strip_prefix("  ").unwrap_or(text.trim_start());
        let mut doc = text.to_string();
        let mut read = text.len();
        while read + 1 < total {
            let Some(next) = self.peek() else { break };
            self.pos += 1;
            read += next.len() + 1;
            doc.push('\n');
            doc.push_str(next);
        }
        Some(doc)
    }

    fn args(&mut self) -> String {
        let Some(line) = self.peek() else {
            return "(?)".to_string();
        };
        match line.trim_start().strip_prefix("args:").map(str::trim) {
            Some("nil") => {
                self.pos += 1;
                "()".to_string()
            }
            Some(list) if list.starts_with('(') => {
                self.pos += 1;
                match list.find(')') {
                    Some(end) => list[..=end].to_string(),
                    None => list.to_string(),
                }
            }
            _ => "(?)".to_string(),
        }
    }

    fn interactive(&mut self) -> Option<String> {
        let spec = self.peek()?.trim_start().strip_prefix("interactive:")?;
        self.pos += 1;
        Some(spec.trim().to_string())
    }

    fn instructions(&mut self) -> Result<Vec<Instruction>, LapError> {
        let mut out = Vec::new();
        while let Some(line) = self.peek() {
            let trimmed = line.trim();
            if trimmed.starts_with("byte code") {
                break;
            }
            if trimmed.starts_with('#') {
                self.pos += 1;
                continue;
            }
            if trimmed.is_empty() {
                self.pos += 1;
                break;
            }
            let line_no = self.pos + 1;
            self.pos += 1;
            self.instruction(line, line_no, &mut out)?;
        }
        Ok(out)
    }

    fn instruction(&mut self, line: &str, line_no: usize, out: &mut Vec<Instruction>) -> Result<(), LapError> {
        let malformed = || LapError::MalformedLine {
            line: line_no,
            text: line.to_string(),
        };
        let mut fields: Vec<&str> = line.split_whitespace().collect();

        // "12:3constant" when the label is wide enough to swallow the separator
        if let Some(split) = fields[0].find(|c: char| !c.is_ascii_digit() && c != ':') {
            let (head, tail) = fields[0].split_at(split);
            fields[0] = head;
            fields.insert(1, tail);
        }
        if fields.len() < 2 {
            return Err(malformed());
        }

        let (offset, label) = match fields[0].split_once(':') {
            Some((offset, label)) => (offset, Some(label.to_string())),
            None => (fields[0], None),
        };
        let offset = parse_offset(offset).ok_or_else(malformed)?;
        if let Some(label) = &label {
            out.push(Instruction::op(Opcode::Label, Some(Value::Symbol(label.clone())), offset));
        }

        let mnemonic = fields[1];
        let count = |f: &[&str]| -> Result<u16, LapError> {
            f.get(2)
                .and_then(|c| c.parse().ok())
                .filter(|n| *n <= MAX_ARITY)
                .ok_or_else(malformed)
        };

        let mut inst = if mnemonic == "constant" {
            let rest = line[line.find("constant").unwrap_or(0) + "constant".len()..].trim();
            let rest = rest.replace("\\?", "?");
            let attr = if rest == "<compiled-function>" {
                let name = format!("compiled-function-{}", self.compiled);
                self.compiled += 1;
                Value::Function(Box::new(self.function(name, FnKind::Defun)?))
            } else {
                Value::parse_constant(&rest)
            };
            Instruction::op(Opcode::Constant, Some(attr), offset)
        } else if let Some(kind) = var_arity(mnemonic, &fields, count)? {
            let n = match kind {
                OpKind::VarArity(_, n) => n,
                OpKind::Fixed(_) => 0,
            };
            Instruction::new(kind, Some(Value::Int(n as i64)), offset)
        } else {
            let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| LapError::UnknownOpcode {
                line: line_no,
                mnemonic: mnemonic.to_string(),
            })?;
            let attr = if fields.len() > 2 {
                let text = fields[2..].join(" ");
                Some(if OpKind::Fixed(op).is_jump() {
                    Value::Symbol(text)
                } else {
                    Value::parse_constant(&text)
                })
            } else {
                None
            };
            Instruction::op(op, attr, offset)
        };
        inst.label = label;
        out.push(inst);
        Ok(())
    }
}

fn var_arity(
    mnemonic: &str,
    fields: &[&str],
    count: impl Fn(&[&str]) -> Result<u16, LapError>,
) -> Result<Option<OpKind>, LapError> {
    let kind = match mnemonic {
        "call" => OpKind::VarArity(Family::Call, count(fields)?),
        "listN" => OpKind::VarArity(Family::List, count(fields)?),
        "concatN" => OpKind::VarArity(Family::Concat, count(fields)?),
        "insertN" => OpKind::VarArity(Family::Insert, count(fields)?),
        _ => {
            let fixed = [("list", Family::List, 1..=4), ("concat", Family::Concat, 2..=4)];
            let found = fixed.into_iter().find_map(|(prefix, family, range)| {
                let n: u16 = mnemonic.strip_prefix(prefix)?.parse().ok()?;
                range.contains(&n).then_some(OpKind::VarArity(family, n))
            });
            match found {
                Some(kind) => kind,
                None => return Ok(None),
            }
        }
    };
    Ok(Some(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
byte code for inc:
  doc:  Increment X.
  args: (x)
  interactive: \"p\"
0\tvarref\t  x
1\tgoto-if-nil 1
2\tconstant  (lambda nil 1)
3\tcall\t  0
4:1\treturn\t

byte code for macro m:
  args: nil
0\tconstant  <compiled-function>
  args: (y)
0\tvarref\t  y
1\treturn\t

1\tlist2\t
2\treturn\t
";

    #[test]
    fn reads_headers_and_labels() {
        let fns = scan(LISTING).unwrap();
        assert_eq!(fns.len(), 2);

        let inc = &fns[0];
        assert_eq!(inc.name, "inc");
        assert_eq!(inc.kind, FnKind::Defun);
        assert_eq!(inc.args, "(x)");
        assert_eq!(inc.docstring.as_deref(), Some("Increment X."));
        assert_eq!(inc.interactive.as_deref(), Some("\"p\""));

        let names: Vec<String> = inc.instructions.iter().map(Instruction::name).collect();
        assert_eq!(
            names,
            ["VARREF", "GOTO-IF-NIL", "CONSTANT", "CALL_0", "LABEL", "RETURN"]
        );
        assert_eq!(inc.instructions[1].attr_text(), Some("1"));
        assert_eq!(inc.instructions[2].attr_text(), Some("(lambda nil 1)"));
        assert_eq!(inc.instructions[4].offset, 4);
        assert_eq!(inc.instructions[5].label.as_deref(), Some("1"));
    }

    #[test]
    fn nested_functions_are_scanned_recursively() {
        let fns = scan(LISTING).unwrap();
        let m = &fns[1];
        assert_eq!(m.kind, FnKind::Defmacro);
        assert_eq!(m.args, "()");
        assert_eq!(m.instructions.len(), 3);
        match &m.instructions[0].attr {
            Some(Value::Function(f)) => {
                assert_eq!(f.name, "compiled-function-0");
                assert_eq!(f.args, "(y)");
                assert_eq!(f.instructions.len(), 2);
            }
            other => panic!("expected a nested function, got {other:?}"),
        }
        assert_eq!(m.instructions[1].name(), "LIST_2");
    }

    #[test]
    fn bare_listing_is_file_code() {
        let fns = scan("0 varref x\n1 return\n").unwrap();
        assert_eq!(fns[0].kind, FnKind::File);
        assert_eq!(fns[0].name, "anonymous0");
    }

    #[test]
    fn unknown_mnemonic_is_reported() {
        let err = scan("byte code for f:\n  args: nil\n0 frobnicate\n").unwrap_err();
        assert!(matches!(err, LapError::UnknownOpcode { line: 3, .. }));
    }

    #[test]
    fn oversized_arity_is_malformed() {
        let err = scan("0 constant f\n1 call 65535\n2 return\n").unwrap_err();
        assert!(matches!(err, LapError::MalformedLine { line: 2, .. }), "{err:?}");
        assert!(scan("0 constant f\n1 call 255\n2 return\n").is_ok());
    }
}
