use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn workspace_root(crate_dir: &Path) -> PathBuf {
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("crate directory should be <root>/crates/<name>")
        .to_path_buf()
}

fn take_until_paren_close(s: &str) -> Option<&str> {
    let s = s.trim();
    let j = s.rfind(')')?;
    Some(s[..j].trim())
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

struct OpDef {
    mnemonic: String,
    ident: String,
    n_pop: u8,
    n_push: u8,
    branch: Option<[u8; 4]>,
    class: &'static str,
    display: String,
}

fn class_variant(class: &str) -> &'static str {
    match class {
        "nullary" => "Nullary",
        "unary" => "Unary",
        "binary" => "Binary",
        "ternary" => "Ternary",
        "jump" => "Jump",
        "jump_cond" => "JumpCond",
        "nofollow" => "NoFollow",
        "other" => "Other",
        other => panic!("unknown opcode class `{other}`"),
    }
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let root = workspace_root(&manifest_dir);

    let opcode_path = root.join("lap").join("lap-opcodes.def");
    println!("cargo:rerun-if-changed={}", opcode_path.display());

    let opcode_src = fs::read_to_string(&opcode_path).expect("read lap-opcodes.def");

    let mut ops: Vec<OpDef> = Vec::new();
    for line in opcode_src.lines() {
        let l = line.trim();
        if let Some(rest) = l.strip_prefix("DEF(") {
            let inner = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            let parts: Vec<&str> = inner.splitn(6, ',').map(|p| p.trim()).collect();
            if parts.len() != 6 {
                continue;
            }
            ops.push(OpDef {
                mnemonic: parts[0].to_string(),
                ident: parts[1].to_string(),
                n_pop: parts[2].parse().expect("opcode n_pop"),
                n_push: parts[3].parse().expect("opcode n_push"),
                branch: None,
                class: class_variant(parts[4]),
                display: unquote(parts[5]),
            });
        } else if let Some(rest) = l.strip_prefix("BRANCH(") {
            let inner = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
            if parts.len() != 6 {
                continue;
            }
            let n: Vec<u8> = parts[2..]
                .iter()
                .map(|p| p.parse().expect("branch effect"))
                .collect();
            ops.push(OpDef {
                mnemonic: parts[0].to_string(),
                ident: parts[1].to_string(),
                n_pop: n[0],
                n_push: n[1],
                branch: Some([n[0], n[1], n[2], n[3]]),
                class: "JumpCond",
                display: String::new(),
            });
        } else if let Some(rest) = l.strip_prefix("PSEUDO(") {
            let inner = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            let parts: Vec<&str> = inner.splitn(3, ',').map(|p| p.trim()).collect();
            if parts.len() != 3 {
                continue;
            }
            ops.push(OpDef {
                mnemonic: parts[0].to_string(),
                ident: parts[1].to_string(),
                n_pop: 0,
                n_push: 0,
                branch: None,
                class: "Pseudo",
                display: unquote(parts[2]),
            });
        }
    }
    assert!(!ops.is_empty(), "no opcodes found in lap-opcodes.def");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_path = out_dir.join("lap_tables.rs");

    let mut out = String::new();

    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]\n");
    out.push_str("pub enum Opcode {\n");
    for op in &ops {
        out.push_str(&format!("    {},\n", op.ident));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq)]\n");
    out.push_str("pub enum OpClass {\n");
    for c in ["Nullary", "Unary", "Binary", "Ternary", "Jump", "JumpCond", "NoFollow", "Other", "Pseudo"] {
        out.push_str(&format!("    {c},\n"));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy)]\n");
    out.push_str("pub struct OpInfo {\n");
    out.push_str("    pub opcode: Opcode,\n");
    out.push_str("    pub mnemonic: &'static str,\n");
    out.push_str("    pub name: &'static str,\n");
    out.push_str("    pub n_pop: u8,\n");
    out.push_str("    pub n_push: u8,\n");
    out.push_str("    pub branch: Option<[u8; 4]>,\n");
    out.push_str("    pub class: OpClass,\n");
    out.push_str("    pub display: &'static str,\n");
    out.push_str("}\n\n");

    out.push_str("pub const OPCODE_INFO: &[OpInfo] = &[\n");
    for op in &ops {
        let branch = match op.branch {
            Some([a, b, c, d]) => format!("Some([{a}, {b}, {c}, {d}])"),
            None => "None".to_string(),
        };
        out.push_str(&format!(
            "    OpInfo {{ opcode: Opcode::{}, mnemonic: \"{}\", name: \"{}\", n_pop: {}, n_push: {}, branch: {}, class: OpClass::{}, display: \"{}\" }},\n",
            op.ident,
            op.mnemonic,
            op.mnemonic.to_ascii_uppercase(),
            op.n_pop,
            op.n_push,
            branch,
            op.class,
            op.display.replace('\\', "\\\\").replace('"', "\\\""),
        ));
    }
    out.push_str("];\n\n");

    out.push_str("impl Opcode {\n");
    out.push_str("    pub fn info(self) -> &'static OpInfo {\n");
    out.push_str("        &OPCODE_INFO[self as usize]\n");
    out.push_str("    }\n\n");
    out.push_str("    pub fn from_mnemonic(s: &str) -> Option<Opcode> {\n");
    out.push_str("        match s {\n");
    for op in &ops {
        out.push_str(&format!("            \"{}\" => Some(Opcode::{}),\n", op.mnemonic, op.ident));
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n\n");
    out.push_str("    pub fn from_name(s: &str) -> Option<Opcode> {\n");
    out.push_str("        match s {\n");
    for op in &ops {
        out.push_str(&format!(
            "            \"{}\" => Some(Opcode::{}),\n",
            op.mnemonic.to_ascii_uppercase(),
            op.ident
        ));
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("}\n");

    fs::write(out_path, out).expect("write generated lap tables");
}
