use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use log::debug;

use crate::LapError;
use crate::tables::{OpClass, Opcode};
use crate::token::{Effect, EffectTable, Instruction, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockFlag {
    Entry,
    UnconditionalJump,
    NoFollow,
}

/// Net stack change of a block. A block ending in a branch whose outcomes
/// differ carries both: `(fallthrough, taken)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEffect {
    Single(i32),
    Pair(i32, i32),
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start_offset: u32,
    pub end_offset: u32,
    pub follow_offset: Option<u32>,
    pub flags: BTreeSet<BlockFlag>,
    pub jump_targets: BTreeSet<u32>,
    pub stack_effect: BlockEffect,
    pub predecessors: BTreeSet<usize>,
    pub successors: BTreeSet<usize>,
}

impl BasicBlock {
    pub fn contains(&self, offset: u32) -> bool {
        self.start_offset <= offset && offset <= self.end_offset
    }

    fn falls_through(&self) -> bool {
        !self.flags.contains(&BlockFlag::UnconditionalJump) && !self.flags.contains(&BlockFlag::NoFollow)
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BasicBlock(range: ({}, {})", self.start_offset, self.end_offset)?;
        if !self.flags.is_empty() {
            write!(f, ", flags={:?}", self.flags)?;
        }
        match self.follow_offset {
            Some(o) => write!(f, ", follow_offset={o}")?,
            None => write!(f, ", follow_offset=None")?,
        }
        if !self.jump_targets.is_empty() {
            write!(f, ", jumps={:?}", self.jump_targets)?;
        }
        match self.stack_effect {
            BlockEffect::Single(n) => write!(f, ", effect={n})"),
            BlockEffect::Pair(a, b) => write!(f, ", effect=({a}, {b}))"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Segmentation {
    pub blocks: Vec<BasicBlock>,
    pub instructions: Vec<Instruction>,
    /// Jump target offset to the offsets of the jumps reaching it, ascending.
    pub jumps_to_offset: BTreeMap<u32, Vec<u32>>,
    pub block_by_start: HashMap<u32, usize>,
}

struct Builder<'a> {
    instructions: &'a [Instruction],
    effects: &'a EffectTable,
    blocks: Vec<BasicBlock>,
    flags: BTreeSet<BlockFlag>,
    jump_targets: BTreeSet<u32>,
}

impl Builder<'_> {
    fn close(&mut self, start: u32, end: u32, follow: Option<u32>) {
        let mut acc = 0i32;
        let mut effect = None;
        for inst in self.instructions.iter().filter(|i| start <= i.offset && i.offset <= end) {
            match self.effects.effect(&inst.kind) {
                Effect::Branch { fallthrough, taken } => {
                    let fall = acc + fallthrough.1 as i32 - fallthrough.0 as i32;
                    let took = acc + taken.1 as i32 - taken.0 as i32;
                    effect = Some(BlockEffect::Pair(fall, took));
                    break;
                }
                e => acc += e.net(),
            }
        }
        let block = BasicBlock {
            start_offset: start,
            end_offset: end,
            follow_offset: follow,
            flags: std::mem::take(&mut self.flags),
            jump_targets: std::mem::take(&mut self.jump_targets),
            stack_effect: effect.unwrap_or(BlockEffect::Single(acc)),
            predecessors: BTreeSet::new(),
            successors: BTreeSet::new(),
        };
        debug!("{block}");
        self.blocks.push(block);
    }
}

fn label_of(inst: &Instruction) -> String {
    inst.attr.as_ref().map(Value::to_string).unwrap_or_default()
}

pub fn segment(instructions: &[Instruction], effects: &EffectTable) -> Result<Segmentation, LapError> {
    let mut label_offsets: HashMap<String, u32> = HashMap::new();
    for inst in instructions.iter().filter(|i| i.is(Opcode::Label)) {
        label_offsets.insert(label_of(inst), inst.offset);
    }

    let target_of = |inst: &Instruction| -> Result<u32, LapError> {
        let label = label_of(inst);
        label_offsets
            .get(&label)
            .copied()
            .ok_or(LapError::UnresolvedLabel { label, offset: inst.offset })
    };

    let mut jumps_to_offset: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for inst in instructions.iter().filter(|i| i.kind.is_jump()) {
        jumps_to_offset.entry(target_of(inst)?).or_default().push(inst.offset);
    }

    let mut b = Builder {
        instructions,
        effects,
        blocks: Vec::new(),
        flags: BTreeSet::from([BlockFlag::Entry]),
        jump_targets: BTreeSet::new(),
    };

    let mut start = instructions.first().map(|i| i.offset).unwrap_or(0);
    let mut prev: Option<u32> = None;
    let mut open = false;
    for (i, inst) in instructions.iter().enumerate() {
        let offset = inst.offset;
        let follow = instructions.get(i + 1).map(|n| n.offset).unwrap_or(offset + 1);

        if jumps_to_offset.contains_key(&offset) && open && start < offset {
            if let Some(end) = prev {
                b.close(start, end, Some(offset));
            }
            start = offset;
        }
        open = true;
        prev = Some(offset);

        match inst.kind.class() {
            OpClass::Jump | OpClass::JumpCond => {
                b.jump_targets.insert(target_of(inst)?);
                if inst.kind.class() == OpClass::Jump {
                    b.flags.insert(BlockFlag::UnconditionalJump);
                }
                b.close(start, offset, Some(follow));
                start = follow;
                open = false;
            }
            OpClass::NoFollow => {
                b.flags.insert(BlockFlag::NoFollow);
                b.close(start, offset, Some(follow));
                start = follow;
                open = false;
            }
            _ => {}
        }
    }
    if let Some(end) = prev.filter(|_| open) {
        b.close(start, end, None);
    }

    let mut blocks = b.blocks;
    if let Some(last) = blocks.last_mut() {
        last.follow_offset = None;
    }

    let block_by_start: HashMap<u32, usize> =
        blocks.iter().enumerate().map(|(i, bb)| (bb.start_offset, i)).collect();
    for i in 0..blocks.len() {
        let mut succs: BTreeSet<usize> = blocks[i]
            .jump_targets
            .iter()
            .filter_map(|t| block_by_start.get(t).copied())
            .collect();
        if blocks[i].falls_through() && i + 1 < blocks.len() {
            succs.insert(i + 1);
        }
        for &s in &succs {
            blocks[s].predecessors.insert(i);
        }
        blocks[i].successors = succs;
    }

    Ok(Segmentation {
        blocks,
        instructions: instructions.to_vec(),
        jumps_to_offset,
        block_by_start,
    })
}

/// Insert COME_FROM markers at merge points and STACK-ACCESS markers where
/// an instruction consumes a value pushed in another block.
///
/// Every block is assumed to start with an empty stack of its own; the
/// depths predecessors leave behind are not compared. Run this once per
/// segmentation: a second pass would insert the markers again.
pub fn ingest(seg: &Segmentation, effects: &EffectTable) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(seg.instructions.len());
    let mut last_offset = None;
    let mut depth: i32 = 0;

    for inst in &seg.instructions {
        let offset = inst.offset;
        if last_offset != Some(offset) {
            if let Some(sources) = seg.jumps_to_offset.get(&offset) {
                let mut sources = sources.clone();
                sources.sort_unstable_by(|a, b| b.cmp(a));
                for source in sources {
                    debug!("COME_FROM {source} at {offset}");
                    out.push(Instruction::op(Opcode::ComeFrom, Some(Value::Int(source as i64)), offset));
                }
            }
            last_offset = Some(offset);
        }
        if seg.block_by_start.contains_key(&offset) {
            depth = 0;
        }

        if let Effect::Fixed { pops, pushes } = effects.effect(&inst.kind) {
            depth -= pops as i32;
            if depth < 0 {
                for reach in (1..=-depth).rev() {
                    debug!("STACK-ACCESS {reach} at {offset}");
                    out.push(Instruction::op(Opcode::StackAccess, Some(Value::Int(reach as i64)), offset));
                }
                depth = 0;
            }
            depth += pushes as i32;
        }
        out.push(inst.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::scan;

    fn listing(text: &str) -> Vec<Instruction> {
        scan(text).unwrap().remove(0).instructions
    }

    const IF_ELSE: &str = "\
0 varref a
1 goto-if-nil 1
2 constant 1
3 goto 2
4:1 constant 2
5:2 return
";

    const WHILE: &str = "\
0 constant 0
1 varbind i
2:1 varref i
3 constant 10
4 lss
5 goto-if-nil-else-pop 2
6 varref i
7 add1
8 varset i
9 goto 1
10:2 unbind 1
11 return
";

    #[test]
    fn blocks_cover_every_offset_once() {
        let effects = EffectTable::default();
        for text in [IF_ELSE, WHILE] {
            let insts = listing(text);
            let seg = segment(&insts, &effects).unwrap();
            for inst in &insts {
                let owners = seg.blocks.iter().filter(|b| b.contains(inst.offset)).count();
                assert_eq!(owners, 1, "offset {} owned by {owners} blocks", inst.offset);
            }
            for pair in seg.blocks.windows(2) {
                assert_eq!(pair[0].follow_offset, Some(pair[1].start_offset));
                assert!(pair[0].end_offset < pair[1].start_offset);
            }
            assert_eq!(seg.blocks.last().unwrap().follow_offset, None);
            assert!(seg.blocks[0].flags.contains(&BlockFlag::Entry));
        }
    }

    #[test]
    fn jump_targets_start_blocks() {
        let effects = EffectTable::default();
        for text in [IF_ELSE, WHILE] {
            let seg = segment(&listing(text), &effects).unwrap();
            for target in seg.jumps_to_offset.keys() {
                assert!(seg.block_by_start.contains_key(target), "target {target} starts no block");
            }
        }
    }

    #[test]
    fn if_else_blocks_and_edges() {
        let seg = segment(&listing(IF_ELSE), &EffectTable::default()).unwrap();
        let ranges: Vec<(u32, u32)> = seg.blocks.iter().map(|b| (b.start_offset, b.end_offset)).collect();
        assert_eq!(ranges, [(0, 1), (2, 3), (4, 4), (5, 5)]);
        assert!(seg.blocks[1].flags.contains(&BlockFlag::UnconditionalJump));
        assert!(seg.blocks[3].flags.contains(&BlockFlag::NoFollow));
        assert_eq!(seg.blocks[0].successors, BTreeSet::from([1, 2]));
        assert_eq!(seg.blocks[3].predecessors, BTreeSet::from([1, 2]));
        assert_eq!(seg.jumps_to_offset[&5], vec![3]);
    }

    #[test]
    fn branch_block_carries_both_effects() {
        let seg = segment(&listing(WHILE), &EffectTable::default()).unwrap();
        let cond = &seg.blocks[seg.block_by_start[&2]];
        assert_eq!(cond.stack_effect, BlockEffect::Pair(0, 1));
    }

    #[test]
    fn unresolved_label_names_the_jump() {
        let insts = listing("0 varref a\n1 goto-if-nil 9\n2 return\n");
        let err = segment(&insts, &EffectTable::default()).unwrap_err();
        match err {
            LapError::UnresolvedLabel { label, offset } => {
                assert_eq!(label, "9");
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn come_froms_precede_merge_points_in_descending_order() {
        let insts = listing("0 varref a\n1 goto-if-nil 1\n2 varref b\n3 goto-if-nil 1\n4:1 return\n");
        let effects = EffectTable::default();
        let seg = segment(&insts, &effects).unwrap();
        let out = ingest(&seg, &effects);
        let merge: Vec<i64> = out
            .iter()
            .filter(|i| i.is(Opcode::ComeFrom))
            .filter_map(Instruction::attr_int)
            .collect();
        assert_eq!(merge, [3, 1]);
        let first_at_4 = out.iter().position(|i| i.offset == 4).unwrap();
        assert!(out[first_at_4].is(Opcode::ComeFrom));
    }

    #[test]
    fn annotated_blocks_never_go_negative() {
        let effects = EffectTable::default();
        for text in [IF_ELSE, WHILE] {
            let seg = segment(&listing(text), &effects).unwrap();
            let out = ingest(&seg, &effects);
            let mut depth = 0i32;
            let mut last_offset = None;
            for inst in &out {
                if last_offset != Some(inst.offset) && seg.block_by_start.contains_key(&inst.offset) {
                    depth = 0;
                }
                last_offset = Some(inst.offset);
                if inst.is(Opcode::StackAccess) {
                    depth += 1;
                    continue;
                }
                if let Effect::Fixed { pops, pushes } = effects.effect(&inst.kind) {
                    depth -= pops as i32;
                    assert!(depth >= 0, "negative depth at {inst}");
                    depth += pushes as i32;
                }
            }
        }
    }

    #[test]
    fn stack_access_marks_cross_block_consumers() {
        let insts = listing("0 varref a\n1 goto-if-not-nil-else-pop 1\n2 varref b\n3:1 return\n");
        let effects = EffectTable::default();
        let seg = segment(&insts, &effects).unwrap();
        let out = ingest(&seg, &effects);
        let names: Vec<String> = out.iter().map(Instruction::name).collect();
        assert_eq!(
            names,
            [
                "VARREF",
                "GOTO-IF-NOT-NIL-ELSE-POP",
                "VARREF",
                "COME_FROM",
                "LABEL",
                "STACK-ACCESS",
                "RETURN"
            ]
        );
    }
}
