//! Linear instruction programs. Compilation emits through an
//! [`InstructionSink`] using symbolic labels; sealing the sink resolves every
//! label to its instruction offset, so the finished [`Instructions`] are
//! immutable and re-executable.

use crate::expr::Expression;
use crate::runtime::FunctionDefinition;
use std::rc::Rc;

/// Handle to a jump target allocated by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(pub(crate) usize);

/// Static description of an execution frame: the half-open instruction range
/// it spans and, for loop frames, where break and continue branch to.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub name: &'static str,
    pub from: LabelId,
    pub to: LabelId,
    pub break_to: Option<LabelId>,
    pub continue_to: Option<LabelId>,
}

#[derive(Debug, Clone)]
pub enum Instruction {
    /// Produce an unkeyed value into the surrounding construction.
    Result(Expression),
    /// Produce a keyed value; only valid inside object constructions.
    ResultWithKey(Expression, Expression),
    /// Evaluate for side effects, discard the value.
    VoidEval(Expression),
    /// Jump target marker; executing it does nothing.
    Label(LabelId),
    /// Open a frame (a partial scope layer) covering a range of instructions.
    PushFrame(FrameSpec),
    Jump(LabelId),
    /// Branch when the condition is truthy.
    IfJump(Expression, LabelId),
    /// Branch when the condition is falsy.
    UnlessJump(Expression, LabelId),
    /// Branch when the operand equals the active switch value.
    SwitchJump(Expression, LabelId),
    /// Set the active switch value on the current layer.
    InitSwitch(Expression),
    /// Start a numeric range iterator, counting up or down as needed.
    InitRangeItr(Expression, Expression),
    /// Start an element iterator over an array or the characters of a string.
    InitArrayItr(Expression),
    /// Start a key/value iterator over an object's members.
    InitObjectItr(Expression),
    /// Branch when the active iterator is exhausted.
    ItrJump(LabelId),
    /// Bind the iterator's next value to a variable.
    ItrGet(String),
    /// Bind the iterator's next key and value to two variables.
    ItrGetKV(String, String),
    /// Unwind `depth` breakable frames and branch to the last one's break
    /// target.
    BreakFrame(u32),
    /// Unwind to the `depth`-th breakable frame and branch to its continue
    /// target.
    ContinueFrame(u32),
    /// Terminate the current execution.
    Return,
    /// Register a function on the current layer.
    DefFn(Rc<FunctionDefinition>),
}

/// Growable instruction buffer used during compilation.
#[derive(Default)]
pub struct InstructionSink {
    insns: Vec<Instruction>,
    labels: usize,
}

impl InstructionSink {
    pub fn new() -> InstructionSink {
        InstructionSink::default()
    }

    pub fn add(&mut self, insn: Instruction) {
        self.insns.push(insn);
    }

    /// Allocates a fresh label; it must be marked exactly once before the
    /// sink is sealed.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.labels);
        self.labels += 1;
        id
    }

    /// Places the label at the current end of the program.
    pub fn mark(&mut self, label: LabelId) {
        self.insns.push(Instruction::Label(label));
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Seals the program, resolving every label to its offset.
    pub fn seal(self) -> Instructions {
        let mut label_pos = vec![usize::MAX; self.labels];
        for (pos, insn) in self.insns.iter().enumerate() {
            if let Instruction::Label(id) = insn {
                label_pos[id.0] = pos;
            }
        }
        debug_assert!(label_pos.iter().all(|&p| p != usize::MAX));
        Instructions {
            insns: self.insns,
            label_pos,
        }
    }
}

/// A sealed, immutable instruction program.
#[derive(Debug)]
pub struct Instructions {
    insns: Vec<Instruction>,
    label_pos: Vec<usize>,
}

impl Instructions {
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn at(&self, pos: usize) -> &Instruction {
        &self.insns[pos]
    }

    /// Instruction offset of a label.
    pub fn pos_of(&self, label: LabelId) -> usize {
        self.label_pos[label.0]
    }

    /// Debug listing, one instruction per line with offsets.
    pub fn write_debug(&self, out: &mut String) {
        use std::fmt::Write;
        for (pos, insn) in self.insns.iter().enumerate() {
            let _ = writeln!(out, "{:4}  {:?}", pos, insn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::JsonValue;

    #[test]
    fn test_labels_resolve_to_offsets() {
        let mut sink = InstructionSink::new();
        let end = sink.new_label();
        sink.add(Instruction::Jump(end));
        sink.add(Instruction::Result(Expression::Literal(JsonValue::Int(1))));
        sink.mark(end);
        let insns = sink.seal();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns.pos_of(end), 2);
        assert!(matches!(insns.at(2), Instruction::Label(_)));
    }

    #[test]
    fn test_labels_are_distinct() {
        let mut sink = InstructionSink::new();
        let a = sink.new_label();
        let b = sink.new_label();
        assert_ne!(a, b);
        sink.mark(a);
        sink.add(Instruction::Return);
        sink.mark(b);
        let insns = sink.seal();
        assert_eq!(insns.pos_of(a), 0);
        assert_eq!(insns.pos_of(b), 2);
    }
}
