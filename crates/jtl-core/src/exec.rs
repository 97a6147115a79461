//! The frame-based execution engine. An execution walks a sealed instruction
//! program with a cursor, keeps a stack of active frames, and routes produced
//! values by its execution type.

use crate::error::{EvalError, ExceptionType};
use crate::instr::{Instruction, Instructions, LabelId};
use crate::json::JsonValue;
use crate::operators;
use crate::runtime::TemplateContext;
use crate::vfl::ValueIter;
use std::rc::Rc;

/// How produced values are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionType {
    /// First produced value terminates the execution and becomes its result.
    Root,
    /// Unkeyed values append to an array under construction.
    Array,
    /// Keyed values insert into an object under construction.
    Object,
}

/// A frame opened by `PushFrame` and still covering the cursor. `from`/`to`
/// are instruction offsets; the frame (and its layer) is popped as soon as
/// the cursor leaves that half-open range.
struct ActiveFrame {
    from: usize,
    to: usize,
    break_to: Option<usize>,
    continue_to: Option<usize>,
}

pub struct Execution {
    ty: ExecutionType,
    insns: Rc<Instructions>,
    pos: usize,
    terminate: bool,
    root_value: Option<JsonValue>,
    scope: Option<usize>,
    frames: Vec<ActiveFrame>,
}

impl Execution {
    pub fn new(ty: ExecutionType, insns: Rc<Instructions>) -> Execution {
        Execution {
            ty,
            insns,
            pos: 0,
            terminate: false,
            root_value: None,
            scope: None,
            frames: Vec::new(),
        }
    }

    /// Runs the program to completion and yields the constructed value.
    /// Pushes its own layer (and, for constructions, its scope value) on
    /// entry and unwinds both again even when evaluation fails.
    pub fn run(&mut self, ctx: &mut TemplateContext) -> Result<JsonValue, EvalError> {
        match self.ty {
            ExecutionType::Root => {
                ctx.push_subtemplate_layer("subtemplate");
            }
            ExecutionType::Array => {
                let scope = ctx.push_scope(JsonValue::array());
                self.scope = Some(scope);
                ctx.push_construct_layer("array", scope);
            }
            ExecutionType::Object => {
                let scope = ctx.push_scope(JsonValue::object());
                self.scope = Some(scope);
                ctx.push_construct_layer("object", scope);
            }
        }

        let outcome = self.run_loop(ctx);

        while self.frames.pop().is_some() {
            ctx.pop_layer();
        }
        ctx.pop_layer();
        let produced = match self.ty {
            ExecutionType::Root => self.root_value.take().unwrap_or(JsonValue::Null),
            ExecutionType::Array | ExecutionType::Object => ctx.pop_scope(),
        };
        outcome.map(|_| produced)
    }

    fn run_loop(&mut self, ctx: &mut TemplateContext) -> Result<(), EvalError> {
        let insns = Rc::clone(&self.insns);
        while self.pos < insns.len() {
            let insn = insns.at(self.pos);
            self.perform(ctx, insn)?;
            self.pos += 1;
            // Frames whose range no longer covers the cursor are closed.
            while let Some(frame) = self.frames.last() {
                if self.pos >= frame.from && self.pos < frame.to {
                    break;
                }
                self.frames.pop();
                ctx.pop_layer();
            }
            if self.terminate {
                break;
            }
        }
        Ok(())
    }

    /// Moves the cursor onto a label; the label instruction itself is a
    /// no-op, so execution continues right after it.
    fn branch(&mut self, label: LabelId) {
        self.pos = self.insns.pos_of(label);
    }

    fn perform(&mut self, ctx: &mut TemplateContext, insn: &Instruction) -> Result<(), EvalError> {
        match insn {
            Instruction::Result(expr) => {
                let value = expr.evaluate(ctx)?;
                self.produce(ctx, value)
            }
            Instruction::ResultWithKey(key, expr) => {
                let key = key.evaluate(ctx)?;
                let value = expr.evaluate(ctx)?;
                self.produce_keyed(ctx, key, value)
            }
            Instruction::VoidEval(expr) => {
                expr.evaluate(ctx)?;
                Ok(())
            }
            Instruction::Label(_) => Ok(()),
            Instruction::PushFrame(spec) => {
                ctx.push_partial_layer(spec.name);
                self.frames.push(ActiveFrame {
                    from: self.insns.pos_of(spec.from),
                    to: self.insns.pos_of(spec.to),
                    break_to: spec.break_to.map(|l| self.insns.pos_of(l)),
                    continue_to: spec.continue_to.map(|l| self.insns.pos_of(l)),
                });
                Ok(())
            }
            Instruction::Jump(label) => {
                self.branch(*label);
                Ok(())
            }
            Instruction::IfJump(cond, label) => {
                if operators::truthy(&cond.evaluate(ctx)?) {
                    self.branch(*label);
                }
                Ok(())
            }
            Instruction::UnlessJump(cond, label) => {
                if !operators::truthy(&cond.evaluate(ctx)?) {
                    self.branch(*label);
                }
                Ok(())
            }
            Instruction::SwitchJump(value, label) => {
                let switch = ctx.get_switch()?;
                if value.evaluate(ctx)? == switch {
                    self.branch(*label);
                }
                Ok(())
            }
            Instruction::InitSwitch(expr) => {
                let value = expr.evaluate(ctx)?;
                ctx.set_switch(value);
                Ok(())
            }
            Instruction::InitRangeItr(from, to) => {
                let from = from.evaluate(ctx)?;
                let to = to.evaluate(ctx)?;
                match (from.as_i64(), to.as_i64()) {
                    (Some(a), Some(b)) => ctx.set_iterator(ValueIter::range(a, b)),
                    _ => {
                        ctx.raise(
                            ExceptionType::IncorrectTypes,
                            "loop range bounds must be numbers",
                        )?;
                        ctx.set_iterator(ValueIter::empty());
                    }
                }
                Ok(())
            }
            Instruction::InitArrayItr(expr) => {
                let value = expr.evaluate(ctx)?;
                match &value {
                    JsonValue::Array(values) => {
                        ctx.set_iterator(ValueIter::over_array(values.clone()))
                    }
                    JsonValue::Str(s) => ctx.set_iterator(ValueIter::over_chars(s)),
                    other => {
                        ctx.raise(
                            ExceptionType::IncorrectTypes,
                            format!("cannot iterate over {}", other.json_type()),
                        )?;
                        ctx.set_iterator(ValueIter::empty());
                    }
                }
                Ok(())
            }
            Instruction::InitObjectItr(expr) => {
                let value = expr.evaluate(ctx)?;
                match &value {
                    JsonValue::Object(map) => {
                        let entries = map
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        ctx.set_iterator(ValueIter::over_entries(entries));
                    }
                    other => {
                        ctx.raise(
                            ExceptionType::IncorrectTypes,
                            format!("cannot iterate members of {}", other.json_type()),
                        )?;
                        ctx.set_iterator(ValueIter::empty());
                    }
                }
                Ok(())
            }
            Instruction::ItrJump(label) => {
                if !ctx.itr_has_next()? {
                    self.branch(*label);
                }
                Ok(())
            }
            Instruction::ItrGet(name) => {
                let value = ctx.itr_next()?;
                ctx.define_local(name, value);
                Ok(())
            }
            Instruction::ItrGetKV(key_name, value_name) => {
                let (key, value) = ctx.itr_next_pair()?;
                ctx.define_local(key_name, JsonValue::string(key));
                ctx.define_local(value_name, value);
                Ok(())
            }
            Instruction::BreakFrame(depth) => {
                self.break_frames(ctx, *depth);
                Ok(())
            }
            Instruction::ContinueFrame(depth) => self.continue_frames(ctx, *depth),
            Instruction::Return => {
                self.terminate = true;
                Ok(())
            }
            Instruction::DefFn(def) => match ctx.define_function(def.clone()) {
                Ok(()) => Ok(()),
                Err(e) => ctx.exception(e).map(|_| ()),
            },
        }
    }

    /// Unwinds frames until `depth` breakable ones have been closed, then
    /// branches to the last one's break target. With fewer breakable frames
    /// open than requested, the whole execution ends.
    fn break_frames(&mut self, ctx: &mut TemplateContext, depth: u32) {
        let mut remaining = depth;
        while let Some(frame) = self.frames.pop() {
            ctx.pop_layer();
            if let Some(break_to) = frame.break_to {
                remaining -= 1;
                if remaining == 0 {
                    self.pos = break_to;
                    return;
                }
            }
        }
        self.terminate = true;
    }

    /// Unwinds to the `depth`-th breakable frame and branches to its
    /// continue target.
    fn continue_frames(&mut self, ctx: &mut TemplateContext, depth: u32) -> Result<(), EvalError> {
        let mut remaining = depth;
        while let Some(frame) = self.frames.pop() {
            ctx.pop_layer();
            if let Some(continue_to) = frame.continue_to {
                remaining -= 1;
                if remaining == 0 {
                    self.pos = continue_to;
                    return Ok(());
                }
            }
        }
        Err(EvalError::new(
            ExceptionType::ExecutionException,
            "no loop to continue here",
        ))
    }

    fn produce(&mut self, ctx: &mut TemplateContext, value: JsonValue) -> Result<(), EvalError> {
        match self.ty {
            ExecutionType::Root => {
                self.root_value = Some(value);
                self.terminate = true;
                Ok(())
            }
            ExecutionType::Array => {
                if let Some(scope) = self.scope {
                    if let JsonValue::Array(values) = ctx.scope_mut(scope) {
                        Rc::make_mut(values).push(value);
                    }
                }
                Ok(())
            }
            ExecutionType::Object => ctx
                .raise(
                    ExceptionType::InvalidKey,
                    "values in an object construction need a key",
                )
                .map(|_| ()),
        }
    }

    fn produce_keyed(
        &mut self,
        ctx: &mut TemplateContext,
        key: JsonValue,
        value: JsonValue,
    ) -> Result<(), EvalError> {
        match self.ty {
            ExecutionType::Object => {
                if key.is_array() || key.is_object() {
                    return ctx
                        .raise(
                            ExceptionType::InvalidKey,
                            format!("{} cannot be used as a key", key.json_type()),
                        )
                        .map(|_| ());
                }
                if let Some(scope) = self.scope {
                    if let JsonValue::Object(map) = ctx.scope_mut(scope) {
                        Rc::make_mut(map).insert(operators::stringify(&key), value);
                    }
                }
                Ok(())
            }
            ExecutionType::Root | ExecutionType::Array => ctx
                .raise(
                    ExceptionType::InvalidKey,
                    "keyed values are only allowed in object constructions",
                )
                .map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;
    use crate::instr::{FrameSpec, InstructionSink};
    use serde_json::json;

    fn lit(j: serde_json::Value) -> Expression {
        Expression::Literal(JsonValue::from(j))
    }

    fn run(ty: ExecutionType, insns: Instructions) -> JsonValue {
        let mut ctx = TemplateContext::new();
        Execution::new(ty, Rc::new(insns)).run(&mut ctx).unwrap()
    }

    #[test]
    fn test_root_takes_first_value() {
        let mut sink = InstructionSink::new();
        sink.add(Instruction::Result(lit(json!(1))));
        sink.add(Instruction::Result(lit(json!(2))));
        assert_eq!(run(ExecutionType::Root, sink.seal()), JsonValue::Int(1));
    }

    #[test]
    fn test_array_appends() {
        let mut sink = InstructionSink::new();
        sink.add(Instruction::Result(lit(json!(1))));
        sink.add(Instruction::Result(lit(json!("x"))));
        assert_eq!(
            run(ExecutionType::Array, sink.seal()),
            JsonValue::from(json!([1, "x"]))
        );
    }

    #[test]
    fn test_object_inserts_keyed() {
        let mut sink = InstructionSink::new();
        sink.add(Instruction::ResultWithKey(lit(json!("a")), lit(json!(1))));
        sink.add(Instruction::ResultWithKey(lit(json!(2)), lit(json!(true))));
        assert_eq!(
            run(ExecutionType::Object, sink.seal()),
            JsonValue::from(json!({"a": 1, "2": true}))
        );
    }

    #[test]
    fn test_unkeyed_value_in_object_errors() {
        let mut sink = InstructionSink::new();
        sink.add(Instruction::Result(lit(json!(1))));
        let mut ctx = TemplateContext::new();
        let err = Execution::new(ExecutionType::Object, Rc::new(sink.seal()))
            .run(&mut ctx)
            .unwrap_err();
        assert_eq!(err.exception, ExceptionType::InvalidKey);
    }

    #[test]
    fn test_return_terminates() {
        let mut sink = InstructionSink::new();
        sink.add(Instruction::Result(lit(json!(1))));
        sink.add(Instruction::Return);
        sink.add(Instruction::Result(lit(json!(2))));
        assert_eq!(
            run(ExecutionType::Array, sink.seal()),
            JsonValue::from(json!([1]))
        );
    }

    #[test]
    fn test_jump_skips_and_label_is_noop() {
        let mut sink = InstructionSink::new();
        let end = sink.new_label();
        sink.add(Instruction::Jump(end));
        sink.add(Instruction::Result(lit(json!("skipped"))));
        sink.mark(end);
        sink.add(Instruction::Result(lit(json!("kept"))));
        assert_eq!(
            run(ExecutionType::Array, sink.seal()),
            JsonValue::from(json!(["kept"]))
        );
    }

    // A hand-assembled loop over a range, mirroring what loop compilation
    // emits: init, jump to the check, framed body, check, back-edge.
    fn range_loop(from: serde_json::Value, to: serde_json::Value) -> Instructions {
        let mut sink = InstructionSink::new();
        let start = sink.new_label();
        let body_from = sink.new_label();
        let body_to = sink.new_label();
        let end = sink.new_label();
        sink.add(Instruction::InitRangeItr(lit(from), lit(to)));
        sink.add(Instruction::Jump(body_to));
        sink.mark(start);
        sink.add(Instruction::PushFrame(FrameSpec {
            name: "for",
            from: body_from,
            to: body_to,
            break_to: Some(end),
            continue_to: Some(body_to),
        }));
        sink.mark(body_from);
        sink.add(Instruction::ItrGet("i".into()));
        sink.add(Instruction::Result(Expression::Variable("i".into())));
        sink.mark(body_to);
        sink.add(Instruction::ItrJump(end));
        sink.add(Instruction::Jump(start));
        sink.mark(end);
        sink.seal()
    }

    #[test]
    fn test_range_loop_collects_values() {
        assert_eq!(
            run(ExecutionType::Array, range_loop(json!(0), json!(3))),
            JsonValue::from(json!([0, 1, 2]))
        );
        assert_eq!(
            run(ExecutionType::Array, range_loop(json!(2), json!(0))),
            JsonValue::from(json!([2, 1]))
        );
        assert_eq!(
            run(ExecutionType::Array, range_loop(json!(1), json!(1))),
            JsonValue::from(json!([]))
        );
    }

    #[test]
    fn test_break_frame_leaves_loop() {
        // Loop over 0..5 but break on the first iteration.
        let mut sink = InstructionSink::new();
        let start = sink.new_label();
        let body_from = sink.new_label();
        let body_to = sink.new_label();
        let end = sink.new_label();
        sink.add(Instruction::InitRangeItr(lit(json!(0)), lit(json!(5))));
        sink.add(Instruction::Jump(body_to));
        sink.mark(start);
        sink.add(Instruction::PushFrame(FrameSpec {
            name: "for",
            from: body_from,
            to: body_to,
            break_to: Some(end),
            continue_to: Some(body_to),
        }));
        sink.mark(body_from);
        sink.add(Instruction::ItrGet("i".into()));
        sink.add(Instruction::Result(Expression::Variable("i".into())));
        sink.add(Instruction::BreakFrame(1));
        sink.mark(body_to);
        sink.add(Instruction::ItrJump(end));
        sink.add(Instruction::Jump(start));
        sink.mark(end);
        assert_eq!(
            run(ExecutionType::Array, sink.seal()),
            JsonValue::from(json!([0]))
        );
    }

    #[test]
    fn test_loop_variable_is_scoped_to_frame() {
        let insns = range_loop(json!(0), json!(2));
        let mut ctx = TemplateContext::new();
        Execution::new(ExecutionType::Array, Rc::new(insns))
            .run(&mut ctx)
            .unwrap();
        assert!(ctx.get_var("i").is_err(), "loop variable leaked");
    }

    #[test]
    fn test_switch_jump_compares_to_switch_value() {
        let mut sink = InstructionSink::new();
        let hit = sink.new_label();
        let end = sink.new_label();
        sink.add(Instruction::InitSwitch(lit(json!(2))));
        sink.add(Instruction::SwitchJump(lit(json!(1)), hit));
        sink.add(Instruction::SwitchJump(lit(json!(2)), hit));
        sink.add(Instruction::Jump(end));
        sink.mark(hit);
        sink.add(Instruction::Result(lit(json!("matched"))));
        sink.mark(end);
        assert_eq!(
            run(ExecutionType::Array, sink.seal()),
            JsonValue::from(json!(["matched"]))
        );
    }
}
