//! Compiled expression trees. These are what instructions hold and evaluate;
//! they are produced from AST nodes by compilation, after constant folding.

use crate::error::EvalError;
use crate::exec::{Execution, ExecutionType};
use crate::instr::Instructions;
use crate::json::{JsonType, JsonValue};
use crate::operators;
use crate::runtime::TemplateContext;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Negate,
    Not,
    Size,
    BitNot,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lsh,
    Rsh,
    Rrsh,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Neq,
    BitAnd,
    BitOr,
    BitXor,
}

/// A write target: a variable, or a member/index path rooted in one.
/// Index expressions are evaluated left to right when the path is resolved.
#[derive(Debug, Clone)]
pub enum Assignable {
    Variable(String),
    Member {
        parent: Box<Assignable>,
        name: String,
    },
    Index {
        parent: Box<Assignable>,
        index: Box<Expression>,
    },
}

/// One resolved path segment of an assignment.
#[derive(Debug, Clone)]
pub enum Step {
    Member(String),
    Index(JsonValue),
}

impl Assignable {
    /// Current value of the target, for compound assignment and increments.
    pub fn get(&self, ctx: &mut TemplateContext) -> Result<JsonValue, EvalError> {
        match self {
            Assignable::Variable(name) => ctx.get_var(name),
            Assignable::Member { parent, name } => {
                let p = parent.get(ctx)?;
                match operators::field(&p, name) {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Assignable::Index { parent, index } => {
                let p = parent.get(ctx)?;
                let i = index.evaluate(ctx)?;
                match operators::index(&p, &i) {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
        }
    }

    pub fn assign(&self, ctx: &mut TemplateContext, value: JsonValue) -> Result<(), EvalError> {
        let (root, steps) = self.resolve(ctx)?;
        ctx.assign_path(&root, &steps, value)
    }

    fn resolve(&self, ctx: &mut TemplateContext) -> Result<(String, Vec<Step>), EvalError> {
        match self {
            Assignable::Variable(name) => Ok((name.clone(), Vec::new())),
            Assignable::Member { parent, name } => {
                let (root, mut steps) = parent.resolve(ctx)?;
                steps.push(Step::Member(name.clone()));
                Ok((root, steps))
            }
            Assignable::Index { parent, index } => {
                let (root, mut steps) = parent.resolve(ctx)?;
                steps.push(Step::Index(index.evaluate(ctx)?));
                Ok((root, steps))
            }
        }
    }

    pub fn write_debug(&self, out: &mut String) {
        match self {
            Assignable::Variable(name) => out.push_str(name),
            Assignable::Member { parent, name } => {
                parent.write_debug(out);
                out.push('.');
                out.push_str(name);
            }
            Assignable::Index { parent, .. } => {
                parent.write_debug(out);
                out.push_str("[..]");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expression {
    Literal(JsonValue),
    /// `_`: the innermost value under construction.
    Underscore,
    /// `$`: the outermost construction below the nearest root.
    Dollar,
    Variable(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Member {
        parent: Box<Expression>,
        name: String,
    },
    Index {
        parent: Box<Expression>,
        index: Box<Expression>,
    },
    Slice {
        parent: Box<Expression>,
        from: Option<Box<Expression>>,
        to: Option<Box<Expression>>,
    },
    Ternary {
        cond: Box<Expression>,
        then: Box<Expression>,
        other: Box<Expression>,
    },
    /// `&&`, never evaluating the right operand when the left is falsy.
    Conjunction {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// `||`, never evaluating the right operand when the left is truthy.
    Disjunction {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    HasKey {
        hasnt: bool,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    IsType {
        isnt: bool,
        operand: Box<Expression>,
        ty: JsonType,
    },
    Assign {
        target: Assignable,
        value: Box<Expression>,
    },
    Increment {
        target: Assignable,
        decrement: bool,
        postfix: bool,
    },
    /// `do { .. } then e then do { .. }` chains, flattened.
    BeforeAfter {
        before: Vec<Expression>,
        result: Box<Expression>,
        after: Vec<Expression>,
    },
    /// `match [subject] { case v -> r, .. }`: arms compare by value equality.
    MatchValue {
        subject: Box<Expression>,
        cases: Vec<(Expression, Expression)>,
        default: Box<Expression>,
    },
    /// Subjectless `match`: arms are conditions, first truthy one wins.
    MatchCondition {
        cases: Vec<(Expression, Expression)>,
        default: Box<Expression>,
    },
    /// String interpolation: parts stringified and concatenated.
    Interpolate(Vec<Expression>),
    Call {
        function: String,
        args: Vec<Expression>,
    },
    /// A nested construction or subtemplate: runs its own instruction
    /// program and yields the produced value.
    Execute {
        insns: Rc<Instructions>,
        ty: ExecutionType,
    },
}

fn apply_binary(op: BinaryOp, a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match op {
        BinaryOp::Add => operators::add(a, b),
        BinaryOp::Sub => operators::sub(a, b),
        BinaryOp::Mul => operators::mul(a, b),
        BinaryOp::Div => operators::div(a, b),
        BinaryOp::Mod => operators::modulo(a, b),
        BinaryOp::Lsh => operators::blsh(a, b),
        BinaryOp::Rsh => operators::brsh(a, b),
        BinaryOp::Rrsh => operators::brrsh(a, b),
        BinaryOp::Lt => operators::lt(a, b),
        BinaryOp::Gt => operators::gt(a, b),
        BinaryOp::Le => operators::le(a, b),
        BinaryOp::Ge => operators::ge(a, b),
        BinaryOp::Eq => Ok(operators::eq(a, b)),
        BinaryOp::Neq => Ok(operators::neq(a, b)),
        BinaryOp::BitAnd => Ok(operators::band(a, b)),
        BinaryOp::BitOr => Ok(operators::bor(a, b)),
        BinaryOp::BitXor => Ok(operators::bxor(a, b)),
    }
}

impl Expression {
    pub fn evaluate(&self, ctx: &mut TemplateContext) -> Result<JsonValue, EvalError> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::Underscore => ctx.underscore(),
            Expression::Dollar => ctx.dollar(),
            Expression::Variable(name) => ctx.get_var(name),
            Expression::Unary { op, operand } => {
                let v = operand.evaluate(ctx)?;
                let r = match op {
                    UnaryOp::Plus => operators::unary_plus(&v),
                    UnaryOp::Negate => operators::neg(&v),
                    UnaryOp::Not => Ok(operators::not(&v)),
                    UnaryOp::Size => operators::size(&v),
                    UnaryOp::BitNot => operators::bnot(&v),
                    UnaryOp::Copy => Ok(operators::copy(&v)),
                };
                match r {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::Binary { op, left, right } => {
                let a = left.evaluate(ctx)?;
                let b = right.evaluate(ctx)?;
                match apply_binary(*op, &a, &b) {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::Member { parent, name } => {
                let p = parent.evaluate(ctx)?;
                match operators::field(&p, name) {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::Index { parent, index } => {
                let p = parent.evaluate(ctx)?;
                let i = index.evaluate(ctx)?;
                match operators::index(&p, &i) {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::Slice { parent, from, to } => {
                let p = parent.evaluate(ctx)?;
                let r = match (from, to) {
                    (Some(f), Some(t)) => {
                        let fv = f.evaluate(ctx)?;
                        let tv = t.evaluate(ctx)?;
                        operators::slice(&p, &fv, &tv)
                    }
                    (Some(f), None) => {
                        let fv = f.evaluate(ctx)?;
                        operators::slice_from(&p, &fv)
                    }
                    (None, Some(t)) => {
                        let tv = t.evaluate(ctx)?;
                        operators::slice_to(&p, &tv)
                    }
                    (None, None) => operators::slice_full(&p),
                };
                match r {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::Ternary { cond, then, other } => {
                if operators::truthy(&cond.evaluate(ctx)?) {
                    then.evaluate(ctx)
                } else {
                    other.evaluate(ctx)
                }
            }
            Expression::Conjunction { left, right } => {
                if !operators::truthy(&left.evaluate(ctx)?) {
                    return Ok(JsonValue::Bool(false));
                }
                Ok(JsonValue::Bool(operators::truthy(&right.evaluate(ctx)?)))
            }
            Expression::Disjunction { left, right } => {
                if operators::truthy(&left.evaluate(ctx)?) {
                    return Ok(JsonValue::Bool(true));
                }
                Ok(JsonValue::Bool(operators::truthy(&right.evaluate(ctx)?)))
            }
            Expression::HasKey { hasnt, left, right } => {
                let a = left.evaluate(ctx)?;
                let b = right.evaluate(ctx)?;
                let r = if *hasnt {
                    operators::hasnt(&a, &b)
                } else {
                    operators::has(&a, &b)
                };
                match r {
                    Ok(v) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::IsType { isnt, operand, ty } => {
                let v = operand.evaluate(ctx)?;
                Ok(if *isnt {
                    operators::isnt(&v, *ty)
                } else {
                    operators::is(&v, *ty)
                })
            }
            Expression::Assign { target, value } => {
                let v = value.evaluate(ctx)?;
                match target.assign(ctx, v.clone()) {
                    Ok(()) => Ok(v),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::Increment {
                target,
                decrement,
                postfix,
            } => {
                let old = target.get(ctx)?;
                let one = JsonValue::Int(1);
                let stepped = if *decrement {
                    operators::sub(&old, &one)
                } else {
                    operators::add(&old, &one)
                };
                let new = match stepped {
                    Ok(v) => v,
                    Err(e) => return ctx.exception(e),
                };
                match target.assign(ctx, new.clone()) {
                    Ok(()) => Ok(if *postfix { old } else { new }),
                    Err(e) => ctx.exception(e),
                }
            }
            Expression::BeforeAfter {
                before,
                result,
                after,
            } => {
                for e in before {
                    e.evaluate(ctx)?;
                }
                let r = result.evaluate(ctx)?;
                for e in after {
                    e.evaluate(ctx)?;
                }
                Ok(r)
            }
            Expression::MatchValue {
                subject,
                cases,
                default,
            } => {
                let v = subject.evaluate(ctx)?;
                for (pattern, result) in cases {
                    if pattern.evaluate(ctx)? == v {
                        return result.evaluate(ctx);
                    }
                }
                default.evaluate(ctx)
            }
            Expression::MatchCondition { cases, default } => {
                for (cond, result) in cases {
                    if operators::truthy(&cond.evaluate(ctx)?) {
                        return result.evaluate(ctx);
                    }
                }
                default.evaluate(ctx)
            }
            Expression::Interpolate(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&operators::stringify(&part.evaluate(ctx)?));
                }
                Ok(JsonValue::string(out))
            }
            Expression::Call { function, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(ctx)?);
                }
                ctx.call_function(function, values)
            }
            Expression::Execute { insns, ty } => Execution::new(*ty, insns.clone()).run(ctx),
        }
    }

    /// Whether evaluation can observe or change the context. Only
    /// context-free expressions are eligible for constant folding.
    pub fn is_context_dependent(&self) -> bool {
        match self {
            Expression::Literal(_) => false,
            Expression::Underscore
            | Expression::Dollar
            | Expression::Variable(_)
            | Expression::Assign { .. }
            | Expression::Increment { .. }
            | Expression::BeforeAfter { .. }
            | Expression::Call { .. }
            | Expression::Execute { .. } => true,
            Expression::Unary { operand, .. } => operand.is_context_dependent(),
            Expression::Binary { left, right, .. }
            | Expression::Conjunction { left, right }
            | Expression::Disjunction { left, right }
            | Expression::HasKey { left, right, .. } => {
                left.is_context_dependent() || right.is_context_dependent()
            }
            Expression::Member { parent, .. } => parent.is_context_dependent(),
            Expression::Index { parent, index } => {
                parent.is_context_dependent() || index.is_context_dependent()
            }
            Expression::Slice { parent, from, to } => {
                parent.is_context_dependent()
                    || from.as_ref().is_some_and(|e| e.is_context_dependent())
                    || to.as_ref().is_some_and(|e| e.is_context_dependent())
            }
            Expression::Ternary { cond, then, other } => {
                cond.is_context_dependent()
                    || then.is_context_dependent()
                    || other.is_context_dependent()
            }
            Expression::IsType { operand, .. } => operand.is_context_dependent(),
            Expression::MatchValue {
                subject,
                cases,
                default,
            } => {
                subject.is_context_dependent()
                    || default.is_context_dependent()
                    || cases
                        .iter()
                        .any(|(p, r)| p.is_context_dependent() || r.is_context_dependent())
            }
            Expression::MatchCondition { cases, default } => {
                default.is_context_dependent()
                    || cases
                        .iter()
                        .any(|(c, r)| c.is_context_dependent() || r.is_context_dependent())
            }
            Expression::Interpolate(parts) => parts.iter().any(|p| p.is_context_dependent()),
        }
    }

    /// Folds a context-free expression down to its value. Expressions that
    /// touch the context, or whose evaluation errors, are left unfolded.
    pub fn simplify_to_literal(&self) -> Option<JsonValue> {
        if self.is_context_dependent() {
            return None;
        }
        let mut ctx = TemplateContext::new();
        self.evaluate(&mut ctx).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionType;
    use serde_json::json;

    fn lit(j: serde_json::Value) -> Expression {
        Expression::Literal(JsonValue::from(j))
    }

    fn bin(op: BinaryOp, a: Expression, b: Expression) -> Expression {
        Expression::Binary {
            op,
            left: Box::new(a),
            right: Box::new(b),
        }
    }

    #[test]
    fn test_constant_folding_matches_evaluation() {
        let e = bin(
            BinaryOp::Mul,
            bin(BinaryOp::Add, lit(json!(2)), lit(json!(3))),
            lit(json!(4)),
        );
        let folded = e.simplify_to_literal().unwrap();
        let mut ctx = TemplateContext::new();
        assert_eq!(folded, e.evaluate(&mut ctx).unwrap());
        assert_eq!(folded, JsonValue::Int(20));
    }

    #[test]
    fn test_variable_blocks_folding() {
        let e = bin(BinaryOp::Add, Expression::Variable("x".into()), lit(json!(1)));
        assert!(e.is_context_dependent());
        assert!(e.simplify_to_literal().is_none());
    }

    #[test]
    fn test_erroring_constant_does_not_fold() {
        let e = bin(BinaryOp::Div, lit(json!(1)), lit(json!(0)));
        assert!(!e.is_context_dependent());
        assert!(e.simplify_to_literal().is_none());
    }

    #[test]
    fn test_conjunction_short_circuits() {
        // false && (1 / 0): the failing division is never evaluated.
        let e = Expression::Conjunction {
            left: Box::new(lit(json!(false))),
            right: Box::new(bin(BinaryOp::Div, lit(json!(1)), lit(json!(0)))),
        };
        let mut ctx = TemplateContext::new();
        assert_eq!(e.evaluate(&mut ctx).unwrap(), JsonValue::Bool(false));
    }

    #[test]
    fn test_disjunction_short_circuits() {
        let e = Expression::Disjunction {
            left: Box::new(lit(json!(true))),
            right: Box::new(bin(BinaryOp::Div, lit(json!(1)), lit(json!(0)))),
        };
        let mut ctx = TemplateContext::new();
        assert_eq!(e.evaluate(&mut ctx).unwrap(), JsonValue::Bool(true));
    }

    #[test]
    fn test_assignment_defines_and_reads_back() {
        let mut ctx = TemplateContext::new();
        let assign = Expression::Assign {
            target: Assignable::Variable("x".into()),
            value: Box::new(lit(json!(41))),
        };
        assert_eq!(assign.evaluate(&mut ctx).unwrap(), JsonValue::Int(41));
        let incr = Expression::Increment {
            target: Assignable::Variable("x".into()),
            decrement: false,
            postfix: false,
        };
        assert_eq!(incr.evaluate(&mut ctx).unwrap(), JsonValue::Int(42));
    }

    #[test]
    fn test_member_assignment_writes_through_path() {
        let mut ctx = TemplateContext::new();
        ctx.set_var("o", JsonValue::from(json!({"a": {"b": 1}})));
        let target = Assignable::Member {
            parent: Box::new(Assignable::Member {
                parent: Box::new(Assignable::Variable("o".into())),
                name: "a".into(),
            }),
            name: "b".into(),
        };
        target.assign(&mut ctx, JsonValue::Int(9)).unwrap();
        assert_eq!(
            ctx.get_var("o").unwrap(),
            JsonValue::from(json!({"a": {"b": 9}}))
        );
    }

    #[test]
    fn test_index_assignment_into_array() {
        let mut ctx = TemplateContext::new();
        ctx.set_var("a", JsonValue::from(json!([1, 2, 3])));
        let target = Assignable::Index {
            parent: Box::new(Assignable::Variable("a".into())),
            index: Box::new(lit(json!(-1))),
        };
        target.assign(&mut ctx, JsonValue::Int(30)).unwrap();
        assert_eq!(ctx.get_var("a").unwrap(), JsonValue::from(json!([1, 2, 30])));
    }

    #[test]
    fn test_undefined_variable_errors() {
        let mut ctx = TemplateContext::new();
        let err = Expression::Variable("nope".into())
            .evaluate(&mut ctx)
            .unwrap_err();
        assert_eq!(err.exception, ExceptionType::UndefinedVariable);
    }

    #[test]
    fn test_match_value_picks_equal_arm() {
        let e = Expression::MatchValue {
            subject: Box::new(lit(json!(2))),
            cases: vec![
                (lit(json!(1)), lit(json!("one"))),
                (lit(json!(2.0)), lit(json!("two"))),
            ],
            default: Box::new(lit(json!("many"))),
        };
        let mut ctx = TemplateContext::new();
        assert_eq!(
            e.evaluate(&mut ctx).unwrap(),
            JsonValue::string("two"),
            "numeric equality crosses the int/float split"
        );
    }

    #[test]
    fn test_interpolation_stringifies_parts() {
        let e = Expression::Interpolate(vec![
            lit(json!("n = ")),
            lit(json!(2.0)),
            lit(json!("!")),
        ]);
        let mut ctx = TemplateContext::new();
        assert_eq!(e.evaluate(&mut ctx).unwrap(), JsonValue::string("n = 2!"));
    }
}
