//! Syntax tree nodes built by grammar reductions, plus compilation into
//! instruction programs and the static checks that run before it.

use crate::error::TemplateError;
use crate::expr::{Assignable, BinaryOp, Expression, UnaryOp};
use crate::instr::{FrameSpec, Instruction, InstructionSink, Instructions, LabelId};
use crate::json::{JsonType, JsonValue};
use crate::runtime::{FunctionBody, FunctionDefinition};
use crate::token::{Span, Token};
use std::rc::Rc;

/// One fragment of an interpolated string, as lexed.
#[derive(Debug, Clone)]
pub enum StringPartNode {
    Content { text: String, span: Span },
    Interp { expr: ExprNode, span: Span },
    Whitespace { span: Span },
    LineBreak { span: Span },
    Boundary { span: Span },
    NoLineBreak { span: Span },
}

impl StringPartNode {
    pub fn span(&self) -> Span {
        match self {
            StringPartNode::Content { span, .. }
            | StringPartNode::Interp { span, .. }
            | StringPartNode::Whitespace { span }
            | StringPartNode::LineBreak { span }
            | StringPartNode::Boundary { span }
            | StringPartNode::NoLineBreak { span } => *span,
        }
    }
}

/// One `case`/`else` block of a switch entity.
#[derive(Debug, Clone)]
pub struct CaseNode {
    /// `None` for the `else` block.
    pub condition: Option<ExprNode>,
    pub body: Vec<EntityNode>,
    pub span: Span,
}

/// One `case`/`else` arm of a match expression.
#[derive(Debug, Clone)]
pub struct MatchCaseNode {
    /// `None` for the `else` arm.
    pub pattern: Option<ExprNode>,
    pub result: ExprNode,
    pub span: Span,
}

/// The `else if`/`else` chain trailing an if entity.
#[derive(Debug, Clone, Default)]
pub struct IfTailNode {
    pub else_ifs: Vec<(ExprNode, Vec<EntityNode>)>,
    pub else_block: Option<Vec<EntityNode>>,
}

#[derive(Debug, Clone)]
pub enum ExprNode {
    Literal {
        value: JsonValue,
        span: Span,
    },
    Underscore {
        span: Span,
    },
    Dollar {
        span: Span,
    },
    Variable {
        name: String,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ExprNode>,
        span: Span,
    },
    Incr {
        decrement: bool,
        postfix: bool,
        target: Box<ExprNode>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
        span: Span,
    },
    Logic {
        conjunction: bool,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
        span: Span,
    },
    HasKey {
        hasnt: bool,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
        span: Span,
    },
    IsType {
        isnt: bool,
        operand: Box<ExprNode>,
        ty: JsonType,
        span: Span,
    },
    Ternary {
        cond: Box<ExprNode>,
        then: Box<ExprNode>,
        other: Box<ExprNode>,
        span: Span,
    },
    Member {
        parent: Box<ExprNode>,
        name: String,
        span: Span,
    },
    Index {
        parent: Box<ExprNode>,
        index: Box<ExprNode>,
        span: Span,
    },
    Slice {
        parent: Box<ExprNode>,
        from: Option<Box<ExprNode>>,
        to: Option<Box<ExprNode>>,
        span: Span,
    },
    Assign {
        /// `None` for plain `=`; compound assignments carry their operator.
        op: Option<BinaryOp>,
        target: Box<ExprNode>,
        value: Box<ExprNode>,
        span: Span,
    },
    Interpolate {
        parts: Vec<StringPartNode>,
        span: Span,
    },
    DoThen {
        before: Vec<ExprNode>,
        result: Box<ExprNode>,
        after: Vec<ExprNode>,
        span: Span,
    },
    Match {
        subject: Option<Box<ExprNode>>,
        cases: Vec<MatchCaseNode>,
        span: Span,
    },
    Call {
        function: String,
        args: Vec<ExprNode>,
        span: Span,
    },
    Object {
        entities: Vec<EntityNode>,
        span: Span,
    },
    Array {
        entities: Vec<EntityNode>,
        span: Span,
    },
    Subtemplate {
        entities: Vec<EntityNode>,
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub enum EntityNode {
    Value {
        expr: ExprNode,
        span: Span,
    },
    KeyValue {
        key: ExprNode,
        value: ExprNode,
        span: Span,
    },
    /// `@ expr`: evaluated for side effects only.
    VoidLine {
        expr: ExprNode,
        span: Span,
    },
    If {
        condition: ExprNode,
        body: Vec<EntityNode>,
        else_ifs: Vec<(ExprNode, Vec<EntityNode>)>,
        else_block: Option<Vec<EntityNode>>,
        span: Span,
    },
    ForIn {
        var: String,
        iterate: ExprNode,
        body: Vec<EntityNode>,
        span: Span,
    },
    ForInObj {
        key_var: String,
        value_var: String,
        iterate: ExprNode,
        body: Vec<EntityNode>,
        span: Span,
    },
    ForFromTo {
        var: String,
        from: ExprNode,
        to: ExprNode,
        body: Vec<EntityNode>,
        span: Span,
    },
    Switch {
        subject: Option<ExprNode>,
        cases: Vec<CaseNode>,
        span: Span,
    },
    Break {
        depth: u32,
        span: Span,
    },
    Continue {
        depth: u32,
        span: Span,
    },
    Return {
        span: Span,
    },
    DefExpr {
        name: String,
        params: Vec<String>,
        vararg: bool,
        expr: ExprNode,
        span: Span,
    },
    DefSub {
        name: String,
        params: Vec<String>,
        vararg: bool,
        body: Vec<EntityNode>,
        span: Span,
    },
}

impl ExprNode {
    pub fn span(&self) -> Span {
        match self {
            ExprNode::Literal { span, .. }
            | ExprNode::Underscore { span }
            | ExprNode::Dollar { span }
            | ExprNode::Variable { span, .. }
            | ExprNode::Unary { span, .. }
            | ExprNode::Incr { span, .. }
            | ExprNode::Binary { span, .. }
            | ExprNode::Logic { span, .. }
            | ExprNode::HasKey { span, .. }
            | ExprNode::IsType { span, .. }
            | ExprNode::Ternary { span, .. }
            | ExprNode::Member { span, .. }
            | ExprNode::Index { span, .. }
            | ExprNode::Slice { span, .. }
            | ExprNode::Assign { span, .. }
            | ExprNode::Interpolate { span, .. }
            | ExprNode::DoThen { span, .. }
            | ExprNode::Match { span, .. }
            | ExprNode::Call { span, .. }
            | ExprNode::Object { span, .. }
            | ExprNode::Array { span, .. }
            | ExprNode::Subtemplate { span, .. } => *span,
        }
    }
}

impl EntityNode {
    pub fn span(&self) -> Span {
        match self {
            EntityNode::Value { span, .. }
            | EntityNode::KeyValue { span, .. }
            | EntityNode::VoidLine { span, .. }
            | EntityNode::If { span, .. }
            | EntityNode::ForIn { span, .. }
            | EntityNode::ForInObj { span, .. }
            | EntityNode::ForFromTo { span, .. }
            | EntityNode::Switch { span, .. }
            | EntityNode::Break { span, .. }
            | EntityNode::Continue { span, .. }
            | EntityNode::Return { span }
            | EntityNode::DefExpr { span, .. }
            | EntityNode::DefSub { span, .. } => *span,
        }
    }
}

/// The value a grammar reduction produces; what kind depends on the
/// nonterminal being reduced.
#[derive(Debug)]
pub enum Ast {
    Token(Token),
    Expr(ExprNode),
    Entity(EntityNode),
    Entities(Vec<EntityNode>, Span),
    Exprs(Vec<ExprNode>, Span),
    IfTail(IfTailNode, Span),
    Cases(Vec<CaseNode>, Span),
    MatchCases(Vec<MatchCaseNode>, Span),
    Params(Vec<String>, bool, Span),
    Parts(Vec<StringPartNode>, Span),
}

impl Ast {
    pub fn span(&self) -> Span {
        match self {
            Ast::Token(t) => t.span,
            Ast::Expr(e) => e.span(),
            Ast::Entity(e) => e.span(),
            Ast::Entities(_, s)
            | Ast::Exprs(_, s)
            | Ast::IfTail(_, s)
            | Ast::Cases(_, s)
            | Ast::MatchCases(_, s)
            | Ast::Params(_, _, s)
            | Ast::Parts(_, s) => *s,
        }
    }

    pub(crate) fn into_token(self) -> Token {
        match self {
            Ast::Token(t) => t,
            other => unreachable!("expected token, got {:?}", other),
        }
    }

    pub(crate) fn into_expr(self) -> ExprNode {
        match self {
            Ast::Expr(e) => e,
            other => unreachable!("expected expression, got {:?}", other),
        }
    }

    pub(crate) fn into_entity(self) -> EntityNode {
        match self {
            Ast::Entity(e) => e,
            other => unreachable!("expected entity, got {:?}", other),
        }
    }

    pub(crate) fn into_entities(self) -> Vec<EntityNode> {
        match self {
            Ast::Entities(e, _) => e,
            other => unreachable!("expected entity list, got {:?}", other),
        }
    }

    pub(crate) fn into_exprs(self) -> Vec<ExprNode> {
        match self {
            Ast::Exprs(e, _) => e,
            other => unreachable!("expected expression list, got {:?}", other),
        }
    }

    pub(crate) fn into_if_tail(self) -> IfTailNode {
        match self {
            Ast::IfTail(t, _) => t,
            other => unreachable!("expected if tail, got {:?}", other),
        }
    }

    pub(crate) fn into_cases(self) -> Vec<CaseNode> {
        match self {
            Ast::Cases(c, _) => c,
            other => unreachable!("expected case list, got {:?}", other),
        }
    }

    pub(crate) fn into_match_cases(self) -> Vec<MatchCaseNode> {
        match self {
            Ast::MatchCases(c, _) => c,
            other => unreachable!("expected match arms, got {:?}", other),
        }
    }

    pub(crate) fn into_params(self) -> (Vec<String>, bool) {
        match self {
            Ast::Params(p, vararg, _) => (p, vararg),
            other => unreachable!("expected parameter list, got {:?}", other),
        }
    }

    pub(crate) fn into_parts(self) -> Vec<StringPartNode> {
        match self {
            Ast::Parts(p, _) => p,
            other => unreachable!("expected string parts, got {:?}", other),
        }
    }
}

// ---- static validation ----

/// Checks that every `break`/`continue` names no more loops than actually
/// enclose it. Constructions, subtemplates and function bodies reset the
/// loop nesting; if and switch blocks do not.
pub fn validate_loop_depth(entities: &[EntityNode]) -> Result<(), TemplateError> {
    validate_entities(entities, 0)
}

fn validate_entities(entities: &[EntityNode], depth: u32) -> Result<(), TemplateError> {
    for entity in entities {
        validate_entity(entity, depth)?;
    }
    Ok(())
}

fn validate_entity(entity: &EntityNode, depth: u32) -> Result<(), TemplateError> {
    match entity {
        EntityNode::Value { expr, .. } | EntityNode::VoidLine { expr, .. } => {
            validate_expr(expr)
        }
        EntityNode::KeyValue { key, value, .. } => {
            validate_expr(key)?;
            validate_expr(value)
        }
        EntityNode::If {
            condition,
            body,
            else_ifs,
            else_block,
            ..
        } => {
            validate_expr(condition)?;
            validate_entities(body, depth)?;
            for (cond, block) in else_ifs {
                validate_expr(cond)?;
                validate_entities(block, depth)?;
            }
            if let Some(block) = else_block {
                validate_entities(block, depth)?;
            }
            Ok(())
        }
        EntityNode::ForIn { iterate, body, .. } | EntityNode::ForInObj { iterate, body, .. } => {
            validate_expr(iterate)?;
            validate_entities(body, depth + 1)
        }
        EntityNode::ForFromTo { from, to, body, .. } => {
            validate_expr(from)?;
            validate_expr(to)?;
            validate_entities(body, depth + 1)
        }
        EntityNode::Switch { subject, cases, .. } => {
            if let Some(subject) = subject {
                validate_expr(subject)?;
            }
            for case in cases {
                if let Some(cond) = &case.condition {
                    validate_expr(cond)?;
                }
                validate_entities(&case.body, depth)?;
            }
            Ok(())
        }
        EntityNode::Break {
            depth: wanted,
            span,
        }
        | EntityNode::Continue {
            depth: wanted,
            span,
        } => {
            let what = if matches!(entity, EntityNode::Break { .. }) {
                "break"
            } else {
                "continue"
            };
            if depth == 0 {
                Err(TemplateError::semantic(
                    *span,
                    format!("'{}' outside of a loop", what),
                ))
            } else if *wanted > depth {
                Err(TemplateError::semantic(
                    *span,
                    format!(
                        "'{} {}' exceeds the loop nesting of {}",
                        what, wanted, depth
                    ),
                ))
            } else {
                Ok(())
            }
        }
        EntityNode::Return { .. } => Ok(()),
        EntityNode::DefExpr { expr, .. } => validate_expr(expr),
        EntityNode::DefSub { body, .. } => validate_entities(body, 0),
    }
}

fn validate_expr(expr: &ExprNode) -> Result<(), TemplateError> {
    match expr {
        ExprNode::Literal { .. }
        | ExprNode::Underscore { .. }
        | ExprNode::Dollar { .. }
        | ExprNode::Variable { .. } => Ok(()),
        ExprNode::Unary { operand, .. } | ExprNode::Incr { target: operand, .. } => {
            validate_expr(operand)
        }
        ExprNode::Binary { left, right, .. }
        | ExprNode::Logic { left, right, .. }
        | ExprNode::HasKey { left, right, .. } => {
            validate_expr(left)?;
            validate_expr(right)
        }
        ExprNode::IsType { operand, .. } => validate_expr(operand),
        ExprNode::Ternary {
            cond, then, other, ..
        } => {
            validate_expr(cond)?;
            validate_expr(then)?;
            validate_expr(other)
        }
        ExprNode::Member { parent, .. } => validate_expr(parent),
        ExprNode::Index { parent, index, .. } => {
            validate_expr(parent)?;
            validate_expr(index)
        }
        ExprNode::Slice {
            parent, from, to, ..
        } => {
            validate_expr(parent)?;
            if let Some(from) = from {
                validate_expr(from)?;
            }
            if let Some(to) = to {
                validate_expr(to)?;
            }
            Ok(())
        }
        ExprNode::Assign { target, value, .. } => {
            validate_expr(target)?;
            validate_expr(value)
        }
        ExprNode::Interpolate { parts, .. } => {
            for part in parts {
                if let StringPartNode::Interp { expr, .. } = part {
                    validate_expr(expr)?;
                }
            }
            Ok(())
        }
        ExprNode::DoThen {
            before,
            result,
            after,
            ..
        } => {
            for e in before.iter().chain(after.iter()) {
                validate_expr(e)?;
            }
            validate_expr(result)
        }
        ExprNode::Match { subject, cases, .. } => {
            if let Some(subject) = subject {
                validate_expr(subject)?;
            }
            for case in cases {
                if let Some(pattern) = &case.pattern {
                    validate_expr(pattern)?;
                }
                validate_expr(&case.result)?;
            }
            Ok(())
        }
        ExprNode::Call { args, .. } => {
            for arg in args {
                validate_expr(arg)?;
            }
            Ok(())
        }
        // Construction boundaries reset loop nesting.
        ExprNode::Object { entities, .. }
        | ExprNode::Array { entities, .. }
        | ExprNode::Subtemplate { entities, .. } => validate_entities(entities, 0),
    }
}

// ---- compilation ----

fn fold(expr: Expression) -> Expression {
    match expr.simplify_to_literal() {
        Some(value) => Expression::Literal(value),
        None => expr,
    }
}

impl ExprNode {
    /// Compiles the node to a runtime expression, folding constants.
    pub fn compile(&self) -> Result<Expression, TemplateError> {
        Ok(fold(self.build()?))
    }

    fn build(&self) -> Result<Expression, TemplateError> {
        match self {
            ExprNode::Literal { value, .. } => Ok(Expression::Literal(value.clone())),
            ExprNode::Underscore { .. } => Ok(Expression::Underscore),
            ExprNode::Dollar { .. } => Ok(Expression::Dollar),
            ExprNode::Variable { name, .. } => Ok(Expression::Variable(name.clone())),
            ExprNode::Unary { op, operand, .. } => Ok(Expression::Unary {
                op: *op,
                operand: Box::new(operand.compile()?),
            }),
            ExprNode::Incr {
                decrement,
                postfix,
                target,
                ..
            } => Ok(Expression::Increment {
                target: target.to_assignable()?,
                decrement: *decrement,
                postfix: *postfix,
            }),
            ExprNode::Binary {
                op, left, right, ..
            } => Ok(Expression::Binary {
                op: *op,
                left: Box::new(left.compile()?),
                right: Box::new(right.compile()?),
            }),
            ExprNode::Logic {
                conjunction,
                left,
                right,
                ..
            } => {
                let left = Box::new(left.compile()?);
                let right = Box::new(right.compile()?);
                Ok(if *conjunction {
                    Expression::Conjunction { left, right }
                } else {
                    Expression::Disjunction { left, right }
                })
            }
            ExprNode::HasKey {
                hasnt, left, right, ..
            } => Ok(Expression::HasKey {
                hasnt: *hasnt,
                left: Box::new(left.compile()?),
                right: Box::new(right.compile()?),
            }),
            ExprNode::IsType {
                isnt, operand, ty, ..
            } => Ok(Expression::IsType {
                isnt: *isnt,
                operand: Box::new(operand.compile()?),
                ty: *ty,
            }),
            ExprNode::Ternary {
                cond, then, other, ..
            } => Ok(Expression::Ternary {
                cond: Box::new(cond.compile()?),
                then: Box::new(then.compile()?),
                other: Box::new(other.compile()?),
            }),
            ExprNode::Member { parent, name, .. } => Ok(Expression::Member {
                parent: Box::new(parent.compile()?),
                name: name.clone(),
            }),
            ExprNode::Index { parent, index, .. } => Ok(Expression::Index {
                parent: Box::new(parent.compile()?),
                index: Box::new(index.compile()?),
            }),
            ExprNode::Slice {
                parent, from, to, ..
            } => Ok(Expression::Slice {
                parent: Box::new(parent.compile()?),
                from: from.as_ref().map(|e| e.compile().map(Box::new)).transpose()?,
                to: to.as_ref().map(|e| e.compile().map(Box::new)).transpose()?,
            }),
            ExprNode::Assign {
                op, target, value, ..
            } => {
                let assignable = target.to_assignable()?;
                let value_expr = match op {
                    // Compound assignment reads the target, applies the
                    // operator, and writes the result back.
                    Some(op) => Expression::Binary {
                        op: *op,
                        left: Box::new(target.compile()?),
                        right: Box::new(value.compile()?),
                    },
                    None => value.compile()?,
                };
                Ok(Expression::Assign {
                    target: assignable,
                    value: Box::new(value_expr),
                })
            }
            ExprNode::Interpolate { parts, .. } => compile_string_parts(parts),
            ExprNode::DoThen {
                before,
                result,
                after,
                ..
            } => {
                let mut before_exprs = compile_effects(before)?;
                let mut after_exprs = compile_effects(after)?;
                let mut result = result.as_ref();
                // Chained then-forms nest; flatten them into one node.
                while let ExprNode::DoThen {
                    before: b,
                    result: r,
                    after: a,
                    ..
                } = result
                {
                    before_exprs.extend(compile_effects(b)?);
                    let mut inner_after = compile_effects(a)?;
                    inner_after.extend(after_exprs);
                    after_exprs = inner_after;
                    result = r.as_ref();
                }
                let result = result.compile()?;
                if before_exprs.is_empty() && after_exprs.is_empty() {
                    Ok(result)
                } else {
                    Ok(Expression::BeforeAfter {
                        before: before_exprs,
                        result: Box::new(result),
                        after: after_exprs,
                    })
                }
            }
            ExprNode::Match {
                subject,
                cases,
                span,
            } => {
                let mut arms = Vec::new();
                let mut default: Option<Expression> = None;
                for case in cases {
                    match &case.pattern {
                        Some(pattern) => {
                            arms.push((pattern.compile()?, case.result.compile()?))
                        }
                        None => {
                            if default.is_some() {
                                return Err(TemplateError::semantic(
                                    *span,
                                    "match has more than one else arm",
                                ));
                            }
                            default = Some(case.result.compile()?);
                        }
                    }
                }
                let default = Box::new(default.unwrap_or(Expression::Literal(JsonValue::Null)));
                Ok(match subject {
                    Some(subject) => Expression::MatchValue {
                        subject: Box::new(subject.compile()?),
                        cases: arms,
                        default,
                    },
                    None => Expression::MatchCondition {
                        cases: arms,
                        default,
                    },
                })
            }
            ExprNode::Call {
                function, args, ..
            } => Ok(Expression::Call {
                function: function.clone(),
                args: args
                    .iter()
                    .map(ExprNode::compile)
                    .collect::<Result<_, _>>()?,
            }),
            ExprNode::Object { entities, .. } => {
                compile_execute(entities, crate::exec::ExecutionType::Object)
            }
            ExprNode::Array { entities, .. } => {
                compile_execute(entities, crate::exec::ExecutionType::Array)
            }
            ExprNode::Subtemplate { entities, .. } => {
                compile_execute(entities, crate::exec::ExecutionType::Root)
            }
        }
    }

    /// Converts the node into a write target. Only variables and
    /// member/index paths rooted in one are assignable.
    pub fn to_assignable(&self) -> Result<Assignable, TemplateError> {
        match self {
            ExprNode::Variable { name, .. } => Ok(Assignable::Variable(name.clone())),
            ExprNode::Member { parent, name, .. } => Ok(Assignable::Member {
                parent: Box::new(parent.to_assignable()?),
                name: name.clone(),
            }),
            ExprNode::Index { parent, index, .. } => Ok(Assignable::Index {
                parent: Box::new(parent.to_assignable()?),
                index: Box::new(index.compile()?),
            }),
            other => Err(TemplateError::semantic(
                other.span(),
                "expression cannot be assigned to",
            )),
        }
    }
}

/// Compiles a list of effect-only expressions, dropping the ones that fold
/// to constants since they cannot have effects.
fn compile_effects(nodes: &[ExprNode]) -> Result<Vec<Expression>, TemplateError> {
    let mut out = Vec::new();
    for node in nodes {
        let expr = node.compile()?;
        if !matches!(expr, Expression::Literal(_)) {
            out.push(expr);
        }
    }
    Ok(out)
}

fn compile_execute(
    entities: &[EntityNode],
    ty: crate::exec::ExecutionType,
) -> Result<Expression, TemplateError> {
    Ok(Expression::Execute {
        insns: Rc::new(compile_entities(entities)?),
        ty,
    })
}

/// Compiles an entity list into a sealed instruction program.
pub fn compile_entities(entities: &[EntityNode]) -> Result<Instructions, TemplateError> {
    let mut sink = InstructionSink::new();
    for entity in entities {
        entity.compile(&mut sink)?;
    }
    Ok(sink.seal())
}

/// Merges the lexed fragments of an interpolated string, folding constant
/// runs. A single remaining part is returned bare; adjacent constants are
/// merged into one literal.
fn compile_string_parts(parts: &[StringPartNode]) -> Result<Expression, TemplateError> {
    let last_significant = parts.iter().rposition(|p| {
        !matches!(
            p,
            StringPartNode::Whitespace { .. } | StringPartNode::Boundary { .. }
        )
    });
    let mut pieces: Vec<Expression> = Vec::new();
    let mut text = String::new();
    let mut suppress_break = false;
    for (i, part) in parts.iter().enumerate() {
        match part {
            StringPartNode::Content { text: t, .. } => text.push_str(t),
            StringPartNode::Whitespace { .. } | StringPartNode::Boundary { .. } => {}
            StringPartNode::NoLineBreak { .. } => {
                if text.ends_with('\n') {
                    text.pop();
                } else {
                    suppress_break = true;
                }
            }
            StringPartNode::LineBreak { .. } => {
                if suppress_break {
                    suppress_break = false;
                } else if Some(i) != last_significant {
                    // The line break right before the closing delimiter is
                    // not part of the string.
                    text.push('\n');
                }
            }
            StringPartNode::Interp { expr, .. } => {
                let compiled = expr.compile()?;
                if let Expression::Literal(value) = &compiled {
                    text.push_str(&crate::operators::stringify(value));
                } else {
                    if !text.is_empty() {
                        pieces.push(Expression::Literal(JsonValue::string(&text)));
                        text.clear();
                    }
                    pieces.push(compiled);
                }
            }
        }
    }
    if !text.is_empty() || pieces.is_empty() {
        pieces.push(Expression::Literal(JsonValue::string(&text)));
    }
    if pieces.len() == 1 {
        let mut pieces = pieces;
        Ok(pieces.remove(0))
    } else {
        Ok(Expression::Interpolate(pieces))
    }
}

impl EntityNode {
    /// Emits the entity's instructions into the sink.
    pub fn compile(&self, sink: &mut InstructionSink) -> Result<(), TemplateError> {
        match self {
            EntityNode::Value { expr, .. } => {
                sink.add(Instruction::Result(expr.compile()?));
                Ok(())
            }
            EntityNode::KeyValue { key, value, .. } => {
                sink.add(Instruction::ResultWithKey(key.compile()?, value.compile()?));
                Ok(())
            }
            EntityNode::VoidLine { expr, .. } => {
                let compiled = expr.compile()?;
                // A folded constant has no effects to evaluate.
                if !matches!(compiled, Expression::Literal(_)) {
                    sink.add(Instruction::VoidEval(compiled));
                }
                Ok(())
            }
            EntityNode::If {
                condition,
                body,
                else_ifs,
                else_block,
                ..
            } => {
                let end = sink.new_label();
                let mut blocks: Vec<(&ExprNode, &Vec<EntityNode>)> = vec![(condition, body)];
                for (cond, block) in else_ifs {
                    blocks.push((cond, block));
                }
                let count = blocks.len();
                for (i, (cond, block)) in blocks.into_iter().enumerate() {
                    let next = sink.new_label();
                    sink.add(Instruction::UnlessJump(cond.compile()?, next));
                    compile_framed_block(sink, "if", block)?;
                    if i + 1 < count || else_block.is_some() {
                        sink.add(Instruction::Jump(end));
                    }
                    sink.mark(next);
                }
                if let Some(block) = else_block {
                    compile_framed_block(sink, "else", block)?;
                }
                sink.mark(end);
                Ok(())
            }
            EntityNode::ForIn {
                var, iterate, body, ..
            } => {
                let init = Instruction::InitArrayItr(iterate.compile()?);
                compile_loop(sink, init, LoopBinding::Value(var.clone()), body)
            }
            EntityNode::ForInObj {
                key_var,
                value_var,
                iterate,
                body,
                ..
            } => {
                let init = Instruction::InitObjectItr(iterate.compile()?);
                compile_loop(
                    sink,
                    init,
                    LoopBinding::Pair(key_var.clone(), value_var.clone()),
                    body,
                )
            }
            EntityNode::ForFromTo {
                var,
                from,
                to,
                body,
                ..
            } => {
                let init = Instruction::InitRangeItr(from.compile()?, to.compile()?);
                compile_loop(sink, init, LoopBinding::Value(var.clone()), body)
            }
            EntityNode::Switch {
                subject,
                cases,
                span,
            } => compile_switch(sink, subject.as_ref(), cases, *span),
            EntityNode::Break { depth, .. } => {
                sink.add(Instruction::BreakFrame(*depth));
                Ok(())
            }
            EntityNode::Continue { depth, .. } => {
                sink.add(Instruction::ContinueFrame(*depth));
                Ok(())
            }
            EntityNode::Return { .. } => {
                sink.add(Instruction::Return);
                Ok(())
            }
            EntityNode::DefExpr {
                name,
                params,
                vararg,
                expr,
                ..
            } => {
                sink.add(Instruction::DefFn(Rc::new(FunctionDefinition {
                    name: name.clone(),
                    params: params.clone(),
                    vararg: *vararg,
                    body: FunctionBody::Expr(expr.compile()?),
                })));
                Ok(())
            }
            EntityNode::DefSub {
                name,
                params,
                vararg,
                body,
                ..
            } => {
                sink.add(Instruction::DefFn(Rc::new(FunctionDefinition {
                    name: name.clone(),
                    params: params.clone(),
                    vararg: *vararg,
                    body: FunctionBody::Subtemplate(Rc::new(compile_entities(body)?)),
                })));
                Ok(())
            }
        }
    }
}

/// Wraps a block in a frame so its bindings are scoped to it. Plain block
/// frames are not break targets; loops push their own frames.
fn compile_framed_block(
    sink: &mut InstructionSink,
    name: &'static str,
    entities: &[EntityNode],
) -> Result<(), TemplateError> {
    let from = sink.new_label();
    let to = sink.new_label();
    sink.add(Instruction::PushFrame(FrameSpec {
        name,
        from,
        to,
        break_to: None,
        continue_to: None,
    }));
    sink.mark(from);
    for entity in entities {
        entity.compile(sink)?;
    }
    sink.mark(to);
    Ok(())
}

enum LoopBinding {
    Value(String),
    Pair(String, String),
}

/// Loop shape: init the iterator, jump to the exhaustion check, then on each
/// round push a fresh frame, bind, run the body, check, and jump back.
fn compile_loop(
    sink: &mut InstructionSink,
    init: Instruction,
    binding: LoopBinding,
    body: &[EntityNode],
) -> Result<(), TemplateError> {
    let start = sink.new_label();
    let from = sink.new_label();
    let to = sink.new_label();
    let end = sink.new_label();
    sink.add(init);
    sink.add(Instruction::Jump(to));
    sink.mark(start);
    sink.add(Instruction::PushFrame(FrameSpec {
        name: "for",
        from,
        to,
        break_to: Some(end),
        continue_to: Some(to),
    }));
    sink.mark(from);
    match binding {
        LoopBinding::Value(var) => sink.add(Instruction::ItrGet(var)),
        LoopBinding::Pair(key, value) => sink.add(Instruction::ItrGetKV(key, value)),
    }
    for entity in body {
        entity.compile(sink)?;
    }
    sink.mark(to);
    sink.add(Instruction::ItrJump(end));
    sink.add(Instruction::Jump(start));
    sink.mark(end);
    Ok(())
}

/// Switch shape: optional switch value, then the case dispatch jumps, then
/// the case blocks. There is no fallthrough; each block jumps to the end.
fn compile_switch(
    sink: &mut InstructionSink,
    subject: Option<&ExprNode>,
    cases: &[CaseNode],
    span: Span,
) -> Result<(), TemplateError> {
    let end = sink.new_label();
    let has_subject = subject.is_some();
    if let Some(subject) = subject {
        sink.add(Instruction::InitSwitch(subject.compile()?));
    }
    let mut labeled: Vec<(LabelId, &CaseNode)> = Vec::new();
    let mut else_case: Option<(LabelId, &CaseNode)> = None;
    for case in cases {
        let label = sink.new_label();
        match &case.condition {
            Some(cond) => {
                let cond = cond.compile()?;
                if has_subject {
                    sink.add(Instruction::SwitchJump(cond, label));
                } else {
                    sink.add(Instruction::IfJump(cond, label));
                }
                labeled.push((label, case));
            }
            None => {
                if else_case.is_some() {
                    return Err(TemplateError::semantic(
                        span,
                        "switch has more than one else block",
                    ));
                }
                else_case = Some((label, case));
            }
        }
    }
    match &else_case {
        Some((label, _)) => sink.add(Instruction::Jump(*label)),
        None => sink.add(Instruction::Jump(end)),
    }
    for (label, case) in labeled {
        sink.mark(label);
        compile_framed_block(sink, "case", &case.body)?;
        sink.add(Instruction::Jump(end));
    }
    if let Some((label, case)) = else_case {
        sink.mark(label);
        compile_framed_block(sink, "else", &case.body)?;
    }
    sink.mark(end);
    Ok(())
}

// ---- source rendering ----

fn write_entities(entities: &[EntityNode], out: &mut String) {
    for (i, entity) in entities.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        entity.write_source(out);
    }
}

fn write_block(entities: &[EntityNode], out: &mut String) {
    out.push_str("{ ");
    write_entities(entities, out);
    out.push_str(" }");
}

impl EntityNode {
    /// Renders the entity back to source-like text.
    pub fn write_source(&self, out: &mut String) {
        match self {
            EntityNode::Value { expr, .. } => expr.write_source(out),
            EntityNode::KeyValue { key, value, .. } => {
                key.write_source(out);
                out.push_str(": ");
                value.write_source(out);
            }
            EntityNode::VoidLine { expr, .. } => {
                out.push_str("@ ");
                expr.write_source(out);
            }
            EntityNode::If {
                condition,
                body,
                else_ifs,
                else_block,
                ..
            } => {
                out.push_str("if ");
                condition.write_source(out);
                out.push(' ');
                write_block(body, out);
                for (cond, block) in else_ifs {
                    out.push_str(" else if ");
                    cond.write_source(out);
                    out.push(' ');
                    write_block(block, out);
                }
                if let Some(block) = else_block {
                    out.push_str(" else ");
                    write_block(block, out);
                }
            }
            EntityNode::ForIn {
                var, iterate, body, ..
            } => {
                out.push_str("for ");
                out.push_str(var);
                out.push_str(" in ");
                iterate.write_source(out);
                out.push(' ');
                write_block(body, out);
            }
            EntityNode::ForInObj {
                key_var,
                value_var,
                iterate,
                body,
                ..
            } => {
                out.push_str("for ");
                out.push_str(key_var);
                out.push(':');
                out.push_str(value_var);
                out.push_str(" in ");
                iterate.write_source(out);
                out.push(' ');
                write_block(body, out);
            }
            EntityNode::ForFromTo {
                var,
                from,
                to,
                body,
                ..
            } => {
                out.push_str("for ");
                out.push_str(var);
                out.push_str(" from ");
                from.write_source(out);
                out.push_str(" to ");
                to.write_source(out);
                out.push(' ');
                write_block(body, out);
            }
            EntityNode::Switch { subject, cases, .. } => {
                out.push_str("switch ");
                if let Some(subject) = subject {
                    subject.write_source(out);
                    out.push(' ');
                }
                out.push_str("{ ");
                for (i, case) in cases.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match &case.condition {
                        Some(cond) => {
                            out.push_str("case ");
                            cond.write_source(out);
                            out.push(' ');
                        }
                        None => out.push_str("else "),
                    }
                    write_block(&case.body, out);
                }
                out.push_str(" }");
            }
            EntityNode::Break { depth, .. } => {
                out.push_str("break");
                if *depth > 1 {
                    out.push(' ');
                    out.push_str(&depth.to_string());
                }
            }
            EntityNode::Continue { depth, .. } => {
                out.push_str("continue");
                if *depth > 1 {
                    out.push(' ');
                    out.push_str(&depth.to_string());
                }
            }
            EntityNode::Return { .. } => out.push_str("return"),
            EntityNode::DefExpr {
                name,
                params,
                vararg,
                expr,
                ..
            } => {
                write_def_head(name, params, *vararg, out);
                out.push_str(" -> ");
                expr.write_source(out);
            }
            EntityNode::DefSub {
                name,
                params,
                vararg,
                body,
                ..
            } => {
                write_def_head(name, params, *vararg, out);
                out.push(' ');
                write_block(body, out);
            }
        }
    }
}

fn write_def_head(name: &str, params: &[String], vararg: bool, out: &mut String) {
    out.push_str("def ");
    out.push_str(name);
    out.push('(');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(param);
    }
    if vararg {
        out.push_str("...");
    }
    out.push(')');
}

fn binary_op_text(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Lsh => "<<",
        BinaryOp::Rsh => ">>",
        BinaryOp::Rrsh => ">>>",
        BinaryOp::Lt => "<",
        BinaryOp::Gt => ">",
        BinaryOp::Le => "<=",
        BinaryOp::Ge => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::Neq => "!=",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
    }
}

impl ExprNode {
    /// Renders the expression back to source-like text. Composite operands
    /// are parenthesized rather than reconstructing precedence.
    pub fn write_source(&self, out: &mut String) {
        match self {
            ExprNode::Literal { value, .. } => match value {
                JsonValue::Str(s) => {
                    out.push('\'');
                    out.push_str(s);
                    out.push('\'');
                }
                other => out.push_str(&other.display_string()),
            },
            ExprNode::Underscore { .. } => out.push('_'),
            ExprNode::Dollar { .. } => out.push('$'),
            ExprNode::Variable { name, .. } => out.push_str(name),
            ExprNode::Unary { op, operand, .. } => {
                out.push_str(match op {
                    UnaryOp::Plus => "+",
                    UnaryOp::Negate => "-",
                    UnaryOp::Not => "!",
                    UnaryOp::Size => "#",
                    UnaryOp::BitNot => "~",
                    UnaryOp::Copy => "copy ",
                });
                operand.write_source(out);
            }
            ExprNode::Incr {
                decrement,
                postfix,
                target,
                ..
            } => {
                let op = if *decrement { "--" } else { "++" };
                if *postfix {
                    target.write_source(out);
                    out.push_str(op);
                } else {
                    out.push_str(op);
                    target.write_source(out);
                }
            }
            ExprNode::Binary {
                op, left, right, ..
            } => {
                out.push('(');
                left.write_source(out);
                out.push(' ');
                out.push_str(binary_op_text(*op));
                out.push(' ');
                right.write_source(out);
                out.push(')');
            }
            ExprNode::Logic {
                conjunction,
                left,
                right,
                ..
            } => {
                out.push('(');
                left.write_source(out);
                out.push_str(if *conjunction { " && " } else { " || " });
                right.write_source(out);
                out.push(')');
            }
            ExprNode::HasKey {
                hasnt, left, right, ..
            } => {
                out.push('(');
                left.write_source(out);
                out.push_str(if *hasnt { " hasnt " } else { " has " });
                right.write_source(out);
                out.push(')');
            }
            ExprNode::IsType {
                isnt, operand, ty, ..
            } => {
                out.push('(');
                operand.write_source(out);
                out.push_str(if *isnt { " isnt " } else { " is " });
                out.push_str(ty.name());
                out.push(')');
            }
            ExprNode::Ternary {
                cond, then, other, ..
            } => {
                out.push('(');
                cond.write_source(out);
                out.push_str(" ? ");
                then.write_source(out);
                out.push_str(" : ");
                other.write_source(out);
                out.push(')');
            }
            ExprNode::Member { parent, name, .. } => {
                parent.write_source(out);
                out.push('.');
                out.push_str(name);
            }
            ExprNode::Index { parent, index, .. } => {
                parent.write_source(out);
                out.push('[');
                index.write_source(out);
                out.push(']');
            }
            ExprNode::Slice {
                parent, from, to, ..
            } => {
                parent.write_source(out);
                out.push('[');
                if let Some(from) = from {
                    from.write_source(out);
                }
                out.push_str("..");
                if let Some(to) = to {
                    to.write_source(out);
                }
                out.push(']');
            }
            ExprNode::Assign {
                op, target, value, ..
            } => {
                target.write_source(out);
                out.push(' ');
                if let Some(op) = op {
                    out.push_str(binary_op_text(*op));
                }
                out.push_str("= ");
                value.write_source(out);
            }
            ExprNode::Interpolate { parts, .. } => {
                out.push('"');
                for part in parts {
                    match part {
                        StringPartNode::Content { text, .. } => out.push_str(text),
                        StringPartNode::Interp { expr, .. } => {
                            out.push_str("#[");
                            expr.write_source(out);
                            out.push(']');
                        }
                        StringPartNode::LineBreak { .. } => out.push('\n'),
                        _ => {}
                    }
                }
                out.push('"');
            }
            ExprNode::DoThen {
                before,
                result,
                after,
                ..
            } => {
                if !before.is_empty() {
                    write_do_block(before, out);
                    out.push_str(" then ");
                }
                result.write_source(out);
                if !after.is_empty() {
                    out.push_str(" then ");
                    write_do_block(after, out);
                }
            }
            ExprNode::Match { subject, cases, .. } => {
                out.push_str("match ");
                if let Some(subject) = subject {
                    subject.write_source(out);
                    out.push(' ');
                }
                out.push_str("{ ");
                for (i, case) in cases.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match &case.pattern {
                        Some(pattern) => {
                            out.push_str("case ");
                            pattern.write_source(out);
                        }
                        None => out.push_str("else"),
                    }
                    out.push_str(" -> ");
                    case.result.write_source(out);
                }
                out.push_str(" }");
            }
            ExprNode::Call {
                function, args, ..
            } => {
                out.push_str(function);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.write_source(out);
                }
                out.push(')');
            }
            ExprNode::Object { entities, .. } => {
                out.push_str("{ ");
                write_entities(entities, out);
                out.push_str(" }");
            }
            ExprNode::Array { entities, .. } => {
                out.push('[');
                write_entities(entities, out);
                out.push(']');
            }
            ExprNode::Subtemplate { entities, .. } => {
                out.push_str("gen ");
                write_block(entities, out);
            }
        }
    }
}

fn write_do_block(exprs: &[ExprNode], out: &mut String) {
    out.push_str("do { ");
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        expr.write_source(out);
    }
    out.push_str(" }");
}
