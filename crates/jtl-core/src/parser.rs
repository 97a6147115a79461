//! The document grammar and the parser driver. The grammar is declared as
//! data; the shift/reduce table is generated from it once, on first use, and
//! shared for the process lifetime. Reductions build AST nodes directly.

use crate::ast::{
    Ast, CaseNode, EntityNode, ExprNode, IfTailNode, MatchCaseNode, StringPartNode,
};
use crate::error::TemplateError;
use crate::expr::{BinaryOp, UnaryOp};
use crate::grammar::{Grammar, Nonterminal, Rule, Symbol};
use crate::json::{JsonType, JsonValue};
use crate::table::{Action, ParserTable};
use crate::token::{Span, Token, TokenType};
use std::sync::OnceLock;

use Nonterminal as N;
use TokenType as T;

fn nt(n: Nonterminal) -> Symbol {
    Symbol::Nonterminal(n)
}

fn t(t: TokenType) -> Symbol {
    Symbol::Terminal(t)
}

fn pop(c: &mut Vec<Ast>) -> Ast {
    match c.pop() {
        Some(a) => a,
        None => unreachable!("reduction arity mismatch"),
    }
}

fn pop_expr(c: &mut Vec<Ast>) -> ExprNode {
    pop(c).into_expr()
}

fn pop_token(c: &mut Vec<Ast>) -> Token {
    pop(c).into_token()
}

fn pop_entities(c: &mut Vec<Ast>) -> Vec<EntityNode> {
    pop(c).into_entities()
}

fn ident(token: &Token) -> String {
    token.text().to_string()
}

struct Rules {
    rules: Vec<Rule>,
}

impl Rules {
    fn new() -> Rules {
        Rules { rules: Vec::new() }
    }

    fn add(
        &mut self,
        nonterminal: Nonterminal,
        symbols: Vec<Symbol>,
        reduce: impl Fn(Vec<Ast>, Span) -> Result<Ast, TemplateError> + Send + Sync + 'static,
    ) {
        self.rules.push(Rule {
            nonterminal,
            symbols,
            reduce: Box::new(reduce),
        });
    }

    /// `nt := sub`, passing the child's value through.
    fn pass(&mut self, nonterminal: Nonterminal, sub: Nonterminal) {
        self.add(nonterminal, vec![nt(sub)], |mut c, _| Ok(pop(&mut c)));
    }

    /// `nt := nt token sub`, a left-associative binary operator.
    fn binary(&mut self, nonterminal: Nonterminal, sub: Nonterminal, token: TokenType, op: BinaryOp) {
        self.add(
            nonterminal,
            vec![nt(nonterminal), t(token), nt(sub)],
            move |mut c, span| {
                let right = pop_expr(&mut c);
                pop(&mut c);
                let left = pop_expr(&mut c);
                Ok(Ast::Expr(ExprNode::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                }))
            },
        );
    }

    /// `Unary := token Unary`, a prefix operator.
    fn prefix(&mut self, token: TokenType, op: UnaryOp) {
        self.add(N::Unary, vec![t(token), nt(N::Unary)], move |mut c, span| {
            let operand = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Unary {
                op,
                operand: Box::new(operand),
                span,
            }))
        });
    }

    /// `Assign := Unary token Assign`, right-associative assignment.
    fn assign(&mut self, token: TokenType, op: Option<BinaryOp>) {
        self.add(
            N::Assign,
            vec![nt(N::Unary), t(token), nt(N::Assign)],
            move |mut c, span| {
                let value = pop_expr(&mut c);
                pop(&mut c);
                let target = pop_expr(&mut c);
                Ok(Ast::Expr(ExprNode::Assign {
                    op,
                    target: Box::new(target),
                    value: Box::new(value),
                    span,
                }))
            },
        );
    }
}

fn literal_value(token: &Token) -> JsonValue {
    token.value.clone().unwrap_or(JsonValue::Null)
}

fn loop_depth(token: &Token) -> Result<u32, TemplateError> {
    match &token.value {
        Some(JsonValue::Int(n)) if *n >= 1 && *n <= u32::MAX as i64 => Ok(*n as u32),
        _ => Err(TemplateError::semantic(
            token.span,
            "loop depth must be a positive integer",
        )),
    }
}

fn type_name(token: &Token) -> Result<JsonType, TemplateError> {
    let name = if token.ty == T::Null {
        "null"
    } else {
        token.text()
    };
    JsonType::by_name(name).ok_or_else(|| {
        TemplateError::semantic(token.span, format!("unknown type name '{}'", name))
    })
}

fn is_type_rule(r: &mut Rules, token: TokenType, name_token: TokenType, isnt: bool) {
    r.add(
        N::Relational,
        vec![nt(N::Relational), t(token), t(name_token)],
        move |mut c, span| {
            let name = pop_token(&mut c);
            pop(&mut c);
            let operand = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::IsType {
                isnt,
                operand: Box::new(operand),
                ty: type_name(&name)?,
                span,
            }))
        },
    );
}

fn interpolated_string_rule(r: &mut Rules, delimiter: TokenType) {
    r.add(
        N::Primary,
        vec![t(delimiter), nt(N::StringParts), t(delimiter)],
        |mut c, span| {
            pop(&mut c);
            let parts = pop(&mut c).into_parts();
            pop(&mut c);
            Ok(Ast::Expr(ExprNode::Interpolate { parts, span }))
        },
    );
}

/// The full document grammar.
pub fn build_grammar() -> Grammar {
    let mut r = Rules::new();

    r.pass(N::Document, N::EntityList);

    // Entity lists are comma-permissive: separators are optional and
    // trailing or repeated commas are ignored.
    r.add(N::EntityList, vec![], |_, span| {
        Ok(Ast::Entities(Vec::new(), span))
    });
    r.add(
        N::EntityList,
        vec![nt(N::EntityList), nt(N::Entity)],
        |mut c, span| {
            let entity = pop(&mut c).into_entity();
            let mut entities = pop_entities(&mut c);
            entities.push(entity);
            Ok(Ast::Entities(entities, span))
        },
    );
    r.add(
        N::EntityList,
        vec![nt(N::EntityList), t(T::Comma)],
        |mut c, span| {
            pop(&mut c);
            Ok(Ast::Entities(pop_entities(&mut c), span))
        },
    );

    // ---- entities ----

    r.add(N::Entity, vec![nt(N::Expression)], |mut c, span| {
        let expr = pop_expr(&mut c);
        Ok(Ast::Entity(EntityNode::Value { expr, span }))
    });
    r.add(
        N::Entity,
        vec![nt(N::Expression), t(T::Colon), nt(N::Expression)],
        |mut c, span| {
            let value = pop_expr(&mut c);
            pop(&mut c);
            let key = pop_expr(&mut c);
            Ok(Ast::Entity(EntityNode::KeyValue { key, value, span }))
        },
    );
    r.add(N::Entity, vec![t(T::At), nt(N::Expression)], |mut c, span| {
        let expr = pop_expr(&mut c);
        Ok(Ast::Entity(EntityNode::VoidLine { expr, span }))
    });

    r.add(
        N::Entity,
        vec![
            t(T::If),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
            nt(N::IfTail),
        ],
        |mut c, span| {
            let tail = pop(&mut c).into_if_tail();
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            let condition = pop_expr(&mut c);
            Ok(Ast::Entity(EntityNode::If {
                condition,
                body,
                else_ifs: tail.else_ifs,
                else_block: tail.else_block,
                span,
            }))
        },
    );
    r.add(N::IfTail, vec![], |_, span| {
        Ok(Ast::IfTail(IfTailNode::default(), span))
    });
    r.add(
        N::IfTail,
        vec![
            t(T::Else),
            t(T::If),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
            nt(N::IfTail),
        ],
        |mut c, span| {
            let mut tail = pop(&mut c).into_if_tail();
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            let condition = pop_expr(&mut c);
            tail.else_ifs.insert(0, (condition, body));
            Ok(Ast::IfTail(tail, span))
        },
    );
    r.add(
        N::IfTail,
        vec![
            t(T::Else),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            Ok(Ast::IfTail(
                IfTailNode {
                    else_ifs: Vec::new(),
                    else_block: Some(body),
                },
                span,
            ))
        },
    );

    r.add(
        N::Entity,
        vec![
            t(T::For),
            t(T::Identifier),
            t(T::In),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            let iterate = pop_expr(&mut c);
            pop(&mut c);
            let var = ident(&pop_token(&mut c));
            Ok(Ast::Entity(EntityNode::ForIn {
                var,
                iterate,
                body,
                span,
            }))
        },
    );
    r.add(
        N::Entity,
        vec![
            t(T::For),
            t(T::Identifier),
            t(T::Colon),
            t(T::Identifier),
            t(T::In),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            let iterate = pop_expr(&mut c);
            pop(&mut c);
            let value_var = ident(&pop_token(&mut c));
            pop(&mut c);
            let key_var = ident(&pop_token(&mut c));
            Ok(Ast::Entity(EntityNode::ForInObj {
                key_var,
                value_var,
                iterate,
                body,
                span,
            }))
        },
    );
    r.add(
        N::Entity,
        vec![
            t(T::For),
            t(T::Identifier),
            t(T::From),
            nt(N::Expression),
            t(T::To),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            let to = pop_expr(&mut c);
            pop(&mut c);
            let from = pop_expr(&mut c);
            pop(&mut c);
            let var = ident(&pop_token(&mut c));
            Ok(Ast::Entity(EntityNode::ForFromTo {
                var,
                from,
                to,
                body,
                span,
            }))
        },
    );

    r.add(
        N::Entity,
        vec![
            t(T::Switch),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::SwitchBody),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let cases = pop(&mut c).into_cases();
            pop(&mut c);
            let subject = pop_expr(&mut c);
            Ok(Ast::Entity(EntityNode::Switch {
                subject: Some(subject),
                cases,
                span,
            }))
        },
    );
    r.add(
        N::Entity,
        vec![
            t(T::Switch),
            t(T::BraceOpen),
            nt(N::SwitchBody),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let cases = pop(&mut c).into_cases();
            Ok(Ast::Entity(EntityNode::Switch {
                subject: None,
                cases,
                span,
            }))
        },
    );
    r.add(N::SwitchBody, vec![nt(N::SwitchCase)], |mut c, span| {
        let case = match pop(&mut c) {
            Ast::Cases(mut cases, _) => cases.remove(0),
            other => unreachable!("expected case, got {:?}", other),
        };
        Ok(Ast::Cases(vec![case], span))
    });
    r.add(
        N::SwitchBody,
        vec![nt(N::SwitchBody), nt(N::SwitchCase)],
        |mut c, span| {
            let case = match pop(&mut c) {
                Ast::Cases(mut cases, _) => cases.remove(0),
                other => unreachable!("expected case, got {:?}", other),
            };
            let mut cases = pop(&mut c).into_cases();
            cases.push(case);
            Ok(Ast::Cases(cases, span))
        },
    );
    r.add(
        N::SwitchBody,
        vec![nt(N::SwitchBody), t(T::Comma)],
        |mut c, span| {
            pop(&mut c);
            Ok(Ast::Cases(pop(&mut c).into_cases(), span))
        },
    );
    r.add(
        N::SwitchCase,
        vec![
            t(T::Case),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            let condition = pop_expr(&mut c);
            Ok(Ast::Cases(
                vec![CaseNode {
                    condition: Some(condition),
                    body,
                    span,
                }],
                span,
            ))
        },
    );
    r.add(
        N::SwitchCase,
        vec![
            t(T::Else),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            Ok(Ast::Cases(
                vec![CaseNode {
                    condition: None,
                    body,
                    span,
                }],
                span,
            ))
        },
    );

    r.add(N::Entity, vec![t(T::Break)], |_, span| {
        Ok(Ast::Entity(EntityNode::Break { depth: 1, span }))
    });
    r.add(N::Entity, vec![t(T::Break), t(T::Number)], |mut c, span| {
        let depth = loop_depth(&pop_token(&mut c))?;
        Ok(Ast::Entity(EntityNode::Break { depth, span }))
    });
    r.add(N::Entity, vec![t(T::Continue)], |_, span| {
        Ok(Ast::Entity(EntityNode::Continue { depth: 1, span }))
    });
    r.add(
        N::Entity,
        vec![t(T::Continue), t(T::Number)],
        |mut c, span| {
            let depth = loop_depth(&pop_token(&mut c))?;
            Ok(Ast::Entity(EntityNode::Continue { depth, span }))
        },
    );
    r.add(N::Entity, vec![t(T::Return)], |_, span| {
        Ok(Ast::Entity(EntityNode::Return { span }))
    });

    r.add(
        N::Entity,
        vec![
            t(T::Def),
            t(T::Identifier),
            t(T::ParenOpen),
            nt(N::ParamsOpt),
            t(T::ParenClose),
            t(T::Arrow),
            nt(N::Expression),
        ],
        |mut c, span| {
            let expr = pop_expr(&mut c);
            pop(&mut c);
            pop(&mut c);
            let (params, vararg) = pop(&mut c).into_params();
            pop(&mut c);
            let name = ident(&pop_token(&mut c));
            Ok(Ast::Entity(EntityNode::DefExpr {
                name,
                params,
                vararg,
                expr,
                span,
            }))
        },
    );
    r.add(
        N::Entity,
        vec![
            t(T::Def),
            t(T::Identifier),
            t(T::ParenOpen),
            nt(N::ParamsOpt),
            t(T::ParenClose),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let body = pop_entities(&mut c);
            pop(&mut c);
            pop(&mut c);
            let (params, vararg) = pop(&mut c).into_params();
            pop(&mut c);
            let name = ident(&pop_token(&mut c));
            Ok(Ast::Entity(EntityNode::DefSub {
                name,
                params,
                vararg,
                body,
                span,
            }))
        },
    );

    r.add(N::ParamsOpt, vec![], |_, span| {
        Ok(Ast::Params(Vec::new(), false, span))
    });
    r.add(N::ParamsOpt, vec![nt(N::Params)], |mut c, _| Ok(pop(&mut c)));
    r.add(
        N::ParamsOpt,
        vec![nt(N::Params), t(T::TriplePeriod)],
        |mut c, span| {
            pop(&mut c);
            let (params, _) = pop(&mut c).into_params();
            Ok(Ast::Params(params, true, span))
        },
    );
    r.add(N::Params, vec![t(T::Identifier)], |mut c, span| {
        let name = ident(&pop_token(&mut c));
        Ok(Ast::Params(vec![name], false, span))
    });
    r.add(
        N::Params,
        vec![nt(N::Params), t(T::Comma), t(T::Identifier)],
        |mut c, span| {
            let name = ident(&pop_token(&mut c));
            pop(&mut c);
            let (mut params, _) = pop(&mut c).into_params();
            params.push(name);
            Ok(Ast::Params(params, false, span))
        },
    );

    // ---- expressions ----

    r.pass(N::Expression, N::Assign);
    r.add(
        N::Expression,
        vec![nt(N::Assign), t(T::Then), nt(N::DoBlock)],
        |mut c, span| {
            let after = pop(&mut c).into_exprs();
            pop(&mut c);
            let result = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::DoThen {
                before: Vec::new(),
                result: Box::new(result),
                after,
                span,
            }))
        },
    );
    r.add(
        N::Expression,
        vec![nt(N::DoBlock), t(T::Then), nt(N::Expression)],
        |mut c, span| {
            let result = pop_expr(&mut c);
            pop(&mut c);
            let before = pop(&mut c).into_exprs();
            Ok(Ast::Expr(ExprNode::DoThen {
                before,
                result: Box::new(result),
                after: Vec::new(),
                span,
            }))
        },
    );
    r.add(
        N::DoBlock,
        vec![
            t(T::Do),
            t(T::BraceOpen),
            nt(N::ExprList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let exprs = pop(&mut c).into_exprs();
            Ok(Ast::Exprs(exprs, span))
        },
    );
    r.add(
        N::DoBlock,
        vec![t(T::Do), t(T::BraceOpen), t(T::BraceClose)],
        |_, span| Ok(Ast::Exprs(Vec::new(), span)),
    );
    r.add(N::ExprList, vec![nt(N::Expression)], |mut c, span| {
        Ok(Ast::Exprs(vec![pop_expr(&mut c)], span))
    });
    r.add(
        N::ExprList,
        vec![nt(N::ExprList), t(T::Comma), nt(N::Expression)],
        |mut c, span| {
            let expr = pop_expr(&mut c);
            pop(&mut c);
            let mut exprs = pop(&mut c).into_exprs();
            exprs.push(expr);
            Ok(Ast::Exprs(exprs, span))
        },
    );
    r.add(
        N::ExprList,
        vec![nt(N::ExprList), t(T::Comma)],
        |mut c, span| {
            pop(&mut c);
            Ok(Ast::Exprs(pop(&mut c).into_exprs(), span))
        },
    );

    r.pass(N::Assign, N::Ternary);
    r.assign(T::Assign, None);
    r.assign(T::PlusIs, Some(BinaryOp::Add));
    r.assign(T::MinusIs, Some(BinaryOp::Sub));
    r.assign(T::StarIs, Some(BinaryOp::Mul));
    r.assign(T::SlashIs, Some(BinaryOp::Div));
    r.assign(T::PercentIs, Some(BinaryOp::Mod));
    r.assign(T::LshIs, Some(BinaryOp::Lsh));
    r.assign(T::RshIs, Some(BinaryOp::Rsh));
    r.assign(T::RrshIs, Some(BinaryOp::Rrsh));
    r.assign(T::AndIs, Some(BinaryOp::BitAnd));
    r.assign(T::OrIs, Some(BinaryOp::BitOr));
    r.assign(T::XorIs, Some(BinaryOp::BitXor));

    r.pass(N::Ternary, N::OrExpr);
    r.add(
        N::Ternary,
        vec![
            nt(N::OrExpr),
            t(T::Question),
            nt(N::Expression),
            t(T::Colon),
            nt(N::Ternary),
        ],
        |mut c, span| {
            let other = pop_expr(&mut c);
            pop(&mut c);
            let then = pop_expr(&mut c);
            pop(&mut c);
            let cond = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                other: Box::new(other),
                span,
            }))
        },
    );

    r.pass(N::OrExpr, N::AndExpr);
    r.add(
        N::OrExpr,
        vec![nt(N::OrExpr), t(T::Or2), nt(N::AndExpr)],
        |mut c, span| {
            let right = pop_expr(&mut c);
            pop(&mut c);
            let left = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Logic {
                conjunction: false,
                left: Box::new(left),
                right: Box::new(right),
                span,
            }))
        },
    );
    r.pass(N::AndExpr, N::BitOr);
    r.add(
        N::AndExpr,
        vec![nt(N::AndExpr), t(T::And2), nt(N::BitOr)],
        |mut c, span| {
            let right = pop_expr(&mut c);
            pop(&mut c);
            let left = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Logic {
                conjunction: true,
                left: Box::new(left),
                right: Box::new(right),
                span,
            }))
        },
    );

    r.pass(N::BitOr, N::BitXor);
    r.binary(N::BitOr, N::BitXor, T::Or, BinaryOp::BitOr);
    r.pass(N::BitXor, N::BitAnd);
    r.binary(N::BitXor, N::BitAnd, T::Xor, BinaryOp::BitXor);
    r.pass(N::BitAnd, N::Equality);
    r.binary(N::BitAnd, N::Equality, T::And, BinaryOp::BitAnd);

    r.pass(N::Equality, N::Relational);
    r.binary(N::Equality, N::Relational, T::Equal, BinaryOp::Eq);
    r.binary(N::Equality, N::Relational, T::Inequal, BinaryOp::Neq);

    r.pass(N::Relational, N::ShiftExpr);
    r.binary(N::Relational, N::ShiftExpr, T::LessThan, BinaryOp::Lt);
    r.binary(N::Relational, N::ShiftExpr, T::GreaterThan, BinaryOp::Gt);
    r.binary(N::Relational, N::ShiftExpr, T::LessEqual, BinaryOp::Le);
    r.binary(N::Relational, N::ShiftExpr, T::GreaterEqual, BinaryOp::Ge);
    is_type_rule(&mut r, T::Is, T::Identifier, false);
    is_type_rule(&mut r, T::Is, T::Null, false);
    is_type_rule(&mut r, T::Isnt, T::Identifier, true);
    is_type_rule(&mut r, T::Isnt, T::Null, true);
    for (token, hasnt) in [(T::Has, false), (T::Hasnt, true)] {
        r.add(
            N::Relational,
            vec![nt(N::Relational), t(token), nt(N::ShiftExpr)],
            move |mut c, span| {
                let right = pop_expr(&mut c);
                pop(&mut c);
                let left = pop_expr(&mut c);
                Ok(Ast::Expr(ExprNode::HasKey {
                    hasnt,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                }))
            },
        );
    }

    r.pass(N::ShiftExpr, N::Additive);
    r.binary(N::ShiftExpr, N::Additive, T::Lsh, BinaryOp::Lsh);
    r.binary(N::ShiftExpr, N::Additive, T::Rsh, BinaryOp::Rsh);
    r.binary(N::ShiftExpr, N::Additive, T::Rrsh, BinaryOp::Rrsh);

    r.pass(N::Additive, N::Multiplicative);
    r.binary(N::Additive, N::Multiplicative, T::Plus, BinaryOp::Add);
    r.binary(N::Additive, N::Multiplicative, T::Dash, BinaryOp::Sub);

    r.pass(N::Multiplicative, N::Unary);
    r.binary(N::Multiplicative, N::Unary, T::Star, BinaryOp::Mul);
    r.binary(N::Multiplicative, N::Unary, T::Slash, BinaryOp::Div);
    r.binary(N::Multiplicative, N::Unary, T::Percent, BinaryOp::Mod);

    r.pass(N::Unary, N::Postfix);
    r.prefix(T::Plus, UnaryOp::Plus);
    r.prefix(T::Dash, UnaryOp::Negate);
    r.prefix(T::Excl, UnaryOp::Not);
    r.prefix(T::Hash, UnaryOp::Size);
    r.prefix(T::Tilde, UnaryOp::BitNot);
    r.prefix(T::Copy, UnaryOp::Copy);
    for (token, decrement) in [(T::Plus2, false), (T::Minus2, true)] {
        r.add(N::Unary, vec![t(token), nt(N::Unary)], move |mut c, span| {
            let target = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Incr {
                decrement,
                postfix: false,
                target: Box::new(target),
                span,
            }))
        });
    }

    r.pass(N::Postfix, N::Primary);
    r.add(
        N::Postfix,
        vec![nt(N::Postfix), t(T::Period), t(T::Identifier)],
        |mut c, span| {
            let name = ident(&pop_token(&mut c));
            pop(&mut c);
            let parent = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Member {
                parent: Box::new(parent),
                name,
                span,
            }))
        },
    );
    r.add(
        N::Postfix,
        vec![
            nt(N::Postfix),
            t(T::BracketOpen),
            nt(N::Expression),
            t(T::BracketClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let index = pop_expr(&mut c);
            pop(&mut c);
            let parent = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Index {
                parent: Box::new(parent),
                index: Box::new(index),
                span,
            }))
        },
    );
    r.add(
        N::Postfix,
        vec![
            nt(N::Postfix),
            t(T::BracketOpen),
            nt(N::Expression),
            t(T::DoublePeriod),
            nt(N::Expression),
            t(T::BracketClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let to = pop_expr(&mut c);
            pop(&mut c);
            let from = pop_expr(&mut c);
            pop(&mut c);
            let parent = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Slice {
                parent: Box::new(parent),
                from: Some(Box::new(from)),
                to: Some(Box::new(to)),
                span,
            }))
        },
    );
    r.add(
        N::Postfix,
        vec![
            nt(N::Postfix),
            t(T::BracketOpen),
            nt(N::Expression),
            t(T::DoublePeriod),
            t(T::BracketClose),
        ],
        |mut c, span| {
            pop(&mut c);
            pop(&mut c);
            let from = pop_expr(&mut c);
            pop(&mut c);
            let parent = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Slice {
                parent: Box::new(parent),
                from: Some(Box::new(from)),
                to: None,
                span,
            }))
        },
    );
    r.add(
        N::Postfix,
        vec![
            nt(N::Postfix),
            t(T::BracketOpen),
            t(T::DoublePeriod),
            nt(N::Expression),
            t(T::BracketClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let to = pop_expr(&mut c);
            pop(&mut c);
            pop(&mut c);
            let parent = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Slice {
                parent: Box::new(parent),
                from: None,
                to: Some(Box::new(to)),
                span,
            }))
        },
    );
    r.add(
        N::Postfix,
        vec![
            nt(N::Postfix),
            t(T::BracketOpen),
            t(T::DoublePeriod),
            t(T::BracketClose),
        ],
        |mut c, span| {
            pop(&mut c);
            pop(&mut c);
            pop(&mut c);
            let parent = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Slice {
                parent: Box::new(parent),
                from: None,
                to: None,
                span,
            }))
        },
    );
    for (token, decrement) in [(T::Plus2, false), (T::Minus2, true)] {
        r.add(
            N::Postfix,
            vec![nt(N::Postfix), t(token)],
            move |mut c, span| {
                pop(&mut c);
                let target = pop_expr(&mut c);
                Ok(Ast::Expr(ExprNode::Incr {
                    decrement,
                    postfix: true,
                    target: Box::new(target),
                    span,
                }))
            },
        );
    }

    // ---- primaries ----

    for token in [T::Boolean, T::Number, T::PureString] {
        r.add(N::Primary, vec![t(token)], |mut c, span| {
            let value = literal_value(&pop_token(&mut c));
            Ok(Ast::Expr(ExprNode::Literal { value, span }))
        });
    }
    r.add(N::Primary, vec![t(T::Null)], |_, span| {
        Ok(Ast::Expr(ExprNode::Literal {
            value: JsonValue::Null,
            span,
        }))
    });
    r.add(N::Primary, vec![t(T::Underscore)], |_, span| {
        Ok(Ast::Expr(ExprNode::Underscore { span }))
    });
    r.add(N::Primary, vec![t(T::Dollar)], |_, span| {
        Ok(Ast::Expr(ExprNode::Dollar { span }))
    });
    r.add(N::Primary, vec![t(T::Identifier)], |mut c, span| {
        let name = ident(&pop_token(&mut c));
        Ok(Ast::Expr(ExprNode::Variable { name, span }))
    });
    r.add(
        N::Primary,
        vec![t(T::Identifier), t(T::ParenOpen), t(T::ParenClose)],
        |mut c, span| {
            pop(&mut c);
            pop(&mut c);
            let function = ident(&pop_token(&mut c));
            Ok(Ast::Expr(ExprNode::Call {
                function,
                args: Vec::new(),
                span,
            }))
        },
    );
    r.add(
        N::Primary,
        vec![
            t(T::Identifier),
            t(T::ParenOpen),
            nt(N::ArgList),
            t(T::ParenClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let args = pop(&mut c).into_exprs();
            pop(&mut c);
            let function = ident(&pop_token(&mut c));
            Ok(Ast::Expr(ExprNode::Call {
                function,
                args,
                span,
            }))
        },
    );
    r.add(N::ArgList, vec![nt(N::Expression)], |mut c, span| {
        Ok(Ast::Exprs(vec![pop_expr(&mut c)], span))
    });
    r.add(
        N::ArgList,
        vec![nt(N::ArgList), t(T::Comma), nt(N::Expression)],
        |mut c, span| {
            let expr = pop_expr(&mut c);
            pop(&mut c);
            let mut exprs = pop(&mut c).into_exprs();
            exprs.push(expr);
            Ok(Ast::Exprs(exprs, span))
        },
    );
    r.add(
        N::ArgList,
        vec![nt(N::ArgList), t(T::Comma)],
        |mut c, span| {
            pop(&mut c);
            Ok(Ast::Exprs(pop(&mut c).into_exprs(), span))
        },
    );
    r.add(
        N::Primary,
        vec![t(T::ParenOpen), nt(N::Expression), t(T::ParenClose)],
        |mut c, _| {
            pop(&mut c);
            let expr = pop_expr(&mut c);
            Ok(Ast::Expr(expr))
        },
    );
    r.add(
        N::Primary,
        vec![t(T::BraceOpen), nt(N::EntityList), t(T::BraceClose)],
        |mut c, span| {
            pop(&mut c);
            let entities = pop_entities(&mut c);
            Ok(Ast::Expr(ExprNode::Object { entities, span }))
        },
    );
    r.add(
        N::Primary,
        vec![t(T::BracketOpen), nt(N::EntityList), t(T::BracketClose)],
        |mut c, span| {
            pop(&mut c);
            let entities = pop_entities(&mut c);
            Ok(Ast::Expr(ExprNode::Array { entities, span }))
        },
    );
    r.add(
        N::Primary,
        vec![
            t(T::Gen),
            t(T::BraceOpen),
            nt(N::EntityList),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let entities = pop_entities(&mut c);
            Ok(Ast::Expr(ExprNode::Subtemplate { entities, span }))
        },
    );

    r.add(
        N::Primary,
        vec![
            t(T::Match),
            nt(N::Expression),
            t(T::BraceOpen),
            nt(N::MatchCases),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let cases = pop(&mut c).into_match_cases();
            pop(&mut c);
            let subject = pop_expr(&mut c);
            Ok(Ast::Expr(ExprNode::Match {
                subject: Some(Box::new(subject)),
                cases,
                span,
            }))
        },
    );
    r.add(
        N::Primary,
        vec![
            t(T::Match),
            t(T::BraceOpen),
            nt(N::MatchCases),
            t(T::BraceClose),
        ],
        |mut c, span| {
            pop(&mut c);
            let cases = pop(&mut c).into_match_cases();
            Ok(Ast::Expr(ExprNode::Match {
                subject: None,
                cases,
                span,
            }))
        },
    );
    r.add(N::MatchCases, vec![nt(N::MatchCase)], |mut c, span| {
        let case = match pop(&mut c) {
            Ast::MatchCases(mut cases, _) => cases.remove(0),
            other => unreachable!("expected match arm, got {:?}", other),
        };
        Ok(Ast::MatchCases(vec![case], span))
    });
    r.add(
        N::MatchCases,
        vec![nt(N::MatchCases), t(T::Comma), nt(N::MatchCase)],
        |mut c, span| {
            let case = match pop(&mut c) {
                Ast::MatchCases(mut cases, _) => cases.remove(0),
                other => unreachable!("expected match arm, got {:?}", other),
            };
            pop(&mut c);
            let mut cases = pop(&mut c).into_match_cases();
            cases.push(case);
            Ok(Ast::MatchCases(cases, span))
        },
    );
    r.add(
        N::MatchCases,
        vec![nt(N::MatchCases), t(T::Comma)],
        |mut c, span| {
            pop(&mut c);
            Ok(Ast::MatchCases(pop(&mut c).into_match_cases(), span))
        },
    );
    r.add(
        N::MatchCase,
        vec![t(T::Case), nt(N::Expression), t(T::Arrow), nt(N::Expression)],
        |mut c, span| {
            let result = pop_expr(&mut c);
            pop(&mut c);
            let pattern = pop_expr(&mut c);
            Ok(Ast::MatchCases(
                vec![MatchCaseNode {
                    pattern: Some(pattern),
                    result,
                    span,
                }],
                span,
            ))
        },
    );
    r.add(
        N::MatchCase,
        vec![t(T::Else), t(T::Arrow), nt(N::Expression)],
        |mut c, span| {
            let result = pop_expr(&mut c);
            Ok(Ast::MatchCases(
                vec![MatchCaseNode {
                    pattern: None,
                    result,
                    span,
                }],
                span,
            ))
        },
    );

    interpolated_string_rule(&mut r, T::DqDelimiter);
    interpolated_string_rule(&mut r, T::MlDelimiter);
    interpolated_string_rule(&mut r, T::DqMlDelimiter);
    r.add(N::StringParts, vec![], |_, span| {
        Ok(Ast::Parts(Vec::new(), span))
    });
    r.add(
        N::StringParts,
        vec![nt(N::StringParts), nt(N::StringPart)],
        |mut c, span| {
            let part = match pop(&mut c) {
                Ast::Parts(mut parts, _) => parts.remove(0),
                other => unreachable!("expected string part, got {:?}", other),
            };
            let mut parts = pop(&mut c).into_parts();
            parts.push(part);
            Ok(Ast::Parts(parts, span))
        },
    );
    r.add(N::StringPart, vec![t(T::StringContent)], |mut c, span| {
        let token = pop_token(&mut c);
        Ok(Ast::Parts(
            vec![StringPartNode::Content {
                text: token.text().to_string(),
                span,
            }],
            span,
        ))
    });
    r.add(
        N::StringPart,
        vec![t(T::Interpolation), nt(N::Expression), t(T::BracketClose)],
        |mut c, span| {
            pop(&mut c);
            let expr = pop_expr(&mut c);
            Ok(Ast::Parts(
                vec![StringPartNode::Interp { expr, span }],
                span,
            ))
        },
    );
    for token in [
        T::MlWhitespace,
        T::MlLineBreak,
        T::MlBoundaryIndicator,
        T::MlNoLineBreak,
    ] {
        r.add(N::StringPart, vec![t(token)], move |_, span| {
            let part = match token {
                T::MlWhitespace => StringPartNode::Whitespace { span },
                T::MlLineBreak => StringPartNode::LineBreak { span },
                T::MlNoLineBreak => StringPartNode::NoLineBreak { span },
                _ => StringPartNode::Boundary { span },
            };
            Ok(Ast::Parts(vec![part], span))
        });
    }

    Grammar::new(r.rules)
}

/// The shared document parser table, generated on first use.
pub fn parser_table() -> &'static ParserTable {
    static TABLE: OnceLock<ParserTable> = OnceLock::new();
    TABLE.get_or_init(|| ParserTable::generate(build_grammar(), Nonterminal::Document))
}

/// Parses a token stream into the document's entity list.
pub fn parse(tokens: &[Token]) -> Result<Vec<EntityNode>, TemplateError> {
    parse_with(tokens, parser_table())
}

pub fn parse_with(tokens: &[Token], table: &ParserTable) -> Result<Vec<EntityNode>, TemplateError> {
    let mut state_stack: Vec<usize> = vec![0];
    let mut value_stack: Vec<Ast> = Vec::new();
    let mut i = 0;
    loop {
        let token = &tokens[i.min(tokens.len() - 1)];
        let state = match state_stack.last() {
            Some(&s) => &table.states[s],
            None => unreachable!("empty state stack"),
        };
        match state.action(token.ty) {
            Some(Action::Shift(target)) => {
                value_stack.push(Ast::Token(token.clone()));
                state_stack.push(target);
                i += 1;
            }
            Some(Action::Reduce(rule_index)) => {
                let rule = &table.grammar.rules[rule_index];
                let arity = rule.symbols.len();
                let children = value_stack.split_off(value_stack.len() - arity);
                state_stack.truncate(state_stack.len() - arity);
                let span = children
                    .iter()
                    .map(Ast::span)
                    .reduce(Span::union)
                    .unwrap_or_else(|| Span::at(token.span.from));
                let value = (rule.reduce)(children, span)?;
                let below = match state_stack.last() {
                    Some(&s) => &table.states[s],
                    None => unreachable!("empty state stack"),
                };
                let target = match below.goto(rule.nonterminal) {
                    Some(target) => target,
                    None => unreachable!("missing goto for {:?}", rule.nonterminal),
                };
                value_stack.push(value);
                state_stack.push(target);
            }
            Some(Action::Accept) => {
                return Ok(match value_stack.pop() {
                    Some(ast) => ast.into_entities(),
                    None => Vec::new(),
                });
            }
            None => {
                return Err(syntax_error(state, token));
            }
        }
    }
}

fn syntax_error(state: &crate::table::State, token: &Token) -> TemplateError {
    let mut expected: Vec<&'static str> = Vec::new();
    for ty in state.expected() {
        let name = ty.error_name();
        if !expected.contains(&name) {
            expected.push(name);
        }
    }
    let list = expected.join(", ");
    TemplateError::syntax(
        token.span,
        format!("unexpected {}; expected one of: {}", token.ty.error_name(), list),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::lexer::Lexer;

    fn parse_source(source: &str) -> Result<Vec<EntityNode>, TemplateError> {
        parse(&Lexer::tokenize(source)?)
    }

    fn source_of(entities: &[EntityNode]) -> String {
        let mut out = String::new();
        for (i, e) in entities.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            e.write_source(&mut out);
        }
        out
    }

    #[test]
    fn test_empty_document_parses() {
        assert!(parse_source("").unwrap().is_empty());
    }

    #[test]
    fn test_json_document_parses() {
        let entities = parse_source("{'a': 1, 'b': [1, 2, 3]}").unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(source_of(&entities), "{ 'a': 1, 'b': [1, 2, 3] }");
    }

    #[test]
    fn test_commas_are_optional_separators() {
        let entities = parse_source("1 2, 3,, 4,").unwrap();
        assert_eq!(entities.len(), 4);
    }

    #[test]
    fn test_precedence_binds_product_over_sum() {
        let entities = parse_source("1 + 2 * 3").unwrap();
        assert_eq!(source_of(&entities), "(1 + (2 * 3))");
    }

    #[test]
    fn test_relational_binds_over_equality() {
        let entities = parse_source("1 < 2 == 3 < 4").unwrap();
        assert_eq!(source_of(&entities), "((1 < 2) == (3 < 4))");
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let entities = parse_source("a = b = 1").unwrap();
        assert_eq!(source_of(&entities), "a = b = 1");
        match &entities[0] {
            EntityNode::Value {
                expr: ExprNode::Assign { value, .. },
                ..
            } => assert!(matches!(**value, ExprNode::Assign { .. })),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_ternary_nests_in_else_branch() {
        let entities = parse_source("a ? 1 : b ? 2 : 3").unwrap();
        assert_eq!(source_of(&entities), "(a ? 1 : (b ? 2 : 3))");
    }

    #[test]
    fn test_if_else_if_chain() {
        let entities =
            parse_source("if a { 1 } else if b { 2 } else { 3 }").unwrap();
        assert_eq!(
            source_of(&entities),
            "if a { 1 } else if b { 2 } else { 3 }"
        );
    }

    #[test]
    fn test_dangling_else_attaches_to_inner_if() {
        let entities = parse_source("if a { if b { 1 } else { 2 } }").unwrap();
        assert_eq!(source_of(&entities), "if a { if b { 1 } else { 2 } }");
    }

    #[test]
    fn test_for_variants() {
        assert_eq!(
            source_of(&parse_source("for x in [1, 2] { x }").unwrap()),
            "for x in [1, 2] { x }"
        );
        assert_eq!(
            source_of(&parse_source("for k:v in obj { k }").unwrap()),
            "for k:v in obj { k }"
        );
        assert_eq!(
            source_of(&parse_source("for i from 0 to 3 { i }").unwrap()),
            "for i from 0 to 3 { i }"
        );
    }

    #[test]
    fn test_switch_with_and_without_subject() {
        let entities =
            parse_source("switch x { case 1 { 'a' }, else { 'b' } }").unwrap();
        assert_eq!(
            source_of(&entities),
            "switch x { case 1 { 'a' }, else { 'b' } }"
        );
        let entities = parse_source("switch { case x > 1 { 'a' } }").unwrap();
        match &entities[0] {
            EntityNode::Switch { subject, cases, .. } => {
                assert!(subject.is_none());
                assert_eq!(cases.len(), 1);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_match_expression() {
        let entities =
            parse_source("match x { case 1 -> 'one', else -> 'many' }").unwrap();
        assert_eq!(
            source_of(&entities),
            "match x { case 1 -> 'one', else -> 'many' }"
        );
    }

    #[test]
    fn test_postfix_chain_and_slices() {
        assert_eq!(source_of(&parse_source("a.b[0]").unwrap()), "a.b[0]");
        assert_eq!(source_of(&parse_source("a[1..3]").unwrap()), "a[1..3]");
        assert_eq!(source_of(&parse_source("a[1..]").unwrap()), "a[1..]");
        assert_eq!(source_of(&parse_source("a[..2]").unwrap()), "a[..2]");
        assert_eq!(source_of(&parse_source("a[..]").unwrap()), "a[..]");
    }

    #[test]
    fn test_function_definition_forms() {
        assert_eq!(
            source_of(&parse_source("def f(a, b) -> a + b").unwrap()),
            "def f(a, b) -> (a + b)"
        );
        assert_eq!(
            source_of(&parse_source("def f(a...) { a }").unwrap()),
            "def f(a...) { a }"
        );
        assert_eq!(
            source_of(&parse_source("def f() { 1 }").unwrap()),
            "def f() { 1 }"
        );
    }

    #[test]
    fn test_do_then_chains() {
        let entities = parse_source("do { a = 1 } then a").unwrap();
        assert!(matches!(
            entities[0],
            EntityNode::Value {
                expr: ExprNode::DoThen { .. },
                ..
            }
        ));
        let entities = parse_source("a then do { b = 2 }").unwrap();
        assert!(matches!(
            entities[0],
            EntityNode::Value {
                expr: ExprNode::DoThen { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_break_and_continue_depths() {
        let entities = parse_source("for x in a { break 2 }");
        // depth validation happens later; parsing accepts it
        assert!(entities.is_ok());
        let err = parse_source("for x in a { break 0 }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Semantic);
    }

    #[test]
    fn test_is_operator_validates_type_name() {
        assert!(parse_source("x is number").is_ok());
        assert!(parse_source("x is null").is_ok());
        let err = parse_source("x is banana").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Semantic);
    }

    #[test]
    fn test_interpolated_string_parses() {
        let entities = parse_source("\"a#[1 + x]b\"").unwrap();
        match &entities[0] {
            EntityNode::Value {
                expr: ExprNode::Interpolate { parts, .. },
                ..
            } => assert_eq!(parts.len(), 3),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_syntax_error_lists_expectations() {
        let err = parse_source("if { 1 }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(err.message.contains("expected one of"));
    }

    #[test]
    fn test_unclosed_brace_is_syntax_error() {
        let err = parse_source("{ 'a': 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[test]
    fn test_void_line() {
        let entities = parse_source("@ f()").unwrap();
        assert!(matches!(entities[0], EntityNode::VoidLine { .. }));
    }

    #[test]
    fn test_gen_block_is_expression() {
        let entities = parse_source("gen { 1 }").unwrap();
        assert!(matches!(
            entities[0],
            EntityNode::Value {
                expr: ExprNode::Subtemplate { .. },
                ..
            }
        ));
    }
}
