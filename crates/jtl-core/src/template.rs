//! A parsed, compiled template, ready to run any number of times.

use crate::ast;
use crate::error::{EvalError, TemplateError};
use crate::exec::{Execution, ExecutionType};
use crate::instr::Instructions;
use crate::json::JsonValue;
use crate::lexer::Lexer;
use crate::parser;
use crate::runtime::TemplateContext;
use std::rc::Rc;

pub struct Template {
    insns: Rc<Instructions>,
}

impl Template {
    /// Lexes, parses, statically checks and compiles a template source.
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let tokens = Lexer::tokenize(source)?;
        let entities = parser::parse(&tokens)?;
        ast::validate_loop_depth(&entities)?;
        let insns = ast::compile_entities(&entities)?;
        Ok(Template {
            insns: Rc::new(insns),
        })
    }

    /// Runs the template against the given context.
    pub fn run(&self, ctx: &mut TemplateContext) -> Result<JsonValue, EvalError> {
        Execution::new(ExecutionType::Root, self.insns.clone()).run(ctx)
    }

    /// Runs the template with a fresh, empty context.
    pub fn evaluate(&self) -> Result<serde_json::Value, EvalError> {
        let mut ctx = TemplateContext::new();
        Ok(self.run(&mut ctx)?.into())
    }

    /// Runs the template with the members of `input` bound as variables.
    pub fn evaluate_with(&self, input: &serde_json::Value) -> Result<serde_json::Value, EvalError> {
        let mut ctx = TemplateContext::new();
        ctx.bind_object(input);
        Ok(self.run(&mut ctx)?.into())
    }

    pub fn instructions(&self) -> &Instructions {
        &self.insns
    }

    /// The compiled program as a debug listing.
    pub fn debug_listing(&self) -> String {
        let mut out = String::new();
        self.insns.write_debug(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionType;
    use serde_json::json;

    fn eval(source: &str) -> serde_json::Value {
        Template::parse(source)
            .expect("template failed to parse")
            .evaluate()
            .expect("template failed to run")
    }

    fn eval_err(source: &str) -> EvalError {
        Template::parse(source)
            .expect("template failed to parse")
            .evaluate()
            .expect_err("template unexpectedly succeeded")
    }

    #[test]
    fn test_literal_document_round_trips() {
        assert_eq!(
            eval("{'a': 1, 'b': [1, 2, 3], 'c': null}"),
            json!({"a": 1, "b": [1, 2, 3], "c": null})
        );
    }

    #[test]
    fn test_first_root_value_terminates() {
        assert_eq!(eval("1 2 3"), json!(1));
    }

    #[test]
    fn test_empty_template_yields_null() {
        assert_eq!(eval(""), json!(null));
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), json!(7));
        assert_eq!(eval("(1 + 2) * 3"), json!(9));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("6 / 2"), json!(3));
    }

    #[test]
    fn test_range_loop_builds_array() {
        assert_eq!(eval("[for i from 0 to 3 { i }]"), json!([0, 1, 2]));
        assert_eq!(eval("[for i from 3 to 0 { i }]"), json!([3, 2, 1]));
    }

    #[test]
    fn test_array_loop_maps_elements() {
        assert_eq!(eval("[for x in [1, 2, 3] { x * 2 }]"), json!([2, 4, 6]));
    }

    #[test]
    fn test_string_loop_iterates_characters() {
        assert_eq!(eval("[for c in 'ab' { c }]"), json!(["a", "b"]));
    }

    #[test]
    fn test_object_loop_yields_keys_and_values() {
        assert_eq!(
            eval("{for k:v in {'a': 1, 'b': 2} { k: v * 10 }}"),
            json!({"a": 10, "b": 20})
        );
    }

    #[test]
    fn test_break_stops_the_loop() {
        assert_eq!(
            eval("[for i from 0 to 10 { if i == 3 { break }, i }]"),
            json!([0, 1, 2])
        );
    }

    #[test]
    fn test_break_two_levels() {
        assert_eq!(
            eval("[for i from 0 to 3 { for j from 0 to 3 { if j == 1 { break 2 }, [i, j] } }]"),
            json!([[0, 0]])
        );
    }

    #[test]
    fn test_continue_skips_to_next_round() {
        assert_eq!(
            eval("[for i from 0 to 6 { if i % 2 == 0 { continue }, i }]"),
            json!([1, 3, 5])
        );
    }

    #[test]
    fn test_break_outside_loop_is_rejected_at_parse() {
        assert!(Template::parse("break").is_err());
        assert!(Template::parse("[for i from 0 to 3 { break 2 }]").is_err());
    }

    #[test]
    fn test_underscore_reads_the_value_under_construction() {
        assert_eq!(eval("{'a': 1, 'b': _.a + 1}"), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_dollar_reads_the_outer_construction() {
        assert_eq!(
            eval("{'a': 1, 'b': {'c': $.a}}"),
            json!({"a": 1, "b": {"c": 1}})
        );
    }

    #[test]
    fn test_functions_overload_by_arity() {
        assert_eq!(
            eval("def f(a) -> a * 10, def f(a, b) -> a + b, f(1) + f(1, 2)"),
            json!(13)
        );
    }

    #[test]
    fn test_vararg_collects_tail_arguments() {
        assert_eq!(eval("def f(xs...) -> #xs, f(1, 2, 3)"), json!(3));
        assert_eq!(eval("def f(first, xs...) -> xs, f(1, 2, 3)"), json!([2, 3]));
    }

    #[test]
    fn test_recursive_function() {
        assert_eq!(
            eval("def fact(n) -> n <= 1 ? 1 : n * fact(n - 1), fact(5)"),
            json!(120)
        );
    }

    #[test]
    fn test_runaway_recursion_is_bounded() {
        let err = eval_err("def f() -> f(), f()");
        assert_eq!(err.exception, ExceptionType::RecursionLimit);
    }

    #[test]
    fn test_return_exits_function_body_early() {
        assert_eq!(
            eval("def f(x) { if x == 0 { return }, x * 2 }, [f(0), f(3)]"),
            json!([null, 6])
        );
    }

    #[test]
    fn test_deep_but_bounded_recursion_succeeds() {
        assert_eq!(
            eval("def count(n) -> n == 0 ? 0 : count(n - 1), count(50)"),
            json!(0)
        );
    }

    #[test]
    fn test_undefined_function_errors() {
        let err = eval_err("nope()");
        assert_eq!(err.exception, ExceptionType::UndefinedFunction);
    }

    #[test]
    fn test_subtemplate_function_body() {
        assert_eq!(
            eval("def firstOdd(xs) { for x in xs { if x % 2 == 1 { x } } }, firstOdd([2, 4, 5, 7])"),
            json!(5)
        );
    }

    #[test]
    fn test_switch_selects_matching_case() {
        assert_eq!(
            eval("@ x = 2, switch x { case 1 { 'one' }, case 2 { 'two' }, else { 'many' } }"),
            json!("two")
        );
        assert_eq!(
            eval("@ x = 9, switch x { case 1 { 'one' }, case 2 { 'two' }, else { 'many' } }"),
            json!("many")
        );
    }

    #[test]
    fn test_subjectless_switch_tests_conditions() {
        assert_eq!(
            eval("@ x = 5, switch { case x < 3 { 'small' }, else { 'big' } }"),
            json!("big")
        );
    }

    #[test]
    fn test_switch_does_not_fall_through() {
        assert_eq!(
            eval("[@ x = 1, switch x { case 1 { 'a' }, case 2 { 'b' } }]"),
            json!(["a"])
        );
    }

    #[test]
    fn test_match_expression_selects_arm() {
        assert_eq!(
            eval("match 2 { case 1 -> 'one', case 2 -> 'two', else -> 'many' }"),
            json!("two")
        );
        assert_eq!(
            eval("match 9 { case 1 -> 'one', else -> 'many' }"),
            json!("many")
        );
    }

    #[test]
    fn test_interpolation_embeds_values() {
        assert_eq!(eval("@ n = 3, \"n = #[n]\""), json!("n = 3"));
    }

    #[test]
    fn test_multiline_string_joins_lines() {
        assert_eq!(eval("'''\n  hello\n  world\n'''"), json!("hello\nworld"));
    }

    #[test]
    fn test_evaluate_with_binds_input_members() {
        let template = Template::parse("\"hi #[name]\"").unwrap();
        assert_eq!(
            template.evaluate_with(&json!({"name": "jo"})).unwrap(),
            json!("hi jo")
        );
    }

    #[test]
    fn test_template_reruns_with_different_inputs() {
        let template = Template::parse("n * n").unwrap();
        assert_eq!(template.evaluate_with(&json!({"n": 3})).unwrap(), json!(9));
        assert_eq!(template.evaluate_with(&json!({"n": 5})).unwrap(), json!(25));
    }

    #[test]
    fn test_void_lines_run_for_effects_only() {
        assert_eq!(eval("@ x = 1, @ x += 2, x"), json!(3));
    }

    #[test]
    fn test_assignment_writes_the_owning_layer() {
        assert_eq!(eval("@ x = 1, @ (do { x = 5 } then 0), x"), json!(5));
    }

    #[test]
    fn test_do_then_ordering() {
        assert_eq!(eval("[do { x = 1 } then x, x then do { x = 10 }, x]"), json!([1, 1, 10]));
    }

    #[test]
    fn test_gen_runs_like_a_root() {
        assert_eq!(eval("[gen { 1 2 }, 3]"), json!([1, 3]));
    }

    #[test]
    fn test_keyed_entity_in_array_errors() {
        let err = eval_err("['a': 1]");
        assert_eq!(err.exception, ExceptionType::InvalidKey);
    }

    #[test]
    fn test_division_by_zero_errors() {
        assert!(Template::parse("@ x = 0, 1 / x").unwrap().evaluate().is_err());
    }

    #[test]
    fn test_error_hook_substitutes_a_value() {
        let template = Template::parse("missing + 1").unwrap();
        let mut ctx = TemplateContext::new().with_error_hook(Box::new(|_, _| JsonValue::Int(0)));
        assert_eq!(template.run(&mut ctx).unwrap(), JsonValue::Int(1));
    }

    #[test]
    fn test_slices_and_indexing() {
        assert_eq!(eval("[1, 2, 3, 4][1..3]"), json!([2, 3]));
        assert_eq!(eval("[1, 2, 3, 4][..2]"), json!([1, 2]));
        assert_eq!(eval("[1, 2, 3, 4][2..]"), json!([3, 4]));
        assert_eq!(eval("[1, 2, 3][-1]"), json!(3));
        assert_eq!(eval("{'a': 1}.a"), json!(1));
    }

    #[test]
    fn test_type_checks() {
        assert_eq!(eval("1 is number"), json!(true));
        assert_eq!(eval("'x' isnt number"), json!(true));
        assert_eq!(eval("{'a': 1} has 'a'"), json!(true));
        assert_eq!(eval("{'a': 1} hasnt 'b'"), json!(true));
    }

    #[test]
    fn test_increment_and_compound_assignment() {
        assert_eq!(eval("@ x = 1, [x++, x, ++x, x]"), json!([1, 2, 3, 3]));
        assert_eq!(eval("@ x = 4, @ x *= 3, x"), json!(12));
    }

    #[test]
    fn test_if_chain_picks_first_true_branch() {
        assert_eq!(
            eval("@ x = 7, if x < 5 { 'low' } else if x < 10 { 'mid' } else { 'high' }"),
            json!("mid")
        );
    }

    #[test]
    fn test_debug_listing_names_instructions() {
        let template = Template::parse("[for i from 0 to 2 { i }]").unwrap();
        let listing = template.debug_listing();
        assert!(listing.contains("Result"));
    }
}
