//! The evaluation context: the layer arena, the stack of values under
//! construction, user-defined functions and the host error hook.

use crate::error::{EvalError, ExceptionType};
use crate::exec::{Execution, ExecutionType};
use crate::expr::{Expression, Step};
use crate::instr::Instructions;
use crate::json::JsonValue;
use crate::operators;
use crate::vfl::{Layer, ValueIter};
use std::rc::Rc;

/// Bound on nested function calls. Each level recurses through the native
/// evaluator, so the bound must stay well inside the thread stack.
pub const MAX_CALL_DEPTH: usize = 64;

/// Body of a user-defined function: a single expression or a whole
/// subtemplate program.
#[derive(Debug)]
pub enum FunctionBody {
    Expr(Expression),
    Subtemplate(Rc<Instructions>),
}

/// One function overload. Overloads of the same name are distinguished by
/// parameter count; a vararg overload collects trailing arguments into an
/// array bound to its last parameter.
#[derive(Debug)]
pub struct FunctionDefinition {
    pub name: String,
    pub params: Vec<String>,
    pub vararg: bool,
    pub body: FunctionBody,
}

impl FunctionDefinition {
    fn accepts(&self, argc: usize) -> bool {
        if self.vararg {
            argc + 1 >= self.params.len()
        } else {
            argc == self.params.len()
        }
    }
}

/// Hook invoked on runtime errors; returning a value substitutes it for the
/// failed computation and evaluation continues.
pub type ErrorHook = Box<dyn Fn(ExceptionType, &str) -> JsonValue>;

/// Evaluation state for one template run.
pub struct TemplateContext {
    layers: Vec<Layer>,
    current: usize,
    scopes: Vec<JsonValue>,
    hook: Option<ErrorHook>,
    call_depth: usize,
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateContext {
    pub fn new() -> TemplateContext {
        TemplateContext {
            layers: vec![Layer::new("root", None, None)],
            current: 0,
            scopes: Vec::new(),
            hook: None,
            call_depth: 0,
        }
    }

    /// Installs the error hook. With a hook set, runtime errors yield the
    /// hook's value instead of aborting.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> TemplateContext {
        self.hook = Some(hook);
        self
    }

    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.hook = Some(hook);
    }

    /// Routes a runtime error through the hook, or propagates it.
    pub fn exception(&mut self, error: EvalError) -> Result<JsonValue, EvalError> {
        match &self.hook {
            Some(hook) => Ok(hook(error.exception, &error.message)),
            None => Err(error),
        }
    }

    pub(crate) fn raise(
        &mut self,
        exception: ExceptionType,
        message: impl Into<String>,
    ) -> Result<JsonValue, EvalError> {
        self.exception(EvalError::new(exception, message))
    }

    // ---- variables ----

    fn find_owner(&self, name: &str) -> Option<usize> {
        let mut layer = Some(self.current);
        while let Some(i) = layer {
            if self.layers[i].variables.contains_key(name) {
                return Some(i);
            }
            layer = self.layers[i].parent;
        }
        None
    }

    pub fn get_var(&mut self, name: &str) -> Result<JsonValue, EvalError> {
        match self.find_owner(name) {
            Some(i) => Ok(self.layers[i].variables[name].clone()),
            None => self.raise(
                ExceptionType::UndefinedVariable,
                format!("undefined variable '{}'", name),
            ),
        }
    }

    /// Writes the nearest visible binding of the name, or defines one on the
    /// innermost layer.
    pub fn set_var(&mut self, name: &str, value: JsonValue) {
        let target = self.find_owner(name).unwrap_or(self.current);
        self.layers[target].variables.insert(name.to_string(), value);
    }

    /// Defines the name on the innermost layer, shadowing outer bindings.
    /// Used for loop variables and function parameters.
    pub fn define_local(&mut self, name: &str, value: JsonValue) {
        self.layers[self.current]
            .variables
            .insert(name.to_string(), value);
    }

    /// Writes through a member/index path rooted at a variable.
    pub(crate) fn assign_path(
        &mut self,
        root: &str,
        steps: &[Step],
        value: JsonValue,
    ) -> Result<(), EvalError> {
        let (last, init) = match steps.split_last() {
            Some(pair) => pair,
            None => {
                self.set_var(root, value);
                return Ok(());
            }
        };
        let owner = match self.find_owner(root) {
            Some(i) => i,
            None => {
                return Err(EvalError::new(
                    ExceptionType::UndefinedVariable,
                    format!("undefined variable '{}'", root),
                ))
            }
        };
        let mut slot = match self.layers[owner].variables.get_mut(root) {
            Some(v) => v,
            None => {
                return Err(EvalError::new(
                    ExceptionType::UndefinedVariable,
                    format!("undefined variable '{}'", root),
                ))
            }
        };
        for step in init {
            slot = descend(slot, step)?;
        }
        write_step(slot, last, value)
    }

    // ---- construction scopes ----

    pub(crate) fn push_scope(&mut self, value: JsonValue) -> usize {
        self.scopes.push(value);
        self.scopes.len() - 1
    }

    pub(crate) fn pop_scope(&mut self) -> JsonValue {
        self.scopes.pop().unwrap_or(JsonValue::Null)
    }

    pub(crate) fn scope_mut(&mut self, index: usize) -> &mut JsonValue {
        &mut self.scopes[index]
    }

    /// `_`: the innermost value under construction.
    pub fn underscore(&mut self) -> Result<JsonValue, EvalError> {
        match self.layers[self.current].scope {
            Some(i) => Ok(self.scopes[i].clone()),
            None => self.raise(
                ExceptionType::NoScopeInRoot,
                "'_' has no enclosing construction here",
            ),
        }
    }

    /// `$`: the outermost construction below the nearest root.
    pub fn dollar(&mut self) -> Result<JsonValue, EvalError> {
        match self.layers[self.current].dollar_scope {
            Some(i) => Ok(self.scopes[i].clone()),
            None => self.raise(
                ExceptionType::NoScopeInRoot,
                "'$' has no enclosing construction here",
            ),
        }
    }

    // ---- layers ----

    /// `$` points at the farthest chained construction scope below the
    /// nearest root layer.
    fn compute_dollar(&self, parent: usize, scope: Option<usize>) -> Option<usize> {
        scope?;
        if self.layers[parent].scope.is_none() {
            return scope;
        }
        let mut p = parent;
        while let Some(pp) = self.layers[p].parent {
            if self.layers[pp].scope.is_some() {
                p = pp;
            } else {
                break;
            }
        }
        self.layers[p].scope
    }

    fn push_layer(&mut self, layer: Layer) -> usize {
        self.layers.push(layer);
        self.current = self.layers.len() - 1;
        self.current
    }

    /// A frame layer: shares its parent's construction scope and delegates
    /// iterator/switch lookups to it.
    pub(crate) fn push_partial_layer(&mut self, name: &'static str) -> usize {
        let parent = self.current;
        let mut layer = Layer::new(name, Some(parent), Some(parent));
        layer.partial = true;
        layer.scope = self.layers[parent].scope;
        layer.dollar_scope = self.compute_dollar(parent, layer.scope);
        self.push_layer(layer)
    }

    /// The layer of an array/object construction, bound to its scope value.
    pub(crate) fn push_construct_layer(&mut self, name: &'static str, scope: usize) -> usize {
        let parent = self.current;
        let mut layer = Layer::new(name, Some(parent), Some(parent));
        layer.scope = Some(scope);
        layer.dollar_scope = self.compute_dollar(parent, Some(scope));
        self.push_layer(layer)
    }

    /// The layer of a subtemplate: a fresh root with no construction scope.
    pub(crate) fn push_subtemplate_layer(&mut self, name: &'static str) -> usize {
        let parent = self.current;
        self.push_layer(Layer::new(name, Some(parent), Some(parent)))
    }

    /// A function-call layer: parented at the defining layer so the body
    /// sees the function's lexical environment, not the caller's.
    fn push_function_layer(&mut self, name: &str, def_layer: usize, subtemplate: bool) -> usize {
        let below = self.current;
        let mut layer = Layer::new(name, Some(def_layer), Some(below));
        layer.partial = true;
        if !subtemplate {
            layer.scope = self.layers[def_layer].scope;
            layer.dollar_scope = self.compute_dollar(def_layer, layer.scope);
        }
        self.push_layer(layer)
    }

    /// Leaves the current layer. Layers push and pop in LIFO order and all
    /// parent/below links point at earlier arena slots, so a departed layer
    /// at the top of the arena can be reclaimed outright; anything a later
    /// push needs (the defining layers of visible functions included) lives
    /// below it.
    pub(crate) fn pop_layer(&mut self) {
        if let Some(below) = self.layers[self.current].below {
            if self.current == self.layers.len() - 1 {
                self.layers.pop();
            }
            self.current = below;
        }
    }

    // ---- iterators and switch values ----

    /// The nearest layer owning the given slot, looking through partial
    /// layers only.
    fn through_partials(&self, own: impl Fn(&Layer) -> bool) -> Option<usize> {
        let mut i = self.current;
        loop {
            if own(&self.layers[i]) {
                return Some(i);
            }
            if !self.layers[i].partial {
                return None;
            }
            i = self.layers[i].parent?;
        }
    }

    pub(crate) fn set_iterator(&mut self, iter: ValueIter) {
        self.layers[self.current].iterator = Some(iter);
    }

    fn iterator_layer(&mut self) -> Result<usize, EvalError> {
        self.through_partials(|l| l.iterator.is_some()).ok_or_else(|| {
            EvalError::new(ExceptionType::ExecutionException, "no active iterator")
        })
    }

    pub(crate) fn itr_has_next(&mut self) -> Result<bool, EvalError> {
        let i = self.iterator_layer()?;
        match &self.layers[i].iterator {
            Some(iter) => Ok(iter.has_next()),
            None => Ok(false),
        }
    }

    pub(crate) fn itr_next(&mut self) -> Result<JsonValue, EvalError> {
        let i = self.iterator_layer()?;
        self.layers[i]
            .iterator
            .as_mut()
            .and_then(ValueIter::next_value)
            .ok_or_else(|| {
                EvalError::new(ExceptionType::ExecutionException, "iterator is exhausted")
            })
    }

    pub(crate) fn itr_next_pair(&mut self) -> Result<(String, JsonValue), EvalError> {
        let i = self.iterator_layer()?;
        self.layers[i]
            .iterator
            .as_mut()
            .and_then(ValueIter::next_pair)
            .ok_or_else(|| {
                EvalError::new(ExceptionType::ExecutionException, "iterator is exhausted")
            })
    }

    pub(crate) fn set_switch(&mut self, value: JsonValue) {
        self.layers[self.current].switching = Some(value);
    }

    pub(crate) fn get_switch(&mut self) -> Result<JsonValue, EvalError> {
        match self.through_partials(|l| l.switching.is_some()) {
            Some(i) => Ok(self.layers[i]
                .switching
                .clone()
                .unwrap_or(JsonValue::Null)),
            None => Err(EvalError::new(
                ExceptionType::ExecutionException,
                "no active switch value",
            )),
        }
    }

    // ---- functions ----

    /// Registers a function overload on the innermost layer. Definitions are
    /// only accepted before any function of the layer has been called.
    pub fn define_function(&mut self, def: Rc<FunctionDefinition>) -> Result<(), EvalError> {
        if self.layers[self.current].used {
            return Err(EvalError::new(
                ExceptionType::ExecutionException,
                format!(
                    "cannot define function '{}' after its scope has been used",
                    def.name
                ),
            ));
        }
        let overloads = self.layers[self.current]
            .functions
            .entry(def.name.clone())
            .or_default();
        let duplicate = overloads.iter().any(|existing| {
            existing.vararg == def.vararg
                && (def.vararg || existing.params.len() == def.params.len())
        });
        if duplicate {
            return Err(EvalError::new(
                ExceptionType::ExecutionException,
                format!("duplicate definition of function '{}'", def.name),
            ));
        }
        overloads.push(def);
        Ok(())
    }

    pub fn call_function(
        &mut self,
        name: &str,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, EvalError> {
        // Exact parameter count wins over a vararg overload.
        let mut found: Option<(usize, Rc<FunctionDefinition>)> = None;
        let mut layer = Some(self.current);
        while let Some(i) = layer {
            if let Some(overloads) = self.layers[i].functions.get(name) {
                let exact = overloads
                    .iter()
                    .find(|d| !d.vararg && d.accepts(args.len()));
                let chosen = exact.or_else(|| {
                    overloads.iter().find(|d| d.vararg && d.accepts(args.len()))
                });
                match chosen {
                    Some(def) => {
                        found = Some((i, def.clone()));
                        break;
                    }
                    None => {
                        return self.raise(
                            ExceptionType::FunctionParamMismatch,
                            format!(
                                "no overload of '{}' takes {} argument(s)",
                                name,
                                args.len()
                            ),
                        )
                    }
                }
            }
            layer = self.layers[i].parent;
        }
        let (def_layer, def) = match found {
            Some(pair) => pair,
            None => {
                return self.raise(
                    ExceptionType::UndefinedFunction,
                    format!("undefined function '{}'", name),
                )
            }
        };

        if self.call_depth >= MAX_CALL_DEPTH {
            return self.raise(
                ExceptionType::RecursionLimit,
                format!("call depth limit reached in '{}'", name),
            );
        }
        self.call_depth += 1;
        self.layers[def_layer].used = true;

        let subtemplate = matches!(def.body, FunctionBody::Subtemplate(_));
        self.push_function_layer(&def.name, def_layer, subtemplate);
        self.bind_params(&def, args);

        let result = match &def.body {
            FunctionBody::Expr(expr) => expr.evaluate(self),
            FunctionBody::Subtemplate(insns) => {
                Execution::new(ExecutionType::Root, insns.clone()).run(self)
            }
        };

        self.pop_layer();
        self.call_depth -= 1;
        result
    }

    fn bind_params(&mut self, def: &FunctionDefinition, mut args: Vec<JsonValue>) {
        if def.vararg {
            let fixed = def.params.len().saturating_sub(1);
            let rest: Vec<JsonValue> = args.split_off(fixed.min(args.len()));
            for (param, arg) in def.params.iter().zip(args) {
                self.define_local(param, arg);
            }
            if let Some(last) = def.params.last() {
                self.define_local(last, JsonValue::Array(Rc::new(rest)));
            }
        } else {
            for (param, arg) in def.params.iter().zip(args) {
                self.define_local(param, arg);
            }
        }
    }

    /// Seeds top-level variables from a JSON object.
    pub fn bind_object(&mut self, vars: &serde_json::Value) {
        if let serde_json::Value::Object(map) = vars {
            for (k, v) in map {
                self.define_local(k, JsonValue::from(v));
            }
        }
    }
}

fn path_error(slot: &JsonValue, step: &Step) -> EvalError {
    let what = match step {
        Step::Member(name) => format!("member '{}'", name),
        Step::Index(i) => format!("index {}", operators::stringify(i)),
    };
    EvalError::incorrect_types(format!(
        "cannot write {} of {}",
        what,
        slot.json_type()
    ))
}

fn descend<'a>(slot: &'a mut JsonValue, step: &Step) -> Result<&'a mut JsonValue, EvalError> {
    let error = path_error(slot, step);
    match (slot, step) {
        (JsonValue::Object(rc), Step::Member(name)) => {
            Rc::make_mut(rc).get_mut(name).ok_or(error)
        }
        (JsonValue::Object(rc), Step::Index(key)) => Rc::make_mut(rc)
            .get_mut(&operators::stringify(key))
            .ok_or(error),
        (JsonValue::Array(rc), Step::Index(i)) if i.is_number() => {
            let len = rc.len();
            match operators::array_index(len, i) {
                Some(pos) => Ok(&mut Rc::make_mut(rc)[pos]),
                None => Err(error),
            }
        }
        _ => Err(error),
    }
}

fn write_step(slot: &mut JsonValue, step: &Step, value: JsonValue) -> Result<(), EvalError> {
    let error = path_error(slot, step);
    match (slot, step) {
        (JsonValue::Object(rc), Step::Member(name)) => {
            Rc::make_mut(rc).insert(name.clone(), value);
            Ok(())
        }
        (JsonValue::Object(rc), Step::Index(key)) => {
            Rc::make_mut(rc).insert(operators::stringify(key), value);
            Ok(())
        }
        (JsonValue::Array(rc), Step::Index(i)) if i.is_number() => {
            let len = rc.len();
            match operators::array_index(len, i) {
                Some(pos) => {
                    Rc::make_mut(rc)[pos] = value;
                    Ok(())
                }
                None => Err(error),
            }
        }
        _ => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;
    use serde_json::json;

    #[test]
    fn test_set_writes_nearest_owner() {
        let mut ctx = TemplateContext::new();
        ctx.set_var("x", JsonValue::Int(1));
        ctx.push_partial_layer("frame");
        ctx.set_var("x", JsonValue::Int(2));
        ctx.set_var("y", JsonValue::Int(3));
        ctx.pop_layer();
        // x was owned by the root layer, y was created in the frame.
        assert_eq!(ctx.get_var("x").unwrap(), JsonValue::Int(2));
        assert!(ctx.get_var("y").is_err());
    }

    #[test]
    fn test_define_local_shadows() {
        let mut ctx = TemplateContext::new();
        ctx.set_var("x", JsonValue::Int(1));
        ctx.push_partial_layer("frame");
        ctx.define_local("x", JsonValue::Int(9));
        assert_eq!(ctx.get_var("x").unwrap(), JsonValue::Int(9));
        ctx.pop_layer();
        assert_eq!(ctx.get_var("x").unwrap(), JsonValue::Int(1));
    }

    #[test]
    fn test_popped_layers_are_reclaimed() {
        let mut ctx = TemplateContext::new();
        for _ in 0..10_000 {
            ctx.push_partial_layer("frame");
            ctx.pop_layer();
        }
        assert_eq!(ctx.layers.len(), 1);
    }

    #[test]
    fn test_underscore_outside_construction_errors() {
        let mut ctx = TemplateContext::new();
        let err = ctx.underscore().unwrap_err();
        assert_eq!(err.exception, ExceptionType::NoScopeInRoot);
    }

    #[test]
    fn test_error_hook_substitutes_value() {
        let mut ctx = TemplateContext::new();
        ctx.set_error_hook(Box::new(|ty, _msg| JsonValue::string(ty.name())));
        assert_eq!(
            ctx.get_var("missing").unwrap(),
            JsonValue::string("undefined_variable")
        );
    }

    #[test]
    fn test_function_overloads_by_arity() {
        let mut ctx = TemplateContext::new();
        ctx.define_function(Rc::new(FunctionDefinition {
            name: "f".into(),
            params: vec!["a".into()],
            vararg: false,
            body: FunctionBody::Expr(Expression::Variable("a".into())),
        }))
        .unwrap();
        ctx.define_function(Rc::new(FunctionDefinition {
            name: "f".into(),
            params: vec!["a".into(), "rest".into()],
            vararg: true,
            body: FunctionBody::Expr(Expression::Variable("rest".into())),
        }))
        .unwrap();
        assert_eq!(
            ctx.call_function("f", vec![JsonValue::Int(7)]).unwrap(),
            JsonValue::Int(7)
        );
        let rest = ctx
            .call_function(
                "f",
                vec![JsonValue::Int(1), JsonValue::Int(2), JsonValue::Int(3)],
            )
            .unwrap();
        assert_eq!(rest, JsonValue::from(json!([2, 3])));
    }

    #[test]
    fn test_function_sees_defining_scope_not_caller() {
        let mut ctx = TemplateContext::new();
        ctx.set_var("bound", JsonValue::string("outer"));
        ctx.define_function(Rc::new(FunctionDefinition {
            name: "f".into(),
            params: vec![],
            vararg: false,
            body: FunctionBody::Expr(Expression::Variable("bound".into())),
        }))
        .unwrap();
        ctx.push_subtemplate_layer("inner");
        ctx.define_local("bound", JsonValue::string("caller"));
        assert_eq!(
            ctx.call_function("f", vec![]).unwrap(),
            JsonValue::string("outer")
        );
        ctx.pop_layer();
    }

    #[test]
    fn test_define_after_use_is_rejected() {
        let mut ctx = TemplateContext::new();
        ctx.define_function(Rc::new(FunctionDefinition {
            name: "f".into(),
            params: vec![],
            vararg: false,
            body: FunctionBody::Expr(Expression::Literal(JsonValue::Int(1))),
        }))
        .unwrap();
        ctx.call_function("f", vec![]).unwrap();
        let err = ctx
            .define_function(Rc::new(FunctionDefinition {
                name: "g".into(),
                params: vec![],
                vararg: false,
                body: FunctionBody::Expr(Expression::Literal(JsonValue::Int(2))),
            }))
            .unwrap_err();
        assert_eq!(err.exception, ExceptionType::ExecutionException);
    }

    #[test]
    fn test_recursion_limit() {
        let mut ctx = TemplateContext::new();
        ctx.define_function(Rc::new(FunctionDefinition {
            name: "loop_forever".into(),
            params: vec![],
            vararg: false,
            body: FunctionBody::Expr(Expression::Call {
                function: "loop_forever".into(),
                args: vec![],
            }),
        }))
        .unwrap();
        let err = ctx.call_function("loop_forever", vec![]).unwrap_err();
        assert_eq!(err.exception, ExceptionType::RecursionLimit);
    }

    #[test]
    fn test_param_mismatch() {
        let mut ctx = TemplateContext::new();
        ctx.define_function(Rc::new(FunctionDefinition {
            name: "f".into(),
            params: vec!["a".into()],
            vararg: false,
            body: FunctionBody::Expr(Expression::Variable("a".into())),
        }))
        .unwrap();
        let err = ctx.call_function("f", vec![]).unwrap_err();
        assert_eq!(err.exception, ExceptionType::FunctionParamMismatch);
    }
}
