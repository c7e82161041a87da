//! Tree-walking evaluator over the swc AST.
//!
//! Evaluation functions take the whole [`Runtime`] rather than the VM so that
//! native bindings reached from script can use the handle registry and the
//! event loop. Statement boundaries are collection safe points.

use std::rc::Rc;

use swc_common::{DUMMY_SP, Span, Spanned};
use swc_ecma_ast::*;

use super::value::{
    Callable, Closure, FunctionBody, FunctionCode, JsObject, JsValue, ObjectData, ObjectKind, Scope,
    ScopeData, number_to_string,
};
use super::{Abrupt, CompiledScript, ErrorKind, Frame};
use crate::runtime::Runtime;

type Eval<T> = Result<T, Abrupt>;

enum Completion {
    Normal,
    Return(JsValue),
    Break(Option<String>),
    Continue(Option<String>),
}

/// What a loop does after its body completed.
enum Flow {
    Next,
    Exit(Completion),
}

fn loop_flow(completion: Completion, label: Option<&str>) -> Flow {
    match completion {
        Completion::Normal | Completion::Continue(None) => Flow::Next,
        Completion::Continue(Some(l)) if Some(l.as_str()) == label => Flow::Next,
        Completion::Break(None) => Flow::Exit(Completion::Normal),
        Completion::Break(Some(l)) if Some(l.as_str()) == label => Flow::Exit(Completion::Normal),
        other => Flow::Exit(other),
    }
}

#[derive(Clone)]
struct Env {
    /// Innermost scope; `None` means the global object.
    scope: Option<Scope>,
    this: JsValue,
}

impl Env {
    fn block(&self) -> Env {
        Env {
            scope: Some(ScopeData::child(self.scope.clone())),
            this: self.this.clone(),
        }
    }
}

/// Run the top-level code of a compiled unit. Returns the value of the last
/// expression statement.
pub fn run_script(rt: &mut Runtime, script: &CompiledScript) -> Result<JsValue, Abrupt> {
    let env = Env {
        scope: None,
        this: JsValue::Object(rt.vm.global().clone()),
    };
    rt.vm.frames.push(Frame {
        function: Rc::from(""),
        call_site: DUMMY_SP,
    });
    let result = run_top_level(rt, &env, &script.script().body);
    rt.vm.frames.pop();
    result
}

fn run_top_level(rt: &mut Runtime, env: &Env, body: &[Stmt]) -> Eval<JsValue> {
    hoist_functions(rt, env, body)?;
    let mut last = JsValue::Undefined;
    for stmt in body {
        if let Stmt::Expr(expr_stmt) = stmt {
            safe_point(rt);
            last = eval(rt, env, &expr_stmt.expr)?;
            continue;
        }
        exec_stmt(rt, env, stmt)?;
    }
    Ok(last)
}

/// Call `func` from native code.
pub fn call_function(
    rt: &mut Runtime,
    func: &JsValue,
    this: JsValue,
    args: Vec<JsValue>,
) -> Result<JsValue, Abrupt> {
    call_value(rt, func, this, args, DUMMY_SP)
}

fn safe_point(rt: &mut Runtime) {
    if rt.vm.gc_requested() {
        rt.collect_garbage();
    }
}

fn throw_at(rt: &Runtime, span: Span, kind: ErrorKind, message: impl AsRef<str>) -> Abrupt {
    let error = rt.vm.new_error(kind, message);
    Abrupt::throw(JsValue::Object(error), span, rt.vm.capture_stack(span))
}

fn unsupported(rt: &Runtime, span: Span, what: &str) -> Abrupt {
    throw_at(rt, span, ErrorKind::SyntaxError, format!("Unsupported {}", what))
}

/// Attach the call site to exceptions raised by native code.
fn locate_abrupt(rt: &Runtime, abrupt: Abrupt, span: Span) -> Abrupt {
    match abrupt {
        Abrupt::Throw(mut exception) if exception.span.is_dummy() && !span.is_dummy() => {
            exception.span = span;
            exception.stack = rt.vm.capture_stack(span);
            Abrupt::Throw(exception)
        }
        other => other,
    }
}

// Bindings

fn lookup(rt: &Runtime, env: &Env, name: &str) -> Option<JsValue> {
    let mut scope = env.scope.clone();
    while let Some(current) = scope {
        if let Some(value) = current.borrow().vars.get(name) {
            return Some(value.clone());
        }
        scope = current.borrow().parent.clone();
    }
    rt.vm.global().get_own(name)
}

fn assign_binding(rt: &Runtime, env: &Env, name: &str, value: JsValue) {
    let mut scope = env.scope.clone();
    while let Some(current) = scope {
        if let Some(slot) = current.borrow_mut().vars.get_mut(name) {
            *slot = value;
            return;
        }
        scope = current.borrow().parent.clone();
    }
    rt.vm.global().set(name, value);
}

fn declare_lexical(rt: &Runtime, env: &Env, name: &str, value: JsValue) {
    match &env.scope {
        Some(scope) => {
            scope.borrow_mut().vars.insert(name.to_string(), value);
        }
        None => rt.vm.global().set(name, value),
    }
}

/// `var` bindings live in the nearest function scope.
fn declare_var(rt: &Runtime, env: &Env, name: &str, value: Option<JsValue>) {
    let mut scope = env.scope.clone();
    while let Some(current) = scope {
        if current.borrow().function {
            let mut data = current.borrow_mut();
            match value {
                Some(value) => {
                    data.vars.insert(name.to_string(), value);
                }
                None => {
                    data.vars.entry(name.to_string()).or_default();
                }
            }
            return;
        }
        scope = current.borrow().parent.clone();
    }
    let global = rt.vm.global();
    match value {
        Some(value) => global.set(name, value),
        None if global.get_own(name).is_none() => global.set(name, JsValue::Undefined),
        None => {}
    }
}

// Statements

fn hoist_functions(rt: &mut Runtime, env: &Env, stmts: &[Stmt]) -> Eval<()> {
    for stmt in stmts {
        if let Stmt::Decl(Decl::Fn(decl)) = stmt {
            let func = make_function(rt, env, &decl.ident.sym, &decl.function)?;
            declare_lexical(rt, env, &decl.ident.sym, func);
        }
    }
    Ok(())
}

fn exec_block(rt: &mut Runtime, env: &Env, stmts: &[Stmt]) -> Eval<Completion> {
    let env = env.block();
    hoist_functions(rt, &env, stmts)?;
    exec_stmts(rt, &env, stmts)
}

fn exec_stmts(rt: &mut Runtime, env: &Env, stmts: &[Stmt]) -> Eval<Completion> {
    for stmt in stmts {
        match exec_stmt(rt, env, stmt)? {
            Completion::Normal => {}
            other => return Ok(other),
        }
    }
    Ok(Completion::Normal)
}

fn exec_stmt(rt: &mut Runtime, env: &Env, stmt: &Stmt) -> Eval<Completion> {
    safe_point(rt);

    match stmt {
        Stmt::Expr(s) => {
            eval(rt, env, &s.expr)?;
            Ok(Completion::Normal)
        }
        Stmt::Decl(Decl::Var(decl)) => {
            declare_vars(rt, env, decl)?;
            Ok(Completion::Normal)
        }
        // hoisted on block entry
        Stmt::Decl(Decl::Fn(_)) => Ok(Completion::Normal),
        Stmt::Block(block) => exec_block(rt, env, &block.stmts),
        Stmt::Empty(_) => Ok(Completion::Normal),
        Stmt::Return(s) => {
            let value = match &s.arg {
                Some(arg) => eval(rt, env, arg)?,
                None => JsValue::Undefined,
            };
            Ok(Completion::Return(value))
        }
        Stmt::If(s) => {
            if eval(rt, env, &s.test)?.truthy() {
                exec_stmt(rt, env, &s.cons)
            } else if let Some(alt) = &s.alt {
                exec_stmt(rt, env, alt)
            } else {
                Ok(Completion::Normal)
            }
        }
        Stmt::While(_) | Stmt::DoWhile(_) | Stmt::For(_) => exec_loop(rt, env, stmt, None),
        Stmt::Labeled(s) => {
            let label = s.label.sym.to_string();
            let completion = match &*s.body {
                body @ (Stmt::While(_) | Stmt::DoWhile(_) | Stmt::For(_)) => {
                    exec_loop(rt, env, body, Some(&label))?
                }
                body => exec_stmt(rt, env, body)?,
            };
            match completion {
                Completion::Break(Some(l)) if l == label => Ok(Completion::Normal),
                other => Ok(other),
            }
        }
        Stmt::Break(s) => Ok(Completion::Break(s.label.as_ref().map(|l| l.sym.to_string()))),
        Stmt::Continue(s) => Ok(Completion::Continue(s.label.as_ref().map(|l| l.sym.to_string()))),
        Stmt::Throw(s) => {
            let value = eval(rt, env, &s.arg)?;
            Err(Abrupt::throw(value, s.span, rt.vm.capture_stack(s.span)))
        }
        Stmt::Try(s) => exec_try(rt, env, s),
        Stmt::Switch(s) => exec_switch(rt, env, s),
        other => Err(unsupported(rt, other.span(), "statement")),
    }
}

fn declare_vars(rt: &mut Runtime, env: &Env, decl: &VarDecl) -> Eval<()> {
    for declarator in &decl.decls {
        let Pat::Ident(binding) = &declarator.name else {
            return Err(unsupported(rt, declarator.span, "binding pattern"));
        };
        let name = &*binding.id.sym;
        let value = match &declarator.init {
            Some(init) => Some(eval_named(rt, env, init, name)?),
            None => None,
        };
        match decl.kind {
            VarDeclKind::Var => declare_var(rt, env, name, value),
            VarDeclKind::Let | VarDeclKind::Const => {
                declare_lexical(rt, env, name, value.unwrap_or_default())
            }
        }
    }
    Ok(())
}

fn exec_loop(rt: &mut Runtime, env: &Env, stmt: &Stmt, label: Option<&str>) -> Eval<Completion> {
    match stmt {
        Stmt::While(s) => {
            while eval(rt, env, &s.test)?.truthy() {
                if let Flow::Exit(c) = loop_flow(exec_stmt(rt, env, &s.body)?, label) {
                    return Ok(c);
                }
            }
            Ok(Completion::Normal)
        }
        Stmt::DoWhile(s) => {
            loop {
                if let Flow::Exit(c) = loop_flow(exec_stmt(rt, env, &s.body)?, label) {
                    return Ok(c);
                }
                if !eval(rt, env, &s.test)?.truthy() {
                    return Ok(Completion::Normal);
                }
            }
        }
        Stmt::For(s) => exec_for(rt, env, s, label),
        other => exec_stmt(rt, env, other),
    }
}

fn exec_for(rt: &mut Runtime, env: &Env, s: &ForStmt, label: Option<&str>) -> Eval<Completion> {
    let mut env = env.block();
    let per_iteration = match &s.init {
        Some(VarDeclOrExpr::VarDecl(decl)) => {
            declare_vars(rt, &env, decl)?;
            decl.kind != VarDeclKind::Var
        }
        Some(VarDeclOrExpr::Expr(expr)) => {
            eval(rt, &env, expr)?;
            false
        }
        None => false,
    };

    loop {
        if let Some(test) = &s.test
            && !eval(rt, &env, test)?.truthy()
        {
            return Ok(Completion::Normal);
        }
        if let Flow::Exit(c) = loop_flow(exec_stmt(rt, &env, &s.body)?, label) {
            return Ok(c);
        }
        if per_iteration {
            // Closures created in the body keep this iteration's bindings.
            env = copy_scope(&env);
        }
        if let Some(update) = &s.update {
            eval(rt, &env, update)?;
        }
    }
}

fn copy_scope(env: &Env) -> Env {
    let Some(scope) = &env.scope else {
        return env.clone();
    };
    let data = scope.borrow();
    let copy = ScopeData::child(data.parent.clone());
    copy.borrow_mut().vars = data.vars.clone();
    Env {
        scope: Some(copy),
        this: env.this.clone(),
    }
}

fn exec_try(rt: &mut Runtime, env: &Env, s: &TryStmt) -> Eval<Completion> {
    let result = match (exec_block(rt, env, &s.block.stmts), &s.handler) {
        (Err(Abrupt::Throw(exception)), Some(handler)) => {
            let env = env.block();
            if let Some(param) = &handler.param {
                let Pat::Ident(binding) = param else {
                    return Err(unsupported(rt, handler.span, "catch binding"));
                };
                declare_lexical(rt, &env, &binding.id.sym, exception.value);
            }
            hoist_functions(rt, &env, &handler.body.stmts)?;
            exec_stmts(rt, &env, &handler.body.stmts)
        }
        (result, _) => result,
    };

    let Some(finalizer) = &s.finalizer else {
        return result;
    };
    // Termination skips finally blocks.
    if matches!(result, Err(Abrupt::Exit(_))) {
        return result;
    }
    match exec_block(rt, env, &finalizer.stmts)? {
        Completion::Normal => result,
        other => Ok(other),
    }
}

fn exec_switch(rt: &mut Runtime, env: &Env, s: &SwitchStmt) -> Eval<Completion> {
    let discriminant = eval(rt, env, &s.discriminant)?;
    let env = env.block();

    let mut start = None;
    for (i, case) in s.cases.iter().enumerate() {
        if let Some(test) = &case.test
            && eval(rt, &env, test)?.strict_equals(&discriminant)
        {
            start = Some(i);
            break;
        }
    }
    let Some(start) = start.or_else(|| s.cases.iter().position(|c| c.test.is_none())) else {
        return Ok(Completion::Normal);
    };

    for case in &s.cases[start..] {
        hoist_functions(rt, &env, &case.cons)?;
        match exec_stmts(rt, &env, &case.cons)? {
            Completion::Normal => {}
            Completion::Break(None) => return Ok(Completion::Normal),
            other => return Ok(other),
        }
    }
    Ok(Completion::Normal)
}

// Functions

fn param_names<'a>(rt: &Runtime, params: impl Iterator<Item = &'a Pat>) -> Eval<Vec<String>> {
    params
        .map(|pat| match pat {
            Pat::Ident(binding) => Ok(binding.id.sym.to_string()),
            other => Err(unsupported(rt, other.span(), "parameter pattern")),
        })
        .collect()
}

fn make_function(rt: &mut Runtime, env: &Env, name: &str, function: &Function) -> Eval<JsValue> {
    let Some(body) = &function.body else {
        return Err(unsupported(rt, function.span, "function without body"));
    };
    if function.is_async || function.is_generator {
        return Err(unsupported(rt, function.span, "async or generator function"));
    }
    let params = param_names(rt, function.params.iter().map(|p| &p.pat))?;
    let code = rt.vm.function_code(function.span, || FunctionCode {
        name: name.to_string(),
        params,
        body: FunctionBody::Block(body.clone()),
        is_arrow: false,
        span: function.span,
    });
    let closure = Closure {
        code,
        scope: env.scope.clone(),
        lexical_this: None,
    };
    let func = rt.vm.new_function(Callable::Script(Rc::new(closure)));
    // No `constructor` back-link: with counted references it would pin the
    // function and its whole scope chain.
    func.set("prototype", JsValue::Object(rt.vm.new_object()));
    Ok(JsValue::Object(func))
}

fn make_arrow(rt: &mut Runtime, env: &Env, name: &str, arrow: &ArrowExpr) -> Eval<JsValue> {
    if arrow.is_async || arrow.is_generator {
        return Err(unsupported(rt, arrow.span, "async arrow function"));
    }
    let params = param_names(rt, arrow.params.iter())?;
    let code = rt.vm.function_code(arrow.span, || FunctionCode {
        name: name.to_string(),
        params,
        body: match &*arrow.body {
            BlockStmtOrExpr::BlockStmt(block) => FunctionBody::Block(block.clone()),
            BlockStmtOrExpr::Expr(expr) => FunctionBody::Expr(expr.clone()),
        },
        is_arrow: true,
        span: arrow.span,
    });
    let closure = Closure {
        code,
        scope: env.scope.clone(),
        lexical_this: Some(env.this.clone()),
    };
    Ok(JsValue::Object(rt.vm.new_function(Callable::Script(Rc::new(closure)))))
}

/// Evaluate `expr`, naming anonymous function literals after their binding.
fn eval_named(rt: &mut Runtime, env: &Env, expr: &Expr, name: &str) -> Eval<JsValue> {
    match expr {
        Expr::Fn(f) if f.ident.is_none() => make_function(rt, env, name, &f.function),
        Expr::Arrow(arrow) => make_arrow(rt, env, name, arrow),
        other => eval(rt, env, other),
    }
}

fn call_value(
    rt: &mut Runtime,
    func: &JsValue,
    this: JsValue,
    args: Vec<JsValue>,
    call_site: Span,
) -> Eval<JsValue> {
    let Some(callable) = func.as_object().and_then(|f| f.callable()) else {
        return Err(throw_at(
            rt,
            call_site,
            ErrorKind::TypeError,
            format!("{} is not a function", func.type_of()),
        ));
    };
    match callable {
        Callable::Native(native) => {
            (native.func)(rt, &this, args).map_err(|e| locate_abrupt(rt, e, call_site))
        }
        Callable::Script(closure) => call_closure(rt, &closure, this, args, call_site),
    }
}

fn call_closure(
    rt: &mut Runtime,
    closure: &Rc<Closure>,
    this: JsValue,
    args: Vec<JsValue>,
    call_site: Span,
) -> Eval<JsValue> {
    if rt.vm.frames.len() >= rt.vm.max_call_depth {
        return Err(throw_at(
            rt,
            call_site,
            ErrorKind::RangeError,
            "Maximum call stack size exceeded",
        ));
    }

    let code = closure.code.clone();
    let scope = ScopeData::function(closure.scope.clone());
    {
        let mut data = scope.borrow_mut();
        for (i, name) in code.params.iter().enumerate() {
            data.vars.insert(name.clone(), args.get(i).cloned().unwrap_or_default());
        }
    }
    if !code.is_arrow {
        let arguments = rt.vm.new_array(args);
        scope
            .borrow_mut()
            .vars
            .insert("arguments".to_string(), JsValue::Object(arguments));
    }

    let env = Env {
        scope: Some(scope),
        this: match &closure.lexical_this {
            Some(lexical) => lexical.clone(),
            None => this,
        },
    };

    rt.vm.frames.push(Frame {
        function: Rc::from(code.name.as_str()),
        call_site,
    });
    let result = match &code.body {
        FunctionBody::Block(block) => run_function_body(rt, &env, &block.stmts),
        FunctionBody::Expr(expr) => eval(rt, &env, expr),
    };
    rt.vm.frames.pop();
    result
}

fn run_function_body(rt: &mut Runtime, env: &Env, stmts: &[Stmt]) -> Eval<JsValue> {
    hoist_functions(rt, env, stmts)?;
    match exec_stmts(rt, env, stmts)? {
        Completion::Return(value) => Ok(value),
        _ => Ok(JsValue::Undefined),
    }
}

/// `new ctor(...args)`.
pub fn construct(
    rt: &mut Runtime,
    ctor: &JsValue,
    args: Vec<JsValue>,
    call_site: Span,
) -> Result<JsValue, Abrupt> {
    let not_constructor = |rt: &Runtime| {
        throw_at(
            rt,
            call_site,
            ErrorKind::TypeError,
            format!("{} is not a constructor", ctor.type_of()),
        )
    };
    let Some(ctor_obj) = ctor.as_object() else {
        return Err(not_constructor(rt));
    };
    let Some(callable) = ctor_obj.callable() else {
        return Err(not_constructor(rt));
    };

    let proto = match ctor_obj.get("prototype") {
        JsValue::Object(proto) => proto,
        _ => {
            let proto = rt.vm.new_object();
            ctor_obj.set("prototype", JsValue::Object(proto.clone()));
            proto
        }
    };
    let mut data = ObjectData::new(ObjectKind::Plain, Some(proto));
    if let Callable::Native(native) = &callable {
        data.internal_fields = vec![None; native.internal_fields];
    }
    let this = JsValue::Object(JsObject::new(data));

    let result = match callable {
        Callable::Native(native) => {
            (native.func)(rt, &this, args).map_err(|e| locate_abrupt(rt, e, call_site))?
        }
        Callable::Script(closure) if closure.code.is_arrow => return Err(not_constructor(rt)),
        Callable::Script(closure) => call_closure(rt, &closure, this.clone(), args, call_site)?,
    };
    Ok(match result {
        JsValue::Object(_) => result,
        _ => this,
    })
}

// Expressions

fn eval(rt: &mut Runtime, env: &Env, expr: &Expr) -> Eval<JsValue> {
    match expr {
        Expr::Lit(lit) => literal(rt, lit),
        Expr::Ident(id) => match lookup(rt, env, &id.sym) {
            Some(value) => Ok(value),
            None => Err(throw_at(
                rt,
                id.span,
                ErrorKind::ReferenceError,
                format!("{} is not defined", id.sym),
            )),
        },
        Expr::This(_) => Ok(env.this.clone()),
        Expr::Paren(p) => eval(rt, env, &p.expr),
        Expr::Array(array) => {
            let mut items = Vec::with_capacity(array.elems.len());
            for elem in &array.elems {
                match elem {
                    None => items.push(JsValue::Undefined),
                    Some(e) if e.spread.is_some() => {
                        let value = eval(rt, env, &e.expr)?;
                        items.extend(spread_items(rt, &value, e.expr.span())?);
                    }
                    Some(e) => items.push(eval(rt, env, &e.expr)?),
                }
            }
            Ok(JsValue::Object(rt.vm.new_array(items)))
        }
        Expr::Object(object) => object_literal(rt, env, object),
        Expr::Fn(f) => {
            let name = f.ident.as_ref().map_or("", |id| &*id.sym);
            make_function(rt, env, name, &f.function)
        }
        Expr::Arrow(arrow) => make_arrow(rt, env, "", arrow),
        Expr::Unary(u) => unary(rt, env, u),
        Expr::Update(u) => {
            let target = reference(rt, env, &u.arg)?;
            let old = get_reference(rt, env, &target)?.to_number();
            let new = match u.op {
                UpdateOp::PlusPlus => old + 1.0,
                UpdateOp::MinusMinus => old - 1.0,
            };
            put_reference(rt, env, &target, JsValue::Number(new))?;
            Ok(JsValue::Number(if u.prefix { new } else { old }))
        }
        Expr::Bin(b) => match b.op {
            BinaryOp::LogicalAnd => {
                let left = eval(rt, env, &b.left)?;
                if left.truthy() { eval(rt, env, &b.right) } else { Ok(left) }
            }
            BinaryOp::LogicalOr => {
                let left = eval(rt, env, &b.left)?;
                if left.truthy() { Ok(left) } else { eval(rt, env, &b.right) }
            }
            BinaryOp::NullishCoalescing => {
                let left = eval(rt, env, &b.left)?;
                if left.is_nullish() { eval(rt, env, &b.right) } else { Ok(left) }
            }
            op => {
                let left = eval(rt, env, &b.left)?;
                let right = eval(rt, env, &b.right)?;
                binary(rt, op, &left, &right, b.span)
            }
        },
        Expr::Assign(a) => assign(rt, env, a),
        Expr::Member(m) => {
            let object = eval(rt, env, &m.obj)?;
            let key = member_key(rt, env, &m.prop)?;
            get_property(rt, &object, &key, m.span)
        }
        Expr::Cond(c) => {
            if eval(rt, env, &c.test)?.truthy() {
                eval(rt, env, &c.cons)
            } else {
                eval(rt, env, &c.alt)
            }
        }
        Expr::Call(call) => call_expr(rt, env, call),
        Expr::New(n) => {
            let ctor = eval(rt, env, &n.callee)?;
            let args = match &n.args {
                Some(args) => eval_args(rt, env, args)?,
                None => Vec::new(),
            };
            construct(rt, &ctor, args, n.span)
        }
        Expr::Seq(seq) => {
            let mut last = JsValue::Undefined;
            for e in &seq.exprs {
                last = eval(rt, env, e)?;
            }
            Ok(last)
        }
        Expr::Tpl(tpl) => {
            let mut out = String::new();
            for (i, quasi) in tpl.quasis.iter().enumerate() {
                out.push_str(&unescape_template(&quasi.raw));
                if let Some(e) = tpl.exprs.get(i) {
                    out.push_str(&eval(rt, env, e)?.to_js_string());
                }
            }
            Ok(JsValue::from(out))
        }
        other => Err(unsupported(rt, other.span(), "expression")),
    }
}

fn literal(rt: &Runtime, lit: &Lit) -> Eval<JsValue> {
    match lit {
        Lit::Str(s) => Ok(JsValue::string(s.value.to_string_lossy())),
        Lit::Num(n) => Ok(JsValue::Number(n.value)),
        Lit::Bool(b) => Ok(JsValue::Boolean(b.value)),
        Lit::Null(_) => Ok(JsValue::Null),
        other => Err(unsupported(rt, other.span(), "literal")),
    }
}

fn unescape_template(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn spread_items(rt: &Runtime, value: &JsValue, span: Span) -> Eval<Vec<JsValue>> {
    if let Some(object) = value.as_object()
        && let ObjectKind::Array(items) = &object.borrow().kind
    {
        return Ok(items.clone());
    }
    Err(throw_at(rt, span, ErrorKind::TypeError, "spread argument is not an array"))
}

fn eval_args(rt: &mut Runtime, env: &Env, args: &[ExprOrSpread]) -> Eval<Vec<JsValue>> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        let value = eval(rt, env, &arg.expr)?;
        if arg.spread.is_some() {
            values.extend(spread_items(rt, &value, arg.expr.span())?);
        } else {
            values.push(value);
        }
    }
    Ok(values)
}

fn prop_name(rt: &mut Runtime, env: &Env, key: &PropName) -> Eval<String> {
    match key {
        PropName::Ident(id) => Ok(id.sym.to_string()),
        PropName::Str(s) => Ok(s.value.to_string_lossy().into_owned()),
        PropName::Num(n) => Ok(number_to_string(n.value)),
        PropName::Computed(c) => Ok(eval(rt, env, &c.expr)?.to_js_string()),
        other => Err(unsupported(rt, other.span(), "property name")),
    }
}

fn object_literal(rt: &mut Runtime, env: &Env, literal: &ObjectLit) -> Eval<JsValue> {
    let object = rt.vm.new_object();
    for prop in &literal.props {
        match prop {
            PropOrSpread::Spread(spread) => {
                let source = eval(rt, env, &spread.expr)?;
                if let Some(source) = source.as_object() {
                    for key in source.keys() {
                        object.set(&key, source.get(&key));
                    }
                }
            }
            PropOrSpread::Prop(prop) => match &**prop {
                Prop::KeyValue(kv) => {
                    let key = prop_name(rt, env, &kv.key)?;
                    let value = eval_named(rt, env, &kv.value, &key)?;
                    object.set(&key, value);
                }
                Prop::Shorthand(id) => {
                    let value = eval(rt, env, &Expr::Ident(id.clone()))?;
                    object.set(&id.sym, value);
                }
                Prop::Method(method) => {
                    let key = prop_name(rt, env, &method.key)?;
                    let value = make_function(rt, env, &key, &method.function)?;
                    object.set(&key, value);
                }
                other => return Err(unsupported(rt, other.span(), "property kind")),
            },
        }
    }
    Ok(JsValue::Object(object))
}

fn member_key(rt: &mut Runtime, env: &Env, prop: &MemberProp) -> Eval<String> {
    match prop {
        MemberProp::Ident(id) => Ok(id.sym.to_string()),
        MemberProp::Computed(c) => Ok(eval(rt, env, &c.expr)?.to_js_string()),
        MemberProp::PrivateName(p) => Err(unsupported(rt, p.span, "private name")),
    }
}

fn get_property(rt: &Runtime, base: &JsValue, key: &str, span: Span) -> Eval<JsValue> {
    match base {
        JsValue::Object(object) => Ok(object.get(key)),
        JsValue::String(s) => {
            if key == "length" {
                return Ok(JsValue::Number(s.chars().count() as f64));
            }
            if let Ok(index) = key.parse::<usize>() {
                return Ok(s
                    .chars()
                    .nth(index)
                    .map_or(JsValue::Undefined, |c| JsValue::from(c.to_string())));
            }
            Ok(rt.vm.realm().string_proto.get(key))
        }
        JsValue::Undefined | JsValue::Null => Err(throw_at(
            rt,
            span,
            ErrorKind::TypeError,
            format!("Cannot read properties of {} (reading '{}')", base.to_js_string(), key),
        )),
        JsValue::Number(_) | JsValue::Boolean(_) => Ok(rt.vm.realm().object_proto.get(key)),
    }
}

fn set_property(rt: &Runtime, base: &JsValue, key: &str, value: JsValue, span: Span) -> Eval<()> {
    match base {
        JsValue::Object(object) => {
            object.set(key, value);
            Ok(())
        }
        JsValue::Undefined | JsValue::Null => Err(throw_at(
            rt,
            span,
            ErrorKind::TypeError,
            format!("Cannot set properties of {} (setting '{}')", base.to_js_string(), key),
        )),
        // primitives silently drop writes
        _ => Ok(()),
    }
}

/// Assignment target.
enum Reference {
    Binding(String, Span),
    Property(JsValue, String, Span),
}

fn reference(rt: &mut Runtime, env: &Env, expr: &Expr) -> Eval<Reference> {
    match expr {
        Expr::Ident(id) => Ok(Reference::Binding(id.sym.to_string(), id.span)),
        Expr::Member(m) => member_reference(rt, env, m),
        Expr::Paren(p) => reference(rt, env, &p.expr),
        other => Err(throw_at(
            rt,
            other.span(),
            ErrorKind::SyntaxError,
            "Invalid left-hand side in assignment",
        )),
    }
}

fn member_reference(rt: &mut Runtime, env: &Env, m: &MemberExpr) -> Eval<Reference> {
    let object = eval(rt, env, &m.obj)?;
    let key = member_key(rt, env, &m.prop)?;
    Ok(Reference::Property(object, key, m.span))
}

fn get_reference(rt: &Runtime, env: &Env, target: &Reference) -> Eval<JsValue> {
    match target {
        Reference::Binding(name, span) => lookup(rt, env, name).ok_or_else(|| {
            throw_at(rt, *span, ErrorKind::ReferenceError, format!("{} is not defined", name))
        }),
        Reference::Property(object, key, span) => get_property(rt, object, key, *span),
    }
}

fn put_reference(rt: &Runtime, env: &Env, target: &Reference, value: JsValue) -> Eval<()> {
    match target {
        Reference::Binding(name, _) => {
            assign_binding(rt, env, name, value);
            Ok(())
        }
        Reference::Property(object, key, span) => set_property(rt, object, key, value, *span),
    }
}

fn assign(rt: &mut Runtime, env: &Env, a: &AssignExpr) -> Eval<JsValue> {
    let target = match &a.left {
        AssignTarget::Simple(SimpleAssignTarget::Ident(binding)) => {
            Reference::Binding(binding.id.sym.to_string(), binding.id.span)
        }
        AssignTarget::Simple(SimpleAssignTarget::Member(m)) => member_reference(rt, env, m)?,
        AssignTarget::Simple(SimpleAssignTarget::Paren(p)) => reference(rt, env, &p.expr)?,
        other => return Err(unsupported(rt, other.span(), "assignment target")),
    };

    let value = match a.op {
        AssignOp::Assign => {
            let name = match &target {
                Reference::Binding(name, _) | Reference::Property(_, name, _) => name.clone(),
            };
            eval_named(rt, env, &a.right, &name)?
        }
        AssignOp::AndAssign | AssignOp::OrAssign | AssignOp::NullishAssign => {
            let current = get_reference(rt, env, &target)?;
            let keep = match a.op {
                AssignOp::AndAssign => !current.truthy(),
                AssignOp::OrAssign => current.truthy(),
                _ => !current.is_nullish(),
            };
            if keep {
                return Ok(current);
            }
            eval(rt, env, &a.right)?
        }
        op => {
            let Some(bin) = compound_operator(op) else {
                return Err(unsupported(rt, a.span, "assignment operator"));
            };
            let current = get_reference(rt, env, &target)?;
            let right = eval(rt, env, &a.right)?;
            binary(rt, bin, &current, &right, a.span)?
        }
    };
    put_reference(rt, env, &target, value.clone())?;
    Ok(value)
}

fn compound_operator(op: AssignOp) -> Option<BinaryOp> {
    Some(match op {
        AssignOp::AddAssign => BinaryOp::Add,
        AssignOp::SubAssign => BinaryOp::Sub,
        AssignOp::MulAssign => BinaryOp::Mul,
        AssignOp::DivAssign => BinaryOp::Div,
        AssignOp::ModAssign => BinaryOp::Mod,
        AssignOp::ExpAssign => BinaryOp::Exp,
        AssignOp::LShiftAssign => BinaryOp::LShift,
        AssignOp::RShiftAssign => BinaryOp::RShift,
        AssignOp::ZeroFillRShiftAssign => BinaryOp::ZeroFillRShift,
        AssignOp::BitOrAssign => BinaryOp::BitOr,
        AssignOp::BitXorAssign => BinaryOp::BitXor,
        AssignOp::BitAndAssign => BinaryOp::BitAnd,
        _ => return None,
    })
}

fn unary(rt: &mut Runtime, env: &Env, u: &UnaryExpr) -> Eval<JsValue> {
    match u.op {
        UnaryOp::TypeOf => {
            // typeof tolerates undeclared identifiers
            if let Expr::Ident(id) = &*u.arg {
                return Ok(JsValue::from(
                    lookup(rt, env, &id.sym).map_or("undefined", |v| v.type_of()),
                ));
            }
            Ok(JsValue::from(eval(rt, env, &u.arg)?.type_of()))
        }
        UnaryOp::Delete => {
            if let Expr::Member(m) = &*u.arg {
                let object = eval(rt, env, &m.obj)?;
                let key = member_key(rt, env, &m.prop)?;
                if let Some(object) = object.as_object() {
                    object.remove(&key);
                }
            }
            Ok(JsValue::Boolean(true))
        }
        op => {
            let value = eval(rt, env, &u.arg)?;
            Ok(match op {
                UnaryOp::Minus => JsValue::Number(-value.to_number()),
                UnaryOp::Plus => JsValue::Number(value.to_number()),
                UnaryOp::Bang => JsValue::Boolean(!value.truthy()),
                UnaryOp::Tilde => JsValue::Number(!to_int32(value.to_number()) as f64),
                _ => JsValue::Undefined,
            })
        }
    }
}

fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
}

fn binary(rt: &Runtime, op: BinaryOp, left: &JsValue, right: &JsValue, span: Span) -> Eval<JsValue> {
    let number = |f: fn(f64, f64) -> f64| JsValue::Number(f(left.to_number(), right.to_number()));
    let int = |f: fn(i32, i32) -> i32| {
        JsValue::Number(f(to_int32(left.to_number()), to_int32(right.to_number())) as f64)
    };

    Ok(match op {
        BinaryOp::Add => match (left, right) {
            (JsValue::Number(a), JsValue::Number(b)) => JsValue::Number(a + b),
            (JsValue::String(_) | JsValue::Object(_), _) | (_, JsValue::String(_) | JsValue::Object(_)) => {
                JsValue::from(format!("{}{}", left.to_js_string(), right.to_js_string()))
            }
            _ => JsValue::Number(left.to_number() + right.to_number()),
        },
        BinaryOp::Sub => number(|a, b| a - b),
        BinaryOp::Mul => number(|a, b| a * b),
        BinaryOp::Div => number(|a, b| a / b),
        BinaryOp::Mod => number(|a, b| a % b),
        BinaryOp::Exp => number(f64::powf),
        BinaryOp::EqEq => JsValue::Boolean(left.loose_equals(right)),
        BinaryOp::NotEq => JsValue::Boolean(!left.loose_equals(right)),
        BinaryOp::EqEqEq => JsValue::Boolean(left.strict_equals(right)),
        BinaryOp::NotEqEq => JsValue::Boolean(!left.strict_equals(right)),
        BinaryOp::Lt => compare(left, right, |o| o.is_lt()),
        BinaryOp::LtEq => compare(left, right, |o| o.is_le()),
        BinaryOp::Gt => compare(left, right, |o| o.is_gt()),
        BinaryOp::GtEq => compare(left, right, |o| o.is_ge()),
        BinaryOp::BitAnd => int(|a, b| a & b),
        BinaryOp::BitOr => int(|a, b| a | b),
        BinaryOp::BitXor => int(|a, b| a ^ b),
        BinaryOp::LShift => int(|a, b| a.wrapping_shl(b as u32 & 31)),
        BinaryOp::RShift => int(|a, b| a.wrapping_shr(b as u32 & 31)),
        BinaryOp::ZeroFillRShift => {
            let a = to_int32(left.to_number()) as u32;
            let b = to_int32(right.to_number()) as u32 & 31;
            JsValue::Number((a >> b) as f64)
        }
        BinaryOp::In => match right.as_object() {
            Some(object) => JsValue::Boolean(object.has(&left.to_js_string())),
            None => {
                return Err(throw_at(
                    rt,
                    span,
                    ErrorKind::TypeError,
                    "Cannot use 'in' operator on a non-object",
                ));
            }
        },
        BinaryOp::InstanceOf => {
            if !right.is_callable() {
                return Err(throw_at(
                    rt,
                    span,
                    ErrorKind::TypeError,
                    "Right-hand side of 'instanceof' is not callable",
                ));
            }
            let proto = right.as_object().map(|ctor| ctor.get("prototype"));
            match (left.as_object(), proto) {
                (Some(object), Some(JsValue::Object(proto))) => {
                    JsValue::Boolean(object.inherits_from(&proto))
                }
                _ => JsValue::Boolean(false),
            }
        }
        _ => return Err(unsupported(rt, span, "operator")),
    })
}

fn compare(left: &JsValue, right: &JsValue, test: fn(std::cmp::Ordering) -> bool) -> JsValue {
    let ordering = match (left, right) {
        (JsValue::String(a), JsValue::String(b)) => Some(a.cmp(b)),
        _ => left.to_number().partial_cmp(&right.to_number()),
    };
    JsValue::Boolean(ordering.is_some_and(test))
}

fn call_expr(rt: &mut Runtime, env: &Env, call: &CallExpr) -> Eval<JsValue> {
    let Callee::Expr(callee) = &call.callee else {
        return Err(unsupported(rt, call.span, "callee"));
    };

    let (func, this) = match &**callee {
        Expr::Member(m) => {
            let object = eval(rt, env, &m.obj)?;
            let key = member_key(rt, env, &m.prop)?;
            (get_property(rt, &object, &key, m.span)?, object)
        }
        other => (eval(rt, env, other)?, JsValue::Undefined),
    };
    let args = eval_args(rt, env, &call.args)?;

    if !func.is_callable() {
        return Err(throw_at(
            rt,
            call.span,
            ErrorKind::TypeError,
            format!("{} is not a function", describe_callee(callee)),
        ));
    }
    call_value(rt, &func, this, args, call.span)
}

fn describe_callee(callee: &Expr) -> String {
    match callee {
        Expr::Ident(id) => id.sym.to_string(),
        Expr::Member(m) => match &m.prop {
            MemberProp::Ident(prop) => format!("{}.{}", describe_callee(&m.obj), prop.sym),
            _ => format!("{}[...]", describe_callee(&m.obj)),
        },
        Expr::This(_) => "this".to_string(),
        Expr::Paren(p) => describe_callee(&p.expr),
        _ => "expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::{Fatal, Runtime};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig {
            worker_threads: 1,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    fn eval_str(source: &str) -> JsValue {
        let mut rt = runtime();
        rt.execute_string(source, "test.js").unwrap()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(eval_str("1 + 2 * 3").to_number(), 7.0);
        assert_eq!(eval_str("'a' + 1 + 2").to_js_string(), "a12");
        assert!(eval_str("7 % 3 === 1 && 2 ** 3 === 8").truthy());
        assert_eq!(eval_str("`x=${1 + 1}\\n`").to_js_string(), "x=2\n");
        assert_eq!(eval_str("-1 >>> 28").to_number(), 15.0);
    }

    #[test]
    fn test_closures_and_hoisting() {
        let source = r#"
            var total = add(2, 3);
            function add(a, b) { return a + b; }
            function counter() {
                var n = 0;
                return function () { n += 1; return n; };
            }
            var next = counter();
            next(); next();
            total + next();
        "#;
        assert_eq!(eval_str(source).to_number(), 8.0);
    }

    #[test]
    fn test_let_loop_bindings_are_per_iteration() {
        let source = r#"
            var fns = [];
            for (let i = 0; i < 3; i++) { fns.push(() => i); }
            fns[0]() + fns[1]() * 10 + fns[2]() * 100;
        "#;
        assert_eq!(eval_str(source).to_number(), 210.0);
    }

    #[test]
    fn test_control_flow() {
        let source = r#"
            var out = [];
            outer: for (var i = 0; i < 3; i++) {
                for (var j = 0; j < 3; j++) {
                    if (j === 1) continue outer;
                    if (i === 2) break outer;
                    out.push(i + ":" + j);
                }
            }
            var k = 0;
            do { k++; } while (k < 5);
            switch (k) { case 4: out.push("four"); case 5: out.push("five"); default: out.push("dflt"); }
            out.join(",");
        "#;
        assert_eq!(eval_str(source).to_js_string(), "0:0,1:0,five,dflt");
    }

    #[test]
    fn test_try_catch_finally() {
        let source = r#"
            var log = [];
            try {
                try { throw new TypeError("bad"); }
                finally { log.push("finally"); }
            } catch (e) {
                log.push(e.name + "/" + e.message);
                log.push(e instanceof TypeError && e instanceof Error);
            }
            log.join(",");
        "#;
        assert_eq!(eval_str(source).to_js_string(), "finally,TypeError/bad,true");
    }

    #[test]
    fn test_objects_this_and_new() {
        let source = r#"
            function Point(x, y) { this.x = x; this.y = y; }
            Point.prototype.sum = function () { return this.x + this.y; };
            var p = new Point(2, 5);
            var o = { p, scale(k) { return this.p.sum() * k; }, "quoted": 1 };
            delete o.quoted;
            o.scale(3) + ("quoted" in o ? 100 : 0) + typeof missing.length;
        "#;
        let mut rt = runtime();
        let err = rt.execute_string(source, "objects.js").unwrap_err();
        // typeof does not shield member access on an undeclared identifier
        assert!(matches!(err, Fatal::Script(_)));

        let source = source.replace("typeof missing.length", "typeof missing");
        assert_eq!(rt.execute_string(&source, "objects.js").unwrap().to_js_string(), "21undefined");
    }

    #[test]
    fn test_functions_carry_a_prototype() {
        let source = r#"
            function Point(x) { this.x = x; }
            var before = typeof Point.prototype;
            Point.prototype.twice = function () { return this.x * 2; };
            var arrow = () => 1;
            [before, new Point(4).twice(), typeof arrow.prototype].join(",");
        "#;
        let mut rt = runtime();
        assert_eq!(
            rt.execute_string(source, "proto.js").unwrap().to_js_string(),
            "object,8,undefined"
        );
    }

    #[test]
    fn test_reference_error_location() {
        let mut rt = runtime();
        let err = rt.execute_string("var a = 1;\n  nope();\n", "ref.js").unwrap_err();
        let Fatal::Script(err) = err else {
            panic!("expected a script error, got {:?}", err);
        };
        assert_eq!(err.message, "ReferenceError: nope is not defined");
        let location = err.location.unwrap();
        assert_eq!(location.resource, "ref.js");
        assert_eq!(location.line, 2);
        assert_eq!(location.start_column, 2);
    }

    #[test]
    fn test_stack_trace_names_functions() {
        let mut rt = runtime();
        let source = "function inner() {\n  throw new Error('boom');\n}\nfunction outer() { inner(); }\nouter();\n";
        let Err(Fatal::Script(err)) = rt.execute_string(source, "stack.js") else {
            panic!("expected a script error");
        };
        let names: Vec<&str> = err.stack.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer", ""]);
        assert_eq!(err.stack[0].line, 2);
        assert_eq!(err.stack[1].line, 4);
        assert_eq!(err.stack[2].line, 5);
    }

    #[test]
    fn test_call_depth_limit() {
        let mut rt = Runtime::new(RuntimeConfig {
            worker_threads: 1,
            max_call_depth: 16,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let source = r#"
            function down(n) { return down(n + 1); }
            var message;
            try { down(0); } catch (e) { message = e.name + ": " + e.message; }
            message;
        "#;
        let value = rt.execute_string(source, "deep.js").unwrap();
        assert_eq!(value.to_js_string(), "RangeError: Maximum call stack size exceeded");
    }

    #[test]
    fn test_calling_non_function_names_callee() {
        let mut rt = runtime();
        let Err(Fatal::Script(err)) = rt.execute_string("var o = {};\no.missing();", "call.js") else {
            panic!("expected a script error");
        };
        assert_eq!(err.message, "TypeError: o.missing is not a function");
    }
}
