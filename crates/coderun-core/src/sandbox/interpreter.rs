//! Tree-walking evaluator for parsed snippets
//!
//! # Bounds
//!
//! Work is metered through [`Interpreter::spend`]: every loop iteration and
//! function call costs a fixed amount, and builtins pay for each element or
//! byte they touch. The wall-clock deadline and the host's cancel flag are
//! read whenever enough work has accumulated, so no single builtin call can
//! run far past the deadline. Call depth, nesting depth, collection sizes,
//! total heap allocation and console output are all capped by
//! [`SandboxLimits`]; exceeding any of them ends the evaluation with an
//! [`ExecutionFault`].
//!
//! # Heap
//!
//! Arrays, objects and closures are allocated in a per-evaluation arena and
//! referenced by index. Nothing is freed until the evaluation ends, so the
//! heap budget bounds the arena's size. String data is charged against the
//! same budget by byte length whenever a new string is built.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ExecutionFault;

use super::ast::{BinaryOp, DeclKind, Expr, FunctionDef, LogicalOp, Program, Stmt, UnaryOp};
use super::builtins;
use super::console::{Console, LogLevel};
use super::parser;
use super::value::{format_number, parse_number, ArrayRef, FunctionRef, ObjectRef, Value};
use super::SandboxLimits;

pub(crate) type Eval = Result<Value, ExecutionFault>;

/// Work units between two clock reads
const CLOCK_CHECK_WORK: usize = 4096;

/// Cost of one loop iteration or call; 64 of them trigger a clock read
const TICK_COST: usize = CLOCK_CHECK_WORK / 64;

/// Bytes of string data per heap unit
pub(crate) const STRING_BYTES_PER_UNIT: usize = 16;

/// Largest array index a property key may name
const MAX_ARRAY_INDEX: usize = u32::MAX as usize - 1;

/// Maximum nesting of a value converted to a JSON result
pub const MAX_RESULT_DEPTH: usize = 128;

/// Combined statement/expression recursion bound, keeps the worker stack safe
const MAX_EVAL_DEPTH: usize = 3000;

const INSPECT_DEPTH: usize = 2;
const MAX_INSPECT_ITEMS: usize = 100;
const MAX_CONSOLE_LINE_BYTES: usize = 16 * 1024;

/// Everything an evaluation needs from its host
pub struct EvalContext {
    pub limits: SandboxLimits,
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub cancel: Arc<AtomicBool>,
    pub console: Arc<dyn Console>,
}

/// Parse and evaluate a snippet, returning its completion value as JSON
pub fn evaluate(source: &str, ctx: EvalContext) -> Result<serde_json::Value, ExecutionFault> {
    let program = parser::parse(source)?;
    let mut interpreter = Interpreter::new(ctx)?;
    interpreter.run(&program)
}

// ── Scopes ─────────────────────────────────────────────

struct Binding {
    value: Value,
    kind: DeclKind,
}

pub(crate) struct Scope {
    vars: RefCell<HashMap<String, Binding>>,
    parent: Option<Rc<Scope>>,
    /// Function bodies and the program root; `var` declarations land here
    is_function: bool,
}

impl Scope {
    fn new(parent: Option<&Rc<Scope>>, is_function: bool) -> Rc<Self> {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: parent.map(Rc::clone),
            is_function,
        })
    }

    fn block(parent: &Rc<Scope>) -> Rc<Self> {
        Scope::new(Some(parent), false)
    }

    fn function(parent: &Rc<Scope>) -> Rc<Self> {
        Scope::new(Some(parent), true)
    }

    pub(crate) fn declare(
        &self,
        name: &str,
        kind: DeclKind,
        value: Value,
    ) -> Result<(), ExecutionFault> {
        let mut vars = self.vars.borrow_mut();
        if let Some(existing) = vars.get_mut(name) {
            if kind == DeclKind::Var && existing.kind == DeclKind::Var {
                existing.value = value;
                return Ok(());
            }
            return Err(ExecutionFault::Syntax(format!(
                "Identifier '{}' has already been declared",
                name
            )));
        }
        vars.insert(name.to_string(), Binding { value, kind });
        Ok(())
    }

    fn has_own(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.vars.borrow().get(name) {
                return Some(binding.value.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    /// Update an existing binding; `Ok(false)` when no scope declares it
    fn assign(&self, name: &str, value: Value) -> Result<bool, ExecutionFault> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.vars.borrow_mut().get_mut(name) {
                if binding.kind == DeclKind::Const {
                    return Err(ExecutionFault::Type(
                        "Assignment to constant variable.".into(),
                    ));
                }
                binding.value = value;
                return Ok(true);
            }
            match scope.parent.as_deref() {
                Some(parent) => scope = parent,
                None => return Ok(false),
            }
        }
    }

    fn function_scope(scope: &Rc<Scope>) -> Rc<Scope> {
        let mut current = Rc::clone(scope);
        while !current.is_function {
            let next = match &current.parent {
                Some(parent) => Rc::clone(parent),
                None => break,
            };
            current = next;
        }
        current
    }
}

// ── Heap ───────────────────────────────────────────────

struct Closure {
    def: Rc<FunctionDef>,
    env: Rc<Scope>,
    /// Named function expressions can refer to themselves by name
    binds_own_name: bool,
}

#[derive(Default)]
struct Heap {
    arrays: Vec<Vec<Value>>,
    objects: Vec<BTreeMap<String, Value>>,
    closures: Vec<Closure>,
    units: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Container {
    Array(usize),
    Object(usize),
}

// ── Control flow ───────────────────────────────────────

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Assignment target resolved once, so compound assignment evaluates the
/// object and index expressions a single time
enum Place {
    Binding(String),
    Property(Value, String),
    Element(Value, Value),
}

// ── Interpreter ────────────────────────────────────────

pub struct Interpreter {
    limits: SandboxLimits,
    deadline: Instant,
    timeout_ms: u64,
    cancel: Arc<AtomicBool>,
    console: Arc<dyn Console>,
    heap: Heap,
    globals: Rc<Scope>,
    completion: Value,
    call_depth: usize,
    eval_depth: usize,
    work: Cell<usize>,
    console_lines: usize,
}

impl Interpreter {
    pub fn new(ctx: EvalContext) -> Result<Self, ExecutionFault> {
        let intrinsics = Scope::new(None, true);
        let globals = Scope::function(&intrinsics);
        let mut interpreter = Interpreter {
            limits: ctx.limits,
            deadline: ctx.deadline,
            timeout_ms: ctx.timeout_ms,
            cancel: ctx.cancel,
            console: ctx.console,
            heap: Heap::default(),
            globals,
            completion: Value::Undefined,
            call_depth: 0,
            eval_depth: 0,
            work: Cell::new(0),
            console_lines: 0,
        };
        builtins::install(&mut interpreter, &intrinsics)?;
        Ok(interpreter)
    }

    /// Run a program and convert its completion value to JSON
    pub fn run(&mut self, program: &Program) -> Result<serde_json::Value, ExecutionFault> {
        let globals = Rc::clone(&self.globals);
        self.exec_block(&program.body, &globals)?;
        let completion = std::mem::replace(&mut self.completion, Value::Undefined);
        self.to_json(&completion)
    }

    /// Deadline / cancellation checkpoint for loops and calls
    fn tick(&self) -> Result<(), ExecutionFault> {
        self.spend(TICK_COST)
    }

    /// Meter `units` of work (elements or bytes touched), reading the clock
    /// once enough has accumulated since the last read
    pub(crate) fn spend(&self, units: usize) -> Result<(), ExecutionFault> {
        let work = self.work.get().saturating_add(units);
        if work < CLOCK_CHECK_WORK {
            self.work.set(work);
            return Ok(());
        }
        self.work.set(0);
        if self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline {
            return Err(ExecutionFault::Timeout {
                timeout_ms: self.timeout_ms,
            });
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), ExecutionFault> {
        self.eval_depth += 1;
        if self.eval_depth > MAX_EVAL_DEPTH {
            self.eval_depth -= 1;
            return Err(ExecutionFault::Range(
                "Maximum call stack size exceeded".into(),
            ));
        }
        Ok(())
    }

    // ── Resource accounting ──

    pub(crate) fn charge(&mut self, units: usize) -> Result<(), ExecutionFault> {
        self.heap.units = self.heap.units.saturating_add(units);
        if self.heap.units > self.limits.max_heap_units {
            return Err(ExecutionFault::ResourceLimit(format!(
                "heap budget of {} units exhausted",
                self.limits.max_heap_units
            )));
        }
        Ok(())
    }

    pub(crate) fn check_len(&self, len: usize, what: &str) -> Result<(), ExecutionFault> {
        if len > self.limits.max_collection_len {
            return Err(ExecutionFault::ResourceLimit(format!(
                "{} length {} exceeds {}",
                what, len, self.limits.max_collection_len
            )));
        }
        Ok(())
    }

    pub(crate) fn alloc_array(&mut self, items: Vec<Value>) -> Eval {
        self.check_len(items.len(), "array")?;
        self.charge(1 + items.len())?;
        self.heap.arrays.push(items);
        Ok(Value::Array(ArrayRef(self.heap.arrays.len() - 1)))
    }

    pub(crate) fn alloc_object(&mut self, map: BTreeMap<String, Value>) -> Eval {
        self.check_len(map.len(), "object")?;
        let key_bytes: usize = map.keys().map(String::len).sum();
        self.charge(1 + map.len() + key_bytes / STRING_BYTES_PER_UNIT)?;
        self.heap.objects.push(map);
        Ok(Value::Object(ObjectRef(self.heap.objects.len() - 1)))
    }

    /// Charge `len` bytes of freshly built string data
    pub(crate) fn charge_bytes(&mut self, len: usize) -> Result<(), ExecutionFault> {
        self.spend(len)?;
        self.charge(len / STRING_BYTES_PER_UNIT)
    }

    pub(crate) fn new_string(&mut self, s: String) -> Eval {
        self.check_len(s.len(), "string")?;
        self.charge_bytes(s.len())?;
        Ok(Value::string(s))
    }

    fn make_closure(
        &mut self,
        def: &Rc<FunctionDef>,
        env: &Rc<Scope>,
        binds_own_name: bool,
    ) -> Eval {
        self.charge(1)?;
        self.heap.closures.push(Closure {
            def: Rc::clone(def),
            env: Rc::clone(env),
            binds_own_name,
        });
        Ok(Value::Function(FunctionRef(self.heap.closures.len() - 1)))
    }

    pub(crate) fn array(&self, array: ArrayRef) -> &Vec<Value> {
        &self.heap.arrays[array.0]
    }

    pub(crate) fn array_mut(&mut self, array: ArrayRef) -> &mut Vec<Value> {
        &mut self.heap.arrays[array.0]
    }

    pub(crate) fn object(&self, object: ObjectRef) -> &BTreeMap<String, Value> {
        &self.heap.objects[object.0]
    }

    fn function_name(&self, function: FunctionRef) -> Option<&str> {
        self.heap.closures[function.0].def.name.as_deref()
    }

    // ── Statements ──

    fn exec_block(&mut self, body: &[Stmt], scope: &Rc<Scope>) -> Result<Flow, ExecutionFault> {
        for stmt in body {
            if let Stmt::Function(def) = stmt {
                if let Some(name) = &def.name {
                    let function = self.make_closure(def, scope, false)?;
                    scope.declare(name, DeclKind::Var, function)?;
                }
            }
        }
        for stmt in body {
            match self.exec(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow, ExecutionFault> {
        self.enter()?;
        let flow = self.exec_inner(stmt, scope);
        self.eval_depth -= 1;
        flow
    }

    fn exec_inner(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow, ExecutionFault> {
        match stmt {
            Stmt::Expr(expr) => {
                let value = self.eval(expr, scope)?;
                if self.call_depth == 0 {
                    self.completion = value;
                }
                Ok(Flow::Normal)
            }
            Stmt::Declare { kind, declarators } => {
                let target = match kind {
                    DeclKind::Var => Scope::function_scope(scope),
                    _ => Rc::clone(scope),
                };
                for (name, init) in declarators {
                    let value = match init {
                        Some(expr) => self.eval(expr, scope)?,
                        // `var x;` leaves an existing binding alone
                        None if *kind == DeclKind::Var && target.has_own(name) => continue,
                        None => Value::Undefined,
                    };
                    target.declare(name, *kind, value)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(def) => {
                // Already hoisted unless it is the bare body of an `if`/loop
                if let Some(name) = &def.name {
                    if !scope.has_own(name) {
                        let function = self.make_closure(def, scope, false)?;
                        scope.declare(name, DeclKind::Var, function)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(body) => {
                let inner = Scope::block(scope);
                self.exec_block(body, &inner)
            }
            Stmt::If {
                test,
                then,
                otherwise,
            } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.exec(then, scope)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { test, body } => {
                loop {
                    self.tick()?;
                    if !self.eval(test, scope)?.is_truthy() {
                        break;
                    }
                    match self.exec(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                let loop_scope = Scope::block(scope);
                if let Some(init) = init {
                    self.exec(init, &loop_scope)?;
                }
                loop {
                    self.tick()?;
                    if let Some(test) = test {
                        if !self.eval(test, &loop_scope)?.is_truthy() {
                            break;
                        }
                    }
                    match self.exec(body, &loop_scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, &loop_scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                Err(self.thrown(&value))
            }
            Stmt::Empty => Ok(Flow::Normal),
        }
    }

    /// Fault raised by `throw value`
    fn thrown(&self, value: &Value) -> ExecutionFault {
        if let Value::Object(object) = value {
            let fields = self.object(*object);
            if let Some(Value::String(message)) = fields.get("message") {
                if !message.is_empty() {
                    return ExecutionFault::Thrown(message.to_string());
                }
                if let Some(Value::String(name)) = fields.get("name") {
                    return ExecutionFault::Thrown(name.to_string());
                }
            }
        }
        match self.to_js_string(value) {
            Ok(text) => ExecutionFault::Thrown(text),
            Err(fault) => fault,
        }
    }

    // ── Expressions ──

    fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Eval {
        self.enter()?;
        let value = self.eval_inner(expr, scope);
        self.eval_depth -= 1;
        value
    }

    fn eval_inner(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Eval {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::String(Rc::clone(s))),
            Expr::Boolean(b) => Ok(Value::Boolean(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Ident(name) => scope
                .lookup(name)
                .ok_or_else(|| not_defined(name)),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                self.alloc_array(values)
            }
            Expr::Object(props) => {
                let mut map = BTreeMap::new();
                for (key, expr) in props {
                    let value = self.eval(expr, scope)?;
                    map.insert(key.clone(), value);
                }
                self.alloc_object(map)
            }
            Expr::Function(def) => {
                let binds_own_name = def.name.is_some();
                self.make_closure(def, scope, binds_own_name)
            }
            Expr::Unary { op, expr } => self.eval_unary(*op, expr, scope),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binary(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.is_truthy(),
                    LogicalOp::Or => left.is_truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
            Expr::Assign { op, target, value } => {
                let place = self.resolve_place(target, scope)?;
                let value = match op {
                    None => self.eval(value, scope)?,
                    Some(op) => {
                        let current = self.read_place(&place, scope)?;
                        let rhs = self.eval(value, scope)?;
                        self.binary(*op, &current, &rhs)?
                    }
                };
                self.write_place(place, value.clone(), scope)?;
                Ok(value)
            }
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.resolve_place(target, scope)?;
                let old = self.read_place(&place, scope)?;
                let old = self.to_number(&old);
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_place(place, Value::Number(new), scope)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Member { object, property } => {
                let object = self.eval(object, scope)?;
                self.get_property(&object, property)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                self.get_index(&object, &key)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, scope),
            Expr::New { callee, args } => {
                let function = self.eval(callee, scope)?;
                let args = self.eval_args(args, scope)?;
                match &function {
                    Value::Native(native) if native.constructor => (native.call)(self, &args),
                    _ => Err(ExecutionFault::Type(format!(
                        "{} is not a constructor",
                        callee.describe()
                    ))),
                }
            }
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, expr: &Expr, scope: &Rc<Scope>) -> Eval {
        if op == UnaryOp::Typeof {
            // `typeof undeclared` is "undefined", not a ReferenceError
            if let Expr::Ident(name) = expr {
                let value = scope.lookup(name).unwrap_or(Value::Undefined);
                return Ok(Value::string(value.type_name()));
            }
            let value = self.eval(expr, scope)?;
            return Ok(Value::string(value.type_name()));
        }
        let value = self.eval(expr, scope)?;
        Ok(match op {
            UnaryOp::Neg => Value::Number(-self.to_number(&value)),
            UnaryOp::Plus => Value::Number(self.to_number(&value)),
            UnaryOp::Not => Value::Boolean(!value.is_truthy()),
            UnaryOp::Typeof => Value::string(value.type_name()),
        })
    }

    fn eval_args(&mut self, args: &[Expr], scope: &Rc<Scope>) -> Result<Vec<Value>, ExecutionFault> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope)?);
        }
        Ok(values)
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr], scope: &Rc<Scope>) -> Eval {
        if let Expr::Member { object, property } = callee {
            let receiver = self.eval(object, scope)?;
            let args = self.eval_args(args, scope)?;
            match &receiver {
                Value::Array(array) => {
                    if let Some(result) = builtins::array_method(self, *array, property, &args) {
                        return result;
                    }
                }
                Value::String(text) => {
                    if let Some(result) = builtins::string_method(self, text, property, &args) {
                        return result;
                    }
                }
                _ => {}
            }
            let function = self.get_property(&receiver, property)?;
            return self.call_value(&function, &args, &callee.describe());
        }
        let function = self.eval(callee, scope)?;
        let args = self.eval_args(args, scope)?;
        self.call_value(&function, &args, &callee.describe())
    }

    pub(crate) fn call_value(&mut self, function: &Value, args: &[Value], label: &str) -> Eval {
        match function {
            Value::Native(native) => (native.call)(self, args),
            Value::Function(function) => self.call_closure(*function, args),
            _ => Err(ExecutionFault::Type(format!("{} is not a function", label))),
        }
    }

    fn call_closure(&mut self, function: FunctionRef, args: &[Value]) -> Eval {
        self.tick()?;
        if self.call_depth >= self.limits.max_call_depth {
            return Err(ExecutionFault::Range(
                "Maximum call stack size exceeded".into(),
            ));
        }
        let (def, env, binds_own_name) = {
            let closure = &self.heap.closures[function.0];
            (
                Rc::clone(&closure.def),
                Rc::clone(&closure.env),
                closure.binds_own_name,
            )
        };
        let env = match (&def.name, binds_own_name) {
            (Some(name), true) => {
                let named = Scope::block(&env);
                named.declare(name, DeclKind::Const, Value::Function(function))?;
                named
            }
            _ => env,
        };
        let scope = Scope::function(&env);
        for (i, param) in def.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Undefined);
            scope.declare(param, DeclKind::Var, value)?;
        }

        self.call_depth += 1;
        let flow = self.exec_block(&def.body, &scope);
        self.call_depth -= 1;

        match flow? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    // ── Places ──

    fn resolve_place(&mut self, target: &Expr, scope: &Rc<Scope>) -> Result<Place, ExecutionFault> {
        match target {
            Expr::Ident(name) => Ok(Place::Binding(name.clone())),
            Expr::Member { object, property } => {
                let object = self.eval(object, scope)?;
                Ok(Place::Property(object, property.clone()))
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                Ok(Place::Element(object, key))
            }
            _ => Err(ExecutionFault::Syntax(
                "Invalid left-hand side in assignment".into(),
            )),
        }
    }

    fn read_place(&mut self, place: &Place, scope: &Rc<Scope>) -> Eval {
        match place {
            Place::Binding(name) => scope.lookup(name).ok_or_else(|| not_defined(name)),
            Place::Property(object, name) => self.get_property(object, name),
            Place::Element(object, key) => self.get_index(object, key),
        }
    }

    fn write_place(&mut self, place: Place, value: Value, scope: &Rc<Scope>) -> Result<(), ExecutionFault> {
        match place {
            Place::Binding(name) => {
                if !scope.assign(&name, value.clone())? {
                    // Sloppy-mode implicit global
                    self.globals.declare(&name, DeclKind::Var, value)?;
                }
                Ok(())
            }
            Place::Property(object, name) => self.set_property(&object, &name, value),
            Place::Element(object, key) => match (&object, array_index(&key)) {
                (Value::Array(array), Some(index)) => self.set_element(*array, index, value),
                _ => {
                    let name = self.property_key(&key)?;
                    self.set_property(&object, &name, value)
                }
            },
        }
    }

    // ── Properties ──

    fn property_key(&self, key: &Value) -> Result<String, ExecutionFault> {
        match key {
            Value::String(s) => Ok(s.to_string()),
            other => self.to_js_string(other),
        }
    }

    pub(crate) fn get_property(&self, object: &Value, name: &str) -> Eval {
        match object {
            Value::Undefined | Value::Null => Err(ExecutionFault::Type(format!(
                "Cannot read properties of {} (reading '{}')",
                primitive_string(object),
                name
            ))),
            Value::Array(array) => {
                let items = self.array(*array);
                if name == "length" {
                    return Ok(Value::Number(items.len() as f64));
                }
                Ok(canonical_index(name)
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Undefined))
            }
            Value::String(text) => {
                self.spend(text.len())?;
                if name == "length" {
                    return Ok(Value::Number(text.chars().count() as f64));
                }
                Ok(canonical_index(name)
                    .and_then(|i| text.chars().nth(i))
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or(Value::Undefined))
            }
            Value::Object(map) => Ok(self
                .object(*map)
                .get(name)
                .cloned()
                .unwrap_or(Value::Undefined)),
            Value::Function(function) if name == "name" => Ok(Value::string(
                self.function_name(*function).unwrap_or(""),
            )),
            Value::Native(native) if name == "name" => Ok(Value::string(native.name)),
            _ => Ok(Value::Undefined),
        }
    }

    fn get_index(&self, object: &Value, key: &Value) -> Eval {
        if let (Value::Array(array), Some(index)) = (object, array_index(key)) {
            return Ok(self
                .array(*array)
                .get(index)
                .cloned()
                .unwrap_or(Value::Undefined));
        }
        let name = self.property_key(key)?;
        self.get_property(object, &name)
    }

    fn set_property(&mut self, object: &Value, name: &str, value: Value) -> Result<(), ExecutionFault> {
        match object {
            Value::Undefined | Value::Null => Err(ExecutionFault::Type(format!(
                "Cannot set properties of {} (setting '{}')",
                primitive_string(object),
                name
            ))),
            Value::Object(map) => {
                let fields = self.object(*map);
                if !fields.contains_key(name) {
                    self.check_len(fields.len() + 1, "object")?;
                    self.charge(1 + name.len() / STRING_BYTES_PER_UNIT)?;
                }
                self.heap.objects[map.0].insert(name.to_string(), value);
                Ok(())
            }
            Value::Array(array) => {
                if name == "length" {
                    let n = self.to_number(&value);
                    if n < 0.0 || n.fract() != 0.0 || !n.is_finite() {
                        return Err(ExecutionFault::Range("Invalid array length".into()));
                    }
                    return self.set_array_len(*array, n as usize);
                }
                match canonical_index(name) {
                    Some(index) => self.set_element(*array, index, value),
                    None => Err(ExecutionFault::Type(format!(
                        "Cannot add property '{}' to an array",
                        name
                    ))),
                }
            }
            // Writes to primitive properties are silently dropped
            _ => Ok(()),
        }
    }

    fn set_array_len(&mut self, array: ArrayRef, len: usize) -> Result<(), ExecutionFault> {
        let current = self.array(array).len();
        if len > current {
            self.check_len(len, "array")?;
            self.charge(len - current)?;
            self.spend(len - current)?;
        }
        self.array_mut(array).resize(len, Value::Undefined);
        Ok(())
    }

    fn set_element(&mut self, array: ArrayRef, index: usize, value: Value) -> Result<(), ExecutionFault> {
        if index >= self.array(array).len() {
            let len = index
                .checked_add(1)
                .ok_or_else(|| ExecutionFault::Range("Invalid array length".into()))?;
            self.set_array_len(array, len)?;
        }
        self.array_mut(array)[index] = value;
        Ok(())
    }

    // ── Operators ──

    pub(crate) fn binary(&mut self, op: BinaryOp, left: &Value, right: &Value) -> Eval {
        let value = match op {
            BinaryOp::Add => {
                let left = self.to_primitive(left)?;
                let right = self.to_primitive(right)?;
                if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
                    let left = self.to_js_string(&left)?;
                    let right = self.to_js_string(&right)?;
                    self.check_len(left.len() + right.len(), "string")?;
                    return self.new_string(left + &right);
                }
                Value::Number(self.to_number(&left) + self.to_number(&right))
            }
            BinaryOp::Sub => Value::Number(self.to_number(left) - self.to_number(right)),
            BinaryOp::Mul => Value::Number(self.to_number(left) * self.to_number(right)),
            BinaryOp::Div => Value::Number(self.to_number(left) / self.to_number(right)),
            BinaryOp::Rem => Value::Number(self.to_number(left) % self.to_number(right)),
            BinaryOp::Pow => Value::Number(js_pow(self.to_number(left), self.to_number(right))),
            BinaryOp::Eq => Value::Boolean(self.loose_equals(left, right)?),
            BinaryOp::NotEq => Value::Boolean(!self.loose_equals(left, right)?),
            BinaryOp::StrictEq => Value::Boolean(left.strict_equals(right)),
            BinaryOp::StrictNotEq => Value::Boolean(!left.strict_equals(right)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                Value::Boolean(self.compare(op, left, right)?)
            }
        };
        Ok(value)
    }

    fn compare(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<bool, ExecutionFault> {
        let left = self.to_primitive(left)?;
        let right = self.to_primitive(right)?;
        if let (Value::String(a), Value::String(b)) = (&left, &right) {
            return Ok(match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            });
        }
        let (a, b) = (self.to_number(&left), self.to_number(&right));
        // Every comparison with NaN is false
        Ok(match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            _ => a >= b,
        })
    }

    fn loose_equals(&self, left: &Value, right: &Value) -> Result<bool, ExecutionFault> {
        if std::mem::discriminant(left) == std::mem::discriminant(right) {
            return Ok(left.strict_equals(right));
        }
        Ok(match (left, right) {
            (a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
            (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
                *n == parse_number(s)
            }
            (Value::Boolean(b), other) | (other, Value::Boolean(b)) => {
                let n = Value::Number(if *b { 1.0 } else { 0.0 });
                return self.loose_equals(&n, other);
            }
            (Value::Array(_) | Value::Object(_), primitive)
            | (primitive, Value::Array(_) | Value::Object(_))
                if !matches!(
                    primitive,
                    Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Native(_)
                ) =>
            {
                let container = if matches!(left, Value::Array(_) | Value::Object(_)) {
                    left
                } else {
                    right
                };
                let converted = self.to_primitive(container)?;
                return self.loose_equals(&converted, primitive);
            }
            _ => false,
        })
    }

    // ── Conversions ──

    fn to_primitive(&self, value: &Value) -> Eval {
        match value {
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Native(_) => {
                Ok(Value::string(self.to_js_string(value)?))
            }
            other => Ok(other.clone()),
        }
    }

    pub(crate) fn to_number(&self, value: &Value) -> f64 {
        match value {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(_) => match self.to_js_string(value) {
                Ok(text) => parse_number(&text),
                Err(_) => f64::NAN,
            },
            Value::Object(_) | Value::Function(_) | Value::Native(_) => f64::NAN,
        }
    }

    pub(crate) fn number_arg(&self, args: &[Value], index: usize) -> f64 {
        args.get(index)
            .map(|v| self.to_number(v))
            .unwrap_or(f64::NAN)
    }

    /// JavaScript `String(value)`
    pub(crate) fn to_js_string(&self, value: &Value) -> Result<String, ExecutionFault> {
        let mut out = String::new();
        self.write_string(value, &mut out, &mut Vec::new())?;
        Ok(out)
    }

    fn write_string(&self, value: &Value, out: &mut String, joining: &mut Vec<usize>) -> Result<(), ExecutionFault> {
        match value {
            Value::Array(array) => {
                // Cyclic joins render as empty, like Array.prototype.join
                if joining.contains(&array.0) {
                    return Ok(());
                }
                if joining.len() >= MAX_RESULT_DEPTH {
                    return Err(nested_too_deep());
                }
                joining.push(array.0);
                for (i, item) in self.array(*array).iter().enumerate() {
                    self.spend(1)?;
                    if i > 0 {
                        out.push(',');
                    }
                    if !item.is_nullish() {
                        self.write_string(item, out, joining)?;
                    }
                    self.check_len(out.len(), "string")?;
                }
                joining.pop();
            }
            Value::Object(_) => out.push_str("[object Object]"),
            Value::Function(function) => {
                let name = self.function_name(*function).unwrap_or("");
                out.push_str(&format!("function {}() {{ [code] }}", name));
            }
            Value::Native(native) => {
                out.push_str(&format!("function {}() {{ [native code] }}", native.name));
            }
            scalar => out.push_str(&primitive_string(scalar)),
        }
        self.check_len(out.len(), "string")
    }

    /// Node-style rendering used for console output
    pub(crate) fn inspect(&self, value: &Value) -> String {
        let mut out = String::new();
        self.inspect_into(value, 0, &mut out, &mut Vec::new());
        if out.len() > MAX_CONSOLE_LINE_BYTES {
            let mut end = MAX_CONSOLE_LINE_BYTES;
            while !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
            out.push_str("...");
        }
        out
    }

    fn inspect_into(&self, value: &Value, depth: usize, out: &mut String, seen: &mut Vec<Container>) {
        if out.len() > MAX_CONSOLE_LINE_BYTES {
            return;
        }
        match value {
            Value::String(text) if depth > 0 => {
                out.push('\'');
                out.push_str(text);
                out.push('\'');
            }
            Value::Array(array) => {
                let id = Container::Array(array.0);
                let items = self.array(*array);
                if seen.contains(&id) {
                    out.push_str("[Circular]");
                } else if items.is_empty() {
                    out.push_str("[]");
                } else if depth > INSPECT_DEPTH {
                    out.push_str("[Array]");
                } else {
                    seen.push(id);
                    out.push_str("[ ");
                    for (i, item) in items.iter().take(MAX_INSPECT_ITEMS).enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.inspect_into(item, depth + 1, out, seen);
                    }
                    if items.len() > MAX_INSPECT_ITEMS {
                        out.push_str(&format!(
                            ", ... {} more items",
                            items.len() - MAX_INSPECT_ITEMS
                        ));
                    }
                    out.push_str(" ]");
                    seen.pop();
                }
            }
            Value::Object(object) => {
                let id = Container::Object(object.0);
                let fields = self.object(*object);
                if seen.contains(&id) {
                    out.push_str("[Circular]");
                } else if fields.is_empty() {
                    out.push_str("{}");
                } else if depth > INSPECT_DEPTH {
                    out.push_str("[Object]");
                } else {
                    seen.push(id);
                    out.push_str("{ ");
                    for (i, (key, item)) in fields.iter().take(MAX_INSPECT_ITEMS).enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(key);
                        out.push_str(": ");
                        self.inspect_into(item, depth + 1, out, seen);
                    }
                    if fields.len() > MAX_INSPECT_ITEMS {
                        out.push_str(", ...");
                    }
                    out.push_str(" }");
                    seen.pop();
                }
            }
            Value::Function(function) => match self.function_name(*function) {
                Some(name) => out.push_str(&format!("[Function: {}]", name)),
                None => out.push_str("[Function (anonymous)]"),
            },
            Value::Native(native) => out.push_str(&format!("[Function: {}]", native.name)),
            scalar => out.push_str(&primitive_string(scalar)),
        }
    }

    /// Convert a value to its JSON result, following `JSON.stringify`
    pub(crate) fn to_json(&self, value: &Value) -> Result<serde_json::Value, ExecutionFault> {
        let mut nodes = 0usize;
        self.json_value(value, &mut Vec::new(), &mut nodes)
    }

    fn json_value(
        &self,
        value: &Value,
        stack: &mut Vec<Container>,
        nodes: &mut usize,
    ) -> Result<serde_json::Value, ExecutionFault> {
        *nodes += 1;
        self.spend(1)?;
        if *nodes > self.limits.max_collection_len {
            return Err(ExecutionFault::ResourceLimit(format!(
                "result exceeds {} values",
                self.limits.max_collection_len
            )));
        }
        Ok(match value {
            Value::Undefined | Value::Function(_) | Value::Native(_) | Value::Null => {
                serde_json::Value::Null
            }
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(array) => {
                enter_container(stack, Container::Array(array.0))?;
                let items = self.array(*array);
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.json_value(item, stack, nodes)?);
                }
                stack.pop();
                serde_json::Value::Array(out)
            }
            Value::Object(object) => {
                enter_container(stack, Container::Object(object.0))?;
                let mut out = serde_json::Map::new();
                for (key, item) in self.object(*object) {
                    if matches!(item, Value::Undefined | Value::Function(_) | Value::Native(_)) {
                        continue;
                    }
                    out.insert(key.clone(), self.json_value(item, stack, nodes)?);
                }
                stack.pop();
                serde_json::Value::Object(out)
            }
        })
    }

    // ── Console ──

    pub(crate) fn console_write(&mut self, level: LogLevel, args: &[Value]) -> Eval {
        self.console_lines += 1;
        if self.console_lines > self.limits.max_console_lines {
            return Err(ExecutionFault::ResourceLimit(format!(
                "console output exceeds {} lines",
                self.limits.max_console_lines
            )));
        }
        let mut line = args
            .iter()
            .map(|arg| match arg {
                Value::String(text) => text.to_string(),
                other => self.inspect(other),
            })
            .collect::<Vec<_>>()
            .join(" ");
        if line.len() > MAX_CONSOLE_LINE_BYTES {
            let mut end = MAX_CONSOLE_LINE_BYTES;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line.truncate(end);
            line.push_str("...");
        }
        self.console.log(level, &line);
        Ok(Value::Undefined)
    }
}

// ── Helpers ────────────────────────────────────────────

fn not_defined(name: &str) -> ExecutionFault {
    ExecutionFault::Reference(format!("{} is not defined", name))
}

fn nested_too_deep() -> ExecutionFault {
    ExecutionFault::ResourceLimit(format!(
        "value nested deeper than {} levels",
        MAX_RESULT_DEPTH
    ))
}

fn enter_container(stack: &mut Vec<Container>, id: Container) -> Result<(), ExecutionFault> {
    if stack.contains(&id) {
        return Err(ExecutionFault::Type(
            "Converting circular structure to JSON".into(),
        ));
    }
    if stack.len() >= MAX_RESULT_DEPTH {
        return Err(nested_too_deep());
    }
    stack.push(id);
    Ok(())
}

/// Scalars only; containers are rendered by the interpreter
pub(crate) fn primitive_string(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".into(),
        Value::Null => "null".into(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.to_string(),
        Value::Array(_) => "[array]".into(),
        Value::Object(_) => "[object Object]".into(),
        Value::Function(_) | Value::Native(_) => "function".into(),
    }
}

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// `**` / `Math.pow`, which differ from `powf` for NaN and ±1 bases
pub(crate) fn js_pow(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        return f64::NAN;
    }
    base.powf(exponent)
}

/// Integer array index from a property name (`"0"`, `"12"`, not `"01"`)
fn canonical_index(name: &str) -> Option<usize> {
    if name.is_empty() || (name.len() > 1 && name.starts_with('0')) {
        return None;
    }
    if !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok().filter(|&index| index <= MAX_ARRAY_INDEX)
}

fn array_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n <= MAX_ARRAY_INDEX as f64 => {
            Some(*n as usize)
        }
        Value::String(s) => canonical_index(s),
        _ => None,
    }
}
