//! Host objects visible to snippets: `console`, `Math`, error constructors
//! and a handful of conversion functions, plus array and string methods.
//!
//! Nothing here touches the clock, the filesystem, the network or the
//! environment. `Math.random` is absent so results stay cacheable.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::ExecutionFault;

use super::ast::DeclKind;
use super::console::LogLevel;
use super::interpreter::{js_pow, Eval, Interpreter, Scope};
use super::value::{ArrayRef, NativeFn, NativeFunction, Value};

pub(crate) fn install(interp: &mut Interpreter, scope: &Scope) -> Result<(), ExecutionFault> {
    let console = interp.alloc_object(natives(CONSOLE_METHODS, false))?;
    scope.declare("console", DeclKind::Var, console)?;

    let mut math = natives(MATH_FUNCTIONS, false);
    for (name, value) in MATH_CONSTANTS {
        math.insert(name.to_string(), Value::Number(*value));
    }
    let math = interp.alloc_object(math)?;
    scope.declare("Math", DeclKind::Var, math)?;

    for (name, value) in natives(GLOBAL_FUNCTIONS, false) {
        scope.declare(&name, DeclKind::Var, value)?;
    }
    for (name, value) in natives(ERROR_CONSTRUCTORS, true) {
        scope.declare(&name, DeclKind::Var, value)?;
    }

    scope.declare("undefined", DeclKind::Const, Value::Undefined)?;
    scope.declare("NaN", DeclKind::Const, Value::Number(f64::NAN))?;
    scope.declare("Infinity", DeclKind::Const, Value::Number(f64::INFINITY))?;
    Ok(())
}

fn natives(table: &[(&'static str, NativeFn)], constructor: bool) -> BTreeMap<String, Value> {
    table
        .iter()
        .map(|&(name, call)| {
            let native = NativeFunction {
                name,
                call,
                constructor,
            };
            (name.to_string(), Value::Native(native))
        })
        .collect()
}

// ── console ────────────────────────────────────────────

const CONSOLE_METHODS: &[(&str, NativeFn)] = &[
    ("log", console_log),
    ("info", console_info),
    ("warn", console_warn),
    ("error", console_error),
    ("debug", console_debug),
];

fn console_log(interp: &mut Interpreter, args: &[Value]) -> Eval {
    interp.console_write(LogLevel::Info, args)
}

fn console_info(interp: &mut Interpreter, args: &[Value]) -> Eval {
    interp.console_write(LogLevel::Info, args)
}

fn console_warn(interp: &mut Interpreter, args: &[Value]) -> Eval {
    interp.console_write(LogLevel::Warn, args)
}

fn console_error(interp: &mut Interpreter, args: &[Value]) -> Eval {
    interp.console_write(LogLevel::Error, args)
}

fn console_debug(interp: &mut Interpreter, args: &[Value]) -> Eval {
    interp.console_write(LogLevel::Debug, args)
}

// ── Math ───────────────────────────────────────────────

const MATH_CONSTANTS: &[(&str, f64)] = &[
    ("PI", std::f64::consts::PI),
    ("E", std::f64::consts::E),
    ("LN2", std::f64::consts::LN_2),
    ("LN10", std::f64::consts::LN_10),
    ("LOG2E", std::f64::consts::LOG2_E),
    ("LOG10E", std::f64::consts::LOG10_E),
    ("SQRT2", std::f64::consts::SQRT_2),
    ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
];

const MATH_FUNCTIONS: &[(&str, NativeFn)] = &[
    ("abs", math_abs),
    ("floor", math_floor),
    ("ceil", math_ceil),
    ("round", math_round),
    ("trunc", math_trunc),
    ("sign", math_sign),
    ("sqrt", math_sqrt),
    ("cbrt", math_cbrt),
    ("exp", math_exp),
    ("log", math_log),
    ("log2", math_log2),
    ("log10", math_log10),
    ("sin", math_sin),
    ("cos", math_cos),
    ("tan", math_tan),
    ("asin", math_asin),
    ("acos", math_acos),
    ("atan", math_atan),
    ("pow", math_pow),
    ("atan2", math_atan2),
    ("min", math_min),
    ("max", math_max),
    ("hypot", math_hypot),
];

macro_rules! unary_math {
    ($($name:ident => $op:expr;)*) => {
        $(
            fn $name(interp: &mut Interpreter, args: &[Value]) -> Eval {
                let op: fn(f64) -> f64 = $op;
                Ok(Value::Number(op(interp.number_arg(args, 0))))
            }
        )*
    };
}

unary_math! {
    math_abs => f64::abs;
    math_floor => f64::floor;
    math_ceil => f64::ceil;
    math_round => js_round;
    math_trunc => f64::trunc;
    math_sign => js_sign;
    math_sqrt => f64::sqrt;
    math_cbrt => f64::cbrt;
    math_exp => f64::exp;
    math_log => f64::ln;
    math_log2 => f64::log2;
    math_log10 => f64::log10;
    math_sin => f64::sin;
    math_cos => f64::cos;
    math_tan => f64::tan;
    math_asin => f64::asin;
    math_acos => f64::acos;
    math_atan => f64::atan;
}

/// Halves round toward +Infinity: `round(-2.5) == -2`
fn js_round(x: f64) -> f64 {
    if !x.is_finite() {
        return x;
    }
    let floor = x.floor();
    if x - floor >= 0.5 {
        floor + 1.0
    } else {
        floor
    }
}

fn js_sign(x: f64) -> f64 {
    if x.is_nan() || x == 0.0 {
        x
    } else {
        x.signum()
    }
}

fn math_pow(interp: &mut Interpreter, args: &[Value]) -> Eval {
    Ok(Value::Number(js_pow(
        interp.number_arg(args, 0),
        interp.number_arg(args, 1),
    )))
}

fn math_atan2(interp: &mut Interpreter, args: &[Value]) -> Eval {
    let y = interp.number_arg(args, 0);
    let x = interp.number_arg(args, 1);
    Ok(Value::Number(y.atan2(x)))
}

fn numbers(interp: &Interpreter, args: &[Value]) -> Vec<f64> {
    args.iter().map(|v| interp.to_number(v)).collect()
}

fn math_min(interp: &mut Interpreter, args: &[Value]) -> Eval {
    let values = numbers(interp, args);
    if values.iter().any(|n| n.is_nan()) {
        return Ok(Value::Number(f64::NAN));
    }
    Ok(Value::Number(values.into_iter().fold(f64::INFINITY, f64::min)))
}

fn math_max(interp: &mut Interpreter, args: &[Value]) -> Eval {
    let values = numbers(interp, args);
    if values.iter().any(|n| n.is_nan()) {
        return Ok(Value::Number(f64::NAN));
    }
    Ok(Value::Number(values.into_iter().fold(f64::NEG_INFINITY, f64::max)))
}

fn math_hypot(interp: &mut Interpreter, args: &[Value]) -> Eval {
    let values = numbers(interp, args);
    if values.iter().any(|n| n.is_infinite()) {
        return Ok(Value::Number(f64::INFINITY));
    }
    Ok(Value::Number(values.iter().map(|n| n * n).sum::<f64>().sqrt()))
}

// ── Global functions ───────────────────────────────────

const GLOBAL_FUNCTIONS: &[(&str, NativeFn)] = &[
    ("String", global_string),
    ("Number", global_number),
    ("Boolean", global_boolean),
    ("parseInt", global_parse_int),
    ("parseFloat", global_parse_float),
    ("isNaN", global_is_nan),
    ("isFinite", global_is_finite),
];

fn global_string(interp: &mut Interpreter, args: &[Value]) -> Eval {
    match args.first() {
        None => Ok(Value::string("")),
        Some(value) => {
            let text = interp.to_js_string(value)?;
            interp.new_string(text)
        }
    }
}

fn global_number(interp: &mut Interpreter, args: &[Value]) -> Eval {
    Ok(Value::Number(match args.first() {
        None => 0.0,
        Some(value) => interp.to_number(value),
    }))
}

fn global_boolean(_interp: &mut Interpreter, args: &[Value]) -> Eval {
    Ok(Value::Boolean(
        args.first().map(Value::is_truthy).unwrap_or(false),
    ))
}

fn global_is_nan(interp: &mut Interpreter, args: &[Value]) -> Eval {
    Ok(Value::Boolean(interp.number_arg(args, 0).is_nan()))
}

fn global_is_finite(interp: &mut Interpreter, args: &[Value]) -> Eval {
    Ok(Value::Boolean(interp.number_arg(args, 0).is_finite()))
}

fn global_parse_int(interp: &mut Interpreter, args: &[Value]) -> Eval {
    let text = match args.first() {
        Some(value) => interp.to_js_string(value)?,
        None => return Ok(Value::Number(f64::NAN)),
    };
    let radix = match args.get(1) {
        None | Some(Value::Undefined) => 0,
        Some(value) => {
            let r = interp.to_number(value);
            if r.is_nan() {
                0
            } else {
                r.trunc() as i64
            }
        }
    };
    Ok(Value::Number(parse_int(&text, radix)))
}

fn parse_int(text: &str, radix: i64) -> f64 {
    let mut s = text.trim_start();
    let mut sign = 1.0;
    if let Some(rest) = s.strip_prefix('-') {
        sign = -1.0;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    let mut radix = radix;
    if radix == 0 || radix == 16 {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let mut result = 0.0;
    let mut any = false;
    for c in s.chars() {
        match c.to_digit(radix as u32) {
            Some(d) => {
                result = result * radix as f64 + d as f64;
                any = true;
            }
            None => break,
        }
    }
    if any {
        sign * result
    } else {
        f64::NAN
    }
}

fn global_parse_float(interp: &mut Interpreter, args: &[Value]) -> Eval {
    let text = match args.first() {
        Some(value) => interp.to_js_string(value)?,
        None => return Ok(Value::Number(f64::NAN)),
    };
    Ok(Value::Number(parse_float(&text)))
}

fn parse_float(text: &str) -> f64 {
    let s = text.trim_start();
    let unsigned = s.trim_start_matches(['+', '-']);
    if unsigned.starts_with("Infinity") {
        return if s.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    // Longest prefix shaped like [sign] digits [. digits] [e [sign] digits]
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if !s[digits_start..end].bytes().any(|b| b.is_ascii_digit()) {
        return f64::NAN;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    s[..end].parse().unwrap_or(f64::NAN)
}

// ── Errors ─────────────────────────────────────────────

const ERROR_CONSTRUCTORS: &[(&str, NativeFn)] = &[
    ("Error", error_ctor),
    ("TypeError", type_error_ctor),
    ("RangeError", range_error_ctor),
];

fn make_error(interp: &mut Interpreter, name: &'static str, args: &[Value]) -> Eval {
    let message = match args.first() {
        None | Some(Value::Undefined) => String::new(),
        Some(value) => interp.to_js_string(value)?,
    };
    let message = interp.new_string(message)?;
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), Value::string(name));
    fields.insert("message".to_string(), message);
    interp.alloc_object(fields)
}

fn error_ctor(interp: &mut Interpreter, args: &[Value]) -> Eval {
    make_error(interp, "Error", args)
}

fn type_error_ctor(interp: &mut Interpreter, args: &[Value]) -> Eval {
    make_error(interp, "TypeError", args)
}

fn range_error_ctor(interp: &mut Interpreter, args: &[Value]) -> Eval {
    make_error(interp, "RangeError", args)
}

// ── Array methods ──────────────────────────────────────

/// Dispatch `array.name(args)`; `None` when the array has no such method
pub(crate) fn array_method(
    interp: &mut Interpreter,
    array: ArrayRef,
    name: &str,
    args: &[Value],
) -> Option<Eval> {
    let result = match name {
        "push" => array_push(interp, array, args),
        "pop" => Ok(interp.array_mut(array).pop().unwrap_or(Value::Undefined)),
        "join" => array_join(interp, array, args),
        "indexOf" => {
            let needle = args.first().cloned().unwrap_or(Value::Undefined);
            array_position(interp, array, |item| item.strict_equals(&needle))
                .map(|position| Value::Number(position.map(|i| i as f64).unwrap_or(-1.0)))
        }
        "includes" => {
            let needle = args.first().cloned().unwrap_or(Value::Undefined);
            array_position(interp, array, |item| item.same_value_zero(&needle))
                .map(|position| Value::Boolean(position.is_some()))
        }
        "slice" => array_slice(interp, array, args),
        "forEach" => array_each(interp, array, args, EachMode::ForEach),
        "map" => array_each(interp, array, args, EachMode::Map),
        "filter" => array_each(interp, array, args, EachMode::Filter),
        "reduce" => array_reduce(interp, array, args),
        _ => return None,
    };
    Some(result)
}

/// Linear search that pays for every element it compares
fn array_position(
    interp: &Interpreter,
    array: ArrayRef,
    matches: impl Fn(&Value) -> bool,
) -> Result<Option<usize>, ExecutionFault> {
    for (i, item) in interp.array(array).iter().enumerate() {
        interp.spend(1)?;
        if matches(item) {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn array_slice(interp: &mut Interpreter, array: ArrayRef, args: &[Value]) -> Eval {
    let len = interp.array(array).len();
    let start = relative_index(interp, args.first(), len, 0);
    let end = relative_index(interp, args.get(1), len, len);
    if start >= end {
        return interp.alloc_array(Vec::new());
    }
    interp.spend(end - start)?;
    let slice = interp.array(array)[start..end].to_vec();
    interp.alloc_array(slice)
}

fn array_push(interp: &mut Interpreter, array: ArrayRef, args: &[Value]) -> Eval {
    let new_len = interp.array(array).len() + args.len();
    interp.check_len(new_len, "array")?;
    interp.charge(args.len())?;
    interp.array_mut(array).extend_from_slice(args);
    Ok(Value::Number(new_len as f64))
}

fn array_join(interp: &mut Interpreter, array: ArrayRef, args: &[Value]) -> Eval {
    let separator = match args.first() {
        None | Some(Value::Undefined) => ",".to_string(),
        Some(value) => interp.to_js_string(value)?,
    };
    let mut out = String::new();
    for (i, item) in interp.array(array).iter().enumerate() {
        interp.spend(1)?;
        if i > 0 {
            out.push_str(&separator);
        }
        if !item.is_nullish() {
            out.push_str(&interp.to_js_string(item)?);
        }
        interp.check_len(out.len(), "string")?;
    }
    interp.new_string(out)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EachMode {
    ForEach,
    Map,
    Filter,
}

fn callback(args: &[Value], method: &str) -> Result<Value, ExecutionFault> {
    match args.first() {
        Some(f) if f.is_callable() => Ok(f.clone()),
        _ => Err(ExecutionFault::Type(format!(
            "{} requires a function argument",
            method
        ))),
    }
}

fn array_each(interp: &mut Interpreter, array: ArrayRef, args: &[Value], mode: EachMode) -> Eval {
    let method = match mode {
        EachMode::ForEach => "forEach",
        EachMode::Map => "map",
        EachMode::Filter => "filter",
    };
    let f = callback(args, method)?;
    // Iterate a snapshot; the callback may mutate the array
    interp.spend(interp.array(array).len())?;
    let items = interp.array(array).clone();
    let mut out = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        interp.spend(1)?;
        let call_args = [item.clone(), Value::Number(i as f64), Value::Array(array)];
        let result = interp.call_value(&f, &call_args, method)?;
        match mode {
            EachMode::ForEach => {}
            EachMode::Map => out.push(result),
            EachMode::Filter => {
                if result.is_truthy() {
                    out.push(item);
                }
            }
        }
    }
    match mode {
        EachMode::ForEach => Ok(Value::Undefined),
        _ => interp.alloc_array(out),
    }
}

fn array_reduce(interp: &mut Interpreter, array: ArrayRef, args: &[Value]) -> Eval {
    let f = callback(args, "reduce")?;
    interp.spend(interp.array(array).len())?;
    let items = interp.array(array).clone();
    let mut iter = items.into_iter().enumerate();
    let mut acc = match args.get(1) {
        Some(initial) => initial.clone(),
        None => match iter.next() {
            Some((_, first)) => first,
            None => {
                return Err(ExecutionFault::Type(
                    "Reduce of empty array with no initial value".into(),
                ))
            }
        },
    };
    for (i, item) in iter {
        interp.spend(1)?;
        let call_args = [acc, item, Value::Number(i as f64), Value::Array(array)];
        acc = interp.call_value(&f, &call_args, "reduce")?;
    }
    Ok(acc)
}

/// Resolve a `slice` bound: negative counts from the end, clamped to `len`
fn relative_index(interp: &Interpreter, arg: Option<&Value>, len: usize, default: usize) -> usize {
    let n = match arg {
        None | Some(Value::Undefined) => return default,
        Some(value) => interp.to_number(value),
    };
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        n.min(len as f64) as usize
    }
}

// ── String methods ─────────────────────────────────────

/// Dispatch `string.name(args)`; `None` when strings have no such method
pub(crate) fn string_method(
    interp: &mut Interpreter,
    text: &Rc<str>,
    name: &str,
    args: &[Value],
) -> Option<Eval> {
    if let Err(fault) = interp.spend(text.len()) {
        return Some(Err(fault));
    }
    let result = match name {
        "toUpperCase" => interp.new_string(text.to_uppercase()),
        "toLowerCase" => interp.new_string(text.to_lowercase()),
        "trim" => interp.new_string(text.trim().to_string()),
        "includes" => string_arg(interp, args).map(|needle| Value::Boolean(text.contains(&*needle))),
        "indexOf" => string_arg(interp, args).map(|needle| {
            let position = text
                .find(&*needle)
                .map(|byte| text[..byte].chars().count() as f64);
            Value::Number(position.unwrap_or(-1.0))
        }),
        "slice" => {
            let chars: Vec<char> = text.chars().collect();
            let start = relative_index(interp, args.first(), chars.len(), 0);
            let end = relative_index(interp, args.get(1), chars.len(), chars.len());
            let slice: String = if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            };
            interp.new_string(slice)
        }
        "split" => string_split(interp, text, args),
        _ => return None,
    };
    Some(result)
}

fn string_arg(interp: &Interpreter, args: &[Value]) -> Result<String, ExecutionFault> {
    match args.first() {
        Some(value) => interp.to_js_string(value),
        None => Ok("undefined".into()),
    }
}

fn string_split(interp: &mut Interpreter, text: &Rc<str>, args: &[Value]) -> Eval {
    let separator = match args.first() {
        None | Some(Value::Undefined) => {
            return interp.alloc_array(vec![Value::String(Rc::clone(text))]);
        }
        Some(separator) => interp.to_js_string(separator)?,
    };
    interp.charge_bytes(text.len())?;
    let mut pieces = Vec::new();
    if separator.is_empty() {
        for c in text.chars() {
            interp.spend(1)?;
            pieces.push(Value::string(c.to_string()));
        }
    } else {
        for piece in text.split(separator.as_str()) {
            interp.spend(1)?;
            pieces.push(Value::string(piece));
        }
    }
    interp.alloc_array(pieces)
}
