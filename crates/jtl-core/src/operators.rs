//! The fixed operator library the instruction layer calls into.
//!
//! Every operator takes and returns engine values and reports operand-type
//! mismatches as typed evaluation errors.

use crate::error::EvalError;
use crate::json::{JsonType, JsonValue};
use std::rc::Rc;

pub fn truthy(v: &JsonValue) -> bool {
    v.is_truthy()
}

pub fn stringify(v: &JsonValue) -> String {
    v.display_string()
}

fn type_error(op: &str, operands: &[&JsonValue]) -> EvalError {
    let types: Vec<&str> = operands.iter().map(|v| v.json_type().name()).collect();
    EvalError::incorrect_types(format!("cannot apply '{}' to {}", op, types.join(" and ")))
}

// a + b
pub fn add(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match (a, b) {
        (JsonValue::Int(x), JsonValue::Int(y)) => Ok(JsonValue::Int(x.wrapping_add(*y))),
        _ if a.is_number() && b.is_number() => Ok(JsonValue::Float(
            a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0),
        )),
        (JsonValue::Str(x), _) => Ok(JsonValue::string(format!("{}{}", x, stringify(b)))),
        (_, JsonValue::Str(y)) => Ok(JsonValue::string(format!("{}{}", stringify(a), y))),
        _ => Err(type_error("+", &[a, b])),
    }
}

// a - b
pub fn sub(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match (a, b) {
        (JsonValue::Int(x), JsonValue::Int(y)) => Ok(JsonValue::Int(x.wrapping_sub(*y))),
        _ if a.is_number() && b.is_number() => Ok(JsonValue::Float(
            a.as_f64().unwrap_or(0.0) - b.as_f64().unwrap_or(0.0),
        )),
        _ => Err(type_error("-", &[a, b])),
    }
}

// a * b
pub fn mul(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match (a, b) {
        (JsonValue::Int(x), JsonValue::Int(y)) => Ok(JsonValue::Int(x.wrapping_mul(*y))),
        _ if a.is_number() && b.is_number() => Ok(JsonValue::Float(
            a.as_f64().unwrap_or(0.0) * b.as_f64().unwrap_or(0.0),
        )),
        _ => Err(type_error("*", &[a, b])),
    }
}

// a / b
pub fn div(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    if !a.is_number() || !b.is_number() {
        return Err(type_error("/", &[a, b]));
    }
    let denom = b.as_f64().unwrap_or(0.0);
    if denom == 0.0 {
        return Err(EvalError::incorrect_types("division by zero"));
    }
    if let (JsonValue::Int(x), JsonValue::Int(y)) = (a, b) {
        if x % y == 0 {
            return Ok(JsonValue::Int(x / y));
        }
    }
    Ok(JsonValue::Float(a.as_f64().unwrap_or(0.0) / denom))
}

// a % b
pub fn modulo(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    if !a.is_number() || !b.is_number() {
        return Err(type_error("%", &[a, b]));
    }
    match (a, b) {
        (JsonValue::Int(x), JsonValue::Int(y)) => {
            if *y == 0 {
                Err(EvalError::incorrect_types("modulo by zero"))
            } else {
                Ok(JsonValue::Int(x % y))
            }
        }
        _ => {
            let denom = b.as_f64().unwrap_or(0.0);
            if denom == 0.0 {
                Err(EvalError::incorrect_types("modulo by zero"))
            } else {
                Ok(JsonValue::Float(a.as_f64().unwrap_or(0.0) % denom))
            }
        }
    }
}

// + a
pub fn unary_plus(a: &JsonValue) -> Result<JsonValue, EvalError> {
    if a.is_number() {
        Ok(a.clone())
    } else {
        Err(type_error("+", &[a]))
    }
}

// - a
pub fn neg(a: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Int(n) => Ok(JsonValue::Int(n.wrapping_neg())),
        JsonValue::Float(f) => Ok(JsonValue::Float(-f)),
        _ => Err(type_error("-", &[a])),
    }
}

// ! a
pub fn not(a: &JsonValue) -> JsonValue {
    JsonValue::Bool(!truthy(a))
}

// # a
pub fn size(a: &JsonValue) -> Result<JsonValue, EvalError> {
    match a.length() {
        Some(n) => Ok(JsonValue::Int(n as i64)),
        None => Err(type_error("#", &[a])),
    }
}

// copy a
pub fn copy(a: &JsonValue) -> JsonValue {
    a.deep_copy()
}

// ~ a
pub fn bnot(a: &JsonValue) -> Result<JsonValue, EvalError> {
    match a.as_i64() {
        Some(n) => Ok(JsonValue::Int(!n)),
        None => Err(type_error("~", &[a])),
    }
}

/// Index normalization for arrays: negative indices count from the end;
/// out-of-range indices collapse to the nearest end sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Start,
    End,
    At(usize),
}

fn idx(len: usize, b: &JsonValue) -> Option<Bound> {
    let mut i = b.as_i64()?;
    if i < 0 {
        i += len as i64;
    }
    Some(if i >= len as i64 {
        Bound::End
    } else if i < 0 {
        Bound::Start
    } else {
        Bound::At(i as usize)
    })
}

/// Resolve an array index to a concrete position, or `None` when out of range.
pub fn array_index(len: usize, b: &JsonValue) -> Option<usize> {
    match idx(len, b)? {
        Bound::At(i) => Some(i),
        _ => None,
    }
}

// a[b]
pub fn index(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Array(arr) if b.is_number() => Ok(array_index(arr.len(), b)
            .and_then(|i| arr.get(i).cloned())
            .unwrap_or(JsonValue::Null)),
        JsonValue::Object(obj) => Ok(obj.get(&stringify(b)).cloned().unwrap_or(JsonValue::Null)),
        _ => Err(type_error("[]", &[a, b])),
    }
}

// a.b
pub fn field(a: &JsonValue, name: &str) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Object(obj) => Ok(obj.get(name).cloned().unwrap_or(JsonValue::Null)),
        _ => Err(EvalError::incorrect_types(format!(
            "cannot read member '{}' of {}",
            name,
            a.json_type()
        ))),
    }
}

fn slice_of(arr: &Rc<Vec<JsonValue>>, from: usize, to: usize) -> JsonValue {
    JsonValue::Array(Rc::new(arr[from..to].to_vec()))
}

// a[b..]
pub fn slice_from(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Array(arr) if b.is_number() => Ok(match idx(arr.len(), b) {
            Some(Bound::End) => JsonValue::array(),
            Some(Bound::Start) | None => a.clone(),
            Some(Bound::At(i)) => slice_of(arr, i, arr.len()),
        }),
        _ => Err(type_error("[..]", &[a, b])),
    }
}

// a[..b]
pub fn slice_to(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Array(arr) if b.is_number() => Ok(match idx(arr.len(), b) {
            Some(Bound::End) | None => a.clone(),
            Some(Bound::Start) => JsonValue::array(),
            Some(Bound::At(i)) => slice_of(arr, 0, i),
        }),
        _ => Err(type_error("[..]", &[a, b])),
    }
}

// a[b..c]
pub fn slice(a: &JsonValue, b: &JsonValue, c: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Array(arr) if b.is_number() && c.is_number() => {
            let i1 = idx(arr.len(), b).unwrap_or(Bound::Start);
            let i2 = idx(arr.len(), c).unwrap_or(Bound::Start);
            if i1 == i2 {
                return Ok(JsonValue::array());
            }
            Ok(match (i1, i2) {
                (Bound::End, Bound::Start) | (Bound::Start, Bound::End) => a.clone(),
                (Bound::End, Bound::At(i)) => slice_of(arr, i, arr.len()),
                (Bound::Start, Bound::At(i)) => slice_of(arr, 0, i),
                (Bound::At(i), Bound::End) => slice_of(arr, i, arr.len()),
                (Bound::At(i), Bound::Start) => slice_of(arr, 0, i),
                (Bound::At(i1), Bound::At(i2)) => {
                    if i1 > i2 {
                        slice_of(arr, i2, i1)
                    } else {
                        slice_of(arr, i1, i2)
                    }
                }
                _ => JsonValue::array(),
            })
        }
        _ => Err(type_error("[..]", &[a, b, c])),
    }
}

// a[..]
pub fn slice_full(a: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Array(_) => Ok(a.clone()),
        _ => Err(type_error("[..]", &[a])),
    }
}

// a << b
pub fn blsh(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Ok(JsonValue::Int(x.wrapping_shl(y as u32))),
        _ => Err(type_error("<<", &[a, b])),
    }
}

// a >> b
pub fn brsh(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Ok(JsonValue::Int(x.wrapping_shr(y as u32))),
        _ => Err(type_error(">>", &[a, b])),
    }
}

// a >>> b
pub fn brrsh(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Ok(JsonValue::Int(((x as u64).wrapping_shr(y as u32)) as i64)),
        _ => Err(type_error(">>>", &[a, b])),
    }
}

fn numeric_cmp(op: &str, a: &JsonValue, b: &JsonValue) -> Result<std::cmp::Ordering, EvalError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x
            .partial_cmp(&y)
            .ok_or_else(|| EvalError::incorrect_types(format!("cannot order NaN with '{}'", op))),
        _ => Err(type_error(op, &[a, b])),
    }
}

// a < b
pub fn lt(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::Bool(numeric_cmp("<", a, b)?.is_lt()))
}

// a > b
pub fn gt(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::Bool(numeric_cmp(">", a, b)?.is_gt()))
}

// a <= b
pub fn le(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::Bool(!numeric_cmp("<=", a, b)?.is_gt()))
}

// a >= b
pub fn ge(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::Bool(!numeric_cmp(">=", a, b)?.is_lt()))
}

// a == b
pub fn eq(a: &JsonValue, b: &JsonValue) -> JsonValue {
    JsonValue::Bool(a == b)
}

// a != b
pub fn neq(a: &JsonValue, b: &JsonValue) -> JsonValue {
    JsonValue::Bool(a != b)
}

// a is type
pub fn is(a: &JsonValue, ty: JsonType) -> JsonValue {
    JsonValue::Bool(a.json_type() == ty)
}

// a isnt type
pub fn isnt(a: &JsonValue, ty: JsonType) -> JsonValue {
    JsonValue::Bool(a.json_type() != ty)
}

// a has b
pub fn has(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Object(obj) => Ok(JsonValue::Bool(obj.contains_key(&stringify(b)))),
        _ => Err(type_error("has", &[a, b])),
    }
}

// a hasnt b
pub fn hasnt(a: &JsonValue, b: &JsonValue) -> Result<JsonValue, EvalError> {
    match a {
        JsonValue::Object(obj) => Ok(JsonValue::Bool(!obj.contains_key(&stringify(b)))),
        _ => Err(type_error("hasnt", &[a, b])),
    }
}

// a & b — bitwise on numbers, boolean and otherwise
pub fn band(a: &JsonValue, b: &JsonValue) -> JsonValue {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => JsonValue::Int(x & y),
        _ => JsonValue::Bool(truthy(a) && truthy(b)),
    }
}

// a | b
pub fn bor(a: &JsonValue, b: &JsonValue) -> JsonValue {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => JsonValue::Int(x | y),
        _ => JsonValue::Bool(truthy(a) || truthy(b)),
    }
}

// a ^ b
pub fn bxor(a: &JsonValue, b: &JsonValue) -> JsonValue {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => JsonValue::Int(x ^ y),
        _ => JsonValue::Bool(truthy(a) ^ truthy(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> JsonValue {
        JsonValue::from(j)
    }

    #[test]
    fn test_add_numbers_and_strings() {
        assert_eq!(add(&v(json!(1)), &v(json!(2))).unwrap(), v(json!(3)));
        assert_eq!(add(&v(json!(1.5)), &v(json!(2))).unwrap(), v(json!(3.5)));
        assert_eq!(
            add(&v(json!("n = ")), &v(json!(4))).unwrap(),
            v(json!("n = 4"))
        );
        assert!(add(&v(json!([1])), &v(json!(1))).is_err());
    }

    #[test]
    fn test_div_exactness_and_zero() {
        assert_eq!(div(&v(json!(6)), &v(json!(3))).unwrap(), v(json!(2)));
        assert_eq!(div(&v(json!(7)), &v(json!(2))).unwrap(), v(json!(3.5)));
        assert!(div(&v(json!(1)), &v(json!(0))).is_err());
    }

    #[test]
    fn test_negative_index() {
        let arr = v(json!([10, 20, 30]));
        assert_eq!(index(&arr, &v(json!(-1))).unwrap(), v(json!(30)));
        assert_eq!(index(&arr, &v(json!(5))).unwrap(), JsonValue::Null);
    }

    #[test]
    fn test_object_index_stringifies_key() {
        let obj = v(json!({"3": "x"}));
        assert_eq!(index(&obj, &v(json!(3))).unwrap(), v(json!("x")));
    }

    #[test]
    fn test_slices() {
        let arr = v(json!([1, 2, 3, 4]));
        assert_eq!(
            slice(&arr, &v(json!(1)), &v(json!(3))).unwrap(),
            v(json!([2, 3]))
        );
        assert_eq!(slice_from(&arr, &v(json!(-2))).unwrap(), v(json!([3, 4])));
        assert_eq!(slice_to(&arr, &v(json!(2))).unwrap(), v(json!([1, 2])));
        // Reversed bounds swap.
        assert_eq!(
            slice(&arr, &v(json!(3)), &v(json!(1))).unwrap(),
            v(json!([2, 3]))
        );
        assert_eq!(slice_full(&arr).unwrap(), arr);
    }

    #[test]
    fn test_bitwise_bool_fallback() {
        assert_eq!(band(&v(json!(6)), &v(json!(3))), v(json!(2)));
        assert_eq!(band(&v(json!(true)), &v(json!(0))), v(json!(false)));
        assert_eq!(bxor(&v(json!(true)), &v(json!(true))), v(json!(false)));
    }

    #[test]
    fn test_membership_and_type_tests() {
        let obj = v(json!({"a": 1}));
        assert_eq!(has(&obj, &v(json!("a"))).unwrap(), v(json!(true)));
        assert_eq!(hasnt(&obj, &v(json!("b"))).unwrap(), v(json!(true)));
        assert!(has(&v(json!([1])), &v(json!("a"))).is_err());
        assert_eq!(is(&obj, JsonType::Object), v(json!(true)));
        assert_eq!(isnt(&v(json!(1)), JsonType::String), v(json!(true)));
    }

    #[test]
    fn test_shifts() {
        assert_eq!(blsh(&v(json!(1)), &v(json!(4))).unwrap(), v(json!(16)));
        assert_eq!(brsh(&v(json!(-8)), &v(json!(1))).unwrap(), v(json!(-4)));
        assert_eq!(
            brrsh(&v(json!(-1)), &v(json!(60))).unwrap(),
            v(json!(15))
        );
    }
}
