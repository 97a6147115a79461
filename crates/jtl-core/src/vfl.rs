//! Variable/function layers. Layers form a parent-linked arena owned by the
//! context: reads walk outward, partial layers (frames, function calls) share
//! the construction scope of their parent, and function-call layers are
//! parented at the layer the function was defined on rather than the caller.

use crate::json::JsonValue;
use crate::runtime::FunctionDefinition;
use std::collections::HashMap;
use std::rc::Rc;

/// One scope layer.
pub struct Layer {
    pub name: String,
    /// Lexical parent used for lookups.
    pub parent: Option<usize>,
    /// Layer to return to when this one is popped. Differs from `parent`
    /// for function-call layers.
    pub below: Option<usize>,
    /// Partial layers delegate iterator and switch lookups to their parent.
    pub partial: bool,
    /// Set once a function from this layer has been called; definitions are
    /// rejected afterwards.
    pub used: bool,
    /// Index of the construction value `_` refers to, if any.
    pub scope: Option<usize>,
    /// Index of the construction value `$` refers to, if any.
    pub dollar_scope: Option<usize>,
    pub variables: HashMap<String, JsonValue>,
    pub functions: HashMap<String, Vec<Rc<FunctionDefinition>>>,
    pub iterator: Option<ValueIter>,
    pub switching: Option<JsonValue>,
}

impl Layer {
    pub fn new(name: impl Into<String>, parent: Option<usize>, below: Option<usize>) -> Layer {
        Layer {
            name: name.into(),
            parent,
            below,
            partial: false,
            used: false,
            scope: None,
            dollar_scope: None,
            variables: HashMap::new(),
            functions: HashMap::new(),
            iterator: None,
            switching: None,
        }
    }
}

/// An in-progress loop iteration source.
pub enum ValueIter {
    /// Numeric range, exclusive of `to`, stepping up or down.
    Range { current: i64, to: i64, step: i64 },
    Array {
        values: Rc<Vec<JsonValue>>,
        index: usize,
    },
    /// Character-wise iteration over a string.
    Chars { chars: Vec<char>, index: usize },
    /// Key/value iteration over an object's members.
    Entries {
        entries: Vec<(String, JsonValue)>,
        index: usize,
    },
}

impl ValueIter {
    /// Range iterator from `from` (inclusive) to `to` (exclusive), counting
    /// down when `from > to`. Equal bounds yield nothing.
    pub fn range(from: i64, to: i64) -> ValueIter {
        let step = match from.cmp(&to) {
            std::cmp::Ordering::Less => 1,
            std::cmp::Ordering::Greater => -1,
            std::cmp::Ordering::Equal => 0,
        };
        ValueIter::Range {
            current: from,
            to,
            step,
        }
    }

    pub fn over_array(values: Rc<Vec<JsonValue>>) -> ValueIter {
        ValueIter::Array { values, index: 0 }
    }

    pub fn over_chars(s: &str) -> ValueIter {
        ValueIter::Chars {
            chars: s.chars().collect(),
            index: 0,
        }
    }

    pub fn over_entries(entries: Vec<(String, JsonValue)>) -> ValueIter {
        ValueIter::Entries { entries, index: 0 }
    }

    /// An iterator that yields nothing.
    pub fn empty() -> ValueIter {
        ValueIter::range(0, 0)
    }

    pub fn has_next(&self) -> bool {
        match self {
            ValueIter::Range { current, to, step } => {
                if *step > 0 {
                    current < to
                } else if *step < 0 {
                    current > to
                } else {
                    false
                }
            }
            ValueIter::Array { values, index } => *index < values.len(),
            ValueIter::Chars { chars, index } => *index < chars.len(),
            ValueIter::Entries { entries, index } => *index < entries.len(),
        }
    }

    pub fn next_value(&mut self) -> Option<JsonValue> {
        if !self.has_next() {
            return None;
        }
        match self {
            ValueIter::Range { current, step, .. } => {
                let v = *current;
                *current += *step;
                Some(JsonValue::Int(v))
            }
            ValueIter::Array { values, index } => {
                let v = values[*index].clone();
                *index += 1;
                Some(v)
            }
            ValueIter::Chars { chars, index } => {
                let v = JsonValue::string(chars[*index].to_string());
                *index += 1;
                Some(v)
            }
            ValueIter::Entries { entries, index } => {
                let v = entries[*index].1.clone();
                *index += 1;
                Some(v)
            }
        }
    }

    /// Next key/value pair; only entry iterators have keys.
    pub fn next_pair(&mut self) -> Option<(String, JsonValue)> {
        match self {
            ValueIter::Entries { entries, index } if *index < entries.len() => {
                let pair = entries[*index].clone();
                *index += 1;
                Some(pair)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut it: ValueIter) -> Vec<JsonValue> {
        let mut out = Vec::new();
        while let Some(v) = it.next_value() {
            out.push(v);
        }
        out
    }

    #[test]
    fn test_range_up_is_end_exclusive() {
        assert_eq!(
            drain(ValueIter::range(0, 3)),
            vec![JsonValue::Int(0), JsonValue::Int(1), JsonValue::Int(2)]
        );
    }

    #[test]
    fn test_range_down() {
        assert_eq!(
            drain(ValueIter::range(3, 0)),
            vec![JsonValue::Int(3), JsonValue::Int(2), JsonValue::Int(1)]
        );
    }

    #[test]
    fn test_range_empty_when_equal() {
        assert!(drain(ValueIter::range(5, 5)).is_empty());
        assert!(drain(ValueIter::empty()).is_empty());
    }

    #[test]
    fn test_chars_iterate_characters() {
        assert_eq!(
            drain(ValueIter::over_chars("ab")),
            vec![JsonValue::string("a"), JsonValue::string("b")]
        );
    }

    #[test]
    fn test_entries_yield_pairs() {
        let mut it = ValueIter::over_entries(vec![
            ("a".to_string(), JsonValue::Int(1)),
            ("b".to_string(), JsonValue::Int(2)),
        ]);
        assert_eq!(it.next_pair(), Some(("a".to_string(), JsonValue::Int(1))));
        assert!(it.has_next());
        assert_eq!(it.next_pair(), Some(("b".to_string(), JsonValue::Int(2))));
        assert_eq!(it.next_pair(), None);
    }
}
