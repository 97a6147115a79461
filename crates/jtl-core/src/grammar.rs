//! Declarative grammar representation: rules over terminals and nonterminals,
//! LR items and the closure computation the table generator is built on.

use crate::ast::Ast;
use crate::error::TemplateError;
use crate::token::{Span, TokenType};

macro_rules! nonterminals {
    ($($name:ident),+ $(,)?) => {
        /// Nonterminal symbols of the grammar. `Start` is reserved for the
        /// synthetic start rule the table generator appends.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum Nonterminal {
            $($name),+
        }

        impl Nonterminal {
            pub const ALL: &'static [Nonterminal] = &[$(Nonterminal::$name),+];
            pub const COUNT: usize = Self::ALL.len();

            #[inline]
            pub fn index(self) -> usize {
                self as usize
            }
        }
    };
}

nonterminals! {
    Start,
    Document,
    EntityList,
    Entity,
    IfTail,
    SwitchBody,
    SwitchCase,
    MatchCases,
    MatchCase,
    ParamsOpt,
    Params,
    ArgList,
    ExprList,
    DoBlock,
    StringParts,
    StringPart,
    Expression,
    Assign,
    Ternary,
    OrExpr,
    AndExpr,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Relational,
    ShiftExpr,
    Additive,
    Multiplicative,
    Unary,
    Postfix,
    Primary,
}

/// A grammar symbol: a terminal token type or a nonterminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Terminal(TokenType),
    Nonterminal(Nonterminal),
}

/// Reduction callback: receives the parse values of the rule body (one per
/// symbol, in order) plus the source span they cover, and builds the value
/// for the rule's nonterminal.
pub type Reduction = Box<dyn Fn(Vec<Ast>, Span) -> Result<Ast, TemplateError> + Send + Sync>;

/// One production rule.
pub struct Rule {
    pub nonterminal: Nonterminal,
    pub symbols: Vec<Symbol>,
    pub reduce: Reduction,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} :=", self.nonterminal)?;
        for s in &self.symbols {
            write!(f, " {:?}", s)?;
        }
        Ok(())
    }
}

/// The complete rule set, indexed by nonterminal for closure expansion.
pub struct Grammar {
    pub rules: Vec<Rule>,
    by_nonterminal: Vec<Vec<usize>>,
}

impl Grammar {
    pub fn new(rules: Vec<Rule>) -> Grammar {
        let mut by_nonterminal = vec![Vec::new(); Nonterminal::COUNT];
        for (i, rule) in rules.iter().enumerate() {
            by_nonterminal[rule.nonterminal.index()].push(i);
        }
        Grammar {
            rules,
            by_nonterminal,
        }
    }

    pub fn rules_for(&self, nt: Nonterminal) -> &[usize] {
        &self.by_nonterminal[nt.index()]
    }
}

/// An LR item: a rule plus a dot position within its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub rule: usize,
    pub dot: usize,
}

impl Item {
    /// The symbol right after the dot, or `None` when the item is reducible.
    pub fn next_symbol(self, grammar: &Grammar) -> Option<Symbol> {
        grammar.rules[self.rule].symbols.get(self.dot).copied()
    }

    /// The same item with the dot advanced over one symbol.
    pub fn right_sibling(self) -> Item {
        Item {
            rule: self.rule,
            dot: self.dot + 1,
        }
    }

    pub fn is_reducible(self, grammar: &Grammar) -> bool {
        self.dot >= grammar.rules[self.rule].symbols.len()
    }
}

/// An insertion-ordered, duplicate-free set of items. Two sets are equal when
/// they contain the same items, regardless of order.
#[derive(Debug, Clone, Default)]
pub struct ItemSet {
    items: Vec<Item>,
}

impl ItemSet {
    pub fn new() -> ItemSet {
        ItemSet { items: Vec::new() }
    }

    pub fn contains(&self, item: Item) -> bool {
        self.items.contains(&item)
    }

    /// Adds the item unless already present; reports whether it was new.
    pub fn insert(&mut self, item: Item) -> bool {
        if self.contains(item) {
            false
        } else {
            self.items.push(item);
            true
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl PartialEq for ItemSet {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self.items.iter().all(|i| other.contains(*i))
    }
}

impl Eq for ItemSet {}

/// Closure by worklist fixpoint: for every item whose dot precedes a
/// nonterminal, add a fresh dot-at-start item for each of its rules. Items
/// already present are not re-added, so the loop terminates.
pub fn closure(grammar: &Grammar, mut set: ItemSet) -> ItemSet {
    let mut i = 0;
    while i < set.len() {
        let item = set.items()[i];
        if let Some(Symbol::Nonterminal(nt)) = item.next_symbol(grammar) {
            for &rule in grammar.rules_for(nt) {
                set.insert(Item { rule, dot: 0 });
            }
        }
        i += 1;
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_grammar() -> Grammar {
        // Document := EntityList ; EntityList := ε | EntityList Entity ; Entity := NUMBER
        let mk = || -> Reduction { Box::new(|mut c: Vec<Ast>, _| Ok(c.pop().unwrap())) };
        Grammar::new(vec![
            Rule {
                nonterminal: Nonterminal::Document,
                symbols: vec![Symbol::Nonterminal(Nonterminal::EntityList)],
                reduce: mk(),
            },
            Rule {
                nonterminal: Nonterminal::EntityList,
                symbols: vec![],
                reduce: Box::new(|_, s| Ok(Ast::Entities(Vec::new(), s))),
            },
            Rule {
                nonterminal: Nonterminal::EntityList,
                symbols: vec![
                    Symbol::Nonterminal(Nonterminal::EntityList),
                    Symbol::Nonterminal(Nonterminal::Entity),
                ],
                reduce: mk(),
            },
            Rule {
                nonterminal: Nonterminal::Entity,
                symbols: vec![Symbol::Terminal(TokenType::Number)],
                reduce: mk(),
            },
        ])
    }

    #[test]
    fn test_closure_expands_nonterminals() {
        let g = toy_grammar();
        let mut seed = ItemSet::new();
        seed.insert(Item { rule: 0, dot: 0 });
        let closed = closure(&g, seed);
        // Document item plus both EntityList rules; Entity is not after a
        // dot at position 0 in rule 2, so its rule is not pulled in.
        assert_eq!(closed.len(), 3);
        assert!(closed.contains(Item { rule: 1, dot: 0 }));
        assert!(closed.contains(Item { rule: 2, dot: 0 }));
    }

    #[test]
    fn test_closure_is_idempotent() {
        let g = toy_grammar();
        let mut seed = ItemSet::new();
        seed.insert(Item { rule: 0, dot: 0 });
        let once = closure(&g, seed);
        let twice = closure(&g, once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_item_set_equality_ignores_order() {
        let mut a = ItemSet::new();
        a.insert(Item { rule: 0, dot: 0 });
        a.insert(Item { rule: 1, dot: 0 });
        let mut b = ItemSet::new();
        b.insert(Item { rule: 1, dot: 0 });
        b.insert(Item { rule: 0, dot: 0 });
        assert_eq!(a, b);
        b.insert(Item { rule: 2, dot: 1 });
        assert_ne!(a, b);
    }
}
