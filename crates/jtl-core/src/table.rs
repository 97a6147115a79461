//! Shift/reduce table generation. States are closed item sets discovered by
//! subset construction from a synthetic start rule; duplicate states are
//! folded by item-set equality.
//!
//! Conflict policy: shifts and gotos are installed first, the accept action
//! next, and reduces last. The first reducible item of a state claims every
//! terminal that has no action yet; further reducible items install nothing.

use crate::ast::Ast;
use crate::grammar::{closure, Grammar, Item, ItemSet, Nonterminal, Rule, Symbol};
use crate::token::TokenType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Shift(usize),
    Reduce(usize),
    Accept,
}

/// One parser state: dense action row indexed by terminal, goto row indexed
/// by nonterminal.
pub struct State {
    pub actions: Vec<Option<Action>>,
    pub gotos: Vec<Option<usize>>,
    items: ItemSet,
}

impl State {
    fn new(items: ItemSet) -> State {
        State {
            actions: vec![None; TokenType::COUNT],
            gotos: vec![None; Nonterminal::COUNT],
            items,
        }
    }

    pub fn action(&self, t: TokenType) -> Option<Action> {
        self.actions[t.index()]
    }

    pub fn goto(&self, nt: Nonterminal) -> Option<usize> {
        self.gotos[nt.index()]
    }

    /// Terminals this state has any action for, in declaration order.
    pub fn expected(&self) -> Vec<TokenType> {
        TokenType::ALL
            .iter()
            .copied()
            .filter(|t| self.actions[t.index()].is_some())
            .collect()
    }
}

pub struct ParserTable {
    pub grammar: Grammar,
    pub states: Vec<State>,
    pub start_rule: usize,
}

impl ParserTable {
    /// Runs subset construction over the grammar, starting from
    /// `Start := goal EOF`.
    pub fn generate(grammar: Grammar, goal: Nonterminal) -> ParserTable {
        let mut grammar = grammar;
        let start_rule = grammar.rules.len();
        grammar = {
            let mut rules = std::mem::take(&mut grammar.rules);
            rules.push(Rule {
                nonterminal: Nonterminal::Start,
                symbols: vec![
                    Symbol::Nonterminal(goal),
                    Symbol::Terminal(TokenType::Eof),
                ],
                // Never fired; acceptance happens before this rule reduces.
                reduce: Box::new(|mut children, _| Ok(children.remove(0))),
            });
            Grammar::new(rules)
        };

        let mut states: Vec<State> = Vec::new();
        let mut initial = ItemSet::new();
        initial.insert(Item {
            rule: start_rule,
            dot: 0,
        });
        states.push(State::new(closure(&grammar, initial)));

        let mut i = 0;
        while i < states.len() {
            // Group the state's items by their next symbol, preserving the
            // order symbols first appear in.
            let mut symbols: Vec<Symbol> = Vec::new();
            for item in states[i].items.items() {
                if let Some(sym) = item.next_symbol(&grammar) {
                    if !symbols.contains(&sym) {
                        symbols.push(sym);
                    }
                }
            }

            for sym in symbols {
                let mut seed = ItemSet::new();
                for item in states[i].items.items() {
                    if item.next_symbol(&grammar) == Some(sym) {
                        seed.insert(item.right_sibling());
                    }
                }
                let target_items = closure(&grammar, seed);
                let target = match states.iter().position(|s| s.items == target_items) {
                    Some(existing) => existing,
                    None => {
                        states.push(State::new(target_items));
                        states.len() - 1
                    }
                };
                match sym {
                    Symbol::Terminal(t) => {
                        states[i].actions[t.index()] = Some(Action::Shift(target));
                    }
                    Symbol::Nonterminal(nt) => {
                        states[i].gotos[nt.index()] = Some(target);
                    }
                }
            }

            // Accept when the start rule's dot sits before EOF.
            if states[i].items.contains(Item {
                rule: start_rule,
                dot: 1,
            }) {
                states[i].actions[TokenType::Eof.index()] = Some(Action::Accept);
            }

            // First reducible item claims all unclaimed terminals.
            let reducible = states[i]
                .items
                .items()
                .iter()
                .copied()
                .find(|item| item.is_reducible(&grammar));
            if let Some(item) = reducible {
                for slot in states[i].actions.iter_mut() {
                    if slot.is_none() {
                        *slot = Some(Action::Reduce(item.rule));
                    }
                }
            }

            i += 1;
        }

        ParserTable {
            grammar,
            states,
            start_rule,
        }
    }
}
