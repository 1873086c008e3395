use std::collections::BTreeMap;

use crate::{frontend::intern::InternedSymbol, middle::symbols::SymbolOrigin};

/// Where an operator sits relative to its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpPosition {
    Prefix,
    Infix,
    Postfix,
}

impl core::fmt::Display for OpPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Prefix => "prefix",
            Self::Infix => "infix",
            Self::Postfix => "postfix",
        })
    }
}

/// Associativity of an infix operator. `NonAssoc` is representable but has no
/// surface syntax; it conflicts with either written associativity when they
/// meet at one precedence level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
    NonAssoc,
}

impl Associativity {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Left => "assoc_left",
            Self::Right => "assoc_right",
            Self::NonAssoc => "assoc_none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSignature {
    pub param_types: Vec<InternedSymbol>,
    pub return_type: InternedSymbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo {
    pub symbol: InternedSymbol,
    pub position: OpPosition,
    /// Meaningful only for infix operators; higher binds tighter
    pub precedence: i32,
    pub assoc: Associativity,
    pub signature: OperatorSignature,
    pub origin: SymbolOrigin,
}

/// Global operator table: `(symbol, position)` is the natural key, overloads
/// under one key stay in declaration order. Lookup returns all overloads; the
/// resolver and the code generator filter by type.
#[derive(Debug, Default)]
pub struct OperatorTable {
    operators: BTreeMap<(InternedSymbol, OpPosition), Vec<OperatorInfo>>,
}

impl OperatorTable {
    pub fn add(&mut self, info: OperatorInfo) {
        self.operators
            .entry((info.symbol, info.position))
            .or_default()
            .push(info);
    }

    /// First declared overload, if any. Enough for existence checks and for
    /// infix precedence/associativity (which are per-symbol, not per-overload,
    /// in practice: the first declaration wins).
    pub fn find(&self, symbol: InternedSymbol, position: OpPosition) -> Option<&OperatorInfo> {
        self.find_all(symbol, position).first()
    }

    pub fn find_all(&self, symbol: InternedSymbol, position: OpPosition) -> &[OperatorInfo] {
        self.operators
            .get(&(symbol, position))
            .map_or(&[][..], |overloads| overloads.as_slice())
    }

    pub fn has(&self, symbol: InternedSymbol, position: OpPosition) -> bool {
        !self.find_all(symbol, position).is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperatorInfo> {
        self.operators.values().flatten()
    }
}
