use std::collections::BTreeMap;

use crate::{
    frontend::{intern::InternedSymbol, lexer::SourceLocation},
    index::{simple_index, Index, IndexVec},
    middle::operators::{OpPosition, OperatorInfo, OperatorTable},
};

/// Whether a symbol was seeded by the prelude or written by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOrigin {
    Prelude,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: InternedSymbol,
    pub param_types: Vec<InternedSymbol>,
    /// `None` means the declaration carried no return annotation (void)
    pub return_type: Option<InternedSymbol>,
    pub is_declaration_only: bool,
    pub origin: SymbolOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBinding {
    pub name: InternedSymbol,
    /// `None` until a type is known (annotation or inferred initializer)
    pub type_name: Option<InternedSymbol>,
    pub loc: SourceLocation,
    pub origin: SymbolOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
}

simple_index! {
    /// Identifies a scope within the symbol table's scope arena
    pub struct ScopeId;
}

/// One level of the scope tree. Variable names are unique within a scope;
/// shadowing across scopes is allowed.
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    /// Human-readable label used by `--dump-symbols`
    pub description: String,
    pub children: Vec<ScopeId>,
    variables: BTreeMap<InternedSymbol, VariableBinding>,
}

impl Scope {
    pub fn has_variable_local(&self, name: InternedSymbol) -> bool {
        self.variables.contains_key(&name)
    }

    /// Variables of this level only, sorted by name for deterministic dumps.
    pub fn local_variables(&self) -> Vec<&VariableBinding> {
        let mut variables: Vec<_> = self.variables.values().collect();
        variables.sort_by_key(|binding| binding.name.value());
        variables
    }
}

/// The hierarchical symbol table: global overloaded functions and operators
/// plus the scope tree. The builder moves a current-scope cursor while
/// walking the AST; the tree is preserved afterwards for dumps.
#[derive(Debug)]
pub struct ScopedSymbolTable {
    functions: BTreeMap<InternedSymbol, Vec<FunctionSignature>>,
    operators: OperatorTable,
    scopes: IndexVec<ScopeId, Scope>,
    current: ScopeId,
}

impl Default for ScopedSymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopedSymbolTable {
    pub fn new() -> Self {
        let mut scopes = IndexVec::new();
        let root = scopes.push(Scope {
            kind: ScopeKind::Global,
            parent: None,
            description: String::new(),
            children: Vec::new(),
            variables: BTreeMap::new(),
        });

        Self {
            functions: BTreeMap::new(),
            operators: OperatorTable::default(),
            scopes,
            current: root,
        }
    }

    /* ===== Global symbols ===== */

    pub fn add_function(&mut self, signature: FunctionSignature) {
        self.functions
            .entry(signature.name)
            .or_default()
            .push(signature);
    }

    pub fn find_functions(&self, name: InternedSymbol) -> &[FunctionSignature] {
        self.functions
            .get(&name)
            .map_or(&[][..], |overloads| overloads.as_slice())
    }

    pub fn has_function(&self, name: InternedSymbol) -> bool {
        self.functions.contains_key(&name)
    }

    /// All function names, sorted for deterministic iteration.
    pub fn function_names(&self) -> Vec<InternedSymbol> {
        let mut names: Vec<_> = self.functions.keys().copied().collect();
        names.sort_by_key(|name| name.value());
        names
    }

    pub fn add_operator(&mut self, info: OperatorInfo) {
        self.operators.add(info);
    }

    pub fn find_operator(
        &self,
        symbol: InternedSymbol,
        position: OpPosition,
    ) -> Option<&OperatorInfo> {
        self.operators.find(symbol, position)
    }

    pub fn find_operators(&self, symbol: InternedSymbol, position: OpPosition) -> &[OperatorInfo] {
        self.operators.find_all(symbol, position)
    }

    pub fn has_operator(&self, symbol: InternedSymbol, position: OpPosition) -> bool {
        self.operators.has(symbol, position)
    }

    /// Every operator overload, sorted by symbol then position.
    pub fn all_operators(&self) -> Vec<&OperatorInfo> {
        let mut operators: Vec<_> = self.operators.iter().collect();
        operators.sort_by_key(|info| (info.symbol.value(), info.position));
        operators
    }

    /* ===== Scopes ===== */

    pub fn push_scope(&mut self, kind: ScopeKind, description: impl Into<String>) {
        let parent = self.current;
        let id = self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            description: description.into(),
            children: Vec::new(),
            variables: BTreeMap::new(),
        });

        self.scopes[parent].children.push(id);
        self.current = id;
    }

    pub fn pop_scope(&mut self) {
        let parent = self.scopes[self.current]
            .parent
            .expect("attempted to pop the global scope");
        self.current = parent;
    }

    pub fn current_scope(&self) -> &Scope {
        &self.scopes[self.current]
    }

    pub fn add_variable(&mut self, binding: VariableBinding) {
        self.scopes[self.current].variables.insert(binding.name, binding);
    }

    pub fn root_scope(&self) -> &Scope {
        &self.scopes[ScopeId::new(0)]
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }
}
