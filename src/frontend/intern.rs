use std::sync::RwLock;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

/// A cheap, copyable handle to a deduplicated string.
///
/// Identifiers, operator symbols, and literal texts are interned so that the
/// operator resolver can rebuild expression trees without cloning strings and
/// so that name comparisons are index comparisons.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedSymbol(u32);

#[derive(Default)]
struct Interner {
    strings: Vec<&'static str>,
    indices: HashMap<&'static str, u32>,
}

static INTERNER: Lazy<RwLock<Interner>> = Lazy::new(Default::default);

impl InternedSymbol {
    pub fn new(string: &str) -> Self {
        {
            let interner = INTERNER.read().unwrap();
            if let Some(index) = interner.indices.get(string) {
                return Self(*index);
            }
        }

        let mut interner = INTERNER.write().unwrap();

        // Another thread may have raced us between the locks
        if let Some(index) = interner.indices.get(string) {
            return Self(*index);
        }

        let leaked: &'static str = Box::leak(string.to_owned().into_boxed_str());
        let index = interner.strings.len() as u32;
        interner.strings.push(leaked);
        interner.indices.insert(leaked, index);

        Self(index)
    }

    pub fn value(self) -> &'static str {
        INTERNER.read().unwrap().strings[self.0 as usize]
    }
}

impl core::fmt::Debug for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value())
    }
}

impl core::fmt::Display for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}
