use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::ops::Deref;

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub addr: u64,
    pub size: u64,
}

/// ELF symbol table index.
#[derive(Debug, Clone)]
pub struct SymbolTab(HashMap<String, Symbol>);

impl Deref for SymbolTab {
    type Target = HashMap<String, Symbol>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SymbolTab {
    pub fn new<'data: 'file, 'file, OBJ: Object<'data, 'file>>(
        object_file: &'file OBJ,
    ) -> Option<Self> {
        let symbols = object_file
            .symbols()
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some((
                    name.to_string(),
                    Symbol {
                        name: name.to_string(),
                        kind: symbol.kind(),
                        addr: symbol.address(),
                        size: symbol.size(),
                    },
                ))
            })
            .collect::<HashMap<_, _>>();

        (!symbols.is_empty()).then_some(SymbolTab(symbols))
    }
}
