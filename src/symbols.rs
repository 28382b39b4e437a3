//! Symbol table used to annotate traces and crash reports

use serde::{Deserialize, Serialize};

/// A single symbol from the snapshot's `symbol-store.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Symbol {
    /// Starting address of the symbol
    pub address: u64,

    /// Name of the symbol
    pub symbol: String,
}

/// Addresses further than this from the nearest known symbol are reported
/// without a symbol at all
const MAX_SYMBOL_OFFSET: u64 = 0x10_0000;

/// Find the closest preceding symbol for `address` in an address-sorted
/// symbol table
#[must_use]
pub fn get_symbol(symbols: &[Symbol], address: u64) -> Option<String> {
    let index = match symbols.binary_search_by_key(&address, |sym| sym.address) {
        Ok(index) => index,
        Err(0) => return None,
        Err(index) => index - 1,
    };

    let symbol = &symbols[index];
    let offset = address - symbol.address;
    if offset > MAX_SYMBOL_OFFSET {
        return None;
    }

    if offset == 0 {
        Some(symbol.symbol.clone())
    } else {
        Some(format!("{}+{offset:#x}", symbol.symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<Symbol> {
        vec![
            Symbol {
                address: 0x40_0000,
                symbol: "example!main".to_string(),
            },
            Symbol {
                address: 0x40_1000,
                symbol: "example!parse".to_string(),
            },
        ]
    }

    #[test]
    fn exact_and_offset_lookups() {
        let symbols = table();
        assert_eq!(
            get_symbol(&symbols, 0x40_0000).as_deref(),
            Some("example!main")
        );
        assert_eq!(
            get_symbol(&symbols, 0x40_1014).as_deref(),
            Some("example!parse+0x14")
        );
    }

    #[test]
    fn below_first_symbol_is_unknown() {
        assert_eq!(get_symbol(&table(), 0x1000), None);
    }

    #[test]
    fn far_past_last_symbol_is_unknown() {
        assert_eq!(get_symbol(&table(), 0x40_1000 + 0x20_0000), None);
    }
}
