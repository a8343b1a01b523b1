use fxhash::FxHashMap;

use super::store::{EVENT_PREFIX, INPUT_PREFIX};

/// Handle to a field resolved by a decoder. Only meaningful for the decoder that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(usize);

/// FieldTable maps field paths (`EVENT:...`, `INPUT:...`) onto decoder-specific field
/// descriptions.
///
/// Decoders fill the table once when their header is loaded; reads afterwards go
/// through the FieldId and never touch the path string again.
#[derive(Debug, Clone)]
pub struct FieldTable<F> {
    ids: FxHashMap<String, FieldId>,
    names: Vec<String>,
    fields: Vec<F>,
}

impl<F> Default for FieldTable<F> {
    fn default() -> Self {
        Self {
            ids: FxHashMap::default(),
            names: Vec::new(),
            fields: Vec::new(),
        }
    }
}

impl<F> FieldTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_event(&mut self, name: &str, field: F) -> FieldId {
        self.insert(format!("{EVENT_PREFIX}{name}"), field)
    }

    pub fn insert_input(&mut self, name: &str, field: F) -> FieldId {
        self.insert(format!("{INPUT_PREFIX}{name}"), field)
    }

    fn insert(&mut self, path: String, field: F) -> FieldId {
        let id = FieldId(self.fields.len());
        self.fields.push(field);
        self.names.push(path.clone());
        self.ids.insert(path, id);
        id
    }

    pub fn resolve(&self, path: &str) -> Option<FieldId> {
        self.ids.get(path).copied()
    }

    pub fn get(&self, id: FieldId) -> Option<&F> {
        self.fields.get(id.0)
    }

    /// All paths in insertion order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.names.clear();
        self.fields.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_once() {
        let mut table = FieldTable::new();
        let ts = table.insert_event("timestamp", 4usize);
        let nb = table.insert_input("n_boards", 0usize);
        assert_eq!(table.resolve("EVENT:timestamp"), Some(ts));
        assert_eq!(table.resolve("INPUT:n_boards"), Some(nb));
        assert_eq!(table.resolve("timestamp"), None);
        assert_eq!(table.get(ts), Some(&4));
        assert_eq!(table.names(), ["EVENT:timestamp", "INPUT:n_boards"]);
    }
}
