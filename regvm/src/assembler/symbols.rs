use std::collections::HashMap;

/// Name-keyed table that remembers declaration order.
#[derive(Clone, Debug)]
pub struct SymbolTable<T> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Default for SymbolTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> SymbolTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new position, or `None` when the name is already taken.
    pub fn insert(&mut self, name: &str, value: T) -> Option<usize> {
        if self.index.contains_key(name) {
            return None;
        }
        let position = self.entries.len();
        self.index.insert(name.to_string(), position);
        self.entries.push((name.to_string(), value));
        Some(position)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name_at(&self, position: usize) -> Option<&str> {
        self.entries.get(position).map(|(name, _)| name.as_str())
    }

    pub fn at(&self, position: usize) -> Option<&T> {
        self.entries.get(position).map(|(_, value)| value)
    }

    pub fn at_mut(&mut self, position: usize) -> Option<&mut T> {
        self.entries.get_mut(position).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn into_entries(self) -> impl Iterator<Item = (String, T)> {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_and_rejects_duplicates() {
        let mut table = SymbolTable::new();
        assert_eq!(table.insert("b", 1), Some(0));
        assert_eq!(table.insert("a", 2), Some(1));
        assert_eq!(table.insert("b", 3), None);
        assert_eq!(table.position("b").and_then(|p| table.at(p)), Some(&1));
        *table.at_mut(1).expect("a") += 10;
        assert_eq!(table.name_at(1), Some("a"));
        assert_eq!(
            table.iter().collect::<Vec<_>>(),
            vec![("b", &1), ("a", &12)]
        );
    }
}
