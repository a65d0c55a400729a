use std::collections::BTreeSet;

/// Selected row ids plus the anchor row used for shift-click range extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSet<I: Ord + Copy> {
    ids: BTreeSet<I>,
    anchor: Option<usize>,
}

impl<I: Ord + Copy> Default for SelectionSet<I> {
    fn default() -> Self {
        Self {
            ids: BTreeSet::new(),
            anchor: None,
        }
    }
}

impl<I: Ord + Copy> SelectionSet<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles `id` at row `index` of `visible`.
    ///
    /// With `extend` set and an anchor recorded, every row between the anchor
    /// and `index` (inclusive, either direction) is added. Extension never
    /// deselects. Without an anchor an extended click behaves like a plain one.
    pub fn toggle(&mut self, id: I, index: usize, extend: bool, visible: &[I]) {
        match self.anchor {
            Some(anchor) if extend => {
                let start = anchor.min(index);
                let end = anchor.max(index).min(visible.len().saturating_sub(1));
                if let Some(rows) = visible.get(start..=end) {
                    self.ids.extend(rows.iter().copied());
                }
            }
            _ => {
                if !self.ids.remove(&id) {
                    self.ids.insert(id);
                }
            }
        }
        self.anchor = Some(index);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.anchor = None;
    }

    pub fn contains(&self, id: &I) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn anchor(&self) -> Option<usize> {
        self.anchor
    }

    pub fn ids(&self) -> &BTreeSet<I> {
        &self.ids
    }

    pub fn to_vec(&self) -> Vec<I> {
        self.ids.iter().copied().collect()
    }
}
