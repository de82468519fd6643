//! Per-brick palette bookkeeping during encoding.

use hashbrown::HashMap;

/// Append-only list of the distinct labels of one brick, in the order they
/// are first revealed. Entry 0 is always the root label.
#[derive(Clone, Debug)]
pub struct BrickPalette {
    labels: Vec<u32>,
    index: HashMap<u32, u32>,
}

impl BrickPalette {
    /// Start a palette with the root label in slot 0.
    pub fn new(root_label: u32) -> Self {
        let mut index = HashMap::new();
        index.insert(root_label, 0);
        Self {
            labels: vec![root_label],
            index,
        }
    }

    /// Number of revealed labels.
    #[inline]
    pub fn len(&self) -> u32 {
        self.labels.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false // entry 0 always exists
    }

    /// The most recently revealed label.
    #[inline]
    pub fn last(&self) -> u32 {
        *self.labels.last().expect("palette is never empty")
    }

    /// Distance of `label` from the end of the palette (`1` = newest entry),
    /// or `None` if the label was not revealed yet.
    #[inline]
    pub fn delta_of(&self, label: u32) -> Option<u32> {
        self.index.get(&label).map(|&i| self.len() - i)
    }

    /// Reveal a new label. Duplicate labels are only appended by the legacy
    /// delta path; the reverse index then resolves to the newest entry.
    pub fn advance(&mut self, label: u32) {
        self.index.insert(label, self.len());
        self.labels.push(label);
    }

    /// The revealed labels in order.
    #[inline]
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_occupies_slot_zero() {
        let palette = BrickPalette::new(77);
        assert_eq!(palette.len(), 1);
        assert_eq!(palette.last(), 77);
        assert_eq!(palette.delta_of(77), Some(1));
        assert_eq!(palette.delta_of(5), None);
    }

    #[test]
    fn deltas_count_from_the_end() {
        let mut palette = BrickPalette::new(1);
        palette.advance(2);
        palette.advance(3);
        assert_eq!(palette.labels(), &[1, 2, 3]);
        assert_eq!(palette.delta_of(3), Some(1));
        assert_eq!(palette.delta_of(2), Some(2));
        assert_eq!(palette.delta_of(1), Some(3));
        assert_eq!(palette.last(), 3);
    }

    #[test]
    fn duplicate_resolves_to_newest() {
        let mut palette = BrickPalette::new(1);
        palette.advance(2);
        palette.advance(1);
        assert_eq!(palette.delta_of(1), Some(1));
    }
}
