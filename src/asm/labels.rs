//! Label bookkeeping for the two-pass assembler.

/// One label. `counter` tracks the resolution state across passes:
/// 0 = unseen, 1 = referenced but not yet defined, 2 = defined.
#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub offset: Option<u32>,
    pub counter: u8,
}

/// Outcome of a label definition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Define {
    Ok,
    /// Already defined at a different offset.
    Redefined,
}

/// The label table. Lives across both passes; the discovery pass fills in
/// offsets, the emission pass reads them back and re-runs the identical
/// mutations so redefinition errors surface at the later occurrence.
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: Vec<Label>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self { labels: Vec::new() }
    }

    fn entry(&mut self, name: &str) -> &mut Label {
        if let Some(i) = self.labels.iter().position(|l| l.name == name) {
            &mut self.labels[i]
        } else {
            self.labels.push(Label {
                name: name.to_string(),
                offset: None,
                counter: 0,
            });
            let last = self.labels.len() - 1;
            &mut self.labels[last]
        }
    }

    /// Define `name` at `offset`. A second definition at the same offset is
    /// a no-op (this is how the emission pass revisits discovery-pass
    /// definitions); a second definition elsewhere is a redefinition.
    pub fn define(&mut self, name: &str, offset: u32) -> Define {
        let label = self.entry(name);
        if label.counter == 2 && label.offset != Some(offset) {
            return Define::Redefined;
        }
        label.offset = Some(offset);
        label.counter = 2;
        Define::Ok
    }

    /// Record a reference to `name` and return its offset if known.
    pub fn reference(&mut self, name: &str) -> Option<u32> {
        let label = self.entry(name);
        if label.counter == 0 {
            label.counter = 1;
        }
        label.offset
    }

    /// Offset of a defined label, without touching the counter.
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.labels
            .iter()
            .find(|l| l.name == name && l.counter == 2)
            .and_then(|l| l.offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
