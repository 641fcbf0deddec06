//! Selection of volumes and chapter ranges.
//!
//! The driver never prompts; it asks a [`Chooser`]. [`ArgsChooser`] answers from
//! command-line arguments and [`SelectAll`] takes everything.

use std::ops::RangeInclusive;

pub trait Chooser: Send + Sync {
    /// Indices of `candidates` to process, ascending.
    fn choose_subset(&self, candidates: &[String]) -> Vec<usize>;

    /// Inclusive index range of `names` to download, or `None` for nothing.
    fn choose_range(&self, names: &[String]) -> Option<RangeInclusive<usize>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectAll;

impl Chooser for SelectAll {
    fn choose_subset(&self, candidates: &[String]) -> Vec<usize> {
        (0..candidates.len()).collect()
    }

    fn choose_range(&self, names: &[String]) -> Option<RangeInclusive<usize>> {
        if names.is_empty() {
            None
        } else {
            Some(0..=names.len() - 1)
        }
    }
}

/// Selection given up front.
///
/// An empty `volumes` list selects every candidate. A missing `from` starts at the
/// first chapter, a missing `to` ends at the last one; reversed bounds are swapped.
#[derive(Debug, Clone, Default)]
pub struct ArgsChooser {
    pub volumes: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl Chooser for ArgsChooser {
    fn choose_subset(&self, candidates: &[String]) -> Vec<usize> {
        if self.volumes.is_empty() {
            return SelectAll.choose_subset(candidates);
        }
        candidates
            .iter()
            .enumerate()
            .filter(|(_, name)| self.volumes.iter().any(|wanted| wanted.trim() == name.as_str()))
            .map(|(i, _)| i)
            .collect()
    }

    fn choose_range(&self, names: &[String]) -> Option<RangeInclusive<usize>> {
        let last = names.len().checked_sub(1)?;
        let position = |bound: &Option<String>, default: usize| match bound {
            None => Some(default),
            Some(name) => names.iter().position(|n| n == name.trim()),
        };
        let start = position(&self.from, 0)?;
        let end = position(&self.to, last)?;
        Some(start.min(end)..=start.max(end))
    }
}
