//! Computes the minimal new work for a known work from a fresh table of contents.
//!
//! Chapters and volumes are identified by name only and assumed to be
//! append-only. A renamed or reordered chapter breaks the suffix match and yields
//! an empty delta; deletions are never propagated.

use crate::formats::CatalogEntry;
use crate::model::{ChapterRef, Volume, Work};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Volume not in the catalog: fetch every chapter.
    NewVolume,
    /// Known volume with chapters appended upstream.
    NewChapters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDelta {
    pub volume: Volume,
    pub kind: DeltaKind,
    /// Chapters to fetch, in source order.
    pub chapters: Vec<ChapterRef>,
}

impl VolumeDelta {
    pub fn chapter_names(&self) -> Vec<&str> {
        self.chapters.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Deltas for every volume of `work` that has something new, in source order.
pub fn reconcile(entry: &CatalogEntry, work: &Work) -> Vec<VolumeDelta> {
    let mut deltas = Vec::new();

    for volume in &work.volumes {
        match entry.volume(&volume.name) {
            None => {
                if volume.chapters.is_empty() {
                    continue;
                }
                deltas.push(VolumeDelta {
                    volume: volume.clone(),
                    kind: DeltaKind::NewVolume,
                    chapters: volume.chapters.clone(),
                });
            }
            Some(record) => {
                let chapters = new_chapters(&record.chapter_list, &volume.chapters);
                if chapters.is_empty() {
                    continue;
                }
                deltas.push(VolumeDelta {
                    volume: volume.clone(),
                    kind: DeltaKind::NewChapters,
                    chapters,
                });
            }
        }
    }

    deltas
}

/// Chapters of `current` after the first recorded chapter it still contains,
/// minus anything already recorded. No shared chapter means no delta.
pub fn new_chapters(recorded: &[String], current: &[ChapterRef]) -> Vec<ChapterRef> {
    let anchor = recorded
        .iter()
        .find_map(|name| current.iter().position(|c| &c.name == name));

    let Some(anchor) = anchor else {
        return Vec::new();
    };

    current[anchor..]
        .iter()
        .filter(|c| !recorded.contains(&c.name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::formats::CatalogVolume;

    fn chapters(names: &[&str]) -> Vec<ChapterRef> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ChapterRef {
                name: name.to_string(),
                url: Url::parse(&format!("https://ln.hako.vn/c/{i}")).unwrap(),
            })
            .collect()
    }

    fn volume(name: &str, chapter_names: &[&str]) -> Volume {
        Volume {
            chapters: chapters(chapter_names),
            ..Volume::new(name)
        }
    }

    fn entry(volumes: Vec<(&str, Vec<&str>)>) -> CatalogEntry {
        CatalogEntry {
            ln_name: "W".to_string(),
            ln_url: "https://ln.hako.vn/truyen/1".to_string(),
            num_vol: volumes.len(),
            vol_list: volumes
                .iter()
                .map(|(name, chapters)| CatalogVolume {
                    vol_name: name.to_string(),
                    num_chapter: chapters.len(),
                    chapter_list: chapters.iter().map(|c| c.to_string()).collect(),
                    extra: Default::default(),
                })
                .collect(),
            extra: Default::default(),
        }
    }

    fn work(volumes: Vec<Volume>) -> Work {
        Work {
            url: "https://ln.hako.vn/truyen/1".to_string(),
            name: "W".to_string(),
            volumes,
            ..Work::default()
        }
    }

    fn names(refs: &[ChapterRef]) -> Vec<&str> {
        refs.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn appended_volumes_become_whole_volume_deltas_only() {
        let entry = entry(vec![("Vol 1", vec!["C1", "C2"])]);
        let work = work(vec![
            volume("Vol 1", &["C1", "C2"]),
            volume("Vol 2", &["A", "B"]),
            volume("Vol 3", &["X"]),
        ]);

        let deltas = reconcile(&entry, &work);
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| d.kind == DeltaKind::NewVolume));
        assert_eq!(deltas[0].volume.name, "Vol 2");
        assert_eq!(deltas[0].chapter_names(), vec!["A", "B"]);
        assert_eq!(deltas[1].volume.name, "Vol 3");
    }

    #[test]
    fn strict_prefix_yields_exact_suffix() {
        let recorded = ["C1", "C2", "C3"].map(String::from);
        let current = chapters(&["C1", "C2", "C3", "C4", "C5"]);
        assert_eq!(names(&new_chapters(&recorded, &current)), vec!["C4", "C5"]);
    }

    #[test]
    fn disjoint_sequences_yield_no_delta() {
        let recorded = ["Old 1", "Old 2"].map(String::from);
        let current = chapters(&["New 1", "New 2"]);
        assert!(new_chapters(&recorded, &current).is_empty());
    }

    #[test]
    fn anchor_is_first_recorded_name_still_present() {
        // "C1" was removed upstream; "C2" anchors the match.
        let recorded = ["C1", "C2"].map(String::from);
        let current = chapters(&["C2", "C3", "C4"]);
        assert_eq!(names(&new_chapters(&recorded, &current)), vec!["C3", "C4"]);
    }

    #[test]
    fn chapters_before_the_anchor_are_ignored() {
        let recorded = ["C2"].map(String::from);
        let current = chapters(&["Prologue", "C2", "C3"]);
        assert_eq!(names(&new_chapters(&recorded, &current)), vec!["C3"]);
    }

    #[test]
    fn removed_volumes_produce_nothing() {
        let entry = entry(vec![("Vol 1", vec!["C1"]), ("Vol 2", vec!["C1"])]);
        let work = work(vec![volume("Vol 1", &["C1"])]);
        assert!(reconcile(&entry, &work).is_empty());
    }

    #[test]
    fn new_volume_without_chapters_is_skipped() {
        let entry = entry(vec![]);
        let work = work(vec![volume("Vol 1", &[])]);
        assert!(reconcile(&entry, &work).is_empty());
    }

    #[test]
    fn end_to_end_example() {
        let entry = entry(vec![("Vol 1", vec!["C1", "C2"])]);
        let work = work(vec![
            volume("Vol 1", &["C1", "C2", "C3"]),
            volume("Vol 2", &["C1"]),
        ]);

        let deltas = reconcile(&entry, &work);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].volume.name, "Vol 1");
        assert_eq!(deltas[0].kind, DeltaKind::NewChapters);
        assert_eq!(deltas[0].chapter_names(), vec!["C3"]);
        assert_eq!(deltas[1].volume.name, "Vol 2");
        assert_eq!(deltas[1].kind, DeltaKind::NewVolume);
        assert_eq!(deltas[1].chapter_names(), vec!["C1"]);
    }
}
