use url::Url;

/// A freshly fetched work with its full table of contents.
#[derive(Debug, Clone, Default)]
pub struct Work {
    pub url: String,
    pub name: String,
    pub author: String,
    pub series_info: String,
    pub summary: String,
    pub fact_item: String,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub url: Option<Url>,
    pub cover_url: Option<Url>,
    pub chapters: Vec<ChapterRef>,
}

impl Volume {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
            cover_url: None,
            chapters: Vec::new(),
        }
    }

    /// Appends a chapter, keeping names unique. A repeated name keeps its first
    /// position and takes the latest URL.
    pub fn push_chapter(&mut self, name: impl Into<String>, url: Url) {
        let name = name.into();
        match self.chapters.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.url = url,
            None => self.chapters.push(ChapterRef { name, url }),
        }
    }

    pub fn chapter_names(&self) -> Vec<&str> {
        self.chapters.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub name: String,
    pub url: Url,
}

/// Ephemeral unit of work for the assembly pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    /// Stable position in the target sequence, independent of completion order.
    pub index: usize,
    pub url: Url,
    pub label: String,
}
