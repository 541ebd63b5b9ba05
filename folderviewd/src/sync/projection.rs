//! Turns the records of one folder into the ordered list the renderer shows.
//!
//! [`rebuild`] is pure: the same records, directory and config always give
//! the same [`DataSource`], and feeding a built list back in reproduces it.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::model::{DirectoryState, MetadataRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    FileName,
    Modified,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    FileClass,
    ModifiedDay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub sort: SortKey,
    pub ascending: bool,
    pub directory_on_top: bool,
    pub favorite_on_top: bool,
    pub group_by: Option<GroupBy>,
    /// Collapse live-photo pairs to a single entry.
    pub filter_companions: bool,
    pub providers: Option<BTreeSet<String>>,
    /// `oc_id`s of the active search; `Some` means the view is searching.
    pub search_results: Option<BTreeSet<String>>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            sort: SortKey::FileName,
            ascending: true,
            directory_on_top: true,
            favorite_on_top: true,
            group_by: None,
            filter_companions: true,
            providers: None,
            search_results: None,
        }
    }
}

impl DisplayConfig {
    pub fn is_searching(&self) -> bool {
        self.search_results.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// `None` is the default group: records without a group key, or every
    /// record when grouping is off.
    pub key: Option<String>,
    pub range: Range<usize>,
}

/// Immutable snapshot handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSource {
    records: Vec<MetadataRecord>,
    index: HashMap<String, usize>,
    sections: Vec<Section>,
    directory: Option<DirectoryState>,
}

impl DataSource {
    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&MetadataRecord> {
        self.records.get(position)
    }

    pub fn position_of(&self, oc_id: &str) -> Option<usize> {
        self.index.get(oc_id).copied()
    }

    pub fn position_of_name(&self, file_name: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.file_name == file_name)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn directory(&self) -> Option<&DirectoryState> {
        self.directory.as_ref()
    }

    /// Etag of the directory state this snapshot was built against.
    pub fn etag(&self) -> Option<&str> {
        self.directory.as_ref().and_then(|d| d.etag.as_deref())
    }

    pub fn rich_workspace(&self) -> Option<&str> {
        self.directory
            .as_ref()
            .and_then(|d| d.rich_workspace.as_deref())
    }
}

pub fn rebuild(
    records: &[MetadataRecord],
    directory: Option<&DirectoryState>,
    config: &DisplayConfig,
) -> DataSource {
    let mut seen = HashSet::new();
    let visible: Vec<&MetadataRecord> = records
        .iter()
        .filter(|record| passes_filters(record, config))
        .filter(|record| seen.insert(record.oc_id.as_str()))
        .collect();
    let visible = if config.filter_companions {
        drop_companions(visible)
    } else {
        visible
    };

    let mut keyed: Vec<(Option<String>, &MetadataRecord)> = visible
        .into_iter()
        .map(|record| (group_key(record, config.group_by), record))
        .collect();
    keyed.sort_by(|(key_a, a), (key_b, b)| key_a.cmp(key_b).then_with(|| compare(a, b, config)));

    let mut out = DataSource {
        records: Vec::with_capacity(keyed.len()),
        index: HashMap::with_capacity(keyed.len()),
        sections: Vec::new(),
        directory: directory.cloned(),
    };
    for (position, (key, record)) in keyed.into_iter().enumerate() {
        match out.sections.last_mut() {
            Some(section) if section.key == key => section.range.end = position + 1,
            _ => out.sections.push(Section {
                key,
                range: position..position + 1,
            }),
        }
        out.index.insert(record.oc_id.clone(), position);
        out.records.push(record.clone());
    }
    out
}

fn passes_filters(record: &MetadataRecord, config: &DisplayConfig) -> bool {
    if let Some(providers) = &config.providers {
        let Some(provider) = &record.provider else {
            return false;
        };
        if !providers.contains(provider) {
            return false;
        }
    }
    match &config.search_results {
        Some(results) => results.contains(&record.oc_id),
        None => true,
    }
}

/// Keeps one record per live-photo pair: the still image when the pair has
/// one, otherwise the lowest `oc_id`.
fn drop_companions(records: Vec<&MetadataRecord>) -> Vec<&MetadataRecord> {
    let mut canonical: HashMap<(&str, String), &MetadataRecord> = HashMap::new();
    for record in records.iter().copied().filter(|r| r.live_photo) {
        canonical
            .entry(companion_key(record))
            .and_modify(|current| {
                if prefer_as_canonical(record, current) {
                    *current = record;
                }
            })
            .or_insert(record);
    }

    records
        .into_iter()
        .filter(|record| {
            !record.live_photo
                || canonical
                    .get(&companion_key(record))
                    .is_some_and(|kept| kept.oc_id == record.oc_id)
        })
        .collect()
}

fn companion_key(record: &MetadataRecord) -> (&str, String) {
    (record.server_path.as_str(), record.file_stem().to_lowercase())
}

fn prefer_as_canonical(candidate: &MetadataRecord, current: &MetadataRecord) -> bool {
    let candidate_image = file_class(candidate) == "image";
    let current_image = file_class(current) == "image";
    match (candidate_image, current_image) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.oc_id < current.oc_id,
    }
}

fn group_key(record: &MetadataRecord, group_by: Option<GroupBy>) -> Option<String> {
    match group_by? {
        GroupBy::FileClass => Some(file_class(record).to_string()),
        GroupBy::ModifiedDay => {
            let stamp = OffsetDateTime::from_unix_timestamp(record.modified?).ok()?;
            Some(format!(
                "{:04}-{:02}-{:02}",
                stamp.year(),
                u8::from(stamp.month()),
                stamp.day()
            ))
        }
    }
}

pub fn file_class(record: &MetadataRecord) -> &'static str {
    if record.is_directory {
        return "directory";
    }
    if let Some(content_type) = record.content_type.as_deref() {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.starts_with("image/") {
            return "image";
        }
        if content_type.starts_with("video/") {
            return "video";
        }
        if content_type.starts_with("audio/") {
            return "audio";
        }
        if content_type.starts_with("text/")
            || content_type == "application/pdf"
            || content_type.contains("document")
            || content_type.contains("msword")
        {
            return "document";
        }
    }
    match record
        .extension()
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg" | "jpeg" | "png" | "heic" | "gif" | "webp") => "image",
        Some("mov" | "mp4" | "m4v" | "mkv") => "video",
        Some("mp3" | "m4a" | "flac" | "wav") => "audio",
        Some("txt" | "md" | "pdf" | "doc" | "docx" | "odt") => "document",
        _ => "other",
    }
}

fn compare(a: &MetadataRecord, b: &MetadataRecord, config: &DisplayConfig) -> Ordering {
    let directories = if config.directory_on_top {
        b.is_directory.cmp(&a.is_directory)
    } else {
        Ordering::Equal
    };
    let favorites = if config.favorite_on_top {
        b.favorite.cmp(&a.favorite)
    } else {
        Ordering::Equal
    };
    let primary = match config.sort {
        SortKey::FileName => a
            .file_name
            .to_lowercase()
            .cmp(&b.file_name.to_lowercase())
            .then_with(|| a.file_name.cmp(&b.file_name)),
        SortKey::Modified => a.modified.unwrap_or(0).cmp(&b.modified.unwrap_or(0)),
        SortKey::Size => a.size.cmp(&b.size),
    };
    let primary = if config.ascending {
        primary
    } else {
        primary.reverse()
    };

    directories
        .then(favorites)
        .then(primary)
        .then_with(|| a.oc_id.cmp(&b.oc_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(oc_id: &str, name: &str) -> MetadataRecord {
        MetadataRecord::new(oc_id, "alice", "/Photos", name, false)
    }

    fn ids(source: &DataSource) -> Vec<&str> {
        source.records().iter().map(|r| r.oc_id.as_str()).collect()
    }

    #[test]
    fn directories_then_favorites_then_rest() {
        let a = record("1", "a.txt");
        let mut b = record("2", "b");
        b.is_directory = true;
        let mut c = record("3", "c.txt");
        c.favorite = true;

        let config = DisplayConfig {
            directory_on_top: true,
            favorite_on_top: true,
            ..DisplayConfig::default()
        };
        let source = rebuild(&[a, b, c], None, &config);

        assert_eq!(ids(&source), vec!["2", "3", "1"]);
        assert_eq!(source.position_of("2"), Some(0));
        assert_eq!(source.position_of("1"), Some(2));
    }

    #[test]
    fn descending_flag_only_flips_primary_key() {
        let mut dir = record("9", "zeta");
        dir.is_directory = true;
        let records = vec![record("1", "alpha.txt"), record("2", "Beta.txt"), dir];

        let config = DisplayConfig {
            ascending: false,
            ..DisplayConfig::default()
        };
        let source = rebuild(&records, None, &config);

        assert_eq!(ids(&source), vec!["9", "2", "1"]);
    }

    #[test]
    fn oc_id_breaks_ties() {
        let mut first = record("b", "same.txt");
        let mut second = record("a", "same.txt");
        first.size = 5;
        second.size = 5;
        let config = DisplayConfig {
            sort: SortKey::Size,
            ..DisplayConfig::default()
        };

        let source = rebuild(&[first, second], None, &config);

        assert_eq!(ids(&source), vec!["a", "b"]);
    }

    #[test]
    fn rebuilding_a_built_list_is_idempotent() {
        let mut records = Vec::new();
        for (idx, name) in ["IMG_1.HEIC", "IMG_1.MOV", "notes.md", "Archive", "b.png"]
            .iter()
            .enumerate()
        {
            let mut r = record(&format!("{idx}"), name);
            r.modified = Some(1_700_000_000 + (idx as i64) * 90_000);
            r.favorite = idx % 2 == 0;
            r.is_directory = *name == "Archive";
            r.live_photo = name.starts_with("IMG_1");
            records.push(r);
        }
        let config = DisplayConfig {
            group_by: Some(GroupBy::FileClass),
            sort: SortKey::Modified,
            ascending: false,
            ..DisplayConfig::default()
        };

        let once = rebuild(&records, None, &config);
        let twice = rebuild(once.records(), None, &config);

        assert_eq!(once, twice);
    }

    #[test]
    fn live_photo_pair_keeps_the_image() {
        let mut still = record("2", "IMG_7.HEIC");
        still.live_photo = true;
        still.content_type = Some("image/heic".into());
        let mut motion = record("1", "IMG_7.MOV");
        motion.live_photo = true;
        motion.content_type = Some("video/quicktime".into());
        let unrelated = record("3", "IMG_7.txt");

        let source = rebuild(&[motion, still, unrelated], None, &DisplayConfig::default());

        assert_eq!(ids(&source), vec!["2", "3"]);
    }

    #[test]
    fn companion_filter_can_be_disabled() {
        let mut still = record("2", "IMG_7.HEIC");
        still.live_photo = true;
        let mut motion = record("1", "IMG_7.MOV");
        motion.live_photo = true;
        let config = DisplayConfig {
            filter_companions: false,
            ..DisplayConfig::default()
        };

        assert_eq!(rebuild(&[still, motion], None, &config).len(), 2);
    }

    #[test]
    fn provider_and_search_filters_apply() {
        let mut a = record("1", "a.txt");
        a.provider = Some("files".into());
        let mut b = record("2", "b.txt");
        b.provider = Some("talk".into());
        let c = record("3", "c.txt");

        let by_provider = DisplayConfig {
            providers: Some(BTreeSet::from(["files".to_string()])),
            ..DisplayConfig::default()
        };
        assert_eq!(
            ids(&rebuild(&[a.clone(), b.clone(), c.clone()], None, &by_provider)),
            vec!["1"]
        );

        let searching = DisplayConfig {
            search_results: Some(BTreeSet::from(["2".to_string(), "3".to_string()])),
            ..DisplayConfig::default()
        };
        assert!(searching.is_searching());
        assert_eq!(ids(&rebuild(&[a, b, c], None, &searching)), vec!["2", "3"]);
    }

    #[test]
    fn grouping_builds_contiguous_sections() {
        let mut dir = record("1", "Albums");
        dir.is_directory = true;
        let mut photo = record("2", "a.jpg");
        photo.content_type = Some("image/jpeg".into());
        let mut photo2 = record("3", "b.jpg");
        photo2.content_type = Some("image/jpeg".into());
        let doc = record("4", "c.pdf");

        let config = DisplayConfig {
            group_by: Some(GroupBy::FileClass),
            ..DisplayConfig::default()
        };
        let source = rebuild(&[photo2, doc, dir, photo], None, &config);

        let sections: Vec<(Option<&str>, Range<usize>)> = source
            .sections()
            .iter()
            .map(|s| (s.key.as_deref(), s.range.clone()))
            .collect();
        assert_eq!(
            sections,
            vec![
                (Some("directory"), 0..1),
                (Some("document"), 1..2),
                (Some("image"), 2..4),
            ]
        );
    }

    #[test]
    fn undated_records_fall_into_default_group_first() {
        let mut dated = record("1", "a.txt");
        dated.modified = Some(0);
        let undated = record("2", "b.txt");
        let config = DisplayConfig {
            group_by: Some(GroupBy::ModifiedDay),
            ..DisplayConfig::default()
        };

        let source = rebuild(&[dated, undated], None, &config);

        assert_eq!(source.sections()[0].key, None);
        assert_eq!(source.sections()[1].key.as_deref(), Some("1970-01-01"));
        assert_eq!(ids(&source), vec!["2", "1"]);
    }

    #[test]
    fn duplicate_ids_appear_once() {
        let source = rebuild(
            &[record("1", "a.txt"), record("1", "a.txt")],
            None,
            &DisplayConfig::default(),
        );
        assert_eq!(source.len(), 1);
        assert_eq!(source.position_of("1"), Some(0));
    }

    #[test]
    fn records_directory_etag() {
        let mut directory = DirectoryState::empty("alice", "/Photos");
        directory.etag = Some("e1".into());
        directory.rich_workspace = Some("# Trip".into());

        let source = rebuild(&[], Some(&directory), &DisplayConfig::default());

        assert!(source.is_empty());
        assert!(source.sections().is_empty());
        assert_eq!(source.etag(), Some("e1"));
        assert_eq!(source.rich_workspace(), Some("# Trip"));
    }
}
