//! Named background programs.
//!
//! A station keeps several looped beds (day, night, holiday...) and picks one
//! as current. The list lives in `radio_sources.json` next to the settings
//! file. Names are matched case-insensitively; a 1-based position also works.

use crate::error::{Error, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const SOURCES_FILE: &str = "radio_sources.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioSource {
    pub name: String,
    /// Audio file looped as the background program.
    pub path: PathBuf,
}

impl fmt::Display for RadioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioSources {
    sources: Vec<RadioSource>,
    current_source_index: usize,
}

impl RadioSources {
    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join(SOURCES_FILE)
    }

    /// Load the list from `config_dir`. A missing or corrupt file gives an
    /// empty list; an out-of-range current index falls back to the first.
    pub fn load(config_dir: &Path) -> Self {
        let path = Self::path_in(config_dir);
        if !path.exists() {
            return RadioSources::default();
        }
        let mut sources: RadioSources = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(sources) => sources,
                Err(e) => {
                    warn!("Corrupt sources file, starting empty: {}", e);
                    return RadioSources::default();
                }
            },
            Err(e) => {
                warn!("Could not read sources file: {}", e);
                return RadioSources::default();
            }
        };
        if sources.current_source_index >= sources.sources.len() {
            sources.current_source_index = 0;
        }
        sources
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(Self::path_in(config_dir), json)?;
        Ok(())
    }

    pub fn sources(&self) -> &[RadioSource] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn current(&self) -> Option<&RadioSource> {
        self.sources.get(self.current_source_index)
    }

    pub fn is_current(&self, name: &str) -> bool {
        self.current().is_some_and(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Index for a name (case-insensitive) or a 1-based position.
    fn position(&self, key: &str) -> Option<usize> {
        let key = key.trim();
        self.sources
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(key))
            .or_else(|| match key.parse::<usize>() {
                Ok(n) if (1..=self.sources.len()).contains(&n) => Some(n - 1),
                _ => None,
            })
    }

    pub fn find(&self, key: &str) -> Option<&RadioSource> {
        self.position(key).map(|i| &self.sources[i])
    }

    /// Append a source. The first one added becomes current.
    pub fn add(&mut self, name: &str, path: PathBuf) -> Result<&RadioSource> {
        let name = name.trim();
        if self.sources.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
            return Err(Error::DuplicateSource(name.to_string()));
        }
        self.sources.push(RadioSource {
            name: name.to_string(),
            path,
        });
        info!("Added background source '{}'", name);
        Ok(&self.sources[self.sources.len() - 1])
    }

    /// Remove a source. The current one stays current unless it is the one
    /// removed, in which case the first source takes over.
    pub fn remove(&mut self, key: &str) -> Result<RadioSource> {
        let idx = self
            .position(key)
            .ok_or_else(|| Error::SourceNotFound(key.to_string()))?;
        let removed = self.sources.remove(idx);
        if idx < self.current_source_index {
            self.current_source_index -= 1;
        } else if idx == self.current_source_index || self.current_source_index >= self.sources.len() {
            self.current_source_index = 0;
        }
        info!("Removed background source '{}'", removed.name);
        Ok(removed)
    }

    pub fn set_current(&mut self, key: &str) -> Result<&RadioSource> {
        let idx = self
            .position(key)
            .ok_or_else(|| Error::SourceNotFound(key.to_string()))?;
        self.current_source_index = idx;
        info!("Background source set to '{}'", self.sources[idx].name);
        Ok(&self.sources[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> RadioSources {
        let mut s = RadioSources::default();
        s.add("Day", PathBuf::from("beds/day.mp3")).unwrap();
        s.add("Night", PathBuf::from("beds/night.mp3")).unwrap();
        s.add("Holiday", PathBuf::from("beds/holiday.ogg")).unwrap();
        s
    }

    #[test]
    fn first_added_is_current() {
        let s = three();
        assert_eq!(s.len(), 3);
        assert_eq!(s.current().unwrap().name, "Day");
        assert!(s.is_current("day"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut s = three();
        assert!(matches!(
            s.add("NIGHT", PathBuf::from("other.mp3")),
            Err(Error::DuplicateSource(_))
        ));
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn select_by_name_or_position() {
        let mut s = three();
        assert_eq!(s.set_current("night").unwrap().path, PathBuf::from("beds/night.mp3"));
        assert_eq!(s.set_current("3").unwrap().name, "Holiday");
        assert!(matches!(s.set_current("4"), Err(Error::SourceNotFound(_))));
        assert!(matches!(s.set_current("Jazz"), Err(Error::SourceNotFound(_))));
        assert_eq!(s.current().unwrap().name, "Holiday");
    }

    #[test]
    fn removal_keeps_current_pointing_at_same_source() {
        let mut s = three();
        s.set_current("Holiday").unwrap();
        s.remove("Day").unwrap();
        assert_eq!(s.current().unwrap().name, "Holiday");

        s.remove("holiday").unwrap();
        assert_eq!(s.current().unwrap().name, "Night");

        s.remove("Night").unwrap();
        assert!(s.is_empty());
        assert!(s.current().is_none());
        assert!(matches!(s.remove("Night"), Err(Error::SourceNotFound(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = three();
        s.set_current("Night").unwrap();
        s.save(dir.path()).unwrap();
        let loaded = RadioSources::load(dir.path());
        assert_eq!(loaded, s);
        assert_eq!(loaded.current().unwrap().name, "Night");
    }

    #[test]
    fn missing_or_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RadioSources::load(dir.path()).is_empty());
        fs::write(RadioSources::path_in(dir.path()), "[oops").unwrap();
        assert!(RadioSources::load(dir.path()).is_empty());
    }

    #[test]
    fn stale_index_falls_back_to_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            RadioSources::path_in(dir.path()),
            r#"{"sources": [{"name": "Day", "path": "day.mp3"}], "current_source_index": 7}"#,
        )
        .unwrap();
        assert_eq!(RadioSources::load(dir.path()).current().unwrap().name, "Day");
    }
}
