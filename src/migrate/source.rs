//! Migration files on disk.
//!
//! A source directory holds `<version>_<name>.up.sql` and
//! `<version>_<name>.down.sql` pairs. Versions are unsigned integers; the
//! down file is optional. Files that do not match the pattern are ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::ConfigError;
use crate::migrate::MigrationError;
use crate::storage::StorageError;

/// One versioned migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub up: Option<String>,
    pub down: Option<String>,
}

/// Ordered set of migrations loaded from one directory.
#[derive(Debug, Clone, Default)]
pub struct MigrationSource {
    dir: PathBuf,
    migrations: BTreeMap<u64, Migration>,
}

fn file_regex() -> &'static Regex {
    static FILE_REGEX: OnceLock<Regex> = OnceLock::new();
    FILE_REGEX.get_or_init(|| {
        Regex::new(r"^([0-9]+)_(.+)\.(up|down)\.sql$").expect("failed to compile migration regex")
    })
}

impl MigrationSource {
    /// Load every migration under `dir`.
    ///
    /// A missing directory is a configuration error. Duplicate versions and
    /// unparsable version numbers are source errors.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ConfigError::invalid(format!(
                "migration directory '{}' does not exist",
                dir.display()
            ))
            .into());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(ConfigError::from)? {
            let path = entry.map_err(ConfigError::from)?.path();
            if path.is_file() {
                files.push(path);
            }
        }

        let mut source = Self {
            dir: dir.to_path_buf(),
            migrations: BTreeMap::new(),
        };
        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_regex().is_match(file_name) {
                tracing::debug!(file = %path.display(), "Skipping non-migration file");
                continue;
            }
            let body = std::fs::read_to_string(&path).map_err(ConfigError::from)?;
            source.add_file(file_name, body)?;
        }

        tracing::debug!(
            dir = %dir.display(),
            count = source.migrations.len(),
            "Loaded migrations"
        );
        Ok(source)
    }

    /// Build a source from `(file_name, body)` pairs.
    pub fn from_files<'a>(
        files: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, StorageError> {
        let mut source = Self::default();
        for (name, body) in files {
            source.add_file(name, body.to_string())?;
        }
        Ok(source)
    }

    fn add_file(&mut self, file_name: &str, body: String) -> Result<(), MigrationError> {
        let caps = file_regex()
            .captures(file_name)
            .ok_or_else(|| MigrationError::Source(format!("invalid file name '{file_name}'")))?;
        let version: u64 = caps[1]
            .parse()
            .map_err(|e| MigrationError::Source(format!("invalid version in '{file_name}': {e}")))?;
        let name = caps[2].to_string();

        let migration = self.migrations.entry(version).or_insert_with(|| Migration {
            version,
            name: name.clone(),
            up: None,
            down: None,
        });
        if migration.name != name {
            return Err(MigrationError::Source(format!(
                "duplicate migration version {version}: '{}' and '{name}'",
                migration.name
            )));
        }

        let slot = match &caps[3] {
            "up" => &mut migration.up,
            _ => &mut migration.down,
        };
        if slot.is_some() {
            return Err(MigrationError::Source(format!(
                "duplicate migration file '{file_name}'"
            )));
        }
        *slot = Some(body);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn get(&self, version: u64) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    /// Versions in ascending order.
    pub fn versions(&self) -> impl Iterator<Item = u64> + '_ {
        self.migrations.keys().copied()
    }

    /// Migrations newer than `current`, ascending.
    pub fn pending(&self, current: Option<u64>) -> impl Iterator<Item = &Migration> {
        let start = current.map_or(0, |v| v.saturating_add(1));
        let skip_all = current == Some(u64::MAX);
        self.migrations
            .range(start..)
            .map(|(_, m)| m)
            .filter(move |_| !skip_all)
    }

    /// Migrations at or below `current`, descending.
    pub fn applied(&self, current: Option<u64>) -> impl Iterator<Item = &Migration> {
        let end = current.unwrap_or(0);
        let none = current.is_none();
        self.migrations
            .range(..=end)
            .rev()
            .map(|(_, m)| m)
            .filter(move |_| !none)
    }

    /// Version preceding `version`, if any.
    pub fn previous(&self, version: u64) -> Option<u64> {
        self.migrations.range(..version).next_back().map(|(v, _)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_orders_and_pairs_files() {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("2_add_index.up.sql", "CREATE INDEX i ON t (a);"),
            ("1_init.up.sql", "CREATE TABLE t (a INT);"),
            ("1_init.down.sql", "DROP TABLE t;"),
            ("README.md", "ignored"),
        ] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        let source = MigrationSource::load(dir.path()).unwrap();
        assert_eq!(source.versions().collect::<Vec<_>>(), vec![1, 2]);
        let init = source.get(1).unwrap();
        assert_eq!(init.name, "init");
        assert_eq!(init.down.as_deref(), Some("DROP TABLE t;"));
        assert!(source.get(2).unwrap().down.is_none());
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MigrationSource::load(dir.path().join("postgres")).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let err = MigrationSource::from_files([
            ("1_init.up.sql", "SELECT 1;"),
            ("1_other.up.sql", "SELECT 2;"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::Source(_))
        ));

        let err = MigrationSource::from_files([
            ("1_init.up.sql", "SELECT 1;"),
            ("01_init.up.sql", "SELECT 1;"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::Source(_))
        ));
    }

    #[test]
    fn test_pending_and_applied() {
        let source = MigrationSource::from_files([
            ("1_a.up.sql", ""),
            ("5_b.up.sql", ""),
            ("9_c.up.sql", ""),
        ])
        .unwrap();

        let pending: Vec<u64> = source.pending(None).map(|m| m.version).collect();
        assert_eq!(pending, vec![1, 5, 9]);
        let pending: Vec<u64> = source.pending(Some(5)).map(|m| m.version).collect();
        assert_eq!(pending, vec![9]);

        let applied: Vec<u64> = source.applied(Some(5)).map(|m| m.version).collect();
        assert_eq!(applied, vec![5, 1]);
        assert_eq!(source.applied(None).count(), 0);

        assert_eq!(source.previous(5), Some(1));
        assert_eq!(source.previous(1), None);
    }
}
