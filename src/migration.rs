//! Migration round-trip testing.
//!
//! A migration file holds an `-- UP` block and an optional `-- DOWN` block.
//! File names start with a version (`20240101120000_create_users.sql`) and
//! are applied in lexical order.

use crate::db::pool::ConnectionPool;
use crate::error::{HarnessError, HarnessResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub up: String,
    pub down: String,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Migration {
    /// Parse `content` of the file called `file_name`.
    pub fn parse(file_name: &str, content: &str) -> HarnessResult<Self> {
        let stem = file_name.strip_suffix(".sql").unwrap_or(file_name);
        let digits = stem.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(HarnessError::migration(
                file_name,
                "file name must start with a version number",
            ));
        }
        let (version, rest) = stem.split_at(digits);
        let name = rest.trim_start_matches(['_', '-', '.']).to_string();

        let mut section = Section::Preamble;
        let mut saw_up = false;
        let mut up = String::new();
        let mut down = String::new();
        for line in content.lines() {
            match marker(line) {
                Some(Section::Up) => {
                    if saw_up {
                        return Err(HarnessError::migration(file_name, "duplicate -- UP block"));
                    }
                    saw_up = true;
                    section = Section::Up;
                    continue;
                }
                Some(Section::Down) => {
                    if !saw_up {
                        return Err(HarnessError::migration(
                            file_name,
                            "-- DOWN block must follow the -- UP block",
                        ));
                    }
                    section = Section::Down;
                    continue;
                }
                _ => {}
            }
            let target = match section {
                Section::Up => &mut up,
                Section::Down => &mut down,
                Section::Preamble => continue,
            };
            target.push_str(line);
            target.push('\n');
        }

        if up.trim().is_empty() {
            return Err(HarnessError::migration(file_name, "missing -- UP block"));
        }
        Ok(Self {
            version: version.to_string(),
            name,
            up: up.trim().to_string(),
            down: down.trim().to_string(),
            path: None,
        })
    }

    pub fn id(&self) -> String {
        if self.name.is_empty() {
            self.version.clone()
        } else {
            format!("{}_{}", self.version, self.name)
        }
    }

    pub fn is_reversible(&self) -> bool {
        !self.down.is_empty()
    }
}

fn marker(line: &str) -> Option<Section> {
    let rest = line.trim().strip_prefix("--")?.trim();
    if rest.eq_ignore_ascii_case("up") {
        Some(Section::Up)
    } else if rest.eq_ignore_ascii_case("down") {
        Some(Section::Down)
    } else {
        None
    }
}

/// Load every `*.sql` file in `dir`, sorted by file name.
pub async fn load_dir(dir: impl AsRef<Path>) -> HarnessResult<Vec<Migration>> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut migrations = Vec::with_capacity(files.len());
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = tokio::fs::read_to_string(&path).await?;
        let mut migration = Migration::parse(&file_name, &content)?;
        migration.path = Some(path);
        migrations.push(migration);
    }

    let mut versions = BTreeSet::new();
    for migration in &migrations {
        if !versions.insert(migration.version.as_str()) {
            return Err(HarnessError::migration(
                migration.id(),
                format!("duplicate version {}", migration.version),
            ));
        }
    }
    debug!(dir = %dir.display(), count = migrations.len(), "Loaded migrations");
    Ok(migrations)
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundTripReport {
    pub applied: Vec<String>,
    pub tables_before: Vec<String>,
    pub tables_after_up: Vec<String>,
    pub tables_after_down: Vec<String>,
    /// Tables the up blocks created
    pub created: Vec<String>,
    /// Tables present after the down blocks that were not there before
    pub leftover: Vec<String>,
    /// Tables dropped by the round trip that existed before it
    pub missing: Vec<String>,
}

impl RoundTripReport {
    pub fn restored(&self) -> bool {
        self.leftover.is_empty() && self.missing.is_empty()
    }

    pub fn ensure_restored(self) -> HarnessResult<Self> {
        if self.restored() {
            return Ok(self);
        }
        Err(HarnessError::migration(
            "round-trip",
            format!(
                "table set not restored (left behind: [{}], missing: [{}])",
                self.leftover.join(", "),
                self.missing.join(", ")
            ),
        ))
    }
}

/// Applies migrations through a pool.
#[derive(Debug, Clone)]
pub struct MigrationTester {
    pool: ConnectionPool,
}

impl MigrationTester {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    async fn run_script(&self, migration: &Migration, script: &str) -> HarnessResult<()> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute_script(script).await;
        conn.release().await;
        result.map_err(|e| HarnessError::migration(migration.id(), e.to_string()))
    }

    async fn tables(&self) -> HarnessResult<BTreeSet<String>> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.list_collections().await;
        conn.release().await;
        Ok(result?.into_iter().collect())
    }

    pub async fn apply_up(&self, migration: &Migration) -> HarnessResult<()> {
        self.run_script(migration, &migration.up).await?;
        info!(migration = %migration.id(), "Applied migration");
        Ok(())
    }

    pub async fn apply_down(&self, migration: &Migration) -> HarnessResult<()> {
        if !migration.is_reversible() {
            return Err(HarnessError::migration(migration.id(), "no -- DOWN block"));
        }
        self.run_script(migration, &migration.down).await?;
        info!(migration = %migration.id(), "Reverted migration");
        Ok(())
    }

    pub async fn apply_all_up(&self, migrations: &[Migration]) -> HarnessResult<()> {
        for migration in migrations {
            self.apply_up(migration).await?;
        }
        Ok(())
    }

    /// Revert in reverse order.
    pub async fn apply_all_down(&self, migrations: &[Migration]) -> HarnessResult<()> {
        for migration in migrations.iter().rev() {
            self.apply_down(migration).await?;
        }
        Ok(())
    }

    /// Apply every up block, then every down block in reverse, and compare
    /// the table set with the one before the run.
    pub async fn verify_round_trip(&self, migrations: &[Migration]) -> HarnessResult<RoundTripReport> {
        if let Some(irreversible) = migrations.iter().find(|m| !m.is_reversible()) {
            return Err(HarnessError::migration(irreversible.id(), "no -- DOWN block"));
        }

        let before = self.tables().await?;
        self.apply_all_up(migrations).await?;
        let after_up = self.tables().await?;
        self.apply_all_down(migrations).await?;
        let after_down = self.tables().await?;

        let report = RoundTripReport {
            applied: migrations.iter().map(Migration::id).collect(),
            created: after_up.difference(&before).cloned().collect(),
            leftover: after_down.difference(&before).cloned().collect(),
            missing: before.difference(&after_down).cloned().collect(),
            tables_before: before.into_iter().collect(),
            tables_after_up: after_up.into_iter().collect(),
            tables_after_down: after_down.into_iter().collect(),
        };
        if report.restored() {
            info!(migrations = report.applied.len(), "Migration round trip restored the schema");
        } else {
            warn!(
                leftover = ?report.leftover,
                missing = ?report.missing,
                "Migration round trip did not restore the schema"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE_USERS: &str = "\
-- creates the users table
-- UP
CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);

-- DOWN
DROP TABLE users;
";

    #[test]
    fn test_parse_blocks() {
        let m = Migration::parse("20240101120000_create_users.sql", CREATE_USERS).unwrap();
        assert_eq!(m.version, "20240101120000");
        assert_eq!(m.name, "create_users");
        assert_eq!(m.id(), "20240101120000_create_users");
        assert!(m.up.starts_with("CREATE TABLE users"));
        assert_eq!(m.down, "DROP TABLE users;");
        assert!(m.is_reversible());
    }

    #[test]
    fn test_parse_markers_case_insensitive() {
        let m = Migration::parse("002_x.sql", "--up\nSELECT 1;\n--  Down \nSELECT 2;").unwrap();
        assert_eq!(m.up, "SELECT 1;");
        assert_eq!(m.down, "SELECT 2;");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Migration::parse("create_users.sql", CREATE_USERS),
            Err(HarnessError::Migration { .. })
        ));
        assert!(Migration::parse("001_x.sql", "-- DOWN\nDROP TABLE x;").is_err());
        assert!(Migration::parse("001_x.sql", "CREATE TABLE x (id INT);").is_err());
        assert!(Migration::parse("001_x.sql", "-- UP\nA;\n-- UP\nB;").is_err());
    }

    #[test]
    fn test_up_only_is_irreversible() {
        let m = Migration::parse("003_seed.sql", "-- UP\nINSERT INTO t VALUES (1);").unwrap();
        assert!(!m.is_reversible());
        assert!(m.down.is_empty());
    }

    #[tokio::test]
    async fn test_load_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("002_posts.sql"), "-- UP\nA;\n-- DOWN\nB;").unwrap();
        std::fs::write(dir.path().join("001_users.sql"), CREATE_USERS).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let migrations = load_dir(dir.path()).await.unwrap();
        let ids: Vec<String> = migrations.iter().map(Migration::id).collect();
        assert_eq!(ids, vec!["001_users", "002_posts"]);
        assert!(migrations[0].path.is_some());
    }

    #[tokio::test]
    async fn test_load_dir_duplicate_versions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001_a.sql"), "-- UP\nA;").unwrap();
        std::fs::write(dir.path().join("001_b.sql"), "-- UP\nB;").unwrap();
        assert!(load_dir(dir.path()).await.is_err());
    }
}
