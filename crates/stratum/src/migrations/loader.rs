//! Filesystem discovery and parsing of SQL migration sources
//!
//! Each `<id>.sql` file in a source directory becomes one migration whose
//! id is the file stem. Directives live in the leading comment block:
//!
//! ```sql
//! -- depends: 0001-initial 0002-seed
//! -- transactional: false
//! CREATE INDEX ...;
//! ```
//!
//! A sibling `<id>.rollback.sql` supplies the inverse statements. Files
//! whose stem starts with `post-apply` become batch hooks; files starting
//! with the tempfile prefix are editor droppings and are skipped.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{MigrateError, MigrateResult};

use super::definitions::{Migration, MigrationBuilder, MigrationList, Step};

/// Files created by migration tooling before they are renamed into place
pub const TEMPFILE_PREFIX: &str = "_tmp_";

const POST_APPLY_PREFIX: &str = "post-apply";
const ROLLBACK_SUFFIX: &str = ".rollback.sql";

static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*--\s*(transactional|depends)\s*:\s*(.*?)\s*$").unwrap()
});
static COMMENT_OR_BLANK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(--.*)?$").unwrap());

/// Split a SQL script into individual statements. The parser handles
/// semicolons inside strings and dollar-quoted bodies; on a parse failure
/// we fall back to naive splitting so unusual DDL still runs.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed.iter().map(|stmt| format!("{stmt};")).collect(),
        Err(e) => {
            tracing::warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| format!("{s};"))
                .collect()
        }
    }
}

#[derive(Debug, Default)]
struct Directives {
    depends: Vec<String>,
    transactional: Option<String>,
}

/// Directives are only honored in the leading run of comment and blank
/// lines; a repeated key appends to the earlier value.
fn parse_directives(source: &str) -> Directives {
    let mut out = Directives::default();
    for line in source.lines() {
        if !COMMENT_OR_BLANK_RE.is_match(line) {
            break;
        }
        if let Some(caps) = DIRECTIVE_RE.captures(line) {
            let value = caps.get(2).map_or("", |m| m.as_str());
            match caps.get(1).map_or("", |m| m.as_str()) {
                "depends" => {
                    out.depends
                        .extend(value.split_whitespace().map(str::to_string));
                }
                "transactional" => match &mut out.transactional {
                    Some(existing) => {
                        existing.push(' ');
                        existing.push_str(value);
                    }
                    None => out.transactional = Some(value.to_string()),
                },
                _ => {}
            }
        }
    }
    out
}

/// Pair apply statements with reversed rollback statements. Rollback files
/// usually mirror their apply file statement for statement; when the counts
/// differ the surplus side runs with no counterpart.
fn pair_steps(apply: Vec<String>, rollback: Vec<String>) -> Vec<Step> {
    let mut rollback: Vec<Option<String>> = rollback.into_iter().rev().map(Some).collect();
    let count = apply.len().max(rollback.len());
    rollback.resize(count, None);
    let mut apply: Vec<Option<String>> = apply.into_iter().map(Some).collect();
    apply.resize(count, None);

    apply
        .into_iter()
        .zip(rollback)
        .map(|(fwd, back)| Step {
            body: super::definitions::StepBody::Sql {
                apply: fwd,
                rollback: back,
            },
            ignore_errors: Default::default(),
        })
        .collect()
}

fn parse_migration_file(id: &str, path: &Path) -> MigrateResult<Migration> {
    let source = fs::read_to_string(path)?;
    let directives = parse_directives(&source);

    let use_transactions = match directives.transactional.as_deref() {
        None => true,
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(MigrateError::bad_migration(
                    id,
                    format!("transactional directive must be true or false, got {value:?}"),
                ))
            }
        },
    };

    let apply_statements = split_sql_statements(&source);
    let rollback_path = path.with_file_name(format!("{id}{ROLLBACK_SUFFIX}"));
    let rollback_statements = if rollback_path.is_file() {
        // any directives in the rollback file are ignored
        split_sql_statements(&fs::read_to_string(&rollback_path)?)
    } else {
        Vec::new()
    };

    let mut builder = MigrationBuilder::new(id)
        .depends(directives.depends)
        .transactional(use_transactions)
        .path(path.to_path_buf());
    if id.starts_with(POST_APPLY_PREFIX) {
        builder = builder.post_apply();
    }
    for step in pair_steps(apply_statements, rollback_statements) {
        builder = builder.raw_step(step);
    }
    Ok(builder.build())
}

fn is_migration_file(name: &str) -> bool {
    name.ends_with(".sql")
        && !name.ends_with(ROLLBACK_SUFFIX)
        && !name.starts_with(TEMPFILE_PREFIX)
        && !name.starts_with('.')
}

/// Read all migrations from the given source directories.
///
/// Discovery is two-phase: every id is registered first so dependency
/// references can be validated against the whole set, then files are
/// parsed in name order per directory. A dependency naming an id outside
/// the set is a [`MigrateError::BadMigration`]; a duplicate id across
/// directories is a [`MigrateError::Conflict`].
pub fn read_migrations(sources: &[PathBuf]) -> MigrateResult<MigrationList> {
    let mut discovered: Vec<(String, PathBuf)> = Vec::new();
    for dir in sources {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_migration_file(name))
            .collect();
        names.sort();
        for name in names {
            let id = name.trim_end_matches(".sql").to_string();
            discovered.push((id, dir.join(name)));
        }
    }

    let known: BTreeSet<&str> = discovered.iter().map(|(id, _)| id.as_str()).collect();

    let mut list = MigrationList::new();
    for (id, path) in &discovered {
        let migration = parse_migration_file(id, path)?;
        for dep in migration.depends() {
            if !known.contains(dep.as_str()) {
                return Err(MigrateError::bad_migration(
                    id,
                    format!("depends on unknown migration {dep:?}"),
                ));
            }
        }
        if migration.is_post_apply() {
            list.push_post_apply(migration);
        } else {
            list.push(migration)?;
        }
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn directives_stop_at_first_statement() {
        let parsed = parse_directives(
            "-- depends: a b\n\n-- transactional: false\nCREATE TABLE t (x INT);\n-- depends: c\n",
        );
        assert_eq!(parsed.depends, vec!["a", "b"]);
        assert_eq!(parsed.transactional.as_deref(), Some("false"));
    }

    #[test]
    fn repeated_depends_accumulate() {
        let parsed = parse_directives("-- depends: a\n-- depends: b c\nSELECT 1;\n");
        assert_eq!(parsed.depends, vec!["a", "b", "c"]);
    }

    #[test]
    fn statements_split_on_semicolons() {
        let split = split_sql_statements("CREATE TABLE t (x INT); INSERT INTO t VALUES (1);");
        assert_eq!(split.len(), 2);
        assert!(split[0].starts_with("CREATE TABLE"));
        assert!(split[1].starts_with("INSERT"));
    }

    #[test]
    fn rollback_statements_pair_in_reverse() {
        let steps = pair_steps(
            vec!["A1".into(), "A2".into()],
            vec!["R1".into(), "R2".into()],
        );
        assert_eq!(steps.len(), 2);
        match &steps[0].body {
            super::super::definitions::StepBody::Sql { apply, rollback } => {
                assert_eq!(apply.as_deref(), Some("A1"));
                assert_eq!(rollback.as_deref(), Some("R2"));
            }
            _ => panic!("expected sql step"),
        }
    }

    #[test]
    fn surplus_apply_statements_get_no_rollback() {
        let steps = pair_steps(vec!["A1".into(), "A2".into()], vec!["R1".into()]);
        assert_eq!(steps.len(), 2);
        match &steps[1].body {
            super::super::definitions::StepBody::Sql { apply, rollback } => {
                assert_eq!(apply.as_deref(), Some("A2"));
                assert!(rollback.is_none());
            }
            _ => panic!("expected sql step"),
        }
    }

    #[test]
    fn reads_sources_and_skips_tempfiles() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001-users.sql", "CREATE TABLE users (id INT);");
        write(dir.path(), "0001-users.rollback.sql", "DROP TABLE users;");
        write(
            dir.path(),
            "0002-posts.sql",
            "-- depends: 0001-users\nCREATE TABLE posts (id INT);",
        );
        write(dir.path(), "_tmp_scratch.sql", "SELECT 1;");
        write(dir.path(), "notes.txt", "not a migration");
        write(
            dir.path(),
            "post-apply-refresh.sql",
            "DELETE FROM cache_table;",
        );

        let list = read_migrations(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().id(), "0001-users");
        assert_eq!(list.get(1).unwrap().id(), "0002-posts");
        assert_eq!(
            list.get(1).unwrap().depends().iter().next().map(String::as_str),
            Some("0001-users")
        );
        assert_eq!(list.post_apply().len(), 1);
        assert_eq!(list.post_apply()[0].id(), "post-apply-refresh");
        // the rollback file was paired, not loaded as its own migration
        assert!(!list.contains_id("0001-users.rollback"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "0001-a.sql",
            "-- depends: 0000-missing\nSELECT 1;",
        );
        let err = read_migrations(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(err.is_bad_migration());
    }

    #[test]
    fn transactional_directive_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "0001-a.sql",
            "-- transactional: False\nSELECT 1;",
        );
        write(
            dir.path(),
            "0002-b.sql",
            "-- transactional: TRUE\nSELECT 2;",
        );
        let list = read_migrations(&[dir.path().to_path_buf()]).unwrap();
        assert!(!list.get(0).unwrap().use_transactions());
        assert!(list.get(1).unwrap().use_transactions());
    }

    #[test]
    fn bad_transactional_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "0001-a.sql",
            "-- transactional: maybe\nSELECT 1;",
        );
        let err = read_migrations(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(err.is_bad_migration());
    }

    #[test]
    fn duplicate_ids_across_sources_conflict() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write(first.path(), "0001-a.sql", "SELECT 1;");
        write(second.path(), "0001-a.sql", "SELECT 2;");
        let err = read_migrations(&[
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ])
        .unwrap_err();
        assert!(matches!(err, MigrateError::Conflict(_)));
    }
}
