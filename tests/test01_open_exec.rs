use sqlite_slots::prelude::*;
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    // Leak the tempdir so the file persists for the duration of the test binary.
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

#[derive(Clone, Copy)]
enum Stmt {
    Insert,
    Count,
    SelectByName,
    SelectAll,
}

impl StatementId for Stmt {
    fn ordinal(self) -> usize {
        self as usize
    }
}

fn open_people_db(path: &str) -> Result<Database, DbError> {
    DatabaseConfig::new(path)
        .schema("CREATE TABLE IF NOT EXISTS people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)")
        .statement("INSERT INTO people (name, age) VALUES (?1, ?2)")
        .statement("SELECT count(*) FROM people")
        .statement("SELECT id, name, age FROM people WHERE name = ?1")
        .statement("SELECT id, name, age FROM people ORDER BY id")
        .open()
}

#[test]
fn exec_insert_and_getters() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_people_db(&unique_db_path("getters"))?;

    let rowid = db.insert(Stmt::Insert, &vals!["ada", 36i64])?;
    assert!(rowid > 0);
    assert_eq!(db.get_last_insert_rowid()?, rowid);
    db.exec(Stmt::Insert, &vals!["grace", 47i64])?;

    assert_eq!(db.get_the_int(Stmt::Count, &[])?, 2);
    assert_eq!(
        db.get_the_string_sql("SELECT name FROM people WHERE age = ?1", &vals![47i64])?,
        "grace"
    );

    // Documented "no row" signals, not errors.
    assert_eq!(
        db.get_the_int_sql("SELECT age FROM people WHERE name = 'nobody'", &[])?,
        NO_ROW
    );
    assert_eq!(
        db.get_the_string_sql("SELECT name FROM people WHERE name = 'nobody'", &[])?,
        ""
    );

    assert!(db.row_exists(Stmt::SelectByName, &vals!["ada"])?);
    assert!(!db.row_exists(Stmt::SelectByName, &vals!["nobody"])?);

    let rows = db.rows(Stmt::SelectAll, &[])?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.first().unwrap().get_string(1), "ada");
    assert_eq!(rows.get(1).unwrap().get("age").unwrap().as_int(), Some(47));

    let names = db.get_as_strings(Stmt::SelectByName, &vals!["grace"])?;
    assert_eq!(names.len(), 1);

    db.close()?;
    Ok(())
}

#[test]
fn with_row_gives_zero_copy_access() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_people_db(&unique_db_path("withrow"))?;
    db.exec(Stmt::Insert, &vals!["ada", 36i64])?;

    // References into the engine's row buffer stay inside the closure.
    let age = db.with_row(Stmt::SelectByName, &vals!["ada"], |row| {
        assert_eq!(row.get_ref(1)?.as_str().unwrap(), "ada");
        Ok(row.get::<_, i64>(2)?)
    })?;
    assert_eq!(age, Some(36));

    let missing = db.with_row_or(
        Stmt::SelectByName,
        &vals!["nobody"],
        |row| Ok(row.get::<_, i64>(2)?),
        -1,
    )?;
    assert_eq!(missing, -1);

    db.close()?;
    Ok(())
}

#[test]
fn update_helper_and_identifier_validation() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_people_db(&unique_db_path("update"))?;
    db.exec(Stmt::Insert, &vals!["ada", 36i64])?;

    let changed = db.update("people", "age", SqlValue::Int(37), "name", SqlValue::Text("ada"))?;
    assert_eq!(changed, 1);
    assert_eq!(
        db.get_the_int_sql("SELECT age FROM people WHERE name = 'ada'", &[])?,
        37
    );

    let err = db
        .update("people x", "age", SqlValue::Int(1), "name", SqlValue::Text("ada"))
        .unwrap_err();
    assert!(matches!(err, DbError::Usage(_)));

    assert!(db.column_exists("people", "age")?);
    assert!(!db.column_exists("people", "shoe_size")?);
    assert!(db.column_exists("people; DROP TABLE people", "age").is_err());

    db.close()?;
    Ok(())
}

#[test]
fn parameter_count_mismatch_is_a_usage_error() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_people_db(&unique_db_path("params"))?;
    let err = db.exec(Stmt::Insert, &vals!["ada"]).unwrap_err();
    assert!(matches!(err, DbError::Usage(_)));
    db.close()?;
    Ok(())
}

#[test]
fn statement_ordinal_capacity_boundary() -> Result<(), Box<dyn std::error::Error>> {
    // Fill every slot; the last valid ordinal must resolve, one past it
    // must not.
    let mut statements: Vec<String> = (0..MAX_STATEMENTS - 1).map(|_| "SELECT 1".into()).collect();
    statements.push("SELECT 42".into());
    let db = DatabaseConfig::new(":memory:")
        .statements(statements)
        .open()?;

    assert_eq!(db.get_the_int(MAX_STATEMENTS - 1, &[])?, 42);
    let err = db.get_the_int(MAX_STATEMENTS, &[]).unwrap_err();
    assert!(matches!(err, DbError::CapacityExceeded(_)));

    db.close()?;
    Ok(())
}

#[test]
fn unregistered_ordinal_is_a_usage_error() -> Result<(), Box<dyn std::error::Error>> {
    let db = DatabaseConfig::new(":memory:")
        .statement("SELECT 1")
        .open()?;
    let err = db.get_the_int(5usize, &[]).unwrap_err();
    assert!(matches!(err, DbError::Usage(_)));
    db.close()?;
    Ok(())
}

#[test]
fn too_many_templates_fail_at_open() {
    let statements: Vec<String> = (0..=MAX_STATEMENTS).map(|_| "SELECT 1".into()).collect();
    let err = DatabaseConfig::new(":memory:")
        .statements(statements)
        .open()
        .unwrap_err();
    assert!(matches!(err, DbError::CapacityExceeded(_)));
}

#[test]
fn close_is_idempotent_and_use_after_close_errors() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_people_db(&unique_db_path("close"))?;
    db.exec(Stmt::Insert, &vals!["ada", 36i64])?;
    db.close()?;
    db.close()?; // logs and returns without effect

    let err = db.get_the_int(Stmt::Count, &[]).unwrap_err();
    assert!(matches!(err, DbError::Usage(_)));
    Ok(())
}

#[test]
fn schema_errors_respect_the_ignore_list() -> Result<(), Box<dyn std::error::Error>> {
    // Non-ignorable failure aborts open.
    let err = DatabaseConfig::new(unique_db_path("schema_bad"))
        .schema("CREATE TABLE broken (")
        .open()
        .unwrap_err();
    assert!(matches!(err, DbError::Engine(_)));

    // Matching substring skips the failing script.
    let db = DatabaseConfig::new(unique_db_path("schema_skip"))
        .schema("CREATE TABLE t (id INTEGER)")
        .schema("CREATE TABLE t (id INTEGER)")
        .ignorable_schema_errors(["already exists"])
        .statement("SELECT count(*) FROM t")
        .open()?;
    assert_eq!(db.get_the_int(0usize, &[])?, 0);
    db.close()?;

    // Wildcard skips everything.
    let db = DatabaseConfig::new(unique_db_path("schema_wild"))
        .schema("CREATE TABLE broken (")
        .ignorable_schema_errors(["*"])
        .open()?;
    db.close()?;
    Ok(())
}

#[test]
fn json_helpers() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_people_db(&unique_db_path("json"))?;
    db.exec(Stmt::Insert, &vals!["ada", 36i64])?;

    let json = db.get_as_json(Stmt::SelectAll, &[])?;
    assert_eq!(json[0]["name"], "ada");
    assert_eq!(json[0]["age"], 36);

    let json = db.get_as_json_sql("SELECT NULL AS nothing", &[])?;
    assert!(json[0]["nothing"].is_null());

    db.close()?;
    Ok(())
}
