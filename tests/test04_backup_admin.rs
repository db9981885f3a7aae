use sqlite_slots::prelude::*;
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

#[derive(Clone, Copy)]
enum Stmt {
    Insert,
    Count,
}

impl StatementId for Stmt {
    fn ordinal(self) -> usize {
        self as usize
    }
}

fn open_filled_db(path: &str, rows: i64) -> Result<Database, DbError> {
    let db = DatabaseConfig::new(path)
        .schema("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, payload TEXT)")
        .statement("INSERT INTO t (payload) VALUES (?1)")
        .statement("SELECT count(*) FROM t")
        .open()?;
    let payload = "x".repeat(512);
    db.transaction(|| {
        for _ in 0..rows {
            db.exec(Stmt::Insert, &[SqlValue::Text(&payload)])?;
        }
        Ok(())
    })?;
    Ok(db)
}

#[test]
fn stepwise_backup_copies_everything() -> Result<(), Box<dyn std::error::Error>> {
    let src_path = unique_db_path("bk_src");
    let dst_path = unique_db_path("bk_dst");
    let db = open_filled_db(&src_path, 500)?;

    let mut backup = db.init_backup(&dst_path)?;
    let mut steps = 0;
    while backup.step(2)? < 100 {
        steps += 1;
        assert!(steps < 10_000, "backup made no progress");
        // Ordinary traffic continues between steps.
        assert!(db.get_the_int(Stmt::Count, &[])? >= 500);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(backup.is_finished());

    let copy = DatabaseConfig::new(dst_path.as_str())
        .statement("SELECT count(*) FROM t")
        .open()?;
    assert_eq!(copy.get_the_int(0usize, &[])?, 500);
    copy.close()?;
    db.close()?;
    Ok(())
}

#[test]
fn close_refuses_while_backup_runs_and_cancel_unblocks()
-> Result<(), Box<dyn std::error::Error>> {
    let db = open_filled_db(&unique_db_path("bk_busy_src"), 500)?;
    let backup = db.init_backup(&unique_db_path("bk_busy_dst"))?;

    let err = db.close().unwrap_err();
    assert!(matches!(err, DbError::Busy(_)));

    backup.cancel();
    db.close()?;
    Ok(())
}

#[test]
fn dropping_an_unfinished_backup_cancels_it() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_filled_db(&unique_db_path("bk_drop_src"), 200)?;
    {
        let _backup = db.init_backup(&unique_db_path("bk_drop_dst"))?;
    }
    db.close()?;
    Ok(())
}

#[test]
fn optimize_is_graceful() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_filled_db(&unique_db_path("optimize"), 50)?;
    db.optimize(None, Some(500))?;
    db.optimize(Some(8192), None)?;
    // Still usable afterwards.
    assert_eq!(db.get_the_int(Stmt::Count, &[])?, 50);
    db.close()?;
    Ok(())
}

#[test]
fn about_and_status_report_the_database() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_filled_db(&unique_db_path("about"), 10)?;

    let about = db.about()?;
    assert_eq!(about.journal_mode.to_uppercase(), "WAL");
    assert!(about.page_count > 0);
    assert_eq!(about.statements, 2);
    assert!(!about.readonly);
    assert_eq!(about.backups_in_progress, 0);
    let dump = about.to_string();
    assert!(dump.contains("journal"));
    assert!(serde_json::to_value(&about)?.get("sqlite_version").is_some());

    assert!(db.get_status(DbStatus::PageCount)? > 0);
    assert!(db.get_status(DbStatus::PageSize)? > 0);
    assert_eq!(db.get_status(DbStatus::UserVersion)?, 0);

    db.close()?;
    Ok(())
}

#[test]
fn persist_journal_mode_is_honored() -> Result<(), Box<dyn std::error::Error>> {
    let db = DatabaseConfig::new(unique_db_path("persist"))
        .wal(false)
        .schema("CREATE TABLE t (n INTEGER)")
        .open()?;
    let about = db.about()?;
    assert_eq!(about.journal_mode.to_uppercase(), "PERSIST");
    db.close()?;
    Ok(())
}

#[test]
fn size_cap_is_enforced() -> Result<(), Box<dyn std::error::Error>> {
    let db = DatabaseConfig::new(unique_db_path("capped"))
        .max_kb_size(64)
        .schema("CREATE TABLE t (payload BLOB)")
        .statement("INSERT INTO t (payload) VALUES (?1)")
        .open()?;

    let blob = vec![0u8; 4096];
    let mut full = None;
    for _ in 0..200 {
        if let Err(err) = db.exec(0usize, &[SqlValue::Blob(blob.clone())]) {
            full = Some(err);
            break;
        }
    }
    assert!(
        matches!(full, Some(DbError::Engine(_))),
        "the page-count ceiling must reject growth past the cap"
    );
    db.close()?;
    Ok(())
}

#[test]
fn interrupt_is_safe_when_idle() -> Result<(), Box<dyn std::error::Error>> {
    let db = open_filled_db(&unique_db_path("interrupt"), 10)?;
    db.interrupt();
    assert_eq!(db.get_the_int(Stmt::Count, &[])?, 10);
    db.close()?;
    Ok(())
}
