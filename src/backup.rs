//! Stepwise online backup.
//!
//! A dedicated worker thread owns a fresh source link, the destination
//! connection, and the engine backup handle, and steps it on command. The
//! caller drives progress with [`Backup::step`], sleeping between calls so
//! writer transactions are not starved; transactions are blocked only while
//! the backup initializes, never during the copy.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use rusqlite::Connection;
use rusqlite::backup::StepResult;

use crate::database::{Database, DbInner};
use crate::error::DbError;

enum Command {
    Step {
        pages: usize,
        respond_to: Sender<Result<u8, DbError>>,
    },
    Cancel,
}

/// Keeps the database's backup counter accurate no matter how the worker
/// exits.
struct Ticket {
    inner: Arc<DbInner>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.backup_finished();
        self.inner.log_debug("backup finished");
    }
}

/// Handle to an in-flight backup.
///
/// Dropping an unfinished handle cancels the copy. While any backup is in
/// flight, [`Database::close`] refuses with [`DbError::Busy`].
pub struct Backup {
    sender: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    progress: u8,
    finished: bool,
}

impl Backup {
    /// Copy up to `pages` more pages and return overall progress, 0 to
    /// 100. Reaching 100 finalizes the destination and stops the worker.
    /// An engine `Busy`/`Locked` step makes no progress but is retryable.
    ///
    /// # Errors
    /// [`DbError::Engine`] if the copy fails; the backup is abandoned.
    pub fn step(&mut self, pages: usize) -> Result<u8, DbError> {
        if self.finished {
            return Ok(self.progress);
        }
        let (respond_to, response) = channel();
        self.sender
            .send(Command::Step { pages, respond_to })
            .map_err(|_| DbError::Internal("backup worker stopped".into()))?;
        match response.recv() {
            Ok(Ok(percent)) => {
                self.progress = percent;
                if percent >= 100 {
                    self.finish();
                }
                Ok(percent)
            }
            Ok(Err(err)) => {
                self.finish();
                Err(err)
            }
            Err(_) => {
                self.finish();
                Err(DbError::Internal("backup worker stopped".into()))
            }
        }
    }

    /// Progress of the most recent step, 0 to 100.
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Abort the backup and discard the destination's partial state.
    pub fn cancel(mut self) {
        let _ = self.sender.send(Command::Cancel);
        self.finish();
    }

    /// Mark done and wait for the worker so the in-progress counter is
    /// settled before this call returns.
    fn finish(&mut self) {
        self.finished = true;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Backup {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.sender.send(Command::Cancel);
            self.finish();
        }
    }
}

impl Database {
    /// Start an online backup of this database into the file at `dest`.
    ///
    /// Holds the write lock only while the worker opens its links and the
    /// engine backup handle; ordinary traffic continues during the copy.
    ///
    /// # Errors
    /// [`DbError::Engine`] if the destination cannot be opened or the
    /// backup cannot start.
    pub fn init_backup(&self, dest: &str) -> Result<Backup, DbError> {
        let source = self.inner.target().to_string();
        let dest = dest.to_string();
        self.transactions_disabled(|| {
            self.inner.backup_started();
            let ticket = Ticket {
                inner: Arc::clone(&self.inner),
            };
            let (sender, commands) = channel();
            let (ready_tx, ready) = channel();
            let worker = std::thread::Builder::new()
                .name(format!("backup-{}", self.inner.open_id()))
                .spawn(move || run_backup_worker(&source, &dest, &commands, &ready_tx, ticket))
                .map_err(|e| {
                    DbError::Internal(format!("failed to spawn backup worker: {e}"))
                })?;
            match ready.recv() {
                Ok(Ok(())) => {
                    self.inner.log_debug("backup started");
                    Ok(Backup {
                        sender,
                        worker: Some(worker),
                        progress: 0,
                        finished: false,
                    })
                }
                Ok(Err(err)) => {
                    let _ = worker.join();
                    self.inner
                        .log(err.log_code(), &format!("backup failed to start: {err}"));
                    Err(err)
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(DbError::Internal("backup worker died during startup".into()))
                }
            }
        })
    }
}

/// Worker loop. Owns both connections and the engine backup handle on its
/// stack for the thread's whole life; the ticket drops (and decrements the
/// in-progress counter) on every exit path.
fn run_backup_worker(
    source: &str,
    dest: &str,
    commands: &Receiver<Command>,
    ready: &Sender<Result<(), DbError>>,
    ticket: Ticket,
) {
    let _ticket = ticket;
    let src = match Connection::open(source) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = ready.send(Err(DbError::from(e)));
            return;
        }
    };
    let mut dst = match Connection::open(dest) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = ready.send(Err(DbError::from(e)));
            return;
        }
    };
    let backup = match rusqlite::backup::Backup::new(&src, &mut dst) {
        Ok(backup) => backup,
        Err(e) => {
            let _ = ready.send(Err(DbError::from(e)));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            Command::Step { pages, respond_to } => {
                let outcome = step_once(&backup, pages);
                let stop = matches!(outcome, Ok(100) | Err(_));
                let _ = respond_to.send(outcome);
                if stop {
                    break;
                }
            }
            Command::Cancel => break,
        }
    }
    // Dropping the backup handle, then both connections, finalizes the
    // destination.
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn step_once(backup: &rusqlite::backup::Backup<'_, '_>, pages: usize) -> Result<u8, DbError> {
    let step = backup.step(pages.min(i32::MAX as usize) as i32)?;
    let progress = backup.progress();
    Ok(match step {
        StepResult::Done => 100,
        _ if progress.pagecount <= 0 => 0,
        _ => {
            let copied = progress.pagecount - progress.remaining;
            let percent = (i64::from(copied) * 100) / i64::from(progress.pagecount);
            percent.clamp(0, 99) as u8
        }
    })
}
