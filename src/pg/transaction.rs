//! Transactions issued as plain `BEGIN`/`COMMIT`/`ROLLBACK` queries.

use super::connection::Connection;
use super::error::{HandlerResult, PgError, PgResult};

/// How a transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    Rollback,
}

impl Completion {
    pub fn sql(self) -> &'static str {
        match self {
            Completion::Commit => "COMMIT",
            Completion::Rollback => "ROLLBACK",
        }
    }
}

/// An open transaction on one connection.
///
/// Queries inside the transaction run on [`Transaction::connection`].
/// Ending the transaction consumes it.
#[derive(Debug)]
pub struct Transaction {
    conn: Connection,
}

impl Transaction {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn commit<C, E>(self, on_completed: C, on_error: E)
    where
        C: FnOnce() -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        self.complete(Completion::Commit, on_completed, on_error);
    }

    pub fn rollback<C, E>(self, on_completed: C, on_error: E)
    where
        C: FnOnce() -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        self.complete(Completion::Rollback, on_completed, on_error);
    }

    /// Issue COMMIT or ROLLBACK; `on_completed` runs once the server is
    /// ready again.
    pub fn complete<C, E>(self, completion: Completion, on_completed: C, on_error: E)
    where
        C: FnOnce() -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        self.conn
            .query(completion.sql(), move |_| on_completed(), on_error);
    }

    pub async fn finish(self, completion: Completion) -> PgResult<()> {
        self.conn.execute(completion.sql(), &[]).await.map(drop)
    }

    pub async fn commit_async(self) -> PgResult<()> {
        self.finish(Completion::Commit).await
    }

    pub async fn rollback_async(self) -> PgResult<()> {
        self.finish(Completion::Rollback).await
    }
}
