// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Issue stable tags to policy groups.
//!
//! A tag is a fixed-width hex string. Tags are handed out in order and
//! never reused, so a group keeps its tag across controller restarts
//! and the mark rules built from it stay byte-identical.

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;
use thiserror::Error;
use trellis_api::Tag;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tags (
    id TEXT NOT NULL,
    type TEXT NOT NULL,
    tag INTEGER UNIQUE NOT NULL,
    PRIMARY KEY (id, type)
);
";

#[derive(Debug, Error)]
pub enum TagError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("all {0}-byte tags are in use")]
    Exhausted(usize),
}

pub struct TagStore {
    conn: Mutex<Connection>,
    width: usize,
}

impl TagStore {
    /// Keep tags in the database at `path`, alongside the leases.
    pub fn open(path: impl AsRef<Path>, width: usize) -> Result<Self, TagError> {
        Self::init(Connection::open(path)?, width)
    }

    pub fn open_in_memory(width: usize) -> Result<Self, TagError> {
        Self::init(Connection::open_in_memory()?, width)
    }

    fn init(conn: Connection, width: usize) -> Result<Self, TagError> {
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn), width })
    }

    fn max_tag(&self) -> i64 {
        (1i64 << (8 * self.width)) - 1
    }

    fn render(&self, n: i64) -> String {
        format!("{n:0width$x}", width = self.width * 2)
    }

    /// Return the tag of `(id, tag_type)`, issuing the next free one the
    /// first time it is asked for.
    pub fn create_or_get(&self, id: &str, tag_type: &str) -> Result<Tag, TagError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT tag FROM tags WHERE id = ?1 AND type = ?2",
                params![id, tag_type],
                |r| r.get(0),
            )
            .optional()?;

        let n = match existing {
            Some(n) => n,
            None => {
                let last: Option<i64> =
                    tx.query_row("SELECT MAX(tag) FROM tags", [], |r| r.get(0))?;
                let n = last.unwrap_or(0) + 1;
                if n > self.max_tag() {
                    return Err(TagError::Exhausted(self.width));
                }
                tx.execute(
                    "INSERT INTO tags (id, type, tag) VALUES (?1, ?2, ?3)",
                    params![id, tag_type, n],
                )?;
                n
            }
        };
        tx.commit()?;

        Ok(Tag { id: id.to_string(), tag_type: tag_type.to_string(), tag: self.render(n) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tags_are_stable_and_distinct() {
        let s = TagStore::open_in_memory(2).unwrap();
        let a = s.create_or_get("app-a", "app").unwrap();
        let b = s.create_or_get("app-b", "app").unwrap();
        assert_eq!(a.tag, "0001");
        assert_eq!(b.tag, "0002");
        assert_eq!(s.create_or_get("app-a", "app").unwrap(), a);

        // The same id under another type is a different group.
        let r = s.create_or_get("app-a", "router").unwrap();
        assert_eq!(r.tag, "0003");
    }

    #[test]
    fn tags_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.db");
        let first = TagStore::open(&path, 2).unwrap().create_or_get("g", "app").unwrap();
        let again = TagStore::open(&path, 2).unwrap().create_or_get("g", "app").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn one_byte_tags_run_out() {
        let s = TagStore::open_in_memory(1).unwrap();
        for i in 0..255 {
            s.create_or_get(&format!("g{i}"), "app").unwrap();
        }
        assert!(matches!(s.create_or_get("one-more", "app"), Err(TagError::Exhausted(1))));
        assert_eq!(s.create_or_get("g254", "app").unwrap().tag, "ff");
    }
}
