//! Search index for catalog rules, kept in its own SQLite database with an
//! FTS5 full-text table over name and description. The index is derived
//! state: the catalog stays authoritative, documents are only ever upserted,
//! and removed rules keep their documents but drop out of default queries.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use rule_catalog_core::{CatalogRule, RuleId, RuleKey, RuleStatus};
use rusqlite::{params, Connection};
use ulid::Ulid;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rule_docs (
  rule_id TEXT PRIMARY KEY,
  repository TEXT NOT NULL,
  rule_key TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  status TEXT NOT NULL,
  tags_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rule_docs_key ON rule_docs(repository, rule_key);

CREATE VIRTUAL TABLE IF NOT EXISTS rule_docs_fts USING fts5(
  name, description,
  content='rule_docs',
  tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS rule_docs_ai AFTER INSERT ON rule_docs BEGIN
  INSERT INTO rule_docs_fts(rowid, name, description)
  VALUES (new.rowid, new.name, new.description);
END;

CREATE TRIGGER IF NOT EXISTS rule_docs_ad AFTER DELETE ON rule_docs BEGIN
  INSERT INTO rule_docs_fts(rule_docs_fts, rowid, name, description)
  VALUES ('delete', old.rowid, old.name, old.description);
END;

CREATE TRIGGER IF NOT EXISTS rule_docs_au AFTER UPDATE ON rule_docs BEGIN
  INSERT INTO rule_docs_fts(rule_docs_fts, rowid, name, description)
  VALUES ('delete', old.rowid, old.name, old.description);
  INSERT INTO rule_docs_fts(rowid, name, description)
  VALUES (new.rowid, new.name, new.description);
END;
";

/// The searchable projection of one catalog rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDoc {
    pub rule_id: RuleId,
    pub key: RuleKey,
    pub name: String,
    pub description: String,
    pub status: RuleStatus,
    pub tags: BTreeSet<String>,
}

impl RuleDoc {
    /// Project a catalog row into its index document. Tags merge system and
    /// user tags; everything else is copied verbatim.
    #[must_use]
    pub fn from_rule(rule: &CatalogRule) -> Self {
        let tags = rule.system_tags.union(&rule.user_tags).cloned().collect();
        Self {
            rule_id: rule.id,
            key: rule.key.clone(),
            name: rule.name.clone(),
            description: rule.description.clone(),
            status: rule.status,
            tags,
        }
    }
}

/// A query against the index. Removed rules are excluded unless explicitly
/// requested; their documents still exist.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub text: Option<String>,
    pub key: Option<RuleKey>,
    pub include_removed: bool,
}

impl IndexQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn key(mut self, key: RuleKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn include_removed(mut self) -> Self {
        self.include_removed = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub ids: Vec<RuleId>,
    pub total: u64,
}

/// FTS5-backed rule index.
pub struct RuleIndex {
    conn: Connection,
}

impl RuleIndex {
    /// Open (or create) an index database at the given path.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open index database at {}", path.display()))?;
        Self::initialize(conn)
    }

    /// Open a throwaway in-memory index.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory index database")?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure index pragmas")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply index schema")?;
        Ok(Self { conn })
    }

    /// Upsert a batch of documents in one transaction. Existing documents are
    /// replaced in full; there is no partial document update and no delete.
    ///
    /// # Errors
    /// Returns an error when any write fails; no document of the batch is
    /// then visible.
    pub fn upsert(&mut self, docs: &[RuleDoc]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start index transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO rule_docs(rule_id, repository, rule_key, name, description, \
                     status, tags_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(rule_id) DO UPDATE SET \
                     repository = excluded.repository, rule_key = excluded.rule_key, \
                     name = excluded.name, description = excluded.description, \
                     status = excluded.status, tags_json = excluded.tags_json",
                )
                .context("failed to prepare document upsert")?;
            for doc in docs {
                let tags_json = serde_json::to_string(&doc.tags.iter().collect::<Vec<_>>())
                    .context("failed to serialize document tags")?;
                stmt.execute(params![
                    doc.rule_id.to_string(),
                    doc.key.repository,
                    doc.key.rule,
                    doc.name,
                    doc.description,
                    doc.status.as_str(),
                    tags_json,
                ])
                .context("failed to upsert document")?;
            }
        }
        tx.commit().context("failed to commit index transaction")?;
        Ok(())
    }

    /// Run a query and return matching identifiers plus a total count.
    ///
    /// # Errors
    /// Returns an error when the query fails or rows cannot be decoded.
    pub fn query(&self, query: &IndexQuery) -> Result<QueryResult> {
        let match_expr = query.text.as_deref().map(fts_match_expression);

        let mut sql = String::new();
        let mut bind: Vec<String> = Vec::new();
        match &match_expr {
            Some(expression) if !expression.is_empty() => {
                sql.push_str(
                    "SELECT rule_docs.rule_id FROM rule_docs_fts \
                     JOIN rule_docs ON rule_docs_fts.rowid = rule_docs.rowid \
                     WHERE rule_docs_fts MATCH ?1",
                );
                bind.push(expression.clone());
            }
            Some(_) => {
                // a text query with no searchable tokens matches nothing
                return Ok(QueryResult { ids: Vec::new(), total: 0 });
            }
            None => sql.push_str("SELECT rule_id FROM rule_docs WHERE 1 = 1"),
        }

        if !query.include_removed {
            sql.push_str(" AND status != 'removed'");
        }
        if let Some(key) = &query.key {
            bind.push(key.repository.clone());
            sql.push_str(&format!(" AND repository = ?{}", bind.len()));
            bind.push(key.rule.clone());
            sql.push_str(&format!(" AND rule_key = ?{}", bind.len()));
        }
        if match_expr.is_some() {
            sql.push_str(" ORDER BY bm25(rule_docs_fts)");
        } else {
            sql.push_str(" ORDER BY rule_id ASC");
        }

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare index query")?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bind), |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_rule_id(&row?)?);
        }
        let total = u64::try_from(ids.len()).unwrap_or(u64::MAX);
        Ok(QueryResult { ids, total })
    }

    /// Every indexed identifier, removed documents included.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn indexed_ids(&self) -> Result<Vec<RuleId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT rule_id FROM rule_docs ORDER BY rule_id ASC")
            .context("failed to prepare identifier select")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_rule_id(&row?)?);
        }
        Ok(ids)
    }

    /// Total number of documents, removed ones included.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_documents(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rule_docs", [], |row| row.get(0))
            .context("failed to count documents")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Build a safe FTS5 MATCH expression: bare user text is tokenized and each
/// token quoted, so query syntax characters cannot reach the parser.
fn fts_match_expression(text: &str) -> String {
    text.split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-')
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_rule_id(raw: &str) -> Result<RuleId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid rule id: {raw}"))?;
    Ok(RuleId(parsed))
}
