use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rule_catalog_core::{
    AliasRecord, CatalogParam, CatalogRule, CatalogSnapshot, ParamOp, ReconcilePlan,
    RepositoryRecord, RuleAction, RuleId, RuleKey, RuleStatus, RuleWrite,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rules (
  rule_id TEXT PRIMARY KEY,
  repository TEXT NOT NULL,
  rule_key TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  severity TEXT,
  status TEXT NOT NULL CHECK (status IN ('beta','ready','deprecated','removed')),
  rule_type TEXT,
  system_tags_json TEXT NOT NULL,
  internal_key TEXT,
  remediation TEXT,
  is_template INTEGER NOT NULL DEFAULT 0,
  plugin_key TEXT NOT NULL,
  organization TEXT,
  user_tags_json TEXT NOT NULL,
  note_data TEXT,
  note_user TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_params (
  rule_id TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT,
  default_value TEXT,
  PRIMARY KEY (rule_id, name),
  FOREIGN KEY (rule_id) REFERENCES rules(rule_id)
);

CREATE TABLE IF NOT EXISTS rule_aliases (
  old_repository TEXT NOT NULL,
  old_rule_key TEXT NOT NULL,
  rule_id TEXT NOT NULL,
  PRIMARY KEY (old_repository, old_rule_key),
  FOREIGN KEY (rule_id) REFERENCES rules(rule_id)
);

CREATE TABLE IF NOT EXISTS rule_repositories (
  repository TEXT PRIMARY KEY,
  language TEXT NOT NULL,
  display_name TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_key ON rules(repository, rule_key);
CREATE INDEX IF NOT EXISTS idx_rules_status ON rules(status);
CREATE INDEX IF NOT EXISTS idx_rule_params_rule ON rule_params(rule_id);
";

const RULE_COLUMNS: &str = "rule_id, repository, rule_key, name, description, severity, status, \
                            rule_type, system_tags_json, internal_key, remediation, is_template, \
                            plugin_key, organization, user_tags_json, note_data, note_user, \
                            created_at, updated_at";

// Rows per multi-row INSERT; keeps bound variables well under SQLite's limit
// while amortizing statement overhead for bulk runs.
const RULE_INSERT_CHUNK: usize = 40;
const PARAM_UPSERT_CHUNK: usize = 200;

/// The persistent rule catalog, system of record for reconciliation.
pub struct SqliteCatalog {
    conn: Connection,
}

/// Counts and touched identifiers from one applied plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRun {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub touched: Vec<RuleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryChanges {
    pub deleted: usize,
    pub upserted: usize,
}

impl SqliteCatalog {
    /// Open a catalog database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open catalog database at {}", path.display()))?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// Open a throwaway in-memory catalog, mostly for tests.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory catalog database")?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = self.schema_version()?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration v1")?;
        }

        let version = self.schema_version()?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Current recorded schema version, 0 for a fresh database.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let version = self
            .conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to read current schema version")?;
        Ok(version)
    }

    /// Load everything the planner needs: all rule rows, parameters and
    /// recorded aliases, in one consistent read.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn snapshot(&self) -> Result<CatalogSnapshot> {
        Ok(CatalogSnapshot {
            rules: self.select_all_rules()?,
            params: self.select_all_params()?,
            aliases: self.aliases()?,
        })
    }

    /// Commit one reconciliation plan atomically: rule inserts and updates,
    /// parameter upserts and deletes, and the alias sync all ride one
    /// transaction. A failure anywhere rolls everything back.
    ///
    /// # Errors
    /// Returns an error when any write fails; the catalog is then unchanged.
    pub fn apply(&mut self, plan: &ReconcilePlan) -> Result<AppliedRun> {
        let tx = self.conn.transaction().context("failed to start reconciliation transaction")?;

        let inserts: Vec<&RuleWrite> =
            plan.writes.iter().filter(|write| write.action == RuleAction::Insert).collect();
        for chunk in inserts.chunks(RULE_INSERT_CHUNK) {
            insert_rule_chunk(&tx, chunk)?;
        }

        {
            let mut stmt = tx
                .prepare(
                    "UPDATE rules SET repository = ?2, rule_key = ?3, name = ?4, \
                     description = ?5, severity = ?6, status = ?7, rule_type = ?8, \
                     system_tags_json = ?9, internal_key = ?10, remediation = ?11, \
                     is_template = ?12, plugin_key = ?13, updated_at = ?14 \
                     WHERE rule_id = ?1",
                )
                .context("failed to prepare rule update")?;
            for write in plan.writes.iter().filter(|write| write.action != RuleAction::Insert) {
                let rule = &write.rule;
                let changed = stmt
                    .execute(params![
                        rule.id.to_string(),
                        rule.key.repository,
                        rule.key.rule,
                        rule.name,
                        rule.description,
                        rule.severity,
                        rule.status.as_str(),
                        rule.rule_type,
                        tags_to_json(&rule.system_tags)?,
                        rule.internal_key,
                        rule.remediation,
                        rule.is_template,
                        rule.plugin_key,
                        rfc3339(rule.updated_at)?,
                    ])
                    .context("failed to update rule row")?;
                if changed != 1 {
                    return Err(anyhow!("rule {} vanished during reconciliation", rule.id));
                }
            }
        }

        apply_param_ops(&tx, &plan.writes)?;
        sync_aliases(&tx, &plan.aliases)?;

        tx.commit().context("failed to commit reconciliation transaction")?;

        Ok(AppliedRun {
            inserted: plan.inserted(),
            updated: plan.updated(),
            removed: plan.removed(),
            touched: plan.touched_ids(),
        })
    }

    /// Reconcile persisted repository metadata: delete every repository not
    /// declared this run, upsert every declared one.
    ///
    /// # Errors
    /// Returns an error when the transaction fails.
    pub fn save_repositories(&mut self, declared: &[RepositoryRecord]) -> Result<RepositoryChanges> {
        let tx = self.conn.transaction().context("failed to start repository transaction")?;

        let declared_keys: HashSet<&str> =
            declared.iter().map(|repository| repository.key.as_str()).collect();
        let existing: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT repository FROM rule_repositories")
                .context("failed to prepare repository select")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            keys
        };

        let mut deleted = 0_usize;
        for key in existing {
            if !declared_keys.contains(key.as_str()) {
                deleted += tx
                    .execute("DELETE FROM rule_repositories WHERE repository = ?1", params![key])
                    .context("failed to delete repository row")?;
            }
        }

        let mut upserted = 0_usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO rule_repositories(repository, language, display_name) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT(repository) DO UPDATE SET \
                     language = excluded.language, display_name = excluded.display_name",
                )
                .context("failed to prepare repository upsert")?;
            for repository in declared {
                stmt.execute(params![
                    repository.key,
                    repository.language,
                    repository.display_name
                ])
                .context("failed to upsert repository row")?;
                upserted += 1;
            }
        }

        tx.commit().context("failed to commit repository transaction")?;
        Ok(RepositoryChanges { deleted, upserted })
    }

    /// Look up one rule by its current key. When a removed row still carries
    /// the key alongside a live one, the live row answers.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn select_rule(&self, key: &RuleKey) -> Result<Option<CatalogRule>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM rules \
                 WHERE repository = ?1 AND rule_key = ?2 \
                 ORDER BY CASE WHEN status = 'removed' THEN 1 ELSE 0 END ASC \
                 LIMIT 1"
            ))
            .context("failed to prepare rule lookup")?;

        let row = stmt
            .query_row(params![key.repository, key.rule], raw_rule_row)
            .optional()
            .context("failed to look up rule by key")?;
        row.map(RawRuleRow::decode).transpose()
    }

    /// All rule rows, including removed ones, in key order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn select_all_rules(&self) -> Result<Vec<CatalogRule>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM rules ORDER BY repository ASC, rule_key ASC"
            ))
            .context("failed to prepare rule select")?;
        let rows = stmt.query_map([], raw_rule_row)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?.decode()?);
        }
        Ok(rules)
    }

    /// Parameters of one rule, in name order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn params_of(&self, rule_id: RuleId) -> Result<Vec<CatalogParam>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT rule_id, name, description, default_value FROM rule_params \
                 WHERE rule_id = ?1 ORDER BY name ASC",
            )
            .context("failed to prepare parameter select")?;
        let rows = stmt.query_map(params![rule_id.to_string()], raw_param_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?.decode()?);
        }
        Ok(result)
    }

    fn select_all_params(&self) -> Result<Vec<CatalogParam>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT rule_id, name, description, default_value FROM rule_params \
                 ORDER BY rule_id ASC, name ASC",
            )
            .context("failed to prepare parameter select")?;
        let rows = stmt.query_map([], raw_param_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?.decode()?);
        }
        Ok(result)
    }

    /// All recorded aliases.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn aliases(&self) -> Result<Vec<AliasRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT old_repository, old_rule_key, rule_id FROM rule_aliases \
                 ORDER BY old_repository ASC, old_rule_key ASC",
            )
            .context("failed to prepare alias select")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut aliases = Vec::new();
        for row in rows {
            let (repository, rule, rule_id) = row?;
            aliases.push(AliasRecord {
                key: RuleKey::new(repository, rule),
                rule_id: parse_rule_id(&rule_id)?,
            });
        }
        Ok(aliases)
    }

    /// All persisted repository records, in key order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn repositories(&self) -> Result<Vec<RepositoryRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT repository, language, display_name FROM rule_repositories \
                 ORDER BY repository ASC",
            )
            .context("failed to prepare repository select")?;
        let rows = stmt.query_map([], |row| {
            Ok(RepositoryRecord {
                key: row.get(0)?,
                language: row.get(1)?,
                display_name: row.get(2)?,
            })
        })?;

        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row?);
        }
        Ok(repositories)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_rules(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
            .context("failed to count rules")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_params(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rule_params", [], |row| row.get(0))
            .context("failed to count parameters")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Replace the user tag set of one rule. User tags belong to catalog
    /// users; reconciliation never writes this column.
    ///
    /// # Errors
    /// Returns an error when the rule does not exist or the write fails.
    pub fn save_user_tags(&mut self, rule_id: RuleId, tags: &BTreeSet<String>) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE rules SET user_tags_json = ?2 WHERE rule_id = ?1",
                params![rule_id.to_string(), tags_to_json(tags)?],
            )
            .context("failed to update user tags")?;
        if changed != 1 {
            return Err(anyhow!("no rule with id {rule_id}"));
        }
        Ok(())
    }

    /// Set the user note of one rule. Never written by reconciliation.
    ///
    /// # Errors
    /// Returns an error when the rule does not exist or the write fails.
    pub fn save_user_note(&mut self, rule_id: RuleId, note: &str, author: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE rules SET note_data = ?2, note_user = ?3 WHERE rule_id = ?1",
                params![rule_id.to_string(), note, author],
            )
            .context("failed to update user note")?;
        if changed != 1 {
            return Err(anyhow!("no rule with id {rule_id}"));
        }
        Ok(())
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

fn insert_rule_chunk(tx: &rusqlite::Transaction<'_>, chunk: &[&RuleWrite]) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<String> = (0..chunk.len())
        .map(|row| {
            let base = row * 19;
            let slots: Vec<String> = (1..=19).map(|slot| format!("?{}", base + slot)).collect();
            format!("({})", slots.join(", "))
        })
        .collect();
    let sql = format!(
        "INSERT INTO rules({RULE_COLUMNS}) VALUES {}",
        placeholders.join(", ")
    );

    let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 19);
    for write in chunk {
        let rule = &write.rule;
        values.push(Value::from(rule.id.to_string()));
        values.push(Value::from(rule.key.repository.clone()));
        values.push(Value::from(rule.key.rule.clone()));
        values.push(Value::from(rule.name.clone()));
        values.push(Value::from(rule.description.clone()));
        values.push(Value::from(rule.severity.clone()));
        values.push(Value::from(rule.status.as_str().to_string()));
        values.push(Value::from(rule.rule_type.clone()));
        values.push(Value::from(tags_to_json(&rule.system_tags)?));
        values.push(Value::from(rule.internal_key.clone()));
        values.push(Value::from(rule.remediation.clone()));
        values.push(Value::from(i64::from(rule.is_template)));
        values.push(Value::from(rule.plugin_key.clone()));
        values.push(Value::from(rule.organization.clone()));
        values.push(Value::from(tags_to_json(&rule.user_tags)?));
        values.push(Value::from(rule.note_data.clone()));
        values.push(Value::from(rule.note_user.clone()));
        values.push(Value::from(rfc3339(rule.created_at)?));
        values.push(Value::from(rfc3339(rule.updated_at)?));
    }

    tx.execute(&sql, params_from_iter(values)).context("failed to bulk-insert rule rows")?;
    Ok(())
}

fn apply_param_ops(tx: &rusqlite::Transaction<'_>, writes: &[RuleWrite]) -> Result<()> {
    let mut upserts: Vec<(RuleId, &str, Option<&str>, Option<&str>)> = Vec::new();
    let mut deletes: Vec<(RuleId, &str)> = Vec::new();
    for write in writes {
        for op in &write.param_ops {
            match op {
                ParamOp::Upsert { name, description, default_value } => upserts.push((
                    write.rule.id,
                    name.as_str(),
                    description.as_deref(),
                    default_value.as_deref(),
                )),
                ParamOp::Delete { name } => deletes.push((write.rule.id, name.as_str())),
            }
        }
    }

    for chunk in upserts.chunks(PARAM_UPSERT_CHUNK) {
        let placeholders: Vec<String> = (0..chunk.len())
            .map(|row| {
                let base = row * 4;
                format!("(?{}, ?{}, ?{}, ?{})", base + 1, base + 2, base + 3, base + 4)
            })
            .collect();
        let sql = format!(
            "INSERT INTO rule_params(rule_id, name, description, default_value) VALUES {} \
             ON CONFLICT(rule_id, name) DO UPDATE SET \
             description = excluded.description, default_value = excluded.default_value",
            placeholders.join(", ")
        );

        let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 4);
        for (rule_id, name, description, default_value) in chunk {
            values.push(Value::from(rule_id.to_string()));
            values.push(Value::from((*name).to_string()));
            values.push(Value::from(description.map(ToString::to_string)));
            values.push(Value::from(default_value.map(ToString::to_string)));
        }
        tx.execute(&sql, params_from_iter(values))
            .context("failed to bulk-upsert parameter rows")?;
    }

    if !deletes.is_empty() {
        let mut stmt = tx
            .prepare("DELETE FROM rule_params WHERE rule_id = ?1 AND name = ?2")
            .context("failed to prepare parameter delete")?;
        for (rule_id, name) in deletes {
            stmt.execute(params![rule_id.to_string(), name])
                .context("failed to delete parameter row")?;
        }
    }

    Ok(())
}

fn sync_aliases(tx: &rusqlite::Transaction<'_>, desired: &[AliasRecord]) -> Result<()> {
    let desired_keys: HashSet<(&str, &str)> = desired
        .iter()
        .map(|alias| (alias.key.repository.as_str(), alias.key.rule.as_str()))
        .collect();

    let existing: Vec<(String, String)> = {
        let mut stmt = tx
            .prepare("SELECT old_repository, old_rule_key FROM rule_aliases")
            .context("failed to prepare alias select")?;
        let rows =
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        keys
    };

    {
        let mut stmt = tx
            .prepare("DELETE FROM rule_aliases WHERE old_repository = ?1 AND old_rule_key = ?2")
            .context("failed to prepare alias delete")?;
        for (repository, rule) in &existing {
            if !desired_keys.contains(&(repository.as_str(), rule.as_str())) {
                stmt.execute(params![repository, rule]).context("failed to delete alias row")?;
            }
        }
    }

    {
        let mut stmt = tx
            .prepare(
                "INSERT OR REPLACE INTO rule_aliases(old_repository, old_rule_key, rule_id) \
                 VALUES (?1, ?2, ?3)",
            )
            .context("failed to prepare alias insert")?;
        for alias in desired {
            stmt.execute(params![
                alias.key.repository,
                alias.key.rule,
                alias.rule_id.to_string()
            ])
            .context("failed to insert alias row")?;
        }
    }

    Ok(())
}

struct RawRuleRow {
    rule_id: String,
    repository: String,
    rule_key: String,
    name: String,
    description: String,
    severity: Option<String>,
    status: String,
    rule_type: Option<String>,
    system_tags_json: String,
    internal_key: Option<String>,
    remediation: Option<String>,
    is_template: bool,
    plugin_key: String,
    organization: Option<String>,
    user_tags_json: String,
    note_data: Option<String>,
    note_user: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRuleRow {
    fn decode(self) -> Result<CatalogRule> {
        let status = RuleStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown rule status: {}", self.status))?;
        Ok(CatalogRule {
            id: parse_rule_id(&self.rule_id)?,
            key: RuleKey::new(self.repository, self.rule_key),
            name: self.name,
            description: self.description,
            severity: self.severity,
            status,
            rule_type: self.rule_type,
            system_tags: tags_from_json(&self.system_tags_json)?,
            internal_key: self.internal_key,
            remediation: self.remediation,
            is_template: self.is_template,
            plugin_key: self.plugin_key,
            organization: self.organization,
            user_tags: tags_from_json(&self.user_tags_json)?,
            note_data: self.note_data,
            note_user: self.note_user,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn raw_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRuleRow> {
    Ok(RawRuleRow {
        rule_id: row.get(0)?,
        repository: row.get(1)?,
        rule_key: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        severity: row.get(5)?,
        status: row.get(6)?,
        rule_type: row.get(7)?,
        system_tags_json: row.get(8)?,
        internal_key: row.get(9)?,
        remediation: row.get(10)?,
        is_template: row.get(11)?,
        plugin_key: row.get(12)?,
        organization: row.get(13)?,
        user_tags_json: row.get(14)?,
        note_data: row.get(15)?,
        note_user: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

struct RawParamRow {
    rule_id: String,
    name: String,
    description: Option<String>,
    default_value: Option<String>,
}

impl RawParamRow {
    fn decode(self) -> Result<CatalogParam> {
        Ok(CatalogParam {
            rule_id: parse_rule_id(&self.rule_id)?,
            name: self.name,
            description: self.description,
            default_value: self.default_value,
        })
    }
}

fn raw_param_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawParamRow> {
    Ok(RawParamRow {
        rule_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        default_value: row.get(3)?,
    })
}

fn parse_rule_id(raw: &str) -> Result<RuleId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid rule id: {raw}"))?;
    Ok(RuleId(parsed))
}

fn tags_to_json(tags: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(&tags.iter().collect::<Vec<_>>())
        .context("failed to serialize tag set")
}

fn tags_from_json(raw: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str::<Vec<String>>(raw)
        .map(|tags| tags.into_iter().collect())
        .with_context(|| format!("invalid tag set: {raw}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
