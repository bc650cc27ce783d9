//! Reconciliation planning: diff the declared rule set against a catalog
//! snapshot and produce the minimal set of writes. Planning is pure; applying
//! the plan is the store's job.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use time::OffsetDateTime;

use crate::{
    AliasRecord, CatalogParam, CatalogRule, CatalogSnapshot, DeclarationSet, DeclaredRule,
    ParamDeclaration, RuleId, RuleKey, RuleStatus,
};

/// How a planned row write came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Insert,
    Update,
    /// An unmatched row transitioning to `Removed`. The row is retained, only
    /// status and `updated_at` move.
    SoftDelete,
}

/// A single parameter write for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamOp {
    Upsert { name: String, description: Option<String>, default_value: Option<String> },
    Delete { name: String },
}

/// One planned catalog write: the full desired row plus its parameter delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleWrite {
    pub action: RuleAction,
    pub rule: CatalogRule,
    pub param_ops: Vec<ParamOp>,
}

/// Per-run planning inputs beyond the declarations themselves. The timestamp
/// comes from the injected clock, consulted once per run.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub now: OffsetDateTime,
    pub organizations_enabled: bool,
    pub organization: Option<String>,
}

impl PlanOptions {
    #[must_use]
    pub fn at(now: OffsetDateTime) -> Self {
        Self { now, organizations_enabled: false, organization: None }
    }
}

/// The computed delta for one run. `aliases` is the complete desired alias
/// set: tuples absent from it are deleted by the writer.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub run_at: OffsetDateTime,
    pub writes: Vec<RuleWrite>,
    pub aliases: Vec<AliasRecord>,
    pub unchanged: usize,
    pub skipped_templates: Vec<RuleKey>,
    pub warnings: Vec<String>,
}

impl ReconcilePlan {
    /// Identifiers created or updated by this plan, in write order. NoOp rows
    /// never appear here, which is what keeps an unchanged re-run free of
    /// index writes.
    #[must_use]
    pub fn touched_ids(&self) -> Vec<RuleId> {
        self.writes.iter().map(|write| write.rule.id).collect()
    }

    #[must_use]
    pub fn inserted(&self) -> usize {
        self.writes.iter().filter(|write| write.action == RuleAction::Insert).count()
    }

    #[must_use]
    pub fn updated(&self) -> usize {
        self.writes.iter().filter(|write| write.action == RuleAction::Update).count()
    }

    #[must_use]
    pub fn removed(&self) -> usize {
        self.writes.iter().filter(|write| write.action == RuleAction::SoftDelete).count()
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty()
    }
}

struct SnapshotIndex<'a> {
    by_key: HashMap<&'a RuleKey, &'a CatalogRule>,
    by_id: HashMap<RuleId, &'a CatalogRule>,
    alias_to_id: HashMap<&'a RuleKey, RuleId>,
    params_by_rule: HashMap<RuleId, Vec<&'a CatalogParam>>,
}

impl<'a> SnapshotIndex<'a> {
    fn build(snapshot: &'a CatalogSnapshot) -> Self {
        let mut by_key: HashMap<&RuleKey, &CatalogRule> = HashMap::new();
        let mut by_id = HashMap::new();
        for rule in &snapshot.rules {
            by_id.insert(rule.id, rule);
            // A removed row may share its key with a live row; the live row
            // answers key lookups.
            match by_key.get(&rule.key) {
                Some(current) if current.status != RuleStatus::Removed => {}
                _ => {
                    by_key.insert(&rule.key, rule);
                }
            }
        }

        let mut alias_to_id = HashMap::new();
        for alias in &snapshot.aliases {
            alias_to_id.insert(&alias.key, alias.rule_id);
        }

        let mut params_by_rule: HashMap<RuleId, Vec<&CatalogParam>> = HashMap::new();
        for param in &snapshot.params {
            params_by_rule.entry(param.rule_id).or_default().push(param);
        }

        Self { by_key, by_id, alias_to_id, params_by_rule }
    }

    /// Match one declared rule to at most one existing row: exact key first,
    /// then each declared deprecated key in order, looked up as a current row
    /// key or through the recorded alias table. First alias match wins; later
    /// aliases resolving to a different row are reported, not fatal.
    fn resolve(
        &self,
        declared: &DeclaredRule,
        warnings: &mut Vec<String>,
    ) -> Option<&'a CatalogRule> {
        if let Some(row) = self.by_key.get(&declared.key) {
            return Some(row);
        }

        let mut matched: Option<&CatalogRule> = None;
        for alias in &declared.deprecated_keys {
            let candidate = self
                .by_key
                .get(alias)
                .copied()
                .or_else(|| self.alias_to_id.get(alias).and_then(|id| self.by_id.get(id).copied()));
            let Some(row) = candidate else { continue };
            match matched {
                None => matched = Some(row),
                Some(first) if first.id == row.id => {}
                Some(first) => warnings.push(format!(
                    "rule {}: deprecated key {alias} resolves to {}, but an earlier deprecated \
                     key already resolved to {}; keeping the first match",
                    declared.key, row.key, first.key
                )),
            }
        }
        matched
    }

    fn params_for(&self, id: RuleId) -> &[&'a CatalogParam] {
        self.params_by_rule.get(&id).map_or(&[], |params| params.as_slice())
    }
}

fn scalar_fields_equal(declared: &DeclaredRule, existing: &CatalogRule) -> bool {
    declared.key == existing.key
        && declared.name == existing.name
        && declared.description == existing.description
        && declared.severity == existing.severity
        && declared.status == existing.status
        && declared.rule_type == existing.rule_type
        && declared.system_tags == existing.system_tags
        && declared.internal_key == existing.internal_key
        && declared.remediation == existing.remediation
        && declared.is_template == existing.is_template
        && declared.plugin_key == existing.plugin_key
}

/// Every declaration-owned field overwritten; user tags, note, organization
/// and `created_at` carried over from the existing row.
fn updated_row(declared: &DeclaredRule, existing: &CatalogRule, now: OffsetDateTime) -> CatalogRule {
    CatalogRule {
        id: existing.id,
        key: declared.key.clone(),
        name: declared.name.clone(),
        description: declared.description.clone(),
        severity: declared.severity.clone(),
        status: declared.status,
        rule_type: declared.rule_type.clone(),
        system_tags: declared.system_tags.clone(),
        internal_key: declared.internal_key.clone(),
        remediation: declared.remediation.clone(),
        is_template: declared.is_template,
        plugin_key: declared.plugin_key.clone(),
        organization: existing.organization.clone(),
        user_tags: existing.user_tags.clone(),
        note_data: existing.note_data.clone(),
        note_user: existing.note_user.clone(),
        created_at: existing.created_at,
        updated_at: now,
    }
}

fn inserted_row(
    declared: &DeclaredRule,
    id: RuleId,
    now: OffsetDateTime,
    options: &PlanOptions,
) -> CatalogRule {
    CatalogRule {
        id,
        key: declared.key.clone(),
        name: declared.name.clone(),
        description: declared.description.clone(),
        severity: declared.severity.clone(),
        status: declared.status,
        rule_type: declared.rule_type.clone(),
        system_tags: declared.system_tags.clone(),
        internal_key: declared.internal_key.clone(),
        remediation: declared.remediation.clone(),
        is_template: declared.is_template,
        plugin_key: declared.plugin_key.clone(),
        organization: options.organization.clone(),
        user_tags: BTreeSet::new(),
        note_data: None,
        note_user: None,
        created_at: now,
        updated_at: now,
    }
}

fn param_delta(declared: &[ParamDeclaration], existing: &[&CatalogParam]) -> Vec<ParamOp> {
    let existing_by_name: BTreeMap<&str, &CatalogParam> =
        existing.iter().map(|param| (param.name.as_str(), *param)).collect();
    let declared_names: BTreeSet<&str> = declared.iter().map(|param| param.name.as_str()).collect();

    let mut ops = Vec::new();
    for param in declared {
        match existing_by_name.get(param.name.as_str()) {
            Some(current)
                if current.description == param.description
                    && current.default_value == param.default_value => {}
            _ => ops.push(ParamOp::Upsert {
                name: param.name.clone(),
                description: param.description.clone(),
                default_value: param.default_value.clone(),
            }),
        }
    }
    for current in existing {
        if !declared_names.contains(current.name.as_str()) {
            ops.push(ParamOp::Delete { name: current.name.clone() });
        }
    }
    ops
}

/// Compute the run delta: one pass over the declarations, then one pass over
/// the snapshot for unmatched rows. Works at bulk scale: O(declared + stored)
/// with hash lookups, no quadratic comparisons.
#[must_use]
pub fn plan(
    declarations: &DeclarationSet,
    snapshot: &CatalogSnapshot,
    options: &PlanOptions,
) -> ReconcilePlan {
    let now = options.now;
    let index = SnapshotIndex::build(snapshot);

    let mut writes: Vec<RuleWrite> = Vec::new();
    let mut dropped: HashSet<usize> = HashSet::new();
    let mut matched: HashSet<RuleId> = HashSet::new();
    let mut claimed_keys: HashMap<RuleKey, Option<usize>> = HashMap::new();
    let mut alias_rows: Vec<AliasRecord> = Vec::new();
    let mut alias_claimed: HashMap<RuleKey, RuleId> = HashMap::new();
    let mut skipped_templates = Vec::new();
    let mut warnings = Vec::new();
    let mut unchanged = 0_usize;

    for declared in &declarations.rules {
        // Template rules never take part in reconciliation when organizations
        // are enabled; evaluated before identity resolution.
        if declared.is_template && options.organizations_enabled {
            skipped_templates.push(declared.key.clone());
            continue;
        }

        let resolved = index.resolve(declared, &mut warnings);
        let (rule_id, write) = match resolved {
            Some(existing) => {
                matched.insert(existing.id);
                let ops = param_delta(&declared.params, index.params_for(existing.id));
                let revived = existing.status == RuleStatus::Removed;
                if scalar_fields_equal(declared, existing) && ops.is_empty() && !revived {
                    unchanged += 1;
                    (existing.id, None)
                } else {
                    (
                        existing.id,
                        Some(RuleWrite {
                            action: RuleAction::Update,
                            rule: updated_row(declared, existing, now),
                            param_ops: ops,
                        }),
                    )
                }
            }
            None => {
                let id = RuleId::new();
                let ops = declared
                    .params
                    .iter()
                    .map(|param| ParamOp::Upsert {
                        name: param.name.clone(),
                        description: param.description.clone(),
                        default_value: param.default_value.clone(),
                    })
                    .collect();
                (
                    id,
                    Some(RuleWrite {
                        action: RuleAction::Insert,
                        rule: inserted_row(declared, id, now, options),
                        param_ops: ops,
                    }),
                )
            }
        };

        // Same-run key collision: the later-processed declaration wins the
        // catalog row; the earlier write is dropped and surfaced as a warning.
        let write_index = write.is_some().then_some(writes.len());
        if let Some(previous) = claimed_keys.insert(declared.key.clone(), write_index) {
            warnings.push(format!(
                "two declarations target key {} in this run; the later one wins the catalog row",
                declared.key
            ));
            if let Some(previous_index) = previous {
                dropped.insert(previous_index);
            }
        }
        if let Some(write) = write {
            writes.push(write);
        }

        for alias in &declared.deprecated_keys {
            match alias_claimed.get(alias) {
                Some(claimed_by) if *claimed_by == rule_id => {}
                Some(_) => warnings.push(format!(
                    "deprecated key {alias} is declared by more than one rule; keeping the \
                     first declaration"
                )),
                None => {
                    alias_claimed.insert(alias.clone(), rule_id);
                    alias_rows.push(AliasRecord { key: alias.clone(), rule_id });
                }
            }
        }
    }

    let mut writes: Vec<RuleWrite> = writes
        .into_iter()
        .enumerate()
        .filter_map(|(index, write)| (!dropped.contains(&index)).then_some(write))
        .collect();

    // Soft-delete pass: rows not matched this run go to Removed; rows already
    // Removed stay frozen, their removal timestamp untouched.
    for row in &snapshot.rules {
        if matched.contains(&row.id) || row.status == RuleStatus::Removed {
            continue;
        }
        let mut removed = row.clone();
        removed.status = RuleStatus::Removed;
        removed.updated_at = now;
        writes.push(RuleWrite {
            action: RuleAction::SoftDelete,
            rule: removed,
            param_ops: Vec::new(),
        });
    }

    ReconcilePlan { run_at: now, writes, aliases: alias_rows, unchanged, skipped_templates, warnings }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{provider, DeclarationSet, RepositoryDeclaration, RuleDeclaration, RuleProvider};
    use time::Duration;

    fn date(offset_days: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(19_000 + offset_days)
    }

    fn declare<F>(define: F) -> DeclarationSet
    where
        F: Fn(&mut crate::DeclarationContext) + 'static,
    {
        let providers: Vec<Box<dyn RuleProvider>> = vec![provider("unittest", define)];
        match DeclarationSet::collect(&providers) {
            Ok(set) => set,
            Err(err) => panic!("declarations should collect: {err}"),
        }
    }

    fn rule(key: &str, name: &str, description: &str) -> RuleDeclaration {
        match RuleDeclaration::builder(key).name(name).description(description).build() {
            Ok(rule) => rule,
            Err(err) => panic!("rule should build: {err}"),
        }
    }

    fn rule_with<F>(key: &str, customize: F) -> RuleDeclaration
    where
        F: FnOnce(crate::RuleDeclarationBuilder) -> crate::RuleDeclarationBuilder,
    {
        let builder =
            customize(RuleDeclaration::builder(key).name("Name").description("Description"));
        match builder.build() {
            Ok(rule) => rule,
            Err(err) => panic!("rule should build: {err}"),
        }
    }

    /// Mirror the writer in memory so planning tests can chain runs.
    fn apply_to_snapshot(plan: &ReconcilePlan, snapshot: &mut CatalogSnapshot) {
        for write in &plan.writes {
            match snapshot.rules.iter_mut().find(|rule| rule.id == write.rule.id) {
                Some(row) => row.clone_from(&write.rule),
                None => snapshot.rules.push(write.rule.clone()),
            }
            for op in &write.param_ops {
                match op {
                    ParamOp::Upsert { name, description, default_value } => {
                        let existing = snapshot
                            .params
                            .iter_mut()
                            .find(|param| param.rule_id == write.rule.id && param.name == *name);
                        match existing {
                            Some(param) => {
                                param.description = description.clone();
                                param.default_value = default_value.clone();
                            }
                            None => snapshot.params.push(CatalogParam {
                                rule_id: write.rule.id,
                                name: name.clone(),
                                description: description.clone(),
                                default_value: default_value.clone(),
                            }),
                        }
                    }
                    ParamOp::Delete { name } => snapshot
                        .params
                        .retain(|param| !(param.rule_id == write.rule.id && param.name == *name)),
                }
            }
        }
        snapshot.aliases = plan.aliases.clone();
    }

    #[test]
    fn inserts_allocate_fresh_ids_and_stamp_both_timestamps() {
        let set = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule("rule1", "One", "Description of One")),
            );
        });

        let plan = plan(&set, &CatalogSnapshot::default(), &PlanOptions::at(date(0)));
        assert_eq!(plan.inserted(), 1);
        assert_eq!(plan.unchanged, 0);
        let write = &plan.writes[0];
        assert_eq!(write.rule.created_at, date(0));
        assert_eq!(write.rule.updated_at, date(0));
        assert_eq!(write.rule.status, RuleStatus::Ready);
        assert!(write.rule.user_tags.is_empty());
    }

    #[test]
    fn identical_redeclaration_is_a_noop() {
        let set = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java").rule(rule_with("rule1", |b| {
                    b.severity("BLOCKER")
                        .tags(["tag1", "tag2"])
                        .param(ParamDeclaration::new("max").default_value("10"))
                })),
            );
        });

        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);

        let second = plan(&set, &snapshot, &PlanOptions::at(date(1)));
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 1);
        // the stored timestamps were not touched
        assert_eq!(snapshot.rules[0].updated_at, date(0));
    }

    #[test]
    fn changed_name_updates_row_but_preserves_user_data_and_created_at() {
        let set_v1 = declare(|context| {
            context
                .declare(RepositoryDeclaration::new("fake", "java").rule(rule("r", "Name1", "D")));
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);

        snapshot.rules[0].user_tags = ["usertag1", "usertag2"].iter().map(ToString::to_string).collect();
        snapshot.rules[0].note_data = Some("user *note*".to_string());
        snapshot.rules[0].note_user = Some("marius".to_string());

        let set_v2 = declare(|context| {
            context
                .declare(RepositoryDeclaration::new("fake", "java").rule(rule("r", "Name2", "D")));
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert_eq!(second.updated(), 1);
        let updated = &second.writes[0].rule;
        assert_eq!(updated.name, "Name2");
        assert_eq!(updated.description, "D");
        assert_eq!(updated.created_at, date(0));
        assert_eq!(updated.updated_at, date(1));
        assert!(updated.user_tags.contains("usertag1"));
        assert_eq!(updated.note_data.as_deref(), Some("user *note*"));
        assert_eq!(updated.note_user.as_deref(), Some("marius"));
    }

    #[test]
    fn param_change_alone_forces_an_update() {
        let set_v1 = declare(|context| {
            context.declare(RepositoryDeclaration::new("fake", "java").rule(rule_with("r", |b| {
                b.param(ParamDeclaration::new("p1").description("one").default_value("1"))
            })));
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);

        let set_v2 = declare(|context| {
            context.declare(RepositoryDeclaration::new("fake", "java").rule(rule_with("r", |b| {
                b.param(ParamDeclaration::new("p1").description("one v2").default_value("1"))
                    .param(ParamDeclaration::new("p2"))
            })));
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert_eq!(second.updated(), 1);
        let ops = &second.writes[0].param_ops;
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| matches!(op, ParamOp::Upsert { .. })));

        // dropping p1 afterwards deletes it
        let set_v3 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule_with("r", |b| b.param(ParamDeclaration::new("p2")))),
            );
        });
        apply_to_snapshot(&second, &mut snapshot);
        let third = plan(&set_v3, &snapshot, &PlanOptions::at(date(2)));
        assert_eq!(third.updated(), 1);
        assert_eq!(
            third.writes[0].param_ops,
            vec![ParamOp::Delete { name: "p1".to_string() }]
        );
    }

    #[test]
    fn unmatched_rules_are_soft_deleted_once() {
        let set_v1 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule("rule1", "One", "D"))
                    .rule(rule("rule2", "Two", "D")),
            );
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);

        let set_v2 = declare(|context| {
            context
                .declare(RepositoryDeclaration::new("fake", "java").rule(rule("rule1", "One", "D")));
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert_eq!(second.removed(), 1);
        let removed = &second.writes[0].rule;
        assert_eq!(removed.status, RuleStatus::Removed);
        assert_eq!(removed.updated_at, date(1));
        assert_eq!(removed.name, "Two");

        // a later run must not stamp the removed row again
        apply_to_snapshot(&second, &mut snapshot);
        let third = plan(&set_v2, &snapshot, &PlanOptions::at(date(2)));
        assert!(third.is_noop());
        let frozen = snapshot
            .rules
            .iter()
            .find(|rule| rule.status == RuleStatus::Removed)
            .map(|rule| rule.updated_at);
        assert_eq!(frozen, Some(date(1)));
    }

    #[test]
    fn redeclaring_a_removed_rule_revives_it_with_the_same_id() {
        let set = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule_with("rule1", |b| b.status(RuleStatus::Beta))),
            );
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);
        let original_id = snapshot.rules[0].id;

        let empty = declare(|context| {
            context.declare(RepositoryDeclaration::new("fake", "java"));
        });
        apply_to_snapshot(&plan(&empty, &snapshot, &PlanOptions::at(date(1))), &mut snapshot);
        assert_eq!(snapshot.rules[0].status, RuleStatus::Removed);

        let third = plan(&set, &snapshot, &PlanOptions::at(date(2)));
        assert_eq!(third.updated(), 1);
        let revived = &third.writes[0].rule;
        assert_eq!(revived.id, original_id);
        assert_eq!(revived.status, RuleStatus::Beta);
        assert_eq!(revived.updated_at, date(2));
    }

    #[test]
    fn rename_matches_through_the_declared_deprecated_key() {
        let set_v1 = declare(|context| {
            context
                .declare(RepositoryDeclaration::new("fake", "java").rule(rule("rule1", "One", "D")));
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);
        let original_id = snapshot.rules[0].id;

        let set_v2 = declare(|context| {
            context.declare(RepositoryDeclaration::new("fake", "java").rule(rule_with(
                "rule2",
                |b| {
                    b.deprecated_key("foo", "bar")
                        .deprecated_key("fake", "rule1")
                        .deprecated_key("some", "noise")
                },
            )));
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert_eq!(second.inserted(), 0);
        assert_eq!(second.updated(), 1);
        assert_eq!(second.removed(), 0);
        let renamed = &second.writes[0].rule;
        assert_eq!(renamed.id, original_id);
        assert_eq!(renamed.key, RuleKey::new("fake", "rule2"));
        // all three declared aliases are recorded
        assert_eq!(second.aliases.len(), 3);
        assert!(second.aliases.iter().all(|alias| alias.rule_id == original_id));
    }

    #[test]
    fn rename_matches_through_a_previously_recorded_alias() {
        let set_v1 = declare(|context| {
            context
                .declare(RepositoryDeclaration::new("fake", "java").rule(rule("rule1", "One", "D")));
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);
        let original_id = snapshot.rules[0].id;

        // first rename records the alias fake:rule1 -> id
        let set_v2 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule_with("rule2", |b| b.deprecated_key("fake", "rule1"))),
            );
        });
        apply_to_snapshot(&plan(&set_v2, &snapshot, &PlanOptions::at(date(1))), &mut snapshot);

        // second rename still reaches the row through the recorded alias even
        // though no row carries fake:rule1 anymore
        let set_v3 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule_with("rule3", |b| b.deprecated_key("fake", "rule1"))),
            );
        });
        let third = plan(&set_v3, &snapshot, &PlanOptions::at(date(2)));
        assert_eq!(third.updated(), 1);
        assert_eq!(third.writes[0].rule.id, original_id);
        assert_eq!(third.writes[0].rule.key, RuleKey::new("fake", "rule3"));
    }

    #[test]
    fn conflicting_aliases_keep_the_first_match_and_warn() {
        let set_v1 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java")
                    .rule(rule("rule1", "One", "D"))
                    .rule(rule("rule2", "Two", "D")),
            );
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);
        let first_id = snapshot
            .rules
            .iter()
            .find(|rule| rule.key.rule == "rule1")
            .map(|rule| rule.id);

        let set_v2 = declare(|context| {
            context.declare(RepositoryDeclaration::new("fake", "java").rule(rule_with(
                "merged",
                |b| b.deprecated_key("fake", "rule1").deprecated_key("fake", "rule2"),
            )));
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert_eq!(second.updated(), 1);
        assert_eq!(Some(second.writes[0].rule.id), first_id);
        assert!(second.warnings.iter().any(|warning| warning.contains("keeping the first match")));
        // the unmatched second rule is soft-deleted
        assert_eq!(second.removed(), 1);
    }

    #[test]
    fn aliases_not_redeclared_are_absent_from_the_desired_set() {
        let set_v1 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("fake", "java").rule(
                    rule_with("newKey", |b| {
                        b.deprecated_key("fake", "rule1").deprecated_key("fake", "rule2")
                    }),
                ),
            );
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);
        assert_eq!(snapshot.aliases.len(), 2);

        let set_v2 = declare(|context| {
            context
                .declare(RepositoryDeclaration::new("fake", "java").rule(rule_with("newKey", |b| b)));
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert!(second.aliases.is_empty());
    }

    #[test]
    fn template_rules_are_skipped_only_when_organizations_are_enabled() {
        let set = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("test", "java")
                    .rule(rule_with("rule1", |b| b.template(true))),
            );
        });

        let snapshot = CatalogSnapshot::default();
        let mut options = PlanOptions::at(date(0));
        options.organizations_enabled = true;
        let skipped = plan(&set, &snapshot, &options);
        assert!(skipped.is_noop());
        assert_eq!(skipped.skipped_templates, vec![RuleKey::new("test", "rule1")]);

        let applied = plan(&set, &snapshot, &PlanOptions::at(date(0)));
        assert_eq!(applied.inserted(), 1);
        assert!(applied.skipped_templates.is_empty());
    }

    #[test]
    fn system_tags_are_cleared_when_no_longer_declared() {
        let set_v1 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("findbugs", "java")
                    .rule(rule_with("rule1", |b| b.tags(["tag1", "tag2"]))),
            );
        });
        let mut snapshot = CatalogSnapshot::default();
        apply_to_snapshot(&plan(&set_v1, &snapshot, &PlanOptions::at(date(0))), &mut snapshot);

        let set_v2 = declare(|context| {
            context.declare(
                RepositoryDeclaration::new("findbugs", "java").rule(rule_with("rule1", |b| b)),
            );
        });
        let second = plan(&set_v2, &snapshot, &PlanOptions::at(date(1)));
        assert_eq!(second.updated(), 1);
        assert!(second.writes[0].rule.system_tags.is_empty());
    }

    proptest! {
        // Applying a plan and planning again against identical declarations
        // must be a no-op at every layer.
        #[test]
        fn replanning_after_apply_is_always_a_noop(
            rule_count in 1_usize..40,
            param_counts in proptest::collection::vec(0_usize..4, 1..40),
            tagged in proptest::collection::vec(any::<bool>(), 1..40),
        ) {
            let mut repo_rules = RepositoryDeclaration::new("gen", "java");
            for index in 0..rule_count {
                let mut builder = RuleDeclaration::builder(format!("rule-{index}"))
                    .name(format!("Rule {index}"))
                    .description(format!("Description {index}"));
                if tagged.get(index).copied().unwrap_or(false) {
                    builder = builder.tags([format!("tag-{index}")]);
                }
                let params = param_counts.get(index).copied().unwrap_or(0);
                for p in 0..params {
                    builder = builder.param(
                        ParamDeclaration::new(format!("param-{p}")).default_value(format!("{p}")),
                    );
                }
                match builder.build() {
                    Ok(rule) => repo_rules = repo_rules.rule(rule),
                    Err(err) => panic!("build failed: {err}"),
                }
            }
            let providers: Vec<Box<dyn RuleProvider>> = {
                let declared = repo_rules.clone();
                vec![provider("gen", move |context| context.declare(declared.clone()))]
            };
            let set = match DeclarationSet::collect(&providers) {
                Ok(collected) => collected,
                Err(err) => panic!("collect failed: {err}"),
            };

            let mut snapshot = CatalogSnapshot::default();
            let first = plan(&set, &snapshot, &PlanOptions::at(date(0)));
            prop_assert_eq!(first.inserted(), rule_count);
            apply_to_snapshot(&first, &mut snapshot);

            let second = plan(&set, &snapshot, &PlanOptions::at(date(1)));
            prop_assert!(second.is_noop());
            prop_assert_eq!(second.unchanged, rule_count);
        }
    }
}
