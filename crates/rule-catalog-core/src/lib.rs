use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod reconcile;

pub use reconcile::{plan, ParamOp, PlanOptions, ReconcilePlan, RuleAction, RuleWrite};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DeclarationError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Stable surrogate identifier for a logical rule. Survives renames; exactly
/// one catalog row exists per identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RuleId(pub Ulid);

impl RuleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite rule identity: `(repository, rule)`, rendered as `repository:rule`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RuleKey {
    pub repository: String,
    pub rule: String,
}

impl RuleKey {
    #[must_use]
    pub fn new(repository: impl Into<String>, rule: impl Into<String>) -> Self {
        Self { repository: repository.into(), rule: rule.into() }
    }

    /// Parse a `repository:rule` pair.
    ///
    /// # Errors
    /// Returns [`DeclarationError::Validation`] when either side is missing or blank.
    pub fn parse(value: &str) -> Result<Self, DeclarationError> {
        let Some((repository, rule)) = value.split_once(':') else {
            return Err(DeclarationError::Validation(format!(
                "rule key must be formatted as repository:rule, got {value}"
            )));
        };
        if repository.trim().is_empty() || rule.trim().is_empty() {
            return Err(DeclarationError::Validation(format!(
                "rule key must be formatted as repository:rule, got {value}"
            )));
        }
        Ok(Self::new(repository, rule))
    }
}

impl Display for RuleKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.rule)
    }
}

/// Lifecycle status of a rule. `Removed` is never declared by a provider; it
/// is assigned by reconciliation when a rule stops being declared.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Beta,
    #[default]
    Ready,
    Deprecated,
    Removed,
}

impl RuleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beta => "beta",
            Self::Ready => "ready",
            Self::Deprecated => "deprecated",
            Self::Removed => "removed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "beta" => Some(Self::Beta),
            "ready" => Some(Self::Ready),
            "deprecated" => Some(Self::Deprecated),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// A rule parameter as declared by a provider. Description and default value
/// are fully owned by the declaration and overwritten on every run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParamDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ParamDeclaration {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, default_value: None }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn default_value(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }
}

/// One rule as declared inside a repository declaration. Severity, type and
/// remediation descriptors are opaque passthrough strings.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleDeclaration {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub rule_type: Option<String>,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    #[serde(default)]
    pub internal_key: Option<String>,
    #[serde(default)]
    pub remediation: Option<String>,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub params: Vec<ParamDeclaration>,
    #[serde(default)]
    pub deprecated_keys: Vec<RuleKey>,
}

impl RuleDeclaration {
    #[must_use]
    pub fn builder(key: impl Into<String>) -> RuleDeclarationBuilder {
        RuleDeclarationBuilder {
            inner: Self {
                key: key.into(),
                name: String::new(),
                description: String::new(),
                severity: None,
                status: RuleStatus::Ready,
                rule_type: None,
                system_tags: BTreeSet::new(),
                internal_key: None,
                remediation: None,
                is_template: false,
                params: Vec::new(),
                deprecated_keys: Vec::new(),
            },
        }
    }

    /// Validate one declaration against the collector-boundary invariants.
    ///
    /// # Errors
    /// Returns [`DeclarationError::Validation`] when the key, name or
    /// description is blank, when `removed` is declared, or when two
    /// parameters share a name.
    pub fn validate(&self) -> Result<(), DeclarationError> {
        if self.key.trim().is_empty() {
            return Err(DeclarationError::Validation("rule key MUST be non-empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(DeclarationError::Validation(format!(
                "rule {} MUST declare a name",
                self.key
            )));
        }
        if self.description.trim().is_empty() {
            return Err(DeclarationError::Validation(format!(
                "rule {} MUST declare a description",
                self.key
            )));
        }
        if self.status == RuleStatus::Removed {
            return Err(DeclarationError::Validation(format!(
                "rule {} declares status removed, which is reserved for reconciliation",
                self.key
            )));
        }

        let mut names = BTreeSet::new();
        for param in &self.params {
            if param.name.trim().is_empty() {
                return Err(DeclarationError::Validation(format!(
                    "rule {} declares a parameter without a name",
                    self.key
                )));
            }
            if !names.insert(param.name.as_str()) {
                return Err(DeclarationError::Validation(format!(
                    "rule {} declares parameter {} twice",
                    self.key, param.name
                )));
            }
        }

        Ok(())
    }
}

/// Builds an immutable [`RuleDeclaration`]: collect all fields, then freeze
/// with [`RuleDeclarationBuilder::build`]. Partially-built rules never cross a
/// component boundary.
#[derive(Debug, Clone)]
pub struct RuleDeclarationBuilder {
    inner: RuleDeclaration,
}

impl RuleDeclarationBuilder {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.inner.name = name.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.inner.description = description.into();
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: impl Into<String>) -> Self {
        self.inner.severity = Some(severity.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: RuleStatus) -> Self {
        self.inner.status = status;
        self
    }

    #[must_use]
    pub fn rule_type(mut self, rule_type: impl Into<String>) -> Self {
        self.inner.rule_type = Some(rule_type.into());
        self
    }

    /// Replace the declared system tag set.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.system_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn internal_key(mut self, internal_key: impl Into<String>) -> Self {
        self.inner.internal_key = Some(internal_key.into());
        self
    }

    #[must_use]
    pub fn remediation(mut self, remediation: impl Into<String>) -> Self {
        self.inner.remediation = Some(remediation.into());
        self
    }

    #[must_use]
    pub fn template(mut self, is_template: bool) -> Self {
        self.inner.is_template = is_template;
        self
    }

    #[must_use]
    pub fn param(mut self, param: ParamDeclaration) -> Self {
        self.inner.params.push(param);
        self
    }

    /// Record a former key under which this rule was previously declared.
    /// Declaration order is significant: the first alias that resolves to an
    /// existing catalog row wins identity resolution.
    #[must_use]
    pub fn deprecated_key(mut self, repository: impl Into<String>, rule: impl Into<String>) -> Self {
        self.inner.deprecated_keys.push(RuleKey::new(repository, rule));
        self
    }

    /// Freeze the declaration.
    ///
    /// # Errors
    /// Returns [`DeclarationError::Validation`] when the declaration violates
    /// collector-boundary invariants (see [`RuleDeclaration::validate`]).
    pub fn build(self) -> Result<RuleDeclaration, DeclarationError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

/// One repository declaration produced by a provider. An extension declares
/// extra rules for a repository key it does not own; it never contributes
/// repository metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepositoryDeclaration {
    pub key: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleDeclaration>,
    #[serde(default)]
    pub extension: bool,
}

impl RepositoryDeclaration {
    #[must_use]
    pub fn new(key: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            language: language.into(),
            display_name: None,
            rules: Vec::new(),
            extension: false,
        }
    }

    #[must_use]
    pub fn extension_of(key: impl Into<String>, language: impl Into<String>) -> Self {
        Self { extension: true, ..Self::new(key, language) }
    }

    #[must_use]
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    #[must_use]
    pub fn rule(mut self, rule: RuleDeclaration) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Collects repository declarations from one provider invocation.
#[derive(Debug)]
pub struct DeclarationContext {
    plugin_key: String,
    declared: Vec<(String, RepositoryDeclaration)>,
}

impl DeclarationContext {
    #[must_use]
    fn new(plugin_key: &str) -> Self {
        Self { plugin_key: plugin_key.to_string(), declared: Vec::new() }
    }

    pub fn declare(&mut self, repository: RepositoryDeclaration) {
        self.declared.push((self.plugin_key.clone(), repository));
    }
}

/// A source of rule declarations, invoked exactly once per run.
pub trait RuleProvider {
    fn plugin_key(&self) -> &str;
    fn define(&self, context: &mut DeclarationContext);
}

struct FnProvider<F> {
    plugin_key: String,
    define: F,
}

impl<F> RuleProvider for FnProvider<F>
where
    F: Fn(&mut DeclarationContext),
{
    fn plugin_key(&self) -> &str {
        &self.plugin_key
    }

    fn define(&self, context: &mut DeclarationContext) {
        (self.define)(context);
    }
}

/// Wrap a closure as a provider. Providers are a fixed ordered list of
/// declaration-producing callables supplied at run start.
pub fn provider<F>(plugin_key: impl Into<String>, define: F) -> Box<dyn RuleProvider>
where
    F: Fn(&mut DeclarationContext) + 'static,
{
    Box::new(FnProvider { plugin_key: plugin_key.into(), define })
}

/// A rule flattened out of its repository declaration, carrying its full key
/// and the plugin that declared it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRule {
    pub key: RuleKey,
    pub plugin_key: String,
    pub name: String,
    pub description: String,
    pub severity: Option<String>,
    pub status: RuleStatus,
    pub rule_type: Option<String>,
    pub system_tags: BTreeSet<String>,
    pub internal_key: Option<String>,
    pub remediation: Option<String>,
    pub is_template: bool,
    pub params: Vec<ParamDeclaration>,
    pub deprecated_keys: Vec<RuleKey>,
}

impl DeclaredRule {
    fn from_declaration(repository: &str, plugin_key: &str, rule: RuleDeclaration) -> Self {
        Self {
            key: RuleKey::new(repository, rule.key),
            plugin_key: plugin_key.to_string(),
            name: rule.name,
            description: rule.description,
            severity: rule.severity,
            status: rule.status,
            rule_type: rule.rule_type,
            system_tags: rule.system_tags,
            internal_key: rule.internal_key,
            remediation: rule.remediation,
            is_template: rule.is_template,
            params: rule.params,
            deprecated_keys: rule.deprecated_keys,
        }
    }
}

/// Persisted repository metadata row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepositoryRecord {
    pub key: String,
    pub language: String,
    pub display_name: String,
}

/// The fully materialized output of every provider for one run.
#[derive(Debug, Clone, Default)]
pub struct DeclarationSet {
    pub repositories: Vec<RepositoryRecord>,
    pub rules: Vec<DeclaredRule>,
}

impl DeclarationSet {
    /// Invoke every provider once and merge all repository declarations into
    /// one in-memory model, in declaration order.
    ///
    /// # Errors
    /// Returns [`DeclarationError::Validation`] when any rule declaration is
    /// malformed or a rule key is declared twice within a repository.
    pub fn collect(providers: &[Box<dyn RuleProvider>]) -> Result<Self, DeclarationError> {
        let mut declared: Vec<(String, RepositoryDeclaration)> = Vec::new();
        for p in providers {
            let mut context = DeclarationContext::new(p.plugin_key());
            p.define(&mut context);
            declared.append(&mut context.declared);
        }

        let mut repositories: Vec<RepositoryRecord> = Vec::new();
        let mut owned: BTreeSet<String> = BTreeSet::new();
        let mut seen_keys: BTreeSet<RuleKey> = BTreeSet::new();
        let mut rules: Vec<DeclaredRule> = Vec::new();

        for (plugin_key, repository) in declared {
            if repository.key.trim().is_empty() {
                return Err(DeclarationError::Validation(
                    "repository key MUST be non-empty".to_string(),
                ));
            }

            // Extensions (and repeated declarations) keep the first owner's
            // metadata and only contribute rules.
            if owned.insert(repository.key.clone()) {
                let display_name =
                    repository.display_name.clone().unwrap_or_else(|| repository.key.clone());
                repositories.push(RepositoryRecord {
                    key: repository.key.clone(),
                    language: repository.language.clone(),
                    display_name,
                });
            }

            for rule in repository.rules {
                rule.validate()?;
                let flattened = DeclaredRule::from_declaration(&repository.key, &plugin_key, rule);
                if !seen_keys.insert(flattened.key.clone()) {
                    return Err(DeclarationError::Validation(format!(
                        "rule {} is declared twice",
                        flattened.key
                    )));
                }
                rules.push(flattened);
            }
        }

        Ok(Self { repositories, rules })
    }
}

/// A persisted catalog row. User tags and the user note are owned by catalog
/// users and never touched by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogRule {
    pub id: RuleId,
    pub key: RuleKey,
    pub name: String,
    pub description: String,
    pub severity: Option<String>,
    pub status: RuleStatus,
    pub rule_type: Option<String>,
    pub system_tags: BTreeSet<String>,
    pub internal_key: Option<String>,
    pub remediation: Option<String>,
    pub is_template: bool,
    pub plugin_key: String,
    pub organization: Option<String>,
    pub user_tags: BTreeSet<String>,
    pub note_data: Option<String>,
    pub note_user: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A persisted rule parameter, unique per `(rule_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CatalogParam {
    pub rule_id: RuleId,
    pub name: String,
    pub description: Option<String>,
    pub default_value: Option<String>,
}

/// A recorded former key of a still-tracked rule.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AliasRecord {
    pub key: RuleKey,
    pub rule_id: RuleId,
}

/// Everything the planner needs from the catalog, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub rules: Vec<CatalogRule>,
    pub params: Vec<CatalogParam>,
    pub aliases: Vec<AliasRecord>,
}

/// Injectable time source, consulted once per run.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Always returns the wrapped instant. Test harnesses drive multi-run
/// scenarios by swapping the clock between runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}
