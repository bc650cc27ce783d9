//! The reconciliation run: collect provider declarations, snapshot the
//! catalog, plan the delta, commit it, reconcile repository records, and
//! project the touched rules into the search index.
//!
//! One run is one sequential pass. The catalog commit is atomic; the index
//! update afterwards is best-effort and repairable by the next run, because
//! reconciliation is idempotent.

use rule_catalog_core::{
    plan, Clock, DeclarationError, DeclarationSet, PlanOptions, RuleId, RuleProvider, SystemClock,
};
use rule_catalog_index_sqlite::{RuleDoc, RuleIndex};
use rule_catalog_store_sqlite::SqliteCatalog;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("declaration error: {0}")]
    Declaration(#[from] DeclarationError),
    #[error("catalog storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Outcome of one reconciliation run.
#[derive(Debug)]
pub struct RunSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped_templates: usize,
    pub repositories_deleted: usize,
    pub touched: Vec<RuleId>,
    pub warnings: Vec<String>,
    /// Set when the index write failed. The catalog commit stands; the next
    /// run repairs the index.
    pub index_error: Option<String>,
}

/// Drives reconciliation runs for a fixed ordered list of providers.
pub struct Registrar {
    providers: Vec<Box<dyn RuleProvider>>,
    clock: Box<dyn Clock>,
    organizations_enabled: bool,
    organization: Option<String>,
}

impl Registrar {
    #[must_use]
    pub fn new(providers: Vec<Box<dyn RuleProvider>>) -> Self {
        Self {
            providers,
            clock: Box::new(SystemClock),
            organizations_enabled: false,
            organization: None,
        }
    }

    /// Replace the time source. The clock is consulted exactly once per run.
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// When enabled, template rules are excluded from reconciliation.
    #[must_use]
    pub fn organizations_enabled(mut self, enabled: bool) -> Self {
        self.organizations_enabled = enabled;
        self
    }

    /// Organization scope stamped onto newly inserted rules.
    #[must_use]
    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Execute one reconciliation run against the given catalog and index.
    ///
    /// # Errors
    /// Returns [`RegistrarError::Declaration`] when a provider produces a
    /// malformed declaration, or [`RegistrarError::Storage`] when the catalog
    /// transaction fails (in which case the catalog is unchanged). An index
    /// failure is NOT an error: it is reported in the summary.
    pub fn run(
        &self,
        catalog: &mut SqliteCatalog,
        index: &mut RuleIndex,
    ) -> Result<RunSummary, RegistrarError> {
        let declarations = DeclarationSet::collect(&self.providers)?;
        info!(
            rules = declarations.rules.len(),
            repositories = declarations.repositories.len(),
            "collected rule declarations"
        );

        let now = self.clock.now();
        let snapshot = catalog.snapshot().map_err(RegistrarError::Storage)?;
        let options = PlanOptions {
            now,
            organizations_enabled: self.organizations_enabled,
            organization: self.organization.clone(),
        };
        let computed = plan(&declarations, &snapshot, &options);

        for key in &computed.skipped_templates {
            info!("Template rule {key} will not be imported, because organizations are enabled.");
        }
        for warning in &computed.warnings {
            warn!("{warning}");
        }

        let repository_changes = catalog
            .save_repositories(&declarations.repositories)
            .map_err(RegistrarError::Storage)?;
        let applied = catalog.apply(&computed).map_err(RegistrarError::Storage)?;

        // Only created and updated rules are projected; an unchanged run
        // costs zero index writes.
        let docs: Vec<RuleDoc> =
            computed.writes.iter().map(|write| RuleDoc::from_rule(&write.rule)).collect();
        let index_error = if docs.is_empty() {
            None
        } else {
            match index.upsert(&docs) {
                Ok(()) => None,
                Err(err) => {
                    error!("index synchronization failed: {err:#}");
                    Some(format!("{err:#}"))
                }
            }
        };

        info!(
            inserted = applied.inserted,
            updated = applied.updated,
            removed = applied.removed,
            unchanged = computed.unchanged,
            "rule catalog reconciled"
        );

        Ok(RunSummary {
            inserted: applied.inserted,
            updated: applied.updated,
            removed: applied.removed,
            unchanged: computed.unchanged,
            skipped_templates: computed.skipped_templates.len(),
            repositories_deleted: repository_changes.deleted,
            touched: applied.touched,
            warnings: computed.warnings,
            index_error,
        })
    }
}
