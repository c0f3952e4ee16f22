//! In-memory tenant store for tests and single-process deployments.
//!
//! Transactions stage their writes and apply them under one lock on commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tenant_tasks::{ExecutionScope, TaskError, TenantResolver, TransactionManager};

use crate::organization::{Domain, Organization, TenantRegistry};
use crate::replica::{Record, ReplicaStore};

type Replicas = BTreeMap<(String, String), Record>;

#[derive(Debug, Clone)]
struct TenantEntry {
    organization: Organization,
    domains: Vec<Domain>,
    replicas: Replicas,
}

#[derive(Debug)]
enum Staged {
    UpsertTenant(Organization, Domain),
    DropTenant(String),
    Put {
        subject: String,
        key: String,
        record: Record,
    },
    Remove {
        subject: String,
        key: String,
    },
}

#[derive(Default)]
pub struct MemoryTenantStore {
    tenants: Arc<Mutex<BTreeMap<String, TenantEntry>>>,
}

impl MemoryTenantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tenant directly, bypassing tasks.
    pub fn insert_tenant(&self, organization: Organization, domain: Domain) {
        let slug = organization.slug_name.clone();
        self.tenants.lock().insert(
            slug,
            TenantEntry {
                organization,
                domains: vec![domain],
                replicas: Replicas::new(),
            },
        );
    }

    #[must_use]
    pub fn tenant(&self, slug: &str) -> Option<Organization> {
        self.tenants
            .lock()
            .get(slug)
            .map(|t| t.organization.clone())
    }

    #[must_use]
    pub fn domains(&self, slug: &str) -> Vec<Domain> {
        self.tenants
            .lock()
            .get(slug)
            .map(|t| t.domains.clone())
            .unwrap_or_default()
    }

    /// Committed replica record of `subject`/`key` in tenant `slug`.
    #[must_use]
    pub fn replica(&self, slug: &str, subject: &str, key: &str) -> Option<Record> {
        self.tenants
            .lock()
            .get(slug)
            .and_then(|t| t.replicas.get(&(subject.to_owned(), key.to_owned())).cloned())
    }

    #[must_use]
    pub fn replica_count(&self, slug: &str) -> usize {
        self.tenants.lock().get(slug).map_or(0, |t| t.replicas.len())
    }
}

#[async_trait]
impl TenantResolver for MemoryTenantStore {
    type Tenant = Organization;

    async fn resolve(&self, slug: &str) -> Result<Option<Organization>, TaskError> {
        Ok(self.tenant(slug))
    }
}

/// A transaction over [`MemoryTenantStore`].
pub struct MemoryTx {
    tenants: Arc<Mutex<BTreeMap<String, TenantEntry>>>,
    schema: Option<String>,
    staged: Vec<Staged>,
}

impl MemoryTx {
    fn schema(&self) -> Result<&str, TaskError> {
        self.schema.as_deref().ok_or_else(|| TaskError::Transaction {
            operation: "replica access",
            reason: "no tenant in scope".to_owned(),
        })
    }

    fn staged_record(&self, subject: &str, key: &str) -> Option<Option<Record>> {
        self.staged.iter().rev().find_map(|op| match op {
            Staged::Put {
                subject: s,
                key: k,
                record,
            } if s == subject && k == key => Some(Some(record.clone())),
            Staged::Remove { subject: s, key: k } if s == subject && k == key => Some(None),
            _ => None,
        })
    }
}

#[async_trait]
impl TransactionManager for MemoryTenantStore {
    type Tenant = Organization;
    type Tx = MemoryTx;

    async fn begin(&self, scope: &ExecutionScope<Organization>) -> Result<MemoryTx, TaskError> {
        Ok(MemoryTx {
            tenants: Arc::clone(&self.tenants),
            schema: scope.tenant().map(|t| t.schema_name().to_owned()),
            staged: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), TaskError> {
        let mut tenants = self.tenants.lock();
        if let Some(schema) = &tx.schema
            && !tenants.contains_key(schema)
        {
            return Err(TaskError::Transaction {
                operation: "commit",
                reason: format!("tenant '{schema}' was dropped"),
            });
        }

        for op in tx.staged {
            match op {
                Staged::UpsertTenant(organization, domain) => {
                    let slug = organization.slug_name.clone();
                    let entry = tenants.entry(slug).or_insert_with(|| TenantEntry {
                        organization: organization.clone(),
                        domains: Vec::new(),
                        replicas: Replicas::new(),
                    });
                    entry.organization = organization;
                    if !entry.domains.contains(&domain) {
                        entry.domains.push(domain);
                    }
                }
                Staged::DropTenant(slug) => {
                    tenants.remove(&slug);
                }
                Staged::Put {
                    subject,
                    key,
                    record,
                } => {
                    if let Some(schema) = &tx.schema
                        && let Some(entry) = tenants.get_mut(schema)
                    {
                        entry.replicas.insert((subject, key), record);
                    }
                }
                Staged::Remove { subject, key } => {
                    if let Some(schema) = &tx.schema
                        && let Some(entry) = tenants.get_mut(schema)
                    {
                        entry.replicas.remove(&(subject, key));
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), TaskError> {
        tracing::debug!(discarded = tx.staged.len(), "transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl ReplicaStore for MemoryTx {
    async fn get(&mut self, subject: &str, key: &str) -> Result<Option<Record>, TaskError> {
        if let Some(staged) = self.staged_record(subject, key) {
            return Ok(staged);
        }
        let schema = self.schema()?;
        Ok(self
            .tenants
            .lock()
            .get(schema)
            .and_then(|t| t.replicas.get(&(subject.to_owned(), key.to_owned())).cloned()))
    }

    async fn put(&mut self, subject: &str, key: &str, record: Record) -> Result<(), TaskError> {
        self.schema()?;
        self.staged.push(Staged::Put {
            subject: subject.to_owned(),
            key: key.to_owned(),
            record,
        });
        Ok(())
    }

    async fn remove(&mut self, subject: &str, key: &str) -> Result<bool, TaskError> {
        let existed = self.get(subject, key).await?.is_some();
        self.staged.push(Staged::Remove {
            subject: subject.to_owned(),
            key: key.to_owned(),
        });
        Ok(existed)
    }
}

#[async_trait]
impl TenantRegistry for MemoryTx {
    async fn upsert_tenant(
        &mut self,
        organization: Organization,
        domain: Domain,
    ) -> Result<(), TaskError> {
        self.staged.push(Staged::UpsertTenant(organization, domain));
        Ok(())
    }

    async fn drop_tenant(&mut self, slug: &str) -> Result<bool, TaskError> {
        let existed = self.tenants.lock().contains_key(slug);
        self.staged.push(Staged::DropTenant(slug.to_owned()));
        Ok(existed)
    }
}
