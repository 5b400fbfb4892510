use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;

/// Answers whether a salon is allowed to take bookings.
///
/// Injected into the booking service so deployments can back it with
/// whatever registry they have.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn is_active(&self, tenant: &str) -> io::Result<bool>;
}

/// Every tenant is active.
pub struct OpenDirectory;

#[async_trait]
impl TenantDirectory for OpenDirectory {
    async fn is_active(&self, _tenant: &str) -> io::Result<bool> {
        Ok(true)
    }
}

/// Fixed allow-list, e.g. from `SALOND_TENANTS`.
pub struct StaticDirectory {
    active: HashSet<String>,
}

impl StaticDirectory {
    pub fn new<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active: tenants.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn is_active(&self, tenant: &str) -> io::Result<bool> {
        Ok(self.active.contains(tenant))
    }
}

/// Directory for a configured allow-list; `None` means no restriction.
pub fn from_config(tenants: Option<&[String]>) -> Arc<dyn TenantDirectory> {
    match tenants {
        Some(list) => Arc::new(StaticDirectory::new(list.iter().cloned())),
        None => Arc::new(OpenDirectory),
    }
}
