use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::model::Booking;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Tenant names become WAL file names, so only a safe alphabet is allowed.
fn validate_tenant_name(tenant: &str) -> io::Result<()> {
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Already-loaded engine, without creating one.
    pub fn get(&self, tenant: &str) -> Option<Arc<Engine>> {
        self.engines.get(tenant).map(|e| e.value().clone())
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.get(tenant) {
            return Ok(engine);
        }
        validate_tenant_name(tenant)?;
        // len() visits every shard; call it before holding an entry lock.
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{tenant}.wal"));
                let engine = Arc::new(Engine::new(tenant, wal_path)?);
                v.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, bookings = engine.booking_count(), "tenant engine loaded");
        Ok(engine)
    }

    /// Load every `<tenant>.wal` in the data directory so cross-tenant reads
    /// see salons that have not connected since startup. Returns how many
    /// tenants were loaded.
    pub fn load_existing(&self) -> io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(tenant) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get_or_create(tenant) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(path = %path.display(), "skipping WAL file: {e}"),
            }
        }
        Ok(loaded)
    }

    /// Snapshot of the loaded engines, ordered by tenant name.
    pub fn engines(&self) -> Vec<Arc<Engine>> {
        let mut engines: Vec<_> = self.engines.iter().map(|e| e.value().clone()).collect();
        engines.sort_by(|a, b| a.tenant().cmp(b.tenant()));
        engines
    }

    /// Locate a booking by id in whichever tenant holds it.
    pub async fn find_booking(&self, id: Ulid) -> Option<(Arc<Engine>, Booking)> {
        for engine in self.engines() {
            if !engine.contains_booking(&id) {
                continue;
            }
            if let Some(booking) = engine.get_booking(id).await {
                return Some((engine, booking));
            }
        }
        None
    }

    /// Bookings of one master across every tenant.
    pub async fn list_by_master(&self, master: &str) -> Vec<Booking> {
        let mut out = Vec::new();
        for engine in self.engines() {
            out.extend(engine.list_by_master(master).await);
        }
        sort_across_tenants(out)
    }

    /// Bookings whose phone digits end with `suffix`, across every tenant.
    pub async fn list_by_phone_suffix(&self, suffix: &str) -> Vec<Booking> {
        let mut out = Vec::new();
        for engine in self.engines() {
            out.extend(engine.list_by_phone_suffix(suffix).await);
        }
        sort_across_tenants(out)
    }
}

fn sort_across_tenants(mut bookings: Vec<Booking>) -> Vec<Booking> {
    bookings.sort_by(|a, b| {
        (a.date, a.start_time, &a.tenant_id).cmp(&(b.date, b.start_time, &b.tenant_id))
    });
    bookings
}
