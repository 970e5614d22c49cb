//! Daemon wiring.
//!
//! Assembles the catalog, registry, resolver, filesystem bridge, and
//! supervisor for one mount, resumes engines for items that were active when
//! last persisted, and tears everything down on shutdown.

use std::sync::Arc;

use crate::accounting::UsageAccountant;
use crate::catalog::ItemCatalog;
use crate::config::TidefsConfig;
use crate::lifecycle::LifecycleDriver;
use crate::namespace::NamespaceResolver;
use crate::registry::EngineRegistry;
use crate::store::RecordStore;
use crate::supervisor::Supervisor;
use crate::swarm::EngineLauncher;
use crate::vfs::TorrentVfs;

/// One running tidefs instance.
pub struct TidefsDaemon {
    catalog: Arc<ItemCatalog>,
    registry: Arc<EngineRegistry>,
    namespace: Arc<NamespaceResolver>,
    vfs: Arc<TorrentVfs>,
    supervisor: Supervisor,
}

impl TidefsDaemon {
    /// Builds every component and starts the supervisor.
    ///
    /// The initial lifecycle tick runs inline, so items persisted as
    /// leeching or seeding (and items flagged for deletion) get their
    /// engines back before the first filesystem request arrives.
    pub async fn start(
        config: TidefsConfig,
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Self {
        let catalog = Arc::new(ItemCatalog::new(store));
        catalog.sync_from_store().await;

        let registry = EngineRegistry::new(launcher, catalog.clone(), config.swarm.clone());
        let namespace = Arc::new(NamespaceResolver::new(catalog.clone()));
        namespace.refresh();

        let vfs = Arc::new(TorrentVfs::new(
            catalog.clone(),
            registry.clone(),
            namespace.clone(),
        ));

        let lifecycle =
            LifecycleDriver::new(catalog.clone(), registry.clone(), config.lifecycle.clone());
        lifecycle.tick().await;

        let accountant = UsageAccountant::new(catalog.clone(), registry.clone());
        let supervisor = Supervisor::spawn(
            lifecycle,
            accountant,
            namespace.clone(),
            catalog.clone(),
            &config,
        );

        tracing::info!("Daemon started with {} tracked items", catalog.snapshot().len());

        Self {
            catalog,
            registry,
            namespace,
            vfs,
            supervisor,
        }
    }

    /// The filesystem bridge handler set for this mount.
    pub fn vfs(&self) -> Arc<TorrentVfs> {
        self.vfs.clone()
    }

    pub fn catalog(&self) -> &Arc<ItemCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn namespace(&self) -> &Arc<NamespaceResolver> {
        &self.namespace
    }

    /// Stops the supervisor and destroys every live engine.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
        self.registry.shutdown().await;
        tracing::info!("Daemon stopped");
    }
}
