//! Database assembly.
//!
//! A [`Database`] owns everything logical connections share: the
//! process context, the entity registry, the id-source factories and
//! the pool over one driver. The builder wires those up in order and
//! can bootstrap the schema for the registered entities, after which
//! `connect` hands out independent logical connections and `watch`
//! puts a poller on its own one.

use sqlentity_core::Result;
use sqlentity_core::backend::Backend;
use sqlentity_core::config::ConnectConfig;
use sqlentity_core::context::Context;
use sqlentity_core::driver::DriverFactory;
use sqlentity_core::error::{ConfigError, Error};
use sqlentity_pool::{Pool, PoolConfig, PoolStats};
use sqlentity_session::{
    Entity, EntityDescriptor, EntityRegistry, IdSourceFactories, LogicalConnection,
    create_entity_table, create_support_tables,
};
use sqlentity_watch::{WatchConfig, Watcher};
use std::sync::Arc;

type Registration = Box<dyn Fn(&EntityRegistry) -> Result<Arc<EntityDescriptor>> + Send>;

/// Shared per-store state behind every connection.
pub struct Database {
    context: Arc<Context>,
    entities: Arc<EntityRegistry>,
    factories: Arc<IdSourceFactories>,
    pool: Pool,
    backend: Backend,
    config: ConnectConfig,
}

impl Database {
    /// Start assembling a database around `config`.
    #[must_use]
    pub fn builder(config: ConnectConfig) -> DatabaseBuilder {
        DatabaseBuilder {
            config,
            pool: PoolConfig::default(),
            driver: None,
            bootstrap: false,
            registrations: Vec::new(),
        }
    }

    /// Open a logical connection under the database's own identity.
    #[allow(clippy::result_large_err)]
    pub fn connect(&self) -> Result<LogicalConnection> {
        self.connect_as(self.config.clone())
    }

    /// Open a logical connection under a caller-supplied identity.
    ///
    /// The user in `config` is what the modification log records for
    /// everything written over this connection.
    #[allow(clippy::result_large_err)]
    pub fn connect_as(&self, config: ConnectConfig) -> Result<LogicalConnection> {
        LogicalConnection::local(
            Arc::clone(&self.context),
            Arc::clone(&self.entities),
            Arc::clone(&self.factories),
            config,
            self.pool.clone(),
            self.backend,
        )
    }

    /// Spawn a change poller on a dedicated connection.
    #[allow(clippy::result_large_err)]
    pub fn watch(&self, config: WatchConfig) -> Result<Watcher> {
        Watcher::spawn(self.connect()?, config)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn entities(&self) -> &Arc<EntityRegistry> {
        &self.entities
    }

    pub fn id_sources(&self) -> &Arc<IdSourceFactories> {
        &self.factories
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Pool occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the pool. Connections already handed out keep working
    /// until returned; new checkouts fail.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("target", &self.config.target)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// Configures and assembles a [`Database`].
pub struct DatabaseBuilder {
    config: ConnectConfig,
    pool: PoolConfig,
    driver: Option<(Backend, Box<dyn DriverFactory>)>,
    bootstrap: bool,
    registrations: Vec<Registration>,
}

impl DatabaseBuilder {
    /// Select the driver and the dialect its statements use.
    #[must_use]
    pub fn driver(mut self, backend: Backend, factory: Box<dyn DriverFactory>) -> Self {
        self.driver = Some((backend, factory));
        self
    }

    /// Pool settings, [`PoolConfig::default`] otherwise.
    #[must_use]
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Register an entity type up front.
    ///
    /// Registration is otherwise lazy, but the server dispatcher and
    /// log replay resolve entities by class name, which only works for
    /// types whose descriptor has been built. Registered entities also
    /// take part in schema bootstrap.
    #[must_use]
    pub fn register<T: Entity + 'static>(mut self) -> Self {
        self.registrations
            .push(Box::new(|entities| entities.descriptor::<T>()));
        self
    }

    /// Create the support tables and the registered entity tables at
    /// build time. Off unless asked for; production schemas usually
    /// already exist.
    #[must_use]
    pub fn create_schema(mut self, on: bool) -> Self {
        self.bootstrap = on;
        self
    }

    /// Assemble the database, build registered descriptors and run the
    /// schema bootstrap when asked to.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Database> {
        let Some((backend, factory)) = self.driver else {
            return Err(Error::Config(ConfigError {
                message: "database builder has no driver".to_string(),
            }));
        };
        let context = Context::new();
        let entities = EntityRegistry::new(Arc::clone(&context), backend);
        let factories = IdSourceFactories::new();
        let pool = Pool::new(self.pool, factory, Arc::clone(&context))?;
        let db = Database {
            context,
            entities,
            factories,
            pool,
            backend,
            config: self.config,
        };

        let mut descriptors = Vec::with_capacity(self.registrations.len());
        for register in &self.registrations {
            descriptors.push(register(&db.entities)?);
        }
        if self.bootstrap {
            let mut boot = db.connect()?;
            create_support_tables(&mut boot)?;
            for desc in &descriptors {
                create_entity_table(&mut boot, desc)?;
            }
            boot.close()?;
            tracing::info!(
                target = %db.config.target,
                entities = descriptors.len(),
                "schema bootstrapped"
            );
        }
        Ok(db)
    }
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("target", &self.config.target)
            .field("bootstrap", &self.bootstrap)
            .field("registrations", &self.registrations.len())
            .finish_non_exhaustive()
    }
}
