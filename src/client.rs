//! Explicitly constructed client with a connect/shutdown lifecycle.
//!
//! A [`TodoClient`] owns one store for one application id, plus the schema
//! used to validate wire requests. It is passed to whatever needs it; there
//! is no process-global connection.

use crate::actions::TodoActions;
use crate::error::{Result, StoreError};
use crate::schema::Schema;
use crate::store::{Store, StoreConfig};
use crate::subscriptions::{LiveQuery, Query, QueryResult, SubscriptionHandle};
use crate::transaction::{Transaction, TransactionReceipt, TxStep};
use crate::types::{StoreStats, Todo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Environment variable holding the application id.
pub const APP_ID_ENV: &str = "LIVETODO_APP_ID";

/// Environment variable holding the data directory. Unset means in-memory.
pub const DATA_DIR_ENV: &str = "LIVETODO_DATA_DIR";

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Opaque id selecting which store to connect to.
    pub app_id: String,

    pub store: StoreConfig,
}

impl ClientConfig {
    /// In-memory configuration for `app_id`.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Read [`APP_ID_ENV`] and [`DATA_DIR_ENV`].
    ///
    /// With a data directory the store is journaled under
    /// `<data dir>/<app id>`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::var(APP_ID_ENV).ok(),
            std::env::var(DATA_DIR_ENV).ok(),
        )
    }

    fn from_vars(app_id: Option<String>, data_dir: Option<String>) -> Result<Self> {
        let app_id = app_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| StoreError::Config(format!("{} is not set", APP_ID_ENV)))?;

        let mut config = Self::new(app_id);
        if let Some(dir) = data_dir.filter(|d| !d.is_empty()) {
            config.store.path = Some(PathBuf::from(dir).join(&config.app_id));
        }
        Ok(config)
    }
}

/// Error object in a [`QueryResponse`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub message: String,
}

/// Data object in a [`QueryResponse`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryData {
    pub todos: Vec<Todo>,
}

/// Response to a one-shot query: `{isLoading, error, data}`.
///
/// Results are computed synchronously, so `is_loading` is always false once
/// a response exists; it is kept for the wire shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub is_loading: bool,
    pub error: Option<QueryError>,
    pub data: Option<QueryData>,
}

impl QueryResponse {
    fn ok(result: QueryResult) -> Self {
        Self {
            is_loading: false,
            error: None,
            data: Some(QueryData {
                todos: result.todos,
            }),
        }
    }

    fn failed(error: &StoreError) -> Self {
        Self {
            is_loading: false,
            error: Some(QueryError {
                message: error.to_string(),
            }),
            data: None,
        }
    }
}

/// Connection to a todo store.
pub struct TodoClient {
    app_id: String,
    schema: Schema,
    /// `None` after shutdown.
    store: RwLock<Option<Arc<Store>>>,
}

impl TodoClient {
    /// Open the store for `config.app_id`.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        if config.app_id.trim().is_empty() {
            return Err(StoreError::Config("app id must not be empty".into()));
        }

        let store = Store::open(config.store).map_err(|e| match e {
            StoreError::Locked | StoreError::Load(_) | StoreError::Config(_) => e,
            other => StoreError::Load(other.to_string()),
        })?;

        info!(app_id = %config.app_id, persistent = store.path().is_some(), "client connected");

        Ok(Self {
            app_id: config.app_id,
            schema: Schema::todos(),
            store: RwLock::new(Some(Arc::new(store))),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_closed(&self) -> bool {
        self.store.read().is_none()
    }

    fn store(&self) -> Result<Arc<Store>> {
        self.store.read().clone().ok_or(StoreError::Closed)
    }

    /// One-shot query. Failures are reported in the response.
    pub fn query(&self, query: &Query) -> QueryResponse {
        match self.store() {
            Ok(store) => QueryResponse::ok(store.snapshot_matching(query)),
            Err(e) => QueryResponse::failed(&e),
        }
    }

    /// One-shot query from a wire request such as `{"todos": {}}`.
    pub fn query_json(&self, request: &serde_json::Value) -> QueryResponse {
        match self.schema.parse_query(request) {
            Ok(query) => self.query(&query),
            Err(e) => QueryResponse::failed(&e),
        }
    }

    /// See [`Store::subscribe`].
    pub fn subscribe<F>(&self, query: Query, callback: F) -> Result<LiveQuery>
    where
        F: FnMut(&QueryResult) + Send + 'static,
    {
        self.store()?.subscribe(query, callback)
    }

    /// See [`Store::subscribe_channel`].
    pub fn subscribe_channel(&self, query: Query) -> Result<SubscriptionHandle> {
        self.store()?.subscribe_channel(query)
    }

    /// Apply a typed transaction.
    pub fn transact(&self, tx: Transaction) -> Result<TransactionReceipt> {
        self.store()?.apply(tx)
    }

    /// Validate and apply wire-level steps as one transaction.
    pub fn transact_steps(&self, steps: Vec<TxStep>) -> Result<TransactionReceipt> {
        let store = self.store()?;
        store.apply_with(|table| self.schema.resolve_steps(steps, |id| table.contains(id)))
    }

    /// Action helpers bound to this client's store.
    pub fn actions(&self) -> Result<TodoActions> {
        Ok(TodoActions::new(self.store()?))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.store()?.stats())
    }

    /// Close the store and disconnect.
    ///
    /// Later calls fail with [`StoreError::Closed`], including writes and
    /// subscriptions through [`TodoActions`] handed out earlier. Calling this
    /// twice is fine. The journal lock is released once those actions have
    /// been dropped too.
    pub fn shutdown(&self) -> Result<()> {
        let store = match self.store.read().clone() {
            Some(store) => store,
            None => return Ok(()),
        };
        store.close()?;
        self.store.write().take();
        info!(app_id = %self.app_id, "client shut down");
        Ok(())
    }
}

impl Drop for TodoClient {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
