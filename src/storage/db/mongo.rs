//! MongoDB document provider.

use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use mongodb::options::{ClientOptions, CreateCollectionOptions, IndexOptions};
use mongodb::{Client, ClientSession, IndexModel};
use tokio::sync::RwLock;

use crate::config::DocumentConfig;
use crate::storage::traits::{Database, DocumentDatabase, Transaction};
use crate::storage::types::{CollectionOptions, EngineType, IndexDefinition};
use crate::storage::{Context, StorageError};

const ENGINE: EngineType = EngineType::Document;

/// Application name reported in the handshake.
const APP_NAME: &str = "polystore";

fn index_model(index: IndexDefinition) -> Result<IndexModel, StorageError> {
    if index.keys.is_empty() {
        return Err(StorageError::InvalidData(
            "index definition has no keys".to_string(),
        ));
    }
    let mut keys = Document::new();
    for key in &index.keys {
        keys.insert(key.field.clone(), key.order.as_index_direction());
    }

    let mut options = IndexOptions::default();
    options.name = index.name;
    options.unique = index.unique.then_some(true);
    options.sparse = index.sparse.then_some(true);
    options.expire_after = index.ttl;

    Ok(IndexModel::builder().keys(keys).options(options).build())
}

fn collection_options(options: CollectionOptions) -> Result<CreateCollectionOptions, StorageError> {
    if options.capped && options.size_bytes.is_none() {
        return Err(StorageError::InvalidData(
            "capped collection requires size_bytes".to_string(),
        ));
    }
    let mut create = CreateCollectionOptions::default();
    if options.capped {
        create.capped = Some(true);
        create.size = options.size_bytes;
        create.max = options.max_documents;
    }
    create.validator = options.validator;
    Ok(create)
}

/// MongoDB provider.
pub struct MongoProvider {
    config: DocumentConfig,
    client: RwLock<Option<Client>>,
}

impl std::fmt::Debug for MongoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoProvider")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

impl MongoProvider {
    /// Create a provider. Performs no I/O.
    pub fn new(config: DocumentConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    async fn client(&self) -> Result<Client, StorageError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or(StorageError::NotConnected(ENGINE))
    }

    async fn db(&self) -> Result<mongodb::Database, StorageError> {
        Ok(self.client().await?.database(&self.config.database))
    }

    /// Per-operation bound when the caller sets none.
    fn op_ctx(&self, ctx: &Context) -> Context {
        ctx.or_timeout(self.config.socket_timeout)
    }

    async fn client_options(&self, ctx: &Context) -> Result<ClientOptions, StorageError> {
        let url = self.config.connection_url()?;
        let mut options = ctx.run(ClientOptions::parse(url.as_str())).await?;
        options.app_name = Some(APP_NAME.to_string());
        options.max_pool_size = Some(self.config.max_pool_size);
        options.min_pool_size = Some(self.config.min_pool_size);
        options.max_idle_time = Some(self.config.max_idle_time);
        options.connect_timeout = Some(self.config.connect_timeout);
        options.server_selection_timeout = Some(self.config.server_selection_timeout);
        Ok(options)
    }
}

#[async_trait]
impl Database for MongoProvider {
    async fn connect(&self, ctx: &Context) -> Result<(), StorageError> {
        self.config.validate()?;
        if self.client.read().await.is_some() {
            return Ok(());
        }

        let ctx = ctx.or_timeout(self.config.server_selection_timeout);
        let options = self
            .client_options(&ctx)
            .await
            .map_err(|e| StorageError::connection(ENGINE, e))?;
        let client =
            Client::with_options(options).map_err(|e| StorageError::connection(ENGINE, e))?;

        let ping = ctx
            .run(
                client
                    .database(&self.config.database)
                    .run_command(doc! { "ping": 1 }),
            )
            .await;
        if let Err(e) = ping {
            client.shutdown().await;
            return Err(StorageError::connection(ENGINE, e));
        }

        *self.client.write().await = Some(client);
        tracing::info!(
            engine = %ENGINE,
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database,
            max_pool_size = self.config.max_pool_size,
            "Connected"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if let Some(client) = self.client.write().await.take() {
            client.shutdown().await;
            tracing::info!(engine = %ENGINE, "Client closed");
        }
        Ok(())
    }

    async fn health(&self, ctx: &Context) -> Result<(), StorageError> {
        let db = self.db().await?;
        self.op_ctx(ctx)
            .run(db.run_command(doc! { "ping": 1 }))
            .await?;
        Ok(())
    }

    fn engine_type(&self) -> EngineType {
        ENGINE
    }

    async fn begin_tx(&self, ctx: &Context) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(self.begin_session(ctx).await?))
    }
}

#[async_trait]
impl DocumentDatabase for MongoProvider {
    async fn create_collection(
        &self,
        ctx: &Context,
        name: &str,
        options: CollectionOptions,
    ) -> Result<(), StorageError> {
        let db = self.db().await?;
        let options = collection_options(options)?;
        self.op_ctx(ctx)
            .run(db.create_collection(name).with_options(options))
            .await?;
        tracing::info!(collection = name, "Collection created");
        Ok(())
    }

    async fn drop_collection(&self, ctx: &Context, name: &str) -> Result<(), StorageError> {
        let db = self.db().await?;
        self.op_ctx(ctx)
            .run(db.collection::<Document>(name).drop())
            .await?;
        tracing::info!(collection = name, "Collection dropped");
        Ok(())
    }

    async fn list_collections(&self, ctx: &Context) -> Result<Vec<String>, StorageError> {
        let db = self.db().await?;
        let mut names = self.op_ctx(ctx).run(db.list_collection_names()).await?;
        names.sort();
        Ok(names)
    }

    async fn create_index(
        &self,
        ctx: &Context,
        collection: &str,
        index: IndexDefinition,
    ) -> Result<String, StorageError> {
        let db = self.db().await?;
        let model = index_model(index)?;
        let result = self
            .op_ctx(ctx)
            .run(db.collection::<Document>(collection).create_index(model))
            .await?;
        tracing::info!(collection, index = %result.index_name, "Index created");
        Ok(result.index_name)
    }

    async fn drop_index(
        &self,
        ctx: &Context,
        collection: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let db = self.db().await?;
        self.op_ctx(ctx)
            .run(db.collection::<Document>(collection).drop_index(name))
            .await?;
        Ok(())
    }

    async fn list_indexes(
        &self,
        ctx: &Context,
        collection: &str,
    ) -> Result<Vec<String>, StorageError> {
        let db = self.db().await?;
        let names = self
            .op_ctx(ctx)
            .run(db.collection::<Document>(collection).list_index_names())
            .await?;
        Ok(names)
    }

    async fn begin_session(&self, ctx: &Context) -> Result<DocumentTransaction, StorageError> {
        let client = self.client().await?;
        let ctx = self.op_ctx(ctx);
        let mut session = ctx.run(client.start_session()).await?;
        ctx.run(session.start_transaction()).await?;
        Ok(DocumentTransaction {
            session: Some(session),
            ctx,
        })
    }

    async fn database(&self) -> Result<mongodb::Database, StorageError> {
        self.db().await
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Session-scoped multi-document transaction.
///
/// Pass [`DocumentTransaction::session`] to collection operations with
/// `.session(...)` so they join the transaction. Requires a replica set or
/// sharded cluster.
pub struct DocumentTransaction {
    session: Option<ClientSession>,
    ctx: Context,
}

impl std::fmt::Debug for DocumentTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentTransaction")
            .field("active", &self.session.is_some())
            .finish()
    }
}

impl DocumentTransaction {
    /// The session operations must carry to join this transaction.
    pub fn session(&mut self) -> Result<&mut ClientSession, StorageError> {
        self.session.as_mut().ok_or(StorageError::TransactionClosed)
    }
}

#[async_trait]
impl Transaction for DocumentTransaction {
    fn engine_type(&self) -> EngineType {
        ENGINE
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let mut session = self.session.take().ok_or(StorageError::TransactionClosed)?;
        self.ctx.run(session.commit_transaction()).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let mut session = self.session.take().ok_or(StorageError::TransactionClosed)?;
        self.ctx.run(session.abort_transaction()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::types::SortOrder;

    #[test]
    fn test_index_model_keeps_key_order() {
        let model = index_model(
            IndexDefinition::new("tenant_id", SortOrder::Ascending)
                .key("created_at", SortOrder::Descending)
                .with_name("tenant_created")
                .unique()
                .with_ttl(Duration::from_secs(60)),
        )
        .unwrap();

        let fields: Vec<&String> = model.keys.keys().collect();
        assert_eq!(fields, ["tenant_id", "created_at"]);
        assert_eq!(model.keys.get_i32("created_at").unwrap(), -1);

        let options = model.options.unwrap();
        assert_eq!(options.name.as_deref(), Some("tenant_created"));
        assert_eq!(options.unique, Some(true));
        assert_eq!(options.sparse, None);
        assert_eq!(options.expire_after, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_index_model_requires_keys() {
        let err = index_model(IndexDefinition::default()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
    }

    #[test]
    fn test_capped_collection_requires_size() {
        let err = collection_options(CollectionOptions {
            capped: true,
            ..CollectionOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));

        let options = collection_options(CollectionOptions {
            capped: true,
            size_bytes: Some(4096),
            max_documents: Some(10),
            validator: None,
        })
        .unwrap();
        assert_eq!(options.capped, Some(true));
        assert_eq!(options.size, Some(4096));
        assert_eq!(options.max, Some(10));
    }

    #[tokio::test]
    async fn test_operations_before_connect_are_not_connected() {
        let provider = MongoProvider::new(DocumentConfig::default());
        let ctx = Context::background();

        assert!(provider.health(&ctx).await.unwrap_err().is_not_connected());
        assert!(
            provider
                .list_collections(&ctx)
                .await
                .unwrap_err()
                .is_not_connected()
        );
        assert!(provider.database().await.unwrap_err().is_not_connected());
        assert!(provider.begin_tx(&ctx).await.unwrap_err().is_not_connected());
        provider.close().await.unwrap();
    }
}
