use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{Order, OrderError, OrderUpdate};

const ORDER_SUFFIX: &str = ".order.json";

/// Durable order records.
///
/// `update` applies the whole [`OrderUpdate`] atomically with respect to
/// other updates of the same order, including its `expected_status` guard.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, OrderError>;

    async fn update(&self, order_id: &str, update: OrderUpdate) -> Result<Order, OrderError>;

    /// Create or replace an order. Used by the external payment flow.
    async fn insert(&self, order: Order) -> Result<(), OrderError>;

    /// Ids of every stored order, sorted.
    async fn list(&self) -> Result<Vec<String>, OrderError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<String, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        let store = Self::new();
        {
            let mut map = store.orders.write().await;
            for order in orders {
                map.insert(order.order_id.clone(), order);
            }
        }
        store
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, OrderError> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn update(&self, order_id: &str, update: OrderUpdate) -> Result<Order, OrderError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))?;
        update.apply_to(order, Utc::now())?;
        Ok(order.clone())
    }

    async fn insert(&self, order: Order) -> Result<(), OrderError> {
        self.orders
            .write()
            .await
            .insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, OrderError> {
        let mut ids: Vec<String> = self.orders.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Orders stored as `<order_id>.order.json` files.
///
/// Guarded updates are serialized within this process only; deployments with
/// several writer processes need a store with native conditional writes.
#[derive(Debug)]
pub struct FileSystemOrderStore {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSystemOrderStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn order_path(&self, order_id: &str) -> Result<PathBuf, OrderError> {
        let valid = !order_id.is_empty()
            && order_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(OrderError::InvalidOrderId(order_id.to_string()));
        }
        Ok(self.directory.join(format!("{order_id}{ORDER_SUFFIX}")))
    }

    async fn read(&self, order_id: &str) -> Result<Option<Order>, OrderError> {
        let path = self.order_path(order_id)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, order: &Order) -> Result<(), OrderError> {
        let path = self.order_path(&order.order_id)?;
        fs::create_dir_all(&self.directory).await?;

        let temp_path = self
            .directory
            .join(format!(".{}.{}.tmp", order.order_id, uuid::Uuid::new_v4()));
        fs::write(&temp_path, serde_json::to_string_pretty(order)?).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(order_id = %order.order_id, status = %order.status, "Order saved");
        Ok(())
    }
}

#[async_trait]
impl OrderStore for FileSystemOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, OrderError> {
        self.read(order_id).await
    }

    async fn update(&self, order_id: &str, update: OrderUpdate) -> Result<Order, OrderError> {
        let _guard = self.write_lock.lock().await;

        let mut order = self
            .read(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))?;
        update.apply_to(&mut order, Utc::now())?;
        self.write(&order).await?;

        info!(order_id = %order_id, status = %order.status, "Order updated");
        Ok(order)
    }

    async fn insert(&self, order: Order) -> Result<(), OrderError> {
        let _guard = self.write_lock.lock().await;
        self.write(&order).await
    }

    async fn list(&self) -> Result<Vec<String>, OrderError> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut order_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(order_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(ORDER_SUFFIX))
            {
                order_ids.push(order_id.to_string());
            }
        }
        order_ids.sort();
        Ok(order_ids)
    }
}
