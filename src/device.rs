use crate::db::{self, Pool};
use crate::error::StorageError;
use tracing::info;
use uuid::Uuid;

pub const DEVICE_ID_KEY: &str = "device_id";

/// Stable identifier of this kiosk, stamped on every punch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// Use `configured` when given, otherwise the id persisted by an earlier
    /// run, otherwise generate one and persist it.
    pub async fn load_or_create(
        pool: &Pool,
        configured: Option<&str>,
    ) -> Result<Self, StorageError> {
        if let Some(id) = configured.map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(Self { id: id.to_string() });
        }
        if let Some(raw) = db::kv_get(pool, DEVICE_ID_KEY).await? {
            let id = String::from_utf8(raw)
                .map_err(|_| StorageError::Corrupt("device id is not utf-8".into()))?;
            if !id.is_empty() {
                return Ok(Self { id });
            }
        }
        let id = format!("kiosk-{}", Uuid::new_v4());
        db::kv_set(pool, DEVICE_ID_KEY, id.as_bytes()).await?;
        info!(device_id = %id, "generated device identity");
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}
