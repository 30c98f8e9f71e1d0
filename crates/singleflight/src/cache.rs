use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use cordon_core::SyncError;

use crate::group::Group;

impl Group {
    /// Read `key` from the store, filling it through a single-flight
    /// fetch on a miss.
    ///
    /// The fetch runs as a flight on `<key>:fetch`: one caller across all
    /// processes executes `f`, serializes the value with JSON, and writes
    /// it under `key` with `ttl`; everyone else waits for the flight and
    /// then reads the stored value. Returns the value and whether it was
    /// already present (`true` = cache hit).
    #[instrument(name = "singleflight.load_or_store", skip_all, fields(%key))]
    pub async fn load_or_store<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<(T, bool), SyncError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let store = Arc::clone(self.locker().store());

        if let Some(raw) = store.get(key).await? {
            return Ok((decode(key, &raw)?, true));
        }

        let fetch_key = format!("{key}:fetch");
        let data_key = key.to_owned();
        let writer = Arc::clone(&store);
        self.run(&fetch_key, move |_cancel| async move {
            let value = f().await?;
            let raw = serde_json::to_string(&value)
                .map_err(|e| SyncError::Store(format!("encode value for {data_key}: {e}")))?;
            writer.set(&data_key, &raw, Some(ttl)).await
        })
        .await?;

        // Leader or waiter, the value is now in the store.
        let raw = store.get(key).await?.ok_or_else(|| {
            SyncError::Store(format!("fetch for {key} completed but stored no value"))
        })?;
        Ok((decode(key, &raw)?, false))
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, SyncError> {
    serde_json::from_str(raw).map_err(|e| SyncError::Store(format!("decode value for {key}: {e}")))
}
