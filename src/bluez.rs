//! Adapter liveness through BlueZ, for hosts where the kernel owns the line
//! after bring-up and the command engine is no longer reachable.

use std::time::Duration;

use bluer::Session;
use log::{debug, warn};
use tokio::runtime::Runtime;

use crate::supervisor::LivenessCheck;

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Asks BlueZ whether the adapter exists and is powered.
pub struct BluezLiveness {
    rt: Runtime,
    adapter: Option<String>,
}

impl BluezLiveness {
    /// Check `adapter` (e.g. `hci0`), or the default adapter when `None`.
    pub fn new(adapter: Option<String>) -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { rt, adapter })
    }

    async fn query(&self) -> bluer::Result<bool> {
        let session = Session::new().await?;
        let adapter = match &self.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        let powered = adapter.is_powered().await?;
        debug!("adapter {} powered={}", adapter.name(), powered);
        Ok(powered)
    }
}

impl LivenessCheck for BluezLiveness {
    fn is_alive(&mut self) -> bool {
        let result = self
            .rt
            .block_on(async { tokio::time::timeout(QUERY_TIMEOUT, self.query()).await });
        match result {
            Ok(Ok(powered)) => powered,
            Ok(Err(e)) => {
                warn!("bluez adapter query failed: {}", e);
                false
            }
            Err(_) => {
                warn!("bluez adapter query timed out after {:?}", QUERY_TIMEOUT);
                false
            }
        }
    }
}
