//! Launcher registry and elections

use super::{decode, Coordinator};
use crate::election::Election;
use crate::error::{Error, Result};
use crate::model::{from_json, to_json, Launcher};
use crate::paths;
use crate::store::CreateMode;

/// Election run by processes that emit pool statistics
pub const STATS_ELECTION: &str = "stats";

impl Coordinator {
    /// Register a launcher for the lifetime of this session. Re-registering
    /// an unchanged launcher does nothing.
    pub async fn register_launcher(&self, launcher: &Launcher) -> Result<()> {
        let store = self.store()?;
        let path = paths::launcher(&launcher.id);

        if let Some((data, _)) = self.read(&path).await? {
            let registered: Launcher = from_json(&path, &data)?;
            if registered != *launcher {
                store.set(&path, to_json(launcher)?, None).await?;
                tracing::debug!("Updated registration for launcher {}", launcher.id);
            }
            return Ok(());
        }

        match store
            .create(&path, to_json(launcher)?, CreateMode::EPHEMERAL, true)
            .await
        {
            Ok(_) => {
                tracing::debug!("Registered launcher {}", launcher.id);
                Ok(())
            }
            // Lost a race with ourselves on another task
            Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn deregister_launcher(&self, id: &str) -> Result<()> {
        self.remove(&paths::launcher(id), false).await
    }

    /// Every launcher currently registered by a live session
    pub async fn registered_launchers(&self) -> Result<Vec<Launcher>> {
        let mut launchers = Vec::new();
        for id in self.children(paths::LAUNCHER_ROOT).await? {
            let path = paths::launcher(&id);
            let Some((data, _)) = self.read(&path).await? else {
                continue;
            };
            if let Some(mut launcher) = decode::<Launcher>(&path, &data) {
                launcher.id = id;
                launchers.push(launcher);
            }
        }
        Ok(launchers)
    }

    /// A named election joined as `identifier`
    pub fn election(&self, name: &str, identifier: impl Into<String>) -> Result<Election> {
        Ok(Election::new(self.store()?, name, identifier))
    }

    pub fn stats_election(&self, identifier: impl Into<String>) -> Result<Election> {
        self.election(STATS_ELECTION, identifier)
    }
}
