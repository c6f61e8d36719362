//! VLAN interface watcher
//!
//! The interface job creates `vlan<id>` inside the manager's network
//! namespace from the outside, so the manager cannot be told when it lands.
//! The kernel sends no notifications for virtual filesystems either, so this
//! is a plain 500ms polling loop over `/sys/class/net` waiting for the link
//! to appear.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::{vlan_link_name, Result};

/// Interval between directory scans
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polls the network class directory for this instance's VLAN link
pub struct VlanWatcher {
    link_name: String,
    sys_class_net: PathBuf,
}

impl VlanWatcher {
    /// Watch for `vlan<id>` under `/sys/class/net`
    pub fn new(vlan_id: u16) -> Self {
        Self::with_path(vlan_id, PathBuf::from("/sys/class/net"))
    }

    /// Watch under a custom directory
    pub fn with_path(vlan_id: u16, sys_class_net: PathBuf) -> Self {
        Self {
            link_name: vlan_link_name(vlan_id),
            sys_class_net,
        }
    }

    /// Block until the link appears, returning its name
    pub async fn wait_for_link(&self) -> Result<String> {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let mut entries = tokio::fs::read_dir(&self.sys_class_net)
                .await
                .map_err(|e| {
                    crate::Error::unrecoverable(format!(
                        "reading {}: {e}",
                        self.sys_class_net.display()
                    ))
                })?;
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy() == self.link_name {
                    info!(link = %self.link_name, "vlan interface found");
                    return Ok(self.link_name.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_the_link_once_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = VlanWatcher::with_path(100, dir.path().to_path_buf());

        let path = dir.path().join("vlan100");
        let waiter = tokio::spawn(async move { watcher.wait_for_link().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::create_dir(&path).unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("watcher should finish")
            .unwrap()
            .unwrap();
        assert_eq!(found, "vlan100");
    }

    #[tokio::test]
    async fn ignores_other_links() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("eth0")).unwrap();
        std::fs::create_dir(dir.path().join("vlan999")).unwrap();
        let watcher = VlanWatcher::with_path(100, dir.path().to_path_buf());

        let result =
            tokio::time::timeout(Duration::from_millis(1200), watcher.wait_for_link()).await;
        assert!(result.is_err(), "watcher must keep waiting");
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let watcher = VlanWatcher::with_path(100, PathBuf::from("/definitely/not/here"));
        let result = watcher.wait_for_link().await;
        assert!(result.is_err());
    }
}
