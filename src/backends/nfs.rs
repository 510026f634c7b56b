//! Export Table Manager
//!
//! Reconciles desired (path, client) exports against the live kernel export
//! table. The live table is the source of truth: it is queried before every
//! mutation, so repeated events converge without bookkeeping that could
//! drift from reality.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::CommandRunnerRef;

/// Fixed export options for managed shares
const EXPORT_FLAGS: &str = "rw,sync,no_subtree_check,insecure,no_root_squash";

/// One live export table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub path: String,
    pub client: String,
}

/// Parse `showmount --no-headers -e` output into (path, client) pairs.
///
/// A malformed line is a hard error: if the table cannot be parsed it
/// cannot serve as the source of truth for idempotence checks.
pub fn parse_export_table(lines: &[String]) -> Result<Vec<ExportEntry>> {
    let mut entries = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(path), Some(client)) => entries.push(ExportEntry {
                path: path.to_string(),
                client: client.to_string(),
            }),
            _ => {
                return Err(Error::ExportTableParse(format!(
                    "unparseable export line: {line:?}"
                )))
            }
        }
    }
    Ok(entries)
}

/// Manages NFS exports on the current node
pub struct NfsExports {
    runner: CommandRunnerRef,
    /// Address the export table is queried on
    node_address: String,
}

impl NfsExports {
    pub fn new(runner: CommandRunnerRef, node_address: String) -> Self {
        Self {
            runner,
            node_address,
        }
    }

    /// Query the live export table.
    pub async fn list(&self) -> Result<Vec<ExportEntry>> {
        debug!("Listing exports on {}", self.node_address);
        let out = self
            .runner
            .run(
                "showmount",
                &["--no-headers", "-e", self.node_address.as_str()],
            )
            .await?;
        parse_export_table(&out.lines)
    }

    async fn is_exported(&self, path: &str, client: &str) -> Result<bool> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|e| e.path == path && e.client == client))
    }

    /// Export a path to the client selector. No-op when already live.
    pub async fn export(&self, path: &str, client: &str) -> Result<()> {
        if self.is_exported(path, client).await? {
            debug!("Export {}:{} already live", client, path);
            return Ok(());
        }

        info!("Exporting {} to {}", path, client);
        let spec = format!("{client}:{path}");
        match self
            .runner
            .run("exportfs", &["-o", EXPORT_FLAGS, spec.as_str()])
            .await
        {
            Ok(_) => Ok(()),
            // exportfs can report a permission failure from inside a
            // restricted mount namespace while the kernel export still
            // lands; trust it only when the live table confirms.
            Err(err @ Error::HostCommand { .. }) if is_not_permitted(&err) => {
                if self.is_exported(path, client).await? {
                    warn!(
                        "exportfs reported 'not permitted' for {} but the export is live",
                        path
                    );
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Remove an export. No-op when it is not in the live table.
    pub async fn unexport(&self, path: &str, client: &str) -> Result<()> {
        if !self.is_exported(path, client).await? {
            debug!("Export {}:{} already absent", client, path);
            return Ok(());
        }

        info!("Unexporting {} from {}", path, client);
        let spec = format!("{client}:{path}");
        match self.runner.run("exportfs", &["-u", spec.as_str()]).await {
            Ok(_) => Ok(()),
            Err(err @ Error::HostCommand { .. }) if is_not_permitted(&err) => {
                if !self.is_exported(path, client).await? {
                    warn!(
                        "exportfs reported 'not permitted' for {} but the export is gone",
                        path
                    );
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }
}

fn is_not_permitted(err: &Error) -> bool {
    match err {
        Error::HostCommand { stderr, .. } => {
            stderr.to_ascii_lowercase().contains("not permitted")
        }
        _ => false,
    }
}
