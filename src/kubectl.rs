//! Manifest applier
//!
//! Resources are applied with `kubectl apply -f -` against the node's admin
//! kubeconfig. Server-side apply keeps re-runs idempotent.

use std::path::Path;

use tracing::{debug, info};

use crate::exec;
use crate::Result;

/// Join YAML documents into one multi-document stream
pub fn join_documents<S: AsRef<str>>(documents: &[S]) -> String {
    documents
        .iter()
        .map(|doc| {
            let doc = doc.as_ref().trim();
            if doc.starts_with("---") {
                doc.to_string()
            } else {
                format!("---\n{}", doc)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply YAML documents with server-side apply
pub async fn apply_manifests<S: AsRef<str>>(
    step: &str,
    kubeconfig: &Path,
    documents: &[S],
) -> Result<()> {
    if documents.is_empty() {
        return Ok(());
    }

    let kubeconfig = kubeconfig.display().to_string();
    let args = exec::args([
        "--kubeconfig",
        kubeconfig.as_str(),
        "apply",
        "--server-side",
        "--force-conflicts",
        "--field-manager",
        "cpboot",
        "-f",
        "-",
    ]);
    let stream = join_documents(documents);
    let out = exec::run(step, "kubectl", &args, Some(&stream)).await?;
    info!(step, count = documents.len(), "Applied manifests");
    debug!(output = %out.trim(), "kubectl apply output");
    Ok(())
}
