//! Definition loading for config-driven mode: one file or a directory of
//! files, each holding one or more YAML/JSON GenericController documents.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use metak_apis::GenericController;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

const EXPECTED_API_VERSION: &str = "metac.openebs.io/v1alpha1";
const EXPECTED_KIND: &str = "GenericController";

/// Load all definitions under `path`. Later documents with an
/// already-seen "{ns}/{name}" key are skipped, not merged.
pub fn load(path: &str) -> Result<Vec<GenericController>> {
    let path = Path::new(path);
    let meta = std::fs::metadata(path)
        .with_context(|| format!("reading config path {}", path.display()))?;

    let mut files = Vec::new();
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("listing config dir {}", path.display()))?
        {
            let p = entry?.path();
            if p.is_file() {
                files.push(p);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }

    let mut out: Vec<GenericController> = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        for ctrl in parse_documents(&text)
            .with_context(|| format!("parsing {}", file.display()))?
        {
            let key = ctrl.key();
            if out.iter().any(|c| c.key() == key) {
                warn!(key = %key, file = %file.display(), "duplicate definition; keeping the first");
                continue;
            }
            debug!(key = %key, file = %file.display(), "loaded definition");
            out.push(ctrl);
        }
    }
    Ok(out)
}

/// Parse a multi-document YAML string (JSON is a YAML subset) into
/// definitions. Empty documents are skipped; anything that is not a
/// GenericController is an error.
pub fn parse_documents(text: &str) -> Result<Vec<GenericController>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).context("parsing YAML document")?;
        if value.is_null() {
            continue;
        }
        let json: serde_json::Value =
            serde_json::to_value(value).context("converting YAML document to JSON")?;
        let api_version = json.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = json.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if api_version != EXPECTED_API_VERSION || kind != EXPECTED_KIND {
            bail!(
                "unexpected document {}/{} (want {}/{})",
                api_version,
                kind,
                EXPECTED_API_VERSION,
                EXPECTED_KIND
            );
        }
        let ctrl: GenericController =
            serde_json::from_value(json).context("decoding GenericController")?;
        if ctrl.metadata.name.as_deref().unwrap_or_default().is_empty() {
            bail!("GenericController document missing metadata.name");
        }
        out.push(ctrl);
    }
    Ok(out)
}
