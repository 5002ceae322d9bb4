//! JSON documents given on the command line
//!
//! A document argument is inline JSON (starts with `{` or `[`), an
//! `http(s)://` URL or a path to a file.

use anyhow::{bail, Context, Result};
use meshgate_gateway::ServiceFilter;
use meshgate_proto::Service;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

pub async fn load(source: &str) -> Result<Value> {
    let source = source.trim();
    if source.starts_with('{') || source.starts_with('[') {
        return serde_json::from_str(source).context("Invalid inline JSON document");
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        debug!("Fetching document from {}", source);
        let response = reqwest::get(source)
            .await
            .with_context(|| format!("Failed to fetch {}", source))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch {}", source))?;
        return response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from {}", source));
    }

    let path = Path::new(source);
    if !path.exists() {
        bail!("Document {} is neither JSON, a URL nor an existing file", source);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Services from `{"services": [...]}` or a bare array; malformed entries are skipped
pub fn services(document: &Value) -> Vec<Service> {
    let list = document.get("services").unwrap_or(document);
    let entries = match list {
        Value::Array(entries) => entries.as_slice(),
        other => std::slice::from_ref(other),
    };

    entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<Service>(entry.clone()) {
            Ok(service) if service.gate_port != 0 && service.service_port != 0 => Some(service),
            Ok(_) => {
                warn!("Invalid service {}: ports must be non-zero", entry);
                None
            }
            Err(e) => {
                warn!("Invalid service {}: {}", entry, e);
                None
            }
        })
        .collect()
}

pub async fn load_services(sources: &[String]) -> Result<Vec<Service>> {
    let mut all = Vec::new();
    for source in sources {
        all.extend(services(&load(source).await?));
    }
    Ok(all)
}

pub async fn load_filter(sources: &[String]) -> Result<Option<ServiceFilter>> {
    if sources.is_empty() {
        return Ok(None);
    }
    let mut filter = ServiceFilter::default();
    for source in sources {
        let document = load(source).await?;
        filter.extend(
            ServiceFilter::from_document(&document)
                .with_context(|| format!("Invalid service filter {}", source))?,
        );
    }
    Ok(Some(filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_proto::Protocol;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_inline_and_file() {
        let inline = load(r#" {"services": []} "#).await.unwrap();
        assert_eq!(inline, json!({"services": []}));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"gatePort": 80, "serviceHost": "web", "servicePort": 8080}}]"#).unwrap();
        let loaded = load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(loaded[0]["gatePort"], 80);
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_source() {
        assert!(load("/definitely/not/here.json").await.is_err());
        assert!(load("{broken").await.is_err());
    }

    #[test]
    fn test_services_skip_invalid_entries() {
        let parsed = services(&json!({"services": [
            {"gatePort": 53, "serviceHost": "dns", "servicePort": 53, "protocol": "udp"},
            {"gatePort": "x", "serviceHost": "bad", "servicePort": 1},
            {"gatePort": 0, "serviceHost": "zero", "servicePort": 1},
            {"gatePort": 443, "serviceHost": "web", "servicePort": 8443, "tags": "prod"}
        ]}));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].protocol, Protocol::Udp);
        assert_eq!(parsed[1].tags.as_deref(), Some("prod"));
    }

    #[tokio::test]
    async fn test_filters_merge() {
        let filter = load_filter(&[
            r#"{"services": [{"gatePort": 80}]}"#.to_string(),
            r#"[{"tags": "prod"}]"#.to_string(),
        ])
        .await
        .unwrap()
        .unwrap();
        assert_eq!(filter.matchers().len(), 2);
        assert!(load_filter(&[]).await.unwrap().is_none());
    }
}
