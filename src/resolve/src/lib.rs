//! Manifest reference resolution.
//!
//! Scans a (possibly multi-document) YAML buffer for string leaves that
//! a builder supports, builds and publishes each one, and rewrites the
//! leaves to the published names. Documents keep their structure and
//! ordering; only matched strings change.

use std::collections::{HashMap, HashSet};

use kolite_build::Builder;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_publish::Publisher;
use serde::Deserialize;
use serde_yaml::Value;

/// Resolve every supported reference in `doc`, returning the rewritten
/// buffer. In strict mode a scheme-qualified string no builder supports
/// is a hard error; otherwise it is logged and left unchanged.
pub async fn image_references(
    doc: &[u8],
    strict: bool,
    token: &CancelToken,
    builder: &dyn Builder,
    publisher: &dyn Publisher,
) -> Result<Vec<u8>> {
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_slice(doc) {
        documents.push(Value::deserialize(deserializer)?);
    }

    // First pass: collect candidate strings in encounter order.
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for document in &documents {
        walk_strings(document, &mut |s| {
            if seen.insert(s.to_string()) {
                candidates.push(s.to_string());
            }
        });
    }

    // Resolve each candidate once. Within one document candidates
    // resolve sequentially; concurrency comes from resolving documents
    // in parallel upstream, deduplicated by the build future cache.
    let mut resolved: HashMap<String, String> = HashMap::new();
    for candidate in candidates {
        match builder.is_supported_reference(&candidate).await {
            Ok(()) => {
                let result = builder.build(token, &candidate).await?;
                let name = publisher.publish(token, &result, &candidate).await?;
                resolved.insert(candidate, name.qualified());
            }
            Err(err) => {
                if candidate.contains("://") {
                    if strict {
                        return Err(KoError::Resolve(format!(
                            "found strict reference {:?} but no builder supports it: {}",
                            candidate, err
                        )));
                    }
                    tracing::warn!(
                        "reference {:?} is not supported, leaving it unchanged: {}",
                        candidate,
                        err
                    );
                } else {
                    tracing::debug!("skipping {:?}: {}", candidate, err);
                }
            }
        }
    }

    // Second pass: rewrite matched leaves in place.
    for document in &mut documents {
        replace_strings(document, &resolved);
    }

    let mut rendered = Vec::with_capacity(documents.len());
    for document in &documents {
        rendered.push(serde_yaml::to_string(document)?);
    }
    Ok(rendered.join("---\n").into_bytes())
}

fn walk_strings(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Sequence(seq) => {
            for item in seq {
                walk_strings(item, visit);
            }
        }
        Value::Mapping(map) => {
            for (_key, item) in map {
                walk_strings(item, visit);
            }
        }
        Value::Tagged(tagged) => walk_strings(&tagged.value, visit),
        _ => {}
    }
}

fn replace_strings(value: &mut Value, resolved: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(name) = resolved.get(s.as_str()) {
                *s = name.clone();
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                replace_strings(item, resolved);
            }
        }
        Value::Mapping(map) => {
            for (_key, item) in map.iter_mut() {
                replace_strings(item, resolved);
            }
        }
        Value::Tagged(tagged) => replace_strings(&mut tagged.value, resolved),
        _ => {}
    }
}
