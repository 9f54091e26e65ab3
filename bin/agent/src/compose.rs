//! Structural rewrites over a Compose v3 stack descriptor.
//!
//! The in-memory form is [serde_yaml_ng::Value] whose mappings keep
//! insertion order. Every rewrite is total: it operates on whatever
//! shape is present and reports what it dropped. Canonical
//! serialization sorts mapping keys at every level so the emitted
//! bytes are stable across runs.

use anyhow::{Context, anyhow};
use indexmap::IndexMap;
use serde_yaml_ng::{Mapping, Value};

pub fn parse(contents: &str) -> anyhow::Result<Value> {
  let value: Value = serde_yaml_ng::from_str(contents)
    .context("Invalid stack file yaml")?;
  if !value.is_mapping() {
    return Err(anyhow!("Stack file must be a yaml mapping"));
  }
  Ok(value)
}

fn prefixed(prefix: &str, name: &str) -> String {
  if prefix.is_empty() {
    name.to_string()
  } else {
    format!("{prefix}_{name}")
  }
}

fn service_names(doc: &Value) -> Vec<String> {
  doc
    .get("services")
    .and_then(Value::as_mapping)
    .map(|services| {
      services
        .keys()
        .filter_map(Value::as_str)
        .map(String::from)
        .collect()
    })
    .unwrap_or_default()
}

/// Renames every service `S` to `<prefix>_S` and updates
/// cross-service references: `depends_on`, `links`,
/// `network_mode: service:S`, `extends.service`. References to
/// names that are not services of this stack are left alone.
pub fn prefix_services(doc: &mut Value, prefix: &str) {
  if prefix.is_empty() {
    return;
  }
  let original = service_names(doc);
  let Some(services) =
    doc.get_mut("services").and_then(Value::as_mapping_mut)
  else {
    return;
  };

  let old = std::mem::take(services);
  for (key, value) in old {
    let key = match key.as_str() {
      Some(name) => Value::from(prefixed(prefix, name)),
      None => key,
    };
    services.insert(key, value);
  }

  for (_, service) in services.iter_mut() {
    rewrite_service_refs(service, &original, prefix);
  }
}

fn rewrite_service_refs(
  service: &mut Value,
  original: &[String],
  prefix: &str,
) {
  if let Some(depends_on) = service.get_mut("depends_on") {
    match depends_on {
      Value::Sequence(seq) => {
        for item in seq {
          if let Some(name) = item.as_str()
            && original.iter().any(|s| s == name)
          {
            let renamed = prefixed(prefix, name);
            *item = Value::from(renamed);
          }
        }
      }
      Value::Mapping(map) => {
        let old = std::mem::take(map);
        for (key, value) in old {
          let key = match key.as_str() {
            Some(name) if original.iter().any(|s| s == name) => {
              Value::from(prefixed(prefix, name))
            }
            _ => key,
          };
          map.insert(key, value);
        }
      }
      _ => {}
    }
  }

  if let Some(Value::Sequence(links)) = service.get_mut("links") {
    for link in links {
      let Some(raw) = link.as_str() else {
        continue;
      };
      let (name, alias) = match raw.split_once(':') {
        Some((name, alias)) => (name, Some(alias)),
        None => (raw, None),
      };
      if original.iter().any(|s| s == name) {
        let renamed = match alias {
          Some(alias) => {
            format!("{}:{alias}", prefixed(prefix, name))
          }
          None => prefixed(prefix, name),
        };
        *link = Value::from(renamed);
      }
    }
  }

  if let Some(network_mode) = service.get_mut("network_mode") {
    let renamed = network_mode
      .as_str()
      .and_then(|raw| raw.strip_prefix("service:"))
      .filter(|name| original.iter().any(|s| s == name))
      .map(|name| format!("service:{}", prefixed(prefix, name)));
    if let Some(renamed) = renamed {
      *network_mode = Value::from(renamed);
    }
  }

  if let Some(extends) = service.get_mut("extends")
    && let Some(extended) = extends.get_mut("service")
  {
    let renamed = extended
      .as_str()
      .filter(|name| original.iter().any(|s| s == name))
      .map(|name| prefixed(prefix, name));
    if let Some(renamed) = renamed {
      *extended = Value::from(renamed);
    }
  }
}

/// Drops services whose original (un-prefixed) name is excluded,
/// and prunes `depends_on` entries pointing at removed services.
/// Returns the (current) names that were dropped.
pub fn exclude_services(
  doc: &mut Value,
  excluded: &[String],
  prefix: &str,
) -> Vec<String> {
  if excluded.is_empty() {
    return Vec::new();
  }
  let Some(services) =
    doc.get_mut("services").and_then(Value::as_mapping_mut)
  else {
    return Vec::new();
  };

  let removed = excluded
    .iter()
    .map(|name| prefixed(prefix, name))
    .filter(|name| services.contains_key(name.as_str()))
    .collect::<Vec<_>>();
  for name in &removed {
    services.remove(name.as_str());
  }

  for (_, service) in services.iter_mut() {
    let Some(depends_on) = service.get_mut("depends_on") else {
      continue;
    };
    match depends_on {
      Value::Sequence(seq) => seq.retain(|item| {
        item
          .as_str()
          .map(|name| !removed.iter().any(|r| r == name))
          .unwrap_or(true)
      }),
      Value::Mapping(map) => {
        let old = std::mem::take(map);
        for (key, value) in old {
          let drop = key
            .as_str()
            .map(|name| removed.iter().any(|r| r == name))
            .unwrap_or(false);
          if !drop {
            map.insert(key, value);
          }
        }
      }
      _ => {}
    }
  }

  removed
}

/// Drops excluded named top-level volumes, and removes mount
/// entries of each remaining service that reference a removed
/// volume. Returns the dropped volume names.
pub fn exclude_volumes(
  doc: &mut Value,
  excluded: &[String],
) -> Vec<String> {
  if excluded.is_empty() {
    return Vec::new();
  }

  let mut removed = Vec::new();
  if let Some(volumes) =
    doc.get_mut("volumes").and_then(Value::as_mapping_mut)
  {
    for name in excluded {
      if volumes.remove(name.as_str()).is_some() {
        removed.push(name.clone());
      }
    }
  }

  let Some(services) =
    doc.get_mut("services").and_then(Value::as_mapping_mut)
  else {
    return removed;
  };
  for (_, service) in services.iter_mut() {
    let Some(Value::Sequence(mounts)) = service.get_mut("volumes")
    else {
      continue;
    };
    mounts.retain(|mount| {
      let source = match mount {
        Value::String(raw) => {
          raw.split_once(':').map(|(source, _)| source)
        }
        Value::Mapping(map) => {
          map.get("source").and_then(Value::as_str)
        }
        _ => None,
      };
      source
        .map(|source| !excluded.iter().any(|e| e == source))
        .unwrap_or(true)
    });
  }

  removed
}

/// Deep-merges the configured overlays into every remaining
/// service. Mappings merge key-wise with the overlay winning,
/// sequences are replaced unless the overlay sequence is empty,
/// scalars are replaced. List-form `environment` is normalized to
/// a mapping before merging.
pub fn merge_additional(
  doc: &mut Value,
  additional: &IndexMap<String, Value>,
) {
  if additional.is_empty() {
    return;
  }
  let Some(services) =
    doc.get_mut("services").and_then(Value::as_mapping_mut)
  else {
    return;
  };
  for (_, service) in services.iter_mut() {
    let Some(service) = service.as_mapping_mut() else {
      continue;
    };
    for (key, overlay) in additional {
      let mut overlay = overlay.clone();
      if key == "environment" {
        normalize_environment(&mut overlay);
        if let Some(existing) = service.get_mut(key.as_str()) {
          normalize_environment(existing);
        }
      }
      match service.get_mut(key.as_str()) {
        Some(existing) => merge_value(existing, &overlay),
        None => {
          service.insert(Value::from(key.as_str()), overlay);
        }
      }
    }
  }
}

fn merge_value(target: &mut Value, overlay: &Value) {
  match (target, overlay) {
    (Value::Mapping(target), Value::Mapping(overlay)) => {
      for (key, value) in overlay {
        match target.get_mut(key) {
          Some(existing) => merge_value(existing, value),
          None => {
            target.insert(key.clone(), value.clone());
          }
        }
      }
    }
    (target, Value::Sequence(overlay)) => {
      if !overlay.is_empty() {
        *target = Value::Sequence(overlay.clone());
      }
    }
    (target, overlay) => *target = overlay.clone(),
  }
}

/// `["K=V", "FLAG"]` becomes `{K: V, FLAG: null}` so environment
/// overlays merge key-wise regardless of authored style.
fn normalize_environment(value: &mut Value) {
  let Value::Sequence(entries) = value else {
    return;
  };
  let mut map = Mapping::new();
  for entry in entries.iter() {
    let Some(raw) = entry.as_str() else {
      continue;
    };
    match raw.split_once('=') {
      Some((key, val)) => {
        map.insert(Value::from(key), Value::from(val));
      }
      None => {
        map.insert(Value::from(raw), Value::Null);
      }
    }
  }
  *value = Value::Mapping(map);
}

/// Image references of every service, in document order.
pub fn image_refs(doc: &Value) -> Vec<String> {
  doc
    .get("services")
    .and_then(Value::as_mapping)
    .map(|services| {
      services
        .values()
        .filter_map(|service| service.get("image"))
        .filter_map(Value::as_str)
        .map(String::from)
        .collect()
    })
    .unwrap_or_default()
}

/// Serializes with mapping keys sorted at every level. This byte
/// sequence is the deploy artifact; its digest decides whether a
/// redeploy is needed.
pub fn canonical_yaml(doc: &Value) -> anyhow::Result<String> {
  serde_yaml_ng::to_string(&sorted(doc))
    .context("Failed to serialize stack descriptor")
}

fn sorted(value: &Value) -> Value {
  match value {
    Value::Mapping(map) => {
      let mut entries = map
        .iter()
        .map(|(key, value)| (key.clone(), sorted(value)))
        .collect::<Vec<_>>();
      entries.sort_by(|(a, _), (b, _)| key_repr(a).cmp(&key_repr(b)));
      Value::Mapping(Mapping::from_iter(entries))
    }
    Value::Sequence(seq) => {
      Value::Sequence(seq.iter().map(sorted).collect())
    }
    Value::Tagged(tagged) => {
      let mut tagged = tagged.clone();
      tagged.value = sorted(&tagged.value);
      Value::Tagged(tagged)
    }
    other => other.clone(),
  }
}

fn key_repr(key: &Value) -> String {
  match key.as_str() {
    Some(s) => s.to_string(),
    None => serde_yaml_ng::to_string(key).unwrap_or_default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const STACK: &str = r#"
services:
  web:
    image: registry.example.com/web:latest
    depends_on:
      - db
    links:
      - db:database
    environment:
      - MODE=production
  webclient:
    image: registry.example.com/webclient:latest
    depends_on:
      - web
    network_mode: service:web
  db:
    image: postgres:15
    volumes:
      - pgdata:/var/lib/postgresql/data
      - scratch:/scratch
volumes:
  pgdata: {}
  scratch: {}
"#;

  fn doc() -> Value {
    parse(STACK).unwrap()
  }

  #[test]
  fn prefix_renames_all_services_and_references() {
    let mut doc = doc();
    prefix_services(&mut doc, "stg");
    let names = service_names(&doc);
    assert_eq!(names, ["stg_web", "stg_webclient", "stg_db"]);
    let web = doc.get("services").unwrap().get("stg_web").unwrap();
    assert_eq!(
      web.get("depends_on").unwrap()[0].as_str(),
      Some("stg_db")
    );
    assert_eq!(
      web.get("links").unwrap()[0].as_str(),
      Some("stg_db:database")
    );
    let webclient =
      doc.get("services").unwrap().get("stg_webclient").unwrap();
    assert_eq!(
      webclient.get("network_mode").unwrap().as_str(),
      Some("service:stg_web")
    );
  }

  #[test]
  fn prefix_is_injective() {
    let mut doc = doc();
    prefix_services(&mut doc, "stg");
    let mut names = service_names(&doc);
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 3);
  }

  #[test]
  fn excluded_service_never_appears_and_depends_on_is_pruned() {
    let mut doc = doc();
    prefix_services(&mut doc, "stg");
    let removed = exclude_services(
      &mut doc,
      &[String::from("webclient"), String::from("db")],
      "stg",
    );
    assert_eq!(removed, ["stg_webclient", "stg_db"]);
    assert_eq!(service_names(&doc), ["stg_web"]);
    let web = doc.get("services").unwrap().get("stg_web").unwrap();
    assert!(
      web
        .get("depends_on")
        .unwrap()
        .as_sequence()
        .unwrap()
        .is_empty()
    );
  }

  #[test]
  fn excluded_volume_is_dropped_with_its_mounts() {
    let mut doc = doc();
    let removed =
      exclude_volumes(&mut doc, &[String::from("scratch")]);
    assert_eq!(removed, ["scratch"]);
    assert!(
      doc.get("volumes").unwrap().get("scratch").is_none()
    );
    let mounts = doc
      .get("services")
      .unwrap()
      .get("db")
      .unwrap()
      .get("volumes")
      .unwrap()
      .as_sequence()
      .unwrap();
    assert_eq!(mounts.len(), 1);
    assert_eq!(
      mounts[0].as_str(),
      Some("pgdata:/var/lib/postgresql/data")
    );
  }

  #[test]
  fn merge_respects_overlay_policy() {
    let mut doc = doc();
    let additional: IndexMap<String, Value> =
      serde_yaml_ng::from_str(
        r#"
environment:
  DEPLOYED_BY: agent
  MODE: staging
extra_hosts:
  - "registry:10.0.0.2"
"#,
      )
      .unwrap();
    merge_additional(&mut doc, &additional);
    let web = doc.get("services").unwrap().get("web").unwrap();
    // List-form environment was normalized, then merged key-wise
    // with the overlay winning.
    let env = web.get("environment").unwrap();
    assert_eq!(env.get("MODE").unwrap().as_str(), Some("staging"));
    assert_eq!(
      env.get("DEPLOYED_BY").unwrap().as_str(),
      Some("agent")
    );
    assert_eq!(
      web.get("extra_hosts").unwrap()[0].as_str(),
      Some("registry:10.0.0.2")
    );
  }

  #[test]
  fn empty_overlay_sequence_keeps_target() {
    let mut target: Value =
      serde_yaml_ng::from_str("[a, b]").unwrap();
    merge_value(&mut target, &Value::Sequence(Vec::new()));
    assert_eq!(target.as_sequence().unwrap().len(), 2);
  }

  #[test]
  fn image_refs_enumerates_services_in_order() {
    assert_eq!(
      image_refs(&doc()),
      [
        "registry.example.com/web:latest",
        "registry.example.com/webclient:latest",
        "postgres:15"
      ]
    );
  }

  #[test]
  fn canonical_yaml_is_sorted_and_stable() {
    let a = canonical_yaml(&doc()).unwrap();
    let b = canonical_yaml(&parse(&a).unwrap()).unwrap();
    assert_eq!(a, b);
    let db = a.find("  db:").unwrap();
    let web = a.find("  web:").unwrap();
    let webclient = a.find("  webclient:").unwrap();
    assert!(db < web && web < webclient);
  }

  #[test]
  fn duplicate_keys_are_a_parse_error() {
    assert!(
      parse("services:\n  web: {}\nservices:\n  db: {}").is_err()
    );
  }
}
