//! Cache key normalization.

use serde_json::Value;

/// Query/filter parameters attached to a read.
pub type Params = serde_json::Map<String, Value>;

/// Build the cache key for an endpoint and its parameters.
///
/// Without parameters the key is the endpoint itself. Otherwise it is
/// `endpoint?{json}` where object keys are sorted at every level, so two
/// parameter sets with the same content produce the same key no matter the
/// insertion order. An empty parameter set is treated as no parameters.
///
/// Scalars are written the way `serde_json` prints them, so a float keeps its
/// fraction (`1.0`, not `1`) and keys differently from the integer `1`.
///
/// Invalidation matches on raw substrings of this key, so the layout must not change.
pub fn cache_key(endpoint: &str, params: Option<&Params>) -> String {
  match params {
    Some(params) if !params.is_empty() => {
      let mut key = String::with_capacity(endpoint.len() + 32);
      key.push_str(endpoint);
      key.push('?');
      write_object(params, &mut key);
      key
    }
    _ => endpoint.to_string(),
  }
}

fn write_object(map: &Params, out: &mut String) {
  let mut entries: Vec<(&String, &Value)> = map.iter().collect();
  entries.sort_by(|a, b| a.0.cmp(b.0));

  out.push('{');
  for (i, (k, v)) in entries.into_iter().enumerate() {
    if i > 0 {
      out.push(',');
    }
    write_string(k, out);
    out.push(':');
    write_value(v, out);
  }
  out.push('}');
}

fn write_value(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => write_object(map, out),
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_value(item, out);
      }
      out.push(']');
    }
    Value::String(s) => write_string(s, out),
    // Scalars have a single JSON rendering
    other => out.push_str(&other.to_string()),
  }
}

fn write_string(s: &str, out: &mut String) {
  out.push_str(&Value::from(s).to_string());
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn params(value: Value) -> Params {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn test_no_params_is_endpoint() {
    assert_eq!(cache_key("/clients", None), "/clients");
    assert_eq!(cache_key("/clients", Some(&Params::new())), "/clients");
  }

  #[test]
  fn test_key_format() {
    let p = params(json!({"page": 1, "search": "acme"}));
    assert_eq!(
      cache_key("/clients", Some(&p)),
      r#"/clients?{"page":1,"search":"acme"}"#
    );
  }

  #[test]
  fn test_insertion_order_does_not_matter() {
    let mut a = Params::new();
    a.insert("a".into(), json!(1));
    a.insert("b".into(), json!(2));

    let mut b = Params::new();
    b.insert("b".into(), json!(2));
    b.insert("a".into(), json!(1));

    assert_eq!(cache_key("/x", Some(&a)), cache_key("/x", Some(&b)));
  }

  #[test]
  fn test_nested_objects_are_sorted() {
    let mut inner = Params::new();
    inner.insert("status".into(), json!("active"));
    inner.insert("city".into(), json!("Lyon"));
    let mut a = Params::new();
    a.insert("filters".into(), Value::Object(inner));

    assert_eq!(
      cache_key("/clients", Some(&a)),
      r#"/clients?{"filters":{"city":"Lyon","status":"active"}}"#
    );
  }

  #[test]
  fn test_float_keeps_fraction() {
    let float = params(json!({"rate": 1.0}));
    let int = params(json!({"rate": 1}));
    assert_eq!(cache_key("/s", Some(&float)), r#"/s?{"rate":1.0}"#);
    assert_ne!(cache_key("/s", Some(&float)), cache_key("/s", Some(&int)));
  }

  #[test]
  fn test_strings_are_escaped() {
    let p = params(json!({"q": "a\"b"}));
    assert_eq!(cache_key("/s", Some(&p)), r#"/s?{"q":"a\"b"}"#);
  }

  #[test]
  fn test_different_values_differ() {
    let a = params(json!({"page": 1}));
    let b = params(json!({"page": 2}));
    assert_ne!(cache_key("/clients", Some(&a)), cache_key("/clients", Some(&b)));
  }
}
