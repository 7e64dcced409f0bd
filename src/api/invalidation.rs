use std::collections::BTreeMap;

/// Decides which cache prefixes a successful write invalidates.
///
/// A write to a path invalidates its own collection and every owning item
/// above it: `/clients/42/branches/7` drops `/clients/42/branches` and
/// `/clients/42`. Configured `related` prefixes are added for writes under a
/// matching collection, for resources embedded in a parent that is not part
/// of their path.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
  related: BTreeMap<String, Vec<String>>,
}

impl InvalidationRules {
  pub fn new(related: BTreeMap<String, Vec<String>>) -> Self {
    Self { related }
  }

  pub fn prefixes_for(&self, path: &str) -> Vec<String> {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
      return Vec::new();
    }

    // `/collection/id` pairs; an odd count ends on a collection
    let collection_len = if segments.len() % 2 == 0 {
      segments.len() - 1
    } else {
      segments.len()
    };

    let join = |n: usize| format!("/{}", segments[..n].join("/"));
    let collection = join(collection_len);

    let mut prefixes = vec![collection.clone()];
    prefixes.extend((2..collection_len).step_by(2).map(join));

    for (root, extra) in &self.related {
      if is_under(&collection, root) {
        prefixes.extend(extra.iter().cloned());
      }
    }

    let mut seen = std::collections::HashSet::new();
    prefixes.retain(|p| seen.insert(p.clone()));
    prefixes
  }
}

/// `path` equals `root` or lies below it on a segment boundary.
fn is_under(path: &str, root: &str) -> bool {
  let root = root.trim_end_matches('/');
  path
    .strip_prefix(root)
    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_collection_write() {
    let rules = InvalidationRules::default();
    assert_eq!(rules.prefixes_for("/clients"), vec!["/clients"]);
    assert_eq!(rules.prefixes_for("/clients/42"), vec!["/clients"]);
  }

  #[test]
  fn test_nested_write_invalidates_owner() {
    let rules = InvalidationRules::default();
    assert_eq!(
      rules.prefixes_for("/clients/42/branches"),
      vec!["/clients/42/branches", "/clients/42"]
    );
    assert_eq!(
      rules.prefixes_for("/clients/42/branches/7?populate=*"),
      vec!["/clients/42/branches", "/clients/42"]
    );
  }

  #[test]
  fn test_related_prefixes() {
    let mut related = BTreeMap::new();
    related.insert("/branches".to_string(), vec!["/clients".to_string()]);
    let rules = InvalidationRules::new(related);

    assert_eq!(rules.prefixes_for("/branches/3"), vec!["/branches", "/clients"]);
    assert_eq!(rules.prefixes_for("/contracts/3"), vec!["/contracts"]);
    assert_eq!(
      rules.prefixes_for("/branches-archive/3"),
      vec!["/branches-archive"]
    );
  }

  #[test]
  fn test_root_path() {
    assert!(InvalidationRules::default().prefixes_for("/").is_empty());
  }
}
