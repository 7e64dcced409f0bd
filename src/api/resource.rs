use std::fmt;

/// Identity of a resource on the server.
///
/// A `Draft` exists only locally: it has no item path and is created with a
/// POST to its collection rather than updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
  Persisted(String),
  Draft,
}

impl ResourceId {
  pub fn persisted(id: impl Into<String>) -> Self {
    Self::Persisted(id.into())
  }

  pub fn is_draft(&self) -> bool {
    matches!(self, Self::Draft)
  }

  /// `collection/id` for a persisted resource; drafts have no server path.
  pub fn item_path(&self, collection: &str) -> Option<String> {
    match self {
      Self::Persisted(id) => Some(format!("{}/{}", collection.trim_end_matches('/'), id)),
      Self::Draft => None,
    }
  }
}

impl From<Option<String>> for ResourceId {
  fn from(id: Option<String>) -> Self {
    id.map_or(Self::Draft, Self::Persisted)
  }
}

impl fmt::Display for ResourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Persisted(id) => f.write_str(id),
      Self::Draft => f.write_str("(draft)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_item_path() {
    assert_eq!(
      ResourceId::persisted("42").item_path("/clients/"),
      Some("/clients/42".to_string())
    );
    assert_eq!(ResourceId::Draft.item_path("/clients"), None);
  }

  #[test]
  fn test_from_option() {
    assert!(ResourceId::from(None).is_draft());
    assert_eq!(ResourceId::from(Some("7".to_string())), ResourceId::persisted("7"));
  }
}
