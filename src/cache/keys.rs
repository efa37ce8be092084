/// Computes final cache keys from logical keys.
///
/// A leading `{` marks a cluster hash-tag segment: it must survive prefixing
/// byte-for-byte so multi-key commands on related keys stay in one cluster
/// slot. The prefix is applied at most once; routing an already-routed key
/// is a no-op.
#[derive(Debug, Clone, Default)]
pub struct KeyRouter {
  prefix: String,
}

impl KeyRouter {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
    }
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  /// Apply the configured prefix to a logical key, preserving a leading
  /// hash-tag delimiter. Pure and idempotent.
  pub fn route(&self, key: &str) -> String {
    if self.prefix.is_empty() {
      return key.to_string();
    }
    let (slot_pfx, rest) = match key.strip_prefix('{') {
      Some(rest) => ("{", rest),
      None => ("", key),
    };
    if rest.starts_with(&self.prefix) {
      format!("{}{}", slot_pfx, rest)
    } else {
      format!("{}{}{}", slot_pfx, self.prefix, rest)
    }
  }
}

/// Normalize a JSON-document path: `$` is the root, anything not already
/// rooted becomes `$.<path>`.
pub fn normalize_json_path(path: &str) -> String {
  if path.is_empty() || path == "$" {
    return "$".into();
  }
  if path.starts_with("$.") {
    path.into()
  } else {
    format!("$.{}", path)
  }
}
