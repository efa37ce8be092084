use std::sync::Arc;

use serde_json::Value;

use crate::cache::{run_pipeline, Command, Consumer, KeyRouter, ScanOptions, Scanner, Store};
use crate::db::{RelationalBackend, SqlParam};
use crate::error::EngineError;

/// Members drained per pop when emptying a key set.
const DRAIN_PAGE: i64 = 500;

#[derive(Debug, Clone)]
pub struct ExportOptions {
  /// Column holding the sorted-set member.
  pub content_column: String,
  /// Column holding the score.
  pub score_column: String,
  /// Rows fetched per relational page.
  pub page_size: usize,
  /// Member/score pairs per ZADD command.
  pub batch_size: usize,
}

impl Default for ExportOptions {
  fn default() -> Self {
    Self {
      content_column: "content".into(),
      score_column: "score".into(),
      page_size: 1000,
      batch_size: 100,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
  List,
  Set,
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
  /// Rank-range width per page.
  pub page_size: i64,
  /// Carry scores as `member,score` strings.
  pub with_scores: bool,
}

impl Default for ConvertOptions {
  fn default() -> Self {
    Self {
      page_size: 1000,
      with_scores: false,
    }
  }
}

/// Bounded-batch maintenance operations between the relational store and
/// the cache store. All of them are resumable by construction: no state
/// persists between pages, so stopping between pages is always safe.
pub struct BulkOps {
  store: Arc<dyn Store>,
  router: KeyRouter,
  backend: Arc<dyn RelationalBackend>,
}

impl BulkOps {
  pub fn new(
    store: Arc<dyn Store>,
    router: KeyRouter,
    backend: Arc<dyn RelationalBackend>,
  ) -> Self {
    Self {
      store,
      router,
      backend,
    }
  }

  /// Stream a relational query into a sorted set. Pages the query with
  /// LIMIT/OFFSET and flushes bounded ZADD batches per page; a short page
  /// ends the iteration.
  pub async fn export_to_sorted_set(
    &self,
    sql: &str,
    params: &[SqlParam],
    key: &str,
    opts: ExportOptions,
  ) -> Result<u64, EngineError> {
    let mut offset = 0usize;
    let mut exported = 0u64;
    loop {
      let paged = format!("{} LIMIT {} OFFSET {}", sql, opts.page_size, offset);
      let rows = self.backend.query(&paged, params).await?;
      if rows.is_empty() {
        break;
      }

      let mut commands = Vec::new();
      let mut cmd = Command::new("zadd", key);
      let mut pairs = 0usize;
      for row in &rows {
        let score = row
          .get(&opts.score_column)
          .and_then(score_of)
          .unwrap_or(0.0);
        let member = row
          .get(&opts.content_column)
          .map(member_of)
          .unwrap_or_default();
        cmd = cmd.arg(score).arg(member);
        pairs += 1;
        if pairs == opts.batch_size {
          commands.push(std::mem::replace(&mut cmd, Command::new("zadd", key)));
          pairs = 0;
        }
      }
      if pairs > 0 {
        commands.push(cmd);
      }
      run_pipeline(&self.store, &self.router, commands).await?;

      exported += rows.len() as u64;
      if rows.len() < opts.page_size {
        break;
      }
      offset += opts.page_size;
    }
    Ok(exported)
  }

  /// Rebuild a sorted set as a list or set, paging by rank ranges.
  pub async fn convert_collection(
    &self,
    source: &str,
    target: &str,
    kind: TargetKind,
    opts: ConvertOptions,
  ) -> Result<u64, EngineError> {
    let source = self.router.route(source);
    let target = self.router.route(target);
    let push = match kind {
      TargetKind::List => "lpush",
      TargetKind::Set => "sadd",
    };

    let mut start = 0i64;
    let mut moved = 0u64;
    loop {
      let end = start + opts.page_size;
      let mut range = Command::new("zrange", &source).arg(start).arg(end);
      if opts.with_scores {
        range = range.arg("WITHSCORES");
      }
      let page = self.store.dispatch(range).await?.into_array();
      if page.is_empty() {
        break;
      }

      let members: Vec<String> = if opts.with_scores {
        page
          .chunks(2)
          .filter_map(|pair| match pair {
            [m, s] => Some(format!(
              "{},{}",
              m.as_text().unwrap_or_default(),
              s.as_text().unwrap_or_default()
            )),
            _ => None,
          })
          .collect()
      } else {
        page
          .iter()
          .map(|m| m.as_text().unwrap_or_default().to_string())
          .collect()
      };

      moved += members.len() as u64;
      let mut cmd = Command::new(push, &target);
      for m in members {
        cmd = cmd.arg(m);
      }
      self.store.dispatch(cmd).await?;
      start = end + 1;
    }
    Ok(moved)
  }

  /// Delete by path or pattern. Dotted `key.field` paths become hash-field
  /// deletes, plain keys plain deletes, and `*` patterns expand through
  /// the cursor scanner.
  pub async fn delete_matching(&self, patterns: &[&str]) -> Result<(), EngineError> {
    let mut commands = Vec::new();
    for pattern in patterns {
      if pattern.is_empty() {
        continue;
      }
      if !pattern.contains('*') {
        match pattern.split_once('.') {
          Some((key, field)) => commands.push(Command::new("hdel", key).arg(field)),
          None => commands.push(Command::new("del", *pattern)),
        }
        continue;
      }
      let scanner = Scanner::new(Arc::clone(&self.store), self.router.clone());
      let outcome = scanner
        .scan_keys(
          pattern,
          ScanOptions {
            count: Some(1000),
            ..ScanOptions::default()
          },
          Consumer::Collect,
        )
        .await?;
      // Scanned keys are concrete store keys; routing is idempotent.
      for key in outcome.items {
        commands.push(Command::new("del", key));
      }
    }
    if !commands.is_empty() {
      run_pipeline(&self.store, &self.router, commands).await?;
    }
    Ok(())
  }

  /// Pop every member of a key-holding set and delete the keys it names.
  /// A template with `*` maps each member to the key to delete.
  pub async fn drain_key_set(
    &self,
    set_key: &str,
    sorted: bool,
    template: Option<&str>,
  ) -> Result<u64, EngineError> {
    let set_key = self.router.route(set_key);
    let pop = if sorted { "zpopmin" } else { "spop" };
    let mut deleted = 0u64;
    loop {
      let reply = self
        .store
        .dispatch(Command::new(pop, &set_key).arg(DRAIN_PAGE))
        .await?;
      let popped = reply.into_array();
      if popped.is_empty() {
        break;
      }
      // zpopmin interleaves member,score; keep the members.
      let members = popped
        .iter()
        .step_by(if sorted { 2 } else { 1 })
        .filter_map(|r| r.as_text());

      let mut commands = Vec::new();
      for member in members {
        let key = match template {
          Some(t) => t.replace('*', member),
          None => member.to_string(),
        };
        commands.push(Command::new("del", key));
      }
      deleted += commands.len() as u64;
      run_pipeline(&self.store, &self.router, commands).await?;
    }
    Ok(deleted)
  }

  /// Which of `members` are present in the sorted set, via one ZMSCORE.
  pub async fn sorted_set_members_present(
    &self,
    key: &str,
    members: &[&str],
  ) -> Result<Vec<String>, EngineError> {
    if members.is_empty() {
      return Ok(Vec::new());
    }
    let key = self.router.route(key);
    let reply = self
      .store
      .dispatch(Command::new("zmscore", key).args(members.iter().copied()))
      .await?;
    let scores = reply.into_array();
    let mut out = Vec::new();
    for (i, member) in members.iter().enumerate() {
      if matches!(scores.get(i), Some(s) if !s.is_nil()) {
        out.push((*member).to_string());
      }
    }
    Ok(out)
  }
}

fn score_of(v: &Value) -> Option<f64> {
  match v {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}

fn member_of(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
