use std::sync::Arc;

use super::command::{Arg, BatchMode, Command, Reply, Store};
use super::keys::KeyRouter;
use crate::error::EngineError;

/// Route a command's key, plus any argument that is itself a hash-tagged
/// key for the multi-key commands that take one (DEL, the z*store family).
pub(crate) fn route_command(router: &KeyRouter, mut cmd: Command) -> Command {
  let method = cmd.method.to_ascii_lowercase();
  let args_are_keys =
    method == "del" || (method.starts_with('z') && method.contains("store"));
  if args_are_keys && cmd.key.starts_with('{') {
    for a in &mut cmd.args {
      if let Arg::Str(s) = a {
        if s.starts_with('{') {
          *s = router.route(s);
        }
      }
    }
  }
  cmd.key = router.route(&cmd.key);
  cmd
}

/// Accumulates ordered store commands and executes them as one pipeline
/// round trip or one atomic transaction group.
pub struct Batch {
  router: KeyRouter,
  mode: BatchMode,
  commands: Vec<Command>,
}

impl Batch {
  pub fn new(router: KeyRouter, mode: BatchMode) -> Self {
    Self {
      router,
      mode,
      commands: Vec::new(),
    }
  }

  pub fn pipeline(router: KeyRouter) -> Self {
    Self::new(router, BatchMode::Pipeline)
  }

  pub fn transaction(router: KeyRouter) -> Self {
    Self::new(router, BatchMode::Transaction)
  }

  pub fn push(&mut self, cmd: Command) -> &mut Self {
    let routed = route_command(&self.router, cmd);
    self.commands.push(routed);
    self
  }

  pub fn len(&self) -> usize {
    self.commands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.commands.is_empty()
  }

  /// Execute the batch; per-command results come back in submission order.
  /// A single accumulated command skips the grouped round trip entirely.
  pub async fn run(self, store: &Arc<dyn Store>) -> Result<Vec<Reply>, EngineError> {
    match self.commands.len() {
      0 => Ok(Vec::new()),
      1 => {
        let reply = store
          .dispatch(self.commands.into_iter().next().unwrap())
          .await?;
        Ok(vec![reply])
      }
      _ => store.dispatch_batch(self.commands, self.mode).await,
    }
  }
}

/// Build and run a pipeline from pre-assembled commands in one call.
pub async fn run_pipeline(
  store: &Arc<dyn Store>,
  router: &KeyRouter,
  cmds: Vec<Command>,
) -> Result<Vec<Reply>, EngineError> {
  let mut batch = Batch::pipeline(router.clone());
  for cmd in cmds {
    batch.push(cmd);
  }
  batch.run(store).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::memory::MemoryStore;

  fn store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
  }

  #[tokio::test]
  async fn results_in_submission_order() {
    let store = store();
    let mut batch = Batch::pipeline(KeyRouter::new("t:"));
    batch.push(Command::new("set", "a").arg("1"));
    batch.push(Command::new("set", "b").arg("2"));
    batch.push(Command::new("get", "a"));
    let replies = batch.run(&store).await.unwrap();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[2].as_text(), Some("1"));
    // Keys were routed before submission.
    let direct = store.dispatch(Command::new("get", "t:a")).await.unwrap();
    assert_eq!(direct.as_text(), Some("1"));
  }

  #[tokio::test]
  async fn single_command_short_circuits() {
    let store = store();
    let mut batch = Batch::pipeline(KeyRouter::default());
    batch.push(Command::new("set", "only").arg("x"));
    let replies = batch.run(&store).await.unwrap();
    assert_eq!(replies, vec![Reply::Ok]);
  }

  #[tokio::test]
  async fn transaction_failure_applies_nothing() {
    let store = store();
    let mut batch = Batch::transaction(KeyRouter::default());
    batch.push(Command::new("set", "a").arg("1"));
    batch.push(Command::new("nonsense", "b"));
    assert!(batch.run(&store).await.is_err());
    assert!(store
      .dispatch(Command::new("get", "a"))
      .await
      .unwrap()
      .is_nil());
  }

  #[test]
  fn del_routes_hash_tagged_argument_keys() {
    let router = KeyRouter::new("t:");
    let cmd = route_command(
      &router,
      Command::new("del", "{g}one").arg("{g}two").arg("plain"),
    );
    assert_eq!(cmd.key, "{t:g}one");
    assert_eq!(cmd.args[0], Arg::Str("{t:g}two".into()));
    assert_eq!(cmd.args[1], Arg::Str("plain".into()));
  }
}
