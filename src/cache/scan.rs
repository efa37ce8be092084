use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::command::{ScanTarget, Store};
use super::keys::KeyRouter;
use crate::error::EngineError;

pub type ConsumerFuture = BoxFuture<'static, Result<(), EngineError>>;

/// How scanned items are consumed.
pub enum Consumer<'a, T> {
  /// Collect everything into the returned outcome.
  Collect,
  /// Invoke once per page with the whole page.
  Pages(Box<dyn FnMut(Vec<T>) -> ConsumerFuture + Send + 'a>),
  /// Invoke once per item.
  Each(Box<dyn FnMut(T) -> ConsumerFuture + Send + 'a>),
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
  /// Starting cursor; 0 starts a fresh iteration.
  pub cursor: u64,
  /// Page-size hint passed to the store.
  pub count: Option<usize>,
  /// Stop after one page regardless of the returned cursor.
  pub single_pass: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome<T> {
  /// Cursor after the last issued page; 0 means the iteration completed.
  pub cursor: u64,
  /// Items gathered under `Consumer::Collect`, empty otherwise.
  pub items: Vec<T>,
}

/// Incremental cursor iteration over keys or hash fields.
pub struct Scanner {
  store: Arc<dyn Store>,
  router: KeyRouter,
}

impl Scanner {
  pub fn new(store: Arc<dyn Store>, router: KeyRouter) -> Self {
    Self { store, router }
  }

  /// Scan the key space for keys matching `pattern`.
  pub async fn scan_keys(
    &self,
    pattern: &str,
    opts: ScanOptions,
    mut consumer: Consumer<'_, String>,
  ) -> Result<ScanOutcome<String>, EngineError> {
    let pattern = self.router.route(pattern);
    let target = ScanTarget::Keys;
    let mut cursor = opts.cursor;
    let mut items = Vec::new();

    loop {
      let (next, page) = self
        .store
        .scan_page(&target, cursor, Some(&pattern), opts.count)
        .await?;
      cursor = next;
      if !page.is_empty() {
        feed(&mut consumer, page, &mut items).await?;
      }
      // An empty page with a live cursor keeps iterating.
      if cursor == 0 || opts.single_pass {
        break;
      }
    }
    Ok(ScanOutcome { cursor, items })
  }

  /// Scan one hash's fields, yielding field/value pairs.
  pub async fn scan_hash(
    &self,
    key: &str,
    pattern: Option<&str>,
    opts: ScanOptions,
    mut consumer: Consumer<'_, (String, String)>,
  ) -> Result<ScanOutcome<(String, String)>, EngineError> {
    let target = ScanTarget::Hash(self.router.route(key));
    let mut cursor = opts.cursor;
    let mut items = Vec::new();

    loop {
      let (next, flat) = self
        .store
        .scan_page(&target, cursor, pattern, opts.count)
        .await?;
      cursor = next;
      if !flat.is_empty() {
        let mut page = Vec::with_capacity(flat.len() / 2);
        let mut it = flat.into_iter();
        while let (Some(f), Some(v)) = (it.next(), it.next()) {
          page.push((f, v));
        }
        feed(&mut consumer, page, &mut items).await?;
      }
      if cursor == 0 || opts.single_pass {
        break;
      }
    }
    Ok(ScanOutcome { cursor, items })
  }
}

async fn feed<T>(
  consumer: &mut Consumer<'_, T>,
  page: Vec<T>,
  collected: &mut Vec<T>,
) -> Result<(), EngineError> {
  match consumer {
    Consumer::Collect => {
      collected.extend(page);
      Ok(())
    }
    Consumer::Pages(cb) => cb(page).await,
    Consumer::Each(cb) => {
      for item in page {
        cb(item).await?;
      }
      Ok(())
    }
  }
}
