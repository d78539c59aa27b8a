//! Ledgers: a set of pages sharing one store and one resolver factory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::{LedgerConfig, PageSettings};
use crate::conflict::ConflictResolverFactory;
use crate::db::Database;
use crate::errors::{DatabaseError, IdentityError, LedgerError};
use crate::models::PageId;
use crate::page::{request, Page, PageCommand, PageLoop, PageSender};
use crate::storage::{MemoryStorage, PageStorage};

struct ResolverState {
    generation: u64,
    factory: Option<Arc<dyn ConflictResolverFactory>>,
}

struct LedgerInner {
    storage: Arc<dyn PageStorage>,
    settings: PageSettings,
    pages: Mutex<HashMap<PageId, PageSender>>,
    resolver: Mutex<ResolverState>,
}

impl Drop for LedgerInner {
    fn drop(&mut self) {
        let pages = self
            .pages
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for sender in pages.values() {
            let _ = sender.send(PageCommand::Shutdown);
        }
    }
}

/// A collection of pages. Cheap to clone; page loops stop when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn PageStorage>, settings: PageSettings) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                storage,
                settings,
                pages: Mutex::new(HashMap::new()),
                resolver: Mutex::new(ResolverState {
                    generation: 0,
                    factory: None,
                }),
            }),
        }
    }

    /// A ledger that keeps nothing on disk.
    pub fn in_memory(settings: PageSettings) -> Self {
        Self::new(Arc::new(MemoryStorage::new()), settings)
    }

    /// Open the ledger described by `config`: in memory, or the SQLite
    /// database under its data directory.
    pub fn open(config: &LedgerConfig) -> Result<Self, LedgerError> {
        if config.storage.in_memory {
            return Ok(Self::in_memory(config.page_settings()));
        }
        Self::open_at(config.database_path(), config.page_settings())
    }

    fn open_at(path: PathBuf, settings: PageSettings) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DatabaseError::from)?;
        }
        let db = Database::open(&path)?;
        info!(path = %path.display(), "opened ledger");
        Ok(Self::new(Arc::new(db), settings))
    }

    /// Create a page with a fresh random id.
    pub async fn new_page(&self) -> Result<Page, LedgerError> {
        self.get_page(PageId::random()).await
    }

    /// Open a connection to a page, creating the page if it does not exist.
    pub async fn get_page(&self, id: PageId) -> Result<Page, LedgerError> {
        let sender = self.page_sender(&id)?;
        Page::connect(id, sender).await
    }

    /// Delete a page and everything stored for it. Open connections and
    /// pending resolver calls fail with `NOT_FOUND` from then on.
    pub async fn delete_page(&self, id: &PageId) -> Result<(), LedgerError> {
        let running = self.pages().remove(id);
        match running {
            Some(sender) if !sender.is_closed() => {
                request(id, &sender, |reply| PageCommand::Destroy { reply }).await
            }
            _ => {
                if !self.inner.storage.list_pages()?.contains(id) {
                    return Err(LedgerError::page_gone(id));
                }
                self.inner.storage.delete_page(id)?;
                info!(page = %id, "page deleted");
                Ok(())
            }
        }
    }

    /// Every page with stored commits.
    pub fn list_pages(&self) -> Result<Vec<PageId>, LedgerError> {
        Ok(self.inner.storage.list_pages()?)
    }

    /// Install (or with `None`, remove) the conflict resolver factory for
    /// every page of this ledger. Sessions bound to the previous factory are
    /// cancelled and pending conflicts are handed to the new one.
    pub fn set_conflict_resolver_factory(&self, factory: Option<Arc<dyn ConflictResolverFactory>>) {
        let pages = self.pages();
        let mut resolver = self.resolver();
        resolver.generation += 1;
        resolver.factory = factory;
        for sender in pages.values() {
            let _ = sender.send(PageCommand::SetResolverFactory {
                generation: resolver.generation,
                factory: resolver.factory.clone(),
            });
        }
        info!(
            generation = resolver.generation,
            pages = pages.len(),
            installed = resolver.factory.is_some(),
            "conflict resolver factory set"
        );
    }

    pub fn resolver_generation(&self) -> u64 {
        self.resolver().generation
    }

    fn page_sender(&self, id: &PageId) -> Result<PageSender, LedgerError> {
        let mut pages = self.pages();
        if let Some(sender) = pages.get(id) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
            debug!(page = %id, "page loop had stopped, restarting");
        }
        let (generation, factory) = {
            let resolver = self.resolver();
            (resolver.generation, resolver.factory.clone())
        };
        let sender = PageLoop::spawn(
            id.clone(),
            self.inner.storage.clone(),
            self.inner.settings,
            generation,
            factory,
        )?;
        pages.insert(id.clone(), sender.clone());
        Ok(sender)
    }

    fn pages(&self) -> MutexGuard<'_, HashMap<PageId, PageSender>> {
        self.inner.pages.lock().unwrap_or_else(|poisoned| {
            warn!("page registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn resolver(&self) -> MutexGuard<'_, ResolverState> {
        self.inner.resolver.lock().unwrap_or_else(|poisoned| {
            warn!("resolver mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Hands out one [`Ledger`] per (user id, app id).
pub struct LedgerRepository {
    config: LedgerConfig,
    ledgers: Mutex<HashMap<(Vec<u8>, Vec<u8>), Ledger>>,
}

impl LedgerRepository {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    /// The ledger of `app_id` for `user_id`, opened on first use.
    pub fn get_ledger(&self, user_id: &[u8], app_id: &[u8]) -> Result<Ledger, LedgerError> {
        if user_id.is_empty() {
            return Err(IdentityError::EmptyUserId.into());
        }
        if app_id.is_empty() {
            return Err(IdentityError::EmptyAppId.into());
        }

        let mut ledgers = self.ledgers.lock().unwrap_or_else(|poisoned| {
            warn!("ledger repository mutex was poisoned, recovering");
            poisoned.into_inner()
        });
        let key = (user_id.to_vec(), app_id.to_vec());
        if let Some(ledger) = ledgers.get(&key) {
            return Ok(ledger.clone());
        }

        let settings = self.config.page_settings();
        let ledger = if self.config.storage.in_memory {
            Ledger::in_memory(settings)
        } else {
            let path = self
                .config
                .storage
                .data_dir
                .join(hex::encode(user_id))
                .join(hex::encode(app_id))
                .join("ledger.db");
            Ledger::open_at(path, settings)?
        };
        debug!(user = %hex::encode(user_id), app = %hex::encode(app_id), "ledger created");
        ledgers.insert(key, ledger.clone());
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.ledgers
            .lock()
            .map(|ledgers| ledgers.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PageError;
    use crate::models::Status;

    #[tokio::test]
    async fn test_get_page_twice_shares_state() {
        let ledger = Ledger::in_memory(PageSettings::default());
        let id = PageId::new(b"shared".to_vec());
        let a = ledger.get_page(id.clone()).await.unwrap();
        let b = ledger.get_page(id.clone()).await.unwrap();

        a.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        let snapshot = b.get_snapshot().await.unwrap();
        assert_eq!(snapshot.get(b"k"), Some(&b"v".to_vec()));
        assert_eq!(ledger.list_pages().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_delete_page_fails_open_connections() {
        let ledger = Ledger::in_memory(PageSettings::default());
        let page = ledger.new_page().await.unwrap();
        let id = page.id().clone();
        page.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        ledger.delete_page(&id).await.unwrap();
        let err = page.put(b"k".to_vec(), b"w".to_vec()).await.unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
        assert!(matches!(err, LedgerError::Page(PageError::NotFound(_))));
        assert!(ledger.list_pages().unwrap().is_empty());

        let err = ledger.delete_page(&id).await.unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn test_repository_rejects_empty_identity() {
        let mut config = LedgerConfig::default();
        config.storage.in_memory = true;
        let repo = LedgerRepository::new(config);

        let identities: [(&[u8], &[u8]); 2] = [(b"", b"app"), (b"user", b"")];
        for (user, app) in identities {
            match repo.get_ledger(user, app) {
                Err(err) => assert_eq!(err.status(), Status::AuthError),
                Ok(_) => panic!("empty identity accepted"),
            }
        }
        assert!(repo.is_empty());
    }

    #[test]
    fn test_repository_reuses_ledgers() {
        let mut config = LedgerConfig::default();
        config.storage.in_memory = true;
        let repo = LedgerRepository::new(config);

        repo.get_ledger(b"user", b"app").unwrap();
        repo.get_ledger(b"user", b"app").unwrap();
        repo.get_ledger(b"user", b"other").unwrap();
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_repository_on_disk_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LedgerConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let repo = LedgerRepository::new(config);

        repo.get_ledger(b"u", b"a").unwrap();
        assert!(dir.path().join("75").join("61").join("ledger.db").exists());
    }
}
