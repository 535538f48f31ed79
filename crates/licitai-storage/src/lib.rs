//! Durable tender record store with optimistic concurrency, plus HTTP fetch utilities.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use fs4::fs_std::FileExt;
use licitai_core::{Flag, FlagUpdate, Tender, TenderState, TransitionError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod http;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "licitai-storage";

/// Conflict retries for flag edits before the caller sees the conflict.
pub const FLAG_UPDATE_CONFLICT_RETRIES: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on tender {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },
    #[error("tender {0} already exists")]
    Duplicate(String),
    #[error("tender {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// In-place edit applied by [`RecordStore::upsert_if`]. An error leaves the stored record
/// untouched.
pub type Mutator<'a> = &'a (dyn Fn(&mut Tender) -> Result<(), TransitionError> + Send + Sync);

/// Keyed tender storage. Every mutation is a compare-and-swap on `version`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Tender>, StoreError>;

    /// Applies `mutator` only when the stored version equals `expected_version`.
    /// The store bumps `version` and stamps `updated_at`; `id` and `created_at` are fixed.
    async fn upsert_if(
        &self,
        id: &str,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<Tender, StoreError>;

    /// Inserts a new record at version 1.
    async fn create(&self, tender: Tender) -> Result<Tender, StoreError>;

    async fn query_by_state(&self, state: TenderState) -> Result<Vec<Tender>, StoreError>;

    async fn query_by_flag(&self, flag: Flag) -> Result<Vec<Tender>, StoreError>;

    async fn all(&self) -> Result<Vec<Tender>, StoreError>;
}

/// Flag-only edit from the presentation layer. Re-reads on conflict; pipeline fields are
/// never touched.
pub async fn update_flags(
    store: &dyn RecordStore,
    id: &str,
    update: FlagUpdate,
) -> Result<Tender, StoreError> {
    let mutate = move |tender: &mut Tender| -> Result<(), TransitionError> {
        update.apply_to(&mut tender.flags);
        Ok(())
    };
    let mut conflicts = 0usize;
    loop {
        let current = store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        match store.upsert_if(id, current.version, &mutate).await {
            Ok(updated) => return Ok(updated),
            Err(err) if err.is_conflict() && conflicts < FLAG_UPDATE_CONFLICT_RETRIES => {
                conflicts += 1;
                tracing::debug!(
                    tender_id = id,
                    conflicts,
                    "flag update lost a version race, retrying"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

/// Primary rows plus the secondary indexes the presentation layer queries.
#[derive(Debug, Default)]
struct TenderTable {
    rows: BTreeMap<String, Tender>,
    by_state: BTreeMap<TenderState, BTreeSet<String>>,
    by_flag: BTreeMap<Flag, BTreeSet<String>>,
}

impl TenderTable {
    fn prepare_create(&self, mut tender: Tender) -> Result<Tender, StoreError> {
        if self.rows.contains_key(&tender.id) {
            return Err(StoreError::Duplicate(tender.id));
        }
        tender.version = 1;
        tender.updated_at = Utc::now();
        Ok(tender)
    }

    fn prepare_update(
        &self,
        id: &str,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<Tender, StoreError> {
        let current = self
            .rows
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }
        let mut next = current.clone();
        mutator(&mut next)?;
        next.id = current.id.clone();
        next.created_at = current.created_at;
        next.version = current.version + 1;
        next.updated_at = Utc::now();
        Ok(next)
    }

    fn commit(&mut self, tender: Tender) {
        self.unindex(&tender.id);
        self.by_state
            .entry(tender.state)
            .or_default()
            .insert(tender.id.clone());
        for flag in Flag::ALL {
            if tender.flags.is_set(flag) {
                self.by_flag.entry(flag).or_default().insert(tender.id.clone());
            }
        }
        self.rows.insert(tender.id.clone(), tender);
    }

    fn remove(&mut self, id: &str) {
        self.unindex(id);
        self.rows.remove(id);
    }

    fn unindex(&mut self, id: &str) {
        if let Some(previous) = self.rows.get(id) {
            if let Some(ids) = self.by_state.get_mut(&previous.state) {
                ids.remove(id);
            }
            for flag in Flag::ALL {
                if let Some(ids) = self.by_flag.get_mut(&flag) {
                    ids.remove(id);
                }
            }
        }
    }

    fn collect(&self, ids: Option<&BTreeSet<String>>) -> Vec<Tender> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }

    fn by_state(&self, state: TenderState) -> Vec<Tender> {
        self.collect(self.by_state.get(&state))
    }

    fn by_flag(&self, flag: Flag) -> Vec<Tender> {
        self.collect(self.by_flag.get(&flag))
    }
}

/// Process-local store; used by tests and by dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    table: Mutex<TenderTable>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Tender>, StoreError> {
        Ok(self.table.lock().await.rows.get(id).cloned())
    }

    async fn upsert_if(
        &self,
        id: &str,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<Tender, StoreError> {
        let mut table = self.table.lock().await;
        let next = table.prepare_update(id, expected_version, mutator)?;
        table.commit(next.clone());
        Ok(next)
    }

    async fn create(&self, tender: Tender) -> Result<Tender, StoreError> {
        let mut table = self.table.lock().await;
        let created = table.prepare_create(tender)?;
        table.commit(created.clone());
        Ok(created)
    }

    async fn query_by_state(&self, state: TenderState) -> Result<Vec<Tender>, StoreError> {
        Ok(self.table.lock().await.by_state(state))
    }

    async fn query_by_flag(&self, flag: Flag) -> Result<Vec<Tender>, StoreError> {
        Ok(self.table.lock().await.by_flag(flag))
    }

    async fn all(&self) -> Result<Vec<Tender>, StoreError> {
        Ok(self.table.lock().await.rows.values().cloned().collect())
    }
}

/// Durable store: one JSON document per tender under `<root>/tenders`, replaced through
/// a temp file and an atomic rename. Several processes may share one directory: every
/// write holds an exclusive lock on `<root>/tenders/.lock` and compares against the
/// document on disk, and reads refresh the in-memory rows and indexes from disk.
#[derive(Debug)]
pub struct FileRecordStore {
    root: PathBuf,
    table: Mutex<TenderTable>,
}

/// Exclusive advisory lock over the tender directory; released on drop.
struct DirectoryLock {
    file: std::fs::File,
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileRecordStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let dir = root.join("tenders");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating tender directory {}", dir.display()))?;

        let table = load_table(&dir).await?;
        tracing::info!(root = %root.display(), tenders = table.rows.len(), "opened tender store");

        Ok(Self {
            root,
            table: Mutex::new(table),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, id: &str) -> PathBuf {
        self.tenders_dir().join(document_file_name(id))
    }

    fn tenders_dir(&self) -> PathBuf {
        self.root.join("tenders")
    }

    async fn lock_directory(&self) -> anyhow::Result<DirectoryLock> {
        let path = self.tenders_dir().join(".lock");
        tokio::task::spawn_blocking(move || -> anyhow::Result<DirectoryLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("opening store lock {}", path.display()))?;
            FileExt::lock_exclusive(&file)
                .with_context(|| format!("locking {}", path.display()))?;
            Ok(DirectoryLock { file })
        })
        .await
        .context("store lock task panicked")?
    }

    async fn read_document(&self, id: &str) -> anyhow::Result<Option<Tender>> {
        let path = self.document_path(id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Replaces the cached row for `id` with whatever is on disk now.
    async fn refresh_row(&self, table: &mut TenderTable, id: &str) -> anyhow::Result<()> {
        match self.read_document(id).await? {
            Some(tender) => table.commit(tender),
            None => table.remove(id),
        }
        Ok(())
    }

    async fn reload(&self) -> Result<tokio::sync::MutexGuard<'_, TenderTable>, StoreError> {
        let mut table = self.table.lock().await;
        *table = load_table(&self.tenders_dir()).await?;
        Ok(table)
    }

    async fn write_document(&self, tender: &Tender) -> anyhow::Result<()> {
        let path = self.document_path(&tender.id);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        let bytes = serde_json::to_vec_pretty(tender)
            .with_context(|| format!("serializing tender {}", tender.id))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp document {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp document {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

async fn load_table(dir: &Path) -> anyhow::Result<TenderTable> {
    let mut table = TenderTable::default();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let is_document = path.extension().is_some_and(|ext| ext == "json")
            && !entry.file_name().to_string_lossy().starts_with('.');
        if !is_document {
            continue;
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let tender: Tender = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        table.commit(tender);
    }
    Ok(table)
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Tender>, StoreError> {
        let mut table = self.table.lock().await;
        self.refresh_row(&mut table, id).await?;
        Ok(table.rows.get(id).cloned())
    }

    async fn upsert_if(
        &self,
        id: &str,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<Tender, StoreError> {
        let mut table = self.table.lock().await;
        let _lock = self.lock_directory().await?;
        self.refresh_row(&mut table, id).await?;
        let next = table.prepare_update(id, expected_version, mutator)?;
        self.write_document(&next).await?;
        table.commit(next.clone());
        Ok(next)
    }

    async fn create(&self, tender: Tender) -> Result<Tender, StoreError> {
        let mut table = self.table.lock().await;
        let _lock = self.lock_directory().await?;
        self.refresh_row(&mut table, &tender.id).await?;
        let created = table.prepare_create(tender)?;
        self.write_document(&created).await?;
        table.commit(created.clone());
        Ok(created)
    }

    async fn query_by_state(&self, state: TenderState) -> Result<Vec<Tender>, StoreError> {
        Ok(self.reload().await?.by_state(state))
    }

    async fn query_by_flag(&self, flag: Flag) -> Result<Vec<Tender>, StoreError> {
        Ok(self.reload().await?.by_flag(flag))
    }

    async fn all(&self) -> Result<Vec<Tender>, StoreError> {
        Ok(self.reload().await?.rows.values().cloned().collect())
    }
}

/// Tender ids are usually `[0-9A-Za-z-]`; anything else is hex-encoded so a document name
/// can never escape the store directory. Plain ids never start with `x-`, which is reserved
/// for the encoded form.
fn document_file_name(id: &str) -> String {
    let plain = !id.is_empty()
        && !id.starts_with('.')
        && !id.starts_with("x-")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain {
        format!("{id}.json")
    } else {
        format!("x-{}.json", hex::encode(id.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use licitai_core::SummaryRecord;
    use tempfile::tempdir;

    fn tender(id: &str) -> Tender {
        Tender::discovered(
            &SummaryRecord {
                id: id.to_string(),
                title: "Construcción de puente".into(),
                organism: "MOP".into(),
                publish_date: NaiveDate::from_ymd_opt(2026, 3, 2),
                close_date: None,
                raw_summary: "Construcción de puente".into(),
                status_code: Some(5),
            },
            Utc::now(),
        )
    }

    fn start_extraction(t: &mut Tender) -> Result<(), TransitionError> {
        t.transition(TenderState::Extracting)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = MemoryRecordStore::new();
        let created = store.create(tender("T-1")).await.unwrap();
        assert_eq!(created.version, 1);

        let err = store.create(tender("T-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "T-1"));
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_cas_on_same_version_has_one_winner() {
        let store = Arc::new(MemoryRecordStore::new());
        store.create(tender("T-1")).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert_if("T-1", 1, &start_extraction).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                let archive = |t: &mut Tender| -> Result<(), TransitionError> {
                    t.flags.archived = true;
                    Ok(())
                };
                store.upsert_if("T-1", 1, &archive).await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::Conflict { expected: 1, found: 2, .. })))
            .count();
        assert_eq!((wins, conflicts), (1, 1));

        let stored = store.get("T-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.state == TenderState::Extracting || stored.flags.archived);
        assert!(!(stored.state == TenderState::Extracting && stored.flags.archived));
    }

    #[tokio::test]
    async fn failed_mutator_leaves_record_untouched() {
        let store = MemoryRecordStore::new();
        store.create(tender("T-1")).await.unwrap();
        let jump = |t: &mut Tender| t.transition(TenderState::Scored);

        let err = store.upsert_if("T-1", 1, &jump).await.unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        let stored = store.get("T-1").await.unwrap().unwrap();
        assert_eq!((stored.version, stored.state), (1, TenderState::Discovered));
    }

    #[tokio::test]
    async fn indexes_follow_state_and_flag_changes() {
        let store = MemoryRecordStore::new();
        store.create(tender("T-1")).await.unwrap();
        store.create(tender("T-2")).await.unwrap();
        store.upsert_if("T-1", 1, &start_extraction).await.unwrap();
        update_flags(
            &store,
            "T-2",
            FlagUpdate {
                favorited: Some(true),
                archived: None,
            },
        )
        .await
        .unwrap();

        let discovered = store.query_by_state(TenderState::Discovered).await.unwrap();
        assert_eq!(discovered.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["T-2"]);
        let extracting = store.query_by_state(TenderState::Extracting).await.unwrap();
        assert_eq!(extracting.len(), 1);
        let favorites = store.query_by_flag(Flag::Favorited).await.unwrap();
        assert_eq!(favorites[0].id, "T-2");
        assert!(store.query_by_flag(Flag::Archived).await.unwrap().is_empty());

        update_flags(
            &store,
            "T-2",
            FlagUpdate {
                favorited: Some(false),
                archived: Some(true),
            },
        )
        .await
        .unwrap();
        assert!(store.query_by_flag(Flag::Favorited).await.unwrap().is_empty());
        assert_eq!(store.query_by_flag(Flag::Archived).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flag_update_preserves_pipeline_fields() {
        let store = MemoryRecordStore::new();
        store.create(tender("T-1")).await.unwrap();
        store.upsert_if("T-1", 1, &start_extraction).await.unwrap();

        let updated = update_flags(
            &store,
            "T-1",
            FlagUpdate {
                favorited: None,
                archived: Some(true),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.state, TenderState::Extracting);
        assert_eq!(updated.version, 3);
        assert!(updated.flags.archived);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = FileRecordStore::open(dir.path()).await.expect("open");
            store.create(tender("1234-56-LP26")).await.unwrap();
            store.create(tender("odd/id")).await.unwrap();
            store.upsert_if("1234-56-LP26", 1, &start_extraction).await.unwrap();
            assert!(store.document_path("1234-56-LP26").exists());
            assert!(store
                .document_path("odd/id")
                .starts_with(dir.path().join("tenders")));
        }

        let reopened = FileRecordStore::open(dir.path()).await.expect("reopen");
        let stored = reopened.get("1234-56-LP26").await.unwrap().unwrap();
        assert_eq!((stored.version, stored.state), (2, TenderState::Extracting));
        assert_eq!(reopened.all().await.unwrap().len(), 2);
        assert_eq!(
            reopened
                .query_by_state(TenderState::Discovered)
                .await
                .unwrap()
                .len(),
            1
        );

        let err = reopened
            .upsert_if("1234-56-LP26", 1, &start_extraction)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn stores_sharing_a_directory_see_each_others_writes() {
        let dir = tempdir().expect("tempdir");
        let server = FileRecordStore::open(dir.path()).await.expect("open server");
        server.create(tender("T-1")).await.unwrap();
        let cli = FileRecordStore::open(dir.path()).await.expect("open cli");

        let archived = update_flags(
            &cli,
            "T-1",
            FlagUpdate {
                favorited: None,
                archived: Some(true),
            },
        )
        .await
        .unwrap();
        assert_eq!(archived.version, 2);

        let err = server
            .upsert_if("T-1", 1, &start_extraction)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));

        let current = server.get("T-1").await.unwrap().unwrap();
        assert!(current.flags.archived);
        let claimed = server
            .upsert_if("T-1", current.version, &start_extraction)
            .await
            .unwrap();
        assert_eq!((claimed.version, claimed.state), (3, TenderState::Extracting));
        assert!(claimed.flags.archived);

        assert!(matches!(
            cli.create(tender("T-1")).await.unwrap_err(),
            StoreError::Duplicate(_)
        ));
        server.create(tender("T-2")).await.unwrap();
        assert_eq!(cli.all().await.unwrap().len(), 2);
        assert_eq!(cli.query_by_flag(Flag::Archived).await.unwrap().len(), 1);
        let reopened = FileRecordStore::open(dir.path()).await.expect("reopen");
        let stored = reopened.get("T-1").await.unwrap().unwrap();
        assert_eq!((stored.version, stored.state), (3, TenderState::Extracting));
        assert!(stored.flags.archived);
    }

    #[test]
    fn document_names_stay_inside_store() {
        assert_eq!(document_file_name("1234-56-LP26"), "1234-56-LP26.json");
        assert_eq!(document_file_name("../x"), "x-2e2e2f78.json");
        assert_eq!(document_file_name(""), "x-.json");
    }

    #[test]
    fn encoded_and_plain_ids_never_share_a_document() {
        assert_ne!(document_file_name("x-2e2e2f78"), document_file_name("../x"));
        assert_eq!(
            document_file_name("x-2e2e2f78"),
            format!("x-{}.json", hex::encode("x-2e2e2f78"))
        );
        assert_eq!(document_file_name("2e2e2f78-x"), "2e2e2f78-x.json");
    }
}
