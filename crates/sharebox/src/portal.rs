//! Composition root: builds every component from a [`Config`].

use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::{IndexError, LedgerError, Result};
use crate::identity::Submitter;
use crate::index::{Browser, IndexScheduler, IndexStats, Listing, SearchHit, SearchIndex};
use crate::ledger::{ActivityRecord, CompletedRecord, DeclinedRecord, LedgerPaths, LedgerStore};
use crate::sequence::{IdSource, Namespace, SequenceAllocator, Sequences, UserDatabases};
use crate::storage::FileStorage;
use crate::tree::{FileDownload, FolderArchive, ShareTree, TrashedItem};
use crate::validation::UploadPolicy;
use crate::workflow::{
    StoredUpload, SubmitReport, Submission, UploadRef, UploadSummary, UploadWorkflow,
};

pub struct Portal {
    config: Config,
    ledger: Arc<LedgerStore>,
    sequences: Arc<Sequences>,
    workflow: UploadWorkflow,
    browser: Browser,
    tree: ShareTree,
    index: Arc<SearchIndex>,
    scheduler: Mutex<Option<IndexScheduler>>,
    rebuilding: Arc<AtomicBool>,
}

/// Marks a detached rebuild as running until dropped.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Portal {
    /// Wires the portal and creates the staging, destination and trash
    /// directories.
    pub fn open(config: Config) -> Result<Self> {
        let storage = FileStorage::new(config.staging_root(), config.destination_root());
        storage.prepare()?;

        let ledger = Arc::new(LedgerStore::new(LedgerPaths::from_config(&config)));
        let sequences = Arc::new(Sequences::new(
            SequenceAllocator::new(
                config.resolve(&config.ledgers.upload_sequence),
                Arc::clone(&ledger) as Arc<dyn IdSource>,
            ),
            SequenceAllocator::new(
                config.resolve(&config.ledgers.user_sequence),
                Arc::new(UserDatabases::from_config(&config)),
            ),
        ));
        let policy = UploadPolicy::new(&config.allowed_extensions);

        let tree = ShareTree::new(storage.clone(), config.trash_root(), Arc::clone(&ledger));
        tree.prepare()?;
        let workflow =
            UploadWorkflow::new(Arc::clone(&ledger), Arc::clone(&sequences), storage, policy);
        let browser = Browser::new(config.destination_root(), Arc::clone(&ledger));
        let index = Arc::new(SearchIndex::new(config.shard_root(), Arc::clone(&ledger)));

        log::info!(
            "Portal opened (data directory {})",
            config.data_dir().display()
        );

        Ok(Self {
            config,
            ledger,
            sequences,
            workflow,
            browser,
            tree,
            index,
            scheduler: Mutex::new(None),
            rebuilding: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn workflow(&self) -> &UploadWorkflow {
        &self.workflow
    }

    pub fn submit_batch<R: Read>(
        &self,
        submitter: &Submitter,
        target_subpath: &str,
        files: Vec<Submission<R>>,
    ) -> Result<SubmitReport> {
        Ok(self.workflow.submit_batch(submitter, target_subpath, files)?)
    }

    pub fn submit<R: Read>(
        &self,
        submitter: &Submitter,
        target_subpath: &str,
        submission: Submission<R>,
    ) -> Result<StoredUpload> {
        Ok(self.workflow.submit(submitter, target_subpath, submission)?)
    }

    pub fn approve(&self, target: &UploadRef, destination: Option<&str>) -> Result<CompletedRecord> {
        Ok(self.workflow.approve(target, destination)?)
    }

    pub fn decline(&self, target: &UploadRef) -> Result<DeclinedRecord> {
        Ok(self.workflow.decline(target)?)
    }

    pub fn relocate(&self, upload_id: u64, new_path: &str) -> Result<CompletedRecord> {
        Ok(self.workflow.relocate(upload_id, new_path)?)
    }

    pub fn my_uploads(&self, submitter: &Submitter) -> Result<Vec<UploadSummary>> {
        Ok(self.workflow.my_uploads(submitter)?)
    }

    pub fn pending_queue(&self) -> Result<Vec<UploadSummary>> {
        Ok(self.workflow.pending_queue()?)
    }

    pub fn completed(&self) -> Result<Vec<CompletedRecord>> {
        Ok(self.ledger.scan::<CompletedRecord>()?)
    }

    pub fn declined(&self) -> Result<Vec<DeclinedRecord>> {
        Ok(self.ledger.scan::<DeclinedRecord>()?)
    }

    /// Allocates an id for a newly registered user.
    pub fn next_user_id(&self) -> Result<u64> {
        Ok(self.sequences.next_id(Namespace::Users)?)
    }

    pub fn browse(&self, subpath: &str) -> Result<Listing> {
        Ok(self.browser.browse(subpath)?)
    }

    pub fn create_folder(&self, actor: &Submitter, parent: &str, name: &str) -> Result<String> {
        Ok(self.tree.create_folder(actor, parent, name)?)
    }

    pub fn delete_to_trash(&self, actor: &Submitter, path: &str) -> Result<TrashedItem> {
        Ok(self.tree.delete_to_trash(actor, path)?)
    }

    pub fn open_file(&self, actor: &Submitter, path: &str) -> Result<FileDownload> {
        Ok(self.tree.open_file(actor, path)?)
    }

    pub fn export_folder<W: Write + Seek>(
        &self,
        actor: &Submitter,
        folder: &str,
        writer: W,
    ) -> Result<FolderArchive> {
        Ok(self.tree.export_folder(actor, folder, writer)?)
    }

    pub fn activity(&self) -> Result<Vec<ActivityRecord>> {
        Ok(self.tree.activity()?)
    }

    /// Searches the shards. When they are missing a rebuild is started in
    /// the background and `IndexError::NotReady` is returned.
    pub fn search(&self, query: &str, folder: Option<&str>) -> Result<Vec<SearchHit>> {
        match self.index.search(query, folder) {
            Err(IndexError::NotReady) => {
                self.schedule_rebuild();
                Err(IndexError::NotReady.into())
            }
            other => Ok(other?),
        }
    }

    /// Searches, rebuilding the shards on the calling thread first when they
    /// are missing. For short-lived hosts that would lose a background
    /// rebuild on exit.
    pub fn search_or_rebuild(&self, query: &str, folder: Option<&str>) -> Result<Vec<SearchHit>> {
        match self.index.search(query, folder) {
            Err(IndexError::NotReady) => {
                let stats = self.index.rebuild()?;
                log::info!("Built search index ({} rows) before searching", stats.rows);
                Ok(self.index.search(query, folder)?)
            }
            other => Ok(other?),
        }
    }

    pub fn rebuild_search_index(&self) -> Result<IndexStats> {
        Ok(self.index.rebuild()?)
    }

    /// Starts the background rebuild watcher; a no-op if already running.
    pub fn start_index_scheduler(&self) -> Result<()> {
        let mut scheduler = self
            .scheduler
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?;
        if scheduler.is_none() {
            *scheduler = Some(IndexScheduler::start(
                Arc::clone(&self.index),
                Arc::clone(&self.ledger),
                self.config.index.quiet_period(),
                self.config.index.poll_interval(),
            ));
        }
        Ok(())
    }

    pub fn stop_index_scheduler(&self) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            if let Some(mut scheduler) = scheduler.take() {
                scheduler.shutdown();
            }
        }
    }

    fn schedule_rebuild(&self) {
        if let Ok(scheduler) = self.scheduler.lock() {
            if let Some(scheduler) = scheduler.as_ref() {
                scheduler.request_rebuild();
                return;
            }
        }

        let Some(in_flight) = InFlight::claim(&self.rebuilding) else {
            log::debug!("Index rebuild already running");
            return;
        };
        let index = Arc::clone(&self.index);
        std::thread::spawn(move || {
            let _in_flight = in_flight;
            if let Err(e) = index.rebuild() {
                log::error!("Background index rebuild failed: {}", e);
            }
        });
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.stop_index_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_admits_one_rebuild() {
        let flag = Arc::new(AtomicBool::new(false));

        let first = InFlight::claim(&flag);
        assert!(first.is_some());
        assert!(InFlight::claim(&flag).is_none());

        drop(first);
        assert!(InFlight::claim(&flag).is_some());
    }
}
