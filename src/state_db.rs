use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{error::Result, progress::BatchProgress};

/// Build progress keyed by corpus path.
const PROGRESS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("progress");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Durable engine state: build progress records and user settings.
pub struct StateDb {
    db: Database,
}

impl StateDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(PROGRESS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Progress --

    /// Persist a progress record. The write is a single committed
    /// transaction, so readers see either the old or the new record.
    pub fn save_progress(&self, progress: &BatchProgress) -> Result<()> {
        let bytes = progress.to_bytes()?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PROGRESS)?;
            table.insert(progress.corpus_path.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_progress(
        &self,
        corpus_path: &str,
    ) -> Result<Option<BatchProgress>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PROGRESS)?;
        Ok(table
            .get(corpus_path)?
            .and_then(|v| BatchProgress::from_bytes(v.value())))
    }

    /// All stored progress records. Unreadable records are skipped.
    pub fn list_progress(&self) -> Result<Vec<BatchProgress>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PROGRESS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            if let Some(progress) = BatchProgress::from_bytes(v.value()) {
                result.push(progress);
            }
        }
        Ok(result)
    }

    /// Remove every progress record in a single transaction.
    pub fn clear_progress(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PROGRESS)?;
            let keys: Vec<String> = table
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, redb::StorageError>>()?;
            for key in &keys {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CorpusFingerprint;

    fn test_db() -> (tempfile::TempDir, StateDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = StateDb::open(&tmp.path().join("state.redb")).unwrap();
        (tmp, db)
    }

    fn progress(path: &str) -> BatchProgress {
        BatchProgress::new(path, CorpusFingerprint { size: 1, mtime: 2 }, 10)
    }

    #[test]
    fn progress_crud() {
        let (_tmp, db) = test_db();
        assert_eq!(db.load_progress("a.jsonl").unwrap(), None);

        let mut p = progress("a.jsonl");
        db.save_progress(&p).unwrap();
        assert_eq!(db.load_progress("a.jsonl").unwrap(), Some(p.clone()));

        p.begin_counting().unwrap();
        p.set_total_lines(25).unwrap();
        db.save_progress(&p).unwrap();
        let loaded = db.load_progress("a.jsonl").unwrap().unwrap();
        assert_eq!(loaded.total_batches, Some(3));
    }

    #[test]
    fn list_and_clear_progress() {
        let (_tmp, db) = test_db();
        db.save_progress(&progress("a.jsonl")).unwrap();
        db.save_progress(&progress("b.jsonl")).unwrap();
        assert_eq!(db.list_progress().unwrap().len(), 2);

        db.clear_progress().unwrap();
        assert!(db.list_progress().unwrap().is_empty());
    }

    #[test]
    fn settings_crud() {
        let (_tmp, db) = test_db();

        assert_eq!(db.get_setting("batch_size").unwrap(), None);
        db.set_setting("batch_size", "5000").unwrap();
        assert_eq!(
            db.get_setting("batch_size").unwrap(),
            Some("5000".to_string())
        );
        assert_eq!(db.list_settings().unwrap().len(), 1);

        assert!(db.remove_setting("batch_size").unwrap());
        assert!(!db.remove_setting("batch_size").unwrap());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.redb");

        {
            let db = StateDb::open(&path).unwrap();
            db.save_progress(&progress("a.jsonl")).unwrap();
            db.set_setting("max_words", "300").unwrap();
        }

        {
            let db = StateDb::open(&path).unwrap();
            assert!(db.load_progress("a.jsonl").unwrap().is_some());
            assert_eq!(
                db.get_setting("max_words").unwrap(),
                Some("300".to_string())
            );
        }
    }
}
