//! Checkpoint and recovery across store restarts

use hybridkv_common::{CheckpointKind, Error, Result, StoreConfig};
use hybridkv_storage::{
    Functions, MemoryDevice, Phase, Session, Status, StorageDevice, Store, sum_functions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

fn file_config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig::with_data_dir(dir);
    config.index.slot_count = 1 << 10;
    config.log.page_bits = 12;
    config.log.memory_bits = 16;
    config
}

fn read_value<K, V, F>(session: &mut Session<K, V, F>, key: &K) -> Option<V>
where
    K: Serialize + DeserializeOwned + Clone + Send + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + 'static,
    F: Functions<V>,
{
    match session.read(key).unwrap() {
        Status::Found(value) => Some(value),
        Status::NotFound => None,
        Status::Pending(serial) => {
            let done = session.complete_pending(true).unwrap();
            let op = done.into_iter().find(|op| op.serial == serial).unwrap();
            op.result.unwrap().into_value()
        }
    }
}

#[test]
fn test_snapshot_recovery_after_restart() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());

    let checkpoint = {
        let store: Store<u64, u64> = Store::open(config.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        session.upsert(&1, &1).unwrap();
        let checkpoint = store.checkpoint(CheckpointKind::Snapshot).unwrap();
        session.upsert(&1, &2).unwrap();
        assert_eq!(session.read(&1).unwrap(), Status::Found(2));
        checkpoint
    };
    assert_eq!(checkpoint.kind, CheckpointKind::Snapshot);
    assert!(checkpoint.snapshot_start.is_some());

    let store: Store<u64, u64> = Store::open(config).unwrap();
    assert_eq!(store.recovered_version(), None);
    let version = store.recover(Some(checkpoint.token)).unwrap();
    assert_eq!(version, checkpoint.version);
    assert_eq!(store.recovered_version(), Some(checkpoint.version));
    assert_eq!(store.system_state().version, checkpoint.version + 1);

    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    assert_eq!(read_value(&mut session, &1), Some(1));

    // The recovered store keeps working
    session.rmw(&1, 10).unwrap();
    assert_eq!(read_value(&mut session, &1), Some(11));
}

#[test]
fn test_fold_over_recovery_on_open() {
    let dir = tempdir().unwrap();
    let mut config = file_config(dir.path());
    config.log.memory_bits = 14;

    let (checkpoint, session_id) = {
        let store: Store<u64, u64> = Store::open(config.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        // Spill across several pages so part of the log is on disk
        for key in 0..400u64 {
            session.upsert(&key, &key).unwrap();
        }
        for key in 0..50u64 {
            session.rmw(&key, 1000).unwrap();
            session.complete_pending(true).unwrap();
        }
        let checkpoint = store.checkpoint(CheckpointKind::FoldOver).unwrap();

        for key in 0..400u64 {
            session.upsert(&key, &0).unwrap();
        }
        session.upsert(&10_000, &1).unwrap();
        (checkpoint, session.id())
    };
    assert_eq!(checkpoint.snapshot_start, None);
    assert_eq!(checkpoint.sessions[&session_id].until_serial, 450);

    config.checkpoint.try_recover_latest = true;
    let store: Store<u64, u64> = Store::open(config).unwrap();
    assert_eq!(store.recovered_version(), Some(checkpoint.version));

    let (mut session, serial) = store
        .continue_session(session_id, sum_functions::<u64>())
        .unwrap();
    assert_eq!(serial, 450);
    assert_eq!(session.serial(), 450);

    for key in 0..400u64 {
        let expected = if key < 50 { key + 1000 } else { key };
        assert_eq!(read_value(&mut session, &key), Some(expected), "key {key}");
    }
    assert_eq!(read_value(&mut session, &10_000), None);
    assert!(store.continue_session(session_id, sum_functions::<u64>()).is_err());
}

#[test]
fn test_recover_specific_older_checkpoint() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());

    let (first, second) = {
        let store: Store<String, u64> = Store::open(config.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        let key = "counter".to_string();
        session.rmw(&key, 1).unwrap();
        let first = store.checkpoint(CheckpointKind::FoldOver).unwrap();
        session.rmw(&key, 1).unwrap();
        let second = store.checkpoint(CheckpointKind::Snapshot).unwrap();
        (first, second)
    };
    assert_eq!(second.version, first.version + 1);

    let store: Store<String, u64> = Store::open(config.clone()).unwrap();
    let tokens: Vec<_> = store.list_checkpoints().unwrap().iter().map(|m| m.token).collect();
    assert_eq!(tokens, vec![first.token, second.token]);

    assert_eq!(store.recover(None).unwrap(), second.version);
    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    assert_eq!(read_value(&mut session, &"counter".to_string()), Some(2));
    drop(session);

    assert_eq!(store.recover(Some(first.token)).unwrap(), first.version);
    assert_eq!(store.list_checkpoints().unwrap().len(), 1);
    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    assert_eq!(read_value(&mut session, &"counter".to_string()), Some(1));
}

#[test]
fn test_corrupted_metadata_is_rejected() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let token = {
        let store: Store<u64, u64> = Store::open(config.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        session.upsert(&1, &1).unwrap();
        store.checkpoint(CheckpointKind::Snapshot).unwrap().token
    };

    let path = dir
        .path()
        .join("checkpoints")
        .join(token.to_string())
        .join("metadata.bin");
    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x55;
    std::fs::write(&path, bytes).unwrap();

    let store: Store<u64, u64> = Store::open(config).unwrap();
    assert!(matches!(
        store.recover(Some(token)),
        Err(Error::CorruptedMetadata(_))
    ));
}

#[test]
fn test_recovering_older_checkpoint_retires_newer() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());

    let (first, second) = {
        let store: Store<u64, u64> = Store::open(config.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        for key in 0..200u64 {
            session.upsert(&key, &1).unwrap();
        }
        let first = store.checkpoint(CheckpointKind::FoldOver).unwrap();
        for key in 0..200u64 {
            session.upsert(&key, &2).unwrap();
        }
        let second = store.checkpoint(CheckpointKind::FoldOver).unwrap();
        (first, second)
    };

    {
        let store: Store<u64, u64> = Store::open(config.clone()).unwrap();
        assert_eq!(store.recover(Some(first.token)).unwrap(), first.version);
        let tokens: Vec<_> = store.list_checkpoints().unwrap().iter().map(|m| m.token).collect();
        assert_eq!(tokens, vec![first.token]);
        assert!(matches!(
            store.recover(Some(second.token)),
            Err(Error::CheckpointNotFound(_))
        ));

        // Never checkpointed; lands where the second checkpoint's log was
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        for key in 0..200u64 {
            session.upsert(&key, &7).unwrap();
        }
        store.flush(true).unwrap();
    }

    let store: Store<u64, u64> = Store::open(config).unwrap();
    assert_eq!(store.recover(None).unwrap(), first.version);
    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    for key in 0..200u64 {
        assert_eq!(read_value(&mut session, &key), Some(1), "key {key}");
    }
}

#[test]
fn test_corrupt_index_leaves_running_store_intact() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let store: Store<u64, u64> = Store::open(config).unwrap();

    let token = {
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        for key in 0..100u64 {
            session.upsert(&key, &key).unwrap();
        }
        let token = store.checkpoint(CheckpointKind::Snapshot).unwrap().token;
        for key in 100..600u64 {
            session.upsert(&key, &key).unwrap();
        }
        store.flush_and_evict(true).unwrap();
        token
    };

    let path = dir
        .path()
        .join("checkpoints")
        .join(token.to_string())
        .join("index.bin");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(
        store.recover(Some(token)),
        Err(Error::CorruptedMetadata(_))
    ));
    assert_eq!(store.recovered_version(), None);

    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    for key in [0u64, 50, 300, 599] {
        assert_eq!(read_value(&mut session, &key), Some(key), "key {key}");
    }
}

#[test]
fn test_checkpoint_without_its_log_is_rejected() {
    let dir = tempdir().unwrap();
    let mut config = StoreConfig::default();
    config.log.page_bits = 12;
    config.log.memory_bits = 16;
    config.checkpoint.dir = Some(dir.path().to_path_buf());

    {
        let store: Store<u64, u64> = Store::open(config.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        for key in 0..300u64 {
            session.upsert(&key, &key).unwrap();
        }
        store.checkpoint(CheckpointKind::FoldOver).unwrap();
    }

    // Fresh in-memory log: the checkpoint's records are gone
    let store: Store<u64, u64> = Store::open(config).unwrap();
    assert!(matches!(store.recover(None), Err(Error::CorruptedMetadata(_))));
    assert_eq!(store.list_checkpoints().unwrap().len(), 1);

    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    session.upsert(&1, &10).unwrap();
    assert_eq!(session.read(&1).unwrap(), Status::Found(10));
}

/// Memory device whose writes can be made to fail
struct FailingDevice {
    inner: Arc<MemoryDevice>,
    fail_writes: AtomicBool,
}

impl StorageDevice for FailingDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::device("injected write failure"));
        }
        self.inner.write_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[test]
fn test_failed_checkpoint_keeps_previous() {
    let dir = tempdir().unwrap();
    let mut config = StoreConfig::default();
    config.log.page_bits = 12;
    config.log.memory_bits = 16;
    config.checkpoint.dir = Some(dir.path().to_path_buf());

    let log = Arc::new(MemoryDevice::new("log"));
    let objects = Arc::new(MemoryDevice::new("objects"));
    let failing = Arc::new(FailingDevice {
        inner: Arc::clone(&log),
        fail_writes: AtomicBool::new(false),
    });

    let first = {
        let store: Store<u64, u64> =
            Store::open_with_devices(config.clone(), failing.clone(), objects.clone()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        session.upsert(&1, &1).unwrap();
        let first = store.checkpoint(CheckpointKind::FoldOver).unwrap();

        session.upsert(&1, &2).unwrap();
        failing.fail_writes.store(true, Ordering::SeqCst);
        let (accepted, token) = store.take_checkpoint(CheckpointKind::FoldOver).unwrap();
        assert!(accepted);
        match store.wait_checkpoint_complete(token) {
            Err(Error::CheckpointFailed { token: failed, .. }) => assert_eq!(failed, token),
            other => panic!("expected a failed checkpoint, got {other:?}"),
        }
        assert_eq!(store.system_state().phase, Phase::Rest);
        assert_eq!(store.list_checkpoints().unwrap().len(), 1);
        first
    };

    let store: Store<u64, u64> = Store::open_with_devices(config, log, objects).unwrap();
    assert_eq!(store.recover(None).unwrap(), first.version);
    let mut session = store.new_session(sum_functions::<u64>()).unwrap();
    assert_eq!(read_value(&mut session, &1), Some(1));
}
