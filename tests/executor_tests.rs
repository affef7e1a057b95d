mod common;

use common::*;
use pgkeeper::db::{BackupKind, BackupStatus, KeeperStorage};
use pgkeeper::executor::{HostLocks, Trigger};
use std::time::Duration;

const F1: &str = "20240101-020000F";
const F2: &str = "20240102-020000F";
const F3: &str = "20240103-020000F";

async fn finished_full(storage: &KeeperStorage, job_id: i64, label: &str) -> i64 {
    let id = storage
        .create_backup_run(job_id, BackupKind::Full, false)
        .await
        .unwrap();
    storage
        .finish_backup_run(id, BackupStatus::Success, Some(100), Some(label), None)
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn successful_backup_records_label_and_size() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on(
        "--output=json info",
        ok(&info_json("orders", &[(F1, "full", 1_704_074_500)])),
    );
    fake.on("--type=full", ok("INFO: backup command end: completed successfully\n"));
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job_id = storage
        .insert_job(&job_spec(db.id, target.id, BackupKind::Full))
        .await
        .unwrap();

    let executor = executor(&storage, &vault, &fake, 6, HostLocks::new());
    let run = executor.run(job_id, Trigger::Manual).await.unwrap();

    assert_eq!(run.status, BackupStatus::Success);
    assert!(run.manual);
    assert_eq!(run.repository_path.as_deref(), Some(F1));
    assert_eq!(run.size_bytes, Some(200));
    assert!(run.end_time.is_some());
    assert!(run.log_output.contains("completed successfully"));

    let create = fake.position("stanza-create").unwrap();
    let backup = fake.position("--type=full").unwrap();
    let info = fake.position("--output=json info").unwrap();
    assert!(fake.position("base64 -d").unwrap() < create);
    assert!(create < backup && backup < info);
    // the cipher passphrase only travels inside the config write
    let passphrase = vault
        .open(pgkeeper::vault::SecretKind::CipherPassphrase, &db.cipher_passphrase)
        .unwrap();
    assert!(fake.displays().iter().all(|d| !d.contains(passphrase.expose())));
}

#[tokio::test]
async fn incremental_escalates_when_chain_is_full() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on(
        "--output=json info",
        ok(&info_json("orders", &[(F1, "full", 1_704_074_500)])),
    );
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job_id = storage
        .insert_job(&job_spec(db.id, target.id, BackupKind::Incremental))
        .await
        .unwrap();
    let executor = executor(&storage, &vault, &fake, 1, HostLocks::new());

    // no full yet
    let first = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(first.backup_kind, BackupKind::Full);
    assert!(first.log_output.contains("escalating incremental to full"));

    let second = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(second.backup_kind, BackupKind::Incremental);
    assert!(!second.log_output.contains("escalating"));

    // chain limit of one reached
    let third = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(third.backup_kind, BackupKind::Full);

    let types: Vec<bool> = fake
        .scripts()
        .iter()
        .filter(|s| s.contains("--type="))
        .map(|s| s.contains("--type=incr"))
        .collect();
    assert_eq!(types, vec![false, true, false]);
}

#[tokio::test]
async fn failed_backup_keeps_tool_output() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on(
        "--type=full",
        fail(56, "ERROR: [056]: unable to find primary cluster"),
    );
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job_id = storage
        .insert_job(&job_spec(db.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    let executor = executor(&storage, &vault, &fake, 6, HostLocks::new());

    let run = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(run.status, BackupStatus::Failed);
    assert!(run
        .error_summary
        .as_deref()
        .unwrap()
        .contains("unable to find primary cluster"));
    assert!(run.log_output.contains("ERROR:"));
    assert!(run.repository_path.is_none());
    assert!(!fake.called("expire"));

    // a failure does not count toward the incremental chain or as a full
    assert!(!storage.has_successful_full(job_id).await.unwrap());
}

#[tokio::test]
async fn uninitialized_host_fails_without_remote_calls() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let host = seed_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job_id = storage
        .insert_job(&job_spec(db.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    let executor = executor(&storage, &vault, &fake, 6, HostLocks::new());

    let run = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(run.status, BackupStatus::Failed);
    assert!(run.error_summary.unwrap().contains("unprovisioned"));
    assert!(fake.scripts().is_empty());
}

#[tokio::test]
async fn busy_host_fails_the_run_instead_of_waiting() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job_id = storage
        .insert_job(&job_spec(db.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    let locks = HostLocks::new();
    let restore = locks.try_exclusive(host.id).unwrap();
    let executor = executor(&storage, &vault, &fake, 6, locks.clone());

    let run = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(run.status, BackupStatus::Failed);
    assert!(run.error_summary.unwrap().contains("busy"));
    assert!(fake.scripts().is_empty());

    drop(restore);
    assert!(locks.try_exclusive(host.id).is_some());
}

#[tokio::test]
async fn retention_expires_oldest_full_and_flags_its_run() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let all = info_json(
        "orders",
        &[
            (F1, "full", 1_704_074_500),
            (F2, "full", 1_704_160_900),
            (F3, "full", 1_704_247_300),
        ],
    );
    let after = info_json(
        "orders",
        &[(F2, "full", 1_704_160_900), (F3, "full", 1_704_247_300)],
    );
    fake.on_seq(
        "--output=json info",
        vec![ok(&all), ok(&all), ok(&after)],
    );
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job_id = storage
        .insert_job(&job_spec(db.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    let first = finished_full(&storage, job_id, F1).await;
    let second = finished_full(&storage, job_id, F2).await;

    let executor = executor(&storage, &vault, &fake, 6, HostLocks::new());
    let run = executor.run(job_id, Trigger::Scheduled).await.unwrap();
    assert_eq!(run.status, BackupStatus::Success);
    assert_eq!(run.repository_path.as_deref(), Some(F3));

    let expires: Vec<String> = fake
        .scripts()
        .into_iter()
        .filter(|s| s.contains("expire"))
        .collect();
    assert_eq!(expires.len(), 1);
    assert!(expires[0].contains(F1));

    let runs = storage.list_backup_runs(job_id).await.unwrap();
    assert_eq!(runs.len(), 3);
    let pruned: Vec<i64> = runs.iter().filter(|r| r.pruned).map(|r| r.id).collect();
    assert_eq!(pruned, vec![first]);
    assert!(!storage.get_backup_run(second).await.unwrap().pruned);
    assert!(!storage.get_backup_run(run.id).await.unwrap().pruned);
}

#[tokio::test]
async fn host_stays_claimed_until_retention_finishes() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let all = info_json(
        "orders",
        &[(F1, "full", 1_704_074_500), (F2, "full", 1_704_160_900)],
    );
    fake.on("--output=json info", ok(&all));
    fake.on_slow("expire", Duration::from_millis(300), ok("INFO: expire command end\n"));
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let mut spec = job_spec(db.id, target.id, BackupKind::Full);
    spec.retention_count = 1;
    let job_id = storage.insert_job(&spec).await.unwrap();

    let locks = HostLocks::new();
    let executor = executor(&storage, &vault, &fake, 6, locks.clone());
    let run = tokio::spawn(async move { executor.run(job_id, Trigger::Scheduled).await });

    for _ in 0..200 {
        if fake.called("expire") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(fake.called("expire"));
    // a restore cannot claim the host while backups are being expired
    assert!(locks.try_exclusive(host.id).is_none());

    let run = run.await.unwrap().unwrap();
    assert_eq!(run.status, BackupStatus::Success);
    assert!(locks.try_exclusive(host.id).is_some());
}
