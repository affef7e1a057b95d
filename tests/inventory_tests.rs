mod common;

use common::*;
use pgkeeper::KeeperError;
use pgkeeper::db::{BackupKind, NewStorageTarget, Permission, StorageKind};
use pgkeeper::service::HostRegistration;
use pgkeeper::vault::SecretKind;

fn registration(name: &str) -> HostRegistration {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "address": "10.0.0.5",
        "ssh_username": "deploy",
        "ssh_private_key": TEST_SSH_KEY,
    }))
    .unwrap()
}

#[tokio::test]
async fn register_host_seals_the_private_key() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);

    let host = inventory.register_host(registration("db-1")).await.unwrap();
    assert_eq!(host.ssh_port, 22);
    assert_eq!(host.pg_port, 5432);
    assert_eq!(host.pg_version, "16");
    assert_ne!(host.ssh_private_key, TEST_SSH_KEY);
    assert!(!host.ssh_private_key.contains("OPENSSH"));
    let opened = vault
        .open(SecretKind::SshPrivateKey, &host.ssh_private_key)
        .unwrap();
    assert_eq!(opened.expose(), TEST_SSH_KEY);
    assert!(fake.scripts().is_empty());
}

#[tokio::test]
async fn register_host_rejects_garbage_key_and_address() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);

    let mut bad_key = registration("db-1");
    bad_key.ssh_private_key = "not a key".into();
    assert!(matches!(
        inventory.register_host(bad_key).await,
        Err(KeeperError::Configuration(_))
    ));

    // host names become repository path segments
    for name in ["db1\nrepo1-s3-verify-tls=n", "../etc", "db 1"] {
        assert!(matches!(
            inventory.register_host(registration(name)).await,
            Err(KeeperError::Configuration(_))
        ));
    }

    let mut bad_address = registration("db-1");
    bad_address.address = "db;rm -rf /".into();
    assert!(matches!(
        inventory.register_host(bad_address).await,
        Err(KeeperError::Configuration(_))
    ));
}

#[tokio::test]
async fn add_database_creates_owner_and_hides_password() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);
    let host = seed_initialized_host(&storage, &vault, "db-1").await;

    let created = inventory.add_database(host.id, "orders", None).await.unwrap();
    assert_eq!(created.database.name, "orders");
    assert_eq!(created.primary_user.username, "orders_owner");
    assert!(created.primary_user.is_primary);
    assert_eq!(created.primary_user.permission, Permission::ReadWrite);

    let password = created.password.expose().to_string();
    assert!(fake.scripts()[0].contains(&password));
    assert!(fake.scripts()[0].contains("CREATE DATABASE"));
    assert!(!fake.displays()[0].contains(&password));
    assert!(fake.displays()[0].contains("*****"));

    let masked = inventory
        .masked_user_password(created.database.id, created.primary_user.id)
        .await
        .unwrap();
    assert_ne!(masked, password);

    // passphrases are per database
    let other = inventory.add_database(host.id, "billing", None).await.unwrap();
    let a = vault
        .open(SecretKind::CipherPassphrase, &created.database.cipher_passphrase)
        .unwrap();
    let b = vault
        .open(SecretKind::CipherPassphrase, &other.database.cipher_passphrase)
        .unwrap();
    assert_ne!(a, b);

    let dup = inventory.add_database(host.id, "orders", None).await;
    assert!(matches!(dup, Err(KeeperError::Configuration(_))));
}

#[tokio::test]
async fn failed_remote_create_records_nothing() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on("CREATE DATABASE", fail(1, "ERROR:  permission denied"));
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);
    let host = seed_initialized_host(&storage, &vault, "db-1").await;

    let err = inventory.add_database(host.id, "orders", None).await.unwrap_err();
    assert!(matches!(err, KeeperError::RemoteCommand { .. }));
    assert!(storage.list_databases(host.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_only_user_gets_select_grants() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let created = inventory.add_database(host.id, "orders", None).await.unwrap();

    let (user, password) = inventory
        .add_database_user(created.database.id, "reporting", Permission::ReadOnly)
        .await
        .unwrap();
    assert_eq!(user.permission, Permission::ReadOnly);
    assert!(!user.is_primary);
    assert!(fake.displays().iter().all(|d| !d.contains(password.expose())));
    assert!(fake.called("GRANT SELECT ON ALL TABLES"));
    assert!(!fake.called("INSERT, UPDATE, DELETE"));
    assert_eq!(storage.list_users(created.database.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn one_job_per_database() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let scheduler = noop_scheduler().await;
    let inventory = inventory(&storage, &vault, &fake, scheduler.clone());
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let orders = seed_database(&storage, &vault, host.id, "orders").await;
    let billing = seed_database(&storage, &vault, host.id, "billing").await;
    let target = seed_local_target(&storage, "local").await;

    let first = inventory
        .create_job(job_spec(orders.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    let second = inventory
        .create_job(job_spec(orders.id, target.id, BackupKind::Incremental))
        .await;
    assert!(matches!(second, Err(KeeperError::Configuration(_))));

    let billing_job = inventory
        .create_job(job_spec(billing.id, target.id, BackupKind::Full))
        .await
        .unwrap();

    // moving a job onto a database that already has one is refused
    let moved = inventory
        .update_job(billing_job.id, job_spec(orders.id, target.id, BackupKind::Full))
        .await;
    assert!(matches!(moved, Err(KeeperError::Configuration(_))));

    // updating in place is fine
    let mut spec = job_spec(orders.id, target.id, BackupKind::Incremental);
    spec.cron_expression = "15 3 * * 1-5".into();
    let updated = inventory.update_job(first.id, spec).await.unwrap();
    assert_eq!(updated.backup_kind, BackupKind::Incremental);

    let triggers = scheduler.list_triggers().await.unwrap();
    assert_eq!(triggers.len(), 2);
    assert_eq!(triggers[0].job_id, first.id);
    assert_eq!(triggers[0].cron_expression, "15 3 * * 1-5");
}

#[tokio::test]
async fn job_validation_and_enable_toggle() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let scheduler = noop_scheduler().await;
    let inventory = inventory(&storage, &vault, &fake, scheduler.clone());
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;

    let mut bad = job_spec(db.id, target.id, BackupKind::Full);
    bad.cron_expression = "every night".into();
    assert!(matches!(
        inventory.create_job(bad).await,
        Err(KeeperError::Configuration(_))
    ));
    for count in [0, 10_000_000, 3_000_000_000] {
        let mut bad = job_spec(db.id, target.id, BackupKind::Full);
        bad.retention_count = count;
        assert!(matches!(
            inventory.create_job(bad).await,
            Err(KeeperError::Configuration(_))
        ));
    }
    assert!(matches!(
        inventory
            .create_job(job_spec(db.id + 100, target.id, BackupKind::Full))
            .await,
        Err(KeeperError::NotFound(_))
    ));

    let mut spec = job_spec(db.id, target.id, BackupKind::Full);
    spec.enabled = false;
    let job = inventory.create_job(spec).await.unwrap();
    assert!(scheduler.list_triggers().await.unwrap().is_empty());

    let job = inventory.set_job_enabled(job.id, true).await.unwrap();
    assert!(job.enabled);
    assert_eq!(scheduler.list_triggers().await.unwrap().len(), 1);

    inventory.set_job_enabled(job.id, false).await.unwrap();
    assert!(scheduler.list_triggers().await.unwrap().is_empty());

    inventory.set_job_enabled(job.id, true).await.unwrap();
    inventory.delete_job(job.id).await.unwrap();
    assert!(scheduler.list_triggers().await.unwrap().is_empty());
    assert!(matches!(
        inventory.delete_job(job.id).await,
        Err(KeeperError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleting_a_host_cascades_and_leaves_the_repository_alone() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let scheduler = noop_scheduler().await;
    let inventory = inventory(&storage, &vault, &fake, scheduler.clone());
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;
    let target = seed_local_target(&storage, "local").await;
    let job = inventory
        .create_job(job_spec(db.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    assert_eq!(scheduler.list_triggers().await.unwrap().len(), 1);

    inventory.delete_host(host.id).await.unwrap();

    assert!(scheduler.list_triggers().await.unwrap().is_empty());
    assert!(matches!(
        storage.get_job(job.id).await,
        Err(KeeperError::NotFound(_))
    ));
    assert!(matches!(
        storage.get_database(db.id).await,
        Err(KeeperError::NotFound(_))
    ));
    // nothing was sent to the host, so nothing was removed from it
    assert!(fake.scripts().is_empty());
    // the storage target is shared inventory and survives
    storage.get_storage_target(target.id).await.unwrap();
}

#[tokio::test]
async fn storage_targets_in_use_cannot_be_deleted() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let db = seed_database(&storage, &vault, host.id, "orders").await;

    let s3 = inventory
        .create_storage_target(NewStorageTarget {
            name: "offsite".into(),
            kind: StorageKind::S3,
            bucket: Some("acme-backups".into()),
            region: Some("eu-west-1".into()),
            endpoint: None,
            access_key: Some("AKIAEXAMPLE".into()),
            secret_key: Some("wJalrXUtnFEMI/K7MDENG".into()),
            path_prefix: Some("/pg".into()),
        })
        .await
        .unwrap();
    let sealed = s3.secret_key.clone().unwrap();
    assert_ne!(sealed, "wJalrXUtnFEMI/K7MDENG");
    let masked = inventory.masked_storage_secret(s3.id).await.unwrap().unwrap();
    assert!(!masked.contains("wJalrXUtnFEMI/K7MDENG"));

    let job = inventory
        .create_job(job_spec(db.id, s3.id, BackupKind::Full))
        .await
        .unwrap();
    assert!(matches!(
        inventory.delete_storage_target(s3.id).await,
        Err(KeeperError::Configuration(_))
    ));

    inventory.delete_job(job.id).await.unwrap();
    inventory.delete_storage_target(s3.id).await.unwrap();
    assert!(matches!(
        storage.get_storage_target(s3.id).await,
        Err(KeeperError::NotFound(_))
    ));
}

#[tokio::test]
async fn s3_target_without_secret_is_rejected() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);

    let err = inventory
        .create_storage_target(NewStorageTarget {
            name: "offsite".into(),
            kind: StorageKind::S3,
            bucket: Some("acme-backups".into()),
            region: Some("eu-west-1".into()),
            endpoint: None,
            access_key: Some("AKIAEXAMPLE".into()),
            secret_key: None,
            path_prefix: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KeeperError::Configuration(_)));
}

#[tokio::test]
async fn load_schedules_installs_enabled_jobs_only() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let a = seed_database(&storage, &vault, host.id, "orders").await;
    let b = seed_database(&storage, &vault, host.id, "billing").await;
    let target = seed_local_target(&storage, "local").await;
    storage
        .insert_job(&job_spec(a.id, target.id, BackupKind::Full))
        .await
        .unwrap();
    let mut off = job_spec(b.id, target.id, BackupKind::Full);
    off.enabled = false;
    storage.insert_job(&off).await.unwrap();

    let scheduler = noop_scheduler().await;
    let inventory = inventory(&storage, &vault, &fake, scheduler.clone());
    assert_eq!(inventory.load_schedules().await.unwrap(), 1);
    assert_eq!(scheduler.list_triggers().await.unwrap().len(), 1);
}

fn s3_target() -> NewStorageTarget {
    NewStorageTarget {
        name: "offsite".into(),
        kind: StorageKind::S3,
        bucket: Some("acme-backups".into()),
        region: Some("eu-west-1".into()),
        endpoint: Some("minio.internal:9000".into()),
        access_key: Some("AKIAEXAMPLE".into()),
        secret_key: Some("wJalrXUtnFEMI/K7MDENG".into()),
        path_prefix: Some("/pg/prod".into()),
    }
}

#[tokio::test]
async fn s3_target_fields_cannot_carry_line_breaks() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let inventory = inventory(&storage, &vault, &fake, noop_scheduler().await);

    let injected = "x\nrepo1-s3-verify-tls=n";
    let cases = [
        NewStorageTarget {
            region: Some(format!("eu-west-1{injected}")),
            ..s3_target()
        },
        NewStorageTarget {
            endpoint: Some(format!("minio.internal{injected}")),
            ..s3_target()
        },
        NewStorageTarget {
            access_key: Some(format!("AKIA{injected}")),
            ..s3_target()
        },
        NewStorageTarget {
            path_prefix: Some(format!("pg{injected}")),
            ..s3_target()
        },
        NewStorageTarget {
            secret_key: Some(format!("secret{injected}")),
            ..s3_target()
        },
    ];
    for target in cases {
        assert!(matches!(
            inventory.create_storage_target(target).await,
            Err(KeeperError::Configuration(_))
        ));
    }

    let created = inventory.create_storage_target(s3_target()).await.unwrap();
    assert_eq!(created.endpoint.as_deref(), Some("minio.internal:9000"));
}
