mod common;

use common::*;
use pgkeeper::KeeperError;
use pgkeeper::db::InstallState;
use pgkeeper::provision::Provisioner;
use std::sync::Arc;
use std::time::Duration;

fn provisioner(storage: &pgkeeper::db::KeeperStorage, fake: &Arc<FakeExecutor>) -> Provisioner {
    Provisioner::new(
        storage.clone(),
        fake.clone(),
        Duration::from_secs(5),
        "/etc/pgbackrest/conf.d",
    )
    .with_health_retry_delay(Duration::from_millis(5))
}

#[tokio::test]
async fn provisioning_initializes_the_host() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on("SHOW data_directory", ok("/srv/postgresql/16/main\n"));
    fake.on_seq(
        "pg_isready",
        vec![
            fail(2, "localhost:5432 - no response"),
            fail(2, "localhost:5432 - no response"),
            ok("localhost:5432 - accepting connections\n"),
        ],
    );
    let host = seed_host(&storage, &vault, "db-1").await;

    let state = provisioner(&storage, &fake).provision(host.id).await.unwrap();
    assert_eq!(state, InstallState::Initialized);

    let host = storage.get_host(host.id).await.unwrap();
    assert_eq!(host.install_state, InstallState::Initialized);
    assert_eq!(host.data_dir.as_deref(), Some("/srv/postgresql/16/main"));
    assert!(host.provision_log.contains("==> install pgBackRest"));
    assert!(host.provision_log.contains("accepting connections"));
    assert!(host.provision_log.contains("provisioning complete"));

    let pg = fake.position("apt-get install -y postgresql-16").unwrap();
    let backrest = fake.position("apt-get install -y pgbackrest").unwrap();
    let wal = fake.position("ALTER SYSTEM SET wal_level").unwrap();
    let restart = fake.position("systemctl restart postgresql").unwrap();
    let ready = fake.position("pg_isready").unwrap();
    assert!(pg < backrest && backrest < wal && wal < restart && restart < ready);
    assert_eq!(
        fake.scripts().iter().filter(|s| s.contains("pg_isready")).count(),
        3
    );
}

#[tokio::test]
async fn failed_step_is_terminal() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on(
        "apt-get install -y pgbackrest",
        fail(100, "E: Unable to locate package pgbackrest"),
    );
    let host = seed_host(&storage, &vault, "db-1").await;
    let provisioner = provisioner(&storage, &fake);

    let err = provisioner.provision(host.id).await.unwrap_err();
    assert!(matches!(err, KeeperError::RemoteCommand { exit_code: 100, .. }));

    let row = storage.get_host(host.id).await.unwrap();
    assert_eq!(row.install_state, InstallState::Failed);
    assert!(row.provision_log.contains("Unable to locate package"));
    assert!(row.provision_log.contains("provisioning failed"));
    // later steps never ran
    assert!(!fake.called("systemctl restart postgresql"));

    let retry = provisioner.provision(host.id).await.unwrap_err();
    assert!(matches!(retry, KeeperError::Conflict(_)));
}

#[tokio::test]
async fn only_unprovisioned_hosts_can_be_claimed() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    let host = seed_initialized_host(&storage, &vault, "db-1").await;
    let provisioner = provisioner(&storage, &fake);

    assert!(matches!(
        provisioner.begin(host.id).await,
        Err(KeeperError::Conflict(_))
    ));
    assert!(matches!(
        provisioner.begin(4242).await,
        Err(KeeperError::NotFound(_))
    ));
    assert!(fake.scripts().is_empty());
}

#[tokio::test]
async fn unhealthy_service_fails_provisioning() {
    let (storage, _dir) = temp_storage().await;
    let vault = test_vault();
    let fake = FakeExecutor::new();
    fake.on("pg_isready", fail(2, "localhost:5432 - no response"));
    let host = seed_host(&storage, &vault, "db-1").await;

    provisioner(&storage, &fake).provision(host.id).await.unwrap_err();
    let row = storage.get_host(host.id).await.unwrap();
    assert_eq!(row.install_state, InstallState::Failed);
    // first attempt plus five retries
    assert_eq!(
        fake.scripts().iter().filter(|s| s.contains("pg_isready")).count(),
        6
    );
    assert!(!fake.called("SHOW data_directory"));
}
