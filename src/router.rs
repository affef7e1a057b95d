use crate::handlers;
use crate::orchestrator::Orchestrator;
use crate::provision::Provisioner;
use crate::service::Inventory;
use axum::Router;
use axum::routing::{delete, get, post, put};

#[derive(Clone)]
pub struct KeeperState {
    pub inventory: Inventory,
    pub orchestrator: Orchestrator,
    pub provisioner: Provisioner,
}

impl KeeperState {
    pub fn new(inventory: Inventory, orchestrator: Orchestrator, provisioner: Provisioner) -> Self {
        Self {
            inventory,
            orchestrator,
            provisioner,
        }
    }
}

pub fn keeper_router(state: KeeperState) -> Router {
    Router::new()
        // Restore / import
        .route(
            "/restore-status/{run_id}",
            get(handlers::restore::restore_status),
        )
        .route("/restores", post(handlers::restore::start_restore))
        .route("/imports", post(handlers::restore::start_import))
        // Jobs
        .route("/jobs", post(handlers::jobs::create_job))
        .route("/jobs/triggers", get(handlers::jobs::list_triggers))
        .route(
            "/jobs/{job_id}",
            put(handlers::jobs::update_job).delete(handlers::jobs::delete_job),
        )
        .route("/jobs/{job_id}/enabled", post(handlers::jobs::set_enabled))
        .route("/jobs/{job_id}/run", post(handlers::jobs::run_now))
        .route("/jobs/{job_id}/runs", get(handlers::jobs::list_runs))
        // Hosts and what lives on them
        .route(
            "/hosts",
            get(handlers::hosts::list_hosts).post(handlers::hosts::register_host),
        )
        .route(
            "/hosts/{host_id}",
            get(handlers::hosts::get_host).delete(handlers::hosts::delete_host),
        )
        .route(
            "/hosts/{host_id}/test-connection",
            post(handlers::hosts::test_connection),
        )
        .route(
            "/hosts/{host_id}/provision",
            post(handlers::hosts::provision),
        )
        .route(
            "/hosts/{host_id}/databases",
            post(handlers::hosts::add_database),
        )
        .route(
            "/databases/{database_id}/users",
            post(handlers::hosts::add_database_user),
        )
        .route(
            "/databases/{database_id}/users/{user_id}/password",
            get(handlers::hosts::masked_user_password),
        )
        .route(
            "/databases/{database_id}/recovery-points",
            get(handlers::hosts::recovery_points),
        )
        .route(
            "/storage-targets",
            post(handlers::hosts::create_storage_target),
        )
        .route(
            "/storage-targets/{target_id}",
            delete(handlers::hosts::delete_storage_target),
        )
        .route(
            "/storage-targets/{target_id}/test",
            post(handlers::hosts::test_storage_target),
        )
        .with_state(state)
}
