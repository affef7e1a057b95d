use crate::error::{KeeperError, KeeperResult};
use crate::executor::Trigger;
use crate::scheduler::BackupLauncher;
use crate::scheduler::cron::CronSchedule;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Public messages handled by the scheduler actor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Install or replace the trigger for a job; first slot is after the given instant.
    AddJob(i64, String, DateTime<Utc>, RpcReplyPort<KeeperResult<Option<DateTime<Utc>>>>),
    /// Drop a job's trigger. A run already in flight is left alone.
    RemoveJob(i64),
    ListTriggers(RpcReplyPort<Vec<TriggerInfo>>),
    /// Start a run outside the schedule, subject to the same exclusivity.
    RunNow(i64, RpcReplyPort<RunNowOutcome>),
    /// Wall-clock tick; fires every trigger that is due at `now`.
    Tick(DateTime<Utc>),

    // Internal messages (sent by the actor itself)
    /// A launched run has finished; release the job's slot.
    RunFinished {
        job_id: i64,
        result: Result<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunNowOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub job_id: i64,
    pub cron_expression: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub fired: u64,
    pub skipped: u64,
    pub running: bool,
}

/// Handle for interacting with the scheduler actor. The only way to change
/// the live trigger set.
#[derive(Clone)]
pub struct SchedulerHandle {
    actor: ActorRef<SchedulerMessage>,
}

impl SchedulerHandle {
    /// Install a trigger whose first slot follows the current time.
    pub async fn add_job(
        &self,
        job_id: i64,
        cron_expression: impl Into<String>,
    ) -> KeeperResult<Option<DateTime<Utc>>> {
        self.add_job_at(job_id, cron_expression, Utc::now()).await
    }

    pub async fn add_job_at(
        &self,
        job_id: i64,
        cron_expression: impl Into<String>,
        since: DateTime<Utc>,
    ) -> KeeperResult<Option<DateTime<Utc>>> {
        ractor::call!(
            self.actor,
            SchedulerMessage::AddJob,
            job_id,
            cron_expression.into(),
            since
        )
        .map_err(|e| KeeperError::RactorError(format!("AddJob RPC failed: {e}")))?
    }

    pub async fn remove_job(&self, job_id: i64) {
        let _ = ractor::cast!(self.actor, SchedulerMessage::RemoveJob(job_id));
    }

    pub async fn list_triggers(&self) -> KeeperResult<Vec<TriggerInfo>> {
        ractor::call!(self.actor, SchedulerMessage::ListTriggers)
            .map_err(|e| KeeperError::RactorError(format!("ListTriggers RPC failed: {e}")))
    }

    pub async fn run_now(&self, job_id: i64) -> KeeperResult<RunNowOutcome> {
        ractor::call!(self.actor, SchedulerMessage::RunNow, job_id)
            .map_err(|e| KeeperError::RactorError(format!("RunNow RPC failed: {e}")))
    }

    pub async fn tick(&self, now: DateTime<Utc>) {
        let _ = ractor::cast!(self.actor, SchedulerMessage::Tick(now));
    }

    /// Feed the actor a tick every `interval` from the wall clock.
    pub fn spawn_ticker(&self, interval: Duration) -> JoinHandle<()> {
        let actor = self.actor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if ractor::cast!(actor, SchedulerMessage::Tick(Utc::now())).is_err() {
                    debug!("scheduler actor gone; ticker stopping");
                    break;
                }
            }
        })
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}

struct TriggerEntry {
    schedule: CronSchedule,
    next_fire: Option<DateTime<Utc>>,
    fired: u64,
    skipped: u64,
}

/// Internal state held by the scheduler actor
struct SchedulerState {
    launcher: Arc<dyn BackupLauncher>,
    tz: Tz,
    triggers: HashMap<i64, TriggerEntry>,
    running: HashSet<i64>,
}

pub struct SchedulerArgs {
    pub launcher: Arc<dyn BackupLauncher>,
    pub tz: Tz,
}

/// ractor-based scheduler actor
struct SchedulerActor;

#[ractor::async_trait]
impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(timezone = %args.tz, "SchedulerActor started");
        Ok(SchedulerState {
            launcher: args.launcher,
            tz: args.tz,
            triggers: HashMap::new(),
            running: HashSet::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::AddJob(job_id, expression, since, rp) => {
                let _ = rp.send(self.handle_add_job(state, job_id, &expression, since));
            }
            SchedulerMessage::RemoveJob(job_id) => {
                if state.triggers.remove(&job_id).is_some() {
                    info!(job_id, "trigger removed");
                }
            }
            SchedulerMessage::ListTriggers(rp) => {
                let mut list: Vec<TriggerInfo> = state
                    .triggers
                    .iter()
                    .map(|(job_id, t)| TriggerInfo {
                        job_id: *job_id,
                        cron_expression: t.schedule.expression().to_string(),
                        next_fire: t.next_fire,
                        fired: t.fired,
                        skipped: t.skipped,
                        running: state.running.contains(job_id),
                    })
                    .collect();
                list.sort_by_key(|t| t.job_id);
                let _ = rp.send(list);
            }
            SchedulerMessage::RunNow(job_id, rp) => {
                let outcome = if state.running.contains(&job_id) {
                    warn!(job_id, "manual run refused, job already running");
                    RunNowOutcome::AlreadyRunning
                } else {
                    self.launch(state, &myself, job_id, Trigger::Manual);
                    RunNowOutcome::Started
                };
                let _ = rp.send(outcome);
            }
            SchedulerMessage::Tick(now) => {
                self.handle_tick(state, &myself, now);
            }
            SchedulerMessage::RunFinished { job_id, result } => {
                state.running.remove(&job_id);
                match result {
                    Ok(status) => info!(job_id, status = %status, "run finished"),
                    Err(e) => error!(job_id, error = %e, "run could not be executed"),
                }
            }
        }
        Ok(())
    }
}

impl SchedulerActor {
    fn handle_add_job(
        &self,
        state: &mut SchedulerState,
        job_id: i64,
        expression: &str,
        since: DateTime<Utc>,
    ) -> KeeperResult<Option<DateTime<Utc>>> {
        let schedule = CronSchedule::parse(expression, state.tz)?;
        let next_fire = schedule.next_after(since);
        // keep counters when a trigger is re-added with a new schedule
        let (fired, skipped) = state
            .triggers
            .get(&job_id)
            .map(|t| (t.fired, t.skipped))
            .unwrap_or((0, 0));
        state.triggers.insert(
            job_id,
            TriggerEntry {
                schedule,
                next_fire,
                fired,
                skipped,
            },
        );
        info!(job_id, cron = %expression, next_fire = ?next_fire, "trigger installed");
        Ok(next_fire)
    }

    fn handle_tick(
        &self,
        state: &mut SchedulerState,
        myself: &ActorRef<SchedulerMessage>,
        now: DateTime<Utc>,
    ) {
        let mut due = Vec::new();
        for (job_id, trigger) in state.triggers.iter_mut() {
            let Some(next) = trigger.next_fire else {
                continue;
            };
            if now < next {
                continue;
            }
            // missed slots collapse into this one firing; no backfill
            trigger.next_fire = trigger.schedule.next_after(now);
            due.push(*job_id);
        }
        due.sort_unstable();

        for job_id in due {
            if state.running.contains(&job_id) {
                if let Some(t) = state.triggers.get_mut(&job_id) {
                    t.skipped += 1;
                    warn!(
                        job_id,
                        skipped = t.skipped,
                        "previous run still in progress, skipping trigger"
                    );
                }
                continue;
            }
            if let Some(t) = state.triggers.get_mut(&job_id) {
                t.fired += 1;
            }
            self.launch(state, myself, job_id, Trigger::Scheduled);
        }
    }

    fn launch(
        &self,
        state: &mut SchedulerState,
        myself: &ActorRef<SchedulerMessage>,
        job_id: i64,
        trigger: Trigger,
    ) {
        state.running.insert(job_id);
        debug!(job_id, ?trigger, "launching backup");
        let launcher = state.launcher.clone();
        let me = myself.clone();
        tokio::spawn(async move {
            // a panicking run must still release the job's slot
            let result = match AssertUnwindSafe(launcher.launch(job_id, trigger))
                .catch_unwind()
                .await
            {
                Ok(Ok(run)) => Ok(run.status.to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("run panicked: {}", panic_message(&*panic))),
            };
            let _ = ractor::cast!(me, SchedulerMessage::RunFinished { job_id, result });
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Async spawn of the scheduler actor and return a handle.
pub async fn spawn(launcher: Arc<dyn BackupLauncher>, tz: Tz) -> KeeperResult<SchedulerHandle> {
    let (actor, _jh) = Actor::spawn(None, SchedulerActor, SchedulerArgs { launcher, tz })
        .await
        .map_err(|e| KeeperError::RactorError(format!("failed to spawn SchedulerActor: {e}")))?;
    Ok(SchedulerHandle { actor })
}
