//! Cache hydration for a single registrant or every registrant of an event.
//!
//! Sub-request and entity failures are recorded in the report instead of
//! aborting the run. Event-wide runs fan out without a local cap: the
//! [`Fetcher`] is the only admission-control point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::histogram;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::application::cache::{CacheStore, UpsertOutcome};
use crate::application::fetch::Fetcher;
use crate::application::maintenance::{EventSweepReport, MaintenanceService};
use crate::application::repos::RepoError;
use crate::domain::hydration::{
    EntityHydrationReport, EntityOutcome, EntityStatus, EventHydrationReport, HydrationPlan,
    REGISTRATION_LIST_OBJECT, SkipReason, SubRequest, SubRequestOutcome, SubRequestStatus,
    registrant_codes, registrant_discovery_params,
};
use crate::domain::identity::CacheIdentity;

const TARGET: &str = "eventmirror::hydration";

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub event_clear_result: EventSweepReport,
    pub event_hydration_result: EventHydrationReport,
}

#[derive(Clone)]
pub struct HydrationService {
    cache: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    maintenance: MaintenanceService,
    account_code: Arc<str>,
}

impl HydrationService {
    pub fn new(cache: CacheStore, fetcher: Arc<dyn Fetcher>, account_code: &str) -> Self {
        Self {
            maintenance: MaintenanceService::new(cache.clone()),
            cache,
            fetcher,
            account_code: Arc::from(account_code),
        }
    }

    /// Warm every sub-request of the registrant plan, one at a time.
    pub async fn hydrate_entity(&self, event_code: &str, reg_code: &str) -> EntityHydrationReport {
        let plan = HydrationPlan::registrant(reg_code);
        info!(
            target = TARGET,
            event_code,
            reg_code,
            account_code = %self.account_code,
            sub_requests = plan.len(),
            "starting registrant hydration"
        );

        let started = Instant::now();
        let mut results = Vec::with_capacity(plan.len());
        for request in plan.requests {
            let status = self.hydrate_sub_request(event_code, &request).await;
            results.push(SubRequestOutcome { request, status });
        }

        let report = EntityHydrationReport {
            event_code: event_code.to_string(),
            entity_id: plan.entity_id,
            results,
        };
        histogram!("eventmirror_hydration_entity_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            target = TARGET,
            event_code,
            reg_code,
            cached = report.count(|s| matches!(s, SubRequestStatus::Cached)),
            failed = report.count(|s| matches!(s, SubRequestStatus::Failed { .. })),
            "registrant hydration completed"
        );
        report
    }

    async fn hydrate_sub_request(&self, event_code: &str, request: &SubRequest) -> SubRequestStatus {
        let identity = match CacheIdentity::new(
            request.object.clone(),
            self.account_code.as_ref(),
            Some(event_code.to_string()),
            request.identifier_code.clone(),
            request.query_params.clone(),
        ) {
            Ok(identity) => identity,
            Err(err) => {
                return SubRequestStatus::Failed {
                    error: err.to_string(),
                };
            }
        };

        if self.cache.lookup(&identity).await.is_some() {
            return SubRequestStatus::Skipped {
                reason: SkipReason::AlreadyCached,
            };
        }

        match self.fetcher.fetch(&identity).await {
            Ok(Some(response)) => match self.cache.upsert(&identity, &response).await {
                UpsertOutcome::Stored => SubRequestStatus::Cached,
                UpsertOutcome::SkippedEmpty => SubRequestStatus::Skipped {
                    reason: SkipReason::NoData,
                },
                UpsertOutcome::Failed => SubRequestStatus::Failed {
                    error: "cache write failed".to_string(),
                },
            },
            Ok(None) => {
                warn!(target = TARGET, identity = %identity, "no upstream data to cache");
                SubRequestStatus::Skipped {
                    reason: SkipReason::NoData,
                }
            }
            Err(err) => {
                error!(target = TARGET, identity = %identity, error = %err, "sub-request failed");
                SubRequestStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Discover the active registrants of `event_code` and hydrate them concurrently.
    pub async fn hydrate_event(&self, event_code: &str) -> EventHydrationReport {
        info!(target = TARGET, event_code, "starting event-wide hydration");

        let reg_codes = match self.discover_registrants(event_code).await {
            Ok(codes) if codes.is_empty() => {
                info!(target = TARGET, event_code, "no active registrants");
                return EventHydrationReport::NoWork {
                    event_code: event_code.to_string(),
                    reason: format!("No active registrants for event {event_code}"),
                };
            }
            Ok(codes) => codes,
            Err(reason) => {
                error!(target = TARGET, event_code, reason = %reason, "registrant discovery failed");
                return EventHydrationReport::NoWork {
                    event_code: event_code.to_string(),
                    reason,
                };
            }
        };

        info!(
            target = TARGET,
            event_code,
            registrants = reg_codes.len(),
            "hydrating registrants concurrently"
        );

        let handles = reg_codes.iter().map(|reg_code| {
            let service = self.clone();
            let event_code = event_code.to_string();
            let reg_code = reg_code.clone();
            tokio::spawn(async move { service.hydrate_entity(&event_code, &reg_code).await })
        });
        let joined = join_all(handles).await;

        let results = reg_codes
            .into_iter()
            .zip(joined)
            .map(|(entity_id, joined)| {
                let status = match joined {
                    Ok(report) if report.has_failures() => EntityStatus::Failed {
                        error: describe_failures(&report),
                    },
                    Ok(report) => EntityStatus::Hydrated { details: report },
                    Err(err) => EntityStatus::Failed {
                        error: format!("hydration task aborted: {err}"),
                    },
                };
                EntityOutcome { entity_id, status }
            })
            .collect();

        let report = EventHydrationReport::completed(event_code, results);
        info!(target = TARGET, event_code, "event-wide hydration completed");
        report
    }

    async fn discover_registrants(&self, event_code: &str) -> Result<Vec<String>, String> {
        let identity = CacheIdentity::new(
            REGISTRATION_LIST_OBJECT,
            self.account_code.as_ref(),
            Some(event_code.to_string()),
            None,
            registrant_discovery_params(),
        )
        .map_err(|err| err.to_string())?;

        let payload = self
            .fetcher
            .fetch(&identity)
            .await
            .map_err(|err| format!("Failed to fetch registration list for event {event_code}: {err}"))?
            .ok_or_else(|| format!("Failed to fetch registration list for event {event_code}"))?;

        let mut seen = HashSet::new();
        Ok(registrant_codes(&payload)
            .into_iter()
            .filter(|code| seen.insert(code.clone()))
            .collect())
    }

    /// Clear every cached row of `event_code`, then rehydrate the event.
    ///
    /// Deletion completes before hydration starts, so lookups issued in
    /// between observe a miss rather than pre-reset data.
    pub async fn reset_event(&self, event_code: &str) -> Result<ResetReport, RepoError> {
        let event_clear_result = self.maintenance.sweep_event(event_code).await?;
        let event_hydration_result = self.hydrate_event(event_code).await;

        Ok(ResetReport {
            event_clear_result,
            event_hydration_result,
        })
    }
}

fn describe_failures(report: &EntityHydrationReport) -> String {
    report
        .failures()
        .map(|outcome| {
            let error = match &outcome.status {
                SubRequestStatus::Failed { error } => error.as_str(),
                _ => "",
            };
            format!(
                "{} {}: {}",
                outcome.request.object,
                outcome.request.query_params.canonical(),
                error
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
