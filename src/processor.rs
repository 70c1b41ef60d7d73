use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::accounts::{AccountContactApi, ContactDetails, ContactType, ResilientAccountClient};
use crate::classifier::Classification;
use crate::error::{ErrorCategory, SyncError, SyncResult};
use crate::recovery::{Recoverable, RecoveryResult};

/// Which accounts a batch may touch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Source of the contact; never updated by a batch
    #[serde(default = "default_management_account_id")]
    pub management_account_id: Option<String>,
    #[serde(default = "default_excluded_accounts")]
    pub excluded_accounts: Vec<String>,
}

fn default_management_account_id() -> Option<String> {
    std::env::var("CONTACT_SYNC_MANAGEMENT_ACCOUNT_ID")
        .ok()
        .filter(|id| !id.trim().is_empty())
}

fn default_excluded_accounts() -> Vec<String> {
    std::env::var("CONTACT_SYNC_EXCLUDED_ACCOUNTS")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ProcessorConfig {
    /// Load from the environment
    pub fn from_env() -> Self {
        Self {
            management_account_id: default_management_account_id(),
            excluded_accounts: default_excluded_accounts(),
        }
    }

    pub fn is_excluded(&self, account_id: &str) -> bool {
        self.management_account_id.as_deref() == Some(account_id)
            || self.excluded_accounts.iter().any(|id| id == account_id)
    }
}

/// A request to propagate one contact to a set of member accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdateRequest {
    #[serde(default)]
    pub sync_id: Option<String>,
    pub account_ids: Vec<String>,
    /// Primary unless the request targets an alternate contact
    #[serde(default)]
    pub contact_type: ContactType,
    pub contact: ContactDetails,
    #[serde(default)]
    pub initiating_user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSyncStatus {
    Success,
    /// Contact was already up to date
    Skipped,
    Failed,
}

/// Outcome for one account in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSyncResult {
    pub account_id: String,
    pub status: AccountSyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Write attempts made; 0 when skipped
    pub attempts: u32,
    /// Whether the failure should reach an operator
    #[serde(default)]
    pub notify: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Response returned at the function boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
    pub message: String,
    pub summary: BatchSummary,
    pub results: Vec<AccountSyncResult>,
}

impl HandlerResponse {
    fn bad_request(sync_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status_code: 400,
            sync_id,
            message: message.into(),
            summary: BatchSummary::default(),
            results: Vec::new(),
        }
    }
}

/// Applies a contact to many accounts, each independently and resiliently
pub struct AccountProcessor<A> {
    client: ResilientAccountClient<A>,
    config: ProcessorConfig,
}

impl<A: AccountContactApi> AccountProcessor<A> {
    pub fn new(client: ResilientAccountClient<A>, config: ProcessorConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &ResilientAccountClient<A> {
        &self.client
    }

    /// Entry point for a raw JSON event
    pub fn handle_event(&self, event: &serde_json::Value) -> HandlerResponse {
        match serde_json::from_value::<AccountUpdateRequest>(event.clone()) {
            Ok(request) => self.process_batch(&request),
            Err(e) => {
                error!(error = %e, "Rejected malformed account update event");
                HandlerResponse::bad_request(None, format!("Invalid request: {}", e))
            }
        }
    }

    /// Update every eligible account in `request`.
    ///
    /// A failing account never stops the batch; the status code reports
    /// whether all, some or none of the accounts made it.
    pub fn process_batch(&self, request: &AccountUpdateRequest) -> HandlerResponse {
        let sync_id = request
            .sync_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if request.contact.contact_type() != request.contact_type {
            error!(%sync_id, contact_type = ?request.contact_type, "Contact payload does not match contact type");
            return HandlerResponse::bad_request(
                Some(sync_id),
                format!("Contact payload is not a {:?} contact", request.contact_type),
            );
        }

        if let Err(e) = request.contact.validate() {
            error!(%sync_id, error = %e, "Rejected invalid contact");
            return HandlerResponse::bad_request(Some(sync_id), e.to_string());
        }

        let targets = self.target_accounts(&request.account_ids);
        if targets.is_empty() {
            warn!(%sync_id, requested = request.account_ids.len(), "No eligible target accounts");
            return HandlerResponse::bad_request(Some(sync_id), "No eligible target accounts");
        }

        info!(
            %sync_id,
            accounts = targets.len(),
            contact_type = ?request.contact_type,
            initiating_user = request.initiating_user.as_deref().unwrap_or("unknown"),
            "Starting contact sync batch"
        );

        let outcomes: Vec<(AccountSyncResult, Option<Classification>)> = targets
            .iter()
            .map(|account_id| self.process_account(account_id, &request.contact))
            .collect();

        let mut failures_per_category: HashMap<ErrorCategory, u32> = HashMap::new();
        for classification in outcomes.iter().filter_map(|(_, c)| c.as_ref()) {
            *failures_per_category.entry(classification.category).or_insert(0) += 1;
        }

        let classifier = self.client.recovery_manager().classifier();
        let results: Vec<AccountSyncResult> = outcomes
            .into_iter()
            .map(|(mut result, classification)| {
                if let Some(classification) = classification {
                    let count = failures_per_category
                        .get(&classification.category)
                        .copied()
                        .unwrap_or(0);
                    result.notify = classifier.should_notify(&classification, count);
                }
                result
            })
            .collect();

        let summary = BatchSummary {
            total: results.len(),
            succeeded: count_status(&results, AccountSyncStatus::Success),
            skipped: count_status(&results, AccountSyncStatus::Skipped),
            failed: count_status(&results, AccountSyncStatus::Failed),
        };

        let (status_code, message) = if summary.failed == 0 {
            (200, "All accounts processed successfully".to_string())
        } else if summary.failed < summary.total {
            (
                207,
                format!("{} of {} accounts failed", summary.failed, summary.total),
            )
        } else {
            (500, "All accounts failed".to_string())
        };

        info!(
            %sync_id,
            status_code,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Contact sync batch finished"
        );

        HandlerResponse {
            status_code,
            sync_id: Some(sync_id),
            message,
            summary,
            results,
        }
    }

    /// Requested accounts minus exclusions, deduplicated and sorted
    fn target_accounts(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .filter(|id| {
                let excluded = self.config.is_excluded(id);
                if excluded {
                    info!(account_id = %id, "Skipping excluded account");
                }
                !excluded
            })
            .map(String::from)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    #[instrument(skip(self, desired), level = "debug")]
    fn process_account(
        &self,
        account_id: &str,
        desired: &ContactDetails,
    ) -> (AccountSyncResult, Option<Classification>) {
        match self.current_contact(account_id, desired) {
            Ok(current) if &current == desired => {
                info!(account_id, "Contact information already up to date");
                return (
                    AccountSyncResult {
                        account_id: account_id.to_string(),
                        status: AccountSyncStatus::Skipped,
                        error_code: None,
                        error_message: None,
                        error_category: None,
                        attempts: 0,
                        notify: false,
                        timestamp: Utc::now(),
                    },
                    None,
                );
            }
            Ok(_) => info!(account_id, "Contact information differs, updating"),
            Err(e) => warn!(account_id, error = %e, "Could not read current contact, updating anyway"),
        }

        let outcome = self.write_contact(account_id, desired);
        let attempts = outcome.attempt_count() as u32;

        match outcome.into_result() {
            Ok(()) => {
                info!(account_id, attempts, "Updated contact information");
                (
                    AccountSyncResult {
                        account_id: account_id.to_string(),
                        status: AccountSyncStatus::Success,
                        error_code: None,
                        error_message: None,
                        error_category: None,
                        attempts,
                        notify: false,
                        timestamp: Utc::now(),
                    },
                    None,
                )
            }
            Err(e) => self.failed_result(account_id, attempts, e),
        }
    }

    /// Read the account's contact of the same kind as `desired`
    fn current_contact(&self, account_id: &str, desired: &ContactDetails) -> SyncResult<ContactDetails> {
        match desired {
            ContactDetails::Primary(_) => self
                .client
                .get_contact_information(Some(account_id))
                .map(ContactDetails::from),
            ContactDetails::Alternate(contact) => self
                .client
                .get_alternate_contact(contact.contact_type, Some(account_id))
                .map(ContactDetails::from),
        }
    }

    fn write_contact(&self, account_id: &str, desired: &ContactDetails) -> RecoveryResult<()> {
        match desired {
            ContactDetails::Primary(contact) => self.client.put_with_recovery(contact, Some(account_id)),
            ContactDetails::Alternate(contact) => {
                self.client.put_alternate_with_recovery(contact, Some(account_id))
            }
        }
    }

    fn failed_result(
        &self,
        account_id: &str,
        attempts: u32,
        error: SyncError,
    ) -> (AccountSyncResult, Option<Classification>) {
        let context = crate::error::OperationContext::new().with("account_id", account_id);
        let classification = self
            .client
            .recovery_manager()
            .classifier()
            .classify(&error, Some(&context));

        error!(
            account_id,
            attempts,
            error = %error,
            category = %classification.category,
            "Failed to update contact information"
        );

        (
            AccountSyncResult {
                account_id: account_id.to_string(),
                status: AccountSyncStatus::Failed,
                error_code: Some(error.code().to_string()),
                error_message: Some(error.to_string()),
                error_category: Some(classification.category),
                attempts,
                notify: false,
                timestamp: Utc::now(),
            },
            Some(classification),
        )
    }
}

fn count_status(results: &[AccountSyncResult], status: AccountSyncStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}
