use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::error::{errors, OperationContext, SyncResult};
use crate::recovery::{Recoverable, RecoveryManager, RecoveryResult};

/// Primary contact of an account, as the account management API models it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInformation {
    pub address_line1: String,
    pub city: String,
    pub country_code: String,
    pub full_name: String,
    pub phone_number: String,
    pub postal_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district_or_county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_or_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
}

impl ContactInformation {
    /// Reject contacts with a blank required field
    pub fn validate(&self) -> SyncResult<()> {
        let required = [
            ("address_line1", &self.address_line1),
            ("city", &self.city),
            ("country_code", &self.country_code),
            ("full_name", &self.full_name),
            ("phone_number", &self.phone_number),
            ("postal_code", &self.postal_code),
        ];

        match required.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(errors::invalid_input(format!("{} cannot be empty", field))),
            None => Ok(()),
        }
    }
}

/// Which alternate contact slot of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlternateContactType {
    #[serde(alias = "billing")]
    Billing,
    #[serde(alias = "operations")]
    Operations,
    #[serde(alias = "security")]
    Security,
}

impl AlternateContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Billing => "BILLING",
            Self::Operations => "OPERATIONS",
            Self::Security => "SECURITY",
        }
    }
}

impl fmt::Display for AlternateContactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing, operations or security contact of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateContact {
    pub contact_type: AlternateContactType,
    pub email_address: String,
    pub name: String,
    pub phone_number: String,
    pub title: String,
}

impl AlternateContact {
    pub fn validate(&self) -> SyncResult<()> {
        let required = [
            ("email_address", &self.email_address),
            ("name", &self.name),
            ("phone_number", &self.phone_number),
            ("title", &self.title),
        ];

        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(errors::invalid_input(format!("{} cannot be empty", field)));
        }
        if !self.email_address.contains('@') {
            return Err(errors::invalid_input("email_address must contain @"));
        }
        Ok(())
    }
}

/// Kind of contact a sync request targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    #[default]
    #[serde(alias = "PRIMARY")]
    Primary,
    #[serde(alias = "BILLING")]
    Billing,
    #[serde(alias = "OPERATIONS")]
    Operations,
    #[serde(alias = "SECURITY")]
    Security,
}

impl ContactType {
    /// The alternate contact slot, `None` for the primary contact
    pub fn alternate(self) -> Option<AlternateContactType> {
        match self {
            Self::Primary => None,
            Self::Billing => Some(AlternateContactType::Billing),
            Self::Operations => Some(AlternateContactType::Operations),
            Self::Security => Some(AlternateContactType::Security),
        }
    }
}

impl From<AlternateContactType> for ContactType {
    fn from(contact_type: AlternateContactType) -> Self {
        match contact_type {
            AlternateContactType::Billing => Self::Billing,
            AlternateContactType::Operations => Self::Operations,
            AlternateContactType::Security => Self::Security,
        }
    }
}

/// Either kind of contact payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContactDetails {
    Primary(ContactInformation),
    Alternate(AlternateContact),
}

impl ContactDetails {
    pub fn contact_type(&self) -> ContactType {
        match self {
            Self::Primary(_) => ContactType::Primary,
            Self::Alternate(contact) => contact.contact_type.into(),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        match self {
            Self::Primary(contact) => contact.validate(),
            Self::Alternate(contact) => contact.validate(),
        }
    }
}

impl From<ContactInformation> for ContactDetails {
    fn from(contact: ContactInformation) -> Self {
        Self::Primary(contact)
    }
}

impl From<AlternateContact> for ContactDetails {
    fn from(contact: AlternateContact) -> Self {
        Self::Alternate(contact)
    }
}

/// Contact operations of the account management API.
///
/// `None` for the account means the caller's own account.
pub trait AccountContactApi: Send + Sync {
    fn get_contact_information(&self, account_id: Option<&str>) -> SyncResult<ContactInformation>;

    fn put_contact_information(
        &self,
        contact: &ContactInformation,
        account_id: Option<&str>,
    ) -> SyncResult<()>;

    fn get_alternate_contact(
        &self,
        contact_type: AlternateContactType,
        account_id: Option<&str>,
    ) -> SyncResult<AlternateContact>;

    fn put_alternate_contact(&self, contact: &AlternateContact, account_id: Option<&str>) -> SyncResult<()>;
}

fn operation_name(operation: &str, account_id: Option<&str>) -> String {
    format!("{}_{}", operation, account_id.unwrap_or("current"))
}

fn operation_context(operation: &str, account_id: Option<&str>) -> OperationContext {
    OperationContext::new()
        .with("account_id", account_id.unwrap_or("current"))
        .with("operation", operation)
}

fn alternate_operation_name(
    operation: &str,
    contact_type: AlternateContactType,
    account_id: Option<&str>,
) -> String {
    operation_name(&format!("{}_{}", operation, contact_type), account_id)
}

fn alternate_operation_context(
    operation: &str,
    contact_type: AlternateContactType,
    account_id: Option<&str>,
) -> OperationContext {
    operation_context(operation, account_id).with("contact_type", contact_type.as_str())
}

/// Routes every call of an [`AccountContactApi`] through a recovery manager,
/// one circuit breaker per operation and account
#[derive(Debug, Clone)]
pub struct ResilientAccountClient<A> {
    api: A,
    recovery: RecoveryManager,
}

impl<A: AccountContactApi> ResilientAccountClient<A> {
    pub fn new(api: A, recovery: RecoveryManager) -> Self {
        Self { api, recovery }
    }

    pub fn inner(&self) -> &A {
        &self.api
    }

    /// Write `contact` under recovery and keep the full attempt history.
    /// The contact is not validated here.
    pub fn put_with_recovery(
        &self,
        contact: &ContactInformation,
        account_id: Option<&str>,
    ) -> RecoveryResult<()> {
        let name = operation_name("put_contact_information", account_id);
        let context = operation_context("put_contact_information", account_id);

        self.recovery.execute_with_recovery(
            &name,
            || self.api.put_contact_information(contact, account_id),
            Some(&context),
        )
    }

    /// Alternate-contact counterpart of [`Self::put_with_recovery`]
    pub fn put_alternate_with_recovery(
        &self,
        contact: &AlternateContact,
        account_id: Option<&str>,
    ) -> RecoveryResult<()> {
        let name = alternate_operation_name("put_alternate_contact", contact.contact_type, account_id);
        let context = alternate_operation_context("put_alternate_contact", contact.contact_type, account_id);

        self.recovery.execute_with_recovery(
            &name,
            || self.api.put_alternate_contact(contact, account_id),
            Some(&context),
        )
    }
}

impl<A> Recoverable for ResilientAccountClient<A> {
    fn recovery_manager(&self) -> &RecoveryManager {
        &self.recovery
    }
}

impl<A: AccountContactApi> AccountContactApi for ResilientAccountClient<A> {
    fn get_contact_information(&self, account_id: Option<&str>) -> SyncResult<ContactInformation> {
        let name = operation_name("get_contact_information", account_id);
        let context = operation_context("get_contact_information", account_id);

        debug!(operation = %name, "Retrieving contact information");
        self.protected_operation(&name, || self.api.get_contact_information(account_id), &context)
    }

    fn put_contact_information(
        &self,
        contact: &ContactInformation,
        account_id: Option<&str>,
    ) -> SyncResult<()> {
        contact.validate()?;
        self.put_with_recovery(contact, account_id).into_result()?;

        info!(account_id = account_id.unwrap_or("current"), "Updated contact information");
        Ok(())
    }

    fn get_alternate_contact(
        &self,
        contact_type: AlternateContactType,
        account_id: Option<&str>,
    ) -> SyncResult<AlternateContact> {
        let name = alternate_operation_name("get_alternate_contact", contact_type, account_id);
        let context = alternate_operation_context("get_alternate_contact", contact_type, account_id);

        debug!(operation = %name, "Retrieving alternate contact");
        self.protected_operation(
            &name,
            || self.api.get_alternate_contact(contact_type, account_id),
            &context,
        )
    }

    fn put_alternate_contact(&self, contact: &AlternateContact, account_id: Option<&str>) -> SyncResult<()> {
        contact.validate()?;
        self.put_alternate_with_recovery(contact, account_id).into_result()?;

        info!(
            account_id = account_id.unwrap_or("current"),
            contact_type = %contact.contact_type,
            "Updated alternate contact"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::SyncError;
    use crate::recovery::RecoveryConfig;
    use crate::registry::CircuitBreakerRegistry;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    pub(crate) fn sample_alternate(contact_type: AlternateContactType) -> AlternateContact {
        AlternateContact {
            contact_type,
            email_address: "billing@example.com".to_string(),
            name: "Richard Roe".to_string(),
            phone_number: "+1-206-555-0199".to_string(),
            title: "Finance Lead".to_string(),
        }
    }

    pub(crate) fn sample_contact() -> ContactInformation {
        ContactInformation {
            address_line1: "410 Terry Ave N".to_string(),
            city: "Seattle".to_string(),
            country_code: "US".to_string(),
            full_name: "Jane Doe".to_string(),
            phone_number: "+1-206-555-0100".to_string(),
            postal_code: "98109".to_string(),
            address_line2: None,
            address_line3: None,
            company_name: Some("Example Corp".to_string()),
            district_or_county: None,
            state_or_region: Some("WA".to_string()),
            website_url: None,
        }
    }

    /// In-memory API with scripted failures per operation name
    #[derive(Default)]
    pub(crate) struct FakeContactApi {
        pub contacts: Mutex<HashMap<String, ContactInformation>>,
        pub alternates: Mutex<HashMap<(String, AlternateContactType), AlternateContact>>,
        pub failures: Mutex<HashMap<String, VecDeque<SyncError>>>,
        pub puts: Mutex<Vec<String>>,
    }

    impl FakeContactApi {
        pub(crate) fn with_contact(self, account_id: &str, contact: ContactInformation) -> Self {
            self.contacts
                .lock()
                .unwrap()
                .insert(account_id.to_string(), contact);
            self
        }

        pub(crate) fn fail(self, operation: &str, error: SyncError, times: usize) -> Self {
            self.failures
                .lock()
                .unwrap()
                .entry(operation.to_string())
                .or_default()
                .extend(std::iter::repeat(error).take(times));
            self
        }

        pub(crate) fn with_alternate(self, account_id: &str, contact: AlternateContact) -> Self {
            self.alternates
                .lock()
                .unwrap()
                .insert((account_id.to_string(), contact.contact_type), contact);
            self
        }

        fn next_failure(&self, operation: &str) -> Option<SyncError> {
            self.failures
                .lock()
                .unwrap()
                .get_mut(operation)
                .and_then(|queue| queue.pop_front())
        }
    }

    impl AccountContactApi for FakeContactApi {
        fn get_contact_information(&self, account_id: Option<&str>) -> SyncResult<ContactInformation> {
            let account = account_id.unwrap_or("current");
            if let Some(err) = self.next_failure(&operation_name("get_contact_information", account_id)) {
                return Err(err);
            }
            self.contacts
                .lock()
                .unwrap()
                .get(account)
                .cloned()
                .ok_or_else(|| errors::service("ResourceNotFoundException", "no contact"))
        }

        fn put_contact_information(
            &self,
            contact: &ContactInformation,
            account_id: Option<&str>,
        ) -> SyncResult<()> {
            let account = account_id.unwrap_or("current");
            if let Some(err) = self.next_failure(&operation_name("put_contact_information", account_id)) {
                return Err(err);
            }
            self.puts.lock().unwrap().push(account.to_string());
            self.contacts
                .lock()
                .unwrap()
                .insert(account.to_string(), contact.clone());
            Ok(())
        }

        fn get_alternate_contact(
            &self,
            contact_type: AlternateContactType,
            account_id: Option<&str>,
        ) -> SyncResult<AlternateContact> {
            let account = account_id.unwrap_or("current");
            let name = alternate_operation_name("get_alternate_contact", contact_type, account_id);
            if let Some(err) = self.next_failure(&name) {
                return Err(err);
            }
            self.alternates
                .lock()
                .unwrap()
                .get(&(account.to_string(), contact_type))
                .cloned()
                .ok_or_else(|| errors::service("ResourceNotFoundException", "no alternate contact"))
        }

        fn put_alternate_contact(&self, contact: &AlternateContact, account_id: Option<&str>) -> SyncResult<()> {
            let account = account_id.unwrap_or("current");
            let name = alternate_operation_name("put_alternate_contact", contact.contact_type, account_id);
            if let Some(err) = self.next_failure(&name) {
                return Err(err);
            }
            self.puts.lock().unwrap().push(account.to_string());
            self.alternates
                .lock()
                .unwrap()
                .insert((account.to_string(), contact.contact_type), contact.clone());
            Ok(())
        }
    }

    pub(crate) fn quick_recovery(attempts: u32) -> RecoveryManager {
        let config = RecoveryConfig {
            max_retry_attempts: attempts,
            base_retry_delay_seconds: 0.01,
            max_retry_delay_seconds: 0.05,
            jitter_factor: 0.1,
            circuit_breaker_enabled: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_seconds: 60.0,
            enable_exponential_backoff: true,
            enable_jitter: false,
        };
        RecoveryManager::new(config, Arc::new(CircuitBreakerRegistry::new())).with_sleep(|_| {})
    }

    #[test]
    fn test_validate_rejects_blank_required_field() {
        let mut contact = sample_contact();
        assert!(contact.validate().is_ok());

        contact.city = "   ".to_string();
        assert_eq!(
            contact.validate(),
            Err(errors::invalid_input("city cannot be empty"))
        );
    }

    #[test]
    fn test_contact_serde_skips_absent_optionals() {
        let json = serde_json::to_value(sample_contact()).unwrap();
        assert_eq!(json["company_name"], "Example Corp");
        assert!(json.get("address_line2").is_none());

        let parsed: ContactInformation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, sample_contact());
    }

    #[test]
    fn test_resilient_get_retries_throttling() {
        let api = FakeContactApi::default()
            .with_contact("111111111111", sample_contact())
            .fail(
                "get_contact_information_111111111111",
                errors::throttled("Rate exceeded"),
                2,
            );
        let client = ResilientAccountClient::new(api, quick_recovery(3));

        let contact = client.get_contact_information(Some("111111111111")).unwrap();
        assert_eq!(contact, sample_contact());

        let breakers = client.recovery_manager().circuit_breakers();
        let breaker = breakers
            .get("get_contact_information_111111111111")
            .expect("breaker created per account");
        assert_eq!(breaker.stats().failed_requests, 2);
        assert_eq!(breaker.stats().successful_requests, 1);
    }

    #[test]
    fn test_resilient_put_surfaces_final_error() {
        let api = FakeContactApi::default().fail(
            "put_contact_information_222222222222",
            errors::access_denied("denied"),
            5,
        );
        let client = ResilientAccountClient::new(api, quick_recovery(3));

        let err = client
            .put_contact_information(&sample_contact(), Some("222222222222"))
            .unwrap_err();
        assert_eq!(err.code(), "AccessDeniedException");
        assert!(client.inner().puts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resilient_put_validates_before_calling() {
        let client = ResilientAccountClient::new(FakeContactApi::default(), quick_recovery(3));
        let mut contact = sample_contact();
        contact.full_name.clear();

        let err = client.put_contact_information(&contact, None).unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        assert!(client.recovery_manager().circuit_breakers().is_empty());
    }

    #[test]
    fn test_breakers_use_registry_defaults() {
        let defaults = CircuitBreakerConfig::default().with_success_threshold(1);
        let registry = Arc::new(CircuitBreakerRegistry::with_default_config(defaults));
        let recovery = RecoveryManager::new(quick_recovery(3).config().clone(), registry).with_sleep(|_| {});
        let api = FakeContactApi::default().with_contact("444444444444", sample_contact());
        let client = ResilientAccountClient::new(api, recovery);

        client.get_contact_information(Some("444444444444")).unwrap();

        let breaker = client
            .recovery_manager()
            .circuit_breakers()
            .get("get_contact_information_444444444444")
            .unwrap();
        assert_eq!(breaker.config().success_threshold, 1);
        assert_eq!(breaker.config().failure_threshold, 5);
    }

    #[test]
    fn test_alternate_contact_validation() {
        let mut contact = sample_alternate(AlternateContactType::Security);
        assert!(contact.validate().is_ok());

        contact.email_address = "security.example.com".to_string();
        assert_eq!(
            contact.validate(),
            Err(errors::invalid_input("email_address must contain @"))
        );

        contact.title = " ".to_string();
        assert_eq!(contact.validate(), Err(errors::invalid_input("title cannot be empty")));
    }

    #[test]
    fn test_alternate_contact_serde() {
        let json = serde_json::to_value(sample_alternate(AlternateContactType::Billing)).unwrap();
        assert_eq!(json["contact_type"], "BILLING");

        let parsed: AlternateContactType = serde_json::from_str("\"operations\"").unwrap();
        assert_eq!(parsed, AlternateContactType::Operations);

        let details: ContactDetails = serde_json::from_value(json).unwrap();
        assert_eq!(details.contact_type(), ContactType::Billing);
        let details: ContactDetails = serde_json::from_value(serde_json::to_value(sample_contact()).unwrap()).unwrap();
        assert_eq!(details, ContactDetails::Primary(sample_contact()));
    }

    #[test]
    fn test_resilient_alternate_get_routes_per_type_and_account() {
        let api = FakeContactApi::default()
            .with_alternate("555555555555", sample_alternate(AlternateContactType::Billing))
            .fail(
                "get_alternate_contact_BILLING_555555555555",
                errors::throttled("Rate exceeded"),
                1,
            );
        let client = ResilientAccountClient::new(api, quick_recovery(3));

        let contact = client
            .get_alternate_contact(AlternateContactType::Billing, Some("555555555555"))
            .unwrap();
        assert_eq!(contact, sample_alternate(AlternateContactType::Billing));

        let missing = client
            .get_alternate_contact(AlternateContactType::Security, Some("555555555555"))
            .unwrap_err();
        assert_eq!(missing.code(), "ResourceNotFoundException");

        let breakers = client.recovery_manager().circuit_breakers();
        assert_eq!(
            breakers.names(),
            vec![
                "get_alternate_contact_BILLING_555555555555".to_string(),
                "get_alternate_contact_SECURITY_555555555555".to_string(),
            ]
        );
        let billing = breakers.get("get_alternate_contact_BILLING_555555555555").unwrap();
        assert_eq!(billing.stats().failed_requests, 1);
        assert_eq!(billing.stats().successful_requests, 1);
    }

    #[test]
    fn test_resilient_alternate_put() {
        let client = ResilientAccountClient::new(FakeContactApi::default(), quick_recovery(3));
        let contact = sample_alternate(AlternateContactType::Operations);

        client.put_alternate_contact(&contact, None).unwrap();
        assert_eq!(
            client
                .inner()
                .alternates
                .lock()
                .unwrap()
                .get(&("current".to_string(), AlternateContactType::Operations)),
            Some(&contact)
        );
        assert!(client
            .recovery_manager()
            .circuit_breakers()
            .get("put_alternate_contact_OPERATIONS_current")
            .is_some());

        let mut invalid = contact;
        invalid.name.clear();
        assert!(matches!(
            client.put_alternate_contact(&invalid, Some("666666666666")),
            Err(SyncError::InvalidInput(_))
        ));
    }
}
