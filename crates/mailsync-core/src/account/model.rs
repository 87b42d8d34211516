//! Account model types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mailsync_imap::SessionConfig;
use mailsync_smtp::SubmitConfig;
use serde::{Deserialize, Serialize};

/// Unique identifier for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Create a new account ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Security/encryption mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No encryption. Only for local test servers.
    None,
    /// Implicit TLS (connect directly with TLS).
    #[default]
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

impl From<Security> for mailsync_imap::Security {
    fn from(security: Security) -> Self {
        match security {
            Security::None => Self::None,
            Security::Tls => Self::Implicit,
            Security::StartTls => Self::StartTls,
        }
    }
}

impl From<Security> for mailsync_smtp::Security {
    fn from(security: Security) -> Self {
        match security {
            Security::None => Self::None,
            Security::Tls => Self::Implicit,
            Security::StartTls => Self::StartTls,
        }
    }
}

/// IMAP server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Server hostname.
    pub host: String,
    /// Server port (default: 993 for TLS, 143 otherwise).
    #[serde(default)]
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: Security,
}

impl ImapConfig {
    /// Get default port for the security mode.
    #[must_use]
    pub const fn default_port(security: Security) -> u16 {
        match security {
            Security::None | Security::StartTls => 143,
            Security::Tls => 993,
        }
    }
}

/// SMTP server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Server hostname.
    pub host: String,
    /// Server port (default: 465 for TLS, 587 for STARTTLS).
    #[serde(default)]
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: Security,
}

impl SmtpConfig {
    /// Get default port for the security mode.
    #[must_use]
    pub const fn default_port(security: Security) -> u16 {
        match security {
            Security::None => 25,
            Security::StartTls => 587,
            Security::Tls => 465,
        }
    }
}

/// Whether an account takes part in scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Selected by the scheduler.
    #[default]
    Active,
    /// Ignored by the scheduler.
    Disabled,
}

impl AccountStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    /// Parses a column value; unknown values count as disabled.
    #[must_use]
    pub fn from_column(value: &str) -> Self {
        if value == "active" {
            Self::Active
        } else {
            Self::Disabled
        }
    }
}

/// Whether a worker currently owns the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimState {
    /// Free to be claimed.
    #[default]
    Idle,
    /// Held by exactly one worker.
    Claimed,
}

impl ClaimState {
    /// Column value.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Idle => 0,
            Self::Claimed => 1,
        }
    }

    /// Parses a column value.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        if code == 1 { Self::Claimed } else { Self::Idle }
    }
}

/// A mail account as stored.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    /// Unique identifier.
    pub id: AccountId,
    /// Mailbox address, also the sender address.
    pub address: String,
    /// Login name for both servers.
    pub username: String,
    /// Password for both servers.
    pub password: String,
    /// Incoming server.
    pub imap: ImapConfig,
    /// Outgoing server.
    pub smtp: SmtpConfig,
    /// Shard the account belongs to.
    pub node: i64,
    /// Scheduling status.
    pub status: AccountStatus,
    /// Claim state.
    pub claim_state: ClaimState,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last successful list phase.
    pub last_list_sync_time: Option<DateTime<Utc>>,
    /// Last completed content cycle; scheduling order key.
    pub last_content_sync_time: Option<DateTime<Utc>>,
}

impl Account {
    /// Builds the IMAP session settings for this account.
    #[must_use]
    pub fn session_config(
        &self,
        mailbox: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> SessionConfig {
        let transport = mailsync_imap::Config::builder(&self.imap.host)
            .port(self.imap.port)
            .security(self.imap.security.into())
            .connect_timeout(connect_timeout)
            .io_timeout(io_timeout)
            .build();
        SessionConfig::new(&self.imap.host, self.imap.port)
            .transport(transport)
            .credentials(&self.username, &self.password)
            .mailbox(mailbox)
    }

    /// Builds the SMTP submission settings for this account.
    #[must_use]
    pub fn submit_config(&self, connect_timeout: Duration, io_timeout: Duration) -> SubmitConfig {
        SubmitConfig::new(&self.smtp.host, self.smtp.port)
            .security(self.smtp.security.into())
            .credentials(&self.username, &self.password)
            .timeouts(connect_timeout, io_timeout)
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("imap", &self.imap)
            .field("node", &self.node)
            .field("status", &self.status)
            .field("claim_state", &self.claim_state)
            .field("last_content_sync_time", &self.last_content_sync_time)
            .finish_non_exhaustive()
    }
}

/// Account definition from configuration, upserted by address.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountSeed {
    /// Mailbox address.
    pub address: String,
    /// Login name; defaults to the address.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for both servers.
    pub password: String,
    /// Incoming server; filled in for well-known providers when absent.
    #[serde(default)]
    pub imap: Option<ImapConfig>,
    /// Outgoing server; filled in for well-known providers when absent.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Shard.
    #[serde(default)]
    pub node: i64,
    /// Scheduling status.
    #[serde(default)]
    pub status: AccountStatus,
}

impl AccountSeed {
    /// Creates a seed with provider defaults derived from the address.
    #[must_use]
    pub fn with_email(address: &str, password: &str) -> Self {
        Self {
            address: address.to_string(),
            password: password.to_string(),
            ..Self::default()
        }
    }

    /// Returns the login name.
    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.address)
    }

    /// Returns server settings, falling back to the provider table and
    /// filling in default ports.
    #[must_use]
    pub fn servers(&self) -> Option<(ImapConfig, SmtpConfig)> {
        let known = self
            .address
            .split('@')
            .nth(1)
            .and_then(|domain| known_provider(&domain.to_lowercase()));

        let mut imap = self.imap.clone().or_else(|| known.clone().map(|k| k.0))?;
        let mut smtp = self.smtp.clone().or_else(|| known.map(|k| k.1))?;
        if imap.port == 0 {
            imap.port = ImapConfig::default_port(imap.security);
        }
        if smtp.port == 0 {
            smtp.port = SmtpConfig::default_port(smtp.security);
        }
        Some((imap, smtp))
    }
}

impl std::fmt::Debug for AccountSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSeed")
            .field("address", &self.address)
            .field("imap", &self.imap)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

fn known_provider(domain: &str) -> Option<(ImapConfig, SmtpConfig)> {
    let (imap, smtp, smtp_security) = match domain {
        "gmail.com" | "googlemail.com" => ("imap.gmail.com", "smtp.gmail.com", Security::Tls),
        "outlook.com" | "hotmail.com" | "live.com" => {
            ("outlook.office365.com", "smtp.office365.com", Security::StartTls)
        }
        "yahoo.com" | "ymail.com" => ("imap.mail.yahoo.com", "smtp.mail.yahoo.com", Security::Tls),
        "icloud.com" | "me.com" | "mac.com" => {
            ("imap.mail.me.com", "smtp.mail.me.com", Security::StartTls)
        }
        "qq.com" | "foxmail.com" => ("imap.qq.com", "smtp.qq.com", Security::Tls),
        "163.com" => ("imap.163.com", "smtp.163.com", Security::Tls),
        _ => return None,
    };
    Some((
        ImapConfig {
            host: imap.to_string(),
            port: 993,
            security: Security::Tls,
        },
        SmtpConfig {
            host: smtp.to_string(),
            port: SmtpConfig::default_port(smtp_security),
            security: smtp_security,
        },
    ))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    mod account_id_tests {
        use super::*;

        #[test]
        fn display() {
            let id = AccountId::new(123);
            assert_eq!(format!("{id}"), "123");
        }

        #[test]
        fn ordering() {
            assert!(AccountId::new(1) < AccountId::new(2));
        }
    }

    mod security_tests {
        use super::*;

        #[test]
        fn default_is_tls() {
            assert_eq!(Security::default(), Security::Tls);
        }

        #[test]
        fn maps_onto_protocol_crates() {
            assert_eq!(
                mailsync_imap::Security::from(Security::Tls),
                mailsync_imap::Security::Implicit
            );
            assert_eq!(
                mailsync_smtp::Security::from(Security::StartTls),
                mailsync_smtp::Security::StartTls
            );
        }

        #[test]
        fn deserializes_lowercase() {
            let security: Security = serde_json::from_str("\"starttls\"").unwrap();
            assert_eq!(security, Security::StartTls);
        }
    }

    mod port_tests {
        use super::*;

        #[test]
        fn imap_default_ports() {
            assert_eq!(ImapConfig::default_port(Security::Tls), 993);
            assert_eq!(ImapConfig::default_port(Security::StartTls), 143);
            assert_eq!(ImapConfig::default_port(Security::None), 143);
        }

        #[test]
        fn smtp_default_ports() {
            assert_eq!(SmtpConfig::default_port(Security::Tls), 465);
            assert_eq!(SmtpConfig::default_port(Security::StartTls), 587);
            assert_eq!(SmtpConfig::default_port(Security::None), 25);
        }
    }

    mod seed_tests {
        use super::*;

        #[test]
        fn gmail_defaults() {
            let seed = AccountSeed::with_email("user@gmail.com", "pw");
            let (imap, smtp) = seed.servers().unwrap();
            assert_eq!(imap.host, "imap.gmail.com");
            assert_eq!(imap.port, 993);
            assert_eq!(smtp.host, "smtp.gmail.com");
            assert_eq!(smtp.port, 465);
            assert_eq!(seed.username(), "user@gmail.com");
        }

        #[test]
        fn outlook_uses_starttls_for_smtp() {
            let seed = AccountSeed::with_email("user@Outlook.com", "pw");
            let (_, smtp) = seed.servers().unwrap();
            assert_eq!(smtp.security, Security::StartTls);
            assert_eq!(smtp.port, 587);
        }

        #[test]
        fn unknown_domain_needs_explicit_servers() {
            let mut seed = AccountSeed::with_email("user@example.org", "pw");
            assert!(seed.servers().is_none());

            seed.imap = Some(ImapConfig {
                host: "imap.example.org".into(),
                port: 0,
                security: Security::StartTls,
            });
            seed.smtp = Some(SmtpConfig {
                host: "smtp.example.org".into(),
                port: 2525,
                security: Security::None,
            });
            let (imap, smtp) = seed.servers().unwrap();
            assert_eq!(imap.port, 143);
            assert_eq!(smtp.port, 2525);
        }

        #[test]
        fn seed_from_json() {
            let seed: AccountSeed = serde_json::from_str(
                r#"{"address":"a@example.org","password":"pw","node":3,
                    "imap":{"host":"imap.example.org"},
                    "smtp":{"host":"smtp.example.org","security":"starttls"}}"#,
            )
            .unwrap();
            assert_eq!(seed.node, 3);
            assert_eq!(seed.status, AccountStatus::Active);
            let (imap, smtp) = seed.servers().unwrap();
            assert_eq!(imap.port, 993);
            assert_eq!(smtp.port, 587);
        }

        #[test]
        fn debug_hides_password() {
            let seed = AccountSeed::with_email("user@gmail.com", "hunter2");
            assert!(!format!("{seed:?}").contains("hunter2"));
        }
    }

    mod account_tests {
        use super::*;

        fn account() -> Account {
            Account {
                id: AccountId::new(1),
                address: "user@example.org".into(),
                username: "user".into(),
                password: "hunter2".into(),
                imap: ImapConfig {
                    host: "imap.example.org".into(),
                    port: 993,
                    security: Security::Tls,
                },
                smtp: SmtpConfig {
                    host: "smtp.example.org".into(),
                    port: 587,
                    security: Security::StartTls,
                },
                node: 0,
                status: AccountStatus::Active,
                claim_state: ClaimState::Idle,
                claimed_at: None,
                last_list_sync_time: None,
                last_content_sync_time: None,
            }
        }

        #[test]
        fn session_config_carries_settings() {
            let config = account().session_config(
                "Archive",
                Duration::from_secs(10),
                Duration::from_secs(20),
            );
            assert_eq!(config.transport.host, "imap.example.org");
            assert_eq!(config.transport.security, mailsync_imap::Security::Implicit);
            assert_eq!(config.transport.io_timeout, Duration::from_secs(20));
            assert_eq!(config.username, "user");
            assert_eq!(config.mailbox, "Archive");
        }

        #[test]
        fn submit_config_carries_settings() {
            let config = account().submit_config(Duration::from_secs(10), Duration::from_secs(20));
            assert_eq!(config.host, "smtp.example.org");
            assert_eq!(config.port, 587);
            assert_eq!(config.security, mailsync_smtp::Security::StartTls);
            assert_eq!(config.username, "user");
        }

        #[test]
        fn debug_hides_password() {
            assert!(!format!("{:?}", account()).contains("hunter2"));
        }

        #[test]
        fn claim_codes() {
            assert_eq!(ClaimState::from_code(ClaimState::Claimed.code()), ClaimState::Claimed);
            assert_eq!(ClaimState::from_code(0), ClaimState::Idle);
            assert_eq!(AccountStatus::from_column("active"), AccountStatus::Active);
            assert_eq!(AccountStatus::from_column("paused"), AccountStatus::Disabled);
        }
    }
}
