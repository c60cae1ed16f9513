// =============================================================================
// Account Pool — leased credentials with cooldown and identity binding
// =============================================================================
//
// Dispenses login credentials to bots with exclusivity: an account is leased
// to at most one bot, and releasing it starts a cooldown before reuse
// (longer after a disconnect or error, so a flapping account does not get
// hammered).  At acquire time an in-game Identity (pilot + ship name) is
// loaded from the persisted record or generated fresh; the pair is stable
// for the life of the lease.
// =============================================================================

use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CharacterConfig;
use crate::errors::BotError;
use crate::names::NameGenerator;

// =============================================================================
// Types
// =============================================================================

/// Where an account came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSource {
    Generated,
    Persisted,
    Config,
    Pool,
}

/// How a lease ended; drives the cooldown length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed,
    Stopped,
    Disconnected,
    Error,
}

/// An active lease on one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub bot_id: String,
    pub leased_at: String,
    pub expires_at: String,
}

/// Derived in-game identity bound to an account for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub ship_name: String,
    pub created_at: String,
    pub account_id: String,
}

/// One set of credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub username: String,
    pub password: String,
    pub game_letter: String,
    pub source: AccountSource,
    #[serde(default)]
    pub use_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Persisted identity, reused across leases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Cooldown bookkeeping is process-local, not persisted.
    #[serde(skip)]
    pub cooldown_until: Option<Instant>,
}

/// What `acquire` hands back to a bot.
#[derive(Debug, Clone)]
pub struct LeasedAccount {
    pub account: Account,
    pub identity: Identity,
}

/// Pool counts for telemetry and the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub accounts_total: usize,
    pub leased: usize,
    pub available: usize,
    pub cooldown: usize,
}

// =============================================================================
// Pool
// =============================================================================

pub struct AccountPool {
    accounts: Mutex<Vec<Account>>,
    namegen: Mutex<NameGenerator>,
    character_config: CharacterConfig,
    lease_duration: Duration,
    cooldown_normal: Duration,
    cooldown_error: Duration,
    /// Accounts invented on demand when the pool runs dry.
    generate_on_demand: bool,
}

impl AccountPool {
    pub fn new(character_config: CharacterConfig, generate_on_demand: bool) -> Self {
        let namegen = NameGenerator::new(
            character_config.name_complexity,
            character_config.ship_names_with_numbers,
            character_config.name_seed,
        );
        Self {
            accounts: Mutex::new(Vec::new()),
            namegen: Mutex::new(namegen),
            character_config,
            lease_duration: Duration::from_secs(2 * 60 * 60),
            cooldown_normal: Duration::from_secs(30),
            cooldown_error: Duration::from_secs(5 * 60),
            generate_on_demand,
        }
    }

    /// Seed the pool with statically configured accounts.
    pub fn add_config_accounts(&self, accounts: Vec<(String, String, String)>) {
        let mut pool = self.accounts.lock();
        for (username, password, game_letter) in accounts {
            pool.push(Account {
                account_id: Uuid::new_v4().to_string(),
                username,
                password,
                game_letter,
                source: AccountSource::Config,
                use_count: 0,
                last_used_at: None,
                lease: None,
                identity: None,
                cooldown_until: None,
            });
        }
    }

    /// Load previously persisted accounts.
    pub fn add_persisted_accounts(&self, mut accounts: Vec<Account>) {
        let mut pool = self.accounts.lock();
        for account in &mut accounts {
            account.source = AccountSource::Persisted;
            account.lease = None;
            account.cooldown_until = None;
        }
        pool.extend(accounts);
    }

    fn generate_account(&self) -> Account {
        let mut namegen = self.namegen.lock();
        let name = namegen.pilot_name();
        let ship_name = if self.character_config.generate_ship_names {
            namegen.ship_name()
        } else {
            name.clone()
        };
        let password = self
            .character_config
            .password
            .clone()
            .unwrap_or_else(|| namegen.password(10));

        let account_id = Uuid::new_v4().to_string();
        Account {
            identity: Some(Identity {
                name: name.clone(),
                ship_name,
                created_at: Utc::now().to_rfc3339(),
                account_id: account_id.clone(),
            }),
            account_id,
            username: name,
            password,
            game_letter: "A".to_string(),
            source: AccountSource::Generated,
            use_count: 0,
            last_used_at: None,
            lease: None,
            cooldown_until: None,
        }
    }

    /// Lease an account to `bot_id`.  Picks the first account with no lease
    /// and an expired cooldown; generates a fresh one when allowed and none
    /// is available.
    pub fn acquire(&self, bot_id: &str) -> Result<LeasedAccount, BotError> {
        let now = Instant::now();
        let mut pool = self.accounts.lock();

        let index = pool.iter().position(|a| {
            a.lease.is_none() && a.cooldown_until.map(|t| t <= now).unwrap_or(true)
        });

        let index = match index {
            Some(i) => i,
            None if self.generate_on_demand => {
                let account = self.generate_account();
                pool.push(account);
                pool.len() - 1
            }
            None => {
                return Err(BotError::AccountUnavailable(format!(
                    "{} accounts, all leased or cooling down",
                    pool.len()
                )));
            }
        };

        let account = &mut pool[index];
        let leased_at = Utc::now();
        account.lease = Some(Lease {
            bot_id: bot_id.to_string(),
            leased_at: leased_at.to_rfc3339(),
            expires_at: (leased_at
                + chrono::Duration::from_std(self.lease_duration)
                    .expect("lease duration fits chrono range"))
            .to_rfc3339(),
        });
        account.use_count += 1;
        account.last_used_at = Some(leased_at.to_rfc3339());

        // Bind or create the identity; stable for the life of the lease.
        if account.identity.is_none() {
            let mut namegen = self.namegen.lock();
            let name = namegen.pilot_name();
            account.identity = Some(Identity {
                ship_name: if self.character_config.generate_ship_names {
                    namegen.ship_name()
                } else {
                    name.clone()
                },
                name,
                created_at: leased_at.to_rfc3339(),
                account_id: account.account_id.clone(),
            });
        }

        let leased = LeasedAccount {
            account: account.clone(),
            identity: account.identity.clone().expect("identity bound above"),
        };
        info!(
            bot_id,
            username = %leased.account.username,
            source = ?leased.account.source,
            "account leased"
        );
        Ok(leased)
    }

    /// Release the account leased by `bot_id` and start its cooldown.
    pub fn release(&self, bot_id: &str, outcome: ReleaseOutcome) {
        let cooldown = match outcome {
            ReleaseOutcome::Completed | ReleaseOutcome::Stopped => self.cooldown_normal,
            ReleaseOutcome::Disconnected | ReleaseOutcome::Error => self.cooldown_error,
        };

        let mut pool = self.accounts.lock();
        for account in pool.iter_mut() {
            if account
                .lease
                .as_ref()
                .map(|l| l.bot_id == bot_id)
                .unwrap_or(false)
            {
                account.lease = None;
                account.cooldown_until = Some(Instant::now() + cooldown);
                debug!(bot_id, username = %account.username, ?outcome, "account released");
            }
        }
    }

    /// Reclaim leases whose expiry has passed (crashed bots).
    pub fn reap_expired(&self) {
        let now = Utc::now();
        let mut pool = self.accounts.lock();
        for account in pool.iter_mut() {
            let expired = account
                .lease
                .as_ref()
                .and_then(|l| chrono::DateTime::parse_from_rfc3339(&l.expires_at).ok())
                .map(|t| t < now)
                .unwrap_or(false);
            if expired {
                info!(username = %account.username, "expired lease reclaimed");
                account.lease = None;
                account.cooldown_until = Some(Instant::now() + self.cooldown_error);
            }
        }
    }

    /// Conventional location of the character records file:
    /// `<root>/<namespace>/character_records.json`.
    pub fn records_path(root: &str, namespace: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(root)
            .join(namespace)
            .join("character_records.json")
    }

    /// Persist the full account roster (generated characters keep their
    /// credentials so they can log back in next session).
    pub fn save_records(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let pool = self.accounts.lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&*pool)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load previously saved characters into the pool.  Missing or
    /// unreadable files are simply an empty history.
    pub fn load_records(&self, path: &std::path::Path) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<Vec<Account>>(&content) {
            Ok(accounts) => {
                info!(count = accounts.len(), "character records loaded");
                self.add_persisted_accounts(accounts);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "character records unreadable");
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let pool = self.accounts.lock();
        let leased = pool.iter().filter(|a| a.lease.is_some()).count();
        let cooldown = pool
            .iter()
            .filter(|a| a.lease.is_none() && a.cooldown_until.map(|t| t > now).unwrap_or(false))
            .count();
        PoolStatus {
            accounts_total: pool.len(),
            leased,
            available: pool.len() - leased - cooldown,
            cooldown,
        }
    }

    /// Dashboard listing: everything except passwords.
    pub fn describe(&self) -> serde_json::Value {
        let pool = self.accounts.lock();
        let accounts: Vec<_> = pool
            .iter()
            .map(|a| {
                json!({
                    "account_id": a.account_id,
                    "username": a.username,
                    "game_letter": a.game_letter,
                    "source": a.source,
                    "use_count": a.use_count,
                    "last_used_at": a.last_used_at,
                    "leased_to": a.lease.as_ref().map(|l| l.bot_id.clone()),
                    "identity": a.identity.as_ref().map(|i| i.name.clone()),
                })
            })
            .collect();
        let identities_total = pool.iter().filter(|a| a.identity.is_some()).count();
        let identities_active = pool
            .iter()
            .filter(|a| a.identity.is_some() && a.lease.is_some())
            .count();
        json!({
            "pool": {
                "accounts_total": pool.len(),
                "accounts": accounts,
            },
            "identities": {
                "total": identities_total,
                "active": identities_active,
            },
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> AccountPool {
        let config = CharacterConfig {
            name_seed: Some(7),
            ..Default::default()
        };
        AccountPool::new(config, true)
    }

    #[test]
    fn acquire_generates_and_binds_identity() {
        let p = pool();
        let leased = p.acquire("bot-1").unwrap();
        assert_eq!(leased.account.source, AccountSource::Generated);
        assert_eq!(leased.identity.account_id, leased.account.account_id);
        assert!(!leased.identity.name.is_empty());
        assert!(!leased.identity.ship_name.is_empty());

        let status = p.status();
        assert_eq!(status.accounts_total, 1);
        assert_eq!(status.leased, 1);
        assert_eq!(status.available, 0);
    }

    #[test]
    fn account_leased_to_at_most_one_bot() {
        let config = CharacterConfig::default();
        let p = AccountPool::new(config, false);
        p.add_config_accounts(vec![("rex".into(), "pw".into(), "A".into())]);

        let first = p.acquire("bot-1").unwrap();
        assert_eq!(first.account.username, "rex");

        let err = p.acquire("bot-2").unwrap_err();
        assert!(matches!(err, BotError::AccountUnavailable(_)));
    }

    #[test]
    fn release_starts_cooldown() {
        let config = CharacterConfig::default();
        let p = AccountPool::new(config, false);
        p.add_config_accounts(vec![("rex".into(), "pw".into(), "A".into())]);

        p.acquire("bot-1").unwrap();
        p.release("bot-1", ReleaseOutcome::Disconnected);

        let status = p.status();
        assert_eq!(status.leased, 0);
        assert_eq!(status.cooldown, 1);
        assert_eq!(status.available, 0);

        // Still cooling down: acquire fails.
        assert!(p.acquire("bot-2").is_err());
    }

    #[test]
    fn identity_stable_across_leases() {
        let p = pool();
        let first = p.acquire("bot-1").unwrap();
        let name = first.identity.name.clone();
        p.release("bot-1", ReleaseOutcome::Completed);

        // Force past cooldown by generating a zero-length one.
        {
            let mut accounts = p.accounts.lock();
            accounts[0].cooldown_until = None;
        }
        let second = p.acquire("bot-2").unwrap();
        assert_eq!(second.identity.name, name);
        assert_eq!(second.account.use_count, 2);
    }

    #[test]
    fn describe_never_exposes_passwords() {
        let p = pool();
        p.acquire("bot-1").unwrap();
        let description = serde_json::to_string(&p.describe()).unwrap();
        assert!(!description.contains("password"));
    }

    #[test]
    fn character_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = AccountPool::records_path(&dir.path().to_string_lossy(), "tw2002");

        let p = pool();
        let first = p.acquire("bot-1").unwrap();
        p.save_records(&path).unwrap();

        let fresh = AccountPool::new(CharacterConfig::default(), false);
        fresh.load_records(&path);
        let leased = fresh.acquire("bot-2").unwrap();
        // Same credentials and identity survive the reload.
        assert_eq!(leased.account.username, first.account.username);
        assert_eq!(leased.account.password, first.account.password);
        assert_eq!(leased.identity.name, first.identity.name);
        assert_eq!(leased.account.source, AccountSource::Persisted);
    }

    #[test]
    fn persisted_accounts_reset_leases() {
        let p = pool();
        let leaked = Account {
            account_id: "a1".into(),
            username: "old".into(),
            password: "pw".into(),
            game_letter: "B".into(),
            source: AccountSource::Generated,
            use_count: 3,
            last_used_at: None,
            lease: Some(Lease {
                bot_id: "dead-bot".into(),
                leased_at: Utc::now().to_rfc3339(),
                expires_at: Utc::now().to_rfc3339(),
            }),
            identity: None,
            cooldown_until: None,
        };
        p.add_persisted_accounts(vec![leaked]);

        let leased = p.acquire("bot-9").unwrap();
        assert_eq!(leased.account.username, "old");
        assert_eq!(leased.account.source, AccountSource::Persisted);
    }
}
