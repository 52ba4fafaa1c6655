//! The verification session state machine.
//!
//! One in-memory session per user, across all guilds:
//!
//! ```text
//! (none) -> AwaitingEmail -> AwaitingOtp -> (none)
//! ```
//!
//! Absence from the map is the idle/done state. Every path out of a
//! phase (success, failure, timeout) removes the entry and sends the
//! user exactly one DM. Removal of the map entry is the linearization
//! point between a reply and its timer: whichever removes the entry
//! first owns the terminal notification, the other observes absence and
//! no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poise::serenity_prelude::{GuildId, UserId};
use rand::Rng;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BotError, Result};
use crate::gateway::{log_role_hierarchy_report, BotCapabilities, SharedGateway};
use crate::mail::MailSender;
use crate::store::{SharedStore, VerificationFilter, VerificationRecord};

/// How long the user has to reply with an email address.
pub const EMAIL_REPLY_WINDOW: Duration = Duration::from_secs(60);

/// How long the user has to reply with the mailed code.
pub const OTP_REPLY_WINDOW: Duration = Duration::from_secs(600);

/// Cadence of the defensive session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Hard bound on any single store/mail/gateway call inside the flow.
const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

const EMAIL_PROMPT: &str = "📧 Please provide your email address for verification.";
const OTP_SENT_MESSAGE: &str =
    "✅ Verification code sent! Please check your email and reply with the 6-digit code.";
const SUCCESS_MESSAGE: &str =
    "🎉 Your email has been successfully verified! You now have access to all channels.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingEmail,
    AwaitingOtp,
}

/// One user's in-flight verification attempt. Not persisted; lost on
/// restart by design.
#[derive(Debug)]
struct VerificationSession {
    guild_id: GuildId,
    phase: SessionPhase,
    started_at: Instant,
    /// Set once the OTP is issued; the sweeper reaps past this.
    expires_at: Option<Instant>,
    /// Identifies which session a timer armed, so a stale timer can
    /// never remove a successor under the same user.
    generation: u64,
    /// Exactly one live timer per session; cancelled on claim.
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    gateway: SharedGateway,
    store: SharedStore,
    mail: Arc<dyn MailSender>,
    sessions: DashMap<UserId, VerificationSession>,
    next_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(gateway: SharedGateway, store: SharedStore, mail: Arc<dyn MailSender>) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                gateway,
                store,
                mail,
                sessions: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start a verification for `user_id` out of `guild_id`.
    ///
    /// Precondition failures (active session, missing bot capabilities,
    /// already verified) notify the user over DM and leave no session
    /// behind. `DmUnreachable` is the one error the caller must surface
    /// in-channel, since the user cannot be reached over DM at all.
    pub async fn begin_verification(&self, user_id: UserId, guild_id: GuildId) -> Result<()> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let reserved = match self.inner.sessions.entry(user_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(VerificationSession {
                    guild_id,
                    phase: SessionPhase::AwaitingEmail,
                    started_at: Instant::now(),
                    expires_at: None,
                    generation,
                    cancel: token.clone(),
                });
                true
            }
        };

        if !reserved {
            let err = BotError::SessionAlreadyActive {
                user_id: user_id.to_string(),
            };
            self.notify(user_id, &err.user_message()).await;
            return Err(err);
        }
        debug!("Started verification session for user {}", user_id);

        // Capability precheck; a failed query counts as no capability.
        let caps = match self
            .bounded("capabilities", self.inner.gateway.capabilities(guild_id))
            .await
        {
            Ok(caps) => caps,
            Err(e) => {
                warn!("Capability check failed for guild {}: {}", guild_id, e);
                BotCapabilities {
                    manage_roles: false,
                    view_channel: false,
                }
            }
        };
        if !caps.allows_verification() {
            if let Ok(report) = self.inner.gateway.role_hierarchy_report(guild_id).await {
                log_role_hierarchy_report(&report);
            }
            self.release(user_id, generation);
            return self
                .fail(
                    user_id,
                    BotError::InsufficientPermissions {
                        guild_id: guild_id.to_string(),
                    },
                )
                .await;
        }

        let already_verified = self
            .bounded(
                "find_verification",
                self.inner.store.find_verification(
                    VerificationFilter::default()
                        .user(&user_id.to_string())
                        .guild(&guild_id.to_string())
                        .verified(true),
                ),
            )
            .await;
        match already_verified {
            Ok(Some(_)) => {
                self.release(user_id, generation);
                return self
                    .fail(
                        user_id,
                        BotError::AlreadyVerified {
                            user_id: user_id.to_string(),
                            guild_id: guild_id.to_string(),
                        },
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                self.release(user_id, generation);
                return self.fail(user_id, e).await;
            }
        }

        // Prompt for the email; closed DMs abort before any wait starts.
        if let Err(e) = self
            .inner
            .gateway
            .send_direct_message(user_id, EMAIL_PROMPT)
            .await
        {
            self.release(user_id, generation);
            return Err(e);
        }

        self.arm_reply_timer(user_id, generation, token, EMAIL_REPLY_WINDOW);
        Ok(())
    }

    /// Feed an inbound DM into the user's session, if any. Stray DMs
    /// from users with no session are ignored.
    pub async fn handle_direct_message(&self, user_id: UserId, content: &str) -> Result<()> {
        // Claim by removal; a racing timer or sweeper that lost sees
        // absence and no-ops.
        let Some((_, session)) = self.inner.sessions.remove(&user_id) else {
            debug!("Ignoring DM from user {} with no open session", user_id);
            return Ok(());
        };
        session.cancel.cancel();

        match session.phase {
            SessionPhase::AwaitingEmail => {
                self.handle_email_reply(user_id, &session, content.trim())
                    .await
            }
            SessionPhase::AwaitingOtp => self.handle_otp_reply(user_id, content.trim()).await,
        }
    }

    async fn handle_email_reply(
        &self,
        user_id: UserId,
        session: &VerificationSession,
        email: &str,
    ) -> Result<()> {
        let guild_id = session.guild_id;
        let user_key = user_id.to_string();
        let guild_key = guild_id.to_string();

        let config = match self
            .bounded(
                "find_guild_config",
                self.inner.store.find_guild_config(&guild_key),
            )
            .await
        {
            Ok(config) => config,
            Err(e) => return self.fail(user_id, e).await,
        };
        let allowed = config.map(|c| c.domains).unwrap_or_default();

        // Suffix after the last '@'; "user" and "user@" fall through to
        // the same rejection as a domain off the allowlist.
        let domain_ok = email_domain(email)
            .map(|domain| allowed.iter().any(|d| d == domain))
            .unwrap_or(false);
        if !domain_ok {
            return self
                .fail(user_id, BotError::DomainNotAllowed { allowed })
                .await;
        }

        // At most one live unverified record per (user, guild).
        if let Err(e) = self
            .bounded(
                "delete_verifications",
                self.inner.store.delete_verifications(
                    VerificationFilter::default()
                        .user(&user_key)
                        .guild(&guild_key)
                        .verified(false),
                ),
            )
            .await
        {
            return self.fail(user_id, e).await;
        }

        let code = generate_otp();
        let record = VerificationRecord::new(&user_key, &guild_key, email, &code);
        if let Err(e) = self
            .bounded(
                "upsert_verification",
                self.inner.store.upsert_verification(record),
            )
            .await
        {
            return self.fail(user_id, e).await;
        }

        // Single delivery attempt; a failed send leaves the record for
        // the store TTL to reap.
        if let Err(e) = self
            .bounded("send_mail", self.inner.mail.send(email, &code))
            .await
        {
            warn!("Verification email to {} failed: {}", email, e);
            return self.fail(user_id, BotError::EmailDeliveryFailed).await;
        }

        // Re-arm as the OTP wait.
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let next = VerificationSession {
            guild_id,
            phase: SessionPhase::AwaitingOtp,
            started_at: session.started_at,
            expires_at: Some(Instant::now() + OTP_REPLY_WINDOW),
            generation,
            cancel: token.clone(),
        };
        if let Some(previous) = self.inner.sessions.insert(user_id, next) {
            // A concurrent `.verify` slipped into the claim window; the
            // OTP wait supersedes it.
            previous.cancel.cancel();
        }
        self.arm_reply_timer(user_id, generation, token, OTP_REPLY_WINDOW);

        self.notify(user_id, OTP_SENT_MESSAGE).await;
        Ok(())
    }

    async fn handle_otp_reply(&self, user_id: UserId, code: &str) -> Result<()> {
        let record = match self
            .bounded(
                "find_verification",
                self.inner.store.find_verification(
                    VerificationFilter::default()
                        .user(&user_id.to_string())
                        .code(code)
                        .verified(false),
                ),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => return self.fail(user_id, e).await,
        };

        // A miss covers both a wrong code and a record the TTL already
        // reaped; the user gets the same generic answer either way.
        let Some(mut record) = record else {
            return self.fail(user_id, BotError::InvalidCode).await;
        };

        record.verified = true;
        if let Err(e) = self
            .bounded(
                "upsert_verification",
                self.inner.store.upsert_verification(record.clone()),
            )
            .await
        {
            return self.fail(user_id, e).await;
        }

        let role_name = match self
            .bounded(
                "find_guild_config",
                self.inner.store.find_guild_config(&record.guild_id),
            )
            .await
        {
            Ok(Some(config)) => config.role,
            Ok(None) => "Verified".to_string(),
            Err(e) => return self.fail(user_id, e).await,
        };

        let guild_id = match record.guild_id.parse::<u64>() {
            Ok(id) => GuildId::new(id),
            Err(_) => {
                return self
                    .fail(
                        user_id,
                        BotError::Internal {
                            message: format!("malformed guild id '{}' on record", record.guild_id),
                        },
                    )
                    .await;
            }
        };

        info!(
            "Attempting to assign role '{}' to user {}",
            role_name, user_id
        );
        match self
            .bounded(
                "assign_role",
                self.inner.gateway.assign_role(user_id, guild_id, &role_name),
            )
            .await
        {
            Ok(()) => {
                info!("User {} verified in guild {}", user_id, record.guild_id);
                self.notify(user_id, SUCCESS_MESSAGE).await;
                Ok(())
            }
            Err(e) => {
                error!("Role assignment failed for user {}: {}", user_id, e);
                if let Ok(report) = self.inner.gateway.role_hierarchy_report(guild_id).await {
                    log_role_hierarchy_report(&report);
                }
                self.fail(user_id, e).await
            }
        }
    }

    /// Spawn the periodic sweep that reaps sessions whose expiry passed
    /// without their timer firing. Silent: the primary timer owns the
    /// timeout notification.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let swept = manager.sweep_expired();
                if swept > 0 {
                    debug!("Sweeper removed {} expired session(s)", swept);
                }
            }
        })
    }

    /// One sweep pass; returns how many sessions were reaped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(UserId, u64)> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|entry| (*entry.key(), entry.generation))
            .collect();

        let mut swept = 0;
        for (user_id, generation) in expired {
            if let Some((_, session)) = self
                .inner
                .sessions
                .remove_if(&user_id, |_, s| s.generation == generation)
            {
                session.cancel.cancel();
                swept += 1;
            }
        }
        swept
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session_phase(&self, user_id: UserId) -> Option<SessionPhase> {
        self.inner.sessions.get(&user_id).map(|s| s.phase)
    }

    fn arm_reply_timer(
        &self,
        user_id: UserId,
        generation: u64,
        token: CancellationToken,
        window: Duration,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    let claimed = manager
                        .inner
                        .sessions
                        .remove_if(&user_id, |_, s| s.generation == generation);
                    if claimed.is_some() {
                        info!("Verification timed out for user {}", user_id);
                        let err = BotError::ResponseTimeout { seconds: window.as_secs() };
                        manager.notify(user_id, &err.user_message()).await;
                    }
                }
            }
        });
    }

    /// Drop the session slot this flow reserved, if it is still the one
    /// in the map. Generation-guarded so a successor session started by
    /// a fresh `.verify` is never touched.
    fn release(&self, user_id: UserId, generation: u64) {
        if let Some((_, session)) = self
            .inner
            .sessions
            .remove_if(&user_id, |_, s| s.generation == generation)
        {
            session.cancel.cancel();
        }
    }

    /// Send the single user-facing failure DM for a terminated flow.
    /// The caller has already claimed or released the session entry.
    async fn fail(&self, user_id: UserId, err: BotError) -> Result<()> {
        self.notify(user_id, &err.user_message()).await;
        Err(err)
    }

    async fn notify(&self, user_id: UserId, text: &str) {
        if let Err(e) = self.inner.gateway.send_direct_message(user_id, text).await {
            warn!("Failed to DM user {}: {}", user_id, e);
        }
    }

    async fn bounded<T>(
        &self,
        call: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(EXTERNAL_CALL_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("External call '{}' timed out", call);
                Err(BotError::ExternalService {
                    call: call.to_string(),
                    seconds: EXTERNAL_CALL_TIMEOUT.as_secs(),
                })
            }
        }
    }
}

/// Domain suffix after the last `@`; `None` for a missing or empty one.
fn email_domain(email: &str) -> Option<&str> {
    match email.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => Some(domain),
        _ => None,
    }
}

/// Six decimal digits, uniformly drawn, leading zeros preserved.
fn generate_otp() -> String {
    format_otp(rand::rng().random_range(0..1_000_000))
}

fn format_otp(value: u32) -> String {
    format!("{value:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::gateway::{ChatGateway, RoleHierarchyReport};
    use crate::store::{GuildConfig, MemoryStore, VerificationStore};

    const USER: UserId = UserId::new(7);
    const GUILD: GuildId = GuildId::new(9);

    struct MockGateway {
        caps: BotCapabilities,
        assign_fails: AtomicBool,
        dms: Mutex<Vec<String>>,
        assigned: Mutex<Vec<(UserId, GuildId, String)>>,
        reports_requested: AtomicUsize,
    }

    impl MockGateway {
        fn new(manage_roles: bool, view_channel: bool) -> Arc<Self> {
            Arc::new(Self {
                caps: BotCapabilities {
                    manage_roles,
                    view_channel,
                },
                assign_fails: AtomicBool::new(false),
                dms: Mutex::new(Vec::new()),
                assigned: Mutex::new(Vec::new()),
                reports_requested: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatGateway for MockGateway {
        async fn send_direct_message(&self, _user_id: UserId, text: &str) -> Result<()> {
            self.dms.lock().await.push(text.to_string());
            Ok(())
        }

        async fn assign_role(
            &self,
            user_id: UserId,
            guild_id: GuildId,
            role_name: &str,
        ) -> Result<()> {
            if self.assign_fails.load(Ordering::Relaxed) {
                return Err(BotError::RoleAssignmentFailed {
                    role: role_name.to_string(),
                    guild_id: guild_id.to_string(),
                    reason: "role position too high".to_string(),
                });
            }
            self.assigned
                .lock()
                .await
                .push((user_id, guild_id, role_name.to_string()));
            Ok(())
        }

        async fn capabilities(&self, _guild_id: GuildId) -> Result<BotCapabilities> {
            Ok(self.caps)
        }

        async fn role_hierarchy_report(&self, guild_id: GuildId) -> Result<RoleHierarchyReport> {
            self.reports_requested.fetch_add(1, Ordering::Relaxed);
            Ok(RoleHierarchyReport {
                guild_id,
                bot_role: "Bot".to_string(),
                bot_position: 5,
                roles: Vec::new(),
            })
        }
    }

    struct MockMail {
        fail: AtomicBool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MockMail {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailSender for MockMail {
        async fn send(&self, email: &str, code: &str) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BotError::Mail {
                    message: "relay unavailable".to_string(),
                });
            }
            self.sent
                .lock()
                .await
                .push((email.to_string(), code.to_string()));
            Ok(())
        }
    }

    struct Harness {
        manager: SessionManager,
        gateway: Arc<MockGateway>,
        store: Arc<MemoryStore>,
        mail: Arc<MockMail>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_gateway(MockGateway::new(true, true))
        }

        fn with_gateway(gateway: Arc<MockGateway>) -> Self {
            let store = Arc::new(MemoryStore::new());
            let mail = MockMail::new();
            let manager = SessionManager::new(gateway.clone(), store.clone(), mail.clone());
            Self {
                manager,
                gateway,
                store,
                mail,
            }
        }

        async fn seed_guild(&self, domains: &[&str]) {
            let mut config = GuildConfig::new(&GUILD.to_string());
            for domain in domains {
                config.add_domain(domain);
            }
            self.store.upsert_guild_config(config).await.unwrap();
        }

        async fn dm_count(&self) -> usize {
            self.gateway.dms.lock().await.len()
        }

        async fn last_dm(&self) -> String {
            self.gateway.dms.lock().await.last().cloned().unwrap()
        }

        async fn mailed_code(&self) -> String {
            self.mail.sent.lock().await.first().cloned().unwrap().1
        }
    }

    /// Let spawned timer tasks run after a paused-clock advance.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn happy_path_verifies_and_grants_role() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        assert_eq!(h.manager.session_phase(USER), Some(SessionPhase::AwaitingEmail));
        assert_eq!(h.last_dm().await, EMAIL_PROMPT);

        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();
        assert_eq!(h.manager.session_phase(USER), Some(SessionPhase::AwaitingOtp));
        assert_eq!(h.last_dm().await, OTP_SENT_MESSAGE);

        let code = h.mailed_code().await;
        assert_eq!(code.len(), 6);
        let stored = h
            .store
            .find_verification(VerificationFilter::default().user(&USER.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.verified);
        assert_eq!(stored.code, code);

        h.manager.handle_direct_message(USER, &code).await.unwrap();
        assert_eq!(h.manager.active_sessions(), 0);
        assert_eq!(h.last_dm().await, SUCCESS_MESSAGE);

        let verified = h
            .store
            .find_verification(VerificationFilter::default().user(&USER.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert!(verified.verified);

        let assigned = h.gateway.assigned.lock().await;
        assert_eq!(assigned.as_slice(), &[(USER, GUILD, "Verified".to_string())]);
    }

    #[tokio::test]
    async fn second_begin_is_rejected_without_touching_the_first() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        let err = h.manager.begin_verification(USER, GUILD).await.unwrap_err();
        assert!(matches!(err, BotError::SessionAlreadyActive { .. }));

        assert_eq!(h.manager.active_sessions(), 1);
        assert_eq!(h.manager.session_phase(USER), Some(SessionPhase::AwaitingEmail));
        assert!(h.last_dm().await.contains("already have an active"));
    }

    #[tokio::test]
    async fn missing_capability_rejects_before_any_wait() {
        let h = Harness::with_gateway(MockGateway::new(false, true));
        h.seed_guild(&["csi.edu"]).await;

        let err = h.manager.begin_verification(USER, GUILD).await.unwrap_err();
        assert!(matches!(err, BotError::InsufficientPermissions { .. }));
        assert_eq!(h.manager.active_sessions(), 0);
        assert_eq!(h.store.record_count().await, 0);
        // Operator diagnostics were gathered for the log.
        assert!(h.gateway.reports_requested.load(Ordering::Relaxed) >= 1);
        assert!(h.last_dm().await.contains("missing required permissions"));
    }

    #[tokio::test]
    async fn already_verified_user_is_turned_away() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        let mut record =
            VerificationRecord::new(&USER.to_string(), &GUILD.to_string(), "a@csi.edu", "111111");
        record.verified = true;
        h.store.upsert_verification(record).await.unwrap();

        let err = h.manager.begin_verification(USER, GUILD).await.unwrap_err();
        assert!(matches!(err, BotError::AlreadyVerified { .. }));
        assert_eq!(h.manager.active_sessions(), 0);
        assert!(h.last_dm().await.contains("already verified"));
    }

    #[tokio::test]
    async fn disallowed_domain_terminates_without_a_record() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        let err = h
            .manager
            .handle_direct_message(USER, "a@other.com")
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::DomainNotAllowed { .. }));

        assert_eq!(h.manager.active_sessions(), 0);
        assert_eq!(h.store.record_count().await, 0);
        assert!(h.last_dm().await.contains("csi.edu"));
    }

    #[tokio::test]
    async fn unconfigured_guild_reports_no_domains() {
        let h = Harness::new();

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        let err = h
            .manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::DomainNotAllowed { .. }));
        assert!(h.last_dm().await.contains("None configured"));
    }

    #[tokio::test]
    async fn malformed_addresses_are_rejected_without_panicking() {
        for address in ["user", "user@", "@", ""] {
            let h = Harness::new();
            h.seed_guild(&["csi.edu"]).await;

            h.manager.begin_verification(USER, GUILD).await.unwrap();
            let err = h
                .manager
                .handle_direct_message(USER, address)
                .await
                .unwrap_err();
            assert!(matches!(err, BotError::DomainNotAllowed { .. }));
            assert_eq!(h.manager.active_sessions(), 0);
        }
    }

    #[tokio::test]
    async fn mail_failure_terminates_but_leaves_the_record_to_the_ttl() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;
        h.mail.fail.store(true, Ordering::Relaxed);

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        let err = h
            .manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::EmailDeliveryFailed));

        assert_eq!(h.manager.active_sessions(), 0);
        assert!(h.last_dm().await.contains("Failed to send"));
        // Record was written before the send attempt; TTL reaps it later.
        assert_eq!(h.store.record_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn email_wait_times_out_after_sixty_seconds() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        settle().await;
        tokio::time::advance(EMAIL_REPLY_WINDOW + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(h.manager.active_sessions(), 0);
        assert!(h.last_dm().await.contains("took too long"));
    }

    #[tokio::test(start_paused = true)]
    async fn otp_wait_times_out_and_the_record_outlives_the_session() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();

        settle().await;
        tokio::time::advance(OTP_REPLY_WINDOW + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(h.manager.active_sessions(), 0);
        assert!(h.last_dm().await.contains("timed out"));
        // The record stays until the store's own TTL deletion.
        assert_eq!(h.store.record_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reply_cancels_the_timer_for_good() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();
        let code = h.mailed_code().await;
        h.manager.handle_direct_message(USER, &code).await.unwrap();
        let dms_after_success = h.dm_count().await;

        tokio::time::advance(OTP_REPLY_WINDOW + Duration::from_secs(5)).await;
        settle().await;

        // No late timeout DM: the terminal notification was sent once.
        assert_eq!(h.dm_count().await, dms_after_success);
        assert_eq!(h.manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn wrong_code_gets_the_generic_failure() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();

        let code = h.mailed_code().await;
        let wrong = if code == "000000" { "000001" } else { "000000" };
        let err = h
            .manager
            .handle_direct_message(USER, wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::InvalidCode));

        assert_eq!(h.manager.active_sessions(), 0);
        assert_eq!(h.last_dm().await, BotError::InvalidCode.user_message());

        let record = h
            .store
            .find_verification(VerificationFilter::default().user(&USER.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.verified);
    }

    #[tokio::test]
    async fn role_failure_sends_the_same_generic_message_as_a_wrong_code() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;
        h.gateway.assign_fails.store(true, Ordering::Relaxed);

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();
        let code = h.mailed_code().await;
        let err = h
            .manager
            .handle_direct_message(USER, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::RoleAssignmentFailed { .. }));

        assert_eq!(h.last_dm().await, BotError::InvalidCode.user_message());
        assert!(h.gateway.reports_requested.load(Ordering::Relaxed) >= 1);
        assert_eq!(h.manager.active_sessions(), 0);

        // The commit happened before the grant attempt.
        let record = h
            .store
            .find_verification(VerificationFilter::default().user(&USER.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert!(record.verified);
    }

    #[tokio::test]
    async fn configured_role_name_is_used_for_the_grant() {
        let h = Harness::new();
        let mut config = GuildConfig::new(&GUILD.to_string());
        config.add_domain("csi.edu");
        config.role = "Member".to_string();
        h.store.upsert_guild_config(config).await.unwrap();

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();
        let code = h.mailed_code().await;
        h.manager.handle_direct_message(USER, &code).await.unwrap();

        let assigned = h.gateway.assigned.lock().await;
        assert_eq!(assigned.first().map(|(_, _, r)| r.as_str()), Some("Member"));
    }

    #[tokio::test]
    async fn stray_dm_without_a_session_is_ignored() {
        let h = Harness::new();
        h.manager.handle_direct_message(USER, "hello").await.unwrap();
        assert_eq!(h.dm_count().await, 0);
    }

    #[tokio::test]
    async fn a_fresh_email_reply_replaces_the_old_unverified_record() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        // First attempt issues a code, then the user lets it rot and
        // starts over.
        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();
        let first_code = h.mailed_code().await;

        // Claim the session away (simulates the timeout having fired).
        h.manager.inner.sessions.remove(&USER);
        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();

        assert_eq!(h.store.record_count().await, 1);
        let record = h
            .store
            .find_verification(VerificationFilter::default().user(&USER.to_string()))
            .await
            .unwrap()
            .unwrap();
        let second_code = h.mail.sent.lock().await.last().cloned().unwrap().1;
        assert_eq!(record.code, second_code);
        // Overwhelmingly likely distinct; equality would only mean the
        // RNG repeated itself.
        let _ = first_code;
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reaps_a_session_whose_timer_was_lost_without_a_dm() {
        let h = Harness::new();
        h.seed_guild(&["csi.edu"]).await;

        h.manager.begin_verification(USER, GUILD).await.unwrap();
        h.manager
            .handle_direct_message(USER, "a@csi.edu")
            .await
            .unwrap();

        // Simulate a leaked timer: cancel it behind the manager's back.
        h.manager
            .inner
            .sessions
            .get(&USER)
            .unwrap()
            .cancel
            .cancel();

        tokio::time::advance(OTP_REPLY_WINDOW + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.manager.active_sessions(), 1);

        let dms_before = h.dm_count().await;
        assert_eq!(h.manager.sweep_expired(), 1);
        assert_eq!(h.manager.active_sessions(), 0);
        assert_eq!(h.dm_count().await, dms_before);
    }

    #[test]
    fn otp_is_fixed_width_with_leading_zeros() {
        assert_eq!(format_otp(42), "000042");
        assert_eq!(format_otp(0), "000000");
        assert_eq!(format_otp(999_999), "999999");

        for _ in 0..32 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn email_domain_takes_the_suffix_after_the_last_at() {
        assert_eq!(email_domain("a@csi.edu"), Some("csi.edu"));
        assert_eq!(email_domain("a@b@c.edu"), Some("c.edu"));
        assert_eq!(email_domain("user"), None);
        assert_eq!(email_domain("user@"), None);
        assert_eq!(email_domain(""), None);
        // Suffix extraction is case-preserving; no folding happens here.
        assert_eq!(email_domain("a@CSI.edu"), Some("CSI.edu"));
    }
}
